//! Cross-process subscription core of a YANG datastore: shared-memory
//! event segments guarded by a process-shared timeout lock, the per-process
//! subscription store, event pipes and notification dispatch.

pub mod config;
pub mod core;
pub mod data;
pub mod errors;
pub mod evpipe;
pub mod lock;
pub mod notif;
pub mod reader;
pub mod registry;
pub mod subs;
pub mod writer;

pub use crate::config::SrConfig;
pub use crate::errors::{ErrorKind, Result, SrError};
pub use crate::subs::SubscriptionContext;

#[cfg(test)]
mod tests;
