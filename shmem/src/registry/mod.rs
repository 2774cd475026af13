//! Bridge to the datastore-wide subscription table.
//!
//! Publishers find subscribers (and the event pipe to wake) through this
//! table, so every local add/delete is mirrored here.

use std::collections::HashMap;

#[cfg(test)]
use mockall::automock;
use parking_lot::Mutex;

use crate::core::path::{str_hash, sub_shm_name, Datastore, SegmentSuffix};
use crate::errors::{Result, SrError};
use crate::subs::SubOptions;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubKind {
    Conf {
        xpath: Option<String>,
        ds: Datastore,
        priority: u32,
        opts: SubOptions,
    },
    Dp {
        xpath: String,
    },
    Rpc {
        xpath: String,
    },
    Notif,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubDescriptor {
    pub module: String,
    pub kind: SubKind,
    pub evpipe_num: u32,
}

/// Identifies the segment a subscription listens on.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SegmentKey {
    pub module: String,
    pub suffix: SegmentSuffix,
    pub hash: Option<u32>,
}

impl SegmentKey {
    pub fn shm_name(&self) -> String {
        sub_shm_name(&self.module, self.suffix, self.hash)
    }
}

impl SubDescriptor {
    pub fn key(&self) -> SegmentKey {
        let (suffix, hash) = match &self.kind {
            SubKind::Conf { ds, .. } => (ds.suffix(), None),
            SubKind::Dp { xpath } => (SegmentSuffix::State, Some(str_hash(xpath))),
            SubKind::Rpc { xpath } => (SegmentSuffix::Rpc, Some(str_hash(xpath))),
            SubKind::Notif => (SegmentSuffix::Notif, None),
        };
        SegmentKey {
            module: self.module.clone(),
            suffix,
            hash,
        }
    }
}

#[cfg_attr(test, automock)]
pub trait SharedRegistry: Send + Sync {
    fn publish(&self, sub: &SubDescriptor) -> Result<()>;

    /// Removes one matching record. Returns whether it was the last one for
    /// its segment key.
    fn retract(&self, sub: &SubDescriptor) -> Result<bool>;
}

/// Process-local registry.
#[derive(Default)]
pub struct MemRegistry {
    table: Mutex<HashMap<SegmentKey, Vec<SubDescriptor>>>,
}

impl MemRegistry {
    pub fn new() -> MemRegistry {
        MemRegistry::default()
    }

    pub fn subscribers(&self, key: &SegmentKey) -> Vec<SubDescriptor> {
        self.table.lock().get(key).cloned().unwrap_or_default()
    }

    /// Event pipes to wake for traffic on `key`, without duplicates.
    pub fn evpipes(&self, key: &SegmentKey) -> Vec<u32> {
        let mut nums: Vec<u32> = self.subscribers(key).iter().map(|s| s.evpipe_num).collect();
        nums.sort_unstable();
        nums.dedup();
        nums
    }

    pub fn len(&self) -> usize {
        self.table.lock().values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.table.lock().is_empty()
    }
}

impl SharedRegistry for MemRegistry {
    fn publish(&self, sub: &SubDescriptor) -> Result<()> {
        self.table.lock().entry(sub.key()).or_default().push(sub.clone());
        Ok(())
    }

    fn retract(&self, sub: &SubDescriptor) -> Result<bool> {
        let key = sub.key();
        let mut table = self.table.lock();
        let subs = table
            .get_mut(&key)
            .ok_or_else(|| SrError::NotFound(format!("No subscriptions on \"{}\".", key.shm_name())))?;
        let pos = subs
            .iter()
            .position(|s| s == sub)
            .ok_or_else(|| SrError::NotFound(format!("Subscription of \"{}\" is not registered.", sub.module)))?;
        subs.swap_remove(pos);
        if subs.is_empty() {
            table.remove(&key);
            return Ok(true);
        }
        Ok(false)
    }
}
