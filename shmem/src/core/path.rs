//! Names of the subscription segments and the xpath hash embedded in them.
//!
//! Every process attached to the datastore derives these names on its own,
//! so the formats and the hash are part of the cross-process contract.

use std::fmt;
use std::path::PathBuf;

use serde_derive::{Deserialize, Serialize};

use crate::config::SrConfig;
use crate::errors::{Result, SrError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Datastore {
    Running,
    Startup,
    Operational,
}

impl Datastore {
    pub fn as_str(&self) -> &'static str {
        match self {
            Datastore::Running => "running",
            Datastore::Startup => "startup",
            Datastore::Operational => "operational",
        }
    }

    #[inline]
    pub fn suffix(&self) -> SegmentSuffix {
        match self {
            Datastore::Running => SegmentSuffix::Running,
            Datastore::Startup => SegmentSuffix::Startup,
            Datastore::Operational => SegmentSuffix::Operational,
        }
    }
}

impl fmt::Display for Datastore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Second component of a segment name, telling what kind of traffic the
/// segment carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SegmentSuffix {
    Running,
    Startup,
    Operational,
    State,
    Rpc,
    Notif,
}

impl SegmentSuffix {
    pub fn as_str(&self) -> &'static str {
        match self {
            SegmentSuffix::Running => "running",
            SegmentSuffix::Startup => "startup",
            SegmentSuffix::Operational => "operational",
            SegmentSuffix::State => "state",
            SegmentSuffix::Rpc => "rpc",
            SegmentSuffix::Notif => "notif",
        }
    }
}

/// Bob Jenkins' one-at-a-time hash. Must stay bit-exact: the value is part
/// of segment names other processes compute independently.
pub fn str_hash(s: &str) -> u32 {
    let mut hash: u32 = 0;
    for &b in s.as_bytes() {
        hash = hash.wrapping_add(b as u32);
        hash = hash.wrapping_add(hash << 10);
        hash ^= hash >> 6;
    }
    hash = hash.wrapping_add(hash << 3);
    hash ^= hash >> 11;
    hash = hash.wrapping_add(hash << 15);
    hash
}

/// Segment name relative to the shm directory, as kept in the shared
/// registry: `sr_<module>.<suffix>[.<hash>]`.
pub fn sub_shm_name(module: &str, suffix: SegmentSuffix, hash: Option<u32>) -> String {
    match hash {
        Some(h) => format!("sr_{}.{}.{:08x}", module, suffix.as_str(), h),
        None => format!("sr_{}.{}", module, suffix.as_str()),
    }
}

pub fn sub_shm_path(cfg: &SrConfig, module: &str, suffix: SegmentSuffix, hash: Option<u32>) -> PathBuf {
    cfg.shm_dir.join(sub_shm_name(module, suffix, hash))
}

/// Module prefix of the first node of `xpath`, e.g. `ietf-interfaces` for
/// `/ietf-interfaces:interfaces/interface`.
pub fn first_ns(xpath: &str) -> Option<&str> {
    let rest = xpath.strip_prefix('/')?;
    let end = rest
        .char_indices()
        .find(|&(_, c)| !(c.is_ascii_alphanumeric() || c == '_' || c == '-' || c == '.'))
        .map(|(i, _)| i)?;
    if end == 0 || !rest[end..].starts_with(':') {
        return None;
    }
    Some(&rest[..end])
}

/// First node of `xpath` including its predicates, `None` on an
/// unterminated quote.
pub fn first_node(xpath: &str) -> Option<&str> {
    let bytes = xpath.as_bytes();
    if bytes.first() != Some(&b'/') {
        return None;
    }
    let mut quote = None;
    let mut end = bytes.len();
    for (i, &c) in bytes.iter().enumerate().skip(1) {
        match quote {
            Some(q) if c == q => quote = None,
            Some(_) => {}
            None if c == b'\'' || c == b'"' => quote = Some(c),
            None if c == b'/' => {
                end = i;
                break;
            }
            None => {}
        }
    }
    if quote.is_some() {
        return None;
    }
    Some(&xpath[..end])
}

pub fn validate_xpath(xpath: &str) -> Result<()> {
    match first_node(xpath) {
        Some(node) if node.len() > 1 => Ok(()),
        _ => Err(SrError::Validation(format!("Invalid xpath \"{}\".", xpath))),
    }
}
