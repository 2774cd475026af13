use std::fmt;
use std::mem;
use std::path::Path;

use log::warn;

use crate::core::{ShmCast, ShmSegment};
use crate::errors::{Result, SrError};
use crate::lock::TimeoutRwLock;

/// Event currently stored in a subscription segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum SubEvent {
    None = 0,
    Update,
    Change,
    Done,
    Abort,
    Dp,
    Rpc,
    Notif,
}

/// Change-subscription events as handed to module-change callbacks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeEvent {
    Update,
    Change,
    Done,
    Abort,
}

impl SubEvent {
    pub fn from_raw(raw: u32) -> Result<SubEvent> {
        Ok(match raw {
            0 => SubEvent::None,
            1 => SubEvent::Update,
            2 => SubEvent::Change,
            3 => SubEvent::Done,
            4 => SubEvent::Abort,
            5 => SubEvent::Dp,
            6 => SubEvent::Rpc,
            7 => SubEvent::Notif,
            _ => return Err(SrError::Internal(format!("Unknown event {} in segment header.", raw))),
        })
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SubEvent::None => "none",
            SubEvent::Update => "update",
            SubEvent::Change => "change",
            SubEvent::Done => "done",
            SubEvent::Abort => "abort",
            SubEvent::Dp => "data-provide",
            SubEvent::Rpc => "rpc",
            SubEvent::Notif => "notif",
        }
    }

    pub fn to_api(&self) -> Option<ChangeEvent> {
        match self {
            SubEvent::Update => Some(ChangeEvent::Update),
            SubEvent::Change => Some(ChangeEvent::Change),
            SubEvent::Done => Some(ChangeEvent::Done),
            SubEvent::Abort => Some(ChangeEvent::Abort),
            _ => None,
        }
    }
}

impl fmt::Display for SubEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Header of a single-subscriber segment (data-provide, RPC, notification).
#[repr(C)]
pub struct SubShm {
    pub lock: TimeoutRwLock,
    pub event: u32,
    pub request_id: u32,
    pub sid: u32,
    pub nc_sid: u32,
    pub payload_len: u32,
}

/// Header of a configuration segment, shared by every priority level of
/// the module's change subscribers.
#[repr(C)]
pub struct MultiSubShm {
    pub base: SubShm,
    pub priority: u32,
    pub subscriber_count: u32,
}

unsafe impl ShmCast for SubShm {}
unsafe impl ShmCast for MultiSubShm {}

/// Which header a segment starts with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeaderKind {
    Single,
    Multi,
}

impl HeaderKind {
    #[inline]
    pub fn size(&self) -> usize {
        match self {
            HeaderKind::Single => mem::size_of::<SubShm>(),
            HeaderKind::Multi => mem::size_of::<MultiSubShm>(),
        }
    }
}

/// Offset of the lock inside either header.
pub const LOCK_OFFSET: usize = 0;

/// Opens the subscription segment at `path`, sized for `kind`, and sets up
/// its header when this call created it. The flag tells whether it did.
pub fn open_sub_shm(path: &Path, kind: HeaderKind, perm: u32) -> Result<(ShmSegment, bool)> {
    let (mut shm, created) = ShmSegment::open_or_create(path, kind.size(), perm)?;
    if created {
        if let Err(e) = init_header(&mut shm, kind) {
            shm.clear();
            if let Err(unlink_err) = ShmSegment::unlink(path) {
                warn!("Failed to unlink SHM \"{}\" ({}).", path.display(), unlink_err);
            }
            return Err(e);
        }
    }
    Ok((shm, created))
}

fn init_header(shm: &mut ShmSegment, kind: HeaderKind) -> Result<()> {
    shm.bytes_mut(0, kind.size())?.fill(0);
    let header = shm.at::<SubShm>(0)?;
    unsafe { header.lock.init(true) }
}
