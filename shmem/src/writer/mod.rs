use std::time::Duration;

use crate::config::SrConfig;
use crate::core::layout::{HeaderKind, MultiSubShm, SubEvent, SubShm, LOCK_OFFSET};
use crate::core::ShmSegment;
use crate::errors::{Result, SrError};
use crate::lock::LockMode;

/// What the publisher stores next to the payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EventRecord {
    pub event: SubEvent,
    pub sid: u32,
    pub nc_sid: u32,
    /// Only kept by configuration segments.
    pub priority: u32,
}

impl EventRecord {
    pub fn new(event: SubEvent, sid: u32) -> EventRecord {
        EventRecord {
            event,
            sid,
            nc_sid: 0,
            priority: 0,
        }
    }
}

/// Publisher side of a subscription segment: stores one event at a time
/// under the segment write lock.
pub struct EventWriter<'a> {
    shm: &'a mut ShmSegment,
    kind: HeaderKind,
    read_timeout: Duration,
}

impl<'a> EventWriter<'a> {
    pub fn new(shm: &'a mut ShmSegment, kind: HeaderKind, cfg: &SrConfig) -> EventWriter<'a> {
        EventWriter {
            shm,
            kind,
            read_timeout: cfg.rwlock_read_timeout(),
        }
    }

    /// Replaces the stored event, growing the segment when the payload does
    /// not fit, and returns the new request id.
    pub fn write(&mut self, record: &EventRecord, payload: &[u8], timeout: Duration) -> Result<u32> {
        let header_size = self.kind.size();
        if payload.len() > u32::MAX as usize {
            return Err(SrError::Validation(format!("Event payload of {} bytes is too large.", payload.len())));
        }
        let needed = header_size + payload.len();

        self.shm.remap(None)?;
        let mut guard = self
            .shm
            .rwlock(LOCK_OFFSET, timeout, self.read_timeout, LockMode::Write, "EventWriter::write")?;
        let shm = guard.shm_mut()?;

        // another publisher may have grown it before we got the lock
        shm.remap(None)?;
        if shm.size() < needed {
            shm.remap(Some(needed))?;
        }

        shm.bytes_mut(header_size, payload.len())?.copy_from_slice(payload);
        let header = shm.at_mut::<SubShm>(0)?;
        header.request_id = header.request_id.wrapping_add(1);
        header.event = record.event as u32;
        header.sid = record.sid;
        header.nc_sid = record.nc_sid;
        header.payload_len = payload.len() as u32;
        let request_id = header.request_id;

        if self.kind == HeaderKind::Multi {
            shm.at_mut::<MultiSubShm>(0)?.priority = record.priority;
        }
        Ok(request_id)
    }

    /// Marks the stored event as consumed.
    pub fn clear_event(&mut self, timeout: Duration) -> Result<()> {
        self.shm.remap(None)?;
        let mut guard = self
            .shm
            .rwlock(LOCK_OFFSET, timeout, self.read_timeout, LockMode::Write, "EventWriter::clear_event")?;
        let header = guard.shm_mut()?.at_mut::<SubShm>(0)?;
        header.event = SubEvent::None as u32;
        header.payload_len = 0;
        Ok(())
    }
}
