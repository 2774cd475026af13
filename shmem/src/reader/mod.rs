use std::time::Duration;

use crate::config::SrConfig;
use crate::core::layout::{HeaderKind, MultiSubShm, SubEvent, SubShm, LOCK_OFFSET};
use crate::core::ShmSegment;
use crate::errors::{Result, SrError};
use crate::lock::LockMode;

/// Copy of a subscription segment taken under its read lock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventSnapshot {
    pub event: SubEvent,
    pub request_id: u32,
    pub sid: u32,
    pub nc_sid: u32,
    pub priority: Option<u32>,
    pub subscriber_count: Option<u32>,
    pub payload: Vec<u8>,
}

impl EventSnapshot {
    /// Whether this event still has to be processed by a subscriber that
    /// last saw `last_request_id` in state `last_event`.
    pub fn is_new(&self, last_request_id: u32, last_event: SubEvent) -> bool {
        self.event != SubEvent::None && (self.request_id != last_request_id || self.event != last_event)
    }
}

/// Subscriber side of a subscription segment.
pub struct EventReader<'a> {
    shm: &'a mut ShmSegment,
    kind: HeaderKind,
    read_timeout: Duration,
}

impl<'a> EventReader<'a> {
    pub fn new(shm: &'a mut ShmSegment, kind: HeaderKind, cfg: &SrConfig) -> EventReader<'a> {
        EventReader {
            shm,
            kind,
            read_timeout: cfg.rwlock_read_timeout(),
        }
    }

    pub fn read(&mut self, timeout: Duration) -> Result<EventSnapshot> {
        let header_size = self.kind.size();

        // The publisher may grow the segment between our remap and our lock;
        // one retry covers that, a second short mapping means the header lies.
        for attempt in 0..2 {
            self.shm.remap(None)?;
            let guard = self
                .shm
                .rwlock(LOCK_OFFSET, timeout, self.read_timeout, LockMode::Read, "EventReader::read")?;
            let shm = guard.shm();

            let header = shm.at::<SubShm>(0)?;
            let payload_len = header.payload_len as usize;
            if header_size + payload_len > shm.size() {
                if attempt == 0 {
                    continue;
                }
                return Err(SrError::Internal(format!(
                    "Event payload of {} bytes exceeds the {} mapped bytes.",
                    payload_len,
                    shm.size()
                )));
            }

            let (priority, subscriber_count) = match self.kind {
                HeaderKind::Multi => {
                    let multi = shm.at::<MultiSubShm>(0)?;
                    (Some(multi.priority), Some(multi.subscriber_count))
                }
                HeaderKind::Single => (None, None),
            };
            return Ok(EventSnapshot {
                event: SubEvent::from_raw(header.event)?,
                request_id: header.request_id,
                sid: header.sid,
                nc_sid: header.nc_sid,
                priority,
                subscriber_count,
                payload: shm.bytes(header_size, payload_len)?.to_vec(),
            });
        }
        unreachable!("read retries are bounded")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::layout::open_sub_shm;
    use crate::writer::{EventRecord, EventWriter};
    use tempfile::tempdir;

    #[test]
    fn reads_what_a_second_mapping_wrote() -> Result<()> {
        let dir = tempdir().unwrap();
        let cfg = SrConfig::with_root(dir.path());
        let path = dir.path().join("sr_m.notif");
        let (mut publisher, _) = open_sub_shm(&path, HeaderKind::Single, 0o600)?;
        let (mut subscriber, _) = open_sub_shm(&path, HeaderKind::Single, 0o600)?;

        let request_id = EventWriter::new(&mut publisher, HeaderKind::Single, &cfg).write(
            &EventRecord::new(SubEvent::Notif, 42),
            b"<notif/>",
            Duration::from_secs(1),
        )?;

        let snap = EventReader::new(&mut subscriber, HeaderKind::Single, &cfg).read(Duration::from_secs(1))?;
        assert_eq!(snap.event, SubEvent::Notif);
        assert_eq!(snap.request_id, request_id);
        assert_eq!(snap.sid, 42);
        assert_eq!(snap.payload, b"<notif/>");
        assert_eq!(snap.priority, None);

        assert!(snap.is_new(0, SubEvent::None));
        assert!(!snap.is_new(request_id, SubEvent::Notif));
        Ok(())
    }

    #[test]
    fn corrupt_length_is_reported() -> Result<()> {
        let dir = tempdir().unwrap();
        let cfg = SrConfig::with_root(dir.path());
        let path = dir.path().join("sr_m.rpc.00000002");
        let (mut shm, _) = open_sub_shm(&path, HeaderKind::Single, 0o600)?;
        shm.at_mut::<SubShm>(0)?.payload_len = 1 << 20;

        let err = EventReader::new(&mut shm, HeaderKind::Single, &cfg)
            .read(Duration::from_secs(1))
            .unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::Internal);
        // the read lock was returned
        assert_eq!(shm.at::<SubShm>(0)?.lock.readers(), 0);
        Ok(())
    }
}
