use std::time::SystemTime;

use crate::core::layout::SubEvent;
use crate::core::path::Datastore;
use crate::data::{DataNode, NodeKind, SrValue};
use crate::errors::{Result, SrError};
use crate::subs::{NotifCallback, PrivateData};

mod filter;

pub use self::filter::NotifFilter;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotifType {
    Realtime,
    Replay,
    ReplayComplete,
    Stop,
}

/// Originator of an event: the datastore session and, when the change came
/// over NETCONF, its session.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionId {
    pub sr: u32,
    pub nc: u32,
    pub user: Option<String>,
}

#[derive(Debug, Default)]
pub struct DsEdit {
    pub edit: Option<DataNode>,
    pub diff: Option<DataNode>,
}

/// Session handed to a callback for the duration of one event.
#[derive(Debug)]
pub struct Session {
    ds: Datastore,
    ev: SubEvent,
    sid: SessionId,
    err_info: Option<SrError>,
    dt: [DsEdit; 2],
}

impl Session {
    pub fn event_session(ds: Datastore, ev: SubEvent, sid: SessionId) -> Session {
        Session {
            ds,
            ev,
            sid,
            err_info: None,
            dt: Default::default(),
        }
    }

    pub fn datastore(&self) -> Datastore {
        self.ds
    }

    pub fn event(&self) -> SubEvent {
        self.ev
    }

    pub fn sid(&self) -> &SessionId {
        &self.sid
    }

    /// Records an error for the originator of the event.
    pub fn set_error(&mut self, err: SrError) {
        self.err_info = Some(err);
    }

    pub fn error(&self) -> Option<&SrError> {
        self.err_info.as_ref()
    }

    /// Edit and diff kept for the running and startup datastores.
    pub fn edit_mut(&mut self, ds: Datastore) -> Option<&mut DsEdit> {
        match ds {
            Datastore::Running => Some(&mut self.dt[0]),
            Datastore::Startup => Some(&mut self.dt[1]),
            Datastore::Operational => None,
        }
    }

    pub fn clear(&mut self) {
        self.err_info = None;
        for dt in self.dt.iter_mut() {
            dt.edit = None;
            dt.diff = None;
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.clear();
    }
}

fn notif_values(notif_op: &DataNode) -> Result<(String, Vec<SrValue>)> {
    let values = notif_op
        .descendants()
        .into_iter()
        .map(|(xpath, node)| SrValue::from_node(node, xpath))
        .collect::<Result<Vec<_>>>()?;
    Ok((notif_op.path(), values))
}

/// Runs one notification callback in a temporary operational session.
///
/// Value callbacks get the notification path and every node below it in
/// document order; the callback is not run when a node fails to convert.
pub fn call_notif_callback(
    cb: &NotifCallback,
    private_data: Option<&PrivateData>,
    notif_type: NotifType,
    notif_op: Option<&DataNode>,
    ts: SystemTime,
    sid: SessionId,
) -> Result<()> {
    if let Some(op) = notif_op {
        if op.kind != NodeKind::Notification {
            return Err(SrError::Internal(format!("Node \"{}\" is not a notification.", op.path())));
        }
    }

    let mut sess = Session::event_session(Datastore::Operational, SubEvent::Notif, sid);
    let res = match cb {
        NotifCallback::Tree(f) => {
            f(&mut sess, notif_type, notif_op, ts, private_data);
            Ok(())
        }
        NotifCallback::Values(f) => match notif_op.map(notif_values).transpose() {
            Ok(Some((path, values))) => {
                f(&mut sess, notif_type, Some(&path), &values, ts, private_data);
                Ok(())
            }
            Ok(None) => {
                f(&mut sess, notif_type, None, &[], ts, private_data);
                Ok(())
            }
            Err(e) => Err(e),
        },
    };
    sess.clear();
    res
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::{LeafType, ValueData};
    use parking_lot::Mutex;
    use std::sync::Arc;

    fn three_nodes() -> DataNode {
        DataNode::notification("m", "n")
            .with_child(DataNode::leaf("m", "a", LeafType::String, "a"))
            .with_child(DataNode::leaf("m", "b", LeafType::Uint8, "3"))
    }

    #[test]
    fn values_callback_gets_descendants() -> Result<()> {
        let seen: Arc<Mutex<Vec<(Option<String>, Vec<SrValue>)>>> = Arc::default();
        let sink = seen.clone();
        let cb = NotifCallback::values(move |sess, ty, path, values, _, _| {
            assert_eq!(sess.datastore(), Datastore::Operational);
            assert_eq!(sess.event(), SubEvent::Notif);
            assert_eq!(ty, NotifType::Realtime);
            sink.lock().push((path.map(str::to_string), values.to_vec()));
        });

        let op = three_nodes();
        call_notif_callback(&cb, None, NotifType::Realtime, Some(&op), SystemTime::now(), SessionId::default())?;

        let seen = seen.lock();
        assert_eq!(seen.len(), 1);
        let (path, values) = &seen[0];
        assert_eq!(path.as_deref(), Some("/m:n"));
        assert_eq!(values.len(), 2);
        assert_eq!(values[0].xpath, "/m:n/a");
        assert_eq!(values[0].data, ValueData::String("a".into()));
        assert_eq!(values[1].data, ValueData::Uint8(3));
        Ok(())
    }

    #[test]
    fn tree_callback_gets_payload_and_private_data() -> Result<()> {
        let hits = Arc::new(Mutex::new(0u32));
        let counter = hits.clone();
        let cb = NotifCallback::tree(move |sess, ty, op, _, pd| {
            assert_eq!(sess.sid().sr, 7);
            assert_eq!(ty, NotifType::ReplayComplete);
            assert!(op.is_none());
            assert_eq!(pd.and_then(|pd| pd.downcast_ref::<&str>()), Some(&"ctx"));
            *counter.lock() += 1;
        });

        let pd: PrivateData = Arc::new("ctx");
        let sid = SessionId {
            sr: 7,
            ..SessionId::default()
        };
        call_notif_callback(&cb, Some(&pd), NotifType::ReplayComplete, None, SystemTime::now(), sid)?;
        assert_eq!(*hits.lock(), 1);
        Ok(())
    }

    #[test]
    fn conversion_failure_skips_callback() {
        let called = Arc::new(Mutex::new(false));
        let flag = called.clone();
        let cb = NotifCallback::values(move |_, _, _, _, _, _| *flag.lock() = true);

        let op = DataNode::notification("m", "n").with_child(DataNode::leaf("m", "d", LeafType::Decimal64, "x"));
        let err = call_notif_callback(&cb, None, NotifType::Realtime, Some(&op), SystemTime::now(), SessionId::default())
            .unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::Validation);
        assert!(!*called.lock());
    }

    #[test]
    fn payload_must_be_a_notification() {
        let cb = NotifCallback::tree(|_, _, _, _, _| {});
        let op = DataNode::container("m", "c");
        assert!(call_notif_callback(&cb, None, NotifType::Realtime, Some(&op), SystemTime::now(), SessionId::default())
            .is_err());
    }

    #[test]
    fn session_clear_drops_edits() {
        let mut sess = Session::event_session(Datastore::Running, SubEvent::Change, SessionId::default());
        sess.set_error(SrError::Internal("x".into()));
        if let Some(dt) = sess.edit_mut(Datastore::Running) {
            dt.edit = Some(DataNode::container("m", "c"));
        }
        sess.clear();
        assert!(sess.error().is_none());
        assert!(sess.edit_mut(Datastore::Running).map_or(false, |dt| dt.edit.is_none()));
        assert!(sess.edit_mut(Datastore::Operational).is_none());
    }
}
