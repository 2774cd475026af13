use std::{
    error::Error,
    sync::{
        atomic::{AtomicUsize, Ordering as AtomicOrdering},
        Arc,
    },
    time::{Duration, SystemTime},
};

use parking_lot::Mutex;
use tempfile::{tempdir, TempDir};

use crate::{
    core::{
        layout::{open_sub_shm, HeaderKind, SubEvent},
        path::Datastore,
    },
    data::{DataNode, LeafType},
    notif::{NotifType, SessionId},
    registry::{MemRegistry, MockSharedRegistry, SharedRegistry, SubKind},
    subs::{DpGetItemsCb, ModuleChangeCb, NotifCallback, PrivateData, RpcCallback, SubOptions},
    writer::{EventRecord, EventWriter},
    ErrorKind, SrConfig, SrError, SubscriptionContext,
};

fn setup(evpipe_num: u32) -> (TempDir, Arc<SrConfig>, Arc<MemRegistry>, SubscriptionContext) {
    let dir = tempdir().expect("tempdir");
    let cfg = Arc::new(SrConfig::with_root(dir.path()));
    let registry = Arc::new(MemRegistry::new());
    let ctx = SubscriptionContext::new(Arc::clone(&cfg), registry.clone() as Arc<dyn SharedRegistry>, evpipe_num);
    (dir, cfg, registry, ctx)
}

fn noop_change() -> ModuleChangeCb {
    ModuleChangeCb::new(|_, _, _, _, _, _| Ok(()))
}

#[test]
fn test_conf_group_lifecycle() -> Result<(), Box<dyn Error>> {
    let (dir, _cfg, registry, ctx) = setup(1);
    let file = dir.path().join("sr_ietf-interfaces.running");
    let cb = noop_change();

    ctx.conf_add(
        "ietf-interfaces",
        Some("/ietf-interfaces:interfaces"),
        Datastore::Running,
        &cb,
        None,
        0,
        SubOptions::DEFAULT,
    )?;
    assert_eq!(ctx.conf_group_count(), 1);
    assert_eq!(ctx.conf_sub_count("ietf-interfaces", Datastore::Running), 1);
    assert!(file.exists());
    let size = file.metadata()?.len();

    ctx.conf_add(
        "ietf-interfaces",
        Some("/ietf-interfaces:interfaces/interface"),
        Datastore::Running,
        &cb,
        None,
        0,
        SubOptions::DEFAULT,
    )?;
    assert_eq!(ctx.conf_group_count(), 1);
    assert_eq!(ctx.conf_sub_count("ietf-interfaces", Datastore::Running), 2);
    assert_eq!(file.metadata()?.len(), size);
    assert_eq!(registry.len(), 2);

    ctx.conf_del(
        "ietf-interfaces",
        Some("/ietf-interfaces:interfaces"),
        Datastore::Running,
        &cb,
        &None,
        0,
        SubOptions::DEFAULT,
    )?;
    assert_eq!(ctx.conf_group_count(), 1);
    assert_eq!(ctx.conf_sub_count("ietf-interfaces", Datastore::Running), 1);
    assert!(file.exists());

    ctx.conf_del(
        "ietf-interfaces",
        Some("/ietf-interfaces:interfaces/interface"),
        Datastore::Running,
        &cb,
        &None,
        0,
        SubOptions::DEFAULT,
    )?;
    assert_eq!(ctx.conf_group_count(), 0);
    assert!(ctx.is_empty());
    assert!(!file.exists());
    assert!(registry.is_empty());
    Ok(())
}

#[test]
fn test_store_empties_in_any_delete_order() -> Result<(), Box<dyn Error>> {
    let (dir, _cfg, registry, ctx) = setup(2);
    let change = noop_change();
    let dp = DpGetItemsCb::new(|_, _, _, _, _| Ok(()));
    let rpc = RpcCallback::values(|_, _, _, _, _| Ok(()));
    let notif = NotifCallback::tree(|_, _, _, _, _| {});
    let pd: PrivateData = Arc::new(42u64);

    let xpaths = ["/m1:a", "/m1:b", "/m1:c"];
    for (i, xpath) in xpaths.iter().enumerate() {
        ctx.conf_add("m1", Some(xpath), Datastore::Startup, &change, Some(pd.clone()), i as u32, SubOptions::DEFAULT)?;
        ctx.dp_add("m1", xpath, &dp, None)?;
        ctx.rpc_add(xpath, &rpc, None)?;
        ctx.notif_add("m1", Some(xpath), None, None, &notif, None)?;
    }
    assert_eq!(registry.len(), 12);
    assert_eq!(ctx.dp_sub_count("m1"), 3);
    assert_eq!(ctx.rpc_sub_count("m1"), 3);
    assert_eq!(ctx.notif_sub_count("m1"), 3);

    // middle, last, first: every position of the swap-remove
    for i in [1usize, 2, 0] {
        let xpath = xpaths[i];
        ctx.conf_del("m1", Some(xpath), Datastore::Startup, &change, &Some(pd.clone()), i as u32, SubOptions::DEFAULT)?;
        ctx.dp_del("m1", xpath, &dp, &None)?;
        ctx.rpc_del(xpath, &rpc, &None)?;
        ctx.notif_del("m1", Some(xpath), None, None, &notif, &None)?;

        let remaining = if i == 0 { 0 } else { 1 };
        assert_eq!(ctx.conf_group_count(), remaining);
        assert_eq!(ctx.dp_group_count(), remaining);
        assert_eq!(ctx.rpc_group_count(), remaining);
        assert_eq!(ctx.notif_group_count(), remaining);
    }

    assert!(ctx.is_empty());
    assert!(registry.is_empty());
    let leftovers: Vec<_> = std::fs::read_dir(dir.path())?
        .filter_map(|e| e.ok())
        .filter(|e| e.file_name().to_string_lossy().starts_with("sr_"))
        .collect();
    assert!(leftovers.is_empty(), "segments left behind: {:?}", leftovers);
    Ok(())
}

#[test]
fn test_failed_publish_leaves_store_unchanged() -> Result<(), Box<dyn Error>> {
    let dir = tempdir()?;
    let cfg = Arc::new(SrConfig::with_root(dir.path()));
    let calls = Arc::new(AtomicUsize::new(0));

    let mut registry = MockSharedRegistry::new();
    let counter = Arc::clone(&calls);
    registry.expect_publish().returning(move |_| {
        if counter.fetch_add(1, AtomicOrdering::SeqCst) == 0 {
            Ok(())
        } else {
            Err(SrError::NoMem("registry full".into()))
        }
    });
    registry
        .expect_retract()
        .withf(|desc| desc.module == "m" && matches!(desc.kind, SubKind::Notif))
        .times(1)
        .returning(|_| Ok(true));

    let ctx = SubscriptionContext::new(Arc::clone(&cfg), Arc::new(registry), 3);
    let cb = NotifCallback::tree(|_, _, _, _, _| {});

    ctx.notif_add("m", None, None, None, &cb, None)?;
    // group exists, publish fails on the existing group
    let err = ctx.notif_add("m", Some("/m:n"), None, None, &cb, None).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Resource);
    assert_eq!(ctx.notif_sub_count("m"), 1);

    // new group: the segment this call created is removed again
    let err = ctx.notif_add("other", None, None, None, &cb, None).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Resource);
    assert_eq!(ctx.notif_group_count(), 1);
    assert!(!dir.path().join("sr_other.notif").exists());

    // per-entry segment
    let dp = DpGetItemsCb::new(|_, _, _, _, _| Ok(()));
    assert!(ctx.dp_add("other", "/other:state", &dp, None).is_err());
    assert_eq!(ctx.dp_group_count(), 0);

    // the remaining subscription is retracted on drop
    drop(ctx);
    assert!(!dir.path().join("sr_m.notif").exists());
    Ok(())
}

#[test]
fn test_invalid_xpath_is_rejected_before_anything_changes() {
    let (_dir, _cfg, registry, ctx) = setup(4);
    let rpc = RpcCallback::tree(|_, _, _, _| Ok(()));

    let err = ctx.rpc_add("no-slash:rpc", &rpc, None).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Validation);
    let err = ctx.rpc_add("/unprefixed", &rpc, None).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Validation);
    let err = ctx
        .conf_add("m", Some("/m:l[k='v"), Datastore::Running, &noop_change(), None, 0, SubOptions::DEFAULT)
        .unwrap_err();
    assert!(err.to_string().contains("/m:l[k='v"));
    assert!(ctx.is_empty());
    assert!(registry.is_empty());
}

#[test]
#[should_panic(expected = "No data-provide subscription")]
fn test_deleting_unknown_subscription_panics() {
    let (_dir, _cfg, _registry, ctx) = setup(5);
    let dp = DpGetItemsCb::new(|_, _, _, _, _| Ok(()));
    ctx.dp_add("m", "/m:a", &dp, None).expect("dp_add");
    // same xpath, different callback
    let other = DpGetItemsCb::new(|_, _, _, _, _| Ok(()));
    let _ = ctx.dp_del("m", "/m:a", &other, &None);
}

#[test]
fn test_del_all_and_shared_keys() -> Result<(), Box<dyn Error>> {
    let dir = tempdir()?;
    let cfg = Arc::new(SrConfig::with_root(dir.path()));
    let registry: Arc<MemRegistry> = Arc::new(MemRegistry::new());
    let first = SubscriptionContext::new(Arc::clone(&cfg), registry.clone() as Arc<dyn SharedRegistry>, 10);
    let second = SubscriptionContext::new(Arc::clone(&cfg), registry.clone() as Arc<dyn SharedRegistry>, 11);
    let cb = noop_change();
    let notif = NotifCallback::values(|_, _, _, _, _, _| {});

    first.conf_add("m", None, Datastore::Running, &cb, None, 0, SubOptions::PASSIVE)?;
    first.notif_add("m", None, None, None, &notif, None)?;
    first.rpc_add("/m:reset", &RpcCallback::values(|_, _, _, _, _| Ok(())), None)?;
    second.conf_add("m", None, Datastore::Running, &cb, None, 5, SubOptions::DEFAULT)?;

    let running = dir.path().join("sr_m.running");
    first.del_all()?;
    assert!(first.is_empty());
    // still used by the second context
    assert!(running.exists());
    assert!(!dir.path().join("sr_m.notif").exists());
    assert_eq!(registry.len(), 1);

    drop(second);
    assert!(!running.exists());
    assert!(registry.is_empty());
    Ok(())
}

#[test]
fn test_conf_events_are_taken_once_per_priority() -> Result<(), Box<dyn Error>> {
    let (dir, cfg, _registry, ctx) = setup(6);
    let cb = noop_change();
    ctx.conf_add("m", Some("/m:a"), Datastore::Running, &cb, None, 0, SubOptions::DEFAULT)?;
    ctx.conf_add("m", Some("/m:b"), Datastore::Running, &cb, None, 3, SubOptions::DEFAULT)?;
    assert!(ctx.conf_new_events(Duration::from_secs(1))?.is_empty());

    let (mut publisher, created) = open_sub_shm(&dir.path().join("sr_m.running"), HeaderKind::Multi, cfg.shm_perm)?;
    assert!(!created);
    let record = EventRecord {
        priority: 3,
        ..EventRecord::new(SubEvent::Change, 21)
    };
    let request_id =
        EventWriter::new(&mut publisher, HeaderKind::Multi, &cfg).write(&record, b"diff", Duration::from_secs(1))?;

    let events = ctx.conf_new_events(Duration::from_secs(1))?;
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].module, "m");
    assert_eq!(events[0].snapshot.request_id, request_id);
    assert_eq!(events[0].snapshot.payload, b"diff");
    assert_eq!(events[0].xpaths, vec![Some("/m:b".to_string())]);

    // already processed
    assert!(ctx.conf_new_events(Duration::from_secs(1))?.is_empty());

    // same request moving to the next phase is new again
    let done = EventRecord {
        priority: 3,
        ..EventRecord::new(SubEvent::Done, 21)
    };
    EventWriter::new(&mut publisher, HeaderKind::Multi, &cfg).write(&done, b"", Duration::from_secs(1))?;
    assert_eq!(ctx.conf_new_events(Duration::from_secs(1))?.len(), 1);
    Ok(())
}

#[test]
fn test_notifications_reach_matching_subscribers() -> Result<(), Box<dyn Error>> {
    let (_dir, _cfg, _registry, ctx) = setup(7);
    let received: Arc<Mutex<Vec<(&'static str, usize)>>> = Arc::default();

    let all = {
        let received = Arc::clone(&received);
        NotifCallback::values(move |_, _, _, values, _, _| received.lock().push(("all", values.len())))
    };
    let filtered = {
        let received = Arc::clone(&received);
        NotifCallback::values(move |_, _, _, values, _, _| received.lock().push(("filtered", values.len())))
    };
    let expired = {
        let received = Arc::clone(&received);
        NotifCallback::tree(move |_, _, _, _, _| received.lock().push(("expired", 0)))
    };

    let past = SystemTime::now() - Duration::from_secs(60);
    ctx.notif_add("m", None, None, None, &all, None)?;
    ctx.notif_add("m", Some("/m:other"), None, None, &filtered, None)?;
    ctx.notif_add("m", None, None, Some(past), &expired, None)?;

    let op = DataNode::notification("m", "alarm")
        .with_child(DataNode::leaf("m", "id", LeafType::String, "a"))
        .with_child(DataNode::leaf("m", "level", LeafType::String, "3"));
    let delivered = ctx.notif_deliver("m", NotifType::Realtime, Some(&op), SystemTime::now(), &SessionId::default())?;
    assert_eq!(delivered, 1);
    assert_eq!(*received.lock(), vec![("all", 2)]);

    assert_eq!(
        ctx.notif_deliver("unknown", NotifType::Realtime, Some(&op), SystemTime::now(), &SessionId::default())?,
        0
    );
    Ok(())
}

#[test]
fn test_failed_segment_creation_leaves_store_unchanged() -> Result<(), Box<dyn Error>> {
    let dir = tempdir()?;
    let mut cfg = SrConfig::with_root(dir.path());
    cfg.shm_dir = dir.path().join("missing");

    let mut registry = MockSharedRegistry::new();
    registry.expect_publish().times(0);
    registry.expect_retract().times(0);
    let ctx = SubscriptionContext::new(Arc::new(cfg), Arc::new(registry), 8);

    let err = ctx
        .conf_add("m", Some("/m:a"), Datastore::Running, &noop_change(), None, 0, SubOptions::DEFAULT)
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Resource);
    assert_eq!(ctx.conf_group_count(), 0);
    assert_eq!(ctx.conf_sub_count("m", Datastore::Running), 0);

    let err = ctx
        .dp_add("m", "/m:state", &DpGetItemsCb::new(|_, _, _, _, _| Ok(())), None)
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Resource);
    assert_eq!(ctx.dp_group_count(), 0);
    assert_eq!(ctx.dp_sub_count("m"), 0);

    let err = ctx
        .rpc_add("/m:reset", &RpcCallback::values(|_, _, _, _, _| Ok(())), None)
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Resource);
    assert_eq!(ctx.rpc_group_count(), 0);
    assert_eq!(ctx.rpc_sub_count("m"), 0);

    let err = ctx
        .notif_add("m", None, None, None, &NotifCallback::tree(|_, _, _, _, _| {}), None)
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Resource);
    assert_eq!(ctx.notif_group_count(), 0);
    assert_eq!(ctx.notif_sub_count("m"), 0);

    assert!(ctx.is_empty());
    assert!(!dir.path().join("missing").exists());
    Ok(())
}

fn recording(received: &Arc<Mutex<Vec<&'static str>>>, name: &'static str) -> NotifCallback {
    let received = Arc::clone(received);
    NotifCallback::tree(move |_, _, _, _, _| received.lock().push(name))
}

#[test]
fn test_notification_filters_match_whole_steps_and_keys() -> Result<(), Box<dyn Error>> {
    let (_dir, _cfg, registry, ctx) = setup(12);
    let received: Arc<Mutex<Vec<&'static str>>> = Arc::default();

    ctx.notif_add("m", Some("/m:alarm"), None, None, &recording(&received, "alarm"), None)?;
    ctx.notif_add("m", Some("/m:alarm-cleared[id='a']"), None, None, &recording(&received, "cleared-a"), None)?;
    ctx.notif_add("m", Some("/m:alarm-cleared[id='b']"), None, None, &recording(&received, "cleared-b"), None)?;

    // only key-equality predicates are understood
    let err = ctx
        .notif_add("m", Some("/m:alarm[count(id)>1]"), None, None, &recording(&received, "count"), None)
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Validation);
    assert_eq!(ctx.notif_sub_count("m"), 3);
    assert_eq!(registry.len(), 3);

    let op = DataNode::notification("m", "alarm-cleared").with_child(DataNode::leaf("m", "id", LeafType::String, "a"));
    let delivered = ctx.notif_deliver("m", NotifType::Realtime, Some(&op), SystemTime::now(), &SessionId::default())?;
    assert_eq!(delivered, 1);
    assert_eq!(*received.lock(), vec!["cleared-a"]);
    Ok(())
}

#[test]
fn test_replay_ends_with_replay_complete() -> Result<(), Box<dyn Error>> {
    let (_dir, _cfg, _registry, ctx) = setup(13);
    let received: Arc<Mutex<Vec<&'static str>>> = Arc::default();
    let now = SystemTime::now();
    let start = now - Duration::from_secs(60);

    ctx.notif_add("m", None, Some(start), None, &recording(&received, "replaying"), None)?;
    ctx.notif_add("m", None, None, None, &recording(&received, "live"), None)?;

    let op = DataNode::notification("m", "alarm");
    let sid = SessionId::default();
    assert_eq!(ctx.notif_deliver("m", NotifType::Replay, Some(&op), now, &sid)?, 1);
    assert_eq!(ctx.notif_deliver("m", NotifType::ReplayComplete, None, now, &sid)?, 1);
    // replay is over for that subscription
    assert_eq!(ctx.notif_deliver("m", NotifType::Replay, Some(&op), now, &sid)?, 0);
    assert_eq!(ctx.notif_deliver("m", NotifType::ReplayComplete, None, now, &sid)?, 0);
    assert_eq!(ctx.notif_deliver("m", NotifType::Realtime, Some(&op), now, &sid)?, 2);

    assert_eq!(*received.lock(), vec!["replaying", "replaying", "replaying", "live"]);
    Ok(())
}

#[test]
fn test_failing_subscriber_does_not_stop_delivery() -> Result<(), Box<dyn Error>> {
    let (_dir, _cfg, _registry, ctx) = setup(14);
    let received: Arc<Mutex<Vec<&'static str>>> = Arc::default();

    // value-shaped delivery needs every leaf converted, which fails below
    let values = {
        let received = Arc::clone(&received);
        NotifCallback::values(move |_, _, _, _, _, _| received.lock().push("values"))
    };
    ctx.notif_add("m", None, None, None, &values, None)?;
    ctx.notif_add("m", None, None, None, &recording(&received, "tree"), None)?;

    let op = DataNode::notification("m", "threshold").with_child(DataNode::leaf(
        "m",
        "level",
        LeafType::Decimal64,
        "high",
    ));
    let err = ctx
        .notif_deliver("m", NotifType::Realtime, Some(&op), SystemTime::now(), &SessionId::default())
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Validation);
    assert_eq!(*received.lock(), vec!["tree"]);
    Ok(())
}
