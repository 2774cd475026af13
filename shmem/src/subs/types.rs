use std::any::Any;
use std::fmt;
use std::ops::{BitOr, Deref};
use std::sync::Arc;
use std::time::SystemTime;

use crate::core::layout::{ChangeEvent, SubEvent};
use crate::core::path::Datastore;
use crate::core::ShmSegment;
use crate::data::{DataNode, SrValue};
use crate::errors::Result;
use crate::notif::{NotifFilter, NotifType, Session};

use super::set::SwapSet;

/// Opaque user value handed back to callbacks. Compared by identity.
pub type PrivateData = Arc<dyn Any + Send + Sync>;

pub(crate) fn same_private(a: &Option<PrivateData>, b: &Option<PrivateData>) -> bool {
    match (a, b) {
        (None, None) => true,
        (Some(a), Some(b)) => Arc::ptr_eq(a, b),
        _ => false,
    }
}

/// Shared callback handle. Two handles are the same callback only when they
/// were cloned from one another.
pub struct Callback<F: ?Sized>(Arc<F>);

impl<F: ?Sized> Callback<F> {
    pub fn from_arc(f: Arc<F>) -> Callback<F> {
        Callback(f)
    }

    pub fn same(&self, other: &Callback<F>) -> bool {
        Arc::as_ptr(&self.0) as *const () == Arc::as_ptr(&other.0) as *const ()
    }
}

impl<F: ?Sized> Clone for Callback<F> {
    fn clone(&self) -> Self {
        Callback(Arc::clone(&self.0))
    }
}

impl<F: ?Sized> Deref for Callback<F> {
    type Target = F;

    fn deref(&self) -> &F {
        &self.0
    }
}

impl<F: ?Sized> PartialEq for Callback<F> {
    fn eq(&self, other: &Self) -> bool {
        self.same(other)
    }
}

impl<F: ?Sized> fmt::Debug for Callback<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Callback({:p})", Arc::as_ptr(&self.0) as *const ())
    }
}

/// `(session, module, xpath, event, request_id, private_data)`
pub type ModuleChangeFn =
    dyn Fn(&mut Session, &str, Option<&str>, ChangeEvent, u32, Option<&PrivateData>) -> Result<()> + Send + Sync;

/// `(session, module, xpath, parent, private_data)`; the provider attaches
/// its data under `parent`.
pub type DpGetItemsFn =
    dyn Fn(&mut Session, &str, &str, &mut Option<DataNode>, Option<&PrivateData>) -> Result<()> + Send + Sync;

/// `(session, op_path, input, output, private_data)`
pub type RpcValuesFn =
    dyn Fn(&mut Session, &str, &[SrValue], &mut Vec<SrValue>, Option<&PrivateData>) -> Result<()> + Send + Sync;

/// `(session, input, output, private_data)`
pub type RpcTreeFn =
    dyn Fn(&mut Session, &DataNode, &mut Option<DataNode>, Option<&PrivateData>) -> Result<()> + Send + Sync;

/// `(session, type, notif_path, values, timestamp, private_data)`
pub type NotifValuesFn =
    dyn Fn(&mut Session, NotifType, Option<&str>, &[SrValue], SystemTime, Option<&PrivateData>) + Send + Sync;

/// `(session, type, notif, timestamp, private_data)`
pub type NotifTreeFn =
    dyn Fn(&mut Session, NotifType, Option<&DataNode>, SystemTime, Option<&PrivateData>) + Send + Sync;

pub type ModuleChangeCb = Callback<ModuleChangeFn>;
pub type DpGetItemsCb = Callback<DpGetItemsFn>;

impl ModuleChangeCb {
    pub fn new<F>(f: F) -> ModuleChangeCb
    where
        F: Fn(&mut Session, &str, Option<&str>, ChangeEvent, u32, Option<&PrivateData>) -> Result<()>
            + Send
            + Sync
            + 'static,
    {
        Callback(Arc::new(f))
    }
}

impl DpGetItemsCb {
    pub fn new<F>(f: F) -> DpGetItemsCb
    where
        F: Fn(&mut Session, &str, &str, &mut Option<DataNode>, Option<&PrivateData>) -> Result<()>
            + Send
            + Sync
            + 'static,
    {
        Callback(Arc::new(f))
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum RpcCallback {
    Values(Callback<RpcValuesFn>),
    Tree(Callback<RpcTreeFn>),
}

impl RpcCallback {
    pub fn values<F>(f: F) -> RpcCallback
    where
        F: Fn(&mut Session, &str, &[SrValue], &mut Vec<SrValue>, Option<&PrivateData>) -> Result<()>
            + Send
            + Sync
            + 'static,
    {
        RpcCallback::Values(Callback(Arc::new(f)))
    }

    pub fn tree<F>(f: F) -> RpcCallback
    where
        F: Fn(&mut Session, &DataNode, &mut Option<DataNode>, Option<&PrivateData>) -> Result<()>
            + Send
            + Sync
            + 'static,
    {
        RpcCallback::Tree(Callback(Arc::new(f)))
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum NotifCallback {
    Values(Callback<NotifValuesFn>),
    Tree(Callback<NotifTreeFn>),
}

impl NotifCallback {
    pub fn values<F>(f: F) -> NotifCallback
    where
        F: Fn(&mut Session, NotifType, Option<&str>, &[SrValue], SystemTime, Option<&PrivateData>)
            + Send
            + Sync
            + 'static,
    {
        NotifCallback::Values(Callback(Arc::new(f)))
    }

    pub fn tree<F>(f: F) -> NotifCallback
    where
        F: Fn(&mut Session, NotifType, Option<&DataNode>, SystemTime, Option<&PrivateData>) + Send + Sync + 'static,
    {
        NotifCallback::Tree(Callback(Arc::new(f)))
    }
}

/// Subscription flags, stored with configuration subscriptions and part of
/// their identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct SubOptions(u32);

impl SubOptions {
    pub const DEFAULT: SubOptions = SubOptions(0);
    pub const PASSIVE: SubOptions = SubOptions(1);
    pub const DONE_ONLY: SubOptions = SubOptions(2);
    pub const ENABLED: SubOptions = SubOptions(4);
    pub const UPDATE: SubOptions = SubOptions(8);

    pub fn bits(&self) -> u32 {
        self.0
    }

    pub fn contains(&self, other: SubOptions) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for SubOptions {
    type Output = SubOptions;

    fn bitor(self, rhs: SubOptions) -> SubOptions {
        SubOptions(self.0 | rhs.0)
    }
}

pub(crate) struct ConfSub {
    pub xpath: Option<String>,
    pub priority: u32,
    pub opts: SubOptions,
    pub cb: ModuleChangeCb,
    pub private_data: Option<PrivateData>,
    /// Last request id and event this subscriber processed.
    pub event_id: u32,
    pub event: SubEvent,
}

pub(crate) struct ConfGroup {
    pub module: String,
    pub ds: Datastore,
    pub shm: ShmSegment,
    pub subs: SwapSet<ConfSub>,
}

pub(crate) struct DpSub {
    pub xpath: String,
    pub cb: DpGetItemsCb,
    pub private_data: Option<PrivateData>,
    pub shm: ShmSegment,
}

pub(crate) struct DpGroup {
    pub module: String,
    pub subs: SwapSet<DpSub>,
}

pub(crate) struct RpcSub {
    pub xpath: String,
    pub cb: RpcCallback,
    pub private_data: Option<PrivateData>,
    pub shm: ShmSegment,
}

pub(crate) struct RpcGroup {
    pub module: String,
    pub subs: SwapSet<RpcSub>,
}

pub(crate) struct NotifSub {
    pub filter: Option<NotifFilter>,
    pub start_time: Option<SystemTime>,
    pub stop_time: Option<SystemTime>,
    /// Set once the replay-complete notification has been delivered.
    pub replayed: bool,
    pub cb: NotifCallback,
    pub private_data: Option<PrivateData>,
}

impl NotifSub {
    pub fn xpath(&self) -> Option<&str> {
        self.filter.as_ref().map(NotifFilter::xpath)
    }

    /// Whether a notification of `notif_type` stamped `ts` with tree
    /// `notif_op` is delivered to this subscription. Replay traffic only
    /// reaches subscriptions with a start time that have not completed
    /// their replay yet.
    pub fn wants(&self, notif_type: NotifType, notif_op: Option<&DataNode>, ts: SystemTime) -> bool {
        let selected = match (&self.filter, notif_op) {
            (Some(filter), Some(op)) => filter.matches(op),
            _ => true,
        };
        let before_stop = self.stop_time.map_or(true, |stop| ts <= stop);
        selected
            && match notif_type {
                NotifType::Realtime => before_stop,
                NotifType::Replay => {
                    !self.replayed && self.start_time.map_or(false, |start| ts >= start) && before_stop
                }
                NotifType::ReplayComplete => !self.replayed && self.start_time.is_some(),
                NotifType::Stop => true,
            }
    }
}

pub(crate) struct NotifGroup {
    pub module: String,
    pub shm: ShmSegment,
    pub subs: SwapSet<NotifSub>,
}
