//! Per-process store of the subscriptions one subscription context serves.
//!
//! Every entry is mirrored in the shared registry and listens on its own
//! subscription segment. Groups exist exactly while they hold entries:
//! they are created with their first entry and dropped with their last.

mod set;
mod types;

use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use log::{debug, error, warn};
use parking_lot::{Mutex, MutexGuard};

pub use self::set::SwapSet;
pub use self::types::{
    Callback, DpGetItemsCb, DpGetItemsFn, ModuleChangeCb, ModuleChangeFn, NotifCallback, NotifTreeFn, NotifValuesFn,
    PrivateData, RpcCallback, RpcTreeFn, RpcValuesFn, SubOptions,
};
use self::types::{same_private, ConfGroup, ConfSub, DpGroup, DpSub, NotifGroup, NotifSub, RpcGroup, RpcSub};
use crate::config::SrConfig;
use crate::core::layout::{open_sub_shm, HeaderKind, SubEvent};
use crate::core::path::{first_ns, str_hash, sub_shm_path, validate_xpath, Datastore, SegmentSuffix};
use crate::core::ShmSegment;
use crate::data::DataNode;
use crate::errors::{Result, SrError};
use crate::notif::{call_notif_callback, NotifFilter, NotifType, SessionId};
use crate::reader::{EventReader, EventSnapshot};
use crate::registry::{SharedRegistry, SubDescriptor, SubKind};

#[derive(Default)]
struct Subscriptions {
    conf: SwapSet<ConfGroup>,
    dp: SwapSet<DpGroup>,
    rpc: SwapSet<RpcGroup>,
    notif: SwapSet<NotifGroup>,
}

impl Subscriptions {
    fn is_empty(&self) -> bool {
        self.conf.is_empty() && self.dp.is_empty() && self.rpc.is_empty() && self.notif.is_empty()
    }
}

/// A configuration event some local subscribers have not processed yet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfEvent {
    pub module: String,
    pub ds: Datastore,
    pub snapshot: EventSnapshot,
    /// Xpaths of the subscribers the event was taken for.
    pub xpaths: Vec<Option<String>>,
}

pub struct SubscriptionContext {
    evpipe_num: u32,
    config: Arc<SrConfig>,
    registry: Arc<dyn SharedRegistry>,
    subs: Mutex<Subscriptions>,
}

impl SubscriptionContext {
    pub fn new(config: Arc<SrConfig>, registry: Arc<dyn SharedRegistry>, evpipe_num: u32) -> SubscriptionContext {
        SubscriptionContext {
            evpipe_num,
            config,
            registry,
            subs: Mutex::new(Subscriptions::default()),
        }
    }

    #[inline]
    pub fn evpipe_num(&self) -> u32 {
        self.evpipe_num
    }

    fn lock(&self, func: &str) -> Result<MutexGuard<'_, Subscriptions>> {
        self.subs
            .try_lock_for(self.config.sub_event_loop_timeout())
            .ok_or_else(|| SrError::LockTimeout {
                func: func.to_string(),
                op: "subscriptions",
            })
    }

    fn descriptor(&self, module: &str, kind: SubKind) -> SubDescriptor {
        SubDescriptor {
            module: module.to_string(),
            kind,
            evpipe_num: self.evpipe_num,
        }
    }

    /// Opens the segment for a new subscription and publishes it. On failure
    /// nothing is left behind, including a backing file this call created.
    fn open_and_publish(&self, path: &Path, kind: HeaderKind, desc: &SubDescriptor) -> Result<ShmSegment> {
        let (shm, created) = open_sub_shm(path, kind, self.config.shm_perm)?;
        if let Err(e) = self.registry.publish(desc) {
            drop(shm);
            if created {
                self.unlink_shm(path);
            }
            return Err(e);
        }
        Ok(shm)
    }

    /// Removes a backing file so that no stale event outlives its last
    /// subscriber.
    fn unlink_shm(&self, path: &Path) {
        if let Err(e) = ShmSegment::unlink(path) {
            warn!("Failed to unlink SHM \"{}\" ({}).", path.display(), e);
        }
    }

    #[allow(clippy::too_many_arguments)]
    pub fn conf_add(
        &self,
        module: &str,
        xpath: Option<&str>,
        ds: Datastore,
        cb: &ModuleChangeCb,
        private_data: Option<PrivateData>,
        priority: u32,
        opts: SubOptions,
    ) -> Result<()> {
        if let Some(xpath) = xpath {
            validate_xpath(xpath)?;
        }
        let mut subs = self.lock("conf_add")?;
        let desc = self.descriptor(
            module,
            SubKind::Conf {
                xpath: xpath.map(str::to_string),
                ds,
                priority,
                opts,
            },
        );
        let entry = ConfSub {
            xpath: xpath.map(str::to_string),
            priority,
            opts,
            cb: cb.clone(),
            private_data,
            event_id: 0,
            event: SubEvent::None,
        };

        match subs.conf.position(|g| g.ds == ds && g.module == module) {
            Some(i) => {
                self.registry.publish(&desc)?;
                subs.conf[i].subs.push(entry);
            }
            None => {
                let path = sub_shm_path(&self.config, module, ds.suffix(), None);
                let shm = self.open_and_publish(&path, HeaderKind::Multi, &desc)?;
                let mut group = ConfGroup {
                    module: module.to_string(),
                    ds,
                    shm,
                    subs: SwapSet::new(),
                };
                group.subs.push(entry);
                subs.conf.push(group);
            }
        }
        debug!("Subscribed to {} changes of \"{}\" (priority {}).", ds, module, priority);
        Ok(())
    }

    /// Removes the subscription matching the whole tuple.
    ///
    /// # Panics
    ///
    /// When no such subscription exists in this context.
    #[allow(clippy::too_many_arguments)]
    pub fn conf_del(
        &self,
        module: &str,
        xpath: Option<&str>,
        ds: Datastore,
        cb: &ModuleChangeCb,
        private_data: &Option<PrivateData>,
        priority: u32,
        opts: SubOptions,
    ) -> Result<()> {
        let mut subs = self.lock("conf_del")?;
        let found = subs.conf.position(|g| g.ds == ds && g.module == module).and_then(|gi| {
            subs.conf[gi]
                .subs
                .position(|s| {
                    s.xpath.as_deref() == xpath
                        && s.priority == priority
                        && s.opts == opts
                        && s.cb.same(cb)
                        && same_private(&s.private_data, private_data)
                })
                .map(|ei| (gi, ei))
        });
        let (gi, ei) = match found {
            Some(found) => found,
            None => panic!("No {} change subscription of \"{}\" in this context.", ds, module),
        };

        let last = self.registry.retract(&self.descriptor(
            module,
            SubKind::Conf {
                xpath: xpath.map(str::to_string),
                ds,
                priority,
                opts,
            },
        ))?;
        subs.conf[gi].subs.swap_remove(ei);
        if subs.conf[gi].subs.is_empty() {
            subs.conf.swap_remove(gi);
        }
        if last {
            self.unlink_shm(&sub_shm_path(&self.config, module, ds.suffix(), None));
        }
        Ok(())
    }

    pub fn dp_add(&self, module: &str, xpath: &str, cb: &DpGetItemsCb, private_data: Option<PrivateData>) -> Result<()> {
        validate_xpath(xpath)?;
        let mut subs = self.lock("dp_add")?;
        let desc = self.descriptor(
            module,
            SubKind::Dp {
                xpath: xpath.to_string(),
            },
        );
        let path = sub_shm_path(&self.config, module, SegmentSuffix::State, Some(str_hash(xpath)));
        let shm = self.open_and_publish(&path, HeaderKind::Single, &desc)?;
        let entry = DpSub {
            xpath: xpath.to_string(),
            cb: cb.clone(),
            private_data,
            shm,
        };

        match subs.dp.position(|g| g.module == module) {
            Some(i) => {
                subs.dp[i].subs.push(entry);
            }
            None => {
                let mut group = DpGroup {
                    module: module.to_string(),
                    subs: SwapSet::new(),
                };
                group.subs.push(entry);
                subs.dp.push(group);
            }
        }
        debug!("Providing operational data of \"{}\" for \"{}\".", module, xpath);
        Ok(())
    }

    /// # Panics
    ///
    /// When no such subscription exists in this context.
    pub fn dp_del(&self, module: &str, xpath: &str, cb: &DpGetItemsCb, private_data: &Option<PrivateData>) -> Result<()> {
        let mut subs = self.lock("dp_del")?;
        let found = subs.dp.position(|g| g.module == module).and_then(|gi| {
            subs.dp[gi]
                .subs
                .position(|s| s.xpath == xpath && s.cb.same(cb) && same_private(&s.private_data, private_data))
                .map(|ei| (gi, ei))
        });
        let (gi, ei) = match found {
            Some(found) => found,
            None => panic!("No data-provide subscription of \"{}\" for \"{}\" in this context.", module, xpath),
        };

        let last = self.registry.retract(&self.descriptor(
            module,
            SubKind::Dp {
                xpath: xpath.to_string(),
            },
        ))?;
        subs.dp[gi].subs.swap_remove(ei);
        if subs.dp[gi].subs.is_empty() {
            subs.dp.swap_remove(gi);
        }
        if last {
            self.unlink_shm(&sub_shm_path(&self.config, module, SegmentSuffix::State, Some(str_hash(xpath))));
        }
        Ok(())
    }

    /// Subscribes to an RPC or action. The module is the one owning the
    /// first node of `xpath`.
    pub fn rpc_add(&self, xpath: &str, cb: &RpcCallback, private_data: Option<PrivateData>) -> Result<()> {
        validate_xpath(xpath)?;
        let module = first_ns(xpath)
            .ok_or_else(|| SrError::Validation(format!("Xpath \"{}\" does not start with a module prefix.", xpath)))?;
        let mut subs = self.lock("rpc_add")?;
        let desc = self.descriptor(
            module,
            SubKind::Rpc {
                xpath: xpath.to_string(),
            },
        );
        let path = sub_shm_path(&self.config, module, SegmentSuffix::Rpc, Some(str_hash(xpath)));
        let shm = self.open_and_publish(&path, HeaderKind::Single, &desc)?;
        let entry = RpcSub {
            xpath: xpath.to_string(),
            cb: cb.clone(),
            private_data,
            shm,
        };

        match subs.rpc.position(|g| g.module == module) {
            Some(i) => {
                subs.rpc[i].subs.push(entry);
            }
            None => {
                let mut group = RpcGroup {
                    module: module.to_string(),
                    subs: SwapSet::new(),
                };
                group.subs.push(entry);
                subs.rpc.push(group);
            }
        }
        debug!("Subscribed to RPC \"{}\".", xpath);
        Ok(())
    }

    /// # Panics
    ///
    /// When no such subscription exists in this context.
    pub fn rpc_del(&self, xpath: &str, cb: &RpcCallback, private_data: &Option<PrivateData>) -> Result<()> {
        let module = match first_ns(xpath) {
            Some(module) => module,
            None => panic!("No RPC subscription for \"{}\" in this context.", xpath),
        };
        let mut subs = self.lock("rpc_del")?;
        let found = subs.rpc.position(|g| g.module == module).and_then(|gi| {
            subs.rpc[gi]
                .subs
                .position(|s| s.xpath == xpath && s.cb == *cb && same_private(&s.private_data, private_data))
                .map(|ei| (gi, ei))
        });
        let (gi, ei) = match found {
            Some(found) => found,
            None => panic!("No RPC subscription for \"{}\" in this context.", xpath),
        };

        let last = self.registry.retract(&self.descriptor(
            module,
            SubKind::Rpc {
                xpath: xpath.to_string(),
            },
        ))?;
        subs.rpc[gi].subs.swap_remove(ei);
        if subs.rpc[gi].subs.is_empty() {
            subs.rpc.swap_remove(gi);
        }
        if last {
            self.unlink_shm(&sub_shm_path(&self.config, module, SegmentSuffix::Rpc, Some(str_hash(xpath))));
        }
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    pub fn notif_add(
        &self,
        module: &str,
        xpath: Option<&str>,
        start_time: Option<SystemTime>,
        stop_time: Option<SystemTime>,
        cb: &NotifCallback,
        private_data: Option<PrivateData>,
    ) -> Result<()> {
        let filter = xpath.map(NotifFilter::parse).transpose()?;
        let mut subs = self.lock("notif_add")?;
        let desc = self.descriptor(module, SubKind::Notif);
        let entry = NotifSub {
            filter,
            start_time,
            stop_time,
            replayed: false,
            cb: cb.clone(),
            private_data,
        };

        match subs.notif.position(|g| g.module == module) {
            Some(i) => {
                self.registry.publish(&desc)?;
                subs.notif[i].subs.push(entry);
            }
            None => {
                let path = sub_shm_path(&self.config, module, SegmentSuffix::Notif, None);
                let shm = self.open_and_publish(&path, HeaderKind::Single, &desc)?;
                let mut group = NotifGroup {
                    module: module.to_string(),
                    shm,
                    subs: SwapSet::new(),
                };
                group.subs.push(entry);
                subs.notif.push(group);
            }
        }
        debug!("Subscribed to notifications of \"{}\".", module);
        Ok(())
    }

    /// # Panics
    ///
    /// When no such subscription exists in this context.
    #[allow(clippy::too_many_arguments)]
    pub fn notif_del(
        &self,
        module: &str,
        xpath: Option<&str>,
        start_time: Option<SystemTime>,
        stop_time: Option<SystemTime>,
        cb: &NotifCallback,
        private_data: &Option<PrivateData>,
    ) -> Result<()> {
        let mut subs = self.lock("notif_del")?;
        let found = subs.notif.position(|g| g.module == module).and_then(|gi| {
            subs.notif[gi]
                .subs
                .position(|s| {
                    s.xpath() == xpath
                        && s.start_time == start_time
                        && s.stop_time == stop_time
                        && s.cb == *cb
                        && same_private(&s.private_data, private_data)
                })
                .map(|ei| (gi, ei))
        });
        let (gi, ei) = match found {
            Some(found) => found,
            None => panic!("No notification subscription of \"{}\" in this context.", module),
        };

        let last = self.registry.retract(&self.descriptor(module, SubKind::Notif))?;
        subs.notif[gi].subs.swap_remove(ei);
        if subs.notif[gi].subs.is_empty() {
            subs.notif.swap_remove(gi);
        }
        if last {
            self.unlink_shm(&sub_shm_path(&self.config, module, SegmentSuffix::Notif, None));
        }
        Ok(())
    }

    /// Retracts and frees every subscription. Keeps going past failures and
    /// returns the first one; the store is empty afterwards either way.
    pub fn del_all(&self) -> Result<()> {
        let mut subs = self.lock("del_all")?;
        let mut first_err = None;
        let mut retract = |desc: SubDescriptor| -> bool {
            match self.registry.retract(&desc) {
                Ok(last) => last,
                Err(e) => {
                    error!("Failed to remove subscription of \"{}\" from the registry ({}).", desc.module, e);
                    first_err.get_or_insert(e);
                    false
                }
            }
        };

        while let Some(group) = subs.conf.pop() {
            let mut last = false;
            for sub in group.subs.iter() {
                last |= retract(self.descriptor(
                    &group.module,
                    SubKind::Conf {
                        xpath: sub.xpath.clone(),
                        ds: group.ds,
                        priority: sub.priority,
                        opts: sub.opts,
                    },
                ));
            }
            if last {
                self.unlink_shm(&sub_shm_path(&self.config, &group.module, group.ds.suffix(), None));
            }
        }

        while let Some(group) = subs.dp.pop() {
            for sub in group.subs.iter() {
                let desc = self.descriptor(
                    &group.module,
                    SubKind::Dp {
                        xpath: sub.xpath.clone(),
                    },
                );
                if retract(desc) {
                    let hash = Some(str_hash(&sub.xpath));
                    self.unlink_shm(&sub_shm_path(&self.config, &group.module, SegmentSuffix::State, hash));
                }
            }
        }

        while let Some(group) = subs.rpc.pop() {
            for sub in group.subs.iter() {
                let desc = self.descriptor(
                    &group.module,
                    SubKind::Rpc {
                        xpath: sub.xpath.clone(),
                    },
                );
                if retract(desc) {
                    let hash = Some(str_hash(&sub.xpath));
                    self.unlink_shm(&sub_shm_path(&self.config, &group.module, SegmentSuffix::Rpc, hash));
                }
            }
        }

        while let Some(group) = subs.notif.pop() {
            let mut last = false;
            for _ in group.subs.iter() {
                last |= retract(self.descriptor(&group.module, SubKind::Notif));
            }
            if last {
                self.unlink_shm(&sub_shm_path(&self.config, &group.module, SegmentSuffix::Notif, None));
            }
        }

        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Reads every configuration segment and returns the events that local
    /// subscribers of the stored priority have not processed yet, marking
    /// them processed.
    pub fn conf_new_events(&self, timeout: Duration) -> Result<Vec<ConfEvent>> {
        let mut subs = self.lock("conf_new_events")?;
        let mut events = Vec::new();
        for group in subs.conf.iter_mut() {
            let snapshot = EventReader::new(&mut group.shm, HeaderKind::Multi, &self.config).read(timeout)?;
            let priority = snapshot.priority.unwrap_or(0);
            let mut xpaths = Vec::new();
            for sub in group.subs.iter_mut() {
                if sub.priority == priority && snapshot.is_new(sub.event_id, sub.event) {
                    sub.event_id = snapshot.request_id;
                    sub.event = snapshot.event;
                    xpaths.push(sub.xpath.clone());
                }
            }
            if !xpaths.is_empty() {
                events.push(ConfEvent {
                    module: group.module.clone(),
                    ds: group.ds,
                    snapshot,
                    xpaths,
                });
            }
        }
        Ok(events)
    }

    /// Delivers one notification of `module` to every local subscriber that
    /// wants it: its xpath filter, when set, selects a node of `notif_op`
    /// and the notification falls into its time window. Delivering the
    /// replay-complete notification ends the replay of its receivers.
    ///
    /// Every target is called even when some fail; the first failure is
    /// returned afterwards.
    pub fn notif_deliver(
        &self,
        module: &str,
        notif_type: NotifType,
        notif_op: Option<&DataNode>,
        ts: SystemTime,
        sid: &SessionId,
    ) -> Result<usize> {
        let targets: Vec<(NotifCallback, Option<PrivateData>)> = {
            let mut subs = self.lock("notif_deliver")?;
            let gi = match subs.notif.position(|g| g.module == module) {
                Some(gi) => gi,
                None => return Ok(0),
            };
            let mut targets = Vec::new();
            for sub in subs.notif[gi].subs.iter_mut() {
                if !sub.wants(notif_type, notif_op, ts) {
                    continue;
                }
                if notif_type == NotifType::ReplayComplete {
                    sub.replayed = true;
                }
                targets.push((sub.cb.clone(), sub.private_data.clone()));
            }
            targets
        };

        // callbacks may add or remove subscriptions, so the store is not
        // locked while they run
        let mut first_err = None;
        for (cb, private_data) in &targets {
            if let Err(e) = call_notif_callback(cb, private_data.as_ref(), notif_type, notif_op, ts, sid.clone()) {
                error!("Failed to deliver a notification of \"{}\" ({}).", module, e);
                first_err.get_or_insert(e);
            }
        }
        match first_err {
            Some(e) => Err(e),
            None => Ok(targets.len()),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.subs.lock().is_empty()
    }

    pub fn conf_group_count(&self) -> usize {
        self.subs.lock().conf.len()
    }

    pub fn conf_sub_count(&self, module: &str, ds: Datastore) -> usize {
        self.subs
            .lock()
            .conf
            .find(|g| g.ds == ds && g.module == module)
            .map_or(0, |g| g.subs.len())
    }

    pub fn dp_group_count(&self) -> usize {
        self.subs.lock().dp.len()
    }

    pub fn dp_sub_count(&self, module: &str) -> usize {
        self.subs.lock().dp.find(|g| g.module == module).map_or(0, |g| g.subs.len())
    }

    pub fn rpc_group_count(&self) -> usize {
        self.subs.lock().rpc.len()
    }

    pub fn rpc_sub_count(&self, module: &str) -> usize {
        self.subs.lock().rpc.find(|g| g.module == module).map_or(0, |g| g.subs.len())
    }

    pub fn notif_group_count(&self) -> usize {
        self.subs.lock().notif.len()
    }

    pub fn notif_sub_count(&self, module: &str) -> usize {
        self.subs.lock().notif.find(|g| g.module == module).map_or(0, |g| g.subs.len())
    }
}

impl Drop for SubscriptionContext {
    fn drop(&mut self) {
        if self.subs.get_mut().is_empty() {
            return;
        }
        if let Err(e) = self.del_all() {
            error!("Failed to remove subscriptions of event pipe {} ({}).", self.evpipe_num, e);
        }
    }
}
