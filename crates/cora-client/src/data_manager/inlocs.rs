//! Synthesized input-location table of a classic datalogger.
//!
//! Classic loggers have no broker table for their input locations. The
//! table is built in two steps: read the device's input-location labels,
//! then create a collect area covering the requested locations. The server
//! publishes the area as table [`CLASSIC_INLOCS_TABLE`] on the broker named
//! like the device. Requests made before the table exists wait in arrival
//! order and are handed over once, when the area is first ready.

use std::cell::RefCell;
use std::collections::BTreeSet;
use std::fmt;
use std::rc::{Rc, Weak};

use tracing::{debug, info, warn};

use cora_core::TimerId;
use cora_core::constants::{CLASSIC_INLOCS_TABLE, DEFAULT_INLOC_COUNT, DEFAULT_INLOC_PREFIX};
use cora_core::protocol::{InputLocationLabels, Setting};

use super::{
    DataRequest, ManagerInner, RestartStep, Shared, SubscriberRef, Subscription,
    SubscriptionFailure, with_broker,
};
use crate::context::ContextFailure;
use crate::transaction::{
    CollectAreaClient, CollectAreaFailure, CollectAreaMaintainer, SettingsClient,
    SettingsEnumerator, SettingsFailure,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum InlocsState {
    Idle,
    ReadingLabels,
    CreatingArea,
    Ready,
    Failed,
}

/// Routes settings and collect area callbacks back into the manager.
struct InlocsLink {
    manager: Weak<RefCell<ManagerInner>>,
    broker: String,
}

impl SettingsClient for InlocsLink {
    fn on_setting(&mut self, setting: Rc<dyn Setting>) {
        let Some(labels) = setting.as_any().downcast_ref::<InputLocationLabels>() else {
            return;
        };
        let labels = labels.labels.clone();
        with_broker(&self.manager, &self.broker, |broker, _| broker.on_input_labels(labels));
    }

    fn on_started(&mut self) {
        with_broker(&self.manager, &self.broker, |broker, shared| {
            broker.on_labels_resolved(shared)
        });
    }

    fn on_failure(&mut self, failure: SettingsFailure) {
        with_broker(&self.manager, &self.broker, |broker, shared| {
            broker.on_classic_failure(shared, failure.into())
        });
    }
}

impl CollectAreaClient for InlocsLink {
    fn on_ready(&mut self) {
        with_broker(&self.manager, &self.broker, |broker, shared| {
            broker.on_area_ready(shared)
        });
    }

    fn on_changed(&mut self) {
        with_broker(&self.manager, &self.broker, |broker, shared| {
            broker.on_area_changed(shared)
        });
    }

    fn on_failure(&mut self, failure: CollectAreaFailure) {
        with_broker(&self.manager, &self.broker, |broker, shared| {
            broker.on_classic_failure(shared, failure.into())
        });
    }
}

#[derive(Debug)]
struct Queued {
    seq: u64,
    subscription: Subscription,
}

pub(crate) struct ClassicInlocs {
    broker: String,
    state: InlocsState,
    labels: Vec<String>,
    settings: Option<Rc<RefCell<SettingsEnumerator>>>,
    maintainer: Option<Rc<RefCell<CollectAreaMaintainer>>>,
    link: Rc<RefCell<InlocsLink>>,
    whole_tables: Vec<Queued>,
    columns: Vec<Queued>,
    next_seq: u64,
    restart_timer: Option<TimerId>,
    failure: Option<SubscriptionFailure>,
}

impl fmt::Debug for ClassicInlocs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClassicInlocs")
            .field("broker", &self.broker)
            .field("state", &self.state)
            .field("labels", &self.labels.len())
            .field("queued", &self.queued_count())
            .finish()
    }
}

impl ClassicInlocs {
    pub(crate) fn new(shared: &Shared, broker: &str) -> Self {
        Self {
            broker: broker.to_string(),
            state: InlocsState::Idle,
            labels: Vec::new(),
            settings: None,
            maintainer: None,
            link: Rc::new(RefCell::new(InlocsLink {
                manager: shared.this.clone(),
                broker: broker.to_string(),
            })),
            whole_tables: Vec::new(),
            columns: Vec::new(),
            next_seq: 0,
            restart_timer: None,
            failure: None,
        }
    }

    pub(crate) fn is_ready(&self) -> bool {
        self.state == InlocsState::Ready
    }

    pub(crate) fn restart_pending(&self) -> bool {
        self.restart_timer.is_some()
    }

    /// The failure that left the table inert: failed with no restart
    /// scheduled.
    pub(crate) fn inert_failure(&self) -> Option<SubscriptionFailure> {
        match self.state {
            InlocsState::Failed if self.restart_timer.is_none() => self.failure,
            _ => None,
        }
    }

    // -------------------------------------------------------------------------
    // Pending requests
    // -------------------------------------------------------------------------

    pub(crate) fn enqueue(&mut self, subscription: Subscription) {
        let queued = Queued {
            seq: self.next_seq,
            subscription,
        };
        self.next_seq += 1;
        if queued.subscription.request().column.is_some() {
            self.columns.push(queued);
        } else {
            self.whole_tables.push(queued);
        }
    }

    pub(crate) fn has_queued(&self) -> bool {
        !self.whole_tables.is_empty() || !self.columns.is_empty()
    }

    pub(crate) fn queued_count(&self) -> usize {
        self.whole_tables.len() + self.columns.len()
    }

    pub(crate) fn queued_requests(&self) -> impl Iterator<Item = &DataRequest> + '_ {
        self.whole_tables
            .iter()
            .chain(&self.columns)
            .map(|q| q.subscription.request())
    }

    pub(crate) fn contains_queued(&self, request: &DataRequest, subscriber: &SubscriberRef) -> bool {
        self.whole_tables
            .iter()
            .chain(&self.columns)
            .any(|q| q.subscription.is(request, subscriber))
    }

    pub(crate) fn remove_queued(
        &mut self,
        request: &DataRequest,
        subscriber: &SubscriberRef,
    ) -> Option<Subscription> {
        let queue = if request.column.is_some() {
            &mut self.columns
        } else {
            &mut self.whole_tables
        };
        let index = queue.iter().position(|q| q.subscription.is(request, subscriber))?;
        Some(queue.remove(index).subscription)
    }

    /// Take every queued request, in arrival order.
    fn drain_queued(&mut self) -> Vec<Subscription> {
        let mut queued: Vec<Queued> = self.whole_tables.drain(..).chain(self.columns.drain(..)).collect();
        queued.sort_by_key(|q| q.seq);
        queued.into_iter().map(|q| q.subscription).collect()
    }

    // -------------------------------------------------------------------------
    // Labels and fields
    // -------------------------------------------------------------------------

    pub(crate) fn column_known(&self, request: &DataRequest) -> bool {
        match &request.column {
            Some(column) => self.labels.iter().any(|label| label == column),
            None => true,
        }
    }

    /// Field ids, counted from one, that cover `requests`.
    pub(crate) fn field_ids<'a>(&self, requests: impl Iterator<Item = &'a DataRequest>) -> BTreeSet<u32> {
        let mut fields = BTreeSet::new();
        for request in requests {
            match &request.column {
                None => fields.extend(1..=self.labels.len() as u32),
                Some(column) => {
                    if let Some(index) = self.labels.iter().position(|label| label == column) {
                        fields.insert(index as u32 + 1);
                    }
                }
            }
        }
        fields
    }

    pub(crate) fn set_labels(&mut self, labels: Vec<String>) {
        debug!(broker = %self.broker, count = labels.len(), "input location labels");
        self.labels = labels;
    }

    // -------------------------------------------------------------------------
    // Steps
    // -------------------------------------------------------------------------

    /// Read the device's input-location labels.
    pub(crate) fn start(&mut self, shared: &Shared) -> Result<(), SubscriptionFailure> {
        self.state = InlocsState::ReadingLabels;
        self.failure = None;
        self.labels.clear();
        self.maintainer = None;
        let settings = SettingsEnumerator::with_factory(
            shared.runtime.clone(),
            shared.logon.clone(),
            shared.factory.clone(),
        );
        let client: Weak<RefCell<dyn SettingsClient>> = Rc::downgrade(&self.link) as _;
        let started = {
            let mut s = settings.borrow_mut();
            let started = s
                .set_device_name(self.broker.as_str())
                .and_then(|()| s.start(client));
            started
        };
        match started {
            Ok(()) => {
                debug!(broker = %self.broker, "reading input location labels");
                self.settings = Some(settings);
                Ok(())
            }
            Err(e) => {
                warn!(broker = %self.broker, error = %e, "settings enumeration could not start");
                Err(ContextFailure::Session.into())
            }
        }
    }

    /// Stop reading settings; a device that reported no labels gets the
    /// generic ones.
    pub(crate) fn finish_labels(&mut self) {
        self.settings = None;
        if self.labels.is_empty() {
            self.labels = (1..=DEFAULT_INLOC_COUNT)
                .map(|i| format!("{}{}", DEFAULT_INLOC_PREFIX, i))
                .collect();
        }
    }

    /// Create the collect area covering `fields`.
    pub(crate) fn create_area(&mut self, shared: &Shared, fields: BTreeSet<u32>) -> Result<(), SubscriptionFailure> {
        let maintainer = CollectAreaMaintainer::new(shared.runtime.clone(), shared.logon.clone());
        let client: Weak<RefCell<dyn CollectAreaClient>> = Rc::downgrade(&self.link) as _;
        let started = {
            let mut m = maintainer.borrow_mut();
            let started = m
                .set_device_name(self.broker.as_str())
                .and_then(|()| m.set_area_name(CLASSIC_INLOCS_TABLE))
                .and_then(|()| m.set_fields(fields))
                .and_then(|()| m.start(client));
            started
        };
        match started {
            Ok(()) => {
                self.state = InlocsState::CreatingArea;
                self.maintainer = Some(maintainer);
                Ok(())
            }
            Err(e) => {
                warn!(broker = %self.broker, error = %e, "collect area could not start");
                Err(ContextFailure::Session.into())
            }
        }
    }

    /// The area exists. Returns the requests to hand over.
    pub(crate) fn mark_ready(&mut self) -> Vec<Subscription> {
        self.state = InlocsState::Ready;
        let queued = self.drain_queued();
        info!(broker = %self.broker, flushed = queued.len(), "input location table ready");
        queued
    }

    /// Apply a changed field set to the area, if there is one.
    pub(crate) fn set_fields(&mut self, fields: BTreeSet<u32>) {
        if let Some(maintainer) = &self.maintainer {
            match maintainer.try_borrow_mut() {
                Ok(mut maintainer) => {
                    if let Err(e) = maintainer.set_fields(fields) {
                        warn!(broker = %self.broker, error = %e, "could not update collect area");
                    }
                }
                Err(_) => warn!(broker = %self.broker, "collect area busy; field change dropped"),
            }
        }
    }

    /// Stop both steps, tell the queued requests and schedule a restart
    /// when enabled.
    pub(crate) fn on_failure(&mut self, shared: &Shared, failure: SubscriptionFailure) {
        warn!(broker = %self.broker, state = ?self.state, failure = %failure, "input location table failed");
        self.state = InlocsState::Failed;
        self.failure = Some(failure);
        self.settings = None;
        self.maintainer = None;
        for queued in self.whole_tables.iter().chain(&self.columns) {
            queued.subscription.post_failure(&shared.runtime, failure);
        }
        if shared.config.auto_restart && self.restart_timer.is_none() {
            self.restart_timer = Some(shared.arm_restart(&self.broker, RestartStep::ClassicInlocs));
        }
    }

    /// Whether a fired timer is the one currently armed. Clears it if so.
    pub(crate) fn take_restart(&mut self, timer: TimerId) -> bool {
        if self.restart_timer != Some(timer) {
            debug!(broker = %self.broker, timer = %timer, "ignoring stale restart timer");
            return false;
        }
        self.restart_timer = None;
        true
    }

    pub(crate) fn teardown(&mut self, shared: &Shared) {
        if let Some(timer) = self.restart_timer.take() {
            shared.runtime.disarm_timer(timer);
        }
        self.settings = None;
        self.maintainer = None;
        for subscription in self.drain_queued() {
            shared.unsubscribe(subscription);
        }
        self.state = InlocsState::Idle;
        debug!(broker = %self.broker, "input location table released");
    }
}
