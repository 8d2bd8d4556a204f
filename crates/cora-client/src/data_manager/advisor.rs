//! One shared advise and the subscriptions it serves.

use std::cell::RefCell;
use std::fmt;
use std::rc::{Rc, Weak};

use tracing::{debug, info, warn};

use cora_core::protocol::{RecordBatch, RecordDescription};
use cora_core::{Result, TimerId};

use super::{
    ManagerInner, RestartStep, Shared, SubscriberRef, Subscription, SubscriptionFailure,
    with_broker,
};
use crate::context::ContextFailure;
use crate::transaction::{AdviseFailure, DataAdvisor, DataAdvisorClient, StartSpec};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub(crate) struct AdvisorId(u64);

impl AdvisorId {
    pub(crate) fn new(value: u64) -> Self {
        Self(value)
    }
}

impl fmt::Display for AdvisorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum AdvisorPhase {
    Starting,
    /// Records are flowing.
    Active,
    Failed,
}

/// Routes advise callbacks back into the manager.
struct AdvisorLink {
    manager: Weak<RefCell<ManagerInner>>,
    broker: String,
    table: String,
    id: AdvisorId,
}

impl DataAdvisorClient for AdvisorLink {
    fn on_advise_ready(&mut self, description: Rc<RecordDescription>) {
        let (table, id) = (&self.table, self.id);
        with_broker(&self.manager, &self.broker, |broker, shared| {
            broker.on_advise_ready(shared, table, id, description)
        });
    }

    fn on_advise_records(&mut self, batch: Rc<RecordBatch>, more: bool) {
        let (table, id) = (&self.table, self.id);
        with_broker(&self.manager, &self.broker, |broker, shared| {
            broker.on_advise_records(shared, table, id, batch, more)
        });
    }

    fn on_advise_failure(&mut self, failure: AdviseFailure) {
        let (table, id) = (&self.table, self.id);
        with_broker(&self.manager, &self.broker, |broker, shared| {
            broker.on_advise_failure(shared, table, id, failure)
        });
    }
}

pub(crate) struct TableDataAdvisor {
    id: AdvisorId,
    broker: String,
    table: String,
    start: StartSpec,
    subscriptions: Vec<Subscription>,
    advisor: Option<Rc<RefCell<DataAdvisor>>>,
    link: Rc<RefCell<AdvisorLink>>,
    phase: AdvisorPhase,
    description: Option<Rc<RecordDescription>>,
    last_batch: Option<(Rc<RecordBatch>, bool)>,
    restart_timer: Option<TimerId>,
}

impl fmt::Debug for TableDataAdvisor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TableDataAdvisor")
            .field("id", &self.id)
            .field("table", &self.table)
            .field("phase", &self.phase)
            .field("start", &self.start)
            .field("subscriptions", &self.subscriptions.len())
            .finish()
    }
}

impl TableDataAdvisor {
    /// Create an idle advisor. [`TableDataAdvisor::launch`] starts it.
    pub(crate) fn new(shared: &mut Shared, broker: &str, table: &str, start: StartSpec) -> Self {
        let id = shared.next_advisor_id();
        let link = Rc::new(RefCell::new(AdvisorLink {
            manager: shared.this.clone(),
            broker: broker.to_string(),
            table: table.to_string(),
            id,
        }));
        let advisor = Self {
            id,
            broker: broker.to_string(),
            table: table.to_string(),
            start,
            subscriptions: Vec::new(),
            advisor: None,
            link,
            phase: AdvisorPhase::Starting,
            description: None,
            last_batch: None,
            restart_timer: None,
        };
        debug!(broker, table, advisor = %id, start = ?start, "advisor created");
        advisor
    }

    pub(crate) fn id(&self) -> AdvisorId {
        self.id
    }

    pub(crate) fn phase(&self) -> AdvisorPhase {
        self.phase
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.subscriptions.is_empty()
    }

    pub(crate) fn subscriptions(&self) -> &[Subscription] {
        &self.subscriptions
    }

    pub(crate) fn restart_pending(&self) -> bool {
        self.restart_timer.is_some()
    }

    /// Whether a request with `start` may share this advisor.
    ///
    /// Until some advisor of the table is active only an identical start
    /// joins. Afterwards only real-time requests join, and only real-time
    /// advisors. A failed advisor with no restart scheduled takes nobody.
    pub(crate) fn accepts(&self, start: &StartSpec, table_active: bool) -> bool {
        if self.phase == AdvisorPhase::Failed && self.restart_timer.is_none() {
            return false;
        }
        if table_active {
            start.is_real_time() && self.start.is_real_time()
        } else {
            self.start == *start
        }
    }

    pub(crate) fn contains(&self, request: &super::DataRequest, subscriber: &SubscriberRef) -> bool {
        self.subscriptions.iter().any(|s| s.is(request, subscriber))
    }

    /// Add a subscription, catching it up if records are already flowing.
    pub(crate) fn add(&mut self, shared: &Shared, subscription: Subscription, check_columns: bool) {
        if self.phase == AdvisorPhase::Active {
            if let Some(description) = self.description.clone() {
                if check_columns && !has_column(&description, &subscription) {
                    shared.reject(subscription, SubscriptionFailure::InvalidColumnName);
                    return;
                }
                subscription.post_ready(&shared.runtime, description.clone());
                match &self.last_batch {
                    Some((batch, true)) => subscription.post_records(&shared.runtime, batch.clone(), true),
                    Some((batch, false)) => {
                        if let Some(last) = batch.last() {
                            let single = RecordBatch::new(description, vec![last.clone()]);
                            subscription.post_records(&shared.runtime, Rc::new(single), false);
                        }
                    }
                    None => {}
                }
            }
        }
        self.subscriptions.push(subscription);
    }

    pub(crate) fn remove(
        &mut self,
        request: &super::DataRequest,
        subscriber: &SubscriberRef,
    ) -> Option<Subscription> {
        let index = self.subscriptions.iter().position(|s| s.is(request, subscriber))?;
        Some(self.subscriptions.remove(index))
    }

    fn configure(&self, shared: &Shared) -> (Rc<RefCell<DataAdvisor>>, Result<()>) {
        let advisor = DataAdvisor::new(shared.runtime.clone(), shared.logon.clone());
        let client: Weak<RefCell<dyn DataAdvisorClient>> = Rc::downgrade(&self.link) as _;
        let started = {
            let mut a = advisor.borrow_mut();
            let started = a
                .set_broker_name(self.broker.as_str())
                .and_then(|()| a.set_table_name(self.table.as_str()))
                .and_then(|()| a.set_start(self.start))
                .and_then(|()| a.start(client));
            started
        };
        (advisor, started)
    }

    /// Start the advise. A synchronous start failure goes down the same
    /// path as a reported one.
    pub(crate) fn launch(&mut self, shared: &Shared) {
        self.phase = AdvisorPhase::Starting;
        self.description = None;
        self.last_batch = None;
        let (advisor, started) = self.configure(shared);
        match started {
            Ok(()) => self.advisor = Some(advisor),
            Err(e) => {
                warn!(table = %self.table, error = %e, "advise could not start");
                drop(advisor);
                self.on_failure(shared, ContextFailure::Session.into());
            }
        }
    }

    /// Re-issue the advise from scratch, cancelling any scheduled restart.
    pub(crate) fn restart(&mut self, shared: &Shared) {
        if let Some(timer) = self.restart_timer.take() {
            shared.runtime.disarm_timer(timer);
        }
        self.advisor = None;
        info!(broker = %self.broker, table = %self.table, advisor = %self.id, "restarting advise");
        self.launch(shared);
    }

    pub(crate) fn on_ready(&mut self, shared: &Shared, description: Rc<RecordDescription>, check_columns: bool) {
        self.phase = AdvisorPhase::Active;
        self.description = Some(description.clone());
        self.last_batch = None;
        let (kept, rejected): (Vec<_>, Vec<_>) = self
            .subscriptions
            .drain(..)
            .partition(|s| !check_columns || has_column(&description, s));
        self.subscriptions = kept;
        for subscription in rejected {
            shared.reject(subscription, SubscriptionFailure::InvalidColumnName);
        }
        for subscription in &self.subscriptions {
            subscription.post_ready(&shared.runtime, description.clone());
        }
    }

    pub(crate) fn on_records(&mut self, shared: &Shared, batch: Rc<RecordBatch>, more: bool) {
        for subscription in &self.subscriptions {
            subscription.post_records(&shared.runtime, batch.clone(), more);
        }
        self.last_batch = Some((batch, more));
    }

    /// Forward a failure to every subscription and schedule a restart when
    /// enabled and not already scheduled.
    pub(crate) fn on_failure(&mut self, shared: &Shared, failure: SubscriptionFailure) {
        warn!(
            broker = %self.broker,
            table = %self.table,
            advisor = %self.id,
            failure = %failure,
            "advise failed"
        );
        self.advisor = None;
        self.phase = AdvisorPhase::Failed;
        self.description = None;
        self.last_batch = None;
        for subscription in &self.subscriptions {
            subscription.post_failure(&shared.runtime, failure);
        }
        if shared.config.auto_restart && self.restart_timer.is_none() {
            let step = RestartStep::Advisor {
                table: self.table.clone(),
                id: self.id,
            };
            self.restart_timer = Some(shared.arm_restart(&self.broker, step));
        }
    }

    pub(crate) fn on_restart_timer(&mut self, shared: &Shared, timer: TimerId) {
        if self.restart_timer != Some(timer) {
            debug!(advisor = %self.id, timer = %timer, "ignoring stale restart timer");
            return;
        }
        self.restart_timer = None;
        self.restart(shared);
    }

    /// Stop the advise and retire every subscription.
    pub(crate) fn teardown(&mut self, shared: &Shared) {
        if let Some(timer) = self.restart_timer.take() {
            shared.runtime.disarm_timer(timer);
        }
        self.advisor = None;
        for subscription in self.subscriptions.drain(..) {
            shared.unsubscribe(subscription);
        }
    }
}

fn has_column(description: &RecordDescription, subscription: &Subscription) -> bool {
    match &subscription.request().column {
        Some(column) => description.find(column).is_some(),
        None => true,
    }
}
