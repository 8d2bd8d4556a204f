//! Shared data subscriptions.
//!
//! A [`DataManager`] accepts `(broker, table, start, column)` requests from
//! many subscribers and serves them with as few server advises as it can.
//! Requests fan out to a per-broker manager, then to a per-table manager that
//! owns the running advisors:
//!
//! ```text
//! DataManager
//!   └─ BrokerDataManager (by broker name)
//!        ├─ TableDataManager (by table name)
//!        │    └─ TableDataAdvisor (by advisor id) ── DataAdvisor
//!        └─ ClassicInlocs ── SettingsEnumerator, CollectAreaMaintainer
//! ```
//!
//! Subscribers are never owned. Each subscription holds a weak handle and a
//! [`ReceiverId`] token that is retired on removal, so events queued for a
//! removed subscription are dropped by the runtime.
//!
//! Sub-transactions report back through small link objects that look the
//! owning broker up by name at delivery time. A link never holds a strong
//! reference to the manager.

mod advisor;
mod broker;
mod inlocs;
mod table;

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::rc::{Rc, Weak};

use thiserror::Error;
use tracing::{debug, warn};

use cora_core::constants::CLASSIC_INLOCS_TABLE;
use cora_core::protocol::{DefaultSettingFactory, RecordBatch, RecordDescription, SettingFactory};
use cora_core::{Error, ReceiverId, Result, Runtime, TimerId};

use crate::config::{DataManagerConfig, LogonConfig};
use crate::context::ContextFailure;
use crate::transaction::{AdviseFailure, CollectAreaFailure, SettingsFailure, StartSpec};

use advisor::AdvisorId;
use broker::BrokerDataManager;

// =============================================================================
// Requests and subscribers
// =============================================================================

/// What a subscriber asks for.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DataRequest {
    pub broker: String,
    pub table: String,
    pub start: StartSpec,
    /// A single column. `None` asks for the whole table.
    pub column: Option<String>,
}

impl DataRequest {
    pub fn new(broker: impl Into<String>, table: impl Into<String>, start: StartSpec) -> Self {
        Self {
            broker: broker.into(),
            table: table.into(),
            start,
            column: None,
        }
    }

    pub fn with_column(mut self, column: impl Into<String>) -> Self {
        self.column = Some(column.into());
        self
    }

    /// Whether the request targets the synthesized input-location table.
    pub fn is_classic_inlocs(&self) -> bool {
        self.table == CLASSIC_INLOCS_TABLE
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Error)]
pub enum SubscriptionFailure {
    #[error(transparent)]
    Context(#[from] ContextFailure),
    #[error("no table with that name")]
    InvalidTableName,
    #[error("table was deleted")]
    TableDeleted,
    #[error("start position out of range")]
    InvalidRange,
    #[error("no column with that name")]
    InvalidColumnName,
    #[error("device input locations could not be read")]
    SettingsUnavailable,
    #[error("device rejected the input location collect area")]
    CollectAreaRejected,
    #[error("broker and table names are required")]
    InvalidRequest,
    #[error("unknown failure")]
    Unknown,
}

impl From<AdviseFailure> for SubscriptionFailure {
    fn from(failure: AdviseFailure) -> Self {
        match failure {
            AdviseFailure::Context(context) => SubscriptionFailure::Context(context),
            AdviseFailure::InvalidTableName => SubscriptionFailure::InvalidTableName,
            AdviseFailure::TableDeleted => SubscriptionFailure::TableDeleted,
            AdviseFailure::InvalidRange => SubscriptionFailure::InvalidRange,
            AdviseFailure::InvalidColumnName => SubscriptionFailure::InvalidColumnName,
            AdviseFailure::Unknown => SubscriptionFailure::Unknown,
        }
    }
}

impl From<SettingsFailure> for SubscriptionFailure {
    fn from(failure: SettingsFailure) -> Self {
        match failure {
            SettingsFailure::Context(context) => SubscriptionFailure::Context(context),
            SettingsFailure::Unsupported => SubscriptionFailure::SettingsUnavailable,
            SettingsFailure::Unknown => SubscriptionFailure::Unknown,
        }
    }
}

impl From<CollectAreaFailure> for SubscriptionFailure {
    fn from(failure: CollectAreaFailure) -> Self {
        match failure {
            CollectAreaFailure::Context(context) => SubscriptionFailure::Context(context),
            CollectAreaFailure::InvalidField | CollectAreaFailure::NameInUse => {
                SubscriptionFailure::CollectAreaRejected
            }
            CollectAreaFailure::Unknown => SubscriptionFailure::Unknown,
        }
    }
}

/// Receives the data of its requests.
///
/// Every callback is a posted event. A subscriber may add or remove requests,
/// or drop itself, from inside any of them.
pub trait DataSubscriber {
    /// The request is being served with this schema. Called again after the
    /// serving advise restarts.
    fn on_advise_ready(&mut self, request: &DataRequest, description: Rc<RecordDescription>);

    /// Records for the request. `more` is set while the server has a backlog.
    fn on_advise_records(&mut self, request: &DataRequest, batch: Rc<RecordBatch>, more: bool);

    fn on_advise_failure(&mut self, request: &DataRequest, failure: SubscriptionFailure);
}

pub type SubscriberRef = Weak<RefCell<dyn DataSubscriber>>;

fn same_subscriber(a: &SubscriberRef, b: &SubscriberRef) -> bool {
    std::ptr::addr_eq(a.as_ptr(), b.as_ptr())
}

/// One (request, subscriber) pair with its liveness token.
pub(crate) struct Subscription {
    request: DataRequest,
    subscriber: SubscriberRef,
    token: ReceiverId,
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("request", &self.request)
            .field("token", &self.token)
            .finish()
    }
}

impl Subscription {
    pub(crate) fn request(&self) -> &DataRequest {
        &self.request
    }

    pub(crate) fn is(&self, request: &DataRequest, subscriber: &SubscriberRef) -> bool {
        self.request == *request && same_subscriber(&self.subscriber, subscriber)
    }

    fn deliver(
        &self,
        runtime: &Runtime,
        target: ReceiverId,
        action: impl FnOnce(&mut dyn DataSubscriber, &DataRequest) + 'static,
    ) {
        let subscriber = self.subscriber.clone();
        let request = self.request.clone();
        runtime.post(target, move || {
            let Some(subscriber) = subscriber.upgrade() else {
                debug!(broker = %request.broker, table = %request.table, "subscriber gone");
                return;
            };
            match subscriber.try_borrow_mut() {
                Ok(mut subscriber) => action(&mut *subscriber, &request),
                Err(_) => warn!(table = %request.table, "subscriber busy; event dropped"),
            };
        });
    }

    pub(crate) fn post_ready(&self, runtime: &Runtime, description: Rc<RecordDescription>) {
        self.deliver(runtime, self.token, move |s, r| s.on_advise_ready(r, description));
    }

    pub(crate) fn post_records(&self, runtime: &Runtime, batch: Rc<RecordBatch>, more: bool) {
        self.deliver(runtime, self.token, move |s, r| s.on_advise_records(r, batch, more));
    }

    pub(crate) fn post_failure(&self, runtime: &Runtime, failure: SubscriptionFailure) {
        self.deliver(runtime, self.token, move |s, r| s.on_advise_failure(r, failure));
    }
}

// =============================================================================
// Shared manager state
// =============================================================================

/// Which failed step a restart timer re-issues.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum RestartStep {
    Advisor { table: String, id: AdvisorId },
    ClassicInlocs,
}

/// State every level of the manager needs.
pub(crate) struct Shared {
    runtime: Runtime,
    logon: LogonConfig,
    config: DataManagerConfig,
    factory: Rc<dyn SettingFactory>,
    this: Weak<RefCell<ManagerInner>>,
    id: ReceiverId,
    next_advisor: u64,
}

impl Shared {
    pub(crate) fn next_advisor_id(&mut self) -> AdvisorId {
        self.next_advisor += 1;
        AdvisorId::new(self.next_advisor)
    }

    fn subscribe(&self, request: DataRequest, subscriber: SubscriberRef) -> Subscription {
        Subscription {
            request,
            subscriber,
            token: self.runtime.register(),
        }
    }

    pub(crate) fn unsubscribe(&self, subscription: Subscription) {
        self.runtime.retire(subscription.token);
    }

    /// Fail a subscription the manager is dropping on its own.
    ///
    /// The event is bound to the manager rather than the subscription, whose
    /// token is retired here.
    pub(crate) fn reject(&self, subscription: Subscription, failure: SubscriptionFailure) {
        subscription.deliver(&self.runtime, self.id, move |s, r| s.on_advise_failure(r, failure));
        self.unsubscribe(subscription);
    }

    /// Arm the restart timer for one failed step of `broker`.
    pub(crate) fn arm_restart(&self, broker: &str, step: RestartStep) -> TimerId {
        let manager = self.this.clone();
        let broker_name = broker.to_string();
        debug!(broker, step = ?step, "restart scheduled");
        self.runtime
            .arm_timer(self.id, self.config.restart_interval, move |timer| {
                with_broker(&manager, &broker_name, |broker, shared| {
                    broker.on_restart_timer(shared, step, timer)
                });
            })
    }
}

pub(crate) struct ManagerInner {
    shared: Shared,
    brokers: BTreeMap<String, BrokerDataManager>,
}

impl ManagerInner {
    fn prune(&mut self) {
        let shared = &self.shared;
        self.brokers.retain(|name, broker| {
            broker.prune(shared);
            let keep = !broker.is_empty();
            if !keep {
                debug!(broker = %name, "broker manager released");
            }
            keep
        });
    }
}

impl Drop for ManagerInner {
    fn drop(&mut self) {
        for broker in self.brokers.values_mut() {
            broker.teardown(&self.shared);
        }
        self.shared.runtime.retire(self.shared.id);
    }
}

/// Run `action` on a broker manager from a posted event, then release
/// whatever became empty.
pub(crate) fn with_broker(
    manager: &Weak<RefCell<ManagerInner>>,
    broker: &str,
    action: impl FnOnce(&mut BrokerDataManager, &mut Shared),
) {
    let Some(manager) = manager.upgrade() else {
        return;
    };
    let Ok(mut inner) = manager.try_borrow_mut() else {
        warn!(broker, "data manager busy; event dropped");
        return;
    };
    let inner = &mut *inner;
    match inner.brokers.get_mut(broker) {
        Some(target) => action(target, &mut inner.shared),
        None => debug!(broker, "event for released broker"),
    }
    inner.prune();
}

// =============================================================================
// Data manager
// =============================================================================

/// Multiplexes data requests onto shared server advises.
#[derive(Clone)]
pub struct DataManager {
    inner: Rc<RefCell<ManagerInner>>,
}

impl std::fmt::Debug for DataManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut debug = f.debug_struct("DataManager");
        if let Ok(inner) = self.inner.try_borrow() {
            debug.field("brokers", &inner.brokers.keys().collect::<Vec<_>>());
        }
        debug.finish()
    }
}

impl DataManager {
    pub fn new(runtime: Runtime, logon: LogonConfig, config: DataManagerConfig) -> Self {
        Self::with_setting_factory(runtime, logon, config, Rc::new(DefaultSettingFactory))
    }

    pub fn with_setting_factory(
        runtime: Runtime,
        logon: LogonConfig,
        config: DataManagerConfig,
        factory: Rc<dyn SettingFactory>,
    ) -> Self {
        let inner = Rc::new_cyclic(|this| {
            RefCell::new(ManagerInner {
                shared: Shared {
                    id: runtime.register(),
                    runtime,
                    logon,
                    config,
                    factory,
                    this: this.clone(),
                    next_advisor: 0,
                },
                brokers: BTreeMap::new(),
            })
        });
        Self { inner }
    }

    fn inner_mut(&self) -> Result<std::cell::RefMut<'_, ManagerInner>> {
        self.inner.try_borrow_mut().map_err(|_| Error::InvalidState {
            expected: "idle".into(),
            actual: "busy".into(),
        })
    }

    fn inner(&self) -> Option<std::cell::Ref<'_, ManagerInner>> {
        self.inner.try_borrow().ok()
    }

    /// Subscribe `subscriber` to `request`.
    ///
    /// Everything after the request has been accepted, including rejection
    /// of malformed requests, is reported through the subscriber. Adding the
    /// same request for the same subscriber twice has no effect.
    pub fn add_data_request(&self, request: DataRequest, subscriber: SubscriberRef) -> Result<()> {
        if subscriber.upgrade().is_none() {
            return Err(Error::InvalidArgument {
                message: "subscriber is gone".into(),
            });
        }
        let mut inner = self.inner_mut()?;
        let inner = &mut *inner;
        if request.broker.is_empty() || request.table.is_empty() {
            debug!(request = ?request, "rejecting incomplete request");
            let subscription = inner.shared.subscribe(request, subscriber);
            inner.shared.reject(subscription, SubscriptionFailure::InvalidRequest);
            return Ok(());
        }
        let broker = inner
            .brokers
            .entry(request.broker.clone())
            .or_insert_with(|| BrokerDataManager::new(&request.broker));
        broker.add(&mut inner.shared, request, subscriber);
        inner.prune();
        Ok(())
    }

    /// Remove one subscription. Unknown pairs are ignored.
    pub fn remove_data_request(&self, request: &DataRequest, subscriber: &SubscriberRef) -> Result<()> {
        let mut inner = self.inner_mut()?;
        let inner = &mut *inner;
        match inner.brokers.get_mut(&request.broker) {
            Some(broker) => {
                if !broker.remove(&mut inner.shared, request, subscriber) {
                    debug!(request = ?request, "no such subscription");
                }
            }
            None => debug!(broker = %request.broker, "no such broker"),
        }
        inner.prune();
        Ok(())
    }

    /// Brokers with at least one request.
    pub fn brokers(&self) -> Vec<String> {
        self.inner()
            .map(|inner| inner.brokers.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// Advisors currently kept for a table.
    pub fn advisor_count(&self, broker: &str, table: &str) -> usize {
        self.inner()
            .and_then(|inner| inner.brokers.get(broker).map(|b| b.advisor_count(table)))
            .unwrap_or(0)
    }

    /// Subscriptions being served for a table, excluding queued ones.
    pub fn subscription_count(&self, broker: &str, table: &str) -> usize {
        self.inner()
            .and_then(|inner| inner.brokers.get(broker).map(|b| b.subscription_count(table)))
            .unwrap_or(0)
    }

    /// Input-location requests waiting for the synthesized table.
    pub fn queued_count(&self, broker: &str) -> usize {
        self.inner()
            .and_then(|inner| inner.brokers.get(broker).map(|b| b.queued_count()))
            .unwrap_or(0)
    }

    /// Whether a restart is scheduled for any step of a broker.
    pub fn restart_pending(&self, broker: &str) -> bool {
        self.inner()
            .and_then(|inner| inner.brokers.get(broker).map(|b| b.restart_pending()))
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use cora_core::protocol::messages::broker;
    use cora_core::protocol::{ValueDesc, ValueType};
    use cora_test_utils::{FakeServer, fake_runtime};
    use tokio::time::Instant;

    use super::*;

    #[derive(Default)]
    struct Recorder {
        ready: usize,
        records: usize,
        failures: Vec<SubscriptionFailure>,
    }

    impl DataSubscriber for Recorder {
        fn on_advise_ready(&mut self, _request: &DataRequest, _description: Rc<RecordDescription>) {
            self.ready += 1;
        }
        fn on_advise_records(&mut self, _request: &DataRequest, batch: Rc<RecordBatch>, _more: bool) {
            self.records += batch.len();
        }
        fn on_advise_failure(&mut self, _request: &DataRequest, failure: SubscriptionFailure) {
            self.failures.push(failure);
        }
    }

    fn setup(auto_restart: bool) -> (FakeServer, DataManager) {
        let (runtime, mut server) = fake_runtime();
        server.add_broker(
            "ws1",
            vec![RecordDescription::new(
                "ws1",
                "Status",
                vec![ValueDesc::scalar("Battery", ValueType::Ieee4)],
            )],
        );
        let config = DataManagerConfig::default()
            .with_auto_restart(auto_restart)
            .with_restart_interval(Duration::from_secs(10));
        let manager = DataManager::new(runtime, LogonConfig::default(), config);
        (server, manager)
    }

    fn subscribe(manager: &DataManager, request: &DataRequest) -> Rc<RefCell<Recorder>> {
        let recorder = Rc::new(RefCell::new(Recorder::default()));
        let subscriber: SubscriberRef = Rc::downgrade(&recorder) as _;
        manager.add_data_request(request.clone(), subscriber).unwrap();
        recorder
    }

    fn only_advisor(manager: &DataManager) -> AdvisorId {
        let inner = manager.inner.borrow();
        inner.brokers["ws1"].advisor_ids("Status")[0]
    }

    #[test]
    fn repeated_failure_keeps_one_restart_timer() {
        let (mut server, manager) = setup(true);
        let request = DataRequest::new("ws1", "Status", StartSpec::real_time());
        let recorder = subscribe(&manager, &request);
        server.pump();
        assert_eq!(recorder.borrow().ready, 1);

        server.fail_advises("ws1", "Status", broker::ADVISE_TABLE_DELETED);
        assert_eq!(server.runtime().armed_timer_count(), 1);

        let id = only_advisor(&manager);
        let weak = Rc::downgrade(&manager.inner);
        with_broker(&weak, "ws1", |broker, shared| {
            broker.on_advise_failure(shared, "Status", id, AdviseFailure::Unknown)
        });
        server.runtime().run_pending();
        assert_eq!(server.runtime().armed_timer_count(), 1);
        assert_eq!(
            recorder.borrow().failures,
            [SubscriptionFailure::TableDeleted, SubscriptionFailure::Unknown]
        );
        assert!(manager.restart_pending("ws1"));

        server
            .runtime()
            .expire_timers(Instant::now() + Duration::from_secs(11));
        server.pump();
        assert_eq!(recorder.borrow().ready, 2);
        assert!(!manager.restart_pending("ws1"));
    }

    #[test]
    fn stale_timer_is_ignored() {
        let (mut server, manager) = setup(true);
        let request = DataRequest::new("ws1", "Status", StartSpec::real_time());
        let recorder = subscribe(&manager, &request);
        server.pump();
        server.fail_advises("ws1", "Status", broker::ADVISE_TABLE_DELETED);

        let id = only_advisor(&manager);
        let weak = Rc::downgrade(&manager.inner);
        let stale = server.runtime().arm_timer(manager.inner.borrow().shared.id, Duration::ZERO, |_| {});
        with_broker(&weak, "ws1", |broker, shared| {
            broker.on_restart_timer(
                shared,
                RestartStep::Advisor {
                    table: "Status".into(),
                    id,
                },
                stale,
            )
        });
        server.pump();
        assert_eq!(recorder.borrow().ready, 1);
        assert!(manager.restart_pending("ws1"));
    }

    #[test]
    fn without_auto_restart_failure_is_forwarded_once() {
        let (mut server, manager) = setup(false);
        let request = DataRequest::new("ws1", "Status", StartSpec::real_time());
        let first = subscribe(&manager, &request);
        let second = subscribe(&manager, &request);
        server.pump();

        server.fail_advises("ws1", "Status", broker::ADVISE_TABLE_DELETED);
        assert_eq!(server.runtime().armed_timer_count(), 0);
        assert_eq!(first.borrow().failures, [SubscriptionFailure::TableDeleted]);
        assert_eq!(second.borrow().failures, [SubscriptionFailure::TableDeleted]);
        assert_eq!(manager.advisor_count("ws1", "Status"), 1);
    }

    #[test]
    fn dropping_the_manager_stops_everything() {
        let (mut server, manager) = setup(true);
        let request = DataRequest::new("ws1", "Status", StartSpec::real_time());
        let _recorder = subscribe(&manager, &request);
        server.pump();
        assert_eq!(server.active_advises("ws1", "Status"), 1);

        drop(manager);
        server.pump();
        assert!(server.handle().open_sessions().is_empty());
        assert_eq!(server.handle().count_of_type(broker::DATA_ADVISE_STOP_CMD), 1);
    }
}
