//! Resource listing on the net session.
//!
//! A [`ResourceEnumerator`] logs on, asks the server for the list of brokers,
//! devices or PakBus routers and keeps following the incremental change
//! reports the server sends afterwards.

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::fmt;
use std::marker::PhantomData;
use std::rc::{Rc, Weak};

use thiserror::Error;
use tracing::{debug, warn};

use cora_core::constants::OUTCOME_SUCCESS;
use cora_core::protocol::{ChangeCode, CloseReason, Message, SessionNo};
use cora_core::{Error, Finish, Result, Runtime, SessionReceiver};

use super::Liveness;
use crate::config::LogonConfig;
use crate::connection::{Connection, ConnectionEvent, ConnectionFailure};
use crate::context::{Broker, Device, PbRouter, ResourceKind};

/// How a client wants to hear about changes after the initial report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum NotifyMode {
    /// `on_added` / `on_deleted` for every item.
    #[default]
    EachChange,
    /// One `on_changed` with the full list per report.
    AnyChange,
}

/// One entry of a resource list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceInfo {
    pub id: u32,
    pub name: String,
    pub type_code: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum EnumeratorFailure {
    #[error(transparent)]
    Connection(#[from] ConnectionFailure),
    #[error("malformed resource report")]
    Unknown,
}

pub trait EnumeratorClient {
    /// Read once when the enumerator starts.
    fn notify_mode(&self) -> NotifyMode {
        NotifyMode::EachChange
    }

    fn on_started(&mut self, resources: &[ResourceInfo]);

    fn on_added(&mut self, _resource: &ResourceInfo) {}

    fn on_deleted(&mut self, _resource: &ResourceInfo) {}

    fn on_changed(&mut self, _resources: &[ResourceInfo]) {}

    fn on_failure(&mut self, failure: EnumeratorFailure);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnumeratorState {
    Standby,
    Connecting,
    Starting,
    Started,
}

impl fmt::Display for EnumeratorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EnumeratorState::Standby => write!(f, "standby"),
            EnumeratorState::Connecting => write!(f, "connecting"),
            EnumeratorState::Starting => write!(f, "starting"),
            EnumeratorState::Started => write!(f, "started"),
        }
    }
}

pub type BrokerEnumerator = ResourceEnumerator<Broker>;
pub type DeviceEnumerator = ResourceEnumerator<Device>;
pub type PbRouterEnumerator = ResourceEnumerator<PbRouter>;

pub struct ResourceEnumerator<K: ResourceKind> {
    this: Weak<RefCell<Self>>,
    liveness: Liveness,
    connection: Connection,
    client: Option<Weak<RefCell<dyn EnumeratorClient>>>,
    mode: NotifyMode,
    state: EnumeratorState,
    enum_tran: Option<u32>,
    resources: BTreeMap<u32, ResourceInfo>,
    _kind: PhantomData<K>,
}

impl<K: ResourceKind> fmt::Debug for ResourceEnumerator<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResourceEnumerator")
            .field("kind", &K::NAME)
            .field("state", &self.state)
            .field("mode", &self.mode)
            .field("resources", &self.resources.len())
            .finish()
    }
}

impl<K: ResourceKind> ResourceEnumerator<K> {
    pub fn new(runtime: Runtime, logon: LogonConfig) -> Rc<RefCell<Self>> {
        Rc::new_cyclic(|this| {
            RefCell::new(Self {
                this: this.clone(),
                liveness: Liveness::new(&runtime),
                connection: Connection::new(runtime, logon),
                client: None,
                mode: NotifyMode::default(),
                state: EnumeratorState::Standby,
                enum_tran: None,
                resources: BTreeMap::new(),
                _kind: PhantomData,
            })
        })
    }

    pub fn state(&self) -> EnumeratorState {
        self.state
    }

    pub fn mode(&self) -> NotifyMode {
        self.mode
    }

    pub fn connection(&self) -> &Connection {
        &self.connection
    }

    /// Current list, ordered by id.
    pub fn resources(&self) -> Vec<ResourceInfo> {
        self.resources.values().cloned().collect()
    }

    fn prepare_start(&mut self, client: Weak<RefCell<dyn EnumeratorClient>>) -> Result<()> {
        if self.state != EnumeratorState::Standby {
            return Err(Error::InvalidState {
                expected: EnumeratorState::Standby.to_string(),
                actual: self.state.to_string(),
            });
        }
        let Some(strong) = client.upgrade() else {
            return Err(Error::InvalidArgument {
                message: "enumerator client is gone".into(),
            });
        };
        // The mode is fixed for the lifetime of this run.
        self.mode = strong
            .try_borrow()
            .map(|c| c.notify_mode())
            .unwrap_or_default();
        self.client = Some(client);
        self.state = EnumeratorState::Connecting;
        Ok(())
    }

    pub fn start(&mut self, client: Weak<RefCell<dyn EnumeratorClient>>) -> Result<()> {
        self.prepare_start(client)?;
        let receiver: Weak<RefCell<dyn SessionReceiver>> = self.this.clone();
        if let Err(e) = self.connection.start(receiver) {
            self.finish();
            return Err(e);
        }
        Ok(())
    }

    /// Start on the logon of an already ready connection.
    pub fn start_from(
        &mut self,
        other: &Connection,
        client: Weak<RefCell<dyn EnumeratorClient>>,
        use_own_logon: bool,
    ) -> Result<()> {
        self.prepare_start(client)?;
        let receiver: Weak<RefCell<dyn SessionReceiver>> = self.this.clone();
        let ready = match self.connection.start_from(other, receiver, use_own_logon) {
            Ok(ready) => ready,
            Err(e) => {
                self.finish();
                return Err(e);
            }
        };
        if ready {
            if let Err(e) = self.send_start() {
                self.finish();
                return Err(e);
            }
        }
        Ok(())
    }

    pub fn finish(&mut self) {
        if let (Some(tran), Some(session)) = (self.enum_tran.take(), self.connection.net_session()) {
            let mut stop = self.connection.new_command(session, K::ENUM_STOP_CMD);
            stop.add_u4(tran);
            if let Err(e) = self.connection.send(stop) {
                debug!(kind = K::NAME, error = %e, "could not stop enumeration");
            }
        }
        self.connection.finish();
        if self.state != EnumeratorState::Standby {
            debug!(kind = K::NAME, from = %self.state, "enumerator finished");
            self.liveness.renew();
        }
        self.state = EnumeratorState::Standby;
        self.client = None;
        self.resources.clear();
    }

    fn send_start(&mut self) -> Result<()> {
        let session = self.connection.net_session().ok_or(Error::SessionClosed)?;
        let msg = self.connection.new_command(session, K::ENUM_START_CMD);
        self.enum_tran = msg.tran_no();
        self.state = EnumeratorState::Starting;
        self.connection.send(msg)
    }

    fn fail(&mut self, failure: EnumeratorFailure) {
        warn!(kind = K::NAME, state = %self.state, failure = %failure, "enumerator failed");
        let client = self.client.clone();
        self.finish();
        if let Some(client) = client {
            self.liveness_post(client, move |c| c.on_failure(failure));
        }
    }

    fn post(&self, deliver: impl FnOnce(&mut (dyn EnumeratorClient + 'static)) + 'static) {
        if let Some(client) = self.client.clone() {
            self.liveness_post(client, deliver);
        }
    }

    fn liveness_post(
        &self,
        client: Weak<RefCell<dyn EnumeratorClient>>,
        deliver: impl FnOnce(&mut (dyn EnumeratorClient + 'static)) + 'static,
    ) {
        self.connection
            .runtime()
            .post_to_client(self.liveness.id(), self.this.clone(), client, deliver);
    }

    fn on_event(&mut self, event: ConnectionEvent) {
        match event {
            ConnectionEvent::Ready => {
                if let Err(e) = self.send_start() {
                    warn!(error = %e, "could not start enumeration");
                    self.fail(ConnectionFailure::Session.into());
                }
            }
            ConnectionEvent::Failed(failure) => self.fail(failure.into()),
            ConnectionEvent::SessionFailed => self.fail(ConnectionFailure::Session.into()),
            ConnectionEvent::Message(msg) => self.on_report(msg),
        }
    }

    fn on_report(&mut self, mut msg: Message) {
        if msg.message_type() != K::ENUM_NOT || msg.tran_no() != self.enum_tran {
            debug!(kind = K::NAME, message_type = msg.message_type(), "ignoring message");
            return;
        }
        // Decode completely before touching the list.
        let changes = match read_report(&mut msg) {
            Ok(Some(changes)) => changes,
            Ok(None) => return self.fail(EnumeratorFailure::Unknown),
            Err(e) => {
                debug!(kind = K::NAME, error = %e, "malformed resource report");
                return self.fail(EnumeratorFailure::Unknown);
            }
        };

        let first = self.state == EnumeratorState::Starting;
        let mut changed = false;
        for (change, info) in changes {
            match change {
                ChangeCode::Added => {
                    if !first && self.mode == NotifyMode::EachChange {
                        let added = info.clone();
                        self.post(move |c| c.on_added(&added));
                    }
                    self.resources.insert(info.id, info);
                }
                ChangeCode::Deleted => {
                    if let Some(removed) = self.resources.remove(&info.id) {
                        if !first && self.mode == NotifyMode::EachChange {
                            self.post(move |c| c.on_deleted(&removed));
                        }
                    }
                }
            }
            changed = true;
        }

        let all = self.resources();
        if first {
            self.state = EnumeratorState::Started;
            debug!(kind = K::NAME, count = all.len(), "enumeration started");
            self.post(move |c| c.on_started(&all));
        } else if changed && self.mode == NotifyMode::AnyChange {
            self.post(move |c| c.on_changed(&all));
        }
    }
}

/// Decode one report. `None` means the server refused the enumeration.
fn read_report(msg: &mut Message) -> Result<Option<Vec<(ChangeCode, ResourceInfo)>>> {
    msg.read_u4()?;
    if msg.read_u4()? != OUTCOME_SUCCESS {
        return Ok(None);
    }
    let count = msg.read_u4()?;
    let mut changes = Vec::new();
    for _ in 0..count {
        let code = msg.read_u4()?;
        let id = msg.read_u4()?;
        let name = msg.read_str()?;
        let type_code = msg.read_u4()?;
        match ChangeCode::from_code(code) {
            Some(change) => changes.push((change, ResourceInfo { id, name, type_code })),
            None => debug!(code, id, "skipping item with unknown change code"),
        }
    }
    Ok(Some(changes))
}

impl<K: ResourceKind> SessionReceiver for ResourceEnumerator<K> {
    fn on_message(&mut self, msg: Message) {
        if let Some(event) = self.connection.handle_message(msg) {
            self.on_event(event);
        }
    }

    fn on_session_broken(&mut self, session: SessionNo, reason: CloseReason) {
        if let Some(event) = self.connection.handle_session_broken(session, reason) {
            self.on_event(event);
        }
    }
}

impl<K: ResourceKind> Finish for ResourceEnumerator<K> {
    fn finish(&mut self) {
        ResourceEnumerator::finish(self);
    }
}

impl<K: ResourceKind> Drop for ResourceEnumerator<K> {
    fn drop(&mut self) {
        self.finish();
    }
}

#[cfg(test)]
mod tests {
    use cora_core::protocol::messages::lgrnet;
    use cora_test_utils::{FakeServer, ResourceType, fake_runtime};

    use super::*;

    #[derive(Default)]
    struct Recorder {
        mode: NotifyMode,
        started: Vec<Vec<ResourceInfo>>,
        added: Vec<String>,
        deleted: Vec<String>,
        changed: Vec<usize>,
        failures: Vec<EnumeratorFailure>,
    }

    impl EnumeratorClient for Recorder {
        fn notify_mode(&self) -> NotifyMode {
            self.mode
        }
        fn on_started(&mut self, resources: &[ResourceInfo]) {
            self.started.push(resources.to_vec());
        }
        fn on_added(&mut self, resource: &ResourceInfo) {
            self.added.push(resource.name.clone());
        }
        fn on_deleted(&mut self, resource: &ResourceInfo) {
            self.deleted.push(resource.name.clone());
        }
        fn on_changed(&mut self, resources: &[ResourceInfo]) {
            self.changed.push(resources.len());
        }
        fn on_failure(&mut self, failure: EnumeratorFailure) {
            self.failures.push(failure);
        }
    }

    fn started(
        mode: NotifyMode,
    ) -> (FakeServer, Rc<RefCell<BrokerEnumerator>>, Rc<RefCell<Recorder>>) {
        let (runtime, mut server) = fake_runtime();
        server.add_broker("ws1", Vec::new());
        server.add_broker("ws2", Vec::new());
        let enumerator = BrokerEnumerator::new(runtime, LogonConfig::default());
        let recorder = Rc::new(RefCell::new(Recorder {
            mode,
            ..Recorder::default()
        }));
        let client: Weak<RefCell<dyn EnumeratorClient>> = Rc::downgrade(&recorder) as _;
        enumerator.borrow_mut().start(client).unwrap();
        server.pump();
        (server, enumerator, recorder)
    }

    #[test]
    fn initial_report_then_each_change() {
        let (mut server, enumerator, recorder) = started(NotifyMode::EachChange);
        assert_eq!(enumerator.borrow().state(), EnumeratorState::Started);
        let names: Vec<_> = recorder.borrow().started[0].iter().map(|r| r.name.clone()).collect();
        assert_eq!(names, ["ws1", "ws2"]);

        server.add_broker("ws3", Vec::new());
        server.remove_resource(ResourceType::Broker, "ws1");
        let recorder = recorder.borrow();
        assert_eq!(recorder.added, ["ws3"]);
        assert_eq!(recorder.deleted, ["ws1"]);
        assert!(recorder.changed.is_empty());
        assert_eq!(enumerator.borrow().resources().len(), 2);
    }

    #[test]
    fn any_change_mode_reports_full_list() {
        let (mut server, _enumerator, recorder) = started(NotifyMode::AnyChange);
        server.add_broker("ws3", Vec::new());
        let recorder = recorder.borrow();
        assert_eq!(recorder.changed, [3]);
        assert!(recorder.added.is_empty());
    }

    #[test]
    fn mode_is_not_reread_after_start() {
        let (mut server, _enumerator, recorder) = started(NotifyMode::EachChange);
        recorder.borrow_mut().mode = NotifyMode::AnyChange;
        server.add_broker("ws3", Vec::new());
        assert_eq!(recorder.borrow().added, ["ws3"]);
        assert!(recorder.borrow().changed.is_empty());
    }

    #[test]
    fn malformed_report_applies_nothing() {
        let (mut server, enumerator, recorder) = started(NotifyMode::EachChange);
        let session = enumerator.borrow().connection().net_session().unwrap();
        let tran = enumerator.borrow().enum_tran.unwrap();

        let mut bad = Message::command(session, lgrnet::BROKERS_ENUM_NOT, tran);
        bad.add_u4(OUTCOME_SUCCESS);
        bad.add_u4(2);
        bad.add_u4(1);
        bad.add_u4(50);
        bad.add_str("ws50");
        bad.add_u4(0);
        // Second item truncated.
        bad.add_u4(1);
        server.deliver(bad);

        let recorder = recorder.borrow();
        assert_eq!(recorder.failures, [EnumeratorFailure::Unknown]);
        assert!(recorder.added.is_empty());
        assert_eq!(enumerator.borrow().state(), EnumeratorState::Standby);
    }

    #[test]
    fn finish_stops_enumeration() {
        let (server, enumerator, _recorder) = started(NotifyMode::EachChange);
        enumerator.borrow_mut().finish();
        enumerator.borrow_mut().finish();
        assert_eq!(server.handle().count_of_type(lgrnet::BROKERS_ENUM_STOP_CMD), 1);
        assert!(server.handle().open_sessions().is_empty());
    }

    #[test]
    fn dropped_client_finishes_enumerator() {
        let (mut server, enumerator, recorder) = started(NotifyMode::EachChange);
        drop(recorder);
        server.add_broker("ws3", Vec::new());
        assert_eq!(enumerator.borrow().state(), EnumeratorState::Standby);
    }

    #[test]
    fn start_twice_is_invalid_state() {
        let (server, enumerator, recorder) = started(NotifyMode::EachChange);
        let sent = server.handle().sent_count();
        let client: Weak<RefCell<dyn EnumeratorClient>> = Rc::downgrade(&recorder) as _;
        let err = enumerator.borrow_mut().start(client).unwrap_err();
        assert!(matches!(err, Error::InvalidState { .. }));
        assert_eq!(server.handle().sent_count(), sent);
    }
}
