//! Temporary collect area on a device.
//!
//! A [`CollectAreaMaintainer`] creates a named collect area covering a set
//! of device field ids and keeps it in step with later field-set changes. The
//! area lives as long as the device session: finishing the maintainer lets
//! the server drop it.

use std::cell::RefCell;
use std::collections::BTreeSet;
use std::fmt;
use std::rc::{Rc, Weak};

use thiserror::Error;
use tracing::{debug, info, warn};

use cora_core::constants::OUTCOME_SUCCESS;
use cora_core::protocol::messages::device;
use cora_core::protocol::{CloseReason, Message, SessionNo};
use cora_core::{Error, Finish, Result, Runtime, SessionReceiver};

use super::Liveness;
use crate::config::LogonConfig;
use crate::connection::Connection;
use crate::context::{ContextEvent, ContextFailure, DeviceContext};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Error)]
pub enum CollectAreaFailure {
    #[error(transparent)]
    Context(#[from] ContextFailure),
    #[error("field id not valid for the device")]
    InvalidField,
    #[error("collect area name already in use")]
    NameInUse,
    #[error("unknown failure")]
    Unknown,
}

impl CollectAreaFailure {
    fn from_outcome(outcome: u32) -> Self {
        match outcome {
            device::AREA_INVALID_FIELD => CollectAreaFailure::InvalidField,
            device::AREA_NAME_IN_USE => CollectAreaFailure::NameInUse,
            _ => CollectAreaFailure::Unknown,
        }
    }
}

pub trait CollectAreaClient {
    /// The area exists with the fields requested so far.
    fn on_ready(&mut self);

    /// A field-set update was applied.
    fn on_changed(&mut self) {}

    fn on_failure(&mut self, failure: CollectAreaFailure);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MaintainerState {
    Standby,
    Connecting,
    Creating,
    Ready,
}

impl fmt::Display for MaintainerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            MaintainerState::Standby => "standby",
            MaintainerState::Connecting => "connecting",
            MaintainerState::Creating => "creating",
            MaintainerState::Ready => "ready",
        };
        f.write_str(text)
    }
}

pub struct CollectAreaMaintainer {
    this: Weak<RefCell<Self>>,
    liveness: Liveness,
    context: DeviceContext,
    client: Option<Weak<RefCell<dyn CollectAreaClient>>>,
    area_name: String,
    fields: BTreeSet<u32>,
    state: MaintainerState,
    pending_tran: Option<u32>,
    /// Field set changed while a command was in flight.
    dirty: bool,
}

impl fmt::Debug for CollectAreaMaintainer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CollectAreaMaintainer")
            .field("state", &self.state)
            .field("device", &self.context.name())
            .field("area", &self.area_name)
            .field("fields", &self.fields)
            .finish()
    }
}

impl CollectAreaMaintainer {
    pub fn new(runtime: Runtime, logon: LogonConfig) -> Rc<RefCell<Self>> {
        Rc::new_cyclic(|this| {
            RefCell::new(Self {
                this: this.clone(),
                liveness: Liveness::new(&runtime),
                context: DeviceContext::new(runtime, logon),
                client: None,
                area_name: String::new(),
                fields: BTreeSet::new(),
                state: MaintainerState::Standby,
                pending_tran: None,
                dirty: false,
            })
        })
    }

    pub fn state(&self) -> MaintainerState {
        self.state
    }

    pub fn context(&self) -> &DeviceContext {
        &self.context
    }

    pub fn area_name(&self) -> &str {
        &self.area_name
    }

    pub fn fields(&self) -> impl Iterator<Item = u32> + '_ {
        self.fields.iter().copied()
    }

    /// Whether an update is waiting for the server.
    pub fn is_updating(&self) -> bool {
        self.state == MaintainerState::Ready && self.pending_tran.is_some()
    }

    fn require_standby(&self) -> Result<()> {
        if self.state != MaintainerState::Standby {
            return Err(Error::InvalidState {
                expected: MaintainerState::Standby.to_string(),
                actual: self.state.to_string(),
            });
        }
        Ok(())
    }

    pub fn set_device_name(&mut self, name: impl Into<String>) -> Result<()> {
        self.require_standby()?;
        self.context.set_name(name)
    }

    pub fn set_area_name(&mut self, name: impl Into<String>) -> Result<()> {
        self.require_standby()?;
        self.area_name = name.into();
        Ok(())
    }

    /// Replace the field set. Once the area exists the change is sent to the
    /// server, after any update already in flight.
    pub fn set_fields(&mut self, fields: impl IntoIterator<Item = u32>) -> Result<()> {
        let fields: BTreeSet<u32> = fields.into_iter().collect();
        if fields == self.fields {
            return Ok(());
        }
        self.fields = fields;
        self.fields_changed()
    }

    pub fn add_field(&mut self, field: u32) -> Result<()> {
        if !self.fields.insert(field) {
            return Ok(());
        }
        self.fields_changed()
    }

    pub fn remove_field(&mut self, field: u32) -> Result<()> {
        if !self.fields.remove(&field) {
            return Ok(());
        }
        self.fields_changed()
    }

    fn fields_changed(&mut self) -> Result<()> {
        match self.state {
            MaintainerState::Ready if self.pending_tran.is_none() => self.send_update(),
            MaintainerState::Ready | MaintainerState::Creating => {
                self.dirty = true;
                Ok(())
            }
            MaintainerState::Standby | MaintainerState::Connecting => Ok(()),
        }
    }

    fn prepare_start(&mut self, client: Weak<RefCell<dyn CollectAreaClient>>) -> Result<()> {
        self.require_standby()?;
        if self.area_name.is_empty() {
            return Err(Error::InvalidArgument {
                message: "collect area name must be set".into(),
            });
        }
        if client.upgrade().is_none() {
            return Err(Error::InvalidArgument {
                message: "collect area client is gone".into(),
            });
        }
        self.client = Some(client);
        self.state = MaintainerState::Connecting;
        Ok(())
    }

    pub fn start(&mut self, client: Weak<RefCell<dyn CollectAreaClient>>) -> Result<()> {
        self.prepare_start(client)?;
        let receiver: Weak<RefCell<dyn SessionReceiver>> = self.this.clone();
        if let Err(e) = self.context.start(receiver) {
            self.finish();
            return Err(e);
        }
        Ok(())
    }

    pub fn start_from(
        &mut self,
        other: &Connection,
        client: Weak<RefCell<dyn CollectAreaClient>>,
        use_own_logon: bool,
    ) -> Result<()> {
        self.prepare_start(client)?;
        let receiver: Weak<RefCell<dyn SessionReceiver>> = self.this.clone();
        if let Err(e) = self.context.start_from(other, receiver, use_own_logon) {
            self.finish();
            return Err(e);
        }
        Ok(())
    }

    pub fn finish(&mut self) {
        self.context.finish();
        if self.state != MaintainerState::Standby {
            debug!(area = %self.area_name, from = %self.state, "collect area maintainer finished");
            self.liveness.renew();
        }
        self.state = MaintainerState::Standby;
        self.client = None;
        self.pending_tran = None;
        self.dirty = false;
    }

    fn post(&self, deliver: impl FnOnce(&mut (dyn CollectAreaClient + 'static)) + 'static) {
        if let Some(client) = self.client.clone() {
            self.context
                .runtime()
                .post_to_client(self.liveness.id(), self.this.clone(), client, deliver);
        }
    }

    fn fail(&mut self, failure: CollectAreaFailure) {
        warn!(
            device = %self.context.name(),
            area = %self.area_name,
            state = %self.state,
            failure = %failure,
            "collect area failed"
        );
        let client = self.client.clone();
        self.finish();
        if let Some(client) = client {
            self.context.runtime().post_to_client(
                self.liveness.id(),
                self.this.clone(),
                client,
                move |c| c.on_failure(failure),
            );
        }
    }

    fn send_fields(&mut self, message_type: u32, with_name: bool) -> Result<()> {
        let mut msg = self.context.new_command(message_type)?;
        if with_name {
            msg.add_str(&self.area_name);
        }
        msg.add_u4(self.fields.len() as u32);
        for field in &self.fields {
            msg.add_u4(*field);
        }
        self.pending_tran = msg.tran_no();
        self.dirty = false;
        self.context.send(msg)
    }

    fn send_update(&mut self) -> Result<()> {
        debug!(area = %self.area_name, fields = self.fields.len(), "updating collect area");
        self.send_fields(device::COLLECT_AREA_UPDATE_CMD, false)
    }

    fn on_context_ready(&mut self) {
        match self.send_fields(device::COLLECT_AREA_CREATE_CMD, true) {
            Ok(()) => self.state = MaintainerState::Creating,
            Err(e) => {
                warn!(error = %e, "could not create collect area");
                self.fail(ContextFailure::Session.into());
            }
        }
    }

    fn on_device_message(&mut self, mut msg: Message) {
        let expected = match self.state {
            MaintainerState::Creating => device::COLLECT_AREA_CREATE_ACK,
            MaintainerState::Ready => device::COLLECT_AREA_UPDATE_ACK,
            _ => return,
        };
        if msg.message_type() != expected || msg.tran_no() != self.pending_tran {
            debug!(message_type = msg.message_type(), "ignoring device message");
            return;
        }
        self.pending_tran = None;
        let outcome = match msg.read_u4().and_then(|_| msg.read_u4()) {
            Ok(outcome) => outcome,
            Err(_) => return self.fail(CollectAreaFailure::Unknown),
        };
        if outcome != OUTCOME_SUCCESS {
            return self.fail(CollectAreaFailure::from_outcome(outcome));
        }

        if self.state == MaintainerState::Creating {
            self.state = MaintainerState::Ready;
            info!(device = %self.context.resolved_name(), area = %self.area_name, "collect area created");
            self.post(|c| c.on_ready());
        } else {
            self.post(|c| c.on_changed());
        }
        if self.dirty {
            if let Err(e) = self.send_update() {
                warn!(error = %e, "could not update collect area");
                self.fail(ContextFailure::Session.into());
            }
        }
    }
}

impl SessionReceiver for CollectAreaMaintainer {
    fn on_message(&mut self, msg: Message) {
        match self.context.handle_message(msg) {
            Some(ContextEvent::Ready) => self.on_context_ready(),
            Some(ContextEvent::Failed(failure)) => self.fail(failure.into()),
            Some(ContextEvent::Message(msg)) => self.on_device_message(msg),
            Some(ContextEvent::NetMessage(_)) | None => {}
        }
    }

    fn on_session_broken(&mut self, session: SessionNo, reason: CloseReason) {
        if let Some(ContextEvent::Failed(failure)) = self.context.handle_session_broken(session, reason) {
            self.fail(failure.into());
        }
    }
}

impl Finish for CollectAreaMaintainer {
    fn finish(&mut self) {
        CollectAreaMaintainer::finish(self);
    }
}

impl Drop for CollectAreaMaintainer {
    fn drop(&mut self) {
        self.finish();
    }
}

#[cfg(test)]
mod tests {
    use cora_core::constants::CLASSIC_INLOCS_TABLE;
    use cora_test_utils::{FakeServer, fake_runtime};

    use super::*;

    #[derive(Default)]
    struct Recorder {
        ready: usize,
        changed: usize,
        failures: Vec<CollectAreaFailure>,
    }

    impl CollectAreaClient for Recorder {
        fn on_ready(&mut self) {
            self.ready += 1;
        }
        fn on_changed(&mut self) {
            self.changed += 1;
        }
        fn on_failure(&mut self, failure: CollectAreaFailure) {
            self.failures.push(failure);
        }
    }

    fn maintainer(
        fields: &[u32],
    ) -> (FakeServer, Rc<RefCell<CollectAreaMaintainer>>, Rc<RefCell<Recorder>>) {
        let (runtime, mut server) = fake_runtime();
        server.add_device("cr10x", Some(vec!["Temp".into(), "RH".into(), "Wind".into()]));
        let maintainer = CollectAreaMaintainer::new(runtime, LogonConfig::default());
        {
            let mut m = maintainer.borrow_mut();
            m.set_device_name("cr10x").unwrap();
            m.set_area_name(CLASSIC_INLOCS_TABLE).unwrap();
            m.set_fields(fields.iter().copied()).unwrap();
        }
        let recorder = Rc::new(RefCell::new(Recorder::default()));
        let client: Weak<RefCell<dyn CollectAreaClient>> = Rc::downgrade(&recorder) as _;
        maintainer.borrow_mut().start(client).unwrap();
        (server, maintainer, recorder)
    }

    #[test]
    fn creates_area_with_fields() {
        let (mut server, maintainer, recorder) = maintainer(&[2, 1]);
        server.pump();
        assert_eq!(recorder.borrow().ready, 1);
        assert_eq!(maintainer.borrow().state(), MaintainerState::Ready);

        let mut create = server.handle().sent_of_type(device::COLLECT_AREA_CREATE_CMD)[0].clone();
        create.read_u4().unwrap();
        assert_eq!(create.read_str().unwrap(), CLASSIC_INLOCS_TABLE);
        assert_eq!(create.read_u4().unwrap(), 2);
        assert_eq!(create.read_u4().unwrap(), 1);
        assert_eq!(create.read_u4().unwrap(), 2);
    }

    #[test]
    fn updates_are_coalesced_while_in_flight() {
        let (mut server, maintainer, recorder) = maintainer(&[1]);
        server.pump();

        server.hold(device::COLLECT_AREA_UPDATE_CMD);
        maintainer.borrow_mut().add_field(2).unwrap();
        assert!(maintainer.borrow().is_updating());
        maintainer.borrow_mut().add_field(3).unwrap();
        maintainer.borrow_mut().remove_field(1).unwrap();
        server.pump();
        assert_eq!(server.handle().count_of_type(device::COLLECT_AREA_UPDATE_CMD), 1);

        server.release(device::COLLECT_AREA_UPDATE_CMD);
        server.pump();
        let updates = server.handle().sent_of_type(device::COLLECT_AREA_UPDATE_CMD);
        assert_eq!(updates.len(), 2);
        let mut last = updates[1].clone();
        last.read_u4().unwrap();
        assert_eq!(last.read_u4().unwrap(), 2);
        assert_eq!(last.read_u4().unwrap(), 2);
        assert_eq!(last.read_u4().unwrap(), 3);
        assert_eq!(recorder.borrow().changed, 2);
    }

    #[test]
    fn unchanged_field_set_sends_nothing() {
        let (mut server, maintainer, _recorder) = maintainer(&[1, 2]);
        server.pump();
        let sent = server.handle().sent_count();
        maintainer.borrow_mut().set_fields([2, 1]).unwrap();
        maintainer.borrow_mut().add_field(1).unwrap();
        assert_eq!(server.handle().sent_count(), sent);
    }

    #[test]
    fn invalid_field_fails() {
        let (mut server, maintainer, recorder) = maintainer(&[7]);
        server.pump();
        assert_eq!(recorder.borrow().failures, [CollectAreaFailure::InvalidField]);
        assert_eq!(maintainer.borrow().state(), MaintainerState::Standby);
        assert!(server.handle().open_sessions().is_empty());
    }

    #[test]
    fn name_in_use_fails() {
        let (mut server, _maintainer, recorder) = maintainer(&[1]);
        server.fail_next(device::COLLECT_AREA_CREATE_CMD, device::AREA_NAME_IN_USE);
        server.pump();
        assert_eq!(recorder.borrow().failures, [CollectAreaFailure::NameInUse]);
    }

    #[test]
    fn start_requires_area_name() {
        let (runtime, server) = fake_runtime();
        let maintainer = CollectAreaMaintainer::new(runtime, LogonConfig::default());
        maintainer.borrow_mut().set_device_name("cr10x").unwrap();
        let recorder = Rc::new(RefCell::new(Recorder::default()));
        let client: Weak<RefCell<dyn CollectAreaClient>> = Rc::downgrade(&recorder) as _;
        let err = maintainer.borrow_mut().start(client).unwrap_err();
        assert!(matches!(err, Error::InvalidArgument { .. }));
        assert_eq!(server.handle().event_count(), 0);
    }
}
