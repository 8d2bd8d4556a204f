//! Resource contexts: attachment to a named server resource.
//!
//! A [`ResourceContext`] layers on a [`Connection`]. Once the connection is
//! logged on it opens a resource session and sends an open command by name
//! or by id. Brokers, devices and PakBus routers differ only in their message
//! codes and in how a missing object is reported, captured by
//! [`ResourceKind`].
//!
//! State flow: `Standby -> Delegate -> Attach(Opening | Resolving) -> Ready`,
//! back to `Standby` on failure or [`ResourceContext::finish`].

use std::cell::RefCell;
use std::fmt;
use std::marker::PhantomData;
use std::rc::Weak;

use thiserror::Error;
use tracing::{debug, info, warn};

use cora_core::constants::OUTCOME_SUCCESS;
use cora_core::protocol::messages::{lgrnet, router};
use cora_core::protocol::{ChangeCode, CloseReason, Message, SessionNo};
use cora_core::{Error, Result, Runtime, SessionReceiver};

use crate::config::LogonConfig;
use crate::connection::{Connection, ConnectionEvent, ConnectionFailure};

// =============================================================================
// Resource kinds
// =============================================================================

/// Message codes and rules of one resource family.
pub trait ResourceKind: 'static {
    const NAME: &'static str;
    const OPEN_BY_NAME_CMD: u32;
    const OPEN_BY_NAME_ACK: u32;
    const OPEN_BY_ID_CMD: u32;
    const OPEN_BY_ID_ACK: u32;
    const ENUM_START_CMD: u32;
    const ENUM_NOT: u32;
    const ENUM_STOP_CMD: u32;
    /// A resource session closed with "no such object" means the name was
    /// not found.
    const MISSING_OBJECT_IS_NAME_FAILURE: bool;
}

/// Data broker resources.
#[derive(Debug, Clone, Copy)]
pub struct Broker;

/// Device resources.
#[derive(Debug, Clone, Copy)]
pub struct Device;

/// PakBus router resources.
#[derive(Debug, Clone, Copy)]
pub struct PbRouter;

impl ResourceKind for Broker {
    const NAME: &'static str = "broker";
    const OPEN_BY_NAME_CMD: u32 = lgrnet::OPEN_BROKER_CMD;
    const OPEN_BY_NAME_ACK: u32 = lgrnet::OPEN_BROKER_ACK;
    const OPEN_BY_ID_CMD: u32 = lgrnet::OPEN_BROKER_BY_ID_CMD;
    const OPEN_BY_ID_ACK: u32 = lgrnet::OPEN_BROKER_BY_ID_ACK;
    const ENUM_START_CMD: u32 = lgrnet::BROKERS_ENUM_CMD;
    const ENUM_NOT: u32 = lgrnet::BROKERS_ENUM_NOT;
    const ENUM_STOP_CMD: u32 = lgrnet::BROKERS_ENUM_STOP_CMD;
    const MISSING_OBJECT_IS_NAME_FAILURE: bool = false;
}

impl ResourceKind for Device {
    const NAME: &'static str = "device";
    const OPEN_BY_NAME_CMD: u32 = lgrnet::OPEN_DEVICE_CMD;
    const OPEN_BY_NAME_ACK: u32 = lgrnet::OPEN_DEVICE_ACK;
    const OPEN_BY_ID_CMD: u32 = lgrnet::OPEN_DEVICE_BY_ID_CMD;
    const OPEN_BY_ID_ACK: u32 = lgrnet::OPEN_DEVICE_BY_ID_ACK;
    const ENUM_START_CMD: u32 = lgrnet::DEVICES_ENUM_CMD;
    const ENUM_NOT: u32 = lgrnet::DEVICES_ENUM_NOT;
    const ENUM_STOP_CMD: u32 = lgrnet::DEVICES_ENUM_STOP_CMD;
    const MISSING_OBJECT_IS_NAME_FAILURE: bool = true;
}

impl ResourceKind for PbRouter {
    const NAME: &'static str = "pakbus router";
    const OPEN_BY_NAME_CMD: u32 = lgrnet::OPEN_ROUTER_CMD;
    const OPEN_BY_NAME_ACK: u32 = lgrnet::OPEN_ROUTER_ACK;
    const OPEN_BY_ID_CMD: u32 = lgrnet::OPEN_ROUTER_BY_ID_CMD;
    const OPEN_BY_ID_ACK: u32 = lgrnet::OPEN_ROUTER_BY_ID_ACK;
    const ENUM_START_CMD: u32 = lgrnet::ROUTERS_ENUM_CMD;
    const ENUM_NOT: u32 = lgrnet::ROUTERS_ENUM_NOT;
    const ENUM_STOP_CMD: u32 = lgrnet::ROUTERS_ENUM_STOP_CMD;
    const MISSING_OBJECT_IS_NAME_FAILURE: bool = false;
}

pub type BrokerContext = ResourceContext<Broker>;
pub type DeviceContext = ResourceContext<Device>;
pub type PbRouterContext = ResourceContext<PbRouter>;

// =============================================================================
// Failures and events
// =============================================================================

/// Why a resource context failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Error)]
pub enum ContextFailure {
    #[error("unknown failure")]
    Unknown,
    #[error("logon rejected")]
    Logon,
    #[error("session failed")]
    Session,
    #[error("server does not support the request")]
    Unsupported,
    #[error("access denied")]
    Security,
    #[error("access token rejected")]
    InvalidAccess,
    #[error("access token expired")]
    AccessExpired,
    #[error("no resource with that name")]
    InvalidName,
    #[error("no resource with that id")]
    InvalidId,
}

impl From<ConnectionFailure> for ContextFailure {
    fn from(failure: ConnectionFailure) -> Self {
        match failure {
            ConnectionFailure::Logon => ContextFailure::Logon,
            ConnectionFailure::Session => ContextFailure::Session,
            ConnectionFailure::Unsupported => ContextFailure::Unsupported,
            ConnectionFailure::Security => ContextFailure::Security,
            ConnectionFailure::InvalidAccess => ContextFailure::InvalidAccess,
            ConnectionFailure::AccessExpired => ContextFailure::AccessExpired,
            ConnectionFailure::Unknown => ContextFailure::Unknown,
        }
    }
}

/// What the owner of a context must react to.
#[derive(Debug, Clone, PartialEq)]
pub enum ContextEvent {
    /// The resource is attached.
    Ready,
    /// The context failed and is back in standby.
    Failed(ContextFailure),
    /// A message on the resource session.
    Message(Message),
    /// A net-session message the context does not consume.
    NetMessage(Message),
}

/// Sub-state while attaching.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttachStage {
    /// Open command sent on the resource session.
    Opening,
    /// Opened by id; enumerating resources to learn the name.
    Resolving,
}

/// Context state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContextState {
    Standby,
    /// Waiting for the connection to log on.
    Delegate,
    Attach(AttachStage),
    Ready,
}

impl fmt::Display for ContextState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ContextState::Standby => write!(f, "standby"),
            ContextState::Delegate => write!(f, "delegate"),
            ContextState::Attach(AttachStage::Opening) => write!(f, "attach (opening)"),
            ContextState::Attach(AttachStage::Resolving) => write!(f, "attach (resolving)"),
            ContextState::Ready => write!(f, "ready"),
        }
    }
}

// =============================================================================
// Resource context
// =============================================================================

/// Attachment to one broker, device or PakBus router.
pub struct ResourceContext<K: ResourceKind> {
    connection: Connection,
    state: ContextState,
    name: String,
    id: Option<u32>,
    resolved_name: String,
    session: Option<SessionNo>,
    access_level: u32,
    pending_tran: Option<u32>,
    receiver: Option<Weak<RefCell<dyn SessionReceiver>>>,
    _kind: PhantomData<K>,
}

impl<K: ResourceKind> fmt::Debug for ResourceContext<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResourceContext")
            .field("kind", &K::NAME)
            .field("state", &self.state)
            .field("name", &self.name)
            .field("id", &self.id)
            .field("session", &self.session)
            .field("connection", &self.connection)
            .finish()
    }
}

impl<K: ResourceKind> ResourceContext<K> {
    pub fn new(runtime: Runtime, logon: LogonConfig) -> Self {
        Self {
            connection: Connection::new(runtime, logon),
            state: ContextState::Standby,
            name: String::new(),
            id: None,
            resolved_name: String::new(),
            session: None,
            access_level: 0,
            pending_tran: None,
            receiver: None,
            _kind: PhantomData,
        }
    }

    pub fn connection(&self) -> &Connection {
        &self.connection
    }

    pub fn connection_mut(&mut self) -> &mut Connection {
        &mut self.connection
    }

    pub fn runtime(&self) -> &Runtime {
        self.connection.runtime()
    }

    pub fn state(&self) -> ContextState {
        self.state
    }

    pub fn is_ready(&self) -> bool {
        self.state == ContextState::Ready
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn id(&self) -> Option<u32> {
        self.id
    }

    /// Canonical name reported by the server once attached.
    pub fn resolved_name(&self) -> &str {
        &self.resolved_name
    }

    /// The resource session, once attached.
    pub fn session(&self) -> Option<SessionNo> {
        self.session
    }

    pub fn access_level(&self) -> u32 {
        self.access_level
    }

    fn require_standby(&self) -> Result<()> {
        if self.state != ContextState::Standby {
            return Err(Error::InvalidState {
                expected: ContextState::Standby.to_string(),
                actual: self.state.to_string(),
            });
        }
        Ok(())
    }

    /// Identify the resource by name. Clears any id.
    pub fn set_name(&mut self, name: impl Into<String>) -> Result<()> {
        self.require_standby()?;
        self.name = name.into();
        self.id = None;
        Ok(())
    }

    /// Identify the resource by id. Clears any name.
    pub fn set_id(&mut self, id: u32) -> Result<()> {
        self.require_standby()?;
        self.id = Some(id);
        self.name.clear();
        Ok(())
    }

    /// Identify the resource by id with an already known name.
    pub fn set_id_with_name(&mut self, id: u32, name: impl Into<String>) -> Result<()> {
        self.require_standby()?;
        self.id = Some(id);
        self.name = name.into();
        Ok(())
    }

    fn prepare_start(&mut self, receiver: &Weak<RefCell<dyn SessionReceiver>>) -> Result<()> {
        self.require_standby()?;
        if self.name.is_empty() && self.id.is_none() {
            return Err(Error::InvalidArgument {
                message: format!("{} name or id must be set", K::NAME),
            });
        }
        self.receiver = Some(receiver.clone());
        self.state = ContextState::Delegate;
        Ok(())
    }

    /// Start the context on its own connection.
    pub fn start(&mut self, receiver: Weak<RefCell<dyn SessionReceiver>>) -> Result<()> {
        self.prepare_start(&receiver)?;
        if let Err(e) = self.connection.start(receiver) {
            self.finish();
            return Err(e);
        }
        debug!(kind = K::NAME, name = %self.name, id = ?self.id, "context starting");
        Ok(())
    }

    /// Start the context by sharing a logged-on connection.
    ///
    /// When the shared connection is usable as is, the open command is sent
    /// before this returns.
    pub fn start_from(
        &mut self,
        other: &Connection,
        receiver: Weak<RefCell<dyn SessionReceiver>>,
        use_own_logon: bool,
    ) -> Result<()> {
        self.prepare_start(&receiver)?;
        let ready = match self.connection.start_from(other, receiver, use_own_logon) {
            Ok(ready) => ready,
            Err(e) => {
                self.finish();
                return Err(e);
            }
        };
        if ready {
            if let Err(e) = self.open_resource() {
                self.finish();
                return Err(e);
            }
        }
        Ok(())
    }

    /// Close the resource session, then the connection. Idempotent.
    pub fn finish(&mut self) {
        if let Some(session) = self.session.take() {
            self.connection.runtime().close_session(session);
        }
        if self.state != ContextState::Standby {
            debug!(kind = K::NAME, name = %self.name, from = %self.state, "context finished");
        }
        self.state = ContextState::Standby;
        self.pending_tran = None;
        self.connection.finish();
    }

    /// Build a command on the resource session.
    pub fn new_command(&mut self, message_type: u32) -> Result<Message> {
        let session = self.session.ok_or(Error::SessionClosed)?;
        Ok(self.connection.new_command(session, message_type))
    }

    /// Build a command on the net session.
    pub fn new_net_command(&mut self, message_type: u32) -> Result<Message> {
        let session = self.connection.net_session().ok_or(Error::SessionClosed)?;
        Ok(self.connection.new_command(session, message_type))
    }

    pub fn send(&self, msg: Message) -> Result<()> {
        self.connection.send(msg)
    }

    fn fail(&mut self, failure: ContextFailure) -> Option<ContextEvent> {
        warn!(kind = K::NAME, name = %self.name, id = ?self.id, state = %self.state, failure = %failure, "context failed");
        self.finish();
        Some(ContextEvent::Failed(failure))
    }

    fn open_resource(&mut self) -> Result<()> {
        let receiver = self.receiver.clone().ok_or_else(|| Error::InvalidArgument {
            message: "context has no session receiver".into(),
        })?;
        let session = self.connection.runtime().open_session(receiver)?;
        self.session = Some(session);
        self.state = ContextState::Attach(AttachStage::Opening);

        let msg = if self.name.is_empty() {
            let mut msg = self.connection.new_command(session, K::OPEN_BY_ID_CMD);
            msg.add_u4(self.id.unwrap_or_default());
            msg
        } else {
            let mut msg = self.connection.new_command(session, K::OPEN_BY_NAME_CMD);
            msg.add_str(&self.name);
            msg
        };
        self.pending_tran = msg.tran_no();
        debug!(kind = K::NAME, session = %session, name = %self.name, id = ?self.id, "opening resource");
        self.send(msg)
    }

    fn on_connection_ready(&mut self) -> Option<ContextEvent> {
        if self.state != ContextState::Delegate {
            return None;
        }
        match self.open_resource() {
            Ok(()) => None,
            Err(e) => {
                warn!(error = %e, "could not open resource session");
                self.fail(ContextFailure::Session)
            }
        }
    }

    /// Feed an inbound message from any session the context owns.
    pub fn handle_message(&mut self, msg: Message) -> Option<ContextEvent> {
        if self.session.is_some() && Some(msg.session_no()) == self.session {
            return self.on_resource_message(msg);
        }
        match self.connection.handle_message(msg)? {
            ConnectionEvent::Ready => self.on_connection_ready(),
            ConnectionEvent::Failed(failure) => self.fail(failure.into()),
            ConnectionEvent::SessionFailed => None,
            ConnectionEvent::Message(msg) => self.on_net_message(msg),
        }
    }

    fn on_resource_message(&mut self, mut msg: Message) -> Option<ContextEvent> {
        match (self.state, msg.message_type()) {
            (ContextState::Attach(_) | ContextState::Ready, router::UNSUPPORTED_MESSAGE) => {
                self.fail(ContextFailure::Unsupported)
            }
            (ContextState::Attach(_) | ContextState::Ready, router::SECURITY_FAILURE) => {
                self.fail(ContextFailure::Security)
            }
            (ContextState::Attach(AttachStage::Opening), t)
                if t == K::OPEN_BY_NAME_ACK || t == K::OPEN_BY_ID_ACK =>
            {
                self.on_open_ack(&mut msg)
            }
            (ContextState::Ready, _) => Some(ContextEvent::Message(msg)),
            (state, t) => {
                debug!(kind = K::NAME, state = %state, message_type = t, "ignoring resource message");
                None
            }
        }
    }

    fn on_open_ack(&mut self, msg: &mut Message) -> Option<ContextEvent> {
        let OpenAck {
            tran_no,
            outcome,
            access_level,
            name,
        } = match OpenAck::read(msg) {
            Ok(ack) => ack,
            Err(_) => return self.fail(ContextFailure::Unknown),
        };
        if Some(tran_no) != self.pending_tran {
            debug!(tran_no, "stale open acknowledgement");
            return None;
        }
        self.pending_tran = None;

        let by_id = self.name.is_empty();
        match outcome {
            OUTCOME_SUCCESS => {}
            lgrnet::OPEN_INVALID_NAME if by_id => return self.fail(ContextFailure::InvalidId),
            lgrnet::OPEN_INVALID_NAME => return self.fail(ContextFailure::InvalidName),
            lgrnet::OPEN_SECURITY => return self.fail(ContextFailure::Security),
            _ => return self.fail(ContextFailure::Unknown),
        }
        self.access_level = access_level;

        if !name.is_empty() {
            self.resolved_name = name;
            return self.ready();
        }
        if !by_id {
            self.resolved_name = self.name.clone();
            return self.ready();
        }

        // Opened by id without a name: look the id up in the resource list.
        match self.new_net_command(K::ENUM_START_CMD) {
            Ok(msg) => {
                self.pending_tran = msg.tran_no();
                self.state = ContextState::Attach(AttachStage::Resolving);
                if self.send(msg).is_err() {
                    return self.fail(ContextFailure::Session);
                }
                None
            }
            Err(_) => self.fail(ContextFailure::Session),
        }
    }

    fn on_net_message(&mut self, mut msg: Message) -> Option<ContextEvent> {
        let resolving = self.state == ContextState::Attach(AttachStage::Resolving);
        if !(resolving && msg.message_type() == K::ENUM_NOT && msg.tran_no() == self.pending_tran) {
            return Some(ContextEvent::NetMessage(msg));
        }
        let found = find_resource_name(&mut msg, self.id.unwrap_or_default());

        if let Ok(stop) = self.new_net_command(K::ENUM_STOP_CMD) {
            let mut stop = stop;
            stop.add_u4(self.pending_tran.unwrap_or_default());
            if let Err(e) = self.send(stop) {
                debug!(kind = K::NAME, error = %e, "could not stop resource enumeration");
            }
        }
        self.pending_tran = None;

        match found {
            Ok(Some(name)) => {
                self.resolved_name = name;
                self.ready()
            }
            Ok(None) => self.fail(ContextFailure::InvalidId),
            Err(_) => self.fail(ContextFailure::Unknown),
        }
    }

    fn ready(&mut self) -> Option<ContextEvent> {
        self.state = ContextState::Ready;
        info!(
            kind = K::NAME,
            name = %self.resolved_name,
            session = ?self.session,
            access_level = self.access_level,
            "resource attached"
        );
        Some(ContextEvent::Ready)
    }

    /// Feed a session break.
    pub fn handle_session_broken(
        &mut self,
        session: SessionNo,
        reason: CloseReason,
    ) -> Option<ContextEvent> {
        if self.session == Some(session) {
            self.session = None;
            if self.state == ContextState::Standby {
                return None;
            }
            let failure = match reason {
                CloseReason::NoSuchObject if K::MISSING_OBJECT_IS_NAME_FAILURE => {
                    ContextFailure::InvalidName
                }
                CloseReason::Unsupported => ContextFailure::Unsupported,
                CloseReason::Security => ContextFailure::Security,
                _ => ContextFailure::Session,
            };
            return self.fail(failure);
        }
        match self.connection.handle_session_broken(session, reason)? {
            ConnectionEvent::Failed(failure) => self.fail(failure.into()),
            ConnectionEvent::SessionFailed
                if self.state == ContextState::Attach(AttachStage::Resolving) =>
            {
                self.fail(ContextFailure::Session)
            }
            _ => None,
        }
    }
}

struct OpenAck {
    tran_no: u32,
    outcome: u32,
    access_level: u32,
    name: String,
}

impl OpenAck {
    fn read(msg: &mut Message) -> Result<Self> {
        let tran_no = msg.read_u4()?;
        let outcome = msg.read_u4()?;
        let access_level = msg.read_u4()?;
        // Servers that resolve nothing may omit the name entirely.
        let name = if msg.remaining() > 0 {
            msg.read_str()?
        } else {
            String::new()
        };
        Ok(Self {
            tran_no,
            outcome,
            access_level,
            name,
        })
    }
}

/// Scan an enumeration report for the name of resource `id`.
fn find_resource_name(msg: &mut Message, id: u32) -> Result<Option<String>> {
    msg.read_u4()?;
    if msg.read_u4()? != OUTCOME_SUCCESS {
        return Ok(None);
    }
    let count = msg.read_u4()?;
    let mut found = None;
    for _ in 0..count {
        let change = msg.read_u4()?;
        let item_id = msg.read_u4()?;
        let name = msg.read_str()?;
        let _type_code = msg.read_u4()?;
        if item_id == id && ChangeCode::from_code(change) == Some(ChangeCode::Added) {
            found = Some(name);
        }
    }
    Ok(found)
}

impl<K: ResourceKind> Drop for ResourceContext<K> {
    fn drop(&mut self) {
        self.finish();
    }
}

#[cfg(test)]
mod tests {
    use std::rc::Rc;

    use cora_test_utils::MockTransport;

    use super::*;

    struct Sink;

    impl SessionReceiver for Sink {
        fn on_message(&mut self, _msg: Message) {}
        fn on_session_broken(&mut self, _session: SessionNo, _reason: CloseReason) {}
    }

    fn context<K: ResourceKind>() -> (ResourceContext<K>, cora_test_utils::MockHandle) {
        let (transport, handle) = MockTransport::new();
        (ResourceContext::new(Runtime::new(transport), LogonConfig::default()), handle)
    }

    fn sink() -> (Rc<RefCell<Sink>>, Weak<RefCell<dyn SessionReceiver>>) {
        let sink = Rc::new(RefCell::new(Sink));
        let weak: Weak<RefCell<dyn SessionReceiver>> = Rc::downgrade(&sink) as _;
        (sink, weak)
    }

    #[test]
    fn identity_setters_are_exclusive() {
        let (mut ctx, _) = context::<Broker>();
        ctx.set_name("ws1").unwrap();
        ctx.set_id(7).unwrap();
        assert_eq!(ctx.id(), Some(7));
        assert!(ctx.name().is_empty());

        ctx.set_name("ws2").unwrap();
        assert_eq!(ctx.id(), None);
        assert_eq!(ctx.name(), "ws2");

        ctx.set_id_with_name(9, "ws9").unwrap();
        assert_eq!(ctx.id(), Some(9));
        assert_eq!(ctx.name(), "ws9");
    }

    #[test]
    fn start_without_identity_fails() {
        let (mut ctx, handle) = context::<Device>();
        let (_sink, weak) = sink();
        assert!(matches!(ctx.start(weak), Err(Error::InvalidArgument { .. })));
        assert_eq!(ctx.state(), ContextState::Standby);
        assert_eq!(handle.sent_count(), 0);
    }

    #[test]
    fn start_twice_is_invalid_state_without_io() {
        let (mut ctx, handle) = context::<Broker>();
        let (_sink, weak) = sink();
        ctx.set_name("ws1").unwrap();
        ctx.start(weak.clone()).unwrap();
        assert_eq!(ctx.state(), ContextState::Delegate);
        let sent = handle.sent_count();

        assert!(matches!(ctx.start(weak), Err(Error::InvalidState { .. })));
        assert!(ctx.set_name("other").is_err());
        assert_eq!(handle.sent_count(), sent);
    }

    #[test]
    fn finish_from_delegate_is_idempotent() {
        let (mut ctx, handle) = context::<PbRouter>();
        let (_sink, weak) = sink();
        ctx.set_id(4).unwrap();
        ctx.start(weak).unwrap();
        let net = ctx.connection().net_session().unwrap();

        ctx.finish();
        ctx.finish();
        assert_eq!(ctx.state(), ContextState::Standby);
        assert_eq!(handle.close_count(net), 1);
    }

    #[test]
    fn failure_mapping_from_connection() {
        assert_eq!(ContextFailure::from(ConnectionFailure::Logon), ContextFailure::Logon);
        assert_eq!(
            ContextFailure::from(ConnectionFailure::AccessExpired),
            ContextFailure::AccessExpired
        );
        assert_eq!(ContextFailure::from(ConnectionFailure::Unknown), ContextFailure::Unknown);
    }
}
