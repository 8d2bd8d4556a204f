//! Server connection and logon state machine.
//!
//! A [`Connection`] owns the net session. Starting it queries the server
//! version and then runs one logon strategy:
//!
//! - access-token logon when a token is configured and the server is recent
//!   enough,
//! - challenge/response when the server supports it,
//! - plain logon otherwise.
//!
//! The connection is a sans-IO layer: the owning component feeds it the
//! messages and session breaks it receives and acts on the returned
//! [`ConnectionEvent`].

use std::cell::RefCell;
use std::fmt;
use std::rc::Weak;

use thiserror::Error;
use tracing::{debug, info, warn};

use cora_core::auth;
use cora_core::constants::{CHALLENGE_LOGON_MIN_VERSION, OUTCOME_SUCCESS, TOKEN_LOGON_MIN_VERSION};
use cora_core::protocol::messages::{lgrnet, router};
use cora_core::protocol::{CloseReason, Message, ServerVersion, SessionNo};
use cora_core::{Error, Result, Runtime, SessionReceiver};

use crate::config::LogonConfig;

/// Why a connection could not be established or was lost.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Error)]
pub enum ConnectionFailure {
    #[error("logon rejected")]
    Logon,
    #[error("net session failed")]
    Session,
    #[error("server does not support the request")]
    Unsupported,
    #[error("access denied")]
    Security,
    #[error("access token rejected")]
    InvalidAccess,
    #[error("access token expired")]
    AccessExpired,
    #[error("unknown failure")]
    Unknown,
}

/// Step of the logon handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogonStage {
    QueryServer,
    TokenLogon,
    Challenge,
    ChallengeResponse,
    PlainLogon,
}

impl LogonStage {
    fn expected_ack(&self) -> u32 {
        match self {
            LogonStage::QueryServer => lgrnet::QUERY_SERVER_ACK,
            LogonStage::TokenLogon => lgrnet::TOKEN_LOGON_ACK,
            LogonStage::Challenge => lgrnet::LOGON_CHALLENGE_ACK,
            LogonStage::ChallengeResponse => lgrnet::LOGON_RESPONSE_ACK,
            LogonStage::PlainLogon => lgrnet::LOGON_ACK,
        }
    }
}

/// Connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Standby,
    LoggingOn(LogonStage),
    Ready,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::Standby => write!(f, "standby"),
            ConnectionState::LoggingOn(stage) => write!(f, "logging on ({:?})", stage),
            ConnectionState::Ready => write!(f, "ready"),
        }
    }
}

/// What the owner of a connection must react to.
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionEvent {
    /// Logon completed.
    Ready,
    /// Logon failed; the connection is back in standby.
    Failed(ConnectionFailure),
    /// The net session broke after logon. The connection stays ready.
    SessionFailed,
    /// A message the connection does not consume.
    Message(Message),
}

/// Logon strategy chosen from the server version and credentials.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogonStrategy {
    Token,
    Challenge,
    Plain,
}

impl LogonStrategy {
    pub fn select(version: &ServerVersion, logon: &LogonConfig) -> Self {
        if logon.access_token().is_some() && version.at_least(TOKEN_LOGON_MIN_VERSION) {
            LogonStrategy::Token
        } else if version.at_least(CHALLENGE_LOGON_MIN_VERSION) {
            LogonStrategy::Challenge
        } else {
            LogonStrategy::Plain
        }
    }
}

/// Authenticated connection to the server.
pub struct Connection {
    runtime: Runtime,
    logon: LogonConfig,
    state: ConnectionState,
    net_session: Option<SessionNo>,
    last_tran_no: u32,
    pending_tran: Option<u32>,
    server_name: String,
    server_version: Option<ServerVersion>,
    access_level: u32,
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("state", &self.state)
            .field("net_session", &self.net_session)
            .field("server_name", &self.server_name)
            .field("last_tran_no", &self.last_tran_no)
            .finish()
    }
}

impl Connection {
    pub fn new(runtime: Runtime, logon: LogonConfig) -> Self {
        Self {
            runtime,
            logon,
            state: ConnectionState::Standby,
            net_session: None,
            last_tran_no: 0,
            pending_tran: None,
            server_name: String::new(),
            server_version: None,
            access_level: 0,
        }
    }

    pub fn runtime(&self) -> &Runtime {
        &self.runtime
    }

    pub fn logon(&self) -> &LogonConfig {
        &self.logon
    }

    /// Replace the credentials. Only allowed in standby.
    pub fn set_logon(&mut self, logon: LogonConfig) -> Result<()> {
        self.require_standby()?;
        self.logon = logon;
        Ok(())
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn is_ready(&self) -> bool {
        self.state == ConnectionState::Ready
    }

    pub fn net_session(&self) -> Option<SessionNo> {
        self.net_session
    }

    pub fn server_name(&self) -> &str {
        &self.server_name
    }

    pub fn server_version(&self) -> Option<&ServerVersion> {
        self.server_version.as_ref()
    }

    pub fn access_level(&self) -> u32 {
        self.access_level
    }

    /// Allocate the next transaction number. Numbers start at 1 and never
    /// repeat within the life of the connection.
    pub fn next_tran_no(&mut self) -> u32 {
        self.last_tran_no = self.last_tran_no.wrapping_add(1).max(1);
        self.last_tran_no
    }

    /// Build a command message for `session` with a fresh transaction number.
    pub fn new_command(&mut self, session: SessionNo, message_type: u32) -> Message {
        let tran_no = self.next_tran_no();
        Message::command(session, message_type, tran_no)
    }

    pub fn send(&self, msg: Message) -> Result<()> {
        self.runtime.send(msg)
    }

    fn require_standby(&self) -> Result<()> {
        if self.state != ConnectionState::Standby {
            return Err(Error::InvalidState {
                expected: ConnectionState::Standby.to_string(),
                actual: self.state.to_string(),
            });
        }
        Ok(())
    }

    fn require_receiver(receiver: &Weak<RefCell<dyn SessionReceiver>>) -> Result<()> {
        if receiver.upgrade().is_none() {
            return Err(Error::InvalidArgument {
                message: "session receiver is gone".into(),
            });
        }
        Ok(())
    }

    /// Open the net session and begin logging on.
    ///
    /// Inbound traffic for the net session goes to `receiver`, which must
    /// forward it to [`Connection::handle_message`].
    pub fn start(&mut self, receiver: Weak<RefCell<dyn SessionReceiver>>) -> Result<()> {
        self.require_standby()?;
        Self::require_receiver(&receiver)?;

        let session = self.runtime.open_session(receiver)?;
        self.net_session = Some(session);
        info!(session = %session, user = %self.logon.user_name, "connecting");
        self.enter_stage(LogonStage::QueryServer);
        if let Err(e) = self.send_stage_command(lgrnet::QUERY_SERVER_CMD, |_| {}) {
            self.finish();
            return Err(e);
        }
        Ok(())
    }

    /// Start by sharing an already logged-on connection.
    ///
    /// The server identity and access level are copied from `other` and a
    /// new net session is opened. Returns `Ok(true)` when the connection is
    /// ready immediately; `Ok(false)` when `use_own_logon` is set and this
    /// connection's credentials differ, in which case it logs on by itself.
    pub fn start_from(
        &mut self,
        other: &Connection,
        receiver: Weak<RefCell<dyn SessionReceiver>>,
        use_own_logon: bool,
    ) -> Result<bool> {
        self.require_standby()?;
        if !other.is_ready() {
            return Err(Error::InvalidArgument {
                message: format!("source connection is {}", other.state),
            });
        }
        Self::require_receiver(&receiver)?;

        self.runtime = other.runtime.clone();
        self.server_name = other.server_name.clone();
        self.server_version = other.server_version.clone();
        self.access_level = other.access_level;

        let session = self.runtime.open_session(receiver)?;
        self.net_session = Some(session);

        let relogon = use_own_logon && !self.logon.same_credentials(&other.logon);
        if !relogon {
            self.logon = other.logon.clone();
            self.state = ConnectionState::Ready;
            debug!(session = %session, "connection shared");
            return Ok(true);
        }

        if let Err(e) = self.begin_logon() {
            self.finish();
            return Err(e);
        }
        Ok(false)
    }

    /// Close the net session and return to standby. Idempotent.
    pub fn finish(&mut self) {
        if let Some(session) = self.net_session.take() {
            self.runtime.close_session(session);
        }
        if self.state != ConnectionState::Standby {
            debug!(from = %self.state, "connection finished");
        }
        self.state = ConnectionState::Standby;
        self.pending_tran = None;
    }

    fn enter_stage(&mut self, stage: LogonStage) {
        debug!(stage = ?stage, "logon stage");
        self.state = ConnectionState::LoggingOn(stage);
    }

    fn send_stage_command(&mut self, message_type: u32, fill: impl FnOnce(&mut Message)) -> Result<()> {
        let session = self.net_session.ok_or(Error::SessionClosed)?;
        let mut msg = self.new_command(session, message_type);
        fill(&mut msg);
        self.pending_tran = msg.tran_no();
        self.send(msg)
    }

    fn begin_logon(&mut self) -> Result<()> {
        let version = self.server_version.clone().ok_or_else(|| Error::Protocol {
            message: "server version unknown".into(),
        })?;
        let strategy = LogonStrategy::select(&version, &self.logon);
        debug!(version = %version, strategy = ?strategy, "logon strategy");
        let logon = self.logon.clone();
        match strategy {
            LogonStrategy::Token => {
                self.enter_stage(LogonStage::TokenLogon);
                self.send_stage_command(lgrnet::TOKEN_LOGON_CMD, |msg| {
                    msg.add_str(logon.access_token().unwrap_or_default());
                    msg.add_str(&logon.application);
                })
            }
            LogonStrategy::Challenge => {
                self.enter_stage(LogonStage::Challenge);
                self.send_stage_command(lgrnet::LOGON_CHALLENGE_CMD, |msg| {
                    msg.add_str(&logon.user_name);
                    msg.add_str(&logon.application);
                })
            }
            LogonStrategy::Plain => {
                self.enter_stage(LogonStage::PlainLogon);
                self.send_stage_command(lgrnet::LOGON_CMD, |msg| {
                    msg.add_str(&logon.user_name);
                    msg.add_str(&logon.password);
                    msg.add_str(&logon.application);
                })
            }
        }
    }

    fn fail(&mut self, failure: ConnectionFailure) -> Option<ConnectionEvent> {
        warn!(state = %self.state, failure = %failure, "connection failed");
        self.finish();
        Some(ConnectionEvent::Failed(failure))
    }

    fn ready(&mut self, access_level: u32) -> Option<ConnectionEvent> {
        self.access_level = access_level;
        self.state = ConnectionState::Ready;
        self.pending_tran = None;
        info!(server = %self.server_name, access_level, "logged on");
        Some(ConnectionEvent::Ready)
    }

    /// Feed an inbound message.
    ///
    /// Messages on other sessions, and net-session messages once ready, are
    /// handed back as [`ConnectionEvent::Message`].
    pub fn handle_message(&mut self, mut msg: Message) -> Option<ConnectionEvent> {
        let ConnectionState::LoggingOn(stage) = self.state else {
            return Some(ConnectionEvent::Message(msg));
        };
        if Some(msg.session_no()) != self.net_session {
            return Some(ConnectionEvent::Message(msg));
        }

        match msg.message_type() {
            router::UNSUPPORTED_MESSAGE => return self.fail(ConnectionFailure::Unsupported),
            router::SECURITY_FAILURE => return self.fail(ConnectionFailure::Security),
            t if t == stage.expected_ack() => {}
            other => {
                debug!(message_type = other, stage = ?stage, "ignoring message while logging on");
                return None;
            }
        }

        match msg.read_u4() {
            Ok(tran_no) if Some(tran_no) == self.pending_tran => {}
            Ok(tran_no) => {
                debug!(tran_no, expected = ?self.pending_tran, "stale logon acknowledgement");
                return None;
            }
            Err(_) => return self.fail(ConnectionFailure::Unknown),
        }

        let result = match stage {
            LogonStage::QueryServer => self.on_query_server_ack(&mut msg),
            LogonStage::TokenLogon => self.on_token_logon_ack(&mut msg),
            LogonStage::Challenge => self.on_challenge_ack(&mut msg),
            LogonStage::ChallengeResponse | LogonStage::PlainLogon => self.on_logon_ack(&mut msg),
        };
        match result {
            Ok(event) => event,
            Err(e) => {
                debug!(error = %e, stage = ?stage, "malformed logon acknowledgement");
                self.fail(ConnectionFailure::Unknown)
            }
        }
    }

    fn on_query_server_ack(&mut self, msg: &mut Message) -> Result<Option<ConnectionEvent>> {
        self.server_name = msg.read_str()?;
        let version = ServerVersion::parse(&msg.read_str()?)?;
        info!(server = %self.server_name, version = %version, "server identified");
        self.server_version = Some(version);
        if let Err(e) = self.begin_logon() {
            warn!(error = %e, "could not send logon");
            return Ok(self.fail(ConnectionFailure::Session));
        }
        Ok(None)
    }

    fn on_token_logon_ack(&mut self, msg: &mut Message) -> Result<Option<ConnectionEvent>> {
        let outcome = msg.read_u4()?;
        let access_level = msg.read_u4()?;
        Ok(match outcome {
            OUTCOME_SUCCESS => self.ready(access_level),
            lgrnet::TOKEN_INVALID => self.fail(ConnectionFailure::InvalidAccess),
            lgrnet::TOKEN_EXPIRED => self.fail(ConnectionFailure::AccessExpired),
            _ => self.fail(ConnectionFailure::Unknown),
        })
    }

    fn on_challenge_ack(&mut self, msg: &mut Message) -> Result<Option<ConnectionEvent>> {
        if msg.read_u4()? != OUTCOME_SUCCESS {
            return Ok(self.fail(ConnectionFailure::Logon));
        }
        let server_token = msg.read_bytes()?;
        let seed = msg.read_u4()?;

        let client_token = auth::client_token(seed, &auth::generate_nonce());
        let digest = auth::response_digest(&client_token, &server_token, &self.logon.password);

        self.enter_stage(LogonStage::ChallengeResponse);
        if let Err(e) = self.send_stage_command(lgrnet::LOGON_RESPONSE_CMD, |out| {
            out.add_bytes(&client_token);
            out.add_bytes(&digest);
        }) {
            warn!(error = %e, "could not send challenge response");
            return Ok(self.fail(ConnectionFailure::Session));
        }
        Ok(None)
    }

    fn on_logon_ack(&mut self, msg: &mut Message) -> Result<Option<ConnectionEvent>> {
        let accepted = msg.read_bool()?;
        if !accepted {
            return Ok(self.fail(ConnectionFailure::Logon));
        }
        let access_level = msg.read_u4().unwrap_or_default();
        Ok(self.ready(access_level))
    }

    /// Feed a session break. Breaks of other sessions yield `None`.
    pub fn handle_session_broken(
        &mut self,
        session: SessionNo,
        reason: CloseReason,
    ) -> Option<ConnectionEvent> {
        if Some(session) != self.net_session {
            return None;
        }
        self.net_session = None;
        match self.state {
            ConnectionState::Standby => None,
            ConnectionState::LoggingOn(_) => {
                debug!(reason = %reason, "net session broken while logging on");
                self.fail(ConnectionFailure::Session)
            }
            ConnectionState::Ready => {
                debug!(reason = %reason, "net session broken after logon");
                Some(ConnectionEvent::SessionFailed)
            }
        }
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.finish();
    }
}

#[cfg(test)]
mod tests {
    use std::rc::Rc;

    use cora_core::protocol::messages::lgrnet;
    use cora_test_utils::MockTransport;
    use proptest::prelude::*;

    use super::*;

    struct Sink;

    impl SessionReceiver for Sink {
        fn on_message(&mut self, _msg: Message) {}
        fn on_session_broken(&mut self, _session: SessionNo, _reason: CloseReason) {}
    }

    fn sink() -> (Rc<RefCell<Sink>>, Weak<RefCell<dyn SessionReceiver>>) {
        let sink = Rc::new(RefCell::new(Sink));
        let weak: Weak<RefCell<dyn SessionReceiver>> = Rc::downgrade(&sink) as _;
        (sink, weak)
    }

    fn ack(session: SessionNo, message_type: u32, tran_no: u32, fill: impl FnOnce(&mut Message)) -> Message {
        let mut msg = Message::command(session, message_type, tran_no);
        fill(&mut msg);
        msg
    }

    #[test]
    fn strategy_selection() {
        let old = ServerVersion::parse("1.3.1.27").unwrap();
        let mid = ServerVersion::parse("1.3.1.28").unwrap();
        let new = ServerVersion::parse("1.3.11.21").unwrap();
        let plain = LogonConfig::new().with_user("u", "p");
        let token = plain.clone().with_access_token("t");

        assert_eq!(LogonStrategy::select(&old, &plain), LogonStrategy::Plain);
        assert_eq!(LogonStrategy::select(&old, &token), LogonStrategy::Plain);
        assert_eq!(LogonStrategy::select(&mid, &plain), LogonStrategy::Challenge);
        assert_eq!(LogonStrategy::select(&mid, &token), LogonStrategy::Challenge);
        assert_eq!(LogonStrategy::select(&new, &plain), LogonStrategy::Challenge);
        assert_eq!(LogonStrategy::select(&new, &token), LogonStrategy::Token);
    }

    #[test]
    fn tran_numbers_start_at_one_and_increase() {
        let (transport, _) = MockTransport::new();
        let mut conn = Connection::new(Runtime::new(transport), LogonConfig::default());
        let numbers: Vec<u32> = (0..5).map(|_| conn.next_tran_no()).collect();
        assert_eq!(numbers, [1, 2, 3, 4, 5]);
    }

    proptest! {
        #[test]
        fn tran_numbers_never_repeat(count in 1usize..2000) {
            let (transport, _) = MockTransport::new();
            let mut conn = Connection::new(Runtime::new(transport), LogonConfig::default());
            let numbers: Vec<u32> = (0..count).map(|_| conn.next_tran_no()).collect();
            prop_assert_eq!(numbers[0], 1);
            prop_assert!(numbers.windows(2).all(|w| w[0] < w[1]));
        }
    }

    #[test]
    fn start_requires_standby_and_live_receiver() {
        let (transport, handle) = MockTransport::new();
        let mut conn = Connection::new(Runtime::new(transport), LogonConfig::default());

        let (dead, weak) = sink();
        drop(dead);
        assert!(matches!(conn.start(weak), Err(Error::InvalidArgument { .. })));
        assert_eq!(handle.sent_count(), 0);

        let (_sink, weak) = sink();
        conn.start(weak.clone()).unwrap();
        assert_eq!(conn.state(), ConnectionState::LoggingOn(LogonStage::QueryServer));
        let sent = handle.sent_count();
        let opened = handle.opened().len();

        assert!(matches!(conn.start(weak), Err(Error::InvalidState { .. })));
        assert_eq!(handle.sent_count(), sent);
        assert_eq!(handle.opened().len(), opened);
    }

    #[test]
    fn plain_logon_sequence() {
        let (transport, handle) = MockTransport::new();
        let logon = LogonConfig::new().with_user("bob", "pw").with_application("app");
        let mut conn = Connection::new(Runtime::new(transport), logon);
        let (_sink, weak) = sink();
        conn.start(weak).unwrap();
        let session = conn.net_session().unwrap();

        let query = handle.last_sent().unwrap();
        assert_eq!(query.message_type(), lgrnet::QUERY_SERVER_CMD);
        let tran = query.tran_no().unwrap();

        let event = conn.handle_message(ack(session, lgrnet::QUERY_SERVER_ACK, tran, |m| {
            m.add_str("srv");
            m.add_str("1.2.0");
        }));
        assert_eq!(event, None);
        assert_eq!(conn.server_name(), "srv");

        let mut logon = handle.last_sent().unwrap();
        assert_eq!(logon.message_type(), lgrnet::LOGON_CMD);
        let logon_tran = logon.read_u4().unwrap();
        assert!(logon_tran > tran);
        assert_eq!(logon.read_str().unwrap(), "bob");
        assert_eq!(logon.read_str().unwrap(), "pw");
        assert_eq!(logon.read_str().unwrap(), "app");

        let event = conn.handle_message(ack(session, lgrnet::LOGON_ACK, logon_tran, |m| {
            m.add_bool(true);
            m.add_u4(3);
        }));
        assert_eq!(event, Some(ConnectionEvent::Ready));
        assert!(conn.is_ready());
        assert_eq!(conn.access_level(), 3);
    }

    #[test]
    fn stale_ack_is_ignored() {
        let (transport, _handle) = MockTransport::new();
        let mut conn = Connection::new(Runtime::new(transport), LogonConfig::default());
        let (_sink, weak) = sink();
        conn.start(weak).unwrap();
        let session = conn.net_session().unwrap();

        let event = conn.handle_message(ack(session, lgrnet::QUERY_SERVER_ACK, 77, |m| {
            m.add_str("srv");
            m.add_str("1.0");
        }));
        assert_eq!(event, None);
        assert_eq!(conn.state(), ConnectionState::LoggingOn(LogonStage::QueryServer));
    }

    #[test]
    fn router_rejection_while_logging_on() {
        let (transport, handle) = MockTransport::new();
        let mut conn = Connection::new(Runtime::new(transport), LogonConfig::default());
        let (_sink, weak) = sink();
        conn.start(weak).unwrap();
        let session = conn.net_session().unwrap();

        let event = conn.handle_message(Message::new(session, router::SECURITY_FAILURE));
        assert_eq!(event, Some(ConnectionEvent::Failed(ConnectionFailure::Security)));
        assert_eq!(conn.state(), ConnectionState::Standby);
        assert_eq!(handle.closed(), [session]);
    }

    #[test]
    fn net_session_break_depends_on_state() {
        let (transport, _handle) = MockTransport::new();
        let mut conn = Connection::new(Runtime::new(transport), LogonConfig::default());
        let (_sink, weak) = sink();
        conn.start(weak).unwrap();
        let session = conn.net_session().unwrap();

        assert_eq!(conn.handle_session_broken(SessionNo(999), CloseReason::Closed), None);
        let event = conn.handle_session_broken(session, CloseReason::ConnectionLost);
        assert_eq!(event, Some(ConnectionEvent::Failed(ConnectionFailure::Session)));
        assert_eq!(conn.state(), ConnectionState::Standby);
    }

    #[test]
    fn finish_is_idempotent() {
        let (transport, handle) = MockTransport::new();
        let mut conn = Connection::new(Runtime::new(transport), LogonConfig::default());
        let (_sink, weak) = sink();
        conn.start(weak).unwrap();
        let session = conn.net_session().unwrap();

        conn.finish();
        conn.finish();
        assert_eq!(conn.state(), ConnectionState::Standby);
        assert_eq!(handle.close_count(session), 1);
    }

    #[test]
    fn start_from_requires_ready_source() {
        let (transport, _handle) = MockTransport::new();
        let runtime = Runtime::new(transport);
        let source = Connection::new(runtime.clone(), LogonConfig::default());
        let mut conn = Connection::new(runtime, LogonConfig::default());
        let (_sink, weak) = sink();
        assert!(matches!(
            conn.start_from(&source, weak, false),
            Err(Error::InvalidArgument { .. })
        ));
    }
}
