//! Device settings enumeration.

use std::cell::RefCell;
use std::fmt;
use std::rc::{Rc, Weak};

use thiserror::Error;
use tracing::{debug, warn};

use cora_core::constants::OUTCOME_SUCCESS;
use cora_core::protocol::messages::device;
use cora_core::protocol::{
    CloseReason, DefaultSettingFactory, Message, SessionNo, Setting, SettingFactory,
    decode_setting,
};
use cora_core::{Error, Finish, Result, Runtime, SessionReceiver};

use super::Liveness;
use crate::config::LogonConfig;
use crate::connection::Connection;
use crate::context::{ContextEvent, ContextFailure, DeviceContext};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Error)]
pub enum SettingsFailure {
    #[error(transparent)]
    Context(#[from] ContextFailure),
    #[error("device has no settings")]
    Unsupported,
    #[error("unknown failure")]
    Unknown,
}

pub trait SettingsClient {
    /// One decoded setting, from the initial report or a later change.
    fn on_setting(&mut self, setting: Rc<dyn Setting>);

    /// Every setting of the initial report has been delivered.
    fn on_started(&mut self) {}

    fn on_failure(&mut self, failure: SettingsFailure);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SettingsState {
    Standby,
    Connecting,
    Starting,
    Started,
}

impl fmt::Display for SettingsState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            SettingsState::Standby => "standby",
            SettingsState::Connecting => "connecting",
            SettingsState::Starting => "starting",
            SettingsState::Started => "started",
        };
        f.write_str(text)
    }
}

/// Follows the settings of one device, decoding them through a factory.
pub struct SettingsEnumerator {
    this: Weak<RefCell<Self>>,
    liveness: Liveness,
    context: DeviceContext,
    factory: Rc<dyn SettingFactory>,
    client: Option<Weak<RefCell<dyn SettingsClient>>>,
    state: SettingsState,
    enum_tran: Option<u32>,
}

impl fmt::Debug for SettingsEnumerator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SettingsEnumerator")
            .field("state", &self.state)
            .field("device", &self.context.name())
            .finish()
    }
}

impl SettingsEnumerator {
    pub fn new(runtime: Runtime, logon: LogonConfig) -> Rc<RefCell<Self>> {
        Self::with_factory(runtime, logon, Rc::new(DefaultSettingFactory))
    }

    pub fn with_factory(
        runtime: Runtime,
        logon: LogonConfig,
        factory: Rc<dyn SettingFactory>,
    ) -> Rc<RefCell<Self>> {
        Rc::new_cyclic(|this| {
            RefCell::new(Self {
                this: this.clone(),
                liveness: Liveness::new(&runtime),
                context: DeviceContext::new(runtime, logon),
                factory,
                client: None,
                state: SettingsState::Standby,
                enum_tran: None,
            })
        })
    }

    pub fn state(&self) -> SettingsState {
        self.state
    }

    pub fn context(&self) -> &DeviceContext {
        &self.context
    }

    pub fn set_device_name(&mut self, name: impl Into<String>) -> Result<()> {
        self.require_standby()?;
        self.context.set_name(name)
    }

    pub fn set_device_id(&mut self, id: u32) -> Result<()> {
        self.require_standby()?;
        self.context.set_id(id)
    }

    fn require_standby(&self) -> Result<()> {
        if self.state != SettingsState::Standby {
            return Err(Error::InvalidState {
                expected: SettingsState::Standby.to_string(),
                actual: self.state.to_string(),
            });
        }
        Ok(())
    }

    fn prepare_start(&mut self, client: Weak<RefCell<dyn SettingsClient>>) -> Result<()> {
        self.require_standby()?;
        if client.upgrade().is_none() {
            return Err(Error::InvalidArgument {
                message: "settings client is gone".into(),
            });
        }
        self.client = Some(client);
        self.state = SettingsState::Connecting;
        Ok(())
    }

    pub fn start(&mut self, client: Weak<RefCell<dyn SettingsClient>>) -> Result<()> {
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
        client: Weak<RefCell<dyn SettingsClient>>,
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
        if let Some(tran) = self.enum_tran.take() {
            if let Ok(mut stop) = self.context.new_command(device::SETTINGS_ENUM_STOP_CMD) {
                stop.add_u4(tran);
                if let Err(e) = self.context.send(stop) {
                    debug!(error = %e, "could not stop settings enumeration");
                }
            }
        }
        self.context.finish();
        if self.state != SettingsState::Standby {
            debug!(device = %self.context.name(), from = %self.state, "settings enumerator finished");
            self.liveness.renew();
        }
        self.state = SettingsState::Standby;
        self.client = None;
    }

    fn post(&self, deliver: impl FnOnce(&mut (dyn SettingsClient + 'static)) + 'static) {
        if let Some(client) = self.client.clone() {
            self.context
                .runtime()
                .post_to_client(self.liveness.id(), self.this.clone(), client, deliver);
        }
    }

    fn fail(&mut self, failure: SettingsFailure) {
        warn!(device = %self.context.name(), state = %self.state, failure = %failure, "settings enumeration failed");
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

    fn on_context_ready(&mut self) {
        let sent = self
            .context
            .new_command(device::SETTINGS_ENUM_CMD)
            .and_then(|msg| {
                let tran = msg.tran_no();
                self.context.send(msg).map(|()| tran)
            });
        match sent {
            Ok(tran) => {
                self.enum_tran = tran;
                self.state = SettingsState::Starting;
            }
            Err(e) => {
                warn!(error = %e, "could not start settings enumeration");
                self.fail(ContextFailure::Session.into());
            }
        }
    }

    fn on_device_message(&mut self, mut msg: Message) {
        if msg.message_type() != device::SETTINGS_ENUM_NOT || msg.tran_no() != self.enum_tran {
            debug!(message_type = msg.message_type(), "ignoring device message");
            return;
        }
        let items = match read_items(&mut msg) {
            Ok(Ok(items)) => items,
            Ok(Err(outcome)) => {
                self.enum_tran = None;
                let failure = if outcome == device::SETTINGS_UNSUPPORTED {
                    SettingsFailure::Unsupported
                } else {
                    SettingsFailure::Unknown
                };
                return self.fail(failure);
            }
            Err(e) => {
                debug!(error = %e, "malformed settings report");
                return self.fail(SettingsFailure::Unknown);
            }
        };

        for (identifier, body) in items {
            match decode_setting(self.factory.as_ref(), identifier, &body) {
                Some(setting) => {
                    let setting: Rc<dyn Setting> = Rc::from(setting);
                    self.post(move |c| c.on_setting(setting));
                }
                None => debug!(identifier, "setting skipped"),
            }
        }
        if self.state == SettingsState::Starting {
            self.state = SettingsState::Started;
            self.post(|c| c.on_started());
        }
    }
}

/// Decode the `(identifier, body)` pairs of a report. The inner error is a
/// failure outcome.
fn read_items(msg: &mut Message) -> Result<std::result::Result<Vec<(u32, Vec<u8>)>, u32>> {
    msg.read_u4()?;
    let outcome = msg.read_u4()?;
    if outcome != OUTCOME_SUCCESS {
        return Ok(Err(outcome));
    }
    let count = msg.read_u4()?;
    let mut items = Vec::new();
    for _ in 0..count {
        let identifier = msg.read_u4()?;
        let body = msg.read_bytes()?;
        items.push((identifier, body.to_vec()));
    }
    Ok(Ok(items))
}

impl SessionReceiver for SettingsEnumerator {
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

impl Finish for SettingsEnumerator {
    fn finish(&mut self) {
        SettingsEnumerator::finish(self);
    }
}

impl Drop for SettingsEnumerator {
    fn drop(&mut self) {
        self.finish();
    }
}
