//! Transport collaborator interface.
//!
//! The transport owns framing and the physical connection. The runtime only
//! needs to open and close numbered sessions and send messages; inbound
//! traffic is fed back through [`crate::runtime::Runtime::on_message`] and
//! [`crate::runtime::Runtime::on_session_broken`].

mod channel;
mod driver;

pub use channel::{ChannelTransport, Outbound};
pub use driver::{Driver, Inbound};

use crate::error::Result;
use crate::protocol::{CloseReason, Message, SessionNo};

/// Outbound half of the physical connection.
pub trait Transport {
    /// Allocate a new logical session.
    fn open_session(&mut self) -> Result<SessionNo>;

    /// Release a session. Closing an unknown session does nothing.
    fn close_session(&mut self, session: SessionNo);

    /// Send a message on the session it is addressed to.
    fn send(&mut self, msg: Message) -> Result<()>;
}

/// Receives inbound traffic for the sessions it opened.
pub trait SessionReceiver {
    fn on_message(&mut self, msg: Message);

    /// The session is gone; it must not be closed again.
    fn on_session_broken(&mut self, session: SessionNo, reason: CloseReason);
}
