//! Channel-backed transport.
//!
//! Forwards every outbound operation into a tokio channel so a network task
//! running elsewhere can frame and write it.

use tokio::sync::mpsc;
use tracing::debug;

use super::Transport;
use crate::error::{Error, Result};
use crate::protocol::{Message, SessionNo};

/// Operation requested by the runtime.
#[derive(Debug, Clone, PartialEq)]
pub enum Outbound {
    Open(SessionNo),
    Close(SessionNo),
    Send(Message),
}

/// [`Transport`] that allocates session numbers locally and forwards
/// operations to a channel.
#[derive(Debug)]
pub struct ChannelTransport {
    tx: mpsc::UnboundedSender<Outbound>,
    next_session: u32,
}

impl ChannelTransport {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Outbound>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                tx,
                next_session: 1,
            },
            rx,
        )
    }

    fn forward(&self, item: Outbound) -> Result<()> {
        self.tx.send(item).map_err(|_| Error::Transport {
            message: "outbound channel closed".into(),
        })
    }
}

impl Transport for ChannelTransport {
    fn open_session(&mut self) -> Result<SessionNo> {
        let session = SessionNo(self.next_session);
        self.forward(Outbound::Open(session))?;
        self.next_session = self.next_session.wrapping_add(1).max(1);
        Ok(session)
    }

    fn close_session(&mut self, session: SessionNo) {
        if self.forward(Outbound::Close(session)).is_err() {
            debug!(session = %session, "close after outbound channel closed");
        }
    }

    fn send(&mut self, msg: Message) -> Result<()> {
        self.forward(Outbound::Send(msg))
    }
}
