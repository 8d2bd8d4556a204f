//! Async driver feeding a runtime from tokio.
//!
//! The runtime itself is synchronous. A network task pushes decoded inbound
//! traffic into an unbounded channel; the driver wakes on either that channel
//! or the earliest timer deadline and hands the work to the runtime.

use tokio::sync::mpsc;
use tokio::time::{Instant, sleep_until};
use tracing::{debug, info};

use crate::protocol::{CloseReason, Message, SessionNo};
use crate::runtime::Runtime;

/// Traffic delivered by the network task.
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    Message(Message),
    SessionBroken { session: SessionNo, reason: CloseReason },
}

/// Pumps inbound traffic and timers into a [`Runtime`].
pub struct Driver {
    runtime: Runtime,
    inbound: mpsc::UnboundedReceiver<Inbound>,
}

impl Driver {
    pub fn new(runtime: Runtime, inbound: mpsc::UnboundedReceiver<Inbound>) -> Self {
        Self { runtime, inbound }
    }

    /// Create a driver together with the sender the network task uses.
    pub fn channel(runtime: Runtime) -> (Self, mpsc::UnboundedSender<Inbound>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self::new(runtime, rx), tx)
    }

    pub fn runtime(&self) -> &Runtime {
        &self.runtime
    }

    fn dispatch(&self, item: Inbound) {
        match item {
            Inbound::Message(msg) => self.runtime.on_message(msg),
            Inbound::SessionBroken { session, reason } => {
                self.runtime.on_session_broken(session, reason)
            }
        }
    }

    /// Run until the inbound channel closes.
    pub async fn run(&mut self) {
        // Work posted by the application before the first message.
        self.runtime.run_pending();
        loop {
            let deadline = self.runtime.next_deadline();
            tokio::select! {
                item = self.inbound.recv() => match item {
                    Some(item) => self.dispatch(item),
                    None => {
                        info!("inbound channel closed; driver stopping");
                        break;
                    }
                },
                _ = wait_for(deadline) => {
                    let fired = self.runtime.expire_timers(Instant::now());
                    debug!(fired, "timers expired");
                }
            }
        }
    }
}

async fn wait_for(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
