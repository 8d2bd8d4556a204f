//! Mock transport for testing without a real server connection.
//!
//! [`MockTransport`] implements the transport collaborator trait by recording
//! every operation. The paired [`MockHandle`] shares the same log so tests can
//! inspect traffic after the transport has been moved into a runtime.

use std::cell::RefCell;
use std::rc::Rc;

use cora_core::error::{Error, Result};
use cora_core::protocol::{Message, SessionNo};
use cora_core::transport::{Outbound, Transport};

#[derive(Debug, Default)]
struct TransportLog {
    events: Vec<Outbound>,
    next_session: u32,
    fail_open: bool,
}

/// In-memory transport that records all outbound operations.
#[derive(Debug)]
pub struct MockTransport {
    log: Rc<RefCell<TransportLog>>,
}

/// Inspection handle sharing the log of a [`MockTransport`].
#[derive(Debug, Clone)]
pub struct MockHandle {
    log: Rc<RefCell<TransportLog>>,
}

impl MockTransport {
    /// Create a transport and its inspection handle.
    pub fn new() -> (Self, MockHandle) {
        let log = Rc::new(RefCell::new(TransportLog::default()));
        (Self { log: log.clone() }, MockHandle { log })
    }
}

impl Transport for MockTransport {
    fn open_session(&mut self) -> Result<SessionNo> {
        let mut log = self.log.borrow_mut();
        if log.fail_open {
            return Err(Error::Transport {
                message: "mock transport refuses new sessions".into(),
            });
        }
        log.next_session += 1;
        let session = SessionNo(log.next_session);
        log.events.push(Outbound::Open(session));
        Ok(session)
    }

    fn close_session(&mut self, session: SessionNo) {
        self.log.borrow_mut().events.push(Outbound::Close(session));
    }

    fn send(&mut self, msg: Message) -> Result<()> {
        self.log.borrow_mut().events.push(Outbound::Send(msg));
        Ok(())
    }
}

impl MockHandle {
    /// All recorded operations in order.
    pub fn events(&self) -> Vec<Outbound> {
        self.log.borrow().events.clone()
    }

    /// Operations recorded at or after `index`.
    pub fn events_since(&self, index: usize) -> Vec<Outbound> {
        self.log
            .borrow()
            .events
            .get(index..)
            .map(<[Outbound]>::to_vec)
            .unwrap_or_default()
    }

    pub fn event_count(&self) -> usize {
        self.log.borrow().events.len()
    }

    /// All sent messages, with read cursors at the start.
    pub fn sent(&self) -> Vec<Message> {
        self.log
            .borrow()
            .events
            .iter()
            .filter_map(|event| match event {
                Outbound::Send(msg) => Some(msg.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn sent_count(&self) -> usize {
        self.sent().len()
    }

    pub fn last_sent(&self) -> Option<Message> {
        self.sent().pop()
    }

    /// Sent messages of one message type.
    pub fn sent_of_type(&self, message_type: u32) -> Vec<Message> {
        self.sent()
            .into_iter()
            .filter(|msg| msg.message_type() == message_type)
            .collect()
    }

    pub fn count_of_type(&self, message_type: u32) -> usize {
        self.sent_of_type(message_type).len()
    }

    /// Sessions opened, in order.
    pub fn opened(&self) -> Vec<SessionNo> {
        self.log
            .borrow()
            .events
            .iter()
            .filter_map(|event| match event {
                Outbound::Open(session) => Some(*session),
                _ => None,
            })
            .collect()
    }

    /// Sessions closed, in order. A session closed twice appears twice.
    pub fn closed(&self) -> Vec<SessionNo> {
        self.log
            .borrow()
            .events
            .iter()
            .filter_map(|event| match event {
                Outbound::Close(session) => Some(*session),
                _ => None,
            })
            .collect()
    }

    pub fn close_count(&self, session: SessionNo) -> usize {
        self.closed().iter().filter(|s| **s == session).count()
    }

    /// Sessions opened and not yet closed.
    pub fn open_sessions(&self) -> Vec<SessionNo> {
        let closed = self.closed();
        self.opened()
            .into_iter()
            .filter(|s| !closed.contains(s))
            .collect()
    }

    /// Make subsequent `open_session` calls fail.
    pub fn set_fail_open(&self, fail: bool) {
        self.log.borrow_mut().fail_open = fail;
    }
}
