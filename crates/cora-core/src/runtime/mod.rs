//! Cooperative single-threaded event runtime.
//!
//! The runtime routes inbound session traffic to the receiver that opened the
//! session and owns a queue of posted events. Network callbacks never call
//! application code directly: they post an event bound to a [`ReceiverId`].
//! Posted events run after the network callback has returned, in post order,
//! and an event whose target has been retired is dropped at delivery time.
//!
//! Components are `Rc<RefCell<_>>` values. The runtime never holds one of its
//! own borrows while calling out, so a callback may open sessions, post
//! events, arm timers or drop the component that posted it.

mod registry;
mod timer;

pub use registry::{ReceiverId, Registry};
pub use timer::TimerId;

use std::cell::{Cell, RefCell};
use std::collections::{HashMap, VecDeque};
use std::rc::{Rc, Weak};
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, trace, warn};

use crate::error::{Error, Result};
use crate::protocol::{CloseReason, Message, SessionNo};
use crate::transport::{SessionReceiver, Transport};
use timer::TimerQueue;

/// Components that can be driven to shut down by the runtime.
pub trait Finish {
    /// Close all sessions and return to standby. Must be idempotent.
    fn finish(&mut self);
}

struct Event {
    target: ReceiverId,
    action: Box<dyn FnOnce()>,
}

struct Inner {
    transport: RefCell<Box<dyn Transport>>,
    sessions: RefCell<HashMap<SessionNo, Weak<RefCell<dyn SessionReceiver>>>>,
    registry: RefCell<Registry>,
    queue: RefCell<VecDeque<Event>>,
    timers: RefCell<TimerQueue>,
    delivering: Cell<bool>,
}

/// Handle to the event runtime. Clones share the same runtime.
#[derive(Clone)]
pub struct Runtime {
    inner: Rc<Inner>,
}

impl std::fmt::Debug for Runtime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runtime")
            .field("sessions", &self.inner.sessions.borrow().len())
            .field("pending", &self.inner.queue.borrow().len())
            .field("timers", &self.inner.timers.borrow().len())
            .finish()
    }
}

impl Runtime {
    pub fn new(transport: impl Transport + 'static) -> Self {
        Self {
            inner: Rc::new(Inner {
                transport: RefCell::new(Box::new(transport)),
                sessions: RefCell::new(HashMap::new()),
                registry: RefCell::new(Registry::new()),
                queue: RefCell::new(VecDeque::new()),
                timers: RefCell::new(TimerQueue::default()),
                delivering: Cell::new(false),
            }),
        }
    }

    // -------------------------------------------------------------------------
    // Sessions
    // -------------------------------------------------------------------------

    /// Open a session whose inbound traffic goes to `receiver`.
    pub fn open_session(&self, receiver: Weak<RefCell<dyn SessionReceiver>>) -> Result<SessionNo> {
        let session = self.transport()?.open_session()?;
        self.inner.sessions.borrow_mut().insert(session, receiver);
        debug!(session = %session, "session opened");
        Ok(session)
    }

    /// Close a session. Sessions already closed or broken are left alone.
    pub fn close_session(&self, session: SessionNo) {
        let known = self.inner.sessions.borrow_mut().remove(&session).is_some();
        if !known {
            return;
        }
        match self.transport() {
            Ok(mut transport) => transport.close_session(session),
            Err(e) => warn!(session = %session, error = %e, "could not close session"),
        }
        debug!(session = %session, "session closed");
    }

    pub fn is_open(&self, session: SessionNo) -> bool {
        self.inner.sessions.borrow().contains_key(&session)
    }

    pub fn session_count(&self) -> usize {
        self.inner.sessions.borrow().len()
    }

    pub fn send(&self, msg: Message) -> Result<()> {
        if !self.is_open(msg.session_no()) {
            return Err(Error::UnknownSession(msg.session_no()));
        }
        trace!(session = %msg.session_no(), message_type = msg.message_type(), "send");
        self.transport()?.send(msg)
    }

    fn transport(&self) -> Result<std::cell::RefMut<'_, Box<dyn Transport>>> {
        self.inner.transport.try_borrow_mut().map_err(|_| Error::Transport {
            message: "transport is busy".into(),
        })
    }

    fn receiver_for(&self, session: SessionNo) -> Option<Rc<RefCell<dyn SessionReceiver>>> {
        let weak = self.inner.sessions.borrow().get(&session).cloned()?;
        match weak.upgrade() {
            Some(receiver) => Some(receiver),
            None => {
                debug!(session = %session, "receiver dropped; closing session");
                self.close_session(session);
                None
            }
        }
    }

    /// Deliver an inbound message, then run posted events.
    pub fn on_message(&self, msg: Message) {
        let session = msg.session_no();
        match self.receiver_for(session) {
            Some(receiver) => match receiver.try_borrow_mut() {
                Ok(mut receiver) => receiver.on_message(msg),
                Err(_) => warn!(session = %session, "receiver busy; message dropped"),
            },
            None => debug!(session = %session, message_type = msg.message_type(), "message for unknown session"),
        }
        self.run_pending();
    }

    /// Report a broken session to its receiver, then run posted events.
    pub fn on_session_broken(&self, session: SessionNo, reason: CloseReason) {
        let receiver = self
            .inner
            .sessions
            .borrow_mut()
            .remove(&session)
            .and_then(|weak| weak.upgrade());
        debug!(session = %session, reason = %reason, "session broken");
        if let Some(receiver) = receiver {
            match receiver.try_borrow_mut() {
                Ok(mut receiver) => receiver.on_session_broken(session, reason),
                Err(_) => warn!(session = %session, "receiver busy; session broken dropped"),
            }
        }
        self.run_pending();
    }

    // -------------------------------------------------------------------------
    // Liveness registry
    // -------------------------------------------------------------------------

    pub fn register(&self) -> ReceiverId {
        self.inner.registry.borrow_mut().register()
    }

    pub fn retire(&self, id: ReceiverId) {
        self.inner.registry.borrow_mut().retire(id);
    }

    pub fn is_valid(&self, id: ReceiverId) -> bool {
        self.inner.registry.borrow().is_valid(id)
    }

    // -------------------------------------------------------------------------
    // Posted events
    // -------------------------------------------------------------------------

    /// Queue `action` for delivery to `target`.
    pub fn post(&self, target: ReceiverId, action: impl FnOnce() + 'static) {
        self.inner.queue.borrow_mut().push_back(Event {
            target,
            action: Box::new(action),
        });
    }

    /// Queue a client callback on behalf of `source`.
    ///
    /// If the client is gone by delivery time, `source` is finished instead.
    pub fn post_to_client<S, C>(
        &self,
        target: ReceiverId,
        source: Weak<RefCell<S>>,
        client: Weak<RefCell<C>>,
        deliver: impl FnOnce(&mut C) + 'static,
    ) where
        S: Finish + ?Sized + 'static,
        C: ?Sized + 'static,
    {
        self.post(target, move || {
            if let Some(client) = client.upgrade() {
                match client.try_borrow_mut() {
                    Ok(mut client) => deliver(&mut client),
                    Err(_) => warn!("client busy; event dropped"),
                }
                return;
            }
            debug!("client gone; finishing source");
            if let Some(source) = source.upgrade() {
                if let Ok(mut source) = source.try_borrow_mut() {
                    source.finish();
                }
            }
        });
    }

    /// Deliver queued events until the queue is empty.
    ///
    /// Events posted during delivery are delivered in the same call. A nested
    /// call made from inside an event returns immediately.
    pub fn run_pending(&self) -> usize {
        if self.inner.delivering.replace(true) {
            return 0;
        }
        let mut delivered = 0;
        loop {
            let event = self.inner.queue.borrow_mut().pop_front();
            let Some(event) = event else { break };
            if !self.is_valid(event.target) {
                trace!(receiver = %event.target, "skipping event for retired receiver");
                continue;
            }
            (event.action)();
            delivered += 1;
        }
        self.inner.delivering.set(false);
        delivered
    }

    pub fn pending_count(&self) -> usize {
        self.inner.queue.borrow().len()
    }

    // -------------------------------------------------------------------------
    // Timers
    // -------------------------------------------------------------------------

    /// Arm a one-shot timer. The callback runs as a posted event for
    /// `target` and receives the id returned here.
    pub fn arm_timer(
        &self,
        target: ReceiverId,
        delay: Duration,
        callback: impl FnOnce(TimerId) + 'static,
    ) -> TimerId {
        let deadline = Instant::now() + delay;
        let id = self
            .inner
            .timers
            .borrow_mut()
            .arm(deadline, target, Box::new(callback));
        debug!(timer = %id, delay_ms = delay.as_millis() as u64, "timer armed");
        id
    }

    pub fn disarm_timer(&self, id: TimerId) -> bool {
        self.inner.timers.borrow_mut().disarm(id)
    }

    /// Fire every timer due at `now` and run posted events.
    pub fn expire_timers(&self, now: Instant) -> usize {
        let expired = self.inner.timers.borrow_mut().expire(now);
        let count = expired.len();
        for timer in expired {
            trace!(timer = %timer.id, "timer fired");
            let id = timer.id;
            let callback = timer.callback;
            self.post(timer.target, move || callback(id));
        }
        self.run_pending();
        count
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.inner.timers.borrow().next_deadline()
    }

    pub fn armed_timer_count(&self) -> usize {
        self.inner.timers.borrow().len()
    }

    pub fn is_timer_armed(&self, id: TimerId) -> bool {
        self.inner.timers.borrow().is_armed(id)
    }
}
