//! Driver integration tests with paused tokio time.

use std::cell::{Cell, RefCell};
use std::rc::{Rc, Weak};
use std::time::Duration;

use cora_core::protocol::{CloseReason, Message, SessionNo};
use cora_core::transport::{ChannelTransport, Driver, Inbound, Outbound};
use cora_core::{Runtime, SessionReceiver};

#[derive(Default)]
struct Recorder {
    messages: Vec<u32>,
    broken: Vec<CloseReason>,
}

impl SessionReceiver for Recorder {
    fn on_message(&mut self, msg: Message) {
        self.messages.push(msg.message_type());
    }

    fn on_session_broken(&mut self, _session: SessionNo, reason: CloseReason) {
        self.broken.push(reason);
    }
}

#[tokio::test(start_paused = true)]
async fn driver_feeds_messages_and_timers() {
    let (transport, mut outbound) = ChannelTransport::new();
    let runtime = Runtime::new(transport);
    let (mut driver, inbound) = Driver::channel(runtime.clone());

    let recorder = Rc::new(RefCell::new(Recorder::default()));
    let weak: Weak<RefCell<dyn SessionReceiver>> = Rc::downgrade(&recorder) as _;
    let session = runtime.open_session(weak).unwrap();
    assert_eq!(outbound.try_recv().unwrap(), Outbound::Open(session));

    let target = runtime.register();
    let fired = Rc::new(Cell::new(false));
    let fired_in_timer = fired.clone();
    runtime.arm_timer(target, Duration::from_secs(10), move |_| fired_in_timer.set(true));

    inbound.send(Inbound::Message(Message::new(session, 42))).unwrap();
    inbound
        .send(Inbound::SessionBroken {
            session,
            reason: CloseReason::ConnectionLost,
        })
        .unwrap();

    // The inbound sender stays open, so the driver only stops at the timeout.
    let result = tokio::time::timeout(Duration::from_secs(30), driver.run()).await;
    assert!(result.is_err());

    assert_eq!(recorder.borrow().messages, [42]);
    assert_eq!(recorder.borrow().broken, [CloseReason::ConnectionLost]);
    assert!(fired.get());
    assert_eq!(runtime.armed_timer_count(), 0);
}

#[tokio::test]
async fn driver_stops_when_inbound_closes() {
    let (transport, _outbound) = ChannelTransport::new();
    let runtime = Runtime::new(transport);
    let (mut driver, inbound) = Driver::channel(runtime);

    let posted = Rc::new(Cell::new(0));
    let target = driver.runtime().register();
    let posted_in_event = posted.clone();
    driver
        .runtime()
        .post(target, move || posted_in_event.set(posted_in_event.get() + 1));

    drop(inbound);
    driver.run().await;
    assert_eq!(posted.get(), 1);
}
