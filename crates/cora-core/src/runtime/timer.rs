//! One-shot timers.
//!
//! Timer ids come from a monotonic counter and are never reused, so a
//! component that remembers the id it armed can recognise a callback for a
//! timer it has since replaced or cancelled.

use std::collections::{BTreeMap, HashMap};
use std::fmt;

use tokio::time::Instant;

use super::registry::ReceiverId;

/// Identifier of an armed timer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TimerId(u64);

impl TimerId {
    pub fn value(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for TimerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "timer-{}", self.0)
    }
}

pub(crate) type TimerCallback = Box<dyn FnOnce(TimerId)>;

/// A timer whose deadline has passed.
pub(crate) struct ExpiredTimer {
    pub id: TimerId,
    pub target: ReceiverId,
    pub callback: TimerCallback,
}

struct Armed {
    target: ReceiverId,
    callback: TimerCallback,
}

/// Deadline-ordered set of armed timers.
#[derive(Default)]
pub(crate) struct TimerQueue {
    next_id: u64,
    by_deadline: BTreeMap<(Instant, TimerId), Armed>,
    deadlines: HashMap<TimerId, Instant>,
}

impl TimerQueue {
    pub fn arm(&mut self, deadline: Instant, target: ReceiverId, callback: TimerCallback) -> TimerId {
        self.next_id += 1;
        let id = TimerId(self.next_id);
        self.by_deadline.insert((deadline, id), Armed { target, callback });
        self.deadlines.insert(id, deadline);
        id
    }

    /// Cancel a timer. Returns false if it already fired or was cancelled.
    pub fn disarm(&mut self, id: TimerId) -> bool {
        match self.deadlines.remove(&id) {
            Some(deadline) => self.by_deadline.remove(&(deadline, id)).is_some(),
            None => false,
        }
    }

    /// Remove and return every timer due at or before `now`, earliest first.
    pub fn expire(&mut self, now: Instant) -> Vec<ExpiredTimer> {
        let mut expired = Vec::new();
        while let Some(entry) = self.by_deadline.first_entry() {
            if entry.key().0 > now {
                break;
            }
            let ((_, id), armed) = entry.remove_entry();
            self.deadlines.remove(&id);
            expired.push(ExpiredTimer {
                id,
                target: armed.target,
                callback: armed.callback,
            });
        }
        expired
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.by_deadline.keys().next().map(|(deadline, _)| *deadline)
    }

    pub fn len(&self) -> usize {
        self.deadlines.len()
    }

    pub fn is_armed(&self, id: TimerId) -> bool {
        self.deadlines.contains_key(&id)
    }
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;
    use std::rc::Rc;
    use std::time::Duration;

    use super::*;
    use crate::runtime::registry::Registry;

    #[test]
    fn expire_in_deadline_order() {
        let mut registry = Registry::new();
        let target = registry.register();
        let mut timers = TimerQueue::default();
        let now = Instant::now();
        let fired = Rc::new(RefCell::new(Vec::new()));

        for secs in [3u64, 1, 2] {
            let fired = fired.clone();
            timers.arm(
                now + Duration::from_secs(secs),
                target,
                Box::new(move |_| fired.borrow_mut().push(secs)),
            );
        }
        assert_eq!(timers.next_deadline(), Some(now + Duration::from_secs(1)));

        for timer in timers.expire(now + Duration::from_secs(2)) {
            (timer.callback)(timer.id);
        }
        assert_eq!(*fired.borrow(), [1, 2]);
        assert_eq!(timers.len(), 1);
    }

    #[test]
    fn disarm_and_ids_are_unique() {
        let mut registry = Registry::new();
        let target = registry.register();
        let mut timers = TimerQueue::default();
        let now = Instant::now();

        let a = timers.arm(now, target, Box::new(|_| {}));
        let b = timers.arm(now, target, Box::new(|_| {}));
        assert_ne!(a, b);
        assert!(timers.is_armed(a));
        assert!(timers.disarm(a));
        assert!(!timers.disarm(a));
        assert!(!timers.is_armed(a));

        let expired = timers.expire(now);
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].id, b);
        assert!(timers.next_deadline().is_none());
    }
}
