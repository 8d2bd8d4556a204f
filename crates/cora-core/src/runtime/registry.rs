//! Live-receiver registry.
//!
//! Every component that can be the target of a posted event holds a
//! [`ReceiverId`]. Ids are generational slab indices: retiring an id bumps the
//! slot's generation, so a stale id never matches a later occupant of the
//! same slot.

use std::fmt;

/// Handle to a registered event target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ReceiverId {
    index: u32,
    generation: u32,
}

impl fmt::Display for ReceiverId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}v{}", self.index, self.generation)
    }
}

#[derive(Debug)]
struct Slot {
    generation: u32,
    live: bool,
}

/// Generational slab of live receiver ids.
#[derive(Debug, Default)]
pub struct Registry {
    slots: Vec<Slot>,
    free: Vec<u32>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate a fresh live id.
    pub fn register(&mut self) -> ReceiverId {
        if let Some(index) = self.free.pop() {
            let slot = &mut self.slots[index as usize];
            slot.live = true;
            return ReceiverId {
                index,
                generation: slot.generation,
            };
        }
        let index = self.slots.len() as u32;
        self.slots.push(Slot {
            generation: 0,
            live: true,
        });
        ReceiverId {
            index,
            generation: 0,
        }
    }

    /// Retire an id. Retiring a stale id does nothing.
    pub fn retire(&mut self, id: ReceiverId) {
        if !self.is_valid(id) {
            return;
        }
        let slot = &mut self.slots[id.index as usize];
        slot.live = false;
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(id.index);
    }

    pub fn is_valid(&self, id: ReceiverId) -> bool {
        self.slots
            .get(id.index as usize)
            .is_some_and(|slot| slot.live && slot.generation == id.generation)
    }

    /// Number of live ids.
    pub fn live_count(&self) -> usize {
        self.slots.len() - self.free.len()
    }
}
