// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Per-owner handle tables.
//!
//! A table is a sparse mapping from slot index to object id; the handle word
//! handed to the guest is built from the index plus the scope bit by
//! [`abi::Handle::for_index`]. Tables store ids only; the strong references
//! all live in the registry, and the kernel adjusts reference counts as
//! entries come and go.

use crate::object::ObjectId;

/// One owner's handle table (a process's or a thread's).
#[derive(Debug, Default)]
pub struct HandleTable {
    slots: Vec<Option<ObjectId>>,
}

impl HandleTable {
    /// Handle words reserve bit 15, so indexes stop short of it.
    const MAX_SLOTS: usize = 0x7FFF;

    pub fn new() -> Self {
        Self::default()
    }

    /// Installs `id` in the lowest free slot and returns the slot index, or
    /// `None` if the table is full. Slot 0 is never handed out: a zero
    /// handle word must keep reading as "no handle".
    pub fn install(&mut self, id: ObjectId) -> Option<u16> {
        if self.slots.is_empty() {
            self.slots.push(None);
        }
        if let Some(free) =
            self.slots.iter().skip(1).position(Option::is_none)
        {
            self.slots[free + 1] = Some(id);
            return Some((free + 1) as u16);
        }
        if self.slots.len() >= Self::MAX_SLOTS {
            return None;
        }
        self.slots.push(Some(id));
        Some((self.slots.len() - 1) as u16)
    }

    pub fn get(&self, index: u16) -> Option<ObjectId> {
        *self.slots.get(index as usize)?
    }

    /// Clears a slot, returning the id it held.
    pub fn remove(&mut self, index: u16) -> Option<ObjectId> {
        self.slots.get_mut(index as usize)?.take()
    }

    /// Live entries, in slot order. Used for teardown and for the refcount
    /// invariant checks.
    pub fn iter_live(&self) -> impl Iterator<Item = (u16, ObjectId)> + '_ {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(i, slot)| slot.map(|id| (i as u16, id)))
    }

    pub fn live_count(&self) -> usize {
        self.slots.iter().filter(|slot| slot.is_some()).count()
    }
}
