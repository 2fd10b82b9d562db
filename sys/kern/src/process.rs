// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Guest processes.
//!
//! The loader collaborator constructs these; the kernel core owns them
//! afterwards. A process is mostly a container: the process-scoped handle
//! table, the command line and argument slots the runtime reads at startup,
//! identity (UIDs, security info), and bookkeeping that outlives any one of
//! its threads.

use abi::{ExitType, Priority, SecurityInfo, UidType, PROCESS_ARG_SLOTS};

use crate::handles::HandleTable;
use crate::object::ObjectId;
use crate::reqsts::Logon;

/// One argument-parameter slot. Slots are write-once until consumed: the
/// launcher fills them, the child reads them.
#[derive(Clone, Debug, Default)]
pub struct ArgSlot {
    pub used: bool,
    pub data: Vec<u8>,
}

/// Internal representation of a guest process.
#[derive(Debug)]
pub struct Process {
    /// Process-scoped handle entries.
    pub handles: HandleTable,
    /// Command line, in the guest's wide encoding.
    pub command_line: Vec<u16>,
    pub arg_slots: [ArgSlot; PROCESS_ARG_SLOTS],
    pub uids: UidType,
    pub security: SecurityInfo,
    pub priority: Priority,
    pub flags: u32,
    pub exit_type: ExitType,
    pub exit_reason: i32,
    /// Exit/rendezvous watchers.
    pub logons: Vec<Logon>,
    /// The DLL lock, a kernel-created mutex.
    pub dll_lock: Option<ObjectId>,
    /// Live (non-dead) threads. The process dies with its last thread.
    pub thread_count: u32,
    /// Entry points of statically linked DLLs, reported by `StaticCallList`.
    pub entry_points: Vec<u32>,
    /// Exception descriptor addresses per code range, consulted by
    /// `ExceptionDescriptor`.
    pub exception_descriptors: Vec<(std::ops::Range<u32>, u32)>,
}

impl Process {
    pub fn new(uids: UidType, command_line: Vec<u16>) -> Self {
        Self {
            handles: HandleTable::new(),
            command_line,
            arg_slots: Default::default(),
            uids,
            security: SecurityInfo::default(),
            priority: Priority::NORMAL,
            flags: 0,
            exit_type: ExitType::Pending,
            exit_reason: 0,
            logons: Vec::new(),
            dll_lock: None,
            thread_count: 0,
            entry_points: Vec::new(),
            exception_descriptors: Vec::new(),
        }
    }

    pub fn arg_slot(&self, slot: usize) -> Option<&ArgSlot> {
        self.arg_slots.get(slot)
    }

    /// Fills slot `slot`. Fails when the slot was already set; within a
    /// process a slot is set at most once before being read.
    pub fn set_arg_slot(&mut self, slot: usize, data: Vec<u8>) -> bool {
        match self.arg_slots.get_mut(slot) {
            Some(entry) if !entry.used => {
                entry.used = true;
                entry.data = data;
                true
            }
            _ => false,
        }
    }

    /// Applies the guest flag-update rule: clear first, then set.
    pub fn update_flags(&mut self, clear_mask: u32, set_mask: u32) {
        self.flags = (self.flags & !clear_mask) | set_mask;
    }

    /// Finds the exception descriptor covering a code address.
    pub fn exception_descriptor(&self, addr: u32) -> Option<u32> {
        self.exception_descriptors
            .iter()
            .find(|(range, _)| range.contains(&addr))
            .map(|(_, desc)| *desc)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn arg_slots_are_write_once() {
        let mut p = Process::new(UidType::default(), Vec::new());
        assert!(p.set_arg_slot(3, vec![1, 2, 3]));
        assert!(!p.set_arg_slot(3, vec![4]));
        assert_eq!(p.arg_slot(3).unwrap().data, vec![1, 2, 3]);
        assert!(!p.arg_slot(4).unwrap().used);
    }

    #[test]
    fn slot_index_is_bounded() {
        let mut p = Process::new(UidType::default(), Vec::new());
        assert!(!p.set_arg_slot(PROCESS_ARG_SLOTS, vec![0]));
        assert!(p.arg_slot(PROCESS_ARG_SLOTS).is_none());
    }

    #[test]
    fn flag_update_clears_then_sets() {
        let mut p = Process::new(UidType::default(), Vec::new());
        p.flags = 0b1100;
        p.update_flags(0b0100, 0b0011);
        assert_eq!(p.flags, 0b1011);
    }
}
