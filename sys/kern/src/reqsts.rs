// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The request-status completion protocol.
//!
//! Every asynchronous operation records a guest-side status cell and the
//! thread that owns it. Completion writes the signed result into the cell
//! and then posts one request signal to the owner; a thread parked in
//! `WaitForAnyRequest` wakes on the first signal. Cancellation is just a
//! completion with `Cancelled`, and cancelling something already completed
//! is specified to be a silent no-op, which falls out of waiters being
//! removed from their queues at completion time.

use abi::ErrorCode;
use byteorder::{ByteOrder, LittleEndian};

use crate::object::{ObjectId, Registry};
use crate::sched::NextThread;
use crate::umem::{GuestAddr, GuestMem};

/// The value a status cell holds while its request is outstanding. The
/// kernel never writes it; guest-side libraries prime cells with it.
pub const REQUEST_PENDING: i32 = -2_147_483_647;

/// A parked asynchronous request: who to wake, and where to write.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct Waiter {
    pub thread: ObjectId,
    pub status: GuestAddr,
}

/// A thread- or process-termination watch. `rendezvous` watches complete at
/// the watched party's rendezvous rather than its exit.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct Logon {
    pub waiter: Waiter,
    pub rendezvous: bool,
}

/// Completes `waiter` with `code`: status write, then wake-up signal.
///
/// A status cell the guest has since unmapped is logged and otherwise
/// ignored; the owning thread is still signalled so it cannot deadlock on a
/// completion it can no longer observe.
pub fn complete(
    registry: &mut Registry,
    mem: &mut dyn GuestMem,
    waiter: Waiter,
    code: i32,
) -> NextThread {
    if waiter.status != 0 {
        let mut cell = [0u8; 4];
        LittleEndian::write_i32(&mut cell, code);
        if mem.write(waiter.status, &cell).is_err() {
            log::warn!(
                "request status at {:#010x} unreachable, dropping code {}",
                waiter.status,
                code
            );
        }
    }
    signal(registry, waiter.thread, 1)
}

/// Convenience wrapper for the common `ErrorCode` completions.
pub fn complete_code(
    registry: &mut Registry,
    mem: &mut dyn GuestMem,
    waiter: Waiter,
    code: ErrorCode,
) -> NextThread {
    complete(registry, mem, waiter, code.as_i32())
}

/// Posts `count` request signals to `thread`, waking it if it is parked in
/// `WaitForAnyRequest`.
pub fn signal(
    registry: &mut Registry,
    thread: ObjectId,
    count: i32,
) -> NextThread {
    match registry.thread_mut(thread) {
        Some(state) => {
            if state.signal_request(count) {
                NextThread::Specific(thread)
            } else {
                NextThread::Same
            }
        }
        None => NextThread::Same,
    }
}
