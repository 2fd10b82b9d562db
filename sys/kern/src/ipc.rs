// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Client/server IPC state: servers, sessions, and pooled messages.
//!
//! The flow is intentionally narrow. A session send builds a message and
//! enqueues it at the server; the server's single pending-receive slot, when
//! armed, drains the queue one message at a time into guest memory; message
//! completion writes the client's request status and wakes it. All of the
//! cross-object wiring (delivery, completion, kill) lives in the kernel
//! context, which can reach both ends; this module is the state.

use std::collections::VecDeque;

use abi::ipc_arg;

use crate::object::ObjectId;
use crate::reqsts::Waiter;
use crate::umem::GuestAddr;

/// The four argument words and their flag word, as captured at send time.
/// The flag word keeps the low twelve type-tag bits plus the pin bits.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct IpcArgs {
    pub args: [i32; 4],
    pub flags: u32,
}

impl IpcArgs {
    pub fn capture(args: [i32; 4], raw_flags: u32) -> Self {
        Self {
            args,
            flags: raw_flags & (ipc_arg::TAG_MASK | ipc_arg::PIN_MASK),
        }
    }

    /// The 3-bit type tag of argument `i`.
    pub fn tag(&self, i: usize) -> u32 {
        ipc_arg::tag(self.flags, i)
    }

    /// Checks argument `i` is a descriptor of the requested width and
    /// returns its guest address.
    pub fn descriptor(&self, i: usize, wide: bool) -> Option<GuestAddr> {
        if i >= self.args.len() {
            return None;
        }
        let tag = self.tag(i);
        if !ipc_arg::is_des(tag) || ipc_arg::is_wide(tag) != wide {
            return None;
        }
        Some(self.args[i] as u32)
    }
}

/// A registered server endpoint.
#[derive(Debug, Default)]
pub struct Server {
    /// Messages sent but not yet picked up, FIFO.
    pub queue: VecDeque<ObjectId>,
    /// The armed receive, if the server is currently asking for a message.
    pub receive: Option<PendingReceive>,
}

impl Server {
    pub fn new() -> Self {
        Self::default()
    }
}

/// An armed `ServerReceive`: where to put the next message and whom to tell.
#[derive(Copy, Clone, Debug)]
pub struct PendingReceive {
    pub waiter: Waiter,
    /// Guest address of the `Message2` slot to fill.
    pub slot: GuestAddr,
}

/// A client's connection to a server.
#[derive(Debug)]
pub struct Session {
    pub server: ObjectId,
    /// Message-slot capacity requested at connect; queue admission control.
    pub slots: i32,
    /// Messages of this session currently in flight.
    pub in_flight: i32,
    /// Opaque guest-side cookie, set via `SetSessionPtr` and echoed in
    /// every delivered message.
    pub cookie: u32,
}

impl Session {
    pub fn new(server: ObjectId, slots: i32) -> Self {
        Self {
            server,
            slots,
            in_flight: 0,
            cookie: 0,
        }
    }
}

/// A pooled in-flight message.
#[derive(Debug)]
pub struct Message {
    pub function: i32,
    pub args: IpcArgs,
    pub session: ObjectId,
    /// Originating (client) thread.
    pub thread: ObjectId,
    /// Client's request status; `None` for blind sends.
    pub status: Option<GuestAddr>,
    /// Synchronous sends park the client until completion.
    pub blocking: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn capture_masks_flag_word() {
        let captured = IpcArgs::capture([0; 4], 0xFFFF_FFFF);
        assert_eq!(captured.flags, 0xFFFF);
    }

    #[test]
    fn descriptor_checks_tag_and_width() {
        // arg0: narrow des (4), arg1: wide des (5), arg2: plain scalar.
        let args = IpcArgs::capture([0x100, 0x200, 7, 0], 0o054);
        assert_eq!(args.descriptor(0, false), Some(0x100));
        assert_eq!(args.descriptor(0, true), None);
        assert_eq!(args.descriptor(1, true), Some(0x200));
        assert_eq!(args.descriptor(2, false), None);
        assert_eq!(args.descriptor(4, false), None);
    }
}
