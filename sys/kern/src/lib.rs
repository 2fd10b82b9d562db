// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! EPOC emulator kernel core.
//!
//! This crate services supervisor calls from emulated guest code: it owns
//! the kernel objects a guest can name through handles (processes, threads,
//! chunks, servers, sessions, properties, timers, sync primitives), the
//! dispatch table mapping SVC ordinals onto handlers, and the cooperative
//! scheduling contract that lets guest threads block on asynchronous
//! requests. The CPU core, the loader, the HAL, and the host windowing
//! back-end are collaborators behind narrow traits; see `kernel` and `umem`
//! for the seams.
//!
//! # Design principles
//!
//! 1. One arena. Kernel objects live in a single id-keyed registry; handle
//!    tables and indexes store ids, never pointers.
//! 2. Tagged variants over downcasts. A lookup names the kind it expects
//!    and is refused on mismatch.
//! 3. Explicit context. Every handler receives the kernel context; there is
//!    no global mutable state.
//! 4. Handlers never block the host. Blocking a guest thread means
//!    recording a wait state and returning a scheduling hint.

pub mod chunk;
pub mod desc;
pub mod err;
pub mod handles;
pub mod ipc;
pub mod kernel;
pub mod library;
pub mod notifier;
pub mod object;
pub mod panics;
pub mod process;
pub mod property;
pub mod reqsts;
pub mod sched;
pub mod sync;
pub mod syscalls;
pub mod thread;
pub mod time;
pub mod umem;
