// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Common error-handling support.
//!
//! Handlers internally use `Result` with this module's error type; a single
//! adapter in `syscalls` flattens everything to the signed 32-bit code the
//! guest ABI expects. This keeps the legacy convention exact at the boundary
//! without threading raw integers through the implementation.

use abi::ErrorCode;

use crate::sched::NextThread;
use crate::umem::GuestFault;

/// An error committed by guest code when interacting with a syscall.
///
/// This is used internally as the returned error type for syscall
/// implementations.
#[derive(Clone, Debug)]
pub enum UserError {
    /// A recoverable error, indicated to the errant thread by returning a
    /// response code. It may still cause a context switch, as indicated by
    /// the `NextThread`.
    Recoverable(ErrorCode, NextThread),
    /// A kernel-side consistency failure (an object of unexpected variant, a
    /// corrupt wait queue). These are logged at error severity by the
    /// dispatcher; the guest observes `General`.
    Internal(&'static str),
}

impl UserError {
    /// Shorthand for a recoverable error with no scheduling consequence.
    pub fn code(code: ErrorCode) -> Self {
        Self::Recoverable(code, NextThread::Same)
    }
}

/// Convenience conversion for the common no-hint case.
impl From<ErrorCode> for UserError {
    fn from(code: ErrorCode) -> Self {
        Self::code(code)
    }
}

/// A guest pointer that failed translation surfaces as `Argument` unless the
/// handler maps it to something more specific first.
impl From<GuestFault> for UserError {
    fn from(_: GuestFault) -> Self {
        Self::code(ErrorCode::Argument)
    }
}

/// Default mapping for descriptor problems. Call sites with a more specific
/// contract (the IPC copy path, mostly) match on [`DesError`] themselves.
impl From<crate::desc::DesError> for UserError {
    fn from(e: crate::desc::DesError) -> Self {
        use crate::desc::DesError;
        match e {
            DesError::Fault(f) => f.into(),
            DesError::BadType => Self::code(ErrorCode::BadDescriptor),
            DesError::Overflow => Self::code(ErrorCode::NoMemory),
        }
    }
}

/// Value and scheduling consequence of a completed syscall.
///
/// The dispatcher writes `ret` into the caller's return register before
/// acting on `hint`, so a handler that blocks its caller can still choose
/// the value the thread will observe when it resumes.
#[derive(Clone, Debug)]
#[must_use]
pub struct Reply {
    pub ret: i32,
    pub hint: NextThread,
}

impl Reply {
    /// `None` (0) with no scheduling consequence. The shape of most calls.
    pub fn ok() -> Self {
        Self::value(ErrorCode::None.as_i32())
    }

    /// An arbitrary return value (handle, length, address) with no
    /// scheduling consequence.
    pub fn value(ret: i32) -> Self {
        Self {
            ret,
            hint: NextThread::Same,
        }
    }

    /// The caller has been blocked; `ret` is what it sees on resume.
    pub fn blocked(ret: i32) -> Self {
        Self {
            ret,
            hint: NextThread::Other,
        }
    }

    pub fn with_hint(mut self, hint: NextThread) -> Self {
        self.hint = self.hint.combine(hint);
        self
    }
}

pub type SysResult = Result<Reply, UserError>;
