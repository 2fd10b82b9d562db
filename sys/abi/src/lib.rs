// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Guest-visible ABI definitions, shared between the kernel core and anything
//! that pokes at guest memory on its behalf (loader, CPU shim, tests).
//!
//! Everything in this crate is part of the contract with emulated EPOC
//! software and must stay bit-exact: error codes, handle encoding, the SVC
//! ordinal space, and the guest-memory struct layouts.

#![no_std]

use serde::{Deserialize, Serialize};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

/// The signed 32-bit error set returned to guest code in `r0`.
///
/// Positive values carry handles or lengths; callers inspect the sign where
/// the two overlap. `repr(i32)` keeps the discriminants usable directly as
/// return values.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[repr(i32)]
pub enum ErrorCode {
    None = 0,
    NotFound = -1,
    General = -2,
    Cancelled = -3,
    NoMemory = -4,
    NotSupported = -5,
    Argument = -6,
    BadHandle = -8,
    InUse = -14,
    BadDescriptor = -15,
}

impl ErrorCode {
    pub const fn as_i32(self) -> i32 {
        self as i32
    }
}

/// Guest OS revisions with distinct dispatch tables.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum EpocVersion {
    /// EKA1-era, kept only so the ROM header address can be answered.
    Epoc6,
    /// The minimal 9.3 subset.
    Epoc93,
    /// The full 9.4 table.
    Epoc94,
}

/// Type used at the SVC boundary to name kernel objects.
///
/// A handle combines an index into its owner's handle table with two flag
/// bits: `SPECIAL` (bit 15) marks pseudo-handles that can be neither closed
/// nor duplicated without masking, and `THREAD_LOCAL` (bit 30) routes the
/// lookup to the calling thread's table instead of the process table.
///
/// Two well-known values sit outside the table space entirely:
/// [`Handle::CURRENT_PROCESS`] and [`Handle::CURRENT_THREAD`].
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[repr(transparent)]
pub struct Handle(pub u32);

impl Handle {
    pub const CURRENT_PROCESS: Self = Self(0xFFFF_8000);
    pub const CURRENT_THREAD: Self = Self(0xFFFF_8001);

    /// Pseudo-handle marker. Handles carrying this bit are rejected by close
    /// and duplicate unless the dispatcher strips it first.
    pub const SPECIAL_BIT: u32 = 0x8000;

    /// Scope marker: set for entries that live in a thread's table.
    pub const THREAD_LOCAL_BIT: u32 = 0x4000_0000;

    const INDEX_MASK: u32 = 0x7FFF;

    /// Fabricates a handle for a table slot in the given scope.
    pub const fn for_index(index: u16, thread_local: bool) -> Self {
        let mut raw = index as u32 & Self::INDEX_MASK;
        if thread_local {
            raw |= Self::THREAD_LOCAL_BIT;
        }
        Handle(raw)
    }

    /// Extracts the table index, ignoring scope and special bits.
    pub const fn index(self) -> u16 {
        (self.0 & Self::INDEX_MASK) as u16
    }

    pub const fn is_thread_local(self) -> bool {
        self.0 & Self::THREAD_LOCAL_BIT != 0
    }

    pub const fn is_special(self) -> bool {
        self.0 & Self::SPECIAL_BIT != 0
    }

    /// Strips the special bit, for the table positions where the dispatcher
    /// is specified to accept a marked handle.
    pub const fn masked(self) -> Self {
        Handle(self.0 & !Self::SPECIAL_BIT)
    }
}

impl From<u32> for Handle {
    fn from(raw: u32) -> Self {
        Handle(raw)
    }
}

/// Kernel object kinds, numbered the way `ObjectNext`/`HandleOpenObject`
/// receive them from guest code.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[repr(u32)]
pub enum ObjectKind {
    Thread = 0,
    Process = 1,
    Chunk = 2,
    Library = 3,
    Semaphore = 4,
    Mutex = 5,
    Timer = 6,
    Server = 7,
    Session = 8,
    ChangeNotifier = 12,
    Property = 15,
    /// Kernel-internal; messages are pooled and never appear in the guest
    /// object-type numbering.
    Message = 16,
}

impl TryFrom<u32> for ObjectKind {
    type Error = ();

    fn try_from(raw: u32) -> Result<Self, ()> {
        Ok(match raw {
            0 => Self::Thread,
            1 => Self::Process,
            2 => Self::Chunk,
            3 => Self::Library,
            4 => Self::Semaphore,
            5 => Self::Mutex,
            6 => Self::Timer,
            7 => Self::Server,
            8 => Self::Session,
            12 => Self::ChangeNotifier,
            15 => Self::Property,
            _ => return Err(()),
        })
    }
}

/// Ownership scope requested at object/handle creation.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[repr(u32)]
pub enum OwnerType {
    Process = 0,
    Thread = 1,
}

impl TryFrom<u32> for OwnerType {
    type Error = ();

    fn try_from(raw: u32) -> Result<Self, ()> {
        match raw {
            0 => Ok(Self::Process),
            1 => Ok(Self::Thread),
            _ => Err(()),
        }
    }
}

/// Exit disposition of a thread or process.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[repr(i32)]
pub enum ExitType {
    Kill = 0,
    Terminate = 1,
    Panic = 2,
    Pending = 3,
}

impl TryFrom<i32> for ExitType {
    type Error = ();

    fn try_from(raw: i32) -> Result<Self, ()> {
        Ok(match raw {
            0 => Self::Kill,
            1 => Self::Terminate,
            2 => Self::Panic,
            3 => Self::Pending,
            _ => return Err(()),
        })
    }
}

/// Indicates scheduling importance of a thread.
///
/// Unlike most of this crate the numeric convention is guest-defined: higher
/// values are more important, and negative process-relative values exist.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Default, Serialize, Deserialize)]
#[repr(transparent)]
pub struct Priority(pub i32);

impl Priority {
    pub const NORMAL: Self = Priority(0);

    /// Checks if `self` is strictly more important than `other`, spelled out
    /// so call sites don't have to remember which direction the numbers run.
    pub fn is_more_important_than(self, other: Self) -> bool {
        self.0 > other.0
    }
}

/// Number of data-parameter slots a process carries.
pub const PROCESS_ARG_SLOTS: usize = 16;

/// Microseconds between the guest time basis (year 0 CE) and the Unix epoch.
pub const YEAR_ZERO_TO_UNIX_MICROS: u64 = 62_167_132_800 * 1_000_000;

/// A process's three UIDs, in guest layout.
#[derive(
    Copy, Clone, Debug, Default, Eq, PartialEq, FromBytes, IntoBytes,
    KnownLayout, Immutable,
)]
#[repr(C)]
pub struct UidType {
    pub uid1: u32,
    pub uid2: u32,
    pub uid3: u32,
}

/// Security attributes reported by the `*SecurityInfo` calls, in guest
/// layout: secure id, vendor id, and a two-word capability set.
#[derive(
    Copy, Clone, Debug, Default, Eq, PartialEq, FromBytes, IntoBytes,
    KnownLayout, Immutable,
)]
#[repr(C)]
pub struct SecurityInfo {
    pub secure_id: u32,
    pub vendor_id: u32,
    pub caps: [u32; 2],
}

/// Iteration cursor for `ObjectNext`, read and written in guest memory.
#[derive(
    Copy, Clone, Debug, Default, Eq, PartialEq, FromBytes, IntoBytes,
    KnownLayout, Immutable,
)]
#[repr(C)]
pub struct FindHandle {
    pub index: i32,
    pub id_low: u32,
    pub id_high: u32,
}

/// Control block for `MessageIpcCopy`. Must be exactly 12 bytes.
#[derive(
    Copy, Clone, Debug, Eq, PartialEq, FromBytes, IntoBytes, KnownLayout,
    Immutable,
)]
#[repr(C)]
pub struct IpcCopyInfo {
    pub target_ptr: u32,
    /// Capacity of the target, counted in characters of the selected width.
    pub target_len: i32,
    pub flags: i32,
}

/// `IpcCopyInfo::flags` bit selecting wide (16-bit) descriptors.
pub const IPC_COPY_WIDE: i32 = 0x8000_0000u32 as i32;
/// `IpcCopyInfo::flags` bit selecting write-to-client direction.
pub const IPC_COPY_WRITE: i32 = 0x1000_0000;

const _: () = assert!(core::mem::size_of::<IpcCopyInfo>() == 12);

/// The wire form a delivered message takes in the server's receive slot.
#[derive(
    Copy, Clone, Debug, Default, Eq, PartialEq, FromBytes, IntoBytes,
    KnownLayout, Immutable,
)]
#[repr(C)]
pub struct Message2 {
    pub handle: i32,
    pub function: i32,
    pub args: [i32; 4],
    pub spare1: i32,
    pub session_cookie: u32,
    pub flags: i32,
    pub spare3: i32,
}

const _: () = assert!(core::mem::size_of::<Message2>() == 40);

/// Creation block for `ThreadCreate`, read out of guest memory. Must be
/// exactly 64 bytes; the `name_*` pair is the guest's `TPtrC8` spelled out.
#[derive(
    Copy, Clone, Debug, Default, Eq, PartialEq, FromBytes, IntoBytes,
    KnownLayout, Immutable,
)]
#[repr(C)]
pub struct ThreadCreateInfo {
    pub handle: i32,
    pub kind: i32,
    pub func_ptr: u32,
    pub ptr: u32,
    pub supervisor_stack: u32,
    pub supervisor_stack_size: i32,
    pub user_stack: u32,
    pub user_stack_size: i32,
    pub priority: i32,
    pub name_len: u32,
    pub name_ptr: u32,
    pub total_size: i32,
    pub allocator: u32,
    pub heap_initial_size: i32,
    pub heap_max_size: i32,
    pub flags: i32,
}

const _: () = assert!(core::mem::size_of::<ThreadCreateInfo>() == 64);

/// Creation block for `ChunkCreate`, read out of guest memory.
#[derive(
    Copy, Clone, Debug, Default, Eq, PartialEq, FromBytes, IntoBytes,
    KnownLayout, Immutable,
)]
#[repr(C)]
pub struct ChunkCreateInfo {
    pub att: u32,
    pub force_fixed: i32,
    pub initial_bottom: i32,
    pub initial_top: i32,
    pub max_size: i32,
}

const _: () = assert!(core::mem::size_of::<ChunkCreateInfo>() == 20);

bitflags::bitflags! {
    /// Attribute word of [`ChunkCreateInfo`].
    #[derive(Copy, Clone, Debug, Eq, PartialEq)]
    pub struct ChunkCreateAtt: u32 {
        const DOUBLE_ENDED = 0x01;
        const DISCONNECTED = 0x02;
        const GLOBAL = 0x10;
        const CODE = 0x20;

        const _ = !0;
    }
}

/// Declaration block for `PropertyDefine`, read out of guest memory.
#[derive(
    Copy, Clone, Debug, Default, Eq, PartialEq, FromBytes, IntoBytes,
    KnownLayout, Immutable,
)]
#[repr(C)]
pub struct PropertyInfo {
    pub attr: u32,
    pub size: u16,
    pub kind: u16,
}

/// `PropertyInfo::kind` values the guest may declare.
pub const PROPERTY_TYPE_INT: u16 = 0;
pub const PROPERTY_TYPE_BYTE_ARRAY: u16 = 1;
pub const PROPERTY_TYPE_LARGE_BYTE_ARRAY: u16 = 3;

/// Per-argument type tags in the low 12 bits of an IPC flag word: three bits
/// per argument, `DES` optionally combined with `CONST` and `WIDE`.
pub mod ipc_arg {
    pub const UNSPECIFIED: u32 = 0;
    pub const HANDLE: u32 = 1;
    pub const FLAG_WIDE: u32 = 1;
    pub const FLAG_CONST: u32 = 2;
    pub const FLAG_DES: u32 = 4;

    /// Low 12 bits: four 3-bit tags.
    pub const TAG_MASK: u32 = (1 << 12) - 1;
    /// Bits 12..16: per-argument pin requests, preserved verbatim.
    pub const PIN_MASK: u32 = 0xF000;

    /// Extracts the 3-bit tag for argument `i`.
    pub const fn tag(flags: u32, i: usize) -> u32 {
        (flags >> (3 * i)) & 7
    }

    pub const fn is_des(tag: u32) -> bool {
        tag & FLAG_DES != 0
    }

    pub const fn is_wide(tag: u32) -> bool {
        tag & FLAG_WIDE != 0
    }
}

/// The SVC ordinal space. Ordinals at or above [`sysnum::FAST_BASE`] take the
/// fast path (scalar get/set against the calling thread's local data, no
/// argument marshalling); everything below is a slow exec call.
pub mod sysnum {
    pub const FAST_BASE: u32 = 0x0080_0000;

    // Fast executive calls.
    pub const WAIT_FOR_ANY_REQUEST: u32 = 0x0080_0000;
    pub const HEAP: u32 = 0x0080_0001;
    pub const HEAP_SWITCH: u32 = 0x0080_0002;
    pub const ACTIVE_SCHEDULER: u32 = 0x0080_0005;
    pub const SET_ACTIVE_SCHEDULER: u32 = 0x0080_0006;
    pub const TRAP_HANDLER: u32 = 0x0080_0008;
    pub const SET_TRAP_HANDLER: u32 = 0x0080_0009;
    pub const DEBUG_MASK: u32 = 0x0080_000C;
    pub const DEBUG_MASK_INDEX: u32 = 0x0080_000D;
    pub const USER_SVR_ROM_HEADER_ADDRESS: u32 = 0x0080_0013;
    pub const SAFE_INC_32: u32 = 0x0080_0015;
    pub const SAFE_DEC_32: u32 = 0x0080_0016;
    pub const UTC_OFFSET: u32 = 0x0080_0019;
    pub const GET_GLOBAL_USER_DATA: u32 = 0x0080_001A;

    // Slow executive calls.
    pub const OBJECT_NEXT: u32 = 0x00;
    pub const CHUNK_BASE: u32 = 0x01;
    pub const CHUNK_MAX_SIZE: u32 = 0x03;
    pub const LIBRARY_LOOKUP: u32 = 0x0E;
    pub const PROCESS_GET_ID: u32 = 0x13;
    pub const DLL_FILE_NAME: u32 = 0x14;
    pub const PROCESS_RESUME: u32 = 0x15;
    pub const PROCESS_FILENAME: u32 = 0x16;
    pub const PROCESS_COMMAND_LINE: u32 = 0x17;
    pub const PROCESS_EXIT_TYPE: u32 = 0x18;
    pub const PROCESS_SET_PRIORITY: u32 = 0x1C;
    pub const PROCESS_SET_FLAGS: u32 = 0x1E;
    pub const SEMAPHORE_WAIT: u32 = 0x1F;
    pub const SEMAPHORE_SIGNAL: u32 = 0x20;
    pub const SEMAPHORE_SIGNAL_N: u32 = 0x21;
    pub const SERVER_RECEIVE: u32 = 0x22;
    pub const SERVER_CANCEL: u32 = 0x23;
    pub const SET_SESSION_PTR: u32 = 0x24;
    pub const SESSION_SEND: u32 = 0x25;
    pub const THREAD_ID: u32 = 0x26;
    pub const SESSION_SHARE: u32 = 0x27;
    pub const THREAD_RESUME: u32 = 0x28;
    pub const THREAD_SUSPEND: u32 = 0x29;
    pub const THREAD_SET_PRIORITY: u32 = 0x2B;
    pub const THREAD_SET_FLAGS: u32 = 0x2F;
    pub const TIMER_CANCEL: u32 = 0x35;
    pub const TIMER_AFTER: u32 = 0x36;
    pub const TIMER_AT_UTC: u32 = 0x37;
    pub const CHANGE_NOTIFIER_LOGON: u32 = 0x39;
    pub const REQUEST_SIGNAL: u32 = 0x3B;
    pub const HANDLE_NAME: u32 = 0x3C;
    pub const AFTER: u32 = 0x40;
    pub const MESSAGE_COMPLETE: u32 = 0x42;
    pub const TIME_NOW: u32 = 0x44;
    pub const SESSION_SEND_SYNC: u32 = 0x4D;
    pub const DLL_TLS: u32 = 0x4E;
    pub const HAL_FUNCTION: u32 = 0x4F;
    pub const PROCESS_COMMAND_LINE_LENGTH: u32 = 0x52;
    pub const DEBUG_PRINT: u32 = 0x56;
    pub const PROCESS_TYPE: u32 = 0x64;
    pub const THREAD_CREATE: u32 = 0x68;
    pub const HANDLE_CLOSE: u32 = 0x6A;
    pub const CHUNK_CREATE: u32 = 0x6B;
    pub const CHUNK_ADJUST: u32 = 0x6C;
    pub const HANDLE_OPEN_OBJECT: u32 = 0x6D;
    pub const HANDLE_DUPLICATE: u32 = 0x6E;
    pub const MUTEX_CREATE: u32 = 0x6F;
    pub const SEMAPHORE_CREATE: u32 = 0x70;
    pub const THREAD_KILL: u32 = 0x73;
    pub const THREAD_LOGON: u32 = 0x74;
    pub const THREAD_LOGON_CANCEL: u32 = 0x75;
    pub const DLL_SET_TLS: u32 = 0x76;
    pub const DLL_FREE_TLS: u32 = 0x77;
    pub const THREAD_RENAME: u32 = 0x78;
    pub const PROCESS_LOGON: u32 = 0x7B;
    pub const PROCESS_LOGON_CANCEL: u32 = 0x7C;
    pub const THREAD_PROCESS: u32 = 0x7D;
    pub const SERVER_CREATE: u32 = 0x7E;
    pub const SESSION_CREATE: u32 = 0x7F;
    pub const TIMER_CREATE: u32 = 0x84;
    pub const CHANGE_NOTIFIER_CREATE: u32 = 0x87;
    pub const WAIT_DLL_LOCK: u32 = 0x9C;
    pub const RELEASE_DLL_LOCK: u32 = 0x9D;
    pub const LIBRARY_ATTACH: u32 = 0x9E;
    pub const LIBRARY_ATTACHED: u32 = 0x9F;
    pub const STATIC_CALL_LIST: u32 = 0xA0;
    pub const LAST_THREAD_HANDLE: u32 = 0xA3;
    pub const PROCESS_RENDEZVOUS: u32 = 0xA5;
    pub const MESSAGE_GET_DES_LENGTH: u32 = 0xA6;
    pub const MESSAGE_GET_DES_MAX_LENGTH: u32 = 0xA7;
    pub const MESSAGE_IPC_COPY: u32 = 0xA8;
    pub const MESSAGE_KILL: u32 = 0xAC;
    pub const PROCESS_SECURITY_INFO: u32 = 0xAE;
    pub const THREAD_SECURITY_INFO: u32 = 0xAF;
    pub const MESSAGE_SECURITY_INFO: u32 = 0xB0;
    pub const PROPERTY_DEFINE: u32 = 0xBC;
    pub const PROPERTY_ATTACH: u32 = 0xBE;
    pub const PROPERTY_SUBSCRIBE: u32 = 0xBF;
    pub const PROPERTY_CANCEL: u32 = 0xC0;
    pub const PROPERTY_GET_INT: u32 = 0xC1;
    pub const PROPERTY_GET_BIN: u32 = 0xC2;
    pub const PROPERTY_SET_INT: u32 = 0xC3;
    pub const PROPERTY_SET_BIN: u32 = 0xC4;
    pub const PROPERTY_FIND_GET_INT: u32 = 0xC5;
    pub const PROPERTY_FIND_GET_BIN: u32 = 0xC6;
    pub const PROPERTY_FIND_SET_INT: u32 = 0xC7;
    pub const PROPERTY_FIND_SET_BIN: u32 = 0xC8;
    pub const PROCESS_SET_DATA_PARAMETER: u32 = 0xCF;
    pub const PROCESS_GET_DATA_PARAMETER: u32 = 0xD1;
    pub const PROCESS_DATA_PARAMETER_LENGTH: u32 = 0xD2;
    pub const PLAT_SEC_DIAGNOSTIC: u32 = 0xDB;
    pub const EXCEPTION_DESCRIPTOR: u32 = 0xDC;
    pub const THREAD_REQUEST_SIGNAL: u32 = 0xDD;
    pub const LEAVE_START: u32 = 0xDF;
    pub const LEAVE_END: u32 = 0xE0;
}
