// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! End-to-end syscall tests: a kernel over flat guest memory, driven
//! through `dispatch` exactly the way the CPU shim drives it.

use super::*;
use crate::kernel::{KernelConfig, ProcessInit};
use crate::thread::ThreadState;
use crate::time::{ManualClock, Timestamp};
use crate::umem::{read_val, FlatMem};
use abi::Message2;

const MEM_BASE: u32 = 0x0010_0000;
const MEM_SIZE: u32 = 0x0100_0000;

// Scratch addresses for guest-side structures, far above the chunk
// reservation cursor.
const NAME: u32 = 0x0090_0000;
const STS_A: u32 = 0x0090_0200;
const STS_B: u32 = 0x0090_0204;
const MSG_SLOT: u32 = 0x0090_0300;
const ARGS: u32 = 0x0090_0400;
const INFO: u32 = 0x0090_0500;
const FIND: u32 = 0x0090_0600;
const DES: u32 = 0x0090_0700;
const BUF: u32 = 0x0090_0800;
const CELL: u32 = 0x0090_0900;

fn boot() -> (Kernel, ObjectId) {
    let mem = FlatMem::new(MEM_BASE, MEM_SIZE);
    let clock = ManualClock {
        unix_micros: 1_000_000_000,
        offset_seconds: 3600,
    };
    let mut k = Kernel::new(
        Box::new(mem),
        Box::new(clock),
        KernelConfig::default(),
    );
    let (_, thread) = k.spawn_process(ProcessInit {
        name: "test".into(),
        command_line: "app.exe -x".into(),
        ..Default::default()
    });
    k.schedule_thread(thread);
    k.set_current_thread(Some(thread));
    (k, thread)
}

fn add_thread(k: &mut Kernel) -> ObjectId {
    let process = k.current_process().unwrap();
    let t = k.spawn_thread(process, "worker".into(), Priority::NORMAL);
    k.schedule_thread(t);
    t
}

/// Loads the argument registers and dispatches `nr` as `caller`, returning
/// what the guest would see in `r0`.
fn svc(k: &mut Kernel, caller: ObjectId, nr: u32, args: &[u32]) -> i32 {
    {
        let t = k.registry.thread_mut(caller).unwrap();
        t.save.r = [0; 16];
        t.save.r[..args.len()].copy_from_slice(args);
    }
    k.set_current_thread(Some(caller));
    let _ = dispatch(k, nr);
    k.registry.thread(caller).unwrap().save.r[0] as i32
}

fn put_word(k: &mut Kernel, addr: u32, word: u32) {
    let mut bytes = [0u8; 4];
    LittleEndian::write_u32(&mut bytes, word);
    k.mem_mut().write(addr, &bytes).unwrap();
}

fn read_i32(k: &Kernel, addr: u32) -> i32 {
    read_val(k.mem(), addr).unwrap()
}

/// Primes a status cell the way guest-side code does, so a completion is
/// distinguishable from a cell nobody touched.
fn prime_status(k: &mut Kernel, addr: u32) {
    put_word(k, addr, crate::reqsts::REQUEST_PENDING as u32);
}

/// Builds a constant narrow descriptor (`EBufC`) holding `content`.
fn make_bufc8(k: &mut Kernel, addr: u32, content: &[u8]) {
    put_word(k, addr, content.len() as u32);
    k.mem_mut().write(addr + 4, content).unwrap();
}

/// Builds a modifiable narrow descriptor (`EBuf`) with capacity `max`.
fn make_buf8(k: &mut Kernel, addr: u32, max: u32, content: &[u8]) {
    put_word(k, addr, 3 << 28 | content.len() as u32);
    put_word(k, addr + 4, max);
    k.mem_mut().write(addr + 8, content).unwrap();
}

fn make_ipc_args(k: &mut Kernel, addr: u32, args: [i32; 4], flags: u32) {
    for (i, arg) in args.iter().enumerate() {
        put_word(k, addr + 4 * i as u32, *arg as u32);
    }
    put_word(k, addr + 16, flags);
}

fn thread_state(k: &Kernel, t: ObjectId) -> ThreadState {
    k.registry.thread(t).unwrap().state
}

// ----------------------------------------------------------------------
// Dispatch basics
// ----------------------------------------------------------------------

#[test]
fn unknown_ordinal_is_not_supported() {
    let (mut k, a) = boot();
    assert_eq!(
        svc(&mut k, a, 0xFF, &[]),
        ErrorCode::NotSupported.as_i32()
    );
    assert_eq!(
        svc(&mut k, a, sysnum::FAST_BASE + 0x30, &[]),
        ErrorCode::NotSupported.as_i32()
    );
}

#[test]
fn v93_table_is_the_minimal_subset() {
    let (mut k, a) = boot();
    k.config.version = EpocVersion::Epoc93;
    // Present: the fast local-data calls and ObjectNext.
    assert_eq!(svc(&mut k, a, sysnum::HEAP_SWITCH, &[0xD00D]), 0);
    assert_eq!(svc(&mut k, a, sysnum::HEAP, &[]), 0xD00D);
    // Ordinal 0xD is the plain debug mask on 9.3.
    k.config.debug_mask = 96;
    assert_eq!(svc(&mut k, a, sysnum::DEBUG_MASK_INDEX, &[5]), 96);
    // Absent: everything else.
    assert_eq!(
        svc(&mut k, a, sysnum::SESSION_CREATE, &[NAME, 1]),
        ErrorCode::NotSupported.as_i32()
    );
}

#[test]
fn fast_calls_access_thread_local_data() {
    let (mut k, a) = boot();
    assert_eq!(svc(&mut k, a, sysnum::HEAP, &[]), 0);
    assert_eq!(svc(&mut k, a, sysnum::HEAP_SWITCH, &[0x1234]), 0);
    assert_eq!(svc(&mut k, a, sysnum::HEAP_SWITCH, &[0x5678]), 0x1234);
    assert_eq!(svc(&mut k, a, sysnum::TRAP_HANDLER, &[]), 0);
    assert_eq!(svc(&mut k, a, sysnum::SET_TRAP_HANDLER, &[0xAA]), 0xAA);
    assert_eq!(svc(&mut k, a, sysnum::SET_ACTIVE_SCHEDULER, &[0xBB]), 0);
    assert_eq!(svc(&mut k, a, sysnum::ACTIVE_SCHEDULER, &[]), 0xBB);
    assert_eq!(svc(&mut k, a, sysnum::DEBUG_MASK, &[]), 0);
    assert_eq!(
        svc(&mut k, a, sysnum::USER_SVR_ROM_HEADER_ADDRESS, &[]) as u32,
        0x8000_0000
    );
}

#[test]
fn safe_inc_dec_mutate_the_guest_cell() {
    let (mut k, a) = boot();
    put_word(&mut k, CELL, 5);
    assert_eq!(svc(&mut k, a, sysnum::SAFE_INC_32, &[CELL]), 5);
    assert_eq!(read_i32(&k, CELL), 6);
    assert_eq!(svc(&mut k, a, sysnum::SAFE_DEC_32, &[CELL]), 6);
    assert_eq!(read_i32(&k, CELL), 5);

    put_word(&mut k, CELL, 0);
    assert_eq!(svc(&mut k, a, sysnum::SAFE_INC_32, &[CELL]), 0);
    assert_eq!(read_i32(&k, CELL), 0);
    assert_eq!(svc(&mut k, a, sysnum::SAFE_DEC_32, &[CELL]), 0);
    assert_eq!(read_i32(&k, CELL), 0);
}

#[test]
fn time_of_day_comes_from_the_clock() {
    let (mut k, a) = boot();
    assert_eq!(svc(&mut k, a, sysnum::UTC_OFFSET, &[]), 3600);
    assert_eq!(svc(&mut k, a, sysnum::TIME_NOW, &[CELL, CELL + 8]), 0);
    let micros: u64 = read_val(k.mem(), CELL).unwrap();
    assert_eq!(micros, 1_000_000_000 + YEAR_ZERO_TO_UNIX_MICROS);
    assert_eq!(read_i32(&k, CELL + 8), 3600);
}

// ----------------------------------------------------------------------
// Handles and sync objects
// ----------------------------------------------------------------------

#[test]
fn semaphore_signal_crosses_mirrored_handles() {
    let (mut k, a) = boot();
    make_bufc8(&mut k, NAME, b"s");
    let h1 = svc(&mut k, a, sysnum::SEMAPHORE_CREATE, &[NAME, 0, 0]);
    assert!(h1 > 0);

    let h2 = svc(
        &mut k,
        a,
        sysnum::HANDLE_DUPLICATE,
        &[Handle::CURRENT_THREAD.0, 0, h1 as u32],
    );
    assert!(h2 > 0);
    assert_ne!(h1, h2);
    // Same object behind both handle words.
    assert_eq!(
        k.resolve_handle(a, Handle(h1 as u32)),
        k.resolve_handle(a, Handle(h2 as u32)),
    );

    assert_eq!(svc(&mut k, a, sysnum::SEMAPHORE_SIGNAL, &[h1 as u32]), 0);
    assert_eq!(svc(&mut k, a, sysnum::SEMAPHORE_WAIT, &[h2 as u32, 0]), 0);
    assert_eq!(thread_state(&k, a), ThreadState::Ready);

    // No signal banked now; the next wait parks the thread.
    assert_eq!(svc(&mut k, a, sysnum::SEMAPHORE_WAIT, &[h2 as u32, 0]), 0);
    assert!(matches!(
        thread_state(&k, a),
        ThreadState::WaitingSemaphore(_)
    ));
}

#[test]
fn close_makes_a_handle_invalid_and_frees_the_object() {
    let (mut k, a) = boot();
    let before = k.registry.len();
    make_bufc8(&mut k, NAME, b"gone");
    let h = svc(&mut k, a, sysnum::SEMAPHORE_CREATE, &[NAME, 1, 0]);
    assert_eq!(svc(&mut k, a, sysnum::HANDLE_CLOSE, &[h as u32]), 0);
    assert_eq!(
        svc(&mut k, a, sysnum::SEMAPHORE_WAIT, &[h as u32, 0]),
        ErrorCode::BadHandle.as_i32()
    );
    assert_eq!(k.registry.len(), before);
}

#[test]
fn pseudo_handles_cannot_be_closed() {
    let (mut k, a) = boot();
    assert_eq!(
        svc(&mut k, a, sysnum::HANDLE_CLOSE, &[Handle::CURRENT_PROCESS.0]),
        ErrorCode::General.as_i32()
    );
    assert_eq!(
        svc(&mut k, a, sysnum::HANDLE_CLOSE, &[0x8000 | 3]),
        ErrorCode::General.as_i32()
    );
}

#[test]
fn object_next_walks_objects_of_one_kind() {
    let (mut k, a) = boot();
    make_bufc8(&mut k, NAME, b"pair");
    let _h1 = svc(&mut k, a, sysnum::SEMAPHORE_CREATE, &[NAME, 0, 0]);
    let _skip = svc(&mut k, a, sysnum::MUTEX_CREATE, &[NAME, 0]);
    let _h2 = svc(&mut k, a, sysnum::SEMAPHORE_CREATE, &[NAME, 0, 0]);

    put_word(&mut k, FIND, 0);
    put_word(&mut k, FIND + 4, 0);
    put_word(&mut k, FIND + 8, 0);
    assert_eq!(
        svc(&mut k, a, sysnum::OBJECT_NEXT, &[4, NAME, FIND]),
        0
    );
    let first: FindHandle = read_val(k.mem(), FIND).unwrap();
    assert_eq!(
        svc(&mut k, a, sysnum::OBJECT_NEXT, &[4, NAME, FIND]),
        0
    );
    let second: FindHandle = read_val(k.mem(), FIND).unwrap();
    assert!(second.index > first.index);
    assert_eq!(
        svc(&mut k, a, sysnum::OBJECT_NEXT, &[4, NAME, FIND]),
        ErrorCode::NotFound.as_i32()
    );
}

#[test]
fn handle_name_reports_the_object_name() {
    let (mut k, a) = boot();
    make_bufc8(&mut k, NAME, b"reported");
    let h = svc(&mut k, a, sysnum::SEMAPHORE_CREATE, &[NAME, 0, 0]);
    make_buf8(&mut k, DES, 32, b"");
    assert_eq!(
        svc(&mut k, a, sysnum::HANDLE_NAME, &[h as u32, DES]),
        0
    );
    assert_eq!(desc::read_str8(k.mem(), DES).unwrap(), b"reported");
}

#[test]
fn last_thread_handle_tracks_creation() {
    let (mut k, a) = boot();
    make_bufc8(&mut k, NAME, b"s");
    let h = svc(&mut k, a, sysnum::SEMAPHORE_CREATE, &[NAME, 0, 0]);
    assert_eq!(svc(&mut k, a, sysnum::LAST_THREAD_HANDLE, &[]), h);
}

// ----------------------------------------------------------------------
// The server round trip
// ----------------------------------------------------------------------

#[test]
fn server_round_trip() {
    let (mut k, a) = boot();
    let b = add_thread(&mut k);
    make_bufc8(&mut k, NAME, b"Echo");

    let s = svc(&mut k, a, sysnum::SERVER_CREATE, &[NAME, 0]);
    assert!(s > 0);
    let c = svc(&mut k, b, sysnum::SESSION_CREATE, &[NAME, 1, 0, 0]);
    assert!(c > 0);

    prime_status(&mut k, STS_A);
    prime_status(&mut k, STS_B);
    assert_eq!(
        svc(&mut k, a, sysnum::SERVER_RECEIVE, &[s as u32, STS_A, MSG_SLOT]),
        0
    );
    make_ipc_args(&mut k, ARGS, [1, 2, 3, 4], 0);
    assert_eq!(
        svc(
            &mut k,
            b,
            sysnum::SESSION_SEND_SYNC,
            &[c as u32, 42, ARGS, STS_B]
        ),
        0
    );

    // Delivery: the server's slot holds the message, its status completed.
    let msg: Message2 = read_val(k.mem(), MSG_SLOT).unwrap();
    assert_eq!(msg.function, 42);
    assert_eq!(msg.args, [1, 2, 3, 4]);
    assert_eq!(read_i32(&k, STS_A), 0);
    assert!(matches!(
        thread_state(&k, b),
        ThreadState::WaitingMessage(_)
    ));

    assert_eq!(
        svc(&mut k, a, sysnum::MESSAGE_COMPLETE, &[msg.handle as u32, 7]),
        0
    );
    assert_eq!(read_i32(&k, STS_B), 7);
    assert_eq!(thread_state(&k, b), ThreadState::Ready);

    // The pooled message is gone; completing twice is a bad handle.
    assert_eq!(
        svc(&mut k, a, sysnum::MESSAGE_COMPLETE, &[msg.handle as u32, 7]),
        ErrorCode::BadHandle.as_i32()
    );
}

#[test]
fn receive_drains_a_message_queued_earlier() {
    let (mut k, a) = boot();
    let b = add_thread(&mut k);
    make_bufc8(&mut k, NAME, b"Queue");
    let s = svc(&mut k, a, sysnum::SERVER_CREATE, &[NAME, 0]);
    let c = svc(&mut k, b, sysnum::SESSION_CREATE, &[NAME, 4, 0, 0]);

    // Async send before anyone listens.
    prime_status(&mut k, STS_A);
    prime_status(&mut k, STS_B);
    make_ipc_args(&mut k, ARGS, [9, 0, 0, 0], 0);
    assert_eq!(
        svc(&mut k, b, sysnum::SESSION_SEND, &[c as u32, 5, ARGS, STS_B]),
        0
    );
    assert_eq!(thread_state(&k, b), ThreadState::Ready);

    assert_eq!(
        svc(&mut k, a, sysnum::SERVER_RECEIVE, &[s as u32, STS_A, MSG_SLOT]),
        0
    );
    let msg: Message2 = read_val(k.mem(), MSG_SLOT).unwrap();
    assert_eq!(msg.function, 5);
    assert_eq!(read_i32(&k, STS_A), 0);

    // Completion reaches the async client through its request signal.
    assert_eq!(
        svc(&mut k, a, sysnum::MESSAGE_COMPLETE, &[msg.handle as u32, 1]),
        0
    );
    assert_eq!(read_i32(&k, STS_B), 1);
    assert_eq!(k.registry.thread(b).unwrap().request_sema(), 1);
}

#[test]
fn connecting_to_an_unknown_server_fails() {
    let (mut k, a) = boot();
    make_bufc8(&mut k, NAME, b"Nobody");
    assert_eq!(
        svc(&mut k, a, sysnum::SESSION_CREATE, &[NAME, 1, 0, 0]),
        ErrorCode::NotFound.as_i32()
    );
}

#[test]
fn server_names_are_exclusive() {
    let (mut k, a) = boot();
    make_bufc8(&mut k, NAME, b"Dup");
    assert!(svc(&mut k, a, sysnum::SERVER_CREATE, &[NAME, 0]) > 0);
    assert_eq!(
        svc(&mut k, a, sysnum::SERVER_CREATE, &[NAME, 0]),
        ErrorCode::InUse.as_i32()
    );
}

#[test]
fn server_cancel_completes_the_receive() {
    let (mut k, a) = boot();
    make_bufc8(&mut k, NAME, b"Cancel");
    let s = svc(&mut k, a, sysnum::SERVER_CREATE, &[NAME, 0]);
    assert_eq!(
        svc(&mut k, a, sysnum::SERVER_RECEIVE, &[s as u32, STS_A, MSG_SLOT]),
        0
    );
    assert_eq!(svc(&mut k, a, sysnum::SERVER_CANCEL, &[s as u32]), 0);
    assert_eq!(read_i32(&k, STS_A), ErrorCode::Cancelled.as_i32());
}

#[test]
fn session_share_moves_the_handle_to_the_process() {
    let (mut k, a) = boot();
    let b = add_thread(&mut k);
    make_bufc8(&mut k, NAME, b"Share");
    let s = svc(&mut k, a, sysnum::SERVER_CREATE, &[NAME, 0]);
    assert!(s > 0);
    let c = svc(&mut k, b, sysnum::SESSION_CREATE, &[NAME, 1, 0, 0]);
    assert!(Handle(c as u32).is_thread_local());

    put_word(&mut k, CELL, c as u32);
    assert_eq!(svc(&mut k, b, sysnum::SESSION_SHARE, &[CELL, 2]), 0);
    let shared = read_i32(&k, CELL);
    assert_ne!(shared, c);
    assert!(!Handle(shared as u32).is_thread_local());

    // The old word is dead, the new one reaches the same server.
    make_ipc_args(&mut k, ARGS, [0, 0, 0, 0], 0);
    assert_eq!(
        svc(&mut k, b, sysnum::SESSION_SEND, &[c as u32, 1, ARGS, 0]),
        ErrorCode::BadHandle.as_i32()
    );
    assert_eq!(
        svc(&mut k, b, sysnum::SESSION_SEND, &[shared as u32, 1, ARGS, 0]),
        0
    );
}

// ----------------------------------------------------------------------
// Descriptor transfer through messages
// ----------------------------------------------------------------------

fn send_with_descriptor(k: &mut Kernel, a: ObjectId, b: ObjectId) -> Message2 {
    make_bufc8(k, NAME, b"Des");
    let s = svc(k, a, sysnum::SERVER_CREATE, &[NAME, 0]);
    let c = svc(k, b, sysnum::SESSION_CREATE, &[NAME, 1, 0, 0]);
    svc(k, a, sysnum::SERVER_RECEIVE, &[s as u32, STS_A, MSG_SLOT]);

    // arg0 is a modifiable narrow descriptor, tag 4.
    make_buf8(k, DES, 16, b"hello");
    make_ipc_args(k, ARGS, [DES as i32, 0, 0, 0], 4);
    svc(k, b, sysnum::SESSION_SEND_SYNC, &[c as u32, 1, ARGS, STS_B]);
    read_val(k.mem(), MSG_SLOT).unwrap()
}

#[test]
fn ipc_copy_reads_the_client_descriptor() {
    let (mut k, a) = boot();
    let b = add_thread(&mut k);
    let msg = send_with_descriptor(&mut k, a, b);

    assert_eq!(
        svc(
            &mut k,
            a,
            sysnum::MESSAGE_GET_DES_LENGTH,
            &[msg.handle as u32, 0]
        ),
        5
    );
    assert_eq!(
        svc(
            &mut k,
            a,
            sysnum::MESSAGE_GET_DES_MAX_LENGTH,
            &[msg.handle as u32, 0]
        ),
        16
    );

    let info = IpcCopyInfo {
        target_ptr: BUF,
        target_len: 16,
        flags: 0,
    };
    write_val(k.mem_mut(), INFO, &info).unwrap();
    assert_eq!(
        svc(
            &mut k,
            a,
            sysnum::MESSAGE_IPC_COPY,
            &[msg.handle as u32, 0, INFO, 0]
        ),
        0
    );
    let mut out = [0u8; 5];
    k.mem().read(BUF, &mut out).unwrap();
    assert_eq!(&out, b"hello");
}

#[test]
fn ipc_copy_write_updates_the_client_descriptor() {
    let (mut k, a) = boot();
    let b = add_thread(&mut k);
    let msg = send_with_descriptor(&mut k, a, b);

    k.mem_mut().write(BUF, b"WORLD").unwrap();
    let info = IpcCopyInfo {
        target_ptr: BUF,
        target_len: 5,
        flags: IPC_COPY_WRITE,
    };
    write_val(k.mem_mut(), INFO, &info).unwrap();
    assert_eq!(
        svc(
            &mut k,
            a,
            sysnum::MESSAGE_IPC_COPY,
            &[msg.handle as u32, 0, INFO, 0]
        ),
        0
    );
    assert_eq!(desc::read_str8(k.mem(), DES).unwrap(), b"WORLD");
}

#[test]
fn ipc_copy_rejects_wrong_width_and_small_targets() {
    let (mut k, a) = boot();
    let b = add_thread(&mut k);
    let msg = send_with_descriptor(&mut k, a, b);

    // Wide requested, narrow sent.
    let info = IpcCopyInfo {
        target_ptr: BUF,
        target_len: 16,
        flags: IPC_COPY_WIDE,
    };
    write_val(k.mem_mut(), INFO, &info).unwrap();
    assert_eq!(
        svc(
            &mut k,
            a,
            sysnum::MESSAGE_IPC_COPY,
            &[msg.handle as u32, 0, INFO, 0]
        ),
        ErrorCode::BadDescriptor.as_i32()
    );

    // Target shorter than the payload.
    let info = IpcCopyInfo {
        target_ptr: BUF,
        target_len: 2,
        flags: 0,
    };
    write_val(k.mem_mut(), INFO, &info).unwrap();
    assert_eq!(
        svc(
            &mut k,
            a,
            sysnum::MESSAGE_IPC_COPY,
            &[msg.handle as u32, 0, INFO, 0]
        ),
        ErrorCode::NoMemory.as_i32()
    );
}

// ----------------------------------------------------------------------
// Properties
// ----------------------------------------------------------------------

#[test]
fn property_pub_sub_round_trip() {
    let (mut k, a) = boot();
    let u = add_thread(&mut k);

    let info = PropertyInfo {
        attr: 0,
        size: 4,
        kind: abi::PROPERTY_TYPE_INT,
    };
    write_val(k.mem_mut(), INFO, &info).unwrap();
    assert_eq!(
        svc(&mut k, a, sysnum::PROPERTY_DEFINE, &[0x10, 0x20, INFO]),
        0
    );
    let h = svc(&mut k, a, sysnum::PROPERTY_ATTACH, &[0x10, 0x20, 0]);
    assert!(h > 0);
    prime_status(&mut k, STS_A);
    assert_eq!(
        svc(&mut k, a, sysnum::PROPERTY_SUBSCRIBE, &[h as u32, STS_A]),
        0
    );

    assert_eq!(
        svc(&mut k, u, sysnum::PROPERTY_FIND_SET_INT, &[0x10, 0x20, 99]),
        0
    );
    assert_eq!(read_i32(&k, STS_A), 0);
    assert_eq!(
        svc(&mut k, a, sysnum::PROPERTY_GET_INT, &[h as u32, CELL]),
        0
    );
    assert_eq!(read_i32(&k, CELL), 99);
    assert_eq!(
        svc(&mut k, u, sysnum::PROPERTY_FIND_GET_INT, &[0x10, 0x20, CELL]),
        0
    );
    assert_eq!(read_i32(&k, CELL), 99);
}

#[test]
fn property_type_checks_and_caps() {
    let (mut k, a) = boot();
    let info = PropertyInfo {
        attr: 0,
        size: 4,
        kind: abi::PROPERTY_TYPE_BYTE_ARRAY,
    };
    write_val(k.mem_mut(), INFO, &info).unwrap();
    assert_eq!(
        svc(&mut k, a, sysnum::PROPERTY_DEFINE, &[1, 2, INFO]),
        0
    );
    let h = svc(&mut k, a, sysnum::PROPERTY_ATTACH, &[1, 2, 0]);

    // Int write to a binary property is an argument error.
    assert_eq!(
        svc(&mut k, a, sysnum::PROPERTY_SET_INT, &[h as u32, 7]),
        ErrorCode::Argument.as_i32()
    );
    // Oversized binary write too.
    k.mem_mut().write(BUF, &[1, 2, 3, 4, 5]).unwrap();
    assert_eq!(
        svc(&mut k, a, sysnum::PROPERTY_SET_BIN, &[h as u32, 5, BUF]),
        ErrorCode::Argument.as_i32()
    );
    assert_eq!(
        svc(&mut k, a, sysnum::PROPERTY_SET_BIN, &[h as u32, 3, BUF]),
        0
    );
    // Read back, then with a too-small buffer.
    assert_eq!(
        svc(&mut k, a, sysnum::PROPERTY_GET_BIN, &[h as u32, 3, CELL]),
        0
    );
    assert_eq!(
        svc(&mut k, a, sysnum::PROPERTY_GET_BIN, &[h as u32, 2, CELL]),
        ErrorCode::NoMemory.as_i32()
    );
}

#[test]
fn undefined_property_reads_as_bad_handle() {
    let (mut k, a) = boot();
    let h = svc(&mut k, a, sysnum::PROPERTY_ATTACH, &[9, 9, 0]);
    assert!(h > 0);
    assert_eq!(
        svc(&mut k, a, sysnum::PROPERTY_GET_INT, &[h as u32, CELL]),
        ErrorCode::BadHandle.as_i32()
    );
}

#[test]
fn property_cancel_completes_only_this_thread() {
    let (mut k, a) = boot();
    let info = PropertyInfo {
        attr: 0,
        size: 4,
        kind: abi::PROPERTY_TYPE_INT,
    };
    write_val(k.mem_mut(), INFO, &info).unwrap();
    svc(&mut k, a, sysnum::PROPERTY_DEFINE, &[3, 4, INFO]);
    let h = svc(&mut k, a, sysnum::PROPERTY_ATTACH, &[3, 4, 0]);
    svc(&mut k, a, sysnum::PROPERTY_SUBSCRIBE, &[h as u32, STS_A]);
    assert_eq!(svc(&mut k, a, sysnum::PROPERTY_CANCEL, &[h as u32]), 0);
    assert_eq!(read_i32(&k, STS_A), ErrorCode::Cancelled.as_i32());
}

// ----------------------------------------------------------------------
// Chunks
// ----------------------------------------------------------------------

#[test]
fn chunk_create_and_adjust() {
    let (mut k, a) = boot();
    make_bufc8(&mut k, NAME, b"c");
    let info = ChunkCreateInfo {
        att: 0,
        force_fixed: 0,
        initial_bottom: 0,
        initial_top: 0x1000,
        max_size: 0x10000,
    };
    write_val(k.mem_mut(), INFO, &info).unwrap();
    let h = svc(&mut k, a, sysnum::CHUNK_CREATE, &[0, NAME, INFO]);
    assert!(h > 0);

    let base = svc(&mut k, a, sysnum::CHUNK_BASE, &[h as u32]);
    assert_ne!(base, 0);
    assert_eq!(
        svc(&mut k, a, sysnum::CHUNK_MAX_SIZE, &[h as u32]),
        0x10000
    );
    assert_eq!(
        svc(&mut k, a, sysnum::CHUNK_ADJUST, &[h as u32, 0, 0x4000, 0]),
        0
    );
    let id = k.resolve_handle(a, Handle(h as u32)).unwrap();
    assert!(k.registry.chunk(id).unwrap().is_committed(0, 0x4000));

    // The committed range is writable guest memory.
    k.mem_mut().write(base as u32, b"chunky").unwrap();

    // An adjust past max fails with General.
    assert_eq!(
        svc(&mut k, a, sysnum::CHUNK_ADJUST, &[h as u32, 0, 0x2_0000, 0]),
        ErrorCode::General.as_i32()
    );
}

#[test]
fn chunk_adjust_dispatches_disconnected_ops() {
    let (mut k, a) = boot();
    let info = ChunkCreateInfo {
        att: abi::ChunkCreateAtt::DISCONNECTED.bits(),
        force_fixed: 0,
        initial_bottom: 0,
        initial_top: 0,
        max_size: 0x10000,
    };
    write_val(k.mem_mut(), INFO, &info).unwrap();
    let h = svc(&mut k, a, sysnum::CHUNK_CREATE, &[0, 0, INFO]);
    assert!(h > 0);

    // commit, decommit, allocate, and the no-op codes.
    assert_eq!(
        svc(&mut k, a, sysnum::CHUNK_ADJUST, &[h as u32, 2, 0x2000, 0x1000]),
        0
    );
    assert_eq!(
        svc(&mut k, a, sysnum::CHUNK_ADJUST, &[h as u32, 4, 0x1000, 0]),
        0
    );
    assert_eq!(
        svc(&mut k, a, sysnum::CHUNK_ADJUST, &[h as u32, 3, 0x2000, 0x1000]),
        0
    );
    assert_eq!(svc(&mut k, a, sysnum::CHUNK_ADJUST, &[h as u32, 5, 0, 0]), 0);
    assert_eq!(
        svc(&mut k, a, sysnum::CHUNK_ADJUST, &[h as u32, 0, 0x1000, 0]),
        ErrorCode::General.as_i32()
    );
}

// ----------------------------------------------------------------------
// TRAP/Leave
// ----------------------------------------------------------------------

#[test]
fn leave_depth_nests_and_bottoms_out() {
    let (mut k, a) = boot();
    svc(&mut k, a, sysnum::SET_TRAP_HANDLER, &[0x77]);
    assert_eq!(svc(&mut k, a, sysnum::LEAVE_START, &[]), 0x77);
    assert_eq!(svc(&mut k, a, sysnum::LEAVE_START, &[]), 0x77);
    assert_eq!(svc(&mut k, a, sysnum::LEAVE_END, &[]), 0);
    assert_eq!(svc(&mut k, a, sysnum::LEAVE_END, &[]), 0);
    assert_eq!(k.registry.thread(a).unwrap().leave_depth, 0);

    // One too many: logged, reported, and the depth stays pinned at zero.
    assert_eq!(
        svc(&mut k, a, sysnum::LEAVE_END, &[]),
        ErrorCode::General.as_i32()
    );
    assert_eq!(k.registry.thread(a).unwrap().leave_depth, 0);
}

// ----------------------------------------------------------------------
// Timers, After, request signals
// ----------------------------------------------------------------------

#[test]
fn timer_cancel_wakes_a_parked_thread() {
    let (mut k, a) = boot();
    let u = add_thread(&mut k);
    let t = svc(&mut k, a, sysnum::TIMER_CREATE, &[]);
    assert!(t > 0);
    assert_eq!(
        svc(&mut k, a, sysnum::TIMER_AFTER, &[t as u32, STS_A, 10_000_000]),
        0
    );
    assert_eq!(svc(&mut k, a, sysnum::WAIT_FOR_ANY_REQUEST, &[]), 0);
    assert_eq!(thread_state(&k, a), ThreadState::WaitingAnyRequest);

    // The timer handle is process-scoped, so a sibling thread can cancel.
    assert_eq!(svc(&mut k, u, sysnum::TIMER_CANCEL, &[t as u32]), 0);
    assert_eq!(read_i32(&k, STS_A), ErrorCode::Cancelled.as_i32());
    assert_eq!(thread_state(&k, a), ThreadState::Ready);
}

#[test]
fn timers_fire_in_deadline_order() {
    let (mut k, a) = boot();
    let t1 = svc(&mut k, a, sysnum::TIMER_CREATE, &[]);
    let t2 = svc(&mut k, a, sysnum::TIMER_CREATE, &[]);
    put_word(&mut k, STS_A, crate::reqsts::REQUEST_PENDING as u32);
    put_word(&mut k, STS_B, crate::reqsts::REQUEST_PENDING as u32);
    svc(&mut k, a, sysnum::TIMER_AFTER, &[t1 as u32, STS_A, 1000]);
    svc(&mut k, a, sysnum::TIMER_AFTER, &[t2 as u32, STS_B, 2000]);

    let _ = k.tick(Timestamp(1500));
    assert_eq!(read_i32(&k, STS_A), 0);
    assert_eq!(read_i32(&k, STS_B), crate::reqsts::REQUEST_PENDING);
    assert_eq!(k.registry.thread(a).unwrap().request_sema(), 1);

    let _ = k.tick(Timestamp(2500));
    assert_eq!(read_i32(&k, STS_B), 0);
    assert_eq!(k.registry.thread(a).unwrap().request_sema(), 2);
}

#[test]
fn timer_at_utc_converts_through_the_year_zero_basis() {
    let (mut k, a) = boot();
    let t = svc(&mut k, a, sysnum::TIMER_CREATE, &[]);
    put_word(&mut k, STS_A, crate::reqsts::REQUEST_PENDING as u32);
    // One second past the mocked "now".
    let at = YEAR_ZERO_TO_UNIX_MICROS + 1_000_000_000 + 1_000_000;
    assert_eq!(
        svc(
            &mut k,
            a,
            sysnum::TIMER_AT_UTC,
            &[t as u32, STS_A, at as u32, (at >> 32) as u32]
        ),
        0
    );
    let _ = k.tick(Timestamp(999_999));
    assert_eq!(read_i32(&k, STS_A), crate::reqsts::REQUEST_PENDING);
    let _ = k.tick(Timestamp(1_000_000));
    assert_eq!(read_i32(&k, STS_A), 0);
    assert_eq!(k.registry.thread(a).unwrap().request_sema(), 1);
}

#[test]
fn after_posts_a_thread_wakeup() {
    let (mut k, a) = boot();
    prime_status(&mut k, STS_A);
    assert_eq!(svc(&mut k, a, sysnum::AFTER, &[5000, STS_A]), 0);
    assert_eq!(svc(&mut k, a, sysnum::WAIT_FOR_ANY_REQUEST, &[]), 0);
    assert_eq!(thread_state(&k, a), ThreadState::WaitingAnyRequest);
    let _ = k.tick(Timestamp(5000));
    assert_eq!(thread_state(&k, a), ThreadState::Ready);
    assert_eq!(read_i32(&k, STS_A), 0);
}

#[test]
fn request_signals_bank_and_drain() {
    let (mut k, a) = boot();
    assert_eq!(svc(&mut k, a, sysnum::REQUEST_SIGNAL, &[3]), 0);
    for _ in 0..3 {
        assert_eq!(svc(&mut k, a, sysnum::WAIT_FOR_ANY_REQUEST, &[]), 0);
        assert_eq!(thread_state(&k, a), ThreadState::Ready);
    }
    assert_eq!(svc(&mut k, a, sysnum::WAIT_FOR_ANY_REQUEST, &[]), 0);
    assert_eq!(thread_state(&k, a), ThreadState::WaitingAnyRequest);
    assert_eq!(k.registry.thread(a).unwrap().request_sema(), 0);
}

#[test]
fn change_notifier_broadcast() {
    let (mut k, a) = boot();
    let h = svc(&mut k, a, sysnum::CHANGE_NOTIFIER_CREATE, &[0]);
    assert!(h > 0);
    prime_status(&mut k, STS_A);
    assert_eq!(
        svc(&mut k, a, sysnum::CHANGE_NOTIFIER_LOGON, &[h as u32, STS_A]),
        0
    );
    // Double logon is refused.
    assert_eq!(
        svc(&mut k, a, sysnum::CHANGE_NOTIFIER_LOGON, &[h as u32, STS_B]),
        ErrorCode::General.as_i32()
    );
    let sender = k.event_sender();
    sender.send(crate::kernel::KernelEvent::SystemChange).unwrap();
    let _ = k.tick(Timestamp(1));
    assert_eq!(read_i32(&k, STS_A), 0);
}

// ----------------------------------------------------------------------
// Threads, processes, and death
// ----------------------------------------------------------------------

#[test]
fn thread_create_and_resume() {
    let (mut k, a) = boot();
    make_bufc8(&mut k, NAME, b"child");
    let info = ThreadCreateInfo {
        func_ptr: 0x8000,
        user_stack_size: 0x2000,
        ..Default::default()
    };
    write_val(k.mem_mut(), INFO, &info).unwrap();
    let h = svc(&mut k, a, sysnum::THREAD_CREATE, &[NAME, 0, INFO]);
    assert!(h > 0);

    let child = k.resolve_handle(a, Handle(h as u32)).unwrap();
    assert_eq!(thread_state(&k, child), ThreadState::Create);
    assert_eq!(svc(&mut k, a, sysnum::THREAD_RESUME, &[h as u32]), 0);
    assert_eq!(thread_state(&k, child), ThreadState::Ready);
    assert_eq!(svc(&mut k, a, sysnum::THREAD_SUSPEND, &[h as u32]), 0);
    assert_eq!(thread_state(&k, child), ThreadState::Suspended);
    assert_eq!(svc(&mut k, a, sysnum::THREAD_ID, &[h as u32]), child.as_i32());
}

#[test]
fn thread_kill_completes_logons() {
    let (mut k, a) = boot();
    let b = add_thread(&mut k);
    let h = k.mirror(a, b, abi::OwnerType::Process).unwrap();

    assert_eq!(
        svc(&mut k, a, sysnum::THREAD_LOGON, &[h.0, STS_A, 0]),
        0
    );
    make_bufc8(&mut k, NAME, b"KERN-EXEC");
    assert_eq!(
        svc(&mut k, a, sysnum::THREAD_KILL, &[h.0, 2, 3, NAME]),
        0
    );
    assert_eq!(read_i32(&k, STS_A), 3);
    assert_eq!(thread_state(&k, b), ThreadState::Dead);
    assert_eq!(
        k.registry.thread(b).unwrap().exit_type,
        abi::ExitType::Panic
    );
}

#[test]
fn logon_cancel_completes_with_cancelled() {
    let (mut k, a) = boot();
    let b = add_thread(&mut k);
    let h = k.mirror(a, b, abi::OwnerType::Process).unwrap();
    svc(&mut k, a, sysnum::THREAD_LOGON, &[h.0, STS_A, 0]);
    assert_eq!(
        svc(&mut k, a, sysnum::THREAD_LOGON_CANCEL, &[h.0, STS_A, 0]),
        0
    );
    assert_eq!(read_i32(&k, STS_A), ErrorCode::Cancelled.as_i32());
    // Cancelling again finds nothing.
    assert_eq!(
        svc(&mut k, a, sysnum::THREAD_LOGON_CANCEL, &[h.0, STS_A, 0]),
        ErrorCode::General.as_i32()
    );
}

#[test]
fn process_queries_cover_identity() {
    let (mut k, a) = boot();
    let cur = Handle::CURRENT_PROCESS.0;
    let process = k.current_process().unwrap();
    assert_eq!(
        svc(&mut k, a, sysnum::PROCESS_GET_ID, &[cur]),
        process.as_i32()
    );
    assert_eq!(
        svc(&mut k, a, sysnum::PROCESS_COMMAND_LINE_LENGTH, &[cur]),
        10
    );
    make_buf8(&mut k, DES, 64, b"");
    assert_eq!(
        svc(&mut k, a, sysnum::PROCESS_COMMAND_LINE, &[cur, DES]),
        0
    );
    // Wide text packed in a narrow descriptor: twice the characters.
    assert_eq!(desc::read_str8(k.mem(), DES).unwrap().len(), 20);
    assert_eq!(
        svc(&mut k, a, sysnum::PROCESS_EXIT_TYPE, &[cur]),
        abi::ExitType::Pending as i32
    );
}

#[test]
fn data_parameter_slots_are_write_once() {
    let (mut k, a) = boot();
    k.mem_mut().write(BUF, b"payload").unwrap();
    let cur = Handle::CURRENT_PROCESS.0;
    assert_eq!(
        svc(
            &mut k,
            a,
            sysnum::PROCESS_SET_DATA_PARAMETER,
            &[cur, 3, BUF, 7]
        ),
        0
    );
    assert_eq!(
        svc(
            &mut k,
            a,
            sysnum::PROCESS_SET_DATA_PARAMETER,
            &[cur, 3, BUF, 7]
        ),
        ErrorCode::InUse.as_i32()
    );
    assert_eq!(
        svc(&mut k, a, sysnum::PROCESS_DATA_PARAMETER_LENGTH, &[3]),
        7
    );
    assert_eq!(
        svc(&mut k, a, sysnum::PROCESS_DATA_PARAMETER_LENGTH, &[5]),
        ErrorCode::NotFound.as_i32()
    );
    assert_eq!(
        svc(&mut k, a, sysnum::PROCESS_DATA_PARAMETER_LENGTH, &[16]),
        ErrorCode::Argument.as_i32()
    );
    // Reading into a short buffer is refused, a roomy one succeeds.
    assert_eq!(
        svc(
            &mut k,
            a,
            sysnum::PROCESS_GET_DATA_PARAMETER,
            &[3, CELL, 4]
        ),
        ErrorCode::Argument.as_i32()
    );
    assert_eq!(
        svc(
            &mut k,
            a,
            sysnum::PROCESS_GET_DATA_PARAMETER,
            &[3, CELL, 16]
        ),
        0
    );
    let mut out = [0u8; 7];
    k.mem().read(CELL, &mut out).unwrap();
    assert_eq!(&out, b"payload");
}

#[test]
fn rendezvous_completes_only_rendezvous_logons() {
    let (mut k, a) = boot();
    let cur = Handle::CURRENT_PROCESS.0;
    prime_status(&mut k, STS_A);
    prime_status(&mut k, STS_B);
    svc(&mut k, a, sysnum::PROCESS_LOGON, &[cur, STS_A, 1]);
    svc(&mut k, a, sysnum::PROCESS_LOGON, &[cur, STS_B, 0]);
    assert_eq!(svc(&mut k, a, sysnum::PROCESS_RENDEZVOUS, &[55]), 0);
    assert_eq!(read_i32(&k, STS_A), 55);
    assert_eq!(read_i32(&k, STS_B), crate::reqsts::REQUEST_PENDING);
}

#[test]
fn tls_slots_are_per_thread() {
    let (mut k, a) = boot();
    let b = add_thread(&mut k);
    assert_eq!(
        svc(&mut k, a, sysnum::DLL_SET_TLS, &[5, 0x2000_1234, 0xCAFE]),
        0
    );
    assert_eq!(
        svc(&mut k, a, sysnum::DLL_TLS, &[5, 0x2000_1234]),
        0xCAFE
    );
    assert_eq!(svc(&mut k, b, sysnum::DLL_TLS, &[5, 0x2000_1234]), 0);
    assert_eq!(svc(&mut k, a, sysnum::DLL_FREE_TLS, &[5]), 0);
    assert_eq!(svc(&mut k, a, sysnum::DLL_TLS, &[5, 0x2000_1234]), 0);
}

#[test]
fn dll_lock_is_exclusive_between_threads() {
    let (mut k, a) = boot();
    let b = add_thread(&mut k);
    assert_eq!(svc(&mut k, a, sysnum::WAIT_DLL_LOCK, &[]), 0);
    assert_eq!(thread_state(&k, a), ThreadState::Ready);

    assert_eq!(svc(&mut k, b, sysnum::WAIT_DLL_LOCK, &[]), 0);
    assert!(matches!(thread_state(&k, b), ThreadState::WaitingMutex(_)));

    assert_eq!(svc(&mut k, a, sysnum::RELEASE_DLL_LOCK, &[]), 0);
    assert_eq!(thread_state(&k, b), ThreadState::Ready);
}
