// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The supervisor-call dispatch table and every handler behind it.
//!
//! # Handler shape
//!
//! With only a couple of exceptions, syscalls are implemented by functions
//! with the signature:
//!
//! ```ignore
//! fn syscall(k: &mut Kernel, caller: ObjectId) -> SysResult;
//! ```
//!
//! `caller` is the current thread. A handler reads its arguments out of the
//! caller's saved register file (`r0..r3`, with 64-bit values split across a
//! pair), validates guest pointers through the memory collaborator, and
//! returns a [`Reply`] carrying the signed return value plus a scheduling
//! hint, or a [`UserError`] that the common wrapper in [`dispatch`]
//! flattens to the guest's error-code convention. Handlers never block the
//! host: "blocking" means recording a wait state on the caller and hinting
//! a reschedule.
//!
//! Ordinals at or above `sysnum::FAST_BASE` are fast executive calls:
//! scalar get/set against the caller's thread-local data, no marshalling.
//! Everything else is a slow call. One table exists per supported guest
//! revision; unknown ordinals are logged and answered with `NotSupported`.

use abi::{
    sysnum, ChunkCreateInfo, EpocVersion, ErrorCode, ExitType, FindHandle,
    Handle, IpcCopyInfo, ObjectKind, OwnerType, Priority, PropertyInfo,
    SecurityInfo, ThreadCreateInfo, IPC_COPY_WIDE, IPC_COPY_WRITE,
    YEAR_ZERO_TO_UNIX_MICROS,
};
use byteorder::{ByteOrder, LittleEndian};

use crate::desc::{self, DesError};
use crate::err::{Reply, SysResult, UserError};
use crate::ipc::{IpcArgs, PendingReceive};
use crate::kernel::Kernel;
use crate::notifier::ChangeNotifier;
use crate::object::{Access, ObjectBody, ObjectId};
use crate::reqsts::{self, Logon, Waiter};
use crate::sched::NextThread;
use crate::sync::{Mutex, Semaphore};
use crate::thread::ThreadState;
use crate::time::Timer;
use crate::umem::{read_val, write_val, GuestAddr, GuestPtr};

type SvcHandler = fn(&mut Kernel, ObjectId) -> SysResult;

struct SvcEntry {
    nr: u32,
    name: &'static str,
    handler: SvcHandler,
}

/// Entry point called by the scheduler loop when the CPU collaborator
/// reports a supervisor trap. Returns the scheduling consequence.
pub fn dispatch(k: &mut Kernel, nr: u32) -> NextThread {
    let Some(caller) = k.current_thread() else {
        log::error!("svc {nr:#x} with no current thread");
        return NextThread::Same;
    };
    let Some(entry) = table_lookup(k.config.version, nr) else {
        log::warn!("unsupported syscall {nr:#010x}");
        set_ret(k, caller, ErrorCode::NotSupported.as_i32());
        return NextThread::Same;
    };
    log::trace!("svc {} ({nr:#x})", entry.name);
    match (entry.handler)(k, caller) {
        Ok(reply) => {
            set_ret(k, caller, reply.ret);
            reply.hint
        }
        Err(UserError::Recoverable(code, hint)) => {
            set_ret(k, caller, code.as_i32());
            hint
        }
        Err(UserError::Internal(msg)) => {
            log::error!("kernel inconsistency in {}: {msg}", entry.name);
            set_ret(k, caller, ErrorCode::General.as_i32());
            NextThread::Same
        }
    }
}

fn set_ret(k: &mut Kernel, caller: ObjectId, val: i32) {
    if let Some(thread) = k.registry.thread_mut(caller) {
        thread.save.set_ret(val);
    }
}

fn table_lookup(version: EpocVersion, nr: u32) -> Option<&'static SvcEntry> {
    let (fast, slow) = match version {
        EpocVersion::Epoc94 => (FAST_V94, SLOW_V94),
        _ => (FAST_V93, SLOW_V93),
    };
    let table = if nr >= sysnum::FAST_BASE { fast } else { slow };
    table
        .binary_search_by_key(&nr, |entry| entry.nr)
        .ok()
        .map(|i| &table[i])
}

// ----------------------------------------------------------------------
// Marshalling helpers
// ----------------------------------------------------------------------

/// Reads a narrow descriptor argument as host text. A null pointer reads as
/// the empty string, which several creation calls use to mean "anonymous".
fn text_arg(k: &Kernel, addr: GuestAddr) -> Result<String, UserError> {
    if addr == 0 {
        return Ok(String::new());
    }
    Ok(desc::read_text8(k.mem(), addr)?)
}

/// Reads the guest's five-word IPC argument block. A null pointer means
/// "no arguments".
fn ipc_args_from(k: &Kernel, addr: GuestAddr) -> Result<IpcArgs, UserError> {
    if addr == 0 {
        return Ok(IpcArgs::default());
    }
    let mut raw = [0u8; 20];
    k.mem().read(addr, &mut raw)?;
    let mut words = [0i32; 5];
    LittleEndian::read_i32_into(&raw, &mut words);
    Ok(IpcArgs::capture(
        [words[0], words[1], words[2], words[3]],
        words[4] as u32,
    ))
}

fn message_arg(k: &Kernel, raw: u32) -> Result<ObjectId, UserError> {
    k.message_by_handle(raw as i32)
        .ok_or(UserError::code(ErrorCode::BadHandle))
}

/// Marks threads released from a sync primitive as runnable.
fn wake_all(k: &mut Kernel, released: &[ObjectId]) -> NextThread {
    let mut hint = NextThread::Same;
    for &thread in released {
        if let Some(t) = k.registry.thread_mut(thread) {
            if t.state.is_waiting() {
                t.state = ThreadState::Ready;
                hint = hint.combine(NextThread::Specific(thread));
            }
        }
    }
    hint
}

// ----------------------------------------------------------------------
// Fast executive calls: get/set against current thread local data
// ----------------------------------------------------------------------

fn wait_for_any_request(k: &mut Kernel, caller: ObjectId) -> SysResult {
    if k.thread_mut(caller)?.wait_for_any_request() {
        Ok(Reply::ok())
    } else {
        k.prepare_reschedule();
        Ok(Reply::blocked(0))
    }
}

fn heap(k: &mut Kernel, caller: ObjectId) -> SysResult {
    let heap = k.thread(caller)?.local.heap;
    if heap == 0 {
        log::warn!("allocator is not available");
    }
    Ok(Reply::value(heap as i32))
}

fn heap_switch(k: &mut Kernel, caller: ObjectId) -> SysResult {
    let new_heap = k.save(caller)?.arg(0);
    let local = &mut k.thread_mut(caller)?.local;
    let old = local.heap;
    local.heap = new_heap;
    Ok(Reply::value(old as i32))
}

fn active_scheduler(k: &mut Kernel, caller: ObjectId) -> SysResult {
    Ok(Reply::value(k.thread(caller)?.local.scheduler as i32))
}

fn set_active_scheduler(k: &mut Kernel, caller: ObjectId) -> SysResult {
    let new = k.save(caller)?.arg(0);
    k.thread_mut(caller)?.local.scheduler = new;
    Ok(Reply::ok())
}

fn trap_handler(k: &mut Kernel, caller: ObjectId) -> SysResult {
    Ok(Reply::value(k.thread(caller)?.local.trap_handler as i32))
}

fn set_trap_handler(k: &mut Kernel, caller: ObjectId) -> SysResult {
    let new = k.save(caller)?.arg(0);
    k.thread_mut(caller)?.local.trap_handler = new;
    Ok(Reply::value(new as i32))
}

fn debug_mask(k: &mut Kernel, _caller: ObjectId) -> SysResult {
    Ok(Reply::value(k.config.debug_mask as i32))
}

fn debug_mask_index(k: &mut Kernel, caller: ObjectId) -> SysResult {
    let index = k.save(caller)?.arg(0);
    let mask = if index == 0 { k.config.debug_mask } else { 0 };
    Ok(Reply::value(mask as i32))
}

fn user_svr_rom_header_address(k: &mut Kernel, _caller: ObjectId) -> SysResult {
    Ok(Reply::value(k.config.rom_header_addr() as i32))
}

/// Conditionally bumps the guest's 32-bit cell when it is positive,
/// returning the original value.
fn safe_inc_32(k: &mut Kernel, caller: ObjectId) -> SysResult {
    let cell = GuestPtr::<i32>::new(k.save(caller)?.arg(0));
    if cell.is_null() {
        return Err(ErrorCode::Argument.into());
    }
    let val = cell.read(k.mem())?;
    if val > 0 {
        cell.write(k.mem_mut(), &(val + 1))?;
    }
    Ok(Reply::value(val))
}

fn safe_dec_32(k: &mut Kernel, caller: ObjectId) -> SysResult {
    let cell = GuestPtr::<i32>::new(k.save(caller)?.arg(0));
    if cell.is_null() {
        return Err(ErrorCode::Argument.into());
    }
    let val = cell.read(k.mem())?;
    if val > 0 {
        cell.write(k.mem_mut(), &(val - 1))?;
    }
    Ok(Reply::value(val))
}

fn utc_offset(k: &mut Kernel, _caller: ObjectId) -> SysResult {
    Ok(Reply::value(k.clock.utc_offset_seconds()))
}

fn get_global_user_data(_k: &mut Kernel, _caller: ObjectId) -> SysResult {
    log::info!("GetGlobalUserData stubbed with zero");
    Ok(Reply::value(0))
}

// ----------------------------------------------------------------------
// Handles
// ----------------------------------------------------------------------

fn object_next(k: &mut Kernel, caller: ObjectId) -> SysResult {
    let save = k.save(caller)?;
    let kind = ObjectKind::try_from(save.arg(0))
        .map_err(|_| UserError::code(ErrorCode::Argument))?;
    let name = text_arg(k, save.arg(1))?;
    let find_ptr = save.arg(2);
    let cursor: FindHandle = read_val(k.mem(), find_ptr)?;

    log::trace!("finding object name: {name}");
    let Some((index, id)) = k.registry.find_next(&name, kind, cursor.index)
    else {
        return Err(ErrorCode::NotFound.into());
    };
    let updated = FindHandle {
        index,
        id_low: id.0 as u32,
        id_high: (id.0 >> 32) as u32,
    };
    write_val(k.mem_mut(), find_ptr, &updated)?;
    Ok(Reply::ok())
}

fn handle_close(k: &mut Kernel, caller: ObjectId) -> SysResult {
    let handle = Handle(k.save(caller)?.arg(0));
    k.close(caller, handle)?;
    Ok(Reply::ok())
}

fn handle_open_object(k: &mut Kernel, caller: ObjectId) -> SysResult {
    let save = k.save(caller)?;
    let kind = ObjectKind::try_from(save.arg(0))
        .map_err(|_| UserError::code(ErrorCode::Argument))?;
    let name = text_arg(k, save.arg(1))?;
    let owner = OwnerType::try_from(save.arg(2))
        .map_err(|_| UserError::code(ErrorCode::Argument))?;

    let Some((_, id)) = k.registry.find_next(&name, kind, 0) else {
        return Err(ErrorCode::NotFound.into());
    };
    let handle = k.mirror(caller, id, owner)?;
    Ok(Reply::value(handle.0 as i32))
}

fn handle_duplicate(k: &mut Kernel, caller: ObjectId) -> SysResult {
    let save = k.save(caller)?;
    let scope_thread =
        k.lookup(caller, Handle(save.arg(0)), ObjectKind::Thread)?;
    let owner = OwnerType::try_from(save.arg(1))
        .map_err(|_| UserError::code(ErrorCode::Argument))?;
    let id = k
        .resolve_handle(scope_thread, Handle(save.arg(2)))
        .ok_or(UserError::code(ErrorCode::BadHandle))?;
    let handle = k.mirror(caller, id, owner)?;
    Ok(Reply::value(handle.0 as i32))
}

fn handle_name(k: &mut Kernel, caller: ObjectId) -> SysResult {
    let save = k.save(caller)?;
    let Some(id) = k.resolve_handle(caller, Handle(save.arg(0))) else {
        return Ok(Reply::ok());
    };
    let name = match k.registry.get(id) {
        Some(obj) => obj.name.clone(),
        None => return Ok(Reply::ok()),
    };
    desc::write_str8(k.mem_mut(), save.arg(1), name.as_bytes())?;
    Ok(Reply::ok())
}

// ----------------------------------------------------------------------
// Processes
// ----------------------------------------------------------------------

fn lookup_process(
    k: &Kernel,
    caller: ObjectId,
    raw: u32,
) -> Result<ObjectId, UserError> {
    k.lookup(caller, Handle(raw), ObjectKind::Process)
}

fn process_get_id(k: &mut Kernel, caller: ObjectId) -> SysResult {
    let raw = k.save(caller)?.arg(0);
    let process = lookup_process(k, caller, raw)?;
    Ok(Reply::value(process.as_i32()))
}

fn process_exit_type(k: &mut Kernel, caller: ObjectId) -> SysResult {
    let raw = k.save(caller)?.arg(0);
    let Ok(process) = lookup_process(k, caller, raw) else {
        log::error!("ProcessExitType: invalid process");
        return Ok(Reply::value(0));
    };
    let exit = k
        .registry
        .process(process)
        .ok_or(UserError::Internal("process object missing"))?
        .exit_type;
    Ok(Reply::value(exit as i32))
}

fn process_filename(k: &mut Kernel, caller: ObjectId) -> SysResult {
    let save = k.save(caller)?;
    let Ok(process) = lookup_process(k, caller, save.arg(0)) else {
        log::error!("ProcessFilename: invalid process");
        return Ok(Reply::ok());
    };
    let name = match k.registry.get(process) {
        Some(obj) => obj.name.clone(),
        None => return Ok(Reply::ok()),
    };
    desc::write_str8(k.mem_mut(), save.arg(1), name.as_bytes())?;
    Ok(Reply::ok())
}

fn process_command_line(k: &mut Kernel, caller: ObjectId) -> SysResult {
    let save = k.save(caller)?;
    let Ok(process) = lookup_process(k, caller, save.arg(0)) else {
        log::warn!("process not found with handle: {:#x}", save.arg(0));
        return Ok(Reply::ok());
    };
    if save.arg(1) == 0 {
        return Ok(Reply::ok());
    }
    let line = k
        .registry
        .process(process)
        .ok_or(UserError::Internal("process object missing"))?
        .command_line
        .clone();
    // The command line travels as wide text packed into a narrow
    // descriptor, so capacity is checked in bytes.
    let mut bytes = vec![0u8; line.len() * 2];
    LittleEndian::write_u16_into(&line, &mut bytes);
    match desc::write_str8(k.mem_mut(), save.arg(1), &bytes) {
        Ok(()) => Ok(Reply::ok()),
        Err(DesError::Overflow) => {
            log::warn!("not enough space to store command line, abort");
            Ok(Reply::ok())
        }
        Err(e) => Err(e.into()),
    }
}

fn process_command_line_length(k: &mut Kernel, caller: ObjectId) -> SysResult {
    let raw = k.save(caller)?.arg(0);
    let process = lookup_process(k, caller, raw)?;
    let len = k
        .registry
        .process(process)
        .ok_or(UserError::Internal("process object missing"))?
        .command_line
        .len();
    Ok(Reply::value(len as i32))
}

fn process_type(k: &mut Kernel, caller: ObjectId) -> SysResult {
    let save = k.save(caller)?;
    let Ok(process) = lookup_process(k, caller, save.arg(0)) else {
        log::error!("ProcessType: invalid process");
        return Ok(Reply::ok());
    };
    let uids = k
        .registry
        .process(process)
        .ok_or(UserError::Internal("process object missing"))?
        .uids;
    write_val(k.mem_mut(), save.arg(1), &uids)?;
    Ok(Reply::ok())
}

fn process_set_priority(k: &mut Kernel, caller: ObjectId) -> SysResult {
    let save = k.save(caller)?;
    let process = lookup_process(k, caller, save.arg(0))?;
    if let Some(p) = k.registry.process_mut(process) {
        p.priority = Priority(save.arg(1) as i32);
    }
    Ok(Reply::ok())
}

fn process_set_flags(k: &mut Kernel, caller: ObjectId) -> SysResult {
    let save = k.save(caller)?;
    let process = lookup_process(k, caller, save.arg(0))?;
    if let Some(p) = k.registry.process_mut(process) {
        p.update_flags(save.arg(1), save.arg(2));
    }
    Ok(Reply::ok())
}

fn process_resume(k: &mut Kernel, caller: ObjectId) -> SysResult {
    let raw = k.save(caller)?.arg(0);
    let Ok(process) = lookup_process(k, caller, raw) else {
        return Ok(Reply::ok());
    };
    let threads: Vec<ObjectId> = k
        .registry
        .iter()
        .filter(|obj| {
            obj.kind() == ObjectKind::Thread && obj.owner == Some(process)
        })
        .map(|obj| obj.id)
        .collect();
    for thread in threads {
        if let Some(t) = k.registry.thread_mut(thread) {
            match t.state {
                ThreadState::Create => t.state = ThreadState::Ready,
                ThreadState::Suspended => t.state = ThreadState::Ready,
                _ => {}
            }
        }
    }
    Ok(Reply::ok())
}

fn process_rendezvous(k: &mut Kernel, caller: ObjectId) -> SysResult {
    let code = k.save(caller)?.arg(0) as i32;
    let process = k.thread(caller)?.process;
    let hint = k.process_rendezvous(process, code);
    Ok(Reply::ok().with_hint(hint))
}

fn process_logon(k: &mut Kernel, caller: ObjectId) -> SysResult {
    let save = k.save(caller)?;
    log::trace!("logon requested from thread {caller:?}");
    let Ok(process) = lookup_process(k, caller, save.arg(0)) else {
        return Ok(Reply::ok());
    };
    let logon = Logon {
        waiter: Waiter {
            thread: caller,
            status: save.arg(1),
        },
        rendezvous: save.arg(2) != 0,
    };
    if let Some(p) = k.registry.process_mut(process) {
        p.logons.push(logon);
    }
    Ok(Reply::ok())
}

fn process_logon_cancel(k: &mut Kernel, caller: ObjectId) -> SysResult {
    let save = k.save(caller)?;
    let process = lookup_process(k, caller, save.arg(0))?;
    let rendezvous = save.arg(2) != 0;
    let status = save.arg(1);
    let found = match k.registry.process_mut(process) {
        Some(p) => {
            let mut removed = None;
            p.logons.retain(|l| {
                let hit = removed.is_none()
                    && l.waiter.status == status
                    && l.rendezvous == rendezvous;
                if hit {
                    removed = Some(*l);
                }
                !hit
            });
            removed
        }
        None => None,
    };
    match found {
        Some(logon) => {
            let hint = k.complete_waiter(logon.waiter, ErrorCode::Cancelled);
            Ok(Reply::ok().with_hint(hint))
        }
        None => Err(ErrorCode::General.into()),
    }
}

fn process_security_info(k: &mut Kernel, caller: ObjectId) -> SysResult {
    let save = k.save(caller)?;
    let process = lookup_process(k, caller, save.arg(0))?;
    write_security_info(k, process, save.arg(1))
}

fn write_security_info(
    k: &mut Kernel,
    process: ObjectId,
    out: GuestAddr,
) -> SysResult {
    let info: SecurityInfo = k
        .registry
        .process(process)
        .ok_or(UserError::Internal("process object missing"))?
        .security;
    write_val(k.mem_mut(), out, &info)?;
    Ok(Reply::ok())
}

// Argument-parameter slots.

fn process_data_parameter_length(k: &mut Kernel, caller: ObjectId) -> SysResult {
    let slot = k.save(caller)?.arg(0) as i32;
    let process = k.thread(caller)?.process;
    if !(0..abi::PROCESS_ARG_SLOTS as i32).contains(&slot) {
        log::error!("invalid slot (slot: {slot} >= 16 or < 0)");
        return Err(ErrorCode::Argument.into());
    }
    let p = k
        .registry
        .process(process)
        .ok_or(UserError::Internal("process object missing"))?;
    match p.arg_slot(slot as usize) {
        Some(entry) if entry.used => Ok(Reply::value(entry.data.len() as i32)),
        _ => {
            log::error!("getting parameter length of unused slot: {slot}");
            Err(ErrorCode::NotFound.into())
        }
    }
}

fn process_get_data_parameter(k: &mut Kernel, caller: ObjectId) -> SysResult {
    let save = k.save(caller)?;
    let slot = save.arg(0) as i32;
    let process = k.thread(caller)?.process;
    if !(0..abi::PROCESS_ARG_SLOTS as i32).contains(&slot) {
        log::error!("invalid slot (slot: {slot} >= 16 or < 0)");
        return Err(ErrorCode::Argument.into());
    }
    let data = {
        let p = k
            .registry
            .process(process)
            .ok_or(UserError::Internal("process object missing"))?;
        match p.arg_slot(slot as usize) {
            Some(entry) if entry.used => entry.data.clone(),
            _ => {
                log::error!("parameter slot unused: {slot}");
                return Err(ErrorCode::NotFound.into());
            }
        }
    };
    if (save.arg(2) as i32) < data.len() as i32 {
        return Err(ErrorCode::Argument.into());
    }
    k.mem_mut().write(save.arg(1), &data)?;
    Ok(Reply::ok())
}

fn process_set_data_parameter(k: &mut Kernel, caller: ObjectId) -> SysResult {
    let save = k.save(caller)?;
    let process = lookup_process(k, caller, save.arg(0))?;
    let slot = save.arg(1) as i32;
    if !(0..abi::PROCESS_ARG_SLOTS as i32).contains(&slot) {
        log::error!(
            "invalid parameter slot: {slot}, slot number must be in range of 0-15"
        );
        return Err(ErrorCode::Argument.into());
    }
    let len = save.arg(3) as usize;
    let mut data = vec![0u8; len];
    k.mem().read(save.arg(2), &mut data)?;
    let stored = k
        .registry
        .process_mut(process)
        .ok_or(UserError::Internal("process object missing"))?
        .set_arg_slot(slot as usize, data);
    if !stored {
        log::error!("can't set parameter of an used slot: {slot}");
        return Err(ErrorCode::InUse.into());
    }
    Ok(Reply::ok())
}

// ----------------------------------------------------------------------
// Threads
// ----------------------------------------------------------------------

fn lookup_thread(
    k: &Kernel,
    caller: ObjectId,
    raw: u32,
) -> Result<ObjectId, UserError> {
    k.lookup(caller, Handle(raw), ObjectKind::Thread)
}

fn thread_create(k: &mut Kernel, caller: ObjectId) -> SysResult {
    let save = k.save(caller)?;
    let name = text_arg(k, save.arg(0))?;
    let owner = OwnerType::try_from(save.arg(1))
        .map_err(|_| UserError::code(ErrorCode::Argument))?;
    let info: ThreadCreateInfo = read_val(k.mem(), save.arg(2))?;

    let process = k.thread(caller)?.process;
    let thread = k.spawn_thread(process, name.clone(), Priority::NORMAL);
    let handle = k.install_handle(caller, thread, owner, true)?;
    log::trace!(
        "thread {name} created with start pc = {:#x}, stack size = {:#x}",
        info.func_ptr,
        info.user_stack_size
    );
    Ok(Reply::value(handle.0 as i32))
}

fn thread_id(k: &mut Kernel, caller: ObjectId) -> SysResult {
    let raw = k.save(caller)?.arg(0);
    let thread = lookup_thread(k, caller, raw)?;
    Ok(Reply::value(thread.as_i32()))
}

fn last_thread_handle(k: &mut Kernel, caller: ObjectId) -> SysResult {
    Ok(Reply::value(k.thread(caller)?.last_handle as i32))
}

fn thread_process(k: &mut Kernel, caller: ObjectId) -> SysResult {
    let raw = k.save(caller)?.arg(0);
    let thread = lookup_thread(k, caller, raw)?;
    let process = k.thread(thread)?.process;
    let handle = k.mirror(caller, process, OwnerType::Thread)?;
    Ok(Reply::value(handle.0 as i32))
}

fn thread_resume(k: &mut Kernel, caller: ObjectId) -> SysResult {
    let raw = k.save(caller)?.arg(0);
    let Ok(thread) = lookup_thread(k, caller, raw) else {
        log::error!("invalid thread handle {raw:#x}");
        return Ok(Reply::ok());
    };
    let mut hint = NextThread::Same;
    if let Some(t) = k.registry.thread_mut(thread) {
        match t.state {
            ThreadState::Create | ThreadState::Suspended => {
                t.state = ThreadState::Ready;
                hint = NextThread::Specific(thread);
            }
            _ => {}
        }
    }
    Ok(Reply::ok().with_hint(hint))
}

fn thread_suspend(k: &mut Kernel, caller: ObjectId) -> SysResult {
    let raw = k.save(caller)?.arg(0);
    let Ok(thread) = lookup_thread(k, caller, raw) else {
        log::error!("invalid thread handle {raw:#x}");
        return Ok(Reply::ok());
    };
    let mut hint = NextThread::Same;
    if let Some(t) = k.registry.thread_mut(thread) {
        match t.state {
            ThreadState::Create | ThreadState::Dead => {}
            ThreadState::Ready => {
                t.state = ThreadState::Suspended;
                if thread == caller {
                    hint = NextThread::Other;
                }
            }
            state if state.is_waiting() => {
                log::warn!("suspending a waiting thread is not supported");
            }
            _ => {}
        }
    }
    if hint == NextThread::Other {
        k.prepare_reschedule();
    }
    Ok(Reply::ok().with_hint(hint))
}

fn thread_set_priority(k: &mut Kernel, caller: ObjectId) -> SysResult {
    let save = k.save(caller)?;
    let Ok(thread) = lookup_thread(k, caller, save.arg(0)) else {
        return Ok(Reply::ok());
    };
    if let Some(t) = k.registry.thread_mut(thread) {
        t.priority = Priority(save.arg(1) as i32);
    }
    Ok(Reply::ok())
}

fn thread_set_flags(k: &mut Kernel, caller: ObjectId) -> SysResult {
    let save = k.save(caller)?;
    let thread = lookup_thread(k, caller, save.arg(0))?;
    if let Some(t) = k.registry.thread_mut(thread) {
        t.flags = (t.flags & !save.arg(1)) | save.arg(2);
    }
    Ok(Reply::ok())
}

fn thread_rename(k: &mut Kernel, caller: ObjectId) -> SysResult {
    let save = k.save(caller)?;
    let thread = lookup_thread(k, caller, save.arg(0))?;
    let new_name = text_arg(k, save.arg(1))?;
    if let Some(obj) = k.registry.get_mut(thread) {
        log::trace!(
            "thread with last name: {} renamed to {new_name}",
            obj.name
        );
        obj.name = new_name;
    }
    Ok(Reply::ok())
}

fn thread_kill(k: &mut Kernel, caller: ObjectId) -> SysResult {
    let save = k.save(caller)?;
    let thread = lookup_thread(k, caller, save.arg(0))?;
    let exit_type = ExitType::try_from(save.arg(1) as i32)
        .map_err(|_| UserError::code(ErrorCode::Argument))?;
    let reason = save.arg(2) as i32;
    let category = if save.arg(3) == 0 {
        "None".to_string()
    } else {
        text_arg(k, save.arg(3))?
    };
    let hint = k.kill_thread(thread, exit_type, reason, &category);
    Ok(Reply::ok().with_hint(hint))
}

fn thread_logon(k: &mut Kernel, caller: ObjectId) -> SysResult {
    let save = k.save(caller)?;
    let Ok(thread) = lookup_thread(k, caller, save.arg(0)) else {
        return Ok(Reply::ok());
    };
    let logon = Logon {
        waiter: Waiter {
            thread: caller,
            status: save.arg(1),
        },
        rendezvous: save.arg(2) != 0,
    };
    if let Some(t) = k.registry.thread_mut(thread) {
        t.logons.push(logon);
    }
    Ok(Reply::ok())
}

fn thread_logon_cancel(k: &mut Kernel, caller: ObjectId) -> SysResult {
    let save = k.save(caller)?;
    let thread = lookup_thread(k, caller, save.arg(0))?;
    let status = save.arg(1);
    let rendezvous = save.arg(2) != 0;
    let mut removed = None;
    if let Some(t) = k.registry.thread_mut(thread) {
        t.logons.retain(|l| {
            let hit = removed.is_none()
                && l.waiter.status == status
                && l.rendezvous == rendezvous;
            if hit {
                removed = Some(*l);
            }
            !hit
        });
    }
    match removed {
        Some(logon) => {
            let hint = k.complete_waiter(logon.waiter, ErrorCode::Cancelled);
            Ok(Reply::ok().with_hint(hint))
        }
        None => Err(ErrorCode::General.into()),
    }
}

fn thread_request_signal(k: &mut Kernel, caller: ObjectId) -> SysResult {
    let raw = k.save(caller)?.arg(0);
    let Ok(thread) = lookup_thread(k, caller, raw) else {
        return Ok(Reply::ok());
    };
    let hint = reqsts::signal(&mut k.registry, thread, 1);
    Ok(Reply::ok().with_hint(hint))
}

fn request_signal(k: &mut Kernel, caller: ObjectId) -> SysResult {
    let count = k.save(caller)?.arg(0) as i32;
    let hint = reqsts::signal(&mut k.registry, caller, count);
    Ok(Reply::ok().with_hint(hint))
}

fn thread_security_info(k: &mut Kernel, caller: ObjectId) -> SysResult {
    let save = k.save(caller)?;
    let Ok(thread) = lookup_thread(k, caller, save.arg(0)) else {
        log::error!("thread handle invalid {:#x}", save.arg(0));
        return Ok(Reply::ok());
    };
    let process = k.thread(thread)?.process;
    write_security_info(k, process, save.arg(1))
}

// ----------------------------------------------------------------------
// TLS and TRAP/Leave
// ----------------------------------------------------------------------

fn dll_tls(k: &mut Kernel, caller: ObjectId) -> SysResult {
    let save = k.save(caller)?;
    let (handle, uid) = (save.arg(0) as i32, save.arg(1) as i32);
    match k.thread(caller)?.tls_slot(handle, uid) {
        Some(slot) => Ok(Reply::value(slot.ptr as i32)),
        None => {
            log::warn!(
                "TLS for {handle:#x} returns 0, may result in unexpected crash"
            );
            Ok(Reply::value(0))
        }
    }
}

fn dll_set_tls(k: &mut Kernel, caller: ObjectId) -> SysResult {
    let save = k.save(caller)?;
    let (handle, uid, ptr) =
        (save.arg(0) as i32, save.arg(1) as i32, save.arg(2));
    k.thread_mut(caller)?.set_tls(handle, uid, ptr);
    log::trace!("TLS set for {handle:#x}, ptr: {ptr:#x}");
    Ok(Reply::ok())
}

fn dll_free_tls(k: &mut Kernel, caller: ObjectId) -> SysResult {
    let handle = k.save(caller)?.arg(0) as i32;
    k.thread_mut(caller)?.free_tls(handle);
    log::trace!("TLS slot closed for {handle:#x}");
    Ok(Reply::ok())
}

fn leave_start(k: &mut Kernel, caller: ObjectId) -> SysResult {
    log::error!("leave started!");
    let thread = k.thread_mut(caller)?;
    thread.leave_depth += 1;
    Ok(Reply::value(thread.local.trap_handler as i32))
}

fn leave_end(k: &mut Kernel, caller: ObjectId) -> SysResult {
    let thread = k.thread_mut(caller)?;
    thread.leave_depth -= 1;
    if thread.leave_depth < 0 {
        log::error!("invalid leave, leave depth is negative!");
        thread.leave_depth = 0;
        return Err(ErrorCode::General.into());
    }
    log::trace!("leave trapped by trap handler");
    Ok(Reply::ok())
}

// ----------------------------------------------------------------------
// Libraries and the DLL lock
// ----------------------------------------------------------------------

fn wait_dll_lock(k: &mut Kernel, caller: ObjectId) -> SysResult {
    let process = k.thread(caller)?.process;
    let lock = k
        .registry
        .process(process)
        .and_then(|p| p.dll_lock)
        .ok_or(UserError::Internal("process has no dll lock"))?;
    let acquired = k
        .registry
        .mutex_mut(lock)
        .ok_or(UserError::Internal("dll lock is not a mutex"))?
        .wait(caller);
    if acquired {
        Ok(Reply::ok())
    } else {
        k.thread_mut(caller)?.state = ThreadState::WaitingMutex(lock);
        k.prepare_reschedule();
        Ok(Reply::blocked(ErrorCode::None.as_i32()))
    }
}

fn release_dll_lock(k: &mut Kernel, caller: ObjectId) -> SysResult {
    let process = k.thread(caller)?.process;
    let lock = k
        .registry
        .process(process)
        .and_then(|p| p.dll_lock)
        .ok_or(UserError::Internal("process has no dll lock"))?;
    let woken = k
        .registry
        .mutex_mut(lock)
        .ok_or(UserError::Internal("dll lock is not a mutex"))?
        .signal(caller);
    let hint = match woken {
        Some(next) => wake_all(k, &[next]),
        None => NextThread::Same,
    };
    Ok(Reply::ok().with_hint(hint))
}

fn library_attach(k: &mut Kernel, caller: ObjectId) -> SysResult {
    let save = k.save(caller)?;
    let library =
        k.lookup(caller, Handle(save.arg(0)), ObjectKind::Library)?;
    let entries: Vec<u32> = k
        .registry
        .library_mut(library)
        .ok_or(UserError::Internal("library object missing"))?
        .attach()
        .to_vec();
    write_val(k.mem_mut(), save.arg(1), &(entries.len() as i32))?;
    let mut bytes = vec![0u8; entries.len() * 4];
    LittleEndian::write_u32_into(&entries, &mut bytes);
    k.mem_mut().write(save.arg(2), &bytes)?;
    Ok(Reply::ok())
}

fn library_attached(k: &mut Kernel, caller: ObjectId) -> SysResult {
    let raw = k.save(caller)?.arg(0);
    let library = k.lookup(caller, Handle(raw), ObjectKind::Library)?;
    let attached = k
        .registry
        .library_mut(library)
        .ok_or(UserError::Internal("library object missing"))?
        .mark_attached();
    if attached {
        Ok(Reply::ok())
    } else {
        Err(ErrorCode::General.into())
    }
}

fn library_lookup(k: &mut Kernel, caller: ObjectId) -> SysResult {
    let save = k.save(caller)?;
    let Ok(library) = k.lookup(caller, Handle(save.arg(0)), ObjectKind::Library)
    else {
        return Ok(Reply::value(0));
    };
    let addr = k
        .registry
        .library(library)
        .and_then(|lib| lib.ordinal_address(save.arg(1)))
        .unwrap_or(0);
    Ok(Reply::value(addr as i32))
}

fn dll_file_name(k: &mut Kernel, caller: ObjectId) -> SysResult {
    let save = k.save(caller)?;
    let entry_addr = save.arg(0);
    let path = k
        .registry
        .iter()
        .find_map(|obj| match &obj.body {
            ObjectBody::Library(lib) if lib.covers(entry_addr) => {
                Some(lib.path.clone())
            }
            _ => None,
        });
    let Some(path) = path else {
        log::warn!("unable to find DLL name for address: {entry_addr:#x}");
        return Ok(Reply::ok());
    };
    log::trace!("find DLL for address {entry_addr:#x} with name: {path}");
    desc::write_str8(k.mem_mut(), save.arg(1), path.as_bytes())?;
    Ok(Reply::ok())
}

fn static_call_list(k: &mut Kernel, caller: ObjectId) -> SysResult {
    let save = k.save(caller)?;
    let process = k.thread(caller)?.process;
    let entries = k
        .registry
        .process(process)
        .ok_or(UserError::Internal("process object missing"))?
        .entry_points
        .clone();
    write_val(k.mem_mut(), save.arg(0), &(entries.len() as i32))?;
    let mut bytes = vec![0u8; entries.len() * 4];
    LittleEndian::write_u32_into(&entries, &mut bytes);
    k.mem_mut().write(save.arg(1), &bytes)?;
    Ok(Reply::ok())
}

fn exception_descriptor(k: &mut Kernel, caller: ObjectId) -> SysResult {
    let addr = k.save(caller)?.arg(0);
    let process = k.thread(caller)?.process;
    let desc_addr = k
        .registry
        .process(process)
        .and_then(|p| p.exception_descriptor(addr))
        .unwrap_or(0);
    Ok(Reply::value(desc_addr as i32))
}

// ----------------------------------------------------------------------
// Synchronization objects
// ----------------------------------------------------------------------

fn semaphore_create(k: &mut Kernel, caller: ObjectId) -> SysResult {
    let save = k.save(caller)?;
    let name = text_arg(k, save.arg(0))?;
    let count = save.arg(1) as i32;
    let owner = OwnerType::try_from(save.arg(2))
        .map_err(|_| UserError::code(ErrorCode::Argument))?;
    let access = if name.is_empty() {
        Access::Local
    } else {
        Access::Global
    };
    let handle = k.create_with_handle(
        caller,
        name,
        access,
        owner,
        ObjectBody::Semaphore(Semaphore::new(count)),
    )?;
    Ok(Reply::value(handle.0 as i32))
}

fn semaphore_wait(k: &mut Kernel, caller: ObjectId) -> SysResult {
    let save = k.save(caller)?;
    let sema = k.lookup(caller, Handle(save.arg(0)), ObjectKind::Semaphore)?;
    if save.arg(1) != 0 {
        log::warn!("semaphore timeout unimplemented");
    }
    let acquired = k
        .registry
        .semaphore_mut(sema)
        .ok_or(UserError::Internal("semaphore object missing"))?
        .wait(caller);
    if acquired {
        Ok(Reply::ok())
    } else {
        k.thread_mut(caller)?.state = ThreadState::WaitingSemaphore(sema);
        k.prepare_reschedule();
        Ok(Reply::blocked(ErrorCode::None.as_i32()))
    }
}

fn semaphore_signal(k: &mut Kernel, caller: ObjectId) -> SysResult {
    signal_semaphore(k, caller, 1)
}

fn semaphore_signal_n(k: &mut Kernel, caller: ObjectId) -> SysResult {
    let count = k.save(caller)?.arg(1) as i32;
    signal_semaphore(k, caller, count)
}

fn signal_semaphore(k: &mut Kernel, caller: ObjectId, count: i32) -> SysResult {
    let raw = k.save(caller)?.arg(0);
    let Ok(sema) = k.lookup(caller, Handle(raw), ObjectKind::Semaphore) else {
        return Ok(Reply::ok());
    };
    let released = k
        .registry
        .semaphore_mut(sema)
        .ok_or(UserError::Internal("semaphore object missing"))?
        .signal(count);
    let hint = wake_all(k, &released);
    Ok(Reply::ok().with_hint(hint))
}

fn mutex_create(k: &mut Kernel, caller: ObjectId) -> SysResult {
    let save = k.save(caller)?;
    let name = text_arg(k, save.arg(0))?;
    let owner = OwnerType::try_from(save.arg(1))
        .map_err(|_| UserError::code(ErrorCode::Argument))?;
    let access = if name.is_empty() {
        Access::Local
    } else {
        Access::Global
    };
    let handle = k.create_with_handle(
        caller,
        name,
        access,
        owner,
        ObjectBody::Mutex(Mutex::new()),
    )?;
    Ok(Reply::value(handle.0 as i32))
}

// ----------------------------------------------------------------------
// Chunks
// ----------------------------------------------------------------------

fn chunk_create(k: &mut Kernel, caller: ObjectId) -> SysResult {
    let save = k.save(caller)?;
    let owner = OwnerType::try_from(save.arg(0))
        .map_err(|_| UserError::code(ErrorCode::Argument))?;
    let name = text_arg(k, save.arg(1))?;
    let info: ChunkCreateInfo = read_val(k.mem(), save.arg(2))?;
    let handle = k.create_chunk(caller, owner, name, &info)?;
    Ok(Reply::value(handle.0 as i32))
}

fn chunk_base(k: &mut Kernel, caller: ObjectId) -> SysResult {
    let raw = k.save(caller)?.arg(0);
    let Ok(chunk) = k.lookup(caller, Handle(raw), ObjectKind::Chunk) else {
        return Ok(Reply::value(0));
    };
    let base = k
        .registry
        .chunk(chunk)
        .ok_or(UserError::Internal("chunk object missing"))?
        .base();
    Ok(Reply::value(base as i32))
}

fn chunk_max_size(k: &mut Kernel, caller: ObjectId) -> SysResult {
    let raw = k.save(caller)?.arg(0);
    let chunk = k.lookup(caller, Handle(raw), ObjectKind::Chunk)?;
    let max = k
        .registry
        .chunk(chunk)
        .ok_or(UserError::Internal("chunk object missing"))?
        .max_size();
    Ok(Reply::value(max as i32))
}

fn chunk_adjust(k: &mut Kernel, caller: ObjectId) -> SysResult {
    let save = k.save(caller)?;
    let chunk = k.lookup(caller, Handle(save.arg(0)), ObjectKind::Chunk)?;
    let (op, a1, a2) = (save.arg(1), save.arg(2), save.arg(3));
    let ok = k
        .with_chunk(chunk, |chunk, aspace| match op {
            0 => chunk.adjust(aspace, a1),
            1 => chunk.adjust_de(aspace, a1, a2),
            2 => chunk.commit(aspace, a1, a2),
            3 => chunk.decommit(aspace, a1, a2),
            4 => chunk.allocate(aspace, a1).is_some(),
            5 | 6 => true,
            _ => false,
        })
        .ok_or(UserError::Internal("chunk object missing"))?;
    if ok {
        Ok(Reply::ok())
    } else {
        Err(ErrorCode::General.into())
    }
}

// ----------------------------------------------------------------------
// Servers, sessions, messages
// ----------------------------------------------------------------------

fn server_create(k: &mut Kernel, caller: ObjectId) -> SysResult {
    let save = k.save(caller)?;
    let name = text_arg(k, save.arg(0))?;
    let handle = k.server_create(caller, name.clone())?;
    log::trace!("server {name} created");
    Ok(Reply::value(handle.0 as i32))
}

fn server_receive(k: &mut Kernel, caller: ObjectId) -> SysResult {
    let save = k.save(caller)?;
    let Ok(server) = k.lookup(caller, Handle(save.arg(0)), ObjectKind::Server)
    else {
        return Ok(Reply::ok());
    };
    let receive = PendingReceive {
        waiter: Waiter {
            thread: caller,
            status: save.arg(1),
        },
        slot: save.arg(2),
    };
    let hint = k.server_receive(server, receive)?;
    Ok(Reply::ok().with_hint(hint))
}

fn server_cancel(k: &mut Kernel, caller: ObjectId) -> SysResult {
    let raw = k.save(caller)?.arg(0);
    let Ok(server) = k.lookup(caller, Handle(raw), ObjectKind::Server) else {
        return Ok(Reply::ok());
    };
    let hint = k.server_cancel(server);
    Ok(Reply::ok().with_hint(hint))
}

fn session_create(k: &mut Kernel, caller: ObjectId) -> SysResult {
    let save = k.save(caller)?;
    let name = text_arg(k, save.arg(0))?;
    let slots = save.arg(1) as i32;
    let handle = k.session_create(caller, &name, slots)?;
    log::trace!("new session connected to {name} with id {}", handle.0);
    Ok(Reply::value(handle.0 as i32))
}

fn session_share(k: &mut Kernel, caller: ObjectId) -> SysResult {
    let save = k.save(caller)?;
    let handle_ptr = save.arg(0);
    let raw: i32 = read_val(k.mem(), handle_ptr)?;
    let old_handle = Handle(raw as u32);
    let session = k.lookup(caller, old_handle, ObjectKind::Session)?;

    if let Some(obj) = k.registry.get_mut(session) {
        // Mode 2 is an explicit attach: any process may open this session.
        obj.access = if save.arg(1) == 2 {
            Access::Global
        } else {
            Access::Local
        };
    }
    // Move the handle into the process scope, then drop the old entry.
    let new_handle = k.mirror(caller, session, OwnerType::Process)?;
    k.close(caller, old_handle)?;
    write_val(k.mem_mut(), handle_ptr, &(new_handle.0 as i32))?;
    Ok(Reply::ok())
}

fn set_session_ptr(k: &mut Kernel, caller: ObjectId) -> SysResult {
    let save = k.save(caller)?;
    let Ok(msg) = message_arg(k, save.arg(0)) else {
        return Ok(Reply::ok());
    };
    let session = k
        .registry
        .message(msg)
        .ok_or(UserError::Internal("message object missing"))?
        .session;
    if let Some(s) = k.registry.session_mut(session) {
        s.cookie = save.arg(1);
    }
    Ok(Reply::ok())
}

fn session_send(k: &mut Kernel, caller: ObjectId) -> SysResult {
    send_to_session(k, caller, false)
}

fn session_send_sync(k: &mut Kernel, caller: ObjectId) -> SysResult {
    send_to_session(k, caller, true)
}

fn send_to_session(
    k: &mut Kernel,
    caller: ObjectId,
    blocking: bool,
) -> SysResult {
    let save = k.save(caller)?;
    let session = k.lookup(caller, Handle(save.arg(0)), ObjectKind::Session)?;
    let function = save.arg(1) as i32;
    let args = ipc_args_from(k, save.arg(2))?;
    let status = match save.arg(3) {
        0 => {
            log::trace!(
                "sending a blind {} message",
                if blocking { "sync" } else { "async" }
            );
            None
        }
        addr => Some(addr),
    };
    let hint = k.session_send(caller, session, function, args, status, blocking)?;
    Ok(Reply {
        ret: ErrorCode::None.as_i32(),
        hint,
    })
}

fn message_complete(k: &mut Kernel, caller: ObjectId) -> SysResult {
    let save = k.save(caller)?;
    let msg = message_arg(k, save.arg(0))?;
    let hint = k.message_complete(msg, save.arg(1) as i32)?;
    Ok(Reply::ok().with_hint(hint))
}

fn message_kill(k: &mut Kernel, caller: ObjectId) -> SysResult {
    let save = k.save(caller)?;
    let category = text_arg(k, save.arg(3))?;
    let msg = message_arg(k, save.arg(0))?;
    let exit_type = ExitType::try_from(save.arg(1) as i32)
        .map_err(|_| UserError::code(ErrorCode::Argument))?;
    let reason = save.arg(2) as i32;
    let victim = k
        .registry
        .message(msg)
        .ok_or(UserError::Internal("message object missing"))?
        .thread;
    let hint = k.kill_thread(victim, exit_type, reason, &category);
    Ok(Reply::ok().with_hint(hint))
}

fn message_security_info(k: &mut Kernel, caller: ObjectId) -> SysResult {
    let save = k.save(caller)?;
    let Ok(msg) = message_arg(k, save.arg(0)) else {
        log::error!("message handle invalid {:#x}", save.arg(0));
        return Ok(Reply::ok());
    };
    let client = k
        .registry
        .message(msg)
        .ok_or(UserError::Internal("message object missing"))?
        .thread;
    let process = k.thread(client)?.process;
    write_security_info(k, process, save.arg(1))
}

fn message_get_des_length(k: &mut Kernel, caller: ObjectId) -> SysResult {
    let save = k.save(caller)?;
    let param = save.arg(1) as i32;
    if param < 0 {
        return Err(ErrorCode::Argument.into());
    }
    let msg = message_arg(k, save.arg(0))?;
    let args = k
        .registry
        .message(msg)
        .ok_or(UserError::Internal("message object missing"))?
        .args;
    // Either width is acceptable here; the length is counted in the
    // descriptor's own characters.
    let addr = args
        .descriptor(param as usize, true)
        .or_else(|| args.descriptor(param as usize, false))
        .ok_or(UserError::code(ErrorCode::BadDescriptor))?;
    let header = desc::read_header(k.mem(), addr)
        .map_err(|_| UserError::code(ErrorCode::BadDescriptor))?;
    Ok(Reply::value(header.len as i32))
}

fn message_get_des_max_length(k: &mut Kernel, caller: ObjectId) -> SysResult {
    let save = k.save(caller)?;
    let param = save.arg(1) as i32;
    if param < 0 {
        return Err(ErrorCode::Argument.into());
    }
    let msg = message_arg(k, save.arg(0))?;
    let args = k
        .registry
        .message(msg)
        .ok_or(UserError::Internal("message object missing"))?
        .args;
    let addr = args
        .descriptor(param as usize, true)
        .or_else(|| args.descriptor(param as usize, false))
        .ok_or(UserError::code(ErrorCode::General))?;
    let max = desc::max_length(k.mem(), addr)
        .map_err(|_| UserError::code(ErrorCode::General))?;
    Ok(Reply::value(max))
}

fn message_ipc_copy(k: &mut Kernel, caller: ObjectId) -> SysResult {
    let save = k.save(caller)?;
    let (info_ptr, param) = (save.arg(2), save.arg(1) as i32);
    if info_ptr == 0 || param < 0 {
        return Err(ErrorCode::Argument.into());
    }
    let info: IpcCopyInfo = read_val(k.mem(), info_ptr)?;
    let msg = message_arg(k, save.arg(0))?;
    let args = k
        .registry
        .message(msg)
        .ok_or(UserError::Internal("message object missing"))?
        .args;

    let wide = info.flags & IPC_COPY_WIDE != 0;
    let write_to_client = info.flags & IPC_COPY_WRITE != 0;
    let offset = save.arg(3) as usize;
    let char_size = if wide { 2 } else { 1 };

    let arg_addr = args
        .descriptor(param as usize, wide)
        .ok_or(UserError::code(ErrorCode::BadDescriptor))?;

    if !write_to_client {
        // Read from client: copy the argument descriptor's payload, from
        // `offset` (in characters), into the caller's raw buffer.
        let header = desc::read_header(k.mem(), arg_addr)
            .map_err(|_| UserError::code(ErrorCode::BadDescriptor))?;
        let chars = header.len as usize;
        if offset > chars {
            return Err(ErrorCode::Argument.into());
        }
        if chars - offset > info.target_len.max(0) as usize {
            return Err(ErrorCode::NoMemory.into());
        }
        let mut payload = vec![0u8; chars * char_size];
        k.mem().read(header.data, &mut payload)?;
        k.mem_mut()
            .write(info.target_ptr, &payload[offset * char_size..])?;
        Ok(Reply::ok())
    } else {
        // Write to client: the caller's buffer lands at `offset` characters
        // into the argument descriptor; the prefix is zero-filled.
        let copy_chars = info.target_len.max(0) as usize;
        let mut content = vec![0u8; (offset + copy_chars) * char_size];
        let dst = &mut content[offset * char_size..];
        k.mem().read(info.target_ptr, dst)?;
        let result = if wide {
            let mut units = vec![0u16; offset + copy_chars];
            LittleEndian::read_u16_into(&content, &mut units);
            desc::write_str16(k.mem_mut(), arg_addr, &units)
        } else {
            desc::write_str8(k.mem_mut(), arg_addr, &content)
        };
        result.map_err(|_| UserError::code(ErrorCode::BadDescriptor))?;
        Ok(Reply::ok())
    }
}

// ----------------------------------------------------------------------
// Properties
// ----------------------------------------------------------------------

fn property_define(k: &mut Kernel, caller: ObjectId) -> SysResult {
    let save = k.save(caller)?;
    let (category, key) = (save.arg(0) as i32, save.arg(1) as i32);
    let info: PropertyInfo = read_val(k.mem(), save.arg(2))?;
    log::trace!(
        "define property with category: {category:#x}, key: {key:#x}, type: {}",
        info.kind
    );
    let prop = k.property_ensure(category, key);
    let defined = k
        .registry
        .property_mut(prop)
        .ok_or(UserError::Internal("property object missing"))?
        .define(&info);
    if defined.is_none() {
        log::warn!("unknown property type, exit with error");
        return Err(ErrorCode::Argument.into());
    }
    Ok(Reply::ok())
}

fn property_attach(k: &mut Kernel, caller: ObjectId) -> SysResult {
    let save = k.save(caller)?;
    let (category, key) = (save.arg(0) as i32, save.arg(1) as i32);
    let owner = OwnerType::try_from(save.arg(2))
        .map_err(|_| UserError::code(ErrorCode::Argument))?;
    log::trace!(
        "attach to property with category: {category:#x}, key: {key:#x}"
    );
    let prop = k.property_ensure(category, key);
    let handle = k.mirror(caller, prop, owner)?;
    Ok(Reply::value(handle.0 as i32))
}

fn property_subscribe(k: &mut Kernel, caller: ObjectId) -> SysResult {
    let save = k.save(caller)?;
    let Ok(prop) = k.lookup(caller, Handle(save.arg(0)), ObjectKind::Property)
    else {
        return Ok(Reply::ok());
    };
    if let Some(p) = k.registry.property_mut(prop) {
        p.subscribers.push(Waiter {
            thread: caller,
            status: save.arg(1),
        });
    }
    Ok(Reply::ok())
}

fn property_cancel(k: &mut Kernel, caller: ObjectId) -> SysResult {
    let raw = k.save(caller)?.arg(0);
    let Ok(prop) = k.lookup(caller, Handle(raw), ObjectKind::Property) else {
        return Ok(Reply::ok());
    };
    let waiters = k
        .registry
        .property_mut(prop)
        .map(|p| p.take_subscriptions_of(caller))
        .unwrap_or_default();
    let mut hint = NextThread::Same;
    for waiter in waiters {
        hint = hint.combine(k.complete_waiter(waiter, ErrorCode::Cancelled));
    }
    Ok(Reply::ok().with_hint(hint))
}

fn property_set_int(k: &mut Kernel, caller: ObjectId) -> SysResult {
    let save = k.save(caller)?;
    let prop = k.lookup(caller, Handle(save.arg(0)), ObjectKind::Property)?;
    set_property_int(k, prop, save.arg(1) as i32)
}

fn property_set_bin(k: &mut Kernel, caller: ObjectId) -> SysResult {
    let save = k.save(caller)?;
    let prop = k.lookup(caller, Handle(save.arg(0)), ObjectKind::Property)?;
    set_property_bin(k, prop, save.arg(2), save.arg(1) as i32)
}

fn property_get_int(k: &mut Kernel, caller: ObjectId) -> SysResult {
    let save = k.save(caller)?;
    let prop = k.lookup(caller, Handle(save.arg(0)), ObjectKind::Property)?;
    get_property_int(k, prop, save.arg(1))
}

fn property_get_bin(k: &mut Kernel, caller: ObjectId) -> SysResult {
    let save = k.save(caller)?;
    let prop = k.lookup(caller, Handle(save.arg(0)), ObjectKind::Property)?;
    get_property_bin(k, prop, save.arg(2), save.arg(1) as i32)
}

fn property_find_get_int(k: &mut Kernel, caller: ObjectId) -> SysResult {
    let save = k.save(caller)?;
    let (category, key) = (save.arg(0) as i32, save.arg(1) as i32);
    let Some(prop) = k.property_by_key(category, key) else {
        log::warn!(
            "property not found: category = {category:#x}, key = {key:#x}"
        );
        return Err(ErrorCode::NotFound.into());
    };
    get_property_int(k, prop, save.arg(2))
}

fn property_find_get_bin(k: &mut Kernel, caller: ObjectId) -> SysResult {
    let save = k.save(caller)?;
    let (category, key) = (save.arg(0) as i32, save.arg(1) as i32);
    let Some(prop) = k.property_by_key(category, key) else {
        log::warn!(
            "property not found: category = {category:#x}, key = {key:#x}"
        );
        return Err(ErrorCode::NotFound.into());
    };
    get_property_bin(k, prop, save.arg(2), save.arg(3) as i32)
}

fn property_find_set_int(k: &mut Kernel, caller: ObjectId) -> SysResult {
    let save = k.save(caller)?;
    let (category, key) = (save.arg(0) as i32, save.arg(1) as i32);
    let prop = k
        .property_by_key(category, key)
        .ok_or(UserError::code(ErrorCode::BadHandle))?;
    set_property_int(k, prop, save.arg(2) as i32)
}

fn property_find_set_bin(k: &mut Kernel, caller: ObjectId) -> SysResult {
    let save = k.save(caller)?;
    let (category, key) = (save.arg(0) as i32, save.arg(1) as i32);
    let prop = k
        .property_by_key(category, key)
        .ok_or(UserError::code(ErrorCode::BadHandle))?;
    set_property_bin(k, prop, save.arg(3), save.arg(2) as i32)
}

fn set_property_int(k: &mut Kernel, prop: ObjectId, value: i32) -> SysResult {
    let stored = k
        .registry
        .property_mut(prop)
        .ok_or(UserError::Internal("property object missing"))?
        .set_int(value);
    if !stored {
        return Err(ErrorCode::Argument.into());
    }
    let hint = k.property_publish(prop);
    Ok(Reply::ok().with_hint(hint))
}

fn set_property_bin(
    k: &mut Kernel,
    prop: ObjectId,
    data_ptr: GuestAddr,
    size: i32,
) -> SysResult {
    let mut data = vec![0u8; size.max(0) as usize];
    k.mem().read(data_ptr, &mut data)?;
    let stored = k
        .registry
        .property_mut(prop)
        .ok_or(UserError::Internal("property object missing"))?
        .set_bin(&data);
    if !stored {
        return Err(ErrorCode::Argument.into());
    }
    let hint = k.property_publish(prop);
    Ok(Reply::ok().with_hint(hint))
}

fn get_property_int(
    k: &mut Kernel,
    prop: ObjectId,
    out: GuestAddr,
) -> SysResult {
    let p = k
        .registry
        .property(prop)
        .ok_or(UserError::Internal("property object missing"))?;
    if !p.is_defined() {
        return Err(ErrorCode::BadHandle.into());
    }
    let value = p.get_int().ok_or(UserError::code(ErrorCode::Argument))?;
    write_val(k.mem_mut(), out, &value)?;
    Ok(Reply::ok())
}

fn get_property_bin(
    k: &mut Kernel,
    prop: ObjectId,
    out: GuestAddr,
    capacity: i32,
) -> SysResult {
    let data = {
        let p = k
            .registry
            .property(prop)
            .ok_or(UserError::Internal("property object missing"))?;
        if !p.is_defined() {
            return Err(ErrorCode::BadHandle.into());
        }
        match p.get_bin() {
            Some(data) if !data.is_empty() => data.to_vec(),
            _ => return Err(ErrorCode::Argument.into()),
        }
    };
    if data.len() as i32 > capacity {
        return Err(ErrorCode::NoMemory.into());
    }
    k.mem_mut().write(out, &data)?;
    Ok(Reply::ok())
}

// ----------------------------------------------------------------------
// Timers, After, change notifiers, time of day
// ----------------------------------------------------------------------

fn timer_create(k: &mut Kernel, caller: ObjectId) -> SysResult {
    let handle = k.create_with_handle(
        caller,
        String::new(),
        Access::Local,
        OwnerType::Process,
        ObjectBody::Timer(Timer::default()),
    )?;
    Ok(Reply::value(handle.0 as i32))
}

fn timer_after(k: &mut Kernel, caller: ObjectId) -> SysResult {
    let save = k.save(caller)?;
    let Ok(timer) = k.lookup(caller, Handle(save.arg(0)), ObjectKind::Timer)
    else {
        return Ok(Reply::ok());
    };
    let waiter = Waiter {
        thread: caller,
        status: save.arg(1),
    };
    k.timer_after(timer, waiter, save.arg(2) as i32 as i64)?;
    Ok(Reply::ok())
}

fn timer_at_utc(k: &mut Kernel, caller: ObjectId) -> SysResult {
    let save = k.save(caller)?;
    let Ok(timer) = k.lookup(caller, Handle(save.arg(0)), ObjectKind::Timer)
    else {
        return Ok(Reply::ok());
    };
    let at_micros = save.arg_u64(2);
    let now_micros =
        k.clock.now_unix_micros() + YEAR_ZERO_TO_UNIX_MICROS;
    let delta = at_micros.saturating_sub(now_micros) as i64;
    let waiter = Waiter {
        thread: caller,
        status: save.arg(1),
    };
    k.timer_after(timer, waiter, delta)?;
    Ok(Reply::ok())
}

fn timer_cancel(k: &mut Kernel, caller: ObjectId) -> SysResult {
    let raw = k.save(caller)?.arg(0);
    let Ok(timer) = k.lookup(caller, Handle(raw), ObjectKind::Timer) else {
        return Ok(Reply::ok());
    };
    let hint = k.timer_cancel(timer);
    Ok(Reply::ok().with_hint(hint))
}

fn after(k: &mut Kernel, caller: ObjectId) -> SysResult {
    let save = k.save(caller)?;
    k.thread_after(caller, save.arg(1), save.arg(0) as i32 as i64)?;
    Ok(Reply::ok())
}

fn change_notifier_create(k: &mut Kernel, caller: ObjectId) -> SysResult {
    let owner = OwnerType::try_from(k.save(caller)?.arg(0))
        .map_err(|_| UserError::code(ErrorCode::Argument))?;
    let handle = k.create_with_handle(
        caller,
        String::new(),
        Access::Local,
        owner,
        ObjectBody::ChangeNotifier(ChangeNotifier::new()),
    )?;
    Ok(Reply::value(handle.0 as i32))
}

fn change_notifier_logon(k: &mut Kernel, caller: ObjectId) -> SysResult {
    let save = k.save(caller)?;
    let notifier =
        k.lookup(caller, Handle(save.arg(0)), ObjectKind::ChangeNotifier)?;
    let accepted = k
        .registry
        .notifier_mut(notifier)
        .ok_or(UserError::Internal("notifier object missing"))?
        .logon(Waiter {
            thread: caller,
            status: save.arg(1),
        });
    if accepted {
        Ok(Reply::ok())
    } else {
        Err(ErrorCode::General.into())
    }
}

fn time_now(k: &mut Kernel, caller: ObjectId) -> SysResult {
    let save = k.save(caller)?;
    let time_out = GuestPtr::<u64>::new(save.arg(0));
    let offset_out = GuestPtr::<i32>::new(save.arg(1));
    if time_out.is_null() || offset_out.is_null() {
        return Err(ErrorCode::Argument.into());
    }
    let micros = k.clock.now_unix_micros() + YEAR_ZERO_TO_UNIX_MICROS;
    let offset = k.clock.utc_offset_seconds();
    time_out.write(k.mem_mut(), &micros)?;
    offset_out.write(k.mem_mut(), &offset)?;
    Ok(Reply::ok())
}

// ----------------------------------------------------------------------
// Debug, security, HAL
// ----------------------------------------------------------------------

fn debug_print(k: &mut Kernel, caller: ObjectId) -> SysResult {
    let text = text_arg(k, k.save(caller)?.arg(0))?;
    log::info!("{text}");
    Ok(Reply::ok())
}

fn plat_sec_diagnostic(_k: &mut Kernel, _caller: ObjectId) -> SysResult {
    // Let all pass for now.
    Ok(Reply::ok())
}

fn hal_function(k: &mut Kernel, caller: ObjectId) -> SysResult {
    let save = k.save(caller)?;
    let Some(mut hal) = k.hal.take() else {
        log::warn!("HAL collaborator not installed");
        return Err(ErrorCode::NotSupported.into());
    };
    let ret = hal.do_hal(
        k.mem_mut(),
        save.arg(0) as i32,
        save.arg(1) as i32,
        save.arg(2),
        save.arg(3),
    );
    k.hal = Some(hal);
    Ok(Reply::value(ret))
}

// ----------------------------------------------------------------------
// Dispatch tables, sorted by ordinal
// ----------------------------------------------------------------------

macro_rules! svc_table {
    ($($nr:expr => $handler:ident,)*) => {
        &[
            $(
                SvcEntry {
                    nr: $nr,
                    name: stringify!($handler),
                    handler: $handler,
                },
            )*
        ]
    };
}

static FAST_V94: &[SvcEntry] = svc_table! {
    sysnum::WAIT_FOR_ANY_REQUEST => wait_for_any_request,
    sysnum::HEAP => heap,
    sysnum::HEAP_SWITCH => heap_switch,
    sysnum::ACTIVE_SCHEDULER => active_scheduler,
    sysnum::SET_ACTIVE_SCHEDULER => set_active_scheduler,
    sysnum::TRAP_HANDLER => trap_handler,
    sysnum::SET_TRAP_HANDLER => set_trap_handler,
    sysnum::DEBUG_MASK => debug_mask,
    sysnum::DEBUG_MASK_INDEX => debug_mask_index,
    sysnum::USER_SVR_ROM_HEADER_ADDRESS => user_svr_rom_header_address,
    sysnum::SAFE_INC_32 => safe_inc_32,
    sysnum::SAFE_DEC_32 => safe_dec_32,
    sysnum::UTC_OFFSET => utc_offset,
    sysnum::GET_GLOBAL_USER_DATA => get_global_user_data,
};

// The 9.3 subset. Note that ordinal 0xD answers the plain debug mask on
// this revision.
static FAST_V93: &[SvcEntry] = svc_table! {
    sysnum::WAIT_FOR_ANY_REQUEST => wait_for_any_request,
    sysnum::HEAP => heap,
    sysnum::HEAP_SWITCH => heap_switch,
    sysnum::ACTIVE_SCHEDULER => active_scheduler,
    sysnum::SET_ACTIVE_SCHEDULER => set_active_scheduler,
    sysnum::TRAP_HANDLER => trap_handler,
    sysnum::SET_TRAP_HANDLER => set_trap_handler,
    sysnum::DEBUG_MASK_INDEX => debug_mask,
};

static SLOW_V93: &[SvcEntry] = svc_table! {
    sysnum::OBJECT_NEXT => object_next,
};

static SLOW_V94: &[SvcEntry] = svc_table! {
    sysnum::OBJECT_NEXT => object_next,
    sysnum::CHUNK_BASE => chunk_base,
    sysnum::CHUNK_MAX_SIZE => chunk_max_size,
    sysnum::LIBRARY_LOOKUP => library_lookup,
    sysnum::PROCESS_GET_ID => process_get_id,
    sysnum::DLL_FILE_NAME => dll_file_name,
    sysnum::PROCESS_RESUME => process_resume,
    sysnum::PROCESS_FILENAME => process_filename,
    sysnum::PROCESS_COMMAND_LINE => process_command_line,
    sysnum::PROCESS_EXIT_TYPE => process_exit_type,
    sysnum::PROCESS_SET_PRIORITY => process_set_priority,
    sysnum::PROCESS_SET_FLAGS => process_set_flags,
    sysnum::SEMAPHORE_WAIT => semaphore_wait,
    sysnum::SEMAPHORE_SIGNAL => semaphore_signal,
    sysnum::SEMAPHORE_SIGNAL_N => semaphore_signal_n,
    sysnum::SERVER_RECEIVE => server_receive,
    sysnum::SERVER_CANCEL => server_cancel,
    sysnum::SET_SESSION_PTR => set_session_ptr,
    sysnum::SESSION_SEND => session_send,
    sysnum::THREAD_ID => thread_id,
    sysnum::SESSION_SHARE => session_share,
    sysnum::THREAD_RESUME => thread_resume,
    sysnum::THREAD_SUSPEND => thread_suspend,
    sysnum::THREAD_SET_PRIORITY => thread_set_priority,
    sysnum::THREAD_SET_FLAGS => thread_set_flags,
    sysnum::TIMER_CANCEL => timer_cancel,
    sysnum::TIMER_AFTER => timer_after,
    sysnum::TIMER_AT_UTC => timer_at_utc,
    sysnum::CHANGE_NOTIFIER_LOGON => change_notifier_logon,
    sysnum::REQUEST_SIGNAL => request_signal,
    sysnum::HANDLE_NAME => handle_name,
    sysnum::AFTER => after,
    sysnum::MESSAGE_COMPLETE => message_complete,
    sysnum::TIME_NOW => time_now,
    sysnum::SESSION_SEND_SYNC => session_send_sync,
    sysnum::DLL_TLS => dll_tls,
    sysnum::HAL_FUNCTION => hal_function,
    sysnum::PROCESS_COMMAND_LINE_LENGTH => process_command_line_length,
    sysnum::DEBUG_PRINT => debug_print,
    sysnum::PROCESS_TYPE => process_type,
    sysnum::THREAD_CREATE => thread_create,
    sysnum::HANDLE_CLOSE => handle_close,
    sysnum::CHUNK_CREATE => chunk_create,
    sysnum::CHUNK_ADJUST => chunk_adjust,
    sysnum::HANDLE_OPEN_OBJECT => handle_open_object,
    sysnum::HANDLE_DUPLICATE => handle_duplicate,
    sysnum::MUTEX_CREATE => mutex_create,
    sysnum::SEMAPHORE_CREATE => semaphore_create,
    sysnum::THREAD_KILL => thread_kill,
    sysnum::THREAD_LOGON => thread_logon,
    sysnum::THREAD_LOGON_CANCEL => thread_logon_cancel,
    sysnum::DLL_SET_TLS => dll_set_tls,
    sysnum::DLL_FREE_TLS => dll_free_tls,
    sysnum::THREAD_RENAME => thread_rename,
    sysnum::PROCESS_LOGON => process_logon,
    sysnum::PROCESS_LOGON_CANCEL => process_logon_cancel,
    sysnum::THREAD_PROCESS => thread_process,
    sysnum::SERVER_CREATE => server_create,
    sysnum::SESSION_CREATE => session_create,
    sysnum::TIMER_CREATE => timer_create,
    sysnum::CHANGE_NOTIFIER_CREATE => change_notifier_create,
    sysnum::WAIT_DLL_LOCK => wait_dll_lock,
    sysnum::RELEASE_DLL_LOCK => release_dll_lock,
    sysnum::LIBRARY_ATTACH => library_attach,
    sysnum::LIBRARY_ATTACHED => library_attached,
    sysnum::STATIC_CALL_LIST => static_call_list,
    sysnum::LAST_THREAD_HANDLE => last_thread_handle,
    sysnum::PROCESS_RENDEZVOUS => process_rendezvous,
    sysnum::MESSAGE_GET_DES_LENGTH => message_get_des_length,
    sysnum::MESSAGE_GET_DES_MAX_LENGTH => message_get_des_max_length,
    sysnum::MESSAGE_IPC_COPY => message_ipc_copy,
    sysnum::MESSAGE_KILL => message_kill,
    sysnum::PROCESS_SECURITY_INFO => process_security_info,
    sysnum::THREAD_SECURITY_INFO => thread_security_info,
    sysnum::MESSAGE_SECURITY_INFO => message_security_info,
    sysnum::PROPERTY_DEFINE => property_define,
    sysnum::PROPERTY_ATTACH => property_attach,
    sysnum::PROPERTY_SUBSCRIBE => property_subscribe,
    sysnum::PROPERTY_CANCEL => property_cancel,
    sysnum::PROPERTY_GET_INT => property_get_int,
    sysnum::PROPERTY_GET_BIN => property_get_bin,
    sysnum::PROPERTY_SET_INT => property_set_int,
    sysnum::PROPERTY_SET_BIN => property_set_bin,
    sysnum::PROPERTY_FIND_GET_INT => property_find_get_int,
    sysnum::PROPERTY_FIND_GET_BIN => property_find_get_bin,
    sysnum::PROPERTY_FIND_SET_INT => property_find_set_int,
    sysnum::PROPERTY_FIND_SET_BIN => property_find_set_bin,
    sysnum::PROCESS_SET_DATA_PARAMETER => process_set_data_parameter,
    sysnum::PROCESS_GET_DATA_PARAMETER => process_get_data_parameter,
    sysnum::PROCESS_DATA_PARAMETER_LENGTH => process_data_parameter_length,
    sysnum::PLAT_SEC_DIAGNOSTIC => plat_sec_diagnostic,
    sysnum::EXCEPTION_DESCRIPTOR => exception_descriptor,
    sysnum::THREAD_REQUEST_SIGNAL => thread_request_signal,
    sysnum::LEAVE_START => leave_start,
    sysnum::LEAVE_END => leave_end,
};

#[cfg(test)]
mod tests;
