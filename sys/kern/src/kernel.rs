// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The kernel context.
//!
//! All state a syscall handler can touch hangs off [`Kernel`], which is
//! threaded into every handler explicitly; there are no globals. The
//! context owns the object registry, the collaborator seams (guest memory,
//! wall clock, HAL, panic hook), the timer queue, and the name indexes, and
//! provides the cross-object operations (handle plumbing, IPC delivery,
//! thread death) that no single kind-state module can express alone.
//!
//! Anything that happens off the host scheduler thread (a windowing backend
//! signalling an environment change, for instance) posts a [`KernelEvent`]
//! through the channel and gets picked up at the next tick; kernel state is
//! only ever mutated from the thread driving [`Kernel::step`].

use std::collections::HashMap;
use std::sync::mpsc;

use abi::{
    ChunkCreateAtt, ChunkCreateInfo, EpocVersion, ErrorCode, ExitType, Handle,
    Message2, ObjectKind, OwnerType, Priority, SecurityInfo, UidType,
};

use crate::chunk::{Chunk, ChunkAttrib, ChunkKind};
use crate::err::UserError;
use crate::ipc::{IpcArgs, Message, PendingReceive, Server, Session};
use crate::library::Library;
use crate::notifier::ChangeNotifier;
use crate::object::{Access, Object, ObjectBody, ObjectId, Registry};
use crate::panics;
use crate::process::Process;
use crate::property::Property;
use crate::reqsts::{self, Logon, Waiter};
use crate::sched::{self, NextThread};
use crate::sync::Mutex;
use crate::thread::{SavedState, Thread, ThreadState};
use crate::time::{Clock, ExpiryTarget, TimerQueue, Timestamp};
use crate::umem::{AddressSpace, GuestAddr, GuestMem, GuestMemory};

/// Static configuration of one kernel instance.
#[derive(Clone, Debug)]
pub struct KernelConfig {
    pub version: EpocVersion,
    /// Value reported by the `DebugMask` fast calls.
    pub debug_mask: u32,
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            version: EpocVersion::Epoc94,
            debug_mask: 0,
        }
    }
}

impl KernelConfig {
    /// ROM header address reported to `UserSvrRomHeaderAddress`.
    pub fn rom_header_addr(&self) -> u32 {
        match self.version {
            EpocVersion::Epoc6 => 0x5000_0000,
            _ => 0x8000_0000,
        }
    }
}

/// The HAL collaborator, servicing `HalFunction`.
pub trait HalHandler {
    fn do_hal(
        &mut self,
        mem: &mut dyn GuestMem,
        category: i32,
        function: i32,
        a1: GuestAddr,
        a2: GuestAddr,
    ) -> i32;
}

/// Optional hook notified whenever a thread is killed with a panic
/// category (the scripting collaborator, usually).
pub trait PanicHook {
    fn on_panic(&mut self, category: &str, reason: i32);
}

/// The CPU collaborator: runs guest instructions in a thread's register
/// context until something needs the kernel.
pub trait Cpu {
    fn run(&mut self, save: &mut SavedState, quantum: u32) -> CpuExit;
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum CpuExit {
    /// Supervisor call with the given ordinal.
    Svc(u32),
    QuantumExpired,
    /// The thread has nothing to run (e.g. spinning in its idle loop).
    Idle,
}

/// Work posted from outside the scheduler thread, drained at each tick.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum KernelEvent {
    /// A system-wide change; completes all change-notifier logons.
    SystemChange,
}

/// Loader-facing description of a process to construct.
#[derive(Clone, Debug, Default)]
pub struct ProcessInit {
    pub name: String,
    pub command_line: String,
    pub uids: UidType,
    pub security: SecurityInfo,
    pub priority: Priority,
    /// Static call list collected from the image's imports.
    pub entry_points: Vec<u32>,
}

pub struct Kernel {
    pub registry: Registry,
    mem: Box<dyn GuestMemory>,
    pub clock: Box<dyn Clock>,
    pub hal: Option<Box<dyn HalHandler>>,
    pub panic_hook: Option<Box<dyn PanicHook>>,
    pub config: KernelConfig,
    pub timers: TimerQueue,
    now: Timestamp,
    current: Option<ObjectId>,
    /// A `NextThread::Specific` hint carried to the next `step`.
    preferred: Option<ObjectId>,
    reschedule: bool,
    /// Registered server names. Weak: entries die with their server.
    servers: HashMap<String, ObjectId>,
    /// `(category, key)` index. Strong: defined properties persist.
    properties: HashMap<(i32, i32), ObjectId>,
    events_tx: mpsc::Sender<KernelEvent>,
    events_rx: mpsc::Receiver<KernelEvent>,
}

impl Kernel {
    pub fn new(
        mem: Box<dyn GuestMemory>,
        clock: Box<dyn Clock>,
        config: KernelConfig,
    ) -> Self {
        let (events_tx, events_rx) = mpsc::channel();
        Self {
            registry: Registry::new(),
            mem,
            clock,
            hal: None,
            panic_hook: None,
            config,
            timers: TimerQueue::new(),
            now: Timestamp::default(),
            current: None,
            preferred: None,
            reschedule: false,
            servers: HashMap::new(),
            properties: HashMap::new(),
            events_tx,
            events_rx,
        }
    }

    pub fn mem(&self) -> &dyn GuestMem {
        &*self.mem
    }

    pub fn mem_mut(&mut self) -> &mut dyn GuestMem {
        &mut *self.mem
    }

    pub fn now(&self) -> Timestamp {
        self.now
    }

    /// Clonable handle for cross-thread event posting.
    pub fn event_sender(&self) -> mpsc::Sender<KernelEvent> {
        self.events_tx.clone()
    }

    /// Marks that the scheduler should pick a new thread before running any
    /// more guest code.
    pub fn prepare_reschedule(&mut self) {
        self.reschedule = true;
    }

    /// Whether a handler requested a reschedule since the last slice.
    /// Cleared by [`Kernel::step`]; hosts driving the CPU themselves consult
    /// it between calls.
    pub fn needs_reschedule(&self) -> bool {
        self.reschedule
    }

    // ------------------------------------------------------------------
    // Current thread and process
    // ------------------------------------------------------------------

    pub fn current_thread(&self) -> Option<ObjectId> {
        self.current
    }

    pub fn set_current_thread(&mut self, thread: Option<ObjectId>) {
        self.current = thread;
    }

    pub fn current_process(&self) -> Option<ObjectId> {
        self.registry.thread(self.current?).map(|t| t.process)
    }

    pub(crate) fn thread(&self, id: ObjectId) -> Result<&Thread, UserError> {
        self.registry
            .thread(id)
            .ok_or(UserError::Internal("thread object missing"))
    }

    pub(crate) fn thread_mut(
        &mut self,
        id: ObjectId,
    ) -> Result<&mut Thread, UserError> {
        self.registry
            .thread_mut(id)
            .ok_or(UserError::Internal("thread object missing"))
    }

    /// Copy of the caller's saved registers, for argument marshalling.
    pub fn save(&self, thread: ObjectId) -> Result<SavedState, UserError> {
        Ok(self.thread(thread)?.save)
    }

    // ------------------------------------------------------------------
    // Handle plumbing
    // ------------------------------------------------------------------

    /// Resolves a handle word in `caller`'s scopes, without a kind check.
    /// The special bit is ignored for table addressing; the two pseudo
    /// handles resolve without touching any table.
    pub fn resolve_handle(
        &self,
        caller: ObjectId,
        handle: Handle,
    ) -> Option<ObjectId> {
        match handle {
            Handle::CURRENT_THREAD => Some(caller),
            Handle::CURRENT_PROCESS => {
                self.registry.thread(caller).map(|t| t.process)
            }
            h => {
                let index = h.masked().index();
                let thread = self.registry.thread(caller)?;
                if h.is_thread_local() {
                    thread.handles.get(index)
                } else {
                    self.registry.process(thread.process)?.handles.get(index)
                }
            }
        }
    }

    /// Handle lookup with the kind check every typed operation performs.
    pub fn lookup(
        &self,
        caller: ObjectId,
        handle: Handle,
        kind: ObjectKind,
    ) -> Result<ObjectId, UserError> {
        let id = self
            .resolve_handle(caller, handle)
            .ok_or(UserError::code(ErrorCode::BadHandle))?;
        match self.registry.get(id) {
            Some(obj) if obj.kind() == kind => Ok(id),
            _ => Err(ErrorCode::BadHandle.into()),
        }
    }

    /// Installs a table entry for `id` in the requested scope of `caller`
    /// and returns the guest handle word. `fresh` marks the initial entry
    /// of a newly created object, which already owns one reference.
    pub fn install_handle(
        &mut self,
        caller: ObjectId,
        id: ObjectId,
        owner: OwnerType,
        fresh: bool,
    ) -> Result<Handle, UserError> {
        if !fresh {
            self.registry.inc_ref(id);
        }
        let slot = match owner {
            OwnerType::Thread => self.thread_mut(caller)?.handles.install(id),
            OwnerType::Process => {
                let process = self.thread(caller)?.process;
                self.registry
                    .process_mut(process)
                    .ok_or(UserError::Internal("process object missing"))?
                    .handles
                    .install(id)
            }
        };
        let Some(slot) = slot else {
            self.release(id);
            return Err(ErrorCode::NoMemory.into());
        };
        let handle = Handle::for_index(slot, owner == OwnerType::Thread);
        self.thread_mut(caller)?.last_handle = handle.0;
        Ok(handle)
    }

    /// Mirrors an existing object into another scope: one more table entry,
    /// one more reference, a brand new handle word.
    pub fn mirror(
        &mut self,
        caller: ObjectId,
        id: ObjectId,
        owner: OwnerType,
    ) -> Result<Handle, UserError> {
        if !self.registry.contains(id) {
            return Err(ErrorCode::BadHandle.into());
        }
        self.install_handle(caller, id, owner, false)
    }

    /// Closes a handle: removes the table entry and drops its reference,
    /// destroying the object if that was the last one.
    pub fn close(
        &mut self,
        caller: ObjectId,
        handle: Handle,
    ) -> Result<(), UserError> {
        if handle.is_special()
            || handle == Handle::CURRENT_PROCESS
            || handle == Handle::CURRENT_THREAD
        {
            return Err(ErrorCode::General.into());
        }
        let index = handle.index();
        let removed = if handle.is_thread_local() {
            self.thread_mut(caller)?.handles.remove(index)
        } else {
            let process = self.thread(caller)?.process;
            self.registry
                .process_mut(process)
                .ok_or(UserError::Internal("process object missing"))?
                .handles
                .remove(index)
        };
        let id = removed.ok_or(UserError::code(ErrorCode::BadHandle))?;
        self.release(id);
        Ok(())
    }

    /// Drops one reference; runs teardown when the object dies.
    pub fn release(&mut self, id: ObjectId) {
        if let Some(obj) = self.registry.dec_ref(id) {
            self.teardown(obj);
        }
    }

    /// Kind-specific last rites, run exactly once per object.
    fn teardown(&mut self, obj: Object) {
        match obj.body {
            ObjectBody::Server(server) => {
                self.servers.retain(|_, &mut id| id != obj.id);
                if let Some(recv) = server.receive {
                    let _ =
                        self.complete_waiter(recv.waiter, ErrorCode::Cancelled);
                }
                for msg_id in server.queue {
                    if let Some(msg_obj) = self.registry.remove(msg_id) {
                        if let ObjectBody::Message(msg) = msg_obj.body {
                            let _ = self.finish_message(
                                msg_id,
                                msg,
                                ErrorCode::Cancelled.as_i32(),
                            );
                        }
                    }
                }
            }
            ObjectBody::Chunk(mut chunk) => {
                // Hand the committed window back to the address space.
                match chunk.kind() {
                    ChunkKind::Normal => {
                        let _ = chunk.adjust(&mut *self.mem, 0);
                    }
                    ChunkKind::DoubleEnded => {
                        let _ = chunk.adjust_de(&mut *self.mem, 0, 0);
                    }
                    ChunkKind::Disconnected => {
                        let max = chunk.max_size();
                        chunk.decommit(&mut *self.mem, 0, max);
                    }
                }
            }
            ObjectBody::Timer(timer) => {
                self.timers.cancel(ExpiryTarget::Timer(obj.id));
                if let Some((_, waiter)) = timer.pending {
                    let _ = self.complete_waiter(waiter, ErrorCode::Cancelled);
                }
            }
            ObjectBody::Semaphore(mut sema) => {
                // Wake anyone still queued so nothing waits on a dead object.
                for waiter in sema.take_waiters() {
                    self.make_ready(waiter);
                }
            }
            ObjectBody::Mutex(mut mutex) => {
                for waiter in mutex.take_waiters() {
                    self.make_ready(waiter);
                }
            }
            _ => {}
        }
    }

    fn make_ready(&mut self, thread: ObjectId) {
        if let Some(state) = self.registry.thread_mut(thread) {
            if !state.is_dead() {
                state.state = ThreadState::Ready;
            }
        }
    }

    // ------------------------------------------------------------------
    // Object factories
    // ------------------------------------------------------------------

    fn owner_for(
        &self,
        caller: ObjectId,
        owner: OwnerType,
    ) -> Option<ObjectId> {
        match owner {
            OwnerType::Thread => Some(caller),
            OwnerType::Process => {
                self.registry.thread(caller).map(|t| t.process)
            }
        }
    }

    /// Creates an object and installs its first handle in `caller`'s scope.
    pub fn create_with_handle(
        &mut self,
        caller: ObjectId,
        name: String,
        access: Access,
        owner: OwnerType,
        body: ObjectBody,
    ) -> Result<Handle, UserError> {
        let owner_id = self.owner_for(caller, owner);
        let id = self.registry.insert(name, owner_id, access, body);
        self.install_handle(caller, id, owner, true)
    }

    /// Creates a chunk per the guest's creation block: reserve the range,
    /// commit the initial window, install a handle.
    pub fn create_chunk(
        &mut self,
        caller: ObjectId,
        owner: OwnerType,
        name: String,
        info: &ChunkCreateInfo,
    ) -> Result<Handle, UserError> {
        let att = ChunkCreateAtt::from_bits_retain(info.att);
        let kind = if att.contains(ChunkCreateAtt::DISCONNECTED) {
            ChunkKind::Disconnected
        } else if att.contains(ChunkCreateAtt::DOUBLE_ENDED) {
            ChunkKind::DoubleEnded
        } else {
            ChunkKind::Normal
        };
        let access = if att.contains(ChunkCreateAtt::GLOBAL) {
            Access::Global
        } else {
            Access::Local
        };
        let attrib = if access == Access::Global && name.is_empty() {
            ChunkAttrib::Anonymous
        } else {
            ChunkAttrib::None
        };
        let max_size = info.max_size.max(0) as u32;
        let base = self
            .mem
            .reserve(max_size)
            .ok_or(UserError::code(ErrorCode::NoMemory))?;
        let chunk = Chunk::new(
            &mut *self.mem,
            base,
            kind,
            attrib,
            info.initial_bottom.max(0) as u32,
            info.initial_top.max(0) as u32,
            max_size,
        );
        self.create_with_handle(
            caller,
            name,
            access,
            owner,
            ObjectBody::Chunk(chunk),
        )
    }

    /// Runs a chunk operation that needs both the chunk state and the
    /// address-space collaborator.
    pub fn with_chunk<R>(
        &mut self,
        id: ObjectId,
        op: impl FnOnce(&mut Chunk, &mut dyn AddressSpace) -> R,
    ) -> Option<R> {
        let Kernel { registry, mem, .. } = self;
        let chunk = registry.chunk_mut(id)?;
        Some(op(chunk, &mut **mem))
    }

    /// Loader entry point: constructs a process, its DLL lock, and its main
    /// thread (left in `Create` state for `ProcessResume`).
    pub fn spawn_process(&mut self, init: ProcessInit) -> (ObjectId, ObjectId) {
        let mut process = Process::new(
            init.uids,
            init.command_line.encode_utf16().collect(),
        );
        process.security = init.security;
        process.priority = init.priority;
        process.entry_points = init.entry_points;
        let process_id = self.registry.insert(
            init.name.clone(),
            None,
            Access::Global,
            ObjectBody::Process(process),
        );
        let lock_id = self.registry.insert(
            format!("DllLock${}", init.name),
            Some(process_id),
            Access::Local,
            ObjectBody::Mutex(Mutex::new()),
        );
        if let Some(p) = self.registry.process_mut(process_id) {
            p.dll_lock = Some(lock_id);
        }
        let main = self.spawn_thread(process_id, "Main".into(), init.priority);
        (process_id, main)
    }

    /// Creates a thread in `process`, in `Create` state.
    pub fn spawn_thread(
        &mut self,
        process: ObjectId,
        name: String,
        priority: Priority,
    ) -> ObjectId {
        let id = self.registry.insert(
            name,
            Some(process),
            Access::Local,
            ObjectBody::Thread(Thread::new(process, priority)),
        );
        if let Some(p) = self.registry.process_mut(process) {
            p.thread_count += 1;
        }
        id
    }

    /// Dynamic-linker entry point: registers a loaded library object.
    pub fn register_library(
        &mut self,
        name: String,
        library: Library,
    ) -> ObjectId {
        self.registry.insert(
            name,
            None,
            Access::Global,
            ObjectBody::Library(library),
        )
    }

    /// Makes a `Create`-state thread schedulable for the first time.
    pub fn schedule_thread(&mut self, thread: ObjectId) {
        if let Some(t) = self.registry.thread_mut(thread) {
            if t.state == ThreadState::Create {
                t.state = ThreadState::Ready;
            }
        }
    }

    // ------------------------------------------------------------------
    // Request completion
    // ------------------------------------------------------------------

    pub fn complete_waiter(
        &mut self,
        waiter: Waiter,
        code: ErrorCode,
    ) -> NextThread {
        self.complete_waiter_raw(waiter, code.as_i32())
    }

    pub fn complete_waiter_raw(
        &mut self,
        waiter: Waiter,
        code: i32,
    ) -> NextThread {
        let Kernel { registry, mem, .. } = self;
        reqsts::complete(registry, &mut **mem, waiter, code)
    }

    /// Completes every change-notifier logon; the "system change" broadcast.
    pub fn signal_system_change(&mut self) -> NextThread {
        let notifiers: Vec<ObjectId> = self
            .registry
            .iter()
            .filter(|obj| obj.kind() == ObjectKind::ChangeNotifier)
            .map(|obj| obj.id)
            .collect();
        let mut hint = NextThread::Same;
        for id in notifiers {
            let waiter = self
                .registry
                .notifier_mut(id)
                .and_then(ChangeNotifier::take_waiter);
            if let Some(waiter) = waiter {
                hint = hint.combine(self.complete_waiter(waiter, ErrorCode::None));
            }
        }
        hint
    }

    // ------------------------------------------------------------------
    // Timers
    // ------------------------------------------------------------------

    /// Arms `timer` to complete `waiter` after `micros`. A previous arming
    /// is cancelled first.
    pub fn timer_after(
        &mut self,
        timer_id: ObjectId,
        waiter: Waiter,
        micros: i64,
    ) -> Result<(), UserError> {
        let at = self.now.saturating_add_micros(micros.max(0));
        let stale = {
            let timer = self
                .registry
                .timer_mut(timer_id)
                .ok_or(UserError::code(ErrorCode::BadHandle))?;
            timer.pending.take()
        };
        if let Some((_, old)) = stale {
            log::warn!("timer {:?} re-armed while pending", timer_id);
            self.timers.cancel(ExpiryTarget::Timer(timer_id));
            let _ = self.complete_waiter(old, ErrorCode::Cancelled);
        }
        let seq = self.timers.schedule(at, ExpiryTarget::Timer(timer_id));
        if let Some(timer) = self.registry.timer_mut(timer_id) {
            timer.pending = Some((seq, waiter));
        }
        Ok(())
    }

    /// Cancels a timer's outstanding request, completing it with
    /// `Cancelled`. Cancelling an idle timer is a no-op.
    pub fn timer_cancel(&mut self, timer_id: ObjectId) -> NextThread {
        self.timers.cancel(ExpiryTarget::Timer(timer_id));
        let waiter = self
            .registry
            .timer_mut(timer_id)
            .and_then(|t| t.pending.take());
        match waiter {
            Some((_, waiter)) => {
                self.complete_waiter(waiter, ErrorCode::Cancelled)
            }
            None => NextThread::Same,
        }
    }

    /// `After`: a per-thread relative wakeup, no timer object involved.
    pub fn thread_after(
        &mut self,
        thread: ObjectId,
        status: GuestAddr,
        micros: i64,
    ) -> Result<(), UserError> {
        let at = self.now.saturating_add_micros(micros.max(0));
        self.thread_mut(thread)?.after_status = Some(status);
        self.timers.schedule(at, ExpiryTarget::Thread(thread));
        Ok(())
    }

    /// Advances emulator time, draining external events and firing due
    /// timers. Called by the main loop between CPU slices.
    pub fn tick(&mut self, now: Timestamp) -> NextThread {
        self.now = now;
        let mut hint = NextThread::Same;
        while let Ok(event) = self.events_rx.try_recv() {
            match event {
                KernelEvent::SystemChange => {
                    hint = hint.combine(self.signal_system_change());
                }
            }
        }
        while let Some((seq, target)) = self.timers.pop_due(now) {
            hint = hint.combine(self.fire_expiry(seq, target));
        }
        hint
    }

    fn fire_expiry(&mut self, seq: u64, target: ExpiryTarget) -> NextThread {
        match target {
            ExpiryTarget::Timer(timer_id) => {
                let waiter = match self.registry.timer_mut(timer_id) {
                    Some(timer) => match timer.pending {
                        Some((armed_seq, waiter)) if armed_seq == seq => {
                            timer.pending = None;
                            Some(waiter)
                        }
                        _ => None,
                    },
                    None => None,
                };
                match waiter {
                    Some(waiter) => self.complete_waiter(waiter, ErrorCode::None),
                    None => NextThread::Same,
                }
            }
            ExpiryTarget::Thread(thread) => {
                let status = self
                    .registry
                    .thread_mut(thread)
                    .and_then(|t| t.after_status.take());
                match status {
                    Some(status) => self.complete_waiter(
                        Waiter { thread, status },
                        ErrorCode::None,
                    ),
                    None => NextThread::Same,
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // IPC
    // ------------------------------------------------------------------

    pub fn server_id_by_name(&self, name: &str) -> Option<ObjectId> {
        self.servers.get(name).copied()
    }

    /// Registers a named server and returns a process-scoped handle.
    pub fn server_create(
        &mut self,
        caller: ObjectId,
        name: String,
    ) -> Result<Handle, UserError> {
        if self.servers.contains_key(&name) {
            return Err(ErrorCode::InUse.into());
        }
        let handle = self.create_with_handle(
            caller,
            name.clone(),
            Access::Global,
            OwnerType::Process,
            ObjectBody::Server(Server::new()),
        )?;
        let id = self
            .resolve_handle(caller, handle)
            .ok_or(UserError::Internal("fresh server handle unresolvable"))?;
        self.servers.insert(name, id);
        Ok(handle)
    }

    /// Connects a session to a named server. The handle starts out
    /// thread-scoped; `SessionShare` moves it to the process.
    pub fn session_create(
        &mut self,
        caller: ObjectId,
        server_name: &str,
        slots: i32,
    ) -> Result<Handle, UserError> {
        let server = self
            .server_id_by_name(server_name)
            .ok_or(UserError::code(ErrorCode::NotFound))?;
        self.create_with_handle(
            caller,
            String::new(),
            Access::Local,
            OwnerType::Thread,
            ObjectBody::Session(Session::new(server, slots)),
        )
    }

    /// Builds and enqueues a message on `session`'s server, delivering
    /// immediately if the server has a receive armed. With `blocking`, the
    /// caller is parked until the message completes.
    pub fn session_send(
        &mut self,
        caller: ObjectId,
        session_id: ObjectId,
        function: i32,
        args: IpcArgs,
        status: Option<GuestAddr>,
        blocking: bool,
    ) -> Result<NextThread, UserError> {
        let server = {
            let session = self
                .registry
                .session_mut(session_id)
                .ok_or(UserError::code(ErrorCode::BadHandle))?;
            session.in_flight += 1;
            if session.slots > 0 && session.in_flight > session.slots {
                log::warn!(
                    "session {:?} exceeds its {} message slots",
                    session_id,
                    session.slots
                );
            }
            session.server
        };
        let msg_id = self.registry.insert(
            String::new(),
            Some(caller),
            Access::Local,
            ObjectBody::Message(Message {
                function,
                args,
                session: session_id,
                thread: caller,
                status,
                blocking,
            }),
        );
        self.registry
            .server_mut(server)
            .ok_or(UserError::Internal("session names dead server"))?
            .queue
            .push_back(msg_id);
        let mut hint = self.try_deliver(server);
        if blocking {
            self.thread_mut(caller)?.state = ThreadState::WaitingMessage(msg_id);
            hint = hint.combine(NextThread::Other);
            self.prepare_reschedule();
        }
        Ok(hint)
    }

    /// Arms the server's receive slot, draining a queued message into it
    /// right away if one is pending.
    pub fn server_receive(
        &mut self,
        server_id: ObjectId,
        receive: PendingReceive,
    ) -> Result<NextThread, UserError> {
        let server = self
            .registry
            .server_mut(server_id)
            .ok_or(UserError::code(ErrorCode::BadHandle))?;
        if server.receive.is_some() {
            return Err(ErrorCode::InUse.into());
        }
        server.receive = Some(receive);
        Ok(self.try_deliver(server_id))
    }

    /// Cancels an armed receive, completing its status with `Cancelled`.
    pub fn server_cancel(&mut self, server_id: ObjectId) -> NextThread {
        let receive = self
            .registry
            .server_mut(server_id)
            .and_then(|s| s.receive.take());
        match receive {
            Some(recv) => self.complete_waiter(recv.waiter, ErrorCode::Cancelled),
            None => NextThread::Same,
        }
    }

    /// Pairs the oldest queued message with the armed receive, if both
    /// exist: writes the wire form into the server's slot and completes the
    /// server's status.
    fn try_deliver(&mut self, server_id: ObjectId) -> NextThread {
        let (msg_id, recv) = {
            let Some(server) = self.registry.server_mut(server_id) else {
                return NextThread::Same;
            };
            if server.receive.is_none() || server.queue.is_empty() {
                return NextThread::Same;
            }
            // Both sides checked non-empty above.
            let Some(msg_id) = server.queue.pop_front() else {
                return NextThread::Same;
            };
            let Some(recv) = server.receive.take() else {
                return NextThread::Same;
            };
            (msg_id, recv)
        };
        let Some(msg) = self.registry.message(msg_id) else {
            log::error!("queued message {:?} missing from registry", msg_id);
            return NextThread::Same;
        };
        let cookie = self
            .registry
            .session(msg.session)
            .map(|s| s.cookie)
            .unwrap_or(0);
        let wire = Message2 {
            handle: msg_id.as_i32(),
            function: msg.function,
            args: msg.args.args,
            spare1: 0,
            session_cookie: cookie,
            flags: msg.args.flags as i32,
            spare3: 0,
        };
        if let Err(fault) =
            crate::umem::write_val(&mut *self.mem, recv.slot, &wire)
        {
            log::warn!("receive slot unwritable at {:#010x}", fault.addr);
        }
        self.complete_waiter(recv.waiter, ErrorCode::None)
    }

    /// Looks up a message by the handle delivered inside `Message2`.
    pub fn message_by_handle(&self, handle: i32) -> Option<ObjectId> {
        let id = ObjectId(handle as u32 as u64);
        self.registry.message(id).map(|_| id)
    }

    /// Completes a message: the client's status gets `value`, the client
    /// wakes, and the message returns to the pool.
    pub fn message_complete(
        &mut self,
        msg_id: ObjectId,
        value: i32,
    ) -> Result<NextThread, UserError> {
        if self.registry.message(msg_id).is_none() {
            return Err(ErrorCode::BadHandle.into());
        }
        let Some(obj) = self.registry.remove(msg_id) else {
            return Err(ErrorCode::BadHandle.into());
        };
        let ObjectBody::Message(msg) = obj.body else {
            return Err(ErrorCode::BadHandle.into());
        };
        Ok(self.finish_message(msg_id, msg, value))
    }

    fn finish_message(
        &mut self,
        msg_id: ObjectId,
        msg: Message,
        value: i32,
    ) -> NextThread {
        if let Some(session) = self.registry.session_mut(msg.session) {
            session.in_flight -= 1;
        }
        if let Some(status) = msg.status {
            // Status write first, wake second: the client must observe the
            // completed cell as soon as it runs.
            let waiter = Waiter {
                thread: msg.thread,
                status,
            };
            let Kernel { registry, mem, .. } = self;
            let mut hint = reqsts::complete(registry, &mut **mem, waiter, value);
            if msg.blocking {
                hint = hint.combine(self.wake_from_message(msg.thread, msg_id));
            }
            hint
        } else if msg.blocking {
            self.wake_from_message(msg.thread, msg_id)
        } else {
            NextThread::Same
        }
    }

    fn wake_from_message(
        &mut self,
        thread: ObjectId,
        msg_id: ObjectId,
    ) -> NextThread {
        match self.registry.thread_mut(thread) {
            Some(t) if t.state == ThreadState::WaitingMessage(msg_id) => {
                t.state = ThreadState::Ready;
                NextThread::Specific(thread)
            }
            _ => NextThread::Same,
        }
    }

    // ------------------------------------------------------------------
    // Properties
    // ------------------------------------------------------------------

    pub fn property_by_key(&self, category: i32, key: i32) -> Option<ObjectId> {
        self.properties.get(&(category, key)).copied()
    }

    /// Finds or creates the property cell for `(category, key)`. The index
    /// keeps its own reference, so defined cells outlive their handles.
    pub fn property_ensure(&mut self, category: i32, key: i32) -> ObjectId {
        if let Some(id) = self.property_by_key(category, key) {
            return id;
        }
        let id = self.registry.insert(
            String::new(),
            None,
            Access::Global,
            ObjectBody::Property(Property::new(category, key)),
        );
        self.properties.insert((category, key), id);
        id
    }

    /// Completes all subscribers of a property after a successful write.
    pub fn property_publish(&mut self, prop_id: ObjectId) -> NextThread {
        let waiters = match self.registry.property_mut(prop_id) {
            Some(prop) => prop.take_subscribers(),
            None => Vec::new(),
        };
        let mut hint = NextThread::Same;
        for waiter in waiters {
            hint = hint.combine(self.complete_waiter(waiter, ErrorCode::None));
        }
        hint
    }

    // ------------------------------------------------------------------
    // Thread and process death
    // ------------------------------------------------------------------

    /// Kills a thread, completing its watchers and possibly taking the
    /// whole process down with it. Panic categories with default action are
    /// described in the log and reported to the panic hook.
    pub fn kill_thread(
        &mut self,
        victim: ObjectId,
        exit_type: ExitType,
        reason: i32,
        category: &str,
    ) -> NextThread {
        let name = self
            .registry
            .get(victim)
            .map(|o| o.name.clone())
            .unwrap_or_default();
        if panics::is_default_action(category) {
            match panics::describe(category, reason) {
                Some(desc) => log::info!(
                    "thread {name} exits ({exit_type:?}) {category} {reason} ({desc})"
                ),
                None => log::info!(
                    "thread {name} exits ({exit_type:?}) {category} {reason}"
                ),
            }
        }
        if exit_type == ExitType::Panic {
            if let Some(hook) = self.panic_hook.as_mut() {
                hook.on_panic(category, reason);
            }
        }

        let Some(thread) = self.registry.thread_mut(victim) else {
            return NextThread::Same;
        };
        if thread.is_dead() {
            return NextThread::Same;
        }
        thread.state = ThreadState::Dead;
        thread.exit_type = exit_type;
        thread.exit_reason = reason;
        let process = thread.process;
        let logons = std::mem::take(&mut thread.logons);
        let owned: Vec<ObjectId> =
            thread.handles.iter_live().map(|(_, id)| id).collect();

        let mut hint = NextThread::Same;
        for logon in logons {
            hint = hint.combine(self.complete_waiter_raw(logon.waiter, reason));
        }
        self.forget_in_wait_queues(victim);
        self.timers.cancel(ExpiryTarget::Thread(victim));
        for id in owned {
            self.release(id);
        }

        let last = match self.registry.process_mut(process) {
            Some(p) => {
                p.thread_count = p.thread_count.saturating_sub(1);
                p.thread_count == 0
            }
            None => false,
        };
        if last {
            hint = hint.combine(self.end_process(process, exit_type, reason));
        }

        self.prepare_reschedule();
        hint.combine(NextThread::Other)
    }

    fn end_process(
        &mut self,
        process: ObjectId,
        exit_type: ExitType,
        reason: i32,
    ) -> NextThread {
        let Some(p) = self.registry.process_mut(process) else {
            return NextThread::Same;
        };
        p.exit_type = exit_type;
        p.exit_reason = reason;
        let logons = std::mem::take(&mut p.logons);
        let owned: Vec<ObjectId> =
            p.handles.iter_live().map(|(_, id)| id).collect();
        let mut hint = NextThread::Same;
        for logon in logons {
            hint = hint.combine(self.complete_waiter_raw(logon.waiter, reason));
        }
        for id in owned {
            self.release(id);
        }
        hint
    }

    /// Completes rendezvous watchers of a process with `code`.
    pub fn process_rendezvous(
        &mut self,
        process: ObjectId,
        code: i32,
    ) -> NextThread {
        let pending: Vec<Logon> = match self.registry.process_mut(process) {
            Some(p) => {
                let (rendezvous, keep): (Vec<_>, Vec<_>) =
                    p.logons.drain(..).partition(|l| l.rendezvous);
                p.logons = keep;
                rendezvous
            }
            None => Vec::new(),
        };
        let mut hint = NextThread::Same;
        for logon in pending {
            hint = hint.combine(self.complete_waiter_raw(logon.waiter, code));
        }
        hint
    }

    /// Pulls a dead or dying thread out of every FIFO it may be queued on.
    fn forget_in_wait_queues(&mut self, victim: ObjectId) {
        let ids: Vec<ObjectId> = self
            .registry
            .iter()
            .filter(|obj| {
                matches!(
                    obj.kind(),
                    ObjectKind::Semaphore | ObjectKind::Mutex
                )
            })
            .map(|obj| obj.id)
            .collect();
        for id in ids {
            if let Some(sema) = self.registry.semaphore_mut(id) {
                sema.forget(victim);
            }
            if let Some(mutex) = self.registry.mutex_mut(id) {
                mutex.forget(victim);
            }
        }
    }

    // ------------------------------------------------------------------
    // The guest entry loop
    // ------------------------------------------------------------------

    /// Runs one scheduling slice: picks a thread, lets the CPU collaborator
    /// execute it, and services at most one supervisor call. Returns `false`
    /// when no thread is runnable.
    pub fn step(&mut self, cpu: &mut dyn Cpu, quantum: u32) -> bool {
        let next = match self.preferred.take() {
            Some(id)
                if self
                    .registry
                    .thread(id)
                    .map(Thread::is_ready)
                    .unwrap_or(false) =>
            {
                Some(id)
            }
            _ => sched::select(self.current, &self.registry),
        };
        let Some(next) = next else {
            return false;
        };
        self.current = Some(next);
        self.reschedule = false;

        let mut save = match self.registry.thread(next) {
            Some(t) => t.save,
            None => return false,
        };
        let exit = cpu.run(&mut save, quantum);
        if let Some(t) = self.registry.thread_mut(next) {
            t.save = save;
        }

        match exit {
            CpuExit::Svc(nr) => {
                let hint = crate::syscalls::dispatch(self, nr);
                match hint {
                    NextThread::Same => {}
                    NextThread::Other => self.prepare_reschedule(),
                    NextThread::Specific(id) => {
                        self.preferred = Some(id);
                        self.prepare_reschedule();
                    }
                }
            }
            CpuExit::QuantumExpired | CpuExit::Idle => {
                self.prepare_reschedule();
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ipc::IpcArgs;
    use crate::time::ManualClock;
    use crate::umem::{read_val, FlatMem};
    use abi::sysnum;
    use std::collections::VecDeque;

    const STS: GuestAddr = 0x0090_0000;

    fn boot() -> (Kernel, ObjectId, ObjectId) {
        let mem = FlatMem::new(0x0010_0000, 0x0100_0000);
        let mut k = Kernel::new(
            Box::new(mem),
            Box::new(ManualClock::default()),
            KernelConfig::default(),
        );
        let (process, a) = k.spawn_process(ProcessInit {
            name: "loop".into(),
            ..Default::default()
        });
        if let Some(t) = k.registry.thread_mut(a) {
            t.priority = Priority(1);
        }
        let b = k.spawn_thread(process, "idle".into(), Priority(0));
        k.schedule_thread(a);
        k.schedule_thread(b);
        (k, a, b)
    }

    /// Feeds a fixed sequence of (argument registers, exit reason) pairs to
    /// whatever thread the scheduler picks.
    struct ScriptedCpu {
        steps: VecDeque<([u32; 4], CpuExit)>,
    }

    impl Cpu for ScriptedCpu {
        fn run(&mut self, save: &mut SavedState, _quantum: u32) -> CpuExit {
            match self.steps.pop_front() {
                Some((args, exit)) => {
                    save.r[..4].copy_from_slice(&args);
                    exit
                }
                None => CpuExit::Idle,
            }
        }
    }

    #[test]
    fn step_runs_the_priority_thread_and_services_svcs() {
        let (mut k, a, b) = boot();
        let mut cpu = ScriptedCpu {
            steps: VecDeque::from([
                // A arms a wakeup, then parks.
                ([1000, STS, 0, 0], CpuExit::Svc(sysnum::AFTER)),
                ([0; 4], CpuExit::Svc(sysnum::WAIT_FOR_ANY_REQUEST)),
                // Next slice falls to the low-priority thread.
                ([0; 4], CpuExit::QuantumExpired),
            ]),
        };
        assert!(k.step(&mut cpu, 100));
        assert_eq!(k.current_thread(), Some(a));
        assert!(k.step(&mut cpu, 100));
        assert_eq!(k.current_thread(), Some(a));
        assert!(k.step(&mut cpu, 100));
        assert_eq!(k.current_thread(), Some(b));

        // The wakeup fires; A is preferred again on the next slice.
        let _ = k.tick(Timestamp(1000));
        let sts: i32 = read_val(k.mem(), STS).unwrap();
        assert_eq!(sts, 0);
        let mut cpu = ScriptedCpu {
            steps: VecDeque::from([([0; 4], CpuExit::QuantumExpired)]),
        };
        assert!(k.step(&mut cpu, 100));
        assert_eq!(k.current_thread(), Some(a));
    }

    #[test]
    fn idle_when_nothing_is_runnable() {
        let (mut k, a, b) = boot();
        for t in [a, b] {
            k.registry.thread_mut(t).unwrap().state = ThreadState::Suspended;
        }
        let mut cpu = ScriptedCpu {
            steps: VecDeque::new(),
        };
        assert!(!k.step(&mut cpu, 100));
    }

    #[test]
    fn closing_a_server_cancels_what_it_still_owes() {
        let (mut k, a, _) = boot();
        k.set_current_thread(Some(a));
        let h = k.server_create(a, "Gone".into()).unwrap();
        let c = k.session_create(a, "Gone", 1).unwrap();
        let session = k.resolve_handle(a, c).unwrap();
        let _ = k
            .session_send(a, session, 1, IpcArgs::default(), Some(STS), false)
            .unwrap();

        k.close(a, h).unwrap();
        assert!(k.server_id_by_name("Gone").is_none());
        let sts: i32 = read_val(k.mem(), STS).unwrap();
        assert_eq!(sts, ErrorCode::Cancelled.as_i32());
    }
}
