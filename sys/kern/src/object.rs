// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The kernel object registry.
//!
//! Every object a guest can name lives in one arena, keyed by a stable
//! 64-bit id. The registry holds the only strong references; handle tables
//! (and the server/property indexes) store ids, and the reference count on
//! each object equals the number of live entries pointing at it. When the
//! count reaches zero the object is removed and handed back to the caller
//! exactly once, so kind-specific teardown runs exactly once.
//!
//! Concrete per-kind state is a tagged variant, not a trait object: a lookup
//! that expects one kind rejects a mismatched tag instead of downcasting.

use std::collections::BTreeMap;

use abi::ObjectKind;

use crate::chunk::Chunk;
use crate::ipc::{Message, Server, Session};
use crate::library::Library;
use crate::notifier::ChangeNotifier;
use crate::process::Process;
use crate::property::Property;
use crate::sync::{Mutex, Semaphore};
use crate::thread::Thread;
use crate::time::Timer;

/// Stable identity of a kernel object. Ids are allocated from a monotonic
/// counter and never reused within one kernel lifetime.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[repr(transparent)]
pub struct ObjectId(pub u64);

impl ObjectId {
    /// The low word, as surfaced in find handles and message handles. Ids
    /// stay far below 2^31 in practice; the high word travels separately
    /// where the ABI carries it.
    pub fn as_i32(self) -> i32 {
        self.0 as i32
    }
}

/// Whether an object is visible to name lookups from other processes.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Access {
    Local,
    Global,
}

/// Kind-specific state, one variant per [`ObjectKind`].
#[derive(Debug)]
pub enum ObjectBody {
    Chunk(Chunk),
    Semaphore(Semaphore),
    Mutex(Mutex),
    Timer(Timer),
    Property(Property),
    ChangeNotifier(ChangeNotifier),
    Library(Library),
    Process(Process),
    Thread(Thread),
    Server(Server),
    Session(Session),
    Message(Message),
}

impl ObjectBody {
    pub fn kind(&self) -> ObjectKind {
        match self {
            Self::Chunk(_) => ObjectKind::Chunk,
            Self::Semaphore(_) => ObjectKind::Semaphore,
            Self::Mutex(_) => ObjectKind::Mutex,
            Self::Timer(_) => ObjectKind::Timer,
            Self::Property(_) => ObjectKind::Property,
            Self::ChangeNotifier(_) => ObjectKind::ChangeNotifier,
            Self::Library(_) => ObjectKind::Library,
            Self::Process(_) => ObjectKind::Process,
            Self::Thread(_) => ObjectKind::Thread,
            Self::Server(_) => ObjectKind::Server,
            Self::Session(_) => ObjectKind::Session,
            Self::Message(_) => ObjectKind::Message,
        }
    }
}

/// An object and its registry-level attributes.
#[derive(Debug)]
pub struct Object {
    pub id: ObjectId,
    /// Human-readable name; empty for anonymous objects, which are skipped
    /// by name lookup.
    pub name: String,
    /// Owning process or thread, when the object has one.
    pub owner: Option<ObjectId>,
    pub access: Access,
    /// Live references: handle-table entries plus kernel-held borrows (the
    /// server and property indexes each count as one).
    pub refs: u32,
    pub body: ObjectBody,
}

impl Object {
    pub fn kind(&self) -> ObjectKind {
        self.body.kind()
    }
}

/// The arena. See the module docs for the ownership rules.
#[derive(Debug, Default)]
pub struct Registry {
    objects: BTreeMap<u64, Object>,
    next_id: u64,
}

impl Registry {
    pub fn new() -> Self {
        Self {
            objects: BTreeMap::new(),
            // Id 0 is reserved so a zeroed find handle means "from the top".
            next_id: 1,
        }
    }

    /// Allocates an id and inserts a new object with one reference.
    pub fn insert(
        &mut self,
        name: String,
        owner: Option<ObjectId>,
        access: Access,
        body: ObjectBody,
    ) -> ObjectId {
        let id = ObjectId(self.next_id);
        self.next_id += 1;
        self.objects.insert(
            id.0,
            Object {
                id,
                name,
                owner,
                access,
                refs: 1,
                body,
            },
        );
        id
    }

    pub fn get(&self, id: ObjectId) -> Option<&Object> {
        self.objects.get(&id.0)
    }

    pub fn get_mut(&mut self, id: ObjectId) -> Option<&mut Object> {
        self.objects.get_mut(&id.0)
    }

    pub fn contains(&self, id: ObjectId) -> bool {
        self.objects.contains_key(&id.0)
    }

    /// Adds a reference on behalf of a new handle entry or kernel borrow.
    pub fn inc_ref(&mut self, id: ObjectId) {
        if let Some(obj) = self.objects.get_mut(&id.0) {
            obj.refs += 1;
        }
    }

    /// Drops a reference. When the last one goes, the object is removed and
    /// returned so the caller can run kind-specific teardown.
    pub fn dec_ref(&mut self, id: ObjectId) -> Option<Object> {
        let obj = self.objects.get_mut(&id.0)?;
        obj.refs = obj.refs.saturating_sub(1);
        if obj.refs == 0 {
            self.objects.remove(&id.0)
        } else {
            None
        }
    }

    /// Removes an object outright, regardless of count. Used for pooled
    /// messages, whose lifetime is completion-driven.
    pub fn remove(&mut self, id: ObjectId) -> Option<Object> {
        self.objects.remove(&id.0)
    }

    /// Linear scan for the next object of `kind` named `name`, at an id
    /// strictly greater than `after`. Returns the scan index (the id's low
    /// word) and the object id, in the shape `ObjectNext` reports.
    pub fn find_next(
        &self,
        name: &str,
        kind: ObjectKind,
        after: i32,
    ) -> Option<(i32, ObjectId)> {
        let floor = if after < 0 { 0 } else { after as u64 };
        self.objects
            .range(floor + 1..)
            .find(|(_, obj)| {
                obj.kind() == kind && !obj.name.is_empty() && obj.name == name
            })
            .map(|(_, obj)| (obj.id.as_i32(), obj.id))
    }

    pub fn iter(&self) -> impl Iterator<Item = &Object> {
        self.objects.values()
    }

    /// Number of live objects, used by invariant checks in tests.
    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }
}

/// Typed accessors: `lookup`-style access that only succeeds when the
/// variant tag matches the expectation.
macro_rules! body_accessors {
    ($($get:ident / $get_mut:ident => $variant:ident($ty:ty);)*) => {
        impl Registry {
            $(
                pub fn $get(&self, id: ObjectId) -> Option<&$ty> {
                    match &self.get(id)?.body {
                        ObjectBody::$variant(state) => Some(state),
                        _ => None,
                    }
                }

                pub fn $get_mut(&mut self, id: ObjectId) -> Option<&mut $ty> {
                    match &mut self.get_mut(id)?.body {
                        ObjectBody::$variant(state) => Some(state),
                        _ => None,
                    }
                }
            )*
        }
    };
}

body_accessors! {
    chunk / chunk_mut => Chunk(Chunk);
    semaphore / semaphore_mut => Semaphore(Semaphore);
    mutex / mutex_mut => Mutex(Mutex);
    timer / timer_mut => Timer(Timer);
    property / property_mut => Property(Property);
    notifier / notifier_mut => ChangeNotifier(ChangeNotifier);
    library / library_mut => Library(Library);
    process / process_mut => Process(Process);
    thread / thread_mut => Thread(Thread);
    server / server_mut => Server(Server);
    session / session_mut => Session(Session);
    message / message_mut => Message(Message);
}
