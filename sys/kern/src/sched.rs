// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Cooperative scheduling over guest threads.
//!
//! One host thread runs everything; "concurrency" is guest threads being
//! multiplexed at suspension points. Handlers never block the host: they
//! record a wait state on the calling thread and return a [`NextThread`]
//! hint, and the loop driving the CPU core acts on it.

use crate::object::{ObjectId, Registry};

/// Return value for operations that can have scheduling implications. This
/// is marked `must_use` because forgetting to actually update the scheduler
/// after performing an operation that requires it would be Bad.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[must_use]
pub enum NextThread {
    /// It's fine to keep running whatever thread we were just running.
    Same,
    /// We need to switch, but this routine has not concluded which thread
    /// should now run. The scheduler needs to figure it out.
    Other,
    /// We need to switch, and we already know which thread should run next.
    Specific(ObjectId),
}

impl NextThread {
    pub fn combine(self, other: Self) -> Self {
        use NextThread::*; // shorthand for patterns

        match (self, other) {
            // If both agree, our job is easy.
            (x, y) if x == y => x,
            // Specific recommendations that *don't* agree get downgraded.
            (Specific(_), Specific(_)) => Other,
            // If only *one* is specific, it wins.
            (Specific(x), _) | (_, Specific(x)) => Specific(x),
            // Otherwise, if either suggestion says switch, switch.
            (Other, _) | (_, Other) => Other,
            // All we have left is...
            (Same, Same) => Same,
        }
    }
}

/// Selects the next thread to run after `previous`, or `None` if nothing is
/// ready (the emulator then idles until a timer or external event).
pub fn select(previous: Option<ObjectId>, registry: &Registry) -> Option<ObjectId> {
    priority_scan(previous, registry, |thread| thread.is_ready())
}

/// Scans threads for the most important one satisfying `pred`, round-robin
/// from just past `previous` so equal-priority threads take fair turns.
pub fn priority_scan(
    previous: Option<ObjectId>,
    registry: &Registry,
    pred: impl Fn(&crate::thread::Thread) -> bool,
) -> Option<ObjectId> {
    let pivot = previous.map(|id| id.0).unwrap_or(0);
    let mut choice: Option<(ObjectId, abi::Priority)> = None;

    // Iterate ids above the pivot first, then wrap; id order is creation
    // order, which keeps the rotation deterministic.
    let after = registry.iter().filter(|obj| obj.id.0 > pivot);
    let before = registry.iter().filter(|obj| obj.id.0 <= pivot);
    for obj in after.chain(before) {
        let Some(thread) = registry.thread(obj.id) else {
            continue;
        };
        if !pred(thread) {
            continue;
        }
        if let Some((_, best)) = choice {
            if !thread.priority.is_more_important_than(best) {
                continue;
            }
        }
        choice = Some((obj.id, thread.priority));
    }

    choice.map(|(id, _)| id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::{Access, ObjectBody, Registry};
    use crate::thread::{Thread, ThreadState};

    fn add_thread(reg: &mut Registry, prio: i32) -> ObjectId {
        let mut thread = Thread::new(ObjectId(0), abi::Priority(prio));
        thread.state = ThreadState::Ready;
        reg.insert(
            String::new(),
            None,
            Access::Local,
            ObjectBody::Thread(thread),
        )
    }

    #[test]
    fn highest_priority_wins() {
        let mut reg = Registry::new();
        let _low = add_thread(&mut reg, 0);
        let high = add_thread(&mut reg, 10);
        assert_eq!(select(None, &reg), Some(high));
    }

    #[test]
    fn equal_priority_rotates() {
        let mut reg = Registry::new();
        let a = add_thread(&mut reg, 0);
        let b = add_thread(&mut reg, 0);
        assert_eq!(select(Some(a), &reg), Some(b));
        assert_eq!(select(Some(b), &reg), Some(a));
    }

    #[test]
    fn waiting_threads_are_skipped() {
        let mut reg = Registry::new();
        let a = add_thread(&mut reg, 0);
        let b = add_thread(&mut reg, 5);
        reg.thread_mut(b).unwrap().state = ThreadState::WaitingAnyRequest;
        assert_eq!(select(None, &reg), Some(a));
    }

    #[test]
    fn combine_prefers_the_specific() {
        let id = ObjectId(3);
        assert_eq!(
            NextThread::Other.combine(NextThread::Specific(id)),
            NextThread::Specific(id)
        );
        assert_eq!(
            NextThread::Specific(id).combine(NextThread::Specific(ObjectId(4))),
            NextThread::Other
        );
        assert_eq!(NextThread::Same.combine(NextThread::Same), NextThread::Same);
    }
}
