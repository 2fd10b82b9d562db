// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Implementation of kernel time.
//!
//! Two clocks exist. Emulator time ([`Timestamp`], microseconds, advanced by
//! the main loop's tick) orders timer expiries deterministically. Wall-clock
//! time comes from the [`Clock`] collaborator, so hosts and tests can mock
//! what `TimeNow`/`UTCOffset`/`TimerAtUtc` observe; guest absolute times are
//! microseconds since year 0 CE, offset from Unix time by
//! [`abi::YEAR_ZERO_TO_UNIX_MICROS`].

use std::cmp::Reverse;
use std::collections::BinaryHeap;

use crate::object::ObjectId;
use crate::reqsts::Waiter;

/// In-kernel timestamp: microseconds of emulator time.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Default)]
#[repr(transparent)]
pub struct Timestamp(pub u64);

impl Timestamp {
    pub fn saturating_add_micros(self, micros: i64) -> Self {
        Timestamp(self.0.saturating_add_signed(micros))
    }
}

impl From<u64> for Timestamp {
    fn from(v: u64) -> Self {
        Timestamp(v)
    }
}

/// Wall-clock collaborator.
pub trait Clock {
    /// Microseconds since the Unix epoch, UTC.
    fn now_unix_micros(&self) -> u64;
    /// Current local UTC offset, in seconds.
    fn utc_offset_seconds(&self) -> i32;
}

/// The live host clock.
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_unix_micros(&self) -> u64 {
        chrono::Utc::now().timestamp_micros().max(0) as u64
    }

    fn utc_offset_seconds(&self) -> i32 {
        use chrono::Offset;
        chrono::Local::now().offset().fix().local_minus_utc()
    }
}

/// A pinned clock for tests and deterministic replay.
#[derive(Debug, Default)]
pub struct ManualClock {
    pub unix_micros: u64,
    pub offset_seconds: i32,
}

impl Clock for ManualClock {
    fn now_unix_micros(&self) -> u64 {
        self.unix_micros
    }

    fn utc_offset_seconds(&self) -> i32 {
        self.offset_seconds
    }
}

/// A guest timer object: at most one outstanding request.
#[derive(Debug, Default)]
pub struct Timer {
    /// The waiter to complete at expiry, plus the queue sequence number of
    /// the arming, so a stale heap entry can be told from a live one.
    pub pending: Option<(u64, Waiter)>,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd)]
struct Expiry {
    at: Timestamp,
    /// Tie-breaker: earlier arming fires first at equal deadlines.
    seq: u64,
    target: ExpiryTarget,
}

/// What an expiry completes: a timer object's request, or a thread's
/// `After` wakeup.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd)]
pub enum ExpiryTarget {
    Timer(ObjectId),
    Thread(ObjectId),
}

/// The scheduler's event queue: a min-heap of pending expiries keyed by
/// fire time, popped by the main emulator loop's tick.
#[derive(Debug, Default)]
pub struct TimerQueue {
    heap: BinaryHeap<Reverse<Expiry>>,
    next_seq: u64,
}

impl TimerQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Enqueues an expiry and returns its sequence number.
    pub fn schedule(&mut self, at: Timestamp, target: ExpiryTarget) -> u64 {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.heap.push(Reverse(Expiry { at, seq, target }));
        seq
    }

    /// Drops all entries for `target`.
    pub fn cancel(&mut self, target: ExpiryTarget) {
        self.heap.retain(|Reverse(e)| e.target != target);
    }

    /// Pops the next expiry due at or before `now`.
    pub fn pop_due(&mut self, now: Timestamp) -> Option<(u64, ExpiryTarget)> {
        let Reverse(head) = self.heap.peek()?;
        if head.at > now {
            return None;
        }
        let Reverse(e) = self.heap.pop()?;
        Some((e.seq, e.target))
    }

    /// The earliest pending deadline, for hosts that want to sleep.
    pub fn next_deadline(&self) -> Option<Timestamp> {
        self.heap.peek().map(|Reverse(e)| e.at)
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }
}
