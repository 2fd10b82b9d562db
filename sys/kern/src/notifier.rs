// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Change notifiers: system-wide broadcast events.
//!
//! Each notifier object carries at most one logged-on request. A system
//! change completes every notifier's waiter at once; re-logon is required
//! for the next round.

use crate::reqsts::Waiter;

#[derive(Debug, Default)]
pub struct ChangeNotifier {
    waiter: Option<Waiter>,
}

impl ChangeNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a waiter. Fails if one is already logged on.
    pub fn logon(&mut self, waiter: Waiter) -> bool {
        if self.waiter.is_some() {
            return false;
        }
        self.waiter = Some(waiter);
        true
    }

    /// Detaches the waiter, if any, for completion by the caller.
    pub fn take_waiter(&mut self) -> Option<Waiter> {
        self.waiter.take()
    }

    pub fn has_waiter(&self) -> bool {
        self.waiter.is_some()
    }
}
