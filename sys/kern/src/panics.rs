// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Well-known guest panic categories.
//!
//! When a thread is killed with one of the standard categories, the log line
//! is enriched with a description of the reason code where we know it, and
//! the panic hook collaborator is informed. Unknown categories still kill
//! the thread; they just stay opaque in the logs.

/// Categories whose panics follow the platform's default action.
pub fn is_default_action(category: &str) -> bool {
    matches!(category, "KERN-EXEC" | "E32USER-CBase" | "USER")
}

/// Human description of a well-known (category, reason) pair.
pub fn describe(category: &str, reason: i32) -> Option<&'static str> {
    Some(match (category, reason) {
        ("KERN-EXEC", 0) => "invalid request to the kernel executive",
        ("KERN-EXEC", 3) => "unhandled exception (often a bad pointer)",
        ("KERN-EXEC", 15) => "handle used after close",
        ("USER", 11) => "descriptor length exceeds its maximum",
        ("USER", 21) => "negative descriptor length",
        ("E32USER-CBase", 46) => "stray signal",
        ("E32USER-CBase", 47) => "active object already active",
        _ => return None,
    })
}
