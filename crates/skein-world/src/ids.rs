// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Prefixed, lexicographically sortable identifiers.
//!
//! Every persistent entity gets a `<prefix>_<ulid>` identifier from one
//! process-wide monotonic generator: two ids issued within the same
//! millisecond are still strictly increasing, which is what pagination
//! cursors and stream ordering rely on.

use std::sync::{Mutex, OnceLock, PoisonError};

use ulid::{Generator, Ulid};

static GENERATOR: OnceLock<Mutex<Generator>> = OnceLock::new();

fn next_ulid() -> Ulid {
    let mutex = GENERATOR.get_or_init(|| Mutex::new(Generator::new()));
    let mut generator = mutex.lock().unwrap_or_else(PoisonError::into_inner);
    // The monotonic increment can only overflow after 2^80 ids in a single
    // millisecond; fall back to a fresh random ULID if it ever does.
    generator.generate().unwrap_or_else(|_| Ulid::new())
}

/// New run identifier (`wrun_<ulid>`).
pub fn run_id() -> String {
    format!("wrun_{}", next_ulid())
}

/// New step identifier (`wstp_<ulid>`).
pub fn step_id() -> String {
    format!("wstp_{}", next_ulid())
}

/// New event identifier (`wevt_<ulid>`).
pub fn event_id() -> String {
    format!("wevt_{}", next_ulid())
}

/// New hook identifier (`whook_<ulid>`).
pub fn hook_id() -> String {
    format!("whook_{}", next_ulid())
}

/// New stream chunk identifier (`chnk_<ulid>`).
pub fn chunk_id() -> String {
    format!("chnk_{}", next_ulid())
}

/// New queue message identifier (`msg_<ulid>`).
pub fn message_id() -> String {
    format!("msg_{}", next_ulid())
}
