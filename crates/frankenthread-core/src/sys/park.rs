//! Portable backend: word waits emulated with `parking_lot_core`.

use core::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::cell::Cell;
use std::time::{Duration, Instant};

use parking_lot_core::{DEFAULT_PARK_TOKEN, DEFAULT_UNPARK_TOKEN, ParkResult};

use super::WaitStatus;
use crate::error::SyncError;

static NEXT_THREAD_ID: AtomicU64 = AtomicU64::new(1);

thread_local! {
    static SELF_ID: Cell<u64> = const { Cell::new(0) };
}

/// Monotonic deadline, taken from a single `Instant` snapshot.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Deadline {
    at: Instant,
}

impl Deadline {
    pub(crate) fn after_ms(ms: u64) -> Self {
        let now = Instant::now();
        Self {
            at: now
                .checked_add(Duration::from_millis(ms))
                .unwrap_or(now + Duration::from_secs(u32::MAX as u64)),
        }
    }
}

fn key(word: &AtomicU32) -> usize {
    word as *const AtomicU32 as usize
}

/// Block while `*word == expected`, until woken or `deadline` passes.
pub(crate) fn wait(word: &AtomicU32, expected: u32, deadline: Option<&Deadline>) -> WaitStatus {
    // SAFETY: the key is the address of a word that outlives the park call and
    // is used for nothing else than this wait/wake protocol.
    let result = unsafe {
        parking_lot_core::park(
            key(word),
            || word.load(Ordering::Acquire) == expected,
            || {},
            |_, _| {},
            DEFAULT_PARK_TOKEN,
            deadline.map(|d| d.at),
        )
    };
    match result {
        ParkResult::TimedOut => WaitStatus::TimedOut,
        ParkResult::Unparked(_) | ParkResult::Invalid => WaitStatus::Woken,
    }
}

pub(crate) fn wake_one(word: &AtomicU32) -> Result<usize, SyncError> {
    // SAFETY: see `wait`.
    let result = unsafe { parking_lot_core::unpark_one(key(word), |_| DEFAULT_UNPARK_TOKEN) };
    Ok(result.unparked_threads)
}

pub(crate) fn wake_all(word: &AtomicU32) -> Result<usize, SyncError> {
    // SAFETY: see `wait`.
    Ok(unsafe { parking_lot_core::unpark_all(key(word), DEFAULT_UNPARK_TOKEN) })
}

/// Process-unique id of the caller, assigned on first use.
pub(crate) fn native_thread_id() -> u64 {
    SELF_ID.with(|slot| {
        let existing = slot.get();
        if existing != 0 {
            return existing;
        }
        let id = NEXT_THREAD_ID.fetch_add(1, Ordering::Relaxed);
        slot.set(id);
        id
    })
}

pub(crate) fn yield_now() {
    std::thread::yield_now();
}
