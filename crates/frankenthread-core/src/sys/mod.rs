//! Platform interface.
//!
//! Everything above this module blocks and wakes through one primitive: wait
//! on a 32-bit word while it still holds an expected value, and wake waiters
//! parked on that word. Exactly one backend is compiled per target:
//!
//! - Linux: raw `futex(2)`, timed waits through `FUTEX_WAIT_BITSET` with an
//!   absolute `CLOCK_MONOTONIC` deadline.
//! - every other target: `parking_lot_core` parking keyed on the word's
//!   address, with an `Instant` deadline.
//!
//! Both backends report spurious returns as [`WaitStatus::Woken`]; callers
//! always re-check their own predicate.

#[cfg(target_os = "linux")]
#[path = "futex.rs"]
mod imp;

#[cfg(not(target_os = "linux"))]
#[path = "park.rs"]
mod imp;

pub(crate) use imp::{Deadline, native_thread_id, wait, wake_all, wake_one, yield_now};

/// Outcome of a single [`wait`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum WaitStatus {
    /// Woken, value already changed, or returned spuriously.
    Woken,
    /// The deadline passed.
    TimedOut,
}

/// Deadline for a millisecond timeout; negative means "wait forever".
pub(crate) fn deadline_for(timeout_ms: i64) -> Option<Deadline> {
    u64::try_from(timeout_ms).ok().map(Deadline::after_ms)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::{Duration, Instant};

    #[test]
    fn wait_returns_immediately_when_value_differs() {
        let word = AtomicU32::new(5);
        assert_eq!(wait(&word, 4, None), WaitStatus::Woken);
    }

    #[test]
    fn timed_wait_on_unchanged_word_times_out() {
        let word = AtomicU32::new(0);
        let start = Instant::now();
        let deadline = deadline_for(30);
        let mut status = WaitStatus::Woken;
        while status == WaitStatus::Woken {
            status = wait(&word, 0, deadline.as_ref());
        }
        assert_eq!(status, WaitStatus::TimedOut);
        assert!(start.elapsed() >= Duration::from_millis(30));
    }

    #[test]
    fn negative_timeout_means_no_deadline() {
        assert!(deadline_for(-1).is_none());
        assert!(deadline_for(0).is_some());
    }

    #[test]
    fn wake_one_releases_parked_waiter() {
        let word = Arc::new(AtomicU32::new(0));
        let waiter = {
            let word = Arc::clone(&word);
            std::thread::spawn(move || {
                while word.load(Ordering::Acquire) == 0 {
                    let _ = wait(&word, 0, None);
                }
            })
        };
        std::thread::sleep(Duration::from_millis(10));
        word.store(1, Ordering::Release);
        wake_one(&word).expect("wake_one");
        waiter.join().unwrap();
    }

    #[test]
    fn wake_without_waiters_is_a_no_op() {
        let word = AtomicU32::new(0);
        assert_eq!(wake_all(&word).expect("wake_all"), 0);
    }

    #[test]
    fn native_thread_ids_are_distinct_per_thread() {
        let here = native_thread_id();
        let there = std::thread::spawn(native_thread_id).join().unwrap();
        assert_ne!(here, 0);
        assert_ne!(here, there);
        assert_eq!(here, native_thread_id());
        yield_now();
    }
}
