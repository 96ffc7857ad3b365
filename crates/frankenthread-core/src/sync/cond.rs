//! Condition variable.
//!
//! Sequence-counter design: every `wake`/`wake_all` bumps `seq`; a sleeper
//! captures `seq` while still holding the mutex and parks until it moves.
//! Because the capture happens under the mutex, a wake issued after the
//! sleeper's predicate check can never be lost.
//!
//! The mutex is supplied per `sleep` call, not at construction. Timed sleeps
//! convert the millisecond timeout into one absolute monotonic deadline up
//! front, so retries after interruption never stretch the total wait.

use core::fmt;
use core::sync::atomic::{AtomicU32, Ordering};

use crate::error::SyncError;
use crate::sync::mutex::MutexGuard;
use crate::sys::{self, WaitStatus};
use crate::thread;

/// Result of [`Condvar::sleep`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitResult {
    /// Returned after a wake or broadcast (or spuriously); re-check the predicate.
    Signaled,
    /// The timeout elapsed without a wake.
    TimedOut,
}

impl WaitResult {
    #[must_use]
    pub const fn timed_out(self) -> bool {
        matches!(self, Self::TimedOut)
    }
}

pub struct Condvar {
    seq: AtomicU32,
    waiters: AtomicU32,
}

impl Condvar {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            seq: AtomicU32::new(0),
            waiters: AtomicU32::new(0),
        }
    }

    /// Atomically release the guard's mutex and block until woken or until
    /// `timeout_ms` elapses (negative: no timeout). The mutex is held again
    /// when this returns, on every path.
    ///
    /// A sleep is an interruption point for [`thread::ThreadRef::kill`]:
    /// a killed runtime thread unwinds from here after re-acquiring the mutex.
    pub fn sleep<T: ?Sized>(
        &self,
        guard: &mut MutexGuard<'_, T>,
        timeout_ms: i64,
    ) -> Result<WaitResult, SyncError> {
        let deadline = sys::deadline_for(timeout_ms);
        let raw = guard.mutex().raw();

        let expected = self.seq.load(Ordering::SeqCst);
        self.waiters.fetch_add(1, Ordering::SeqCst);
        let interrupt = thread::interrupt::enter(&self.seq);
        if interrupt.kill_requested() {
            self.waiters.fetch_sub(1, Ordering::SeqCst);
            drop(interrupt);
            thread::interrupt::forced_exit();
        }

        // SAFETY: the caller's guard proves this thread holds the mutex; it is
        // re-acquired below before the guard can be used again.
        unsafe { raw.unlock() };

        let status = loop {
            let status = sys::wait(&self.seq, expected, deadline.as_ref());
            if status == WaitStatus::TimedOut
                || self.seq.load(Ordering::Acquire) != expected
                || interrupt.kill_requested()
            {
                break status;
            }
        };
        let killed = interrupt.kill_requested();
        drop(interrupt);
        self.waiters.fetch_sub(1, Ordering::SeqCst);

        raw.lock();
        if killed {
            thread::interrupt::forced_exit();
        }
        Ok(match status {
            WaitStatus::Woken => WaitResult::Signaled,
            WaitStatus::TimedOut => WaitResult::TimedOut,
        })
    }

    /// Wake at most one sleeper. A no-op with no sleepers.
    pub fn wake(&self) -> Result<(), SyncError> {
        self.seq.fetch_add(1, Ordering::SeqCst);
        if self.waiters.load(Ordering::SeqCst) > 0 {
            sys::wake_one(&self.seq)?;
        }
        Ok(())
    }

    /// Wake every sleeper. A no-op with no sleepers.
    pub fn wake_all(&self) -> Result<(), SyncError> {
        self.seq.fetch_add(1, Ordering::SeqCst);
        if self.waiters.load(Ordering::SeqCst) > 0 {
            sys::wake_all(&self.seq)?;
        }
        Ok(())
    }

    /// Number of threads currently inside [`Condvar::sleep`].
    #[must_use]
    pub fn waiters(&self) -> u32 {
        self.waiters.load(Ordering::Acquire)
    }
}

impl Default for Condvar {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Condvar {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Condvar")
            .field("waiters", &self.waiters())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::Mutex;
    use std::sync::Arc;
    use std::time::{Duration, Instant};

    #[test]
    fn timed_sleep_on_unsignaled_condition_times_out() {
        let m = Mutex::new(());
        let cv = Condvar::new();
        let mut guard = m.lock();
        let start = Instant::now();
        let result = cv.sleep(&mut guard, 50).expect("sleep");
        let elapsed = start.elapsed();
        assert_eq!(result, WaitResult::TimedOut);
        assert!(elapsed >= Duration::from_millis(50), "woke early: {elapsed:?}");
        assert!(elapsed < Duration::from_millis(1_000), "overslept: {elapsed:?}");
        assert!(m.is_locked(), "mutex must be re-acquired after timeout");
    }

    #[test]
    fn zero_timeout_polls_and_reacquires() {
        let m = Mutex::new(7);
        let cv = Condvar::new();
        let mut guard = m.lock();
        assert!(cv.sleep(&mut guard, 0).expect("sleep").timed_out());
        assert_eq!(*guard, 7);
    }

    #[test]
    fn wake_with_no_waiters_is_a_no_op() {
        let cv = Condvar::new();
        cv.wake().expect("wake");
        cv.wake_all().expect("wake_all");
        assert_eq!(cv.waiters(), 0);
    }

    #[test]
    fn wake_releases_a_predicate_loop() {
        let shared = Arc::new((Mutex::new(false), Condvar::new()));
        let waiter = {
            let shared = Arc::clone(&shared);
            std::thread::spawn(move || {
                let (lock, cv) = &*shared;
                let mut ready = lock.lock();
                while !*ready {
                    cv.sleep(&mut ready, -1).expect("sleep");
                }
            })
        };
        std::thread::sleep(Duration::from_millis(20));
        {
            let (lock, cv) = &*shared;
            *lock.lock() = true;
            cv.wake().expect("wake");
        }
        waiter.join().unwrap();
    }

    #[test]
    fn wake_all_releases_every_sleeper() {
        let shared = Arc::new((Mutex::new(0u32), Condvar::new()));
        let sleepers: Vec<_> = (0..6)
            .map(|_| {
                let shared = Arc::clone(&shared);
                std::thread::spawn(move || {
                    let (lock, cv) = &*shared;
                    let mut generation = lock.lock();
                    while *generation == 0 {
                        cv.sleep(&mut generation, -1).expect("sleep");
                    }
                })
            })
            .collect();
        let (lock, cv) = &*shared;
        while cv.waiters() < 6 {
            std::thread::sleep(Duration::from_millis(1));
        }
        *lock.lock() = 1;
        cv.wake_all().expect("wake_all");
        for sleeper in sleepers {
            sleeper.join().unwrap();
        }
    }
}
