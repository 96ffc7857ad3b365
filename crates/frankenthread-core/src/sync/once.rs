//! Run-exactly-once gate for lazy initialization.
//!
//! The gate word moves `NOT_RUN -> RUNNING -> DONE`. The thread that wins the
//! `NOT_RUN -> RUNNING` CAS runs the initializer; everyone else parks on the
//! word until it leaves `RUNNING`. If the initializer panics the word drops
//! back to `NOT_RUN` and the next caller tries again.

use core::cell::UnsafeCell;
use core::fmt;
use core::mem::MaybeUninit;
use core::sync::atomic::{AtomicU32, Ordering};

use crate::sys;

const NOT_RUN: u32 = 0;
const RUNNING: u32 = 1;
const DONE: u32 = 2;

/// Observable gate state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OnceState {
    NotRun,
    Running,
    Done,
}

pub struct Once {
    state: AtomicU32,
}

/// Puts the gate back to `NOT_RUN` if the initializer unwinds.
struct ResetOnUnwind<'a> {
    state: &'a AtomicU32,
}

impl Drop for ResetOnUnwind<'_> {
    fn drop(&mut self) {
        self.state.store(NOT_RUN, Ordering::Release);
        let _ = sys::wake_all(self.state);
    }
}

impl Once {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            state: AtomicU32::new(NOT_RUN),
        }
    }

    /// Run `f` if no caller has completed it yet.
    ///
    /// Returns only once the initializer has fully completed, whichever
    /// thread ran it. Concurrent first callers block meanwhile.
    pub fn run<F: FnOnce()>(&self, f: F) {
        if self.state.load(Ordering::Acquire) == DONE {
            return;
        }
        self.run_slow(f);
    }

    #[cold]
    fn run_slow<F: FnOnce()>(&self, f: F) {
        let mut f = Some(f);
        loop {
            match self.state.compare_exchange(
                NOT_RUN,
                RUNNING,
                Ordering::Acquire,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    let reset = ResetOnUnwind { state: &self.state };
                    if let Some(init) = f.take() {
                        init();
                    }
                    core::mem::forget(reset);
                    self.state.store(DONE, Ordering::Release);
                    // Waiters re-check the word, so a failed wake only delays
                    // them until their next spurious return.
                    let _ = sys::wake_all(&self.state);
                    return;
                }
                Err(DONE) => return,
                Err(_) => {
                    let _ = sys::wait(&self.state, RUNNING, None);
                }
            }
        }
    }

    #[must_use]
    pub fn is_completed(&self) -> bool {
        self.state.load(Ordering::Acquire) == DONE
    }

    #[must_use]
    pub fn state(&self) -> OnceState {
        match self.state.load(Ordering::Acquire) {
            NOT_RUN => OnceState::NotRun,
            RUNNING => OnceState::Running,
            _ => OnceState::Done,
        }
    }
}

impl Default for Once {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Once {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Once").field("state", &self.state()).finish()
    }
}

/// A value initialized at most once, on first access.
pub struct OnceValue<T> {
    once: Once,
    value: UnsafeCell<MaybeUninit<T>>,
}

// SAFETY: the value is written exactly once, before `once` reaches DONE with
// release ordering, and only read after observing DONE with acquire ordering.
unsafe impl<T: Send + Sync> Sync for OnceValue<T> {}
// SAFETY: moving the cell moves the (possibly initialized) `T`.
unsafe impl<T: Send> Send for OnceValue<T> {}

impl<T> OnceValue<T> {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            once: Once::new(),
            value: UnsafeCell::new(MaybeUninit::uninit()),
        }
    }

    /// The value, initializing it with `init` if this is the first access.
    pub fn get_or_init<F: FnOnce() -> T>(&self, init: F) -> &T {
        self.once.run(|| {
            // SAFETY: only the single initializer run by `once` writes here,
            // and no reader exists until `once` is DONE.
            unsafe { (*self.value.get()).write(init()) };
        });
        // SAFETY: `run` returned, so the value was written.
        unsafe { (*self.value.get()).assume_init_ref() }
    }

    /// The value if it has been initialized.
    pub fn get(&self) -> Option<&T> {
        if self.once.is_completed() {
            // SAFETY: DONE implies the value was written.
            Some(unsafe { (*self.value.get()).assume_init_ref() })
        } else {
            None
        }
    }
}

impl<T> Default for OnceValue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Drop for OnceValue<T> {
    fn drop(&mut self) {
        if self.once.is_completed() {
            // SAFETY: initialized, and `&mut self` means nobody else can observe it.
            unsafe { self.value.get_mut().assume_init_drop() };
        }
    }
}

impl<T: fmt::Debug> fmt::Debug for OnceValue<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.get() {
            Some(value) => f.debug_tuple("OnceValue").field(value).finish(),
            None => f.write_str("OnceValue(<uninit>)"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn hundred_racing_callers_run_initializer_once() {
        let gate = Arc::new(Once::new());
        let runs = Arc::new(AtomicUsize::new(0));
        let handles: Vec<_> = (0..100)
            .map(|_| {
                let gate = Arc::clone(&gate);
                let runs = Arc::clone(&runs);
                std::thread::spawn(move || {
                    gate.run(|| {
                        std::thread::sleep(std::time::Duration::from_millis(5));
                        runs.fetch_add(1, Ordering::SeqCst);
                    });
                    // Every caller observes completion before proceeding.
                    assert_eq!(runs.load(Ordering::SeqCst), 1);
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert!(gate.is_completed());
    }

    #[test]
    fn later_calls_do_not_reinvoke() {
        let gate = Once::new();
        let mut calls = 0;
        gate.run(|| calls += 1);
        gate.run(|| calls += 1);
        assert_eq!(calls, 1);
        assert_eq!(gate.state(), OnceState::Done);
    }

    #[test]
    fn panicking_initializer_leaves_gate_retryable() {
        let gate = Once::new();
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            gate.run(|| panic!("init failed"));
        }));
        assert!(result.is_err());
        assert_eq!(gate.state(), OnceState::NotRun);
        let mut ran = false;
        gate.run(|| ran = true);
        assert!(ran);
        assert!(gate.is_completed());
    }

    #[test]
    fn once_value_initializes_lazily() {
        let cell: OnceValue<String> = OnceValue::new();
        assert!(cell.get().is_none());
        assert_eq!(cell.get_or_init(|| "first".to_string()), "first");
        assert_eq!(cell.get_or_init(|| "second".to_string()), "first");
        assert_eq!(cell.get().map(String::as_str), Some("first"));
    }
}
