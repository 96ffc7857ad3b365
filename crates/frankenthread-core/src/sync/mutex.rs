//! Exclusive lock.
//!
//! [`RawMutex`] is a three-state futex word:
//!
//! - `0` unlocked
//! - `1` locked, no waiters
//! - `2` locked, possibly contended
//!
//! Uncontended lock and unlock are a single CAS / swap. The lock is not
//! reentrant: locking it again from the owning thread blocks forever. No
//! fairness is promised beyond what the platform wake order gives.
//!
//! [`Mutex<T>`] wraps the raw lock around the data it protects and hands out
//! RAII guards, which is how every other module in this crate uses it.

use core::cell::UnsafeCell;
use core::fmt;
use core::ops::{Deref, DerefMut};
use core::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use crate::sys;

const UNLOCKED: u32 = 0;
const LOCKED: u32 = 1;
const CONTENDED: u32 = 2;

static SPIN_BRANCHES: AtomicU64 = AtomicU64::new(0);
static WAIT_BRANCHES: AtomicU64 = AtomicU64::new(0);
static WAKE_BRANCHES: AtomicU64 = AtomicU64::new(0);

/// Snapshot of the lock slow-path counters: `(spin, wait, wake)`.
///
/// Process-wide and monotonically increasing; compare deltas.
#[must_use]
pub fn branch_counters() -> (u64, u64, u64) {
    (
        SPIN_BRANCHES.load(Ordering::Relaxed),
        WAIT_BRANCHES.load(Ordering::Relaxed),
        WAKE_BRANCHES.load(Ordering::Relaxed),
    )
}

/// Bare lock word without associated data.
///
/// Initialization never fails: the lock is a plain word and allocates
/// nothing. It may be moved while unlocked and unshared.
pub struct RawMutex {
    word: AtomicU32,
}

impl RawMutex {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            word: AtomicU32::new(UNLOCKED),
        }
    }

    /// Block until the lock is acquired.
    pub fn lock(&self) {
        if self
            .word
            .compare_exchange(UNLOCKED, LOCKED, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
        {
            return;
        }
        self.lock_contended();
    }

    #[cold]
    fn lock_contended(&self) {
        SPIN_BRANCHES.fetch_add(1, Ordering::Relaxed);
        loop {
            let observed = self.word.load(Ordering::Relaxed);
            if observed == UNLOCKED {
                // Take it as CONTENDED: other waiters may still be parked.
                if self
                    .word
                    .compare_exchange(UNLOCKED, CONTENDED, Ordering::Acquire, Ordering::Relaxed)
                    .is_ok()
                {
                    return;
                }
                continue;
            }
            if observed == LOCKED
                && self
                    .word
                    .compare_exchange(LOCKED, CONTENDED, Ordering::Relaxed, Ordering::Relaxed)
                    .is_err()
            {
                continue;
            }
            WAIT_BRANCHES.fetch_add(1, Ordering::Relaxed);
            let _ = sys::wait(&self.word, CONTENDED, None);
        }
    }

    /// Acquire the lock if it is free; never blocks.
    #[must_use]
    pub fn try_lock(&self) -> bool {
        self.word
            .compare_exchange(UNLOCKED, LOCKED, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
    }

    /// Release the lock.
    ///
    /// # Safety
    ///
    /// The calling thread must hold the lock.
    pub unsafe fn unlock(&self) {
        let prev = self.word.swap(UNLOCKED, Ordering::Release);
        debug_assert_ne!(prev, UNLOCKED, "unlock of an unlocked RawMutex");
        if prev == CONTENDED {
            WAKE_BRANCHES.fetch_add(1, Ordering::Relaxed);
            // The word is already released; a failed wake leaves nothing to undo.
            let _ = sys::wake_one(&self.word);
        }
    }

    /// True while some thread holds the lock.
    #[must_use]
    pub fn is_locked(&self) -> bool {
        self.word.load(Ordering::Relaxed) != UNLOCKED
    }
}

impl Default for RawMutex {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for RawMutex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RawMutex")
            .field("locked", &self.is_locked())
            .finish()
    }
}

/// Mutual-exclusion lock protecting a value of type `T`.
pub struct Mutex<T: ?Sized> {
    raw: RawMutex,
    data: UnsafeCell<T>,
}

// SAFETY: access to `data` is serialized by `raw`.
unsafe impl<T: ?Sized + Send> Send for Mutex<T> {}
// SAFETY: only one guard exists at a time, so `&Mutex<T>` hands out at most
// one `&mut T` across threads.
unsafe impl<T: ?Sized + Send> Sync for Mutex<T> {}

impl<T> Mutex<T> {
    #[must_use]
    pub const fn new(value: T) -> Self {
        Self {
            raw: RawMutex::new(),
            data: UnsafeCell::new(value),
        }
    }

    pub fn into_inner(self) -> T {
        self.data.into_inner()
    }
}

impl<T: ?Sized> Mutex<T> {
    pub fn lock(&self) -> MutexGuard<'_, T> {
        self.raw.lock();
        MutexGuard { mutex: self }
    }

    pub fn try_lock(&self) -> Option<MutexGuard<'_, T>> {
        if self.raw.try_lock() {
            Some(MutexGuard { mutex: self })
        } else {
            None
        }
    }

    pub fn get_mut(&mut self) -> &mut T {
        self.data.get_mut()
    }

    #[must_use]
    pub fn is_locked(&self) -> bool {
        self.raw.is_locked()
    }

    pub(crate) fn raw(&self) -> &RawMutex {
        &self.raw
    }
}

impl<T: Default> Default for Mutex<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

impl<T: ?Sized> fmt::Debug for Mutex<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Mutex")
            .field("locked", &self.is_locked())
            .finish_non_exhaustive()
    }
}

/// RAII guard; the lock is released on drop.
#[must_use = "the lock is released as soon as the guard is dropped"]
pub struct MutexGuard<'a, T: ?Sized> {
    mutex: &'a Mutex<T>,
}

// SAFETY: sharing a guard only shares `&T`.
unsafe impl<T: ?Sized + Sync> Sync for MutexGuard<'_, T> {}

impl<'a, T: ?Sized> MutexGuard<'a, T> {
    pub(crate) fn mutex(&self) -> &'a Mutex<T> {
        self.mutex
    }
}

impl<T: ?Sized> Deref for MutexGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // SAFETY: the guard proves the lock is held.
        unsafe { &*self.mutex.data.get() }
    }
}

impl<T: ?Sized> DerefMut for MutexGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        // SAFETY: the guard proves the lock is held, and `&mut self` is unique.
        unsafe { &mut *self.mutex.data.get() }
    }
}

impl<T: ?Sized> Drop for MutexGuard<'_, T> {
    fn drop(&mut self) {
        // SAFETY: the guard exists only while the lock is held.
        unsafe { self.mutex.raw.unlock() };
    }
}

impl<T: ?Sized + fmt::Debug> fmt::Debug for MutexGuard<'_, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&**self, f)
    }
}
