//! Thread-local slots with exit-time destructors.
//!
//! ## Design
//!
//! - **Key registry**: a fixed array of [`KEYS_MAX`] slots behind a lock. Each
//!   slot tracks in-use state, the optional destructor and a generation
//!   counter bumped on create and remove, so a key that was removed (and
//!   possibly re-issued) never matches values stored through the old key.
//! - **Per-thread values**: a growable table in Rust thread-local storage,
//!   indexed by key id and tagged with the generation it was written under.
//! - **Teardown**: threads started by this runtime run destructors explicitly,
//!   after their entry function and cleanup callback. Any other thread runs
//!   them when its thread-local table is dropped at OS thread exit. Up to
//!   [`DESTRUCTOR_ITERATIONS`] rounds are run, since a destructor may store
//!   new values.

use std::cell::RefCell;

use parking_lot::Mutex;

use crate::error::TlsError;

/// Maximum number of live keys per process.
pub const KEYS_MAX: usize = 1024;

/// Maximum destructor rounds on thread exit.
pub const DESTRUCTOR_ITERATIONS: usize = 4;

/// Exit-time destructor; receives the non-null value the thread stored.
pub type Destructor = fn(usize);

#[derive(Clone, Copy)]
struct KeySlot {
    in_use: bool,
    destructor: Option<Destructor>,
    seq: u32,
}

const EMPTY_SLOT: KeySlot = KeySlot {
    in_use: false,
    destructor: None,
    seq: 0,
};

struct KeyRegistry {
    slots: [KeySlot; KEYS_MAX],
}

static REGISTRY: Mutex<KeyRegistry> = parking_lot::const_mutex(KeyRegistry {
    slots: [EMPTY_SLOT; KEYS_MAX],
});

/// Process-wide key naming one per-thread value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TlsKey {
    id: u32,
    seq: u32,
}

#[derive(Clone, Copy, Default)]
struct Entry {
    seq: u32,
    value: usize,
}

#[derive(Default)]
struct ThreadValues {
    entries: Vec<Entry>,
}

impl ThreadValues {
    fn get(&self, key: TlsKey) -> usize {
        match self.entries.get(key.id as usize) {
            Some(entry) if entry.seq == key.seq => entry.value,
            _ => 0,
        }
    }

    fn set(&mut self, key: TlsKey, value: usize) {
        let idx = key.id as usize;
        if idx >= self.entries.len() {
            self.entries.resize(idx + 1, Entry::default());
        }
        self.entries[idx] = Entry {
            seq: key.seq,
            value,
        };
    }

    /// Clear every non-null value and return those owed a destructor call.
    fn take_pending(&mut self) -> Vec<(Destructor, usize)> {
        if self.entries.iter().all(|e| e.value == 0) {
            return Vec::new();
        }
        let registry = REGISTRY.lock();
        let mut pending = Vec::new();
        for (idx, entry) in self.entries.iter_mut().enumerate() {
            if entry.value == 0 {
                continue;
            }
            let slot = registry.slots[idx];
            if slot.in_use && slot.seq == entry.seq {
                if let Some(destructor) = slot.destructor {
                    pending.push((destructor, entry.value));
                }
            }
            entry.value = 0;
        }
        pending
    }
}

impl Drop for ThreadValues {
    fn drop(&mut self) {
        // Foreign threads (not started by this runtime) land here.
        for _ in 0..DESTRUCTOR_ITERATIONS {
            let pending = self.take_pending();
            if pending.is_empty() {
                break;
            }
            for (destructor, value) in pending {
                destructor(value);
            }
        }
    }
}

thread_local! {
    static VALUES: RefCell<ThreadValues> = RefCell::new(ThreadValues::default());
}

impl TlsKey {
    /// Allocate a key. Fails with [`TlsError::Exhausted`] once all
    /// [`KEYS_MAX`] keys are live.
    pub fn new(destructor: Option<Destructor>) -> Result<Self, TlsError> {
        let mut registry = REGISTRY.lock();
        let Some(id) = registry.slots.iter().position(|slot| !slot.in_use) else {
            return Err(TlsError::Exhausted { max: KEYS_MAX });
        };
        let slot = &mut registry.slots[id];
        slot.in_use = true;
        slot.destructor = destructor;
        slot.seq = slot.seq.wrapping_add(1);
        Ok(Self {
            id: id as u32,
            seq: slot.seq,
        })
    }

    /// The calling thread's value; `0` when never set.
    #[must_use]
    pub fn get(&self) -> usize {
        VALUES
            .try_with(|values| values.borrow().get(*self))
            .unwrap_or(0)
    }

    /// Store `value` for the calling thread.
    pub fn set(&self, value: usize) -> Result<(), TlsError> {
        if !self.is_live() {
            return Err(TlsError::InvalidKey { id: self.id });
        }
        VALUES
            .try_with(|values| values.borrow_mut().set(*self, value))
            .map_err(|_| TlsError::ThreadExiting)
    }

    /// Release the key. No destructors run; values already stored by other
    /// threads are abandoned and never reach a destructor.
    pub fn remove(self) -> Result<(), TlsError> {
        let mut registry = REGISTRY.lock();
        let slot = &mut registry.slots[self.id as usize];
        if !slot.in_use || slot.seq != self.seq {
            return Err(TlsError::InvalidKey { id: self.id });
        }
        slot.in_use = false;
        slot.destructor = None;
        slot.seq = slot.seq.wrapping_add(1);
        Ok(())
    }

    #[must_use]
    pub fn id(&self) -> u32 {
        self.id
    }

    #[must_use]
    pub fn is_live(&self) -> bool {
        let slot = REGISTRY.lock().slots[self.id as usize];
        slot.in_use && slot.seq == self.seq
    }
}

/// Number of keys currently allocated process-wide.
#[must_use]
pub fn live_keys() -> usize {
    REGISTRY.lock().slots.iter().filter(|s| s.in_use).count()
}

/// Run the calling thread's destructors now.
///
/// Called by the thread wrapper after entry and cleanup have finished.
pub(crate) fn run_thread_destructors() {
    for _ in 0..DESTRUCTOR_ITERATIONS {
        let pending = VALUES
            .try_with(|values| values.borrow_mut().take_pending())
            .unwrap_or_default();
        if pending.is_empty() {
            break;
        }
        for (destructor, value) in pending {
            destructor(value);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn unset_value_reads_as_null() {
        let key = TlsKey::new(None).unwrap();
        assert_eq!(key.get(), 0);
        key.remove().unwrap();
    }

    #[test]
    fn values_are_per_thread() {
        let key = TlsKey::new(None).unwrap();
        key.set(11).unwrap();
        let seen = std::thread::spawn(move || {
            let before = key.get();
            key.set(22).unwrap();
            (before, key.get())
        })
        .join()
        .unwrap();
        assert_eq!(seen, (0, 22));
        assert_eq!(key.get(), 11);
        key.remove().unwrap();
    }

    static DTOR_SUM: AtomicUsize = AtomicUsize::new(0);
    static DTOR_CALLS: AtomicUsize = AtomicUsize::new(0);

    fn record(value: usize) {
        DTOR_SUM.fetch_add(value, Ordering::SeqCst);
        DTOR_CALLS.fetch_add(1, Ordering::SeqCst);
    }

    #[test]
    fn destructor_runs_once_per_thread_with_non_null_value() {
        let key = TlsKey::new(Some(record)).unwrap();
        let handles: Vec<_> = (1..=3)
            .map(|i| std::thread::spawn(move || key.set(i * 100).unwrap()))
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        // A thread that never sets the key owes no destructor call.
        std::thread::spawn(move || assert_eq!(key.get(), 0))
            .join()
            .unwrap();
        assert_eq!(DTOR_CALLS.load(Ordering::SeqCst), 3);
        assert_eq!(DTOR_SUM.load(Ordering::SeqCst), 600);
        key.remove().unwrap();
    }

    #[test]
    fn removed_key_rejects_set_and_double_remove() {
        let key = TlsKey::new(None).unwrap();
        let stale = key;
        key.remove().unwrap();
        assert!(!stale.is_live());
        assert_eq!(stale.set(5), Err(TlsError::InvalidKey { id: stale.id() }));
        assert_eq!(stale.remove(), Err(TlsError::InvalidKey { id: stale.id() }));
    }

    #[test]
    fn values_from_an_older_generation_read_as_null() {
        let mut values = ThreadValues::default();
        let old = TlsKey { id: 3, seq: 0xFFFF_0001 };
        let reissued = TlsKey { id: 3, seq: 0xFFFF_0003 };
        values.set(old, 42);
        assert_eq!(values.get(old), 42);
        assert_eq!(values.get(reissued), 0);
        assert_eq!(values.get(TlsKey { id: 900, seq: 1 }), 0);
        // Not registered, so nothing is owed a destructor; the value is cleared.
        assert!(values.take_pending().is_empty());
        assert_eq!(values.get(old), 0);
    }
}
