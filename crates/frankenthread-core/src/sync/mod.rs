//! Synchronization primitives: mutex, condition variable, once-gate.
//!
//! All three park and wake through the word-wait interface in `crate::sys`.

pub mod cond;
pub mod mutex;
pub mod once;

pub use cond::{Condvar, WaitResult};
pub use mutex::{Mutex, MutexGuard, RawMutex};
pub use once::{Once, OnceState, OnceValue};
