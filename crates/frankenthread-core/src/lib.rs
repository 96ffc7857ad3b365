//! # frankenthread-core
//!
//! Portable concurrency runtime: mutex, condition variable, once-gate,
//! thread-local slots, thread lifecycle with cooperative cancellation, and a
//! fixed-size worker pool.
//!
//! Every blocking primitive is written once over a single word-wait
//! interface (`futex(2)` on Linux, `parking_lot_core` parking elsewhere), so
//! behavior is identical on every target. `unsafe` is denied at the crate
//! level; only the modules that wrap native calls or interior mutability opt
//! back in.

#![deny(unsafe_code)]

pub mod config;
pub mod context;
pub mod errno;
pub mod error;
pub mod log;
pub mod pool;
#[allow(unsafe_code)]
pub mod sync;
#[allow(unsafe_code)]
mod sys;
#[allow(unsafe_code)]
pub mod thread;
pub mod tls;

pub use config::RuntimeConfig;
pub use error::{PoolError, SyncError, ThreadError, TlsError};
pub use pool::{PoolHandle, PoolPhase, ShutdownReport, ThreadPool};
pub use sync::{Condvar, Mutex, MutexGuard, Once, OnceValue, WaitResult};
pub use thread::{Cancelled, ExitStatus, Thread, ThreadRef};
pub use tls::TlsKey;
