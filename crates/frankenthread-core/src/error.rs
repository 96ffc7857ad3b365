//! Error types for the runtime.
//!
//! Every recoverable failure surfaces to the immediate caller. Native-call
//! failures are propagated as [`SyncError::Native`]; nothing retries an
//! allocation or aborts on the caller's behalf.

use thiserror::Error;

use crate::errno;

/// Failure of a native synchronization call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum SyncError {
    #[error("native {op} failed: {} ({errno})", symbolic(.errno))]
    Native { op: &'static str, errno: i32 },
}

fn symbolic(code: &i32) -> &'static str {
    errno::name(*code)
}

impl SyncError {
    #[must_use]
    pub const fn errno(&self) -> i32 {
        match self {
            Self::Native { errno, .. } => *errno,
        }
    }
}

/// Thread lifecycle failures.
#[derive(Debug, Error)]
pub enum ThreadError {
    #[error("thread creation failed: {0}")]
    Spawn(#[from] std::io::Error),
    #[error("a thread cannot join itself")]
    Deadlock,
    #[error("thread terminated without publishing an exit status")]
    Lost,
    #[error(transparent)]
    Sync(#[from] SyncError),
}

impl ThreadError {
    #[must_use]
    pub fn errno(&self) -> i32 {
        match self {
            Self::Spawn(err) => match err.kind() {
                std::io::ErrorKind::OutOfMemory => errno::ENOMEM,
                _ => err.raw_os_error().unwrap_or(errno::EAGAIN),
            },
            Self::Deadlock => errno::EDEADLK,
            Self::Lost => errno::ESRCH,
            Self::Sync(err) => err.errno(),
        }
    }
}

/// Thread-local slot failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum TlsError {
    #[error("all {max} thread-local keys are in use")]
    Exhausted { max: usize },
    #[error("thread-local key {id} is not live")]
    InvalidKey { id: u32 },
    #[error("thread-local storage of this thread is already torn down")]
    ThreadExiting,
}

impl TlsError {
    #[must_use]
    pub const fn errno(&self) -> i32 {
        match self {
            Self::Exhausted { .. } => errno::EAGAIN,
            Self::InvalidKey { .. } | Self::ThreadExiting => errno::EINVAL,
        }
    }
}

/// Thread pool failures.
#[derive(Debug, Error)]
pub enum PoolError {
    #[error("failed to start worker {index}: {source}")]
    Spawn {
        index: usize,
        #[source]
        source: ThreadError,
    },
    #[error("pool is stopping and accepts no further work")]
    Stopped,
    #[error("a pool worker cannot wait on or destroy its own pool")]
    CalledFromWorker,
    #[error("worker join failed: {0}")]
    Join(ThreadError),
    #[error(transparent)]
    Sync(#[from] SyncError),
}

impl PoolError {
    #[must_use]
    pub fn errno(&self) -> i32 {
        match self {
            Self::Spawn { source, .. } | Self::Join(source) => source.errno(),
            Self::Stopped => errno::ECANCELED,
            Self::CalledFromWorker => errno::EDEADLK,
            Self::Sync(err) => err.errno(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sync_error_reports_symbolic_errno() {
        let err = SyncError::Native {
            op: "futex_wake",
            errno: errno::EFAULT,
        };
        assert_eq!(err.errno(), errno::EFAULT);
        assert!(err.to_string().contains("EFAULT"), "{err}");
    }

    #[test]
    fn pool_error_maps_through_wrapped_sources() {
        let err = PoolError::Spawn {
            index: 3,
            source: ThreadError::Spawn(std::io::Error::from_raw_os_error(errno::EAGAIN)),
        };
        assert_eq!(err.errno(), errno::EAGAIN);
        assert!(err.to_string().contains("worker 3"));
        assert_eq!(PoolError::Stopped.errno(), errno::ECANCELED);
        assert_eq!(PoolError::CalledFromWorker.errno(), errno::EDEADLK);
    }

    #[test]
    fn tls_errors_map_to_posix_codes() {
        assert_eq!(TlsError::Exhausted { max: 1024 }.errno(), errno::EAGAIN);
        assert_eq!(TlsError::InvalidKey { id: 7 }.errno(), errno::EINVAL);
    }
}
