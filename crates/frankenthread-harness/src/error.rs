use thiserror::Error;

use frankenthread_core::{PoolError, SyncError, ThreadError, TlsError};

#[derive(Debug, Error)]
pub enum HarnessError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("unknown scenario `{0}`")]
    UnknownScenario(String),
    #[error("unknown output format `{0}` (expected json or jsonl)")]
    UnknownFormat(String),
    #[error("check failed: {0}")]
    Check(String),
    #[error(transparent)]
    Pool(#[from] PoolError),
    #[error(transparent)]
    Thread(#[from] ThreadError),
    #[error(transparent)]
    Tls(#[from] TlsError),
    #[error(transparent)]
    Sync(#[from] SyncError),
}

/// Fail the current scenario with `message` unless `condition` holds.
pub fn ensure(condition: bool, message: impl FnOnce() -> String) -> Result<(), HarnessError> {
    if condition {
        Ok(())
    } else {
        Err(HarnessError::Check(message()))
    }
}
