use std::{future::Future, io, time::Duration};

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::error::{Result, VaultError};

/// Bounded retry with linear backoff for I/O errors that may clear on their own.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub backoff_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            backoff_ms: 25,
        }
    }
}

impl RetryPolicy {
    pub fn none() -> Self {
        Self {
            attempts: 1,
            backoff_ms: 0,
        }
    }

    /// Runs `op` until it succeeds, fails with a non-transient error, or the
    /// attempt budget is spent. Waits `backoff_ms * attempt` between tries.
    pub async fn run<T, F, Fut>(&self, operation: &'static str, mut op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = io::Result<T>>,
    {
        let attempts = self.attempts.max(1);
        let mut attempt = 1;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(err) if is_transient(&err) && attempt < attempts => {
                    warn!(operation, attempt, error = %err, "transient I/O failure, retrying");
                    tokio::time::sleep(Duration::from_millis(
                        self.backoff_ms.saturating_mul(u64::from(attempt)),
                    ))
                    .await;
                    attempt += 1;
                }
                Err(err) if is_transient(&err) => {
                    return Err(VaultError::IoRetriesExhausted {
                        operation,
                        attempts,
                        source: err,
                    });
                }
                Err(err) => return Err(err.into()),
            }
        }
    }
}

pub fn is_transient(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::Interrupted
            | io::ErrorKind::WouldBlock
            | io::ErrorKind::TimedOut
            | io::ErrorKind::PermissionDenied
            | io::ErrorKind::ResourceBusy
    )
}

/// Races `fut` against `cancel`. A cancelled write leaves its outcome unknown.
pub async fn guarded<T>(
    cancel: &CancellationToken,
    fut: impl Future<Output = Result<T>>,
) -> Result<T> {
    if cancel.is_cancelled() {
        return Err(VaultError::Cancelled);
    }
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(VaultError::Cancelled),
        result = fut => result,
    }
}
