//! Shared retry with exponential backoff
//!
//! Retryable kinds (network, rate-limit, server) back off exponentially,
//! honoring any `Retry-After` hint the server sent. Everything else
//! returns immediately. Cancellation is checked before every attempt and
//! during every delay.

use std::future::Future;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use driftfs_core::domain::DriftError;

/// First backoff delay; doubles per attempt
const BASE_DELAY: Duration = Duration::from_secs(1);
/// Backoff ceiling
const MAX_DELAY: Duration = Duration::from_secs(60);

/// Runs `f` up to `attempts` times, backing off between retryable failures
///
/// `f` receives the attempt number (0-based). The final error is returned
/// unchanged so callers keep the taxonomy.
pub async fn with_backoff<T, F, Fut>(
    operation: &str,
    attempts: u32,
    cancel: &CancellationToken,
    mut f: F,
) -> Result<T, DriftError>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, DriftError>>,
{
    let attempts = attempts.max(1);

    for attempt in 0..attempts {
        if cancel.is_cancelled() {
            return Err(DriftError::Cancelled);
        }

        match f(attempt).await {
            Ok(value) => {
                if attempt > 0 {
                    info!(operation, attempt, "Operation succeeded after retry");
                }
                return Ok(value);
            }
            Err(err) if err.is_retryable() && attempt + 1 < attempts => {
                let delay = err
                    .retry_after()
                    .unwrap_or_else(|| backoff_delay(attempt));
                warn!(
                    operation,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "Retryable failure, backing off"
                );
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = cancel.cancelled() => return Err(DriftError::Cancelled),
                }
            }
            Err(err) => return Err(err),
        }
    }

    Err(DriftError::Cancelled)
}

/// Exponential delay for a 0-based attempt: 1 s, 2 s, 4 s, ... capped
#[must_use]
pub fn backoff_delay(attempt: u32) -> Duration {
    let exp = attempt.min(6);
    std::cmp::min(BASE_DELAY * 2u32.pow(exp), MAX_DELAY)
}
