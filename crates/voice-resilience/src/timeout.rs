//! Timeout helper for transport round-trips

use std::future::Future;
use std::time::Duration;
use thiserror::Error;
use tokio::time::timeout;

/// Default bound for a ping/acknowledgement round-trip
pub const DEFAULT_STABILITY_TIMEOUT: Duration = Duration::from_secs(5);

/// Timeout error
#[derive(Debug, Clone, Error)]
#[error("Operation '{operation}' timed out after {duration:?}")]
pub struct TimeoutError {
    /// The operation that timed out
    pub operation: String,
    /// The timeout duration
    pub duration: Duration,
}

/// Execute a future with a timeout
pub async fn with_timeout<T>(
    duration: Duration,
    operation: impl Into<String>,
    future: impl Future<Output = T>,
) -> Result<T, TimeoutError> {
    let op = operation.into();
    timeout(duration, future)
        .await
        .map_err(|_| TimeoutError {
            operation: op,
            duration,
        })
}
