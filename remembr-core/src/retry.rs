//! Bounded retry for store calls.
//!
//! Only transient infrastructure errors are retried (see
//! [`MemoryError::is_transient`]); every attempt runs under a timeout.

use std::future::Future;
use std::time::Duration;

use tokio_retry::strategy::{jitter, ExponentialBackoff};
use tokio_retry::RetryIf;

use crate::config::StoreConfig;
use crate::error::{MemoryError, Result};

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_retries: usize,
    pub base_delay_ms: u64,
    pub attempt_timeout: Duration,
}

impl RetryPolicy {
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            base_delay_ms: 0,
            attempt_timeout: Duration::from_secs(30),
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(&StoreConfig::default())
    }
}

impl From<&StoreConfig> for RetryPolicy {
    fn from(config: &StoreConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            base_delay_ms: config.retry_delay_ms.max(1),
            attempt_timeout: Duration::from_secs(config.query_timeout_seconds.max(1)),
        }
    }
}

/// Run `op` with bounded exponential backoff on transient failures.
pub async fn with_retry<T, F, Fut>(policy: &RetryPolicy, operation: &'static str, mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let strategy = ExponentialBackoff::from_millis(policy.base_delay_ms.max(1))
        .max_delay(Duration::from_secs(2))
        .map(jitter)
        .take(policy.max_retries);

    let timeout = policy.attempt_timeout;

    RetryIf::spawn(
        strategy,
        || {
            let attempt = op();
            async move {
                match tokio::time::timeout(timeout, attempt).await {
                    Ok(result) => result,
                    Err(_) => Err(MemoryError::Timeout {
                        operation,
                        timeout_ms: timeout.as_millis() as u64,
                    }),
                }
            }
        },
        |e: &MemoryError| {
            let transient = e.is_transient();
            if transient {
                tracing::warn!(operation, error = %e, "Transient store failure, retrying");
            }
            transient
        },
    )
    .await
}
