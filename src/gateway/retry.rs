// =============================================================================
// Gateway retry — per-attempt timeout with exponential backoff
// =============================================================================

use std::future::Future;
use std::time::Duration;

use tracing::warn;

use crate::error::{EngineError, EngineResult};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    /// Upper bound on one gateway round trip.
    pub timeout: Duration,
    pub max_attempts: u32,
    /// Delay after the first failure; doubles on each further failure.
    pub backoff_base: Duration,
}

impl RetryPolicy {
    fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1_u32 << attempt.saturating_sub(1).min(16);
        self.backoff_base.saturating_mul(factor)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            timeout: Duration::from_millis(3_000),
            max_attempts: 3,
            backoff_base: Duration::from_millis(250),
        }
    }
}

/// Run `op` until it succeeds or `max_attempts` are used up.
///
/// The final failure decides the error: `GatewayTimeout` if the last attempt
/// timed out, `Gateway` with the exchange message otherwise.
pub async fn with_retry<T, F, Fut>(
    policy: &RetryPolicy,
    operation: &str,
    mut op: F,
) -> EngineResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = anyhow::Result<T>>,
{
    let attempts = policy.max_attempts.max(1);
    let mut last_error: Option<String> = None;

    for attempt in 1..=attempts {
        match tokio::time::timeout(policy.timeout, op()).await {
            Ok(Ok(value)) => return Ok(value),
            Ok(Err(e)) => {
                warn!(operation, attempt, max_attempts = attempts, error = %e, "gateway call failed");
                last_error = Some(format!("{e:#}"));
            }
            Err(_) => {
                warn!(
                    operation,
                    attempt,
                    max_attempts = attempts,
                    timeout_ms = policy.timeout.as_millis() as u64,
                    "gateway call timed out"
                );
                last_error = None;
            }
        }
        if attempt < attempts {
            tokio::time::sleep(policy.backoff(attempt)).await;
        }
    }

    Err(match last_error {
        Some(message) => EngineError::Gateway {
            operation: operation.to_string(),
            message,
        },
        None => EngineError::GatewayTimeout {
            operation: operation.to_string(),
            attempts,
        },
    })
}
