//! Exponential-backoff retry for tool execution.

use std::future::Future;
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;

use super::config::RetryConfig;
use crate::tools::ToolError;

/// An error the retry handler knows how to classify.
pub trait RetryableError: std::fmt::Display {
    fn is_retryable(&self) -> bool;

    /// The error returned when the token fires mid-retry.
    fn cancelled(label: &str) -> Self;
}

impl RetryableError for ToolError {
    fn is_retryable(&self) -> bool {
        ToolError::is_retryable(self)
    }

    fn cancelled(label: &str) -> Self {
        ToolError::Cancelled {
            tool: label.to_string(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RetryHandler {
    config: RetryConfig,
}

impl RetryHandler {
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    /// Delay before retry number `n` (0-based): `min(initial * multiplier^n, max)`.
    pub fn backoff(&self, n: u32) -> Duration {
        let initial = self.config.initial_backoff_ms as f64;
        let raw = initial * self.config.multiplier.powi(n as i32);
        let capped = raw.min(self.config.max_backoff_ms as f64).max(0.0);
        Duration::from_millis(capped as u64)
    }

    /// Run `op` until it succeeds, fails with a non-retryable error, or
    /// `max_retries` retries are spent. At most `max_retries + 1` attempts.
    pub async fn execute<T, E, F, Fut>(
        &self,
        token: &CancellationToken,
        label: &str,
        mut op: F,
    ) -> Result<T, E>
    where
        E: RetryableError,
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let started = Instant::now();
        let mut attempt = 0u32;
        loop {
            if token.is_cancelled() {
                return Err(E::cancelled(label));
            }
            match op(attempt).await {
                Ok(value) => {
                    if attempt > 0 {
                        tracing::info!(label, attempts = attempt + 1, "succeeded after retry");
                    }
                    return Ok(value);
                }
                Err(e) if !e.is_retryable() => return Err(e),
                Err(e) if attempt >= self.config.max_retries => {
                    tracing::warn!(
                        label,
                        attempts = attempt + 1,
                        elapsed_ms = started.elapsed().as_millis() as u64,
                        error = %e,
                        "retries exhausted"
                    );
                    return Err(e);
                }
                Err(e) => {
                    let delay = self.backoff(attempt);
                    tracing::debug!(
                        label,
                        attempt = attempt + 1,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "retrying after backoff"
                    );
                    tokio::select! {
                        biased;
                        _ = token.cancelled() => return Err(E::cancelled(label)),
                        _ = tokio::time::sleep(delay) => {}
                    }
                    attempt += 1;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn handler(max_retries: u32) -> RetryHandler {
        RetryHandler::new(RetryConfig {
            max_retries,
            initial_backoff_ms: 10,
            max_backoff_ms: 40,
            multiplier: 2.0,
        })
    }

    fn transient() -> ToolError {
        ToolError::ExecutionFailed {
            tool: "t".into(),
            reason: "flaky".into(),
        }
    }

    #[test]
    fn test_backoff_caps() {
        let h = handler(5);
        assert_eq!(h.backoff(0), Duration::from_millis(10));
        assert_eq!(h.backoff(1), Duration::from_millis(20));
        assert_eq!(h.backoff(2), Duration::from_millis(40));
        assert_eq!(h.backoff(6), Duration::from_millis(40));
    }

    #[tokio::test]
    async fn test_attempts_bounded_and_elapsed_covers_backoff() {
        let h = handler(2);
        let calls = AtomicU32::new(0);
        let started = Instant::now();
        let result: Result<(), ToolError> = h
            .execute(&CancellationToken::new(), "t", |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(transient()) }
            })
            .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert!(started.elapsed() >= Duration::from_millis(30));
    }

    #[tokio::test]
    async fn test_succeeds_after_transient_failure() {
        let h = handler(3);
        let result: Result<u32, ToolError> = h
            .execute(&CancellationToken::new(), "t", |attempt| async move {
                if attempt < 2 {
                    Err(transient())
                } else {
                    Ok(attempt)
                }
            })
            .await;
        assert_eq!(result.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_non_retryable_short_circuits() {
        let h = handler(5);
        let calls = AtomicU32::new(0);
        let result: Result<(), ToolError> = h
            .execute(&CancellationToken::new(), "t", |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async {
                    Err(ToolError::InvalidArguments {
                        tool: "t".into(),
                        reason: "bad".into(),
                    })
                }
            })
            .await;
        assert_eq!(result.unwrap_err().code(), "INVALID_TOOL_ARGUMENTS");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_cancel_during_backoff() {
        let h = RetryHandler::new(RetryConfig {
            max_retries: 3,
            initial_backoff_ms: 10_000,
            max_backoff_ms: 10_000,
            multiplier: 1.0,
        });
        let token = CancellationToken::new();
        let canceller = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            canceller.cancel();
        });
        let started = Instant::now();
        let result: Result<(), ToolError> = h
            .execute(&token, "t", |_| async { Err(transient()) })
            .await;
        assert_eq!(result.unwrap_err().code(), "CANCELLED");
        assert!(started.elapsed() < Duration::from_secs(5));
    }
}
