//! Bounded exponential backoff for transient service failures

use std::future::Future;
use std::time::Duration;

use cdmkg_core::{ExtractionConfig, KgError, Result};
use tokio::time::sleep;
use tracing::{info, warn};

/// Retry policy applied per segment
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    max_attempts: u32,
    initial_backoff: Duration,
    max_backoff: Duration,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, initial_backoff_ms: u64, max_backoff_ms: u64) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            initial_backoff: Duration::from_millis(initial_backoff_ms),
            max_backoff: Duration::from_millis(max_backoff_ms),
        }
    }

    pub fn from_config(config: &ExtractionConfig) -> Self {
        Self::new(
            config.max_attempts,
            config.initial_backoff_ms,
            config.max_backoff_ms,
        )
    }

    /// Run `f` until it succeeds, fails permanently, or the attempt budget
    /// is spent.
    ///
    /// Only `KgError::TransientService` is retried. Exhausting the budget
    /// yields `KgError::ExtractionFailed`; any other error is returned as is
    /// after the first occurrence.
    pub async fn retry<F, Fut, T>(&self, segment_id: usize, mut f: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempt = 0;
        let mut backoff = self.initial_backoff;

        loop {
            attempt += 1;
            match f().await {
                Ok(value) => {
                    if attempt > 1 {
                        info!(segment_id, attempts = attempt, "Extraction succeeded after retries");
                    }
                    return Ok(value);
                }
                Err(e) if e.is_transient() => {
                    if attempt >= self.max_attempts {
                        warn!(
                            segment_id,
                            attempts = attempt,
                            error = %e,
                            "Extraction failed after max attempts"
                        );
                        return Err(KgError::ExtractionFailed {
                            segment_id,
                            attempts: attempt,
                            last_error: e.to_string(),
                        });
                    }

                    warn!(
                        segment_id,
                        attempt,
                        max_attempts = self.max_attempts,
                        backoff_ms = backoff.as_millis() as u64,
                        error = %e,
                        "Transient failure, retrying"
                    );

                    sleep(backoff).await;
                    backoff = std::cmp::min(backoff * 2, self.max_backoff);
                }
                Err(e) => return Err(e),
            }
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&ExtractionConfig::default())
    }
}
