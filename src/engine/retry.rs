//! Exponential backoff for transient stage failures.

use std::future::Future;
use std::time::Duration;

use crate::config::RetryParams;
use crate::error::StageError;

use super::RunControl;

/// Retry settings for one stage.
///
/// Only [`StageError::Transient`] is retried. Delays double from
/// `initial_backoff` up to `max_backoff`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(&RetryParams::default())
    }
}

impl From<&RetryParams> for RetryPolicy {
    fn from(p: &RetryParams) -> Self {
        Self {
            max_attempts: p.max_attempts.max(1),
            initial_backoff: Duration::from_millis(p.initial_backoff_ms),
            max_backoff: Duration::from_millis(p.max_backoff_ms),
        }
    }
}

impl RetryPolicy {
    /// Policy that never retries.
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            initial_backoff: Duration::ZERO,
            max_backoff: Duration::ZERO,
        }
    }

    /// Delay before the attempt following failed attempt number `attempt`
    /// (1-based).
    pub fn backoff(&self, attempt: u32) -> Duration {
        let shift = attempt.saturating_sub(1).min(16);
        self.initial_backoff
            .saturating_mul(1u32 << shift)
            .min(self.max_backoff)
    }

    /// Run `op` until it succeeds, fails non-transiently, runs out of
    /// attempts, or the run is cancelled. Returns the last result together
    /// with the number of attempts made.
    pub async fn run<T, F, Fut>(&self, control: &RunControl, mut op: F) -> (Result<T, StageError>, u32)
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, StageError>>,
    {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match op().await {
                Ok(v) => return (Ok(v), attempt),
                Err(e) if e.is_transient() && attempt < self.max_attempts => {
                    let delay = self.backoff(attempt);
                    tracing::debug!(attempt, ?delay, error = %e, "retrying after transient failure");
                    tokio::select! {
                        biased;
                        _ = control.cancelled() => return (Err(e), attempt),
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
                Err(e) => return (Err(e), attempt),
            }
        }
    }
}
