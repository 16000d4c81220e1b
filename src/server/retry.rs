use std::future::Future;
use std::time::Duration;

use crate::config::TimingConfig;
use crate::error::Result;

/// Bounded resend policy for reports, uploads and acknowledgements.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub delay: Duration,
}

impl RetryPolicy {
    pub fn from_timing(timing: &TimingConfig) -> Self {
        Self {
            attempts: timing.report_attempts.max(1),
            delay: timing.report_retry_delay,
        }
    }

    /// Runs `op` until it succeeds, fails with a non-retryable error, or runs
    /// out of attempts. The last error is returned.
    pub async fn run<T, F, Fut>(&self, what: &str, execution_id: &str, mut op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempt = 1;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_retryable() && attempt < self.attempts => {
                    tracing::warn!(
                        execution_id,
                        attempt,
                        max_attempts = self.attempts,
                        error = %e,
                        "{} failed, retrying in {:?}",
                        what,
                        self.delay
                    );
                    attempt += 1;
                    tokio::time::sleep(self.delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_timing(&TimingConfig::default())
    }
}
