use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use docapproval_core::config::EngineConfig;
use tracing::warn;

pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;
pub const DEFAULT_BACKOFF: Duration = Duration::from_millis(25);

/// Bounded retry for whole engine operations. Attempt `n` that fails with a
/// retryable error sleeps `backoff * n` before attempt `n + 1`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    max_attempts: u32,
    backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self { max_attempts: DEFAULT_MAX_ATTEMPTS, backoff: DEFAULT_BACKOFF }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, backoff: Duration) -> Self {
        Self { max_attempts: max_attempts.max(1), backoff }
    }

    pub fn from_config(config: &EngineConfig) -> Self {
        Self::new(config.max_attempts, Duration::from_millis(config.retry_backoff_ms))
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    pub fn backoff_for(&self, attempt: u32) -> Duration {
        self.backoff.saturating_mul(attempt)
    }

    pub async fn run<T, E, F, Fut>(
        &self,
        operation: &'static str,
        is_retryable: impl Fn(&E) -> bool,
        mut attempt_fn: F,
    ) -> Result<T, E>
    where
        E: Display,
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let mut attempt = 1;
        loop {
            match attempt_fn(attempt).await {
                Err(error) if attempt < self.max_attempts && is_retryable(&error) => {
                    let delay = self.backoff_for(attempt);
                    warn!(
                        event_name = "approval.retry",
                        operation,
                        attempt,
                        max_attempts = self.max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %error,
                        "retrying after store conflict"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                result => return result,
            }
        }
    }
}
