//! Bounded retry for outbound connects.

use std::future::Future;
use std::time::Duration;
use tokio::sync::watch;

/// Bounded retry with a fixed pause between attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Maximum number of attempts, including the first.
    pub max_attempts: u32,
    /// Pause after each failed attempt.
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::fixed(10, Duration::from_secs(5))
    }
}

impl RetryPolicy {
    pub fn fixed(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts,
            delay,
        }
    }

    /// Worst-case time spent before giving up, ignoring the attempts themselves.
    pub fn budget(&self) -> Duration {
        self.delay * self.max_attempts.saturating_sub(1)
    }

    /// Runs `operation` until it succeeds, attempts run out, or `shutdown` flips to `true`.
    ///
    /// Returns `None` when giving up.
    pub async fn execute<F, Fut, T, E>(
        &self,
        target: &str,
        shutdown: &mut watch::Receiver<bool>,
        mut operation: F,
    ) -> Option<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: std::fmt::Display,
    {
        let mut attempt = 0;

        loop {
            attempt += 1;
            if *shutdown.borrow() {
                return None;
            }

            match operation(attempt).await {
                Ok(value) => return Some(value),
                Err(e) => {
                    if attempt >= self.max_attempts {
                        tracing::warn!(
                            target_addr = %target,
                            attempt,
                            max_attempts = self.max_attempts,
                            error = %e,
                            "Retry exhausted"
                        );
                        return None;
                    }

                    tracing::debug!(
                        target_addr = %target,
                        attempt,
                        delay_ms = self.delay.as_millis() as u64,
                        error = %e,
                        "Retrying after delay"
                    );

                    tokio::select! {
                        _ = tokio::time::sleep(self.delay) => {}
                        _ = shutdown.changed() => return None,
                    }
                }
            }
        }
    }
}
