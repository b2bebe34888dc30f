//! Bounded retry with exponential backoff and optional jitter

use std::future::Future;
use std::time::Duration;

use errors::{ClassifiedError, SyncError, SyncResult};
use rand::Rng;
use tracing::{debug, warn};

use crate::settings::RetrySettings;

/// Retry policy configuration
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts including the first one (minimum 1)
    pub max_attempts: u32,
    /// Delay before the second attempt
    pub initial_delay: Duration,
    /// Maximum delay between attempts
    pub max_delay: Duration,
    /// Backoff multiplier for exponential delay
    pub backoff_multiplier: f64,
    /// Whether to add jitter to delays
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(8),
            backoff_multiplier: 2.0,
            jitter: false,
        }
    }
}

impl From<&RetrySettings> for RetryPolicy {
    fn from(settings: &RetrySettings) -> Self {
        Self {
            max_attempts: settings.max_attempts.max(1),
            initial_delay: Duration::from_millis(settings.initial_delay_ms),
            max_delay: Duration::from_millis(settings.max_delay_ms),
            backoff_multiplier: settings.backoff_multiplier,
            jitter: settings.jitter,
        }
    }
}

impl RetryPolicy {
    /// Policy that never retries
    pub fn once() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    /// Delay before attempt number `attempt` (1-based; the first attempt has none)
    pub fn delay_before(&self, attempt: u32) -> Duration {
        if attempt <= 1 {
            return Duration::ZERO;
        }
        let exponent = attempt.saturating_sub(2);

        // delay = initial_delay * (multiplier ^ (attempt - 2))
        let mut delay = self
            .initial_delay
            .mul_f64(self.backoff_multiplier.max(1.0).powi(exponent as i32));

        if delay > self.max_delay {
            delay = self.max_delay;
        }

        // ±25% jitter
        if self.jitter {
            let jitter_range = delay.as_secs_f64() * 0.25;
            if jitter_range > 0.0 {
                let jitter = rand::thread_rng().gen_range(-jitter_range..jitter_range);
                delay = Duration::from_secs_f64((delay.as_secs_f64() + jitter).max(0.0));
            }
        }

        delay
    }

    /// Run `op` until it succeeds, fails with a non-retryable error or the
    /// attempt budget is spent
    pub async fn run<T, F, Fut>(&self, label: &str, op: F) -> SyncResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = SyncResult<T>>,
    {
        self.run_if(label, op, |e| e.is_retryable()).await
    }

    /// Like [`RetryPolicy::run`] with a caller-supplied retry predicate
    pub async fn run_if<T, F, Fut, P>(&self, label: &str, mut op: F, should_retry: P) -> SyncResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = SyncResult<T>>,
        P: Fn(&SyncError) -> bool,
    {
        let max_attempts = self.max_attempts.max(1);
        let mut attempt = 1;
        loop {
            match op().await {
                Ok(value) => {
                    if attempt > 1 {
                        debug!("{} succeeded on attempt {}", label, attempt);
                    }
                    return Ok(value);
                },
                Err(e) if attempt < max_attempts && should_retry(&e) => {
                    attempt += 1;
                    let delay = self.delay_before(attempt);
                    warn!(
                        "{} failed ({}): {}; retry {}/{} in {:?}",
                        label,
                        e.error_code(),
                        e,
                        attempt,
                        max_attempts,
                        delay
                    );
                    tokio::time::sleep(delay).await;
                },
                Err(e) => return Err(e),
            }
        }
    }
}
