//! Bounded retries with exponential backoff, jitter and `Retry-After` support.

use std::{fmt::Display, future::Future, time::Duration};

use rand::Rng;
use tracing::warn;

use crate::config::RetrySettings;

/// Failures that know whether another attempt could succeed.
pub trait RetryableError {
    fn is_retryable(&self) -> bool;

    /// Minimum wait requested by the upstream, if any.
    fn retry_after(&self) -> Option<Duration> {
        None
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    max_attempts: u32,
    base_delay: Duration,
    max_delay: Duration,
    jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(&RetrySettings::default())
    }
}

impl RetryPolicy {
    pub fn new(settings: &RetrySettings) -> Self {
        Self {
            max_attempts: settings.max_attempts.max(1),
            base_delay: settings.base_delay,
            max_delay: settings.max_delay,
            jitter: settings.jitter,
        }
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// `min(base * 2^(attempt-1), max)` for a 1-based attempt number, before jitter.
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }

    fn delay_for<E: RetryableError>(&self, attempt: u32, error: &E) -> Duration {
        let mut delay = self.backoff_delay(attempt);
        if self.jitter {
            let factor = rand::thread_rng().gen_range(0.5..=1.0);
            delay = delay.mul_f64(factor);
        }

        match error.retry_after() {
            Some(requested) => delay.max(requested),
            None => delay,
        }
    }

    /// Runs `operation` until it succeeds, fails with a non-retryable error, or
    /// the attempts are used up. The last error is returned unchanged.
    pub async fn run<T, E, F, Fut>(&self, operation: F) -> Result<T, E>
    where
        E: RetryableError + Display,
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        self.run_if(operation, E::is_retryable).await
    }

    /// Like [`RetryPolicy::run`] with a caller-supplied retry condition.
    pub async fn run_if<T, E, F, Fut, C>(&self, mut operation: F, condition: C) -> Result<T, E>
    where
        E: RetryableError + Display,
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        C: Fn(&E) -> bool,
    {
        let mut attempt = 1;
        loop {
            let error = match operation().await {
                Ok(value) => return Ok(value),
                Err(error) => error,
            };

            if attempt >= self.max_attempts || !condition(&error) {
                return Err(error);
            }

            let delay = self.delay_for(attempt, &error);
            warn!(
                attempt,
                max_attempts = self.max_attempts,
                delay_ms = delay.as_millis() as u64,
                error = %error,
                "upstream call failed, retrying"
            );
            tokio::time::sleep(delay).await;
            attempt += 1;
        }
    }
}
