/// Bounded retry with exponential backoff
use rand::Rng;
use std::fmt::Display;
use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Attempts after the first one
    pub max_retries: u32,
    /// Delay before the first retry
    pub initial_backoff: Duration,
    /// Upper bound of any single delay
    pub max_backoff: Duration,
    pub backoff_multiplier: f64,
    /// Spread each delay by ±30%
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(10),
            backoff_multiplier: 2.0,
            jitter: true,
        }
    }
}

impl RetryConfig {
    /// Short schedule for lock races and serialization failures, where the
    /// competing transaction commits within milliseconds
    pub fn contention() -> Self {
        Self {
            max_retries: 5,
            initial_backoff: Duration::from_millis(5),
            max_backoff: Duration::from_millis(200),
            backoff_multiplier: 2.0,
            jitter: true,
        }
    }

    /// Delay before retry number `retry` (1-based), before jitter
    pub fn backoff_for(&self, retry: u32) -> Duration {
        let exponent = retry.saturating_sub(1) as i32;
        let millis =
            self.initial_backoff.as_millis() as f64 * self.backoff_multiplier.powi(exponent);
        let capped = millis.min(self.max_backoff.as_millis() as f64);
        Duration::from_millis(capped as u64)
    }

    fn delay_for(&self, retry: u32) -> Duration {
        let base = self.backoff_for(retry);
        if !self.jitter {
            return base;
        }
        let factor = 1.0 + rand::thread_rng().gen_range(-0.3..0.3);
        Duration::from_millis((base.as_millis() as f64 * factor) as u64)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RetryError<E> {
    /// Every allowed attempt failed with a retryable error
    #[error("Gave up after {attempts} attempts: {last_error}")]
    Exhausted { attempts: u32, last_error: E },
    /// The predicate refused to retry this error
    #[error("Operation failed: {0}")]
    NotRetryable(E),
}

impl<E> RetryError<E> {
    /// The error of the last attempt
    pub fn into_inner(self) -> E {
        match self {
            RetryError::Exhausted { last_error, .. } => last_error,
            RetryError::NotRetryable(e) => e,
        }
    }
}

/// Run `op` until it succeeds, retrying every error
pub async fn with_retry<F, Fut, T, E>(config: RetryConfig, op: F) -> Result<T, RetryError<E>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Display,
{
    with_retry_if(config, |_| true, op).await
}

/// Run `op` until it succeeds, retrying only errors `should_retry` accepts.
/// Anything else comes back at once as [`RetryError::NotRetryable`].
pub async fn with_retry_if<F, Fut, T, E, P>(
    config: RetryConfig,
    should_retry: P,
    mut op: F,
) -> Result<T, RetryError<E>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    P: Fn(&E) -> bool,
    E: Display,
{
    let mut retry = 0;
    loop {
        let err = match op().await {
            Ok(value) => {
                if retry > 0 {
                    debug!(retries = retry, "Operation succeeded after retrying");
                }
                return Ok(value);
            }
            Err(e) => e,
        };

        if !should_retry(&err) {
            return Err(RetryError::NotRetryable(err));
        }
        if retry >= config.max_retries {
            warn!(error = %err, attempts = retry + 1, "Retries exhausted");
            return Err(RetryError::Exhausted {
                attempts: retry + 1,
                last_error: err,
            });
        }

        retry += 1;
        let delay = config.delay_for(retry);
        debug!(
            error = %err,
            retry,
            max_retries = config.max_retries,
            delay_ms = delay.as_millis() as u64,
            "Retrying"
        );
        tokio::time::sleep(delay).await;
    }
}
