//! Retries with capped exponential backoff for calls that fail transiently
use rand::Rng;
use std::future::Future;
use std::time::Duration;
use tracing::warn;

/// Retry policy: `max_retries` retries after the first call, spaced
/// `initial_backoff * multiplier^n` and capped at `max_backoff`.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub max_retries: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub backoff_multiplier: f64,
    /// Spread each delay by up to ±30%
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
    /// Delay before retry number `retry` (1-based), before jitter
    pub fn delay_for(&self, retry: u32) -> Duration {
        let exponent = retry.saturating_sub(1).min(i32::MAX as u32) as i32;
        let millis = self.initial_backoff.as_millis() as f64 * self.backoff_multiplier.powi(exponent);
        let capped = millis.min(self.max_backoff.as_millis() as f64).max(0.0);
        Duration::from_millis(capped as u64)
    }

    fn jittered(&self, delay: Duration) -> Duration {
        if !self.jitter {
            return delay;
        }
        let factor = 1.0 + rand::thread_rng().gen_range(-0.3..0.3);
        Duration::from_millis((delay.as_millis() as f64 * factor) as u64)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RetryError<E> {
    /// All attempts failed; carries the error of the final attempt
    #[error("Max retries ({retries}) exceeded: {last}")]
    MaxRetriesExceeded { retries: u32, last: E },
    /// The caller classified the error as permanent
    #[error("Operation failed: {0}")]
    OperationFailed(E),
}

impl<E> RetryError<E> {
    pub fn into_inner(self) -> E {
        match self {
            RetryError::MaxRetriesExceeded { last, .. } => last,
            RetryError::OperationFailed(e) => e,
        }
    }
}

/// Run `f` until it succeeds or the retry budget is spent
pub async fn with_retry<F, Fut, T, E>(config: RetryConfig, f: F) -> Result<T, RetryError<E>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    with_retry_if(config, f, |_| true).await
}

/// Like [`with_retry`], but errors rejected by `should_retry` end the loop at once
pub async fn with_retry_if<F, Fut, T, E, P>(
    config: RetryConfig,
    mut f: F,
    should_retry: P,
) -> Result<T, RetryError<E>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
    P: Fn(&E) -> bool,
{
    let mut retry = 0;

    loop {
        let e = match f().await {
            Ok(value) => return Ok(value),
            Err(e) if !should_retry(&e) => return Err(RetryError::OperationFailed(e)),
            Err(e) => e,
        };

        retry += 1;
        if retry > config.max_retries {
            warn!(error = %e, retries = config.max_retries, "Retry budget exhausted");
            return Err(RetryError::MaxRetriesExceeded {
                retries: config.max_retries,
                last: e,
            });
        }

        let delay = config.jittered(config.delay_for(retry));
        warn!(
            error = %e,
            retry,
            max_retries = config.max_retries,
            delay_ms = delay.as_millis() as u64,
            "Operation failed, retrying"
        );
        tokio::time::sleep(delay).await;
    }
}
