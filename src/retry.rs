//! Exponential backoff bounded by total elapsed time, plus a fixed
//! post-success delay that caps the request rate.

use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

/// Slowest accepted request rate: one request per hour.
pub(crate) const MIN_REQUESTS_PER_SECOND: f64 = 1.0 / 3600.0;

/// Errors that know whether another attempt could succeed.
pub(crate) trait Retryable {
    fn is_transient(&self) -> bool;
}

/// Retry and rate-limit policy for one remote operation.
#[derive(Debug, Clone)]
pub(crate) struct RetryPolicy {
    /// No retry is started once its delay would take the operation past this.
    pub(crate) max_elapsed: Duration,
    /// Delay before the first retry.
    pub(crate) initial_interval: Duration,
    /// Growth factor between consecutive delays.
    pub(crate) multiplier: f64,
    /// Upper bound for a single delay.
    pub(crate) max_interval: Duration,
    /// Ceiling on successful requests per second; `0` disables the delay.
    pub(crate) requests_per_second: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_elapsed: Duration::from_secs(60),
            initial_interval: Duration::from_secs(1),
            multiplier: 2.0,
            max_interval: Duration::from_secs(30),
            requests_per_second: 2.0,
        }
    }
}

impl RetryPolicy {
    pub(crate) fn with_requests_per_second(mut self, requests_per_second: f64) -> Self {
        self.requests_per_second = requests_per_second;
        self
    }

    /// Delay after the `attempt`-th failure (zero based).
    pub(crate) fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let secs = self.initial_interval.as_secs_f64()
            * self.multiplier.powi(attempt.min(i32::MAX as u32) as i32);
        Duration::from_secs_f64(secs.min(self.max_interval.as_secs_f64()))
    }

    /// Pause after a successful call; rates below [`MIN_REQUESTS_PER_SECOND`]
    /// are treated as that minimum.
    pub(crate) fn rate_limit_delay(&self) -> Duration {
        if self.requests_per_second > 0.0 {
            Duration::from_secs_f64(1.0 / self.requests_per_second.max(MIN_REQUESTS_PER_SECOND))
        } else {
            Duration::ZERO
        }
    }
}

#[derive(Debug)]
pub(crate) enum RetryError<E> {
    /// The operation failed with an error that retrying cannot fix.
    Permanent(E),
    /// Every attempt failed transiently and the time budget ran out.
    Exhausted { last: E, attempts: u32 },
}

/// Runs `operation` until it succeeds, fails permanently, or the next backoff
/// would overrun `policy.max_elapsed`.
pub(crate) async fn retry_transient<F, Fut, T, E>(
    policy: &RetryPolicy,
    operation_name: &str,
    operation: F,
) -> Result<T, RetryError<E>>
where
    F: Fn() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Retryable + std::fmt::Display,
{
    let started = Instant::now();
    let mut attempt = 0u32;

    loop {
        match operation().await {
            Ok(value) => return Ok(value),
            Err(e) if !e.is_transient() => {
                debug!("{} failed permanently: {}", operation_name, e);
                return Err(RetryError::Permanent(e));
            }
            Err(e) => {
                let delay = policy.delay_for_attempt(attempt);
                attempt += 1;
                if started.elapsed() + delay > policy.max_elapsed {
                    warn!(
                        "{} giving up after {} attempts in {:?}: {}",
                        operation_name,
                        attempt,
                        started.elapsed(),
                        e
                    );
                    return Err(RetryError::Exhausted { last: e, attempts: attempt });
                }
                warn!(
                    "{} attempt {} failed, retrying in {:?}: {}",
                    operation_name, attempt, delay, e
                );
                tokio::time::sleep(delay).await;
            }
        }
    }
}
