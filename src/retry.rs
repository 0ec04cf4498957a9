//! Retry logic with exponential backoff
//!
//! Every network operation in the engine runs through [`with_retry`], which
//! implements bounded exponential backoff with optional jitter. The delay
//! shape comes from [`RetryConfig`]; the attempt budget is passed per call
//! site because the engine uses different budgets for page listings, post
//! fetches, file transfers and auxiliary API calls.

use crate::config::RetryConfig;
use crate::error::Error;
use rand::Rng;
use std::future::Future;
use std::time::Duration;

/// Trait for errors that can be classified as retryable or not
///
/// Transient failures (network timeouts, connection resets, 5xx responses,
/// rate limits) should return `true`. Permanent failures (4xx other than
/// 429, malformed bodies, filesystem errors) should return `false`.
pub trait IsRetryable {
    /// Returns true if the error is transient and the operation should be retried
    fn is_retryable(&self) -> bool;
}

impl IsRetryable for Error {
    fn is_retryable(&self) -> bool {
        match self {
            Error::Network(e) => {
                // Timeouts and connection-level failures are transient;
                // decode/builder errors are not
                e.is_timeout() || e.is_connect() || e.is_request()
            }
            // 5xx and rate limits are transient, other 4xx exhaust immediately
            Error::Http { status, .. } => *status >= 500 || *status == 429,
            Error::Io(e) => matches!(
                e.kind(),
                std::io::ErrorKind::TimedOut
                    | std::io::ErrorKind::ConnectionRefused
                    | std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::ConnectionAborted
                    | std::io::ErrorKind::NotConnected
                    | std::io::ErrorKind::BrokenPipe
                    | std::io::ErrorKind::Interrupted
            ),
            // A body that parsed as the wrong shape will not improve on retry
            Error::MalformedResponse { .. } => false,
            Error::UnsupportedDomain(_) => false,
            Error::InvalidTarget(_) => false,
            Error::Filesystem { .. } => false,
            Error::Cancelled => false,
            Error::Config { .. } => false,
            Error::Serialization(_) => false,
        }
    }
}

/// Execute an async operation with exponential backoff retry logic
///
/// # Arguments
///
/// * `config` - Delay shape (initial delay, cap, multiplier, jitter)
/// * `max_attempts` - Total attempt budget; the operation runs at most this
///   many times (a budget of 0 is treated as 1)
/// * `operation` - Async closure returning `Result<T, E>` where `E`
///   implements [`IsRetryable`]
///
/// # Returns
///
/// The first successful result, or the last error once the budget is
/// exhausted or a non-retryable error occurs.
pub async fn with_retry<F, Fut, T, E>(
    config: &RetryConfig,
    max_attempts: u32,
    mut operation: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: IsRetryable + std::fmt::Display,
{
    let budget = max_attempts.max(1);
    let mut attempt = 1;
    let mut delay = config.initial_delay;

    loop {
        match operation().await {
            Ok(result) => {
                if attempt > 1 {
                    tracing::info!(attempts = attempt, "Operation succeeded after retry");
                }
                return Ok(result);
            }
            Err(e) if e.is_retryable() && attempt < budget => {
                tracing::warn!(
                    error = %e,
                    attempt,
                    max_attempts = budget,
                    delay_ms = delay.as_millis(),
                    "Operation failed, retrying"
                );

                let jittered_delay = if config.jitter {
                    add_jitter(delay)
                } else {
                    delay
                };

                tokio::time::sleep(jittered_delay).await;

                let next_delay =
                    Duration::from_secs_f64(delay.as_secs_f64() * config.backoff_multiplier);
                delay = next_delay.min(config.max_delay);
                attempt += 1;
            }
            Err(e) => {
                if e.is_retryable() {
                    tracing::error!(
                        error = %e,
                        attempts = attempt,
                        "Operation failed after all retry attempts exhausted"
                    );
                } else {
                    tracing::error!(error = %e, "Operation failed with non-retryable error");
                }
                return Err(e);
            }
        }
    }
}

/// Add random jitter to a delay to prevent thundering herd
///
/// Jitter is uniformly distributed between 0% and 100% of the delay, so the
/// actual delay falls between `delay` and `2 * delay`.
fn add_jitter(delay: Duration) -> Duration {
    let mut rng = rand::thread_rng();
    let jitter_factor: f64 = rng.gen_range(0.0..=1.0);
    let jittered_secs = delay.as_secs_f64() * (1.0 + jitter_factor);
    Duration::from_secs_f64(jittered_secs)
}
