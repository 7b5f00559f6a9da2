//! Inline retries for cluster API calls that fail transiently.

use std::future::Future;
use std::time::Duration;

use ngc_cluster::ApiError;
use rand::Rng;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

#[derive(Clone, Debug)]
pub struct RetryConfig {
    /// Attempts including the first one
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl RetryConfig {
    pub fn with_max_attempts(attempts: u32) -> Self {
        Self {
            max_attempts: attempts.max(1),
            ..Default::default()
        }
    }

    pub fn no_delay(attempts: u32) -> Self {
        Self {
            max_attempts: attempts.max(1),
            initial_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
        }
    }
}

/// Run `operation` until it succeeds, fails with a non-transient error, runs
/// out of attempts, or `token` is cancelled. Delays grow exponentially with
/// 0.5x..1.5x jitter.
pub async fn retry_transient<F, Fut, T>(
    config: &RetryConfig,
    operation_name: &str,
    token: &CancellationToken,
    mut operation: F,
) -> Result<T, ApiError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, ApiError>>,
{
    let mut attempt = 0u32;
    let mut delay = config.initial_delay;

    loop {
        attempt += 1;
        let err = match operation().await {
            Ok(v) => return Ok(v),
            Err(e) => e,
        };
        if !err.is_transient() || attempt >= config.max_attempts || token.is_cancelled() {
            debug!(operation = %operation_name, attempt, error = %err, "giving up");
            return Err(err);
        }

        let jitter = rand::rng().random_range(0.5..1.5);
        let wait = Duration::from_secs_f64(delay.as_secs_f64() * jitter);
        warn!(
            operation = %operation_name,
            attempt,
            error = %err,
            delay_ms = wait.as_millis() as u64,
            "transient failure, retrying"
        );
        tokio::select! {
            _ = token.cancelled() => return Err(err),
            _ = tokio::time::sleep(wait) => {}
        }
        delay = (delay * 2).min(config.max_delay);
    }
}
