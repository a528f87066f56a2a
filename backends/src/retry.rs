use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use rand::Rng;

/// Configuration for retry behavior with exponential backoff
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of attempts, including the first one
    pub max_attempts: u32,
    /// Initial backoff duration
    pub initial_backoff: Duration,
    /// Maximum backoff duration
    pub max_backoff: Duration,
    /// Multiplier for exponential backoff
    pub backoff_multiplier: f64,
    /// Add jitter to prevent thundering herd
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(30),
            backoff_multiplier: 2.0,
            jitter: true,
        }
    }
}

impl RetryConfig {
    /// Fewer, shorter retries for cheap metadata calls
    pub fn quick() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(50),
            max_backoff: Duration::from_secs(5),
            ..Default::default()
        }
    }

    /// More retries for uploads and server-side copies
    pub fn persistent() -> Self {
        Self {
            max_attempts: 10,
            initial_backoff: Duration::from_millis(200),
            max_backoff: Duration::from_secs(60),
            ..Default::default()
        }
    }

    /// A single attempt
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            ..Default::default()
        }
    }

    fn backoff_duration(&self, attempt: u32) -> Duration {
        let base_duration = self.initial_backoff.as_millis() as f64
            * self.backoff_multiplier.powi(attempt as i32);

        let duration_ms = base_duration.min(self.max_backoff.as_millis() as f64) as u64;
        let mut duration = Duration::from_millis(duration_ms);

        // 0-25% jitter
        if self.jitter {
            let jitter_ms = rand::thread_rng().gen_range(0..=(duration_ms / 4));
            duration += Duration::from_millis(jitter_ms);
        }

        duration
    }
}

/// Trait to determine if an error is retryable
pub trait Retryable {
    fn is_retryable(&self) -> bool;

    /// Error reported when the caller cancels the operation
    fn cancelled() -> Self;
}

impl Retryable for debpool_core::Error {
    fn is_retryable(&self) -> bool {
        use debpool_core::Error;

        match self {
            Error::Io(e) => !matches!(
                e.kind(),
                std::io::ErrorKind::NotFound
                    | std::io::ErrorKind::PermissionDenied
                    | std::io::ErrorKind::AlreadyExists
            ),
            Error::Backend(msg) => {
                let msg = msg.to_ascii_lowercase();
                msg.contains("timeout")
                    || msg.contains("timed out")
                    || msg.contains("rate limit")
                    || msg.contains("throttl")
                    || msg.contains("slowdown")
                    || msg.contains("temporarily unavailable")
                    || msg.contains("try again")
                    || msg.contains("connection")
                    || msg.contains("dispatch failure")
                    || msg.contains("500")
                    || msg.contains("502")
                    || msg.contains("503")
                    || msg.contains("504")
                    || msg.contains("429")
            }
            // Conflicts, missing objects, bad input and cancellation are final
            _ => false,
        }
    }

    fn cancelled() -> Self {
        debpool_core::Error::Cancelled
    }
}

/// Retry a future operation with exponential backoff.
///
/// Cancelling `cancel` aborts the in-flight attempt and any pending backoff.
pub async fn retry_with_backoff<F, Fut, T, E>(
    config: &RetryConfig,
    operation_name: &str,
    cancel: &CancellationToken,
    mut operation: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Retryable + std::fmt::Display,
{
    let max_attempts = config.max_attempts.max(1);
    let mut attempt = 0;

    loop {
        let outcome = tokio::select! {
            _ = cancel.cancelled() => return Err(E::cancelled()),
            outcome = operation() => outcome,
        };

        let error = match outcome {
            Ok(result) => {
                if attempt > 0 {
                    debug!(
                        operation = operation_name,
                        attempt = attempt + 1,
                        "Operation succeeded after retry"
                    );
                }
                return Ok(result);
            }
            Err(error) => error,
        };

        if !error.is_retryable() {
            debug!(
                operation = operation_name,
                error = %error,
                "Error is not retryable, failing immediately"
            );
            return Err(error);
        }

        attempt += 1;
        if attempt >= max_attempts {
            warn!(
                operation = operation_name,
                max_attempts,
                error = %error,
                "Operation failed after all retry attempts"
            );
            return Err(error);
        }

        let backoff = config.backoff_duration(attempt - 1);
        warn!(
            operation = operation_name,
            attempt,
            max_attempts,
            backoff_ms = backoff.as_millis(),
            error = %error,
            "Operation failed, retrying after backoff"
        );
        tokio::select! {
            _ = cancel.cancelled() => return Err(E::cancelled()),
            _ = sleep(backoff) => {}
        }
    }
}
