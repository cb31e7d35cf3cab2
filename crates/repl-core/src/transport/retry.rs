//! Transport retry envelope with exponential backoff.
//!
//! Every query and write goes through `with_retry`: up to `retries`
//! attempts, base delay doubling per attempt, jitter to avoid thundering
//! herds against a recovering endpoint. Only `ReplicatorError::is_retryable`
//! errors are retried; dialect-level errors (4xx, malformed JSON) surface on
//! the first attempt. Cancellation is checked between attempts.

use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::error::ReplicatorError;

#[derive(Debug, Clone, Copy)]
pub struct ExponentialBackoff {
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub jitter: f64,
}

impl ExponentialBackoff {
    pub fn new(base_delay: Duration) -> Self {
        Self {
            base_delay,
            max_delay: Duration::from_secs(3600),
            jitter: 0.1,
        }
    }

    /// `delay × 2^attempt`, capped at `max_delay`, jittered by ±`jitter`
    /// fraction.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exp = self.base_delay.as_secs_f64() * 2f64.powi(attempt as i32);
        let capped = exp.min(self.max_delay.as_secs_f64());

        let jittered = if self.jitter > 0.0 {
            use rand::Rng;
            let range = capped * self.jitter;
            let delta = rand::thread_rng().gen_range(-range..=range);
            (capped + delta).max(0.0)
        } else {
            capped
        };

        Duration::from_secs_f64(jittered)
    }
}

/// Retry an async operation up to `retries` additional attempts beyond the
/// first, per the transport error taxonomy. Returns the number of retries
/// actually performed alongside the result, so callers can record it in
/// `JobStats`.
pub async fn with_retry<T, F, Fut>(
    retries: u32,
    backoff: ExponentialBackoff,
    cancel: &CancellationToken,
    mut op: F,
) -> (Result<T, ReplicatorError>, u32)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, ReplicatorError>>,
{
    let mut attempt = 0;
    loop {
        if cancel.is_cancelled() {
            return (Err(ReplicatorError::Cancelled), attempt);
        }

        match op().await {
            Ok(value) => return (Ok(value), attempt),
            Err(err) => {
                if !err.is_retryable() || attempt >= retries {
                    return (Err(err), attempt);
                }

                let delay = backoff.delay_for(attempt);
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = cancel.cancelled() => return (Err(ReplicatorError::Cancelled), attempt),
                }
                attempt += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn backoff_doubles_without_jitter() {
        let backoff = ExponentialBackoff {
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(3600),
            jitter: 0.0,
        };
        assert_eq!(backoff.delay_for(0), Duration::from_secs(1));
        assert_eq!(backoff.delay_for(1), Duration::from_secs(2));
        assert_eq!(backoff.delay_for(2), Duration::from_secs(4));
    }

    #[test]
    fn backoff_caps_at_max_delay() {
        let backoff = ExponentialBackoff {
            base_delay: Duration::from_secs(1000),
            max_delay: Duration::from_secs(3600),
            jitter: 0.0,
        };
        assert_eq!(backoff.delay_for(5), Duration::from_secs(3600));
    }

    #[tokio::test(start_paused = true)]
    async fn retries_until_success_within_budget() {
        let attempts = AtomicU32::new(0);
        let cancel = CancellationToken::new();
        let backoff = ExponentialBackoff::new(Duration::from_millis(1));

        let (result, retry_count) = with_retry(3, backoff, &cancel, || {
            let n = attempts.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 1 {
                    Err(ReplicatorError::connection("503"))
                } else {
                    Ok(42)
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(retry_count, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn non_retryable_error_surfaces_immediately() {
        let cancel = CancellationToken::new();
        let backoff = ExponentialBackoff::new(Duration::from_millis(1));

        let (result, retry_count): (Result<(), ReplicatorError>, u32) =
            with_retry(3, backoff, &cancel, || async {
                Err(ReplicatorError::query("400 bad request"))
            })
            .await;

        assert!(result.is_err());
        assert_eq!(retry_count, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn exhausting_retries_surfaces_last_error() {
        let cancel = CancellationToken::new();
        let backoff = ExponentialBackoff::new(Duration::from_millis(1));

        let (result, retry_count): (Result<(), ReplicatorError>, u32) =
            with_retry(0, backoff, &cancel, || async {
                Err(ReplicatorError::connection("still down"))
            })
            .await;

        assert!(result.is_err());
        assert_eq!(retry_count, 0);
    }
}
