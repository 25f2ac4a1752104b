//! Bounded exponential backoff for token refresh
//!
//! Only failures `device_auth::Error::is_transient()` accepts are retried.
//! A server that rejected the refresh token will reject it again, so those
//! fail on first occurrence.

use std::future::Future;
use std::time::Duration;

use device_auth::Clock;
use tracing::warn;

/// Retry schedule: `max_attempts` tries, waiting `base_delay * 2^(n-1)`
/// after the n-th failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
        }
    }
}

impl RetryPolicy {
    /// Delay after the given failed attempt (1-based).
    pub fn delay_after(&self, attempt: u32) -> Duration {
        self.base_delay * 2u32.saturating_pow(attempt.saturating_sub(1))
    }

    /// Run `op` until it succeeds, fails terminally, or attempts run out.
    ///
    /// `op` receives the 1-based attempt number. Waiting goes through `clock`.
    pub async fn run<T, F, Fut>(&self, clock: &dyn Clock, mut op: F) -> device_auth::Result<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = device_auth::Result<T>>,
    {
        let mut attempt = 1;
        loop {
            match op(attempt).await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_transient() && attempt < self.max_attempts => {
                    let delay = self.delay_after(attempt);
                    warn!(
                        attempt,
                        max_attempts = self.max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "transient refresh failure, retrying"
                    );
                    clock.sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use device_auth::{Error, ManualClock};
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn delays_double_from_base() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay_after(1), Duration::from_secs(1));
        assert_eq!(policy.delay_after(2), Duration::from_secs(2));
        assert_eq!(policy.delay_after(3), Duration::from_secs(4));
    }

    #[tokio::test]
    async fn three_network_failures_give_up_after_three_attempts() {
        let clock = ManualClock::new(0);
        let counter = AtomicU32::new(0);
        let attempts = &counter;

        let result: device_auth::Result<()> = RetryPolicy::default()
            .run(&clock, move |_| async move {
                attempts.fetch_add(1, Ordering::SeqCst);
                Err(Error::Http("connection refused".into()))
            })
            .await;

        assert!(matches!(result, Err(Error::Http(_))));
        assert_eq!(counter.load(Ordering::SeqCst), 3);
        assert_eq!(
            clock.sleeps(),
            vec![Duration::from_secs(1), Duration::from_secs(2)]
        );
    }

    #[tokio::test]
    async fn invalid_grant_fails_immediately() {
        let clock = ManualClock::new(0);
        let counter = AtomicU32::new(0);
        let attempts = &counter;

        let result: device_auth::Result<()> = RetryPolicy::default()
            .run(&clock, move |_| async move {
                attempts.fetch_add(1, Ordering::SeqCst);
                Err(Error::TokenRejected {
                    status: 400,
                    code: "invalid_grant".into(),
                    message: "refresh token revoked".into(),
                })
            })
            .await;

        assert!(result.unwrap_err().requires_login());
        assert_eq!(counter.load(Ordering::SeqCst), 1);
        assert!(clock.sleeps().is_empty());
    }

    #[tokio::test]
    async fn recovers_after_one_transient_failure() {
        let clock = ManualClock::new(0);

        let result = RetryPolicy::default()
            .run(&clock, |attempt| async move {
                if attempt == 1 {
                    Err(Error::TokenRejected {
                        status: 503,
                        code: "temporarily_unavailable".into(),
                        message: "maintenance".into(),
                    })
                } else {
                    Ok(attempt)
                }
            })
            .await;

        assert_eq!(result.unwrap(), 2);
        assert_eq!(clock.sleeps(), vec![Duration::from_secs(1)]);
    }
}
