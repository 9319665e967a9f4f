//! Bounded retry with exponential backoff and per-attempt timeouts.
//!
//! Retries transient provider failures:
//! - Timeouts (including the per-attempt deadline enforced here)
//! - Connection errors
//! - 429 and 5xx responses
//!
//! It does NOT retry permanent failures (bad credentials, rejected requests,
//! malformed payloads); those are returned after the first attempt.

use std::future::Future;
use std::time::Duration;

use wxhub_core::RetryPolicySettings;

use crate::error::{ProviderError, ProviderResult};

/// Default retry configuration
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;
pub const DEFAULT_BASE_DELAY_MS: u64 = 250;
pub const DEFAULT_BACKOFF_MULTIPLIER: f64 = 2.0;
pub const DEFAULT_PER_ATTEMPT_TIMEOUT_MS: u64 = 3_000;
pub const DEFAULT_MAX_DELAY_MS: u64 = 2_000;

/// Retry policy for one provider
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts, including the first
    pub max_attempts: u32,
    /// Delay after the first failed attempt
    pub base_delay: Duration,
    /// Growth factor applied for each further failure
    pub backoff_multiplier: f64,
    /// Deadline for a single attempt
    pub per_attempt_timeout: Duration,
    /// Upper bound for any single backoff sleep
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            base_delay: Duration::from_millis(DEFAULT_BASE_DELAY_MS),
            backoff_multiplier: DEFAULT_BACKOFF_MULTIPLIER,
            per_attempt_timeout: Duration::from_millis(DEFAULT_PER_ATTEMPT_TIMEOUT_MS),
            max_delay: Duration::from_millis(DEFAULT_MAX_DELAY_MS),
        }
    }
}

impl From<&RetryPolicySettings> for RetryPolicy {
    fn from(settings: &RetryPolicySettings) -> Self {
        Self {
            max_attempts: settings.max_attempts.max(1),
            base_delay: Duration::from_millis(settings.base_delay_ms),
            backoff_multiplier: settings.backoff_multiplier.max(1.0),
            per_attempt_timeout: Duration::from_millis(settings.per_attempt_timeout_ms),
            max_delay: Duration::from_millis(settings.max_delay_ms),
        }
    }
}

impl RetryPolicy {
    /// Create a policy whose backoff sleeps are capped at `per_attempt_timeout`
    pub fn new(
        max_attempts: u32,
        base_delay: Duration,
        backoff_multiplier: f64,
        per_attempt_timeout: Duration,
    ) -> Self {
        Self {
            max_attempts,
            base_delay,
            backoff_multiplier,
            per_attempt_timeout,
            max_delay: per_attempt_timeout,
        }
    }

    /// A single timed attempt.
    pub fn single_attempt(per_attempt_timeout: Duration) -> Self {
        Self {
            max_attempts: 1,
            per_attempt_timeout,
            ..Self::default()
        }
    }

    /// Delay slept after failed attempt `attempt` (1-based):
    /// `base_delay * backoff_multiplier^(attempt - 1)`, capped at `max_delay`.
    pub fn delay_after_attempt(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1) as i32;
        let seconds = self.base_delay.as_secs_f64() * self.backoff_multiplier.powi(exponent);
        if !seconds.is_finite() || seconds >= self.max_delay.as_secs_f64() {
            return self.max_delay;
        }
        Duration::try_from_secs_f64(seconds)
            .map(|delay| delay.min(self.max_delay))
            .unwrap_or(self.max_delay)
    }

    /// Backoff before the next attempt, or `None` when the upstream asked
    /// for a longer wait than the schedule allows.
    fn delay_for_failure(&self, attempt: u32, error: &ProviderError) -> Option<Duration> {
        let delay = self.delay_after_attempt(attempt);
        match error {
            ProviderError::RateLimited {
                retry_after_secs: Some(secs),
            } if Duration::from_secs(*secs) > delay => None,
            _ => Some(delay),
        }
    }
}

/// Run a provider operation under `policy`.
///
/// # Arguments
/// * `policy` - Attempt count, backoff and per-attempt timeout
/// * `label` - Name used in log lines (e.g. `nws current`)
/// * `operation` - Closure producing one attempt
///
/// # Returns
/// The first success, the first permanent failure, or the last transient
/// failure once attempts are exhausted
pub async fn with_retry<T, F, Fut>(policy: &RetryPolicy, label: &str, mut operation: F) -> ProviderResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = ProviderResult<T>>,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 1;

    loop {
        let outcome = match tokio::time::timeout(policy.per_attempt_timeout, operation()).await {
            Ok(outcome) => outcome,
            Err(_) => {
                tracing::debug!(
                    "{} attempt {} exceeded {:?}",
                    label,
                    attempt,
                    policy.per_attempt_timeout
                );
                ProviderResult::TransientFailure(ProviderError::Timeout)
            }
        };

        match outcome {
            ProviderResult::Success(value) => {
                if attempt > 1 {
                    tracing::info!("{} succeeded after {} attempts", label, attempt);
                }
                return ProviderResult::Success(value);
            }
            ProviderResult::PermanentFailure(error) => {
                tracing::debug!("{} failed permanently: {}", label, error);
                return ProviderResult::PermanentFailure(error);
            }
            ProviderResult::TransientFailure(error) => {
                if attempt >= max_attempts {
                    tracing::warn!(
                        "{} exhausted {} attempt(s), last error: {}",
                        label,
                        max_attempts,
                        error
                    );
                    return ProviderResult::TransientFailure(error);
                }

                let Some(delay) = policy.delay_for_failure(attempt, &error) else {
                    tracing::warn!(
                        "{} rate limited beyond its backoff after attempt {}, giving up",
                        label,
                        attempt
                    );
                    return ProviderResult::TransientFailure(error);
                };
                tracing::warn!(
                    "{} attempt {} of {} failed ({}), retrying in {:?}",
                    label,
                    attempt,
                    max_attempts,
                    error,
                    delay
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;
    use tokio::time::Instant;

    fn policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy::new(
            max_attempts,
            Duration::from_millis(100),
            2.0,
            Duration::from_secs(1),
        )
    }

    #[test]
    fn test_delay_schedule() {
        let policy = policy(5);
        assert_eq!(policy.delay_after_attempt(1), Duration::from_millis(100));
        assert_eq!(policy.delay_after_attempt(2), Duration::from_millis(200));
        assert_eq!(policy.delay_after_attempt(3), Duration::from_millis(400));
    }

    #[test]
    fn test_delay_capped_at_max() {
        let policy = RetryPolicy {
            max_delay: Duration::from_millis(300),
            ..policy(5)
        };
        assert_eq!(policy.delay_after_attempt(3), Duration::from_millis(300));
        assert_eq!(policy.delay_after_attempt(10), Duration::from_millis(300));
    }

    #[test]
    fn test_from_settings_clamps_attempts() {
        let settings = RetryPolicySettings {
            max_attempts: 0,
            ..RetryPolicySettings::default()
        };
        assert_eq!(RetryPolicy::from(&settings).max_attempts, 1);
        assert_eq!(
            RetryPolicy::from(&RetryPolicySettings::default()),
            RetryPolicy::default()
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_failures_exhaust_attempts() {
        let calls = Arc::new(AtomicU32::new(0));
        let started = Instant::now();

        let result: ProviderResult<()> = with_retry(&policy(3), "test", || {
            let calls = Arc::clone(&calls);
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                ProviderResult::TransientFailure(ProviderError::Server { status: 503 })
            }
        })
        .await;

        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(
            result,
            ProviderResult::TransientFailure(ProviderError::Server { status: 503 })
        );
        // 100ms + 200ms of backoff, nothing else
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_millis(300), "elapsed {elapsed:?}");
        assert!(elapsed < Duration::from_millis(400), "elapsed {elapsed:?}");
    }

    #[tokio::test(start_paused = true)]
    async fn test_permanent_failure_is_not_retried() {
        let calls = Arc::new(AtomicU32::new(0));

        let result: ProviderResult<()> = with_retry(&policy(5), "test", || {
            let calls = Arc::clone(&calls);
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                ProviderResult::PermanentFailure(ProviderError::InvalidCredentials)
            }
        })
        .await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(
            result,
            ProviderResult::PermanentFailure(ProviderError::InvalidCredentials)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_after_transient_failure() {
        let calls = Arc::new(AtomicU32::new(0));

        let result = with_retry(&policy(3), "test", || {
            let calls = Arc::clone(&calls);
            async move {
                if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                    ProviderResult::TransientFailure(ProviderError::Connection("reset".into()))
                } else {
                    ProviderResult::Success(42)
                }
            }
        })
        .await;

        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(result, ProviderResult::Success(42));
    }

    #[tokio::test(start_paused = true)]
    async fn test_single_attempt_policy_does_not_retry() {
        let calls = Arc::new(AtomicU32::new(0));
        let started = Instant::now();

        let result: ProviderResult<()> =
            with_retry(&RetryPolicy::single_attempt(Duration::from_secs(1)), "test", || {
                let calls = Arc::clone(&calls);
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    ProviderResult::TransientFailure(ProviderError::Timeout)
                }
            })
            .await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(matches!(result, ProviderResult::TransientFailure(_)));
        assert!(started.elapsed() < Duration::from_millis(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_attempt_times_out() {
        let calls = Arc::new(AtomicU32::new(0));

        let result = with_retry(&policy(2), "test", || {
            let calls = Arc::clone(&calls);
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_secs(10)).await;
                ProviderResult::Success(())
            }
        })
        .await;

        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(result, ProviderResult::TransientFailure(ProviderError::Timeout));
    }

    #[tokio::test(start_paused = true)]
    async fn test_long_retry_after_stops_retrying() {
        let calls = Arc::new(AtomicU32::new(0));
        let started = Instant::now();

        let result: ProviderResult<()> = with_retry(&policy(3), "test", || {
            let calls = Arc::clone(&calls);
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                ProviderResult::TransientFailure(ProviderError::RateLimited {
                    retry_after_secs: Some(3600),
                })
            }
        })
        .await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(
            result,
            ProviderResult::TransientFailure(ProviderError::RateLimited {
                retry_after_secs: Some(3600)
            })
        );
        assert!(started.elapsed() < Duration::from_millis(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_short_retry_after_keeps_backoff_schedule() {
        let policy = RetryPolicy::new(2, Duration::from_secs(2), 2.0, Duration::from_secs(5));
        let calls = Arc::new(AtomicU32::new(0));
        let started = Instant::now();

        let _: ProviderResult<()> = with_retry(&policy, "test", || {
            let calls = Arc::clone(&calls);
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                ProviderResult::TransientFailure(ProviderError::RateLimited {
                    retry_after_secs: Some(1),
                })
            }
        })
        .await;

        assert_eq!(calls.load(Ordering::SeqCst), 2);
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_secs(2), "elapsed {elapsed:?}");
        assert!(elapsed < Duration::from_secs(3), "elapsed {elapsed:?}");
    }

    #[test]
    fn test_new_caps_backoff_at_attempt_timeout() {
        let policy = RetryPolicy::new(10, Duration::from_millis(100), 2.0, Duration::from_secs(1));
        assert_eq!(policy.max_delay, Duration::from_secs(1));
        assert_eq!(policy.delay_after_attempt(8), Duration::from_secs(1));
    }
}
