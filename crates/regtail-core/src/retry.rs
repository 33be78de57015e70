//! Retry with exponential backoff.
//!
//! Provides the retry policy for registry requests. Catch-up workers keep a
//! [`RetryBudget`] per block that is refilled whenever an attempt makes
//! progress; the probe uses [`with_smart_retry`] directly.
//!
//! # Usage
//!
//! ```rust,ignore
//! use regtail_core::retry::{RetryPolicy, with_smart_retry};
//!
//! let policy = RetryPolicy::probe(5);
//!
//! let outcome = with_smart_retry(&policy, || async {
//!     client.update_seq().await.map_err(Into::into)
//! }).await;
//! let seq = outcome.result?;
//! ```

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tracing::{debug, warn};

use crate::error::{Error, FetchError, Result};

/// Configuration for retry behavior with exponential backoff.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Initial delay before first retry (default: 250ms).
    pub initial_delay: Duration,
    /// Maximum delay between retries (default: 30s).
    pub max_delay: Duration,
    /// Multiplier applied to delay after each retry (default: 2.0).
    pub backoff_factor: f64,
    /// Random jitter range as percentage (default: 0.1 = ±10%).
    pub jitter_percent: f64,
    /// Maximum number of attempts. None = retry forever.
    pub max_attempts: Option<u32>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(30),
            backoff_factor: 2.0,
            jitter_percent: 0.1,
            max_attempts: Some(3),
        }
    }
}

impl RetryPolicy {
    /// Create a new retry policy with the specified parameters.
    #[must_use]
    pub fn new(
        initial_delay: Duration,
        max_delay: Duration,
        backoff_factor: f64,
        jitter_percent: f64,
        max_attempts: Option<u32>,
    ) -> Self {
        Self {
            initial_delay,
            max_delay,
            backoff_factor: backoff_factor.max(1.0),
            jitter_percent: jitter_percent.clamp(0.0, 1.0),
            max_attempts,
        }
    }

    /// Policy for the remote sequence probe: `max_retries` retries after the
    /// first attempt, 500ms initial.
    #[must_use]
    pub fn probe(max_retries: u32) -> Self {
        Self {
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(10),
            backoff_factor: 2.0,
            jitter_percent: 0.1,
            max_attempts: Some(max_retries.saturating_add(1)),
        }
    }

    /// Policy for catch-up block fetches: `max_retries` consecutive
    /// attempts without progress, 250ms initial.
    #[must_use]
    pub fn block_fetch(max_retries: u32) -> Self {
        Self {
            initial_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(15),
            backoff_factor: 2.0,
            jitter_percent: 0.1,
            max_attempts: Some(max_retries.saturating_add(1)),
        }
    }

    /// Policy for live-tail reconnects: unbounded, starting at `tail_delay`.
    #[must_use]
    pub fn live_tail(tail_delay: Duration) -> Self {
        Self {
            initial_delay: tail_delay,
            max_delay: tail_delay.max(Duration::from_secs(30)),
            backoff_factor: 2.0,
            jitter_percent: 0.1,
            max_attempts: None,
        }
    }

    /// Calculate the delay for a given attempt number (0-indexed).
    #[must_use]
    #[allow(clippy::cast_precision_loss)] // ms values are well within f64 precision for delays
    #[allow(clippy::cast_possible_wrap)] // attempt is capped at 31, safe for i32
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let initial_ms = u64::try_from(self.initial_delay.as_millis()).unwrap_or(u64::MAX);
        let max_ms = u64::try_from(self.max_delay.as_millis()).unwrap_or(u64::MAX);

        // Cap exponent to prevent overflow in powi
        let exp = attempt.min(31) as i32;
        let base_ms = (initial_ms as f64) * self.backoff_factor.powi(exp);
        let base_ms = base_ms.min(max_ms as f64);

        let jitter = if self.jitter_percent > 0.0 && base_ms > 0.0 {
            let mut rng = rand::rng();
            let jitter_range = base_ms * self.jitter_percent;
            rng.random_range(-jitter_range..=jitter_range)
        } else {
            0.0
        };

        let delay_ms = (base_ms + jitter).max(0.0);
        Duration::from_millis(delay_ms as u64)
    }

    fn exhausted(&self, attempts: u32) -> bool {
        self.max_attempts.is_some_and(|max| attempts >= max)
    }
}

/// Outcome of a retry operation.
#[derive(Debug)]
pub struct RetryOutcome<T> {
    /// The result (success or final error).
    pub result: Result<T>,
    /// Number of attempts made.
    pub attempts: u32,
    /// Total time spent (including delays).
    pub elapsed: Duration,
}

/// Execute an operation with smart retry (only retries if error is
/// retryable), returning the detailed outcome.
pub async fn with_smart_retry<T, F, Fut>(policy: &RetryPolicy, mut operation: F) -> RetryOutcome<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let start = tokio::time::Instant::now();
    let mut attempt = 0u32;

    loop {
        match operation().await {
            Ok(value) => {
                if attempt > 0 {
                    debug!(
                        total_attempts = attempt + 1,
                        retries = attempt,
                        "Operation succeeded after retries"
                    );
                }
                return RetryOutcome {
                    result: Ok(value),
                    attempts: attempt + 1,
                    elapsed: start.elapsed(),
                };
            }
            Err(e) => {
                attempt += 1;

                if !is_retryable(&e) {
                    debug!(attempt, error = %e, "Non-retryable error, giving up");
                    return RetryOutcome {
                        result: Err(e),
                        attempts: attempt,
                        elapsed: start.elapsed(),
                    };
                }

                if policy.exhausted(attempt) {
                    warn!(
                        attempt,
                        max_attempts = policy.max_attempts,
                        error = %e,
                        "Operation failed after all retry attempts"
                    );
                    return RetryOutcome {
                        result: Err(e),
                        attempts: attempt,
                        elapsed: start.elapsed(),
                    };
                }

                let delay = policy.delay_for_attempt(attempt - 1);
                debug!(
                    attempt,
                    delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                    error = %e,
                    "Retrying operation after failure"
                );

                tokio::time::sleep(delay).await;
            }
        }
    }
}

/// Consecutive-failure counter for work that can make partial progress.
///
/// Each failed attempt is charged with [`RetryBudget::charge`]; an attempt
/// that moved forward calls [`RetryBudget::refill`].
#[derive(Debug, Clone)]
pub struct RetryBudget {
    policy: RetryPolicy,
    consecutive: u32,
}

impl RetryBudget {
    #[must_use]
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            policy,
            consecutive: 0,
        }
    }

    /// Record a failed attempt. Returns the backoff to apply before the next
    /// attempt, or `None` once the budget is spent.
    pub fn charge(&mut self) -> Option<Duration> {
        self.consecutive += 1;
        if self.policy.exhausted(self.consecutive) {
            return None;
        }
        Some(self.policy.delay_for_attempt(self.consecutive - 1))
    }

    pub fn refill(&mut self) {
        self.consecutive = 0;
    }

    /// Failed attempts since the last refill.
    #[must_use]
    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive
    }
}

/// Check if an error is retryable.
///
/// Transient network failures are; configuration, persistence and protocol
/// errors are not.
#[must_use]
pub fn is_retryable(error: &Error) -> bool {
    match error {
        Error::Fetch(e) => is_retryable_fetch(e),
        Error::Io(_) | Error::Runtime(_) => true,
        // Persistence failures are fatal for the synchronizer
        Error::Storage(_) => false,
        Error::Config(_) | Error::Json(_) => false,
        Error::RetriesExhausted { .. } | Error::Cancelled(_) => false,
    }
}

/// Fetch-level classification. 429 is retryable; callers penalize the
/// scheduler instead of charging a budget.
#[must_use]
pub fn is_retryable_fetch(error: &FetchError) -> bool {
    match error {
        FetchError::RateLimited => true,
        FetchError::Transport(_) | FetchError::Timeout => true,
        FetchError::Status(code) => *code >= 500 || *code == 408,
        FetchError::NotFound => false,
        FetchError::Decode(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StorageError;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast(max_attempts: Option<u32>) -> RetryPolicy {
        RetryPolicy::new(
            Duration::from_millis(10),
            Duration::from_millis(100),
            2.0,
            0.0,
            max_attempts,
        )
    }

    #[test]
    fn delay_grows_and_caps() {
        let policy = fast(Some(10));
        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(10));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(20));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_millis(80));
        assert_eq!(policy.delay_for_attempt(8), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(500), Duration::from_millis(100));
    }

    #[test]
    fn jitter_stays_in_range() {
        let policy = RetryPolicy::new(
            Duration::from_millis(1000),
            Duration::from_secs(10),
            2.0,
            0.1,
            Some(3),
        );
        for _ in 0..100 {
            let delay = policy.delay_for_attempt(0).as_millis();
            assert!((900..=1100).contains(&delay), "delay {delay}");
        }
    }

    #[test]
    fn presets_translate_retries_to_attempts() {
        assert_eq!(RetryPolicy::probe(4).max_attempts, Some(5));
        assert_eq!(RetryPolicy::block_fetch(0).max_attempts, Some(1));
        assert_eq!(
            RetryPolicy::live_tail(Duration::from_secs(1)).max_attempts,
            None
        );
    }

    #[tokio::test(start_paused = true)]
    async fn succeeds_after_transient_failures() {
        let calls = Arc::new(AtomicU32::new(0));
        let outcome = with_smart_retry(&fast(Some(5)), || {
            let calls = Arc::clone(&calls);
            async move {
                if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(Error::Fetch(FetchError::Timeout))
                } else {
                    Ok(7)
                }
            }
        })
        .await;
        assert_eq!(outcome.result.unwrap(), 7);
        assert_eq!(outcome.attempts, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn gives_up_at_max_attempts() {
        let calls = Arc::new(AtomicU32::new(0));
        let outcome: RetryOutcome<()> = with_smart_retry(&fast(Some(3)), || {
            let calls = Arc::clone(&calls);
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(Error::Fetch(FetchError::Status(503)))
            }
        })
        .await;
        assert!(outcome.result.is_err());
        assert_eq!(outcome.attempts, 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn smart_retry_stops_on_permanent_error() {
        let calls = Arc::new(AtomicU32::new(0));
        let outcome: RetryOutcome<()> = with_smart_retry(&fast(Some(5)), || {
            let calls = Arc::clone(&calls);
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(Error::Fetch(FetchError::NotFound))
            }
        })
        .await;
        assert!(outcome.result.is_err());
        assert_eq!(outcome.attempts, 1);
    }

    #[test]
    fn budget_refills_on_progress() {
        let mut budget = RetryBudget::new(fast(Some(3)));
        assert!(budget.charge().is_some());
        assert!(budget.charge().is_some());
        budget.refill();
        assert_eq!(budget.consecutive_failures(), 0);
        assert!(budget.charge().is_some());
        assert!(budget.charge().is_some());
        assert!(budget.charge().is_none());
    }

    #[test]
    fn classification() {
        assert!(is_retryable(&Error::Fetch(FetchError::Transport("reset".into()))));
        assert!(is_retryable(&Error::Fetch(FetchError::Status(502))));
        assert!(!is_retryable(&Error::Fetch(FetchError::Status(400))));
        assert!(!is_retryable(&Error::Fetch(FetchError::NotFound)));
        assert!(!is_retryable(&Error::Storage(StorageError::Closed)));
        assert!(!is_retryable(&Error::Cancelled("stop".into())));
        assert!(is_retryable_fetch(&FetchError::RateLimited));
    }
}
