//! Retry/backoff decisions and poison-pill detection.

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use docflow_core::DocumentId;

use super::types::QueueJob;

pub const POISON_PILL_REASON: &str = "Poison pill detected";

/// Exponential backoff: `min(initial * 2^(attempt - 1), max)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial_backoff: Duration::from_millis(5_000),
            max_backoff: Duration::from_millis(300_000),
        }
    }
}

impl RetryPolicy {
    pub fn new(initial_backoff: Duration, max_backoff: Duration) -> Self {
        Self {
            initial_backoff,
            max_backoff,
        }
    }

    /// Delay before retry number `attempt` (1-indexed).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        let exponent = (attempt - 1).min(31);
        self.initial_backoff
            .saturating_mul(1u32 << exponent)
            .min(self.max_backoff)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoisonPillPolicy {
    /// Failures within `window` that mark a document as poison.
    pub threshold: u32,
    pub window: Duration,
}

impl Default for PoisonPillPolicy {
    fn default() -> Self {
        Self {
            threshold: 3,
            window: Duration::from_millis(60_000),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DeadLetterCause {
    PoisonPill,
    NonRetryable,
    ExhaustedRetries,
}

/// What to do with a job whose attempt just failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureDecision {
    Retry {
        next_attempt: u32,
        delay: Duration,
        retry_at: DateTime<Utc>,
    },
    DeadLetter {
        cause: DeadLetterCause,
        reason: String,
    },
}

#[derive(Debug, Clone, Copy)]
struct FailureWindow {
    count: u32,
    first_failure_at: DateTime<Utc>,
}

/// Per-process retry controller.
///
/// Owns the poison-pill failure windows for the documents this process has
/// seen fail. The map is private to one worker instance; other processes keep
/// their own.
#[derive(Debug, Default)]
pub struct RetryController {
    policy: RetryPolicy,
    poison_pill: PoisonPillPolicy,
    failures: Mutex<HashMap<DocumentId, FailureWindow>>,
}

impl RetryController {
    pub fn new(policy: RetryPolicy, poison_pill: PoisonPillPolicy) -> Self {
        Self {
            policy,
            poison_pill,
            failures: Mutex::new(HashMap::new()),
        }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Route a failed attempt.
    ///
    /// Checks run in order: poison pill, non-retryable error, attempt budget.
    /// `job.attempt_count` is the attempt that just failed (claims increment it).
    pub fn on_failure(
        &self,
        job: &QueueJob,
        error: &str,
        retryable: bool,
        now: DateTime<Utc>,
    ) -> FailureDecision {
        let window = self.record_failure(job.document_id, now);
        let within_window = chrono::Duration::from_std(self.poison_pill.window)
            .is_ok_and(|w| now - window.first_failure_at <= w);

        if window.count >= self.poison_pill.threshold && within_window {
            return FailureDecision::DeadLetter {
                cause: DeadLetterCause::PoisonPill,
                reason: POISON_PILL_REASON.to_string(),
            };
        }

        if !retryable {
            return FailureDecision::DeadLetter {
                cause: DeadLetterCause::NonRetryable,
                reason: format!("Non-retryable failure: {error}"),
            };
        }

        let next_attempt = job.attempt_count.max(1);
        if next_attempt >= job.max_attempts {
            return FailureDecision::DeadLetter {
                cause: DeadLetterCause::ExhaustedRetries,
                reason: format!("Max attempts ({}) reached: {error}", job.max_attempts),
            };
        }

        let delay = self.policy.delay_for_attempt(next_attempt);
        let retry_at = chrono::Duration::from_std(delay)
            .ok()
            .and_then(|d| now.checked_add_signed(d))
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        FailureDecision::Retry {
            next_attempt,
            delay,
            retry_at,
        }
    }

    /// Forget failures for a document that just succeeded.
    pub fn on_success(&self, document_id: DocumentId) {
        self.failures
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&document_id);
    }

    /// Failures currently tracked for `document_id`.
    pub fn failure_count(&self, document_id: DocumentId) -> u32 {
        self.failures
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&document_id)
            .map_or(0, |w| w.count)
    }

    fn record_failure(&self, document_id: DocumentId, now: DateTime<Utc>) -> FailureWindow {
        let window = chrono::Duration::from_std(self.poison_pill.window)
            .unwrap_or(chrono::Duration::MAX);
        let mut failures = self.failures.lock().unwrap_or_else(PoisonError::into_inner);

        // Windows that have expired no longer say anything about a document.
        failures.retain(|_, w| now - w.first_failure_at <= window);

        let entry = failures.entry(document_id).or_insert(FailureWindow {
            count: 0,
            first_failure_at: now,
        });
        entry.count += 1;
        *entry
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::types::{JobType, NewJob};
    use docflow_core::TenantId;
    use proptest::prelude::*;

    fn controller(max_backoff_ms: u64) -> RetryController {
        RetryController::new(
            RetryPolicy::new(
                Duration::from_millis(5_000),
                Duration::from_millis(max_backoff_ms),
            ),
            PoisonPillPolicy {
                threshold: 3,
                window: Duration::from_millis(60_000),
            },
        )
    }

    fn claimed_job(attempt_count: u32, max_attempts: u32) -> QueueJob {
        let mut job = NewJob::new(TenantId::new(), DocumentId::new(), JobType::Analysis)
            .with_max_attempts(max_attempts)
            .into_job(Utc::now());
        job.attempt_count = attempt_count;
        job
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let policy = RetryPolicy::new(Duration::from_millis(5_000), Duration::from_millis(300_000));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(5_000));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(10_000));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_millis(20_000));
        assert_eq!(policy.delay_for_attempt(7), Duration::from_millis(300_000));
        assert_eq!(policy.delay_for_attempt(40), Duration::from_millis(300_000));
    }

    #[test]
    fn three_attempt_budget_retries_twice_then_dead_letters() {
        let ctl = controller(300_000);
        let now = Utc::now();

        let first = claimed_job(1, 3);
        match ctl.on_failure(&first, "timeout", true, now) {
            FailureDecision::Retry {
                next_attempt,
                delay,
                retry_at,
            } => {
                assert_eq!(next_attempt, 1);
                assert_eq!(delay, Duration::from_millis(5_000));
                assert_eq!(retry_at, now + chrono::Duration::milliseconds(5_000));
            }
            other => panic!("expected retry, got {other:?}"),
        }

        // Separate documents so the poison-pill window does not interfere.
        let second = claimed_job(2, 3);
        match ctl.on_failure(&second, "timeout", true, now) {
            FailureDecision::Retry { delay, .. } => {
                assert_eq!(delay, Duration::from_millis(10_000))
            }
            other => panic!("expected retry, got {other:?}"),
        }

        let third = claimed_job(3, 3);
        assert_eq!(
            ctl.on_failure(&third, "timeout", true, now),
            FailureDecision::DeadLetter {
                cause: DeadLetterCause::ExhaustedRetries,
                reason: "Max attempts (3) reached: timeout".into(),
            }
        );
    }

    #[test]
    fn repeated_failures_of_one_document_are_poison() {
        let ctl = controller(300_000);
        let now = Utc::now();
        let mut job = claimed_job(1, 5);

        assert!(matches!(
            ctl.on_failure(&job, "boom", true, now),
            FailureDecision::Retry { .. }
        ));
        job.attempt_count = 2;
        assert!(matches!(
            ctl.on_failure(&job, "boom", true, now + chrono::Duration::seconds(10)),
            FailureDecision::Retry { .. }
        ));
        job.attempt_count = 3;
        assert_eq!(
            ctl.on_failure(&job, "boom", true, now + chrono::Duration::seconds(20)),
            FailureDecision::DeadLetter {
                cause: DeadLetterCause::PoisonPill,
                reason: POISON_PILL_REASON.into(),
            }
        );
    }

    #[test]
    fn failures_outside_the_window_start_a_new_count() {
        let ctl = controller(300_000);
        let now = Utc::now();
        let job = claimed_job(1, 10);

        ctl.on_failure(&job, "boom", true, now);
        ctl.on_failure(&job, "boom", true, now + chrono::Duration::seconds(30));
        assert_eq!(ctl.failure_count(job.document_id), 2);

        let later = now + chrono::Duration::seconds(90);
        assert!(matches!(
            ctl.on_failure(&job, "boom", true, later),
            FailureDecision::Retry { .. }
        ));
        assert_eq!(ctl.failure_count(job.document_id), 1);
    }

    #[test]
    fn success_clears_the_failure_window() {
        let ctl = controller(300_000);
        let now = Utc::now();
        let job = claimed_job(1, 10);

        ctl.on_failure(&job, "boom", true, now);
        ctl.on_failure(&job, "boom", true, now);
        ctl.on_success(job.document_id);
        assert_eq!(ctl.failure_count(job.document_id), 0);

        assert!(matches!(
            ctl.on_failure(&job, "boom", true, now),
            FailureDecision::Retry { .. }
        ));
    }

    #[test]
    fn non_retryable_errors_skip_the_budget() {
        let ctl = controller(300_000);
        let job = claimed_job(1, 5);
        assert_eq!(
            ctl.on_failure(&job, "invalid input: empty", false, Utc::now()),
            FailureDecision::DeadLetter {
                cause: DeadLetterCause::NonRetryable,
                reason: "Non-retryable failure: invalid input: empty".into(),
            }
        );
    }

    proptest! {
        #[test]
        fn backoff_matches_closed_form(
            initial_ms in 1u64..60_000,
            max_ms in 1u64..3_600_000,
            attempt in 1u32..20,
        ) {
            let policy = RetryPolicy::new(
                Duration::from_millis(initial_ms),
                Duration::from_millis(max_ms),
            );
            let expected = (initial_ms as u128 * (1u128 << (attempt - 1))).min(max_ms as u128);
            prop_assert_eq!(policy.delay_for_attempt(attempt).as_millis(), expected);
        }

        #[test]
        fn dead_letters_exactly_when_budget_is_spent(
            max_attempts in 1u32..10,
            attempt in 1u32..10,
        ) {
            // Large threshold keeps poison detection out of the picture.
            let ctl = RetryController::new(
                RetryPolicy::default(),
                PoisonPillPolicy { threshold: u32::MAX, window: Duration::from_secs(60) },
            );
            let job = claimed_job(attempt, max_attempts);
            let decision = ctl.on_failure(&job, "err", true, Utc::now());
            let dead = matches!(decision, FailureDecision::DeadLetter { .. });
            prop_assert_eq!(dead, attempt >= max_attempts);
        }
    }
}
