// Retry/backoff wrapper for side-effecting activities. The policy is
// an explicit value object: capped attempts, exponential backoff, and
// a retryable-error predicate.

use std::collections::HashSet;
use std::future::Future;
use std::time::Duration;

use rand::Rng;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, error, warn};
use uuid::Uuid;

use crate::store::PersistenceError;

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            jitter: true,
        }
    }
}

impl RetryPolicy {
    /// Backoff before retry number `attempt` (1-based): doubling from
    /// `base_delay`, capped at `max_delay`, with up to 25% jitter.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exp = self
            .base_delay
            .saturating_mul(2u32.saturating_pow(attempt.saturating_sub(1)))
            .min(self.max_delay);
        if !self.jitter {
            return exp;
        }
        let jitter_ms = exp.as_millis() as u64 / 4;
        if jitter_ms == 0 {
            return exp;
        }
        exp + Duration::from_millis(rand::rng().random_range(0..=jitter_ms))
    }
}

/// Failure of one activity execution. Transient infrastructure
/// failures are retried; permanent failures are not.
#[derive(Debug, Clone, Error)]
pub enum ActivityError {
    #[error("transient activity failure: {0}")]
    Transient(String),

    #[error("permanent activity failure: {0}")]
    Permanent(String),
}

impl ActivityError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, ActivityError::Transient(_))
    }
}

impl From<PersistenceError> for ActivityError {
    fn from(e: PersistenceError) -> Self {
        if e.is_transient() {
            ActivityError::Transient(e.to_string())
        } else {
            ActivityError::Permanent(e.to_string())
        }
    }
}

impl From<ActivityError> for crate::errors::WorkflowError {
    fn from(e: ActivityError) -> Self {
        match e {
            ActivityError::Transient(reason) => {
                crate::errors::WorkflowError::TransientInfra { reason }
            }
            ActivityError::Permanent(reason) => {
                crate::errors::WorkflowError::FatalEngine { reason }
            }
        }
    }
}

/// Dedupe key for an external effect: a crash between "executed" and
/// "acknowledged" must not run the effect twice.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct EffectKey {
    pub instance_id: Uuid,
    pub event_type: String,
    pub sequence: u64,
}

pub struct ActivityExecutor {
    policy: RetryPolicy,
    delivered: Mutex<HashSet<EffectKey>>,
}

impl ActivityExecutor {
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            policy,
            delivered: Mutex::new(HashSet::new()),
        }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Execute an activity with bounded retry. The operation must be
    /// re-callable; only retryable errors consume extra attempts.
    pub async fn execute<T, F, Fut>(&self, label: &str, operation: F) -> Result<T, ActivityError>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T, ActivityError>>,
    {
        let mut attempt = 1;
        loop {
            match operation().await {
                Ok(value) => {
                    debug!(activity = %label, attempt = %attempt, "Activity succeeded");
                    return Ok(value);
                }
                Err(e) if e.is_retryable() && attempt < self.policy.max_attempts => {
                    let delay = self.policy.delay_for(attempt);
                    warn!(
                        activity = %label,
                        attempt = %attempt,
                        delay_ms = %delay.as_millis(),
                        error = %e,
                        "Activity failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => {
                    error!(
                        activity = %label,
                        attempt = %attempt,
                        error = %e,
                        "Activity failed"
                    );
                    return Err(e);
                }
            }
        }
    }

    /// Execute an external effect at most once per key. Returns `false`
    /// when the key was already delivered and the operation was
    /// skipped.
    pub async fn execute_once<F, Fut>(
        &self,
        key: EffectKey,
        label: &str,
        operation: F,
    ) -> Result<bool, ActivityError>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<(), ActivityError>>,
    {
        {
            let delivered = self.delivered.lock().await;
            if delivered.contains(&key) {
                debug!(activity = %label, sequence = %key.sequence, "Effect already delivered, skipping");
                return Ok(false);
            }
        }

        self.execute(label, operation).await?;

        let mut delivered = self.delivered.lock().await;
        delivered.insert(key);
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn fast_policy() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(4),
            jitter: false,
        }
    }

    #[tokio::test]
    async fn test_retry_succeeds_after_transient_failures() {
        let executor = ActivityExecutor::new(fast_policy());
        let attempts = Arc::new(AtomicU32::new(0));
        let attempts_clone = attempts.clone();

        let result = executor
            .execute("persist", move || {
                let attempts = attempts_clone.clone();
                async move {
                    if attempts.fetch_add(1, Ordering::SeqCst) < 2 {
                        Err(ActivityError::Transient("connection refused".to_string()))
                    } else {
                        Ok("saved")
                    }
                }
            })
            .await;

        assert_eq!(result.unwrap(), "saved");
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_permanent_error_fails_without_retry() {
        let executor = ActivityExecutor::new(fast_policy());
        let attempts = Arc::new(AtomicU32::new(0));
        let attempts_clone = attempts.clone();

        let result: Result<(), _> = executor
            .execute("notify", move || {
                let attempts = attempts_clone.clone();
                async move {
                    attempts.fetch_add(1, Ordering::SeqCst);
                    Err(ActivityError::Permanent("bad recipient".to_string()))
                }
            })
            .await;

        assert!(result.is_err());
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_attempts_are_capped() {
        let executor = ActivityExecutor::new(fast_policy());
        let attempts = Arc::new(AtomicU32::new(0));
        let attempts_clone = attempts.clone();

        let result: Result<(), _> = executor
            .execute("persist", move || {
                let attempts = attempts_clone.clone();
                async move {
                    attempts.fetch_add(1, Ordering::SeqCst);
                    Err(ActivityError::Transient("still down".to_string()))
                }
            })
            .await;

        assert!(result.is_err());
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let policy = RetryPolicy {
            max_attempts: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(350),
            jitter: false,
        };
        assert_eq!(policy.delay_for(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for(2), Duration::from_millis(200));
        assert_eq!(policy.delay_for(3), Duration::from_millis(350));
        assert_eq!(policy.delay_for(4), Duration::from_millis(350));
    }

    #[tokio::test]
    async fn test_execute_once_dedupes_by_key() {
        let executor = ActivityExecutor::new(fast_policy());
        let runs = Arc::new(AtomicU32::new(0));
        let key = EffectKey {
            instance_id: Uuid::new_v4(),
            event_type: "reminder_fired".to_string(),
            sequence: 7,
        };

        for _ in 0..2 {
            let runs_clone = runs.clone();
            executor
                .execute_once(key.clone(), "notify", move || {
                    let runs = runs_clone.clone();
                    async move {
                        runs.fetch_add(1, Ordering::SeqCst);
                        Ok(())
                    }
                })
                .await
                .expect("Delivery failed");
        }

        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }
}
