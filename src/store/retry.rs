//! Retry helper for storage writes.

use std::future::Future;
use std::time::Duration;

use rand::random;
use tokio::time::sleep;
use tracing::debug;

use crate::config::LogStoreConfig;
use crate::error::{DatabaseError, JobError};

/// Backoff parameters for one class of writes.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Total time spent sleeping before giving up.
    pub budget: Duration,
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (0-based): capped exponential plus
    /// up to 25% jitter, never above `max_delay`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let base_ms = self.base_delay.as_millis() as u64;
        let max_ms = (self.max_delay.as_millis() as u64).max(1);
        let exp_backoff_ms = base_ms.saturating_mul(1u64 << attempt.min(20));
        let capped_ms = exp_backoff_ms.min(max_ms);
        let jitter_ms = random::<u64>() % (capped_ms / 4 + 1);
        Duration::from_millis((capped_ms + jitter_ms).min(max_ms))
    }
}

impl From<&LogStoreConfig> for RetryPolicy {
    fn from(config: &LogStoreConfig) -> Self {
        Self {
            base_delay: config.retry_base_delay,
            max_delay: config.retry_max_delay,
            budget: config.retry_budget,
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(&LogStoreConfig::default())
    }
}

/// Run `op` until it succeeds, fails with an error `is_transient` rejects, or
/// the policy's delay budget is spent.
///
/// Exhaustion is reported as [`JobError::PersistenceWriteFailure`]; the caller
/// decides whether that is fatal.
pub async fn retry_storage_write<T, F, Fut, C>(
    op_name: &str,
    policy: RetryPolicy,
    is_transient: C,
    mut op: F,
) -> Result<T, JobError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, DatabaseError>>,
    C: Fn(&DatabaseError) -> bool,
{
    let mut attempt: u32 = 0;
    let mut slept = Duration::ZERO;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) => {
                let attempts = attempt + 1;
                if !is_transient(&err) {
                    return Err(JobError::PersistenceWriteFailure {
                        operation: op_name.to_string(),
                        attempts,
                        reason: err.to_string(),
                    });
                }

                let delay = policy.delay_for(attempt);
                if slept + delay > policy.budget {
                    return Err(JobError::PersistenceWriteFailure {
                        operation: op_name.to_string(),
                        attempts,
                        reason: format!("retry budget of {:?} exhausted: {err}", policy.budget),
                    });
                }

                debug!(
                    "Storage busy during {}, retrying in {:?} (attempt {})",
                    op_name, delay, attempts
                );

                sleep(delay).await;
                slept += delay;
                attempt += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;

    fn fast_policy() -> RetryPolicy {
        RetryPolicy {
            base_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(100),
            budget: Duration::from_millis(500),
        }
    }

    #[test]
    fn delay_is_capped() {
        let policy = fast_policy();
        for attempt in 0..40 {
            let d = policy.delay_for(attempt);
            assert!(d <= policy.max_delay, "attempt {attempt}: {d:?}");
        }
        assert!(policy.delay_for(0) >= Duration::from_millis(10));
    }

    #[tokio::test(start_paused = true)]
    async fn retries_transient_errors_until_success() {
        let calls = Arc::new(AtomicU32::new(0));
        let result = retry_storage_write(
            "test",
            fast_policy(),
            DatabaseError::is_transient,
            || {
                let calls = Arc::clone(&calls);
                async move {
                    if calls.fetch_add(1, Ordering::SeqCst) < 3 {
                        Err(DatabaseError::Busy("database is locked".into()))
                    } else {
                        Ok(42)
                    }
                }
            },
        )
        .await;
        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn fatal_errors_are_not_retried() {
        let calls = Arc::new(AtomicU32::new(0));
        let result: Result<(), _> = retry_storage_write(
            "test",
            fast_policy(),
            DatabaseError::is_transient,
            || {
                let calls = Arc::clone(&calls);
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err(DatabaseError::Query("no such table".into()))
                }
            },
        )
        .await;
        assert!(matches!(
            result,
            Err(JobError::PersistenceWriteFailure { attempts: 1, .. })
        ));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn gives_up_when_budget_is_spent() {
        let started = tokio::time::Instant::now();
        let result: Result<(), _> = retry_storage_write(
            "append_log_entries",
            fast_policy(),
            DatabaseError::is_transient,
            || async { Err(DatabaseError::Busy("database is locked".into())) },
        )
        .await;

        match result {
            Err(JobError::PersistenceWriteFailure {
                operation,
                attempts,
                ..
            }) => {
                assert_eq!(operation, "append_log_entries");
                assert!(attempts > 1);
            }
            other => panic!("expected persistence failure, got {other:?}"),
        }
        assert!(started.elapsed() <= fast_policy().budget);
    }
}
