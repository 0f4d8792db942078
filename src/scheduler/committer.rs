use std::future::Future;
use std::time::Duration;

use super::SchedulerError;
use crate::storage::{Database, DatabaseError, Mutation};

/// Bounded retry for transient store contention.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first
    pub attempts: u32,
    /// Fixed sleep between attempts
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            backoff: Duration::from_secs(1),
        }
    }
}

/// Run `op` until it succeeds, fails with a non-transient error, or has
/// failed with contention `policy.attempts` times.
///
/// Each call to `op` must be a complete transaction, since a failed attempt is
/// rolled back before the next one starts.
///
/// # Errors
///
/// - [`SchedulerError::RetriesExhausted`] when every attempt hit contention
/// - [`SchedulerError::Store`] on the first non-transient error
pub async fn commit_with_retry<T, F, Fut>(policy: RetryPolicy, mut op: F) -> Result<T, SchedulerError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, DatabaseError>>,
{
    let attempts = policy.attempts.max(1);
    let mut attempt = 1;

    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_transient() && attempt < attempts => {
                tracing::warn!(
                    attempt = attempt,
                    attempts = attempts,
                    delay_ms = policy.backoff.as_millis() as u64,
                    error = %e,
                    "Database busy, retrying commit"
                );
                tokio::time::sleep(policy.backoff).await;
                attempt += 1;
            }
            Err(e) if e.is_transient() => {
                return Err(SchedulerError::RetriesExhausted {
                    attempts,
                    source: e,
                })
            }
            Err(e) => return Err(SchedulerError::Store(e)),
        }
    }
}

/// Applies mutations to the work store with [`commit_with_retry`].
#[derive(Debug, Clone)]
pub struct Committer {
    db: Database,
    policy: RetryPolicy,
}

impl Committer {
    pub fn new(db: Database, policy: RetryPolicy) -> Self {
        Self { db, policy }
    }

    /// Commit one mutation; returns the feed id for matches.
    pub async fn commit(&self, mutation: &Mutation) -> Result<Option<i64>, SchedulerError> {
        let db = &self.db;
        commit_with_retry(self.policy, move || db.apply(mutation)).await
    }
}
