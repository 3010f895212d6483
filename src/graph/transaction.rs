//! Retryable transactions.
//!
//! A unit of work is an ordered list of [`Statement`]s executed inside one
//! begin/commit cycle on a pooled session. Any failure rolls back, releases
//! the session and retries after `retry_delay * attempt` (linear backoff).
//! After `max_retries` attempts the last error is returned unchanged.

use std::sync::Arc;
use std::time::Duration;

use super::pool::ConnectionPool;
use super::{AccessMode, GraphError, Record, Statement};

pub const DEFAULT_MAX_RETRIES: u32 = 3;
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total number of attempts.
    pub max_retries: u32,
    /// Base delay; attempt `n` waits `retry_delay * n` before attempt `n + 1`.
    pub retry_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            retry_delay: DEFAULT_RETRY_DELAY,
        }
    }
}

impl RetryPolicy {
    /// Delay to wait after the given (1-based) failed attempt.
    pub fn delay_after(&self, attempt: u32) -> Duration {
        self.retry_delay * attempt
    }
}

pub struct TransactionManager {
    pool: Arc<ConnectionPool>,
    policy: RetryPolicy,
}

impl TransactionManager {
    pub fn new(pool: Arc<ConnectionPool>, policy: RetryPolicy) -> Self {
        Self { pool, policy }
    }

    pub fn policy(&self) -> RetryPolicy {
        self.policy
    }

    /// Run statements in a read transaction. Returns one result set per statement.
    pub async fn execute_read(&self, statements: &[Statement]) -> Result<Vec<Vec<Record>>, GraphError> {
        self.execute(AccessMode::Read, statements).await
    }

    /// Run statements in a write transaction. Returns one result set per statement.
    pub async fn execute_write(&self, statements: &[Statement]) -> Result<Vec<Vec<Record>>, GraphError> {
        self.execute(AccessMode::Write, statements).await
    }

    /// Run statements with an explicit access mode. The mode is taken as
    /// declared; it is the caller's job to pick `Write` for mutations.
    pub async fn execute(
        &self,
        mode: AccessMode,
        statements: &[Statement],
    ) -> Result<Vec<Vec<Record>>, GraphError> {
        let attempts = self.policy.max_retries.max(1);
        let mut attempt = 1;
        loop {
            match self.run_once(mode, statements).await {
                Ok(results) => return Ok(results),
                Err(e) if attempt >= attempts => {
                    log::error!(
                        "{} transaction failed after {} attempt(s): {}",
                        mode.as_str(),
                        attempt,
                        e
                    );
                    return Err(e);
                }
                Err(e) => {
                    let delay = self.policy.delay_after(attempt);
                    log::warn!(
                        "{} transaction attempt {}/{} failed: {}; retrying in {:?}",
                        mode.as_str(),
                        attempt,
                        attempts,
                        e,
                        delay
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }

    async fn run_once(
        &self,
        mode: AccessMode,
        statements: &[Statement],
    ) -> Result<Vec<Vec<Record>>, GraphError> {
        let mut session = self.pool.session(mode).await?;

        let outcome: Result<Vec<Vec<Record>>, GraphError> = async {
            session.begin().await?;
            let mut results = Vec::with_capacity(statements.len());
            for statement in statements {
                results.push(session.run(statement).await?);
            }
            session.commit().await?;
            Ok(results)
        }
        .await;

        if outcome.is_err() {
            if let Err(e) = session.rollback().await {
                log::debug!("Rollback failed: {}", e);
            }
        }
        session.release().await;
        outcome
    }
}
