//! Bounded retry with per-attempt delays for fallible async operations.
//!
//! A [`RetryPolicy`] is an explicit value applied at each call site rather
//! than an implicit wrapper. It retries only errors whose [`Retryable::kind`]
//! is in its retryable set, waits the configured delay for the current
//! attempt (clamped to the last configured delay), and reports whether the
//! final failure was non-retryable or the result of exhausted attempts.

use crate::config::RetryConfig;
use crate::error::{LlmError, LlmErrorKind};
use std::collections::HashSet;
use std::fmt;
use std::future::Future;
use std::hash::Hash;
use std::time::Duration;
use tracing::{debug, error, warn};

/// An error that can be classified for retry decisions.
pub trait Retryable {
    type Kind: Copy + Eq + Hash + fmt::Debug;

    fn kind(&self) -> Self::Kind;
}

impl Retryable for LlmError {
    type Kind = LlmErrorKind;

    fn kind(&self) -> LlmErrorKind {
        LlmError::kind(self)
    }
}

/// Why a retried operation ultimately failed.
#[derive(Debug, Clone, PartialEq)]
pub enum RetryError<E> {
    /// Every attempt failed with a retryable error; `last` is the final one.
    Exhausted { attempts: usize, last: E },
    /// The operation failed with an error outside the retryable set.
    NonRetryable(E),
}

impl<E> RetryError<E> {
    /// The error of the last attempt, unchanged.
    pub fn into_inner(self) -> E {
        match self {
            RetryError::Exhausted { last, .. } => last,
            RetryError::NonRetryable(e) => e,
        }
    }

    pub fn is_exhausted(&self) -> bool {
        matches!(self, RetryError::Exhausted { .. })
    }
}

impl<E: fmt::Display> fmt::Display for RetryError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RetryError::Exhausted { attempts, last } => {
                write!(f, "gave up after {attempts} attempts: {last}")
            }
            RetryError::NonRetryable(e) => write!(f, "non-retryable failure: {e}"),
        }
    }
}

impl<E: fmt::Debug + fmt::Display> std::error::Error for RetryError<E> {}

/// Retry policy: attempt budget, delay schedule, and the error kinds worth retrying.
#[derive(Debug, Clone)]
pub struct RetryPolicy<K> {
    max_attempts: usize,
    delays: Vec<Duration>,
    retryable: HashSet<K>,
}

impl<K: Copy + Eq + Hash + fmt::Debug> RetryPolicy<K> {
    /// Create a policy that retries nothing until kinds are added.
    ///
    /// A `max_attempts` of zero is treated as a single attempt.
    pub fn new(max_attempts: usize, delays: Vec<Duration>) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            delays,
            retryable: HashSet::new(),
        }
    }

    /// Add error kinds that should be retried.
    pub fn retry_on(mut self, kinds: impl IntoIterator<Item = K>) -> Self {
        self.retryable.extend(kinds);
        self
    }

    pub fn max_attempts(&self) -> usize {
        self.max_attempts
    }

    pub fn is_retryable(&self, kind: &K) -> bool {
        self.retryable.contains(kind)
    }

    /// Delay to wait after the failed attempt at `attempt_index` (0-based).
    ///
    /// Indices past the end of the schedule reuse the last delay; an empty
    /// schedule never waits.
    pub fn delay_for(&self, attempt_index: usize) -> Duration {
        self.delays
            .get(attempt_index)
            .or_else(|| self.delays.last())
            .copied()
            .unwrap_or(Duration::ZERO)
    }

    /// Total time spent waiting when every attempt fails with a retryable error.
    pub fn total_backoff(&self) -> Duration {
        (0..self.max_attempts - 1).map(|i| self.delay_for(i)).sum()
    }

    /// Run `operation` under this policy.
    pub async fn execute<T, E, F, Fut>(
        &self,
        operation_name: &str,
        mut operation: F,
    ) -> Result<T, RetryError<E>>
    where
        E: Retryable<Kind = K> + fmt::Display,
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let mut attempt = 0;

        loop {
            attempt += 1;

            match operation().await {
                Ok(value) => {
                    if attempt > 1 {
                        debug!(
                            operation = operation_name,
                            attempt, "Operation succeeded after retry"
                        );
                    }
                    return Ok(value);
                }
                Err(e) if !self.retryable.contains(&e.kind()) => {
                    debug!(
                        operation = operation_name,
                        attempt,
                        error = %e,
                        "Non-retryable failure"
                    );
                    return Err(RetryError::NonRetryable(e));
                }
                Err(e) if attempt >= self.max_attempts => {
                    error!(
                        operation = operation_name,
                        attempts = attempt,
                        error = %e,
                        "Operation failed after all retry attempts"
                    );
                    return Err(RetryError::Exhausted {
                        attempts: attempt,
                        last: e,
                    });
                }
                Err(e) => {
                    let delay = self.delay_for(attempt - 1);
                    warn!(
                        operation = operation_name,
                        attempt,
                        max_attempts = self.max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Retrying after transient error"
                    );
                    if !delay.is_zero() {
                        tokio::time::sleep(delay).await;
                    }
                }
            }
        }
    }
}

impl RetryPolicy<LlmErrorKind> {
    /// Build the LLM call policy from configuration: transient kinds only.
    pub fn from_config(config: &RetryConfig) -> Self {
        let delays = config
            .delays_ms
            .iter()
            .map(|ms| Duration::from_millis(*ms))
            .collect();
        RetryPolicy::new(config.max_attempts, delays).retry_on(LlmErrorKind::TRANSIENT)
    }
}
