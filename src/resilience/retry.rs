//! Retry execution.
//!
//! [`RetryExecutor`] runs an operation up to `max_attempts` times, gated by the
//! breaker for its dependency key. Each failure is classified, recorded, and
//! (when retryable) followed by a backoff sleep. All breaker mutations for an
//! attempt happen before its sleep, so dropping the returned future while it
//! waits leaves no partial state behind.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

use super::backoff::calculate_delay;
use super::circuit_breaker::CircuitBreakerStore;
use super::classify::{ErrorKind, Failure, classify};
use super::retry_after::extract_retry_after;
use crate::config::RetryPolicy;

/// Why `execute` did not return a value.
#[derive(Debug, Error)]
pub enum RetryError<E> {
    /// The breaker for `key` rejected the call; the operation never ran.
    #[error("circuit breaker {key} is open - service temporarily unavailable")]
    CircuitOpen { key: String },

    /// The last error from the operation, unchanged.
    #[error(transparent)]
    Operation(E),

    /// Attempts ran out without any error being captured.
    #[error("all retry attempts failed but no specific error was captured")]
    Exhausted,
}

impl<E> RetryError<E> {
    pub fn is_circuit_open(&self) -> bool {
        matches!(self, RetryError::CircuitOpen { .. })
    }

    /// The operation's own error, if that is what ended the call.
    pub fn into_inner(self) -> Option<E> {
        match self {
            RetryError::Operation(err) => Some(err),
            RetryError::CircuitOpen { .. } | RetryError::Exhausted => None,
        }
    }

    pub fn as_inner(&self) -> Option<&E> {
        match self {
            RetryError::Operation(err) => Some(err),
            RetryError::CircuitOpen { .. } | RetryError::Exhausted => None,
        }
    }
}

enum Decision {
    Retry(Duration),
    Stop(ErrorKind),
}

/// Retry loop bound to a shared [`CircuitBreakerStore`].
///
/// Cloning is cheap; clones share the store.
#[derive(Debug, Clone)]
pub struct RetryExecutor {
    store: Arc<CircuitBreakerStore>,
}

impl Default for RetryExecutor {
    fn default() -> Self {
        Self::new(RetryPolicy::default())
    }
}

impl RetryExecutor {
    /// Executor with its own private store.
    pub fn new(policy: RetryPolicy) -> Self {
        Self::with_store(Arc::new(CircuitBreakerStore::new(policy)))
    }

    /// Executor sharing `store` (and its policy and observer) with other callers.
    pub fn with_store(store: Arc<CircuitBreakerStore>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<CircuitBreakerStore> {
        &self.store
    }

    pub fn policy(&self) -> &RetryPolicy {
        self.store.policy()
    }

    /// Run `operation` with retries.
    ///
    /// With a `key`, the call is gated by that key's breaker and every outcome
    /// is recorded against it; without one, breaker tracking is skipped.
    /// `max_attempts` overrides the policy default (`Some(0)` is ignored).
    ///
    /// # Example
    ///
    /// ```no_run
    /// use smart_retry::{RetryExecutor, RetryPolicy, UpstreamError};
    ///
    /// # async fn fetch() -> Result<String, UpstreamError> { Ok(String::new()) }
    /// # async fn demo() {
    /// let executor = RetryExecutor::new(RetryPolicy::default());
    /// let body = executor
    ///     .execute(Some("search-api"), None, || fetch())
    ///     .await;
    /// # }
    /// ```
    pub async fn execute<T, E, F, Fut>(
        &self,
        key: Option<&str>,
        max_attempts: Option<u32>,
        mut operation: F,
    ) -> Result<T, RetryError<E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Failure,
    {
        self.admit::<E>(key)?;
        let max_attempts = self.effective_attempts(max_attempts);
        let mut last_error = None;

        for attempt in 1..=max_attempts {
            tracing::debug!(
                key = key.unwrap_or("unknown"),
                attempt,
                max_attempts,
                "attempting call"
            );

            match operation().await {
                Ok(value) => {
                    self.on_success(key, attempt);
                    return Ok(value);
                }
                Err(err) => match self.on_failure(key, attempt, max_attempts, &err) {
                    Decision::Retry(delay) => {
                        tokio::time::sleep(delay).await;
                    }
                    Decision::Stop(kind) => {
                        last_error = Some((err, kind, attempt));
                        break;
                    }
                },
            }
        }

        self.give_up(key, last_error)
    }

    /// Blocking variant of [`execute`](Self::execute) for synchronous callers.
    /// Backoff sleeps block the current thread.
    pub fn execute_blocking<T, E, F>(
        &self,
        key: Option<&str>,
        max_attempts: Option<u32>,
        mut operation: F,
    ) -> Result<T, RetryError<E>>
    where
        F: FnMut() -> Result<T, E>,
        E: Failure,
    {
        self.admit::<E>(key)?;
        let max_attempts = self.effective_attempts(max_attempts);
        let mut last_error = None;

        for attempt in 1..=max_attempts {
            tracing::debug!(
                key = key.unwrap_or("unknown"),
                attempt,
                max_attempts,
                "attempting call"
            );

            match operation() {
                Ok(value) => {
                    self.on_success(key, attempt);
                    return Ok(value);
                }
                Err(err) => match self.on_failure(key, attempt, max_attempts, &err) {
                    Decision::Retry(delay) => std::thread::sleep(delay),
                    Decision::Stop(kind) => {
                        last_error = Some((err, kind, attempt));
                        break;
                    }
                },
            }
        }

        self.give_up(key, last_error)
    }

    fn admit<E>(&self, key: Option<&str>) -> Result<(), RetryError<E>> {
        match key {
            Some(key) if !self.store.check(key) => {
                tracing::debug!(key, "call rejected by open circuit breaker");
                Err(RetryError::CircuitOpen {
                    key: key.to_owned(),
                })
            }
            _ => Ok(()),
        }
    }

    fn effective_attempts(&self, max_attempts: Option<u32>) -> u32 {
        match max_attempts {
            Some(attempts) if attempts > 0 => attempts,
            _ => self.policy().max_attempts.max(1),
        }
    }

    fn on_success(&self, key: Option<&str>, attempt: u32) {
        if let Some(key) = key {
            self.store.record_success(key);
        }
        if attempt > 1 {
            tracing::info!(
                key = key.unwrap_or("unknown"),
                attempt,
                "operation succeeded after retrying"
            );
        }
    }

    fn on_failure<E: Failure>(
        &self,
        key: Option<&str>,
        attempt: u32,
        max_attempts: u32,
        err: &E,
    ) -> Decision {
        let kind = classify(err);
        tracing::warn!(
            key = key.unwrap_or("unknown"),
            attempt,
            kind = %kind,
            error = %err,
            "attempt failed"
        );

        if let Some(key) = key {
            self.store.record_failure(key, kind);
        }

        if attempt >= max_attempts || !kind.is_retryable() {
            return Decision::Stop(kind);
        }

        let retry_after = extract_retry_after(err);
        let delay = calculate_delay(self.policy(), attempt, kind, retry_after);
        tracing::info!(
            key = key.unwrap_or("unknown"),
            delay_secs = delay.as_secs_f64(),
            next_attempt = attempt + 1,
            max_attempts,
            "retrying after backoff"
        );
        self.store
            .observer()
            .retry_scheduled(key, attempt, max_attempts, kind, delay);
        Decision::Retry(delay)
    }

    fn give_up<T, E: Failure>(
        &self,
        key: Option<&str>,
        last_error: Option<(E, ErrorKind, u32)>,
    ) -> Result<T, RetryError<E>> {
        match last_error {
            Some((err, kind, attempts)) => {
                tracing::error!(
                    key = key.unwrap_or("unknown"),
                    attempts,
                    kind = %kind,
                    error = %err,
                    "max retries exceeded or non-retryable error"
                );
                self.store.observer().retries_exhausted(key, attempts, kind);
                Err(RetryError::Operation(err))
            }
            None => {
                tracing::error!(
                    key = key.unwrap_or("unknown"),
                    "retries exhausted without a captured error"
                );
                Err(RetryError::Exhausted)
            }
        }
    }
}
