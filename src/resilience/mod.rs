//! Resilience engine: error classification, backoff, circuit breakers and the
//! retry loop that ties them together.
//!
//! ```text
//! RetryExecutor::execute
//!     → CircuitBreakerStore::check (gate)
//!     → operation()
//!     → on failure: classify → record_failure → extract_retry_after
//!                   → calculate_delay → sleep → next attempt
//!     → on success: record_success
//! ```

mod backoff;
mod circuit_breaker;
mod classify;
mod retry;
mod retry_after;

pub use backoff::{MIN_JITTERED_DELAY, calculate_delay};
pub use circuit_breaker::{
    CircuitBreakerStore, CircuitState, CircuitStatus, HALF_OPEN_SUCCESS_THRESHOLD,
    RATE_LIMIT_FAILURE_THRESHOLD,
};
pub use classify::{ErrorKind, Failure, UpstreamError, classify};
pub use retry::{RetryError, RetryExecutor};
pub use retry_after::extract_retry_after;
