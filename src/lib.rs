//! Smart retries for flaky, rate-limited dependencies.
//!
//! This crate wraps calls to a remote dependency with retries that understand
//! *why* a call failed, plus a circuit breaker per dependency key. Rate
//! limiting is treated as noise that only trips a breaker after it persists;
//! server and network failures count immediately.
//!
//! The moving parts:
//!
//! - [`classify`] turns any [`Failure`] into an [`ErrorKind`]. Status codes,
//!   timeouts and connect errors are checked first; message text is a fallback.
//! - [`extract_retry_after`] pulls a server-suggested wait from the message or
//!   the `Retry-After` header.
//! - [`calculate_delay`] computes exponential backoff with optional jitter.
//! - [`CircuitBreakerStore`] tracks a Closed/Open/HalfOpen machine per key.
//! - [`RetryExecutor`] runs the loop.
//!
//! ## Quick example
//!
//! ```no_run
//! use smart_retry::{RetryExecutor, RetryPolicy, UpstreamError};
//!
//! #[tokio::main]
//! async fn main() {
//!     let executor = RetryExecutor::new(RetryPolicy::default());
//!
//!     let result = executor
//!         .execute(Some("geocoder"), None, || async {
//!             Err::<String, _>(UpstreamError::status(503, "maintenance"))
//!         })
//!         .await;
//!
//!     if let Err(err) = result {
//!         eprintln!("giving up: {err}");
//!     }
//!     println!("{:?}", executor.store().status("geocoder"));
//! }
//! ```
//!
//! One [`CircuitBreakerStore`] should be shared (behind an `Arc`) by every
//! executor that talks to the same dependencies; tests can build their own.

pub mod config;
pub mod resilience;
pub mod telemetry;
mod serde_secs;

pub use crate::config::{ConfigLoadError, RetryPolicy};
pub use crate::resilience::{
    CircuitBreakerStore, CircuitState, CircuitStatus, ErrorKind, Failure, RetryError,
    RetryExecutor, UpstreamError, calculate_delay, classify, extract_retry_after,
};
pub use crate::telemetry::{NoopObserver, ResilienceObserver, init_tracing};

#[cfg(feature = "metrics")]
pub use crate::telemetry::MetricsObserver;
