//! Observability hooks.
//!
//! Every breaker transition and retry decision is logged through `tracing`.
//! Collaborators that need the events as data (dashboards, alerting) plug in
//! a [`ResilienceObserver`]; with the `metrics` feature [`MetricsObserver`]
//! forwards them to the `metrics` facade.

use std::time::Duration;

use tracing_subscriber::EnvFilter;

use crate::resilience::ErrorKind;

/// Receives resilience events. All methods default to no-ops.
pub trait ResilienceObserver: Send + Sync {
    fn circuit_opened(&self, _key: &str, _failure_count: u32) {}

    fn circuit_half_opened(&self, _key: &str) {}

    fn circuit_closed(&self, _key: &str) {}

    /// A failed attempt will be retried after `delay`.
    fn retry_scheduled(
        &self,
        _key: Option<&str>,
        _attempt: u32,
        _max_attempts: u32,
        _kind: ErrorKind,
        _delay: Duration,
    ) {
    }

    /// The executor gave up and is returning the last error.
    fn retries_exhausted(&self, _key: Option<&str>, _attempts: u32, _kind: ErrorKind) {}
}

/// Observer that ignores every event.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopObserver;

impl ResilienceObserver for NoopObserver {}

/// Install a global `tracing` subscriber.
///
/// `filter` uses `EnvFilter` syntax (`"info"`, `"smart_retry=debug"`); `RUST_LOG`
/// takes precedence when set. Returns an error if a subscriber is already
/// installed.
pub fn init_tracing(
    filter: &str,
    json: bool,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let filter = EnvFilter::try_from_default_env().or_else(|_| EnvFilter::try_new(filter))?;
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(true);

    if json {
        builder.json().try_init()
    } else {
        builder.try_init()
    }
}

#[cfg(feature = "metrics")]
pub use self::recorder::MetricsObserver;

#[cfg(feature = "metrics")]
mod recorder {
    use std::time::Duration;

    use super::ResilienceObserver;
    use crate::resilience::ErrorKind;

    /// Forwards events to the `metrics` facade.
    ///
    /// - `smart_retry_circuit_transitions_total{key, state}`
    /// - `smart_retry_retries_total{kind}`
    /// - `smart_retry_backoff_seconds` (histogram)
    /// - `smart_retry_exhausted_total{kind}`
    #[derive(Debug, Clone, Copy, Default)]
    pub struct MetricsObserver;

    impl MetricsObserver {
        fn transition(key: &str, state: &'static str) {
            metrics::counter!(
                "smart_retry_circuit_transitions_total",
                "key" => key.to_owned(),
                "state" => state
            )
            .increment(1);
        }
    }

    impl ResilienceObserver for MetricsObserver {
        fn circuit_opened(&self, key: &str, _failure_count: u32) {
            Self::transition(key, "open");
        }

        fn circuit_half_opened(&self, key: &str) {
            Self::transition(key, "half_open");
        }

        fn circuit_closed(&self, key: &str) {
            Self::transition(key, "closed");
        }

        fn retry_scheduled(
            &self,
            _key: Option<&str>,
            _attempt: u32,
            _max_attempts: u32,
            kind: ErrorKind,
            delay: Duration,
        ) {
            metrics::counter!("smart_retry_retries_total", "kind" => kind.as_str()).increment(1);
            metrics::histogram!("smart_retry_backoff_seconds").record(delay.as_secs_f64());
        }

        fn retries_exhausted(&self, _key: Option<&str>, _attempts: u32, kind: ErrorKind) {
            metrics::counter!("smart_retry_exhausted_total", "kind" => kind.as_str()).increment(1);
        }
    }
}
