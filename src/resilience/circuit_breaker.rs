//! Per-dependency circuit breakers.
//!
//! Each dependency key owns one state machine:
//!
//! ```text
//! Closed   --(failure_count >= threshold)-------------> Open
//! Open     --(recovery_timeout elapsed / no timestamp)-> HalfOpen
//! HalfOpen --(success_count >= 2)---------------------> Closed
//! HalfOpen --(any failure)----------------------------> Open
//! ```
//!
//! Rate limiting is treated as noise: it only starts counting toward the
//! failure threshold after more than [`RATE_LIMIT_FAILURE_THRESHOLD`]
//! consecutive rate-limited calls. Successes in the closed state decay the
//! failure count by one.
//!
//! Entries live in a sharded map. Every `check`/`record_*` holds the key's
//! shard exclusively for the duration of the mutation and nothing else, so
//! callers never sleep under a lock.

use std::fmt;
use std::sync::{Arc, Weak};
use std::time::Duration;

use dashmap::DashMap;
use serde::{Deserialize, Serialize, Serializer};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use super::classify::ErrorKind;
use crate::config::RetryPolicy;
use crate::telemetry::{NoopObserver, ResilienceObserver};

/// Consecutive rate limits tolerated before each further one counts as a failure.
pub const RATE_LIMIT_FAILURE_THRESHOLD: u32 = 15;

/// Successes required before a half-open breaker closes.
pub const HALF_OPEN_SUCCESS_THRESHOLD: u32 = 2;

/// Lifecycle state of a breaker.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Normal operation - calls allowed.
    #[default]
    Closed,
    /// Failing fast - calls rejected until the recovery timeout passes.
    Open,
    /// Probing - a limited number of calls allowed.
    HalfOpen,
}

/// Point-in-time view of one key's breaker.
///
/// Timestamps serialize as seconds elapsed since the event.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CircuitStatus {
    pub state: CircuitState,
    pub failure_count: u32,
    pub success_count: u32,
    pub consecutive_rate_limits: u32,
    pub half_open_calls: u32,
    #[serde(serialize_with = "serialize_elapsed")]
    pub last_failure_time: Option<Instant>,
    #[serde(serialize_with = "serialize_elapsed")]
    pub last_success_time: Option<Instant>,
    #[serde(serialize_with = "serialize_elapsed")]
    pub last_rate_limit_time: Option<Instant>,
}

fn serialize_elapsed<S>(instant: &Option<Instant>, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    match instant {
        Some(at) => serializer.serialize_some(&at.elapsed().as_secs_f64()),
        None => serializer.serialize_none(),
    }
}

#[derive(Debug, Clone)]
struct BreakerState {
    state: CircuitState,
    failure_count: u32,
    success_count: u32,
    half_open_calls: u32,
    consecutive_rate_limits: u32,
    last_failure_time: Option<Instant>,
    last_success_time: Option<Instant>,
    last_rate_limit_time: Option<Instant>,
    last_touched: Instant,
}

impl BreakerState {
    fn new(now: Instant) -> Self {
        Self {
            state: CircuitState::Closed,
            failure_count: 0,
            success_count: 0,
            half_open_calls: 0,
            consecutive_rate_limits: 0,
            last_failure_time: None,
            last_success_time: None,
            last_rate_limit_time: None,
            last_touched: now,
        }
    }

    fn enter_half_open(&mut self) {
        self.state = CircuitState::HalfOpen;
        self.half_open_calls = 0;
    }

    fn snapshot(&self) -> CircuitStatus {
        CircuitStatus {
            state: self.state,
            failure_count: self.failure_count,
            success_count: self.success_count,
            consecutive_rate_limits: self.consecutive_rate_limits,
            half_open_calls: self.half_open_calls,
            last_failure_time: self.last_failure_time,
            last_success_time: self.last_success_time,
            last_rate_limit_time: self.last_rate_limit_time,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Transition {
    Opened { failures: u32, from: CircuitState },
    HalfOpened { missing_timestamp: bool },
    Closed,
}

/// Registry of breakers keyed by dependency name.
///
/// Construct one per process (or per test) and share it behind an `Arc`.
pub struct CircuitBreakerStore {
    policy: RetryPolicy,
    breakers: DashMap<String, BreakerState>,
    observer: Arc<dyn ResilienceObserver>,
}

impl fmt::Debug for CircuitBreakerStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CircuitBreakerStore")
            .field("policy", &self.policy)
            .field("keys", &self.breakers.len())
            .finish()
    }
}

impl Default for CircuitBreakerStore {
    fn default() -> Self {
        Self::new(RetryPolicy::default())
    }
}

impl CircuitBreakerStore {
    /// Create an empty store that only logs transitions.
    pub fn new(policy: RetryPolicy) -> Self {
        Self::with_observer(policy, Arc::new(NoopObserver))
    }

    /// Store that reports transitions to `observer` in addition to logging them.
    pub fn with_observer(policy: RetryPolicy, observer: Arc<dyn ResilienceObserver>) -> Self {
        Self {
            policy,
            breakers: DashMap::new(),
            observer,
        }
    }

    /// Policy shared by every key in this store.
    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Observer notified of transitions and retry decisions.
    pub fn observer(&self) -> &Arc<dyn ResilienceObserver> {
        &self.observer
    }

    /// Gate a pending call. May move an open breaker to half-open.
    pub fn check(&self, key: &str) -> bool {
        let recovery_timeout = self.policy.recovery_timeout;
        let half_open_max_calls = self.policy.half_open_max_calls;

        let (allowed, transition) = self.with_state(key, |breaker, now| match breaker.state {
            CircuitState::Closed => (true, None),
            CircuitState::Open => {
                match breaker.last_failure_time.or(breaker.last_rate_limit_time) {
                    None => {
                        breaker.enter_half_open();
                        (
                            true,
                            Some(Transition::HalfOpened {
                                missing_timestamp: true,
                            }),
                        )
                    }
                    Some(failed_at) if now.saturating_duration_since(failed_at) > recovery_timeout => {
                        breaker.enter_half_open();
                        (
                            true,
                            Some(Transition::HalfOpened {
                                missing_timestamp: false,
                            }),
                        )
                    }
                    Some(_) => (false, None),
                }
            }
            CircuitState::HalfOpen => {
                if breaker.half_open_calls < half_open_max_calls {
                    breaker.half_open_calls += 1;
                    (true, None)
                } else {
                    (false, None)
                }
            }
        });

        if let Some(transition) = transition {
            self.announce(key, transition);
        }
        allowed
    }

    /// Record a successful call.
    pub fn record_success(&self, key: &str) {
        let transition = self.with_state(key, |breaker, now| {
            breaker.success_count = breaker.success_count.saturating_add(1);
            breaker.last_success_time = Some(now);
            breaker.consecutive_rate_limits = 0;

            match breaker.state {
                CircuitState::HalfOpen if breaker.success_count >= HALF_OPEN_SUCCESS_THRESHOLD => {
                    breaker.state = CircuitState::Closed;
                    breaker.failure_count = 0;
                    breaker.half_open_calls = 0;
                    Some(Transition::Closed)
                }
                CircuitState::Closed => {
                    breaker.failure_count = breaker.failure_count.saturating_sub(1);
                    None
                }
                CircuitState::HalfOpen | CircuitState::Open => None,
            }
        });

        if let Some(transition) = transition {
            self.announce(key, transition);
        }
    }

    /// Record a failed call of the given kind.
    pub fn record_failure(&self, key: &str, kind: ErrorKind) {
        let threshold = self.policy.failure_threshold;

        let transition = self.with_state(key, |breaker, now| {
            if kind == ErrorKind::RateLimit {
                breaker.consecutive_rate_limits = breaker.consecutive_rate_limits.saturating_add(1);
                breaker.last_rate_limit_time = Some(now);
                if breaker.consecutive_rate_limits > RATE_LIMIT_FAILURE_THRESHOLD {
                    breaker.failure_count = breaker.failure_count.saturating_add(1);
                }
            } else {
                breaker.failure_count = breaker.failure_count.saturating_add(1);
                breaker.last_failure_time = Some(now);
            }

            let from = breaker.state;
            if breaker.failure_count >= threshold && from != CircuitState::Open {
                breaker.state = CircuitState::Open;
                Some(Transition::Opened {
                    failures: breaker.failure_count,
                    from,
                })
            } else if from == CircuitState::HalfOpen {
                breaker.state = CircuitState::Open;
                breaker.last_failure_time = Some(now);
                Some(Transition::Opened {
                    failures: breaker.failure_count,
                    from,
                })
            } else {
                None
            }
        });

        if let Some(transition) = transition {
            self.announce(key, transition);
        }
    }

    /// Current state of `key`. Unseen keys report a fresh closed breaker and
    /// are not inserted.
    pub fn status(&self, key: &str) -> CircuitStatus {
        self.breakers
            .get(key)
            .map(|breaker| breaker.snapshot())
            .unwrap_or_default()
    }

    /// Snapshot of every tracked key, sorted by key.
    pub fn statuses(&self) -> Vec<(String, CircuitStatus)> {
        let mut all: Vec<_> = self
            .breakers
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().snapshot()))
            .collect();
        all.sort_by(|a, b| a.0.cmp(&b.0));
        all
    }

    /// Number of tracked keys.
    pub fn len(&self) -> usize {
        self.breakers.len()
    }

    /// True when no key has been checked or recorded yet.
    pub fn is_empty(&self) -> bool {
        self.breakers.is_empty()
    }

    /// Forget `key`; its next access starts from a fresh closed breaker.
    pub fn reset(&self, key: &str) -> bool {
        self.breakers.remove(key).is_some()
    }

    /// Forget every key (useful for admin operations).
    pub fn reset_all(&self) {
        self.breakers.clear();
    }

    /// Drop closed breakers that have not been checked or recorded for longer
    /// than `idle_for`. Open and half-open breakers are always kept.
    pub fn evict_idle(&self, idle_for: Duration) -> usize {
        let now = Instant::now();
        let mut evicted = 0;
        self.breakers.retain(|_, breaker| {
            let idle = breaker.state == CircuitState::Closed
                && now.saturating_duration_since(breaker.last_touched) > idle_for;
            if idle {
                evicted += 1;
            }
            !idle
        });
        evicted
    }

    /// Periodically apply [`RetryPolicy::idle_key_ttl`] on a tokio task.
    ///
    /// Returns `None` when the policy has no TTL or `every` is zero. The task
    /// stops on its own once the last `Arc` to the store is dropped.
    pub fn spawn_idle_sweeper(store: &Arc<Self>, every: Duration) -> Option<JoinHandle<()>> {
        let ttl = store.policy.idle_key_ttl?;
        if every.is_zero() {
            tracing::warn!("idle sweeper period must be non-zero, not spawning");
            return None;
        }
        let store: Weak<Self> = Arc::downgrade(store);

        Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(store) = store.upgrade() else {
                    break;
                };
                let evicted = store.evict_idle(ttl);
                if evicted > 0 {
                    tracing::debug!(evicted, remaining = store.len(), "evicted idle circuit breakers");
                }
            }
        }))
    }

    fn with_state<R>(&self, key: &str, f: impl FnOnce(&mut BreakerState, Instant) -> R) -> R {
        let now = Instant::now();
        if let Some(mut breaker) = self.breakers.get_mut(key) {
            breaker.last_touched = now;
            return f(&mut *breaker, now);
        }
        let mut breaker = self
            .breakers
            .entry(key.to_owned())
            .or_insert_with(|| BreakerState::new(now));
        breaker.last_touched = now;
        f(&mut *breaker, now)
    }

    fn announce(&self, key: &str, transition: Transition) {
        match transition {
            Transition::Opened {
                failures,
                from: CircuitState::HalfOpen,
            } => {
                tracing::warn!(key, failures, "circuit breaker probe failed in half-open, returning to open");
                self.observer.circuit_opened(key, failures);
            }
            Transition::Opened { failures, .. } => {
                tracing::warn!(key, failures, "circuit breaker opened");
                self.observer.circuit_opened(key, failures);
            }
            Transition::HalfOpened {
                missing_timestamp: true,
            } => {
                tracing::warn!(
                    key,
                    "circuit breaker open without a failure timestamp, moving to half-open to avoid deadlock"
                );
                self.observer.circuit_half_opened(key);
            }
            Transition::HalfOpened { .. } => {
                tracing::info!(key, "circuit breaker transitioning to half-open");
                self.observer.circuit_half_opened(key);
            }
            Transition::Closed => {
                tracing::info!(key, "circuit breaker recovered to closed");
                self.observer.circuit_closed(key);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(threshold: u32) -> RetryPolicy {
        RetryPolicy::default()
            .with_failure_threshold(threshold)
            .with_recovery_timeout(Duration::from_secs(30))
            .with_half_open_max_calls(3)
    }

    #[test]
    fn starts_closed_and_allows_calls() {
        let store = CircuitBreakerStore::new(policy(5));
        assert!(store.check("api"));
        assert_eq!(store.status("api").state, CircuitState::Closed);
    }

    #[test]
    fn status_does_not_create_entries() {
        let store = CircuitBreakerStore::new(policy(5));
        let status = store.status("never-seen");
        assert_eq!(status, CircuitStatus::default());
        assert!(store.is_empty());
    }

    #[test]
    fn check_and_record_create_entries_lazily() {
        let store = CircuitBreakerStore::new(policy(5));
        store.check("a");
        store.record_success("b");
        store.record_failure("c", ErrorKind::Unknown);
        assert_eq!(store.len(), 3);
    }

    #[test]
    fn opens_at_threshold() {
        let store = CircuitBreakerStore::new(policy(3));
        store.record_failure("api", ErrorKind::ServerError);
        store.record_failure("api", ErrorKind::NetworkError);
        assert_eq!(store.status("api").state, CircuitState::Closed);

        store.record_failure("api", ErrorKind::TimeoutError);
        assert_eq!(store.status("api").state, CircuitState::Open);
        assert!(!store.check("api"));
    }

    #[test]
    fn success_decays_failures_without_going_negative() {
        let store = CircuitBreakerStore::new(policy(3));
        store.record_failure("api", ErrorKind::ServerError);
        store.record_failure("api", ErrorKind::ServerError);
        store.record_success("api");
        assert_eq!(store.status("api").failure_count, 1);

        for _ in 0..5 {
            store.record_success("api");
        }
        let status = store.status("api");
        assert_eq!(status.failure_count, 0);
        assert_eq!(status.success_count, 6);
    }

    #[test]
    fn success_resets_consecutive_rate_limits() {
        let store = CircuitBreakerStore::new(policy(3));
        for _ in 0..4 {
            store.record_failure("api", ErrorKind::RateLimit);
        }
        assert_eq!(store.status("api").consecutive_rate_limits, 4);
        store.record_success("api");
        assert_eq!(store.status("api").consecutive_rate_limits, 0);
    }

    #[test]
    fn rate_limits_only_count_after_fifteen_in_a_row() {
        let store = CircuitBreakerStore::new(policy(1));
        for _ in 0..RATE_LIMIT_FAILURE_THRESHOLD {
            store.record_failure("api", ErrorKind::RateLimit);
        }
        let status = store.status("api");
        assert_eq!(status.state, CircuitState::Closed);
        assert_eq!(status.failure_count, 0);
        assert!(status.last_rate_limit_time.is_some());
        assert!(status.last_failure_time.is_none());

        store.record_failure("api", ErrorKind::RateLimit);
        let status = store.status("api");
        assert_eq!(status.failure_count, 1);
        assert_eq!(status.state, CircuitState::Open);
    }

    #[test]
    fn keys_are_independent() {
        let store = CircuitBreakerStore::new(policy(1));
        store.record_failure("down", ErrorKind::ServerError);
        assert!(!store.check("down"));
        assert!(store.check("up"));
    }

    #[test]
    fn reset_forgets_state() {
        let store = CircuitBreakerStore::new(policy(1));
        store.record_failure("api", ErrorKind::ServerError);
        assert!(store.reset("api"));
        assert!(!store.reset("api"));
        assert!(store.check("api"));
    }

    #[test]
    fn evict_idle_keeps_open_breakers() {
        let store = CircuitBreakerStore::new(policy(1));
        store.check("idle");
        store.record_failure("broken", ErrorKind::ServerError);

        std::thread::sleep(Duration::from_millis(20));
        let evicted = store.evict_idle(Duration::from_millis(5));

        assert_eq!(evicted, 1);
        assert_eq!(store.len(), 1);
        assert_eq!(store.status("broken").state, CircuitState::Open);
    }

    #[test]
    fn evict_idle_keeps_recently_used_keys() {
        let store = CircuitBreakerStore::new(policy(5));
        store.check("busy");
        assert_eq!(store.evict_idle(Duration::from_secs(60)), 0);
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn open_without_timestamps_half_opens_on_next_check() {
        let store = CircuitBreakerStore::new(policy(5));
        store.breakers.insert(
            "stuck".to_owned(),
            BreakerState {
                state: CircuitState::Open,
                ..BreakerState::new(Instant::now())
            },
        );

        assert!(store.check("stuck"));
        assert_eq!(store.status("stuck").state, CircuitState::HalfOpen);
    }

    #[tokio::test(start_paused = true)]
    async fn recovers_to_half_open_after_timeout() {
        let store = CircuitBreakerStore::new(policy(1));
        store.record_failure("api", ErrorKind::ServerError);
        assert!(!store.check("api"));

        tokio::time::advance(Duration::from_secs(29)).await;
        assert!(!store.check("api"));

        tokio::time::advance(Duration::from_secs(2)).await;
        assert!(store.check("api"));
        let status = store.status("api");
        assert_eq!(status.state, CircuitState::HalfOpen);
        assert_eq!(status.half_open_calls, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn half_open_limits_probe_calls() {
        let store = CircuitBreakerStore::new(policy(1));
        store.record_failure("api", ErrorKind::ServerError);
        tokio::time::advance(Duration::from_secs(31)).await;

        assert!(store.check("api"));
        for _ in 0..3 {
            assert!(store.check("api"));
        }
        assert!(!store.check("api"));
        assert_eq!(store.status("api").half_open_calls, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn two_successes_close_a_half_open_breaker() {
        let store = CircuitBreakerStore::new(policy(2));
        store.record_failure("api", ErrorKind::ServerError);
        store.record_failure("api", ErrorKind::ServerError);
        tokio::time::advance(Duration::from_secs(31)).await;
        assert!(store.check("api"));

        store.record_success("api");
        assert_eq!(store.status("api").state, CircuitState::HalfOpen);

        store.record_success("api");
        let status = store.status("api");
        assert_eq!(status.state, CircuitState::Closed);
        assert_eq!(status.failure_count, 0);
        assert_eq!(status.half_open_calls, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn half_open_failure_reopens_with_fresh_timestamp() {
        let store = CircuitBreakerStore::new(policy(1));
        store.record_failure("api", ErrorKind::ServerError);
        tokio::time::advance(Duration::from_secs(31)).await;
        assert!(store.check("api"));

        store.record_failure("api", ErrorKind::TimeoutError);
        let status = store.status("api");
        assert_eq!(status.state, CircuitState::Open);
        assert_eq!(status.last_failure_time, Some(Instant::now()));
        assert!(!store.check("api"));
    }

    #[tokio::test(start_paused = true)]
    async fn half_open_rate_limit_reopens() {
        let store = CircuitBreakerStore::new(policy(1));
        store.record_failure("api", ErrorKind::ServerError);
        tokio::time::advance(Duration::from_secs(31)).await;
        assert!(store.check("api"));

        store.record_failure("api", ErrorKind::RateLimit);
        let status = store.status("api");
        assert_eq!(status.state, CircuitState::Open);
        assert!(status.last_failure_time.is_some());
        assert_eq!(status.last_rate_limit_time, Some(Instant::now()));
        assert_eq!(status.consecutive_rate_limits, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn half_open_rate_limit_below_threshold_stamps_failure_time() {
        let store = CircuitBreakerStore::new(policy(5));
        store.breakers.insert(
            "api".to_owned(),
            BreakerState {
                state: CircuitState::HalfOpen,
                ..BreakerState::new(Instant::now())
            },
        );

        store.record_failure("api", ErrorKind::RateLimit);
        let status = store.status("api");
        assert_eq!(status.state, CircuitState::Open);
        assert_eq!(status.last_failure_time, Some(Instant::now()));
        assert_eq!(status.failure_count, 0);
    }

    #[test]
    fn zero_period_sweeper_is_not_spawned() {
        let store = Arc::new(CircuitBreakerStore::new(
            policy(5).with_idle_key_ttl(Some(Duration::from_secs(60))),
        ));
        assert!(CircuitBreakerStore::spawn_idle_sweeper(&store, Duration::ZERO).is_none());
    }

    #[test]
    fn status_serializes_with_snake_case_state() {
        let store = CircuitBreakerStore::new(policy(1));
        store.record_failure("api", ErrorKind::ServerError);
        let json = serde_json::to_value(store.status("api")).unwrap();
        assert_eq!(json["state"], "open");
        assert_eq!(json["failure_count"], 1);
        assert!(json["last_failure_time"].is_number());
        assert!(json["last_success_time"].is_null());
    }
}
