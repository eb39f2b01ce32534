//! Retry policy configuration.
//!
//! A [`RetryPolicy`] is supplied once when a store or executor is built and is
//! shared read-only afterwards. It can be constructed in code with the
//! `with_*` builders or loaded from a file plus environment overrides.
//!
//! ## Example YAML
//!
//! ```yaml
//! max_attempts: 4
//! base_delay: 0.5          # seconds
//! max_delay: 30
//! exponential_factor: 2.0
//! jitter: true
//! failure_threshold: 10
//! recovery_timeout: 30
//! half_open_max_calls: 3
//! rate_limit_recovery_multiplier: 1.5
//! idle_key_ttl: 3600       # optional, enables idle key eviction
//! ```
//!
//! Environment overrides use the `SMART_RETRY__` prefix, e.g.
//! `SMART_RETRY__MAX_ATTEMPTS=5`.

use std::path::Path;
use std::time::Duration;

use config::{Config, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Prefix for environment variable overrides.
pub const ENV_PREFIX: &str = "SMART_RETRY";

/// Errors that can occur when loading a retry policy.
#[derive(Debug, Error)]
pub enum ConfigLoadError {
    #[error("failed to load config: {0}")]
    Load(#[from] config::ConfigError),

    #[error("validation error: {0}")]
    Validation(String),
}

/// Retry and circuit-breaker tuning shared by every call through a store.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Attempts per `execute` call, including the first one.
    pub max_attempts: u32,
    /// Delay before the second attempt; grows by `exponential_factor` after that.
    #[serde(with = "crate::serde_secs")]
    pub base_delay: Duration,
    /// Upper bound on any computed delay before jitter.
    #[serde(with = "crate::serde_secs")]
    pub max_delay: Duration,
    pub exponential_factor: f64,
    /// Spread delays by ±25% so concurrent callers do not retry in lockstep.
    pub jitter: bool,
    /// Counted failures needed to open a breaker.
    pub failure_threshold: u32,
    /// How long an open breaker rejects calls before probing.
    #[serde(with = "crate::serde_secs")]
    pub recovery_timeout: Duration,
    /// Probe calls admitted while half-open.
    pub half_open_max_calls: u32,
    /// Safety factor applied to a server-provided retry-after hint.
    pub rate_limit_recovery_multiplier: f64,
    /// Closed breakers untouched for this long may be evicted. `None` keeps
    /// every key for the lifetime of the store.
    #[serde(
        with = "crate::serde_secs::option",
        skip_serializing_if = "Option::is_none"
    )]
    pub idle_key_ttl: Option<Duration>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            exponential_factor: 2.0,
            jitter: true,
            failure_threshold: 10,
            recovery_timeout: Duration::from_secs(30),
            half_open_max_calls: 3,
            rate_limit_recovery_multiplier: 1.5,
            idle_key_ttl: None,
        }
    }
}

impl RetryPolicy {
    /// Create a new policy with a custom attempt budget.
    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts;
        self
    }

    /// Create a new policy with a custom first backoff delay.
    pub fn with_base_delay(mut self, delay: Duration) -> Self {
        self.base_delay = delay;
        self
    }

    /// Create a new policy with a custom delay cap.
    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Create a new policy with a custom backoff growth factor.
    pub fn with_exponential_factor(mut self, factor: f64) -> Self {
        self.exponential_factor = factor;
        self
    }

    /// Create a new policy with jitter switched on or off.
    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    /// Create a new policy with a custom failure threshold.
    pub fn with_failure_threshold(mut self, threshold: u32) -> Self {
        self.failure_threshold = threshold;
        self
    }

    /// Create a new policy with a custom recovery timeout.
    pub fn with_recovery_timeout(mut self, timeout: Duration) -> Self {
        self.recovery_timeout = timeout;
        self
    }

    /// Create a new policy with a custom half-open probe budget.
    pub fn with_half_open_max_calls(mut self, calls: u32) -> Self {
        self.half_open_max_calls = calls;
        self
    }

    /// Create a new policy with a custom retry-after multiplier.
    pub fn with_rate_limit_recovery_multiplier(mut self, multiplier: f64) -> Self {
        self.rate_limit_recovery_multiplier = multiplier;
        self
    }

    /// Create a new policy with idle key eviction enabled (`Some`) or disabled.
    pub fn with_idle_key_ttl(mut self, ttl: Option<Duration>) -> Self {
        self.idle_key_ttl = ttl;
        self
    }

    /// Load a policy from a YAML, TOML or JSON file (format by extension).
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigLoadError> {
        let settings = Config::builder()
            .add_source(File::from(path.as_ref()))
            .build()?;
        Self::from_settings(settings)
    }

    /// Parse a policy from a YAML string. Missing fields take their defaults.
    pub fn from_yaml(yaml: &str) -> Result<Self, ConfigLoadError> {
        let settings = Config::builder()
            .add_source(File::from_str(yaml, FileFormat::Yaml))
            .build()?;
        Self::from_settings(settings)
    }

    /// Load defaults, then the optional file, then `SMART_RETRY__*` variables.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigLoadError> {
        Self::load_with_env(path, env_source())
    }

    /// Like [`load`](Self::load) but reads overrides from `vars` instead of the
    /// process environment. Keys use the same `SMART_RETRY__FIELD` form.
    pub fn load_with_vars<I>(path: Option<&Path>, vars: I) -> Result<Self, ConfigLoadError>
    where
        I: IntoIterator<Item = (String, String)>,
    {
        Self::load_with_env(path, env_source().source(Some(vars.into_iter().collect())))
    }

    fn load_with_env(path: Option<&Path>, env: Environment) -> Result<Self, ConfigLoadError> {
        let mut builder = Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(File::from(path));
        }
        let settings = builder.add_source(env).build()?;
        Self::from_settings(settings)
    }

    fn from_settings(settings: Config) -> Result<Self, ConfigLoadError> {
        let policy: RetryPolicy = settings.try_deserialize()?;
        policy.validate()?;
        Ok(policy)
    }

    /// Check the numeric preconditions every component relies on.
    pub fn validate(&self) -> Result<(), ConfigLoadError> {
        if self.max_attempts < 1 {
            return Err(ConfigLoadError::Validation(
                "max_attempts must be at least 1".into(),
            ));
        }
        if self.failure_threshold < 1 {
            return Err(ConfigLoadError::Validation(
                "failure_threshold must be at least 1".into(),
            ));
        }
        if self.half_open_max_calls < 1 {
            return Err(ConfigLoadError::Validation(
                "half_open_max_calls must be at least 1".into(),
            ));
        }
        if !self.exponential_factor.is_finite() || self.exponential_factor < 1.0 {
            return Err(ConfigLoadError::Validation(format!(
                "exponential_factor must be a finite number >= 1, got {}",
                self.exponential_factor
            )));
        }
        if !self.rate_limit_recovery_multiplier.is_finite()
            || self.rate_limit_recovery_multiplier < 1.0
        {
            return Err(ConfigLoadError::Validation(format!(
                "rate_limit_recovery_multiplier must be a finite number >= 1, got {}",
                self.rate_limit_recovery_multiplier
            )));
        }
        Ok(())
    }
}

fn env_source() -> Environment {
    Environment::with_prefix(ENV_PREFIX)
        .prefix_separator("__")
        .separator("__")
        .try_parsing(true)
}
