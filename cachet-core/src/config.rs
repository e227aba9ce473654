//! Configuration types
//!
//! [`ClientConfig`] is the file-level configuration (TOML, millisecond
//! fields). [`QueryOptions`] is the per call site form with real durations,
//! built from the client defaults and adjusted with `with_*` methods.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use crate::error::ConfigError;

/// Default retention for inactive entries: five minutes.
pub const DEFAULT_RETENTION_MS: u64 = 5 * 60 * 1000;

// ============================================================================
// RETRY
// ============================================================================

/// Caller-supplied backoff: attempt number (0 for the first retry) to delay.
#[derive(Clone)]
pub struct BackoffFn(Arc<dyn Fn(u32) -> Duration + Send + Sync>);

impl BackoffFn {
    pub fn new(f: impl Fn(u32) -> Duration + Send + Sync + 'static) -> Self {
        Self(Arc::new(f))
    }

    pub fn delay(&self, attempt: u32) -> Duration {
        (self.0)(attempt)
    }
}

impl fmt::Debug for BackoffFn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("BackoffFn(..)")
    }
}

/// Delay strategy between fetch attempts.
#[derive(Debug, Clone)]
pub enum Backoff {
    Fixed(Duration),
    Exponential {
        initial: Duration,
        max: Duration,
        multiplier: f64,
    },
    Custom(BackoffFn),
}

impl Backoff {
    pub fn delay(&self, attempt: u32) -> Duration {
        match self {
            Self::Fixed(d) => *d,
            Self::Exponential {
                initial,
                max,
                multiplier,
            } => {
                let factor = multiplier.powi(attempt.min(i32::MAX as u32) as i32);
                let millis = (initial.as_millis() as f64 * factor).min(max.as_millis() as f64);
                Duration::from_millis(millis as u64)
            }
            Self::Custom(f) => f.delay(attempt),
        }
    }
}

/// How many times a failed fetch is retried and how long to wait in between.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub backoff: Backoff,
}

impl RetryPolicy {
    /// Fail fast: the first error settles the entry as `error`.
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            backoff: Backoff::Fixed(Duration::ZERO),
        }
    }

    pub fn new(max_retries: u32, backoff: Backoff) -> Self {
        Self {
            max_retries,
            backoff,
        }
    }

    pub fn delay_for(&self, attempt: u32) -> Duration {
        self.backoff.delay(attempt)
    }
}

// ============================================================================
// PER CALL SITE OPTIONS
// ============================================================================

/// Options recognised at every query call site.
#[derive(Debug, Clone)]
pub struct QueryOptions {
    /// How long after a successful write the entry counts as fresh.
    pub freshness_window: Duration,
    /// How long an inactive entry is kept before eviction.
    pub retention: Duration,
    /// When false no fetch is attempted regardless of staleness.
    pub enabled: bool,
    pub retry: RetryPolicy,
    pub refetch_on_mount: bool,
    pub refetch_on_focus: bool,
    pub refetch_on_reconnect: bool,
    /// Absent means polling is disabled.
    pub poll_interval: Option<Duration>,
    /// Seeds an absent entry as `success` without fetching.
    pub initial_data: Option<Value>,
    /// Shown by observers while the entry has no data; never written to the cache.
    pub placeholder_data: Option<Value>,
    /// Observers keep showing the previous key's data while a new key loads.
    pub keep_previous_data: bool,
}

impl Default for QueryOptions {
    fn default() -> Self {
        QueryDefaults::default().to_options()
    }
}

impl QueryOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_freshness_window(mut self, window: Duration) -> Self {
        self.freshness_window = window;
        self
    }

    pub fn with_retention(mut self, retention: Duration) -> Self {
        self.retention = retention;
        self
    }

    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Shorthand for `with_retry` keeping the current backoff.
    pub fn with_retry_count(mut self, max_retries: u32) -> Self {
        self.retry.max_retries = max_retries;
        self
    }

    pub fn with_refetch_on_mount(mut self, enabled: bool) -> Self {
        self.refetch_on_mount = enabled;
        self
    }

    pub fn with_refetch_on_focus(mut self, enabled: bool) -> Self {
        self.refetch_on_focus = enabled;
        self
    }

    pub fn with_refetch_on_reconnect(mut self, enabled: bool) -> Self {
        self.refetch_on_reconnect = enabled;
        self
    }

    /// Poll every `interval`. A zero interval turns polling off.
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = (!interval.is_zero()).then_some(interval);
        self
    }

    pub fn with_initial_data(mut self, data: Value) -> Self {
        self.initial_data = Some(data);
        self
    }

    pub fn with_placeholder_data(mut self, data: Value) -> Self {
        self.placeholder_data = Some(data);
        self
    }

    pub fn with_keep_previous_data(mut self, keep: bool) -> Self {
        self.keep_previous_data = keep;
        self
    }
}

// ============================================================================
// FILE CONFIGURATION
// ============================================================================

/// Query defaults as they appear in a config file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct QueryDefaults {
    pub freshness_window_ms: u64,
    pub retention_ms: u64,
    pub enabled: bool,
    pub retry_count: u32,
    pub retry_initial_backoff_ms: u64,
    pub retry_max_backoff_ms: u64,
    pub retry_backoff_multiplier: f64,
    pub refetch_on_mount: bool,
    pub refetch_on_focus: bool,
    pub refetch_on_reconnect: bool,
    pub poll_interval_ms: Option<u64>,
}

impl Default for QueryDefaults {
    fn default() -> Self {
        Self {
            freshness_window_ms: 0,
            retention_ms: DEFAULT_RETENTION_MS,
            enabled: true,
            retry_count: 3,
            retry_initial_backoff_ms: 1000,
            retry_max_backoff_ms: 30_000,
            retry_backoff_multiplier: 2.0,
            refetch_on_mount: true,
            refetch_on_focus: true,
            refetch_on_reconnect: true,
            poll_interval_ms: None,
        }
    }
}

impl QueryDefaults {
    pub fn to_options(&self) -> QueryOptions {
        QueryOptions {
            freshness_window: Duration::from_millis(self.freshness_window_ms),
            retention: Duration::from_millis(self.retention_ms),
            enabled: self.enabled,
            retry: RetryPolicy {
                max_retries: self.retry_count,
                backoff: Backoff::Exponential {
                    initial: Duration::from_millis(self.retry_initial_backoff_ms),
                    max: Duration::from_millis(self.retry_max_backoff_ms),
                    multiplier: self.retry_backoff_multiplier,
                },
            },
            refetch_on_mount: self.refetch_on_mount,
            refetch_on_focus: self.refetch_on_focus,
            refetch_on_reconnect: self.refetch_on_reconnect,
            poll_interval: self
                .poll_interval_ms
                .filter(|ms| *ms > 0)
                .map(Duration::from_millis),
            initial_data: None,
            placeholder_data: None,
            keep_previous_data: false,
        }
    }
}

/// Client-wide configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ClientConfig {
    pub query: QueryDefaults,
    /// Period of the background garbage-collection sweep.
    pub gc_sweep_interval_ms: u64,
    /// Buffer size of the cache event broadcast channel.
    pub event_channel_capacity: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            query: QueryDefaults::default(),
            gc_sweep_interval_ms: 60_000,
            event_channel_capacity: 256,
        }
    }
}

impl ClientConfig {
    /// Defaults suited to tests: no retries, so failures surface immediately.
    pub fn for_tests() -> Self {
        let mut config = Self::default();
        config.query.retry_count = 0;
        config
    }

    pub fn from_toml_str(contents: &str) -> Result<Self, ConfigError> {
        let config: ClientConfig = toml::from_str(contents).map_err(|e| ConfigError::Parse {
            reason: e.to_string(),
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_path(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|e| ConfigError::Io {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;
        Self::from_toml_str(&contents)
    }

    /// Options every call site starts from.
    pub fn query_options(&self) -> QueryOptions {
        self.query.to_options()
    }

    /// Never zero, even for a config that skipped [`validate`](Self::validate).
    pub fn gc_sweep_interval(&self) -> Duration {
        Duration::from_millis(self.gc_sweep_interval_ms.max(1))
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.gc_sweep_interval_ms == 0 {
            return Err(ConfigError::InvalidValue {
                field: "gc_sweep_interval_ms",
                reason: "must be > 0".to_string(),
            });
        }
        if self.event_channel_capacity == 0 {
            return Err(ConfigError::InvalidValue {
                field: "event_channel_capacity",
                reason: "must be > 0".to_string(),
            });
        }
        if !(self.query.retry_backoff_multiplier >= 1.0) {
            return Err(ConfigError::InvalidValue {
                field: "query.retry_backoff_multiplier",
                reason: format!("must be >= 1.0, got {}", self.query.retry_backoff_multiplier),
            });
        }
        if self.query.retry_initial_backoff_ms > self.query.retry_max_backoff_ms {
            return Err(ConfigError::InvalidValue {
                field: "query.retry_initial_backoff_ms",
                reason: "must not exceed retry_max_backoff_ms".to_string(),
            });
        }
        if self.query.poll_interval_ms == Some(0) {
            return Err(ConfigError::InvalidValue {
                field: "query.poll_interval_ms",
                reason: "must be > 0 when set".to_string(),
            });
        }
        Ok(())
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_documented_values() {
        let options = QueryOptions::default();
        assert_eq!(options.freshness_window, Duration::ZERO);
        assert_eq!(options.retention, Duration::from_secs(300));
        assert!(options.enabled);
        assert!(options.refetch_on_mount);
        assert!(options.poll_interval.is_none());
        assert_eq!(options.retry.max_retries, 3);
    }

    #[test]
    fn test_exponential_backoff_is_capped() {
        let backoff = Backoff::Exponential {
            initial: Duration::from_millis(1000),
            max: Duration::from_millis(30_000),
            multiplier: 2.0,
        };
        assert_eq!(backoff.delay(0), Duration::from_millis(1000));
        assert_eq!(backoff.delay(1), Duration::from_millis(2000));
        assert_eq!(backoff.delay(10), Duration::from_millis(30_000));
    }

    #[test]
    fn test_custom_backoff() {
        let policy = RetryPolicy::new(
            2,
            Backoff::Custom(BackoffFn::new(|attempt| Duration::from_millis(10 * (attempt as u64 + 1)))),
        );
        assert_eq!(policy.delay_for(0), Duration::from_millis(10));
        assert_eq!(policy.delay_for(1), Duration::from_millis(20));
    }

    #[test]
    fn test_builder_methods() {
        let options = QueryOptions::new()
            .with_freshness_window(Duration::from_secs(60))
            .with_retention(Duration::from_secs(600))
            .with_enabled(false)
            .with_retry_count(0)
            .with_poll_interval(Duration::from_secs(5));

        assert_eq!(options.freshness_window, Duration::from_secs(60));
        assert_eq!(options.retention, Duration::from_secs(600));
        assert!(!options.enabled);
        assert_eq!(options.retry.max_retries, 0);
        assert_eq!(options.poll_interval, Some(Duration::from_secs(5)));
    }

    #[test]
    fn test_parse_partial_toml() {
        let config = ClientConfig::from_toml_str(
            r#"
            gc_sweep_interval_ms = 1000

            [query]
            freshness_window_ms = 60000
            retry_count = 0
            "#,
        )
        .unwrap();

        assert_eq!(config.gc_sweep_interval_ms, 1000);
        assert_eq!(config.query.freshness_window_ms, 60_000);
        assert_eq!(config.query.retry_count, 0);
        assert_eq!(config.query.retention_ms, DEFAULT_RETENTION_MS);
        assert_eq!(config.event_channel_capacity, 256);
    }

    #[test]
    fn test_unknown_fields_rejected() {
        let err = ClientConfig::from_toml_str("stale_time = 5").unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = ClientConfig::default();
        config.event_channel_capacity = 0;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidValue { field: "event_channel_capacity", .. })
        ));

        let mut config = ClientConfig::default();
        config.query.retry_backoff_multiplier = 0.5;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidValue { field: "query.retry_backoff_multiplier", .. })
        ));

        let mut config = ClientConfig::default();
        config.query.poll_interval_ms = Some(0);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_missing_file_is_io_error() {
        let err = ClientConfig::from_path(Path::new("/nonexistent/cachet.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::Io { .. }));
    }

    #[test]
    fn test_zero_intervals_never_reach_timers() {
        let options = QueryOptions::default().with_poll_interval(Duration::ZERO);
        assert!(options.poll_interval.is_none());

        let mut config = ClientConfig::default();
        config.gc_sweep_interval_ms = 0;
        config.query.poll_interval_ms = Some(0);
        assert!(config.validate().is_err());
        assert_eq!(config.gc_sweep_interval(), Duration::from_millis(1));
        assert!(config.query_options().poll_interval.is_none());
    }

    #[test]
    fn test_for_tests_disables_retries() {
        assert_eq!(ClientConfig::for_tests().query_options().retry.max_retries, 0);
    }
}
