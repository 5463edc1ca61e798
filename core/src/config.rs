//! Run configuration types
//!
//! Every duration is stored in milliseconds so that config files stay flat;
//! accessor methods hand out [`Duration`]s.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::stats::EntrySettings;

/// Run configuration
///
/// Controls heartbeat timing between master and workers, spawn retry
/// behavior, stats windows and the automated stop conditions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunConfig {
    /// Master/worker liveness settings
    pub heartbeat: HeartbeatConfig,

    /// User spawn retry settings
    pub spawn: SpawnConfig,

    /// Stats aggregation settings
    pub stats: StatsConfig,

    /// Quit the run once the fail ratio exceeds this value (0.0 - 1.0)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fail_ratio_threshold: Option<f64>,

    /// Stop the run after this many milliseconds
    #[serde(skip_serializing_if = "Option::is_none")]
    pub run_time_ms: Option<u64>,

    /// Cap on user iterations per second across the whole process
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_iteration_rate: Option<f64>,
}

/// Heartbeat settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HeartbeatConfig {
    /// Interval between heartbeats in both directions
    pub interval_ms: u64,
    /// Silence after which a peer is considered missing
    pub timeout_ms: u64,
    /// Consecutive missed windows after which a worker is presumed dead
    pub max_missed: u32,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            interval_ms: 1_000,
            timeout_ms: 60_000,
            max_missed: 3,
        }
    }
}

impl HeartbeatConfig {
    /// Heartbeat interval
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    /// Heartbeat timeout
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// Spawn retry settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SpawnConfig {
    /// Retries after the first failed attempt to create a user
    pub retry_attempts: u32,
    /// First backoff delay
    pub backoff_initial_ms: u64,
    /// Upper bound for the exponential backoff
    pub backoff_max_ms: u64,
}

impl Default for SpawnConfig {
    fn default() -> Self {
        Self {
            retry_attempts: 3,
            backoff_initial_ms: 100,
            backoff_max_ms: 5_000,
        }
    }
}

impl SpawnConfig {
    /// Backoff before retry number `attempt` (0-based), without jitter
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u64.checked_shl(attempt.min(32)).unwrap_or(u64::MAX);
        let ms = self
            .backoff_initial_ms
            .saturating_mul(factor)
            .min(self.backoff_max_ms);
        Duration::from_millis(ms)
    }
}

/// Stats aggregation settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StatsConfig {
    /// Number of recent response times kept per entry for percentiles
    pub window_size: usize,
    /// Seconds of per-second counters used for "current" rates
    pub current_window_secs: u64,
    /// How often automated stop conditions are evaluated
    pub check_interval_ms: u64,
    /// How often periodic snapshots are emitted
    pub report_interval_ms: u64,
}

impl Default for StatsConfig {
    fn default() -> Self {
        Self {
            window_size: 1_000,
            current_window_secs: 10,
            check_interval_ms: 1_000,
            report_interval_ms: 2_000,
        }
    }
}

impl StatsConfig {
    /// Stop-condition check interval
    pub fn check_interval(&self) -> Duration {
        Duration::from_millis(self.check_interval_ms)
    }

    /// Snapshot interval
    pub fn report_interval(&self) -> Duration {
        Duration::from_millis(self.report_interval_ms)
    }

    /// Sizing for every stats entry
    pub fn entry_settings(&self) -> EntrySettings {
        EntrySettings {
            window_size: self.window_size,
            current_window_secs: self.current_window_secs as i64,
        }
    }
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            heartbeat: HeartbeatConfig::default(),
            spawn: SpawnConfig::default(),
            stats: StatsConfig::default(),
            fail_ratio_threshold: None,
            run_time_ms: None,
            max_iteration_rate: None,
        }
    }
}

impl RunConfig {
    /// Create a config with defaults
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the fail ratio threshold
    pub fn with_fail_ratio_threshold(mut self, ratio: f64) -> Self {
        self.fail_ratio_threshold = Some(ratio);
        self
    }

    /// Set the run time limit
    pub fn with_run_time(mut self, run_time: Duration) -> Self {
        self.run_time_ms = Some(run_time.as_millis() as u64);
        self
    }

    /// Set the iteration rate cap
    pub fn with_max_iteration_rate(mut self, rate: f64) -> Self {
        self.max_iteration_rate = Some(rate);
        self
    }

    /// Set heartbeat interval and timeout
    pub fn with_heartbeat(mut self, interval: Duration, timeout: Duration) -> Self {
        self.heartbeat.interval_ms = interval.as_millis() as u64;
        self.heartbeat.timeout_ms = timeout.as_millis() as u64;
        self
    }

    /// Set the spawn retry policy
    pub fn with_spawn_retries(mut self, attempts: u32, initial_backoff: Duration) -> Self {
        self.spawn.retry_attempts = attempts;
        self.spawn.backoff_initial_ms = initial_backoff.as_millis() as u64;
        self
    }

    /// Set the stop-condition check interval
    pub fn with_check_interval(mut self, interval: Duration) -> Self {
        self.stats.check_interval_ms = interval.as_millis() as u64;
        self
    }

    /// Run time limit, if any
    pub fn run_time(&self) -> Option<Duration> {
        self.run_time_ms.map(Duration::from_millis)
    }

    /// Parse a TOML document
    pub fn from_toml_str(input: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(input).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a TOML config file
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let input = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::Read(format!("{}: {e}", path.display())))?;
        Self::from_toml_str(&input)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.heartbeat.interval_ms == 0 {
            return Err(ConfigError::InvalidHeartbeat(
                "interval must be positive".into(),
            ));
        }
        if self.heartbeat.timeout_ms <= self.heartbeat.interval_ms {
            return Err(ConfigError::InvalidHeartbeat(
                "timeout must be longer than the interval".into(),
            ));
        }
        if self.heartbeat.max_missed == 0 {
            return Err(ConfigError::InvalidHeartbeat(
                "max_missed must be at least 1".into(),
            ));
        }

        if self.spawn.backoff_initial_ms > self.spawn.backoff_max_ms {
            return Err(ConfigError::InvalidSpawn(
                "initial backoff exceeds the maximum".into(),
            ));
        }

        if self.stats.window_size == 0 {
            return Err(ConfigError::InvalidStats(
                "window_size must be at least 1".into(),
            ));
        }
        if self.stats.current_window_secs == 0 {
            return Err(ConfigError::InvalidStats(
                "current_window_secs must be at least 1".into(),
            ));
        }
        if self.stats.check_interval_ms == 0 || self.stats.report_interval_ms == 0 {
            return Err(ConfigError::InvalidStats("intervals must be positive".into()));
        }

        if let Some(ratio) = self.fail_ratio_threshold {
            if !(0.0..=1.0).contains(&ratio) {
                return Err(ConfigError::InvalidFailRatio(format!(
                    "{ratio} is outside 0.0 - 1.0"
                )));
            }
        }

        if let Some(rate) = self.max_iteration_rate {
            if !rate.is_finite() || rate <= 0.0 {
                return Err(ConfigError::InvalidRateLimit(
                    "iteration rate must be positive".into(),
                ));
            }
            if Duration::try_from_secs_f64(1.0 / rate).is_err() {
                return Err(ConfigError::InvalidRateLimit(format!(
                    "iteration rate {rate} is too small"
                )));
            }
        }

        Ok(())
    }
}

/// Slowest accepted spawn rate, one user every ~11.6 days
pub const MIN_SPAWN_RATE: f64 = 1e-6;

/// Validate `start` parameters
///
/// `target_count` is unsigned, so only the rate needs checking.
pub fn validate_spawn_params(target_count: usize, spawn_rate: f64) -> Result<(), ConfigError> {
    if !spawn_rate.is_finite() || spawn_rate <= 0.0 {
        return Err(ConfigError::InvalidSpawnRate(format!(
            "spawn rate must be positive, got {spawn_rate} (target {target_count})"
        )));
    }
    if spawn_rate < MIN_SPAWN_RATE {
        return Err(ConfigError::InvalidSpawnRate(format!(
            "spawn rate must be at least {MIN_SPAWN_RATE} users/s, got {spawn_rate}"
        )));
    }
    Ok(())
}

/// Configuration validation errors
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ConfigError {
    /// Invalid heartbeat settings
    #[error("Invalid heartbeat: {0}")]
    InvalidHeartbeat(String),

    /// Invalid spawn retry settings
    #[error("Invalid spawn settings: {0}")]
    InvalidSpawn(String),

    /// Invalid spawn rate passed to start
    #[error("Invalid spawn rate: {0}")]
    InvalidSpawnRate(String),

    /// Invalid stats settings
    #[error("Invalid stats settings: {0}")]
    InvalidStats(String),

    /// Invalid fail ratio threshold
    #[error("Invalid fail ratio threshold: {0}")]
    InvalidFailRatio(String),

    /// Invalid rate limit
    #[error("Invalid rate limit: {0}")]
    InvalidRateLimit(String),

    /// Config file could not be read
    #[error("Cannot read config: {0}")]
    Read(String),

    /// Config file could not be parsed
    #[error("Cannot parse config: {0}")]
    Parse(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = RunConfig::default();
        assert_eq!(config.heartbeat.interval(), Duration::from_secs(1));
        assert_eq!(config.heartbeat.timeout(), Duration::from_secs(60));
        assert_eq!(config.heartbeat.max_missed, 3);
        assert_eq!(config.spawn.retry_attempts, 3);
        assert!(config.fail_ratio_threshold.is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_builder_pattern() {
        let config = RunConfig::new()
            .with_fail_ratio_threshold(0.2)
            .with_run_time(Duration::from_secs(60))
            .with_heartbeat(Duration::from_millis(200), Duration::from_secs(2));

        assert_eq!(config.fail_ratio_threshold, Some(0.2));
        assert_eq!(config.run_time(), Some(Duration::from_secs(60)));
        assert_eq!(config.heartbeat.interval_ms, 200);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validation_timeout_not_above_interval() {
        let config = RunConfig::new().with_heartbeat(Duration::from_secs(2), Duration::from_secs(1));
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidHeartbeat(_))
        ));
    }

    #[test]
    fn test_validation_fail_ratio_range() {
        let config = RunConfig::new().with_fail_ratio_threshold(1.5);
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidFailRatio(_))
        ));
    }

    #[test]
    fn test_validation_zero_window() {
        let mut config = RunConfig::new();
        config.stats.window_size = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validation_negative_iteration_rate() {
        let config = RunConfig::new().with_max_iteration_rate(-1.0);
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidRateLimit(_))
        ));

        let config = RunConfig::new().with_max_iteration_rate(1e-30);
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidRateLimit(_))
        ));
        assert!(RunConfig::new().with_max_iteration_rate(0.5).validate().is_ok());
    }

    #[test]
    fn test_spawn_params() {
        assert!(validate_spawn_params(100, 10.0).is_ok());
        assert!(validate_spawn_params(0, 1.0).is_ok());
        assert!(validate_spawn_params(10, 0.0).is_err());
        assert!(validate_spawn_params(10, -3.0).is_err());
        assert!(validate_spawn_params(10, f64::NAN).is_err());
        assert!(validate_spawn_params(10, f64::INFINITY).is_err());
        assert!(validate_spawn_params(1, 1e-30).is_err());
        assert!(validate_spawn_params(1, MIN_SPAWN_RATE).is_ok());
    }

    #[test]
    fn test_backoff_is_exponential_and_capped() {
        let spawn = SpawnConfig {
            retry_attempts: 5,
            backoff_initial_ms: 100,
            backoff_max_ms: 1_000,
        };
        assert_eq!(spawn.backoff(0), Duration::from_millis(100));
        assert_eq!(spawn.backoff(1), Duration::from_millis(200));
        assert_eq!(spawn.backoff(3), Duration::from_millis(800));
        assert_eq!(spawn.backoff(4), Duration::from_millis(1_000));
        assert_eq!(spawn.backoff(60), Duration::from_millis(1_000));
    }

    #[test]
    fn test_sub_second_run_time_kept() {
        let config = RunConfig::new().with_run_time(Duration::from_millis(1_500));
        assert_eq!(config.run_time(), Some(Duration::from_millis(1_500)));
        assert_eq!(config.run_time_ms, Some(1_500));

        let config = RunConfig::new().with_run_time(Duration::from_millis(250));
        assert_eq!(config.run_time(), Some(Duration::from_millis(250)));
    }

    #[test]
    fn test_from_toml_partial() {
        let config = RunConfig::from_toml_str(
            r#"
            fail_ratio_threshold = 0.1
            run_time_ms = 30000

            [heartbeat]
            interval_ms = 500
            timeout_ms = 5000
            "#,
        )
        .unwrap();

        assert_eq!(config.fail_ratio_threshold, Some(0.1));
        assert_eq!(config.run_time(), Some(Duration::from_secs(30)));
        assert_eq!(config.heartbeat.interval_ms, 500);
        assert_eq!(config.heartbeat.max_missed, 3);
        assert_eq!(config.stats, StatsConfig::default());
    }

    #[test]
    fn test_from_toml_rejects_invalid() {
        let err = RunConfig::from_toml_str("fail_ratio_threshold = 2.0").unwrap_err();
        assert!(matches!(err, ConfigError::InvalidFailRatio(_)));

        let err = RunConfig::from_toml_str("heartbeat = 3").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn test_config_serialization() {
        let config = RunConfig::new().with_fail_ratio_threshold(0.5);
        let json = serde_json::to_string(&config).unwrap();
        let deserialized: RunConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(deserialized, config);
    }
}
