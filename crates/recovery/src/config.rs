//! Layered configuration: defaults, then YAML, then environment overrides.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::error::ConfigError;
use crate::reliability::CircuitBreakerConfig;

pub const ENV_TIMEOUT_MS: &str = "RECOVERY_TIMEOUT_MS";
pub const ENV_HISTORY_SIZE: &str = "RECOVERY_HISTORY_SIZE";
pub const ENV_LOG_LEVEL: &str = "RECOVERY_LOG_LEVEL";

/// Top-level configuration for the recovery engine
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RecoveryConfig {
    pub executor: ExecutorConfig,
    pub monitor: MonitorConfig,
    pub checkpoints: CheckpointConfig,
    pub rollback: RollbackConfig,
    pub events: EventsConfig,
    pub circuit_breaker: CircuitBreakerSettings,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutorConfig {
    pub default_timeout_ms: u64,
    pub history_size: usize,
    pub auto_rollback: bool,
    pub progress_reporting: bool,
    /// Bounds of the simulated duration of a dry-run action
    pub dry_run_min_ms: u64,
    pub dry_run_max_ms: u64,
    /// How long a timed-out action loop may take to wind down before it is aborted
    pub timeout_grace_ms: u64,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            default_timeout_ms: 60_000,
            history_size: 100,
            auto_rollback: true,
            progress_reporting: true,
            dry_run_min_ms: 50,
            dry_run_max_ms: 250,
            timeout_grace_ms: 100,
        }
    }
}

impl ExecutorConfig {
    pub fn default_timeout(&self) -> Duration {
        Duration::from_millis(self.default_timeout_ms)
    }

    pub fn timeout_grace(&self) -> Duration {
        Duration::from_millis(self.timeout_grace_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    /// Zero disables the periodic sampler
    pub sampling_interval_ms: u64,
    pub history_size: usize,
    /// Samples retained per session
    pub max_samples: usize,
    pub cpu_anomaly_threshold: f64,
    pub memory_anomaly_threshold: f64,
    pub cpu_recommendation_threshold: f64,
    pub memory_recommendation_threshold: f64,
    pub min_action_success_rate: f64,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            sampling_interval_ms: 1_000,
            history_size: 100,
            max_samples: 1_000,
            cpu_anomaly_threshold: 95.0,
            memory_anomaly_threshold: 95.0,
            cpu_recommendation_threshold: 80.0,
            memory_recommendation_threshold: 85.0,
            min_action_success_rate: 0.8,
        }
    }
}

impl MonitorConfig {
    pub fn sampling_interval(&self) -> Duration {
        Duration::from_millis(self.sampling_interval_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CheckpointConfig {
    pub history_size: usize,
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self { history_size: 100 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RollbackConfig {
    pub history_size: usize,
}

impl Default for RollbackConfig {
    fn default() -> Self {
        Self { history_size: 100 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EventsConfig {
    pub channel_capacity: usize,
}

impl Default for EventsConfig {
    fn default() -> Self {
        Self {
            channel_capacity: 1024,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerSettings {
    pub failure_threshold: u32,
    pub reset_timeout_ms: u64,
    pub half_open_success_threshold: u32,
}

impl Default for CircuitBreakerSettings {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            reset_timeout_ms: 30_000,
            half_open_success_threshold: 2,
        }
    }
}

impl From<&CircuitBreakerSettings> for CircuitBreakerConfig {
    fn from(settings: &CircuitBreakerSettings) -> Self {
        CircuitBreakerConfig {
            failure_threshold: settings.failure_threshold,
            reset_timeout: Duration::from_millis(settings.reset_timeout_ms),
            half_open_success_threshold: settings.half_open_success_threshold,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// `EnvFilter` directive, e.g. `info` or `recovery=debug`
    pub level: String,
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

impl RecoveryConfig {
    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        let config: RecoveryConfig =
            serde_yaml::from_str(yaml).context("Failed to parse recovery configuration")?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        Self::from_yaml_str(&raw)
    }

    /// Apply `RECOVERY_*` variables from the process environment
    pub fn with_env_overrides(self) -> Result<Self> {
        self.with_overrides_from(|key| std::env::var(key).ok())
    }

    /// Apply overrides from an arbitrary lookup; used by tests to avoid
    /// mutating the process environment
    pub fn with_overrides_from<F>(mut self, lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(raw) = lookup(ENV_TIMEOUT_MS) {
            self.executor.default_timeout_ms = raw
                .trim()
                .parse()
                .with_context(|| format!("{} must be an integer, got '{}'", ENV_TIMEOUT_MS, raw))?;
        }
        if let Some(raw) = lookup(ENV_HISTORY_SIZE) {
            let size: usize = raw
                .trim()
                .parse()
                .with_context(|| format!("{} must be an integer, got '{}'", ENV_HISTORY_SIZE, raw))?;
            self.executor.history_size = size;
            self.monitor.history_size = size;
            self.checkpoints.history_size = size;
            self.rollback.history_size = size;
        }
        if let Some(raw) = lookup(ENV_LOG_LEVEL) {
            self.logging.level = raw.trim().to_string();
        }
        self.validate()?;
        Ok(self)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.executor.default_timeout_ms == 0 {
            return Err(ConfigError::invalid(
                "executor.default_timeout_ms",
                "must be greater than zero",
            ));
        }
        if self.executor.dry_run_min_ms > self.executor.dry_run_max_ms {
            return Err(ConfigError::invalid(
                "executor.dry_run_min_ms",
                "must not exceed executor.dry_run_max_ms",
            ));
        }
        for (field, size) in [
            ("executor.history_size", self.executor.history_size),
            ("monitor.history_size", self.monitor.history_size),
            ("checkpoints.history_size", self.checkpoints.history_size),
            ("rollback.history_size", self.rollback.history_size),
            ("events.channel_capacity", self.events.channel_capacity),
        ] {
            if size == 0 {
                return Err(ConfigError::invalid(field, "must be greater than zero"));
            }
        }
        for (field, pct) in [
            ("monitor.cpu_anomaly_threshold", self.monitor.cpu_anomaly_threshold),
            ("monitor.memory_anomaly_threshold", self.monitor.memory_anomaly_threshold),
            ("monitor.cpu_recommendation_threshold", self.monitor.cpu_recommendation_threshold),
            (
                "monitor.memory_recommendation_threshold",
                self.monitor.memory_recommendation_threshold,
            ),
        ] {
            if !(0.0..=100.0).contains(&pct) {
                return Err(ConfigError::invalid(field, "must be a percentage in 0..=100"));
            }
        }
        if !(0.0..=1.0).contains(&self.monitor.min_action_success_rate) {
            return Err(ConfigError::invalid(
                "monitor.min_action_success_rate",
                "must be in 0.0..=1.0",
            ));
        }
        if self.circuit_breaker.failure_threshold == 0 {
            return Err(ConfigError::invalid(
                "circuit_breaker.failure_threshold",
                "must be greater than zero",
            ));
        }
        if self.circuit_breaker.half_open_success_threshold == 0 {
            return Err(ConfigError::invalid(
                "circuit_breaker.half_open_success_threshold",
                "must be greater than zero",
            ));
        }
        if self.logging.level.trim().is_empty() {
            return Err(ConfigError::invalid("logging.level", "must not be empty"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;

    #[test]
    fn test_defaults_are_valid() {
        let config = RecoveryConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.executor.default_timeout(), Duration::from_secs(60));
    }

    #[test]
    fn test_partial_yaml_keeps_defaults() {
        let yaml = "executor:\n  default_timeout_ms: 5000\nlogging:\n  json: true\n";
        let config = RecoveryConfig::from_yaml_str(yaml).expect("valid yaml");
        assert_eq!(config.executor.default_timeout_ms, 5000);
        assert_eq!(config.executor.history_size, 100);
        assert!(config.logging.json);
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn test_invalid_yaml_value_rejected() {
        let yaml = "monitor:\n  cpu_anomaly_threshold: 150.0\n";
        assert!(RecoveryConfig::from_yaml_str(yaml).is_err());
    }

    #[test]
    fn test_env_overrides() {
        let vars: HashMap<&str, &str> = [
            (ENV_TIMEOUT_MS, "1500"),
            (ENV_HISTORY_SIZE, "7"),
            (ENV_LOG_LEVEL, "recovery=debug"),
        ]
        .into_iter()
        .collect();
        let config = RecoveryConfig::default()
            .with_overrides_from(|k| vars.get(k).map(|v| v.to_string()))
            .expect("overrides apply");

        assert_eq!(config.executor.default_timeout_ms, 1500);
        assert_eq!(config.rollback.history_size, 7);
        assert_eq!(config.monitor.history_size, 7);
        assert_eq!(config.logging.level, "recovery=debug");
    }

    #[test]
    fn test_env_override_parse_error() {
        let result = RecoveryConfig::default()
            .with_overrides_from(|k| (k == ENV_TIMEOUT_MS).then(|| "soon".to_string()));
        assert!(result.is_err());
    }

    #[test]
    fn test_from_file() {
        let mut file = tempfile::NamedTempFile::new().expect("temp file");
        writeln!(file, "rollback:\n  history_size: 3").expect("write");
        let config = RecoveryConfig::from_file(file.path()).expect("load");
        assert_eq!(config.rollback.history_size, 3);
    }
}
