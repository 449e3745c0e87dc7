//! Engine configuration.
//!
//! All sections use `#[serde(default)]`, so a config file only needs the keys
//! it wants to override:
//!
//! ```toml
//! [sampler]
//! min_timeout_secs = 10
//!
//! [background]
//! enabled = true
//! interval_ms = 10.0
//!
//! [viewer]
//! trusted_keys = ["3f9a"]
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::logging::LogConfig;
use crate::sampler::interval_from_ms;
use crate::thread_policy::ThreadGrouping;

/// Log output format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human-friendly output for interactive use
    #[default]
    Pretty,
    /// JSON lines for machine consumption
    Json,
}

impl std::fmt::Display for LogFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pretty => write!(f, "pretty"),
            Self::Json => write!(f, "json"),
        }
    }
}

impl std::str::FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pretty" => Ok(Self::Pretty),
            "json" => Ok(Self::Json),
            _ => Err(format!("unknown log format: {s}. Expected one of: pretty, json")),
        }
    }
}

/// Top-level engine configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub logging: LogConfig,
    pub sampler: SamplerSettings,
    pub background: BackgroundSettings,
    pub tick_monitor: TickMonitorSettings,
    pub watchdog: WatchdogSettings,
    pub statistics: StatisticsSettings,
    pub viewer: ViewerSettings,
    pub export: ExportSettings,
}

/// Limits and defaults applied to operator-started profilers.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SamplerSettings {
    /// Timeouts at or below this many seconds are rejected.
    pub min_timeout_secs: u64,
    /// Timeouts below this many seconds get an accuracy advisory.
    pub recommended_timeout_secs: u64,
    /// Default sampling interval in milliseconds.
    pub default_interval_ms: f64,
    /// Name of the platform's primary (main loop) thread.
    pub primary_thread: String,
}

impl Default for SamplerSettings {
    fn default() -> Self {
        Self {
            min_timeout_secs: 10,
            recommended_timeout_secs: 30,
            default_interval_ms: 4.0,
            primary_thread: "main".to_string(),
        }
    }
}

impl SamplerSettings {
    #[must_use]
    pub fn default_interval(&self) -> crate::error::Result<Duration> {
        interval_from_ms(self.default_interval_ms)
    }
}

/// The always-on background profiler.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BackgroundSettings {
    pub enabled: bool,
    /// Sampling interval in milliseconds (coarser than foreground runs).
    pub interval_ms: f64,
    pub grouping: ThreadGrouping,
}

impl Default for BackgroundSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            interval_ms: 10.0,
            grouping: ThreadGrouping::ByPoolName,
        }
    }
}

/// Tick monitor baseline settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TickMonitorSettings {
    /// Qualifying ticks collected before monitoring begins.
    pub setup_ticks: u32,
    /// Report ticks whose duration increased by more than this percentage.
    pub percent_increase_threshold: f64,
    /// When set, report ticks longer than this many milliseconds instead.
    pub duration_threshold_ms: Option<f64>,
    /// Whether GC notifications are correlated with ticks.
    pub monitor_gc: bool,
}

impl Default for TickMonitorSettings {
    fn default() -> Self {
        Self {
            setup_ticks: 120,
            percent_increase_threshold: 100.0,
            duration_threshold_ms: None,
            monitor_gc: true,
        }
    }
}

/// Command watchdog settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WatchdogSettings {
    pub warning_interval_secs: u64,
    pub max_warnings: u32,
}

impl Default for WatchdogSettings {
    fn default() -> Self {
        Self {
            warning_interval_secs: 5,
            max_warnings: 3,
        }
    }
}

/// Polling cadence for the statistics sources.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StatisticsSettings {
    /// Expected tick rate, used to size tick-duration windows.
    pub ticks_per_second: u32,
    pub ping_poll_interval_secs: u64,
    pub cpu_poll_interval_secs: u64,
}

impl Default for StatisticsSettings {
    fn default() -> Self {
        Self {
            ticks_per_second: 20,
            ping_poll_interval_secs: 1,
            cpu_poll_interval_secs: 1,
        }
    }
}

/// Live viewer settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ViewerSettings {
    /// Client ids trusted without an operator action (persisted trust).
    pub trusted_keys: Vec<String>,
}

/// Result export settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExportSettings {
    /// Directory used when results are saved to disk.
    pub output_dir: PathBuf,
    /// Send operator responses to every connected operator, not just the sender.
    pub broadcast_responses: bool,
}

impl Default for ExportSettings {
    fn default() -> Self {
        Self {
            output_dir: PathBuf::from("sparkscope"),
            broadcast_responses: true,
        }
    }
}

impl EngineConfig {
    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Err(ConfigError::FileNotFound(path.display().to_string()));
        }
        let raw = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::ReadFailed(path.display().to_string(), e.to_string()))?;
        Self::from_toml_str(&raw)
    }

    /// Parse and validate configuration from TOML text.
    pub fn from_toml_str(raw: &str) -> Result<Self, ConfigError> {
        let config: Self =
            toml::from_str(raw).map_err(|e| ConfigError::ParseFailed(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values that would make the engine misbehave.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if interval_from_ms(self.sampler.default_interval_ms).is_err() {
            return Err(ConfigError::ValidationError(
                "sampler.default_interval_ms must be a positive, representable interval"
                    .to_string(),
            ));
        }
        if interval_from_ms(self.background.interval_ms).is_err() {
            return Err(ConfigError::ValidationError(
                "background.interval_ms must be a positive, representable interval".to_string(),
            ));
        }
        if self.sampler.recommended_timeout_secs < self.sampler.min_timeout_secs {
            return Err(ConfigError::ValidationError(
                "sampler.recommended_timeout_secs must be >= sampler.min_timeout_secs".to_string(),
            ));
        }
        if self.tick_monitor.setup_ticks == 0 {
            return Err(ConfigError::ValidationError(
                "tick_monitor.setup_ticks must be at least 1".to_string(),
            ));
        }
        if self.statistics.ticks_per_second == 0 {
            return Err(ConfigError::ValidationError(
                "statistics.ticks_per_second must be at least 1".to_string(),
            ));
        }
        if self.watchdog.warning_interval_secs == 0 {
            return Err(ConfigError::ValidationError(
                "watchdog.warning_interval_secs must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// Read access to named configuration values (`section.key`).
pub trait ConfigSource: Send + Sync {
    /// Look up a raw value by dotted key.
    fn get_value(&self, key: &str) -> Option<toml::Value>;

    fn get_bool(&self, key: &str, default: bool) -> bool {
        self.get_value(key)
            .and_then(|v| v.as_bool())
            .unwrap_or(default)
    }

    fn get_string(&self, key: &str, default: &str) -> String {
        self.get_value(key)
            .and_then(|v| v.as_str().map(str::to_string))
            .unwrap_or_else(|| default.to_string())
    }

    fn get_u64(&self, key: &str, default: u64) -> u64 {
        self.get_value(key)
            .and_then(|v| v.as_integer())
            .and_then(|v| u64::try_from(v).ok())
            .unwrap_or(default)
    }
}

impl ConfigSource for toml::Table {
    fn get_value(&self, key: &str) -> Option<toml::Value> {
        let mut parts = key.split('.');
        let first = parts.next()?;
        let mut current = self.get(first)?;
        for part in parts {
            current = current.as_table()?.get(part)?;
        }
        Some(current.clone())
    }
}

impl ConfigSource for EngineConfig {
    fn get_value(&self, key: &str) -> Option<toml::Value> {
        let value = toml::Value::try_from(self).ok()?;
        value.as_table()?.get_value(key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        let config = EngineConfig::default();
        config.validate().unwrap();
        assert_eq!(config.tick_monitor.setup_ticks, 120);
        assert_eq!(config.watchdog.warning_interval_secs, 5);
        assert_eq!(config.watchdog.max_warnings, 3);
        assert_eq!(config.sampler.min_timeout_secs, 10);
    }

    #[test]
    fn partial_toml_overrides_defaults() {
        let config = EngineConfig::from_toml_str(
            r#"
            [background]
            enabled = true

            [viewer]
            trusted_keys = ["abc", "def"]
            "#,
        )
        .unwrap();
        assert!(config.background.enabled);
        assert_eq!(config.background.interval_ms, 10.0);
        assert_eq!(config.viewer.trusted_keys, vec!["abc", "def"]);
        assert_eq!(config.sampler.recommended_timeout_secs, 30);
    }

    #[test]
    fn invalid_values_are_rejected() {
        let err = EngineConfig::from_toml_str("[tick_monitor]\nsetup_ticks = 0\n").unwrap_err();
        assert!(matches!(err, ConfigError::ValidationError(_)));

        let err = EngineConfig::from_toml_str("[sampler]\ndefault_interval_ms = -1.0\n").unwrap_err();
        assert!(matches!(err, ConfigError::ValidationError(_)));

        let err = EngineConfig::from_toml_str("[background]\ninterval_ms = 1e30\n").unwrap_err();
        assert!(matches!(err, ConfigError::ValidationError(_)));

        let err = EngineConfig::from_toml_str("not toml =").unwrap_err();
        assert!(matches!(err, ConfigError::ParseFailed(_)));
    }

    #[test]
    fn load_missing_file() {
        let err = EngineConfig::load(Path::new("/nonexistent/sparkscope.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::FileNotFound(_)));
    }

    #[test]
    fn load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sparkscope.toml");
        std::fs::write(&path, "[watchdog]\nmax_warnings = 5\n").unwrap();
        let config = EngineConfig::load(&path).unwrap();
        assert_eq!(config.watchdog.max_warnings, 5);
    }

    #[test]
    fn config_source_dotted_lookup() {
        let mut config = EngineConfig::default();
        config.background.enabled = true;
        assert!(config.get_bool("background.enabled", false));
        assert_eq!(config.get_u64("tick_monitor.setup_ticks", 0), 120);
        assert_eq!(config.get_string("sampler.primary_thread", "x"), "main");
        assert_eq!(config.get_string("missing.key", "fallback"), "fallback");
        assert!(!config.get_bool("sampler.primary_thread", false));
    }

    #[test]
    fn log_format_parse() {
        assert_eq!("JSON".parse::<LogFormat>().unwrap(), LogFormat::Json);
        assert_eq!(LogFormat::Pretty.to_string(), "pretty");
        assert!("xml".parse::<LogFormat>().is_err());
    }
}
