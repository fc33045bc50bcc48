//! Engine settings using Figment
//!
//! Settings are layered, lowest precedence first:
//! 1. Built-in defaults ([`EngineSettings::default`])
//! 2. A TOML file (`config/coatseq.toml` by default)
//! 3. Environment variables prefixed with `COATSEQ_`
//!
//! # Environment Variable Overrides
//!
//! ```text
//! COATSEQ_LOG_LEVEL=debug
//! COATSEQ_VALIDATION_POLL_INTERVAL=250ms
//! COATSEQ_EXCLUSIVE_STAGE=false
//! ```
//!
//! Durations use humantime syntax (`100ms`, `2s`, `1m 30s`).

use std::path::{Path, PathBuf};
use std::time::Duration;

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Default settings file, relative to the working directory.
pub const DEFAULT_SETTINGS_PATH: &str = "config/coatseq.toml";

/// Log output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human-readable, colored when attached to a terminal.
    #[default]
    Pretty,
    /// One JSON object per line.
    Json,
}

/// Top-level engine settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineSettings {
    /// How often a Validation step re-evaluates its rule
    #[serde(with = "humantime_serde")]
    pub validation_poll_interval: Duration,
    /// Refresh cadence of the polled tag snapshot
    #[serde(with = "humantime_serde")]
    pub tag_poll_interval: Duration,
    /// At most one active run per process (single physical stage)
    pub exclusive_stage: bool,
    /// Run event broadcast buffer
    pub event_capacity: usize,
    /// Logging level (trace, debug, info, warn, error)
    pub log_level: String,
    /// Output format for log lines
    pub log_format: LogFormat,
    /// Definition document (JSON or YAML)
    pub definitions_path: PathBuf,
    /// Root of the file document store
    pub documents_dir: PathBuf,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            validation_poll_interval: Duration::from_millis(100),
            tag_poll_interval: Duration::from_millis(50),
            exclusive_stage: true,
            event_capacity: 256,
            log_level: "info".to_string(),
            log_format: LogFormat::Pretty,
            definitions_path: PathBuf::from("config/definitions.yaml"),
            documents_dir: PathBuf::from("config/documents"),
        }
    }
}

impl EngineSettings {
    /// Load settings from [`DEFAULT_SETTINGS_PATH`] and the environment.
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from(DEFAULT_SETTINGS_PATH)
    }

    /// Load settings from a specific TOML file plus `COATSEQ_` environment
    /// overrides. A missing file leaves the defaults in place.
    ///
    /// # Errors
    ///
    /// Returns a ConfigError if a value cannot be parsed or validation fails.
    pub fn load_from<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let settings: Self = Self::figment(path.as_ref()).extract()?;
        settings.validate()?;
        Ok(settings)
    }

    /// The provider stack used by [`load_from`](Self::load_from).
    pub fn figment(path: &Path) -> Figment {
        Figment::from(Serialized::defaults(Self::default()))
            .merge(Toml::file(path))
            .merge(Env::prefixed("COATSEQ_").split("__"))
    }

    /// Validate settings after loading
    ///
    /// Checks:
    /// - Poll intervals are non-zero
    /// - Event capacity is non-zero
    /// - Log level is valid (trace, debug, info, warn, error)
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.validation_poll_interval.is_zero() {
            return Err(ConfigError::InvalidSettings(
                "validation_poll_interval must be greater than zero".to_string(),
            ));
        }
        if self.tag_poll_interval.is_zero() {
            return Err(ConfigError::InvalidSettings(
                "tag_poll_interval must be greater than zero".to_string(),
            ));
        }
        if self.event_capacity == 0 {
            return Err(ConfigError::InvalidSettings(
                "event_capacity must be greater than zero".to_string(),
            ));
        }

        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.log_level.as_str()) {
            return Err(ConfigError::InvalidSettings(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.log_level,
                valid_levels.join(", ")
            )));
        }
        Ok(())
    }
}
