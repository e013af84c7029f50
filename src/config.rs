//! Driver Configuration using Figment
//!
//! Configuration is loaded from:
//! 1. `config/driver.toml` (base configuration, optional)
//! 2. Environment variables prefixed with `EXPERIMENT_DRIVER_`, with `__`
//!    separating sections from keys
//!
//! Every key has a default, so an empty or missing file yields a usable
//! configuration.
//!
//! # Example
//! ```no_run
//! use experiment_driver::config::DriverConfig;
//!
//! // EXPERIMENT_DRIVER_ENGINE__POLL_INTERVAL_MS=20 overrides the file
//! let config = DriverConfig::load()?;
//! println!("Poll interval: {:?}", config.engine.poll_interval());
//! # Ok::<(), experiment_driver::error::DriverError>(())
//! ```

use crate::error::DriverResult;
use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Default configuration file location
pub const DEFAULT_CONFIG_PATH: &str = "config/driver.toml";

/// Prefix of environment variable overrides
pub const ENV_PREFIX: &str = "EXPERIMENT_DRIVER_";

const LOG_LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];
const LOG_FORMATS: [&str; 3] = ["pretty", "compact", "json"];

/// Top-level driver configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DriverConfig {
    /// Application settings
    #[serde(default)]
    pub application: ApplicationConfig,
    /// Plan execution settings
    #[serde(default)]
    pub engine: EngineConfig,
}

/// Application-level configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApplicationConfig {
    /// Application name
    #[serde(default = "default_name")]
    pub name: String,
    /// Logging level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Log output format (pretty, compact, json)
    #[serde(default = "default_log_format")]
    pub log_format: String,
}

/// Plan execution configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Period for polling pull-based signal sources and the segment clock
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,
    /// Capacity of the channel carrying monitor events to the driver
    #[serde(default = "default_event_capacity")]
    pub event_channel_capacity: usize,
    /// Per-subscriber buffer of the broadcast recorder
    #[serde(default = "default_recorder_capacity")]
    pub recorder_channel_capacity: usize,
}

// Default value functions
fn default_name() -> String {
    "Experiment Driver".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

fn default_poll_interval() -> u64 {
    50
}

fn default_event_capacity() -> usize {
    256
}

fn default_recorder_capacity() -> usize {
    1024
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            name: default_name(),
            log_level: default_log_level(),
            log_format: default_log_format(),
        }
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval(),
            event_channel_capacity: default_event_capacity(),
            recorder_channel_capacity: default_recorder_capacity(),
        }
    }
}

impl EngineConfig {
    /// Poll interval as a `Duration`
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

impl DriverConfig {
    /// Load configuration from `config/driver.toml` and environment variables
    ///
    /// Example override: `EXPERIMENT_DRIVER_APPLICATION__LOG_LEVEL=debug`
    pub fn load() -> DriverResult<Self> {
        Self::load_from(DEFAULT_CONFIG_PATH)
    }

    /// Load configuration from a specific file path
    pub fn load_from<P: AsRef<Path>>(path: P) -> DriverResult<Self> {
        let config = Figment::new()
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract()?;
        Ok(config)
    }

    /// Validate configuration after loading
    pub fn validate(&self) -> Result<(), String> {
        let level = self.application.log_level.to_lowercase();
        if !LOG_LEVELS.contains(&level.as_str()) {
            return Err(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.application.log_level,
                LOG_LEVELS.join(", ")
            ));
        }

        let format = self.application.log_format.to_lowercase();
        if !LOG_FORMATS.contains(&format.as_str()) {
            return Err(format!(
                "Invalid log_format '{}'. Must be one of: {}",
                self.application.log_format,
                LOG_FORMATS.join(", ")
            ));
        }

        if self.engine.poll_interval_ms == 0 {
            return Err("poll_interval_ms must be greater than 0".to_string());
        }

        if self.engine.event_channel_capacity == 0 {
            return Err("event_channel_capacity must be greater than 0".to_string());
        }

        if self.engine.recorder_channel_capacity == 0 {
            return Err("recorder_channel_capacity must be greater than 0".to_string());
        }

        Ok(())
    }

    /// Render the effective configuration as TOML
    pub fn to_toml(&self) -> Result<String, toml::ser::Error> {
        toml::to_string_pretty(self)
    }
}
