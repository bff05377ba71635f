//! Configuration system using Figment
//!
//! Configuration is loaded from:
//! 1. `config/dgctl.toml` (or a path given on the command line)
//! 2. Environment variables prefixed with `DGCTL_`, nested with `__`
//!
//! Every field has a default, so an empty or missing file yields a usable
//! configuration.
//!
//! ```text
//! DGCTL_SERIAL__PORT=/dev/ttyUSB1
//! DGCTL_SERIAL__REPLY_TIMEOUT_MS=500
//! DGCTL_APPLICATION__LOG_LEVEL=debug
//! ```
//!
//! # Example
//!
//! ```toml
//! [application]
//! log_level = "info"
//!
//! [serial]
//! port = "/dev/ttyUSB0"
//! baud_rate = 115200
//! write_timeout_ms = 20
//! reply_timeout_ms = 200
//!
//! [commit]
//! attempts = 10
//! ```

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

/// Default configuration file, relative to the working directory.
pub const DEFAULT_CONFIG_PATH: &str = "config/dgctl.toml";

/// Configuration error types
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Figment failed to read or merge a source.
    #[error("Configuration load error: {0}")]
    LoadError(#[from] Box<figment::Error>),
    /// A loaded value is out of range.
    #[error("Configuration validation error: {0}")]
    ValidationError(String),
}

/// Top-level configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Settings {
    /// Logging
    #[serde(default)]
    pub application: ApplicationConfig,
    /// Serial link and bridge bounds
    #[serde(default)]
    pub serial: SerialConfig,
    /// Commit retry policy
    #[serde(default)]
    pub commit: CommitConfig,
    /// Liveness tick
    #[serde(default)]
    pub tick: TickConfig,
    /// Background task shutdown
    #[serde(default)]
    pub shutdown: ShutdownConfig,
}

/// Application-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApplicationConfig {
    /// Logging level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

/// Serial link and command bridge settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SerialConfig {
    /// Serial device path (e.g., "/dev/ttyUSB0", "COM3")
    #[serde(default = "default_port")]
    pub port: String,
    /// Line speed in baud
    #[serde(default = "default_baud_rate")]
    pub baud_rate: u32,
    /// Bound on writing one command, in milliseconds
    #[serde(default = "default_write_timeout")]
    pub write_timeout_ms: u64,
    /// Bound on waiting for the reply line, in milliseconds
    #[serde(default = "default_reply_timeout")]
    pub reply_timeout_ms: u64,
    /// Longest reply line accepted by the framer
    #[serde(default = "default_max_line_bytes")]
    pub max_line_bytes: usize,
    /// Completed lines held before the oldest is dropped
    #[serde(default = "default_reply_queue_capacity")]
    pub reply_queue_capacity: usize,
}

/// Retry policy for configuration directives
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommitConfig {
    /// Whole-command resends per directive until `ok` is seen
    #[serde(default = "default_commit_attempts")]
    pub attempts: u32,
}

/// Liveness tick settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TickConfig {
    /// Tick period in milliseconds
    #[serde(default = "default_tick_period")]
    pub period_ms: u64,
}

/// Shutdown settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShutdownConfig {
    /// Grace period for background tasks before they are aborted
    #[serde(default = "default_grace")]
    pub grace_ms: u64,
}

// ============================================================================
// Default value functions
// ============================================================================

fn default_log_level() -> String {
    "info".to_string()
}

fn default_port() -> String {
    "/dev/ttyUSB0".to_string()
}

fn default_baud_rate() -> u32 {
    115200
}

fn default_write_timeout() -> u64 {
    20
}

fn default_reply_timeout() -> u64 {
    200
}

fn default_max_line_bytes() -> usize {
    4096
}

fn default_reply_queue_capacity() -> usize {
    64
}

fn default_commit_attempts() -> u32 {
    10
}

fn default_tick_period() -> u64 {
    1000
}

fn default_grace() -> u64 {
    500
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
        }
    }
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            baud_rate: default_baud_rate(),
            write_timeout_ms: default_write_timeout(),
            reply_timeout_ms: default_reply_timeout(),
            max_line_bytes: default_max_line_bytes(),
            reply_queue_capacity: default_reply_queue_capacity(),
        }
    }
}

impl Default for CommitConfig {
    fn default() -> Self {
        Self {
            attempts: default_commit_attempts(),
        }
    }
}

impl Default for TickConfig {
    fn default() -> Self {
        Self {
            period_ms: default_tick_period(),
        }
    }
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self {
            grace_ms: default_grace(),
        }
    }
}

impl SerialConfig {
    /// Write bound as a [`Duration`].
    pub fn write_timeout(&self) -> Duration {
        Duration::from_millis(self.write_timeout_ms)
    }

    /// Reply bound as a [`Duration`].
    pub fn reply_timeout(&self) -> Duration {
        Duration::from_millis(self.reply_timeout_ms)
    }
}

impl TickConfig {
    /// Tick period as a [`Duration`].
    pub fn period(&self) -> Duration {
        Duration::from_millis(self.period_ms)
    }
}

impl ShutdownConfig {
    /// Grace period as a [`Duration`].
    pub fn grace(&self) -> Duration {
        Duration::from_millis(self.grace_ms)
    }
}

// ============================================================================
// Configuration Loading and Validation
// ============================================================================

impl Settings {
    /// Load configuration from [`DEFAULT_CONFIG_PATH`] and the environment.
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from(DEFAULT_CONFIG_PATH)
    }

    /// Load configuration from a specific file path.
    ///
    /// Precedence, highest first: `DGCTL_` environment variables, the file,
    /// built-in defaults. A missing file is not an error.
    pub fn load_from<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let settings: Self = Figment::from(Serialized::defaults(Settings::default()))
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed("DGCTL_").split("__"))
            .extract()
            .map_err(|e| ConfigError::LoadError(Box::new(e)))?;

        settings.validate()?;
        Ok(settings)
    }

    /// Reject values the bridge or scheduler cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.application.log_level.as_str()) {
            return Err(ConfigError::ValidationError(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.application.log_level,
                valid_levels.join(", ")
            )));
        }

        if self.serial.baud_rate == 0 {
            return Err(ConfigError::ValidationError(
                "serial.baud_rate must be non-zero".to_string(),
            ));
        }
        if self.serial.write_timeout_ms == 0 || self.serial.reply_timeout_ms == 0 {
            return Err(ConfigError::ValidationError(format!(
                "serial timeouts must be non-zero (write {} ms, reply {} ms)",
                self.serial.write_timeout_ms, self.serial.reply_timeout_ms
            )));
        }
        if self.serial.max_line_bytes == 0 {
            return Err(ConfigError::ValidationError(
                "serial.max_line_bytes must be non-zero".to_string(),
            ));
        }
        if self.serial.reply_queue_capacity == 0 {
            return Err(ConfigError::ValidationError(
                "serial.reply_queue_capacity must be non-zero".to_string(),
            ));
        }
        if self.tick.period_ms == 0 {
            return Err(ConfigError::ValidationError(
                "tick.period_ms must be non-zero".to_string(),
            ));
        }

        Ok(())
    }
}
