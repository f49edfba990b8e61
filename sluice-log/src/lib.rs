//! Sluice Logging
//!
//! Log levels, output formats and the asynchronous log drain used by the
//! Sluice container. Request threads hand entries to a [`LogQueue`] without
//! blocking; a single daemon thread formats and writes them in enqueue order.
//!
//! # Usage
//!
//! ```rust,no_run
//! use sluice_log::{Level, LogConfig, LogQueue};
//!
//! let queue = LogQueue::stderr(LogConfig::from_env()).unwrap();
//! queue.log(Level::Info, "container started");
//! queue.flush();
//! queue.shutdown().unwrap();
//! ```
//!
//! # Environment Variables
//!
//! - `SLUICE_DEBUG=1` - Enable debug logging
//! - `SLUICE_LOG_LEVEL=debug|info|warn|error` - Set log level
//! - `SLUICE_LOG_FORMAT=pretty|json|compact` - Set output format
//! - `SLUICE_LOG_TIMESTAMPS=1|0` - Include timestamps
//! - `SLUICE_LOG_NAME=<tag>` - Name tag wrapped around each entry
//! - `SLUICE_LOG_CUSTOM=1` - Suppress the name tag

pub mod entry;
pub mod error;
pub mod queue;

pub use entry::{EntryFormatter, LogEntry};
pub use error::{LogError, LogResult};
pub use queue::{LogQueue, QueueLogger};

use std::env;
use std::str::FromStr;

// ============================================================================
// Log Levels
// ============================================================================

/// Log level for Sluice logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum Level {
    /// Trace level (most verbose)
    Trace = 0,
    /// Debug level
    Debug = 1,
    /// Info level
    Info = 2,
    /// Warning level
    Warn = 3,
    /// Error level (least verbose)
    Error = 4,
    /// Off (no logging)
    Off = 5,
}

impl Level {
    /// Get level name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Level::Trace => "TRACE",
            Level::Debug => "DEBUG",
            Level::Info => "INFO",
            Level::Warn => "WARN",
            Level::Error => "ERROR",
            Level::Off => "OFF",
        }
    }
}

impl FromStr for Level {
    type Err = LogError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "trace" => Ok(Level::Trace),
            "debug" => Ok(Level::Debug),
            "info" => Ok(Level::Info),
            "warn" | "warning" => Ok(Level::Warn),
            "error" => Ok(Level::Error),
            "off" | "none" => Ok(Level::Off),
            other => Err(LogError::InvalidLevel(other.to_string())),
        }
    }
}

impl From<log::Level> for Level {
    fn from(level: log::Level) -> Self {
        match level {
            log::Level::Trace => Level::Trace,
            log::Level::Debug => Level::Debug,
            log::Level::Info => Level::Info,
            log::Level::Warn => Level::Warn,
            log::Level::Error => Level::Error,
        }
    }
}

impl std::fmt::Display for Level {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// ============================================================================
// Log Format
// ============================================================================

/// Output format for drained log entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Format {
    /// Timestamp, level, name tag and message on one line, causes below
    Pretty,
    /// Compact single-line format
    Compact,
    /// JSON format for structured logging
    Json,
}

impl FromStr for Format {
    type Err = LogError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pretty" => Ok(Format::Pretty),
            "compact" => Ok(Format::Compact),
            "json" => Ok(Format::Json),
            other => Err(LogError::InvalidFormat(other.to_string())),
        }
    }
}

// ============================================================================
// Configuration
// ============================================================================

/// Logging configuration for a [`LogQueue`].
#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Whether debug mode is enabled
    pub debug: bool,
    /// Minimum log level
    pub level: Level,
    /// Output format
    pub format: Format,
    /// Whether to include timestamps
    pub timestamps: bool,
    /// Name tag wrapped around each entry
    pub name: String,
    /// Suppress the name tag ("custom" mode)
    pub custom: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            debug: false,
            level: Level::Info,
            format: Format::Pretty,
            timestamps: true,
            name: "sluice".to_string(),
            custom: false,
        }
    }
}

impl LogConfig {
    /// Create a configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create config from environment variables.
    pub fn from_env() -> Self {
        let debug = flag("SLUICE_DEBUG").unwrap_or(false);

        let level = env::var("SLUICE_LOG_LEVEL")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(if debug { Level::Debug } else { Level::Info });

        let format = env::var("SLUICE_LOG_FORMAT")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(Format::Pretty);

        let defaults = Self::default();

        Self {
            debug,
            level,
            format,
            timestamps: flag("SLUICE_LOG_TIMESTAMPS").unwrap_or(defaults.timestamps),
            name: env::var("SLUICE_LOG_NAME").unwrap_or(defaults.name),
            custom: flag("SLUICE_LOG_CUSTOM").unwrap_or(defaults.custom),
        }
    }

    /// Set the minimum level.
    pub fn level(mut self, level: Level) -> Self {
        self.level = level;
        self
    }

    /// Set the output format.
    pub fn format(mut self, format: Format) -> Self {
        self.format = format;
        self
    }

    /// Set the name tag.
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Enable or disable custom mode (no name tag).
    pub fn custom(mut self, custom: bool) -> Self {
        self.custom = custom;
        self
    }

    /// Enable or disable timestamps.
    pub fn with_timestamps(mut self, enable: bool) -> Self {
        self.timestamps = enable;
        self
    }

    /// Check if a level passes this configuration.
    #[inline]
    pub fn is_level_enabled(&self, level: Level) -> bool {
        level != Level::Off && (level >= self.level || (self.debug && level >= Level::Debug))
    }
}

fn flag(key: &str) -> Option<bool> {
    env::var(key)
        .ok()
        .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
}

// ============================================================================
// Tests
// ============================================================================
