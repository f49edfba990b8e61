//! Error types for the log drain.

use thiserror::Error;

/// Result type for log drain operations.
pub type LogResult<T> = Result<T, LogError>;

/// Log drain errors.
#[derive(Debug, Error)]
pub enum LogError {
    /// Unknown level name
    #[error("Invalid log level: {0}")]
    InvalidLevel(String),

    /// Unknown format name
    #[error("Invalid log format: {0}")]
    InvalidFormat(String),

    /// The drain daemon could not be started
    #[error("Failed to spawn log daemon: {0}")]
    Spawn(#[source] std::io::Error),

    /// The drain daemon has already been shut down
    #[error("Log daemon already shut down")]
    ShutDown,

    /// The drain daemon panicked
    #[error("Log daemon panicked")]
    DaemonPanicked,
}
