//! Log entries and their rendering.
//!
//! An entry captures its timestamp when it is created, on the producing
//! thread, so the rendered time reflects when the event happened even if the
//! drain daemon runs behind.

use crate::{Format, Level, LogConfig};
use chrono::{DateTime, Local};
use std::error::Error as StdError;
use std::fmt::Write as _;

/// Boxed cause attached to a log entry.
pub type Cause = Box<dyn StdError + Send + Sync + 'static>;

/// A single queued log message.
#[derive(Debug)]
pub struct LogEntry {
    /// Capture time (enqueue time, not drain time)
    pub timestamp: DateTime<Local>,
    /// Severity
    pub level: Level,
    /// Originating module or logger name
    pub target: String,
    /// Message text
    pub message: String,
    /// Optional error whose source chain is appended to the message
    pub cause: Option<Cause>,
}

impl LogEntry {
    /// Create an entry stamped with the current time.
    pub fn new(level: Level, message: impl Into<String>) -> Self {
        Self {
            timestamp: Local::now(),
            level,
            target: String::new(),
            message: message.into(),
            cause: None,
        }
    }

    /// Set the target.
    pub fn with_target(mut self, target: impl Into<String>) -> Self {
        self.target = target.into();
        self
    }

    /// Attach a cause.
    pub fn with_cause(mut self, cause: impl Into<Cause>) -> Self {
        self.cause = Some(cause.into());
        self
    }

    /// Display strings for the cause and each of its sources, outermost first.
    pub fn cause_chain(&self) -> Vec<String> {
        let mut chain = Vec::new();
        let mut current = self
            .cause
            .as_deref()
            .map(|cause| cause as &(dyn StdError + 'static));
        while let Some(err) = current {
            chain.push(err.to_string());
            current = err.source();
        }
        chain
    }
}

/// Renders entries according to a [`LogConfig`].
#[derive(Debug, Clone)]
pub struct EntryFormatter {
    format: Format,
    timestamps: bool,
    name: Option<String>,
}

impl EntryFormatter {
    /// Build a formatter from configuration.
    pub fn new(config: &LogConfig) -> Self {
        Self {
            format: config.format,
            timestamps: config.timestamps,
            name: (!config.custom).then(|| config.name.clone()),
        }
    }

    /// Render one entry, including the trailing newline.
    pub fn format(&self, entry: &LogEntry) -> String {
        match self.format {
            Format::Pretty => self.format_pretty(entry),
            Format::Compact => self.format_compact(entry),
            Format::Json => self.format_json(entry),
        }
    }

    fn format_pretty(&self, entry: &LogEntry) -> String {
        let mut out = String::with_capacity(entry.message.len() + 64);

        if self.timestamps {
            let _ = write!(out, "{} ", entry.timestamp.format("%Y-%m-%d %H:%M:%S%.3f"));
        }
        let _ = write!(out, "{:5} ", entry.level.as_str());
        if let Some(name) = &self.name {
            let _ = write!(out, "[{}] ", name);
        }
        if !entry.target.is_empty() {
            let _ = write!(out, "{}: ", entry.target);
        }
        out.push_str(&entry.message);
        out.push('\n');

        for cause in entry.cause_chain() {
            let _ = writeln!(out, "  caused by: {}", cause);
        }
        out
    }

    fn format_compact(&self, entry: &LogEntry) -> String {
        let mut out = String::with_capacity(entry.message.len() + 16);

        if self.timestamps {
            let _ = write!(out, "{} ", entry.timestamp.format("%H:%M:%S"));
        }
        let _ = write!(out, "{} ", entry.level.as_str().chars().next().unwrap_or('?'));
        if let Some(name) = &self.name {
            let _ = write!(out, "{}: ", name);
        }
        out.push_str(&entry.message);
        for cause in entry.cause_chain() {
            let _ = write!(out, " <- {}", cause);
        }
        out.push('\n');
        out
    }

    #[cfg(feature = "json")]
    fn format_json(&self, entry: &LogEntry) -> String {
        use serde::Serialize;

        #[derive(Serialize)]
        struct JsonEntry<'a> {
            #[serde(skip_serializing_if = "Option::is_none")]
            timestamp: Option<String>,
            level: &'a str,
            #[serde(skip_serializing_if = "Option::is_none")]
            name: Option<&'a str>,
            #[serde(skip_serializing_if = "Option::is_none")]
            target: Option<&'a str>,
            message: &'a str,
            #[serde(skip_serializing_if = "Vec::is_empty")]
            causes: Vec<String>,
        }

        let json = JsonEntry {
            timestamp: self.timestamps.then(|| entry.timestamp.to_rfc3339()),
            level: entry.level.as_str(),
            name: self.name.as_deref(),
            target: (!entry.target.is_empty()).then_some(entry.target.as_str()),
            message: &entry.message,
            causes: entry.cause_chain(),
        };

        match serde_json::to_string(&json) {
            Ok(mut line) => {
                line.push('\n');
                line
            }
            Err(_) => self.format_pretty(entry),
        }
    }

    #[cfg(not(feature = "json"))]
    fn format_json(&self, entry: &LogEntry) -> String {
        self.format_pretty(entry)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fmt;

    #[derive(Debug)]
    struct Inner;

    impl fmt::Display for Inner {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "disk full")
        }
    }

    impl StdError for Inner {}

    #[derive(Debug)]
    struct Outer(Inner);

    impl fmt::Display for Outer {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "write failed")
        }
    }

    impl StdError for Outer {
        fn source(&self) -> Option<&(dyn StdError + 'static)> {
            Some(&self.0)
        }
    }

    fn untimed(config: LogConfig) -> EntryFormatter {
        EntryFormatter::new(&config.with_timestamps(false))
    }

    #[test]
    fn test_pretty_wraps_name_tag() {
        let formatter = untimed(LogConfig::new().name("jasper"));
        let line = formatter.format(&LogEntry::new(Level::Info, "compiled /index.jsp"));
        assert_eq!(line, "INFO  [jasper] compiled /index.jsp\n");
    }

    #[test]
    fn test_custom_mode_suppresses_tag() {
        let formatter = untimed(LogConfig::new().name("jasper").custom(true));
        let line = formatter.format(&LogEntry::new(Level::Warn, "slow compile"));
        assert_eq!(line, "WARN  slow compile\n");
    }

    #[test]
    fn test_cause_chain_appended() {
        let formatter = untimed(LogConfig::new().custom(true));
        let entry = LogEntry::new(Level::Error, "flush failed").with_cause(Outer(Inner));
        assert_eq!(
            entry.cause_chain(),
            vec!["write failed".to_string(), "disk full".to_string()]
        );

        let line = formatter.format(&entry);
        assert_eq!(
            line,
            "ERROR flush failed\n  caused by: write failed\n  caused by: disk full\n"
        );
    }

    #[test]
    fn test_timestamp_captured_at_creation() {
        let before = Local::now();
        let entry = LogEntry::new(Level::Info, "x");
        let after = Local::now();
        assert!(entry.timestamp >= before && entry.timestamp <= after);
    }

    #[cfg(feature = "json")]
    #[test]
    fn test_json_format() {
        let formatter = untimed(LogConfig::new().format(Format::Json).name("core"));
        let line = formatter.format(&LogEntry::new(Level::Debug, "hello").with_target("t"));
        let value: serde_json::Value = serde_json::from_str(line.trim_end()).unwrap();
        assert_eq!(value["level"], "DEBUG");
        assert_eq!(value["name"], "core");
        assert_eq!(value["target"], "t");
        assert_eq!(value["message"], "hello");
        assert!(value.get("timestamp").is_none());
    }
}
