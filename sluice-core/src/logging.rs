//! Diagnostic logging for the container.
//!
//! Request-path diagnostics go through `tracing`; this module re-exports its
//! macros and sets up the global subscriber. Access logs and page engine
//! messages that must not slow a request down go through
//! [`sluice_log::LogQueue`] instead.
//!
//! ```no_run
//! use sluice_core::logging::*;
//!
//! let _guard = TracingConfig::new()
//!     .level(Level::Debug)
//!     .format(Format::Compact)
//!     .output(LogOutput::Stderr)
//!     .init()
//!     .unwrap();
//!
//! info!(addr = "127.0.0.1:8080", "Connector started");
//! ```

use crate::{Error, Result};
use std::io;
use tracing_appender::non_blocking::{NonBlocking, WorkerGuard};
use tracing_subscriber::{
    EnvFilter, Layer, Registry,
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
};

pub use sluice_log::{Format, Level};
pub use tracing::{debug, error, info, trace, warn};
pub use tracing_appender;

/// Filter directive for a level
pub fn level_directive(level: Level) -> &'static str {
    match level {
        Level::Trace => "trace",
        Level::Debug => "debug",
        Level::Info => "info",
        Level::Warn => "warn",
        Level::Error => "error",
        Level::Off => "off",
    }
}

/// Output destination for diagnostics
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogOutput {
    Stdout,
    Stderr,
    /// Append to a single file
    File(String),
    /// Daily rotating files
    RollingFile { directory: String, prefix: String },
}

/// Global `tracing` subscriber settings.
#[derive(Debug, Clone)]
pub struct TracingConfig {
    pub level: Level,
    pub format: Format,
    pub output: LogOutput,
    /// Include target (module path)
    pub targets: bool,
    pub thread_ids: bool,
    /// Emit an event when a span closes
    pub spans: bool,
    pub colors: bool,
    /// Filter directives overriding `level`, e.g. `sluice_core=debug,sluice_jsp=info`
    pub env_filter: Option<String>,
}

impl Default for TracingConfig {
    fn default() -> Self {
        Self {
            level: Level::Info,
            format: Format::Json,
            output: LogOutput::Stdout,
            targets: true,
            thread_ids: false,
            spans: false,
            colors: false,
            env_filter: None,
        }
    }
}

impl TracingConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mirror the level and format of a drain-daemon configuration
    pub fn from_log_config(config: &sluice_log::LogConfig) -> Self {
        Self {
            level: config.level,
            format: config.format,
            ..Self::default()
        }
    }

    pub fn level(mut self, level: Level) -> Self {
        self.level = level;
        self
    }

    pub fn format(mut self, format: Format) -> Self {
        self.format = format;
        self
    }

    pub fn output(mut self, output: LogOutput) -> Self {
        self.output = output;
        self
    }

    pub fn with_targets(mut self, enable: bool) -> Self {
        self.targets = enable;
        self
    }

    pub fn with_thread_ids(mut self, enable: bool) -> Self {
        self.thread_ids = enable;
        self
    }

    pub fn with_spans(mut self, enable: bool) -> Self {
        self.spans = enable;
        self
    }

    pub fn with_colors(mut self, enable: bool) -> Self {
        self.colors = enable;
        self
    }

    pub fn with_env_filter(mut self, filter: impl Into<String>) -> Self {
        self.env_filter = Some(filter.into());
        self
    }

    /// Build the level filter. `RUST_LOG` wins when no explicit filter is set.
    pub fn build_filter(&self) -> EnvFilter {
        let fallback = || EnvFilter::new(level_directive(self.level));
        match &self.env_filter {
            Some(directives) => EnvFilter::try_new(directives).unwrap_or_else(|_| fallback()),
            None => EnvFilter::try_from_default_env().unwrap_or_else(|_| fallback()),
        }
    }

    /// Install the global subscriber.
    ///
    /// Keep the returned guard alive; dropping it flushes buffered output.
    /// Fails if the log file cannot be opened or a subscriber is already set.
    pub fn init(self) -> Result<WorkerGuard> {
        let (writer, guard) = match &self.output {
            LogOutput::Stdout => tracing_appender::non_blocking(io::stdout()),
            LogOutput::Stderr => tracing_appender::non_blocking(io::stderr()),
            LogOutput::File(path) => {
                let file = std::fs::OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(path)?;
                tracing_appender::non_blocking(file)
            }
            LogOutput::RollingFile { directory, prefix } => {
                tracing_appender::non_blocking(tracing_appender::rolling::daily(directory, prefix))
            }
        };

        tracing_subscriber::registry()
            .with(self.fmt_layer(writer))
            .with(self.build_filter())
            .try_init()
            .map_err(|e| Error::Config(format!("tracing subscriber: {}", e)))?;
        Ok(guard)
    }

    fn fmt_layer(&self, writer: NonBlocking) -> Box<dyn Layer<Registry> + Send + Sync> {
        let span_events = if self.spans {
            FmtSpan::CLOSE
        } else {
            FmtSpan::NONE
        };
        let layer = fmt::layer()
            .with_writer(writer)
            .with_target(self.targets)
            .with_thread_ids(self.thread_ids)
            .with_span_events(span_events);

        match self.format {
            Format::Json => layer
                .json()
                .with_current_span(self.spans)
                .with_span_list(self.spans)
                .boxed(),
            Format::Pretty => layer.pretty().with_ansi(self.colors).boxed(),
            Format::Compact => layer.compact().with_ansi(self.colors).boxed(),
        }
    }
}
