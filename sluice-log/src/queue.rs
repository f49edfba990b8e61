//! Asynchronous log drain.
//!
//! Producers push entries onto an unbounded channel and return immediately.
//! One daemon thread owns the sink: it pulls entries in enqueue order,
//! renders them, writes and flushes each one, and parks on the channel once
//! it is empty. [`LogQueue::flush`] only wakes that daemon; it never starts a
//! second consumer, so entries cannot be reordered by concurrent drains.

use crate::entry::{Cause, EntryFormatter, LogEntry};
use crate::error::{LogError, LogResult};
use crate::{Level, LogConfig};
use parking_lot::Mutex;
use std::io::{self, Write};
use std::sync::Arc;
use std::thread::JoinHandle;
use tokio::sync::mpsc;

/// Message understood by the drain daemon.
enum Command {
    Entry(LogEntry),
    Flush,
    Shutdown,
}

/// Handle to the log drain daemon.
///
/// Cheap to share behind an `Arc`; every method takes `&self`.
pub struct LogQueue {
    tx: mpsc::UnboundedSender<Command>,
    config: LogConfig,
    formatter: EntryFormatter,
    daemon: Mutex<Option<JoinHandle<()>>>,
}

impl LogQueue {
    /// Start a drain daemon writing to `sink`.
    pub fn start<W>(config: LogConfig, sink: W) -> LogResult<Self>
    where
        W: Write + Send + 'static,
    {
        let (tx, rx) = mpsc::unbounded_channel();
        let formatter = EntryFormatter::new(&config);
        let daemon_formatter = formatter.clone();

        let handle = std::thread::Builder::new()
            .name(format!("{}-log-drain", config.name))
            .spawn(move || drain(rx, sink, daemon_formatter))
            .map_err(LogError::Spawn)?;

        Ok(Self {
            tx,
            config,
            formatter,
            daemon: Mutex::new(Some(handle)),
        })
    }

    /// Start a drain daemon writing to standard error.
    pub fn stderr(config: LogConfig) -> LogResult<Self> {
        Self::start(config, io::stderr())
    }

    /// The configuration this queue filters with.
    pub fn config(&self) -> &LogConfig {
        &self.config
    }

    /// Enqueue an entry. Never blocks.
    ///
    /// Entries below the configured level are discarded. If the daemon is
    /// gone the entry is dumped to standard error instead.
    pub fn enqueue(&self, entry: LogEntry) {
        if !self.config.is_level_enabled(entry.level) {
            return;
        }
        if let Err(mpsc::error::SendError(Command::Entry(entry))) =
            self.tx.send(Command::Entry(entry))
        {
            eprint!("{}", self.formatter.format(&entry));
        }
    }

    /// Enqueue a plain message.
    pub fn log(&self, level: Level, message: impl Into<String>) {
        self.enqueue(LogEntry::new(level, message));
    }

    /// Enqueue a message with a cause whose chain is rendered after it.
    pub fn log_with_cause(&self, level: Level, message: impl Into<String>, cause: impl Into<Cause>) {
        self.enqueue(LogEntry::new(level, message).with_cause(cause));
    }

    /// Wake the daemon so it drains and flushes the sink.
    ///
    /// Returns immediately; callers get no guarantee that anything has been
    /// written when this returns. Use [`LogQueue::shutdown`] for that.
    pub fn flush(&self) {
        let _ = self.tx.send(Command::Flush);
    }

    /// Drain everything enqueued so far, flush the sink and stop the daemon.
    pub fn shutdown(&self) -> LogResult<()> {
        let handle = self.daemon.lock().take().ok_or(LogError::ShutDown)?;
        let _ = self.tx.send(Command::Shutdown);
        handle.join().map_err(|_| LogError::DaemonPanicked)
    }

    /// Whether the daemon is still accepting entries.
    pub fn is_running(&self) -> bool {
        !self.tx.is_closed() && self.daemon.lock().is_some()
    }
}

impl Drop for LogQueue {
    fn drop(&mut self) {
        // The daemon drains what is queued and exits; not joined here.
        let _ = self.tx.send(Command::Shutdown);
    }
}

fn drain<W: Write>(mut rx: mpsc::UnboundedReceiver<Command>, mut sink: W, formatter: EntryFormatter) {
    while let Some(command) = rx.blocking_recv() {
        match command {
            Command::Entry(entry) => write_entry(&mut sink, &formatter.format(&entry)),
            Command::Flush => flush_sink(&mut sink),
            Command::Shutdown => {
                rx.close();
                while let Ok(command) = rx.try_recv() {
                    if let Command::Entry(entry) = command {
                        write_entry(&mut sink, &formatter.format(&entry));
                    }
                }
                flush_sink(&mut sink);
                return;
            }
        }
    }
    flush_sink(&mut sink);
}

fn write_entry<W: Write>(sink: &mut W, line: &str) {
    let written = sink.write_all(line.as_bytes()).and_then(|_| sink.flush());
    if let Err(e) = written {
        eprint!("{}", line);
        eprintln!("log sink write failed: {}", e);
    }
}

fn flush_sink<W: Write>(sink: &mut W) {
    if let Err(e) = sink.flush() {
        eprintln!("log sink flush failed: {}", e);
    }
}

// ============================================================================
// `log` facade bridge
// ============================================================================

/// Routes records from the `log` facade into a [`LogQueue`].
///
/// ```rust,no_run
/// use std::sync::Arc;
/// use sluice_log::{LogConfig, LogQueue, QueueLogger};
///
/// let queue = Arc::new(LogQueue::stderr(LogConfig::default()).unwrap());
/// QueueLogger::new(queue).install().unwrap();
/// log::info!("routed through the drain daemon");
/// ```
pub struct QueueLogger {
    queue: Arc<LogQueue>,
}

impl QueueLogger {
    /// Wrap a queue.
    pub fn new(queue: Arc<LogQueue>) -> Self {
        Self { queue }
    }

    /// Install as the global `log` logger.
    pub fn install(self) -> Result<(), log::SetLoggerError> {
        let max = match self.queue.config().level {
            Level::Trace => log::LevelFilter::Trace,
            Level::Debug => log::LevelFilter::Debug,
            Level::Info => log::LevelFilter::Info,
            Level::Warn => log::LevelFilter::Warn,
            Level::Error => log::LevelFilter::Error,
            Level::Off => log::LevelFilter::Off,
        };
        log::set_boxed_logger(Box::new(self))?;
        log::set_max_level(max);
        Ok(())
    }
}

impl log::Log for QueueLogger {
    fn enabled(&self, metadata: &log::Metadata<'_>) -> bool {
        self.queue.config().is_level_enabled(metadata.level().into())
    }

    fn log(&self, record: &log::Record<'_>) {
        if !self.enabled(record.metadata()) {
            return;
        }
        self.queue.enqueue(
            LogEntry::new(record.level().into(), record.args().to_string())
                .with_target(record.target()),
        );
    }

    fn flush(&self) {
        self.queue.flush();
    }
}
