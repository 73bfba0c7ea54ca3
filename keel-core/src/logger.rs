//! The structured runtime logger.
//!
//! Lines always flow through `tracing`; printing to stdout is governed by
//! the run options (threshold, strategy, buffering). With buffering on,
//! lines queue until boot completes and flush right before the ready
//! signal.

use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use tracing_subscriber::EnvFilter;

/// Severity of a log line.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    fn label(self) -> &'static str {
        match self {
            LogLevel::Trace => "TRACE",
            LogLevel::Debug => "DEBUG",
            LogLevel::Info => "INFO",
            LogLevel::Warn => "WARN",
            LogLevel::Error => "ERROR",
        }
    }
}

/// How printed lines are rendered.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum PrintStrategy {
    /// Timestamped, aligned, human-first.
    #[default]
    Pretty,
    /// Level and message only.
    Plain,
    /// One JSON object per line.
    Json,
    /// Indented JSON objects.
    JsonPretty,
}

/// Logger configuration, part of the run options.
#[derive(Clone, Debug)]
pub struct LogOptions {
    /// Minimum level that prints; `None` disables printing entirely.
    pub print_threshold: Option<LogLevel>,
    pub print_strategy: PrintStrategy,
    /// Queue lines until the ready signal, then flush.
    pub buffer_logs: bool,
}

impl Default for LogOptions {
    fn default() -> Self {
        Self {
            print_threshold: Some(LogLevel::Info),
            print_strategy: PrintStrategy::Pretty,
            buffer_logs: false,
        }
    }
}

#[derive(Clone, Debug)]
struct LogLine {
    level: LogLevel,
    message: String,
    timestamp: DateTime<Utc>,
    fields: Option<serde_json::Value>,
}

struct LoggerInner {
    options: LogOptions,
    /// `Some` while buffering; `None` once flushed (or never buffering).
    buffer: Mutex<Option<Vec<LogLine>>>,
}

/// Structured logger exposed on the runtime façade.
#[derive(Clone)]
pub struct Logger {
    inner: Arc<LoggerInner>,
}

impl Logger {
    pub(crate) fn new(options: LogOptions) -> Self {
        let buffer = Mutex::new(options.buffer_logs.then(Vec::new));
        Self {
            inner: Arc::new(LoggerInner { options, buffer }),
        }
    }

    pub fn trace(&self, message: impl Into<String>) {
        self.log(LogLevel::Trace, message, None);
    }

    pub fn debug(&self, message: impl Into<String>) {
        self.log(LogLevel::Debug, message, None);
    }

    pub fn info(&self, message: impl Into<String>) {
        self.log(LogLevel::Info, message, None);
    }

    pub fn warn(&self, message: impl Into<String>) {
        self.log(LogLevel::Warn, message, None);
    }

    pub fn error(&self, message: impl Into<String>) {
        self.log(LogLevel::Error, message, None);
    }

    /// Log with structured fields.
    pub fn log(
        &self,
        level: LogLevel,
        message: impl Into<String>,
        fields: Option<serde_json::Value>,
    ) {
        let message = message.into();
        emit_tracing(level, &message);

        let Some(threshold) = self.inner.options.print_threshold else {
            return;
        };
        if level < threshold {
            return;
        }

        let line = LogLine {
            level,
            message,
            timestamp: Utc::now(),
            fields,
        };

        let mut buffer = self.inner.buffer.lock().unwrap();
        match buffer.as_mut() {
            Some(pending) => pending.push(line),
            None => self.print(&line),
        }
    }

    /// Drain the buffer and stop buffering. Called once when boot
    /// completes; safe to call again.
    pub(crate) fn flush(&self) {
        let pending = self.inner.buffer.lock().unwrap().take();
        if let Some(pending) = pending {
            for line in &pending {
                self.print(line);
            }
        }
    }

    fn print(&self, line: &LogLine) {
        match self.inner.options.print_strategy {
            PrintStrategy::Pretty => {
                let fields = line
                    .fields
                    .as_ref()
                    .map(|f| format!(" {f}"))
                    .unwrap_or_default();
                println!(
                    "{} {:>5} {}{}",
                    line.timestamp.format("%Y-%m-%dT%H:%M:%S%.3fZ"),
                    line.level.label(),
                    line.message,
                    fields
                );
            }
            PrintStrategy::Plain => println!("{:>5} {}", line.level.label(), line.message),
            PrintStrategy::Json | PrintStrategy::JsonPretty => {
                let value = serde_json::json!({
                    "timestamp": line.timestamp.to_rfc3339(),
                    "level": line.level.label(),
                    "message": line.message,
                    "fields": line.fields,
                });
                let rendered = if self.inner.options.print_strategy == PrintStrategy::Json {
                    value.to_string()
                } else {
                    serde_json::to_string_pretty(&value).unwrap_or_else(|_| value.to_string())
                };
                println!("{rendered}");
            }
        }
    }
}

/// Forward a line into the ambient `tracing` subscriber.
fn emit_tracing(level: LogLevel, message: &str) {
    match level {
        LogLevel::Trace => tracing::trace!("{}", message),
        LogLevel::Debug => tracing::debug!("{}", message),
        LogLevel::Info => tracing::info!("{}", message),
        LogLevel::Warn => tracing::warn!("{}", message),
        LogLevel::Error => tracing::error!("{}", message),
    }
}

/// Initialise the global `tracing` subscriber with a standard `fmt` layer.
///
/// Respects the `RUST_LOG` environment variable, falling back to `info`.
/// Call once at the start of `main`, before any tracing macro.
pub fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".parse().unwrap()))
        .init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn buffered_lines_flush_once() {
        let logger = Logger::new(LogOptions {
            print_threshold: Some(LogLevel::Info),
            print_strategy: PrintStrategy::Plain,
            buffer_logs: true,
        });
        logger.info("one");
        logger.warn("two");
        assert_eq!(
            logger.inner.buffer.lock().unwrap().as_ref().map(Vec::len),
            Some(2)
        );
        logger.flush();
        assert!(logger.inner.buffer.lock().unwrap().is_none());
        // after flushing, lines print immediately instead of queueing
        logger.info("three");
        assert!(logger.inner.buffer.lock().unwrap().is_none());
    }

    #[test]
    fn threshold_filters() {
        let logger = Logger::new(LogOptions {
            print_threshold: Some(LogLevel::Warn),
            print_strategy: PrintStrategy::Plain,
            buffer_logs: true,
        });
        logger.debug("quiet");
        logger.info("quiet");
        logger.error("loud");
        assert_eq!(
            logger.inner.buffer.lock().unwrap().as_ref().map(Vec::len),
            Some(1)
        );
    }

    #[test]
    fn null_threshold_disables_printing() {
        let logger = Logger::new(LogOptions {
            print_threshold: None,
            print_strategy: PrintStrategy::Plain,
            buffer_logs: true,
        });
        logger.error("dropped");
        // buffering is moot when printing is disabled
        assert_eq!(
            logger.inner.buffer.lock().unwrap().as_ref().map(Vec::len),
            Some(0)
        );
    }
}
