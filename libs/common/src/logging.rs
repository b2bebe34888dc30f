//! Unified logging module for the sync services
//!
//! Console output always, plus an optional daily rolling log file written
//! through a non-blocking `tracing-appender` worker.

use std::fs;
use std::path::PathBuf;

use errors::{SyncError, SyncResult};
use tracing::Level;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{
    fmt::{self, format::Writer, FmtContext, FormatEvent, FormatFields},
    layer::SubscriberExt,
    registry::LookupSpan,
    util::SubscriberInitExt,
    EnvFilter, Layer,
};

/// Custom format for log level with brackets: `[INFO]`, `[WARN]`, etc.
fn format_level(level: &Level) -> &'static str {
    match *level {
        Level::TRACE => "[TRACE]",
        Level::DEBUG => "[DEBUG]",
        Level::INFO => "[INFO]",
        Level::WARN => "[WARN]",
        Level::ERROR => "[ERROR]",
    }
}

/// Event formatter that outputs: `timestamp [LEVEL] message`
struct BracketedLevelFormat;

impl<S, N> FormatEvent<S, N> for BracketedLevelFormat
where
    S: tracing::Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        ctx: &FmtContext<'_, S, N>,
        mut writer: Writer<'_>,
        event: &tracing::Event<'_>,
    ) -> std::fmt::Result {
        let now = chrono::Utc::now();
        write!(writer, "{} ", now.format("%Y-%m-%dT%H:%M:%S%.3fZ"))?;

        let level = *event.metadata().level();
        if writer.has_ansi_escapes() {
            let color = match level {
                Level::TRACE => "\x1b[35m",
                Level::DEBUG => "\x1b[34m",
                Level::INFO => "\x1b[32m",
                Level::WARN => "\x1b[33m",
                Level::ERROR => "\x1b[31m",
            };
            write!(writer, "{}{}\x1b[0m ", color, format_level(&level))?;
        } else {
            write!(writer, "{} ", format_level(&level))?;
        }

        ctx.field_format().format_fields(writer.by_ref(), event)?;

        writeln!(writer)
    }
}

/// Logger configuration
#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Service name, also used as the default filter target
    pub service_name: String,
    /// Base level when `RUST_LOG` is not set
    pub level: String,
    /// Directory for the rolling log file; `None` logs to console only
    pub log_dir: Option<PathBuf>,
    /// File name prefix inside `log_dir`
    pub file_name: String,
    /// Enable JSON format for the file layer
    pub enable_json: bool,
    /// Colored console output
    pub ansi: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            service_name: "syncsrv".to_string(),
            level: "info".to_string(),
            log_dir: None,
            file_name: "syncsrv.log".to_string(),
            enable_json: false,
            ansi: true,
        }
    }
}

/// Keeps the non-blocking file writer alive; drop it only at process exit
#[must_use = "dropping the guard stops the log file writer"]
pub struct LogGuard {
    _file: Option<WorkerGuard>,
}

/// Build the filter directive string
///
/// An explicit `RUST_LOG` always wins. Otherwise the configured level applies
/// to everything and the HTTP stack is kept at `warn` so per-request chatter
/// does not drown the sync cycle logs.
pub fn filter_directive(env: Option<&str>, level: &str) -> String {
    match env {
        Some(directive) if !directive.trim().is_empty() => directive.to_string(),
        _ => format!("{},hyper=warn,reqwest=warn,rustls=warn", level),
    }
}

/// Initialize logging system with configuration
pub fn init_with_config(config: LogConfig) -> SyncResult<LogGuard> {
    let env = std::env::var("RUST_LOG").ok();
    let directive = filter_directive(env.as_deref(), &config.level);
    let env_filter = EnvFilter::try_new(&directive)
        .map_err(|e| SyncError::Config(format!("Invalid log filter '{}': {}", directive, e)))?;

    let console_layer = fmt::layer()
        .with_ansi(config.ansi)
        .event_format(BracketedLevelFormat)
        .boxed();

    let (file_layer, file_guard) = match &config.log_dir {
        Some(dir) => {
            fs::create_dir_all(dir)?;
            let appender = tracing_appender::rolling::daily(dir, &config.file_name);
            let (non_blocking, guard) = tracing_appender::non_blocking(appender);

            let layer = if config.enable_json {
                fmt::layer()
                    .json()
                    .with_writer(non_blocking)
                    .with_level(true)
                    .with_target(true)
                    .boxed()
            } else {
                fmt::layer()
                    .with_writer(non_blocking)
                    .with_ansi(false)
                    .event_format(BracketedLevelFormat)
                    .boxed()
            };
            (Some(layer), Some(guard))
        },
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(console_layer)
        .with(file_layer)
        .try_init()
        .map_err(|e| SyncError::Internal(format!("Logging already initialized: {}", e)))?;

    tracing::info!(
        "Logging: {} @ {}",
        config.service_name,
        config
            .log_dir
            .as_ref()
            .map(|d| d.join(&config.file_name).display().to_string())
            .unwrap_or_else(|| "console".to_string())
    );

    Ok(LogGuard { _file: file_guard })
}
