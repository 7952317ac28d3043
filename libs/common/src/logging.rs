//! Unified logging module for gateway services
//!
//! Console output uses a compact `timestamp [LEVEL] message` format. An optional
//! file sink rolls daily through `tracing-appender` and writes either the same
//! compact format or JSON lines.

use std::path::PathBuf;
use std::sync::{Mutex, OnceLock};

use serde::{Deserialize, Serialize};
use tracing::Level;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{
    fmt::{self, format::Writer, FmtContext, FormatEvent, FormatFields},
    layer::SubscriberExt,
    registry::LookupSpan,
    reload,
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

/// Event formatter that outputs: `timestamp [LEVEL] message key=value ...`
///
/// Example output: `2025-12-02T00:50:44.809123Z [INFO] device=inv1 Connected`
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
        write!(writer, "{} ", now.format("%Y-%m-%dT%H:%M:%S%.6fZ"))?;

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

/// Output format of the file sink
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

/// Logger configuration
#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Service name, used as default filter target and file prefix
    pub service_name: String,
    /// Default level for the service target when `RUST_LOG` is unset
    pub level: Level,
    /// Directory for the daily rolling file; `None` disables file output
    pub log_dir: Option<PathBuf>,
    /// File sink format
    pub file_format: LogFormat,
    /// Colorize console output
    pub ansi: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            service_name: "unknown".to_string(),
            level: Level::INFO,
            log_dir: None,
            file_format: LogFormat::Text,
            ansi: true,
        }
    }
}

/// Errors raised while installing the global subscriber
#[derive(Debug, thiserror::Error)]
pub enum LogInitError {
    #[error("Logging already initialized")]
    AlreadyInitialized,
    #[error("Failed to create log directory {path}: {source}")]
    LogDir {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Invalid log filter '{0}'")]
    Filter(String),
}

// Keeps the non-blocking file writer alive for the whole process
static FILE_GUARD: OnceLock<WorkerGuard> = OnceLock::new();

type EnvFilterReloadHandle = reload::Handle<EnvFilter, tracing_subscriber::Registry>;
static LOG_FILTER_HANDLE: OnceLock<EnvFilterReloadHandle> = OnceLock::new();
static CURRENT_LOG_LEVEL: OnceLock<Mutex<String>> = OnceLock::new();

/// Build the default filter string: `RUST_LOG` wins, else `info,<service>=<level>`
pub fn default_filter(config: &LogConfig) -> String {
    match std::env::var("RUST_LOG") {
        Ok(env_str) if !env_str.trim().is_empty() => env_str,
        _ => format!(
            "info,{}={}",
            config.service_name,
            config.level.as_str().to_lowercase()
        ),
    }
}

/// Initialize logging system with configuration
pub fn init_with_config(config: LogConfig) -> Result<(), LogInitError> {
    let filter_str = default_filter(&config);
    let env_filter =
        EnvFilter::try_new(&filter_str).map_err(|_| LogInitError::Filter(filter_str.clone()))?;

    let (reload_filter, reload_handle) = reload::Layer::new(env_filter);
    LOG_FILTER_HANDLE
        .set(reload_handle)
        .map_err(|_| LogInitError::AlreadyInitialized)?;
    let _ = CURRENT_LOG_LEVEL.set(Mutex::new(filter_str));

    let console_layer = fmt::layer()
        .with_ansi(config.ansi)
        .event_format(BracketedLevelFormat)
        .boxed();

    let file_layer = match &config.log_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir).map_err(|source| LogInitError::LogDir {
                path: dir.clone(),
                source,
            })?;
            let appender =
                tracing_appender::rolling::daily(dir, format!("{}.log", config.service_name));
            let (non_blocking, guard) = tracing_appender::non_blocking(appender);
            let _ = FILE_GUARD.set(guard);

            let layer = match config.file_format {
                LogFormat::Json => fmt::layer()
                    .json()
                    .with_writer(non_blocking)
                    .with_target(true)
                    .boxed(),
                LogFormat::Text => fmt::layer()
                    .with_writer(non_blocking)
                    .with_ansi(false)
                    .event_format(BracketedLevelFormat)
                    .boxed(),
            };
            Some(layer)
        },
        None => None,
    };

    tracing_subscriber::registry()
        .with(reload_filter)
        .with(console_layer)
        .with(file_layer)
        .try_init()
        .map_err(|_| LogInitError::AlreadyInitialized)?;

    tracing::info!("Logging: {} @ {:?}", config.service_name, config.log_dir);
    Ok(())
}

/// Dynamically set log filter level at runtime
///
/// # Arguments
/// * `level` - Log level string (e.g., "debug") or a full filter directive
///   (e.g., "info,gatewaysrv=trace")
pub fn set_log_level(level: &str) -> Result<(), String> {
    let handle = LOG_FILTER_HANDLE
        .get()
        .ok_or("Logging not initialized with reload support")?;

    let new_filter =
        EnvFilter::try_new(level).map_err(|e| format!("Invalid log level '{}': {}", level, e))?;

    handle
        .reload(new_filter)
        .map_err(|e| format!("Failed to reload log filter: {}", e))?;

    if let Some(current) = CURRENT_LOG_LEVEL.get() {
        if let Ok(mut guard) = current.lock() {
            *guard = level.to_string();
        }
    }

    tracing::info!("Log level changed to: {}", level);
    Ok(())
}

/// Get current log filter level
pub fn get_log_level() -> String {
    CURRENT_LOG_LEVEL
        .get()
        .and_then(|m| m.lock().ok())
        .map(|guard| guard.clone())
        .unwrap_or_else(|| "unknown".to_string())
}
