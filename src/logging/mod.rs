//! Logging setup for memreclaim binaries
//!
//! The library only emits `tracing` events; it never installs a subscriber.
//! Binaries (and tests that want output) call one of the `init_*`
//! functions here.
//!
//! # Environment Variables
//!
//! - `RUST_LOG`: Standard tracing filter, takes precedence when set
//! - `MEMRECLAIM_LOG_LEVEL`: Simple log level (error, warn, info, debug, trace)
//! - `MEMRECLAIM_LOG_FORMAT`: Output format ("human" or "json")
//! - `MEMRECLAIM_LOG_FILE`: Optional file receiving a JSON copy of the log

use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use once_cell::sync::OnceCell;
use thiserror::Error;
use tracing_subscriber::{
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter,
};

/// Set once the global subscriber is installed
static TRACING_INITIALIZED: OnceCell<()> = OnceCell::new();

/// Environment variable for log level override
pub const LOG_LEVEL_ENV: &str = "MEMRECLAIM_LOG_LEVEL";

/// Environment variable for log format (json/human)
pub const LOG_FORMAT_ENV: &str = "MEMRECLAIM_LOG_FORMAT";

/// Environment variable for log file path
pub const LOG_FILE_ENV: &str = "MEMRECLAIM_LOG_FILE";

/// Errors that can occur during logging initialization
#[derive(Debug, Error)]
pub enum LoggingError {
    #[error("invalid log filter: {0}")]
    InvalidFilter(String),

    #[error("failed to create log directory {path}: {reason}")]
    DirectoryCreationFailed { path: PathBuf, reason: String },

    #[error("failed to open log file {path}: {reason}")]
    FileOpenFailed { path: PathBuf, reason: String },

    #[error("global subscriber already set: {0}")]
    AlreadySet(String),
}

/// Log level
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogLevel {
    Error,
    /// Default: only reclaim failures are shown
    #[default]
    Warn,
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    /// Parse a level name, case-insensitively
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "error" => Some(LogLevel::Error),
            "warn" | "warning" => Some(LogLevel::Warn),
            "info" => Some(LogLevel::Info),
            "debug" => Some(LogLevel::Debug),
            "trace" => Some(LogLevel::Trace),
            _ => None,
        }
    }

    pub fn as_tracing_level(&self) -> tracing::Level {
        match self {
            LogLevel::Error => tracing::Level::ERROR,
            LogLevel::Warn => tracing::Level::WARN,
            LogLevel::Info => tracing::Level::INFO,
            LogLevel::Debug => tracing::Level::DEBUG,
            LogLevel::Trace => tracing::Level::TRACE,
        }
    }

    pub fn as_filter_str(&self) -> &'static str {
        match self {
            LogLevel::Error => "error",
            LogLevel::Warn => "warn",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
            LogLevel::Trace => "trace",
        }
    }
}

/// Console output format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    /// Human-readable colored output (default)
    #[default]
    Human,
    /// JSON structured output
    Json,
}

impl LogFormat {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "human" | "pretty" | "console" => Some(LogFormat::Human),
            "json" | "structured" => Some(LogFormat::Json),
            _ => None,
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Default)]
pub struct LoggingConfig {
    pub level: LogLevel,
    pub format: LogFormat,
    /// Include file/line in console records
    pub with_file_info: bool,
    /// Emit span close events
    pub with_span_events: bool,
    /// Optional file receiving JSON records
    pub log_file: Option<PathBuf>,
}

impl LoggingConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a configuration from the `MEMRECLAIM_LOG_*` variables
    ///
    /// Unset or unparsable values fall back to the defaults.
    pub fn from_env() -> Self {
        let mut config = Self::new();
        if let Some(level) = std::env::var(LOG_LEVEL_ENV).ok().and_then(|s| LogLevel::parse(&s)) {
            config.level = level;
        }
        if let Some(format) = std::env::var(LOG_FORMAT_ENV)
            .ok()
            .and_then(|s| LogFormat::parse(&s))
        {
            config.format = format;
        }
        if let Ok(path) = std::env::var(LOG_FILE_ENV) {
            if !path.is_empty() {
                config.log_file = Some(PathBuf::from(path));
            }
        }
        config
    }

    pub fn with_level(mut self, level: LogLevel) -> Self {
        self.level = level;
        self
    }

    pub fn with_format(mut self, format: LogFormat) -> Self {
        self.format = format;
        self
    }

    pub fn with_file_info(mut self, with_file_info: bool) -> Self {
        self.with_file_info = with_file_info;
        self
    }

    pub fn with_span_events(mut self, with_span_events: bool) -> Self {
        self.with_span_events = with_span_events;
        self
    }

    pub fn with_log_file(mut self, path: PathBuf) -> Self {
        self.log_file = Some(path);
        self
    }
}

/// Initialize logging from the environment, ignoring failures.
///
/// Idempotent: only the first call installs a subscriber.
pub fn init_logging_default() {
    if let Err(e) = init_with_config(&LoggingConfig::from_env()) {
        eprintln!("memreclaim: logging disabled: {}", e);
    }
}

/// Initialize logging with a custom configuration.
///
/// Idempotent: once a subscriber is installed, later calls return `Ok(())`
/// without changing it.
pub fn init_with_config(config: &LoggingConfig) -> Result<(), LoggingError> {
    TRACING_INITIALIZED
        .get_or_try_init(|| install_subscriber(config))
        .map(|_| ())
}

/// Check if tracing has been initialized
pub fn is_initialized() -> bool {
    TRACING_INITIALIZED.get().is_some()
}

fn install_subscriber(config: &LoggingConfig) -> Result<(), LoggingError> {
    let env_filter = build_env_filter(config.level)?;

    // The file copy is always JSON, whatever the console format
    let file_layer = match &config.log_file {
        Some(path) => Some(
            fmt::layer()
                .json()
                .with_writer(Mutex::new(open_log_file(path)?))
                .with_target(false)
                .with_file(true)
                .with_line_number(true)
                .with_ansi(false)
                .with_span_events(span_events(config.with_span_events)),
        ),
        None => None,
    };

    let registry = tracing_subscriber::registry().with(env_filter).with(file_layer);

    let installed = match config.format {
        LogFormat::Json => registry
            .with(
                fmt::layer()
                    .json()
                    .with_target(false)
                    .with_file(config.with_file_info)
                    .with_line_number(config.with_file_info)
                    .with_span_events(span_events(config.with_span_events)),
            )
            .try_init(),
        LogFormat::Human => registry
            .with(
                fmt::layer()
                    .with_target(true)
                    .with_thread_ids(false)
                    .with_thread_names(false)
                    .with_file(config.with_file_info)
                    .with_line_number(config.with_file_info)
                    .with_span_events(span_events(config.with_span_events)),
            )
            .try_init(),
    };

    installed.map_err(|e| LoggingError::AlreadySet(e.to_string()))
}

fn span_events(enabled: bool) -> FmtSpan {
    if enabled {
        FmtSpan::CLOSE
    } else {
        FmtSpan::NONE
    }
}

fn open_log_file(path: &Path) -> Result<File, LoggingError> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent).map_err(|e| {
                LoggingError::DirectoryCreationFailed {
                    path: parent.to_path_buf(),
                    reason: e.to_string(),
                }
            })?;
        }
    }

    std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|e| LoggingError::FileOpenFailed {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })
}

/// RUST_LOG wins over the configured level
fn build_env_filter(default_level: LogLevel) -> Result<EnvFilter, LoggingError> {
    if let Ok(rust_log) = std::env::var("RUST_LOG") {
        return EnvFilter::try_new(rust_log).map_err(|e| LoggingError::InvalidFilter(e.to_string()));
    }
    Ok(EnvFilter::new(default_level.as_filter_str()))
}
