//! Structured logging configuration
//!
//! Log lines go to stderr so that command output on stdout stays clean.
//! `RUST_LOG` overrides the configured level.

#![warn(missing_docs)]

use std::str::FromStr;
use thiserror::Error;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Logging setup errors
#[derive(Debug, Error)]
pub enum LogError {
    /// Unrecognised format name
    #[error("unknown log format '{0}' (expected pretty or compact)")]
    UnknownFormat(String),

    /// A global subscriber is already installed
    #[error("logging already initialized: {0}")]
    AlreadyInitialized(#[from] tracing_subscriber::util::TryInitError),
}

/// Logging configuration
#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,
    /// Output format (pretty, compact)
    pub format: LogFormat,
    /// Include file/line info
    pub file_info: bool,
    /// Include thread IDs
    pub thread_ids: bool,
}

/// Log output format
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    /// Pretty colored output (for humans)
    Pretty,
    /// Compact single-line format
    Compact,
}

impl FromStr for LogFormat {
    type Err = LogError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "pretty" => Ok(LogFormat::Pretty),
            "compact" => Ok(LogFormat::Compact),
            other => Err(LogError::UnknownFormat(other.to_string())),
        }
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Pretty,
            file_info: false,
            thread_ids: false,
        }
    }
}

impl LogConfig {
    /// Verbose output for interactive debugging
    pub fn development() -> Self {
        Self {
            level: "debug".to_string(),
            format: LogFormat::Pretty,
            file_info: true,
            thread_ids: false,
        }
    }

    /// Terse output for a long-running service
    pub fn service() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Compact,
            file_info: false,
            thread_ids: true,
        }
    }

    /// Build from a level and a format name
    pub fn from_settings(level: &str, format: &str) -> Result<Self, LogError> {
        Ok(Self {
            level: level.to_string(),
            format: format.parse()?,
            ..Self::default()
        })
    }

    fn filter(&self) -> EnvFilter {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&self.level))
    }
}

/// Install the global subscriber
pub fn init_logging(config: &LogConfig) -> Result<(), LogError> {
    let filter = config.filter();

    match config.format {
        LogFormat::Pretty => {
            let layer = fmt::layer()
                .pretty()
                .with_writer(std::io::stderr)
                .with_file(config.file_info)
                .with_line_number(config.file_info)
                .with_thread_ids(config.thread_ids);

            tracing_subscriber::registry().with(filter).with(layer).try_init()?;
        }
        LogFormat::Compact => {
            let layer = fmt::layer()
                .compact()
                .with_writer(std::io::stderr)
                .with_file(config.file_info)
                .with_line_number(config.file_info)
                .with_thread_ids(config.thread_ids);

            tracing_subscriber::registry().with(filter).with(layer).try_init()?;
        }
    }

    tracing::debug!(
        level = %config.level,
        format = ?config.format,
        "Logging initialized"
    );
    Ok(())
}
