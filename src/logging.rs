//! Installs a global tracing subscriber.
//!
//! The library itself only emits `tracing` events; nothing is recorded until
//! the host application calls one of these once at startup.

use serde::{Deserialize, Serialize};
use std::{
    fs::{create_dir_all, OpenOptions},
    path::PathBuf,
    sync::Arc,
};
use thiserror::Error as ThisError;
use tracing_subscriber::{filter::LevelFilter, FmtSubscriber};

/// Where the JSON log files go and how verbose they are.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    pub directory: PathBuf,
    /// One of `off`, `error`, `warn`, `info`, `debug` or `trace`.
    pub level: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            directory: PathBuf::from("./logs"),
            level: "info".to_string(),
        }
    }
}

#[derive(Debug, ThisError)]
pub enum LoggingError {
    #[error("Could not open the log file: {0}")]
    Io(#[from] std::io::Error),
    #[error("Unrecognized log level: {0}")]
    Level(String),
    #[error("A global subscriber was already installed")]
    AlreadyInitialized,
}

/// Writes JSON events to `<directory>/debug-<timestamp>.log`. Should only be
/// called once per process.
pub fn init_logging(config: &LogConfig) -> Result<(), LoggingError> {
    let level = parse_level(&config.level)?;
    create_dir_all(&config.directory)?;
    let file_path = config.directory.join(format!(
        "debug-{}.log",
        chrono::offset::Local::now().format("%y-%m-%d_%H-%M-%S")
    ));
    let file = OpenOptions::new()
        .append(true)
        .create(true)
        .open(file_path)?;
    let subscriber = FmtSubscriber::builder()
        .with_writer(Arc::new(file))
        .with_max_level(level)
        .json()
        .finish();
    tracing::subscriber::set_global_default(subscriber)
        .map_err(|_| LoggingError::AlreadyInitialized)
}

/// Human readable events on stderr, for interactive runs.
pub fn init_stderr_logging(level: &str) -> Result<(), LoggingError> {
    let subscriber = FmtSubscriber::builder()
        .with_writer(std::io::stderr)
        .with_max_level(parse_level(level)?)
        .finish();
    tracing::subscriber::set_global_default(subscriber)
        .map_err(|_| LoggingError::AlreadyInitialized)
}

fn parse_level(level: &str) -> Result<LevelFilter, LoggingError> {
    level
        .parse::<LevelFilter>()
        .map_err(|_| LoggingError::Level(level.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_unknown_level() {
        assert!(matches!(
            parse_level("chatty"),
            Err(LoggingError::Level(level)) if level == "chatty"
        ));
        assert_eq!(parse_level("debug").unwrap(), LevelFilter::DEBUG);
    }
}
