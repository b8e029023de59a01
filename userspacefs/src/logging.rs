//! Logging setup.
//!
//! Foreground servers log to stderr with local timestamps. Daemonized
//! servers have no terminal, so they log to
//! `<cache dir>/userspacefs/<display name>.log`. The file writer is
//! synchronous: a background worker thread would not survive `fork`.

use std::fs;
use std::io;
use std::path::PathBuf;

use thiserror::Error;
use time::format_description::BorrowedFormatItem;
use time::macros::format_description;
use tracing_appender::rolling::{InitError, RollingFileAppender, Rotation};
use tracing_subscriber::fmt::time::LocalTime;
use tracing_subscriber::util::TryInitError;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Errors setting up logging.
#[derive(Debug, Error)]
pub enum LoggingError {
    #[error("Failed to create log directory {path}: {source}")]
    Directory {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Failed to open log file: {0}")]
    Appender(#[from] InitError),

    #[error("Logging already initialized: {0}")]
    AlreadyInitialized(#[from] TryInitError),
}

const TIMESTAMP: &[BorrowedFormatItem<'static>] = format_description!(
    "[year]-[month]-[day] [hour]:[minute]:[second].[subsecond digits:3]"
);

fn timer() -> LocalTime<&'static [BorrowedFormatItem<'static>]> {
    LocalTime::new(TIMESTAMP)
}

/// Filter directive for a `-v` count.
pub fn level_for_verbosity(verbosity: u8) -> &'static str {
    match verbosity {
        0 => "warn",
        1 => "info",
        _ => "debug",
    }
}

/// Directory background logs are written to.
pub fn log_dir() -> Option<PathBuf> {
    dirs::cache_dir().map(|dir| dir.join("userspacefs"))
}

/// File name prefix for a display name, with path separators replaced.
pub fn log_file_prefix(display_name: &str) -> String {
    let cleaned: String = display_name
        .chars()
        .map(|c| if c == '/' || c == '\\' || c.is_control() { '_' } else { c })
        .collect();
    if cleaned.is_empty() || cleaned == "." || cleaned == ".." {
        "userspacefs".to_string()
    } else {
        cleaned
    }
}

/// Install the global subscriber. `RUST_LOG` overrides `verbosity`.
pub fn init(foreground: bool, verbosity: u8, display_name: &str) -> Result<(), LoggingError> {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level_for_verbosity(verbosity)));
    let registry = tracing_subscriber::registry().with(env_filter);

    let dir = match log_dir() {
        Some(dir) if !foreground => dir,
        _ => {
            let layer = fmt::layer()
                .with_writer(io::stderr)
                .with_timer(timer());
            registry.with(layer).try_init()?;
            return Ok(());
        }
    };

    fs::create_dir_all(&dir).map_err(|source| LoggingError::Directory {
        path: dir.clone(),
        source,
    })?;
    let appender = RollingFileAppender::builder()
        .rotation(Rotation::NEVER)
        .filename_prefix(log_file_prefix(display_name))
        .filename_suffix("log")
        .build(&dir)?;
    let layer = fmt::layer()
        .with_ansi(false)
        .with_writer(appender)
        .with_timer(timer());
    registry.with(layer).try_init()?;
    Ok(())
}
