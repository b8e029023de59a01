//! CLI error type.

use std::io;
use std::path::PathBuf;

use thiserror::Error;
use userspacefs::config::ConfigError;
use userspacefs::logging::LoggingError;
use userspacefs::mount::MountError;

#[derive(Debug, Error)]
pub enum CliError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Logging error: {0}")]
    Logging(#[from] LoggingError),

    #[error("Invalid source directory {path}: {source}")]
    Source {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("{0}")]
    Mount(#[from] MountError),
}

impl CliError {
    /// Process exit status for this error.
    pub fn exit_code(&self) -> i32 {
        match self {
            CliError::Mount(_) => -1,
            _ => 2,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_codes() {
        assert_eq!(CliError::Mount(MountError::Unsupported).exit_code(), -1);
        let err = CliError::Source {
            path: PathBuf::from("/nope"),
            source: io::Error::from(io::ErrorKind::NotFound),
        };
        assert_eq!(err.exit_code(), 2);
        assert!(err.to_string().contains("/nope"));
    }
}
