//! Mount orchestration errors.

use std::io;

use thiserror::Error;

use super::share::ShareError;
use crate::fuse::TransportError;

/// Errors that end a mount attempt.
#[derive(Debug, Error)]
pub enum MountError {
    /// Neither the kernel transport nor an automatic share mount is possible
    /// on this platform.
    #[error("Unable to mount file system")]
    Unsupported,

    /// Fallback was needed but no share server implementation is configured.
    #[error("Unable to mount file system: no share server available")]
    NoShareServer,

    /// The fallback listening socket could not be bound.
    #[error("Failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: io::Error,
    },

    /// A mount point is required unless the share is served without mounting.
    #[error("No mount point given")]
    MissingMountPoint,

    #[error("Invalid listen address: {0}")]
    InvalidListenAddress(String),

    /// The kernel transport failed after the mount was established.
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("Failed to daemonize: {0}")]
    Daemonize(#[source] nix::Error),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Share server failed: {0}")]
    Server(#[from] ShareError),

    /// The backing filesystem could not be created.
    #[error("Failed to create filesystem: {0}")]
    Filesystem(#[source] io::Error),
}

/// Result type for mount operations.
pub type MountResult<T> = Result<T, MountError>;
