//! Boundary to the fallback network-share server.
//!
//! The wire protocol lives outside this crate. A server implementation
//! plugs in through [`ShareServerFactory`] and resolves share names to
//! filesystems through a [`ShareBackend`].

use std::io;
use std::net::TcpListener;
use std::sync::Arc;

use thiserror::Error;
use tracing::debug;

use crate::fs::FileSystem;

/// Errors reported by share servers and backends.
#[derive(Debug, Error)]
pub enum ShareError {
    /// A client asked for a share this backend does not export.
    #[error("No such share: {0}")]
    NoSuchShare(String),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Protocol level failure inside the server.
    #[error("Protocol error: {0}")]
    Protocol(String),
}

/// Resolves share paths to the filesystems they export.
pub trait ShareBackend: Send + Sync {
    /// Called when a client connects to `path` (e.g. `\\host\share`).
    fn tree_connect(&self, path: &str) -> Result<Arc<dyn FileSystem>, ShareError>;

    /// The client disconnected cleanly.
    fn tree_disconnect(&self, fs: &Arc<dyn FileSystem>);

    /// The connection dropped without a disconnect.
    fn tree_disconnect_hard(&self, fs: &Arc<dyn FileSystem>);
}

/// A running share server.
pub trait ShareServer: Send + Sync {
    /// Serve connections until [`ShareServer::close`] is called.
    fn run(&self) -> Result<(), ShareError>;

    /// Stop serving. Makes a concurrent `run` return.
    fn close(&self);
}

/// Builds a share server on an already bound listener.
pub trait ShareServerFactory: Send + Sync {
    fn create(
        &self,
        backend: Arc<dyn ShareBackend>,
        listener: TcpListener,
    ) -> Result<Arc<dyn ShareServer>, ShareError>;
}

/// Exports a single filesystem under one share name.
///
/// Only the last `\`-separated component of a connect path is compared, and
/// case is ignored, so `\\127.0.0.1\Drive` and `\\other\DRIVE` both match.
pub struct SimpleShareBackend {
    share_path: String,
    fs: Arc<dyn FileSystem>,
}

impl SimpleShareBackend {
    pub fn new(share_path: impl Into<String>, fs: Arc<dyn FileSystem>) -> Self {
        Self {
            share_path: share_path.into(),
            fs,
        }
    }

    /// Backend for `display_name` served from the loopback host.
    pub fn for_display_name(display_name: &str, fs: Arc<dyn FileSystem>) -> Self {
        Self::new(format!("\\\\127.0.0.1\\{}", display_name), fs)
    }
}

fn share_name(path: &str) -> &str {
    path.rsplit('\\').next().unwrap_or(path)
}

impl ShareBackend for SimpleShareBackend {
    fn tree_connect(&self, path: &str) -> Result<Arc<dyn FileSystem>, ShareError> {
        let requested = share_name(path);
        if requested.to_uppercase() == share_name(&self.share_path).to_uppercase() {
            debug!(path, "Share connected");
            Ok(Arc::clone(&self.fs))
        } else {
            Err(ShareError::NoSuchShare(path.to_string()))
        }
    }

    fn tree_disconnect(&self, _fs: &Arc<dyn FileSystem>) {}

    fn tree_disconnect_hard(&self, _fs: &Arc<dyn FileSystem>) {}
}
