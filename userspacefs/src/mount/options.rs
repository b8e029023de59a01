//! Options controlling how a filesystem gets mounted.

use std::fmt;
use std::str::FromStr;

use super::error::MountError;
use crate::fuse::{ProcessHook, TransportOptions};

/// Host used when a listen address leaves it out.
pub const DEFAULT_LISTEN_HOST: &str = "127.0.0.1";

/// Address the fallback share server listens on.
///
/// Parsed from `host:port`, `host:` (random port), a bare port, or a bare
/// host. An empty host means [`DEFAULT_LISTEN_HOST`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListenAddress {
    pub host: String,
    /// `None` picks a random free port.
    pub port: Option<u16>,
}

impl Default for ListenAddress {
    fn default() -> Self {
        Self {
            host: DEFAULT_LISTEN_HOST.to_string(),
            port: None,
        }
    }
}

impl ListenAddress {
    pub fn new(host: impl Into<String>, port: Option<u16>) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

fn parse_port(s: &str) -> Option<u16> {
    s.parse::<u16>().ok().filter(|p| *p > 0)
}

impl FromStr for ListenAddress {
    type Err = MountError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (host, port) = match s.split_once(':') {
            Some((host, "")) => (host, None),
            Some((host, port)) => {
                let port = parse_port(port).ok_or_else(|| {
                    MountError::InvalidListenAddress(format!("{:?} is not a valid TCP port", port))
                })?;
                (host, Some(port))
            }
            // A bare value is a port when it is one, otherwise a host name.
            None => match parse_port(s) {
                Some(port) => ("", Some(port)),
                None => (s, None),
            },
        };
        let host = if host.is_empty() {
            DEFAULT_LISTEN_HOST
        } else {
            host
        };
        Ok(Self::new(host, port))
    }
}

impl fmt::Display for ListenAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.port {
            Some(port) => write!(f, "{}:{}", self.host, port),
            None => write!(f, "{}:", self.host),
        }
    }
}

/// How to mount and serve a filesystem.
#[derive(Clone, Default)]
pub struct MountOptions {
    /// Keep the server in the calling process instead of daemonizing.
    pub foreground: bool,
    /// Skip the kernel transport and go straight to the share server.
    pub force_fallback: bool,
    /// Serve the share but do not mount it. Implies `force_fallback`.
    pub fallback_no_mount: bool,
    pub listen_address: ListenAddress,
    /// Run once in the daemonized server process.
    pub on_new_process: Option<ProcessHook>,
    pub transport_options: TransportOptions,
}

impl fmt::Debug for MountOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MountOptions")
            .field("foreground", &self.foreground)
            .field("force_fallback", &self.force_fallback)
            .field("fallback_no_mount", &self.fallback_no_mount)
            .field("listen_address", &self.listen_address)
            .field("on_new_process", &self.on_new_process.is_some())
            .field("transport_options", &self.transport_options)
            .finish()
    }
}

impl MountOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_foreground(mut self, foreground: bool) -> Self {
        self.foreground = foreground;
        self
    }

    pub fn with_force_fallback(mut self, force: bool) -> Self {
        self.force_fallback = force;
        self
    }

    pub fn with_fallback_no_mount(mut self, no_mount: bool) -> Self {
        self.fallback_no_mount = no_mount;
        self
    }

    pub fn with_listen_address(mut self, address: ListenAddress) -> Self {
        self.listen_address = address;
        self
    }

    pub fn with_on_new_process(mut self, hook: ProcessHook) -> Self {
        self.on_new_process = Some(hook);
        self
    }

    pub fn with_transport_options(mut self, options: TransportOptions) -> Self {
        self.transport_options = options;
        self
    }

    /// Whether the kernel transport is skipped.
    pub fn skips_kernel_transport(&self) -> bool {
        self.force_fallback || self.fallback_no_mount
    }
}
