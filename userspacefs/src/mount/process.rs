//! Process-level effects: daemonizing, external commands, mount probing.

use std::fs;
use std::io;
use std::os::unix::fs::MetadataExt;
use std::os::unix::process::ExitStatusExt;
use std::path::Path;
use std::process::Command;

use nix::fcntl::OFlag;
use nix::sys::stat::Mode;
use nix::unistd::{self, ForkResult, Pid};
use tracing::debug;

/// Which side of a [`daemonize`] call we are on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Daemonized {
    Parent(Pid),
    Child,
}

/// Fork a detached server process.
///
/// The child starts a new session, moves to `/` and points stdio at
/// `/dev/null`. The parent gets the child's pid back and is left untouched.
pub fn daemonize() -> nix::Result<Daemonized> {
    // SAFETY: callers fork before spawning threads of their own, and the
    // child only performs async-signal-safe calls before returning.
    match unsafe { unistd::fork() }? {
        ForkResult::Parent { child } => Ok(Daemonized::Parent(child)),
        ForkResult::Child => {
            unistd::setsid()?;
            unistd::chdir("/")?;
            let null = nix::fcntl::open("/dev/null", OFlag::O_RDWR, Mode::empty())?;
            for fd in 0..=2 {
                unistd::dup2(null, fd)?;
            }
            if null > 2 {
                unistd::close(null)?;
            }
            Ok(Daemonized::Child)
        }
    }
}

/// Runs external programs.
pub trait CommandRunner: Send + Sync {
    /// Run `program` with `args` to completion and return its exit status.
    /// A process killed by a signal reports the negated signal number.
    fn run(&self, program: &str, args: &[&str]) -> io::Result<i32>;
}

/// [`CommandRunner`] that spawns real processes.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemCommandRunner;

impl CommandRunner for SystemCommandRunner {
    fn run(&self, program: &str, args: &[&str]) -> io::Result<i32> {
        debug!(program, ?args, "Running command");
        let status = Command::new(program).args(args).status()?;
        Ok(status
            .code()
            .or_else(|| status.signal().map(|s| -s))
            .unwrap_or(-1))
    }
}

/// Answers whether a path is currently an active mount point.
pub trait MountProbe: Send + Sync {
    fn is_mounted(&self, path: &Path) -> bool;
}

/// [`MountProbe`] comparing the device and inode of a path with its parent.
///
/// A path is a mount point when it sits on a different device than its
/// parent, or when it is its own parent (`/`). Symlinks never are.
#[derive(Debug, Clone, Copy, Default)]
pub struct StatMountProbe;

impl MountProbe for StatMountProbe {
    fn is_mounted(&self, path: &Path) -> bool {
        let Ok(meta) = fs::symlink_metadata(path) else {
            return false;
        };
        if meta.file_type().is_symlink() {
            return false;
        }
        let Ok(parent) = fs::symlink_metadata(path.join("..")) else {
            return false;
        };
        meta.dev() != parent.dev() || meta.ino() == parent.ino()
    }
}

/// What the host platform can do for the fallback path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlatformCaps {
    /// The OS can mount the fallback share with `mount -t smbfs`.
    pub can_automount_share: bool,
    /// The OS share client mangles special characters in file names.
    pub needs_path_conversion: bool,
}

impl PlatformCaps {
    /// Capabilities of the platform this binary was built for.
    pub fn current() -> Self {
        let macos = cfg!(target_os = "macos");
        Self {
            can_automount_share: macos,
            needs_path_conversion: macos,
        }
    }
}

impl Default for PlatformCaps {
    fn default() -> Self {
        Self::current()
    }
}
