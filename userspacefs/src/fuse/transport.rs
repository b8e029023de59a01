//! Kernel transport: availability probe, session setup and the serve loop.
//!
//! [`KernelTransport`] is the seam the mount orchestrator talks to. The
//! production implementation, [`FuserTransport`], mounts through `fuser`
//! and serves requests on the calling thread until the mount goes away.
//!
//! # Failure classes
//!
//! | Error | Meaning | Orchestrator reaction |
//! |-------|---------|-----------------------|
//! | [`TransportError::Unavailable`] | No kernel support installed | Fall back |
//! | [`TransportError::Runtime`] | Mount attempt rejected | Fall back |
//! | [`TransportError::Fatal`] | Failure after the mount went live | Propagate |

use std::collections::BTreeMap;
use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use fuser::{MountOption, Session};
use nix::sys::signal::{SigSet, Signal};
use thiserror::Error;
use tracing::{debug, info, warn};

use super::adapter::{Adapter, FsFactory};
use super::filesystem::FuseFilesystem;
use super::unmount;
use crate::mount::process::{daemonize, Daemonized};

/// Callback run once in the process that ends up serving the mount.
pub type ProcessHook = Arc<dyn Fn() + Send + Sync>;

/// Errors from the kernel transport.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The kernel transport is not installed on this system.
    #[error("Kernel transport unavailable: {0}")]
    Unavailable(String),

    /// The mount attempt failed before anything was served.
    #[error("Kernel transport mount failed: {0}")]
    Runtime(#[source] io::Error),

    /// The transport failed after the mount was established.
    #[error("Kernel transport failed: {0}")]
    Fatal(String),
}

/// Value of a `-o` transport option.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OptionValue {
    /// Bare `key`.
    Flag,
    /// `key=value`.
    Value(String),
}

/// Extra options passed through to the kernel transport, e.g. from
/// `-o allow_other,uid=1000`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransportOptions {
    entries: BTreeMap<String, OptionValue>,
}

impl TransportOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse a comma separated `key[=value]` list.
    ///
    /// Later keys replace earlier ones; empty items are skipped.
    pub fn parse(list: &str) -> Self {
        let mut options = Self::new();
        options.extend_from_str(list);
        options
    }

    /// Merge a comma separated `key[=value]` list into this set.
    pub fn extend_from_str(&mut self, list: &str) {
        for item in list.split(',').filter(|item| !item.is_empty()) {
            match item.split_once('=') {
                Some((key, value)) => self.set(key, OptionValue::Value(value.to_string())),
                None => self.set(item, OptionValue::Flag),
            }
        }
    }

    pub fn set(&mut self, key: impl Into<String>, value: OptionValue) {
        self.entries.insert(key.into(), value);
    }

    pub fn get(&self, key: &str) -> Option<&OptionValue> {
        self.entries.get(key)
    }

    /// Copy every entry of `other` that is not already set here.
    pub fn merge_defaults(&mut self, other: &TransportOptions) {
        for (key, value) in &other.entries {
            self.entries
                .entry(key.clone())
                .or_insert_with(|| value.clone());
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &OptionValue)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl fmt::Display for TransportOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for (key, value) in &self.entries {
            if !first {
                f.write_str(",")?;
            }
            first = false;
            match value {
                OptionValue::Flag => write!(f, "{}", key)?,
                OptionValue::Value(v) => write!(f, "{}={}", key, v)?,
            }
        }
        Ok(())
    }
}

/// Everything needed to mount and serve one filesystem.
pub struct TransportRequest {
    pub display_name: String,
    pub mount_point: PathBuf,
    pub foreground: bool,
    pub options: TransportOptions,
    pub factory: FsFactory,
    pub on_new_process: Option<ProcessHook>,
}

/// A kernel user-space filesystem transport.
pub trait KernelTransport: Send + Sync {
    /// Check that the transport is installed.
    fn probe(&self) -> Result<(), TransportError>;

    /// Mount and serve until unmounted. In background mode the calling
    /// process returns right after the mount succeeds.
    fn mount(&self, request: TransportRequest) -> Result<i32, TransportError>;
}

/// Build the `fuser` mount options for a request.
pub fn mount_options(display_name: &str, options: &TransportOptions) -> Vec<MountOption> {
    let mut out = Vec::with_capacity(options.len() + 3);
    if options.get("fsname").is_none() {
        out.push(MountOption::FSName(display_name.to_string()));
    }
    if options.get("default_permissions").is_none() {
        out.push(MountOption::DefaultPermissions);
    }
    if cfg!(target_os = "macos") && options.get("volname").is_none() {
        out.push(MountOption::CUSTOM(format!("volname={}", display_name)));
    }
    out.extend(options.iter().map(|(key, value)| to_mount_option(key, value)));
    out
}

fn to_mount_option(key: &str, value: &OptionValue) -> MountOption {
    match (key, value) {
        ("allow_other", OptionValue::Flag) => MountOption::AllowOther,
        ("allow_root", OptionValue::Flag) => MountOption::AllowRoot,
        ("auto_unmount", OptionValue::Flag) => MountOption::AutoUnmount,
        ("default_permissions", OptionValue::Flag) => MountOption::DefaultPermissions,
        ("ro", OptionValue::Flag) => MountOption::RO,
        ("rw", OptionValue::Flag) => MountOption::RW,
        ("fsname", OptionValue::Value(v)) => MountOption::FSName(v.clone()),
        ("subtype", OptionValue::Value(v)) => MountOption::Subtype(v.clone()),
        (key, OptionValue::Flag) => MountOption::CUSTOM(key.to_string()),
        (key, OptionValue::Value(v)) => MountOption::CUSTOM(format!("{}={}", key, v)),
    }
}

fn default_device_paths() -> Vec<PathBuf> {
    if cfg!(target_os = "linux") {
        vec![PathBuf::from("/dev/fuse")]
    } else if cfg!(target_os = "macos") {
        vec![
            PathBuf::from("/Library/Filesystems/macfuse.fs"),
            PathBuf::from("/Library/Filesystems/osxfuse.fs"),
        ]
    } else {
        Vec::new()
    }
}

/// [`KernelTransport`] backed by `fuser`.
#[derive(Debug, Clone)]
pub struct FuserTransport {
    device_paths: Vec<PathBuf>,
}

impl Default for FuserTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl FuserTransport {
    pub fn new() -> Self {
        Self {
            device_paths: default_device_paths(),
        }
    }

    /// Probe these paths instead of the platform defaults. The transport is
    /// available if any of them exists.
    pub fn with_device_paths(mut self, paths: Vec<PathBuf>) -> Self {
        self.device_paths = paths;
        self
    }
}

impl KernelTransport for FuserTransport {
    fn probe(&self) -> Result<(), TransportError> {
        if self.device_paths.iter().any(|p| p.exists()) {
            return Ok(());
        }
        Err(TransportError::Unavailable(if self.device_paths.is_empty() {
            "no kernel transport on this platform".to_string()
        } else {
            format!("none of {:?} exist", self.device_paths)
        }))
    }

    fn mount(&self, request: TransportRequest) -> Result<i32, TransportError> {
        let options = mount_options(&request.display_name, &request.options);
        debug!(
            mountpoint = %request.mount_point.display(),
            options = %request.options,
            "Mounting via kernel transport"
        );

        let mut adapter = Adapter::new(request.factory);
        if !request.foreground {
            if let Some(hook) = request.on_new_process {
                adapter = adapter.with_init_hook(Box::new(move || hook()));
            }
        }

        let mut session = Session::new(
            FuseFilesystem::new(adapter),
            &request.mount_point,
            &options,
        )
        .map_err(TransportError::Runtime)?;
        info!(mountpoint = %request.mount_point.display(), "Kernel transport mounted");

        if !request.foreground {
            match daemonize() {
                Ok(Daemonized::Parent(child)) => {
                    debug!(child = %child, "Server daemonized");
                    // The child owns the mount now; dropping the session here
                    // would unmount it.
                    std::mem::forget(session);
                    return Ok(0);
                }
                Ok(Daemonized::Child) => {}
                Err(e) => {
                    return Err(TransportError::Fatal(format!("daemonize failed: {}", e)));
                }
            }
        }

        spawn_unmount_on_signal(request.mount_point.clone())?;
        session
            .run()
            .map_err(|e| TransportError::Fatal(format!("session ended with error: {}", e)))?;
        info!(mountpoint = %request.mount_point.display(), "Kernel transport session finished");
        Ok(0)
    }
}

/// Turn SIGTERM and SIGINT into an unmount so `Session::run` returns and
/// the filesystem is closed.
fn spawn_unmount_on_signal(mount_point: PathBuf) -> Result<(), TransportError> {
    let mut set = SigSet::empty();
    set.add(Signal::SIGTERM);
    set.add(Signal::SIGINT);
    set.thread_block()
        .map_err(|e| TransportError::Fatal(format!("blocking signals failed: {}", e)))?;

    std::thread::Builder::new()
        .name("unmount-on-signal".to_string())
        .spawn(move || wait_and_unmount(&set, &mount_point))
        .map(|_| ())
        .map_err(|e| TransportError::Fatal(format!("spawning signal thread failed: {}", e)))
}

fn wait_and_unmount(set: &SigSet, mount_point: &Path) {
    match set.wait() {
        Ok(signal) => {
            info!(signal = ?signal, "Shutdown signal received, unmounting");
            if !unmount::unmount(mount_point) {
                warn!(mountpoint = %mount_point.display(), "Unmount after signal failed");
            }
        }
        Err(e) => warn!(error = %e, "Waiting for signals failed"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_flags_and_values() {
        let options = TransportOptions::parse("a=b,c");
        assert_eq!(options.get("a"), Some(&OptionValue::Value("b".to_string())));
        assert_eq!(options.get("c"), Some(&OptionValue::Flag));
        assert_eq!(options.len(), 2);
    }

    #[test]
    fn test_parse_value_may_contain_equals() {
        let options = TransportOptions::parse("k=v=w,,x");
        assert_eq!(options.get("k"), Some(&OptionValue::Value("v=w".to_string())));
        assert_eq!(options.get("x"), Some(&OptionValue::Flag));
        assert_eq!(options.len(), 2);
    }

    #[test]
    fn test_later_keys_win_and_defaults_do_not() {
        let mut options = TransportOptions::parse("uid=1,uid=2");
        assert_eq!(options.get("uid"), Some(&OptionValue::Value("2".to_string())));
        options.merge_defaults(&TransportOptions::parse("uid=3,ro"));
        assert_eq!(options.get("uid"), Some(&OptionValue::Value("2".to_string())));
        assert_eq!(options.get("ro"), Some(&OptionValue::Flag));
    }

    #[test]
    fn test_display_round_trips_sorted() {
        let options = TransportOptions::parse("b,a=1");
        assert_eq!(options.to_string(), "a=1,b");
    }

    #[test]
    fn test_mount_options_defaults() {
        let opts = mount_options("My Drive", &TransportOptions::new());
        assert!(opts.contains(&MountOption::FSName("My Drive".to_string())));
        assert!(opts.contains(&MountOption::DefaultPermissions));
    }

    #[test]
    fn test_mount_options_known_and_custom_keys() {
        let opts = mount_options(
            "d",
            &TransportOptions::parse("allow_other,ro,uid=1000,fsname=other,noappledouble"),
        );
        assert!(opts.contains(&MountOption::AllowOther));
        assert!(opts.contains(&MountOption::RO));
        assert!(opts.contains(&MountOption::CUSTOM("uid=1000".to_string())));
        assert!(opts.contains(&MountOption::CUSTOM("noappledouble".to_string())));
        assert!(opts.contains(&MountOption::FSName("other".to_string())));
        assert!(!opts.contains(&MountOption::FSName("d".to_string())));
    }

    #[test]
    fn test_probe_uses_device_paths() {
        let dir = tempfile::tempdir().unwrap();
        let present = dir.path().join("fuse");
        std::fs::write(&present, b"").unwrap();

        let available = FuserTransport::new().with_device_paths(vec![
            dir.path().join("missing"),
            present,
        ]);
        assert!(available.probe().is_ok());

        let missing = FuserTransport::new().with_device_paths(vec![dir.path().join("missing")]);
        assert!(matches!(missing.probe(), Err(TransportError::Unavailable(_))));

        let none = FuserTransport::new().with_device_paths(Vec::new());
        assert!(matches!(none.probe(), Err(TransportError::Unavailable(_))));
    }
}
