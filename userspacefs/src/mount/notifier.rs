//! Mount notifier: waits for the server to come up, then mounts the share.

use std::io::{self, Read};
use std::path::PathBuf;
use std::sync::mpsc::Sender;

use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use tracing::{debug, warn};

use super::process::CommandRunner;
use super::watchdog::WatchdogToken;

/// Exit status when the server went away before signalling readiness.
pub const SERVER_DIED: i32 = 1;

/// Where the notifier reports the mount outcome.
pub trait MountSignalTarget: Send {
    fn mounted(&self);
    fn kill(&self);
}

/// Signals a daemonized server process: SIGUSR1 on success, SIGTERM on
/// failure.
#[derive(Debug, Clone, Copy)]
pub struct ProcessTarget(pub Pid);

impl MountSignalTarget for ProcessTarget {
    fn mounted(&self) {
        if let Err(e) = kill(self.0, Signal::SIGUSR1) {
            warn!(pid = %self.0, error = %e, "Failed to send mounted signal");
        }
    }

    fn kill(&self) {
        if let Err(e) = kill(self.0, Signal::SIGTERM) {
            warn!(pid = %self.0, error = %e, "Failed to send kill signal");
        }
    }
}

/// Feeds tokens straight into the watchdog channel of a server running in
/// the same process.
#[derive(Debug, Clone)]
pub struct QueueTarget(pub Sender<WatchdogToken>);

impl QueueTarget {
    fn send(&self, token: WatchdogToken) {
        if self.0.send(token).is_err() {
            debug!(?token, "Watchdog already gone, dropping token");
        }
    }
}

impl MountSignalTarget for QueueTarget {
    fn mounted(&self) {
        self.send(WatchdogToken::Mounted);
    }

    fn kill(&self) {
        self.send(WatchdogToken::Kill);
    }
}

/// What to mount once the server is ready.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShareMount {
    /// `cifs://guest:@host:port/name`
    pub locator: String,
    pub mount_point: PathBuf,
    /// Only wait for readiness; do not mount.
    pub no_mount: bool,
}

impl ShareMount {
    /// Arguments for `mount`.
    pub fn mount_args(&self) -> Vec<String> {
        vec![
            "-t".to_string(),
            "smbfs".to_string(),
            self.locator.clone(),
            self.mount_point.to_string_lossy().into_owned(),
        ]
    }
}

/// Locator a share client can connect to.
pub fn share_locator(host: &str, port: u16, display_name: &str) -> String {
    format!("cifs://guest:@{}:{}/{}", host, port, display_name)
}

/// Block until the server writes its ready byte, then mount.
///
/// Returns the exit status of the mount command, `0` in no-mount mode, or
/// [`SERVER_DIED`] if the pipe closed without a byte. A failed mount sends
/// a kill to `target`; a successful one sends mounted.
pub fn notify_mount(
    mut ready: impl Read,
    mount: &ShareMount,
    runner: &dyn CommandRunner,
    target: &dyn MountSignalTarget,
) -> i32 {
    let mut byte = [0u8; 1];
    match read_ready(&mut ready, &mut byte) {
        Ok(true) => {}
        Ok(false) => {
            warn!("Server exited before it was ready");
            return SERVER_DIED;
        }
        Err(e) => {
            warn!(error = %e, "Waiting for server failed");
            return SERVER_DIED;
        }
    }

    if mount.no_mount {
        return 0;
    }

    let args = mount.mount_args();
    let args: Vec<&str> = args.iter().map(String::as_str).collect();
    let status = match runner.run("mount", &args) {
        Ok(status) => status,
        Err(e) => {
            warn!(error = %e, "Could not run mount");
            -1
        }
    };
    if status == 0 {
        debug!("Mount succeeded, sending mounted signal");
        target.mounted();
    } else {
        debug!(status, "Mount failed, sending kill signal");
        target.kill();
    }
    status
}

fn read_ready(ready: &mut impl Read, byte: &mut [u8; 1]) -> io::Result<bool> {
    loop {
        match ready.read(byte) {
            Ok(n) => return Ok(n == 1),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::mpsc;

    struct FixedRunner {
        status: i32,
        calls: Mutex<Vec<(String, Vec<String>)>>,
    }

    impl FixedRunner {
        fn new(status: i32) -> Self {
            Self {
                status,
                calls: Mutex::new(Vec::new()),
            }
        }
    }

    impl CommandRunner for FixedRunner {
        fn run(&self, program: &str, args: &[&str]) -> io::Result<i32> {
            self.calls.lock().push((
                program.to_string(),
                args.iter().map(|a| a.to_string()).collect(),
            ));
            Ok(self.status)
        }
    }

    fn request(no_mount: bool) -> ShareMount {
        ShareMount {
            locator: share_locator("127.0.0.1", 60001, "Drive"),
            mount_point: PathBuf::from("/Volumes/Drive"),
            no_mount,
        }
    }

    #[test]
    fn test_locator_format() {
        assert_eq!(
            share_locator("127.0.0.1", 60001, "My Drive"),
            "cifs://guest:@127.0.0.1:60001/My Drive"
        );
    }

    #[test]
    fn test_successful_mount_sends_mounted() {
        let runner = FixedRunner::new(0);
        let (tx, rx) = mpsc::channel();
        let status = notify_mount(&b"\0"[..], &request(false), &runner, &QueueTarget(tx));
        assert_eq!(status, 0);
        assert_eq!(rx.try_recv().unwrap(), WatchdogToken::Mounted);
        assert_eq!(
            *runner.calls.lock(),
            vec![(
                "mount".to_string(),
                vec![
                    "-t".to_string(),
                    "smbfs".to_string(),
                    "cifs://guest:@127.0.0.1:60001/Drive".to_string(),
                    "/Volumes/Drive".to_string()
                ]
            )]
        );
    }

    #[test]
    fn test_failed_mount_sends_kill_and_returns_status() {
        let runner = FixedRunner::new(64);
        let (tx, rx) = mpsc::channel();
        let status = notify_mount(&b"\0"[..], &request(false), &runner, &QueueTarget(tx));
        assert_eq!(status, 64);
        assert_eq!(rx.try_recv().unwrap(), WatchdogToken::Kill);
    }

    #[test]
    fn test_no_mount_only_waits() {
        let runner = FixedRunner::new(0);
        let (tx, rx) = mpsc::channel();
        assert_eq!(
            notify_mount(&b"\0"[..], &request(true), &runner, &QueueTarget(tx)),
            0
        );
        assert!(runner.calls.lock().is_empty());
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_server_died_before_ready() {
        let runner = FixedRunner::new(0);
        let (tx, rx) = mpsc::channel();
        assert_eq!(
            notify_mount(io::empty(), &request(false), &runner, &QueueTarget(tx)),
            SERVER_DIED
        );
        assert!(runner.calls.lock().is_empty());
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_queue_target_outlives_watchdog() {
        let runner = FixedRunner::new(0);
        let (tx, rx) = mpsc::channel();
        drop(rx);
        let target = QueueTarget(tx);
        assert_eq!(notify_mount(&b"\0"[..], &request(false), &runner, &target), 0);
        target.kill();
        assert_eq!(runner.calls.lock().len(), 1);
    }
}
