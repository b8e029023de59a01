//! Mount liveness watchdog.
//!
//! The watchdog owns shutdown of the fallback server. It consumes
//! [`WatchdogToken`]s from a channel fed by the signal relay and the mount
//! notifier, checks the mount point while it believes the share is mounted,
//! and on a kill token or a lost mount force-unmounts and closes the server.

use std::path::PathBuf;
use std::sync::mpsc::{Receiver, RecvTimeoutError};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use tracing::{debug, info, warn};

use super::process::{CommandRunner, MountProbe};
use super::share::ShareServer;

/// Poll interval once mounted, foreground.
pub const FOREGROUND_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Poll interval once mounted, daemonized.
pub const BACKGROUND_POLL_INTERVAL: Duration = Duration::from_secs(30);

/// Events delivered to the watchdog.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchdogToken {
    /// The share is mounted; start checking it.
    Mounted,
    /// Shut down now.
    Kill,
}

/// Why the watchdog stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchdogExit {
    Killed,
    MountLost,
    /// Every sender went away before a mount was confirmed.
    Disconnected,
}

pub struct Watchdog {
    tokens: Receiver<WatchdogToken>,
    mount_point: PathBuf,
    poll_interval: Duration,
    probe: Arc<dyn MountProbe>,
    runner: Arc<dyn CommandRunner>,
    server: Arc<dyn ShareServer>,
}

impl Watchdog {
    pub fn new(
        tokens: Receiver<WatchdogToken>,
        mount_point: PathBuf,
        probe: Arc<dyn MountProbe>,
        runner: Arc<dyn CommandRunner>,
        server: Arc<dyn ShareServer>,
    ) -> Self {
        Self {
            tokens,
            mount_point,
            poll_interval: BACKGROUND_POLL_INTERVAL,
            probe,
            runner,
            server,
        }
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Run on a dedicated thread.
    pub fn spawn(self) -> std::io::Result<JoinHandle<WatchdogExit>> {
        std::thread::Builder::new()
            .name("mount-watchdog".to_string())
            .spawn(move || self.run())
    }

    /// Watch until killed or the mount disappears, then clean up.
    pub fn run(self) -> WatchdogExit {
        let mut mounted = false;
        let exit = loop {
            let token = if mounted {
                match self.tokens.recv_timeout(self.poll_interval) {
                    Ok(token) => Some(token),
                    Err(RecvTimeoutError::Timeout) => None,
                    Err(RecvTimeoutError::Disconnected) => {
                        // Nothing can send a kill any more; keep polling.
                        std::thread::sleep(self.poll_interval);
                        None
                    }
                }
            } else {
                match self.tokens.recv() {
                    Ok(token) => Some(token),
                    Err(_) => break WatchdogExit::Disconnected,
                }
            };

            match token {
                Some(WatchdogToken::Mounted) => {
                    debug!("Mount confirmed");
                    mounted = true;
                }
                Some(WatchdogToken::Kill) => {
                    debug!("Kill token received");
                    break WatchdogExit::Killed;
                }
                None => {}
            }

            if mounted && !self.probe.is_mounted(&self.mount_point) {
                info!(mountpoint = %self.mount_point.display(), "Mount point went away");
                break WatchdogExit::MountLost;
            }
        };

        if mounted {
            self.force_unmount();
        }
        debug!(?exit, "Closing share server");
        self.server.close();
        exit
    }

    fn force_unmount(&self) {
        let mount_point = self.mount_point.to_string_lossy();
        match self.runner.run("umount", &["-f", mount_point.as_ref()]) {
            Ok(0) => debug!(mountpoint = %mount_point, "Force unmount succeeded"),
            Ok(status) => debug!(mountpoint = %mount_point, status, "Force unmount failed"),
            Err(e) => warn!(mountpoint = %mount_point, error = %e, "Could not run umount"),
        }
    }
}
