//! Mount strategy orchestrator.
//!
//! Picks between the kernel transport and the fallback share server, runs
//! the readiness handshake between the mounting side and the serving side,
//! and keeps the server alive until the watchdog shuts it down.
//!
//! # Fallback flow
//!
//! ```text
//! notifier (parent / thread)            server (child / calling thread)
//!        │                                   │ create fs, server
//!        │                                   │ forward signals
//!        │◄──────────── ready byte ──────────┤
//!        │ mount -t smbfs ...                │ spawn watchdog
//!        ├── mounted / kill ────────────────►│ accept loop
//!        ▼                                   │ ... watchdog closes server
//!      exit                                  ▼ close fs
//! ```

use std::fs::File;
use std::io::{self, Write};
use std::net::{IpAddr, TcpListener};
use std::path::{Path, PathBuf};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::Arc;
use std::thread::JoinHandle;

use tracing::{debug, error, info, instrument, warn};

use super::error::{MountError, MountResult};
use super::notifier::{notify_mount, share_locator, ProcessTarget, QueueTarget, ShareMount};
use super::options::MountOptions;
use super::process::{
    daemonize, CommandRunner, Daemonized, MountProbe, PlatformCaps, StatMountProbe,
    SystemCommandRunner,
};
use super::share::{ShareServerFactory, SimpleShareBackend};
use super::signals::{SignalRelay, UnixSignalRelay};
use super::socket::bind_listener;
use super::watchdog::{Watchdog, WatchdogToken, BACKGROUND_POLL_INTERVAL, FOREGROUND_POLL_INTERVAL};
use crate::fs::{FileSystem, PathConversionFileSystem};
use crate::fuse::{FsFactory, FuserTransport, KernelTransport, TransportError, TransportRequest};

/// Where a mount session is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    TryingKernelTransport,
    FallbackListening,
    FallbackMounting,
    Active,
    Unmounting,
    Closed,
}

/// Traces state transitions of one mount attempt.
#[derive(Debug)]
struct MountSession {
    state: SessionState,
}

impl MountSession {
    fn new() -> Self {
        Self {
            state: SessionState::Idle,
        }
    }

    fn advance(&mut self, next: SessionState) {
        debug!(from = ?self.state, to = ?next, "Mount session state");
        self.state = next;
    }
}

/// Mounts filesystems. Every external effect goes through an injectable
/// collaborator.
pub struct Orchestrator {
    transport: Option<Arc<dyn KernelTransport>>,
    share_servers: Option<Arc<dyn ShareServerFactory>>,
    runner: Arc<dyn CommandRunner>,
    probe: Arc<dyn MountProbe>,
    signals: Arc<dyn SignalRelay>,
    caps: PlatformCaps,
}

impl Default for Orchestrator {
    fn default() -> Self {
        Self::new()
    }
}

impl Orchestrator {
    /// Orchestrator using `fuser`, real processes and real signals. No share
    /// server is configured.
    pub fn new() -> Self {
        Self {
            transport: Some(Arc::new(FuserTransport::new())),
            share_servers: None,
            runner: Arc::new(SystemCommandRunner),
            probe: Arc::new(StatMountProbe),
            signals: Arc::new(UnixSignalRelay),
            caps: PlatformCaps::current(),
        }
    }

    pub fn with_transport(mut self, transport: Arc<dyn KernelTransport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Never try the kernel transport.
    pub fn without_transport(mut self) -> Self {
        self.transport = None;
        self
    }

    pub fn with_share_server_factory(mut self, factory: Arc<dyn ShareServerFactory>) -> Self {
        self.share_servers = Some(factory);
        self
    }

    pub fn with_command_runner(mut self, runner: Arc<dyn CommandRunner>) -> Self {
        self.runner = runner;
        self
    }

    pub fn with_mount_probe(mut self, probe: Arc<dyn MountProbe>) -> Self {
        self.probe = probe;
        self
    }

    pub fn with_signal_relay(mut self, signals: Arc<dyn SignalRelay>) -> Self {
        self.signals = signals;
        self
    }

    pub fn with_platform_caps(mut self, caps: PlatformCaps) -> Self {
        self.caps = caps;
        self
    }

    /// Mount and serve, mapping errors to exit status `-1`.
    pub fn run(
        &self,
        display_name: &str,
        factory: FsFactory,
        mount_point: Option<&Path>,
        options: MountOptions,
    ) -> i32 {
        match self.mount_and_run(display_name, factory, mount_point, options) {
            Ok(status) => status,
            Err(e) => {
                error!(error = %e, "Mount failed");
                eprintln!("{}", e);
                -1
            }
        }
    }

    /// Mount and serve until unmounted.
    ///
    /// Returns the exit status for the calling process: `0` once a
    /// background server is running or a foreground server has shut down,
    /// or the mount command's status if it failed.
    #[instrument(skip_all, fields(name = %display_name))]
    pub fn mount_and_run(
        &self,
        display_name: &str,
        factory: FsFactory,
        mount_point: Option<&Path>,
        options: MountOptions,
    ) -> MountResult<i32> {
        let mut session = MountSession::new();
        let no_mount = options.fallback_no_mount;

        let mount_point = match mount_point {
            Some(path) if !no_mount => Some(std::path::absolute(path)?),
            Some(path) => Some(path.to_path_buf()),
            None if no_mount => None,
            None => return Err(MountError::MissingMountPoint),
        };

        if !options.skips_kernel_transport() {
            if let (Some(transport), Some(mount_point)) = (&self.transport, &mount_point) {
                session.advance(SessionState::TryingKernelTransport);
                let request = TransportRequest {
                    display_name: display_name.to_string(),
                    mount_point: mount_point.clone(),
                    foreground: options.foreground,
                    options: options.transport_options.clone(),
                    factory: Arc::clone(&factory),
                    on_new_process: options.on_new_process.clone(),
                };
                match try_kernel_transport(transport.as_ref(), request) {
                    Ok(status) => {
                        session.advance(SessionState::Closed);
                        return Ok(status);
                    }
                    Err(TransportError::Unavailable(reason)) => {
                        info!(reason = %reason, "Kernel transport unavailable, falling back");
                    }
                    Err(TransportError::Runtime(e)) => {
                        warn!(error = %e, "Kernel transport mount failed, falling back");
                    }
                    Err(e) => return Err(e.into()),
                }
            }
        }

        if !no_mount && !self.caps.can_automount_share {
            return Err(MountError::Unsupported);
        }
        let share_servers = self
            .share_servers
            .clone()
            .ok_or(MountError::NoShareServer)?;

        let listener = bind_listener(&options.listen_address)?;
        let local = listener.local_addr()?;
        session.advance(SessionState::FallbackListening);

        let factory = if self.caps.needs_path_conversion {
            with_path_conversion(factory)
        } else {
            factory
        };

        let locator = share_locator(&locator_host(local.ip()), local.port(), display_name);
        if no_mount {
            println!("You can access the SMB server at {}", locator);
        }
        let share_mount = ShareMount {
            locator,
            mount_point: mount_point.clone().unwrap_or_default(),
            no_mount,
        };

        let (reader, writer) = nix::unistd::pipe().map_err(io::Error::from)?;
        let (reader, writer) = (File::from(reader), File::from(writer));
        let (tokens, token_rx) = mpsc::channel();

        let notifier = if options.foreground {
            self.signals.block()?;
            let target = QueueTarget(tokens.clone());
            let runner = Arc::clone(&self.runner);
            let share_mount = share_mount.clone();
            Some(
                std::thread::Builder::new()
                    .name("mount-notifier".to_string())
                    .spawn(move || notify_mount(reader, &share_mount, runner.as_ref(), &target))?,
            )
        } else {
            match daemonize().map_err(MountError::Daemonize)? {
                Daemonized::Parent(child) => {
                    drop(writer);
                    drop(listener);
                    debug!(child = %child, "Server daemonized, waiting to mount");
                    return Ok(notify_mount(
                        reader,
                        &share_mount,
                        self.runner.as_ref(),
                        &ProcessTarget(child),
                    ));
                }
                Daemonized::Child => {
                    drop(reader);
                    self.signals.block()?;
                    if let Some(hook) = &options.on_new_process {
                        hook();
                    }
                    None
                }
            }
        };

        session.advance(SessionState::FallbackMounting);
        let fs = factory().map_err(MountError::Filesystem)?;
        let served = self.serve(
            display_name,
            Arc::clone(&fs),
            listener,
            writer,
            tokens,
            token_rx,
            share_mount.mount_point,
            options.foreground,
            &mut session,
        );
        session.advance(SessionState::Unmounting);
        if let Err(e) = fs.close() {
            warn!(error = %e, "Closing filesystem failed");
        }
        session.advance(SessionState::Closed);
        served?;

        Ok(match notifier {
            Some(handle) => join_notifier(handle),
            None => 0,
        })
    }

    #[allow(clippy::too_many_arguments)]
    fn serve(
        &self,
        display_name: &str,
        fs: Arc<dyn FileSystem>,
        listener: TcpListener,
        mut ready: File,
        tokens: Sender<WatchdogToken>,
        token_rx: Receiver<WatchdogToken>,
        mount_point: PathBuf,
        foreground: bool,
        session: &mut MountSession,
    ) -> MountResult<()> {
        let share_servers = self
            .share_servers
            .as_ref()
            .ok_or(MountError::NoShareServer)?;
        let backend = Arc::new(SimpleShareBackend::for_display_name(display_name, fs));
        let server = share_servers.create(backend, listener)?;

        // Tokens only flow once there is a server for the watchdog to close.
        self.signals.forward(tokens)?;
        ready.write_all(&[0])?;
        drop(ready);

        let poll_interval = if foreground {
            FOREGROUND_POLL_INTERVAL
        } else {
            BACKGROUND_POLL_INTERVAL
        };
        Watchdog::new(
            token_rx,
            mount_point,
            Arc::clone(&self.probe),
            Arc::clone(&self.runner),
            Arc::clone(&server),
        )
        .with_poll_interval(poll_interval)
        .spawn()?;

        session.advance(SessionState::Active);
        server.run()?;
        info!("Share server stopped");
        Ok(())
    }
}

fn try_kernel_transport(
    transport: &dyn KernelTransport,
    request: TransportRequest,
) -> Result<i32, TransportError> {
    transport.probe()?;
    debug!(mountpoint = %request.mount_point.display(), "Attempting kernel transport mount");
    transport.mount(request)
}

/// Wrap every filesystem the factory creates in the path conversion shim.
fn with_path_conversion(inner: FsFactory) -> FsFactory {
    Arc::new(move || {
        let fs = inner()?;
        Ok(Arc::new(PathConversionFileSystem::new(fs)) as Arc<dyn FileSystem>)
    })
}

/// Host to put in the share locator for a bound address.
fn locator_host(ip: IpAddr) -> String {
    match ip {
        ip if ip.is_unspecified() => "127.0.0.1".to_string(),
        IpAddr::V6(v6) => format!("[{}]", v6),
        IpAddr::V4(v4) => v4.to_string(),
    }
}

fn join_notifier(handle: JoinHandle<i32>) -> i32 {
    handle.join().unwrap_or_else(|_| {
        error!("Mount notifier panicked");
        -1
    })
}
