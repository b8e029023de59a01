//! End-to-end runs of the mount orchestrator in foreground mode with every
//! external effect mocked.

use std::io;
use std::net::TcpListener;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::mpsc::Sender;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use userspacefs::fs::{FileSystem, FsPath, MemoryFileSystem};
use userspacefs::fuse::{FsFactory, KernelTransport, TransportError, TransportRequest};
use userspacefs::mount::socket::RANDOM_PORT_RANGE;
use userspacefs::mount::{
    CommandRunner, MountError, MountOptions, MountProbe, Orchestrator, PlatformCaps,
    ShareBackend, ShareError, ShareServer, ShareServerFactory, SignalRelay, WatchdogToken,
};

// ---------------------------------------------------------------------------
// Mocks
// ---------------------------------------------------------------------------

enum TransportBehavior {
    Unavailable,
    RuntimeFailure,
    Fatal,
    Succeed,
}

struct MockTransport {
    behavior: TransportBehavior,
    probes: AtomicUsize,
    mounts: AtomicUsize,
}

impl MockTransport {
    fn new(behavior: TransportBehavior) -> Arc<Self> {
        Arc::new(Self {
            behavior,
            probes: AtomicUsize::new(0),
            mounts: AtomicUsize::new(0),
        })
    }
}

impl KernelTransport for MockTransport {
    fn probe(&self) -> Result<(), TransportError> {
        self.probes.fetch_add(1, Ordering::SeqCst);
        match self.behavior {
            TransportBehavior::Unavailable => {
                Err(TransportError::Unavailable("no /dev/fuse".to_string()))
            }
            _ => Ok(()),
        }
    }

    fn mount(&self, request: TransportRequest) -> Result<i32, TransportError> {
        self.mounts.fetch_add(1, Ordering::SeqCst);
        match self.behavior {
            TransportBehavior::RuntimeFailure => Err(TransportError::Runtime(
                io::Error::from_raw_os_error(libc::EPERM),
            )),
            TransportBehavior::Fatal => Err(TransportError::Fatal("session died".to_string())),
            _ => {
                // Stand in for the kernel: create, use and close the filesystem.
                let fs = (request.factory)().map_err(TransportError::Runtime)?;
                fs.close().map_err(TransportError::Runtime)?;
                Ok(0)
            }
        }
    }
}

/// Share server whose accept loop blocks until closed.
#[derive(Default)]
struct MockServer {
    closed: Mutex<bool>,
    wake: Condvar,
    close_calls: AtomicUsize,
    running: AtomicBool,
}

impl ShareServer for MockServer {
    fn run(&self) -> Result<(), ShareError> {
        self.running.store(true, Ordering::SeqCst);
        let mut closed = self.closed.lock();
        while !*closed {
            self.wake.wait(&mut closed);
        }
        Ok(())
    }

    fn close(&self) {
        self.close_calls.fetch_add(1, Ordering::SeqCst);
        *self.closed.lock() = true;
        self.wake.notify_all();
    }
}

#[derive(Default)]
struct MockServerFactory {
    server: Arc<MockServer>,
    created: AtomicUsize,
    port: Mutex<Option<u16>>,
    share_fs: Mutex<Option<Arc<dyn FileSystem>>>,
}

impl ShareServerFactory for MockServerFactory {
    fn create(
        &self,
        backend: Arc<dyn ShareBackend>,
        listener: TcpListener,
    ) -> Result<Arc<dyn ShareServer>, ShareError> {
        self.created.fetch_add(1, Ordering::SeqCst);
        *self.port.lock() = Some(listener.local_addr()?.port());
        *self.share_fs.lock() = Some(backend.tree_connect("\\\\127.0.0.1\\TEST")?);
        Ok(self.server.clone())
    }
}

struct MockRunner {
    mount_status: i32,
    calls: Mutex<Vec<Vec<String>>>,
}

impl MockRunner {
    fn new(mount_status: i32) -> Arc<Self> {
        Arc::new(Self {
            mount_status,
            calls: Mutex::new(Vec::new()),
        })
    }

    fn programs(&self) -> Vec<String> {
        self.calls.lock().iter().map(|c| c[0].clone()).collect()
    }
}

impl CommandRunner for MockRunner {
    fn run(&self, program: &str, args: &[&str]) -> io::Result<i32> {
        let mut call = vec![program.to_string()];
        call.extend(args.iter().map(|a| a.to_string()));
        self.calls.lock().push(call);
        Ok(if program == "mount" {
            self.mount_status
        } else {
            0
        })
    }
}

struct MockProbe(AtomicBool);

impl MountProbe for MockProbe {
    fn is_mounted(&self, _path: &Path) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Hands the watchdog sender to the test instead of listening for signals.
#[derive(Default)]
struct CapturingRelay {
    tokens: Mutex<Option<Sender<WatchdogToken>>>,
}

impl SignalRelay for CapturingRelay {
    fn block(&self) -> io::Result<()> {
        Ok(())
    }

    fn forward(&self, tokens: Sender<WatchdogToken>) -> io::Result<()> {
        *self.tokens.lock() = Some(tokens);
        Ok(())
    }
}

struct Harness {
    memory: Arc<MemoryFileSystem>,
    factory_calls: Arc<AtomicUsize>,
    servers: Arc<MockServerFactory>,
    runner: Arc<MockRunner>,
    probe: Arc<MockProbe>,
    relay: Arc<CapturingRelay>,
    caps: PlatformCaps,
}

impl Harness {
    fn new(mount_status: i32) -> Self {
        Self {
            memory: Arc::new(MemoryFileSystem::new()),
            factory_calls: Arc::new(AtomicUsize::new(0)),
            servers: Arc::new(MockServerFactory::default()),
            runner: MockRunner::new(mount_status),
            probe: Arc::new(MockProbe(AtomicBool::new(true))),
            relay: Arc::new(CapturingRelay::default()),
            caps: PlatformCaps {
                can_automount_share: true,
                needs_path_conversion: false,
            },
        }
    }

    fn with_path_conversion(mut self) -> Self {
        self.caps.needs_path_conversion = true;
        self
    }

    fn factory(&self) -> FsFactory {
        let memory = Arc::clone(&self.memory);
        let calls = Arc::clone(&self.factory_calls);
        Arc::new(move || {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok(Arc::clone(&memory) as Arc<dyn FileSystem>)
        })
    }

    fn orchestrator(&self, transport: Arc<dyn KernelTransport>) -> Orchestrator {
        Orchestrator::new()
            .with_transport(transport)
            .with_share_server_factory(self.servers.clone())
            .with_command_runner(self.runner.clone())
            .with_mount_probe(self.probe.clone())
            .with_signal_relay(self.relay.clone())
            .with_platform_caps(self.caps)
    }

    /// Run the orchestrator on its own thread.
    fn spawn(
        &self,
        transport: Arc<dyn KernelTransport>,
        options: MountOptions,
    ) -> thread::JoinHandle<Result<i32, MountError>> {
        let orchestrator = self.orchestrator(transport);
        let factory = self.factory();
        thread::spawn(move || {
            orchestrator.mount_and_run(
                "Test",
                factory,
                Some(Path::new("/Volumes/Test")),
                options.with_foreground(true),
            )
        })
    }

    fn wait_until_serving(&self) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !self.servers.server.running.load(Ordering::SeqCst) {
            assert!(Instant::now() < deadline, "server never started");
            thread::sleep(Duration::from_millis(5));
        }
    }

    fn wait_for_mount_command(&self) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !self.runner.programs().contains(&"mount".to_string()) {
            assert!(Instant::now() < deadline, "mount never ran");
            thread::sleep(Duration::from_millis(5));
        }
        // Let the notifier's mounted token reach the watchdog first.
        thread::sleep(Duration::from_millis(200));
    }

    fn send(&self, token: WatchdogToken) {
        let tokens = self.relay.tokens.lock();
        tokens
            .as_ref()
            .expect("signals forwarded")
            .send(token)
            .unwrap();
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[test]
fn test_fallback_when_transport_unavailable_then_kill() {
    let harness = Harness::new(0);
    let transport = MockTransport::new(TransportBehavior::Unavailable);
    let handle = harness.spawn(transport.clone(), MountOptions::new());

    harness.wait_until_serving();
    harness.wait_for_mount_command();
    harness.send(WatchdogToken::Kill);

    assert_eq!(handle.join().unwrap().unwrap(), 0);
    assert_eq!(transport.probes.load(Ordering::SeqCst), 1);
    assert_eq!(transport.mounts.load(Ordering::SeqCst), 0);

    let calls = harness.runner.calls.lock().clone();
    let port = harness.servers.port.lock().unwrap();
    assert!(RANDOM_PORT_RANGE.contains(&port));
    assert_eq!(
        calls[0],
        vec![
            "mount".to_string(),
            "-t".to_string(),
            "smbfs".to_string(),
            format!("cifs://guest:@127.0.0.1:{}/Test", port),
            "/Volumes/Test".to_string(),
        ]
    );
    assert_eq!(
        calls[1],
        vec!["umount".to_string(), "-f".to_string(), "/Volumes/Test".to_string()]
    );

    assert_eq!(harness.servers.server.close_calls.load(Ordering::SeqCst), 1);
    assert_eq!(harness.factory_calls.load(Ordering::SeqCst), 1);
    assert_eq!(harness.memory.close_count(), 1);
}

#[test]
fn test_share_backend_serves_created_filesystem() {
    let harness = Harness::new(0);
    let handle = harness.spawn(
        MockTransport::new(TransportBehavior::Unavailable),
        MountOptions::new(),
    );
    harness.wait_until_serving();

    let share_fs = harness.servers.share_fs.lock().clone().unwrap();
    share_fs.mkdir(&FsPath::from_segments(["via-share"])).unwrap();
    assert!(harness.memory.exists(&FsPath::from_segments(["via-share"])));

    harness.wait_for_mount_command();
    harness.send(WatchdogToken::Kill);
    assert_eq!(handle.join().unwrap().unwrap(), 0);
}

#[test]
fn test_share_names_are_decoded_when_platform_substitutes() {
    let harness = Harness::new(0).with_path_conversion();
    let handle = harness.spawn(
        MockTransport::new(TransportBehavior::Unavailable),
        MountOptions::new(),
    );
    harness.wait_until_serving();

    let share_fs = harness.servers.share_fs.lock().clone().unwrap();
    share_fs.mkdir(&FsPath::from_segments(["a\u{F021}"])).unwrap();
    let file = share_fs
        .open(
            &FsPath::from_segments(["a\u{F021}", "x\u{F025}\u{F001}\u{F027}"]),
            libc::O_CREAT | libc::O_RDWR,
        )
        .unwrap();
    share_fs.pwrite(file.as_ref(), b"decoded", 0).unwrap();
    file.close().unwrap();

    assert!(harness.memory.exists(&FsPath::from_segments(["a*"])));
    assert_eq!(
        harness
            .memory
            .read_file(&FsPath::from_segments(["a*", "x?\u{1}|"]))
            .unwrap(),
        b"decoded"
    );
    assert!(!harness.memory.exists(&FsPath::from_segments(["a\u{F021}"])));
    assert_eq!(
        share_fs
            .stat(&FsPath::from_segments(["a\u{F021}", "x\u{F025}\u{F001}\u{F027}"]))
            .unwrap()
            .size,
        7
    );

    harness.wait_for_mount_command();
    harness.send(WatchdogToken::Kill);
    assert_eq!(handle.join().unwrap().unwrap(), 0);
    assert_eq!(harness.memory.close_count(), 1);
}

#[test]
fn test_runtime_failure_falls_back_and_failed_mount_kills_server() {
    let harness = Harness::new(32);
    let transport = MockTransport::new(TransportBehavior::RuntimeFailure);
    let handle = harness.spawn(transport.clone(), MountOptions::new());

    assert_eq!(handle.join().unwrap().unwrap(), 32);
    assert_eq!(transport.mounts.load(Ordering::SeqCst), 1);
    // Never mounted, so nothing to force-unmount.
    assert_eq!(harness.runner.programs(), vec!["mount".to_string()]);
    assert_eq!(harness.servers.server.close_calls.load(Ordering::SeqCst), 1);
    assert_eq!(harness.memory.close_count(), 1);
}

#[test]
fn test_lost_mount_shuts_down() {
    let harness = Harness::new(0);
    let handle = harness.spawn(
        MockTransport::new(TransportBehavior::Unavailable),
        MountOptions::new(),
    );
    harness.wait_until_serving();
    harness.wait_for_mount_command();

    harness.probe.0.store(false, Ordering::SeqCst);
    let lost_at = Instant::now();
    assert_eq!(handle.join().unwrap().unwrap(), 0);
    // Foreground polls every second.
    assert!(lost_at.elapsed() < Duration::from_secs(3));
    assert_eq!(
        harness.runner.programs(),
        vec!["mount".to_string(), "umount".to_string()]
    );
    assert_eq!(harness.memory.close_count(), 1);
}

#[test]
fn test_fatal_transport_error_propagates() {
    let harness = Harness::new(0);
    let transport = MockTransport::new(TransportBehavior::Fatal);
    let result = harness.spawn(transport, MountOptions::new()).join().unwrap();

    assert!(matches!(result, Err(MountError::Transport(TransportError::Fatal(_)))));
    assert_eq!(harness.servers.created.load(Ordering::SeqCst), 0);
    assert!(harness.runner.calls.lock().is_empty());
}

#[test]
fn test_fatal_transport_error_exit_code() {
    let harness = Harness::new(0);
    let status = harness
        .orchestrator(MockTransport::new(TransportBehavior::Fatal))
        .run(
            "Test",
            harness.factory(),
            Some(Path::new("/Volumes/Test")),
            MountOptions::new().with_foreground(true),
        );
    assert_eq!(status, -1);
}

#[test]
fn test_kernel_transport_success_skips_fallback() {
    let harness = Harness::new(0);
    let transport = MockTransport::new(TransportBehavior::Succeed);
    let hook_calls = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&hook_calls);
    let options = MountOptions::new().with_on_new_process(Arc::new(move || {
        counter.fetch_add(1, Ordering::SeqCst);
    }));

    assert_eq!(harness.spawn(transport.clone(), options).join().unwrap().unwrap(), 0);
    assert_eq!(transport.mounts.load(Ordering::SeqCst), 1);
    assert_eq!(harness.servers.created.load(Ordering::SeqCst), 0);
    assert_eq!(harness.memory.close_count(), 1);
    // Only a daemonized server process runs the hook.
    assert_eq!(hook_calls.load(Ordering::SeqCst), 0);
}

#[test]
fn test_force_fallback_skips_transport() {
    let harness = Harness::new(0);
    let transport = MockTransport::new(TransportBehavior::Succeed);
    let handle = harness.spawn(
        transport.clone(),
        MountOptions::new().with_force_fallback(true),
    );
    harness.wait_until_serving();
    harness.wait_for_mount_command();
    harness.send(WatchdogToken::Kill);

    assert_eq!(handle.join().unwrap().unwrap(), 0);
    assert_eq!(transport.probes.load(Ordering::SeqCst), 0);
    assert_eq!(harness.servers.created.load(Ordering::SeqCst), 1);
}

#[test]
fn test_no_mount_serves_without_mounting() {
    let harness = Harness::new(0);
    let orchestrator = harness
        .orchestrator(MockTransport::new(TransportBehavior::Succeed))
        .with_platform_caps(PlatformCaps {
            can_automount_share: false,
            needs_path_conversion: false,
        });
    let factory = harness.factory();
    let handle = thread::spawn(move || {
        orchestrator.mount_and_run(
            "Test",
            factory,
            None,
            MountOptions::new()
                .with_foreground(true)
                .with_fallback_no_mount(true),
        )
    });

    harness.wait_until_serving();
    harness.send(WatchdogToken::Kill);
    assert_eq!(handle.join().unwrap().unwrap(), 0);
    assert!(harness.runner.calls.lock().is_empty());
    assert_eq!(harness.memory.close_count(), 1);
}

#[test]
fn test_unsupported_platform_without_share_mount() {
    let harness = Harness::new(0);
    let orchestrator = harness
        .orchestrator(MockTransport::new(TransportBehavior::Unavailable))
        .with_platform_caps(PlatformCaps {
            can_automount_share: false,
            needs_path_conversion: false,
        });
    let result = orchestrator.mount_and_run(
        "Test",
        harness.factory(),
        Some(Path::new("/Volumes/Test")),
        MountOptions::new().with_foreground(true),
    );
    assert!(matches!(result, Err(MountError::Unsupported)));
    assert_eq!(harness.factory_calls.load(Ordering::SeqCst), 0);
}

#[test]
fn test_explicit_listen_port_is_used() {
    let harness = Harness::new(0);
    // Find a free port, then release it for the orchestrator.
    let port = TcpListener::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap()
        .port();
    let handle = harness.spawn(
        MockTransport::new(TransportBehavior::Unavailable),
        MountOptions::new().with_listen_address(format!("127.0.0.1:{}", port).parse().unwrap()),
    );
    harness.wait_until_serving();
    assert_eq!(*harness.servers.port.lock(), Some(port));
    harness.wait_for_mount_command();
    harness.send(WatchdogToken::Kill);
    assert_eq!(handle.join().unwrap().unwrap(), 0);
}
