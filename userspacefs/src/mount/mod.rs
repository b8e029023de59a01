//! Mount strategy orchestration.
//!
//! [`Orchestrator`] tries the kernel transport first and falls back to
//! serving the filesystem as a network share, mounting it with the OS share
//! client. Everything that touches the outside world (commands, signals,
//! mount probing, the share server itself) is a trait so the whole flow can
//! run under test.

pub mod error;
pub mod notifier;
pub mod options;
pub mod orchestrator;
pub mod process;
pub mod share;
pub mod signals;
pub mod socket;
pub mod watchdog;

pub use error::{MountError, MountResult};
pub use notifier::{MountSignalTarget, ProcessTarget, QueueTarget, ShareMount};
pub use options::{ListenAddress, MountOptions};
pub use orchestrator::{Orchestrator, SessionState};
pub use process::{
    CommandRunner, Daemonized, MountProbe, PlatformCaps, StatMountProbe, SystemCommandRunner,
};
pub use share::{ShareBackend, ShareError, ShareServer, ShareServerFactory, SimpleShareBackend};
pub use signals::{SignalRelay, UnixSignalRelay};
pub use watchdog::{Watchdog, WatchdogExit, WatchdogToken};
