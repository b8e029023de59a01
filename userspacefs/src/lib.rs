//! userspacefs - expose an abstract filesystem as a mountable volume.
//!
//! A backing store implements [`fs::FileSystem`]. The [`mount::Orchestrator`]
//! mounts it through the kernel user-space filesystem transport when one is
//! installed, and otherwise serves it as a network share and has the OS
//! mount that instead.
//!
//! ```no_run
//! use std::path::Path;
//! use std::sync::Arc;
//!
//! use userspacefs::fs::{FileSystem, LocalFileSystem};
//! use userspacefs::fuse::FsFactory;
//! use userspacefs::mount::{MountOptions, Orchestrator};
//!
//! let factory: FsFactory = Arc::new(|| {
//!     Ok(Arc::new(LocalFileSystem::new("/srv/data")?) as Arc<dyn FileSystem>)
//! });
//! let status = Orchestrator::new().run(
//!     "Data",
//!     factory,
//!     Some(Path::new("/mnt/data")),
//!     MountOptions::new().with_foreground(true),
//! );
//! std::process::exit(status);
//! ```

pub mod config;
pub mod fs;
pub mod fuse;
pub mod logging;
pub mod mount;

/// Crate version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

pub use config::{ConfigError, ConfigFile};
pub use mount::{MountError, MountOptions, Orchestrator};
