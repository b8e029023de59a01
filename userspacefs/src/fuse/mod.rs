//! Kernel user-space filesystem transport.
//!
//! # Architecture
//!
//! ```text
//! kernel ──ino──► FuseFilesystem ──path──► Adapter ──FsPath──► FileSystem
//!                  (InodeTable)            (HandleTable)
//! ```
//!
//! [`Adapter`] carries the semantics: attribute translation, handle
//! bookkeeping, rename emulation. [`FuseFilesystem`] only maps inode numbers
//! to paths and shapes replies for `fuser`.

pub mod adapter;
pub mod attr;
pub mod filesystem;
pub mod handles;
pub mod inode;
pub mod transport;
pub mod unmount;

pub use adapter::{Adapter, FsFactory, FuseResult, InitHook, Listing, VolumeStats};
pub use attr::Attributes;
pub use filesystem::FuseFilesystem;
pub use handles::{HandleError, HandleTable, Resource};
pub use inode::{InodeTable, ROOT_INODE};
pub use transport::{
    FuserTransport, KernelTransport, OptionValue, ProcessHook, TransportError, TransportOptions,
    TransportRequest,
};
