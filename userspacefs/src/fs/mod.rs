//! Abstract filesystem contract.
//!
//! Every backing store that userspacefs can mount implements [`FileSystem`].
//! The contract is deliberately small and path-addressed: the mount layers
//! translate kernel or network requests into these calls and never look
//! inside the store.
//!
//! # Capabilities
//!
//! | Operation | Notes |
//! |-----------|-------|
//! | `create_path` | Builds an [`FsPath`] from ordered segments |
//! | `open` / `open_directory` | Return resources closed once by the caller |
//! | `stat` / `fstat` | Return a [`Stat`] record |
//! | `pread` / `pwrite` | Explicit-offset I/O |
//! | `ftruncate` / `fsync` | Per-handle mutation |
//! | `unlink` / `mkdir` / `rmdir` | Namespace mutation |
//! | `rename_noreplace` | Fails with `EEXIST` when the target exists |
//! | `statvfs` | Volume statistics |
//! | `close` | Called once when the mount session ends |
//!
//! Setting file times is optional and exposed through [`SetFileTimes`],
//! probed with [`FileSystem::file_times`].

pub mod local;
pub mod memory;
pub mod path_conversion;

use std::any::Any;
use std::fmt;
use std::io;
use std::time::SystemTime;

pub use local::LocalFileSystem;
pub use memory::MemoryFileSystem;
pub use path_conversion::PathConversionFileSystem;

/// A path inside a backing filesystem.
///
/// The root is the path with no segments. Identical paths name the same
/// object; whether distinct paths do is up to the filesystem, so the mount
/// layers never treat them as equivalent.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct FsPath {
    parts: Vec<String>,
}

impl FsPath {
    /// The root path.
    pub fn root() -> Self {
        Self::default()
    }

    /// Build a path from ordered segments.
    pub fn from_segments<I, S>(segments: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            parts: segments.into_iter().map(Into::into).collect(),
        }
    }

    /// Append one segment.
    pub fn join(&self, name: impl Into<String>) -> Self {
        let mut parts = self.parts.clone();
        parts.push(name.into());
        Self { parts }
    }

    /// Segments after the root.
    pub fn parts(&self) -> &[String] {
        &self.parts
    }

    pub fn is_root(&self) -> bool {
        self.parts.is_empty()
    }

    /// Final segment, `None` for the root.
    pub fn name(&self) -> Option<&str> {
        self.parts.last().map(String::as_str)
    }

    /// Containing directory, `None` for the root.
    pub fn parent(&self) -> Option<FsPath> {
        if self.parts.is_empty() {
            return None;
        }
        Some(Self {
            parts: self.parts[..self.parts.len() - 1].to_vec(),
        })
    }
}

impl fmt::Display for FsPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "/{}", self.parts.join("/"))
    }
}

/// Kind of object a [`Stat`] describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileKind {
    File,
    Directory,
}

/// Status record returned by `stat` and `fstat`.
///
/// Timestamps are optional; stores that do not track a field leave it unset
/// and the attribute translator fills it from its neighbour.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Stat {
    pub kind: FileKind,
    pub size: u64,
    pub birthtime: Option<SystemTime>,
    pub mtime: Option<SystemTime>,
    pub ctime: Option<SystemTime>,
    pub atime: Option<SystemTime>,
}

impl Stat {
    /// A regular file of the given size with no timestamps.
    pub fn file(size: u64) -> Self {
        Self {
            kind: FileKind::File,
            size,
            birthtime: None,
            mtime: None,
            ctime: None,
            atime: None,
        }
    }

    /// A directory with no timestamps.
    pub fn directory() -> Self {
        Self {
            kind: FileKind::Directory,
            ..Self::file(0)
        }
    }

    pub fn with_birthtime(mut self, t: SystemTime) -> Self {
        self.birthtime = Some(t);
        self
    }

    pub fn with_mtime(mut self, t: SystemTime) -> Self {
        self.mtime = Some(t);
        self
    }

    pub fn with_ctime(mut self, t: SystemTime) -> Self {
        self.ctime = Some(t);
        self
    }

    pub fn with_atime(mut self, t: SystemTime) -> Self {
        self.atime = Some(t);
        self
    }

    pub fn is_dir(&self) -> bool {
        self.kind == FileKind::Directory
    }
}

/// One child of a directory listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    pub name: String,
    pub stat: Stat,
}

/// Volume statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatVfs {
    /// Blocks available to unprivileged users.
    pub f_bavail: u64,
    /// Total blocks, in units of `f_frsize`.
    pub f_blocks: u64,
    /// Fragment size in bytes.
    pub f_frsize: u64,
}

/// Times accepted by [`SetFileTimes`]. `None` leaves a field untouched.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FileTimes {
    pub created: Option<SystemTime>,
    pub accessed: Option<SystemTime>,
    pub modified: Option<SystemTime>,
    pub changed: Option<SystemTime>,
}

/// An open file.
pub trait File: Send + Sync {
    fn stat(&self) -> io::Result<Stat>;

    /// Read up to `size` bytes at `offset`. Short reads mean end of file.
    fn read_at(&self, size: usize, offset: u64) -> io::Result<Vec<u8>>;

    /// Write `data` at `offset`, returning the number of bytes written.
    fn write_at(&self, data: &[u8], offset: u64) -> io::Result<usize>;

    fn set_len(&self, len: u64) -> io::Result<()>;

    fn sync(&self) -> io::Result<()>;

    fn close(&self) -> io::Result<()>;

    /// Concrete type access for capability implementations.
    fn as_any(&self) -> &dyn Any;
}

/// An open directory.
pub trait Directory: Send + Sync {
    /// Children of the directory, excluding `.` and `..`.
    fn entries(&self) -> io::Result<Vec<DirEntry>>;

    fn close(&self) -> io::Result<()>;
}

/// Optional capability: set timestamps on an open file.
pub trait SetFileTimes: Send + Sync {
    fn set_file_times(&self, file: &dyn File, times: FileTimes) -> io::Result<()>;
}

/// The capability set every backing filesystem implements.
///
/// Implementations must tolerate concurrent calls: the kernel transport may
/// invoke callbacks from several worker threads at once.
pub trait FileSystem: Send + Sync {
    /// Build a path from segments. Stores with their own path types can
    /// normalise here.
    fn create_path(&self, segments: &[&str]) -> FsPath {
        FsPath::from_segments(segments.iter().copied())
    }

    /// Open a file. `flags` are `open(2)` flags (`O_RDONLY`, `O_CREAT`, ...).
    fn open(&self, path: &FsPath, flags: i32) -> io::Result<Box<dyn File>>;

    fn open_directory(&self, path: &FsPath) -> io::Result<Box<dyn Directory>>;

    fn stat(&self, path: &FsPath) -> io::Result<Stat>;

    fn fstat(&self, file: &dyn File) -> io::Result<Stat> {
        file.stat()
    }

    fn pread(&self, file: &dyn File, size: usize, offset: u64) -> io::Result<Vec<u8>> {
        file.read_at(size, offset)
    }

    fn pwrite(&self, file: &dyn File, data: &[u8], offset: u64) -> io::Result<usize> {
        file.write_at(data, offset)
    }

    fn ftruncate(&self, file: &dyn File, len: u64) -> io::Result<()> {
        file.set_len(len)
    }

    fn fsync(&self, file: &dyn File) -> io::Result<()> {
        file.sync()
    }

    fn unlink(&self, path: &FsPath) -> io::Result<()>;

    fn mkdir(&self, path: &FsPath) -> io::Result<()>;

    fn rmdir(&self, path: &FsPath) -> io::Result<()>;

    /// Rename without replacing. Must fail with `EEXIST` if `to` exists.
    fn rename_noreplace(&self, from: &FsPath, to: &FsPath) -> io::Result<()>;

    fn statvfs(&self) -> io::Result<StatVfs>;

    /// Release the store. Called exactly once per mount session.
    fn close(&self) -> io::Result<()> {
        Ok(())
    }

    /// The optional time-setting capability.
    fn file_times(&self) -> Option<&dyn SetFileTimes> {
        None
    }
}

/// Build an `io::Error` from an errno value.
pub fn errno(code: i32) -> io::Error {
    io::Error::from_raw_os_error(code)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fs_path_root() {
        let root = FsPath::root();
        assert!(root.is_root());
        assert_eq!(root.name(), None);
        assert_eq!(root.parent(), None);
        assert_eq!(root.to_string(), "/");
    }

    #[test]
    fn test_fs_path_join_and_parent() {
        let path = FsPath::root().join("a").join("b.txt");
        assert_eq!(path.parts(), &["a".to_string(), "b.txt".to_string()]);
        assert_eq!(path.name(), Some("b.txt"));
        assert_eq!(path.parent(), Some(FsPath::from_segments(["a"])));
        assert_eq!(path.to_string(), "/a/b.txt");
    }

    #[test]
    fn test_stat_builders() {
        let t = SystemTime::UNIX_EPOCH + std::time::Duration::from_secs(10);
        let stat = Stat::file(5).with_mtime(t);
        assert_eq!(stat.kind, FileKind::File);
        assert_eq!(stat.size, 5);
        assert_eq!(stat.mtime, Some(t));
        assert!(stat.birthtime.is_none());
        assert!(Stat::directory().is_dir());
    }

    #[test]
    fn test_errno_kind_mapping() {
        assert_eq!(errno(libc::ENOENT).kind(), io::ErrorKind::NotFound);
        assert_eq!(errno(libc::EEXIST).kind(), io::ErrorKind::AlreadyExists);
        assert_eq!(errno(libc::EEXIST).raw_os_error(), Some(libc::EEXIST));
    }
}
