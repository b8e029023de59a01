//! Kernel-transport adapter.
//!
//! [`Adapter`] implements the path-addressed callback contract the kernel
//! transport drives: every operation takes a transport path (`/dir/name`)
//! and/or a handle number and returns either a result or an errno. The
//! inode-addressed `fuser` binding in [`super::filesystem`] sits on top.
//!
//! Operations may be invoked concurrently. The only shared mutable state is
//! the [`HandleTable`]; the backing filesystem handles its own locking.

use std::io;
use std::sync::Arc;
use std::time::SystemTime;

use libc::c_int;
use tracing::{debug, error, info, warn};

use super::attr::Attributes;
use super::handles::{HandleError, HandleTable, OpenDirectory, Resource};
use crate::fs::{File, FileSystem, FileTimes, FsPath};

/// Result type for adapter operations; errors are errno values.
pub type FuseResult<T> = Result<T, c_int>;

/// Creates the backing filesystem when the kernel initialises the mount.
pub type FsFactory = Arc<dyn Fn() -> io::Result<Arc<dyn FileSystem>> + Send + Sync>;

/// Invoked once, inside the process that ends up serving the mount.
pub type InitHook = Box<dyn FnOnce() + Send>;

/// One row of a directory listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Listing {
    pub name: String,
    /// `None` for `.` and `..`.
    pub attrs: Option<Attributes>,
}

/// Volume statistics in the shape `statfs` replies with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VolumeStats {
    pub blocks: u64,
    pub bfree: u64,
    pub bavail: u64,
    pub bsize: u64,
    pub frsize: u64,
}

/// Map a backing filesystem error to an errno.
pub fn to_errno(err: &io::Error) -> c_int {
    if let Some(code) = err.raw_os_error() {
        return code;
    }
    match err.kind() {
        io::ErrorKind::NotFound => libc::ENOENT,
        io::ErrorKind::PermissionDenied => libc::EACCES,
        io::ErrorKind::AlreadyExists => libc::EEXIST,
        io::ErrorKind::InvalidInput => libc::EINVAL,
        io::ErrorKind::Unsupported => libc::ENOTSUP,
        io::ErrorKind::WouldBlock => libc::EAGAIN,
        io::ErrorKind::Interrupted => libc::EINTR,
        _ => libc::EIO,
    }
}

fn fs_err(err: io::Error) -> c_int {
    to_errno(&err)
}

fn handle_err(err: HandleError) -> c_int {
    error!(error = %err, "Kernel presented a handle it was never given");
    libc::EBADF
}

/// Reject node types the backing filesystems cannot represent.
pub fn check_mode(mode: u32) -> FuseResult<()> {
    let kind = mode & libc::S_IFMT as u32;
    let rejected = [
        libc::S_IFCHR as u32,
        libc::S_IFBLK as u32,
        libc::S_IFIFO as u32,
        libc::S_IFLNK as u32,
        libc::S_IFSOCK as u32,
    ];
    if rejected.contains(&kind) {
        return Err(libc::EPERM);
    }
    Ok(())
}

/// Path-addressed implementation of the kernel callback contract.
pub struct Adapter {
    factory: FsFactory,
    on_init: Option<InitHook>,
    fs: Option<Arc<dyn FileSystem>>,
    handles: HandleTable<Resource>,
}

impl Adapter {
    /// Create an adapter. The filesystem is built on [`Adapter::init`].
    pub fn new(factory: FsFactory) -> Self {
        Self {
            factory,
            on_init: None,
            fs: None,
            handles: HandleTable::new(),
        }
    }

    /// Run `hook` at the start of `init`, before the filesystem is built.
    pub fn with_init_hook(mut self, hook: InitHook) -> Self {
        self.on_init = Some(hook);
        self
    }

    /// Number of open file and directory handles.
    pub fn open_handles(&self) -> usize {
        self.handles.len()
    }

    pub fn is_initialized(&self) -> bool {
        self.fs.is_some()
    }

    /// Build the backing filesystem.
    pub fn init(&mut self) -> io::Result<()> {
        if let Some(hook) = self.on_init.take() {
            hook();
        }
        let fs = (self.factory)()?;
        info!("Backing filesystem ready");
        self.fs = Some(fs);
        Ok(())
    }

    /// Close the backing filesystem. Safe to call more than once; the
    /// filesystem is closed only the first time.
    pub fn destroy(&mut self) {
        if let Some(fs) = self.fs.take() {
            if let Err(e) = fs.close() {
                warn!(error = %e, "Closing backing filesystem failed");
            }
            info!("Backing filesystem closed");
        }
    }

    fn fs(&self) -> FuseResult<&Arc<dyn FileSystem>> {
        self.fs.as_ref().ok_or(libc::EIO)
    }

    /// Resolve a transport path into a backing filesystem path.
    pub fn conv_path(&self, path: &str) -> FuseResult<FsPath> {
        let fs = self.fs()?;
        if path == "/" {
            return Ok(fs.create_path(&[]));
        }
        let rest = path.strip_prefix('/').unwrap_or(path);
        let segments: Vec<&str> = rest.split('/').collect();
        Ok(fs.create_path(&segments))
    }

    fn with_file<T>(&self, fh: u64, op: impl FnOnce(&dyn File) -> io::Result<T>) -> FuseResult<T> {
        let resource = self.handles.lookup(fh).map_err(handle_err)?;
        let file = resource.as_file().ok_or(libc::EISDIR)?;
        op(file).map_err(fs_err)
    }

    pub fn getattr(&self, path: &str, fh: Option<u64>) -> FuseResult<Attributes> {
        let fs = self.fs()?;
        let stat = match fh {
            Some(fh) => {
                let resource = self.handles.lookup(fh).map_err(handle_err)?;
                match resource.as_file() {
                    Some(file) => fs.fstat(file),
                    None => fs.stat(&self.conv_path(path)?),
                }
            }
            None => fs.stat(&self.conv_path(path)?),
        }
        .map_err(fs_err)?;
        Ok(Attributes::from_stat(&stat))
    }

    /// Create a file and open it. Returns the new handle.
    pub fn create(&self, path: &str, mode: u32, flags: i32) -> FuseResult<u64> {
        check_mode(mode)?;
        let fs = self.fs()?;
        let file = fs
            .open(&self.conv_path(path)?, flags | libc::O_CREAT)
            .map_err(fs_err)?;
        Ok(u64::from(self.handles.allocate(Resource::File(file))))
    }

    /// Create a regular file without opening it. Not every kernel transport
    /// calls `create`.
    pub fn mknod(&self, path: &str, mode: u32) -> FuseResult<()> {
        check_mode(mode)?;
        let fs = self.fs()?;
        let file = fs
            .open(&self.conv_path(path)?, libc::O_WRONLY | libc::O_CREAT)
            .map_err(fs_err)?;
        file.close().map_err(fs_err)
    }

    pub fn open(&self, path: &str, flags: i32) -> FuseResult<u64> {
        let fs = self.fs()?;
        let file = fs.open(&self.conv_path(path)?, flags).map_err(fs_err)?;
        Ok(u64::from(self.handles.allocate(Resource::File(file))))
    }

    pub fn read(&self, fh: u64, size: usize, offset: u64) -> FuseResult<Vec<u8>> {
        let fs = self.fs()?;
        self.with_file(fh, |f| fs.pread(f, size, offset))
    }

    pub fn write(&self, fh: u64, data: &[u8], offset: u64) -> FuseResult<usize> {
        let fs = self.fs()?;
        self.with_file(fh, |f| fs.pwrite(f, data, offset))
    }

    /// Truncate through an open handle, or by path when none is given.
    pub fn truncate(&self, path: &str, length: u64, fh: Option<u64>) -> FuseResult<()> {
        let fs = self.fs()?;
        if let Some(fh) = fh {
            return self.with_file(fh, |f| fs.ftruncate(f, length));
        }
        let file = fs
            .open(&self.conv_path(path)?, libc::O_WRONLY)
            .map_err(fs_err)?;
        let result = fs.ftruncate(file.as_ref(), length);
        let closed = file.close();
        result.and(closed).map_err(fs_err)
    }

    pub fn fsync(&self, fh: u64) -> FuseResult<()> {
        let fs = self.fs()?;
        self.with_file(fh, |f| fs.fsync(f))
    }

    /// Drop a file handle and close the file.
    pub fn release(&self, fh: u64) -> FuseResult<()> {
        let resource = self.handles.release(fh).map_err(handle_err)?;
        resource.close().map_err(fs_err)
    }

    pub fn opendir(&self, path: &str) -> FuseResult<u64> {
        let fs = self.fs()?;
        let dir = fs
            .open_directory(&self.conv_path(path)?)
            .map_err(fs_err)?;
        Ok(u64::from(
            self.handles
                .allocate(Resource::Directory(OpenDirectory::new(dir))),
        ))
    }

    /// `.`, `..`, then every child with its attributes.
    ///
    /// The listing is taken once per handle so offset-based paging sees a
    /// consistent view.
    pub fn readdir(&self, fh: u64) -> FuseResult<Arc<Vec<Listing>>> {
        let resource = self.handles.lookup(fh).map_err(handle_err)?;
        let dir = resource.as_directory().ok_or(libc::ENOTDIR)?;
        let mut cached = dir.listing.lock();
        if let Some(listing) = cached.as_ref() {
            return Ok(Arc::clone(listing));
        }

        let entries = dir.dir.entries().map_err(fs_err)?;
        let mut listing = Vec::with_capacity(entries.len() + 2);
        for name in [".", ".."] {
            listing.push(Listing {
                name: name.to_string(),
                attrs: None,
            });
        }
        listing.extend(entries.into_iter().map(|entry| Listing {
            attrs: Some(Attributes::from_stat(&entry.stat)),
            name: entry.name,
        }));

        let listing = Arc::new(listing);
        *cached = Some(Arc::clone(&listing));
        Ok(listing)
    }

    pub fn releasedir(&self, fh: u64) -> FuseResult<()> {
        self.release(fh)
    }

    pub fn unlink(&self, path: &str) -> FuseResult<()> {
        self.fs()?.unlink(&self.conv_path(path)?).map_err(fs_err)
    }

    pub fn mkdir(&self, path: &str) -> FuseResult<()> {
        self.fs()?.mkdir(&self.conv_path(path)?).map_err(fs_err)
    }

    pub fn rmdir(&self, path: &str) -> FuseResult<()> {
        self.fs()?.rmdir(&self.conv_path(path)?).map_err(fs_err)
    }

    /// Rename, replacing the destination.
    ///
    /// The backing contract only offers a non-replacing rename, so an
    /// existing destination is unlinked and the rename retried until it
    /// lands. Observers can briefly see the destination missing.
    pub fn rename(&self, old: &str, new: &str) -> FuseResult<()> {
        let fs = self.fs()?;
        let from = self.conv_path(old)?;
        let to = self.conv_path(new)?;
        // Renaming onto itself must not unlink the destination.
        if from == to {
            return fs.stat(&from).map(|_| ()).map_err(fs_err);
        }
        loop {
            match fs.rename_noreplace(&from, &to) {
                Ok(()) => return Ok(()),
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                    debug!(from = %old, to = %new, "Rename target exists, unlinking");
                    match fs.unlink(&to) {
                        Ok(()) => {}
                        // Someone else removed it first.
                        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                        Err(e) => return Err(fs_err(e)),
                    }
                }
                Err(e) => return Err(fs_err(e)),
            }
        }
    }

    /// Permissions are fixed; accept and ignore.
    pub fn chmod(&self, _path: &str, _mode: u32) -> FuseResult<()> {
        Ok(())
    }

    /// Set access and modification times if the backing filesystem can.
    pub fn utimens(
        &self,
        path: &str,
        atime: Option<SystemTime>,
        mtime: Option<SystemTime>,
    ) -> FuseResult<()> {
        let fs = self.fs()?;
        let Some(setter) = fs.file_times() else {
            return Ok(());
        };
        let file = fs
            .open(&self.conv_path(path)?, libc::O_RDONLY)
            .map_err(fs_err)?;
        let times = FileTimes {
            accessed: atime,
            modified: mtime,
            ..Default::default()
        };
        let result = setter.set_file_times(file.as_ref(), times);
        let closed = file.close();
        result.and(closed).map_err(fs_err)
    }

    pub fn statfs(&self) -> FuseResult<VolumeStats> {
        let vfs = self.fs()?.statvfs().map_err(fs_err)?;
        Ok(VolumeStats {
            blocks: vfs.f_blocks,
            bfree: vfs.f_bavail,
            bavail: vfs.f_bavail,
            bsize: vfs.f_frsize,
            frsize: vfs.f_frsize,
        })
    }
}
