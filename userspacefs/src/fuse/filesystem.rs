//! `fuser` binding for the path-addressed [`Adapter`].
//!
//! The kernel speaks in inode numbers; [`FuseFilesystem`] resolves them to
//! transport paths through an [`InodeTable`] and forwards each request to
//! the adapter. Replies carry a one second attribute and entry TTL.

use std::ffi::OsStr;
use std::time::{Duration, SystemTime};

use fuser::{
    FileAttr, FileType, Filesystem, KernelConfig, ReplyAttr, ReplyCreate, ReplyData,
    ReplyDirectory, ReplyEmpty, ReplyEntry, ReplyOpen, ReplyStatfs, ReplyWrite, Request,
    TimeOrNow,
};
use libc::c_int;
use tracing::{debug, error, trace, warn};

use super::adapter::{to_errno, Adapter, FuseResult};
use super::inode::{child_path, parent_path, InodeTable, UNKNOWN_INODE};

/// How long the kernel may cache attributes and entries.
const TTL: Duration = Duration::from_secs(1);

/// Longest file name reported by `statfs`.
const NAME_MAX: u32 = 255;

/// Inode-addressed front end over an [`Adapter`].
pub struct FuseFilesystem {
    adapter: Adapter,
    inodes: InodeTable,
}

impl FuseFilesystem {
    pub fn new(adapter: Adapter) -> Self {
        Self {
            adapter,
            inodes: InodeTable::new(),
        }
    }

    pub fn adapter(&self) -> &Adapter {
        &self.adapter
    }

    fn path(&self, ino: u64) -> FuseResult<String> {
        self.inodes.path(ino).ok_or(libc::ENOENT)
    }

    fn child(&self, parent: u64, name: &OsStr) -> FuseResult<String> {
        let name = name.to_str().ok_or(libc::EINVAL)?;
        Ok(child_path(&self.path(parent)?, name))
    }

    /// Stat `path` for an entry reply, taking a kernel lookup on its inode.
    fn entry(&self, path: &str, fh: Option<u64>) -> FuseResult<FileAttr> {
        let attrs = self.adapter.getattr(path, fh)?;
        let ino = self.inodes.lookup(path);
        Ok(attrs.to_file_attr(ino))
    }

    fn lookup_entry(&self, parent: u64, name: &OsStr) -> FuseResult<FileAttr> {
        let path = self.child(parent, name)?;
        self.entry(&path, None)
    }

    fn apply_setattr(
        &self,
        ino: u64,
        mode: Option<u32>,
        size: Option<u64>,
        atime: Option<TimeOrNow>,
        mtime: Option<TimeOrNow>,
        fh: Option<u64>,
    ) -> FuseResult<FileAttr> {
        let path = self.path(ino)?;
        if let Some(mode) = mode {
            self.adapter.chmod(&path, mode)?;
        }
        if let Some(size) = size {
            self.adapter.truncate(&path, size, fh)?;
        }
        if atime.is_some() || mtime.is_some() {
            self.adapter
                .utimens(&path, atime.map(resolve_time), mtime.map(resolve_time))?;
        }
        let attrs = self.adapter.getattr(&path, fh)?;
        Ok(attrs.to_file_attr(ino))
    }

    fn create_entry(
        &self,
        parent: u64,
        name: &OsStr,
        mode: u32,
        flags: i32,
    ) -> FuseResult<(FileAttr, u64)> {
        let path = self.child(parent, name)?;
        let fh = self.adapter.create(&path, mode, flags)?;
        match self.entry(&path, Some(fh)) {
            Ok(attr) => Ok((attr, fh)),
            Err(e) => {
                if let Err(release) = self.adapter.release(fh) {
                    warn!(fh, errno = release, "Failed to release handle of unreported create");
                }
                Err(e)
            }
        }
    }

    fn rename_entry(
        &self,
        parent: u64,
        name: &OsStr,
        newparent: u64,
        newname: &OsStr,
        flags: u32,
    ) -> FuseResult<()> {
        if flags != 0 {
            debug!(flags, "Rejecting rename with flags");
            return Err(libc::EINVAL);
        }
        let from = self.child(parent, name)?;
        let to = self.child(newparent, newname)?;
        self.adapter.rename(&from, &to)?;
        self.inodes.rename(&from, &to);
        Ok(())
    }

    /// Feed directory entries from `offset` on to `add` until it reports a
    /// full buffer. Entries the kernel has not looked up are not registered.
    fn fill_directory(
        &self,
        ino: u64,
        fh: u64,
        offset: i64,
        mut add: impl FnMut(u64, i64, FileType, &str) -> bool,
    ) -> FuseResult<()> {
        let dir = self.path(ino)?;
        let listing = self.adapter.readdir(fh)?;
        let skip = usize::try_from(offset).map_err(|_| libc::EINVAL)?;
        for (i, entry) in listing.iter().enumerate().skip(skip) {
            let entry_ino = match entry.name.as_str() {
                "." => Some(ino),
                ".." => self.inodes.ino(parent_path(&dir)),
                name => self.inodes.ino(&child_path(&dir, name)),
            }
            .unwrap_or(UNKNOWN_INODE);
            let kind = entry
                .attrs
                .as_ref()
                .map_or(FileType::Directory, |a| a.file_type());
            // A full buffer ends this batch; the kernel asks again at the
            // next offset.
            if add(entry_ino, (i + 1) as i64, kind, &entry.name) {
                break;
            }
        }
        Ok(())
    }
}

/// Reply fields are 32-bit; saturate rather than wrap.
fn clamp_u32(value: u64) -> u32 {
    u32::try_from(value).unwrap_or(u32::MAX)
}

fn resolve_time(t: TimeOrNow) -> SystemTime {
    match t {
        TimeOrNow::SpecificTime(t) => t,
        TimeOrNow::Now => SystemTime::now(),
    }
}

impl Filesystem for FuseFilesystem {
    fn init(&mut self, _req: &Request<'_>, _config: &mut KernelConfig) -> Result<(), c_int> {
        self.adapter.init().map_err(|e| {
            error!(error = %e, "Failed to create backing filesystem");
            to_errno(&e)
        })
    }

    fn destroy(&mut self) {
        self.adapter.destroy();
    }

    fn lookup(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEntry) {
        trace!(parent, ?name, "lookup");
        match self.lookup_entry(parent, name) {
            Ok(attr) => reply.entry(&TTL, &attr, 0),
            Err(e) => reply.error(e),
        }
    }

    fn forget(&mut self, _req: &Request<'_>, ino: u64, nlookup: u64) {
        trace!(ino, nlookup, "forget");
        self.inodes.forget(ino, nlookup);
    }

    fn getattr(&mut self, _req: &Request<'_>, ino: u64, reply: ReplyAttr) {
        trace!(ino, "getattr");
        let result = self
            .path(ino)
            .and_then(|path| self.adapter.getattr(&path, None));
        match result {
            Ok(attrs) => reply.attr(&TTL, &attrs.to_file_attr(ino)),
            Err(e) => reply.error(e),
        }
    }

    fn setattr(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        mode: Option<u32>,
        _uid: Option<u32>,
        _gid: Option<u32>,
        size: Option<u64>,
        atime: Option<TimeOrNow>,
        mtime: Option<TimeOrNow>,
        _ctime: Option<SystemTime>,
        fh: Option<u64>,
        _crtime: Option<SystemTime>,
        _chgtime: Option<SystemTime>,
        _bkuptime: Option<SystemTime>,
        _flags: Option<u32>,
        reply: ReplyAttr,
    ) {
        trace!(ino, ?size, ?fh, "setattr");
        match self.apply_setattr(ino, mode, size, atime, mtime, fh) {
            Ok(attr) => reply.attr(&TTL, &attr),
            Err(e) => reply.error(e),
        }
    }

    fn mknod(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        mode: u32,
        _umask: u32,
        _rdev: u32,
        reply: ReplyEntry,
    ) {
        trace!(parent, ?name, mode, "mknod");
        let result = self.child(parent, name).and_then(|path| {
            self.adapter.mknod(&path, mode)?;
            self.entry(&path, None)
        });
        match result {
            Ok(attr) => reply.entry(&TTL, &attr, 0),
            Err(e) => reply.error(e),
        }
    }

    fn mkdir(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        _mode: u32,
        _umask: u32,
        reply: ReplyEntry,
    ) {
        trace!(parent, ?name, "mkdir");
        let result = self.child(parent, name).and_then(|path| {
            self.adapter.mkdir(&path)?;
            self.entry(&path, None)
        });
        match result {
            Ok(attr) => reply.entry(&TTL, &attr, 0),
            Err(e) => reply.error(e),
        }
    }

    fn unlink(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        trace!(parent, ?name, "unlink");
        let result = self.child(parent, name).and_then(|path| {
            self.adapter.unlink(&path)?;
            self.inodes.remove(&path);
            Ok(())
        });
        match result {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(e),
        }
    }

    fn rmdir(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        trace!(parent, ?name, "rmdir");
        let result = self.child(parent, name).and_then(|path| {
            self.adapter.rmdir(&path)?;
            self.inodes.remove(&path);
            Ok(())
        });
        match result {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(e),
        }
    }

    fn rename(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        newparent: u64,
        newname: &OsStr,
        flags: u32,
        reply: ReplyEmpty,
    ) {
        trace!(parent, ?name, newparent, ?newname, "rename");
        match self.rename_entry(parent, name, newparent, newname, flags) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(e),
        }
    }

    fn open(&mut self, _req: &Request<'_>, ino: u64, flags: i32, reply: ReplyOpen) {
        trace!(ino, flags, "open");
        let result = self
            .path(ino)
            .and_then(|path| self.adapter.open(&path, flags));
        match result {
            Ok(fh) => reply.opened(fh, 0),
            Err(e) => reply.error(e),
        }
    }

    fn read(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        fh: u64,
        offset: i64,
        size: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyData,
    ) {
        trace!(fh, offset, size, "read");
        let Ok(offset) = u64::try_from(offset) else {
            return reply.error(libc::EINVAL);
        };
        match self.adapter.read(fh, size as usize, offset) {
            Ok(data) => reply.data(&data),
            Err(e) => reply.error(e),
        }
    }

    fn write(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        fh: u64,
        offset: i64,
        data: &[u8],
        _write_flags: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyWrite,
    ) {
        trace!(fh, offset, len = data.len(), "write");
        let Ok(offset) = u64::try_from(offset) else {
            return reply.error(libc::EINVAL);
        };
        match self.adapter.write(fh, data, offset) {
            Ok(written) => reply.written(clamp_u32(written as u64)),
            Err(e) => reply.error(e),
        }
    }

    fn release(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        fh: u64,
        _flags: i32,
        _lock_owner: Option<u64>,
        _flush: bool,
        reply: ReplyEmpty,
    ) {
        trace!(fh, "release");
        match self.adapter.release(fh) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(e),
        }
    }

    fn fsync(&mut self, _req: &Request<'_>, _ino: u64, fh: u64, _datasync: bool, reply: ReplyEmpty) {
        trace!(fh, "fsync");
        match self.adapter.fsync(fh) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(e),
        }
    }

    fn opendir(&mut self, _req: &Request<'_>, ino: u64, _flags: i32, reply: ReplyOpen) {
        trace!(ino, "opendir");
        let result = self.path(ino).and_then(|path| self.adapter.opendir(&path));
        match result {
            Ok(fh) => reply.opened(fh, 0),
            Err(e) => reply.error(e),
        }
    }

    fn readdir(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        fh: u64,
        offset: i64,
        mut reply: ReplyDirectory,
    ) {
        trace!(ino, fh, offset, "readdir");
        let result = self.fill_directory(ino, fh, offset, |ino, next, kind, name| {
            reply.add(ino, next, kind, name)
        });
        match result {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(e),
        }
    }

    fn releasedir(&mut self, _req: &Request<'_>, _ino: u64, fh: u64, _flags: i32, reply: ReplyEmpty) {
        trace!(fh, "releasedir");
        match self.adapter.releasedir(fh) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(e),
        }
    }

    fn statfs(&mut self, _req: &Request<'_>, _ino: u64, reply: ReplyStatfs) {
        trace!("statfs");
        match self.adapter.statfs() {
            Ok(s) => reply.statfs(
                s.blocks,
                s.bfree,
                s.bavail,
                0,
                0,
                clamp_u32(s.bsize),
                NAME_MAX,
                clamp_u32(s.frsize),
            ),
            Err(e) => reply.error(e),
        }
    }

    fn create(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        mode: u32,
        _umask: u32,
        flags: i32,
        reply: ReplyCreate,
    ) {
        trace!(parent, ?name, mode, flags, "create");
        match self.create_entry(parent, name, mode, flags) {
            Ok((attr, fh)) => reply.created(&TTL, &attr, 0, fh, 0),
            Err(e) => reply.error(e),
        }
    }
}
