//! Passthrough backing filesystem over a host directory.
//!
//! Real files are served straight from the source directory. Paths are
//! resolved relative to the configured root and never escape it.

use std::any::Any;
use std::fs::{self, OpenOptions};
use std::io;
use std::os::unix::fs::{FileExt, MetadataExt, OpenOptionsExt};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use tracing::{debug, trace};

use super::{
    errno, DirEntry, Directory, File, FileSystem, FileTimes, FsPath, SetFileTimes, Stat, StatVfs,
};

/// A [`FileSystem`] backed by a directory on the host.
#[derive(Debug, Clone)]
pub struct LocalFileSystem {
    root: PathBuf,
}

impl LocalFileSystem {
    /// Serve the contents of `root`.
    pub fn new(root: impl Into<PathBuf>) -> io::Result<Self> {
        let root = root.into();
        if !fs::metadata(&root)?.is_dir() {
            return Err(errno(libc::ENOTDIR));
        }
        debug!(root = %root.display(), "Created local filesystem");
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn host_path(&self, path: &FsPath) -> io::Result<PathBuf> {
        let mut host = self.root.clone();
        for part in path.parts() {
            if part.is_empty() || part == "." || part == ".." || part.contains('/') {
                return Err(errno(libc::EINVAL));
            }
            host.push(part);
        }
        Ok(host)
    }
}

fn stat_from_metadata(meta: &fs::Metadata) -> Stat {
    let mut stat = if meta.is_dir() {
        Stat::directory()
    } else {
        Stat::file(meta.len())
    };
    stat.birthtime = meta.created().ok();
    stat.mtime = meta.modified().ok();
    stat.atime = meta.accessed().ok();
    stat.ctime = u64::try_from(meta.ctime())
        .ok()
        .map(|secs| SystemTime::UNIX_EPOCH + Duration::new(secs, meta.ctime_nsec() as u32));
    stat
}

impl FileSystem for LocalFileSystem {
    fn open(&self, path: &FsPath, flags: i32) -> io::Result<Box<dyn File>> {
        let host = self.host_path(path)?;
        let access = flags & libc::O_ACCMODE;
        trace!(path = %host.display(), flags, "open");
        let file = OpenOptions::new()
            .read(access == libc::O_RDONLY || access == libc::O_RDWR)
            .write(access == libc::O_WRONLY || access == libc::O_RDWR)
            .custom_flags(flags & !libc::O_ACCMODE)
            .mode(0o666)
            .open(&host)?;
        if file.metadata()?.is_dir() {
            return Err(errno(libc::EISDIR));
        }
        Ok(Box::new(LocalFile { file }))
    }

    fn open_directory(&self, path: &FsPath) -> io::Result<Box<dyn Directory>> {
        let host = self.host_path(path)?;
        if !fs::metadata(&host)?.is_dir() {
            return Err(errno(libc::ENOTDIR));
        }
        Ok(Box::new(LocalDirectory { path: host }))
    }

    fn stat(&self, path: &FsPath) -> io::Result<Stat> {
        let meta = fs::metadata(self.host_path(path)?)?;
        Ok(stat_from_metadata(&meta))
    }

    fn unlink(&self, path: &FsPath) -> io::Result<()> {
        fs::remove_file(self.host_path(path)?)
    }

    fn mkdir(&self, path: &FsPath) -> io::Result<()> {
        fs::create_dir(self.host_path(path)?)
    }

    fn rmdir(&self, path: &FsPath) -> io::Result<()> {
        fs::remove_dir(self.host_path(path)?)
    }

    #[cfg(target_os = "linux")]
    fn rename_noreplace(&self, from: &FsPath, to: &FsPath) -> io::Result<()> {
        use nix::fcntl::{renameat2, RenameFlags};

        let from = self.host_path(from)?;
        let to = self.host_path(to)?;
        renameat2(
            None,
            from.as_path(),
            None,
            to.as_path(),
            RenameFlags::RENAME_NOREPLACE,
        )
        .map_err(io::Error::from)
    }

    #[cfg(not(target_os = "linux"))]
    fn rename_noreplace(&self, from: &FsPath, to: &FsPath) -> io::Result<()> {
        let from = self.host_path(from)?;
        let to = self.host_path(to)?;
        if fs::symlink_metadata(&to).is_ok() {
            return Err(errno(libc::EEXIST));
        }
        fs::rename(from, to)
    }

    fn statvfs(&self) -> io::Result<StatVfs> {
        let vfs = nix::sys::statvfs::statvfs(self.root.as_path()).map_err(io::Error::from)?;
        Ok(StatVfs {
            f_bavail: vfs.blocks_available() as u64,
            f_blocks: vfs.blocks() as u64,
            f_frsize: vfs.fragment_size() as u64,
        })
    }

    fn close(&self) -> io::Result<()> {
        debug!(root = %self.root.display(), "Closed local filesystem");
        Ok(())
    }

    fn file_times(&self) -> Option<&dyn SetFileTimes> {
        Some(self)
    }
}

impl SetFileTimes for LocalFileSystem {
    fn set_file_times(&self, file: &dyn File, times: FileTimes) -> io::Result<()> {
        let local = file
            .as_any()
            .downcast_ref::<LocalFile>()
            .ok_or_else(|| errno(libc::EBADF))?;
        let mut host_times = fs::FileTimes::new();
        if let Some(t) = times.accessed {
            host_times = host_times.set_accessed(t);
        }
        if let Some(t) = times.modified {
            host_times = host_times.set_modified(t);
        }
        local.file.set_times(host_times)
    }
}

/// Open handle on a host file.
#[derive(Debug)]
pub struct LocalFile {
    file: fs::File,
}

impl File for LocalFile {
    fn stat(&self) -> io::Result<Stat> {
        Ok(stat_from_metadata(&self.file.metadata()?))
    }

    fn read_at(&self, size: usize, offset: u64) -> io::Result<Vec<u8>> {
        let mut buf = vec![0u8; size];
        let mut filled = 0;
        while filled < size {
            match self.file.read_at(&mut buf[filled..], offset + filled as u64) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
        buf.truncate(filled);
        Ok(buf)
    }

    fn write_at(&self, data: &[u8], offset: u64) -> io::Result<usize> {
        self.file.write_all_at(data, offset)?;
        Ok(data.len())
    }

    fn set_len(&self, len: u64) -> io::Result<()> {
        self.file.set_len(len)
    }

    fn sync(&self) -> io::Result<()> {
        self.file.sync_all()
    }

    fn close(&self) -> io::Result<()> {
        // The descriptor is released when the handle is dropped.
        Ok(())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Open handle on a host directory. Listing happens on demand.
#[derive(Debug)]
pub struct LocalDirectory {
    path: PathBuf,
}

impl Directory for LocalDirectory {
    fn entries(&self) -> io::Result<Vec<DirEntry>> {
        let mut entries = Vec::new();
        for entry in fs::read_dir(&self.path)? {
            let entry = entry?;
            let Ok(name) = entry.file_name().into_string() else {
                debug!(path = %entry.path().display(), "Skipping non-UTF-8 name");
                continue;
            };
            // Entries can vanish between read_dir and stat.
            let Ok(meta) = entry.metadata() else {
                continue;
            };
            entries.push(DirEntry {
                name,
                stat: stat_from_metadata(&meta),
            });
        }
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(entries)
    }

    fn close(&self) -> io::Result<()> {
        Ok(())
    }
}
