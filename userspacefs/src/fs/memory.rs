//! In-memory backing filesystem.
//!
//! Used by the test suite and handy for demos. Open handles keep their data
//! alive after `unlink`, the way a POSIX filesystem does.

use std::any::Any;
use std::collections::HashMap;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::SystemTime;

use parking_lot::RwLock;

use super::{
    errno, DirEntry, Directory, File, FileSystem, FileTimes, FsPath, SetFileTimes, Stat, StatVfs,
};

/// Block size reported by `statvfs`.
const BLOCK_SIZE: u64 = 4096;

/// Default capacity reported by `statvfs` (1 GiB).
const DEFAULT_CAPACITY: u64 = 1024 * 1024 * 1024;

#[derive(Debug)]
struct FileData {
    content: Vec<u8>,
    birthtime: SystemTime,
    mtime: SystemTime,
    atime: SystemTime,
}

impl FileData {
    fn new() -> Self {
        let now = SystemTime::now();
        Self {
            content: Vec::new(),
            birthtime: now,
            mtime: now,
            atime: now,
        }
    }

    fn stat(&self) -> Stat {
        Stat::file(self.content.len() as u64)
            .with_birthtime(self.birthtime)
            .with_mtime(self.mtime)
            .with_atime(self.atime)
    }
}

#[derive(Debug, Clone)]
enum Node {
    File(Arc<RwLock<FileData>>),
    Directory { birthtime: SystemTime },
}

impl Node {
    fn stat(&self) -> Stat {
        match self {
            Node::File(data) => data.read().stat(),
            Node::Directory { birthtime } => Stat::directory().with_birthtime(*birthtime),
        }
    }
}

/// A filesystem held entirely in memory.
#[derive(Debug)]
pub struct MemoryFileSystem {
    nodes: RwLock<HashMap<Vec<String>, Node>>,
    capacity: u64,
    close_count: AtomicUsize,
}

impl Default for MemoryFileSystem {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryFileSystem {
    /// Create an empty filesystem containing only the root directory.
    pub fn new() -> Self {
        let mut nodes = HashMap::new();
        nodes.insert(
            Vec::new(),
            Node::Directory {
                birthtime: SystemTime::now(),
            },
        );
        Self {
            nodes: RwLock::new(nodes),
            capacity: DEFAULT_CAPACITY,
            close_count: AtomicUsize::new(0),
        }
    }

    /// Set the capacity reported by `statvfs`.
    pub fn with_capacity(mut self, bytes: u64) -> Self {
        self.capacity = bytes;
        self
    }

    /// Create (or replace) a file with the given contents.
    ///
    /// Parent directories must already exist.
    pub fn write_file(&self, path: &FsPath, content: &[u8]) -> io::Result<()> {
        let mut nodes = self.nodes.write();
        Self::check_parent(&nodes, path)?;
        let mut data = FileData::new();
        data.content = content.to_vec();
        nodes.insert(path.parts().to_vec(), Node::File(Arc::new(RwLock::new(data))));
        Ok(())
    }

    /// Full contents of a file.
    pub fn read_file(&self, path: &FsPath) -> io::Result<Vec<u8>> {
        match self.nodes.read().get(path.parts()) {
            Some(Node::File(data)) => Ok(data.read().content.clone()),
            Some(Node::Directory { .. }) => Err(errno(libc::EISDIR)),
            None => Err(errno(libc::ENOENT)),
        }
    }

    /// Whether anything exists at `path`.
    pub fn exists(&self, path: &FsPath) -> bool {
        self.nodes.read().contains_key(path.parts())
    }

    /// Number of times `close` has been called.
    pub fn close_count(&self) -> usize {
        self.close_count.load(Ordering::SeqCst)
    }

    fn check_parent(nodes: &HashMap<Vec<String>, Node>, path: &FsPath) -> io::Result<()> {
        let parent = path.parent().ok_or_else(|| errno(libc::EEXIST))?;
        match nodes.get(parent.parts()) {
            Some(Node::Directory { .. }) => Ok(()),
            Some(Node::File(_)) => Err(errno(libc::ENOTDIR)),
            None => Err(errno(libc::ENOENT)),
        }
    }

    fn used_bytes(&self) -> u64 {
        self.nodes
            .read()
            .values()
            .map(|node| match node {
                Node::File(data) => data.read().content.len() as u64,
                Node::Directory { .. } => 0,
            })
            .sum()
    }
}

impl FileSystem for MemoryFileSystem {
    fn open(&self, path: &FsPath, flags: i32) -> io::Result<Box<dyn File>> {
        let mut nodes = self.nodes.write();
        let existing = nodes.get(path.parts()).cloned();
        let data = match existing {
            Some(Node::Directory { .. }) => return Err(errno(libc::EISDIR)),
            Some(Node::File(_)) if flags & libc::O_CREAT != 0 && flags & libc::O_EXCL != 0 => {
                return Err(errno(libc::EEXIST))
            }
            Some(Node::File(data)) => data,
            None if flags & libc::O_CREAT != 0 => {
                Self::check_parent(&nodes, path)?;
                let data = Arc::new(RwLock::new(FileData::new()));
                nodes.insert(path.parts().to_vec(), Node::File(Arc::clone(&data)));
                data
            }
            None => return Err(errno(libc::ENOENT)),
        };
        drop(nodes);

        if flags & libc::O_TRUNC != 0 {
            let mut guard = data.write();
            guard.content.clear();
            guard.mtime = SystemTime::now();
        }

        Ok(Box::new(MemoryFile {
            data,
            closed: AtomicBool::new(false),
        }))
    }

    fn open_directory(&self, path: &FsPath) -> io::Result<Box<dyn Directory>> {
        let nodes = self.nodes.read();
        match nodes.get(path.parts()) {
            Some(Node::Directory { .. }) => {}
            Some(Node::File(_)) => return Err(errno(libc::ENOTDIR)),
            None => return Err(errno(libc::ENOENT)),
        }

        let depth = path.parts().len();
        let mut entries: Vec<DirEntry> = nodes
            .iter()
            .filter(|(key, _)| key.len() == depth + 1 && key.starts_with(path.parts()))
            .map(|(key, node)| DirEntry {
                name: key[depth].clone(),
                stat: node.stat(),
            })
            .collect();
        entries.sort_by(|a, b| a.name.cmp(&b.name));

        Ok(Box::new(MemoryDirectory { entries }))
    }

    fn stat(&self, path: &FsPath) -> io::Result<Stat> {
        self.nodes
            .read()
            .get(path.parts())
            .map(Node::stat)
            .ok_or_else(|| errno(libc::ENOENT))
    }

    fn unlink(&self, path: &FsPath) -> io::Result<()> {
        let mut nodes = self.nodes.write();
        let is_dir = match nodes.get(path.parts()) {
            Some(node) => matches!(node, Node::Directory { .. }),
            None => return Err(errno(libc::ENOENT)),
        };
        if is_dir {
            return Err(errno(libc::EISDIR));
        }
        nodes.remove(path.parts());
        Ok(())
    }

    fn mkdir(&self, path: &FsPath) -> io::Result<()> {
        let mut nodes = self.nodes.write();
        if nodes.contains_key(path.parts()) {
            return Err(errno(libc::EEXIST));
        }
        Self::check_parent(&nodes, path)?;
        nodes.insert(
            path.parts().to_vec(),
            Node::Directory {
                birthtime: SystemTime::now(),
            },
        );
        Ok(())
    }

    fn rmdir(&self, path: &FsPath) -> io::Result<()> {
        if path.is_root() {
            return Err(errno(libc::EBUSY));
        }
        let mut nodes = self.nodes.write();
        match nodes.get(path.parts()) {
            Some(Node::Directory { .. }) => {}
            Some(Node::File(_)) => return Err(errno(libc::ENOTDIR)),
            None => return Err(errno(libc::ENOENT)),
        }
        let depth = path.parts().len();
        if nodes
            .keys()
            .any(|key| key.len() > depth && key.starts_with(path.parts()))
        {
            return Err(errno(libc::ENOTEMPTY));
        }
        nodes.remove(path.parts());
        Ok(())
    }

    fn rename_noreplace(&self, from: &FsPath, to: &FsPath) -> io::Result<()> {
        if from.is_root() || to.is_root() {
            return Err(errno(libc::EBUSY));
        }
        let mut nodes = self.nodes.write();
        if !nodes.contains_key(from.parts()) {
            return Err(errno(libc::ENOENT));
        }
        if nodes.contains_key(to.parts()) {
            return Err(errno(libc::EEXIST));
        }
        Self::check_parent(&nodes, to)?;
        if to.parts().starts_with(from.parts()) {
            return Err(errno(libc::EINVAL));
        }

        let depth = from.parts().len();
        let moved: Vec<Vec<String>> = nodes
            .keys()
            .filter(|key| key.starts_with(from.parts()))
            .cloned()
            .collect();
        for key in moved {
            if let Some(node) = nodes.remove(&key) {
                let mut new_key = to.parts().to_vec();
                new_key.extend_from_slice(&key[depth..]);
                nodes.insert(new_key, node);
            }
        }
        Ok(())
    }

    fn statvfs(&self) -> io::Result<StatVfs> {
        let blocks = self.capacity / BLOCK_SIZE;
        let used = self.used_bytes().div_ceil(BLOCK_SIZE);
        Ok(StatVfs {
            f_bavail: blocks.saturating_sub(used),
            f_blocks: blocks,
            f_frsize: BLOCK_SIZE,
        })
    }

    fn close(&self) -> io::Result<()> {
        self.close_count.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn file_times(&self) -> Option<&dyn SetFileTimes> {
        Some(self)
    }
}

impl SetFileTimes for MemoryFileSystem {
    fn set_file_times(&self, file: &dyn File, times: FileTimes) -> io::Result<()> {
        let file = file
            .as_any()
            .downcast_ref::<MemoryFile>()
            .ok_or_else(|| errno(libc::EBADF))?;
        let mut data = file.data.write();
        if let Some(t) = times.created {
            data.birthtime = t;
        }
        if let Some(t) = times.accessed {
            data.atime = t;
        }
        if let Some(t) = times.modified {
            data.mtime = t;
        }
        Ok(())
    }
}

/// Open handle on a [`MemoryFileSystem`] file.
#[derive(Debug)]
pub struct MemoryFile {
    data: Arc<RwLock<FileData>>,
    closed: AtomicBool,
}

impl MemoryFile {
    fn check_open(&self) -> io::Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(errno(libc::EBADF));
        }
        Ok(())
    }
}

impl File for MemoryFile {
    fn stat(&self) -> io::Result<Stat> {
        self.check_open()?;
        Ok(self.data.read().stat())
    }

    fn read_at(&self, size: usize, offset: u64) -> io::Result<Vec<u8>> {
        self.check_open()?;
        let data = self.data.read();
        let len = data.content.len();
        let start = usize::try_from(offset).unwrap_or(usize::MAX).min(len);
        let end = start.saturating_add(size).min(len);
        Ok(data.content[start..end].to_vec())
    }

    fn write_at(&self, buf: &[u8], offset: u64) -> io::Result<usize> {
        self.check_open()?;
        let offset = usize::try_from(offset).map_err(|_| errno(libc::EFBIG))?;
        let end = offset
            .checked_add(buf.len())
            .filter(|end| isize::try_from(*end).is_ok())
            .ok_or_else(|| errno(libc::EFBIG))?;
        let mut data = self.data.write();
        if data.content.len() < end {
            data.content.resize(end, 0);
        }
        data.content[offset..end].copy_from_slice(buf);
        data.mtime = SystemTime::now();
        Ok(buf.len())
    }

    fn set_len(&self, len: u64) -> io::Result<()> {
        self.check_open()?;
        let len = usize::try_from(len).map_err(|_| errno(libc::EFBIG))?;
        let mut data = self.data.write();
        data.content.resize(len, 0);
        data.mtime = SystemTime::now();
        Ok(())
    }

    fn sync(&self) -> io::Result<()> {
        self.check_open()
    }

    fn close(&self) -> io::Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Err(errno(libc::EBADF));
        }
        Ok(())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Snapshot of a directory taken at `open_directory`.
#[derive(Debug)]
pub struct MemoryDirectory {
    entries: Vec<DirEntry>,
}

impl Directory for MemoryDirectory {
    fn entries(&self) -> io::Result<Vec<DirEntry>> {
        Ok(self.entries.clone())
    }

    fn close(&self) -> io::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::FileKind;

    fn path(s: &str) -> FsPath {
        FsPath::from_segments(s.split('/').filter(|p| !p.is_empty()))
    }

    #[test]
    fn test_create_write_read() {
        let fs = MemoryFileSystem::new();
        let f = fs
            .open(&path("a.txt"), libc::O_RDWR | libc::O_CREAT)
            .unwrap();
        assert_eq!(fs.pwrite(f.as_ref(), b"hello", 0).unwrap(), 5);
        assert_eq!(fs.pread(f.as_ref(), 3, 1).unwrap(), b"ell");
        assert_eq!(fs.fstat(f.as_ref()).unwrap().size, 5);
        f.close().unwrap();
        assert_eq!(fs.read_file(&path("a.txt")).unwrap(), b"hello");
    }

    #[test]
    fn test_write_past_addressable_end_is_efbig() {
        let fs = MemoryFileSystem::new();
        let f = fs
            .open(&path("big"), libc::O_RDWR | libc::O_CREAT)
            .unwrap();
        for offset in [u64::MAX, u64::MAX - 1, isize::MAX as u64] {
            let err = fs.pwrite(f.as_ref(), b"xy", offset).unwrap_err();
            assert_eq!(err.raw_os_error(), Some(libc::EFBIG));
        }
        assert_eq!(fs.fstat(f.as_ref()).unwrap().size, 0);
    }

    #[test]
    fn test_open_missing_without_create() {
        let fs = MemoryFileSystem::new();
        let err = fs.open(&path("missing"), libc::O_RDONLY).err().unwrap();
        assert_eq!(err.kind(), io::ErrorKind::NotFound);
    }

    #[test]
    fn test_open_truncates() {
        let fs = MemoryFileSystem::new();
        fs.write_file(&path("a"), b"abc").unwrap();
        let f = fs.open(&path("a"), libc::O_WRONLY | libc::O_TRUNC).unwrap();
        assert_eq!(f.stat().unwrap().size, 0);
    }

    #[test]
    fn test_directory_listing_is_sorted_and_shallow() {
        let fs = MemoryFileSystem::new();
        fs.mkdir(&path("d")).unwrap();
        fs.write_file(&path("d/inner"), b"x").unwrap();
        fs.write_file(&path("b"), b"").unwrap();
        let dir = fs.open_directory(&FsPath::root()).unwrap();
        let names: Vec<String> = dir.entries().unwrap().into_iter().map(|e| e.name).collect();
        assert_eq!(names, vec!["b", "d"]);
    }

    #[test]
    fn test_rmdir_non_empty() {
        let fs = MemoryFileSystem::new();
        fs.mkdir(&path("d")).unwrap();
        fs.write_file(&path("d/f"), b"").unwrap();
        assert_eq!(
            fs.rmdir(&path("d")).unwrap_err().raw_os_error(),
            Some(libc::ENOTEMPTY)
        );
        fs.unlink(&path("d/f")).unwrap();
        fs.rmdir(&path("d")).unwrap();
        assert!(!fs.exists(&path("d")));
    }

    #[test]
    fn test_rename_noreplace_refuses_existing_target() {
        let fs = MemoryFileSystem::new();
        fs.write_file(&path("a"), b"1").unwrap();
        fs.write_file(&path("b"), b"2").unwrap();
        let err = fs.rename_noreplace(&path("a"), &path("b")).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::AlreadyExists);
    }

    #[test]
    fn test_rename_moves_subtree() {
        let fs = MemoryFileSystem::new();
        fs.mkdir(&path("d")).unwrap();
        fs.write_file(&path("d/f"), b"data").unwrap();
        fs.rename_noreplace(&path("d"), &path("e")).unwrap();
        assert!(!fs.exists(&path("d/f")));
        assert_eq!(fs.read_file(&path("e/f")).unwrap(), b"data");
        assert_eq!(fs.stat(&path("e")).unwrap().kind, FileKind::Directory);
    }

    #[test]
    fn test_unlinked_file_stays_readable_through_handle() {
        let fs = MemoryFileSystem::new();
        fs.write_file(&path("a"), b"keep").unwrap();
        let f = fs.open(&path("a"), libc::O_RDONLY).unwrap();
        fs.unlink(&path("a")).unwrap();
        assert_eq!(f.read_at(10, 0).unwrap(), b"keep");
    }

    #[test]
    fn test_statvfs_accounts_usage() {
        let fs = MemoryFileSystem::new().with_capacity(BLOCK_SIZE * 10);
        fs.write_file(&path("a"), &[0u8; 5000]).unwrap();
        let vfs = fs.statvfs().unwrap();
        assert_eq!(vfs.f_blocks, 10);
        assert_eq!(vfs.f_bavail, 8);
        assert_eq!(vfs.f_frsize, BLOCK_SIZE);
    }

    #[test]
    fn test_set_file_times() {
        let fs = MemoryFileSystem::new();
        fs.write_file(&path("a"), b"").unwrap();
        let f = fs.open(&path("a"), libc::O_RDONLY).unwrap();
        let t = SystemTime::UNIX_EPOCH + std::time::Duration::from_secs(1234);
        fs.file_times()
            .unwrap()
            .set_file_times(
                f.as_ref(),
                FileTimes {
                    modified: Some(t),
                    ..Default::default()
                },
            )
            .unwrap();
        assert_eq!(fs.stat(&path("a")).unwrap().mtime, Some(t));
    }

    #[test]
    fn test_close_counts() {
        let fs = MemoryFileSystem::new();
        assert_eq!(fs.close_count(), 0);
        fs.close().unwrap();
        assert_eq!(fs.close_count(), 1);
    }
}
