//! Translation from [`Stat`] records to kernel attributes.

use std::time::SystemTime;

use fuser::{FileAttr, FileType};

use crate::fs::{FileKind, Stat};

/// Permission bits reported for every file and directory.
///
/// Access control belongs to the backing store, so the kernel is told
/// everything is open.
pub const PERMISSIONS: u32 = 0o777;

/// Block size reported in attributes.
const BLOCK_SIZE: u32 = 4096;

/// Attributes in the shape the kernel transport expects.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attributes {
    pub size: u64,
    /// File type and permission bits, as in `st_mode`.
    pub mode: u32,
    pub nlink: u32,
    pub uid: u32,
    pub gid: u32,
    pub birthtime: SystemTime,
    pub mtime: SystemTime,
    pub ctime: SystemTime,
    pub atime: SystemTime,
}

impl Attributes {
    /// Translate a status record, owned by the current process.
    pub fn from_stat(stat: &Stat) -> Self {
        Self::with_owner(
            stat,
            nix::unistd::getuid().as_raw(),
            nix::unistd::getgid().as_raw(),
        )
    }

    /// Translate a status record with an explicit owner.
    ///
    /// Missing timestamps fall back along the chain
    /// birthtime → epoch, mtime → birthtime, ctime → mtime, atime → ctime.
    pub fn with_owner(stat: &Stat, uid: u32, gid: u32) -> Self {
        let birthtime = stat.birthtime.unwrap_or(SystemTime::UNIX_EPOCH);
        let mtime = stat.mtime.unwrap_or(birthtime);
        let ctime = stat.ctime.unwrap_or(mtime);
        let atime = stat.atime.unwrap_or(ctime);

        let type_bits = match stat.kind {
            FileKind::Directory => libc::S_IFDIR as u32,
            FileKind::File => libc::S_IFREG as u32,
        };

        Self {
            size: stat.size,
            mode: type_bits | PERMISSIONS,
            // Directory link counts differ across stores and OSes and cannot
            // be computed here; any non-zero value works.
            nlink: 1,
            uid,
            gid,
            birthtime,
            mtime,
            ctime,
            atime,
        }
    }

    pub fn is_dir(&self) -> bool {
        (self.mode & libc::S_IFMT as u32) == libc::S_IFDIR as u32
    }

    pub fn file_type(&self) -> FileType {
        if self.is_dir() {
            FileType::Directory
        } else {
            FileType::RegularFile
        }
    }

    /// Build the `fuser` attribute record for inode `ino`.
    pub fn to_file_attr(&self, ino: u64) -> FileAttr {
        FileAttr {
            ino,
            size: self.size,
            blocks: self.size.div_ceil(512),
            atime: self.atime,
            mtime: self.mtime,
            ctime: self.ctime,
            crtime: self.birthtime,
            kind: self.file_type(),
            perm: (self.mode & 0o7777) as u16,
            nlink: self.nlink,
            uid: self.uid,
            gid: self.gid,
            rdev: 0,
            blksize: BLOCK_SIZE,
            flags: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn at(secs: u64) -> SystemTime {
        SystemTime::UNIX_EPOCH + Duration::from_secs(secs)
    }

    #[test]
    fn test_only_mtime_set() {
        let attrs = Attributes::with_owner(&Stat::file(0).with_mtime(at(100)), 0, 0);
        assert_eq!(attrs.birthtime, SystemTime::UNIX_EPOCH);
        assert_eq!(attrs.mtime, at(100));
        assert_eq!(attrs.ctime, at(100));
        assert_eq!(attrs.atime, at(100));
    }

    #[test]
    fn test_no_timestamps_fall_back_to_epoch() {
        let attrs = Attributes::with_owner(&Stat::file(0), 0, 0);
        assert_eq!(attrs.birthtime, SystemTime::UNIX_EPOCH);
        assert_eq!(attrs.mtime, SystemTime::UNIX_EPOCH);
        assert_eq!(attrs.ctime, SystemTime::UNIX_EPOCH);
        assert_eq!(attrs.atime, SystemTime::UNIX_EPOCH);
    }

    #[test]
    fn test_chain_uses_previous_resolved_value() {
        let stat = Stat::file(0).with_birthtime(at(5)).with_ctime(at(50));
        let attrs = Attributes::with_owner(&stat, 0, 0);
        assert_eq!(attrs.mtime, at(5));
        assert_eq!(attrs.ctime, at(50));
        assert_eq!(attrs.atime, at(50));
    }

    #[test]
    fn test_file_mode_and_size() {
        let attrs = Attributes::with_owner(&Stat::file(42), 1000, 1001);
        assert_eq!(attrs.size, 42);
        assert_eq!(attrs.mode, libc::S_IFREG as u32 | 0o777);
        assert_eq!(attrs.nlink, 1);
        assert_eq!((attrs.uid, attrs.gid), (1000, 1001));
        assert!(!attrs.is_dir());
    }

    #[test]
    fn test_directory_mode() {
        let attrs = Attributes::with_owner(&Stat::directory(), 0, 0);
        assert_eq!(attrs.mode, libc::S_IFDIR as u32 | 0o777);
        assert_eq!(attrs.file_type(), FileType::Directory);
    }

    #[test]
    fn test_from_stat_uses_process_identity() {
        let attrs = Attributes::from_stat(&Stat::file(1));
        assert_eq!(attrs.uid, nix::unistd::getuid().as_raw());
        assert_eq!(attrs.gid, nix::unistd::getgid().as_raw());
    }

    #[test]
    fn test_to_file_attr() {
        let attrs = Attributes::with_owner(&Stat::file(1025).with_mtime(at(7)), 1, 2);
        let fattr = attrs.to_file_attr(9);
        assert_eq!(fattr.ino, 9);
        assert_eq!(fattr.size, 1025);
        assert_eq!(fattr.blocks, 3);
        assert_eq!(fattr.kind, FileType::RegularFile);
        assert_eq!(fattr.perm, 0o777);
        assert_eq!(fattr.mtime, at(7));
        assert_eq!(fattr.crtime, SystemTime::UNIX_EPOCH);
    }
}
