//! Filename translation for the macOS SMB client.
//!
//! The macOS SMB client cannot send characters that are illegal in Windows
//! filenames, so it substitutes code points from the Unicode private use
//! area:
//!
//! | Character | Sent as |
//! |-----------|---------|
//! | 0x01-0x1F | U+F001-U+F01F |
//! | `"` | U+F020 |
//! | `*` | U+F021 |
//! | `/` | U+F022 |
//! | `<` | U+F023 |
//! | `>` | U+F024 |
//! | `?` | U+F025 |
//! | `\` | U+F026 |
//! | `\|` | U+F027 |
//!
//! [`PathConversionFileSystem`] undoes that substitution on every path before
//! handing it to the backing filesystem.

use std::io;
use std::sync::Arc;

use super::{Directory, File, FileSystem, FsPath, SetFileTimes, Stat, StatVfs};

/// Map one private-use code point back to the character it encodes.
pub fn decode_char(c: char) -> char {
    match c as u32 {
        cp @ 0xF001..=0xF01F => char::from_u32(cp & 0xFF).unwrap_or(c),
        0xF020 => '"',
        0xF021 => '*',
        0xF022 => '/',
        0xF023 => '<',
        0xF024 => '>',
        0xF025 => '?',
        0xF026 => '\\',
        0xF027 => '|',
        _ => c,
    }
}

/// Decode every substituted character in one path segment.
pub fn decode_segment(segment: &str) -> String {
    segment.chars().map(decode_char).collect()
}

/// Wraps a filesystem and decodes SMB-substituted characters in paths.
pub struct PathConversionFileSystem {
    inner: Arc<dyn FileSystem>,
}

impl PathConversionFileSystem {
    pub fn new(inner: Arc<dyn FileSystem>) -> Self {
        Self { inner }
    }

    fn convert(&self, path: &FsPath) -> FsPath {
        let decoded: Vec<String> = path.parts().iter().map(|p| decode_segment(p)).collect();
        let segments: Vec<&str> = decoded.iter().map(String::as_str).collect();
        self.inner.create_path(&segments)
    }
}

impl FileSystem for PathConversionFileSystem {
    fn create_path(&self, segments: &[&str]) -> FsPath {
        self.inner.create_path(segments)
    }

    fn open(&self, path: &FsPath, flags: i32) -> io::Result<Box<dyn File>> {
        self.inner.open(&self.convert(path), flags)
    }

    fn open_directory(&self, path: &FsPath) -> io::Result<Box<dyn Directory>> {
        self.inner.open_directory(&self.convert(path))
    }

    fn stat(&self, path: &FsPath) -> io::Result<Stat> {
        self.inner.stat(&self.convert(path))
    }

    fn fstat(&self, file: &dyn File) -> io::Result<Stat> {
        self.inner.fstat(file)
    }

    fn pread(&self, file: &dyn File, size: usize, offset: u64) -> io::Result<Vec<u8>> {
        self.inner.pread(file, size, offset)
    }

    fn pwrite(&self, file: &dyn File, data: &[u8], offset: u64) -> io::Result<usize> {
        self.inner.pwrite(file, data, offset)
    }

    fn ftruncate(&self, file: &dyn File, len: u64) -> io::Result<()> {
        self.inner.ftruncate(file, len)
    }

    fn fsync(&self, file: &dyn File) -> io::Result<()> {
        self.inner.fsync(file)
    }

    fn unlink(&self, path: &FsPath) -> io::Result<()> {
        self.inner.unlink(&self.convert(path))
    }

    fn mkdir(&self, path: &FsPath) -> io::Result<()> {
        self.inner.mkdir(&self.convert(path))
    }

    fn rmdir(&self, path: &FsPath) -> io::Result<()> {
        self.inner.rmdir(&self.convert(path))
    }

    fn rename_noreplace(&self, from: &FsPath, to: &FsPath) -> io::Result<()> {
        let (from, to) = (self.convert(from), self.convert(to));
        // Two encodings of one name: nothing moves.
        if from == to {
            return self.inner.stat(&from).map(|_| ());
        }
        self.inner.rename_noreplace(&from, &to)
    }

    fn statvfs(&self) -> io::Result<StatVfs> {
        self.inner.statvfs()
    }

    fn close(&self) -> io::Result<()> {
        self.inner.close()
    }

    fn file_times(&self) -> Option<&dyn SetFileTimes> {
        self.inner.file_times()
    }
}
