//! Handle table mapping transport-visible handle numbers to open resources.
//!
//! The kernel only ever sees a 32-bit number; the table owns the resource
//! behind it until `release`. Ids are drawn at random so a stale id from a
//! buggy caller is unlikely to hit a live resource.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use rand::Rng;
use thiserror::Error;

use crate::fs::{Directory, File};

/// Errors from handle table operations.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum HandleError {
    /// The transport presented an id it was never given, or one already
    /// released. This is a contract violation by the caller.
    #[error("Unknown handle: {0}")]
    Unknown(u64),
}

/// Registry of live handles.
///
/// All operations take a single mutex; resources are handed out as `Arc`
/// so callers can close them after the lock is dropped.
pub struct HandleTable<T> {
    entries: Mutex<HashMap<u32, Arc<T>>>,
}

impl<T> Default for HandleTable<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> HandleTable<T> {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Register a resource and return its id.
    pub fn allocate(&self, resource: T) -> u32 {
        let mut entries = self.entries.lock();
        let mut rng = rand::rng();
        let mut id: u32 = rng.random();
        while entries.contains_key(&id) {
            id = rng.random();
        }
        entries.insert(id, Arc::new(resource));
        id
    }

    /// Remove a resource from the table and return it.
    pub fn release(&self, id: u64) -> Result<Arc<T>, HandleError> {
        let key = u32::try_from(id).map_err(|_| HandleError::Unknown(id))?;
        self.entries
            .lock()
            .remove(&key)
            .ok_or(HandleError::Unknown(id))
    }

    /// Fetch a resource without removing it.
    pub fn lookup(&self, id: u64) -> Result<Arc<T>, HandleError> {
        let key = u32::try_from(id).map_err(|_| HandleError::Unknown(id))?;
        self.entries
            .lock()
            .get(&key)
            .cloned()
            .ok_or(HandleError::Unknown(id))
    }

    /// Number of live handles.
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// What a handle refers to.
pub enum Resource {
    File(Box<dyn File>),
    Directory(OpenDirectory),
}

/// An open directory plus the listing served to `readdir`.
///
/// The kernel pages through a listing with offsets, so the first `readdir`
/// snapshots the entries and later calls read from the snapshot.
pub struct OpenDirectory {
    pub(crate) dir: Box<dyn Directory>,
    pub(crate) listing: Mutex<Option<Arc<Vec<super::adapter::Listing>>>>,
}

impl OpenDirectory {
    pub fn new(dir: Box<dyn Directory>) -> Self {
        Self {
            dir,
            listing: Mutex::new(None),
        }
    }
}

impl Resource {
    pub fn as_file(&self) -> Option<&dyn File> {
        match self {
            Resource::File(f) => Some(f.as_ref()),
            Resource::Directory(_) => None,
        }
    }

    pub fn as_directory(&self) -> Option<&OpenDirectory> {
        match self {
            Resource::Directory(d) => Some(d),
            Resource::File(_) => None,
        }
    }

    /// Close the underlying resource.
    pub fn close(&self) -> std::io::Result<()> {
        match self {
            Resource::File(f) => f.close(),
            Resource::Directory(d) => d.dir.close(),
        }
    }
}
