//! Inode management for the kernel transport.
//!
//! The kernel addresses files by inode number while the adapter works with
//! transport paths (`/dir/name`). [`InodeTable`] hands out stable inode
//! numbers per path and keeps the mapping in step with renames and removals.

use std::collections::{BTreeMap, HashMap};
use std::ops::Bound;

use parking_lot::RwLock;
use tracing::trace;

/// Inode number of the mount root.
pub const ROOT_INODE: u64 = 1;

/// Inode reported for directory entries the kernel has not looked up.
pub const UNKNOWN_INODE: u64 = 0xffff_ffff;

#[derive(Debug)]
struct Node {
    path: String,
    /// Lookups the kernel holds on this inode.
    nlookup: u64,
}

#[derive(Debug)]
struct Inner {
    by_ino: HashMap<u64, Node>,
    by_path: BTreeMap<String, u64>,
    next: u64,
}

impl Inner {
    /// Every known path equal to `path` or below it.
    fn subtree(&self, path: &str) -> Vec<(String, u64)> {
        let prefix = if path == "/" {
            "/".to_string()
        } else {
            format!("{}/", path)
        };
        let mut found: Vec<(String, u64)> = self
            .by_path
            .range::<str, _>((Bound::Included(prefix.as_str()), Bound::Unbounded))
            .take_while(|(p, _)| p.starts_with(&prefix))
            .map(|(p, &ino)| (p.clone(), ino))
            .collect();
        if path != "/" {
            if let Some(&ino) = self.by_path.get(path) {
                found.push((path.to_string(), ino));
            }
        }
        found
    }

    fn evict(&mut self, ino: u64) {
        if let Some(node) = self.by_ino.remove(&ino) {
            self.by_path.remove(&node.path);
        }
    }
}

/// Thread-safe bidirectional inode ↔ path map.
///
/// An inode lives while the kernel holds lookups on it: [`InodeTable::lookup`]
/// takes one for every entry reply and [`InodeTable::forget`] drops them. The
/// root is never evicted.
#[derive(Debug)]
pub struct InodeTable {
    inner: RwLock<Inner>,
}

impl Default for InodeTable {
    fn default() -> Self {
        Self::new()
    }
}

impl InodeTable {
    /// Create a table containing only the root.
    pub fn new() -> Self {
        let mut by_ino = HashMap::new();
        let mut by_path = BTreeMap::new();
        by_ino.insert(
            ROOT_INODE,
            Node {
                path: "/".to_string(),
                nlookup: 0,
            },
        );
        by_path.insert("/".to_string(), ROOT_INODE);
        Self {
            inner: RwLock::new(Inner {
                by_ino,
                by_path,
                next: ROOT_INODE + 1,
            }),
        }
    }

    /// Transport path for an inode.
    pub fn path(&self, ino: u64) -> Option<String> {
        self.inner.read().by_ino.get(&ino).map(|n| n.path.clone())
    }

    /// Inode already assigned to a path, without taking a lookup.
    pub fn ino(&self, path: &str) -> Option<u64> {
        self.inner.read().by_path.get(path).copied()
    }

    /// Inode for a path the kernel is being handed, assigning a number on
    /// first sight. Takes one lookup.
    pub fn lookup(&self, path: &str) -> u64 {
        let mut inner = self.inner.write();
        let ino = match inner.by_path.get(path).copied() {
            Some(ino) => ino,
            None => {
                let ino = inner.next;
                inner.next += 1;
                inner.by_path.insert(path.to_string(), ino);
                inner.by_ino.insert(
                    ino,
                    Node {
                        path: path.to_string(),
                        nlookup: 0,
                    },
                );
                ino
            }
        };
        if let Some(node) = inner.by_ino.get_mut(&ino) {
            node.nlookup += 1;
        }
        ino
    }

    /// Drop `nlookup` kernel lookups, evicting the inode at zero.
    pub fn forget(&self, ino: u64, nlookup: u64) {
        if ino == ROOT_INODE {
            return;
        }
        let mut inner = self.inner.write();
        let Some(node) = inner.by_ino.get_mut(&ino) else {
            return;
        };
        node.nlookup = node.nlookup.saturating_sub(nlookup);
        if node.nlookup == 0 {
            trace!(ino, path = %node.path, "Evicting inode");
            inner.evict(ino);
        }
    }

    /// Lookups the kernel holds on an inode.
    pub fn lookup_count(&self, ino: u64) -> Option<u64> {
        self.inner.read().by_ino.get(&ino).map(|n| n.nlookup)
    }

    /// Forget a path and everything below it.
    pub fn remove(&self, path: &str) {
        let mut inner = self.inner.write();
        for (_, ino) in inner.subtree(path) {
            if ino != ROOT_INODE {
                inner.evict(ino);
            }
        }
    }

    /// Move a path and its descendants, keeping their inode numbers.
    pub fn rename(&self, from: &str, to: &str) {
        if from == to {
            return;
        }
        self.remove(to);
        let mut inner = self.inner.write();
        for (old, ino) in inner.subtree(from) {
            let new = format!("{}{}", to, &old[from.len()..]);
            inner.by_path.remove(&old);
            inner.by_path.insert(new.clone(), ino);
            if let Some(node) = inner.by_ino.get_mut(&ino) {
                node.path = new;
            }
        }
    }

    /// Number of known inodes, including the root.
    pub fn len(&self) -> usize {
        self.inner.read().by_ino.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Join a directory path and a child name into a transport path.
pub fn child_path(parent: &str, name: &str) -> String {
    if parent == "/" {
        format!("/{}", name)
    } else {
        format!("{}/{}", parent, name)
    }
}

/// Containing directory of a transport path.
pub fn parent_path(path: &str) -> &str {
    match path.rfind('/') {
        Some(0) | None => "/",
        Some(idx) => &path[..idx],
    }
}
