//! Inode numbers for virtual paths.
//!
//! The kernel speaks inodes; the engine speaks [`VirtualPath`]s. [`InodeBridge`] keeps both
//! directions in two [`scc::HashMap`]s, with mutations that touch both maps serialized by a
//! coordination lock so no reader sees half of a rename.

use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::fs::{InodeAddr, ROOT_INODE};
use crate::path::VirtualPath;

#[derive(Debug, Clone)]
struct Node {
    /// `None` once the path was unlinked or replaced while the kernel still held the inode.
    path: Option<VirtualPath>,
    nlookup: u64,
}

pub struct InodeBridge {
    by_ino: scc::HashMap<InodeAddr, Node>,
    by_path: scc::HashMap<VirtualPath, InodeAddr>,
    next: AtomicU64,
    /// Serializes mutations that touch both maps.
    mu: Mutex<()>,
}

impl InodeBridge {
    /// A bridge that knows only the root.
    #[must_use]
    pub fn new() -> Self {
        let bridge = Self {
            by_ino: scc::HashMap::new(),
            by_path: scc::HashMap::new(),
            next: AtomicU64::new(ROOT_INODE + 1),
            mu: Mutex::new(()),
        };
        let _ = bridge.by_ino.insert_sync(
            ROOT_INODE,
            Node {
                path: Some(VirtualPath::root()),
                nlookup: 1,
            },
        );
        let _ = bridge.by_path.insert_sync(VirtualPath::root(), ROOT_INODE);
        bridge
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ()> {
        self.mu.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// The path currently behind `ino`.
    #[must_use]
    pub fn path(&self, ino: InodeAddr) -> Option<VirtualPath> {
        self.by_ino.read_sync(&ino, |_, n| n.path.clone()).flatten()
    }

    /// The inode of `vp`, allocated on first use. Does not count as a kernel lookup.
    pub fn inode_of(&self, vp: &VirtualPath) -> InodeAddr {
        if let Some(ino) = self.by_path.read_sync(vp, |_, &ino| ino) {
            return ino;
        }
        let _guard = self.lock();
        match self.by_path.entry_sync(vp.clone()) {
            scc::hash_map::Entry::Occupied(occ) => *occ.get(),
            scc::hash_map::Entry::Vacant(vac) => {
                let ino = self.next.fetch_add(1, Ordering::Relaxed);
                vac.insert_entry(ino);
                let _ = self.by_ino.insert_sync(
                    ino,
                    Node {
                        path: Some(vp.clone()),
                        nlookup: 0,
                    },
                );
                ino
            }
        }
    }

    /// The inode of `vp`, counting one kernel lookup.
    pub fn lookup(&self, vp: &VirtualPath) -> InodeAddr {
        let ino = self.inode_of(vp);
        self.by_ino.update_sync(&ino, |_, n| n.nlookup += 1);
        ino
    }

    /// Drop `count` kernel references; the inode is forgotten at zero.
    pub fn forget(&self, ino: InodeAddr, count: u64) {
        if ino == ROOT_INODE {
            return;
        }
        let _guard = self.lock();
        if let scc::hash_map::Entry::Occupied(mut occ) = self.by_ino.entry_sync(ino) {
            let node = occ.get_mut();
            node.nlookup = node.nlookup.saturating_sub(count);
            if node.nlookup == 0 {
                let (_, node) = occ.remove_entry();
                if let Some(path) = node.path {
                    self.by_path.remove_sync(&path);
                }
            }
        }
    }

    /// Detach `vp` from its inode after an unlink or rmdir.
    pub fn unlink(&self, vp: &VirtualPath) {
        let _guard = self.lock();
        self.detach(vp);
    }

    fn detach(&self, vp: &VirtualPath) {
        if let Some((_, ino)) = self.by_path.remove_sync(vp) {
            self.by_ino.update_sync(&ino, |_, n| n.path = None);
        }
    }

    /// Re-point every inode under `from` to the same place under `to`.
    pub fn rename_subtree(&self, from: &VirtualPath, to: &VirtualPath) {
        let _guard = self.lock();
        let mut replaced = Vec::new();
        let mut moved = Vec::new();
        self.by_path.iter_sync(|path, &ino| {
            if path.starts_with(to) {
                replaced.push(path.clone());
            }
            if path.starts_with(from) {
                moved.push((path.clone(), ino));
            }
            true
        });
        for path in &replaced {
            self.detach(path);
        }
        for (old, ino) in moved {
            let Some(new) = old.rebase(from, to) else {
                continue;
            };
            self.by_path.remove_sync(&old);
            let _ = self.by_path.insert_sync(new.clone(), ino);
            self.by_ino.update_sync(&ino, |_, n| n.path = Some(new));
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.by_ino.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.by_ino.is_empty()
    }
}

impl Default for InodeBridge {
    fn default() -> Self {
        Self::new()
    }
}
