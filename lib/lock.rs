//! Per-path locks.
//!
//! Two kinds of lock exist per path:
//!
//! - the mutation lock, held briefly by anything that changes a [`FileEntry`] row and its bytes
//!   together, so concurrent callbacks on one path serialize;
//! - the sync lock, held for the whole duration of a copy by the sync engine or by eviction.
//!   While it is held, writes, renames, and deletes of the path fail with
//!   [`VfsError::FileBusy`]. Reads never look at it.
//!
//! The sync lock is mirrored into the metadata store as [`LockState::SyncLocked`] so that
//! eviction candidate queries skip locked rows.
//!
//! [`FileEntry`]: crate::entry::FileEntry

use std::sync::Arc;

use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::warn;

use crate::entry::LockState;
use crate::error::{VfsError, VfsResult};
use crate::path::VirtualPath;
use crate::store::MetadataStore;

struct LockTable {
    mutation: scc::HashMap<VirtualPath, Arc<Mutex<()>>>,
    synced: scc::HashMap<VirtualPath, ()>,
    store: Arc<MetadataStore>,
}

/// Shared handle to the lock table of one sync pair.
#[derive(Clone)]
pub struct LockManager {
    table: Arc<LockTable>,
}

impl LockManager {
    #[must_use]
    pub fn new(store: Arc<MetadataStore>) -> Self {
        Self {
            table: Arc::new(LockTable {
                mutation: scc::HashMap::new(),
                synced: scc::HashMap::new(),
                store,
            }),
        }
    }

    fn mutex_for(&self, vp: &VirtualPath) -> Arc<Mutex<()>> {
        match self.table.mutation.entry_sync(vp.clone()) {
            scc::hash_map::Entry::Occupied(occ) => Arc::clone(occ.get()),
            scc::hash_map::Entry::Vacant(vac) => {
                let m = Arc::new(Mutex::new(()));
                vac.insert_entry(Arc::clone(&m));
                m
            }
        }
    }

    /// Wait for the mutation lock of `vp`.
    pub async fn lock_path(&self, vp: &VirtualPath) -> PathGuard {
        let guard = self.mutex_for(vp).lock_owned().await;
        PathGuard {
            guard: Some(guard),
            path: vp.clone(),
            table: Arc::clone(&self.table),
        }
    }

    /// Take the mutation locks of two paths without deadlocking against a reversed pair.
    pub async fn lock_pair(&self, a: &VirtualPath, b: &VirtualPath) -> (PathGuard, Option<PathGuard>) {
        if a == b {
            return (self.lock_path(a).await, None);
        }
        if a < b {
            let ga = self.lock_path(a).await;
            let gb = self.lock_path(b).await;
            (ga, Some(gb))
        } else {
            let gb = self.lock_path(b).await;
            let ga = self.lock_path(a).await;
            (ga, Some(gb))
        }
    }

    /// Take the mutation lock of `vp` only if nobody holds it.
    #[must_use]
    pub fn try_lock_path(&self, vp: &VirtualPath) -> Option<PathGuard> {
        let guard = self.mutex_for(vp).try_lock_owned().ok()?;
        Some(PathGuard {
            guard: Some(guard),
            path: vp.clone(),
            table: Arc::clone(&self.table),
        })
    }

    /// Take the sync lock of `vp`. Returns `Ok(None)` if a sync or an eviction already holds it.
    pub fn try_sync_lock(&self, vp: &VirtualPath) -> VfsResult<Option<SyncGuard>> {
        match self.table.synced.entry_sync(vp.clone()) {
            scc::hash_map::Entry::Occupied(_) => return Ok(None),
            scc::hash_map::Entry::Vacant(vac) => {
                vac.insert_entry(());
            }
        }
        if let Err(e) = self.table.store.set_lock_state(vp, LockState::SyncLocked) {
            self.table.synced.remove_sync(vp);
            return Err(e);
        }
        Ok(Some(SyncGuard {
            path: vp.clone(),
            table: Arc::clone(&self.table),
        }))
    }

    #[must_use]
    pub fn is_sync_locked(&self, vp: &VirtualPath) -> bool {
        self.table.synced.read_sync(vp, |_, _| ()).is_some()
    }

    /// Fail with [`VfsError::FileBusy`] while a copy of `vp` is in progress.
    pub fn ensure_unlocked(&self, vp: &VirtualPath) -> VfsResult<()> {
        if self.is_sync_locked(vp) {
            Err(VfsError::FileBusy(vp.clone()))
        } else {
            Ok(())
        }
    }
}

/// Holds the mutation lock of one path.
pub struct PathGuard {
    guard: Option<OwnedMutexGuard<()>>,
    path: VirtualPath,
    table: Arc<LockTable>,
}

impl Drop for PathGuard {
    fn drop(&mut self) {
        drop(self.guard.take());
        // Forget the mutex once nobody else is waiting on it.
        if let scc::hash_map::Entry::Occupied(occ) = self.table.mutation.entry_sync(self.path.clone())
            && Arc::strong_count(occ.get()) == 1
        {
            let _ = occ.remove();
        }
    }
}

/// Holds the sync lock of one path. Dropping it unlocks the path in memory and in the store.
pub struct SyncGuard {
    path: VirtualPath,
    table: Arc<LockTable>,
}

impl SyncGuard {
    #[must_use]
    pub fn path(&self) -> &VirtualPath {
        &self.path
    }
}

impl Drop for SyncGuard {
    fn drop(&mut self) {
        if let Err(e) = self.table.store.set_lock_state(&self.path, LockState::Unlocked) {
            warn!(path = %self.path, error = %e, "failed to clear sync lock marker");
        }
        self.table.synced.remove_sync(&self.path);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entry::{FileEntry, Location, now};

    fn vp(s: &str) -> VirtualPath {
        VirtualPath::new(s).unwrap()
    }

    fn manager_with(path: &str) -> (LockManager, Arc<MetadataStore>) {
        let store = Arc::new(MetadataStore::in_memory().unwrap());
        store
            .upsert(&FileEntry::new_file(vp(path), Location::Both, 1, now()))
            .unwrap();
        (LockManager::new(Arc::clone(&store)), store)
    }

    #[test]
    fn sync_lock_is_exclusive_and_mirrored() {
        let (locks, store) = manager_with("a");
        let guard = locks.try_sync_lock(&vp("a")).unwrap();
        assert!(guard.is_some());
        assert!(locks.try_sync_lock(&vp("a")).unwrap().is_none());
        assert!(matches!(
            locks.ensure_unlocked(&vp("a")),
            Err(VfsError::FileBusy(_))
        ));
        assert_eq!(
            store.get(&vp("a")).unwrap().map(|e| e.lock_state),
            Some(LockState::SyncLocked)
        );

        drop(guard);
        assert!(locks.ensure_unlocked(&vp("a")).is_ok());
        assert_eq!(
            store.get(&vp("a")).unwrap().map(|e| e.lock_state),
            Some(LockState::Unlocked)
        );
    }

    #[tokio::test]
    async fn try_lock_fails_while_held() {
        let (locks, _store) = manager_with("a");
        let held = locks.lock_path(&vp("a")).await;
        assert!(locks.try_lock_path(&vp("a")).is_none());
        drop(held);
        assert!(locks.try_lock_path(&vp("a")).is_some());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn reversed_pairs_do_not_deadlock() {
        let (locks, _store) = manager_with("a");
        let l2 = locks.clone();
        let t1 = tokio::spawn(async move {
            for _ in 0..100 {
                let _g = l2.lock_pair(&vp("x"), &vp("y")).await;
            }
        });
        for _ in 0..100 {
            let _g = locks.lock_pair(&vp("y"), &vp("x")).await;
        }
        t1.await.unwrap();
    }

    #[test]
    fn released_mutexes_are_forgotten() {
        let (locks, _store) = manager_with("a");
        let g = locks.try_lock_path(&vp("a"));
        drop(g);
        assert_eq!(locks.table.mutation.len(), 0);
    }
}
