use std::fs::{FileTimes, Metadata};
use std::io::SeekFrom;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::SystemTime;

use tokio::io::{AsyncSeekExt as _, AsyncWriteExt as _};
use tracing::{debug, info, instrument};

use crate::entry::{DeletePhase, FileEntry, Location, LockState, RootKind, now, time_from_system};
use crate::error::{VfsError, VfsResult};
use crate::eviction::EvictionManager;
use crate::io::{copy_verified, stat};
use crate::path::VirtualPath;
use crate::sync::SyncEngine;

use super::delete::DeleteRouter;
use super::{RouterContext, copy_error};

/// What a write left behind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriteReceipt {
    /// Size of the local file after the write.
    pub size: u64,
    /// The write created the path.
    pub created: bool,
}

/// Write-back routing: every write lands in the local cache and is queued for sync.
pub struct WriteRouter {
    pub(super) ctx: Arc<RouterContext>,
    pub(super) eviction: Arc<EvictionManager>,
    pub(super) sync: Arc<SyncEngine>,
    pub(super) delete: Arc<DeleteRouter>,
}

/// The row of a path right after its local bytes changed.
fn dirty_row(
    vp: &VirtualPath,
    previous: Option<FileEntry>,
    meta: &Metadata,
    local: std::path::PathBuf,
) -> FileEntry {
    let at = now();
    let mut row = match previous {
        Some(prev) if prev.location != Location::Deleted => prev,
        Some(_) | None => FileEntry::new_file(vp.clone(), Location::LocalOnly, 0, at),
    };
    row.location = Location::LocalOnly;
    row.is_dirty = true;
    row.size = meta.len();
    row.checksum = None;
    row.is_directory = false;
    row.modified_at = meta.modified().map_or(at, time_from_system);
    row.accessed_at = at;
    row.delete_phase = DeletePhase::None;
    row.pending_external_delete = false;
    row.lock_state = LockState::Unlocked;
    row.local_path = Some(local);
    row
}

async fn apply_times(path: PathBuf, times: FileTimes) -> std::io::Result<()> {
    tokio::task::spawn_blocking(move || {
        let file = if path.is_dir() {
            std::fs::File::open(&path)?
        } else {
            std::fs::File::options().write(true).open(&path)?
        };
        file.set_times(times)
    })
    .await
    .map_err(std::io::Error::other)?
}

impl WriteRouter {
    #[must_use]
    pub fn new(
        ctx: Arc<RouterContext>,
        eviction: Arc<EvictionManager>,
        sync: Arc<SyncEngine>,
        delete: Arc<DeleteRouter>,
    ) -> Self {
        Self {
            ctx,
            eviction,
            sync,
            delete,
        }
    }

    async fn reserve(&self, needed: u64) -> VfsResult<()> {
        if needed == 0 || self.eviction.ensure_free_space(needed).await? {
            return Ok(());
        }
        Err(VfsError::InsufficientSpace {
            needed,
            available: self.eviction.free_space()?,
        })
    }

    /// The existing row if it is visible, erroring on directories.
    fn visible_file(&self, vp: &VirtualPath) -> VfsResult<(Option<FileEntry>, Option<FileEntry>)> {
        let row = self.ctx.store.get(vp)?;
        match row {
            Some(r) if r.is_visible() && r.is_directory => Err(VfsError::IsADirectory(vp.clone())),
            Some(r) if r.is_visible() => Ok((Some(r.clone()), Some(r))),
            Some(r) => Ok((None, Some(r))),
            None => Ok((None, None)),
        }
    }

    async fn commit(
        &self,
        vp: &VirtualPath,
        previous: Option<FileEntry>,
        created: bool,
    ) -> VfsResult<WriteReceipt> {
        let local = self.ctx.roots.local_path(vp);
        let meta = stat(&local)
            .await?
            .ok_or_else(|| VfsError::write_failed(vp, std::io::ErrorKind::NotFound.into()))?;
        let row = dirty_row(vp, previous, &meta, local);
        self.ctx.store.upsert(&row)?;
        if created {
            self.ctx
                .versions
                .record_upsert(RootKind::Local, vp, &meta)
                .await?;
        }
        self.sync.enqueue(vp);
        Ok(WriteReceipt {
            size: row.size,
            created,
        })
    }

    /// Replace the contents of `vp` with `data`.
    #[instrument(name = "WriteRouter::write", skip(self, data), fields(len = data.len()))]
    pub async fn write(&self, vp: &VirtualPath, data: &[u8]) -> VfsResult<WriteReceipt> {
        self.ctx.ensure_mutable(vp)?;
        let _guard = self.ctx.locks.lock_path(vp).await;
        self.ctx.locks.ensure_unlocked(vp)?;

        let (visible, previous) = self.visible_file(vp)?;
        let created = visible.is_none();
        if created {
            self.ctx.ensure_parent_dir(vp).await?;
        }
        let held = visible.as_ref().map_or(0, FileEntry::local_bytes);
        self.reserve((data.len() as u64).saturating_sub(held)).await?;

        self.ctx.materialize_parents(vp).await?;
        let local = self.ctx.roots.local_path(vp);
        tokio::fs::write(&local, data)
            .await
            .map_err(|e| VfsError::write_failed(vp, e))?;
        self.commit(vp, previous, created).await
    }

    /// Write `data` at `offset` into an existing file, copying it up first if needed.
    #[instrument(name = "WriteRouter::write_at", skip(self, data), fields(len = data.len()))]
    pub async fn write_at(
        &self,
        vp: &VirtualPath,
        offset: u64,
        data: &[u8],
    ) -> VfsResult<WriteReceipt> {
        self.ctx.ensure_mutable(vp)?;
        let _guard = self.ctx.locks.lock_path(vp).await;
        self.ctx.locks.ensure_unlocked(vp)?;

        let row = self.existing_local(vp).await?;
        let end = offset.saturating_add(data.len() as u64);
        self.reserve(end.saturating_sub(row.local_bytes())).await?;

        let local = self.ctx.roots.local_path(vp);
        let mut file = tokio::fs::OpenOptions::new()
            .write(true)
            .open(&local)
            .await
            .map_err(|e| VfsError::write_failed(vp, e))?;
        file.seek(SeekFrom::Start(offset))
            .await
            .map_err(|e| VfsError::write_failed(vp, e))?;
        file.write_all(data)
            .await
            .map_err(|e| VfsError::write_failed(vp, e))?;
        file.flush().await.map_err(|e| VfsError::write_failed(vp, e))?;
        drop(file);
        self.commit(vp, Some(row), false).await
    }

    /// Set the length of an existing file.
    #[instrument(name = "WriteRouter::truncate", skip(self))]
    pub async fn truncate(&self, vp: &VirtualPath, size: u64) -> VfsResult<WriteReceipt> {
        self.ctx.ensure_mutable(vp)?;
        let _guard = self.ctx.locks.lock_path(vp).await;
        self.ctx.locks.ensure_unlocked(vp)?;

        let row = match self.ctx.merge.entry(vp).await? {
            None => return Err(VfsError::NotFound(vp.clone())),
            Some(r) if r.is_directory => return Err(VfsError::IsADirectory(vp.clone())),
            // Emptying a cold file does not need its old bytes.
            Some(r) if size == 0 && !r.location.has_local() => {
                self.ctx.materialize_parents(vp).await?;
                tokio::fs::File::create(self.ctx.roots.local_path(vp))
                    .await
                    .map_err(|e| VfsError::write_failed(vp, e))?;
                return self.commit(vp, Some(r), false).await;
            }
            Some(r) => r,
        };
        let row = if row.location.has_local() {
            row
        } else {
            self.copy_up(row).await?
        };
        self.reserve(size.saturating_sub(row.local_bytes())).await?;

        let file = tokio::fs::OpenOptions::new()
            .write(true)
            .open(self.ctx.roots.local_path(vp))
            .await
            .map_err(|e| VfsError::write_failed(vp, e))?;
        file.set_len(size)
            .await
            .map_err(|e| VfsError::write_failed(vp, e))?;
        drop(file);
        self.commit(vp, Some(row), false).await
    }

    /// Set access and modification times. Files are copied up first and come out dirty;
    /// directories only change where they already exist.
    #[instrument(name = "WriteRouter::set_times", skip(self))]
    pub async fn set_times(
        &self,
        vp: &VirtualPath,
        accessed: Option<SystemTime>,
        modified: Option<SystemTime>,
    ) -> VfsResult<()> {
        self.ctx.ensure_mutable(vp)?;
        let _guard = self.ctx.locks.lock_path(vp).await;
        self.ctx.locks.ensure_unlocked(vp)?;

        let mut times = FileTimes::new();
        if let Some(at) = accessed {
            times = times.set_accessed(at);
        }
        if let Some(at) = modified {
            times = times.set_modified(at);
        }

        let row = match self.ctx.merge.entry(vp).await? {
            None => return Err(VfsError::NotFound(vp.clone())),
            Some(r) if r.is_directory => {
                let target = if r.location.has_local() {
                    self.ctx.roots.local_path(vp)
                } else if self.ctx.roots.is_external_online() {
                    self.ctx.roots.external_path(vp)
                } else {
                    return Err(VfsError::ExternalOffline);
                };
                apply_times(target, times)
                    .await
                    .map_err(|e| VfsError::write_failed(vp, e))?;
                let mut r = r;
                if let Some(at) = modified {
                    r.modified_at = time_from_system(at);
                }
                if let Some(at) = accessed {
                    r.accessed_at = time_from_system(at);
                }
                self.ctx.store.upsert(&r)?;
                return Ok(());
            }
            Some(r) if r.location.has_local() => r,
            Some(r) => self.copy_up(r).await?,
        };

        apply_times(self.ctx.roots.local_path(vp), times)
            .await
            .map_err(|e| VfsError::write_failed(vp, e))?;
        self.commit(vp, Some(row), false).await?;
        debug!(path = %vp, "set file times");
        Ok(())
    }

    /// Create an empty file. Fails if the path already exists.
    #[instrument(name = "WriteRouter::create", skip(self))]
    pub async fn create(&self, vp: &VirtualPath) -> VfsResult<FileEntry> {
        self.ctx.ensure_mutable(vp)?;
        let _guard = self.ctx.locks.lock_path(vp).await;
        self.ctx.locks.ensure_unlocked(vp)?;

        if self.ctx.merge.entry(vp).await?.is_some() {
            return Err(VfsError::AlreadyExists(vp.clone()));
        }
        self.ctx.ensure_parent_dir(vp).await?;
        self.ctx.materialize_parents(vp).await?;
        let previous = self.ctx.store.get(vp)?;
        tokio::fs::File::create(self.ctx.roots.local_path(vp))
            .await
            .map_err(|e| VfsError::write_failed(vp, e))?;
        self.commit(vp, previous, true).await?;
        self.ctx
            .store
            .get(vp)?
            .ok_or_else(|| VfsError::NotFound(vp.clone()))
    }

    /// Create a directory in the local cache; the sync engine creates it externally.
    #[instrument(name = "WriteRouter::mkdir", skip(self))]
    pub async fn mkdir(&self, vp: &VirtualPath) -> VfsResult<FileEntry> {
        self.ctx.ensure_mutable(vp)?;
        let _guard = self.ctx.locks.lock_path(vp).await;

        if self.ctx.merge.entry(vp).await?.is_some() {
            return Err(VfsError::AlreadyExists(vp.clone()));
        }
        self.ctx.ensure_parent_dir(vp).await?;
        self.ctx.materialize_parents(vp).await?;
        let local = self.ctx.roots.local_path(vp);
        tokio::fs::create_dir_all(&local)
            .await
            .map_err(|e| VfsError::write_failed(vp, e))?;

        let mut row = FileEntry::new_directory(vp.clone(), Location::LocalOnly, now());
        row.is_dirty = true;
        row.local_path = Some(local.clone());
        self.ctx.store.upsert(&row)?;
        if let Some(meta) = stat(&local).await? {
            self.ctx
                .versions
                .record_upsert(RootKind::Local, vp, &meta)
                .await?;
        }
        self.sync.enqueue(vp);
        debug!(path = %vp, "created directory");
        Ok(row)
    }

    /// Make sure `vp` has local bytes before it is opened for writing.
    #[instrument(name = "WriteRouter::prepare_for_write", skip(self))]
    pub async fn prepare_for_write(&self, vp: &VirtualPath) -> VfsResult<FileEntry> {
        self.ctx.ensure_mutable(vp)?;
        let _guard = self.ctx.locks.lock_path(vp).await;
        self.ctx.locks.ensure_unlocked(vp)?;
        self.existing_local(vp).await
    }

    /// The visible file row at `vp`, copied up into the cache if it only lives externally.
    async fn existing_local(&self, vp: &VirtualPath) -> VfsResult<FileEntry> {
        match self.ctx.merge.entry(vp).await? {
            None => Err(VfsError::NotFound(vp.clone())),
            Some(r) if r.is_directory => Err(VfsError::IsADirectory(vp.clone())),
            Some(r) if r.location.has_local() => Ok(r),
            Some(r) => self.copy_up(r).await,
        }
    }

    async fn copy_up(&self, mut row: FileEntry) -> VfsResult<FileEntry> {
        let vp = row.virtual_path.clone();
        if !self.ctx.roots.is_external_online() {
            return Err(VfsError::ExternalOffline);
        }
        self.reserve(row.size).await?;
        self.ctx.materialize_parents(&vp).await?;

        let local = self.ctx.roots.local_path(&vp);
        let report = copy_verified(
            &self.ctx.roots.external_path(&vp),
            &local,
            self.ctx.verify_checksums,
        )
        .await
        .map_err(|e| copy_error(&vp, e))?;

        row.location = Location::Both;
        row.is_dirty = false;
        row.size = report.size;
        row.checksum = report.checksum.or(row.checksum);
        row.local_path = Some(local.clone());
        row.accessed_at = now();
        self.ctx.store.upsert(&row)?;
        if let Some(meta) = stat(&local).await? {
            self.ctx
                .versions
                .record_upsert(RootKind::Local, &vp, &meta)
                .await?;
        }
        info!(path = %vp, size = report.size, "copied file up into the local cache");
        Ok(row)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::eviction::EvictionPolicy;
    use crate::router::test_support::context;
    use std::time::Duration;

    fn routers(
        ctx: &Arc<RouterContext>,
        quota: u64,
    ) -> (WriteRouter, Arc<SyncEngine>) {
        let eviction = Arc::new(EvictionManager::new(
            Arc::clone(ctx),
            EvictionPolicy {
                quota,
                ..EvictionPolicy::default()
            },
        ));
        let sync = Arc::new(SyncEngine::spawn(Arc::clone(ctx), Duration::from_secs(3600)));
        let delete = Arc::new(DeleteRouter::new(Arc::clone(ctx)));
        (
            WriteRouter::new(Arc::clone(ctx), eviction, Arc::clone(&sync), delete),
            sync,
        )
    }

    fn vp(s: &str) -> VirtualPath {
        VirtualPath::new(s).unwrap()
    }

    #[tokio::test]
    async fn writes_land_locally_and_dirty() {
        let (dir, ctx) = context();
        let (router, _sync) = routers(&ctx, 1 << 20);
        let receipt = router.write(&vp("report.pdf"), &[7u8; 1000]).await.unwrap();
        assert!(receipt.created);
        assert_eq!(receipt.size, 1000);

        let row = ctx.store.get(&vp("report.pdf")).unwrap().unwrap();
        assert_eq!(row.location, Location::LocalOnly);
        assert!(row.is_dirty);
        assert_eq!(std::fs::read(dir.path().join("local/report.pdf")).unwrap().len(), 1000);
        assert!(!dir.path().join("external/report.pdf").exists());
    }

    #[tokio::test]
    async fn writes_fail_while_a_copy_holds_the_path() {
        let (_dir, ctx) = context();
        let (router, _sync) = routers(&ctx, 1 << 20);
        router.write(&vp("a"), b"1").await.unwrap();
        let _held = ctx.locks.try_sync_lock(&vp("a")).unwrap().unwrap();
        assert!(matches!(
            router.write(&vp("a"), b"2").await,
            Err(VfsError::FileBusy(_))
        ));
    }

    #[tokio::test]
    async fn writes_beyond_the_quota_fail_without_evictable_files() {
        let (_dir, ctx) = context();
        let (router, _sync) = routers(&ctx, 10);
        router.write(&vp("a"), &[0u8; 8]).await.unwrap();
        assert!(matches!(
            router.write(&vp("b"), &[0u8; 8]).await,
            Err(VfsError::InsufficientSpace { needed: 8, available: 2 })
        ));
        // Shrinking an existing file needs no room.
        router.write(&vp("a"), &[0u8; 4]).await.unwrap();
    }

    #[tokio::test]
    async fn offset_writes_copy_up_external_files() {
        let (dir, ctx) = context();
        std::fs::write(dir.path().join("external/notes.txt"), b"hello world").unwrap();
        let (router, _sync) = routers(&ctx, 1 << 20);

        router.write_at(&vp("notes.txt"), 6, b"WORLD").await.unwrap();
        assert_eq!(
            std::fs::read(dir.path().join("local/notes.txt")).unwrap(),
            b"hello WORLD"
        );
        assert_eq!(
            std::fs::read(dir.path().join("external/notes.txt")).unwrap(),
            b"hello world"
        );
        let row = ctx.store.get(&vp("notes.txt")).unwrap().unwrap();
        assert_eq!(row.location, Location::LocalOnly);
        assert!(row.is_dirty);
        assert!(row.synced_external_mtime.is_some());
    }

    #[tokio::test]
    async fn mkdir_then_create_inside() {
        let (dir, ctx) = context();
        let (router, _sync) = routers(&ctx, 1 << 20);
        router.mkdir(&vp("docs")).await.unwrap();
        router.create(&vp("docs/a.txt")).await.unwrap();
        assert!(dir.path().join("local/docs/a.txt").is_file());
        assert!(matches!(
            router.create(&vp("docs/a.txt")).await,
            Err(VfsError::AlreadyExists(_))
        ));
        assert!(matches!(
            router.create(&vp("missing/a.txt")).await,
            Err(VfsError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn external_parents_are_materialized_locally() {
        let (dir, ctx) = context();
        std::fs::create_dir_all(dir.path().join("external/photos/2024")).unwrap();
        let (router, _sync) = routers(&ctx, 1 << 20);
        router
            .write(&vp("photos/2024/new.jpg"), b"jpg")
            .await
            .unwrap();
        assert!(dir.path().join("local/photos/2024/new.jpg").is_file());
        let parent = ctx.store.get(&vp("photos/2024")).unwrap().unwrap();
        assert_eq!(parent.location, Location::Both);
    }

    #[tokio::test]
    async fn read_only_pairs_reject_writes() {
        let (_dir, ctx) = context();
        let ctx = Arc::new(RouterContext {
            store: Arc::clone(&ctx.store),
            roots: Arc::clone(&ctx.roots),
            locks: ctx.locks.clone(),
            versions: Arc::clone(&ctx.versions),
            merge: Arc::clone(&ctx.merge),
            read_only: true,
            verify_checksums: true,
        });
        let (router, _sync) = routers(&ctx, 1 << 20);
        assert!(matches!(
            router.write(&vp("a"), b"x").await,
            Err(VfsError::ReadOnly)
        ));
    }

    #[tokio::test]
    async fn writes_evict_clean_files_to_make_room() {
        let (dir, ctx) = context();
        std::fs::write(dir.path().join("local/keep"), b"0123456789").unwrap();
        std::fs::write(dir.path().join("external/keep"), b"0123456789").unwrap();
        let mut row = FileEntry::new_file(vp("keep"), Location::Both, 10, now());
        row.local_path = Some(dir.path().join("local/keep"));
        ctx.store.upsert(&row).unwrap();
        let (router, _sync) = routers(&ctx, 20);

        router.write(&vp("big"), &[1u8; 15]).await.unwrap();
        assert_eq!(
            ctx.store.get(&vp("keep")).unwrap().unwrap().location,
            Location::ExternalOnly
        );
        assert!(!dir.path().join("local/keep").exists());
        assert_eq!(std::fs::read(dir.path().join("external/keep")).unwrap(), b"0123456789");
        assert_eq!(std::fs::read(dir.path().join("local/big")).unwrap().len(), 15);
    }

    #[tokio::test]
    async fn set_times_marks_the_file_dirty() {
        let (dir, ctx) = context();
        let (router, _sync) = routers(&ctx, 1 << 20);
        router.write(&vp("t"), b"x").await.unwrap();
        let stamp = SystemTime::UNIX_EPOCH + Duration::from_secs(1_000_000);

        router.set_times(&vp("t"), None, Some(stamp)).await.unwrap();
        let on_disk = std::fs::metadata(dir.path().join("local/t")).unwrap();
        assert_eq!(on_disk.modified().unwrap(), stamp);
        let row = ctx.store.get(&vp("t")).unwrap().unwrap();
        assert_eq!(row.modified_at, time_from_system(stamp));
        assert!(row.is_dirty);
    }

    #[tokio::test]
    async fn set_times_copies_up_external_files() {
        let (dir, ctx) = context();
        std::fs::write(dir.path().join("external/cold.txt"), b"far").unwrap();
        let (router, _sync) = routers(&ctx, 1 << 20);
        let stamp = SystemTime::UNIX_EPOCH + Duration::from_secs(2_000_000);

        router
            .set_times(&vp("cold.txt"), Some(stamp), Some(stamp))
            .await
            .unwrap();
        assert_eq!(std::fs::read(dir.path().join("local/cold.txt")).unwrap(), b"far");
        let row = ctx.store.get(&vp("cold.txt")).unwrap().unwrap();
        assert_eq!(row.location, Location::LocalOnly);
        assert!(row.is_dirty);
        assert_eq!(row.modified_at, time_from_system(stamp));
    }
}
