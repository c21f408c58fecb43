//! One sync pair: every component wired together behind path-based filesystem operations.
//!
//! The FUSE adapter and the control surface both talk to a [`TierFs`]. It owns the open file
//! handles and gates everything but the root until the startup scan has finished.

use std::collections::BTreeMap;
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, SystemTime};

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncReadExt as _, AsyncSeekExt as _};
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};

use crate::entry::{ConflictRecord, FileEntry, RootKind, TreeEntry, now};
use crate::error::{VfsError, VfsResult};
use crate::eviction::{EvictionManager, EvictionPolicy, EvictionReport};
use crate::fs::{FileHandle, FsStats, OpenFlags};
use crate::lock::LockManager;
use crate::merge::{EntryAttributes, MergeView, MergedEntry};
use crate::path::VirtualPath;
use crate::roots::{BackingRoots, is_excluded};
use crate::router::{
    DeleteOutcome, DeleteRouter, ReadResolution, ReadRouter, RouterContext, WriteRouter,
};
use crate::store::MetadataStore;
use crate::sync::{SyncEngine, SyncOutcome};
use crate::version::reconcile::{ReconcileReport, reconcile};
use crate::version::{RootCheck, TreeVersionManager};

/// Block size reported to the kernel.
pub const BLOCK_SIZE: u32 = 4096;

/// Everything the library needs to run one sync pair.
#[derive(Debug, Clone)]
pub struct PairConfig {
    pub name: String,
    pub local_root: PathBuf,
    pub external_root: PathBuf,
    /// The SQLite metadata database.
    pub database: PathBuf,
    pub sync_debounce: Duration,
    pub eviction: EvictionPolicy,
    pub eviction_interval: Duration,
    pub verify_checksums: bool,
    pub read_only: bool,
    /// Persist tree version descriptors so unchanged roots are not rescanned.
    pub tree_versions: bool,
}

impl PairConfig {
    /// A pair with default tuning over the given roots.
    #[must_use]
    pub fn new(name: impl Into<String>, local_root: PathBuf, external_root: PathBuf, database: PathBuf) -> Self {
        Self {
            name: name.into(),
            local_root,
            external_root,
            database,
            sync_debounce: Duration::from_secs(5),
            eviction: EvictionPolicy::default(),
            eviction_interval: Duration::from_secs(60),
            verify_checksums: true,
            read_only: false,
            tree_versions: true,
        }
    }
}

/// What [`TierFs::initialize`] found and repaired.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InitReport {
    pub cleared_locks: usize,
    pub rescanned_local: bool,
    pub rescanned_external: bool,
    pub reconciled_upserts: usize,
    pub reconciled_removals: usize,
    pub recovered_deletes: usize,
    pub applied_pending_deletes: usize,
    pub requeued: usize,
}

/// A snapshot answering the `Status` control request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PairStatus {
    pub name: String,
    pub external_online: bool,
    pub index_ready: bool,
    pub read_only: bool,
    pub local_usage: u64,
    pub local_quota: u64,
    pub dirty: usize,
    pub pending_conflicts: usize,
}

#[derive(Debug, Clone)]
struct OpenHandle {
    path: VirtualPath,
    writable: bool,
    /// Physical file the last read came from.
    source: Option<PathBuf>,
}

fn bad_handle() -> VfsError {
    VfsError::Io(std::io::Error::from_raw_os_error(libc::EBADF))
}

/// Read up to `size` bytes at `offset`.
async fn read_range(path: &Path, offset: u64, size: u32) -> std::io::Result<Bytes> {
    let mut file = tokio::fs::File::open(path).await?;
    file.seek(SeekFrom::Start(offset)).await?;
    let mut buf = Vec::with_capacity(size.min(1 << 20) as usize);
    file.take(u64::from(size)).read_to_end(&mut buf).await?;
    Ok(Bytes::from(buf))
}

/// Open the store, moving an unreadable database aside and starting over.
fn open_store(path: &Path) -> VfsResult<MetadataStore> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    match MetadataStore::open(path) {
        Err(VfsError::MetadataCorrupted(reason)) => {
            let aside = path.with_extension(format!("corrupt-{}", now().format("%Y%m%dT%H%M%S")));
            warn!(
                path = %path.display(),
                aside = %aside.display(),
                %reason,
                "metadata store unusable, rebuilding from a full rescan"
            );
            std::fs::rename(path, &aside)?;
            for suffix in ["-wal", "-shm"] {
                let mut sidecar = path.as_os_str().to_os_string();
                sidecar.push(suffix);
                let _ = std::fs::remove_file(PathBuf::from(sidecar));
            }
            MetadataStore::open(path)
        }
        other => other,
    }
}

fn scanned(check: &RootCheck) -> Option<&BTreeMap<String, TreeEntry>> {
    match check {
        RootCheck::Rescanned(entries) => Some(entries),
        RootCheck::Trusted | RootCheck::Unavailable => None,
    }
}

/// A mounted (or mountable) sync pair.
pub struct TierFs {
    name: String,
    ctx: Arc<RouterContext>,
    reader: ReadRouter,
    writer: WriteRouter,
    deleter: Arc<DeleteRouter>,
    eviction: Arc<EvictionManager>,
    sync: Arc<SyncEngine>,
    handles: scc::HashMap<FileHandle, OpenHandle>,
    next_fh: AtomicU64,
    index_ready: AtomicBool,
    eviction_interval: Duration,
    background: Mutex<Vec<JoinHandle<()>>>,
}

impl TierFs {
    /// Open the pair's store and start its sync worker. Call [`Self::initialize`] before serving.
    #[instrument(name = "TierFs::open", skip(config), fields(pair = %config.name))]
    pub async fn open(config: PairConfig) -> VfsResult<Arc<Self>> {
        tokio::fs::create_dir_all(&config.local_root).await?;
        let store = Arc::new(open_store(&config.database)?);
        let roots = Arc::new(BackingRoots::new(
            config.local_root.clone(),
            config.external_root.clone(),
        ));
        let ctx = Arc::new(RouterContext {
            locks: LockManager::new(Arc::clone(&store)),
            versions: Arc::new(TreeVersionManager::new(
                config.tree_versions,
                Arc::clone(&roots),
                Arc::clone(&store),
            )),
            merge: Arc::new(MergeView::new(Arc::clone(&store), Arc::clone(&roots))),
            store,
            roots,
            read_only: config.read_only,
            verify_checksums: config.verify_checksums,
        });
        let eviction = Arc::new(EvictionManager::new(Arc::clone(&ctx), config.eviction));
        let sync = Arc::new(SyncEngine::spawn(Arc::clone(&ctx), config.sync_debounce));
        let deleter = Arc::new(DeleteRouter::new(Arc::clone(&ctx)));
        let writer = WriteRouter::new(
            Arc::clone(&ctx),
            Arc::clone(&eviction),
            Arc::clone(&sync),
            Arc::clone(&deleter),
        );
        debug!(
            local = %config.local_root.display(),
            external = %config.external_root.display(),
            "opened sync pair"
        );
        Ok(Arc::new(Self {
            name: config.name,
            reader: ReadRouter::new(Arc::clone(&ctx)),
            writer,
            deleter,
            eviction,
            sync,
            ctx,
            handles: scc::HashMap::new(),
            next_fh: AtomicU64::new(1),
            index_ready: AtomicBool::new(false),
            eviction_interval: config.eviction_interval,
            background: Mutex::new(Vec::new()),
        }))
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Bring the index in line with both roots, finish interrupted work, and open the gate.
    #[instrument(name = "TierFs::initialize", skip(self), fields(pair = %self.name))]
    pub async fn initialize(&self) -> VfsResult<InitReport> {
        let cleared_locks = self.ctx.store.reset_sync_locks()?;
        let local = self.ctx.versions.check_root(RootKind::Local).await?;
        let external = self.ctx.versions.check_root(RootKind::External).await?;
        let ReconcileReport { upserted, removed } = reconcile(
            &self.ctx.store,
            &self.ctx.roots,
            scanned(&local),
            scanned(&external),
        )?;
        let recovered_deletes = self.deleter.recover().await?;
        let applied_pending_deletes = self.deleter.process_pending().await?;
        let dirty = self.ctx.store.dirty_paths()?;
        for vp in &dirty {
            self.sync.enqueue(vp);
        }
        self.index_ready.store(true, Ordering::Release);

        let report = InitReport {
            cleared_locks,
            rescanned_local: matches!(local, RootCheck::Rescanned(_)),
            rescanned_external: matches!(external, RootCheck::Rescanned(_)),
            reconciled_upserts: upserted,
            reconciled_removals: removed,
            recovered_deletes,
            applied_pending_deletes,
            requeued: dirty.len(),
        };
        info!(?report, "index ready");
        Ok(report)
    }

    /// Start periodic eviction. Stopped by [`Self::shutdown`].
    pub fn start_background(self: &Arc<Self>) {
        let task = tokio::spawn(Arc::clone(&self.eviction).run_periodic(self.eviction_interval));
        self.background
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(task);
    }

    #[must_use]
    pub fn is_index_ready(&self) -> bool {
        self.index_ready.load(Ordering::Acquire)
    }

    fn gate(&self, vp: &VirtualPath) -> VfsResult<()> {
        if vp.is_root() || self.is_index_ready() {
            Ok(())
        } else {
            Err(VfsError::IndexNotReady)
        }
    }

    pub async fn getattr(&self, vp: &VirtualPath) -> VfsResult<EntryAttributes> {
        self.gate(vp)?;
        self.ctx.merge.get_attributes(vp).await
    }

    /// Resolve `name` inside `parent`.
    pub async fn lookup(
        &self,
        parent: &VirtualPath,
        name: &str,
    ) -> VfsResult<(VirtualPath, EntryAttributes)> {
        let vp = parent.join(name)?;
        if is_excluded(name) {
            return Err(VfsError::NotFound(vp));
        }
        let attrs = self.getattr(&vp).await?;
        Ok((vp, attrs))
    }

    /// The merged listing. Before the index is ready the root lists as empty.
    pub async fn readdir(&self, dir: &VirtualPath) -> VfsResult<Vec<MergedEntry>> {
        if !self.is_index_ready() {
            return if dir.is_root() {
                Ok(Vec::new())
            } else {
                Err(VfsError::IndexNotReady)
            };
        }
        self.ctx.merge.list_directory(dir).await
    }

    async fn resolve(&self, vp: &VirtualPath) -> VfsResult<PathBuf> {
        match self.reader.resolve_read(vp).await? {
            ReadResolution::Local(p) | ReadResolution::External(p) => Ok(p),
            ReadResolution::NotFound => Err(VfsError::NotFound(vp.clone())),
            ReadResolution::ExternalOffline => Err(VfsError::ExternalOffline),
        }
    }

    fn insert_handle(&self, handle: OpenHandle) -> FileHandle {
        let fh = self.next_fh.fetch_add(1, Ordering::Relaxed);
        let _ = self.handles.insert_sync(fh, handle);
        fh
    }

    fn handle(&self, fh: FileHandle) -> VfsResult<OpenHandle> {
        self.handles.read_sync(&fh, |_, h| h.clone()).ok_or_else(bad_handle)
    }

    /// Open a file. Write access copies an external-only file into the cache first.
    #[instrument(name = "TierFs::open_file", skip(self))]
    pub async fn open_file(&self, vp: &VirtualPath, flags: OpenFlags) -> VfsResult<FileHandle> {
        self.gate(vp)?;
        let writable = flags.is_writable();
        let source = if writable {
            if flags.contains(OpenFlags::TRUNC) {
                self.writer.truncate(vp, 0).await?;
            } else {
                self.writer.prepare_for_write(vp).await?;
            }
            Some(self.ctx.roots.local_path(vp))
        } else {
            if self.ctx.merge.get_attributes(vp).await?.is_directory {
                return Err(VfsError::IsADirectory(vp.clone()));
            }
            Some(self.resolve(vp).await?)
        };
        Ok(self.insert_handle(OpenHandle {
            path: vp.clone(),
            writable,
            source,
        }))
    }

    /// Create an empty file and open it for writing.
    pub async fn create(&self, vp: &VirtualPath) -> VfsResult<(EntryAttributes, FileHandle)> {
        self.gate(vp)?;
        let row = self.writer.create(vp).await?;
        let attrs = self.ctx.merge.attributes_of(&row).await?;
        let fh = self.insert_handle(OpenHandle {
            path: vp.clone(),
            writable: true,
            source: Some(self.ctx.roots.local_path(vp)),
        });
        Ok((attrs, fh))
    }

    /// Read through an open handle.
    ///
    /// If the file the handle pointed at has gone (an eviction, or a copy-up by another writer)
    /// the path is resolved again once.
    pub async fn read(&self, fh: FileHandle, offset: u64, size: u32) -> VfsResult<Bytes> {
        let handle = self.handle(fh)?;
        let source = match handle.source {
            Some(p) => p,
            None => self.resolve(&handle.path).await?,
        };
        match read_range(&source, offset, size).await {
            Ok(data) => Ok(data),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %handle.path, "backing file moved, resolving again");
                let fresh = self.resolve(&handle.path).await?;
                let remembered = fresh.clone();
                self.handles.update_sync(&fh, |_, h| h.source = Some(remembered));
                Ok(read_range(&fresh, offset, size).await?)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Write through an open handle. Returns the bytes written.
    pub async fn write(&self, fh: FileHandle, offset: u64, data: &[u8]) -> VfsResult<u32> {
        let handle = self.handle(fh)?;
        if !handle.writable {
            return Err(bad_handle());
        }
        self.writer.write_at(&handle.path, offset, data).await?;
        let local = self.ctx.roots.local_path(&handle.path);
        self.handles.update_sync(&fh, |_, h| h.source = Some(local));
        u32::try_from(data.len())
            .map_err(|_| VfsError::Io(std::io::Error::from_raw_os_error(libc::EFBIG)))
    }

    /// Flush a handle's bytes to stable storage.
    pub async fn fsync(&self, fh: FileHandle) -> VfsResult<()> {
        let handle = self.handle(fh)?;
        if !handle.writable {
            return Ok(());
        }
        let file = tokio::fs::File::open(self.ctx.roots.local_path(&handle.path)).await?;
        file.sync_all().await?;
        Ok(())
    }

    pub fn release(&self, fh: FileHandle) -> VfsResult<()> {
        self.handles
            .remove_sync(&fh)
            .map(|_| ())
            .ok_or_else(bad_handle)
    }

    /// Replace the whole file.
    pub async fn write_file(&self, vp: &VirtualPath, data: &[u8]) -> VfsResult<u64> {
        self.gate(vp)?;
        Ok(self.writer.write(vp, data).await?.size)
    }

    /// Read the whole file.
    pub async fn read_file(&self, vp: &VirtualPath) -> VfsResult<Bytes> {
        self.gate(vp)?;
        let path = self.resolve(vp).await?;
        Ok(Bytes::from(tokio::fs::read(path).await?))
    }

    pub async fn truncate(&self, vp: &VirtualPath, size: u64) -> VfsResult<EntryAttributes> {
        self.gate(vp)?;
        self.writer.truncate(vp, size).await?;
        self.ctx.merge.get_attributes(vp).await
    }

    /// Apply `utimens`-style times; `None` leaves that time alone.
    pub async fn set_times(
        &self,
        vp: &VirtualPath,
        accessed: Option<SystemTime>,
        modified: Option<SystemTime>,
    ) -> VfsResult<EntryAttributes> {
        self.gate(vp)?;
        self.writer.set_times(vp, accessed, modified).await?;
        self.ctx.merge.get_attributes(vp).await
    }

    pub async fn unlink(&self, vp: &VirtualPath) -> VfsResult<DeleteOutcome> {
        self.gate(vp)?;
        self.deleter.delete(vp).await
    }

    pub async fn rmdir(&self, vp: &VirtualPath) -> VfsResult<DeleteOutcome> {
        self.gate(vp)?;
        self.deleter.rmdir(vp).await
    }

    pub async fn mkdir(&self, vp: &VirtualPath) -> VfsResult<EntryAttributes> {
        self.gate(vp)?;
        let row = self.writer.mkdir(vp).await?;
        self.ctx.merge.attributes_of(&row).await
    }

    /// Rename, keeping open handles pointed at the moved paths.
    pub async fn rename(&self, from: &VirtualPath, to: &VirtualPath) -> VfsResult<()> {
        self.gate(from)?;
        self.gate(to)?;
        self.writer.rename(from, to).await?;
        let mut moved = Vec::new();
        self.handles.iter_sync(|fh, h| {
            if h.path.starts_with(from) {
                moved.push(*fh);
            }
            true
        });
        for fh in moved {
            self.handles.update_sync(&fh, |_, h| {
                if let Some(path) = h.path.rebase(from, to) {
                    h.path = path;
                    h.source = None;
                }
            });
        }
        Ok(())
    }

    /// Capacity as the Mount View sees it: the cache quota, not the backing disk.
    pub fn statfs(&self) -> VfsResult<FsStats> {
        let vfs = nix::sys::statvfs::statvfs(self.ctx.roots.local_root())
            .map_err(|e| VfsError::Io(e.into()))?;
        let block = u64::from(BLOCK_SIZE);
        let free = self.eviction.free_space()? / block;
        Ok(FsStats {
            block_size: BLOCK_SIZE,
            total_blocks: self.eviction.policy().quota / block,
            free_blocks: free,
            available_blocks: free,
            total_inodes: vfs.files(),
            free_inodes: vfs.files_free(),
            max_filename_length: u32::try_from(vfs.name_max()).unwrap_or(255),
        })
    }

    pub fn status(&self) -> VfsResult<PairStatus> {
        Ok(PairStatus {
            name: self.name.clone(),
            external_online: self.ctx.roots.is_external_online(),
            index_ready: self.is_index_ready(),
            read_only: self.ctx.read_only,
            local_usage: self.ctx.store.local_usage()?,
            local_quota: self.eviction.policy().quota,
            dirty: self.ctx.store.dirty_paths()?.len(),
            pending_conflicts: self.ctx.store.conflicts(false)?.len(),
        })
    }

    /// The index row of one path.
    pub fn path_status(&self, vp: &VirtualPath) -> VfsResult<Option<FileEntry>> {
        self.ctx.store.get(vp)
    }

    /// Sync one path now, ignoring the debounce delay.
    pub async fn force_sync(&self, vp: &VirtualPath) -> VfsResult<SyncOutcome> {
        self.sync.sync_path(vp).await
    }

    pub fn eviction_candidates(&self, limit: usize) -> VfsResult<Vec<FileEntry>> {
        self.eviction.candidates(limit)
    }

    pub fn pending_conflicts(&self) -> VfsResult<Vec<ConflictRecord>> {
        self.ctx.store.conflicts(false)
    }

    pub fn resolve_conflict(&self, id: i64) -> VfsResult<bool> {
        self.ctx.store.resolve_conflict(id)
    }

    /// Apply an availability event. Reconnecting catches up on drift, deferred deletes, and
    /// parked syncs, in that order.
    #[instrument(name = "TierFs::set_external_online", skip(self), fields(pair = %self.name))]
    pub async fn set_external_online(&self, online: bool) -> VfsResult<()> {
        let was = self.ctx.roots.set_external_online(online);
        if !online || was || !self.ctx.roots.is_external_online() {
            return Ok(());
        }
        let check = self.ctx.versions.check_root(RootKind::External).await?;
        if let Some(entries) = scanned(&check) {
            reconcile(&self.ctx.store, &self.ctx.roots, None, Some(entries))?;
        }
        self.deleter.process_pending().await?;
        self.sync.notify_connected();
        Ok(())
    }

    #[must_use]
    pub fn is_external_online(&self) -> bool {
        self.ctx.roots.is_external_online()
    }

    pub async fn run_eviction_cycle(&self) -> VfsResult<EvictionReport> {
        self.eviction.run_cycle().await
    }

    /// Wait until everything queued for sync has been attempted.
    pub async fn flush_sync(&self) {
        self.sync.flush().await;
    }

    /// Stop background work, draining the sync queue if the store is reachable.
    #[instrument(name = "TierFs::shutdown", skip(self), fields(pair = %self.name))]
    pub async fn shutdown(&self) {
        let tasks = std::mem::take(
            &mut *self
                .background
                .lock()
                .unwrap_or_else(PoisonError::into_inner),
        );
        for task in tasks {
            task.abort();
        }
        self.sync.shutdown().await;
        info!("sync pair stopped");
    }
}
