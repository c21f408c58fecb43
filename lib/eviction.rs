//! LRU eviction of fully synced files from the local cache.
//!
//! Only [`Location::Both`] rows that are clean, unlocked and not being deleted are candidates.
//! Before local bytes are removed, the external copy is re-checked against the recorded size and
//! the last synced mtime. A missing copy is replaced by a verified synchronous copy first. A copy
//! edited since the last sync is kept aside as a conflict backup before the local bytes replace
//! it. If the copy fails the file is skipped.

use std::fs::Metadata;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use tracing::{debug, info, instrument, warn};

use crate::entry::{DeletePhase, FileEntry, Location, RootKind, now, time_from_system};
use crate::error::{VfsError, VfsResult};
use crate::io::{copy_verified, remove_path, stat};
use crate::path::VirtualPath;
use crate::router::RouterContext;
use crate::store::NewConflict;
use crate::sync::conflict;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EvictionPolicy {
    /// Upper bound on bytes held in the local cache.
    pub quota: u64,
    /// Files considered per run.
    pub max_per_run: usize,
    /// Share of the quota the periodic cycle keeps free.
    pub reserve_fraction: f64,
}

impl Default for EvictionPolicy {
    fn default() -> Self {
        Self {
            quota: 10 * 1024 * 1024 * 1024,
            max_per_run: 256,
            reserve_fraction: 0.1,
        }
    }
}

impl EvictionPolicy {
    #[expect(
        clippy::cast_precision_loss,
        clippy::cast_possible_truncation,
        clippy::cast_sign_loss,
        reason = "an approximate byte count is all that is needed"
    )]
    fn reserve_bytes(&self) -> u64 {
        (self.quota as f64 * self.reserve_fraction.clamp(0.0, 1.0)) as u64
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EvictionReport {
    pub evicted: usize,
    pub freed: u64,
    pub skipped: usize,
}

pub struct EvictionManager {
    ctx: Arc<RouterContext>,
    policy: EvictionPolicy,
    /// One run at a time.
    run: Mutex<()>,
}

impl EvictionManager {
    #[must_use]
    pub fn new(ctx: Arc<RouterContext>, policy: EvictionPolicy) -> Self {
        Self {
            ctx,
            policy,
            run: Mutex::new(()),
        }
    }

    #[must_use]
    pub fn policy(&self) -> &EvictionPolicy {
        &self.policy
    }

    /// Bytes left under the quota, recomputed from the metadata index.
    pub fn free_space(&self) -> VfsResult<u64> {
        Ok(self
            .policy
            .quota
            .saturating_sub(self.ctx.store.local_usage()?))
    }

    /// Make room for `needed` more bytes, evicting synchronously if necessary.
    pub async fn ensure_free_space(&self, needed: u64) -> VfsResult<bool> {
        let free = self.free_space()?;
        if free >= needed {
            return Ok(true);
        }
        let report = self.evict(needed - free).await?;
        debug!(needed, freed = report.freed, "evicted to make room for a write");
        Ok(self.free_space()? >= needed)
    }

    /// The would-be eviction order.
    pub fn candidates(&self, limit: usize) -> VfsResult<Vec<FileEntry>> {
        self.ctx.store.eviction_candidates(limit)
    }

    /// Evict least recently accessed files until `target` bytes are freed.
    #[instrument(name = "EvictionManager::evict", skip(self))]
    pub async fn evict(&self, target: u64) -> VfsResult<EvictionReport> {
        let _run = self.run.lock().await;
        let mut report = EvictionReport::default();
        if !self.ctx.roots.is_external_online() {
            debug!("external store offline, nothing can be evicted");
            return Ok(report);
        }

        for candidate in self.ctx.store.eviction_candidates(self.policy.max_per_run)? {
            if report.freed >= target {
                break;
            }
            let vp = candidate.virtual_path;
            match self.evict_one(&vp).await {
                Ok(Some(freed)) => {
                    report.evicted += 1;
                    report.freed += freed;
                }
                Ok(None) => report.skipped += 1,
                Err(e) => {
                    warn!(path = %vp, error = %e, "eviction failed, skipping");
                    report.skipped += 1;
                }
            }
        }

        if report.evicted > 0 {
            info!(
                evicted = report.evicted,
                freed = report.freed,
                skipped = report.skipped,
                "evicted files from the local cache"
            );
        }
        Ok(report)
    }

    /// Keep the configured reserve free. Driven by a timer.
    pub async fn run_cycle(&self) -> VfsResult<EvictionReport> {
        let reserve = self.policy.reserve_bytes();
        let free = self.free_space()?;
        if free >= reserve {
            return Ok(EvictionReport::default());
        }
        self.evict(reserve - free).await
    }

    /// Run [`Self::run_cycle`] every `every` until the task is aborted.
    pub async fn run_periodic(self: Arc<Self>, every: Duration) {
        let mut ticker = tokio::time::interval(every);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            if let Err(e) = self.run_cycle().await {
                warn!(error = %e, "periodic eviction failed");
            }
        }
    }

    /// Returns the bytes freed, or `None` if the file was skipped.
    async fn evict_one(&self, vp: &VirtualPath) -> VfsResult<Option<u64>> {
        let Some(path_guard) = self.ctx.locks.try_lock_path(vp) else {
            debug!(path = %vp, "path busy, skipping");
            return Ok(None);
        };
        let Some(_sync_guard) = self.ctx.locks.try_sync_lock(vp)? else {
            debug!(path = %vp, "copy in flight, skipping");
            return Ok(None);
        };
        // Writers now see the sync lock and fail fast instead of queueing behind us.
        drop(path_guard);

        let Some(mut row) = self.ctx.store.get(vp)? else {
            return Ok(None);
        };
        if row.location != Location::Both
            || row.is_dirty
            || row.is_directory
            || row.delete_phase != DeletePhase::None
            || row.pending_external_delete
        {
            return Ok(None);
        }

        let local = self.ctx.roots.local_path(vp);
        match stat(&local).await? {
            Some(meta) if meta.is_file() && meta.len() == row.size => {}
            Some(_) | None => {
                warn!(path = %vp, "local copy does not match the index, skipping");
                return Ok(None);
            }
        }

        let external = self.ctx.roots.external_path(vp);
        let state = match stat(&external).await {
            Ok(meta) => ExternalCopy::classify(&row, meta.as_ref()),
            Err(e) => {
                warn!(path = %vp, error = %e, "could not check the external copy, skipping");
                return Ok(None);
            }
        };
        match state {
            ExternalCopy::Verified => {}
            ExternalCopy::Absent => {
                warn!(path = %vp, "external copy missing, copying before eviction");
                if !self.restore_external(&mut row, &local, &external).await? {
                    return Ok(None);
                }
            }
            ExternalCopy::Drifted { modified_at } => {
                let at = now();
                let backup = match conflict::move_aside(&external, at).await {
                    Ok(backup) => backup,
                    Err(e) => {
                        warn!(path = %vp, error = %e, "could not keep the external edit aside, skipping");
                        return Ok(None);
                    }
                };
                self.ctx.store.add_conflict(&NewConflict {
                    virtual_path: vp,
                    backup_name: &backup,
                    conflict_at: at,
                    local_modified_at: row.modified_at,
                    external_modified_at: modified_at,
                })?;
                warn!(path = %vp, backup = %backup, "external copy changed since last sync, kept as backup");
                if !self.restore_external(&mut row, &local, &external).await? {
                    return Ok(None);
                }
            }
        }

        remove_path(&local)
            .await
            .map_err(|e| VfsError::write_failed(vp, e))?;
        row.location = Location::ExternalOnly;
        row.local_path = None;
        self.ctx.store.upsert(&row)?;
        self.ctx.versions.record_remove(RootKind::Local, vp).await?;
        debug!(path = %vp, size = row.size, "evicted");
        Ok(Some(row.size))
    }

    /// Copy the local bytes out so they may be dropped. `false` if the copy failed.
    async fn restore_external(
        &self,
        row: &mut FileEntry,
        local: &Path,
        external: &Path,
    ) -> VfsResult<bool> {
        let vp = row.virtual_path.clone();
        let report = match copy_verified(local, external, self.ctx.verify_checksums).await {
            Ok(report) => report,
            Err(e) => {
                warn!(path = %vp, error = %e, "copy before eviction failed, skipping");
                return Ok(false);
            }
        };
        row.checksum = report.checksum.or(row.checksum.take());
        if let Some(meta) = stat(external).await? {
            if let Ok(mtime) = meta.modified() {
                row.synced_external_mtime = Some(time_from_system(mtime));
            }
            self.ctx
                .versions
                .record_upsert(RootKind::External, &vp, &meta)
                .await?;
        }
        Ok(true)
    }
}

/// The external side of an eviction candidate, against what was last synced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ExternalCopy {
    /// Recorded size, not modified since the last sync.
    Verified,
    Absent,
    /// Edited on the external side since the last sync.
    Drifted { modified_at: DateTime<Utc> },
}

impl ExternalCopy {
    fn classify(row: &FileEntry, meta: Option<&Metadata>) -> Self {
        let Some(meta) = meta else {
            return Self::Absent;
        };
        let modified_at = meta.modified().map_or_else(|_| now(), time_from_system);
        let untouched = row
            .synced_external_mtime
            .is_none_or(|baseline| modified_at <= baseline);
        if meta.is_file() && meta.len() == row.size && untouched {
            Self::Verified
        } else {
            Self::Drifted { modified_at }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::router::test_support::context;

    fn vp(s: &str) -> VirtualPath {
        VirtualPath::new(s).unwrap()
    }

    fn seed(
        ctx: &RouterContext,
        dir: &std::path::Path,
        name: &str,
        location: Location,
        accessed_ms: i64,
    ) {
        std::fs::write(dir.join("local").join(name), b"0123456789").unwrap();
        if location == Location::Both {
            std::fs::write(dir.join("external").join(name), b"0123456789").unwrap();
        }
        let mut row = FileEntry::new_file(vp(name), location, 10, now());
        row.accessed_at = DateTime::from_timestamp_millis(accessed_ms).unwrap();
        row.local_path = Some(dir.join("local").join(name));
        row.is_dirty = location == Location::LocalOnly;
        ctx.store.upsert(&row).unwrap();
    }

    fn manager(ctx: &Arc<RouterContext>, quota: u64) -> EvictionManager {
        EvictionManager::new(
            Arc::clone(ctx),
            EvictionPolicy {
                quota,
                max_per_run: 10,
                reserve_fraction: 0.5,
            },
        )
    }

    #[tokio::test]
    async fn evicts_least_recently_accessed_first() {
        let (dir, ctx) = context();
        seed(&ctx, dir.path(), "a", Location::Both, 10);
        seed(&ctx, dir.path(), "b", Location::Both, 5);
        seed(&ctx, dir.path(), "c", Location::LocalOnly, 1);
        let mgr = manager(&ctx, 1000);

        let report = mgr.evict(1).await.unwrap();
        assert_eq!(report.evicted, 1);
        assert_eq!(
            ctx.store.get(&vp("b")).unwrap().unwrap().location,
            Location::ExternalOnly
        );
        assert!(!dir.path().join("local/b").exists());
        assert!(dir.path().join("external/b").exists());
        assert_eq!(ctx.store.get(&vp("a")).unwrap().unwrap().location, Location::Both);
        assert!(dir.path().join("local/c").exists());
    }

    #[tokio::test]
    async fn local_only_files_are_never_evicted() {
        let (dir, ctx) = context();
        seed(&ctx, dir.path(), "c", Location::LocalOnly, 1);
        let mgr = manager(&ctx, 5);
        assert!(!mgr.ensure_free_space(10).await.unwrap());
        assert!(dir.path().join("local/c").exists());
    }

    #[tokio::test]
    async fn missing_external_copy_is_restored_before_eviction() {
        let (dir, ctx) = context();
        seed(&ctx, dir.path(), "a", Location::Both, 1);
        std::fs::remove_file(dir.path().join("external/a")).unwrap();
        let mgr = manager(&ctx, 1000);

        assert_eq!(mgr.evict(10).await.unwrap().evicted, 1);
        assert_eq!(std::fs::read(dir.path().join("external/a")).unwrap(), b"0123456789");
        assert!(!dir.path().join("local/a").exists());
    }

    #[tokio::test]
    async fn failed_safety_copy_skips_the_file() {
        let (dir, ctx) = context();
        std::fs::create_dir_all(dir.path().join("local/d")).unwrap();
        std::fs::create_dir_all(dir.path().join("external/d")).unwrap();
        seed(&ctx, dir.path(), "d/a", Location::Both, 1);
        // A plain file where the external parent directory should be.
        std::fs::remove_dir_all(dir.path().join("external/d")).unwrap();
        std::fs::write(dir.path().join("external/d"), b"in the way").unwrap();
        let mgr = manager(&ctx, 1000);

        let report = mgr.evict(10).await.unwrap();
        assert_eq!(report.evicted, 0);
        assert_eq!(report.skipped, 1);
        assert!(dir.path().join("local/d/a").exists());
        assert_eq!(
            ctx.store.get(&vp("d/a")).unwrap().unwrap().location,
            Location::Both
        );
    }

    #[tokio::test]
    async fn external_edits_are_kept_aside_before_eviction() {
        let (dir, ctx) = context();
        seed(&ctx, dir.path(), "a", Location::Both, 1);
        std::fs::write(dir.path().join("external/a"), b"EXTERNAL EDIT, LONGER").unwrap();
        let mgr = manager(&ctx, 1000);

        assert_eq!(mgr.evict(10).await.unwrap().evicted, 1);
        assert_eq!(std::fs::read(dir.path().join("external/a")).unwrap(), b"0123456789");

        let conflicts = ctx.store.conflicts(false).unwrap();
        assert_eq!(conflicts.len(), 1);
        assert_eq!(conflicts[0].virtual_path, vp("a"));
        let backup = dir.path().join("external").join(&conflicts[0].backup_name);
        assert_eq!(std::fs::read(backup).unwrap(), b"EXTERNAL EDIT, LONGER");
    }

    #[tokio::test]
    async fn touched_external_copies_count_as_edited() {
        let (dir, ctx) = context();
        seed(&ctx, dir.path(), "a", Location::Both, 1);
        let mut row = ctx.store.get(&vp("a")).unwrap().unwrap();
        row.synced_external_mtime = Some(now() - chrono::Duration::hours(1));
        ctx.store.upsert(&row).unwrap();
        // Same length, different bytes, written after the baseline.
        std::fs::write(dir.path().join("external/a"), b"9876543210").unwrap();
        let mgr = manager(&ctx, 1000);

        assert_eq!(mgr.evict(10).await.unwrap().evicted, 1);
        assert_eq!(ctx.store.conflicts(false).unwrap().len(), 1);
        assert_eq!(std::fs::read(dir.path().join("external/a")).unwrap(), b"0123456789");
    }

    #[tokio::test]
    async fn sync_locked_files_are_skipped() {
        let (dir, ctx) = context();
        seed(&ctx, dir.path(), "a", Location::Both, 1);
        let _held = ctx.locks.try_sync_lock(&vp("a")).unwrap().unwrap();
        let mgr = manager(&ctx, 1000);
        assert_eq!(mgr.evict(10).await.unwrap().evicted, 0);
        assert!(dir.path().join("local/a").exists());
    }

    #[tokio::test]
    async fn periodic_cycle_restores_the_reserve() {
        let (dir, ctx) = context();
        seed(&ctx, dir.path(), "a", Location::Both, 1);
        seed(&ctx, dir.path(), "b", Location::Both, 2);
        // 20 bytes used of 30, reserve is 15.
        let mgr = manager(&ctx, 30);
        let report = mgr.run_cycle().await.unwrap();
        assert_eq!(report.evicted, 1);
        assert_eq!(mgr.free_space().unwrap(), 20);
    }
}
