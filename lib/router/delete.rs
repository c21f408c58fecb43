//! Deletion that survives a crash at any point.
//!
//! Files with an external copy go through three committed phases:
//!
//! 1. `delete_phase = 1` is persisted before any bytes are touched;
//! 2. local bytes are removed, then `delete_phase = 2` and `local_path = None` are persisted;
//! 3. external bytes are removed and the row is dropped.
//!
//! If the external store is offline at phase 3 the row stays at phase 2 with
//! `pending_external_delete` set. Recovery only has to look at which phase was committed last.

use std::sync::Arc;

use tracing::{debug, info, instrument, warn};

use crate::entry::{DeletePhase, FileEntry, Location, RootKind};
use crate::error::{VfsError, VfsResult};
use crate::io::remove_path;
use crate::path::VirtualPath;

use super::RouterContext;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeleteOutcome {
    /// Gone from both stores and from the index.
    Removed,
    /// Gone from the Mount View; the external copy goes when the store reconnects.
    PendingExternal,
    /// A row with no bytes anywhere was dropped.
    Purged,
}

pub struct DeleteRouter {
    ctx: Arc<RouterContext>,
}

impl DeleteRouter {
    #[must_use]
    pub fn new(ctx: Arc<RouterContext>) -> Self {
        Self { ctx }
    }

    /// Delete the file at `vp`.
    #[instrument(name = "DeleteRouter::delete", skip(self))]
    pub async fn delete(&self, vp: &VirtualPath) -> VfsResult<DeleteOutcome> {
        self.ctx.ensure_mutable(vp)?;
        let _guard = self.ctx.locks.lock_path(vp).await;
        self.ctx.locks.ensure_unlocked(vp)?;

        let row = match self.ctx.store.get(vp)? {
            Some(row) => row,
            None => self
                .ctx
                .merge
                .discover(vp)
                .await?
                .ok_or_else(|| VfsError::NotFound(vp.clone()))?,
        };
        if row.is_tombstone() {
            return Err(VfsError::NotFound(vp.clone()));
        }
        if row.is_directory && row.is_visible() {
            return Err(VfsError::IsADirectory(vp.clone()));
        }
        self.delete_entry(row).await
    }

    /// Remove an empty directory.
    #[instrument(name = "DeleteRouter::rmdir", skip(self))]
    pub async fn rmdir(&self, vp: &VirtualPath) -> VfsResult<DeleteOutcome> {
        self.ctx.ensure_mutable(vp)?;
        let _guard = self.ctx.locks.lock_path(vp).await;

        let row = self
            .ctx
            .merge
            .entry(vp)
            .await?
            .ok_or_else(|| VfsError::NotFound(vp.clone()))?;
        if !row.is_directory {
            return Err(VfsError::NotADirectory(vp.clone()));
        }
        self.ensure_empty(vp).await?;
        self.remove_directory(row).await
    }

    /// Fail with [`VfsError::NotEmpty`] unless `dir` has no visible children on either side.
    pub(super) async fn ensure_empty(&self, dir: &VirtualPath) -> VfsResult<()> {
        let listed = self.ctx.merge.list_directory(dir).await?;
        let indexed = self
            .ctx
            .store
            .children(dir)?
            .iter()
            .any(FileEntry::is_visible);
        if listed.is_empty() && !indexed {
            Ok(())
        } else {
            Err(VfsError::NotEmpty(dir.clone()))
        }
    }

    /// Dispatch on the row's kind and location. The caller holds the path lock.
    pub(super) async fn remove_entry(&self, row: FileEntry) -> VfsResult<DeleteOutcome> {
        if row.is_directory {
            self.remove_directory(row).await
        } else {
            self.delete_entry(row).await
        }
    }

    async fn delete_entry(&self, mut row: FileEntry) -> VfsResult<DeleteOutcome> {
        let vp = row.virtual_path.clone();
        match row.location {
            Location::Deleted | Location::NotExists => {
                self.ctx.store.remove(&vp)?;
                debug!(path = %vp, "purged row");
                Ok(DeleteOutcome::Purged)
            }
            Location::LocalOnly if row.synced_external_mtime.is_none() => {
                let local = row
                    .local_path
                    .clone()
                    .unwrap_or_else(|| self.ctx.roots.local_path(&vp));
                remove_path(&local)
                    .await
                    .map_err(|e| VfsError::write_failed(&vp, e))?;
                self.ctx.store.remove(&vp)?;
                self.ctx.versions.record_remove(RootKind::Local, &vp).await?;
                Ok(DeleteOutcome::Removed)
            }
            // A local-only file with a baseline still has a stale external copy.
            Location::LocalOnly | Location::Both => {
                row.delete_phase = DeletePhase::IntentRecorded;
                self.ctx.store.upsert(&row)?;
                self.resume(row).await
            }
            Location::ExternalOnly => {
                if self.ctx.roots.is_external_online() {
                    self.remove_external(&vp).await?;
                    self.ctx.store.remove(&vp)?;
                    self.ctx
                        .versions
                        .record_remove(RootKind::External, &vp)
                        .await?;
                    Ok(DeleteOutcome::Removed)
                } else {
                    row.pending_external_delete = true;
                    self.ctx.store.upsert(&row)?;
                    info!(path = %vp, "external store offline, delete deferred");
                    Ok(DeleteOutcome::PendingExternal)
                }
            }
        }
    }

    /// Continue a phased delete from the last committed phase.
    async fn resume(&self, mut row: FileEntry) -> VfsResult<DeleteOutcome> {
        let vp = row.virtual_path.clone();
        if row.delete_phase == DeletePhase::IntentRecorded {
            let local = row
                .local_path
                .clone()
                .unwrap_or_else(|| self.ctx.roots.local_path(&vp));
            remove_path(&local)
                .await
                .map_err(|e| VfsError::write_failed(&vp, e))?;
            row.delete_phase = DeletePhase::LocalRemoved;
            row.local_path = None;
            self.ctx.store.upsert(&row)?;
            self.ctx.versions.record_remove(RootKind::Local, &vp).await?;
        }

        if !self.ctx.roots.is_external_online() {
            if !row.pending_external_delete {
                row.pending_external_delete = true;
                self.ctx.store.upsert(&row)?;
            }
            info!(path = %vp, "external store offline, delete deferred");
            return Ok(DeleteOutcome::PendingExternal);
        }
        self.remove_external(&vp).await?;
        self.ctx.store.remove(&vp)?;
        self.ctx
            .versions
            .record_remove(RootKind::External, &vp)
            .await?;
        Ok(DeleteOutcome::Removed)
    }

    async fn remove_external(&self, vp: &VirtualPath) -> VfsResult<()> {
        match remove_path(&self.ctx.roots.external_path(vp)).await {
            Ok(_) => Ok(()),
            Err(e) if e.raw_os_error() == Some(libc::ENOTEMPTY) => {
                Err(VfsError::NotEmpty(vp.clone()))
            }
            Err(e) => Err(VfsError::write_failed(vp, e)),
        }
    }

    async fn remove_directory(&self, mut row: FileEntry) -> VfsResult<DeleteOutcome> {
        let vp = row.virtual_path.clone();
        let online = self.ctx.roots.is_external_online();
        let external = row.location.has_external();

        // External first: hidden files there (conflict backups) keep the directory alive.
        if external && online {
            self.remove_external(&vp).await?;
        }
        let local = self.ctx.roots.local_path(&vp);
        match remove_path(&local).await {
            Ok(_) => {}
            Err(e) if e.raw_os_error() == Some(libc::ENOTEMPTY) => {
                return Err(VfsError::NotEmpty(vp.clone()));
            }
            Err(e) => return Err(VfsError::write_failed(&vp, e)),
        }
        self.ctx.versions.record_remove(RootKind::Local, &vp).await?;

        if external && !online {
            row.delete_phase = DeletePhase::LocalRemoved;
            row.local_path = None;
            row.pending_external_delete = true;
            self.ctx.store.upsert(&row)?;
            return Ok(DeleteOutcome::PendingExternal);
        }
        self.ctx.store.remove(&vp)?;
        if external {
            self.ctx
                .versions
                .record_remove(RootKind::External, &vp)
                .await?;
        }
        Ok(DeleteOutcome::Removed)
    }

    /// Finish every delete a crash interrupted at phase 1 or 2.
    #[instrument(name = "DeleteRouter::recover", skip(self))]
    pub async fn recover(&self) -> VfsResult<usize> {
        let rows = self.ctx.store.interrupted_deletes()?;
        let mut finished = 0;
        for row in rows {
            let vp = row.virtual_path.clone();
            let _guard = self.ctx.locks.lock_path(&vp).await;
            let outcome = if row.is_directory {
                self.remove_directory(row).await
            } else {
                self.resume(row).await
            };
            match outcome {
                Ok(outcome) => {
                    debug!(path = %vp, ?outcome, "resumed interrupted delete");
                    finished += 1;
                }
                Err(e) => warn!(path = %vp, error = %e, "failed to resume interrupted delete"),
            }
        }
        if finished > 0 {
            info!(count = finished, "recovered interrupted deletes");
        }
        Ok(finished)
    }

    /// Remove external copies of paths deleted while the store was offline, deepest first.
    #[instrument(name = "DeleteRouter::process_pending", skip(self))]
    pub async fn process_pending(&self) -> VfsResult<usize> {
        if !self.ctx.roots.is_external_online() {
            return Ok(0);
        }
        let mut done = 0;
        for row in self.ctx.store.pending_external_deletes()? {
            let vp = row.virtual_path.clone();
            let _guard = self.ctx.locks.lock_path(&vp).await;
            // A write may have revived the path since.
            let Some(current) = self.ctx.store.get(&vp)? else {
                continue;
            };
            if !current.pending_external_delete {
                continue;
            }
            if let Err(e) = self.remove_external(&vp).await {
                warn!(path = %vp, error = %e, "failed to apply deferred external delete");
                continue;
            }
            self.ctx.store.remove(&vp)?;
            self.ctx
                .versions
                .record_remove(RootKind::External, &vp)
                .await?;
            done += 1;
        }
        if done > 0 {
            info!(count = done, "applied deferred external deletes");
        }
        Ok(done)
    }
}
