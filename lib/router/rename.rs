//! Renames of files and whole directory trees across both roots.

use tracing::{debug, info, instrument, warn};

use crate::entry::{DeletePhase, Location, RootKind};
use crate::error::{VfsError, VfsResult};
use crate::io::stat;
use crate::path::VirtualPath;
use crate::version::TreeChange;

use super::write::WriteRouter;

async fn rename_physical(
    from: &std::path::Path,
    to: &std::path::Path,
    vp: &VirtualPath,
) -> VfsResult<bool> {
    if stat(from).await?.is_none() {
        return Ok(false);
    }
    tokio::fs::rename(from, to)
        .await
        .map_err(|e| VfsError::write_failed(vp, e))?;
    Ok(true)
}

async fn undo_move(moved_to: &std::path::Path, back_to: &std::path::Path, vp: &VirtualPath) {
    if let Err(e) = tokio::fs::rename(moved_to, back_to).await {
        warn!(path = %vp, error = %e, "could not undo half of a failed rename");
    }
}

impl WriteRouter {
    async fn move_local(&self, from: &VirtualPath, to: &VirtualPath) -> VfsResult<bool> {
        self.ctx.materialize_parents(to).await?;
        rename_physical(
            &self.ctx.roots.local_path(from),
            &self.ctx.roots.local_path(to),
            from,
        )
        .await
    }

    /// Move `from` to `to`, replacing a compatible destination.
    #[instrument(name = "WriteRouter::rename", skip(self))]
    pub async fn rename(&self, from: &VirtualPath, to: &VirtualPath) -> VfsResult<()> {
        self.ctx.ensure_mutable(from)?;
        self.ctx.ensure_mutable(to)?;
        if from == to {
            return Ok(());
        }
        if to.starts_with(from) {
            return Err(VfsError::InvalidPath(format!(
                "cannot move {from} inside itself"
            )));
        }

        let (_a, _b) = self.ctx.locks.lock_pair(from, to).await;
        self.ctx.locks.ensure_unlocked(from)?;
        self.ctx.locks.ensure_unlocked(to)?;

        let src = self
            .ctx
            .merge
            .entry(from)
            .await?
            .ok_or_else(|| VfsError::NotFound(from.clone()))?;
        let subtree = if src.is_directory {
            self.ctx.store.descendants(from)?
        } else {
            Vec::new()
        };
        for row in &subtree {
            self.ctx.locks.ensure_unlocked(&row.virtual_path)?;
        }
        self.ctx.ensure_parent_dir(to).await?;

        let online = self.ctx.roots.is_external_online();
        let external_copy = src.location.has_external() || src.synced_external_mtime.is_some();
        if !online && (src.location == Location::ExternalOnly || (src.is_directory && external_copy))
        {
            return Err(VfsError::ExternalOffline);
        }

        if let Some(dst) = self.ctx.merge.entry(to).await? {
            match (src.is_directory, dst.is_directory) {
                (true, false) => return Err(VfsError::NotADirectory(to.clone())),
                (false, true) => return Err(VfsError::IsADirectory(to.clone())),
                (true, true) => self.delete.ensure_empty(to).await?,
                (false, false) => {}
            }
            debug!(path = %to, "replacing rename destination");
            self.delete.remove_entry(dst).await?;
        }

        // External first; a failure on either side puts the other one back.
        let external_from = self.ctx.roots.external_path(from);
        let external_to = self.ctx.roots.external_path(to);
        let mut moved_external = false;
        if online && external_copy {
            self.ctx.materialize_external_parents(to).await?;
            moved_external = rename_physical(&external_from, &external_to, from).await?;
        }
        let moved_local = match self.move_local(from, to).await {
            Ok(moved) => moved,
            Err(e) => {
                if moved_external {
                    undo_move(&external_to, &external_from, from).await;
                }
                return Err(e);
            }
        };

        // Offline with a stale external copy: the new path starts unsynced and the old external
        // bytes are deleted once the store is back.
        let leave_tombstone = !online && external_copy;
        let committed = self.ctx.store.transaction(|tx| {
            let mut dirty = Vec::new();
            for mut row in std::iter::once(src.clone()).chain(subtree) {
                let old = row.virtual_path.clone();
                let Some(new) = old.rebase(from, to) else {
                    continue;
                };
                tx.remove(&old)?;
                if leave_tombstone {
                    let mut tomb = row.clone();
                    tomb.delete_phase = DeletePhase::LocalRemoved;
                    tomb.local_path = None;
                    tomb.pending_external_delete = true;
                    tx.upsert(&tomb)?;
                    row.location = Location::LocalOnly;
                    row.is_dirty = true;
                    row.synced_external_mtime = None;
                }
                row.virtual_path = new.clone();
                row.local_path = row
                    .location
                    .has_local()
                    .then(|| self.ctx.roots.local_path(&new));
                tx.upsert(&row)?;
                if row.is_dirty && row.is_visible() {
                    dirty.push(new);
                }
            }
            Ok(dirty)
        });
        let dirty = match committed {
            Ok(dirty) => dirty,
            Err(e) => {
                if moved_local {
                    undo_move(
                        &self.ctx.roots.local_path(to),
                        &self.ctx.roots.local_path(from),
                        from,
                    )
                    .await;
                }
                if moved_external {
                    undo_move(&external_to, &external_from, from).await;
                }
                return Err(e);
            }
        };

        let change = || TreeChange::Rename {
            from: from.clone(),
            to: to.clone(),
        };
        if moved_local {
            self.ctx.versions.record(RootKind::Local, change()).await?;
        }
        if moved_external {
            self.ctx.versions.record(RootKind::External, change()).await?;
        }
        for path in &dirty {
            self.sync.enqueue(path);
        }
        info!(moved_local, moved_external, "renamed");
        Ok(())
    }
}
