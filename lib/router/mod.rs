//! Routing of filesystem operations onto the two backing roots.
//!
//! Every router works against the same [`RouterContext`]. Mutations take the path's mutation
//! lock, refuse paths with a copy in flight, do their filesystem side effect, and only then commit
//! the row.

pub mod delete;
pub mod read;
mod rename;
pub mod write;

use std::sync::Arc;

use tracing::debug;

use crate::entry::{Location, RootKind};
use crate::error::{VfsError, VfsResult};
use crate::io::{CopyError, stat};
use crate::lock::LockManager;
use crate::merge::MergeView;
use crate::path::VirtualPath;
use crate::roots::{BackingRoots, is_excluded_path};
use crate::store::MetadataStore;
use crate::version::TreeVersionManager;

pub use delete::{DeleteOutcome, DeleteRouter};
pub use read::{ReadResolution, ReadRouter};
pub use write::{WriteReceipt, WriteRouter};

/// Components shared by every router of one sync pair.
pub struct RouterContext {
    pub store: Arc<MetadataStore>,
    pub roots: Arc<BackingRoots>,
    pub locks: LockManager,
    pub versions: Arc<TreeVersionManager>,
    pub merge: Arc<MergeView>,
    pub read_only: bool,
    pub verify_checksums: bool,
}

impl RouterContext {
    /// Reject mutations on read-only pairs and on paths the Mount View never shows.
    pub fn ensure_mutable(&self, vp: &VirtualPath) -> VfsResult<()> {
        if self.read_only {
            return Err(VfsError::ReadOnly);
        }
        if vp.is_root() {
            return Err(VfsError::PermissionDenied(vp.clone()));
        }
        if is_excluded_path(vp) {
            return Err(VfsError::PermissionDenied(vp.clone()));
        }
        Ok(())
    }

    /// The parent of `vp` must be a visible directory.
    pub async fn ensure_parent_dir(&self, vp: &VirtualPath) -> VfsResult<()> {
        let Some(parent) = vp.parent() else {
            return Ok(());
        };
        if parent.is_root() {
            return Ok(());
        }
        match self.merge.entry(&parent).await? {
            None => Err(VfsError::NotFound(parent)),
            Some(row) if !row.is_directory => Err(VfsError::NotADirectory(parent)),
            Some(_) => Ok(()),
        }
    }

    /// Create every missing ancestor of `vp` in the local cache and index it.
    pub async fn materialize_parents(&self, vp: &VirtualPath) -> VfsResult<()> {
        for dir in vp.ancestors().into_iter().rev() {
            let local = self.roots.local_path(&dir);
            if stat(&local).await?.is_some() {
                continue;
            }
            match tokio::fs::create_dir(&local).await {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {}
                Err(e) => return Err(VfsError::write_failed(&dir, e)),
            }
            match self.store.get(&dir)? {
                Some(mut row) if row.location == Location::ExternalOnly => {
                    row.location = Location::Both;
                    row.local_path = Some(local.clone());
                    self.store.upsert(&row)?;
                }
                Some(_) => {}
                None => {
                    self.merge.discover(&dir).await?;
                }
            }
            if let Some(meta) = stat(&local).await? {
                self.versions.record_upsert(RootKind::Local, &dir, &meta).await?;
            }
            debug!(path = %dir, "created local parent directory");
        }
        Ok(())
    }

    /// Create every missing ancestor of `vp` on the external store.
    pub async fn materialize_external_parents(&self, vp: &VirtualPath) -> VfsResult<()> {
        for dir in vp.ancestors().into_iter().rev() {
            let external = self.roots.external_path(&dir);
            if stat(&external).await?.is_some() {
                continue;
            }
            match tokio::fs::create_dir(&external).await {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {}
                Err(e) => return Err(VfsError::write_failed(&dir, e)),
            }
            if let Some(mut row) = self.store.get(&dir)?
                && row.location == Location::LocalOnly
            {
                row.location = Location::Both;
                row.is_dirty = false;
                self.store.upsert(&row)?;
            }
            if let Some(meta) = stat(&external).await? {
                self.versions
                    .record_upsert(RootKind::External, &dir, &meta)
                    .await?;
            }
        }
        Ok(())
    }
}

/// Map a failed verified copy onto the error reported for `vp`.
pub(crate) fn copy_error(vp: &VirtualPath, e: CopyError) -> VfsError {
    match e {
        CopyError::Io(e) => VfsError::write_failed(vp, e),
        CopyError::SizeMismatch { expected, actual } => VfsError::write_failed(
            vp,
            std::io::Error::other(format!("copied {actual} bytes, expected {expected}")),
        ),
        CopyError::ChecksumMismatch { expected, actual } => VfsError::ChecksumMismatch {
            path: vp.clone(),
            expected,
            actual,
        },
    }
}
