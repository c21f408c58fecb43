//! Tree versions: detecting changes made to a backing root while we were not watching.
//!
//! Each root carries a sidecar descriptor with an opaque token, mirrored in the metadata store.
//! At startup a matching token means the rows can be trusted as they are. Anything else forces a
//! full walk of that root followed by [`reconcile::reconcile`].
//!
//! Every structural change made through the Mount View updates both the descriptor and the
//! stored token before the operation returns. Deferring that write would let a crash leave a
//! matching pair of tokens in front of a tree that has already moved on.

pub mod descriptor;
pub mod reconcile;
pub mod scan;

use std::collections::BTreeMap;
use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::{debug, info, instrument};

use crate::entry::{RootKind, TreeEntry, TreeVersion, now};
use crate::error::VfsResult;
use crate::path::VirtualPath;
use crate::roots::BackingRoots;
use crate::store::MetadataStore;

use descriptor::TreeDescriptor;

/// Result of the startup comparison for one root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RootCheck {
    /// Descriptor and stored token agree.
    Trusted,
    /// The root was walked; its entries are attached.
    Rescanned(BTreeMap<String, TreeEntry>),
    /// The external store is offline.
    Unavailable,
}

/// A structural change to record in a root's tree version.
#[derive(Debug, Clone)]
pub enum TreeChange {
    Upsert { path: VirtualPath, entry: TreeEntry },
    Remove { path: VirtualPath },
    Rename { from: VirtualPath, to: VirtualPath },
}

pub struct TreeVersionManager {
    enabled: bool,
    roots: Arc<BackingRoots>,
    store: Arc<MetadataStore>,
    /// Serializes descriptor rewrites.
    write_lock: Mutex<()>,
}

impl TreeVersionManager {
    /// With `enabled == false` no descriptors are written and every startup rescans.
    #[must_use]
    pub fn new(enabled: bool, roots: Arc<BackingRoots>, store: Arc<MetadataStore>) -> Self {
        Self {
            enabled,
            roots,
            store,
            write_lock: Mutex::new(()),
        }
    }

    fn root_available(&self, kind: RootKind) -> bool {
        match kind {
            RootKind::Local => true,
            RootKind::External => self.roots.is_external_online(),
        }
    }

    fn root_dir(&self, kind: RootKind) -> &std::path::Path {
        match kind {
            RootKind::Local => self.roots.local_root(),
            RootKind::External => self.roots.external_root(),
        }
    }

    /// Compare the descriptor of `kind` with the stored token, rescanning on any mismatch.
    #[instrument(name = "TreeVersionManager::check_root", skip(self))]
    pub async fn check_root(&self, kind: RootKind) -> VfsResult<RootCheck> {
        if !self.root_available(kind) {
            debug!("root unavailable, skipping version check");
            return Ok(RootCheck::Unavailable);
        }
        if !self.enabled {
            return self.rescan(kind).await;
        }

        let on_disk = descriptor::read(self.root_dir(kind)).await;
        let stored = self.store.tree_version(kind)?;
        match (on_disk, stored) {
            (Some(d), Some(s)) if d.tree_version == s.token => {
                debug!(token = %s.token, "tree version matches, trusting stored rows");
                Ok(RootCheck::Trusted)
            }
            (d, s) => {
                info!(
                    descriptor = d.as_ref().map(|d| d.tree_version.as_str()),
                    stored = s.as_ref().map(|s| s.token.as_str()),
                    "tree version mismatch, rescanning"
                );
                self.rescan(kind).await
            }
        }
    }

    /// Walk `kind` and replace its tree version, descriptor first, then the stored token.
    #[instrument(name = "TreeVersionManager::rescan", skip(self))]
    pub async fn rescan(&self, kind: RootKind) -> VfsResult<RootCheck> {
        let _guard = self.write_lock.lock().await;
        let entries = scan::scan_root(self.root_dir(kind)).await?;
        let at = now();
        let mut version = TreeVersion {
            root: kind,
            token: descriptor::new_token(at),
            last_scan_at: at,
            file_count: 0,
            total_size: 0,
            entries: entries.clone(),
        };
        version.refresh_totals();
        self.persist(&version).await?;
        Ok(RootCheck::Rescanned(entries))
    }

    async fn persist(&self, version: &TreeVersion) -> VfsResult<()> {
        if self.enabled {
            descriptor::write(self.root_dir(version.root), &TreeDescriptor::from(version)).await?;
        }
        self.store.put_tree_version(version)?;
        Ok(())
    }

    /// Apply a structural change to the tree version of `kind` and persist a new token.
    pub async fn record(&self, kind: RootKind, change: TreeChange) -> VfsResult<()> {
        if !self.enabled || !self.root_available(kind) {
            return Ok(());
        }
        let guard = self.write_lock.lock().await;
        let Some(mut version) = self.store.tree_version(kind)? else {
            drop(guard);
            self.rescan(kind).await?;
            return Ok(());
        };

        match change {
            TreeChange::Upsert { path, entry } => {
                if !path.is_root() {
                    version.entries.insert(path.as_str().to_owned(), entry);
                }
            }
            TreeChange::Remove { path } => {
                version.entries.retain(|k, _| !under(k, &path));
            }
            TreeChange::Rename { from, to } => {
                let moved: Vec<(String, TreeEntry)> = version
                    .entries
                    .iter()
                    .filter(|(k, _)| under(k, &from))
                    .map(|(k, v)| (k.clone(), *v))
                    .collect();
                for (k, v) in moved {
                    version.entries.remove(&k);
                    if let Some(new_key) = VirtualPath::new(&k)
                        .ok()
                        .and_then(|p| p.rebase(&from, &to))
                    {
                        version.entries.insert(new_key.as_str().to_owned(), v);
                    }
                }
            }
        }

        let at = now();
        version.token = descriptor::new_token(at);
        version.refresh_totals();
        self.persist(&version).await
    }

    /// Convenience for recording a path's current metadata on `kind`.
    pub async fn record_upsert(
        &self,
        kind: RootKind,
        path: &VirtualPath,
        meta: &std::fs::Metadata,
    ) -> VfsResult<()> {
        self.record(
            kind,
            TreeChange::Upsert {
                path: path.clone(),
                entry: scan::tree_entry(meta),
            },
        )
        .await
    }

    pub async fn record_remove(&self, kind: RootKind, path: &VirtualPath) -> VfsResult<()> {
        self.record(kind, TreeChange::Remove { path: path.clone() }).await
    }
}

fn under(key: &str, path: &VirtualPath) -> bool {
    key == path.as_str()
        || (key.len() > path.as_str().len()
            && key.starts_with(path.as_str())
            && key.as_bytes()[path.as_str().len()] == b'/')
}
