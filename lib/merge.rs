//! The union view of both backing roots.
//!
//! A directory listing merges the local subtree with the external one in a single pass and
//! filters it through the metadata index: tombstones and [`Location::Deleted`] rows disappear,
//! names the index has never seen are recorded on the spot.

use std::collections::{BTreeMap, HashMap};
use std::fs::Metadata;
use std::os::unix::fs::PermissionsExt as _;
use std::path::Path;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, instrument, warn};

use crate::entry::{FileEntry, Location, TreeEntry, now, time_from_system};
use crate::error::{VfsError, VfsResult};
use crate::io::stat;
use crate::path::VirtualPath;
use crate::roots::{BackingRoots, is_excluded, is_excluded_path};
use crate::store::MetadataStore;
use crate::version::reconcile::{Observed, Reconciled, reconcile_one};
use crate::version::scan::tree_entry;

/// What `stat` reports for one merged entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EntryAttributes {
    pub size: u64,
    pub is_directory: bool,
    pub modified_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub accessed_at: DateTime<Utc>,
    /// Permission bits, without the file type.
    pub permissions: u16,
}

impl EntryAttributes {
    fn from_row(row: &FileEntry) -> Self {
        Self {
            size: row.size,
            is_directory: row.is_directory,
            modified_at: row.modified_at,
            created_at: row.created_at,
            accessed_at: row.accessed_at,
            permissions: if row.is_directory { 0o755 } else { 0o644 },
        }
    }

    fn from_metadata(meta: &Metadata, row: &FileEntry) -> Self {
        Self {
            size: if meta.is_dir() { 0 } else { meta.len() },
            is_directory: meta.is_dir(),
            modified_at: meta.modified().map_or(row.modified_at, time_from_system),
            created_at: row.created_at,
            accessed_at: row.accessed_at,
            permissions: permission_bits(meta),
        }
    }
}

#[expect(
    clippy::cast_possible_truncation,
    reason = "masked to the twelve permission bits"
)]
fn permission_bits(meta: &Metadata) -> u16 {
    (meta.permissions().mode() & 0o7777) as u16
}

fn observe(t: Option<&TreeEntry>, scanned: bool) -> Observed<'_> {
    match t {
        Some(t) => Observed::Present(t),
        None if scanned => Observed::Absent,
        None => Observed::Unknown,
    }
}

/// One name in a merged directory listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergedEntry {
    pub name: String,
    pub path: VirtualPath,
    pub location: Location,
    pub attributes: EntryAttributes,
}

pub struct MergeView {
    store: Arc<MetadataStore>,
    roots: Arc<BackingRoots>,
}

/// Entries of one physical directory, or `None` if it does not exist.
async fn read_children(dir: &Path) -> std::io::Result<Option<Vec<(String, Metadata)>>> {
    let mut rd = match tokio::fs::read_dir(dir).await {
        Ok(rd) => rd,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e),
    };
    let mut out = Vec::new();
    while let Some(entry) = rd.next_entry().await? {
        let Ok(name) = entry.file_name().into_string() else {
            continue;
        };
        if is_excluded(&name) {
            continue;
        }
        match entry.metadata().await {
            Ok(meta) if !meta.file_type().is_symlink() => out.push((name, meta)),
            Ok(_) => {}
            Err(e) => debug!(name, error = %e, "skipping entry that vanished during listing"),
        }
    }
    Ok(Some(out))
}

impl MergeView {
    #[must_use]
    pub fn new(store: Arc<MetadataStore>, roots: Arc<BackingRoots>) -> Self {
        Self { store, roots }
    }

    /// Build the index row for a path seen for the first time.
    fn first_sight(
        &self,
        vp: &VirtualPath,
        local: Option<&Metadata>,
        external: Option<&Metadata>,
    ) -> Option<FileEntry> {
        let l = local.map(tree_entry);
        let x = external.map(tree_entry);
        let online = self.roots.is_external_online();
        match reconcile_one(
            vp,
            None,
            observe(l.as_ref(), true),
            observe(x.as_ref(), online),
            self.roots.local_path(vp),
            now(),
        ) {
            Reconciled::Upsert(e) => Some(e),
            Reconciled::Keep | Reconciled::Remove => None,
        }
    }

    /// Probe both roots for a path the index does not know and record it if found.
    pub async fn discover(&self, vp: &VirtualPath) -> VfsResult<Option<FileEntry>> {
        if vp.is_root() || is_excluded_path(vp) {
            return Ok(None);
        }
        let local = stat(&self.roots.local_path(vp)).await?;
        let external = if self.roots.is_external_online() {
            stat(&self.roots.external_path(vp)).await.unwrap_or_else(|e| {
                warn!(path = %vp, error = %e, "external probe failed");
                None
            })
        } else {
            None
        };
        let Some(row) = self.first_sight(vp, local.as_ref(), external.as_ref()) else {
            return Ok(None);
        };
        debug!(path = %vp, location = row.location.as_str(), "recording first sighting");
        self.store.upsert(&row)?;
        Ok(Some(row))
    }

    /// The visible row for `vp`, discovering it if the index has never seen it.
    ///
    /// Tombstones and [`Location::Deleted`] rows resolve to `None`.
    pub async fn entry(&self, vp: &VirtualPath) -> VfsResult<Option<FileEntry>> {
        match self.store.get(vp)? {
            Some(row) if row.is_visible() => Ok(Some(row)),
            Some(_) => Ok(None),
            None => self.discover(vp).await,
        }
    }

    /// Attributes of one path. The root always resolves to a directory.
    #[instrument(name = "MergeView::get_attributes", skip(self))]
    pub async fn get_attributes(&self, vp: &VirtualPath) -> VfsResult<EntryAttributes> {
        if vp.is_root() {
            let meta = tokio::fs::metadata(self.roots.local_root()).await?;
            let stamp = meta.modified().map_or_else(|_| now(), time_from_system);
            return Ok(EntryAttributes {
                size: 0,
                is_directory: true,
                modified_at: stamp,
                created_at: stamp,
                accessed_at: stamp,
                permissions: permission_bits(&meta),
            });
        }
        let row = self
            .entry(vp)
            .await?
            .ok_or_else(|| VfsError::NotFound(vp.clone()))?;
        self.attributes_of(&row).await
    }

    /// Attributes of a known row, preferring the local copy's metadata.
    pub async fn attributes_of(&self, row: &FileEntry) -> VfsResult<EntryAttributes> {
        let vp = &row.virtual_path;
        if row.location.has_local()
            && let Some(meta) = stat(&self.roots.local_path(vp)).await?
        {
            return Ok(EntryAttributes::from_metadata(&meta, row));
        }
        if row.location.has_external() && self.roots.is_external_online() {
            match stat(&self.roots.external_path(vp)).await {
                Ok(Some(meta)) => return Ok(EntryAttributes::from_metadata(&meta, row)),
                Ok(None) => {}
                Err(e) => warn!(path = %vp, error = %e, "external stat failed"),
            }
        }
        // Known to the index but not reachable right now.
        Ok(EntryAttributes::from_row(row))
    }

    /// The merged contents of `dir`, sorted by name.
    #[instrument(name = "MergeView::list_directory", skip(self))]
    pub async fn list_directory(&self, dir: &VirtualPath) -> VfsResult<Vec<MergedEntry>> {
        if !dir.is_root() {
            let row = self
                .entry(dir)
                .await?
                .ok_or_else(|| VfsError::NotFound(dir.clone()))?;
            if !row.is_directory {
                return Err(VfsError::NotADirectory(dir.clone()));
            }
        }

        let not_a_dir = |e: std::io::Error| {
            if e.raw_os_error() == Some(libc::ENOTDIR) {
                VfsError::NotADirectory(dir.clone())
            } else {
                VfsError::Io(e)
            }
        };
        let local = read_children(&self.roots.local_path(dir))
            .await
            .map_err(not_a_dir)?
            .unwrap_or_default();
        let external = if self.roots.is_external_online() {
            match read_children(&self.roots.external_path(dir)).await {
                Ok(children) => children.unwrap_or_default(),
                Err(e) => {
                    warn!(error = %e, "external listing failed, showing local entries only");
                    Vec::new()
                }
            }
        } else {
            Vec::new()
        };

        let mut merged: BTreeMap<String, (Option<Metadata>, Option<Metadata>)> = BTreeMap::new();
        for (name, meta) in local {
            merged.entry(name).or_default().0 = Some(meta);
        }
        for (name, meta) in external {
            merged.entry(name).or_default().1 = Some(meta);
        }

        let mut known: HashMap<String, FileEntry> = self
            .store
            .children(dir)?
            .into_iter()
            .filter_map(|e| Some((e.virtual_path.name()?.to_owned(), e)))
            .collect();

        let mut out = Vec::with_capacity(merged.len());
        let mut sighted = Vec::new();
        for (name, (l, x)) in merged {
            let path = dir.join(&name)?;
            let row = match known.remove(&name) {
                Some(row) if row.is_visible() => row,
                Some(_) => continue,
                None => match self.first_sight(&path, l.as_ref(), x.as_ref()) {
                    Some(row) => {
                        sighted.push(row.clone());
                        row
                    }
                    None => continue,
                },
            };
            let Some(meta) = l.as_ref().or(x.as_ref()) else {
                continue;
            };
            out.push(MergedEntry {
                attributes: EntryAttributes::from_metadata(meta, &row),
                location: row.location,
                name,
                path,
            });
        }

        if !sighted.is_empty() {
            debug!(count = sighted.len(), "recording first sightings from listing");
            self.store.transaction(|tx| {
                for row in &sighted {
                    tx.upsert(row)?;
                }
                Ok(())
            })?;
        }
        Ok(out)
    }
}
