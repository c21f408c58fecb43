//! Bringing the metadata rows back in line with what a rescan observed.

use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use tracing::{debug, info};

use crate::entry::{FileEntry, Location, TreeEntry};
use crate::error::VfsResult;
use crate::path::VirtualPath;
use crate::roots::{BackingRoots, is_excluded_path};
use crate::store::MetadataStore;

/// What a scan says about one path on one root.
#[derive(Debug, Clone, Copy)]
pub enum Observed<'a> {
    Present(&'a TreeEntry),
    Absent,
    /// The root was not rescanned; trust the row.
    Unknown,
}

impl<'a> Observed<'a> {
    fn from_scan(scan: Option<&'a BTreeMap<String, TreeEntry>>, key: &str) -> Self {
        match scan {
            None => Self::Unknown,
            Some(map) => map.get(key).map_or(Self::Absent, Self::Present),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reconciled {
    Keep,
    Upsert(FileEntry),
    Remove,
}

fn from_local(vp: &VirtualPath, l: &TreeEntry, now: DateTime<Utc>) -> FileEntry {
    let mut e = if l.is_directory {
        FileEntry::new_directory(vp.clone(), Location::LocalOnly, now)
    } else {
        FileEntry::new_file(vp.clone(), Location::LocalOnly, l.size, now)
    };
    e.modified_at = l.modified_at;
    e.is_dirty = true;
    e
}

fn from_external(vp: &VirtualPath, x: &TreeEntry, now: DateTime<Utc>) -> FileEntry {
    let mut e = if x.is_directory {
        FileEntry::new_directory(vp.clone(), Location::ExternalOnly, now)
    } else {
        FileEntry::new_file(vp.clone(), Location::ExternalOnly, x.size, now)
    };
    e.modified_at = x.modified_at;
    e.synced_external_mtime = Some(x.modified_at);
    e
}

fn first_sighting(
    vp: &VirtualPath,
    local: Observed<'_>,
    external: Observed<'_>,
    now: DateTime<Utc>,
) -> Option<FileEntry> {
    match (local, external) {
        (Observed::Present(l), Observed::Present(x)) => {
            let mut e = from_local(vp, l, now);
            let identical = l.is_directory == x.is_directory
                && (l.is_directory || (l.size == x.size && l.modified_at == x.modified_at));
            if identical {
                e.location = Location::Both;
                e.is_dirty = false;
                e.synced_external_mtime = Some(x.modified_at);
            }
            Some(e)
        }
        (Observed::Present(l), _) => Some(from_local(vp, l, now)),
        (_, Observed::Present(x)) => Some(from_external(vp, x, now)),
        _ => None,
    }
}

/// Decide the new state of one row from what each root looks like now.
#[must_use]
pub fn reconcile_one(
    vp: &VirtualPath,
    row: Option<&FileEntry>,
    local: Observed<'_>,
    external: Observed<'_>,
    local_path: PathBuf,
    now: DateTime<Utc>,
) -> Reconciled {
    let Some(row) = row else {
        return match first_sighting(vp, local, external, now) {
            Some(mut e) => {
                if e.location.has_local() {
                    e.local_path = Some(local_path);
                }
                Reconciled::Upsert(e)
            }
            None => Reconciled::Keep,
        };
    };
    if row.is_tombstone() || row.location == Location::Deleted {
        return Reconciled::Keep;
    }

    let had_local = row.location.has_local();
    let had_external = row.location.has_external();
    let local_now = match local {
        Observed::Present(_) => true,
        Observed::Absent => false,
        Observed::Unknown => had_local,
    };
    let external_now = match external {
        Observed::Present(_) => true,
        Observed::Absent => false,
        Observed::Unknown => had_external,
    };
    let local_changed = match local {
        Observed::Present(l) => {
            !had_local
                || (!row.is_directory && (l.size != row.size || l.modified_at != row.modified_at))
        }
        Observed::Absent | Observed::Unknown => false,
    };

    let mut next = row.clone();
    match (local_now, external_now) {
        (true, true) => {
            if row.is_directory {
                next.location = Location::Both;
                next.is_dirty = false;
            } else if local_changed {
                next.location = Location::LocalOnly;
                next.is_dirty = true;
            }
        }
        (true, false) => {
            next.location = Location::LocalOnly;
            if had_external {
                next.is_dirty = true;
                next.synced_external_mtime = None;
            }
            if local_changed {
                next.is_dirty = true;
            }
        }
        (false, true) => {
            next.location = Location::ExternalOnly;
            next.is_dirty = false;
            if let Observed::Present(x) = external {
                if !row.is_directory {
                    next.size = x.size;
                }
                next.modified_at = x.modified_at;
                next.synced_external_mtime = Some(x.modified_at);
            }
        }
        (false, false) => {
            if had_external && matches!(external, Observed::Absent) {
                next.location = Location::Deleted;
                next.is_dirty = false;
            } else {
                return Reconciled::Remove;
            }
        }
    }

    if local_changed && let Observed::Present(l) = local {
        next.size = l.size;
        next.modified_at = l.modified_at;
    }
    next.local_path = next.location.has_local().then_some(local_path);

    if next == *row {
        Reconciled::Keep
    } else {
        Reconciled::Upsert(next)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    pub upserted: usize,
    pub removed: usize,
}

/// Apply [`reconcile_one`] to every path known to the store or to either scan.
///
/// `None` for a scan means that root was trusted and not walked.
pub fn reconcile(
    store: &MetadataStore,
    roots: &BackingRoots,
    local: Option<&BTreeMap<String, TreeEntry>>,
    external: Option<&BTreeMap<String, TreeEntry>>,
) -> VfsResult<ReconcileReport> {
    if local.is_none() && external.is_none() {
        return Ok(ReconcileReport::default());
    }

    let rows: BTreeMap<String, FileEntry> = store
        .all()?
        .into_iter()
        .map(|e| (e.virtual_path.as_str().to_owned(), e))
        .collect();
    let mut keys: BTreeSet<&str> = rows.keys().map(String::as_str).collect();
    keys.extend(local.into_iter().flat_map(|m| m.keys().map(String::as_str)));
    keys.extend(external.into_iter().flat_map(|m| m.keys().map(String::as_str)));

    let now = crate::entry::now();
    let report = store.transaction(|tx| {
        let mut report = ReconcileReport::default();
        for key in keys {
            let vp = VirtualPath::new(key)?;
            if vp.is_root() || is_excluded_path(&vp) {
                continue;
            }
            let outcome = reconcile_one(
                &vp,
                rows.get(key),
                Observed::from_scan(local, key),
                Observed::from_scan(external, key),
                roots.local_path(&vp),
                now,
            );
            match outcome {
                Reconciled::Keep => {}
                Reconciled::Upsert(e) => {
                    debug!(path = %vp, location = e.location.as_str(), "reconciled row");
                    tx.upsert(&e)?;
                    report.upserted += 1;
                }
                Reconciled::Remove => {
                    debug!(path = %vp, "dropping row with no bytes anywhere");
                    tx.remove(&vp)?;
                    report.removed += 1;
                }
            }
        }
        Ok(report)
    })?;

    info!(
        upserted = report.upserted,
        removed = report.removed,
        "reconciled metadata with rescanned roots"
    );
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entry::now;

    fn vp(s: &str) -> VirtualPath {
        VirtualPath::new(s).unwrap()
    }

    fn te(size: u64, ms: i64) -> TreeEntry {
        TreeEntry {
            size,
            modified_at: DateTime::from_timestamp_millis(ms).unwrap(),
            is_directory: false,
        }
    }

    fn row(location: Location, size: u64, ms: i64) -> FileEntry {
        let mut e = FileEntry::new_file(vp("f"), location, size, now());
        e.modified_at = DateTime::from_timestamp_millis(ms).unwrap();
        e.local_path = location.has_local().then(|| PathBuf::from("/l/f"));
        e
    }

    fn run(r: Option<&FileEntry>, local: Observed<'_>, external: Observed<'_>) -> Reconciled {
        reconcile_one(&vp("f"), r, local, external, PathBuf::from("/l/f"), now())
    }

    #[test]
    fn both_missing_externally_with_local_bytes_becomes_dirty_local_only() {
        let r = row(Location::Both, 3, 100);
        let l = te(3, 100);
        let Reconciled::Upsert(e) = run(Some(&r), Observed::Present(&l), Observed::Absent) else {
            panic!("expected an update");
        };
        assert_eq!(e.location, Location::LocalOnly);
        assert!(e.is_dirty);
        assert_eq!(e.synced_external_mtime, None);
    }

    #[test]
    fn external_only_missing_externally_becomes_deleted() {
        let r = row(Location::ExternalOnly, 3, 100);
        let Reconciled::Upsert(e) = run(Some(&r), Observed::Unknown, Observed::Absent) else {
            panic!("expected an update");
        };
        assert_eq!(e.location, Location::Deleted);
        assert_eq!(e.local_path, None);
    }

    #[test]
    fn unchanged_rows_are_kept() {
        let r = row(Location::Both, 3, 100);
        let t = te(3, 100);
        assert_eq!(
            run(Some(&r), Observed::Present(&t), Observed::Present(&t)),
            Reconciled::Keep
        );
        assert_eq!(run(Some(&r), Observed::Unknown, Observed::Unknown), Reconciled::Keep);
    }

    #[test]
    fn local_edit_behind_our_back_marks_dirty() {
        let r = row(Location::Both, 3, 100);
        let l = te(9, 200);
        let x = te(3, 100);
        let Reconciled::Upsert(e) = run(Some(&r), Observed::Present(&l), Observed::Present(&x))
        else {
            panic!("expected an update");
        };
        assert_eq!(e.location, Location::LocalOnly);
        assert!(e.is_dirty);
        assert_eq!(e.size, 9);
    }

    #[test]
    fn vanished_local_only_row_is_removed() {
        let r = row(Location::LocalOnly, 3, 100);
        assert_eq!(run(Some(&r), Observed::Absent, Observed::Unknown), Reconciled::Remove);
    }

    #[test]
    fn evicted_local_copy_becomes_external_only() {
        let r = row(Location::Both, 3, 100);
        let x = te(3, 100);
        let Reconciled::Upsert(e) = run(Some(&r), Observed::Absent, Observed::Present(&x)) else {
            panic!("expected an update");
        };
        assert_eq!(e.location, Location::ExternalOnly);
        assert_eq!(e.local_path, None);
    }

    #[test]
    fn first_sighting_of_identical_copies_is_clean() {
        let t = te(3, 100);
        let Reconciled::Upsert(e) = run(None, Observed::Present(&t), Observed::Present(&t)) else {
            panic!("expected an insert");
        };
        assert_eq!(e.location, Location::Both);
        assert!(!e.is_dirty);
        assert_eq!(e.synced_external_mtime, Some(t.modified_at));
    }

    #[test]
    fn first_sighting_of_external_file() {
        let t = te(7, 100);
        let Reconciled::Upsert(e) = run(None, Observed::Absent, Observed::Present(&t)) else {
            panic!("expected an insert");
        };
        assert_eq!(e.location, Location::ExternalOnly);
        assert_eq!(e.size, 7);
        assert_eq!(e.local_path, None);
    }

    #[test]
    fn tombstones_are_left_for_delete_recovery() {
        let mut r = row(Location::Both, 3, 100);
        r.delete_phase = crate::entry::DeletePhase::LocalRemoved;
        assert_eq!(run(Some(&r), Observed::Absent, Observed::Absent), Reconciled::Keep);
    }
}
