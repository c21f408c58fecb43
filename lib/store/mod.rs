//! The persistent metadata index.
//!
//! A single SQLite database per sync pair holds every [`FileEntry`], the [`TreeVersion`] of each
//! root, and the conflict log. All mutations go through [`MetadataStore::transaction`]: the
//! closure either commits as a whole or is rolled back.

mod schema;

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Mutex, PoisonError};

use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension as _, params};
use tracing::{debug, warn};

use crate::entry::{ConflictRecord, FileEntry, Location, LockState, RootKind, TreeEntry, TreeVersion};
use crate::error::{VfsError, VfsResult};
use crate::path::VirtualPath;

use schema::{
    CONFLICT_COLUMNS, ENTRY_COLUMNS, RawConflict, RawEntry, SCHEMA, size_from_sql, size_to_sql,
    time_from_sql,
};

/// A conflict about to be appended to the log.
#[derive(Debug, Clone)]
pub struct NewConflict<'a> {
    pub virtual_path: &'a VirtualPath,
    pub backup_name: &'a str,
    pub conflict_at: DateTime<Utc>,
    pub local_modified_at: DateTime<Utc>,
    pub external_modified_at: DateTime<Utc>,
}

/// Handle to the metadata database.
pub struct MetadataStore {
    conn: Mutex<Connection>,
}

impl MetadataStore {
    /// Open or create the database at `path`.
    ///
    /// A file that SQLite cannot read, or that fails `quick_check`, is reported as
    /// [`VfsError::MetadataCorrupted`].
    pub fn open(path: &Path) -> VfsResult<Self> {
        let conn = Connection::open(path)?;
        conn.pragma_update_and_check(None, "journal_mode", "WAL", |_| Ok(()))?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        conn.busy_timeout(std::time::Duration::from_secs(5))?;
        Self::check_integrity(&conn)?;
        conn.execute_batch(SCHEMA)?;
        debug!(path = %path.display(), "opened metadata store");
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// An in-memory database, mostly for tests.
    pub fn in_memory() -> VfsResult<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn check_integrity(conn: &Connection) -> VfsResult<()> {
        let verdict: String = conn.query_row("PRAGMA quick_check", params![], |row| row.get(0))?;
        if verdict == "ok" {
            Ok(())
        } else {
            Err(VfsError::MetadataCorrupted(verdict))
        }
    }

    /// Run `f` inside a transaction. An `Err` from `f` rolls everything back.
    pub fn transaction<T>(&self, f: impl FnOnce(&Tx<'_>) -> VfsResult<T>) -> VfsResult<T> {
        let mut conn = self.conn.lock().unwrap_or_else(PoisonError::into_inner);
        let tx = conn.transaction()?;
        let out = f(&Tx { conn: &tx })?;
        tx.commit()?;
        Ok(out)
    }

    pub fn get(&self, vp: &VirtualPath) -> VfsResult<Option<FileEntry>> {
        self.transaction(|tx| tx.get(vp))
    }

    pub fn upsert(&self, entry: &FileEntry) -> VfsResult<()> {
        self.transaction(|tx| tx.upsert(entry))
    }

    pub fn remove(&self, vp: &VirtualPath) -> VfsResult<bool> {
        self.transaction(|tx| tx.remove(vp))
    }

    /// Rows whose parent is `dir`.
    pub fn children(&self, dir: &VirtualPath) -> VfsResult<Vec<FileEntry>> {
        self.transaction(|tx| {
            tx.query_entries(
                &format!("SELECT {ENTRY_COLUMNS} FROM file_entries WHERE parent_path = ?1"),
                params![dir.as_str()],
            )
        })
    }

    /// Every row strictly below `dir`.
    pub fn descendants(&self, dir: &VirtualPath) -> VfsResult<Vec<FileEntry>> {
        self.transaction(|tx| tx.descendants(dir))
    }

    pub fn all(&self) -> VfsResult<Vec<FileEntry>> {
        self.transaction(|tx| {
            tx.query_entries(
                &format!("SELECT {ENTRY_COLUMNS} FROM file_entries ORDER BY virtual_path"),
                params![],
            )
        })
    }

    /// Visible rows whose local content has not reached the external store.
    pub fn dirty_paths(&self) -> VfsResult<Vec<VirtualPath>> {
        let rows = self.transaction(|tx| {
            tx.query_entries(
                &format!(
                    "SELECT {ENTRY_COLUMNS} FROM file_entries
                     WHERE is_dirty = 1 AND delete_phase = 0 AND pending_external_delete = 0
                     ORDER BY virtual_path"
                ),
                params![],
            )
        })?;
        Ok(rows.into_iter().map(|e| e.virtual_path).collect())
    }

    /// Eviction candidates, least recently accessed first.
    pub fn eviction_candidates(&self, limit: usize) -> VfsResult<Vec<FileEntry>> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        self.transaction(|tx| {
            tx.query_entries(
                &format!(
                    "SELECT {ENTRY_COLUMNS} FROM file_entries
                     WHERE location = ?1 AND is_dirty = 0 AND lock_state = ?2
                       AND is_directory = 0 AND delete_phase = 0 AND pending_external_delete = 0
                     ORDER BY accessed_at ASC, virtual_path ASC
                     LIMIT ?3"
                ),
                params![Location::Both.as_str(), LockState::Unlocked.as_str(), limit],
            )
        })
    }

    /// Rows a crash left at delete phase 1 or 2.
    pub fn interrupted_deletes(&self) -> VfsResult<Vec<FileEntry>> {
        self.transaction(|tx| {
            tx.query_entries(
                &format!(
                    "SELECT {ENTRY_COLUMNS} FROM file_entries
                     WHERE delete_phase IN (1, 2) ORDER BY virtual_path"
                ),
                params![],
            )
        })
    }

    /// Tombstones waiting for the external store, deepest paths first.
    pub fn pending_external_deletes(&self) -> VfsResult<Vec<FileEntry>> {
        let mut rows = self.transaction(|tx| {
            tx.query_entries(
                &format!(
                    "SELECT {ENTRY_COLUMNS} FROM file_entries WHERE pending_external_delete = 1"
                ),
                params![],
            )
        })?;
        rows.sort_by(|a, b| {
            b.virtual_path
                .depth()
                .cmp(&a.virtual_path.depth())
                .then_with(|| a.virtual_path.cmp(&b.virtual_path))
        });
        Ok(rows)
    }

    /// Bytes currently held in the local cache, recomputed from the rows.
    pub fn local_usage(&self) -> VfsResult<u64> {
        let usage: i64 = self.transaction(|tx| {
            Ok(tx.conn.query_row(
                "SELECT COALESCE(SUM(size), 0) FROM file_entries
                 WHERE location IN (?1, ?2) AND is_directory = 0 AND delete_phase < 2",
                params![Location::LocalOnly.as_str(), Location::Both.as_str()],
                |row| row.get(0),
            )?)
        })?;
        Ok(size_from_sql(usage))
    }

    pub fn set_lock_state(&self, vp: &VirtualPath, state: LockState) -> VfsResult<()> {
        self.transaction(|tx| tx.set_lock_state(vp, state))
    }

    /// Clear lock markers left behind by a crash.
    pub fn reset_sync_locks(&self) -> VfsResult<usize> {
        let n = self.transaction(|tx| {
            Ok(tx.conn.execute(
                "UPDATE file_entries SET lock_state = ?1 WHERE lock_state != ?1",
                params![LockState::Unlocked.as_str()],
            )?)
        })?;
        if n > 0 {
            warn!(count = n, "cleared stale sync locks");
        }
        Ok(n)
    }

    pub fn touch_accessed(&self, vp: &VirtualPath, at: DateTime<Utc>) -> VfsResult<()> {
        self.transaction(|tx| {
            tx.conn.execute(
                "UPDATE file_entries SET accessed_at = ?2 WHERE virtual_path = ?1",
                params![vp.as_str(), at.timestamp_millis()],
            )?;
            Ok(())
        })
    }

    pub fn tree_version(&self, root: RootKind) -> VfsResult<Option<TreeVersion>> {
        self.transaction(|tx| tx.tree_version(root))
    }

    pub fn put_tree_version(&self, version: &TreeVersion) -> VfsResult<()> {
        self.transaction(|tx| tx.put_tree_version(version))
    }

    /// Append a conflict record and return its id.
    pub fn add_conflict(&self, conflict: &NewConflict<'_>) -> VfsResult<i64> {
        self.transaction(|tx| {
            tx.conn.execute(
                "INSERT INTO conflicts
                   (virtual_path, backup_name, conflict_at, local_modified_at, external_modified_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    conflict.virtual_path.as_str(),
                    conflict.backup_name,
                    conflict.conflict_at.timestamp_millis(),
                    conflict.local_modified_at.timestamp_millis(),
                    conflict.external_modified_at.timestamp_millis(),
                ],
            )?;
            Ok(tx.conn.last_insert_rowid())
        })
    }

    /// The conflict log, oldest first.
    pub fn conflicts(&self, include_resolved: bool) -> VfsResult<Vec<ConflictRecord>> {
        self.transaction(|tx| {
            let sql = if include_resolved {
                format!("SELECT {CONFLICT_COLUMNS} FROM conflicts ORDER BY id")
            } else {
                format!("SELECT {CONFLICT_COLUMNS} FROM conflicts WHERE resolved = 0 ORDER BY id")
            };
            let mut stmt = tx.conn.prepare(&sql)?;
            let raw = stmt
                .query_map(params![], RawConflict::from_row)?
                .collect::<Result<Vec<_>, _>>()?;
            raw.into_iter().map(RawConflict::into_record).collect()
        })
    }

    /// Mark a conflict resolved. Returns `false` if no such record exists.
    pub fn resolve_conflict(&self, id: i64) -> VfsResult<bool> {
        self.transaction(|tx| {
            Ok(tx
                .conn
                .execute("UPDATE conflicts SET resolved = 1 WHERE id = ?1", params![id])?
                > 0)
        })
    }
}

/// Operations available inside a transaction.
pub struct Tx<'a> {
    conn: &'a Connection,
}

impl Tx<'_> {
    fn query_entries(
        &self,
        sql: &str,
        params: impl rusqlite::Params,
    ) -> VfsResult<Vec<FileEntry>> {
        let mut stmt = self.conn.prepare_cached(sql)?;
        let raw = stmt
            .query_map(params, RawEntry::from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        raw.into_iter().map(RawEntry::into_entry).collect()
    }

    pub fn get(&self, vp: &VirtualPath) -> VfsResult<Option<FileEntry>> {
        let mut stmt = self.conn.prepare_cached(&format!(
            "SELECT {ENTRY_COLUMNS} FROM file_entries WHERE virtual_path = ?1"
        ))?;
        let raw = stmt
            .query_row(params![vp.as_str()], RawEntry::from_row)
            .optional()?;
        raw.map(RawEntry::into_entry).transpose()
    }

    pub fn upsert(&self, e: &FileEntry) -> VfsResult<()> {
        let parent = e.virtual_path.parent().unwrap_or_else(VirtualPath::root);
        let local_path = e
            .local_path
            .as_ref()
            .map(|p| p.to_string_lossy().into_owned());
        self.conn.execute(
            "INSERT INTO file_entries
               (virtual_path, parent_path, location, is_dirty, size, checksum, is_directory,
                created_at, modified_at, accessed_at, delete_phase, pending_external_delete,
                lock_state, local_path, synced_external_mtime)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)
             ON CONFLICT(virtual_path) DO UPDATE SET
               location = excluded.location,
               is_dirty = excluded.is_dirty,
               size = excluded.size,
               checksum = excluded.checksum,
               is_directory = excluded.is_directory,
               created_at = excluded.created_at,
               modified_at = excluded.modified_at,
               accessed_at = excluded.accessed_at,
               delete_phase = excluded.delete_phase,
               pending_external_delete = excluded.pending_external_delete,
               lock_state = excluded.lock_state,
               local_path = excluded.local_path,
               synced_external_mtime = excluded.synced_external_mtime",
            params![
                e.virtual_path.as_str(),
                parent.as_str(),
                e.location.as_str(),
                e.is_dirty,
                size_to_sql(e.size),
                e.checksum,
                e.is_directory,
                e.created_at.timestamp_millis(),
                e.modified_at.timestamp_millis(),
                e.accessed_at.timestamp_millis(),
                e.delete_phase.as_i64(),
                e.pending_external_delete,
                e.lock_state.as_str(),
                local_path,
                e.synced_external_mtime.map(|t| t.timestamp_millis()),
            ],
        )?;
        Ok(())
    }

    pub fn remove(&self, vp: &VirtualPath) -> VfsResult<bool> {
        Ok(self.conn.execute(
            "DELETE FROM file_entries WHERE virtual_path = ?1",
            params![vp.as_str()],
        )? > 0)
    }

    /// Every row strictly below `dir`, in path order.
    pub fn descendants(&self, dir: &VirtualPath) -> VfsResult<Vec<FileEntry>> {
        if dir.is_root() {
            return self.query_entries(
                &format!(
                    "SELECT {ENTRY_COLUMNS} FROM file_entries
                     WHERE virtual_path != '' ORDER BY virtual_path"
                ),
                params![],
            );
        }
        // '0' sorts immediately after '/', so this range is exactly the "dir/" prefix.
        let lo = format!("{}/", dir.as_str());
        let hi = format!("{}0", dir.as_str());
        self.query_entries(
            &format!(
                "SELECT {ENTRY_COLUMNS} FROM file_entries
                 WHERE virtual_path >= ?1 AND virtual_path < ?2 ORDER BY virtual_path"
            ),
            params![lo, hi],
        )
    }

    pub fn set_lock_state(&self, vp: &VirtualPath, state: LockState) -> VfsResult<()> {
        self.conn.execute(
            "UPDATE file_entries SET lock_state = ?2 WHERE virtual_path = ?1",
            params![vp.as_str(), state.as_str()],
        )?;
        Ok(())
    }

    pub fn tree_version(&self, root: RootKind) -> VfsResult<Option<TreeVersion>> {
        let raw: Option<(String, i64, i64, i64, String)> = self
            .conn
            .query_row(
                "SELECT token, last_scan_at, file_count, total_size, entries
                 FROM tree_versions WHERE root = ?1",
                params![root.as_str()],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?, row.get(4)?)),
            )
            .optional()?;
        let Some((token, last_scan_at, file_count, total_size, entries)) = raw else {
            return Ok(None);
        };
        let entries: BTreeMap<String, TreeEntry> = serde_json::from_str(&entries)?;
        Ok(Some(TreeVersion {
            root,
            token,
            last_scan_at: time_from_sql(last_scan_at)?,
            file_count: size_from_sql(file_count),
            total_size: size_from_sql(total_size),
            entries,
        }))
    }

    pub fn put_tree_version(&self, v: &TreeVersion) -> VfsResult<()> {
        let entries = serde_json::to_string(&v.entries)?;
        self.conn.execute(
            "INSERT INTO tree_versions (root, token, last_scan_at, file_count, total_size, entries)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(root) DO UPDATE SET
               token = excluded.token,
               last_scan_at = excluded.last_scan_at,
               file_count = excluded.file_count,
               total_size = excluded.total_size,
               entries = excluded.entries",
            params![
                v.root.as_str(),
                v.token,
                v.last_scan_at.timestamp_millis(),
                size_to_sql(v.file_count),
                size_to_sql(v.total_size),
                entries,
            ],
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entry::{DeletePhase, now};

    fn vp(s: &str) -> VirtualPath {
        VirtualPath::new(s).unwrap()
    }

    fn file(path: &str, location: Location, size: u64) -> FileEntry {
        FileEntry::new_file(vp(path), location, size, now())
    }

    #[test]
    fn upsert_then_get_returns_the_row() {
        let store = MetadataStore::in_memory().unwrap();
        let mut e = file("docs/a.txt", Location::LocalOnly, 12);
        e.is_dirty = true;
        e.checksum = Some("abc".into());
        store.upsert(&e).unwrap();
        assert_eq!(store.get(&vp("docs/a.txt")).unwrap(), Some(e));
        assert_eq!(store.get(&vp("docs/b.txt")).unwrap(), None);
    }

    #[test]
    fn failed_transaction_rolls_back() {
        let store = MetadataStore::in_memory().unwrap();
        let e = file("a", Location::LocalOnly, 1);
        let res: VfsResult<()> = store.transaction(|tx| {
            tx.upsert(&e)?;
            Err(VfsError::ReadOnly)
        });
        assert!(res.is_err());
        assert_eq!(store.get(&vp("a")).unwrap(), None);
    }

    #[test]
    fn children_and_descendants_respect_components() {
        let store = MetadataStore::in_memory().unwrap();
        for p in ["a", "a/x", "a/x/deep", "ab", "ab/y"] {
            store.upsert(&file(p, Location::LocalOnly, 0)).unwrap();
        }
        let kids: Vec<_> = store
            .children(&vp("a"))
            .unwrap()
            .into_iter()
            .map(|e| e.virtual_path.as_str().to_owned())
            .collect();
        assert_eq!(kids, vec!["a/x"]);
        let below: Vec<_> = store
            .descendants(&vp("a"))
            .unwrap()
            .into_iter()
            .map(|e| e.virtual_path.as_str().to_owned())
            .collect();
        assert_eq!(below, vec!["a/x", "a/x/deep"]);
    }

    #[test]
    fn local_usage_counts_only_local_bytes() {
        let store = MetadataStore::in_memory().unwrap();
        store.upsert(&file("l", Location::LocalOnly, 100)).unwrap();
        store.upsert(&file("b", Location::Both, 50)).unwrap();
        store.upsert(&file("e", Location::ExternalOnly, 1000)).unwrap();
        let mut gone = file("g", Location::Both, 7);
        gone.delete_phase = DeletePhase::LocalRemoved;
        store.upsert(&gone).unwrap();
        assert_eq!(store.local_usage().unwrap(), 150);
    }

    #[test]
    fn candidates_exclude_dirty_and_local_only() {
        let store = MetadataStore::in_memory().unwrap();
        let mut a = file("a", Location::Both, 1);
        a.accessed_at = DateTime::from_timestamp_millis(10).unwrap();
        let mut b = file("b", Location::Both, 1);
        b.accessed_at = DateTime::from_timestamp_millis(5).unwrap();
        let mut c = file("c", Location::LocalOnly, 1);
        c.accessed_at = DateTime::from_timestamp_millis(1).unwrap();
        c.is_dirty = true;
        let mut d = file("d", Location::Both, 1);
        d.is_dirty = true;
        for e in [&a, &b, &c, &d] {
            store.upsert(e).unwrap();
        }
        let order: Vec<_> = store
            .eviction_candidates(10)
            .unwrap()
            .into_iter()
            .map(|e| e.virtual_path.as_str().to_owned())
            .collect();
        assert_eq!(order, vec!["b", "a"]);
    }

    #[test]
    fn stale_locks_are_reset() {
        let store = MetadataStore::in_memory().unwrap();
        let mut e = file("a", Location::Both, 1);
        e.lock_state = LockState::SyncLocked;
        store.upsert(&e).unwrap();
        assert_eq!(store.reset_sync_locks().unwrap(), 1);
        assert_eq!(
            store.get(&vp("a")).unwrap().map(|e| e.lock_state),
            Some(LockState::Unlocked)
        );
    }

    #[test]
    fn conflicts_are_appended_and_resolved() {
        let store = MetadataStore::in_memory().unwrap();
        let path = vp("notes.txt");
        let t = now();
        let id = store
            .add_conflict(&NewConflict {
                virtual_path: &path,
                backup_name: "notes.txt.conflict-x",
                conflict_at: t,
                local_modified_at: t,
                external_modified_at: t,
            })
            .unwrap();
        assert_eq!(store.conflicts(false).unwrap().len(), 1);
        assert!(store.resolve_conflict(id).unwrap());
        assert!(store.conflicts(false).unwrap().is_empty());
        assert_eq!(store.conflicts(true).unwrap().len(), 1);
    }

    #[test]
    fn tree_versions_persist_entries() {
        let store = MetadataStore::in_memory().unwrap();
        let mut v = TreeVersion {
            root: RootKind::External,
            token: "t1".into(),
            last_scan_at: now(),
            file_count: 0,
            total_size: 0,
            entries: BTreeMap::new(),
        };
        v.entries.insert(
            "a.txt".into(),
            TreeEntry {
                size: 3,
                modified_at: now(),
                is_directory: false,
            },
        );
        v.refresh_totals();
        store.put_tree_version(&v).unwrap();
        assert_eq!(store.tree_version(RootKind::External).unwrap(), Some(v));
        assert_eq!(store.tree_version(RootKind::Local).unwrap(), None);
    }

    #[test]
    fn pending_deletes_come_deepest_first() {
        let store = MetadataStore::in_memory().unwrap();
        for p in ["d", "d/e", "d/e/f"] {
            let mut e = file(p, Location::ExternalOnly, 0);
            e.pending_external_delete = true;
            store.upsert(&e).unwrap();
        }
        let order: Vec<_> = store
            .pending_external_deletes()
            .unwrap()
            .into_iter()
            .map(|e| e.virtual_path.as_str().to_owned())
            .collect();
        assert_eq!(order, vec!["d/e/f", "d/e", "d"]);
    }
}
