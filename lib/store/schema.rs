//! Table layout and row decoding.

use std::path::PathBuf;

use chrono::{DateTime, Utc};

use crate::entry::{ConflictRecord, DeletePhase, FileEntry, Location, LockState};
use crate::error::{VfsError, VfsResult};
use crate::path::VirtualPath;

pub(super) const SCHEMA: &str = r"
CREATE TABLE IF NOT EXISTS file_entries (
    virtual_path TEXT PRIMARY KEY,
    parent_path TEXT NOT NULL,
    location TEXT NOT NULL,
    is_dirty INTEGER NOT NULL,
    size INTEGER NOT NULL,
    checksum TEXT,
    is_directory INTEGER NOT NULL,
    created_at INTEGER NOT NULL,
    modified_at INTEGER NOT NULL,
    accessed_at INTEGER NOT NULL,
    delete_phase INTEGER NOT NULL DEFAULT 0,
    pending_external_delete INTEGER NOT NULL DEFAULT 0,
    lock_state TEXT NOT NULL DEFAULT 'unlocked',
    local_path TEXT,
    synced_external_mtime INTEGER
);
CREATE INDEX IF NOT EXISTS idx_entries_parent ON file_entries(parent_path);
CREATE INDEX IF NOT EXISTS idx_entries_lru ON file_entries(location, is_dirty, accessed_at);

CREATE TABLE IF NOT EXISTS tree_versions (
    root TEXT PRIMARY KEY,
    token TEXT NOT NULL,
    last_scan_at INTEGER NOT NULL,
    file_count INTEGER NOT NULL,
    total_size INTEGER NOT NULL,
    entries TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS conflicts (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    virtual_path TEXT NOT NULL,
    backup_name TEXT NOT NULL,
    conflict_at INTEGER NOT NULL,
    local_modified_at INTEGER NOT NULL,
    external_modified_at INTEGER NOT NULL,
    resolved INTEGER NOT NULL DEFAULT 0
);
";

pub(super) const ENTRY_COLUMNS: &str = "virtual_path, location, is_dirty, size, checksum, \
    is_directory, created_at, modified_at, accessed_at, delete_phase, pending_external_delete, \
    lock_state, local_path, synced_external_mtime";

pub(super) const CONFLICT_COLUMNS: &str = "id, virtual_path, backup_name, conflict_at, \
    local_modified_at, external_modified_at, resolved";

/// Sizes are stored as SQLite integers.
pub(super) fn size_to_sql(n: u64) -> i64 {
    i64::try_from(n).unwrap_or(i64::MAX)
}

pub(super) fn size_from_sql(n: i64) -> u64 {
    u64::try_from(n).unwrap_or(0)
}

pub(super) fn time_from_sql(ms: i64) -> VfsResult<DateTime<Utc>> {
    DateTime::from_timestamp_millis(ms)
        .ok_or_else(|| VfsError::MetadataCorrupted(format!("timestamp out of range: {ms}")))
}

/// A `file_entries` row before validation.
pub(super) struct RawEntry {
    virtual_path: String,
    location: String,
    is_dirty: bool,
    size: i64,
    checksum: Option<String>,
    is_directory: bool,
    created_at: i64,
    modified_at: i64,
    accessed_at: i64,
    delete_phase: i64,
    pending_external_delete: bool,
    lock_state: String,
    local_path: Option<String>,
    synced_external_mtime: Option<i64>,
}

impl RawEntry {
    /// Column order matches [`ENTRY_COLUMNS`].
    pub(super) fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            virtual_path: row.get(0)?,
            location: row.get(1)?,
            is_dirty: row.get(2)?,
            size: row.get(3)?,
            checksum: row.get(4)?,
            is_directory: row.get(5)?,
            created_at: row.get(6)?,
            modified_at: row.get(7)?,
            accessed_at: row.get(8)?,
            delete_phase: row.get(9)?,
            pending_external_delete: row.get(10)?,
            lock_state: row.get(11)?,
            local_path: row.get(12)?,
            synced_external_mtime: row.get(13)?,
        })
    }

    pub(super) fn into_entry(self) -> VfsResult<FileEntry> {
        let corrupted = |what: &str, value: &str| {
            VfsError::MetadataCorrupted(format!("bad {what} '{value}' for {}", self.virtual_path))
        };
        let location =
            Location::parse(&self.location).ok_or_else(|| corrupted("location", &self.location))?;
        let lock_state = LockState::parse(&self.lock_state)
            .ok_or_else(|| corrupted("lock state", &self.lock_state))?;
        let delete_phase = DeletePhase::from_i64(self.delete_phase)
            .ok_or_else(|| corrupted("delete phase", &self.delete_phase.to_string()))?;
        let synced_external_mtime = self.synced_external_mtime.map(time_from_sql).transpose()?;

        Ok(FileEntry {
            virtual_path: VirtualPath::new(&self.virtual_path)?,
            location,
            is_dirty: self.is_dirty,
            size: size_from_sql(self.size),
            checksum: self.checksum,
            is_directory: self.is_directory,
            created_at: time_from_sql(self.created_at)?,
            modified_at: time_from_sql(self.modified_at)?,
            accessed_at: time_from_sql(self.accessed_at)?,
            delete_phase,
            pending_external_delete: self.pending_external_delete,
            lock_state,
            local_path: self.local_path.map(PathBuf::from),
            synced_external_mtime,
        })
    }
}

pub(super) struct RawConflict {
    id: i64,
    virtual_path: String,
    backup_name: String,
    conflict_at: i64,
    local_modified_at: i64,
    external_modified_at: i64,
    resolved: bool,
}

impl RawConflict {
    pub(super) fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            virtual_path: row.get(1)?,
            backup_name: row.get(2)?,
            conflict_at: row.get(3)?,
            local_modified_at: row.get(4)?,
            external_modified_at: row.get(5)?,
            resolved: row.get(6)?,
        })
    }

    pub(super) fn into_record(self) -> VfsResult<ConflictRecord> {
        Ok(ConflictRecord {
            id: self.id,
            virtual_path: VirtualPath::new(&self.virtual_path)?,
            backup_name: self.backup_name,
            conflict_at: time_from_sql(self.conflict_at)?,
            local_modified_at: time_from_sql(self.local_modified_at)?,
            external_modified_at: time_from_sql(self.external_modified_at)?,
            resolved: self.resolved,
        })
    }
}
