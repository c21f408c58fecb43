//! Rows of the metadata index: file entries and conflict records.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::SystemTime;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::path::VirtualPath;

/// Where the bytes of a path currently live.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Location {
    /// Known path with no bytes anywhere.
    NotExists,
    LocalOnly,
    ExternalOnly,
    Both,
    /// Discovered missing from the external store with no local copy. Answers every operation
    /// with not-found until the user deletes it.
    Deleted,
}

impl Location {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::NotExists => "not-exists",
            Self::LocalOnly => "local-only",
            Self::ExternalOnly => "external-only",
            Self::Both => "both",
            Self::Deleted => "deleted",
        }
    }

    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "not-exists" => Some(Self::NotExists),
            "local-only" => Some(Self::LocalOnly),
            "external-only" => Some(Self::ExternalOnly),
            "both" => Some(Self::Both),
            "deleted" => Some(Self::Deleted),
            _ => None,
        }
    }

    /// Whether local bytes exist in this state.
    #[must_use]
    pub fn has_local(self) -> bool {
        matches!(self, Self::LocalOnly | Self::Both)
    }

    /// Whether the external store holds a copy in this state.
    #[must_use]
    pub fn has_external(self) -> bool {
        matches!(self, Self::ExternalOnly | Self::Both)
    }

    /// Derive the location from physical presence on each side.
    #[must_use]
    pub fn from_presence(local: bool, external: bool) -> Self {
        match (local, external) {
            (true, true) => Self::Both,
            (true, false) => Self::LocalOnly,
            (false, true) => Self::ExternalOnly,
            (false, false) => Self::NotExists,
        }
    }
}

/// Progress of the three-phase delete. Recovery resumes from the last committed phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DeletePhase {
    None,
    IntentRecorded,
    LocalRemoved,
    Complete,
}

impl DeletePhase {
    #[must_use]
    pub fn as_i64(self) -> i64 {
        match self {
            Self::None => 0,
            Self::IntentRecorded => 1,
            Self::LocalRemoved => 2,
            Self::Complete => 3,
        }
    }

    #[must_use]
    pub fn from_i64(v: i64) -> Option<Self> {
        match v {
            0 => Some(Self::None),
            1 => Some(Self::IntentRecorded),
            2 => Some(Self::LocalRemoved),
            3 => Some(Self::Complete),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum LockState {
    Unlocked,
    /// A sync or an eviction is copying this path.
    SyncLocked,
}

impl LockState {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Unlocked => "unlocked",
            Self::SyncLocked => "sync-locked",
        }
    }

    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "unlocked" => Some(Self::Unlocked),
            "sync-locked" => Some(Self::SyncLocked),
            _ => None,
        }
    }
}

/// One row per known virtual path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileEntry {
    pub virtual_path: VirtualPath,
    pub location: Location,
    /// Local content has not been confirmed present in the external store.
    pub is_dirty: bool,
    pub size: u64,
    /// BLAKE3 hex digest of the last verified copy.
    pub checksum: Option<String>,
    pub is_directory: bool,
    pub created_at: DateTime<Utc>,
    pub modified_at: DateTime<Utc>,
    /// Drives eviction order.
    pub accessed_at: DateTime<Utc>,
    pub delete_phase: DeletePhase,
    /// The external store was offline when this path was deleted.
    pub pending_external_delete: bool,
    pub lock_state: LockState,
    /// Physical local path while local bytes exist.
    pub local_path: Option<PathBuf>,
    /// The external copy's mtime right after the last successful sync.
    pub synced_external_mtime: Option<DateTime<Utc>>,
}

impl FileEntry {
    /// A fresh file row with all timestamps set to `now`.
    #[must_use]
    pub fn new_file(virtual_path: VirtualPath, location: Location, size: u64, now: DateTime<Utc>) -> Self {
        Self {
            virtual_path,
            location,
            is_dirty: false,
            size,
            checksum: None,
            is_directory: false,
            created_at: now,
            modified_at: now,
            accessed_at: now,
            delete_phase: DeletePhase::None,
            pending_external_delete: false,
            lock_state: LockState::Unlocked,
            local_path: None,
            synced_external_mtime: None,
        }
    }

    /// A fresh directory row.
    #[must_use]
    pub fn new_directory(virtual_path: VirtualPath, location: Location, now: DateTime<Utc>) -> Self {
        Self {
            is_directory: true,
            ..Self::new_file(virtual_path, location, 0, now)
        }
    }

    /// Partially deleted rows. These never appear in the Mount View.
    #[must_use]
    pub fn is_tombstone(&self) -> bool {
        self.delete_phase != DeletePhase::None || self.pending_external_delete
    }

    /// Whether the path answers to the Mount View at all.
    #[must_use]
    pub fn is_visible(&self) -> bool {
        !self.is_tombstone() && !matches!(self.location, Location::Deleted | Location::NotExists)
    }

    /// Fully synced, unlocked files that may give up their local bytes.
    #[must_use]
    pub fn is_eviction_candidate(&self) -> bool {
        self.location == Location::Both
            && !self.is_dirty
            && self.lock_state == LockState::Unlocked
            && !self.is_directory
            && self.delete_phase == DeletePhase::None
            && !self.pending_external_delete
    }

    /// Bytes this row occupies in the local cache.
    #[must_use]
    pub fn local_bytes(&self) -> u64 {
        if self.location.has_local() && !self.is_directory && self.delete_phase < DeletePhase::LocalRemoved {
            self.size
        } else {
            0
        }
    }
}

/// An append-only record of a sync that overwrote an independently modified external file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConflictRecord {
    pub id: i64,
    pub virtual_path: VirtualPath,
    /// Name of the backup file next to the original on the external store.
    pub backup_name: String,
    pub conflict_at: DateTime<Utc>,
    pub local_modified_at: DateTime<Utc>,
    pub external_modified_at: DateTime<Utc>,
    pub resolved: bool,
}

/// One of the two backing roots of a sync pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RootKind {
    Local,
    External,
}

impl RootKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Local => "local",
            Self::External => "external",
        }
    }

    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "local" => Some(Self::Local),
            "external" => Some(Self::External),
            _ => None,
        }
    }
}

/// Per-path record inside a tree version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TreeEntry {
    pub size: u64,
    pub modified_at: DateTime<Utc>,
    pub is_directory: bool,
}

/// The last known state of one backing root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TreeVersion {
    pub root: RootKind,
    /// Opaque token; a mismatch against the sidecar descriptor forces a rescan.
    pub token: String,
    pub last_scan_at: DateTime<Utc>,
    pub file_count: u64,
    pub total_size: u64,
    /// Keyed by relative path.
    pub entries: BTreeMap<String, TreeEntry>,
}

impl TreeVersion {
    /// Recompute `file_count` and `total_size` from `entries`.
    pub fn refresh_totals(&mut self) {
        self.file_count = self.entries.values().filter(|e| !e.is_directory).count() as u64;
        self.total_size = self
            .entries
            .values()
            .filter(|e| !e.is_directory)
            .map(|e| e.size)
            .sum();
    }
}

/// Convert a filesystem timestamp, truncated to the millisecond precision the store keeps.
#[must_use]
pub fn time_from_system(t: SystemTime) -> DateTime<Utc> {
    let dt = DateTime::<Utc>::from(t);
    DateTime::from_timestamp_millis(dt.timestamp_millis()).unwrap_or(dt)
}

/// `Utc::now()` truncated to millisecond precision.
#[must_use]
pub fn now() -> DateTime<Utc> {
    time_from_system(SystemTime::now())
}
