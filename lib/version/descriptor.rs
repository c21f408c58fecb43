//! The sidecar descriptor written at the top of each backing root.

use std::collections::BTreeMap;
use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt as _;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::entry::{TreeEntry, TreeVersion};
use crate::roots::{PARTIAL_SUFFIX, TREE_DESCRIPTOR_NAME};

pub const DESCRIPTOR_VERSION: u32 = 1;
pub const DESCRIPTOR_FORMAT: &str = "tierfs-tree";

/// On-disk JSON form of a [`TreeVersion`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TreeDescriptor {
    pub version: u32,
    pub format: String,
    /// `"local"` or `"external"`.
    pub source: String,
    pub tree_version: String,
    pub last_scan_at: DateTime<Utc>,
    pub file_count: u64,
    pub total_size: u64,
    pub entries: BTreeMap<String, TreeEntry>,
}

impl From<&TreeVersion> for TreeDescriptor {
    fn from(v: &TreeVersion) -> Self {
        Self {
            version: DESCRIPTOR_VERSION,
            format: DESCRIPTOR_FORMAT.to_owned(),
            source: v.root.as_str().to_owned(),
            tree_version: v.token.clone(),
            last_scan_at: v.last_scan_at,
            file_count: v.file_count,
            total_size: v.total_size,
            entries: v.entries.clone(),
        }
    }
}

/// A fresh opaque token: a timestamp plus a random suffix.
#[must_use]
pub fn new_token(now: DateTime<Utc>) -> String {
    format!(
        "{}-{}",
        now.format("%Y%m%dT%H%M%S%3fZ"),
        Uuid::new_v4().simple()
    )
}

/// Read the descriptor of `root`. Missing or unreadable descriptors yield `None`.
pub async fn read(root: &Path) -> Option<TreeDescriptor> {
    let path = root.join(TREE_DESCRIPTOR_NAME);
    let raw = match tokio::fs::read(&path).await {
        Ok(raw) => raw,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            debug!(path = %path.display(), "no tree descriptor");
            return None;
        }
        Err(e) => {
            warn!(path = %path.display(), error = %e, "failed to read tree descriptor");
            return None;
        }
    };
    match serde_json::from_slice::<TreeDescriptor>(&raw) {
        Ok(d) if d.version == DESCRIPTOR_VERSION && d.format == DESCRIPTOR_FORMAT => Some(d),
        Ok(d) => {
            warn!(version = d.version, format = %d.format, "unsupported tree descriptor");
            None
        }
        Err(e) => {
            warn!(path = %path.display(), error = %e, "malformed tree descriptor");
            None
        }
    }
}

/// Atomically replace the descriptor of `root`.
pub async fn write(root: &Path, descriptor: &TreeDescriptor) -> std::io::Result<()> {
    let path = root.join(TREE_DESCRIPTOR_NAME);
    let tmp = root.join(format!("{TREE_DESCRIPTOR_NAME}{PARTIAL_SUFFIX}"));
    let body = serde_json::to_vec_pretty(descriptor).map_err(std::io::Error::other)?;
    let mut file = tokio::fs::File::create(&tmp).await?;
    file.write_all(&body).await?;
    file.sync_all().await?;
    drop(file);
    tokio::fs::rename(&tmp, &path).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entry::{RootKind, now};

    #[test]
    fn tokens_are_unique() {
        let t = now();
        assert_ne!(new_token(t), new_token(t));
    }

    #[test]
    fn json_uses_camel_case_keys() {
        let mut v = TreeVersion {
            root: RootKind::Local,
            token: "tok".into(),
            last_scan_at: now(),
            file_count: 0,
            total_size: 0,
            entries: BTreeMap::new(),
        };
        v.entries.insert(
            "a/b.txt".into(),
            TreeEntry {
                size: 4,
                modified_at: now(),
                is_directory: false,
            },
        );
        v.refresh_totals();
        let json = serde_json::to_value(TreeDescriptor::from(&v)).unwrap();
        assert_eq!(json["source"], "local");
        assert_eq!(json["treeVersion"], "tok");
        assert_eq!(json["fileCount"], 1);
        assert_eq!(json["totalSize"], 4);
        assert_eq!(json["entries"]["a/b.txt"]["isDirectory"], false);
        assert!(json["lastScanAt"].is_string());
    }

    #[tokio::test]
    async fn write_then_read() {
        let dir = tempfile::tempdir().unwrap();
        let v = TreeVersion {
            root: RootKind::External,
            token: new_token(now()),
            last_scan_at: now(),
            file_count: 0,
            total_size: 0,
            entries: BTreeMap::new(),
        };
        let d = TreeDescriptor::from(&v);
        write(dir.path(), &d).await.unwrap();
        assert_eq!(read(dir.path()).await, Some(d));
    }

    #[tokio::test]
    async fn garbage_reads_as_missing() {
        let dir = tempfile::tempdir().unwrap();
        tokio::fs::write(dir.path().join(TREE_DESCRIPTOR_NAME), b"{not json")
            .await
            .unwrap();
        assert_eq!(read(dir.path()).await, None);
    }
}
