//! Full walks of a backing root.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::entry::{TreeEntry, time_from_system};
use crate::roots::is_excluded;

/// Build a [`TreeEntry`] from filesystem metadata.
#[must_use]
pub fn tree_entry(meta: &std::fs::Metadata) -> TreeEntry {
    TreeEntry {
        size: if meta.is_dir() { 0 } else { meta.len() },
        modified_at: meta
            .modified()
            .map_or_else(|_| crate::entry::now(), time_from_system),
        is_directory: meta.is_dir(),
    }
}

/// Walk `root` and record every visible file and directory by relative path.
///
/// Symlinks and excluded names are skipped, as are names that are not valid UTF-8.
pub async fn scan_root(root: &Path) -> std::io::Result<BTreeMap<String, TreeEntry>> {
    let mut out = BTreeMap::new();
    let mut stack: Vec<(PathBuf, String)> = vec![(root.to_path_buf(), String::new())];

    while let Some((dir, prefix)) = stack.pop() {
        let mut entries = tokio::fs::read_dir(&dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let Ok(name) = entry.file_name().into_string() else {
                warn!(dir = %dir.display(), "skipping name that is not valid UTF-8");
                continue;
            };
            if is_excluded(&name) {
                continue;
            }
            let meta = match entry.metadata().await {
                Ok(meta) => meta,
                Err(e) => {
                    warn!(path = %entry.path().display(), error = %e, "skipping unreadable entry");
                    continue;
                }
            };
            if meta.file_type().is_symlink() {
                continue;
            }
            let rel = if prefix.is_empty() {
                name
            } else {
                format!("{prefix}/{name}")
            };
            if meta.is_dir() {
                stack.push((entry.path(), rel.clone()));
            }
            out.insert(rel, tree_entry(&meta));
        }
    }

    debug!(root = %root.display(), entries = out.len(), "scanned root");
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::roots::TREE_DESCRIPTOR_NAME;

    #[tokio::test]
    async fn scan_skips_excluded_and_records_nested() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        tokio::fs::create_dir_all(root.join("docs/2024")).await.unwrap();
        tokio::fs::write(root.join("docs/2024/report.pdf"), b"12345").await.unwrap();
        tokio::fs::write(root.join(".DS_Store"), b"x").await.unwrap();
        tokio::fs::write(root.join(TREE_DESCRIPTOR_NAME), b"{}").await.unwrap();
        tokio::fs::write(root.join("docs/._report.pdf"), b"x").await.unwrap();

        let scan = scan_root(root).await.unwrap();
        let keys: Vec<_> = scan.keys().map(String::as_str).collect();
        assert_eq!(keys, vec!["docs", "docs/2024", "docs/2024/report.pdf"]);
        assert!(scan["docs"].is_directory);
        assert_eq!(scan["docs/2024/report.pdf"].size, 5);
    }
}
