//! Detecting external edits made since the last sync, and keeping them as backups.
//!
//! Local always wins. When both sides moved past the baseline, the external file is renamed to
//! `<name>.conflict-<timestamp>` next to the original and the local bytes replace it. The backup
//! is hidden from the Mount View and recorded in the conflict log.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use tracing::warn;

use crate::entry::{FileEntry, time_from_system};
use crate::io::{same_contents, stat};
use crate::roots::CONFLICT_MARKER;

/// How the external side looks relative to the synced baseline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExternalState {
    /// Nothing there; a plain copy.
    Absent,
    /// Not touched since our last sync.
    Unchanged,
    /// Already holds exactly the local bytes; adopt it without copying.
    Identical { modified_at: DateTime<Utc> },
    /// Changed behind our back, or an unknown copy we never synced.
    Diverged { modified_at: DateTime<Utc> },
}

/// Compare the external copy at `external` with the row's baseline.
pub async fn inspect(
    row: &FileEntry,
    local: &Path,
    external: &Path,
) -> std::io::Result<ExternalState> {
    let Some(meta) = stat(external).await? else {
        return Ok(ExternalState::Absent);
    };
    let modified_at = time_from_system(meta.modified()?);
    if meta.is_dir() {
        return Ok(ExternalState::Diverged { modified_at });
    }
    match row.synced_external_mtime {
        Some(baseline) if modified_at <= baseline => Ok(ExternalState::Unchanged),
        Some(_) => Ok(ExternalState::Diverged { modified_at }),
        None => match same_contents(local, external).await {
            Ok(true) => Ok(ExternalState::Identical { modified_at }),
            Ok(false) => Ok(ExternalState::Diverged { modified_at }),
            Err(e) => {
                warn!(path = %external.display(), error = %e, "could not compare copies");
                Ok(ExternalState::Diverged { modified_at })
            }
        },
    }
}

/// `<name>.conflict-<timestamp>`.
#[must_use]
pub fn backup_name(name: &str, at: DateTime<Utc>) -> String {
    format!("{name}{CONFLICT_MARKER}{}", at.format("%Y%m%dT%H%M%S%3fZ"))
}

/// Move the external file at `external` out of the way. Returns the backup's file name.
pub async fn move_aside(external: &Path, at: DateTime<Utc>) -> std::io::Result<String> {
    let name = external
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| std::io::Error::other("external path has no usable file name"))?;
    let base = backup_name(name, at);
    let mut candidate = base.clone();
    let mut n = 1;
    while stat(&sibling(external, &candidate)).await?.is_some() {
        candidate = format!("{base}-{n}");
        n += 1;
    }
    tokio::fs::rename(external, sibling(external, &candidate)).await?;
    Ok(candidate)
}

fn sibling(path: &Path, name: &str) -> PathBuf {
    path.with_file_name(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entry::{Location, now};
    use crate::path::VirtualPath;
    use crate::roots::is_excluded;

    fn row(baseline: Option<DateTime<Utc>>) -> FileEntry {
        let mut r = FileEntry::new_file(
            VirtualPath::new("f.txt").unwrap(),
            Location::LocalOnly,
            1,
            now(),
        );
        r.synced_external_mtime = baseline;
        r
    }

    #[test]
    fn backups_are_hidden_names() {
        let at = DateTime::from_timestamp_millis(1_700_000_000_123).unwrap();
        let name = backup_name("notes.txt", at);
        assert_eq!(name, "notes.txt.conflict-20231114T221320123Z");
        assert!(is_excluded(&name));
    }

    #[tokio::test]
    async fn baseline_decides_between_unchanged_and_diverged() {
        let dir = tempfile::tempdir().unwrap();
        let (local, external) = (dir.path().join("l"), dir.path().join("x"));
        std::fs::write(&local, b"mine").unwrap();
        assert_eq!(
            inspect(&row(None), &local, &external).await.unwrap(),
            ExternalState::Absent
        );

        std::fs::write(&external, b"theirs").unwrap();
        let mtime = time_from_system(std::fs::metadata(&external).unwrap().modified().unwrap());
        assert_eq!(
            inspect(&row(Some(mtime)), &local, &external).await.unwrap(),
            ExternalState::Unchanged
        );
        let stale = mtime - chrono::Duration::seconds(10);
        assert!(matches!(
            inspect(&row(Some(stale)), &local, &external).await.unwrap(),
            ExternalState::Diverged { .. }
        ));
        assert!(matches!(
            inspect(&row(None), &local, &external).await.unwrap(),
            ExternalState::Diverged { .. }
        ));

        std::fs::write(&external, b"mine").unwrap();
        assert!(matches!(
            inspect(&row(None), &local, &external).await.unwrap(),
            ExternalState::Identical { .. }
        ));
    }

    #[tokio::test]
    async fn move_aside_never_overwrites_an_earlier_backup() {
        let dir = tempfile::tempdir().unwrap();
        let external = dir.path().join("f.txt");
        let at = now();
        std::fs::write(&external, b"one").unwrap();
        let first = move_aside(&external, at).await.unwrap();
        std::fs::write(&external, b"two").unwrap();
        let second = move_aside(&external, at).await.unwrap();
        assert_ne!(first, second);
        assert_eq!(std::fs::read(dir.path().join(&first)).unwrap(), b"one");
        assert_eq!(std::fs::read(dir.path().join(&second)).unwrap(), b"two");
        assert!(!external.exists());
    }
}
