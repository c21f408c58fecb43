//! The two backing roots of a sync pair and the names the Mount View never shows.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

use tracing::info;

use crate::path::VirtualPath;

/// Sidecar descriptor recording the tree version of a root.
pub const TREE_DESCRIPTOR_NAME: &str = ".tierfs-tree.json";

/// Suffix of copies that have not been renamed into place yet.
pub const PARTIAL_SUFFIX: &str = ".tierfs-partial";

/// Infix of the backup names written by conflict resolution.
pub const CONFLICT_MARKER: &str = ".conflict-";

/// OS metadata files that are never surfaced or synced.
const EXCLUDED_NAMES: [&str; 6] = [
    ".DS_Store",
    ".Spotlight-V100",
    ".Trashes",
    ".fseventsd",
    ".TemporaryItems",
    ".FUSE",
];

/// Whether a directory entry name is hidden from the Mount View.
#[must_use]
pub fn is_excluded(name: &str) -> bool {
    EXCLUDED_NAMES.contains(&name)
        || name.starts_with("._")
        || name == TREE_DESCRIPTOR_NAME
        || name.ends_with(PARTIAL_SUFFIX)
        || name.contains(CONFLICT_MARKER)
}

/// Whether any component of the path is hidden.
#[must_use]
pub fn is_excluded_path(vp: &VirtualPath) -> bool {
    vp.as_str().split('/').any(is_excluded)
}

/// The local cache root, the external root, and the external availability flag.
#[derive(Debug)]
pub struct BackingRoots {
    local: PathBuf,
    external: PathBuf,
    online: AtomicBool,
}

impl BackingRoots {
    /// The external store starts online if its root is present.
    #[must_use]
    pub fn new(local: PathBuf, external: PathBuf) -> Self {
        let online = external.is_dir();
        Self {
            local,
            external,
            online: AtomicBool::new(online),
        }
    }

    #[must_use]
    pub fn local_root(&self) -> &Path {
        &self.local
    }

    #[must_use]
    pub fn external_root(&self) -> &Path {
        &self.external
    }

    #[must_use]
    pub fn local_path(&self, vp: &VirtualPath) -> PathBuf {
        self.local.join(vp.as_relative())
    }

    #[must_use]
    pub fn external_path(&self, vp: &VirtualPath) -> PathBuf {
        self.external.join(vp.as_relative())
    }

    /// Reachable means the last availability event said so and the root is still mounted.
    #[must_use]
    pub fn is_external_online(&self) -> bool {
        self.online.load(Ordering::Acquire) && self.external.is_dir()
    }

    /// Record an availability event. Returns the previous flag.
    pub fn set_external_online(&self, online: bool) -> bool {
        let prev = self.online.swap(online, Ordering::AcqRel);
        if prev != online {
            info!(online, root = %self.external.display(), "external store availability changed");
        }
        prev
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn os_metadata_is_excluded() {
        assert!(is_excluded(".DS_Store"));
        assert!(is_excluded("._report.pdf"));
        assert!(is_excluded(".Trashes"));
        assert!(!is_excluded("report.pdf"));
        assert!(!is_excluded(".bashrc"));
    }

    #[test]
    fn internal_files_are_excluded() {
        assert!(is_excluded(TREE_DESCRIPTOR_NAME));
        assert!(is_excluded("movie.mp4.tierfs-partial"));
        assert!(is_excluded("notes.txt.conflict-20240101T000000000Z"));
    }

    #[test]
    fn excluded_component_hides_the_whole_path() {
        let vp = VirtualPath::new(".Trashes/501/file").unwrap();
        assert!(is_excluded_path(&vp));
    }

    #[test]
    fn missing_external_root_is_offline() {
        let roots = BackingRoots::new(
            PathBuf::from("/nonexistent/local"),
            PathBuf::from("/nonexistent/external"),
        );
        assert!(!roots.is_external_online());
        roots.set_external_online(true);
        assert!(!roots.is_external_online());
    }
}
