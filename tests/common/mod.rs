#![allow(dead_code, missing_docs, clippy::unwrap_used)]

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;

use tierfs::path::VirtualPath;
use tierfs::vfs::{InitReport, PairConfig, TierFs};

pub fn vp(s: &str) -> VirtualPath {
    VirtualPath::new(s).unwrap()
}

/// A pair of backing roots and a database in one temporary directory.
pub struct Fixture {
    pub dir: TempDir,
    pub config: PairConfig,
}

impl Fixture {
    pub fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let local = dir.path().join("local");
        let external = dir.path().join("external");
        std::fs::create_dir_all(&local).unwrap();
        std::fs::create_dir_all(&external).unwrap();
        let mut config = PairConfig::new(
            "test",
            local,
            external,
            dir.path().join("state").join("test.sqlite"),
        );
        // Long enough that nothing syncs unless a test asks for it.
        config.sync_debounce = Duration::from_secs(30);
        Self { dir, config }
    }

    pub fn local(&self) -> &Path {
        &self.config.local_root
    }

    pub fn external(&self) -> &Path {
        &self.config.external_root
    }

    pub fn local_file(&self, rel: &str) -> PathBuf {
        self.local().join(rel)
    }

    pub fn external_file(&self, rel: &str) -> PathBuf {
        self.external().join(rel)
    }

    pub fn put_external(&self, rel: &str, data: &[u8]) {
        let path = self.external_file(rel);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, data).unwrap();
    }

    /// Open the pair without initializing it.
    pub async fn open(&self) -> Arc<TierFs> {
        TierFs::open(self.config.clone()).await.unwrap()
    }

    /// Open and initialize the pair.
    pub async fn start(&self) -> (Arc<TierFs>, InitReport) {
        let fs = self.open().await;
        let report = fs.initialize().await.unwrap();
        (fs, report)
    }
}
