//! The control surface: typed requests against the configured sync pairs.
//!
//! Transport is somebody else's problem. Requests and responses are serde-tagged so any framing
//! (a socket, a CLI, a test) can carry them as JSON.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{info, instrument, warn};

use crate::entry::{ConflictRecord, FileEntry};
use crate::error::VfsError;
use crate::path::VirtualPath;
use crate::sync::SyncOutcome;
use crate::vfs::{InitReport, PairConfig, PairStatus, TierFs};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ControlRequest {
    Mount { pair: String },
    Unmount { pair: String },
    Status { pair: String, path: Option<String> },
    ForceSync { pair: String, path: String },
    EvictionCandidates { pair: String, limit: usize },
    PendingConflicts { pair: String },
    ResolveConflict { pair: String, id: i64 },
    SetExternalOnline { pair: String, online: bool },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ControlResponse {
    Mounted { pair: String, report: InitReport },
    Unmounted { pair: String },
    Status { status: PairStatus, entry: Option<FileEntry> },
    Synced { path: String, outcome: SyncOutcome },
    Candidates { entries: Vec<FileEntry> },
    Conflicts { records: Vec<ConflictRecord> },
    ConflictResolved { id: i64, found: bool },
    Availability { pair: String, online: bool },
    Error { kind: ControlErrorKind, message: String },
}

/// Machine-readable error classes for [`ControlResponse::Error`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ControlErrorKind {
    UnknownPair,
    AlreadyMounted,
    NotMounted,
    MountFailed,
    NotFound,
    Busy,
    ExternalOffline,
    InvalidRequest,
    Internal,
}

#[derive(Debug, Error)]
pub enum ControlError {
    #[error("unknown sync pair: {0}")]
    UnknownPair(String),

    #[error("sync pair is already mounted: {0}")]
    AlreadyMounted(String),

    #[error("sync pair is not mounted: {0}")]
    NotMounted(String),

    #[error("mount failed: {0}")]
    Mount(#[source] std::io::Error),

    #[error(transparent)]
    Vfs(#[from] VfsError),
}

impl ControlError {
    #[must_use]
    pub fn kind(&self) -> ControlErrorKind {
        match self {
            Self::UnknownPair(_) => ControlErrorKind::UnknownPair,
            Self::AlreadyMounted(_) => ControlErrorKind::AlreadyMounted,
            Self::NotMounted(_) => ControlErrorKind::NotMounted,
            Self::Mount(_) => ControlErrorKind::MountFailed,
            Self::Vfs(e) => match e {
                VfsError::NotFound(_) => ControlErrorKind::NotFound,
                VfsError::FileBusy(_) | VfsError::IndexNotReady => ControlErrorKind::Busy,
                VfsError::ExternalOffline => ControlErrorKind::ExternalOffline,
                VfsError::InvalidPath(_) => ControlErrorKind::InvalidRequest,
                VfsError::PermissionDenied(_)
                | VfsError::InsufficientSpace { .. }
                | VfsError::ChecksumMismatch { .. }
                | VfsError::WriteFailed { .. }
                | VfsError::MetadataCorrupted(_)
                | VfsError::ReadOnly
                | VfsError::NotADirectory(_)
                | VfsError::IsADirectory(_)
                | VfsError::NotEmpty(_)
                | VfsError::AlreadyExists(_)
                | VfsError::Io(_) => ControlErrorKind::Internal,
            },
        }
    }
}

/// Attaches a sync pair to the kernel. The daemon implements it with FUSE; tests with nothing.
pub trait MountDriver: Send + Sync {
    fn mount(&self, pair: &str, fs: Arc<TierFs>) -> Result<(), ControlError>;
    fn unmount(&self, pair: &str) -> Result<(), ControlError>;
}

/// Serves [`ControlRequest`]s for a fixed set of configured pairs.
pub struct Controller<D: MountDriver> {
    pairs: BTreeMap<String, PairConfig>,
    mounted: Mutex<BTreeMap<String, Arc<TierFs>>>,
    driver: D,
}

impl<D: MountDriver> Controller<D> {
    pub fn new(pairs: impl IntoIterator<Item = PairConfig>, driver: D) -> Self {
        Self {
            pairs: pairs.into_iter().map(|p| (p.name.clone(), p)).collect(),
            mounted: Mutex::new(BTreeMap::new()),
            driver,
        }
    }

    /// Names of every configured pair.
    pub fn pair_names(&self) -> impl Iterator<Item = &str> {
        self.pairs.keys().map(String::as_str)
    }

    /// A mounted pair.
    pub async fn pair(&self, name: &str) -> Result<Arc<TierFs>, ControlError> {
        if !self.pairs.contains_key(name) {
            return Err(ControlError::UnknownPair(name.to_owned()));
        }
        self.mounted
            .lock()
            .await
            .get(name)
            .cloned()
            .ok_or_else(|| ControlError::NotMounted(name.to_owned()))
    }

    /// Every mounted pair.
    pub async fn mounted(&self) -> Vec<Arc<TierFs>> {
        self.mounted.lock().await.values().cloned().collect()
    }

    /// Answer one request. Failures come back as [`ControlResponse::Error`].
    pub async fn handle(&self, request: ControlRequest) -> ControlResponse {
        match self.dispatch(request).await {
            Ok(response) => response,
            Err(e) => {
                warn!(error = %e, "control request failed");
                ControlResponse::Error {
                    kind: e.kind(),
                    message: e.to_string(),
                }
            }
        }
    }

    #[instrument(name = "Controller::dispatch", skip(self))]
    async fn dispatch(&self, request: ControlRequest) -> Result<ControlResponse, ControlError> {
        match request {
            ControlRequest::Mount { pair } => {
                let report = self.mount(&pair).await?;
                Ok(ControlResponse::Mounted { pair, report })
            }
            ControlRequest::Unmount { pair } => {
                self.unmount(&pair).await?;
                Ok(ControlResponse::Unmounted { pair })
            }
            ControlRequest::Status { pair, path } => {
                let fs = self.pair(&pair).await?;
                let entry = match path {
                    Some(p) => fs.path_status(&VirtualPath::new(&p)?)?,
                    None => None,
                };
                Ok(ControlResponse::Status {
                    status: fs.status()?,
                    entry,
                })
            }
            ControlRequest::ForceSync { pair, path } => {
                let fs = self.pair(&pair).await?;
                let outcome = fs.force_sync(&VirtualPath::new(&path)?).await?;
                Ok(ControlResponse::Synced { path, outcome })
            }
            ControlRequest::EvictionCandidates { pair, limit } => {
                let entries = self.pair(&pair).await?.eviction_candidates(limit)?;
                Ok(ControlResponse::Candidates { entries })
            }
            ControlRequest::PendingConflicts { pair } => {
                let records = self.pair(&pair).await?.pending_conflicts()?;
                Ok(ControlResponse::Conflicts { records })
            }
            ControlRequest::ResolveConflict { pair, id } => {
                let found = self.pair(&pair).await?.resolve_conflict(id)?;
                Ok(ControlResponse::ConflictResolved { id, found })
            }
            ControlRequest::SetExternalOnline { pair, online } => {
                let fs = self.pair(&pair).await?;
                fs.set_external_online(online).await?;
                Ok(ControlResponse::Availability {
                    pair,
                    online: fs.is_external_online(),
                })
            }
        }
    }

    /// Open, initialize, and attach a configured pair.
    pub async fn mount(&self, name: &str) -> Result<InitReport, ControlError> {
        let config = self
            .pairs
            .get(name)
            .cloned()
            .ok_or_else(|| ControlError::UnknownPair(name.to_owned()))?;
        let mut mounted = self.mounted.lock().await;
        if mounted.contains_key(name) {
            return Err(ControlError::AlreadyMounted(name.to_owned()));
        }
        let fs = TierFs::open(config).await?;
        let report = match fs.initialize().await {
            Ok(report) => report,
            Err(e) => {
                fs.shutdown().await;
                return Err(e.into());
            }
        };
        fs.start_background();
        if let Err(e) = self.driver.mount(name, Arc::clone(&fs)) {
            fs.shutdown().await;
            return Err(e);
        }
        mounted.insert(name.to_owned(), fs);
        info!(pair = name, "mounted sync pair");
        Ok(report)
    }

    /// Detach a pair and drain its sync queue.
    pub async fn unmount(&self, name: &str) -> Result<(), ControlError> {
        if !self.pairs.contains_key(name) {
            return Err(ControlError::UnknownPair(name.to_owned()));
        }
        let fs = self
            .mounted
            .lock()
            .await
            .remove(name)
            .ok_or_else(|| ControlError::NotMounted(name.to_owned()))?;
        let detached = self.driver.unmount(name);
        fs.shutdown().await;
        info!(pair = name, "unmounted sync pair");
        detached
    }

    /// Unmount everything that is mounted.
    pub async fn unmount_all(&self) {
        let names: Vec<String> = self.mounted.lock().await.keys().cloned().collect();
        for name in names {
            if let Err(e) = self.unmount(&name).await {
                warn!(pair = %name, error = %e, "failed to unmount sync pair");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Records mounts without touching the kernel.
    #[derive(Default)]
    struct NoMount {
        calls: std::sync::Mutex<Vec<String>>,
    }

    impl MountDriver for NoMount {
        fn mount(&self, pair: &str, _fs: Arc<TierFs>) -> Result<(), ControlError> {
            self.calls.lock().unwrap().push(format!("mount {pair}"));
            Ok(())
        }

        fn unmount(&self, pair: &str) -> Result<(), ControlError> {
            self.calls.lock().unwrap().push(format!("unmount {pair}"));
            Ok(())
        }
    }

    fn controller(dir: &std::path::Path) -> Controller<NoMount> {
        std::fs::create_dir_all(dir.join("external")).unwrap();
        let pair = PairConfig::new(
            "docs",
            dir.join("local"),
            dir.join("external"),
            dir.join("state/docs.sqlite"),
        );
        Controller::new([pair], NoMount::default())
    }

    #[test]
    fn requests_are_tagged_json() {
        let json = serde_json::to_string(&ControlRequest::ForceSync {
            pair: "docs".into(),
            path: "a.txt".into(),
        })
        .unwrap();
        assert_eq!(json, r#"{"type":"force-sync","pair":"docs","path":"a.txt"}"#);
        let back: ControlRequest = serde_json::from_str(&json).unwrap();
        assert!(matches!(back, ControlRequest::ForceSync { .. }));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn mount_status_unmount() {
        let dir = tempfile::tempdir().unwrap();
        let ctl = controller(dir.path());

        let resp = ctl.handle(ControlRequest::Mount { pair: "docs".into() }).await;
        assert!(matches!(resp, ControlResponse::Mounted { .. }), "{resp:?}");
        let again = ctl.handle(ControlRequest::Mount { pair: "docs".into() }).await;
        assert!(matches!(
            again,
            ControlResponse::Error {
                kind: ControlErrorKind::AlreadyMounted,
                ..
            }
        ));

        let fs = ctl.pair("docs").await.unwrap();
        fs.write_file(&VirtualPath::new("a.txt").unwrap(), b"hi")
            .await
            .unwrap();
        let ControlResponse::Status { status, entry } = ctl
            .handle(ControlRequest::Status {
                pair: "docs".into(),
                path: Some("a.txt".into()),
            })
            .await
        else {
            panic!("expected a status");
        };
        assert!(status.index_ready);
        assert_eq!(status.dirty, 1);
        assert!(entry.unwrap().is_dirty);

        let resp = ctl
            .handle(ControlRequest::ForceSync {
                pair: "docs".into(),
                path: "a.txt".into(),
            })
            .await;
        assert_eq!(
            resp,
            ControlResponse::Synced {
                path: "a.txt".into(),
                outcome: SyncOutcome::Copied
            }
        );

        ctl.handle(ControlRequest::Unmount { pair: "docs".into() }).await;
        assert_eq!(
            *ctl.driver.calls.lock().unwrap(),
            vec!["mount docs".to_owned(), "unmount docs".to_owned()]
        );
    }

    #[tokio::test]
    async fn unknown_and_unmounted_pairs_are_typed_errors() {
        let dir = tempfile::tempdir().unwrap();
        let ctl = controller(dir.path());
        let resp = ctl
            .handle(ControlRequest::PendingConflicts { pair: "nope".into() })
            .await;
        assert!(matches!(
            resp,
            ControlResponse::Error {
                kind: ControlErrorKind::UnknownPair,
                ..
            }
        ));
        let resp = ctl
            .handle(ControlRequest::PendingConflicts { pair: "docs".into() })
            .await;
        assert!(matches!(
            resp,
            ControlResponse::Error {
                kind: ControlErrorKind::NotMounted,
                ..
            }
        ));
    }
}
