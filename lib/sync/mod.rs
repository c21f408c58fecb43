//! Write-back to the external store.
//!
//! Writes only mark rows dirty and [`SyncEngine::enqueue`] them. A single worker task owns the
//! debounce queue; once a path has been quiet for the debounce delay it is copied out under its
//! sync lock. Paths that fail because the store went away are parked until
//! [`SyncEngine::notify_connected`].

pub mod conflict;
mod queue;

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc::{self, Receiver, Sender, error::TrySendError};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::{Instant, sleep_until};
use tracing::{debug, info, instrument, warn};

use crate::entry::{Location, RootKind, now, time_from_system};
use crate::error::{VfsError, VfsResult};
use crate::io::{checksum_file, copy_verified, stat};
use crate::path::VirtualPath;
use crate::router::{RouterContext, copy_error};
use crate::store::NewConflict;

use conflict::ExternalState;
use queue::DebounceQueue;

const CHANNEL_CAPACITY: usize = 1024;
const MIN_RETRY_DELAY: Duration = Duration::from_secs(1);
const MAX_RETRY_DELAY: Duration = Duration::from_secs(300);

/// What one sync of one path did.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "result", rename_all = "kebab-case")]
pub enum SyncOutcome {
    /// Nothing to do: clean, gone, or not held locally.
    Skipped,
    /// Local bytes were copied out.
    Copied,
    /// The external copy already matched and was adopted as the baseline.
    Adopted,
    /// The external copy had changed; it was kept as `backup` and then overwritten.
    Conflict { backup: String },
}

/// Copies one dirty path to the external store.
struct Syncer {
    ctx: Arc<RouterContext>,
}

impl Syncer {
    #[instrument(name = "Syncer::sync_path", skip(self))]
    async fn sync_path(&self, vp: &VirtualPath) -> VfsResult<SyncOutcome> {
        if !self.ctx.roots.is_external_online() {
            return Err(VfsError::ExternalOffline);
        }
        let path_guard = self.ctx.locks.lock_path(vp).await;
        let Some(_sync_guard) = self.ctx.locks.try_sync_lock(vp)? else {
            return Err(VfsError::FileBusy(vp.clone()));
        };
        // From here on writers fail fast with FileBusy rather than waiting on the copy.
        drop(path_guard);

        let Some(row) = self.ctx.store.get(vp)? else {
            return Ok(SyncOutcome::Skipped);
        };
        if !row.is_dirty || row.is_tombstone() || !row.location.has_local() {
            return Ok(SyncOutcome::Skipped);
        }

        let external = self.ctx.roots.external_path(vp);
        if row.is_directory {
            self.ctx.materialize_external_parents(vp).await?;
            tokio::fs::create_dir_all(&external)
                .await
                .map_err(|e| VfsError::write_failed(vp, e))?;
            let mut row = row;
            row.location = Location::Both;
            row.is_dirty = false;
            self.ctx.store.upsert(&row)?;
            if let Some(meta) = stat(&external).await? {
                self.ctx
                    .versions
                    .record_upsert(RootKind::External, vp, &meta)
                    .await?;
            }
            return Ok(SyncOutcome::Copied);
        }

        let local = self.ctx.roots.local_path(vp);
        if stat(&local).await?.is_none() {
            warn!(path = %vp, "dirty row has no local bytes");
            return Ok(SyncOutcome::Skipped);
        }
        self.ctx.materialize_external_parents(vp).await?;

        let mut outcome = SyncOutcome::Copied;
        let mut checksum = None;
        match conflict::inspect(&row, &local, &external).await? {
            ExternalState::Absent | ExternalState::Unchanged => {}
            ExternalState::Identical { .. } => outcome = SyncOutcome::Adopted,
            ExternalState::Diverged { modified_at } => {
                let at = now();
                let backup = conflict::move_aside(&external, at)
                    .await
                    .map_err(|e| VfsError::write_failed(vp, e))?;
                self.ctx.store.add_conflict(&NewConflict {
                    virtual_path: vp,
                    backup_name: &backup,
                    conflict_at: at,
                    local_modified_at: row.modified_at,
                    external_modified_at: modified_at,
                })?;
                warn!(path = %vp, backup = %backup, "external copy changed since last sync, kept as backup");
                outcome = SyncOutcome::Conflict { backup };
            }
        }

        let size = if outcome == SyncOutcome::Adopted {
            if self.ctx.verify_checksums {
                checksum = Some(checksum_file(&external).await?);
            }
            row.size
        } else {
            let report = copy_verified(&local, &external, self.ctx.verify_checksums)
                .await
                .map_err(|e| copy_error(vp, e))?;
            checksum = report.checksum;
            report.size
        };

        let ext_meta = stat(&external)
            .await?
            .ok_or_else(|| VfsError::write_failed(vp, std::io::ErrorKind::NotFound.into()))?;
        let Some(mut row) = self.ctx.store.get(vp)? else {
            return Ok(outcome);
        };
        if !row.is_visible() {
            return Ok(outcome);
        }
        row.location = Location::Both;
        row.is_dirty = false;
        row.size = size;
        row.checksum = checksum;
        row.synced_external_mtime = Some(time_from_system(ext_meta.modified()?));
        self.ctx.store.upsert(&row)?;
        self.ctx
            .versions
            .record_upsert(RootKind::External, vp, &ext_meta)
            .await?;
        debug!(path = %vp, size, ?outcome, "synced");
        Ok(outcome)
    }
}

enum Command {
    Enqueue(VirtualPath),
    Flush(oneshot::Sender<()>),
    Connected,
    Shutdown(oneshot::Sender<()>),
}

struct QueueWorker {
    receiver: Receiver<Command>,
    queue: DebounceQueue,
    /// Paths that failed because the store was offline.
    parked: BTreeSet<VirtualPath>,
    attempts: HashMap<VirtualPath, u32>,
    syncer: Arc<Syncer>,
    retry: Duration,
}

async fn wait_for(deadline: Option<Instant>) {
    match deadline {
        Some(at) => sleep_until(at).await,
        None => std::future::pending::<()>().await,
    }
}

impl QueueWorker {
    fn spawn_task(receiver: Receiver<Command>, syncer: Arc<Syncer>, debounce: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut task = Self {
                receiver,
                queue: DebounceQueue::new(debounce),
                parked: BTreeSet::new(),
                attempts: HashMap::new(),
                syncer,
                retry: debounce.max(MIN_RETRY_DELAY),
            };
            task.work().await;
        })
    }

    async fn work(&mut self) {
        loop {
            let deadline = self.queue.next_deadline();
            tokio::select! {
                cmd = self.receiver.recv() => {
                    let Some(cmd) = cmd else { break };
                    if !self.service_command(cmd).await {
                        break;
                    }
                }
                () = wait_for(deadline) => {
                    for vp in self.queue.take_due(Instant::now()) {
                        self.sync_one(vp).await;
                    }
                }
            }
        }
        debug!("sync worker stopped");
    }

    /// Returns true if the worker should keep running.
    async fn service_command(&mut self, cmd: Command) -> bool {
        match cmd {
            Command::Enqueue(vp) => {
                self.parked.remove(&vp);
                self.queue.push(vp, Instant::now());
            }
            Command::Flush(reply) => {
                self.drain().await;
                let _ = reply.send(());
            }
            Command::Connected => self.requeue_everything(),
            Command::Shutdown(reply) => {
                if self.syncer.ctx.roots.is_external_online() {
                    self.drain().await;
                }
                let _ = reply.send(());
                return false;
            }
        }
        true
    }

    fn requeue_everything(&mut self) {
        let at = Instant::now();
        let dirty = match self.syncer.ctx.store.dirty_paths() {
            Ok(paths) => paths,
            Err(e) => {
                warn!(error = %e, "could not list dirty paths");
                Vec::new()
            }
        };
        let parked = std::mem::take(&mut self.parked);
        let count = dirty.len() + parked.len();
        for vp in dirty.into_iter().chain(parked) {
            self.queue.push_at(vp, at);
        }
        info!(count, "external store connected, requeued pending syncs");
    }

    /// Sync everything queued right now, ignoring debounce timers.
    async fn drain(&mut self) {
        let mut pending = self.queue.take_all();
        if self.syncer.ctx.roots.is_external_online() {
            pending.extend(std::mem::take(&mut self.parked));
        }
        for vp in pending {
            self.sync_one(vp).await;
        }
    }

    async fn sync_one(&mut self, vp: VirtualPath) {
        match self.syncer.sync_path(&vp).await {
            Ok(_) => {
                self.attempts.remove(&vp);
            }
            Err(VfsError::ExternalOffline) => {
                debug!(path = %vp, "external store offline, parking");
                self.parked.insert(vp);
            }
            Err(VfsError::FileBusy(_)) => {
                let at = Instant::now() + self.retry;
                self.queue.push_at(vp, at);
            }
            Err(e) if e.is_not_found() => {
                debug!(path = %vp, "path vanished before sync");
                self.attempts.remove(&vp);
            }
            Err(e) => {
                let attempts = self.attempts.entry(vp.clone()).or_insert(0);
                *attempts = attempts.saturating_add(1);
                let delay = self
                    .retry
                    .saturating_mul(1 << (*attempts).min(9))
                    .min(MAX_RETRY_DELAY);
                warn!(path = %vp, error = %e, attempts = *attempts, "sync failed, will retry");
                self.queue.push_at(vp, Instant::now() + delay);
            }
        }
    }
}

/// Handle to the sync worker of one sync pair.
pub struct SyncEngine {
    sender: Sender<Command>,
    syncer: Arc<Syncer>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl SyncEngine {
    /// Start the worker. Must be called from within a tokio runtime.
    #[must_use]
    pub fn spawn(ctx: Arc<RouterContext>, debounce: Duration) -> Self {
        let (sender, receiver) = mpsc::channel(CHANNEL_CAPACITY);
        let syncer = Arc::new(Syncer { ctx });
        let worker = QueueWorker::spawn_task(receiver, Arc::clone(&syncer), debounce);
        Self {
            sender,
            syncer,
            worker: Mutex::new(Some(worker)),
        }
    }

    fn send(&self, cmd: Command) {
        match self.sender.try_send(cmd) {
            Ok(()) => {}
            Err(TrySendError::Full(cmd)) => {
                let sender = self.sender.clone();
                tokio::spawn(async move {
                    let _ = sender.send(cmd).await;
                });
            }
            Err(TrySendError::Closed(_)) => {
                debug!("sync worker is gone, dropping command");
            }
        }
    }

    /// Schedule `vp` for sync once it has been quiet for the debounce delay.
    pub fn enqueue(&self, vp: &VirtualPath) {
        self.send(Command::Enqueue(vp.clone()));
    }

    /// Requeue every dirty path, due immediately.
    pub fn notify_connected(&self) {
        self.send(Command::Connected);
    }

    /// Sync everything queued and wait until the worker is done with it.
    pub async fn flush(&self) {
        let (tx, rx) = oneshot::channel();
        if self.sender.send(Command::Flush(tx)).await.is_ok() {
            let _ = rx.await;
        }
    }

    /// Sync `vp` now, bypassing the queue.
    pub async fn sync_path(&self, vp: &VirtualPath) -> VfsResult<SyncOutcome> {
        self.syncer.sync_path(vp).await
    }

    /// Drain the queue if the store is reachable, then stop the worker.
    pub async fn shutdown(&self) {
        let (tx, rx) = oneshot::channel();
        if self.sender.send(Command::Shutdown(tx)).await.is_ok() {
            let _ = rx.await;
        }
        let worker = self
            .worker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(worker) = worker
            && let Err(e) = worker.await
        {
            warn!(error = %e, "sync worker panicked");
        }
    }
}
