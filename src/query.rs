//! Read-only queries against a pair's metadata database, for the CLI.
//!
//! These open the SQLite file directly, so they work whether or not the daemon is running.

use std::io::Write as _;

use serde::Serialize;

use tierfs::error::VfsResult;
use tierfs::path::VirtualPath;
use tierfs::store::MetadataStore;

use crate::app_config::{self, Config};

#[derive(Debug, Serialize)]
#[serde(rename_all = "kebab-case")]
struct OfflineStatus {
    pair: String,
    local_usage: u64,
    local_quota: u64,
    dirty: usize,
    pending_conflicts: usize,
    interrupted_deletes: usize,
    pending_external_deletes: usize,
}

#[derive(Debug, thiserror::Error)]
pub enum QueryError {
    #[error("unknown sync pair: {0}")]
    UnknownPair(String),

    #[error(transparent)]
    Vfs(#[from] tierfs::error::VfsError),

    #[error("failed to write output: {0}")]
    Output(#[from] std::io::Error),
}

fn open(config: &Config, pair: &str) -> Result<(MetadataStore, u64), QueryError> {
    let entry = config
        .pair(pair)
        .ok_or_else(|| QueryError::UnknownPair(pair.to_owned()))?;
    let store = MetadataStore::open(&app_config::database_path(&config.state_dir, pair))?;
    Ok((store, entry.local_quota.as_u64()))
}

fn print_json(value: &impl Serialize) -> Result<(), QueryError> {
    let mut out = std::io::stdout().lock();
    serde_json::to_writer_pretty(&mut out, value).map_err(std::io::Error::from)?;
    writeln!(out)?;
    Ok(())
}

/// Pair totals, or one path's row when `path` is given.
pub fn status(config: &Config, pair: &str, path: Option<&str>) -> Result<(), QueryError> {
    let (store, quota) = open(config, pair)?;
    if let Some(path) = path {
        let vp = VirtualPath::new(path)?;
        return print_json(&store.get(&vp)?);
    }
    let status = summarize(&store, pair, quota)?;
    print_json(&status)
}

fn summarize(store: &MetadataStore, pair: &str, quota: u64) -> VfsResult<OfflineStatus> {
    Ok(OfflineStatus {
        pair: pair.to_owned(),
        local_usage: store.local_usage()?,
        local_quota: quota,
        dirty: store.dirty_paths()?.len(),
        pending_conflicts: store.conflicts(false)?.len(),
        interrupted_deletes: store.interrupted_deletes()?.len(),
        pending_external_deletes: store.pending_external_deletes()?.len(),
    })
}

pub fn conflicts(config: &Config, pair: &str, all: bool) -> Result<(), QueryError> {
    let (store, _) = open(config, pair)?;
    print_json(&store.conflicts(all)?)
}

pub fn candidates(config: &Config, pair: &str, limit: usize) -> Result<(), QueryError> {
    let (store, _) = open(config, pair)?;
    print_json(&store.eviction_candidates(limit)?)
}
