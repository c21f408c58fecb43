//! tierfs shared library.
#![cfg_attr(test, allow(clippy::unwrap_used, clippy::expect_used))]

/// Typed control requests for mounted sync pairs.
pub mod control;
/// Metadata rows and the value types stored in them.
pub mod entry;
pub mod error;
/// Local-cache eviction.
pub mod eviction;
/// Kernel-facing filesystem types and the FUSE adapter.
pub mod fs;
pub mod io;
/// Per-path locks and sync exclusion.
pub mod lock;
/// The merged view over both roots.
pub mod merge;
pub mod path;
pub mod roots;
/// Read, write, delete, and rename routing.
pub mod router;
/// The SQLite metadata store.
pub mod store;
/// The debounced local-to-external sync engine.
pub mod sync;
/// Tree descriptors and startup reconciliation.
pub mod version;
/// The per-pair filesystem facade.
pub mod vfs;
