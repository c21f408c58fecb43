//! The error taxonomy shared by every layer of the engine.
//!
//! Each variant maps onto the smallest accurate POSIX errno, which is what the FUSE adapter
//! replies with.

use thiserror::Error;

use crate::path::VirtualPath;

/// Errors produced by the routing and consistency engine.
#[derive(Debug, Error)]
pub enum VfsError {
    #[error("path not found: {0}")]
    NotFound(VirtualPath),

    #[error("permission denied: {0}")]
    PermissionDenied(VirtualPath),

    /// The path is held by a sync or an eviction.
    #[error("file is busy: {0}")]
    FileBusy(VirtualPath),

    #[error("insufficient local space: needed {needed} bytes, {available} available")]
    InsufficientSpace { needed: u64, available: u64 },

    #[error("external store is offline")]
    ExternalOffline,

    #[error("checksum mismatch for {path}: expected {expected}, found {actual}")]
    ChecksumMismatch {
        path: VirtualPath,
        expected: String,
        actual: String,
    },

    #[error("write failed for {path}: {source}")]
    WriteFailed {
        path: VirtualPath,
        #[source]
        source: std::io::Error,
    },

    #[error("metadata store is corrupted: {0}")]
    MetadataCorrupted(String),

    #[error("sync pair is read-only")]
    ReadOnly,

    /// The startup scan has not finished yet.
    #[error("index is not ready")]
    IndexNotReady,

    #[error("not a directory: {0}")]
    NotADirectory(VirtualPath),

    #[error("is a directory: {0}")]
    IsADirectory(VirtualPath),

    #[error("directory not empty: {0}")]
    NotEmpty(VirtualPath),

    #[error("already exists: {0}")]
    AlreadyExists(VirtualPath),

    #[error("invalid path: {0}")]
    InvalidPath(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result alias used across the crate.
pub type VfsResult<T> = Result<T, VfsError>;

impl VfsError {
    /// Wrap an I/O failure of a local write.
    pub fn write_failed(path: &VirtualPath, source: std::io::Error) -> Self {
        Self::WriteFailed {
            path: path.clone(),
            source,
        }
    }

    /// The errno reported to the kernel for this error.
    #[must_use]
    pub fn errno(&self) -> i32 {
        match self {
            Self::NotFound(_) => libc::ENOENT,
            Self::PermissionDenied(_) => libc::EACCES,
            Self::FileBusy(_) | Self::IndexNotReady => libc::EBUSY,
            Self::InsufficientSpace { .. } => libc::ENOSPC,
            Self::ExternalOffline
            | Self::ChecksumMismatch { .. }
            | Self::WriteFailed { .. }
            | Self::MetadataCorrupted(_) => libc::EIO,
            Self::ReadOnly => libc::EROFS,
            Self::NotADirectory(_) => libc::ENOTDIR,
            Self::IsADirectory(_) => libc::EISDIR,
            Self::NotEmpty(_) => libc::ENOTEMPTY,
            Self::AlreadyExists(_) => libc::EEXIST,
            Self::InvalidPath(_) => libc::EINVAL,
            Self::Io(e) => io_to_errno(e),
        }
    }

    /// Whether this error means the path simply does not exist.
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
            || matches!(self, Self::Io(e) if e.kind() == std::io::ErrorKind::NotFound)
    }
}

impl From<VfsError> for i32 {
    fn from(e: VfsError) -> Self {
        e.errno()
    }
}

impl From<rusqlite::Error> for VfsError {
    fn from(e: rusqlite::Error) -> Self {
        Self::MetadataCorrupted(e.to_string())
    }
}

impl From<serde_json::Error> for VfsError {
    fn from(e: serde_json::Error) -> Self {
        Self::MetadataCorrupted(e.to_string())
    }
}

/// Convert an I/O error to the corresponding errno value.
#[expect(
    clippy::wildcard_enum_match_arm,
    reason = "ErrorKind is non_exhaustive; EIO is the safe default"
)]
pub fn io_to_errno(e: &std::io::Error) -> i32 {
    e.raw_os_error().unwrap_or_else(|| match e.kind() {
        std::io::ErrorKind::NotFound => libc::ENOENT,
        std::io::ErrorKind::PermissionDenied => libc::EACCES,
        std::io::ErrorKind::AlreadyExists => libc::EEXIST,
        _ => libc::EIO,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vp(s: &str) -> VirtualPath {
        VirtualPath::new(s).unwrap_or_else(|e| panic!("bad path {s}: {e}"))
    }

    #[test]
    fn busy_and_not_ready_both_map_to_ebusy() {
        assert_eq!(VfsError::FileBusy(vp("a")).errno(), libc::EBUSY);
        assert_eq!(VfsError::IndexNotReady.errno(), libc::EBUSY);
    }

    #[test]
    fn offline_is_reported_as_io_error() {
        assert_eq!(i32::from(VfsError::ExternalOffline), libc::EIO);
    }

    #[test]
    fn raw_os_errors_pass_through() {
        let e = VfsError::Io(std::io::Error::from_raw_os_error(libc::ENAMETOOLONG));
        assert_eq!(e.errno(), libc::ENAMETOOLONG);
    }

    #[test]
    fn io_not_found_counts_as_not_found() {
        let e = VfsError::Io(std::io::Error::new(std::io::ErrorKind::NotFound, "gone"));
        assert!(e.is_not_found());
        assert_eq!(e.errno(), libc::ENOENT);
        assert!(!VfsError::ReadOnly.is_not_found());
    }

    #[test]
    fn space_and_readonly_errnos() {
        let e = VfsError::InsufficientSpace {
            needed: 10,
            available: 1,
        };
        assert_eq!(e.errno(), libc::ENOSPC);
        assert_eq!(VfsError::ReadOnly.errno(), libc::EROFS);
    }
}
