//! File IO helpers shared by the routers, the sync engine, and eviction.

use std::fs::Metadata;
use std::path::{Path, PathBuf};

use thiserror::Error;
use tokio::io::AsyncReadExt as _;

use crate::roots::PARTIAL_SUFFIX;

const HASH_CHUNK: usize = 64 * 1024;

/// `symlink_metadata`, with a missing path reported as `None`.
pub async fn stat(path: &Path) -> std::io::Result<Option<Metadata>> {
    match tokio::fs::symlink_metadata(path).await {
        Ok(meta) => Ok(Some(meta)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e),
    }
}

/// Create every missing ancestor directory of `path`.
pub async fn ensure_parent(path: &Path) -> std::io::Result<()> {
    match path.parent() {
        Some(parent) => tokio::fs::create_dir_all(parent).await,
        None => Ok(()),
    }
}

/// Remove a file or an empty directory. Returns `false` if nothing was there.
pub async fn remove_path(path: &Path) -> std::io::Result<bool> {
    let Some(meta) = stat(path).await? else {
        return Ok(false);
    };
    let res = if meta.is_dir() {
        tokio::fs::remove_dir(path).await
    } else {
        tokio::fs::remove_file(path).await
    };
    match res {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e),
    }
}

/// BLAKE3 hex digest of a file's contents.
pub async fn checksum_file(path: &Path) -> std::io::Result<String> {
    let mut file = tokio::fs::File::open(path).await?;
    let mut hasher = blake3::Hasher::new();
    let mut buf = vec![0_u8; HASH_CHUNK];
    loop {
        let n = file.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hasher.finalize().to_hex().to_string())
}

#[derive(Debug, Error)]
pub enum CopyError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("size mismatch after copy: expected {expected}, found {actual}")]
    SizeMismatch { expected: u64, actual: u64 },

    #[error("checksum mismatch after copy: expected {expected}, found {actual}")]
    ChecksumMismatch { expected: String, actual: String },
}

/// What a verified copy wrote.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CopyReport {
    pub size: u64,
    pub checksum: Option<String>,
}

fn partial_path(dst: &Path) -> PathBuf {
    let mut name = dst.file_name().map(std::ffi::OsStr::to_os_string).unwrap_or_default();
    name.push(PARTIAL_SUFFIX);
    dst.with_file_name(name)
}

/// Copy `src` over `dst` through a partial file, then verify the result.
///
/// The destination is replaced by a rename, so a crash never leaves a truncated file under the
/// final name. Size is always verified. With `verify_checksum` the BLAKE3 digests of both sides
/// must also match.
pub async fn copy_verified(
    src: &Path,
    dst: &Path,
    verify_checksum: bool,
) -> Result<CopyReport, CopyError> {
    ensure_parent(dst).await?;
    let tmp = partial_path(dst);
    let expected = tokio::fs::metadata(src).await?.len();
    if let Err(e) = tokio::fs::copy(src, &tmp).await {
        let _ = tokio::fs::remove_file(&tmp).await;
        return Err(e.into());
    }
    if let Err(e) = tokio::fs::rename(&tmp, dst).await {
        let _ = tokio::fs::remove_file(&tmp).await;
        return Err(e.into());
    }

    let actual = tokio::fs::metadata(dst).await?.len();
    if actual != expected {
        return Err(CopyError::SizeMismatch { expected, actual });
    }

    let checksum = if verify_checksum {
        let expected = checksum_file(src).await?;
        let actual = checksum_file(dst).await?;
        if expected != actual {
            return Err(CopyError::ChecksumMismatch { expected, actual });
        }
        Some(actual)
    } else {
        None
    };

    Ok(CopyReport {
        size: actual,
        checksum,
    })
}

/// Whether two files hold identical bytes.
pub async fn same_contents(a: &Path, b: &Path) -> std::io::Result<bool> {
    let (ma, mb) = (tokio::fs::metadata(a).await?, tokio::fs::metadata(b).await?);
    if ma.len() != mb.len() {
        return Ok(false);
    }
    Ok(checksum_file(a).await? == checksum_file(b).await?)
}
