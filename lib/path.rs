//! Paths inside the Mount View.

use std::fmt;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::VfsError;

/// A normalized, `/`-separated path relative to the Mount View root.
///
/// The root is the empty path. Normalized paths never carry a leading or trailing slash, never
/// contain empty or `.` components, and never contain `..`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct VirtualPath(String);

impl VirtualPath {
    /// The Mount View root.
    #[must_use]
    pub fn root() -> Self {
        Self(String::new())
    }

    /// Normalize `raw` into a virtual path.
    pub fn new(raw: &str) -> Result<Self, VfsError> {
        let mut parts: Vec<&str> = Vec::new();
        for part in raw.split('/') {
            match part {
                "" | "." => {}
                ".." => return Err(VfsError::InvalidPath(raw.to_owned())),
                p if p.contains('\0') => return Err(VfsError::InvalidPath(raw.to_owned())),
                p => parts.push(p),
            }
        }
        Ok(Self(parts.join("/")))
    }

    #[must_use]
    pub fn is_root(&self) -> bool {
        self.0.is_empty()
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The path as a relative filesystem path, suitable for joining onto a backing root.
    #[must_use]
    pub fn as_relative(&self) -> &Path {
        Path::new(&self.0)
    }

    /// The final component, or `None` for the root.
    #[must_use]
    pub fn name(&self) -> Option<&str> {
        if self.is_root() {
            return None;
        }
        self.0.rsplit('/').next()
    }

    /// The containing directory, or `None` for the root.
    #[must_use]
    pub fn parent(&self) -> Option<Self> {
        if self.is_root() {
            return None;
        }
        Some(match self.0.rfind('/') {
            Some(idx) => Self(self.0[..idx].to_owned()),
            None => Self::root(),
        })
    }

    /// Append a single component.
    pub fn join(&self, name: &str) -> Result<Self, VfsError> {
        if name.is_empty() || name == "." || name == ".." || name.contains('/') || name.contains('\0')
        {
            return Err(VfsError::InvalidPath(name.to_owned()));
        }
        if self.is_root() {
            Ok(Self(name.to_owned()))
        } else {
            Ok(Self(format!("{}/{name}", self.0)))
        }
    }

    /// All proper ancestors, nearest first, excluding the root.
    #[must_use]
    pub fn ancestors(&self) -> Vec<Self> {
        let mut out = Vec::new();
        let mut cur = self.parent();
        while let Some(p) = cur {
            if p.is_root() {
                break;
            }
            cur = p.parent();
            out.push(p);
        }
        out
    }

    /// Component-aware prefix test. Every path starts with the root.
    #[must_use]
    pub fn starts_with(&self, prefix: &Self) -> bool {
        if prefix.is_root() || self == prefix {
            return true;
        }
        self.0.len() > prefix.0.len()
            && self.0.starts_with(&prefix.0)
            && self.0.as_bytes()[prefix.0.len()] == b'/'
    }

    /// Replace the `from` prefix of this path with `to`.
    #[must_use]
    pub fn rebase(&self, from: &Self, to: &Self) -> Option<Self> {
        if !self.starts_with(from) {
            return None;
        }
        if self == from {
            return Some(to.clone());
        }
        let rest = if from.is_root() {
            self.0.as_str()
        } else {
            &self.0[from.0.len() + 1..]
        };
        if to.is_root() {
            Some(Self(rest.to_owned()))
        } else {
            Some(Self(format!("{}/{rest}", to.0)))
        }
    }

    /// Number of components; the root has depth zero.
    #[must_use]
    pub fn depth(&self) -> usize {
        if self.is_root() {
            0
        } else {
            self.0.split('/').count()
        }
    }
}

impl fmt::Display for VirtualPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "/{}", self.0)
    }
}

impl TryFrom<String> for VirtualPath {
    type Error = VfsError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(&value)
    }
}

impl From<VirtualPath> for String {
    fn from(value: VirtualPath) -> Self {
        value.0
    }
}
