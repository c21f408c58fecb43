//! Kernel-facing filesystem layer.
/// Inode numbers for virtual paths.
pub mod bridge;
/// FUSE adapter: maps [`fuser::Filesystem`] callbacks onto [`TierFs`](crate::vfs::TierFs).
pub mod fuser;

use bitflags::bitflags;

/// Type representing an inode identifier.
pub type InodeAddr = u64;

/// Type representing a file handle.
pub type FileHandle = u64;

/// The inode the kernel uses for the mount root.
pub const ROOT_INODE: InodeAddr = 1;

bitflags! {
    /// Permission bits for an inode, similar to Unix file permissions.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct InodePerms: u16 {
        const OTHER_EXECUTE = 1 << 0;
        const OTHER_WRITE   = 1 << 1;
        const OTHER_READ    = 1 << 2;
        const GROUP_EXECUTE = 1 << 3;
        const GROUP_WRITE   = 1 << 4;
        const GROUP_READ    = 1 << 5;
        const OWNER_EXECUTE = 1 << 6;
        const OWNER_WRITE   = 1 << 7;
        const OWNER_READ    = 1 << 8;
        const STICKY        = 1 << 9;
        const SETGID        = 1 << 10;
        const SETUID        = 1 << 11;

        /// Everything that grants writing.
        const ANY_WRITE = Self::OWNER_WRITE.bits()
            | Self::GROUP_WRITE.bits()
            | Self::OTHER_WRITE.bits();
    }
}

bitflags! {
    /// Flags for opening a file, similar to Unix open(2) flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct OpenFlags: i32 {
        const RDONLY = libc::O_RDONLY;
        const WRONLY = libc::O_WRONLY;
        const RDWR = libc::O_RDWR;
        const APPEND = libc::O_APPEND;
        const TRUNC = libc::O_TRUNC;
        const CREAT = libc::O_CREAT;
        const EXCL = libc::O_EXCL;
        const SYNC = libc::O_SYNC;
        const DIRECTORY = libc::O_DIRECTORY;
    }
}

impl OpenFlags {
    /// Whether the access mode allows writing.
    #[must_use]
    pub fn is_writable(self) -> bool {
        matches!(self.bits() & libc::O_ACCMODE, libc::O_WRONLY | libc::O_RDWR)
    }
}

/// Filesystem statistics reported by `statfs`.
///
/// Block counts are in units of `block_size` bytes and bounded by the cache quota.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FsStats {
    pub block_size: u32,
    pub total_blocks: u64,
    pub free_blocks: u64,
    pub available_blocks: u64,
    pub total_inodes: u64,
    pub free_inodes: u64,
    pub max_filename_length: u32,
}
