//! FUSE adapter: maps [`fuser::Filesystem`] callbacks onto the path-based [`TierFs`].

use std::ffi::OsStr;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use tracing::{debug, error, instrument};

use super::bridge::InodeBridge;
use super::{InodeAddr, InodePerms, OpenFlags};
use crate::error::{VfsError, VfsResult};
use crate::merge::EntryAttributes;
use crate::path::VirtualPath;
use crate::vfs::{BLOCK_SIZE, TierFs};

/// Trait abstracting the `.error(errno)` method common to all fuser reply types.
trait FuseReply {
    fn error(self, errno: i32);
}

macro_rules! impl_fuse_reply {
    ($($ty:ty),* $(,)?) => {
        $(impl FuseReply for $ty {
            fn error(self, errno: i32) {
                // Calls the inherent fuser method (not this trait method).
                self.error(errno);
            }
        })*
    };
}

impl_fuse_reply!(
    fuser::ReplyEntry,
    fuser::ReplyAttr,
    fuser::ReplyDirectory,
    fuser::ReplyOpen,
    fuser::ReplyData,
    fuser::ReplyEmpty,
    fuser::ReplyWrite,
    fuser::ReplyCreate,
    fuser::ReplyStatfs,
);

/// Centralizes the error-logging + errno-reply path so each callback only expresses its success
/// path.
trait FuseResultExt<T> {
    fn fuse_reply<R: FuseReply>(self, reply: R, on_ok: impl FnOnce(T, R));
}

impl<T> FuseResultExt<T> for VfsResult<T> {
    fn fuse_reply<R: FuseReply>(self, reply: R, on_ok: impl FnOnce(T, R)) {
        match self {
            Ok(val) => on_ok(val, reply),
            Err(e) => {
                debug!(error = %e, "replying error");
                reply.error(e.errno());
            }
        }
    }
}

fn stale_inode() -> VfsError {
    VfsError::Io(std::io::Error::from_raw_os_error(libc::ENOENT))
}

fn resolve_time(t: fuser::TimeOrNow) -> SystemTime {
    match t {
        fuser::TimeOrNow::SpecificTime(at) => at,
        fuser::TimeOrNow::Now => SystemTime::now(),
    }
}

/// Who owns every entry of the mount, and whether it may be written.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MountOwner {
    pub uid: u32,
    pub gid: u32,
    pub read_only: bool,
}

/// Bridges one [`TierFs`] to the [`fuser::Filesystem`] trait.
pub struct FuserAdapter {
    fs: Arc<TierFs>,
    inodes: InodeBridge,
    owner: MountOwner,
    runtime: tokio::runtime::Handle,
}

impl FuserAdapter {
    // Entries change behind the kernel's back whenever the external store comes or goes, so the
    // kernel is asked again every second.
    const TTL: Duration = Duration::from_secs(1);

    #[must_use]
    pub fn new(fs: Arc<TierFs>, owner: MountOwner, runtime: tokio::runtime::Handle) -> Self {
        Self {
            fs,
            inodes: InodeBridge::new(),
            owner,
            runtime,
        }
    }

    fn path_of(&self, ino: InodeAddr) -> VfsResult<VirtualPath> {
        self.inodes.path(ino).ok_or_else(stale_inode)
    }

    fn child(&self, parent: InodeAddr, name: &OsStr) -> VfsResult<VirtualPath> {
        let name = name
            .to_str()
            .ok_or_else(|| VfsError::InvalidPath(name.to_string_lossy().into_owned()))?;
        self.path_of(parent)?.join(name)
    }

    fn attr(&self, ino: InodeAddr, attrs: &EntryAttributes) -> fuser::FileAttr {
        let mut perms = InodePerms::from_bits_truncate(attrs.permissions);
        if self.owner.read_only {
            perms -= InodePerms::ANY_WRITE;
        }
        let mtime = SystemTime::from(attrs.modified_at);
        fuser::FileAttr {
            ino,
            size: attrs.size,
            blocks: attrs.size.div_ceil(512),
            atime: SystemTime::from(attrs.accessed_at),
            mtime,
            ctime: mtime,
            crtime: SystemTime::from(attrs.created_at),
            kind: if attrs.is_directory {
                fuser::FileType::Directory
            } else {
                fuser::FileType::RegularFile
            },
            perm: perms.bits(),
            nlink: if attrs.is_directory { 2 } else { 1 },
            uid: self.owner.uid,
            gid: self.owner.gid,
            rdev: 0,
            blksize: BLOCK_SIZE,
            flags: 0,
        }
    }
}

impl fuser::Filesystem for FuserAdapter {
    #[instrument(name = "FuserAdapter::lookup", skip(self, _req, reply))]
    fn lookup(
        &mut self,
        _req: &fuser::Request<'_>,
        parent: u64,
        name: &OsStr,
        reply: fuser::ReplyEntry,
    ) {
        let result = self.path_of(parent).and_then(|dir| {
            let name = name
                .to_str()
                .ok_or_else(|| VfsError::InvalidPath(name.to_string_lossy().into_owned()))?;
            self.runtime.block_on(self.fs.lookup(&dir, name))
        });
        result.fuse_reply(reply, |(vp, attrs), reply| {
            let ino = self.inodes.lookup(&vp);
            reply.entry(&Self::TTL, &self.attr(ino, &attrs), 0);
        });
    }

    #[instrument(name = "FuserAdapter::getattr", skip(self, _req, _fh, reply))]
    fn getattr(
        &mut self,
        _req: &fuser::Request<'_>,
        ino: u64,
        _fh: Option<u64>,
        reply: fuser::ReplyAttr,
    ) {
        self.path_of(ino)
            .and_then(|vp| self.runtime.block_on(self.fs.getattr(&vp)))
            .fuse_reply(reply, |attrs, reply| {
                reply.attr(&Self::TTL, &self.attr(ino, &attrs));
            });
    }

    /// Only size changes are applied; ownership and mode are fixed per mount.
    #[instrument(
        name = "FuserAdapter::setattr",
        skip(
            self, _req, _mode, _uid, _gid, atime, mtime, _ctime, _fh, _crtime, _chgtime,
            _bkuptime, _flags, reply
        )
    )]
    fn setattr(
        &mut self,
        _req: &fuser::Request<'_>,
        ino: u64,
        _mode: Option<u32>,
        _uid: Option<u32>,
        _gid: Option<u32>,
        size: Option<u64>,
        atime: Option<fuser::TimeOrNow>,
        mtime: Option<fuser::TimeOrNow>,
        _ctime: Option<SystemTime>,
        _fh: Option<u64>,
        _crtime: Option<SystemTime>,
        _chgtime: Option<SystemTime>,
        _bkuptime: Option<SystemTime>,
        _flags: Option<u32>,
        reply: fuser::ReplyAttr,
    ) {
        self.path_of(ino)
            .and_then(|vp| {
                self.runtime.block_on(async {
                    let mut attrs = match size {
                        Some(size) => Some(self.fs.truncate(&vp, size).await?),
                        None => None,
                    };
                    if atime.is_some() || mtime.is_some() {
                        let accessed = atime.map(resolve_time);
                        let modified = mtime.map(resolve_time);
                        attrs = Some(self.fs.set_times(&vp, accessed, modified).await?);
                    }
                    match attrs {
                        Some(attrs) => Ok(attrs),
                        None => self.fs.getattr(&vp).await,
                    }
                })
            })
            .fuse_reply(reply, |attrs, reply| {
                reply.attr(&Self::TTL, &self.attr(ino, &attrs));
            });
    }

    #[instrument(name = "FuserAdapter::readdir", skip(self, _req, _fh, offset, reply))]
    fn readdir(
        &mut self,
        _req: &fuser::Request<'_>,
        ino: u64,
        _fh: u64,
        offset: i64,
        mut reply: fuser::ReplyDirectory,
    ) {
        let result = self.path_of(ino).and_then(|dir| {
            let listing = self.runtime.block_on(self.fs.readdir(&dir))?;
            Ok((dir, listing))
        });
        let (dir, listing) = match result {
            Ok(r) => r,
            Err(e) => {
                debug!(error = %e, "replying error");
                reply.error(e.errno());
                return;
            }
        };

        let parent_ino = dir
            .parent()
            .map_or(ino, |parent| self.inodes.inode_of(&parent));
        let mut entries = vec![
            (ino, fuser::FileType::Directory, ".".to_owned()),
            (parent_ino, fuser::FileType::Directory, "..".to_owned()),
        ];
        entries.extend(listing.into_iter().map(|e| {
            let kind = if e.attributes.is_directory {
                fuser::FileType::Directory
            } else {
                fuser::FileType::RegularFile
            };
            (self.inodes.inode_of(&e.path), kind, e.name)
        }));

        let skip = usize::try_from(offset).unwrap_or(0);
        for (i, (entry_ino, kind, name)) in entries.iter().enumerate().skip(skip) {
            let Ok(next): Result<i64, _> = (i + 1).try_into() else {
                error!("directory entry index {} too large for fuser", i + 1);
                reply.error(libc::EIO);
                return;
            };
            if reply.add(*entry_ino, next, *kind, name) {
                debug!("buffer full for now, stopping readdir");
                break;
            }
        }
        reply.ok();
    }

    #[instrument(name = "FuserAdapter::open", skip(self, _req, flags, reply))]
    fn open(&mut self, _req: &fuser::Request<'_>, ino: u64, flags: i32, reply: fuser::ReplyOpen) {
        let flags = OpenFlags::from_bits_truncate(flags);
        self.path_of(ino)
            .and_then(|vp| self.runtime.block_on(self.fs.open_file(&vp, flags)))
            .fuse_reply(reply, |fh, reply| {
                debug!(handle = fh, "replying...");
                reply.opened(fh, 0);
            });
    }

    #[instrument(
        name = "FuserAdapter::read",
        skip(self, _req, _ino, fh, offset, size, _flags, _lock_owner, reply)
    )]
    fn read(
        &mut self,
        _req: &fuser::Request<'_>,
        _ino: u64,
        fh: u64,
        offset: i64,
        size: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: fuser::ReplyData,
    ) {
        self.runtime
            .block_on(self.fs.read(fh, offset.cast_unsigned(), size))
            .fuse_reply(reply, |data, reply| {
                debug!(read_bytes = data.len(), "replying...");
                reply.data(&data);
            });
    }

    #[instrument(
        name = "FuserAdapter::write",
        skip(self, _req, _ino, fh, offset, data, _write_flags, _flags, _lock_owner, reply),
        fields(len = data.len())
    )]
    fn write(
        &mut self,
        _req: &fuser::Request<'_>,
        _ino: u64,
        fh: u64,
        offset: i64,
        data: &[u8],
        _write_flags: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: fuser::ReplyWrite,
    ) {
        self.runtime
            .block_on(self.fs.write(fh, offset.cast_unsigned(), data))
            .fuse_reply(reply, |written, reply| reply.written(written));
    }

    #[instrument(name = "FuserAdapter::create", skip(self, _req, _mode, _umask, _flags, reply))]
    fn create(
        &mut self,
        _req: &fuser::Request<'_>,
        parent: u64,
        name: &OsStr,
        _mode: u32,
        _umask: u32,
        _flags: i32,
        reply: fuser::ReplyCreate,
    ) {
        self.child(parent, name)
            .and_then(|vp| {
                let (attrs, fh) = self.runtime.block_on(self.fs.create(&vp))?;
                Ok((vp, attrs, fh))
            })
            .fuse_reply(reply, |(vp, attrs, fh), reply| {
                let ino = self.inodes.lookup(&vp);
                reply.created(&Self::TTL, &self.attr(ino, &attrs), 0, fh, 0);
            });
    }

    #[instrument(name = "FuserAdapter::mkdir", skip(self, _req, _mode, _umask, reply))]
    fn mkdir(
        &mut self,
        _req: &fuser::Request<'_>,
        parent: u64,
        name: &OsStr,
        _mode: u32,
        _umask: u32,
        reply: fuser::ReplyEntry,
    ) {
        self.child(parent, name)
            .and_then(|vp| {
                let attrs = self.runtime.block_on(self.fs.mkdir(&vp))?;
                Ok((vp, attrs))
            })
            .fuse_reply(reply, |(vp, attrs), reply| {
                let ino = self.inodes.lookup(&vp);
                reply.entry(&Self::TTL, &self.attr(ino, &attrs), 0);
            });
    }

    #[instrument(name = "FuserAdapter::unlink", skip(self, _req, reply))]
    fn unlink(
        &mut self,
        _req: &fuser::Request<'_>,
        parent: u64,
        name: &OsStr,
        reply: fuser::ReplyEmpty,
    ) {
        self.child(parent, name)
            .and_then(|vp| {
                self.runtime.block_on(self.fs.unlink(&vp))?;
                Ok(vp)
            })
            .fuse_reply(reply, |vp, reply| {
                self.inodes.unlink(&vp);
                reply.ok();
            });
    }

    #[instrument(name = "FuserAdapter::rmdir", skip(self, _req, reply))]
    fn rmdir(
        &mut self,
        _req: &fuser::Request<'_>,
        parent: u64,
        name: &OsStr,
        reply: fuser::ReplyEmpty,
    ) {
        self.child(parent, name)
            .and_then(|vp| {
                self.runtime.block_on(self.fs.rmdir(&vp))?;
                Ok(vp)
            })
            .fuse_reply(reply, |vp, reply| {
                self.inodes.unlink(&vp);
                reply.ok();
            });
    }

    #[instrument(name = "FuserAdapter::rename", skip(self, _req, reply))]
    fn rename(
        &mut self,
        _req: &fuser::Request<'_>,
        parent: u64,
        name: &OsStr,
        newparent: u64,
        newname: &OsStr,
        flags: u32,
        reply: fuser::ReplyEmpty,
    ) {
        // RENAME_EXCHANGE and RENAME_NOREPLACE are not supported.
        if flags != 0 {
            reply.error(libc::EINVAL);
            return;
        }
        self.child(parent, name)
            .and_then(|from| {
                let to = self.child(newparent, newname)?;
                self.runtime.block_on(self.fs.rename(&from, &to))?;
                Ok((from, to))
            })
            .fuse_reply(reply, |(from, to), reply| {
                self.inodes.rename_subtree(&from, &to);
                reply.ok();
            });
    }

    #[instrument(name = "FuserAdapter::flush", skip(self, _req, _ino, _lock_owner, reply))]
    fn flush(
        &mut self,
        _req: &fuser::Request<'_>,
        _ino: u64,
        fh: u64,
        _lock_owner: u64,
        reply: fuser::ReplyEmpty,
    ) {
        // Every write already lands in the cache file; nothing is buffered here.
        reply.ok();
        debug!(handle = fh, "flushed");
    }

    #[instrument(name = "FuserAdapter::fsync", skip(self, _req, _ino, _datasync, reply))]
    fn fsync(
        &mut self,
        _req: &fuser::Request<'_>,
        _ino: u64,
        fh: u64,
        _datasync: bool,
        reply: fuser::ReplyEmpty,
    ) {
        self.runtime
            .block_on(self.fs.fsync(fh))
            .fuse_reply(reply, |(), reply| reply.ok());
    }

    #[instrument(
        name = "FuserAdapter::release",
        skip(self, _req, _ino, _flags, _lock_owner, _flush, reply)
    )]
    fn release(
        &mut self,
        _req: &fuser::Request<'_>,
        _ino: u64,
        fh: u64,
        _flags: i32,
        _lock_owner: Option<u64>,
        _flush: bool,
        reply: fuser::ReplyEmpty,
    ) {
        self.fs.release(fh).fuse_reply(reply, |(), reply| reply.ok());
    }

    #[instrument(name = "FuserAdapter::forget", skip(self, _req))]
    fn forget(&mut self, _req: &fuser::Request<'_>, ino: u64, nlookup: u64) {
        self.inodes.forget(ino, nlookup);
    }

    #[instrument(name = "FuserAdapter::statfs", skip(self, _req, _ino, reply))]
    fn statfs(&mut self, _req: &fuser::Request<'_>, _ino: u64, reply: fuser::ReplyStatfs) {
        self.fs.statfs().fuse_reply(reply, |stats, reply| {
            debug!(?stats, "replying...");
            reply.statfs(
                stats.total_blocks,
                stats.free_blocks,
                stats.available_blocks,
                stats.total_inodes,
                stats.free_inodes,
                stats.block_size,
                stats.max_filename_length,
                BLOCK_SIZE,
            );
        });
    }
}
