use std::path::PathBuf;
use std::sync::Arc;

use tracing::{instrument, trace, warn};

use crate::entry::{Location, now};
use crate::error::VfsResult;
use crate::path::VirtualPath;

use super::RouterContext;

/// Where the bytes of a read come from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadResolution {
    Local(PathBuf),
    /// Served straight from the external store; nothing is copied into the cache.
    External(PathBuf),
    NotFound,
    ExternalOffline,
}

pub struct ReadRouter {
    ctx: Arc<RouterContext>,
}

impl ReadRouter {
    #[must_use]
    pub fn new(ctx: Arc<RouterContext>) -> Self {
        Self { ctx }
    }

    /// Resolve `vp` for reading and bump its access time.
    #[instrument(name = "ReadRouter::resolve_read", skip(self))]
    pub async fn resolve_read(&self, vp: &VirtualPath) -> VfsResult<ReadResolution> {
        let Some(row) = self.ctx.merge.entry(vp).await? else {
            return Ok(ReadResolution::NotFound);
        };
        let resolution = match row.location {
            Location::LocalOnly | Location::Both => {
                ReadResolution::Local(self.ctx.roots.local_path(vp))
            }
            Location::ExternalOnly if self.ctx.roots.is_external_online() => {
                ReadResolution::External(self.ctx.roots.external_path(vp))
            }
            Location::ExternalOnly => return Ok(ReadResolution::ExternalOffline),
            Location::NotExists | Location::Deleted => return Ok(ReadResolution::NotFound),
        };
        if let Err(e) = self.ctx.store.touch_accessed(vp, now()) {
            warn!(path = %vp, error = %e, "failed to record access time");
        }
        trace!(?resolution, "resolved read");
        Ok(resolution)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::router::test_support::context;

    #[tokio::test]
    async fn external_only_reads_are_zero_copy() {
        let (dir, ctx) = context();
        std::fs::write(dir.path().join("external/movie.mp4"), b"frames").unwrap();
        let router = ReadRouter::new(Arc::clone(&ctx));
        let vp = VirtualPath::new("movie.mp4").unwrap();

        let res = router.resolve_read(&vp).await.unwrap();
        assert_eq!(res, ReadResolution::External(dir.path().join("external/movie.mp4")));
        assert!(!dir.path().join("local/movie.mp4").exists());
        let row = ctx.store.get(&vp).unwrap().unwrap();
        assert_eq!(row.location, Location::ExternalOnly);
    }

    #[tokio::test]
    async fn offline_external_only_reports_offline() {
        let (dir, ctx) = context();
        std::fs::write(dir.path().join("external/a"), b"x").unwrap();
        let router = ReadRouter::new(Arc::clone(&ctx));
        let vp = VirtualPath::new("a").unwrap();
        router.resolve_read(&vp).await.unwrap();

        ctx.roots.set_external_online(false);
        assert_eq!(
            router.resolve_read(&vp).await.unwrap(),
            ReadResolution::ExternalOffline
        );
    }

    #[tokio::test]
    async fn deleted_rows_read_as_not_found() {
        let (dir, ctx) = context();
        std::fs::write(dir.path().join("external/a"), b"x").unwrap();
        let vp = VirtualPath::new("a").unwrap();
        ctx.store
            .upsert(&crate::entry::FileEntry::new_file(
                vp.clone(),
                Location::Deleted,
                1,
                now(),
            ))
            .unwrap();
        let router = ReadRouter::new(ctx);
        assert_eq!(router.resolve_read(&vp).await.unwrap(), ReadResolution::NotFound);
    }
}
