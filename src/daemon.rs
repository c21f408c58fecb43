use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};

use thiserror::Error;
use tokio::select;
use tokio::task::JoinHandle;

use tierfs::control::{ControlError, Controller, MountDriver};
use tierfs::vfs::TierFs;

use crate::app_config;
use tracing::{debug, error, info, warn};

mod managed_fuse {
    //! fuser only does a regular unmount when a `BackgroundSession` is dropped. A managed mount
    //! drops its session and then detaches the mount point for real, retrying while it is busy.
    use std::path::PathBuf;
    use std::sync::Arc;
    use std::time::Duration;

    use nix::errno::Errno;

    use super::{TierFs, debug, error};
    use fuser::BackgroundSession;
    use tierfs::fs::fuser::{FuserAdapter, MountOwner};

    pub struct ManagedFuse {
        session: Option<BackgroundSession>,
        mount_point: PathBuf,
    }

    impl ManagedFuse {
        pub fn spawn(
            fs: Arc<TierFs>,
            owner: MountOwner,
            mount_point: PathBuf,
            handle: tokio::runtime::Handle,
        ) -> Result<Self, std::io::Error> {
            let mut mount_opts = vec![
                fuser::MountOption::FSName(format!("tierfs:{}", fs.name())),
                fuser::MountOption::NoDev,
                fuser::MountOption::Exec,
                fuser::MountOption::AutoUnmount,
                fuser::MountOption::DefaultPermissions,
                fuser::MountOption::AllowOther,
            ];
            if owner.read_only {
                mount_opts.push(fuser::MountOption::RO);
            } else {
                mount_opts.push(fuser::MountOption::RW);
            }

            let adapter = FuserAdapter::new(fs, owner, handle);
            let session = fuser::spawn_mount2(adapter, &mount_point, &mount_opts)?;
            Ok(Self {
                session: Some(session),
                mount_point,
            })
        }
    }

    impl Drop for ManagedFuse {
        fn drop(&mut self) {
            const UMOUNT_ATTEMPT_COUNT: usize = 10;
            const UMOUNT_ATTEMPT_DELAY: Duration = Duration::from_millis(10);

            drop(self.session.take());
            debug!(mount_point = ?self.mount_point, "Confirming unmount of FUSE filesystem...");

            for i in 0..UMOUNT_ATTEMPT_COUNT {
                let result = {
                    #[cfg(target_os = "macos")]
                    {
                        nix::mount::unmount(&self.mount_point, nix::mount::MntFlags::MNT_FORCE)
                    }

                    #[cfg(target_os = "linux")]
                    {
                        nix::mount::umount2(&self.mount_point, nix::mount::MntFlags::MNT_DETACH)
                    }
                };

                match result {
                    Ok(()) => {
                        debug!(
                            "Successfully unmounted FUSE filesystem on attempt {}",
                            i + 1
                        );
                        break;
                    }
                    Err(Errno::EBUSY) => {
                        debug!(
                            "FUSE filesystem still busy on attempt {}. Retrying...",
                            i + 1
                        );
                        std::thread::sleep(UMOUNT_ATTEMPT_DELAY);
                    }
                    Err(Errno::EINVAL | Errno::ENOENT) => {
                        debug!("FUSE filesystem already unmounted (attempt {})", i + 1);
                        break;
                    }
                    Err(e) => {
                        error!(
                            "Failed to unmount FUSE filesystem on attempt {}: {}",
                            i + 1,
                            e
                        );
                        break;
                    }
                }
            }
        }
    }
}

#[derive(Debug, Error)]
pub enum DaemonError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Control(#[from] ControlError),

    #[error("no sync pairs are configured")]
    NoPairs,
}

/// Mounts pairs through FUSE at their configured mount points.
struct FuseDriver {
    config: app_config::Config,
    handle: tokio::runtime::Handle,
    sessions: Mutex<HashMap<String, managed_fuse::ManagedFuse>>,
}

impl FuseDriver {
    fn new(config: app_config::Config, handle: tokio::runtime::Handle) -> Self {
        Self {
            config,
            handle,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    fn mount_point(&self, pair: &str) -> Result<PathBuf, ControlError> {
        self.config
            .pair(pair)
            .map(|p| p.mount_point.clone())
            .ok_or_else(|| ControlError::UnknownPair(pair.to_owned()))
    }
}

impl MountDriver for FuseDriver {
    fn mount(&self, pair: &str, fs: Arc<TierFs>) -> Result<(), ControlError> {
        let mount_point = self.mount_point(pair)?;
        let owner = tierfs::fs::fuser::MountOwner {
            uid: self.config.uid,
            gid: self.config.gid,
            read_only: fs.status()?.read_only,
        };
        info!(pair, mount_point = %mount_point.display(), "Mounting filesystem.");
        let session =
            managed_fuse::ManagedFuse::spawn(fs, owner, mount_point, self.handle.clone())
                .map_err(ControlError::Mount)?;
        self.sessions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(pair.to_owned(), session);
        Ok(())
    }

    fn unmount(&self, pair: &str) -> Result<(), ControlError> {
        let session = self
            .sessions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(pair);
        match session {
            Some(session) => {
                drop(session);
                Ok(())
            }
            None => Err(ControlError::NotMounted(pair.to_owned())),
        }
    }
}

/// Prepares the mount point directory.
///
/// - If the directory exists and is non-empty, returns an error.
/// - If the directory does not exist, creates it (including parents) and logs an info message.
/// - If the directory exists and is empty, does nothing.
async fn prepare_mount_point(mount_point: &std::path::Path) -> Result<(), std::io::Error> {
    match tokio::fs::read_dir(mount_point).await {
        Ok(mut entries) => {
            if entries.next_entry().await?.is_some() {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::AlreadyExists,
                    format!(
                        "Mount point '{}' already exists and is not empty.",
                        mount_point.display()
                    ),
                ));
            }
            Ok(())
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            tokio::fs::create_dir_all(mount_point).await?;
            info!(path = %mount_point.display(), "Created mount point directory.");
            Ok(())
        }
        Err(e) => Err(e),
    }
}

/// Probe the external root of `pair` and report transitions to the engine.
fn spawn_availability_poller(
    controller: &Arc<Controller<FuseDriver>>,
    pair: &app_config::PairEntry,
) -> JoinHandle<()> {
    let controller = Arc::clone(controller);
    let name = pair.name.clone();
    let external = pair.external_dir.clone();
    let every = pair.availability_poll();
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        loop {
            ticker.tick().await;
            let online = tokio::fs::metadata(&external)
                .await
                .is_ok_and(|m| m.is_dir());
            let Ok(fs) = controller.pair(&name).await else {
                continue;
            };
            if online == fs.is_external_online() {
                continue;
            }
            if online {
                info!(pair = %name, "External store is reachable again.");
            } else {
                warn!(pair = %name, "External store went away.");
            }
            if let Err(e) = fs.set_external_online(online).await {
                error!(pair = %name, error = %e, "Failed to apply availability change.");
            }
        }
    })
}

async fn wait_for_exit() -> Result<(), std::io::Error> {
    use tokio::signal;
    let mut sigterm = signal::unix::signal(signal::unix::SignalKind::terminate())?;
    let mut sighup = signal::unix::signal(signal::unix::SignalKind::hangup())?;
    select! {
        _ = signal::ctrl_c() => {
            debug!("Received Ctrl+C signal, shutting down...");
        },
        _ = sigterm.recv() => {
            debug!("Received termination signal, shutting down...");
        },
        _ = sighup.recv() => {
            debug!("Received hangup signal, shutting down...");
        },
    }
    Ok(())
}

/// Main entry point for the daemon.
pub async fn run(
    config: app_config::Config,
    handle: tokio::runtime::Handle,
) -> Result<(), DaemonError> {
    if config.pairs.is_empty() {
        return Err(DaemonError::NoPairs);
    }
    tokio::fs::create_dir_all(&config.state_dir).await?;
    for pair in &config.pairs {
        prepare_mount_point(&pair.mount_point).await?;
    }

    let pairs: Vec<_> = config
        .pairs
        .iter()
        .map(|p| p.to_pair_config(&config.state_dir))
        .collect();
    let controller = Arc::new(Controller::new(
        pairs,
        FuseDriver::new(config.clone(), handle),
    ));

    for pair in &config.pairs {
        match controller.mount(&pair.name).await {
            Ok(report) => debug!(pair = %pair.name, ?report, "Sync pair initialized."),
            Err(e) => {
                controller.unmount_all().await;
                return Err(e.into());
            }
        }
    }

    let pollers: Vec<_> = config
        .pairs
        .iter()
        .map(|p| spawn_availability_poller(&controller, p))
        .collect();

    info!("tierfs is running. Press Ctrl+C to stop.");
    let exit = wait_for_exit().await;

    for poller in pollers {
        poller.abort();
    }
    controller.unmount_all().await;
    exit?;
    Ok(())
}

pub fn spawn(config: app_config::Config) -> Result<(), DaemonError> {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    runtime.block_on(run(config, runtime.handle().clone()))
}
