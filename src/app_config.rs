//! Module for application configuration settings.
//!
//! User configurations may be specified in a configuration file.

use bytesize::ByteSize;
use thiserror::Error;
use tracing::{debug, info};

use std::{
    collections::HashSet,
    path::{Path, PathBuf},
    time::Duration,
};

use serde::{Deserialize, Serialize};

use tierfs::eviction::EvictionPolicy;
use tierfs::vfs::PairConfig;

fn tierfs_runtime_dir() -> Option<PathBuf> {
    let runtime_dir = dirs::runtime_dir();
    if let Some(path) = runtime_dir {
        return Some(path.join("tierfs"));
    }

    let home_dir = dirs::home_dir();
    if let Some(path) = home_dir {
        return Some(path.join(".local").join("share").join("tierfs"));
    }

    None
}

fn default_pid_file() -> PathBuf {
    tierfs_runtime_dir().map_or_else(
        || PathBuf::from("/var/run/tierfs.pid"),
        |rd| rd.join("tierfs.pid"),
    )
}

fn default_state_dir() -> PathBuf {
    dirs::state_dir()
        .map(|d| d.join("tierfs"))
        .or_else(|| dirs::home_dir().map(|h| h.join(".local").join("state").join("tierfs")))
        .unwrap_or_else(|| PathBuf::from("/var/lib/tierfs"))
}

fn current_uid() -> u32 {
    nix::unistd::Uid::current().as_raw()
}

fn current_gid() -> u32 {
    nix::unistd::Gid::current().as_raw()
}

fn default_quota() -> ByteSize {
    ByteSize::gib(10)
}

fn default_sync_debounce_ms() -> u64 {
    5000
}

fn default_eviction_interval_secs() -> u64 {
    60
}

fn default_eviction_reserve_fraction() -> f64 {
    0.1
}

fn default_eviction_max_per_run() -> usize {
    256
}

fn default_availability_poll_secs() -> u64 {
    5
}

fn yes() -> bool {
    true
}

/// Where the daemon writes its logs once detached.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct DaemonLogConfig {
    /// Log file. Inherits the parent's stdio when absent.
    pub file: Option<PathBuf>,
}

impl DaemonLogConfig {
    pub fn open_log_file(&self) -> std::io::Result<Option<std::fs::File>> {
        let Some(path) = &self.file else {
            return Ok(None);
        };
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map(Some)
    }
}

/// Daemon configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct DaemonConfig {
    /// The path to the PID file for the daemon. Uses /var/run/tierfs.pid if not specified.
    #[serde(default = "default_pid_file")]
    pub pid_file: PathBuf,

    #[serde(default)]
    pub log: DaemonLogConfig,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            pid_file: default_pid_file(),
            log: DaemonLogConfig::default(),
        }
    }
}

/// One local/external root pair exposed at a mount point.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct PairEntry {
    pub name: String,
    pub local_dir: PathBuf,
    pub external_dir: PathBuf,
    pub mount_point: PathBuf,

    /// The most the local cache may hold.
    #[serde(default = "default_quota")]
    pub local_quota: ByteSize,

    #[serde(default = "default_sync_debounce_ms")]
    pub sync_debounce_ms: u64,

    #[serde(default = "default_eviction_interval_secs")]
    pub eviction_interval_secs: u64,

    /// Share of the quota kept free by the periodic eviction cycle.
    #[serde(default = "default_eviction_reserve_fraction")]
    pub eviction_reserve_fraction: f64,

    #[serde(default = "default_eviction_max_per_run")]
    pub eviction_max_per_run: usize,

    #[serde(default = "yes")]
    pub verify_checksums: bool,

    #[serde(default)]
    pub read_only: bool,

    #[serde(default = "yes")]
    pub tree_versions: bool,

    /// How often the external root is probed for availability.
    #[serde(default = "default_availability_poll_secs")]
    pub availability_poll_secs: u64,
}

impl PairEntry {
    /// The library configuration for this pair, with its database under `state_dir`.
    pub fn to_pair_config(&self, state_dir: &Path) -> PairConfig {
        let mut pair = PairConfig::new(
            &self.name,
            self.local_dir.clone(),
            self.external_dir.clone(),
            database_path(state_dir, &self.name),
        );
        pair.sync_debounce = Duration::from_millis(self.sync_debounce_ms);
        pair.eviction = EvictionPolicy {
            quota: self.local_quota.as_u64(),
            max_per_run: self.eviction_max_per_run,
            reserve_fraction: self.eviction_reserve_fraction,
        };
        pair.eviction_interval = Duration::from_secs(self.eviction_interval_secs);
        pair.verify_checksums = self.verify_checksums;
        pair.read_only = self.read_only;
        pair.tree_versions = self.tree_versions;
        pair
    }

    pub fn availability_poll(&self) -> Duration {
        Duration::from_secs(self.availability_poll_secs.max(1))
    }
}

/// The metadata database of pair `name`.
pub fn database_path(state_dir: &Path, name: &str) -> PathBuf {
    state_dir.join(format!("{name}.sqlite"))
}

/// Application configuration structure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct Config {
    #[serde(default)]
    pub daemon: DaemonConfig,

    /// Metadata databases live here, one per pair.
    #[serde(default = "default_state_dir")]
    pub state_dir: PathBuf,

    /// The user to mount the filesystem as. If not specified, runs as the current user.
    #[serde(default = "current_uid")]
    pub uid: u32,

    /// The group to mount the filesystem as. If not specified, runs as the current group.
    #[serde(default = "current_gid")]
    pub gid: u32,

    #[serde(default)]
    pub pairs: Vec<PairEntry>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            daemon: DaemonConfig::default(),
            state_dir: default_state_dir(),
            uid: current_uid(),
            gid: current_gid(),
            pairs: Vec::new(),
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Configuration validation errors: {0:?}")]
    ValidationErrors(Vec<String>),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] toml::ser::Error),

    #[error("Deserialization error: {0}")]
    DeserializationError(#[from] toml::de::Error),

    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Config parent directory does not exist.")]
    NoParentDir,

    #[error("No suitable configuration path found.")]
    NoSuitableConfigPath,
}

fn overlaps(a: &Path, b: &Path) -> bool {
    a.starts_with(b) || b.starts_with(a)
}

impl Config {
    /// Validate the correctness of the configuration.
    ///
    /// Returns:
    /// - `Ok(())` if the configuration is valid.
    /// - `Err(Vec<String>)` containing every validation error found.
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.daemon.pid_file.parent().is_none() {
            errors.push(format!(
                "PID file path '{}' has no parent directory.",
                self.daemon.pid_file.display()
            ));
        }

        let mut names = HashSet::new();
        for pair in &self.pairs {
            if pair.name.is_empty() || pair.name.contains(['/', '\\']) {
                errors.push(format!("Pair name '{}' is not a plain name.", pair.name));
            }
            if !names.insert(pair.name.as_str()) {
                errors.push(format!("Pair name '{}' is used more than once.", pair.name));
            }
            if overlaps(&pair.local_dir, &pair.external_dir) {
                errors.push(format!(
                    "Pair '{}': local and external directories overlap.",
                    pair.name
                ));
            }
            if overlaps(&pair.mount_point, &pair.local_dir)
                || overlaps(&pair.mount_point, &pair.external_dir)
            {
                errors.push(format!(
                    "Pair '{}': mount point overlaps a backing directory.",
                    pair.name
                ));
            }
            if pair.local_quota.as_u64() == 0 {
                errors.push(format!("Pair '{}': local-quota must be positive.", pair.name));
            }
            if !(0.0..1.0).contains(&pair.eviction_reserve_fraction) {
                errors.push(format!(
                    "Pair '{}': eviction-reserve-fraction must be in [0, 1).",
                    pair.name
                ));
            }
        }

        for (i, a) in self.pairs.iter().enumerate() {
            for b in &self.pairs[i + 1..] {
                if overlaps(&a.mount_point, &b.mount_point) {
                    errors.push(format!(
                        "Pairs '{}' and '{}' have overlapping mount points.",
                        a.name, b.name
                    ));
                }
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }

    /// The configured pair called `name`.
    pub fn pair(&self, name: &str) -> Option<&PairEntry> {
        self.pairs.iter().find(|p| p.name == name)
    }

    /// Returns config file paths in descending priority order.
    /// On macOS, skips `dirs::config_dir()` (resolves to ~/Library/Application Support/).
    fn config_search_paths() -> Vec<PathBuf> {
        let mut paths = Vec::new();

        #[cfg(not(target_os = "macos"))]
        if let Some(xdg) = dirs::config_dir() {
            paths.push(xdg.join("tierfs").join("config.toml"));
        }

        if let Some(home) = dirs::home_dir() {
            paths.push(home.join(".config").join("tierfs").join("config.toml"));
        }

        paths.push(PathBuf::from("/etc/tierfs/config.toml"));

        paths
    }

    /// Finds the first existing config file from search paths.
    fn find_config_file() -> Option<PathBuf> {
        Self::config_search_paths().into_iter().find(|p| p.exists())
    }

    /// Loads config from a single TOML file.
    fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        debug!(path = ?path, "Loading configuration file.");
        let content = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&content)?;
        Ok(config)
    }

    /// Loads configuration from the first found config file, or the external path if given.
    pub fn load(external_config_path: Option<&Path>) -> Option<Result<Self, ConfigError>> {
        if let Some(path) = external_config_path {
            return Some(Self::load_from_file(path));
        }

        Self::find_config_file().map(|path| Self::load_from_file(&path))
    }

    /// Loads config or writes an empty default if none exists.
    /// Errors if a config file exists but is malformed.
    pub fn load_or_create(external_config_path: Option<&Path>) -> Result<Self, ConfigError> {
        if let Some(res) = Self::load(external_config_path) {
            let config = res?;
            if let Err(validation_errors) = config.validate() {
                return Err(ConfigError::ValidationErrors(validation_errors));
            }
            debug!("Loaded configuration successfully.");
            return Ok(config);
        }

        let creation_path = Self::config_search_paths()
            .into_iter()
            .next()
            .ok_or(ConfigError::NoSuitableConfigPath)?;

        let config = Self::default();
        config.write_to_disk(&creation_path)?;
        info!(path = ?creation_path.display(), "Created configuration file.");
        Ok(config)
    }

    fn write_to_disk(&self, path: &Path) -> Result<(), ConfigError> {
        let toml_str = toml::to_string_pretty(self)?;
        std::fs::create_dir_all(path.parent().ok_or(ConfigError::NoParentDir)?)?;
        std::fs::write(path, toml_str)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
        state-dir = "/var/lib/tierfs"

        [[pairs]]
        name = "photos"
        local-dir = "/cache/photos"
        external-dir = "/mnt/nas/photos"
        mount-point = "/home/me/photos"
        local-quota = "2 GiB"
        sync-debounce-ms = 250
    "#;

    #[test]
    fn pairs_fill_in_defaults() {
        let config: Config = toml::from_str(SAMPLE).unwrap();
        assert!(config.validate().is_ok());
        let pair = config.pair("photos").unwrap();
        assert_eq!(pair.local_quota, ByteSize::gib(2));
        assert!(pair.verify_checksums);
        assert!(pair.tree_versions);
        assert!(!pair.read_only);

        let lib = pair.to_pair_config(&config.state_dir);
        assert_eq!(lib.sync_debounce, Duration::from_millis(250));
        assert_eq!(lib.eviction.quota, ByteSize::gib(2).as_u64());
        assert_eq!(lib.database, PathBuf::from("/var/lib/tierfs/photos.sqlite"));
    }

    #[test]
    fn validation_reports_every_problem() {
        let mut config: Config = toml::from_str(SAMPLE).unwrap();
        let mut dup = config.pairs[0].clone();
        dup.local_dir = PathBuf::from("/mnt/nas/photos/cache");
        dup.local_quota = ByteSize::b(0);
        config.pairs.push(dup);

        let errors = config.validate().unwrap_err();
        assert!(errors.iter().any(|e| e.contains("more than once")));
        assert!(errors.iter().any(|e| e.contains("overlap")));
        assert!(errors.iter().any(|e| e.contains("local-quota")));
        assert!(errors.iter().any(|e| e.contains("mount points")));
    }
}
