use std::path::{Path, PathBuf};
use std::time::Duration;
use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

/// Concurrency ceiling used when none is configured. Large enough to be
/// effectively unbounded for a single invocation.
pub const DEFAULT_CONCURRENCY: usize = 1024;

/// Numeric owner applied to finished files
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ownership {
    pub uid: u32,
    pub gid: u32,
}

/// Remote store settings used by uploads and placement
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteConfig {
    /// SSH destination, e.g. `media@nas`
    pub host: String,
    /// Candidate library roots on the remote host, each living on a storage pool
    pub roots: Vec<PathBuf>,
    /// Command printing one row per pool with its utilization percentage
    #[serde(default = "default_disk_usage_command")]
    pub disk_usage_command: String,
}

fn default_disk_usage_command() -> String {
    "zpool list -H -o name,capacity".to_string()
}

/// Configuration for the media maintenance engine
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Maximum number of tasks executing at once
    pub concurrency: usize,
    /// Keep sources around after a successful operation (as `.bak` files for local edits)
    pub keep_original: bool,
    /// Owner to apply to produced files and directories
    pub owner: Option<Ownership>,
    /// Mode applied to produced files (TOML accepts `0o644`)
    pub file_mode: Option<u32>,
    /// Mode applied to directories created on the remote store
    pub dir_mode: Option<u32>,
    /// Interval between progress polls of a running tool
    pub poll_interval_ms: u64,
    /// Path to mkvmerge (merging and identification)
    pub mkvmerge_bin: PathBuf,
    /// Path to mkvpropedit (in-place metadata edits)
    pub mkvpropedit_bin: PathBuf,
    /// Path to rsync (uploads)
    pub rsync_bin: PathBuf,
    /// Path to subsync (subtitle timing)
    pub subsync_bin: PathBuf,
    /// Path to ssh (remote commands and rsync transport)
    pub ssh_bin: PathBuf,
    /// Remote store, required for uploads only
    pub remote: Option<RemoteConfig>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self::default_config()
    }
}

impl EngineConfig {
    /// Create a default configuration with sensible values
    pub fn default_config() -> Self {
        Self {
            concurrency: DEFAULT_CONCURRENCY,
            keep_original: false,
            owner: None,
            file_mode: None,
            dir_mode: None,
            poll_interval_ms: 100,
            mkvmerge_bin: PathBuf::from("mkvmerge"),
            mkvpropedit_bin: PathBuf::from("mkvpropedit"),
            rsync_bin: PathBuf::from("rsync"),
            subsync_bin: PathBuf::from("subsync"),
            ssh_bin: PathBuf::from("ssh"),
            remote: None,
        }
    }

    /// Load configuration from a file, or return defaults if path is None or file doesn't exist
    pub fn load_config(path: Option<&Path>) -> Result<Self> {
        let mut config = Self::default_config();

        if let Some(config_path) = path {
            if config_path.exists() {
                let content = std::fs::read_to_string(config_path)
                    .with_context(|| format!("Failed to read config file: {}", config_path.display()))?;

                // TOML by extension, JSON otherwise
                if config_path.extension().and_then(|s| s.to_str()) == Some("toml") {
                    config = toml::from_str(&content)
                        .with_context(|| format!("Failed to parse TOML config: {}", config_path.display()))?;
                } else {
                    config = serde_json::from_str(&content)
                        .with_context(|| format!("Failed to parse JSON config: {}", config_path.display()))?;
                }
            } else {
                log::warn!("Config file {} not found, using defaults", config_path.display());
            }
        }

        config.validate()?;
        Ok(config)
    }

    /// Reject values that would make every task fail
    pub fn validate(&self) -> Result<()> {
        if self.concurrency == 0 {
            bail!("concurrency must be at least 1");
        }
        if self.poll_interval_ms == 0 {
            bail!("poll_interval_ms must be at least 1");
        }
        if let Some(remote) = &self.remote {
            if remote.host.trim().is_empty() {
                bail!("remote.host must not be empty");
            }
            if remote.roots.is_empty() {
                bail!("remote.roots must list at least one destination root");
            }
        }
        Ok(())
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Remote settings, or an error naming the missing section
    pub fn remote(&self) -> Result<&RemoteConfig> {
        self.remote
            .as_ref()
            .context("No [remote] section configured; uploads need a host and at least one root")
    }
}
