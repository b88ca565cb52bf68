use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::policy::{
    DownloadPolicy, DownloadPolicyKey, DownloadUsage, DEFAULT_BROWSE_CONNECTIONS,
    DEFAULT_BULK_CONNECTIONS,
};

/// A custom per-host policy (`[[download.policies]]` in config.toml).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PolicyConfig {
    /// Hostnames sharing this connection limit.
    pub hosts: Vec<String>,
    /// Usage class the policy applies to ("browse" or "bulk").
    pub usage: DownloadUsage,
    /// Maximum concurrent connections for matching requests.
    pub max_connections: usize,
}

impl PolicyConfig {
    pub fn to_policy(&self) -> DownloadPolicy {
        DownloadPolicy::new(
            DownloadPolicyKey::new(&self.hosts, self.usage),
            self.max_connections,
        )
    }
}

/// Download manager parameters (`[download]` section).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DownloadConfig {
    /// Global switch; when false every submission is dropped.
    pub enabled: bool,
    /// Connection limit of the built-in policy for interactive browsing.
    pub browse_max_connections: usize,
    /// Connection limit of the built-in policy for bulk downloads.
    pub bulk_max_connections: usize,
    /// Period of the shared retry timer in seconds.
    pub retry_interval_secs: f64,
    /// Retries per job after the first failed attempt.
    pub max_retries: u32,
    /// Capacity of the broadcast channel carrying download events.
    pub event_capacity: usize,
    /// Transport identifier reported in the User-Agent.
    pub user_agent_plugin: String,
    /// Custom per-host policies, registered at start-up in this order.
    pub policies: Vec<PolicyConfig>,
}

impl Default for DownloadConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            browse_max_connections: DEFAULT_BROWSE_CONNECTIONS,
            bulk_max_connections: DEFAULT_BULK_CONNECTIONS,
            retry_interval_secs: 60.0,
            max_retries: crate::download::DEFAULT_MAX_RETRIES,
            event_capacity: 1024,
            user_agent_plugin: crate::http::DEFAULT_PLUGIN_ID.to_string(),
            policies: Vec::new(),
        }
    }
}

impl DownloadConfig {
    /// Retry timer period; falls back to 60s for negative or non-finite values.
    pub fn retry_interval(&self) -> Duration {
        Duration::try_from_secs_f64(self.retry_interval_secs)
            .unwrap_or(Duration::from_secs(60))
    }
}

/// Disk cache parameters (`[cache]` section).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Cache root; `None` means `$XDG_CACHE_HOME/tilecache/cache`.
    pub data_dir: Option<PathBuf>,
    /// Hard quota in bytes. 0 disables eviction.
    pub hard_limit_bytes: u64,
    /// Width of the hysteresis band: eviction stops at `hard * (100 - p) / 100`.
    pub hysteresis_percent: u8,
    /// Maximum files deleted per eviction pass before yielding.
    pub eviction_batch: usize,
    /// Delay before an unfinished eviction continues, in milliseconds.
    pub eviction_delay_ms: u64,
    /// Zoom levels up to and including this one are never counted or evicted.
    pub base_tile_level: u32,
    /// `clear_cache` only runs when the root directory has this name.
    pub expected_root_name: String,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            data_dir: None,
            hard_limit_bytes: 999 * 1024 * 1024,
            hysteresis_percent: 5,
            eviction_batch: 20,
            eviction_delay_ms: 1000,
            base_tile_level: 4,
            expected_root_name: "cache".to_string(),
        }
    }
}

impl CacheConfig {
    /// Hysteresis percentage clamped to a usable range (soft limit must stay > 0).
    pub fn hysteresis(&self) -> u8 {
        self.hysteresis_percent.min(99)
    }

    pub fn eviction_delay(&self) -> Duration {
        Duration::from_millis(self.eviction_delay_ms)
    }

    /// Resolve the cache root, creating nothing.
    pub fn resolve_data_dir(&self) -> Result<PathBuf> {
        if let Some(dir) = &self.data_dir {
            return Ok(dir.clone());
        }
        let xdg_dirs = xdg::BaseDirectories::with_prefix("tilecache")?;
        Ok(xdg_dirs.get_cache_home().join("cache"))
    }
}

/// Global configuration loaded from `~/.config/tilecache/config.toml`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TileCacheConfig {
    #[serde(default)]
    pub download: DownloadConfig,
    #[serde(default)]
    pub cache: CacheConfig,
}

pub fn config_path() -> Result<PathBuf> {
    let xdg_dirs = xdg::BaseDirectories::with_prefix("tilecache")?;
    Ok(xdg_dirs.place_config_file("config.toml")?)
}

/// Load configuration from disk, creating a default file if none exists.
pub fn load_or_init() -> Result<TileCacheConfig> {
    let path = config_path()?;
    load_or_init_at(&path)
}

/// Same as `load_or_init` but for an explicit path.
pub fn load_or_init_at(path: &Path) -> Result<TileCacheConfig> {
    if !path.exists() {
        let default_cfg = TileCacheConfig::default();
        let toml = toml::to_string_pretty(&default_cfg)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, toml)
            .with_context(|| format!("failed to write default config: {}", path.display()))?;
        tracing::info!("created default config at {}", path.display());
        return Ok(default_cfg);
    }

    let data = fs::read_to_string(path)
        .with_context(|| format!("failed to read config: {}", path.display()))?;
    let cfg: TileCacheConfig =
        toml::from_str(&data).with_context(|| format!("invalid config: {}", path.display()))?;
    Ok(cfg)
}
