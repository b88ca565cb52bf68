//! `tilecache cache clear` – delete every evictable tile.

use anyhow::{bail, Result};
use tilecache_core::config::TileCacheConfig;
use tilecache_core::storage::{FileStoragePolicy, StoragePolicy};

pub async fn run_cache_clear(cfg: &TileCacheConfig) -> Result<()> {
    let data_dir = cfg.cache.resolve_data_dir()?;
    let storage = FileStoragePolicy::new(&data_dir, &cfg.cache);
    if !storage.clear_cache() {
        bail!("{}", storage.last_error_message());
    }
    println!("Cleared tile cache at {}", data_dir.display());
    Ok(())
}
