//! `tilecache cache trim` – evict old tiles until the cache fits its limit.

use anyhow::{bail, Context, Result};
use std::sync::Arc;
use std::time::Duration;
use tilecache_core::cache::CacheWatcher;
use tilecache_core::config::TileCacheConfig;

use super::{format_bytes, stop_watcher, watcher_stats};

pub async fn run_cache_trim(cfg: &TileCacheConfig, limit: Option<u64>) -> Result<()> {
    let mut cache_cfg = cfg.cache.clone();
    if let Some(limit) = limit {
        cache_cfg.hard_limit_bytes = limit;
    }
    if cache_cfg.hard_limit_bytes == 0 {
        bail!("cache limit is 0 (unlimited); pass --limit to trim");
    }
    let data_dir = cache_cfg.resolve_data_dir()?;
    let watcher = Arc::new(CacheWatcher::start(&data_dir, &cache_cfg)?);

    let poll = cache_cfg.eviction_delay() / 2 + Duration::from_millis(10);
    let mut stats = watcher_stats(&watcher).await?.context("cache watcher stopped")?;
    while stats.evicting {
        tokio::time::sleep(poll).await;
        stats = watcher_stats(&watcher).await?.context("cache watcher stopped")?;
    }
    stop_watcher(watcher).await?;

    println!(
        "Cache at {} is {} in {} tile(s)",
        data_dir.display(),
        format_bytes(stats.current_size),
        stats.indexed_files
    );
    if stats.hard_limit != cache_cfg.hard_limit_bytes {
        println!(
            "Limit raised to {}: remaining tiles are not evictable",
            format_bytes(stats.hard_limit)
        );
    }
    Ok(())
}
