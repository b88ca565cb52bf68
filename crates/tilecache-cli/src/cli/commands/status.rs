//! `tilecache cache status` – show cache size and limits.

use anyhow::Result;
use serde::Serialize;
use std::sync::atomic::AtomicBool;
use tilecache_core::cache::{collect_tiles, CacheLimits, CacheStats, TileClassifier, MAPS_DIR};
use tilecache_core::config::TileCacheConfig;

use super::format_bytes;

#[derive(Serialize)]
struct StatusReport {
    data_dir: String,
    #[serde(flatten)]
    stats: CacheStats,
}

pub async fn run_cache_status(cfg: &TileCacheConfig, json: bool) -> Result<()> {
    let data_dir = cfg.cache.resolve_data_dir()?;
    let classifier = TileClassifier::new(cfg.cache.base_tile_level);
    let tiles = collect_tiles(&data_dir.join(MAPS_DIR), &classifier, &AtomicBool::new(false));
    let limits = CacheLimits::new(cfg.cache.hard_limit_bytes, cfg.cache.hysteresis());

    let report = StatusReport {
        data_dir: data_dir.display().to_string(),
        stats: CacheStats {
            current_size: tiles.iter().map(|t| t.size).sum(),
            hard_limit: limits.hard,
            soft_limit: limits.soft,
            indexed_files: tiles.len(),
            evicting: false,
        },
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }
    let stats = &report.stats;
    println!("{:<12} {}", "CACHE DIR", report.data_dir);
    println!(
        "{:<12} {} in {} tile(s)",
        "SIZE",
        format_bytes(stats.current_size),
        stats.indexed_files
    );
    if stats.hard_limit == 0 {
        println!("{:<12} unlimited", "LIMIT");
    } else {
        println!(
            "{:<12} {} (evicts down to {})",
            "LIMIT",
            format_bytes(stats.hard_limit),
            format_bytes(stats.soft_limit)
        );
    }
    Ok(())
}
