//! CLI command handlers, one file per command.

mod clear;
mod fetch;
mod status;
mod trim;

pub use clear::run_cache_clear;
pub use fetch::{run_fetch, FetchArgs};
pub use status::run_cache_status;
pub use trim::run_cache_trim;

use anyhow::{Context, Result};
use std::sync::Arc;
use tilecache_core::cache::{CacheStats, CacheWatcher};

/// Ask the watcher for stats from the blocking pool; the call waits on its worker.
pub(crate) async fn watcher_stats(watcher: &Arc<CacheWatcher>) -> Result<Option<CacheStats>> {
    let watcher = Arc::clone(watcher);
    tokio::task::spawn_blocking(move || watcher.stats())
        .await
        .context("cache watcher stats task failed")
}

/// Stop the watcher from the blocking pool; shutting down joins its thread.
pub(crate) async fn stop_watcher(watcher: Arc<CacheWatcher>) -> Result<()> {
    tokio::task::spawn_blocking(move || watcher.shutdown())
        .await
        .context("cache watcher shutdown task failed")
}

/// Human-readable byte count, e.g. `12.5 MiB`.
pub(crate) fn format_bytes(bytes: u64) -> String {
    const UNITS: [&str; 4] = ["B", "KiB", "MiB", "GiB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{bytes} B")
    } else {
        format!("{value:.1} {}", UNITS[unit])
    }
}
