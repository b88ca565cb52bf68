//! Disk cache quota enforcement.
//!
//! [`CacheWatcher`] owns a worker thread that indexes tracked tiles by
//! modification time and deletes the oldest ones whenever the cache grows
//! past its hard limit, stopping once it is back under the soft limit.

mod state;
mod tiles;
mod watcher;

pub use state::{CacheLimits, CacheState, CacheStats, EvictionPass};
pub use tiles::{collect_tiles, TileClassifier, TileFile, MAPS_DIR, TILE_EXTENSIONS};
pub use watcher::CacheWatcher;
