//! Persistence of downloaded tiles.
//!
//! Names are `/`-separated paths relative to the cache root, for example
//! `maps/earth/osm/7/64/42.png`. Every write reports the signed change in
//! on-disk size to the registered listeners; the cache watcher is the usual
//! listener.

mod file;

pub use file::FileStoragePolicy;

/// Storage backend used by the download manager.
pub trait StoragePolicy: Send + Sync {
    fn file_exists(&self, name: &str) -> bool;

    /// Replace the content stored under `name`. Returns false on failure; the
    /// reason is available from `last_error_message`.
    fn update_file(&self, name: &str, data: &[u8]) -> bool;

    fn read_file(&self, name: &str) -> Option<Vec<u8>>;

    /// Remove evictable tiles. Returns false when the backend refuses.
    fn clear_cache(&self) -> bool;

    /// Text of the most recent failure, empty if none.
    fn last_error_message(&self) -> String;
}

/// Receives size notifications from a storage backend.
pub trait StorageListener: Send + Sync {
    /// `delta` = size after the write minus size before it, in bytes.
    fn size_changed(&self, delta: i64);

    /// The evictable part of the cache was emptied.
    fn cleared(&self);
}
