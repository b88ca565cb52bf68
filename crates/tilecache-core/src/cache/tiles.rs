//! Which files under the cache root count as evictable tiles.
//!
//! Layout: `<root>/maps/<planet>/<theme>/<level>/<x>/<y>.<ext>`. Only files
//! at a zoom level strictly greater than the base tile level, with a known
//! tile extension, are counted toward the quota, evicted, or cleared. Base
//! levels are tiny and expensive to refetch when offline, so they stay.

use std::path::{Component, Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::SystemTime;

use tracing::debug;

/// Directory below the cache root that holds tile trees.
pub const MAPS_DIR: &str = "maps";

/// Raster image formats plus the o5m vector tile format.
pub const TILE_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png", "gif", "svg", "o5m"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TileClassifier {
    base_tile_level: u32,
}

impl TileClassifier {
    pub fn new(base_tile_level: u32) -> Self {
        Self { base_tile_level }
    }

    pub fn base_tile_level(&self) -> u32 {
        self.base_tile_level
    }

    /// `relative` is a file path relative to `<root>/maps`.
    pub fn is_tracked(&self, relative: &Path) -> bool {
        let parts: Vec<&str> = relative
            .components()
            .filter_map(|c| match c {
                Component::Normal(s) => s.to_str(),
                _ => None,
            })
            .collect();
        // planet / theme / level / x / file
        if parts.len() < 5 {
            return false;
        }
        let Ok(level) = parts[2].parse::<u32>() else {
            return false;
        };
        if level <= self.base_tile_level {
            return false;
        }
        relative
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| {
                let e = e.to_ascii_lowercase();
                TILE_EXTENSIONS.contains(&e.as_str())
            })
            .unwrap_or(false)
    }
}

/// A tracked tile found on disk.
#[derive(Debug, Clone)]
pub struct TileFile {
    pub path: PathBuf,
    pub size: u64,
    pub modified: SystemTime,
}

/// Walk `maps_dir` and return every tracked tile. Stops early (returning what
/// was found so far) once `quitting` is set.
pub fn collect_tiles(maps_dir: &Path, classifier: &TileClassifier, quitting: &AtomicBool) -> Vec<TileFile> {
    let mut files = Vec::new();
    collect_recursive(maps_dir, maps_dir, classifier, quitting, &mut files);
    files
}

fn collect_recursive(
    maps_dir: &Path,
    dir: &Path,
    classifier: &TileClassifier,
    quitting: &AtomicBool,
    files: &mut Vec<TileFile>,
) {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) => {
            debug!(dir = %dir.display(), error = %e, "skipping unreadable cache directory");
            return;
        }
    };

    for entry in entries.flatten() {
        if quitting.load(Ordering::Relaxed) {
            return;
        }
        let Ok(file_type) = entry.file_type() else {
            continue;
        };
        let path = entry.path();
        if file_type.is_dir() {
            collect_recursive(maps_dir, &path, classifier, quitting, files);
            continue;
        }
        if !file_type.is_file() {
            continue;
        }
        let tracked = path
            .strip_prefix(maps_dir)
            .map(|rel| classifier.is_tracked(rel))
            .unwrap_or(false);
        if !tracked {
            continue;
        }
        if let Ok(metadata) = entry.metadata() {
            files.push(TileFile {
                size: metadata.len(),
                modified: metadata.modified().unwrap_or(SystemTime::UNIX_EPOCH),
                path,
            });
        }
    }
}
