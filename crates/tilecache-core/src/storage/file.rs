//! Filesystem-backed tile storage.
//!
//! Writes go to `<name>.part` first and are renamed into place, so readers
//! never see a half-written tile.

use std::ffi::OsString;
use std::fs;
use std::io::Write;
use std::path::{Component, Path, PathBuf};
use std::sync::atomic::AtomicBool;
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use anyhow::{bail, Context, Result};
use tracing::{debug, info, warn};

use super::{StorageListener, StoragePolicy};
use crate::cache::{collect_tiles, TileClassifier, MAPS_DIR};
use crate::config::CacheConfig;

/// Temporary file suffix used before the atomic rename.
pub const TEMP_SUFFIX: &str = ".part";

pub struct FileStoragePolicy {
    root: PathBuf,
    classifier: TileClassifier,
    expected_root_name: String,
    last_error: Mutex<String>,
    listeners: RwLock<Vec<Arc<dyn StorageListener>>>,
}

impl FileStoragePolicy {
    pub fn new(root: impl Into<PathBuf>, cfg: &CacheConfig) -> Self {
        Self {
            root: root.into(),
            classifier: TileClassifier::new(cfg.base_tile_level),
            expected_root_name: cfg.expected_root_name.clone(),
            last_error: Mutex::new(String::new()),
            listeners: RwLock::new(Vec::new()),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn add_listener(&self, listener: Arc<dyn StorageListener>) {
        self.listeners
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(listener);
    }

    /// Absolute path for `name`. Rejects absolute names and `..` components.
    pub fn path_for(&self, name: &str) -> Result<PathBuf> {
        let relative = Path::new(name);
        let mut path = self.root.clone();
        let mut any = false;
        for component in relative.components() {
            match component {
                Component::Normal(part) => {
                    path.push(part);
                    any = true;
                }
                Component::CurDir => {}
                _ => bail!("invalid storage name {name:?}"),
            }
        }
        if !any {
            bail!("empty storage name");
        }
        Ok(path)
    }

    fn set_last_error(&self, message: String) {
        *self.last_error.lock().unwrap_or_else(PoisonError::into_inner) = message;
    }

    fn notify_size(&self, delta: i64) {
        for listener in self.listeners.read().unwrap_or_else(PoisonError::into_inner).iter() {
            listener.size_changed(delta);
        }
    }

    fn notify_cleared(&self) {
        for listener in self.listeners.read().unwrap_or_else(PoisonError::into_inner).iter() {
            listener.cleared();
        }
    }

    fn write_atomic(path: &Path, data: &[u8]) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create directory {}", parent.display()))?;
        }
        let temp = temp_path(path);
        let result = (|| -> Result<()> {
            let mut file = fs::File::create(&temp)
                .with_context(|| format!("failed to create {}", temp.display()))?;
            file.write_all(data)
                .with_context(|| format!("failed to write {}", temp.display()))?;
            drop(file);
            fs::rename(&temp, path).with_context(|| {
                format!("failed to rename {} to {}", temp.display(), path.display())
            })
        })();
        if result.is_err() {
            let _ = fs::remove_file(&temp);
        }
        result
    }
}

fn file_size(path: &Path) -> u64 {
    fs::metadata(path).map(|m| m.len()).unwrap_or(0)
}

/// `file.png` → `file.png.part`
fn temp_path(final_path: &Path) -> PathBuf {
    let mut o: OsString = final_path.as_os_str().to_owned();
    o.push(TEMP_SUFFIX);
    PathBuf::from(o)
}

impl StoragePolicy for FileStoragePolicy {
    fn file_exists(&self, name: &str) -> bool {
        self.path_for(name).map(|p| p.is_file()).unwrap_or(false)
    }

    fn update_file(&self, name: &str, data: &[u8]) -> bool {
        let path = match self.path_for(name) {
            Ok(path) => path,
            Err(e) => {
                self.set_last_error(e.to_string());
                self.notify_size(0);
                return false;
            }
        };
        let old_size = file_size(&path);
        let result = Self::write_atomic(&path, data);
        let new_size = file_size(&path);
        self.notify_size(new_size as i64 - old_size as i64);

        match result {
            Ok(()) => {
                debug!(name, bytes = data.len(), "tile stored");
                true
            }
            Err(e) => {
                self.set_last_error(format!("{e:#}"));
                false
            }
        }
    }

    fn read_file(&self, name: &str) -> Option<Vec<u8>> {
        let path = self.path_for(name).ok()?;
        fs::read(path).ok()
    }

    fn clear_cache(&self) -> bool {
        let root_name = self.root.file_name().and_then(|n| n.to_str()).unwrap_or("");
        if root_name != self.expected_root_name {
            let message = format!(
                "refusing to clear {}: directory is not named {:?}",
                self.root.display(),
                self.expected_root_name
            );
            warn!("{message}");
            self.set_last_error(message);
            return false;
        }

        let quitting = AtomicBool::new(false);
        let tiles = collect_tiles(&self.root.join(MAPS_DIR), &self.classifier, &quitting);
        let mut removed = 0usize;
        for tile in &tiles {
            match fs::remove_file(&tile.path) {
                Ok(()) => removed += 1,
                Err(e) => warn!(path = %tile.path.display(), error = %e, "failed to remove tile"),
            }
        }
        info!(root = %self.root.display(), removed, "tile cache cleared");
        self.notify_cleared();
        true
    }

    fn last_error_message(&self) -> String {
        self.last_error
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}
