//! Background worker that keeps the tile cache under its quota.
//!
//! The worker thread scans the cache once at start-up, then applies size
//! deltas and limit changes as messages in arrival order. Only the limit pair
//! is shared with the handle (behind a mutex) so a running eviction pass
//! notices a new limit immediately.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use tracing::{debug, info};

use crate::config::CacheConfig;
use crate::storage::StorageListener;

use super::state::{CacheLimits, CacheState, CacheStats, SharedLimits};
use super::tiles::{collect_tiles, TileClassifier, MAPS_DIR};

enum WatcherCommand {
    SizeChanged(i64),
    Cleared,
    LimitChanged,
    Stats(Sender<CacheStats>),
    Quit,
}

/// Handle to the cache watcher worker. Dropping it stops the worker.
pub struct CacheWatcher {
    data_dir: PathBuf,
    commands: Sender<WatcherCommand>,
    limits: SharedLimits,
    hysteresis_percent: u8,
    quitting: Arc<AtomicBool>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl CacheWatcher {
    /// Create the cache root if needed and start the worker thread.
    pub fn start(data_dir: &Path, cfg: &CacheConfig) -> Result<Self> {
        std::fs::create_dir_all(data_dir)
            .with_context(|| format!("failed to create cache dir: {}", data_dir.display()))?;

        let hysteresis_percent = cfg.hysteresis();
        let limits = Arc::new(Mutex::new(CacheLimits::new(cfg.hard_limit_bytes, hysteresis_percent)));
        let quitting = Arc::new(AtomicBool::new(false));
        let (tx, rx) = mpsc::channel();

        let worker = Worker {
            maps_dir: data_dir.join(MAPS_DIR),
            classifier: TileClassifier::new(cfg.base_tile_level),
            state: CacheState::new(
                Arc::clone(&limits),
                hysteresis_percent,
                cfg.eviction_batch,
                Arc::clone(&quitting),
            ),
            quitting: Arc::clone(&quitting),
            delay: cfg.eviction_delay(),
        };
        let handle = std::thread::Builder::new()
            .name("cache-watcher".to_string())
            .spawn(move || worker.run(rx))
            .context("failed to spawn cache watcher thread")?;

        info!(
            data_dir = %data_dir.display(),
            hard_limit = cfg.hard_limit_bytes,
            "cache watcher started"
        );
        Ok(Self {
            data_dir: data_dir.to_path_buf(),
            commands: tx,
            limits,
            hysteresis_percent,
            quitting,
            worker: Mutex::new(Some(handle)),
        })
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    /// Set the hard limit in bytes; the soft limit follows. 0 disables eviction.
    pub fn set_cache_limit(&self, bytes: u64) {
        *self.limits.lock().unwrap_or_else(PoisonError::into_inner) =
            CacheLimits::new(bytes, self.hysteresis_percent);
        self.send(WatcherCommand::LimitChanged);
    }

    pub fn cache_limit(&self) -> u64 {
        self.limits.lock().unwrap_or_else(PoisonError::into_inner).hard
    }

    pub fn add_to_current_size(&self, delta: i64) {
        self.send(WatcherCommand::SizeChanged(delta));
    }

    pub fn reset_current_size(&self) {
        self.send(WatcherCommand::Cleared);
    }

    /// Ask the worker for a snapshot. Blocks until the start-up scan is done
    /// and all earlier messages are applied; `None` once the worker stopped.
    pub fn stats(&self) -> Option<CacheStats> {
        let (tx, rx) = mpsc::channel();
        self.commands.send(WatcherCommand::Stats(tx)).ok()?;
        rx.recv().ok()
    }

    /// Stop the worker, aborting a running scan or eviction pass, and wait for it.
    pub fn shutdown(&self) {
        self.quitting.store(true, Ordering::Relaxed);
        self.send(WatcherCommand::Quit);
        let handle = self
            .worker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                tracing::warn!("cache watcher thread panicked");
            }
            debug!("cache watcher stopped");
        }
    }

    fn send(&self, cmd: WatcherCommand) {
        if self.commands.send(cmd).is_err() {
            debug!("cache watcher is not running; message dropped");
        }
    }
}

impl Drop for CacheWatcher {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl StorageListener for CacheWatcher {
    fn size_changed(&self, delta: i64) {
        self.add_to_current_size(delta);
    }

    fn cleared(&self) {
        self.reset_current_size();
    }
}

struct Worker {
    maps_dir: PathBuf,
    classifier: TileClassifier,
    state: CacheState,
    quitting: Arc<AtomicBool>,
    delay: Duration,
}

impl Worker {
    fn run(mut self, rx: Receiver<WatcherCommand>) {
        let started = Instant::now();
        let tiles = collect_tiles(&self.maps_dir, &self.classifier, &self.quitting);
        self.state.load_index(tiles);
        info!(
            current_size = self.state.current_size(),
            files = self.state.indexed_files(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "tile cache scan complete"
        );

        let mut deferred_until = self.run_pass();
        loop {
            if self.quitting.load(Ordering::Relaxed) {
                break;
            }
            let next = match deferred_until {
                Some(deadline) => {
                    match rx.recv_timeout(deadline.saturating_duration_since(Instant::now())) {
                        Ok(cmd) => Some(cmd),
                        Err(RecvTimeoutError::Timeout) => None,
                        Err(RecvTimeoutError::Disconnected) => break,
                    }
                }
                None => match rx.recv() {
                    Ok(cmd) => Some(cmd),
                    Err(_) => break,
                },
            };
            match next {
                Some(WatcherCommand::SizeChanged(delta)) => self.state.add_to_current_size(delta),
                Some(WatcherCommand::Cleared) => self.state.reset_current_size(),
                Some(WatcherCommand::LimitChanged) | None => {}
                Some(WatcherCommand::Stats(reply)) => {
                    let _ = reply.send(self.state.stats());
                    continue;
                }
                Some(WatcherCommand::Quit) => break,
            }
            // While a pass is deferred, messages only update bookkeeping.
            let due = deferred_until.map_or(true, |deadline| Instant::now() >= deadline);
            if due {
                deferred_until = self.run_pass();
            }
        }
    }

    fn run_pass(&mut self) -> Option<Instant> {
        match self.state.ensure_cache_size() {
            Some(pass) if pass.deferred => {
                debug!(
                    files_deleted = pass.files_deleted,
                    current_size = self.state.current_size(),
                    "eviction batch done, continuing shortly"
                );
                Some(Instant::now() + self.delay)
            }
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write(path: &Path, size: usize, age_secs: u64) {
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, vec![0u8; size]).unwrap();
        let mtime = std::time::SystemTime::now() - Duration::from_secs(age_secs);
        filetime::set_file_mtime(path, filetime::FileTime::from_system_time(mtime)).unwrap();
    }

    fn config(hard: u64) -> CacheConfig {
        CacheConfig {
            hard_limit_bytes: hard,
            eviction_delay_ms: 10,
            ..CacheConfig::default()
        }
    }

    #[test]
    fn startup_scan_counts_only_tracked_tiles() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("cache");
        write(&root.join("maps/earth/osm/5/0/0.png"), 300, 10);
        write(&root.join("maps/earth/osm/9/1/1.o5m"), 200, 10);
        write(&root.join("maps/earth/osm/2/0/0.png"), 1000, 10);

        let watcher = CacheWatcher::start(&root, &config(0)).unwrap();
        let stats = watcher.stats().unwrap();
        assert_eq!(stats.current_size, 500);
        assert_eq!(stats.indexed_files, 2);
        assert_eq!(stats.hard_limit, 0);
    }

    #[test]
    fn deltas_are_applied_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("cache");
        write(&root.join("maps/earth/osm/5/0/0.png"), 100, 10);

        let watcher = CacheWatcher::start(&root, &config(0)).unwrap();
        for delta in [40, -10, 500, -1000, 25] {
            watcher.add_to_current_size(delta);
        }
        // 100 + 40 - 10 + 500 = 630, then clamped to 0, then +25.
        assert_eq!(watcher.stats().unwrap().current_size, 25);
        watcher.reset_current_size();
        assert_eq!(watcher.stats().unwrap().current_size, 0);
    }

    #[test]
    fn lowering_the_limit_evicts_oldest_tiles() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("cache");
        write(&root.join("maps/earth/osm/5/0/0.png"), 500, 300);
        write(&root.join("maps/earth/osm/5/0/1.png"), 400, 200);
        write(&root.join("maps/earth/osm/5/0/2.png"), 300, 100);

        let watcher = CacheWatcher::start(&root, &config(0)).unwrap();
        assert_eq!(watcher.stats().unwrap().current_size, 1200);

        watcher.set_cache_limit(1000);
        assert_eq!(watcher.cache_limit(), 1000);
        let stats = watcher.stats().unwrap();
        assert_eq!(stats.current_size, 700);
        assert_eq!(stats.soft_limit, 950);
        assert!(!root.join("maps/earth/osm/5/0/0.png").exists());
        assert!(root.join("maps/earth/osm/5/0/1.png").exists());
    }

    #[test]
    fn deferred_batches_finish_after_delay() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("cache");
        for i in 0..5u64 {
            write(&root.join(format!("maps/earth/osm/6/0/{i}.png")), 100, 500 - i * 60);
        }
        let cfg = CacheConfig {
            hard_limit_bytes: 200,
            eviction_batch: 1,
            eviction_delay_ms: 5,
            ..CacheConfig::default()
        };
        let watcher = CacheWatcher::start(&root, &cfg).unwrap();

        let deadline = Instant::now() + Duration::from_secs(5);
        let mut stats = watcher.stats().unwrap();
        while stats.evicting && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(10));
            stats = watcher.stats().unwrap();
        }
        // soft limit 190: three deletions bring 500 down to 200, a fourth to 100.
        assert!(!stats.evicting);
        assert_eq!(stats.current_size, 100);
        assert!(root.join("maps/earth/osm/6/0/4.png").exists());
        assert!(!root.join("maps/earth/osm/6/0/0.png").exists());
    }

    #[test]
    fn shutdown_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let watcher = CacheWatcher::start(&dir.path().join("cache"), &config(0)).unwrap();
        watcher.shutdown();
        watcher.shutdown();
        assert!(watcher.stats().is_none());
        watcher.add_to_current_size(10);
    }
}
