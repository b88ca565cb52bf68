//! Worker-owned cache bookkeeping and the eviction algorithm.

use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::SystemTime;

use tracing::{debug, info, warn};

use super::tiles::TileFile;

/// Hard quota and the soft target eviction works down to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CacheLimits {
    pub hard: u64,
    pub soft: u64,
}

impl CacheLimits {
    /// `soft = hard * (100 - hysteresis_percent) / 100`.
    pub fn new(hard: u64, hysteresis_percent: u8) -> Self {
        let keep = 100 - u128::from(hysteresis_percent.min(99));
        let soft = (u128::from(hard) * keep / 100) as u64;
        Self { hard, soft }
    }

    /// Hard limit that puts the soft limit at `current_size`.
    pub fn recalibrated(current_size: u64, hysteresis_percent: u8) -> Self {
        let keep = 100 - u128::from(hysteresis_percent.min(99));
        let hard = (u128::from(current_size) * 100 / keep).min(u128::from(u64::MAX)) as u64;
        Self::new(hard, hysteresis_percent)
    }
}

/// The one piece of state shared between the watcher handle and its worker.
pub(crate) type SharedLimits = Arc<Mutex<CacheLimits>>;

/// What an eviction pass did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EvictionPass {
    pub files_deleted: usize,
    pub bytes_freed: u64,
    pub delete_failures: usize,
    /// The batch ran out before the soft limit was reached; continue later.
    pub deferred: bool,
    /// Set when the soft limit was unreachable and the hard limit was raised.
    pub recalibrated_limit: Option<u64>,
}

/// Snapshot of the watcher's view of the cache.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct CacheStats {
    pub current_size: u64,
    pub hard_limit: u64,
    pub soft_limit: u64,
    pub indexed_files: usize,
    pub evicting: bool,
}

/// Size accounting plus the mtime-ordered file index.
///
/// Owned by the watcher worker; only `limits` is shared.
#[derive(Debug)]
pub struct CacheState {
    limits: SharedLimits,
    hysteresis_percent: u8,
    batch_size: usize,
    current_size: u64,
    index: BTreeSet<(SystemTime, PathBuf)>,
    evicting: bool,
    quitting: Arc<AtomicBool>,
}

impl CacheState {
    pub(crate) fn new(
        limits: SharedLimits,
        hysteresis_percent: u8,
        batch_size: usize,
        quitting: Arc<AtomicBool>,
    ) -> Self {
        Self {
            limits,
            hysteresis_percent: hysteresis_percent.min(99),
            batch_size: batch_size.max(1),
            current_size: 0,
            index: BTreeSet::new(),
            evicting: false,
            quitting,
        }
    }

    /// Replace the index and size with the result of a full scan.
    pub fn load_index(&mut self, files: Vec<TileFile>) {
        self.current_size = files.iter().map(|f| f.size).sum();
        self.index = files.into_iter().map(|f| (f.modified, f.path)).collect();
    }

    pub fn current_size(&self) -> u64 {
        self.current_size
    }

    pub fn indexed_files(&self) -> usize {
        self.index.len()
    }

    pub fn is_evicting(&self) -> bool {
        self.evicting
    }

    pub fn limits(&self) -> CacheLimits {
        *self.limits.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Apply a size delta reported by storage. Never goes below zero.
    pub fn add_to_current_size(&mut self, delta: i64) {
        self.current_size = if delta >= 0 {
            self.current_size.saturating_add(delta as u64)
        } else {
            self.current_size.saturating_sub(delta.unsigned_abs())
        };
    }

    pub fn reset_current_size(&mut self) {
        self.current_size = 0;
    }

    pub fn stats(&self) -> CacheStats {
        let limits = self.limits();
        CacheStats {
            current_size: self.current_size,
            hard_limit: limits.hard,
            soft_limit: limits.soft,
            indexed_files: self.index.len(),
            evicting: self.evicting,
        }
    }

    fn is_quitting(&self) -> bool {
        self.quitting.load(Ordering::Relaxed)
    }

    /// Delete oldest tiles while the cache is over quota.
    ///
    /// Runs when the size exceeds the hard limit, or while a previous pass is
    /// still working down to the soft limit. Returns `None` when nothing had
    /// to be done.
    pub fn ensure_cache_size(&mut self) -> Option<EvictionPass> {
        let limits = self.limits();
        if limits.hard == 0 || limits.soft == 0 {
            self.evicting = false;
            return None;
        }
        if self.is_quitting() {
            return None;
        }
        if self.evicting && self.current_size <= limits.soft {
            self.evicting = false;
        }
        let over_hard = self.current_size > limits.hard;
        let in_band = self.evicting && self.current_size > limits.soft;
        if !over_hard && !in_band {
            return None;
        }

        debug!(
            current_size = self.current_size,
            hard_limit = limits.hard,
            soft_limit = limits.soft,
            "evicting cached tiles"
        );
        self.evicting = true;
        let mut pass = EvictionPass::default();
        let mut attempts = 0usize;

        while attempts < self.batch_size && !self.is_quitting() {
            // Re-read so a limit change lands in a running pass.
            if self.current_size <= self.limits().soft {
                break;
            }
            let Some((_, path)) = self.index.pop_first() else {
                break;
            };
            attempts += 1;
            let size = std::fs::metadata(&path).map(|m| m.len()).unwrap_or(0);
            match std::fs::remove_file(&path) {
                Ok(()) => {
                    self.current_size = self.current_size.saturating_sub(size);
                    pass.files_deleted += 1;
                    pass.bytes_freed += size;
                }
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    debug!(path = %path.display(), "cached tile already gone");
                }
                Err(e) => {
                    pass.delete_failures += 1;
                    warn!(path = %path.display(), error = %e, "failed to delete cached tile");
                }
            }
        }

        let soft = self.limits().soft;
        if self.current_size > soft && !self.index.is_empty() && !self.is_quitting() {
            pass.deferred = true;
            return Some(pass);
        }

        self.evicting = false;
        if self.current_size > soft && !self.is_quitting() {
            let raised = CacheLimits::recalibrated(self.current_size, self.hysteresis_percent);
            warn!(
                current_size = self.current_size,
                old_hard_limit = limits.hard,
                new_hard_limit = raised.hard,
                "cache limit unreachable, raising hard limit"
            );
            *self.limits.lock().unwrap_or_else(PoisonError::into_inner) = raised;
            pass.recalibrated_limit = Some(raised.hard);
        }
        info!(
            files_deleted = pass.files_deleted,
            bytes_freed = pass.bytes_freed,
            current_size = self.current_size,
            "cache eviction finished"
        );
        Some(pass)
    }
}
