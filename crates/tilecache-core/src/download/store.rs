//! Persisting finished payloads off the manager's task.

use std::sync::Arc;

use crate::storage::StoragePolicy;

/// A finished payload waiting to be written. Produced by the manager and run
/// on a blocking thread by its owner.
pub struct PendingStore {
    storage: Arc<dyn StoragePolicy>,
    destination: String,
    initiator_id: String,
    data: Arc<[u8]>,
}

/// Result of a [`PendingStore`], handed back to the manager.
#[derive(Debug, Clone)]
pub struct StoreOutcome {
    pub destination: String,
    pub initiator_id: String,
    pub stored: bool,
    /// Storage error text when `stored` is false.
    pub error: String,
}

impl PendingStore {
    pub(crate) fn new(
        storage: Arc<dyn StoragePolicy>,
        destination: String,
        initiator_id: String,
        data: Arc<[u8]>,
    ) -> Self {
        Self {
            storage,
            destination,
            initiator_id,
            data,
        }
    }

    pub fn destination(&self) -> &str {
        &self.destination
    }

    /// Write the payload. Blocks on disk I/O.
    pub fn run(self) -> StoreOutcome {
        let stored = self.storage.update_file(&self.destination, &self.data);
        let error = if stored {
            String::new()
        } else {
            self.storage.last_error_message()
        };
        StoreOutcome {
            destination: self.destination,
            initiator_id: self.initiator_id,
            stored,
            error,
        }
    }
}
