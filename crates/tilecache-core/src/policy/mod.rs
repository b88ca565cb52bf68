//! Download policies.
//!
//! A policy maps a set of hostnames plus a usage class to the maximum number
//! of concurrent connections the download manager may open for matching
//! requests. The manager creates one queue set per registered policy and
//! falls back to a built-in policy per usage class when nothing matches.

mod key;
mod usage;

pub use key::DownloadPolicyKey;
pub use usage::DownloadUsage;

/// Connection limit of the built-in policy for interactive traffic.
pub const DEFAULT_BROWSE_CONNECTIONS: usize = 20;
/// Connection limit of the built-in policy for background traffic.
pub const DEFAULT_BULK_CONNECTIONS: usize = 2;

/// Key plus concurrency limit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadPolicy {
    key: DownloadPolicyKey,
    max_connections: usize,
}

impl DownloadPolicy {
    /// Create a policy. A limit of 0 is raised to 1 so a queue set can always
    /// make progress.
    pub fn new(key: DownloadPolicyKey, max_connections: usize) -> Self {
        Self {
            key,
            max_connections: max_connections.max(1),
        }
    }

    /// Built-in fallback policy for `usage` (empty host set).
    pub fn fallback(usage: DownloadUsage, max_connections: usize) -> Self {
        Self::new(
            DownloadPolicyKey::new(std::iter::empty::<&str>(), usage),
            max_connections,
        )
    }

    pub fn key(&self) -> &DownloadPolicyKey {
        &self.key
    }

    pub fn max_connections(&self) -> usize {
        self.max_connections
    }

    pub fn set_max_connections(&mut self, max_connections: usize) {
        self.max_connections = max_connections.max(1);
    }
}
