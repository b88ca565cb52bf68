//! Traffic class of a download request.

use std::fmt;

/// Whether a download serves the interactive map view or a background job.
///
/// Each class has its own default connection limit so that a large bulk
/// region download cannot starve tiles the user is looking at right now.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DownloadUsage {
    /// Background prefetching (e.g. downloading a region for offline use).
    Bulk,
    /// Tiles requested while the user browses the map.
    Browse,
}

impl DownloadUsage {
    pub fn as_str(&self) -> &'static str {
        match self {
            DownloadUsage::Bulk => "bulk",
            DownloadUsage::Browse => "browse",
        }
    }
}

impl fmt::Display for DownloadUsage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
