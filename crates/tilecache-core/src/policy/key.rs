use std::collections::BTreeSet;

use anyhow::{Context, Result};

use super::DownloadUsage;

/// Key that selects which queue set a request belongs to.
///
/// A key matches a request when the request host is one of `hosts` and the
/// usage class is the same. Hostnames are stored lowercased so that
/// `Tile.Example.org` and `tile.example.org` share a policy.
#[derive(Debug, Clone, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub struct DownloadPolicyKey {
    hosts: BTreeSet<String>,
    usage: DownloadUsage,
}

impl DownloadPolicyKey {
    pub fn new<I, S>(hosts: I, usage: DownloadUsage) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let hosts = hosts
            .into_iter()
            .map(|h| h.as_ref().trim().to_ascii_lowercase())
            .filter(|h| !h.is_empty())
            .collect();
        Self { hosts, usage }
    }

    /// Build a single-host key from a URL (e.g. a tile server template).
    pub fn from_url(url: &str, usage: DownloadUsage) -> Result<Self> {
        let parsed =
            url::Url::parse(url).with_context(|| format!("invalid URL for download policy: {url}"))?;
        let host = parsed
            .host_str()
            .ok_or_else(|| anyhow::anyhow!("URL missing host for download policy: {url}"))?;
        Ok(Self::new([host], usage))
    }

    pub fn hosts(&self) -> &BTreeSet<String> {
        &self.hosts
    }

    pub fn usage(&self) -> DownloadUsage {
        self.usage
    }

    /// True iff `host` is in the host set and `usage` equals the key's usage.
    pub fn matches(&self, host: &str, usage: DownloadUsage) -> bool {
        if usage != self.usage {
            return false;
        }
        if self.hosts.contains(host) {
            return true;
        }
        self.hosts.contains(&host.to_ascii_lowercase())
    }
}
