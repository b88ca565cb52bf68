//! `tilecache fetch <url>...` – download tiles into the cache.

use anyhow::{bail, Context, Result};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tilecache_core::cache::CacheWatcher;
use tilecache_core::config::TileCacheConfig;
use tilecache_core::download::{DownloadEvent, DownloadService};
use tilecache_core::http::CurlClient;
use tilecache_core::policy::DownloadUsage;
use tilecache_core::storage::FileStoragePolicy;
use tokio::sync::broadcast::error::RecvError;
use url::Url;

use super::{format_bytes, stop_watcher, watcher_stats};

const IDLE_POLL_MS: u64 = 200;

#[derive(Debug)]
pub struct FetchArgs {
    pub urls: Vec<String>,
    pub destinations: Vec<String>,
    pub bulk: bool,
    pub initiator_id: String,
}

/// Cache-relative destination derived from the URL path (`/7/64/42.png` → `7/64/42.png`).
fn destination_from_url(url: &str) -> Result<String> {
    let parsed = Url::parse(url).with_context(|| format!("invalid url: {url}"))?;
    let path = parsed.path().trim_matches('/');
    if path.is_empty() {
        bail!("cannot derive a destination from {url}; pass --dest");
    }
    Ok(path.to_string())
}

fn plan_requests(args: &FetchArgs) -> Result<Vec<(String, String)>> {
    if !args.destinations.is_empty() && args.destinations.len() != args.urls.len() {
        bail!(
            "--dest given {} time(s) for {} url(s)",
            args.destinations.len(),
            args.urls.len()
        );
    }
    args.urls
        .iter()
        .enumerate()
        .map(|(i, url)| {
            let dest = match args.destinations.get(i) {
                Some(dest) => dest.clone(),
                None => destination_from_url(url)?,
            };
            Ok((url.clone(), dest))
        })
        .collect()
}

pub async fn run_fetch(cfg: &TileCacheConfig, args: FetchArgs) -> Result<()> {
    let requests = plan_requests(&args)?;
    let data_dir = cfg.cache.resolve_data_dir()?;
    let watcher = Arc::new(CacheWatcher::start(&data_dir, &cfg.cache)?);
    let storage = Arc::new(FileStoragePolicy::new(&data_dir, &cfg.cache));
    storage.add_listener(watcher.clone());

    let handle = DownloadService::start(&cfg.download, Some(storage), Arc::new(CurlClient::new()));
    let mut events = handle.subscribe();
    let usage = if args.bulk {
        DownloadUsage::Bulk
    } else {
        DownloadUsage::Browse
    };
    for (url, dest) in &requests {
        handle.add_job(url, dest, &args.initiator_id, usage)?;
    }

    let mut stored: HashSet<String> = HashSet::new();
    let mut bytes = 0u64;
    let mut ticker = tokio::time::interval(Duration::from_millis(IDLE_POLL_MS));
    loop {
        tokio::select! {
            event = events.recv() => match event {
                Ok(DownloadEvent::DataReady { data, .. }) => bytes += data.len() as u64,
                Ok(DownloadEvent::FileReady { destination, .. }) => {
                    println!("stored {destination}");
                    stored.insert(destination);
                }
                Ok(DownloadEvent::Progress { active, queued }) => {
                    tracing::debug!(active, queued, "download progress");
                }
                Ok(_) => {}
                Err(RecvError::Lagged(n)) => tracing::warn!("missed {n} download event(s)"),
                Err(RecvError::Closed) => break,
            },
            _ = ticker.tick() => {
                if handle.snapshot().await?.is_idle() {
                    break;
                }
            }
        }
    }
    while let Ok(event) = events.try_recv() {
        if let DownloadEvent::FileReady { destination, .. } = event {
            println!("stored {destination}");
            stored.insert(destination);
        }
    }
    handle.shutdown().await?;

    if let Some(stats) = watcher_stats(&watcher).await? {
        tracing::info!(
            current_size = stats.current_size,
            hard_limit = stats.hard_limit,
            "cache after fetch"
        );
    }
    stop_watcher(watcher).await?;

    println!(
        "Fetched {} of {} tile(s), {} downloaded",
        stored.len(),
        requests.len(),
        format_bytes(bytes)
    );
    let missing = requests.len() - stored.len().min(requests.len());
    if missing > 0 {
        bail!("{missing} tile(s) could not be fetched");
    }
    Ok(())
}
