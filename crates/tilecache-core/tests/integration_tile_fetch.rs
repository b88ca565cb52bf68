//! Integration tests: real curl transport against a local tile server, the
//! download service persisting into file storage, and the cache watcher
//! accounting for what was stored.

mod common;

use std::sync::Arc;
use std::time::{Duration, SystemTime};

use common::tile_server::{Route, TileServer};
use tempfile::tempdir;
use tilecache_core::cache::CacheWatcher;
use tilecache_core::config::{CacheConfig, DownloadConfig};
use tilecache_core::download::{DownloadEvent, DownloadHandle, DownloadService, ManagerSnapshot};
use tilecache_core::http::{user_agent, CurlClient, ErrorKind, FetchError, HttpClient, HttpResponse};
use tilecache_core::policy::DownloadUsage;
use tilecache_core::storage::{FileStoragePolicy, StoragePolicy};
use tokio::sync::broadcast;
use url::Url;

fn tile(fill: u8, len: usize) -> Vec<u8> {
    vec![fill; len]
}

async fn wait_idle(handle: &DownloadHandle) -> ManagerSnapshot {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    loop {
        let snap = handle.snapshot().await.unwrap();
        if snap.is_idle() || tokio::time::Instant::now() > deadline {
            return snap;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

fn file_ready(events: &mut broadcast::Receiver<DownloadEvent>) -> Vec<String> {
    let mut out = Vec::new();
    while let Ok(event) = events.try_recv() {
        if let DownloadEvent::FileReady { destination, .. } = event {
            out.push(destination);
        }
    }
    out
}

#[test]
fn curl_client_returns_body_redirect_and_errors() {
    let server = TileServer::start(vec![
        ("/osm/5/1/1.png", Route::Tile(tile(1, 512))),
        ("/old/5/1/1.png", Route::Redirect("/osm/5/1/1.png".into())),
        ("/busy.png", Route::Status(503)),
    ]);
    let client = CurlClient::new();
    let ua = user_agent("TestPlugin");

    let url = Url::parse(&server.url("/osm/5/1/1.png")).unwrap();
    match client.get(&url, &ua).unwrap() {
        HttpResponse::Body(body) => assert_eq!(body, tile(1, 512)),
        other => panic!("expected body, got {other:?}"),
    }

    let old = Url::parse(&server.url("/old/5/1/1.png")).unwrap();
    assert_eq!(client.get(&old, &ua).unwrap(), HttpResponse::Redirect(url.clone()));
    // redirects are reported, never followed
    assert_eq!(server.hits("/osm/5/1/1.png"), 1);

    let err = client
        .get(&Url::parse(&server.url("/busy.png")).unwrap(), &ua)
        .unwrap_err();
    assert!(matches!(err, FetchError::Http(503)));
    assert_eq!(err.kind(), ErrorKind::Throttled);

    let err = client
        .get(&Url::parse(&server.url("/missing.png")).unwrap(), &ua)
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Http4xx(404));

    assert!(server.user_agents().iter().all(|a| a == &ua));
}

#[tokio::test]
async fn service_stores_tiles_and_watcher_counts_them() {
    let server = TileServer::start(vec![
        ("/osm/7/1/1.png", Route::Tile(tile(1, 1000))),
        ("/osm/7/1/2.png", Route::Redirect("/mirror/7/1/2.png".into())),
        ("/mirror/7/1/2.png", Route::Tile(tile(2, 700))),
        ("/osm/3/0/0.png", Route::Tile(tile(3, 300))),
    ]);
    let dir = tempdir().unwrap();
    let root = dir.path().join("cache");
    let cache_cfg = CacheConfig {
        hard_limit_bytes: 0,
        ..CacheConfig::default()
    };
    let watcher = Arc::new(CacheWatcher::start(&root, &cache_cfg).unwrap());
    let storage = Arc::new(FileStoragePolicy::new(&root, &cache_cfg));
    storage.add_listener(watcher.clone());

    let handle = DownloadService::start(
        &DownloadConfig::default(),
        Some(storage.clone()),
        Arc::new(CurlClient::new()),
    );
    let mut events = handle.subscribe();
    for (path, dest) in [
        ("/osm/7/1/1.png", "maps/earth/osm/7/1/1.png"),
        ("/osm/7/1/2.png", "maps/earth/osm/7/1/2.png"),
        ("/osm/3/0/0.png", "maps/earth/osm/3/0/0.png"),
    ] {
        handle
            .add_job(&server.url(path), dest, "osm", DownloadUsage::Browse)
            .unwrap();
    }
    // same destination again while queued or done: never a second request
    handle
        .add_job(&server.url("/osm/7/1/1.png"), "maps/earth/osm/7/1/1.png", "osm", DownloadUsage::Browse)
        .unwrap();

    assert!(wait_idle(&handle).await.is_idle());
    let mut ready = file_ready(&mut events);
    ready.sort();
    ready.dedup();
    assert_eq!(
        ready,
        vec![
            "maps/earth/osm/3/0/0.png",
            "maps/earth/osm/7/1/1.png",
            "maps/earth/osm/7/1/2.png",
        ]
    );
    assert_eq!(storage.read_file("maps/earth/osm/7/1/2.png").unwrap(), tile(2, 700));
    assert!(server.hits("/osm/7/1/1.png") <= 2);

    // every write is reported, base-level tiles included
    let stats = watcher.stats().unwrap();
    assert_eq!(stats.current_size, 2000);

    handle.shutdown().await.unwrap();
    watcher.shutdown();
}

#[tokio::test]
async fn unreachable_tile_is_retried_then_given_up() {
    let server = TileServer::start(vec![("/dead.png", Route::Status(500))]);
    let cfg = DownloadConfig {
        retry_interval_secs: 0.05,
        ..DownloadConfig::default()
    };
    let handle = DownloadService::start(&cfg, None, Arc::new(CurlClient::new()));
    let mut events = handle.subscribe();
    handle
        .add_job(&server.url("/dead.png"), "dead.png", "", DownloadUsage::Bulk)
        .unwrap();

    tokio::time::sleep(Duration::from_millis(100)).await;
    let snap = wait_idle(&handle).await;
    assert!(snap.is_idle());
    assert_eq!(server.hits("/dead.png"), 3);
    assert!(file_ready(&mut events).is_empty());

    // blacklisted: resubmitting does not reach the server again
    handle
        .add_job(&server.url("/dead.png"), "dead-again.png", "", DownloadUsage::Bulk)
        .unwrap();
    wait_idle(&handle).await;
    assert_eq!(server.hits("/dead.png"), 3);
}

#[test]
fn restarted_watcher_evicts_oldest_tiles_over_limit() {
    let dir = tempdir().unwrap();
    let root = dir.path().join("cache");
    let cfg = CacheConfig::default();
    let storage = FileStoragePolicy::new(&root, &cfg);
    let now = SystemTime::now();
    for (i, age) in [(0u8, 300u64), (1, 200), (2, 100)] {
        let name = format!("maps/earth/osm/8/0/{i}.png");
        assert!(storage.update_file(&name, &tile(i, 1000)));
        let path = storage.path_for(&name).unwrap();
        filetime::set_file_mtime(
            &path,
            filetime::FileTime::from_system_time(now - Duration::from_secs(age)),
        )
        .unwrap();
    }

    let cfg = CacheConfig {
        hard_limit_bytes: 2500,
        ..cfg
    };
    let watcher = CacheWatcher::start(&root, &cfg).unwrap();
    let stats = watcher.stats().unwrap();
    assert_eq!(stats.current_size, 2000);
    assert!(!storage.file_exists("maps/earth/osm/8/0/0.png"));
    assert!(storage.file_exists("maps/earth/osm/8/0/1.png"));
    assert!(storage.file_exists("maps/earth/osm/8/0/2.png"));
}
