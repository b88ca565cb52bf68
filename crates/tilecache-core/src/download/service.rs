//! Async front-end for the download manager.
//!
//! One tokio task owns the [`DownloadManager`]; callers talk to it through a
//! cloneable [`DownloadHandle`]. Attempts and tile writes run on the blocking
//! pool and report back over mpsc channels, and the shared retry timer is a
//! `sleep_until` branch of the same select loop.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::time::{sleep_until, Instant};
use tracing::{debug, info};
use url::Url;

use super::manager::{DownloadEvent, DownloadManager, ManagerSnapshot};
use super::runner::{BlockingRunner, JobOutcome};
use super::store::StoreOutcome;
use crate::config::DownloadConfig;
use crate::http::{user_agent, HttpClient};
use crate::policy::{DownloadPolicy, DownloadUsage};
use crate::storage::StoragePolicy;

/// Sleep used while no retry is armed; the branch is disabled anyway.
const IDLE_TIMER: Duration = Duration::from_secs(3600);

enum Command {
    AddJob {
        url: Url,
        destination: String,
        initiator_id: String,
        usage: DownloadUsage,
    },
    AddPolicy(DownloadPolicy),
    SetEnabled(bool),
    Snapshot(oneshot::Sender<ManagerSnapshot>),
    Shutdown(oneshot::Sender<()>),
}

/// Cloneable handle to a running download service.
#[derive(Clone)]
pub struct DownloadHandle {
    commands: mpsc::UnboundedSender<Command>,
    events: broadcast::Sender<DownloadEvent>,
}

pub struct DownloadService;

impl DownloadService {
    /// Spawn the service on the current tokio runtime.
    pub fn start(
        cfg: &DownloadConfig,
        storage: Option<Arc<dyn StoragePolicy>>,
        client: Arc<dyn HttpClient>,
    ) -> DownloadHandle {
        let (events, _) = broadcast::channel(cfg.event_capacity.max(1));
        let (outcome_tx, outcome_rx) = mpsc::unbounded_channel();
        let (command_tx, command_rx) = mpsc::unbounded_channel();

        let runner = BlockingRunner::new(client, user_agent(&cfg.user_agent_plugin), outcome_tx);
        let manager = DownloadManager::new(cfg, storage, Arc::new(runner), events.clone());
        tokio::spawn(run(manager, command_rx, outcome_rx));
        info!(enabled = cfg.enabled, policies = cfg.policies.len(), "download service started");

        DownloadHandle {
            commands: command_tx,
            events,
        }
    }
}

async fn run(
    mut manager: DownloadManager,
    mut commands: mpsc::UnboundedReceiver<Command>,
    mut outcomes: mpsc::UnboundedReceiver<JobOutcome>,
) {
    let (stored_tx, mut stored) = mpsc::unbounded_channel();
    loop {
        let deadline = manager.retry_deadline();
        let wake_at = deadline
            .map(Instant::from_std)
            .unwrap_or_else(|| Instant::now() + IDLE_TIMER);

        tokio::select! {
            cmd = commands.recv() => match cmd {
                Some(Command::AddJob { url, destination, initiator_id, usage }) => {
                    manager.add_job(&url, &destination, &initiator_id, usage);
                }
                Some(Command::AddPolicy(policy)) => {
                    manager.add_download_policy(policy);
                }
                Some(Command::SetEnabled(enabled)) => manager.set_download_enabled(enabled),
                Some(Command::Snapshot(reply)) => {
                    let _ = reply.send(manager.snapshot());
                }
                Some(Command::Shutdown(ack)) => {
                    let _ = ack.send(());
                    break;
                }
                None => break,
            },
            Some(outcome) = outcomes.recv() => manager.handle_outcome(outcome),
            Some(outcome) = stored.recv() => manager.handle_stored(outcome),
            _ = sleep_until(wake_at), if deadline.is_some() => {
                debug!("retry timer fired");
                manager.retry_due_jobs();
            }
        }
        dispatch_stores(&mut manager, &stored_tx);
    }
    debug!("download service stopped");
}

/// Run queued tile writes on the blocking pool.
fn dispatch_stores(manager: &mut DownloadManager, done: &mpsc::UnboundedSender<StoreOutcome>) {
    for store in manager.take_pending_stores() {
        let done = done.clone();
        tokio::task::spawn_blocking(move || {
            let destination = store.destination().to_string();
            if done.send(store.run()).is_err() {
                debug!(destination, "download service gone; store result dropped");
            }
        });
    }
}

impl DownloadHandle {
    /// Submit a tile download. Fails only on an unparsable URL or a stopped service.
    pub fn add_job(&self, url: &str, destination: &str, initiator_id: &str, usage: DownloadUsage) -> Result<()> {
        let url = Url::parse(url).with_context(|| format!("invalid download url: {url}"))?;
        self.send(Command::AddJob {
            url,
            destination: destination.to_string(),
            initiator_id: initiator_id.to_string(),
            usage,
        })
    }

    pub fn add_download_policy(&self, policy: DownloadPolicy) -> Result<()> {
        self.send(Command::AddPolicy(policy))
    }

    pub fn set_download_enabled(&self, enabled: bool) -> Result<()> {
        self.send(Command::SetEnabled(enabled))
    }

    /// Receive every event published after this call.
    pub fn subscribe(&self) -> broadcast::Receiver<DownloadEvent> {
        self.events.subscribe()
    }

    pub async fn snapshot(&self) -> Result<ManagerSnapshot> {
        let (tx, rx) = oneshot::channel();
        self.send(Command::Snapshot(tx))?;
        rx.await.map_err(|_| anyhow!("download service stopped"))
    }

    /// Stop the service. Attempts still running finish in the background and
    /// their results are discarded.
    pub async fn shutdown(&self) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.send(Command::Shutdown(tx))?;
        rx.await.map_err(|_| anyhow!("download service stopped"))
    }

    fn send(&self, cmd: Command) -> Result<()> {
        self.commands
            .send(cmd)
            .map_err(|_| anyhow!("download service stopped"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{CacheConfig, PolicyConfig};
    use crate::http::{FetchError, HttpResponse};
    use crate::storage::FileStoragePolicy;
    use std::collections::HashMap;
    use std::sync::Mutex;

    /// Serves canned responses by URL and counts requests.
    #[derive(Default)]
    struct FakeClient {
        routes: HashMap<String, Result<HttpResponse, u32>>,
        hits: Mutex<HashMap<String, usize>>,
    }

    impl FakeClient {
        fn route(mut self, url: &str, response: Result<HttpResponse, u32>) -> Self {
            self.routes.insert(url.to_string(), response);
            self
        }

        fn hits(&self, url: &str) -> usize {
            self.hits.lock().unwrap().get(url).copied().unwrap_or(0)
        }
    }

    impl HttpClient for FakeClient {
        fn get(&self, url: &Url, _user_agent: &str) -> Result<HttpResponse, FetchError> {
            *self.hits.lock().unwrap().entry(url.to_string()).or_default() += 1;
            match self.routes.get(url.as_str()) {
                Some(Ok(response)) => Ok(response.clone()),
                Some(Err(code)) => Err(FetchError::Http(*code)),
                None => Err(FetchError::Http(404)),
            }
        }
    }

    /// Storage whose writes take a while; records what was written.
    struct SlowStorage {
        delay: Duration,
        written: Mutex<Vec<String>>,
    }

    impl StoragePolicy for SlowStorage {
        fn file_exists(&self, name: &str) -> bool {
            self.written.lock().unwrap().iter().any(|n| n == name)
        }

        fn update_file(&self, name: &str, _data: &[u8]) -> bool {
            std::thread::sleep(self.delay);
            self.written.lock().unwrap().push(name.to_string());
            true
        }

        fn read_file(&self, _name: &str) -> Option<Vec<u8>> {
            None
        }

        fn clear_cache(&self) -> bool {
            false
        }

        fn last_error_message(&self) -> String {
            String::new()
        }
    }

    async fn wait_idle(handle: &DownloadHandle) -> ManagerSnapshot {
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            let snap = handle.snapshot().await.unwrap();
            if snap.is_idle() || Instant::now() > deadline {
                return snap;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    async fn next_file_ready(rx: &mut broadcast::Receiver<DownloadEvent>) -> String {
        let wait = async {
            loop {
                if let Ok(DownloadEvent::FileReady { destination, .. }) = rx.recv().await {
                    return destination;
                }
            }
        };
        tokio::time::timeout(Duration::from_secs(5), wait)
            .await
            .expect("no FileReady event")
    }

    #[tokio::test]
    async fn downloads_are_stored_and_announced() {
        let dir = tempfile::tempdir().unwrap();
        let storage = Arc::new(FileStoragePolicy::new(dir.path().join("cache"), &CacheConfig::default()));
        let client = Arc::new(
            FakeClient::default().route("http://tile.example.org/5/1/1.png", Ok(HttpResponse::Body(b"one".to_vec()))),
        );
        let handle = DownloadService::start(&DownloadConfig::default(), Some(storage.clone()), client);
        let mut rx = handle.subscribe();

        handle
            .add_job("http://tile.example.org/5/1/1.png", "maps/earth/osm/5/1/1.png", "osm", DownloadUsage::Browse)
            .unwrap();
        assert_eq!(next_file_ready(&mut rx).await, "maps/earth/osm/5/1/1.png");
        assert_eq!(storage.read_file("maps/earth/osm/5/1/1.png").unwrap(), b"one");
        handle.shutdown().await.unwrap();
        assert!(handle.snapshot().await.is_err());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn slow_writes_do_not_stall_the_service() {
        let storage = Arc::new(SlowStorage {
            delay: Duration::from_millis(800),
            written: Mutex::new(Vec::new()),
        });
        let client = Arc::new(
            FakeClient::default().route("http://tile.example.org/4/0/0.png", Ok(HttpResponse::Body(b"slow".to_vec()))),
        );
        let handle = DownloadService::start(&DownloadConfig::default(), Some(storage.clone()), client);
        let mut rx = handle.subscribe();
        handle
            .add_job("http://tile.example.org/4/0/0.png", "maps/earth/osm/4/0/0.png", "osm", DownloadUsage::Browse)
            .unwrap();

        let data_ready = async {
            loop {
                if let Ok(DownloadEvent::DataReady { .. }) = rx.recv().await {
                    return;
                }
            }
        };
        tokio::time::timeout(Duration::from_secs(5), data_ready)
            .await
            .expect("no DataReady event");

        let asked = Instant::now();
        let snap = handle.snapshot().await.unwrap();
        assert!(asked.elapsed() < Duration::from_millis(300));
        assert_eq!(snap.storing, 1);
        assert!(!snap.is_idle());

        assert_eq!(next_file_ready(&mut rx).await, "maps/earth/osm/4/0/0.png");
        assert!(wait_idle(&handle).await.is_idle());
        assert_eq!(*storage.written.lock().unwrap(), vec!["maps/earth/osm/4/0/0.png"]);
    }

    #[tokio::test]
    async fn redirects_are_followed_by_resubmission() {
        let dir = tempfile::tempdir().unwrap();
        let storage = Arc::new(FileStoragePolicy::new(dir.path().join("cache"), &CacheConfig::default()));
        let target = Url::parse("http://mirror.example.org/6/2/2.png").unwrap();
        let client = Arc::new(
            FakeClient::default()
                .route("http://tile.example.org/6/2/2.png", Ok(HttpResponse::Redirect(target.clone())))
                .route(target.as_str(), Ok(HttpResponse::Body(b"moved".to_vec()))),
        );
        let handle = DownloadService::start(&DownloadConfig::default(), Some(storage.clone()), client.clone());
        let mut rx = handle.subscribe();

        handle
            .add_job("http://tile.example.org/6/2/2.png", "maps/earth/osm/6/2/2.png", "osm", DownloadUsage::Bulk)
            .unwrap();
        assert_eq!(next_file_ready(&mut rx).await, "maps/earth/osm/6/2/2.png");
        assert_eq!(storage.read_file("maps/earth/osm/6/2/2.png").unwrap(), b"moved");
        assert_eq!(client.hits(target.as_str()), 1);
    }

    #[tokio::test]
    async fn failing_source_is_tried_three_times() {
        let cfg = DownloadConfig {
            retry_interval_secs: 0.02,
            ..DownloadConfig::default()
        };
        let client = Arc::new(FakeClient::default().route("http://tile.example.org/bad.png", Err(503)));
        let handle = DownloadService::start(&cfg, None, client.clone());
        handle
            .add_job("http://tile.example.org/bad.png", "bad", "", DownloadUsage::Browse)
            .unwrap();

        tokio::time::sleep(Duration::from_millis(50)).await;
        let snap = wait_idle(&handle).await;
        assert!(snap.is_idle());
        assert_eq!(client.hits("http://tile.example.org/bad.png"), 3);
        assert_eq!(snap.queues.last().map(|q| q.blacklisted), Some(0));
        let browse = &snap.queues[snap.queues.len() - 2];
        assert_eq!(browse.blacklisted, 1);
    }

    #[tokio::test]
    async fn policies_and_switch_are_applied() {
        let cfg = DownloadConfig {
            policies: vec![PolicyConfig {
                hosts: vec!["tile.example.org".into()],
                usage: DownloadUsage::Bulk,
                max_connections: 1,
            }],
            ..DownloadConfig::default()
        };
        let handle = DownloadService::start(&cfg, None, Arc::new(FakeClient::default()));
        handle
            .add_download_policy(DownloadPolicy::new(
                crate::policy::DownloadPolicyKey::new(["other.example.org"], DownloadUsage::Browse),
                3,
            ))
            .unwrap();
        handle.set_download_enabled(false).unwrap();
        handle
            .add_job("http://tile.example.org/1.png", "1", "", DownloadUsage::Bulk)
            .unwrap();

        let snap = handle.snapshot().await.unwrap();
        assert!(!snap.enabled);
        assert_eq!(snap.queues.len(), 4);
        assert_eq!(snap.queues[1].max_connections, 3);
        assert!(snap.is_idle());
        assert!(handle.add_job("not a url", "x", "", DownloadUsage::Bulk).is_err());
    }
}
