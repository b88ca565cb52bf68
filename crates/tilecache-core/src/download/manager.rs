//! Routes submissions to queue sets and relays their events.

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};
use url::Url;

use super::job::{Job, JobId};
use super::queue_set::{QueueEvent, QueueSet};
use super::runner::{JobOutcome, JobRunner, QueueSetId};
use super::store::{PendingStore, StoreOutcome};
use crate::config::DownloadConfig;
use crate::policy::{DownloadPolicy, DownloadUsage};
use crate::storage::StoragePolicy;

/// Notifications published to subscribers of the download manager.
#[derive(Debug, Clone)]
pub enum DownloadEvent {
    JobAdded {
        destination: String,
    },
    JobRemoved {
        destination: String,
    },
    /// Totals across all queue sets changed.
    Progress {
        active: usize,
        queued: usize,
    },
    /// Payload of a finished job, published before it is persisted.
    DataReady {
        destination: String,
        initiator_id: String,
        data: Arc<[u8]>,
    },
    /// The payload was persisted under `destination`. Published once the
    /// write reported back, so it may trail later events.
    FileReady {
        destination: String,
        initiator_id: String,
    },
}

#[derive(Debug, Clone, Serialize)]
pub struct QueueSnapshot {
    pub hosts: Vec<String>,
    pub usage: DownloadUsage,
    pub max_connections: usize,
    pub active: usize,
    pub pending: usize,
    pub retrying: usize,
    pub blacklisted: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct ManagerSnapshot {
    pub enabled: bool,
    pub retry_armed: bool,
    /// Payloads handed to storage and not yet reported back.
    pub storing: usize,
    /// Custom queue sets in registration order, then the browse and bulk defaults.
    pub queues: Vec<QueueSnapshot>,
}

impl ManagerSnapshot {
    /// True when no job is running, waiting or scheduled for a retry.
    pub fn is_idle(&self) -> bool {
        !self.retry_armed
            && self.storing == 0
            && self
                .queues
                .iter()
                .all(|q| q.active == 0 && q.pending == 0 && q.retrying == 0)
    }
}

pub struct DownloadManager {
    custom: Vec<QueueSet>,
    default_browse: QueueSet,
    default_bulk: QueueSet,
    enabled: bool,
    storage: Option<Arc<dyn StoragePolicy>>,
    runner: Arc<dyn JobRunner>,
    events: broadcast::Sender<DownloadEvent>,
    retry_interval: Duration,
    retry_deadline: Option<Instant>,
    max_retries: u32,
    next_job_id: JobId,
    last_progress: (usize, usize),
    pending_stores: Vec<PendingStore>,
    stores_in_flight: usize,
}

impl DownloadManager {
    /// Build the manager with the two built-in policies and every policy from `cfg`.
    pub fn new(
        cfg: &DownloadConfig,
        storage: Option<Arc<dyn StoragePolicy>>,
        runner: Arc<dyn JobRunner>,
        events: broadcast::Sender<DownloadEvent>,
    ) -> Self {
        let mut manager = Self {
            custom: Vec::new(),
            default_browse: QueueSet::new(
                QueueSetId::Default(DownloadUsage::Browse),
                DownloadPolicy::fallback(DownloadUsage::Browse, cfg.browse_max_connections),
            ),
            default_bulk: QueueSet::new(
                QueueSetId::Default(DownloadUsage::Bulk),
                DownloadPolicy::fallback(DownloadUsage::Bulk, cfg.bulk_max_connections),
            ),
            enabled: cfg.enabled,
            storage,
            runner,
            events,
            retry_interval: cfg.retry_interval(),
            retry_deadline: None,
            max_retries: cfg.max_retries,
            next_job_id: 1,
            last_progress: (0, 0),
            pending_stores: Vec::new(),
            stores_in_flight: 0,
        };
        for policy in &cfg.policies {
            manager.add_download_policy(policy.to_policy());
        }
        manager
    }

    /// Register a custom policy. Ignored when one with an equal key exists.
    pub fn add_download_policy(&mut self, policy: DownloadPolicy) -> bool {
        if self.custom.iter().any(|q| q.policy().key() == policy.key()) {
            debug!(hosts = ?policy.key().hosts(), "download policy already registered");
            return false;
        }
        info!(
            hosts = ?policy.key().hosts(),
            usage = %policy.key().usage(),
            max_connections = policy.max_connections(),
            "registered download policy"
        );
        let id = QueueSetId::Custom(self.custom.len());
        self.custom.push(QueueSet::new(id, policy));
        true
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Submit a download. Returns false when it was dropped (disabled,
    /// duplicate destination or blacklisted URL).
    pub fn add_job(
        &mut self,
        url: &Url,
        destination: &str,
        initiator_id: &str,
        usage: DownloadUsage,
    ) -> bool {
        let accepted = self.enqueue(url, destination, initiator_id, usage);
        self.relay_events();
        accepted
    }

    /// Global kill switch. Disabling drops every queued and running job.
    pub fn set_download_enabled(&mut self, enabled: bool) {
        if self.enabled == enabled {
            return;
        }
        self.enabled = enabled;
        info!(enabled, "downloads switched");
        if !enabled {
            for queue in self.queues_mut() {
                queue.purge_jobs();
                queue.drain_events();
            }
            self.retry_deadline = None;
            self.publish_progress();
        }
    }

    /// Route a finished attempt to its queue set.
    pub fn handle_outcome(&mut self, outcome: JobOutcome) {
        let runner = Arc::clone(&self.runner);
        let handled = match self.queue_mut(outcome.queue) {
            Some(queue) => queue.handle_result(outcome.job_id, outcome.result, runner.as_ref()),
            None => false,
        };
        if handled {
            self.relay_events();
        }
    }

    /// When the shared retry timer is due, if armed.
    pub fn retry_deadline(&self) -> Option<Instant> {
        self.retry_deadline
    }

    /// Timer expiry: move retry-waiting jobs of every queue set back to pending.
    pub fn retry_due_jobs(&mut self) {
        self.retry_deadline = None;
        let runner = Arc::clone(&self.runner);
        for queue in self.queues_mut() {
            queue.retry_jobs(runner.as_ref());
        }
        self.relay_events();
    }

    /// Writes queued by finished jobs since the last call. The caller runs
    /// each one off the async runtime and reports back through
    /// [`DownloadManager::handle_stored`].
    pub fn take_pending_stores(&mut self) -> Vec<PendingStore> {
        std::mem::take(&mut self.pending_stores)
    }

    /// A write finished: announce the file, or log why it was not stored.
    pub fn handle_stored(&mut self, outcome: StoreOutcome) {
        self.stores_in_flight = self.stores_in_flight.saturating_sub(1);
        if outcome.stored {
            self.publish(DownloadEvent::FileReady {
                destination: outcome.destination,
                initiator_id: outcome.initiator_id,
            });
        } else {
            warn!(
                destination = %outcome.destination,
                error = %outcome.error,
                "failed to store downloaded tile"
            );
        }
    }

    pub fn snapshot(&self) -> ManagerSnapshot {
        let queues = self
            .queues()
            .map(|q| QueueSnapshot {
                hosts: q.policy().key().hosts().iter().cloned().collect(),
                usage: q.policy().key().usage(),
                max_connections: q.policy().max_connections(),
                active: q.active_count(),
                pending: q.pending_count(),
                retrying: q.retry_count(),
                blacklisted: q.blacklisted_count(),
            })
            .collect();
        ManagerSnapshot {
            enabled: self.enabled,
            retry_armed: self.retry_deadline.is_some(),
            storing: self.stores_in_flight,
            queues,
        }
    }

    fn enqueue(&mut self, url: &Url, destination: &str, initiator_id: &str, usage: DownloadUsage) -> bool {
        if !self.enabled {
            debug!(url = %url, "downloads disabled; dropping request");
            return false;
        }
        // Destinations are unique across queue sets, whatever the usage.
        if let Some(owner) = self.queues().find(|q| q.targets(destination)) {
            debug!(destination, queue = ?owner.id(), "download already queued");
            return false;
        }
        let host = url.host_str().unwrap_or_default().to_ascii_lowercase();
        let queue = match self
            .custom
            .iter_mut()
            .find(|q| q.policy().key().matches(&host, usage))
        {
            Some(queue) => queue,
            None => match usage {
                DownloadUsage::Browse => &mut self.default_browse,
                DownloadUsage::Bulk => &mut self.default_bulk,
            },
        };
        if !queue.can_accept_job(url, destination) {
            return false;
        }
        let job = Job::new(
            self.next_job_id,
            url.clone(),
            destination,
            initiator_id,
            usage,
            self.max_retries,
        );
        self.next_job_id += 1;
        queue.add_job(job, self.runner.as_ref());
        true
    }

    /// Drain queue-set events and translate them; redirects are re-submitted
    /// through full policy resolution, so this loops until quiet.
    fn relay_events(&mut self) {
        loop {
            let events: Vec<QueueEvent> = self
                .queues_mut()
                .flat_map(|q| q.drain_events())
                .collect();
            if events.is_empty() {
                break;
            }
            for event in events {
                match event {
                    QueueEvent::JobAdded { destination } => {
                        self.publish(DownloadEvent::JobAdded { destination });
                    }
                    QueueEvent::JobRemoved { destination } => {
                        self.publish(DownloadEvent::JobRemoved { destination });
                    }
                    QueueEvent::JobFinished {
                        data,
                        destination,
                        initiator_id,
                    } => self.finish_job(data, destination, initiator_id),
                    QueueEvent::JobRetry => {
                        if self.retry_deadline.is_none() {
                            self.retry_deadline = Some(Instant::now() + self.retry_interval);
                        }
                    }
                    QueueEvent::JobRedirected {
                        url,
                        destination,
                        initiator_id,
                        usage,
                    } => {
                        self.enqueue(&url, &destination, &initiator_id, usage);
                    }
                }
            }
        }
        self.publish_progress();
    }

    fn finish_job(&mut self, data: Arc<[u8]>, destination: String, initiator_id: String) {
        self.publish(DownloadEvent::DataReady {
            destination: destination.clone(),
            initiator_id: initiator_id.clone(),
            data: Arc::clone(&data),
        });
        let Some(storage) = &self.storage else {
            return;
        };
        self.pending_stores.push(PendingStore::new(
            Arc::clone(storage),
            destination,
            initiator_id,
            data,
        ));
        self.stores_in_flight += 1;
    }

    fn publish_progress(&mut self) {
        let (active, queued) = self.queues().fold((0, 0), |(a, q), set| {
            (a + set.active_count(), q + set.pending_count() + set.retry_count())
        });
        if (active, queued) != self.last_progress {
            self.last_progress = (active, queued);
            self.publish(DownloadEvent::Progress { active, queued });
        }
    }

    fn publish(&self, event: DownloadEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    fn queues(&self) -> impl Iterator<Item = &QueueSet> {
        self.custom
            .iter()
            .chain([&self.default_browse, &self.default_bulk])
    }

    fn queues_mut(&mut self) -> impl Iterator<Item = &mut QueueSet> {
        self.custom
            .iter_mut()
            .chain([&mut self.default_browse, &mut self.default_bulk])
    }

    fn queue_mut(&mut self, id: QueueSetId) -> Option<&mut QueueSet> {
        match id {
            QueueSetId::Default(DownloadUsage::Browse) => Some(&mut self.default_browse),
            QueueSetId::Default(DownloadUsage::Bulk) => Some(&mut self.default_bulk),
            QueueSetId::Custom(index) => self.custom.get_mut(index),
        }
    }
}
