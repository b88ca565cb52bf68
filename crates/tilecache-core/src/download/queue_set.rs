//! Per-policy admission state: pending, active and retry queues.
//!
//! A queue set never runs more than `max_connections` jobs at once and starts
//! pending jobs in submission order. It does no I/O itself: attempts are
//! handed to a [`JobRunner`] and their results come back through
//! [`QueueSet::handle_result`]. Observable transitions are buffered as
//! [`QueueEvent`]s for the manager to drain.

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;

use tracing::{debug, warn};
use url::Url;

use super::job::{Job, JobId, JobResult};
use super::runner::{JobRunner, QueueSetId};
use crate::policy::{DownloadPolicy, DownloadUsage};

#[derive(Debug, Clone)]
pub enum QueueEvent {
    JobAdded {
        destination: String,
    },
    JobRemoved {
        destination: String,
    },
    JobFinished {
        data: Arc<[u8]>,
        destination: String,
        initiator_id: String,
    },
    JobRetry,
    JobRedirected {
        url: Url,
        destination: String,
        initiator_id: String,
        usage: DownloadUsage,
    },
}

pub struct QueueSet {
    id: QueueSetId,
    policy: DownloadPolicy,
    pending: VecDeque<Job>,
    active: Vec<Job>,
    retry: VecDeque<Job>,
    /// Source URLs that exhausted their retries.
    blacklist: HashSet<String>,
    events: Vec<QueueEvent>,
}

impl QueueSet {
    pub fn new(id: QueueSetId, policy: DownloadPolicy) -> Self {
        Self {
            id,
            policy,
            pending: VecDeque::new(),
            active: Vec::new(),
            retry: VecDeque::new(),
            blacklist: HashSet::new(),
            events: Vec::new(),
        }
    }

    pub fn id(&self) -> QueueSetId {
        self.id
    }

    pub fn policy(&self) -> &DownloadPolicy {
        &self.policy
    }

    pub fn active_count(&self) -> usize {
        self.active.len()
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    pub fn retry_count(&self) -> usize {
        self.retry.len()
    }

    pub fn blacklisted_count(&self) -> usize {
        self.blacklist.len()
    }

    /// False when a queued or running job already targets `destination`, or
    /// when `url` previously failed for good.
    pub fn can_accept_job(&self, url: &Url, destination: &str) -> bool {
        if self.blacklist.contains(url.as_str()) {
            debug!(url = %url, "not requesting blacklisted url");
            return false;
        }
        let busy = self.targets(destination);
        if busy {
            debug!(destination, "download already queued");
        }
        !busy
    }

    /// True when a queued, running or retry-waiting job writes `destination`.
    pub fn targets(&self, destination: &str) -> bool {
        self.pending
            .iter()
            .chain(self.active.iter())
            .chain(self.retry.iter())
            .any(|job| job.destination() == destination)
    }

    pub fn add_job(&mut self, job: Job, runner: &dyn JobRunner) {
        self.events.push(QueueEvent::JobAdded {
            destination: job.destination().to_string(),
        });
        self.pending.push_back(job);
        self.activate_jobs(runner);
    }

    /// Start pending jobs, oldest first, while connection slots are free.
    pub fn activate_jobs(&mut self, runner: &dyn JobRunner) {
        while self.active.len() < self.policy.max_connections() {
            let Some(job) = self.pending.pop_front() else {
                break;
            };
            debug!(
                job_id = job.id(),
                url = %job.source_url(),
                active = self.active.len() + 1,
                "starting download"
            );
            runner.start(self.id, &job);
            self.active.push(job);
        }
    }

    /// Apply the outcome of an attempt. Returns false (and does nothing) when
    /// the job is no longer active, e.g. after a purge.
    pub fn handle_result(&mut self, job_id: JobId, result: JobResult, runner: &dyn JobRunner) -> bool {
        let Some(pos) = self.active.iter().position(|j| j.id() == job_id) else {
            debug!(job_id, "ignoring outcome of inactive job");
            return false;
        };
        let mut job = self.active.swap_remove(pos);
        self.events.push(QueueEvent::JobRemoved {
            destination: job.destination().to_string(),
        });

        match result {
            JobResult::Finished(data) => {
                self.events.push(QueueEvent::JobFinished {
                    data: data.into(),
                    destination: job.destination().to_string(),
                    initiator_id: job.initiator_id().to_string(),
                });
            }
            JobResult::Redirected(url) => {
                debug!(from = %job.source_url(), to = %url, "download redirected");
                self.events.push(QueueEvent::JobRedirected {
                    url,
                    destination: job.destination().to_string(),
                    initiator_id: job.initiator_id().to_string(),
                    usage: job.usage(),
                });
            }
            JobResult::Failed(err) => {
                if job.try_again() {
                    debug!(
                        url = %job.source_url(),
                        error = %err,
                        kind = ?err.kind(),
                        trials_left = job.trials_left(),
                        "download failed, will retry"
                    );
                    self.retry.push_back(job);
                    self.events.push(QueueEvent::JobRetry);
                } else {
                    warn!(
                        url = %job.source_url(),
                        error = %err,
                        kind = ?err.kind(),
                        "download failed permanently"
                    );
                    self.blacklist.insert(job.source_url().to_string());
                }
            }
        }

        self.activate_jobs(runner);
        true
    }

    /// Move every job waiting for a retry back to pending and fill free slots.
    pub fn retry_jobs(&mut self, runner: &dyn JobRunner) {
        while let Some(job) = self.retry.pop_front() {
            self.events.push(QueueEvent::JobAdded {
                destination: job.destination().to_string(),
            });
            self.pending.push_back(job);
        }
        self.activate_jobs(runner);
    }

    /// Drop every job without emitting events.
    pub fn purge_jobs(&mut self) {
        let dropped = self.pending.len() + self.active.len() + self.retry.len();
        self.pending.clear();
        self.active.clear();
        self.retry.clear();
        if dropped > 0 {
            debug!(queue = ?self.id, dropped, "purged download queue");
        }
    }

    pub fn drain_events(&mut self) -> Vec<QueueEvent> {
        std::mem::take(&mut self.events)
    }
}
