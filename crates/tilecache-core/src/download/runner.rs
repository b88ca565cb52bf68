//! Execution seam between queue sets and the network.

use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::debug;

use super::job::{Job, JobId, JobResult};
use crate::http::HttpClient;
use crate::policy::DownloadUsage;

/// Identifies the queue set a job belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueueSetId {
    /// Built-in policy for a usage class.
    Default(DownloadUsage),
    /// Registered policy, by registration index.
    Custom(usize),
}

/// Finished attempt, routed back to the owning queue set.
#[derive(Debug)]
pub struct JobOutcome {
    pub queue: QueueSetId,
    pub job_id: JobId,
    pub result: JobResult,
}

/// Starts job attempts. Implementations must not block the caller; the
/// outcome is delivered later to the download manager.
pub trait JobRunner: Send + Sync {
    fn start(&self, queue: QueueSetId, job: &Job);
}

/// Runs each attempt on tokio's blocking pool and sends the outcome on an
/// unbounded channel. Must be used from within a tokio runtime.
pub struct BlockingRunner {
    client: Arc<dyn HttpClient>,
    user_agent: String,
    outcomes: mpsc::UnboundedSender<JobOutcome>,
}

impl BlockingRunner {
    pub fn new(
        client: Arc<dyn HttpClient>,
        user_agent: String,
        outcomes: mpsc::UnboundedSender<JobOutcome>,
    ) -> Self {
        Self {
            client,
            user_agent,
            outcomes,
        }
    }
}

impl JobRunner for BlockingRunner {
    fn start(&self, queue: QueueSetId, job: &Job) {
        let job = job.clone();
        let client = Arc::clone(&self.client);
        let user_agent = self.user_agent.clone();
        let outcomes = self.outcomes.clone();
        tokio::task::spawn_blocking(move || {
            let result = job.execute(client.as_ref(), &user_agent);
            let outcome = JobOutcome {
                queue,
                job_id: job.id(),
                result,
            };
            if outcomes.send(outcome).is_err() {
                debug!(job_id = job.id(), "download service gone; outcome dropped");
            }
        });
    }
}
