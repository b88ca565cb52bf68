use url::Url;

use crate::http::{FetchError, HttpClient, HttpResponse};
use crate::policy::DownloadUsage;

pub type JobId = u64;

/// Retries granted after the first failed attempt.
pub const DEFAULT_MAX_RETRIES: u32 = 2;

/// One tile request: where to fetch it from and where to store it.
#[derive(Debug, Clone)]
pub struct Job {
    id: JobId,
    source_url: Url,
    destination: String,
    initiator_id: String,
    usage: DownloadUsage,
    trials_left: u32,
}

/// Outcome of a single attempt.
#[derive(Debug)]
pub enum JobResult {
    Finished(Vec<u8>),
    Redirected(Url),
    Failed(FetchError),
}

impl Job {
    pub fn new(
        id: JobId,
        source_url: Url,
        destination: impl Into<String>,
        initiator_id: impl Into<String>,
        usage: DownloadUsage,
        max_retries: u32,
    ) -> Self {
        Self {
            id,
            source_url,
            destination: destination.into(),
            initiator_id: initiator_id.into(),
            usage,
            trials_left: max_retries,
        }
    }

    pub fn id(&self) -> JobId {
        self.id
    }

    pub fn source_url(&self) -> &Url {
        &self.source_url
    }

    pub fn destination(&self) -> &str {
        &self.destination
    }

    pub fn initiator_id(&self) -> &str {
        &self.initiator_id
    }

    pub fn usage(&self) -> DownloadUsage {
        self.usage
    }

    pub fn trials_left(&self) -> u32 {
        self.trials_left
    }

    /// Consume one retry. Returns false once the budget is exhausted.
    pub fn try_again(&mut self) -> bool {
        if self.trials_left == 0 {
            return false;
        }
        self.trials_left -= 1;
        true
    }

    /// Run one blocking GET against `client`.
    pub fn execute(&self, client: &dyn HttpClient, user_agent: &str) -> JobResult {
        match client.get(&self.source_url, user_agent) {
            Ok(HttpResponse::Body(data)) => JobResult::Finished(data),
            Ok(HttpResponse::Redirect(target)) => JobResult::Redirected(target),
            Err(e) => JobResult::Failed(e),
        }
    }
}
