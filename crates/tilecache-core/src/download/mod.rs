//! Policy-based download admission.
//!
//! Submissions are routed to the first registered policy matching the URL's
//! host and usage class, or to the built-in policy for that usage. Each
//! policy owns a [`QueueSet`] that caps concurrent connections, retries
//! failed jobs on a shared timer and hands redirects back for re-routing.

mod job;
mod manager;
mod queue_set;
mod runner;
mod service;
mod store;

pub use job::{Job, JobId, JobResult, DEFAULT_MAX_RETRIES};
pub use manager::{DownloadEvent, DownloadManager, ManagerSnapshot, QueueSnapshot};
pub use queue_set::{QueueEvent, QueueSet};
pub use runner::{BlockingRunner, JobOutcome, JobRunner, QueueSetId};
pub use service::{DownloadHandle, DownloadService};
pub use store::{PendingStore, StoreOutcome};
