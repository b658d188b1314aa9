//! Durable job queue with leases, heartbeats and bounded retries

pub mod job;
pub mod store;

pub use job::{validate_video_id, EnqueuePolicy, EnqueueRequest, Job, JobPhase, JobStatus, Lease};
pub use store::{EnqueueOutcome, FailOutcome, JobQueue, RunListener};
