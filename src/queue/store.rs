use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::fs;
use tokio::sync::{Notify, RwLock};
use tracing::{debug, info, warn};

use super::job::{validate_video_id, EnqueuePolicy, EnqueueRequest, Job, JobPhase, JobStatus, Lease};
use crate::config::QueueConfig;
use crate::documents::{document_path, load_all, write_atomic};
use crate::error::{PipelineError, Result};

/// Result of an enqueue call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueOutcome {
    /// A new run was queued
    Enqueued,
    /// A live job already exists and was left alone
    AlreadyPending,
    /// The queued job's inputs were replaced
    Superseded,
    /// The active job will run again once the current attempt ends
    RerunScheduled,
}

/// Result of reporting a failed attempt
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum FailOutcome {
    /// Queued again, claimable from `at`
    Retrying { at: DateTime<Utc> },
    /// Permanently failed
    Exhausted,
    /// A superseding enqueue restarted the job with new inputs
    Restarted,
}

/// Hook that runs under the queue's write lock before a new run of a video
/// becomes claimable. An error aborts the enqueue or restart and nothing is
/// persisted. Implementations must not call back into the queue.
#[async_trait]
pub trait RunListener: Send + Sync {
    async fn run_starting(&self, request: &EnqueueRequest) -> Result<()>;
}

/// Durable at-least-once job queue backed by one JSON document per job.
///
/// Every mutation takes the write lock, persists the new document and only
/// then updates the in-memory copy, so a failed write leaves both unchanged.
pub struct JobQueue {
    dir: PathBuf,
    config: QueueConfig,
    jobs: RwLock<HashMap<String, Job>>,
    wakeup: Notify,
    listener: Option<Arc<dyn RunListener>>,
}

impl JobQueue {
    /// Open the queue stored in `dir`, creating it if needed
    pub async fn open(dir: impl AsRef<Path>, config: QueueConfig) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir).await.map_err(|e| {
            PipelineError::Storage(format!("failed to create {}: {}", dir.display(), e))
        })?;

        let jobs: HashMap<String, Job> = load_all::<Job>(&dir)
            .await?
            .into_iter()
            .map(|job| (job.id.clone(), job))
            .collect();

        let live = jobs.values().filter(|j| j.is_live()).count();
        info!("📬 Job queue opened with {} jobs ({} live)", jobs.len(), live);

        Ok(Self {
            dir,
            config,
            jobs: RwLock::new(jobs),
            wakeup: Notify::new(),
            listener: None,
        })
    }

    /// Run `listener` whenever a video is about to get a fresh run
    pub fn with_run_listener(mut self, listener: Arc<dyn RunListener>) -> Self {
        self.listener = Some(listener);
        self
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    async fn persist(&self, job: &Job) -> Result<()> {
        write_atomic(&document_path(&self.dir, &job.id), job).await
    }

    async fn announce_run(&self, job: &Job) -> Result<()> {
        match &self.listener {
            Some(listener) => {
                let request = EnqueueRequest::new(&job.id, &job.source_url, &job.language);
                listener.run_starting(&request).await
            }
            None => Ok(()),
        }
    }

    /// Enqueue with the configured policy
    pub async fn enqueue(&self, request: EnqueueRequest) -> Result<EnqueueOutcome> {
        self.enqueue_with_policy(request, self.config.enqueue_policy).await
    }

    /// Enqueue a video. At most one live job exists per video id.
    pub async fn enqueue_with_policy(
        &self,
        request: EnqueueRequest,
        policy: EnqueuePolicy,
    ) -> Result<EnqueueOutcome> {
        let request = EnqueueRequest {
            video_id: validate_video_id(&request.video_id)?.to_string(),
            ..request
        };
        let now = Utc::now();
        let mut jobs = self.jobs.write().await;

        let (job, outcome) = match jobs.get(&request.video_id) {
            None => (Job::new(&request, self.config.max_attempts), EnqueueOutcome::Enqueued),
            Some(existing) if existing.status.is_terminal() => {
                let mut job = existing.clone();
                job.restart(&request, self.config.max_attempts, now);
                (job, EnqueueOutcome::Enqueued)
            }
            Some(existing) => match (policy, existing.status) {
                (EnqueuePolicy::Ignore, _) => {
                    debug!("Job {} already {}, ignoring enqueue", existing.id, existing.status);
                    return Ok(EnqueueOutcome::AlreadyPending);
                }
                (EnqueuePolicy::Supersede, JobStatus::Active) => {
                    let mut job = existing.clone();
                    job.rerun = Some(request.clone());
                    job.updated_at = now;
                    (job, EnqueueOutcome::RerunScheduled)
                }
                (EnqueuePolicy::Supersede, _) => {
                    let mut job = existing.clone();
                    job.restart(&request, self.config.max_attempts, now);
                    (job, EnqueueOutcome::Superseded)
                }
            },
        };

        if matches!(outcome, EnqueueOutcome::Enqueued | EnqueueOutcome::Superseded) {
            self.announce_run(&job).await?;
        }
        self.persist(&job).await?;
        info!("📥 Job {} {:?}", job.id, outcome);
        jobs.insert(job.id.clone(), job);
        drop(jobs);

        self.wakeup.notify_one();
        Ok(outcome)
    }

    /// Claim the oldest claimable job, starting its next attempt under a lease
    pub async fn claim(&self, worker_id: &str) -> Result<Option<Job>> {
        let now = Utc::now();
        let mut jobs = self.jobs.write().await;

        let next_id = jobs
            .values()
            .filter(|job| job.is_claimable(now))
            .min_by_key(|job| (job.available_at, job.created_at))
            .map(|job| job.id.clone());

        let Some(id) = next_id else {
            return Ok(None);
        };
        let Some(existing) = jobs.get(&id) else {
            return Ok(None);
        };

        let mut job = existing.clone();
        job.status = JobStatus::Active;
        job.attempt += 1;
        job.phase = None;
        job.progress = 0;
        job.updated_at = now;
        job.lease = Some(Lease {
            worker_id: worker_id.to_string(),
            acquired_at: now,
            heartbeat_at: now,
            expires_at: now + lease_length(&self.config),
        });

        self.persist(&job).await?;
        info!(
            "🔒 Worker {} claimed job {} (attempt {}/{})",
            worker_id, job.id, job.attempt, job.max_attempts
        );
        jobs.insert(id, job.clone());
        Ok(Some(job))
    }

    /// Look up a job the caller must currently own
    fn owned<'a>(
        jobs: &'a HashMap<String, Job>,
        id: &str,
        worker_id: &str,
        attempt: u32,
    ) -> Result<&'a Job> {
        let job = jobs
            .get(id)
            .ok_or_else(|| PipelineError::LeaseLost(id.to_string()))?;

        let owns = job.status == JobStatus::Active
            && job.attempt == attempt
            && job.lease.as_ref().map_or(false, |l| l.worker_id == worker_id);

        if owns {
            Ok(job)
        } else {
            Err(PipelineError::LeaseLost(id.to_string()))
        }
    }

    /// Renew the lease of an active attempt
    pub async fn heartbeat(&self, id: &str, worker_id: &str, attempt: u32) -> Result<()> {
        let now = Utc::now();
        let mut jobs = self.jobs.write().await;
        let mut job = Self::owned(&jobs, id, worker_id, attempt)?.clone();

        if let Some(lease) = job.lease.as_mut() {
            lease.heartbeat_at = now;
            lease.expires_at = now + lease_length(&self.config);
        }
        job.updated_at = now;

        self.persist(&job).await?;
        debug!("💓 Heartbeat for job {} (attempt {})", id, attempt);
        jobs.insert(job.id.clone(), job);
        Ok(())
    }

    /// Record phase and progress; progress never moves backwards within an attempt
    pub async fn update_progress(
        &self,
        id: &str,
        worker_id: &str,
        attempt: u32,
        phase: JobPhase,
        progress: u8,
    ) -> Result<Job> {
        let now = Utc::now();
        let mut jobs = self.jobs.write().await;
        let mut job = Self::owned(&jobs, id, worker_id, attempt)?.clone();

        job.phase = Some(phase);
        job.progress = job.progress.max(progress.min(100));
        job.updated_at = now;

        self.persist(&job).await?;
        jobs.insert(job.id.clone(), job.clone());
        Ok(job)
    }

    /// Finish an attempt successfully. Returns the restarted job when a
    /// superseding enqueue arrived during the attempt.
    pub async fn complete(&self, id: &str, worker_id: &str, attempt: u32) -> Result<Option<Job>> {
        let now = Utc::now();
        let mut jobs = self.jobs.write().await;
        let mut job = Self::owned(&jobs, id, worker_id, attempt)?.clone();

        let restarted = match job.rerun.take() {
            Some(request) => {
                job.restart(&request, self.config.max_attempts, now);
                info!("🔄 Job {} completed, starting superseding run", id);
                true
            }
            None => {
                job.status = JobStatus::Completed;
                job.phase = Some(JobPhase::Completed);
                job.progress = 100;
                job.lease = None;
                job.last_error = None;
                job.updated_at = now;
                info!("✅ Job {} completed on attempt {}", id, attempt);
                false
            }
        };

        if restarted {
            self.announce_run(&job).await?;
        }
        self.persist(&job).await?;
        jobs.insert(job.id.clone(), job.clone());
        drop(jobs);

        if restarted {
            self.wakeup.notify_one();
            Ok(Some(job))
        } else {
            Ok(None)
        }
    }

    /// Finish an attempt with an error. Retryable errors are queued again with
    /// exponential backoff until `max_attempts` is reached.
    pub async fn fail(
        &self,
        id: &str,
        worker_id: &str,
        attempt: u32,
        error: &str,
        retryable: bool,
    ) -> Result<FailOutcome> {
        let now = Utc::now();
        let mut jobs = self.jobs.write().await;
        let mut job = Self::owned(&jobs, id, worker_id, attempt)?.clone();

        let outcome = self.settle_failure(&mut job, error, retryable, now);
        if outcome == FailOutcome::Restarted {
            self.announce_run(&job).await?;
        }

        self.persist(&job).await?;
        jobs.insert(job.id.clone(), job);
        drop(jobs);

        if !matches!(outcome, FailOutcome::Exhausted) {
            self.wakeup.notify_one();
        }
        Ok(outcome)
    }

    fn settle_failure(&self, job: &mut Job, error: &str, retryable: bool, now: DateTime<Utc>) -> FailOutcome {
        if let Some(request) = job.rerun.take() {
            job.restart(&request, self.config.max_attempts, now);
            info!("🔄 Job {} attempt failed, starting superseding run", job.id);
            return FailOutcome::Restarted;
        }

        job.lease = None;
        job.last_error = Some(error.to_string());
        job.updated_at = now;

        if retryable && !job.attempts_exhausted() {
            let delay = self.config.backoff_for(job.attempt);
            let at = now + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::zero());
            job.status = JobStatus::Queued;
            job.available_at = at;
            warn!(
                "🔁 Job {} attempt {}/{} failed, retrying in {:?}: {}",
                job.id, job.attempt, job.max_attempts, delay, error
            );
            FailOutcome::Retrying { at }
        } else {
            job.status = JobStatus::Failed;
            warn!(
                "❌ Job {} failed permanently after {} attempts: {}",
                job.id, job.attempt, error
            );
            FailOutcome::Exhausted
        }
    }

    /// Return active jobs whose lease expired to the queue, or fail them once
    /// their attempts are used up
    pub async fn reclaim_stalled(&self) -> Result<Vec<(Job, FailOutcome)>> {
        let now = Utc::now();
        let mut jobs = self.jobs.write().await;

        let stalled: Vec<Job> = jobs
            .values()
            .filter(|job| job.lease_expired(now))
            .cloned()
            .collect();

        let mut reclaimed = Vec::with_capacity(stalled.len());
        for mut job in stalled {
            let message = format!(
                "stalled: no heartbeat within {}s during attempt {}",
                self.config.lock_duration_secs, job.attempt
            );
            let outcome = self.settle_failure(&mut job, &message, true, now);
            match outcome {
                // stalled work is recovered straight away
                FailOutcome::Retrying { .. } => job.available_at = now,
                FailOutcome::Restarted => self.announce_run(&job).await?,
                FailOutcome::Exhausted => {}
            }

            self.persist(&job).await?;
            warn!("⏰ Reclaimed stalled job {}: {:?}", job.id, outcome);
            jobs.insert(job.id.clone(), job.clone());
            reclaimed.push((job, outcome));
        }
        drop(jobs);

        if reclaimed.iter().any(|(_, o)| !matches!(o, FailOutcome::Exhausted)) {
            self.wakeup.notify_waiters();
        }
        Ok(reclaimed)
    }

    pub async fn get(&self, id: &str) -> Option<Job> {
        self.jobs.read().await.get(id).cloned()
    }

    /// All jobs, oldest first
    pub async fn list(&self) -> Vec<Job> {
        let mut jobs: Vec<Job> = self.jobs.read().await.values().cloned().collect();
        jobs.sort_by_key(|job| job.created_at);
        jobs
    }

    /// Job counts by status
    pub async fn counts(&self) -> HashMap<JobStatus, usize> {
        let mut counts = HashMap::new();
        for job in self.jobs.read().await.values() {
            *counts.entry(job.status).or_insert(0) += 1;
        }
        counts
    }

    /// Wait until a job may have become claimable, or `timeout` elapses
    pub async fn wait_for_job(&self, timeout: Duration) {
        let _ = tokio::time::timeout(timeout, self.wakeup.notified()).await;
    }
}

fn lease_length(config: &QueueConfig) -> chrono::Duration {
    chrono::Duration::from_std(config.lock_duration()).unwrap_or_else(|_| chrono::Duration::seconds(300))
}
