use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::error::{truncate, PipelineError, Result};
use crate::notify::JobEvent;
use crate::processing::{JobError, ProcessOutcome, VideoPipeline};
use crate::queue::{FailOutcome, Job, JobQueue};
use crate::state::MAX_ERROR_CHARS;
use crate::workspace::sweep_orphaned_workspaces;

/// How one claimed attempt ended
#[derive(Debug, Clone, PartialEq)]
pub enum AttemptOutcome {
    Completed,
    AlreadyCompleted,
    /// Failed and queued again
    Retrying,
    /// Failed with no attempts left
    Failed,
    /// A superseding enqueue started a new run
    Restarted,
    /// Another worker owns the video right now
    Duplicate,
    /// The lease expired before the attempt could be settled
    LeaseLost,
}

#[derive(Debug, Clone)]
pub struct AttemptReport {
    pub job_id: String,
    pub attempt: u32,
    pub outcome: AttemptOutcome,
}

/// Pulls jobs from the queue with a fixed number of worker loops, keeps
/// their leases alive and recovers stalled jobs
#[derive(Clone)]
pub struct WorkerPool {
    pipeline: Arc<VideoPipeline>,
    concurrency: usize,
    heartbeat_interval: Duration,
    stall_check_interval: Duration,
    poll_interval: Duration,
    workspace_root: PathBuf,
    orphan_max_age: Duration,
}

impl WorkerPool {
    pub fn new(pipeline: Arc<VideoPipeline>, config: &Config) -> Self {
        Self {
            pipeline,
            concurrency: config.queue.worker_concurrency.max(1),
            heartbeat_interval: config.queue.heartbeat_interval(),
            stall_check_interval: config.queue.stall_check_interval(),
            poll_interval: config.queue.poll_interval(),
            workspace_root: config.storage.workspace_root(),
            orphan_max_age: Duration::from_secs(config.storage.orphan_max_age_secs),
        }
    }

    fn queue(&self) -> &Arc<JobQueue> {
        self.pipeline.queue()
    }

    /// Spawn the worker loops and the stall reaper. They stop once `shutdown`
    /// turns true; a worker finishes its current attempt first.
    pub fn start(&self, shutdown: watch::Receiver<bool>) -> Vec<JoinHandle<()>> {
        sweep_orphaned_workspaces(&self.workspace_root, self.orphan_max_age);

        info!("🚀 Starting {} workers", self.concurrency);
        let mut handles: Vec<JoinHandle<()>> = (0..self.concurrency)
            .map(|i| {
                let pool = self.clone();
                let shutdown = shutdown.clone();
                let worker_id = format!("worker-{}-{}", std::process::id(), i);
                tokio::spawn(async move { pool.worker_loop(worker_id, shutdown).await })
            })
            .collect();

        let pool = self.clone();
        handles.push(tokio::spawn(async move { pool.reaper_loop(shutdown).await }));
        handles
    }

    async fn worker_loop(self, worker_id: String, mut shutdown: watch::Receiver<bool>) {
        info!("👷 Worker {} started", worker_id);

        while !*shutdown.borrow() {
            match self.run_once(&worker_id).await {
                Ok(Some(report)) => {
                    debug!("Worker {} settled {:?}", worker_id, report);
                }
                Ok(None) => {
                    tokio::select! {
                        _ = self.queue().wait_for_job(self.poll_interval) => {}
                        changed = shutdown.changed() => {
                            // sender gone means nobody can ask us to stop later
                            if changed.is_err() {
                                break;
                            }
                        }
                    }
                }
                Err(e) => {
                    error!("Worker {} queue error: {}", worker_id, e);
                    tokio::time::sleep(self.poll_interval).await;
                }
            }
        }

        info!("👋 Worker {} stopped", worker_id);
    }

    async fn reaper_loop(self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.stall_check_interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.reap_stalled().await {
                        error!("Stall check failed: {}", e);
                    }
                    self.pipeline.services().notifier.prune_idle_rooms();
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
    }

    /// Claim and process at most one job. `None` when nothing was claimable.
    pub async fn run_once(&self, worker_id: &str) -> Result<Option<AttemptReport>> {
        let Some(job) = self.queue().claim(worker_id).await? else {
            return Ok(None);
        };

        let (lease_lost_tx, mut lease_lost) = oneshot::channel();
        let heartbeat = spawn_heartbeat(
            self.queue().clone(),
            job.id.clone(),
            worker_id.to_string(),
            job.attempt,
            self.heartbeat_interval,
            lease_lost_tx,
        );

        // dropping the attempt future removes its workspace
        let result = tokio::select! {
            result = self.pipeline.process(&job, worker_id) => Some(result),
            Ok(()) = &mut lease_lost => None,
        };
        heartbeat.abort();

        let Some(result) = result else {
            warn!(
                "🛑 Job {} attempt {} cancelled, another worker may own it now",
                job.id, job.attempt
            );
            return Ok(Some(AttemptReport {
                job_id: job.id,
                attempt: job.attempt,
                outcome: AttemptOutcome::LeaseLost,
            }));
        };

        let outcome = self.settle(&job, worker_id, result).await?;
        Ok(Some(AttemptReport {
            job_id: job.id,
            attempt: job.attempt,
            outcome,
        }))
    }

    /// Apply the result of an attempt to the queue, the record and live clients
    async fn settle(
        &self,
        job: &Job,
        worker_id: &str,
        result: std::result::Result<ProcessOutcome, JobError>,
    ) -> Result<AttemptOutcome> {
        let services = self.pipeline.services();

        match result {
            Ok(outcome) => {
                let restarted = match self.queue().complete(&job.id, worker_id, job.attempt).await {
                    Ok(restarted) => restarted,
                    Err(PipelineError::LeaseLost(_)) => {
                        warn!("Job {} lease lost before completion was recorded", job.id);
                        return Ok(AttemptOutcome::LeaseLost);
                    }
                    Err(e) => return Err(e),
                };

                let record = outcome.record();
                services.notifier.notify(
                    &job.id,
                    JobEvent::Completed {
                        transcript: record.transcript.clone().unwrap_or_default(),
                        summary: record.summary.clone().unwrap_or_default(),
                    },
                );

                if restarted.is_some() {
                    return Ok(AttemptOutcome::Restarted);
                }

                Ok(match outcome {
                    ProcessOutcome::Completed(_) => AttemptOutcome::Completed,
                    ProcessOutcome::AlreadyCompleted(_) => AttemptOutcome::AlreadyCompleted,
                })
            }
            Err(job_error) => match &job_error.source {
                PipelineError::LeaseLost(_) => {
                    warn!("Job {} attempt {} lost its lease: {}", job.id, job.attempt, job_error);
                    Ok(AttemptOutcome::LeaseLost)
                }
                PipelineError::DuplicateInFlight(_) => {
                    let message = job_error.to_string();
                    match self
                        .queue()
                        .fail(&job.id, worker_id, job.attempt, &message, true)
                        .await
                    {
                        Ok(_) | Err(PipelineError::LeaseLost(_)) => Ok(AttemptOutcome::Duplicate),
                        Err(e) => Err(e),
                    }
                }
                _ => self.settle_failure(job, worker_id, &job_error).await,
            },
        }
    }

    async fn settle_failure(&self, job: &Job, worker_id: &str, job_error: &JobError) -> Result<AttemptOutcome> {
        let services = self.pipeline.services();
        let message = job_error.to_string();

        if let Err(e) = services.records.mark_failed(&job.id, job.attempt, &message).await {
            error!("Failed to store failure of job {}: {}", job.id, e);
        }

        let outcome = match self
            .queue()
            .fail(&job.id, worker_id, job.attempt, &message, job_error.is_retryable())
            .await
        {
            Ok(outcome) => outcome,
            Err(PipelineError::LeaseLost(_)) => return Ok(AttemptOutcome::LeaseLost),
            Err(e) => return Err(e),
        };

        services.notifier.notify(
            &job.id,
            JobEvent::Failed {
                error: truncate(&message, MAX_ERROR_CHARS - 3),
                retrying: !matches!(outcome, FailOutcome::Exhausted),
            },
        );

        Ok(match outcome {
            FailOutcome::Retrying { .. } => AttemptOutcome::Retrying,
            FailOutcome::Exhausted => AttemptOutcome::Failed,
            FailOutcome::Restarted => AttemptOutcome::Restarted,
        })
    }

    /// Recover jobs whose worker stopped heartbeating. Returns how many were
    /// reclaimed.
    pub async fn reap_stalled(&self) -> Result<usize> {
        let reclaimed = self.queue().reclaim_stalled().await?;
        let services = self.pipeline.services();

        for (job, outcome) in &reclaimed {
            let error = job.last_error.clone().unwrap_or_else(|| "stalled".to_string());
            match outcome {
                FailOutcome::Exhausted => {
                    services.records.mark_failed(&job.id, job.attempt, &error).await?;
                    services.notifier.notify(
                        &job.id,
                        JobEvent::Failed {
                            error,
                            retrying: false,
                        },
                    );
                }
                FailOutcome::Retrying { .. } => {
                    services.notifier.notify(
                        &job.id,
                        JobEvent::Failed {
                            error,
                            retrying: true,
                        },
                    );
                }
                FailOutcome::Restarted => {
                    debug!("Stalled job {} restarted with superseding inputs", job.id);
                }
            }
        }

        Ok(reclaimed.len())
    }
}

/// Renew the lease every `interval` until aborted. Failed renewals are retried
/// on the next tick; a lost lease is reported on `lease_lost` and ends the task.
fn spawn_heartbeat(
    queue: Arc<JobQueue>,
    job_id: String,
    worker_id: String,
    attempt: u32,
    interval: Duration,
    lease_lost: oneshot::Sender<()>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            match queue.heartbeat(&job_id, &worker_id, attempt).await {
                Ok(()) => {}
                Err(PipelineError::LeaseLost(_)) => {
                    warn!("💔 Job {} attempt {} lost its lease", job_id, attempt);
                    let _ = lease_lost.send(());
                    break;
                }
                Err(e) => {
                    warn!("💔 Heartbeat for job {} failed, retrying next tick: {}", job_id, e);
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::QueueConfig;
    use crate::queue::EnqueueRequest;
    use chrono::Utc;
    use tempfile::TempDir;

    async fn claimed_job(dir: &TempDir, lock_duration_secs: u64) -> Arc<JobQueue> {
        let config = QueueConfig {
            lock_duration_secs,
            ..QueueConfig::default()
        };
        let queue = JobQueue::open(dir.path().join("jobs"), config).await.unwrap();
        queue
            .enqueue(EnqueueRequest::new("v1", "https://example.com/v1.mp4", "english"))
            .await
            .unwrap();
        queue.claim("w1").await.unwrap().unwrap();
        Arc::new(queue)
    }

    #[tokio::test]
    async fn test_heartbeat_outlives_a_failed_renewal() {
        let dir = TempDir::new().unwrap();
        let queue = claimed_job(&dir, 3).await;

        // a directory where the temp document goes makes the next write fail
        let blocker = dir.path().join("jobs").join("v1.json.tmp");
        std::fs::create_dir(&blocker).unwrap();

        let (tx, mut lease_lost) = oneshot::channel();
        let heartbeat = spawn_heartbeat(
            queue.clone(),
            "v1".to_string(),
            "w1".to_string(),
            1,
            Duration::from_secs(1),
            tx,
        );

        tokio::time::sleep(Duration::from_millis(1500)).await;
        std::fs::remove_dir(&blocker).unwrap();
        tokio::time::sleep(Duration::from_millis(2000)).await;

        assert!(!heartbeat.is_finished());
        assert!(lease_lost.try_recv().is_err());
        let lease = queue.get("v1").await.unwrap().lease.unwrap();
        assert!(lease.expires_at > Utc::now());
        assert!(queue.reclaim_stalled().await.unwrap().is_empty());
        heartbeat.abort();
    }

    #[tokio::test]
    async fn test_heartbeat_reports_lost_lease() {
        let dir = TempDir::new().unwrap();
        let queue = claimed_job(&dir, 0).await;
        assert_eq!(queue.reclaim_stalled().await.unwrap().len(), 1);

        let (tx, lease_lost) = oneshot::channel();
        let heartbeat = spawn_heartbeat(
            queue,
            "v1".to_string(),
            "w1".to_string(),
            1,
            Duration::from_millis(50),
            tx,
        );

        let signal = tokio::time::timeout(Duration::from_secs(2), lease_lost).await;
        assert!(matches!(signal, Ok(Ok(()))));
        tokio::time::timeout(Duration::from_secs(1), heartbeat)
            .await
            .unwrap()
            .unwrap();
    }
}
