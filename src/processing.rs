use chrono::Utc;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::audio::{remove_files, AudioExtractor, MediaSegmenter, SegmentedAudio};
use crate::config::Config;
use crate::download::{HttpFetcher, MediaFetcher};
use crate::error::{PipelineError, Result};
use crate::llm::{create_embedder, create_llm, Enricher};
use crate::notify::{JobEvent, Notifier};
use crate::queue::{EnqueueOutcome, EnqueueRequest, Job, JobPhase, JobQueue};
use crate::retry::{retry_with_backoff_if, RetryPolicy};
use crate::state::{CompletedVideo, VideoRecord, VideoRepository, VideoStatus};
use crate::transcription::{self, assemble, TranscriptionClient};
use crate::workspace::AttemptWorkspace;

/// Remote services and stores one pipeline attempt talks to
#[derive(Clone)]
pub struct PipelineServices {
    pub fetcher: Arc<dyn MediaFetcher>,
    pub segmenter: Arc<dyn MediaSegmenter>,
    pub transcriber: Arc<TranscriptionClient>,
    pub enricher: Arc<Enricher>,
    pub records: Arc<dyn VideoRepository>,
    pub notifier: Arc<Notifier>,
}

impl PipelineServices {
    /// Build the production services described by `config`
    pub fn from_config(
        config: &Config,
        records: Arc<dyn VideoRepository>,
        notifier: Arc<Notifier>,
    ) -> Result<Self> {
        let speech = transcription::create_backend(&config.transcription)?;
        let llm = create_llm(&config.llm)?;
        let embedder = create_embedder(&config.llm)?;

        Ok(Self {
            fetcher: Arc::new(HttpFetcher::new(&config.download)?),
            segmenter: Arc::new(AudioExtractor::new(config.audio.clone())),
            transcriber: Arc::new(TranscriptionClient::new(speech, &config.transcription)),
            enricher: Arc::new(Enricher::new(llm, embedder, config.llm.clone())),
            records,
            notifier,
        })
    }
}

/// Attempt failure with the stage it happened in
#[derive(Debug)]
pub struct JobError {
    pub phase: JobPhase,
    pub attempt: u32,
    pub chunk_index: Option<usize>,
    pub source: PipelineError,
}

impl JobError {
    fn new(phase: JobPhase, attempt: u32, source: PipelineError) -> Self {
        Self {
            phase,
            attempt,
            chunk_index: None,
            source,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.source.is_retryable()
    }
}

impl fmt::Display for JobError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} failed on attempt {}", self.phase, self.attempt)?;
        if let Some(index) = self.chunk_index {
            write!(f, " (chunk {})", index)?;
        }
        write!(f, ": {}", self.source)
    }
}

impl std::error::Error for JobError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.source)
    }
}

/// How an attempt ended successfully
#[derive(Debug, Clone)]
pub enum ProcessOutcome {
    /// This attempt produced the record
    Completed(VideoRecord),
    /// The record was already complete; nothing was redone
    AlreadyCompleted(VideoRecord),
}

impl ProcessOutcome {
    pub fn record(&self) -> &VideoRecord {
        match self {
            ProcessOutcome::Completed(record) | ProcessOutcome::AlreadyCompleted(record) => record,
        }
    }
}

/// Runs single attempts of video jobs: download, segment, transcribe,
/// assemble, enrich, persist
pub struct VideoPipeline {
    services: PipelineServices,
    queue: Arc<JobQueue>,
    workspace_root: PathBuf,
    duplicate_window: Duration,
    segment_retry: RetryPolicy,
}

impl VideoPipeline {
    pub fn new(services: PipelineServices, queue: Arc<JobQueue>, config: &Config) -> Self {
        let segment_backoff = Duration::from_millis(config.audio.segment_backoff_ms);
        Self {
            services,
            queue,
            workspace_root: config.storage.workspace_root(),
            duplicate_window: config.queue.duplicate_window(),
            segment_retry: RetryPolicy::new(
                config.audio.segment_attempts,
                segment_backoff,
                segment_backoff.saturating_mul(8),
            ),
        }
    }

    pub fn services(&self) -> &PipelineServices {
        &self.services
    }

    pub fn queue(&self) -> &Arc<JobQueue> {
        &self.queue
    }

    /// Process one claimed attempt of `job` owned by `worker_id`
    pub async fn process(&self, job: &Job, worker_id: &str) -> std::result::Result<ProcessOutcome, JobError> {
        let started = Instant::now();
        let attempt = job.attempt;
        let fail = |phase: JobPhase| move |e: PipelineError| JobError::new(phase, attempt, e);

        let records = &self.services.records;
        let existing = match records.get(&job.id).await.map_err(fail(JobPhase::Started))? {
            Some(record) => record,
            None => records
                .mark_queued(&EnqueueRequest::new(&job.id, &job.source_url, &job.language))
                .await
                .map_err(fail(JobPhase::Started))?,
        };

        if existing.status == VideoStatus::Completed {
            info!("♻️ Video {} already completed, replaying stored result", job.id);
            return Ok(ProcessOutcome::AlreadyCompleted(existing));
        }

        if self.is_in_flight_elsewhere(&existing, attempt) {
            warn!(
                "⏳ Video {} is being processed by attempt {} since {:?}",
                job.id, existing.processing_attempt, existing.processing_started_at
            );
            return Err(JobError::new(
                JobPhase::Started,
                attempt,
                PipelineError::DuplicateInFlight(job.id.clone()),
            ));
        }

        records
            .begin_processing(&job.id, attempt)
            .await
            .map_err(fail(JobPhase::Started))?;
        self.report(job, worker_id, JobPhase::Started, 5)
            .await
            .map_err(fail(JobPhase::Started))?;

        let workspace = AttemptWorkspace::create(&self.workspace_root, &job.id, attempt)
            .map_err(fail(JobPhase::Started))?;

        let result = self.run_stages(job, worker_id, &workspace).await;

        if let Err(e) = workspace.close() {
            warn!("Workspace cleanup for job {} failed: {}", job.id, e);
        }

        match &result {
            Ok(_) => info!(
                "✅ Job {} attempt {} finished in {:.1}s",
                job.id,
                attempt,
                started.elapsed().as_secs_f64()
            ),
            Err(e) => warn!("❌ Job {}: {}", job.id, e),
        }
        result
    }

    /// Another attempt marked the record processing recently and is not older than ours
    fn is_in_flight_elsewhere(&self, record: &VideoRecord, attempt: u32) -> bool {
        if record.status != VideoStatus::Processing || record.processing_attempt < attempt {
            return false;
        }

        let window = chrono::Duration::from_std(self.duplicate_window).unwrap_or_else(|_| chrono::Duration::zero());
        record
            .processing_started_at
            .map_or(false, |started| Utc::now() - started < window)
    }

    async fn run_stages(
        &self,
        job: &Job,
        worker_id: &str,
        workspace: &AttemptWorkspace,
    ) -> std::result::Result<ProcessOutcome, JobError> {
        let attempt = job.attempt;
        let fail = |phase: JobPhase| move |e: PipelineError| JobError::new(phase, attempt, e);

        // Download
        self.report(job, worker_id, JobPhase::Downloading, 10)
            .await
            .map_err(fail(JobPhase::Downloading))?;
        let source_path = workspace.file("source");
        let bytes = self
            .services
            .fetcher
            .fetch(&job.source_url, &source_path)
            .await
            .map_err(fail(JobPhase::Downloading))?;
        debug!("Job {} source is {} bytes", job.id, bytes);
        self.report(job, worker_id, JobPhase::Downloading, 30)
            .await
            .map_err(fail(JobPhase::Downloading))?;

        // Segment
        self.report(job, worker_id, JobPhase::Chunking, 35)
            .await
            .map_err(fail(JobPhase::Chunking))?;
        let segmented = self
            .segment(&source_path, workspace)
            .await
            .map_err(fail(JobPhase::Chunking))?;
        remove_files(&[source_path]).await;

        // Transcribe
        self.report(job, worker_id, JobPhase::Transcribing, 40)
            .await
            .map_err(fail(JobPhase::Transcribing))?;
        let notifier = &self.services.notifier;
        let job_id = job.id.as_str();
        let on_chunk = move |done: usize, total: usize| {
            let progress = 40 + (30 * done / total.max(1)) as u8;
            notifier.notify(
                job_id,
                JobEvent::Progress {
                    phase: JobPhase::Transcribing,
                    progress,
                },
            );
        };
        let (results, batch) = self
            .services
            .transcriber
            .transcribe_chunks(&segmented.chunks, &job.language, Some(&on_chunk))
            .await;
        remove_files(&[segmented.track_path.clone()]).await;

        if batch.all_failed() {
            let first = results.iter().find(|r| r.error);
            return Err(JobError {
                phase: JobPhase::Transcribing,
                attempt,
                chunk_index: first.map(|r| r.index),
                source: PipelineError::Transient(format!(
                    "all {} chunks failed transcription: {}",
                    batch.total,
                    first
                        .and_then(|r| r.error_message.clone())
                        .unwrap_or_default()
                )),
            });
        }
        if batch.failed > 0 {
            warn!(
                "⚠️ Job {}: {} of {} chunks failed, continuing with placeholders",
                job.id, batch.failed, batch.total
            );
        }

        // Assemble
        let transcript = assemble(results);
        self.report(job, worker_id, JobPhase::Transcribing, 70)
            .await
            .map_err(fail(JobPhase::Transcribing))?;

        // Enrich
        self.report(job, worker_id, JobPhase::Summarizing, 80)
            .await
            .map_err(fail(JobPhase::Summarizing))?;
        let summary = self
            .services
            .enricher
            .summarize(&transcript.text, &job.language)
            .await;

        self.report(job, worker_id, JobPhase::Embedding, 90)
            .await
            .map_err(fail(JobPhase::Embedding))?;
        let embeddings = if transcript.word_count > 0 {
            self.services.enricher.embed(&transcript.text).await
        } else {
            None
        };

        // Persist
        let record = self
            .services
            .records
            .mark_completed(
                &job.id,
                attempt,
                CompletedVideo {
                    transcript: transcript.text,
                    summary,
                    embeddings,
                    duration: segmented.total_duration,
                    word_count: transcript.word_count,
                    chunks: batch,
                },
            )
            .await
            .map_err(fail(JobPhase::Embedding))?;

        self.report(job, worker_id, JobPhase::Completed, 100)
            .await
            .map_err(fail(JobPhase::Completed))?;

        Ok(ProcessOutcome::Completed(record))
    }

    /// Full segmentation, retried from scratch on transcoder failures
    async fn segment(&self, source: &std::path::Path, workspace: &AttemptWorkspace) -> Result<SegmentedAudio> {
        let work_dir = workspace.file("audio");
        let segmenter = &self.services.segmenter;

        retry_with_backoff_if(
            "segmentation",
            &self.segment_retry,
            |e| !matches!(e, PipelineError::Validation(_)),
            |_| segmenter.segment(source, &work_dir),
        )
        .await
    }

    /// Persist progress for the owned attempt and tell live clients
    async fn report(&self, job: &Job, worker_id: &str, phase: JobPhase, progress: u8) -> Result<()> {
        let updated = self
            .queue
            .update_progress(&job.id, worker_id, job.attempt, phase, progress)
            .await?;

        self.services.notifier.notify(
            &job.id,
            JobEvent::Progress {
                phase,
                progress: updated.progress,
            },
        );
        Ok(())
    }
}

/// Validate a submission and enqueue it. The queue's run listener resets the
/// record before the new run becomes claimable.
pub async fn submit_video(queue: &JobQueue, request: EnqueueRequest, require_https: bool) -> Result<EnqueueOutcome> {
    request.validate(require_https)?;
    queue.enqueue(request).await
}

/// Answer a question about a completed video
pub async fn ask_video(
    records: &dyn VideoRepository,
    enricher: &Enricher,
    video_id: &str,
    question: &str,
) -> Result<String> {
    let record = records
        .get(video_id)
        .await?
        .ok_or_else(|| PipelineError::Validation(format!("unknown video {}", video_id)))?;

    match (record.status, record.transcript.as_deref()) {
        (VideoStatus::Completed, Some(transcript)) => enricher.answer_question(transcript, question).await,
        (status, _) => Err(PipelineError::Validation(format!(
            "video {} is {:?}, questions need a completed transcript",
            video_id, status
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_job_error_display() {
        let err = JobError {
            phase: JobPhase::Transcribing,
            attempt: 2,
            chunk_index: Some(3),
            source: PipelineError::Transient("503".to_string()),
        };
        assert_eq!(
            err.to_string(),
            "transcribing failed on attempt 2 (chunk 3): Transient backend error: 503"
        );
        assert!(err.is_retryable());

        let err = JobError::new(
            JobPhase::Downloading,
            1,
            PipelineError::Validation("source is too large".to_string()),
        );
        assert_eq!(
            err.to_string(),
            "downloading failed on attempt 1: Validation failed: source is too large"
        );
        assert!(!err.is_retryable());
    }
}
