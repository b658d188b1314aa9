use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs;
use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::documents::{document_path, load_all, write_atomic};
use crate::error::{truncate, PipelineError, Result};
use crate::llm::{Summary, SummarySource};
use crate::queue::{EnqueueRequest, RunListener};
use crate::transcription::BatchSummary;

/// Longest error message stored on a record
pub const MAX_ERROR_CHARS: usize = 500;

/// Externally visible processing status of a video
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VideoStatus {
    Queued,
    Processing,
    Completed,
    Failed,
}

/// Persisted state of one video, polled by clients
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VideoRecord {
    pub id: String,
    pub status: VideoStatus,
    pub source_url: String,
    pub language: String,
    pub transcript: Option<String>,
    pub summary: Option<String>,
    pub summary_source: Option<SummarySource>,
    pub embeddings: Option<Vec<f32>>,
    /// Seconds of audio
    pub duration: Option<f64>,
    pub word_count: Option<usize>,
    pub chunks: Option<BatchSummary>,
    pub error: Option<String>,
    /// Job attempt that last moved this record to processing
    pub processing_attempt: u32,
    pub processing_started_at: Option<DateTime<Utc>>,
    pub processed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl VideoRecord {
    fn new(request: &EnqueueRequest, now: DateTime<Utc>) -> Self {
        Self {
            id: request.video_id.clone(),
            status: VideoStatus::Queued,
            source_url: request.source_url.clone(),
            language: request.language.clone(),
            transcript: None,
            summary: None,
            summary_source: None,
            embeddings: None,
            duration: None,
            word_count: None,
            chunks: None,
            error: None,
            processing_attempt: 0,
            processing_started_at: None,
            processed_at: None,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Output of a successful attempt
#[derive(Debug, Clone)]
pub struct CompletedVideo {
    pub transcript: String,
    pub summary: Summary,
    pub embeddings: Option<Vec<f32>>,
    pub duration: f64,
    pub word_count: usize,
    pub chunks: BatchSummary,
}

/// Storage of video records. Each method is one atomic document update.
#[async_trait]
pub trait VideoRepository: Send + Sync {
    async fn get(&self, id: &str) -> Result<Option<VideoRecord>>;

    /// Reset a record for a new run, creating it when missing
    async fn mark_queued(&self, request: &EnqueueRequest) -> Result<VideoRecord>;

    /// Move a record to processing for `attempt`. A completed record is never
    /// moved back; only `mark_queued` starts it over.
    async fn begin_processing(&self, id: &str, attempt: u32) -> Result<VideoRecord>;

    /// Store the result of `attempt`, which must still own the record
    async fn mark_completed(&self, id: &str, attempt: u32, result: CompletedVideo) -> Result<VideoRecord>;

    /// Record a failed attempt. Completed records and records owned by a
    /// newer attempt are left untouched and `None` is returned.
    async fn mark_failed(&self, id: &str, attempt: u32, error: &str) -> Result<Option<VideoRecord>>;
}

/// Resets a video's record whenever the queue starts a new run for it, so
/// no worker can claim the run while the record still shows the old one
pub struct RecordReset {
    records: Arc<dyn VideoRepository>,
}

impl RecordReset {
    pub fn new(records: Arc<dyn VideoRepository>) -> Self {
        Self { records }
    }
}

#[async_trait]
impl RunListener for RecordReset {
    async fn run_starting(&self, request: &EnqueueRequest) -> Result<()> {
        self.records.mark_queued(request).await?;
        Ok(())
    }
}

/// Video records stored as JSON documents with an in-memory cache
pub struct FileVideoRepository {
    dir: PathBuf,
    records: RwLock<HashMap<String, VideoRecord>>,
}

impl FileVideoRepository {
    pub async fn open(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir).await.map_err(|e| {
            PipelineError::Storage(format!("failed to create {}: {}", dir.display(), e))
        })?;

        let records: HashMap<String, VideoRecord> = load_all::<VideoRecord>(&dir)
            .await?
            .into_iter()
            .map(|record| (record.id.clone(), record))
            .collect();

        info!("📊 Video repository initialized with {} records", records.len());
        Ok(Self {
            dir,
            records: RwLock::new(records),
        })
    }

    /// Apply `update` to a copy of the record, persist it, then publish it
    async fn update<F>(&self, id: &str, update: F) -> Result<Option<VideoRecord>>
    where
        F: FnOnce(&mut VideoRecord) -> Result<bool> + Send,
    {
        let mut records = self.records.write().await;
        let mut record = records
            .get(id)
            .cloned()
            .ok_or_else(|| PipelineError::Storage(format!("video {} not found", id)))?;

        if !update(&mut record)? {
            return Ok(None);
        }
        record.updated_at = Utc::now();

        write_atomic(&document_path(&self.dir, id), &record).await?;
        records.insert(id.to_string(), record.clone());
        Ok(Some(record))
    }
}

#[async_trait]
impl VideoRepository for FileVideoRepository {
    async fn get(&self, id: &str) -> Result<Option<VideoRecord>> {
        Ok(self.records.read().await.get(id).cloned())
    }

    async fn mark_queued(&self, request: &EnqueueRequest) -> Result<VideoRecord> {
        let now = Utc::now();
        let mut records = self.records.write().await;

        let mut record = match records.get(&request.video_id) {
            Some(existing) => {
                let mut record = VideoRecord::new(request, now);
                record.created_at = existing.created_at;
                record.processing_attempt = 0;
                record
            }
            None => VideoRecord::new(request, now),
        };
        record.updated_at = now;

        write_atomic(&document_path(&self.dir, &record.id), &record).await?;
        debug!("💾 Video {} queued", record.id);
        records.insert(record.id.clone(), record.clone());
        Ok(record)
    }

    async fn begin_processing(&self, id: &str, attempt: u32) -> Result<VideoRecord> {
        let updated = self
            .update(id, |record| {
                if record.status == VideoStatus::Completed {
                    return Err(PipelineError::Validation(format!(
                        "video {} is already completed",
                        id
                    )));
                }
                record.status = VideoStatus::Processing;
                record.processing_attempt = attempt;
                record.processing_started_at = Some(Utc::now());
                record.error = None;
                Ok(true)
            })
            .await?;

        updated.ok_or_else(|| PipelineError::Storage(format!("video {} not updated", id)))
    }

    async fn mark_completed(&self, id: &str, attempt: u32, result: CompletedVideo) -> Result<VideoRecord> {
        let updated = self
            .update(id, |record| {
                if record.status != VideoStatus::Processing || record.processing_attempt != attempt {
                    return Err(PipelineError::LeaseLost(id.to_string()));
                }
                record.status = VideoStatus::Completed;
                record.transcript = Some(result.transcript);
                record.summary = Some(result.summary.text);
                record.summary_source = Some(result.summary.source);
                record.embeddings = result.embeddings;
                record.duration = Some(result.duration);
                record.word_count = Some(result.word_count);
                record.chunks = Some(result.chunks);
                record.error = None;
                record.processed_at = Some(Utc::now());
                Ok(true)
            })
            .await?;

        updated.ok_or_else(|| PipelineError::Storage(format!("video {} not updated", id)))
    }

    async fn mark_failed(&self, id: &str, attempt: u32, error: &str) -> Result<Option<VideoRecord>> {
        self.update(id, |record| {
            if record.status == VideoStatus::Completed || record.processing_attempt > attempt {
                return Ok(false);
            }
            record.status = VideoStatus::Failed;
            // leave room for the ellipsis
            record.error = Some(truncate(error, MAX_ERROR_CHARS - 3));
            record.processed_at = Some(Utc::now());
            Ok(true)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn request() -> EnqueueRequest {
        EnqueueRequest::new("v1", "https://example.com/v1.mp4", "english")
    }

    fn completed() -> CompletedVideo {
        CompletedVideo {
            transcript: "[00:00] hello".to_string(),
            summary: Summary {
                text: "A greeting.".to_string(),
                source: SummarySource::Generated,
            },
            embeddings: None,
            duration: 12.5,
            word_count: 1,
            chunks: BatchSummary::from_results(&[]),
        }
    }

    #[tokio::test]
    async fn test_record_lifecycle() {
        let dir = TempDir::new().unwrap();
        let repo = FileVideoRepository::open(dir.path()).await.unwrap();

        let record = repo.mark_queued(&request()).await.unwrap();
        assert_eq!(record.status, VideoStatus::Queued);

        let record = repo.begin_processing("v1", 1).await.unwrap();
        assert_eq!(record.status, VideoStatus::Processing);
        assert_eq!(record.processing_attempt, 1);

        let record = repo.mark_completed("v1", 1, completed()).await.unwrap();
        assert_eq!(record.status, VideoStatus::Completed);
        assert_eq!(record.summary.as_deref(), Some("A greeting."));
        assert!(record.processed_at.is_some());

        let reopened = FileVideoRepository::open(dir.path()).await.unwrap();
        let stored = reopened.get("v1").await.unwrap().unwrap();
        assert_eq!(stored.transcript.as_deref(), Some("[00:00] hello"));
    }

    #[tokio::test]
    async fn test_completed_record_never_moves_backwards() {
        let dir = TempDir::new().unwrap();
        let repo = FileVideoRepository::open(dir.path()).await.unwrap();
        repo.mark_queued(&request()).await.unwrap();
        repo.begin_processing("v1", 1).await.unwrap();
        repo.mark_completed("v1", 1, completed()).await.unwrap();

        assert!(repo.begin_processing("v1", 2).await.is_err());
        assert!(repo.mark_failed("v1", 2, "late failure").await.unwrap().is_none());
        assert_eq!(
            repo.get("v1").await.unwrap().unwrap().status,
            VideoStatus::Completed
        );

        // an explicit re-enqueue starts over
        let record = repo.mark_queued(&request()).await.unwrap();
        assert_eq!(record.status, VideoStatus::Queued);
        assert!(record.transcript.is_none());
    }

    #[tokio::test]
    async fn test_stale_attempt_cannot_write() {
        let dir = TempDir::new().unwrap();
        let repo = FileVideoRepository::open(dir.path()).await.unwrap();
        repo.mark_queued(&request()).await.unwrap();
        repo.begin_processing("v1", 1).await.unwrap();
        repo.begin_processing("v1", 2).await.unwrap();

        let stale = repo.mark_completed("v1", 1, completed()).await;
        assert!(matches!(stale, Err(PipelineError::LeaseLost(_))));
        assert!(repo.mark_failed("v1", 1, "old").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_failure_message_is_truncated() {
        let dir = TempDir::new().unwrap();
        let repo = FileVideoRepository::open(dir.path()).await.unwrap();
        repo.mark_queued(&request()).await.unwrap();
        repo.begin_processing("v1", 1).await.unwrap();

        let long_error = "x".repeat(2000);
        let record = repo.mark_failed("v1", 1, &long_error).await.unwrap().unwrap();
        assert_eq!(record.status, VideoStatus::Failed);
        assert_eq!(record.error.unwrap().chars().count(), MAX_ERROR_CHARS);
    }

    #[tokio::test]
    async fn test_record_is_reset_before_rerun_is_claimable() {
        use crate::config::QueueConfig;
        use crate::queue::{EnqueueOutcome, JobQueue};

        let dir = TempDir::new().unwrap();
        let repo: Arc<dyn VideoRepository> =
            Arc::new(FileVideoRepository::open(dir.path().join("videos")).await.unwrap());
        let queue = JobQueue::open(dir.path().join("jobs"), QueueConfig::default())
            .await
            .unwrap()
            .with_run_listener(Arc::new(RecordReset::new(repo.clone())));

        assert_eq!(queue.enqueue(request()).await.unwrap(), EnqueueOutcome::Enqueued);
        assert_eq!(repo.get("v1").await.unwrap().unwrap().status, VideoStatus::Queued);

        let job = queue.claim("w1").await.unwrap().unwrap();
        repo.begin_processing("v1", job.attempt).await.unwrap();
        repo.mark_completed("v1", job.attempt, completed()).await.unwrap();
        queue.complete("v1", "w1", job.attempt).await.unwrap();

        assert_eq!(queue.enqueue(request()).await.unwrap(), EnqueueOutcome::Enqueued);
        let claimed = queue.claim("w2").await.unwrap().unwrap();
        let record = repo.get(&claimed.id).await.unwrap().unwrap();
        assert_eq!(record.status, VideoStatus::Queued);
        assert!(record.transcript.is_none());
        assert_eq!(record.processing_attempt, 0);
    }
}
