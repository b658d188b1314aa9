//! End-to-end pipeline scenarios driven through in-process fakes of every
//! remote service. No network and no ffmpeg are needed.

use async_trait::async_trait;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tempfile::TempDir;
use tokio_test::{assert_err, assert_ok};

use vidscribe::audio::{plan_chunks, AudioChunk, MediaSegmenter, SegmentedAudio};
use vidscribe::config::{Config, ConfigBuilder};
use vidscribe::download::MediaFetcher;
use vidscribe::error::{PipelineError, Result};
use vidscribe::llm::{ChatMessage, Embedder, Enricher, LLMProvider, LLMResponse, Summary, SummarySource, LLM};
use vidscribe::notify::{JobEvent, Notifier};
use vidscribe::processing::{submit_video, PipelineServices, VideoPipeline};
use vidscribe::queue::{EnqueueOutcome, EnqueueRequest, JobQueue, JobStatus};
use vidscribe::state::{CompletedVideo, FileVideoRepository, RecordReset, VideoRepository, VideoStatus};
use vidscribe::transcription::{BatchSummary, SpeechToText, TranscriptionClient};
use vidscribe::worker::{AttemptOutcome, WorkerPool};

/// Writes a small placeholder file instead of downloading
struct FakeFetcher;

#[async_trait]
impl MediaFetcher for FakeFetcher {
    async fn fetch(&self, _source_url: &str, dest: &Path) -> Result<u64> {
        tokio::fs::write(dest, b"fake video bytes").await?;
        Ok(16)
    }
}

/// Pretends the source has `total_seconds` of audio and writes one small
/// file per planned chunk after `delay`
struct FakeSegmenter {
    total_seconds: f64,
    chunk: Duration,
    delay: Duration,
}

#[async_trait]
impl MediaSegmenter for FakeSegmenter {
    async fn segment(&self, _source: &Path, work_dir: &Path) -> Result<SegmentedAudio> {
        tokio::time::sleep(self.delay).await;
        tokio::fs::create_dir_all(work_dir).await?;
        let track_path = work_dir.join("audio.wav");
        tokio::fs::write(&track_path, b"track").await?;

        let mut chunks = Vec::new();
        for span in plan_chunks(self.total_seconds, self.chunk) {
            let path = work_dir.join(format!("chunk_{:04}.wav", span.index));
            tokio::fs::write(&path, format!("chunk-{}", span.index)).await?;
            chunks.push(AudioChunk {
                index: span.index,
                start_time: span.start_time,
                end_time: span.end_time,
                duration: span.duration(),
                path,
            });
        }

        Ok(SegmentedAudio {
            track_path,
            chunks,
            total_duration: self.total_seconds,
        })
    }
}

/// Speech backend that echoes the chunk marker, failing for selected chunks
struct FakeSpeech {
    failing_chunks: Vec<usize>,
    always_transient: bool,
    calls: AtomicUsize,
}

impl FakeSpeech {
    fn working() -> Self {
        Self {
            failing_chunks: Vec::new(),
            always_transient: false,
            calls: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl SpeechToText for FakeSpeech {
    async fn transcribe_bytes(&self, audio: Vec<u8>, language_code: &str) -> Result<String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.always_transient {
            return Err(PipelineError::Transient("503 Service Unavailable".to_string()));
        }

        let marker = String::from_utf8_lossy(&audio).to_string();
        let index: usize = marker.trim_start_matches("chunk-").parse().unwrap_or(usize::MAX);
        if self.failing_chunks.contains(&index) {
            return Err(PipelineError::Backend("400 unsupported audio".to_string()));
        }
        Ok(format!("spoken words of {} in {}", marker, language_code))
    }

    fn name(&self) -> &str {
        "fake-speech"
    }
}

struct FakeLLM;

#[async_trait]
impl LLM for FakeLLM {
    async fn chat(&self, _messages: Vec<ChatMessage>) -> Result<LLMResponse> {
        Ok(LLMResponse {
            content: "A short overview of the video.".to_string(),
            tokens_used: Some(12),
        })
    }

    fn provider_type(&self) -> LLMProvider {
        LLMProvider::Gemini
    }
}

struct FakeEmbedder {
    fail: bool,
}

#[async_trait]
impl Embedder for FakeEmbedder {
    async fn embed(&self, _text: &str) -> Result<Vec<f32>> {
        if self.fail {
            Err(PipelineError::Backend("embedding model unavailable".to_string()))
        } else {
            Ok(vec![0.1, 0.2, 0.3])
        }
    }
}

struct Harness {
    _data: TempDir,
    scratch: TempDir,
    config: Config,
    queue: Arc<JobQueue>,
    records: Arc<dyn VideoRepository>,
    notifier: Arc<Notifier>,
    pool: WorkerPool,
}

struct Fakes {
    total_seconds: f64,
    segment_delay: Duration,
    speech: Arc<FakeSpeech>,
    embedder_fails: bool,
}

impl Default for Fakes {
    fn default() -> Self {
        Self {
            total_seconds: 65.0,
            segment_delay: Duration::ZERO,
            speech: Arc::new(FakeSpeech::working()),
            embedder_fails: false,
        }
    }
}

async fn harness(builder: ConfigBuilder, fakes: Fakes) -> Harness {
    let data = TempDir::new().unwrap();
    let scratch = TempDir::new().unwrap();

    let mut config = builder
        .with_data_dir(data.path().to_path_buf())
        .with_temp_dir(scratch.path().to_path_buf())
        .with_chunk_duration(30)
        .with_chunk_concurrency(2)
        .with_job_backoff(0, 0)
        .with_transcription_retries(2, 0)
        .build();
    config.llm.retry_base_delay_ms = 0;
    config.audio.segment_backoff_ms = 0;

    let records: Arc<dyn VideoRepository> =
        Arc::new(FileVideoRepository::open(config.storage.videos_dir()).await.unwrap());
    let queue = Arc::new(
        JobQueue::open(config.storage.jobs_dir(), config.queue.clone())
            .await
            .unwrap()
            .with_run_listener(Arc::new(RecordReset::new(records.clone()))),
    );
    let notifier = Arc::new(Notifier::new(16));

    let services = PipelineServices {
        fetcher: Arc::new(FakeFetcher),
        segmenter: Arc::new(FakeSegmenter {
            total_seconds: fakes.total_seconds,
            chunk: config.audio.chunk_duration(),
            delay: fakes.segment_delay,
        }),
        transcriber: Arc::new(TranscriptionClient::new(fakes.speech.clone(), &config.transcription)),
        enricher: Arc::new(Enricher::new(
            Arc::new(FakeLLM),
            Some(Arc::new(FakeEmbedder {
                fail: fakes.embedder_fails,
            })),
            config.llm.clone(),
        )),
        records: records.clone(),
        notifier: notifier.clone(),
    };

    let pipeline = Arc::new(VideoPipeline::new(services, queue.clone(), &config));
    let pool = WorkerPool::new(pipeline, &config);

    Harness {
        _data: data,
        scratch,
        config,
        queue,
        records,
        notifier,
        pool,
    }
}

impl Harness {
    async fn submit(&self, video_id: &str) -> EnqueueOutcome {
        let request = EnqueueRequest::new(video_id, format!("https://example.com/{}.mp4", video_id), "english");
        submit_video(&self.queue, request, true)
            .await
            .unwrap()
    }

    /// Run one attempt in the background, like a worker loop would
    fn spawn_attempt(&self, worker_id: &'static str) -> tokio::task::JoinHandle<Option<AttemptOutcome>> {
        let pool = self.pool.clone();
        tokio::spawn(async move {
            pool.run_once(worker_id)
                .await
                .unwrap()
                .map(|report| report.outcome)
        })
    }

    async fn wait_until_processing(&self, video_id: &str) {
        for _ in 0..200 {
            if let Ok(Some(record)) = self.records.get(video_id).await {
                if record.status == VideoStatus::Processing {
                    return;
                }
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("{} never started processing", video_id);
    }

    fn leftover_workspaces(&self) -> usize {
        std::fs::read_dir(self.scratch.path())
            .map(|entries| {
                entries
                    .filter_map(|e| e.ok())
                    .filter(|e| e.file_name().to_string_lossy().starts_with("vidscribe-"))
                    .count()
            })
            .unwrap_or(0)
    }
}

#[tokio::test]
async fn test_happy_path_produces_timestamped_transcript() {
    let h = harness(ConfigBuilder::new(), Fakes::default()).await;
    let mut events = h.notifier.subscribe("v1").unwrap();

    assert_eq!(h.submit("v1").await, EnqueueOutcome::Enqueued);
    let report = h.pool.run_once("worker-test").await.unwrap().unwrap();
    assert_eq!(report.outcome, AttemptOutcome::Completed);
    assert_eq!(report.attempt, 1);

    let record = h.records.get("v1").await.unwrap().unwrap();
    assert_eq!(record.status, VideoStatus::Completed);

    let transcript = record.transcript.unwrap();
    let lines: Vec<&str> = transcript.split("\n\n").collect();
    assert_eq!(lines.len(), 3);
    assert!(lines[0].starts_with("[00:00] spoken words of chunk-0 in en"));
    assert!(lines[1].starts_with("[00:30] spoken words of chunk-1"));
    assert!(lines[2].starts_with("[01:00] spoken words of chunk-2"));

    assert_eq!(record.summary.as_deref(), Some("A short overview of the video."));
    assert_eq!(record.summary_source, Some(SummarySource::Generated));
    assert_eq!(record.embeddings, Some(vec![0.1, 0.2, 0.3]));
    assert_eq!(record.duration, Some(65.0));
    let chunks = record.chunks.unwrap();
    assert_eq!((chunks.total, chunks.successful, chunks.failed), (3, 3, 0));

    let job = h.queue.get("v1").await.unwrap();
    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.progress, 100);

    // progress is monotonic and the run ends with a completion event
    let mut last_progress = 0;
    let mut completed = false;
    while let Ok(event) = events.try_recv() {
        match event {
            JobEvent::Progress { progress, .. } => {
                assert!(progress >= last_progress);
                last_progress = progress;
            }
            JobEvent::Completed { transcript, .. } => {
                assert!(!transcript.is_empty());
                completed = true;
            }
            JobEvent::Failed { error, .. } => panic!("unexpected failure event: {}", error),
        }
    }
    assert_eq!(last_progress, 100);
    assert!(completed);

    assert_eq!(h.leftover_workspaces(), 0);
}

#[tokio::test]
async fn test_embedding_failure_still_completes() {
    let fakes = Fakes {
        embedder_fails: true,
        ..Fakes::default()
    };
    let h = harness(ConfigBuilder::new(), fakes).await;

    h.submit("v2").await;
    let report = h.pool.run_once("worker-test").await.unwrap().unwrap();
    assert_eq!(report.outcome, AttemptOutcome::Completed);

    let record = h.records.get("v2").await.unwrap().unwrap();
    assert_eq!(record.status, VideoStatus::Completed);
    assert!(record.summary.is_some());
    assert!(record.embeddings.is_none());
}

#[tokio::test]
async fn test_partial_chunk_failure_keeps_placeholders() {
    let fakes = Fakes {
        total_seconds: 150.0,
        speech: Arc::new(FakeSpeech {
            failing_chunks: vec![3],
            always_transient: false,
            calls: AtomicUsize::new(0),
        }),
        ..Fakes::default()
    };
    let h = harness(ConfigBuilder::new(), fakes).await;

    h.submit("v3").await;
    let report = h.pool.run_once("worker-test").await.unwrap().unwrap();
    assert_eq!(report.outcome, AttemptOutcome::Completed);

    let record = h.records.get("v3").await.unwrap().unwrap();
    let chunks = record.chunks.unwrap();
    assert_eq!(chunks.total, 5);
    assert_eq!(chunks.successful, 4);
    assert_eq!(chunks.failed, 1);
    assert_eq!(chunks.success_rate, 80);

    let transcript = record.transcript.unwrap();
    let lines: Vec<&str> = transcript.split("\n\n").collect();
    assert_eq!(lines.len(), 5);
    assert!(lines[3].starts_with("[01:30] [Transcription failed for 01:30-02:00:"));
    assert!(lines[4].contains("chunk-4"));
}

#[tokio::test]
async fn test_transient_failures_are_bounded_by_max_attempts() {
    let speech = Arc::new(FakeSpeech {
        failing_chunks: Vec::new(),
        always_transient: true,
        calls: AtomicUsize::new(0),
    });
    let fakes = Fakes {
        speech: speech.clone(),
        ..Fakes::default()
    };
    let h = harness(ConfigBuilder::new().with_max_attempts(3), fakes).await;

    h.submit("v4").await;

    let mut outcomes = Vec::new();
    while let Some(report) = h.pool.run_once("worker-test").await.unwrap() {
        outcomes.push(report.outcome);
        assert!(outcomes.len() <= 3, "job ran more often than max_attempts");
    }
    assert_eq!(
        outcomes,
        vec![AttemptOutcome::Retrying, AttemptOutcome::Retrying, AttemptOutcome::Failed]
    );

    // three attempts, three chunks each, two call-site tries per chunk
    assert_eq!(speech.calls.load(Ordering::SeqCst), 3 * 3 * 2);

    let job = h.queue.get("v4").await.unwrap();
    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(job.attempt, 3);

    let record = h.records.get("v4").await.unwrap().unwrap();
    assert_eq!(record.status, VideoStatus::Failed);
    let error = record.error.unwrap();
    assert!(error.starts_with("transcribing failed on attempt 3"));
    assert!(error.chars().count() <= 500);

    assert_eq!(h.leftover_workspaces(), 0);
}

#[tokio::test]
async fn test_stalled_attempt_is_recovered_by_another_worker() {
    let h = harness(ConfigBuilder::new().with_lock_duration(0), Fakes::default()).await;
    h.submit("v5").await;

    // a worker claims the job and dies right after marking the record
    let stalled = h.queue.claim("worker-dead").await.unwrap().unwrap();
    assert_eq!(stalled.attempt, 1);
    assert_ok!(h.records.begin_processing("v5", 1).await);

    assert_eq!(h.pool.reap_stalled().await.unwrap(), 1);
    let job = h.queue.get("v5").await.unwrap();
    assert_eq!(job.status, JobStatus::Queued);

    let report = h.pool.run_once("worker-alive").await.unwrap().unwrap();
    assert_eq!(report.attempt, 2);
    assert_eq!(report.outcome, AttemptOutcome::Completed);

    let record = h.records.get("v5").await.unwrap().unwrap();
    assert_eq!(record.status, VideoStatus::Completed);
    assert_eq!(record.processing_attempt, 2);

    // the dead worker's late settlement is rejected
    assert_err!(h.queue.complete("v5", "worker-dead", 1).await);
}

#[tokio::test]
async fn test_duplicate_enqueue_is_idempotent() {
    let h = harness(ConfigBuilder::new(), Fakes::default()).await;

    assert_eq!(h.submit("v6").await, EnqueueOutcome::Enqueued);
    assert_eq!(h.submit("v6").await, EnqueueOutcome::AlreadyPending);
    assert_eq!(h.queue.list().await.len(), 1);

    let report = h.pool.run_once("worker-test").await.unwrap().unwrap();
    assert_eq!(report.outcome, AttemptOutcome::Completed);
    assert!(h.pool.run_once("worker-test").await.unwrap().is_none());
}

#[tokio::test]
async fn test_resubmitted_completed_video_runs_again() {
    let fakes = Fakes::default();
    let speech = fakes.speech.clone();
    let h = harness(ConfigBuilder::new(), fakes).await;

    h.submit("v7").await;
    h.pool.run_once("worker-test").await.unwrap().unwrap();
    assert_eq!(speech.calls.load(Ordering::SeqCst), 3);

    // the record is reset before any worker can claim the new run
    assert_eq!(h.submit("v7").await, EnqueueOutcome::Enqueued);
    let record = h.records.get("v7").await.unwrap().unwrap();
    assert_eq!(record.status, VideoStatus::Queued);
    assert!(record.transcript.is_none());

    let report = h.pool.run_once("worker-test").await.unwrap().unwrap();
    assert_eq!(report.outcome, AttemptOutcome::Completed);
    assert_eq!(speech.calls.load(Ordering::SeqCst), 6);

    let record = h.records.get("v7").await.unwrap().unwrap();
    assert_eq!(record.status, VideoStatus::Completed);
    assert!(record.transcript.is_some());
    assert_eq!(h.queue.get("v7").await.unwrap().status, JobStatus::Completed);
    assert!(h.pool.run_once("worker-test").await.unwrap().is_none());
}

#[tokio::test]
async fn test_result_stored_before_crash_is_replayed() {
    let fakes = Fakes::default();
    let speech = fakes.speech.clone();
    let h = harness(ConfigBuilder::new().with_lock_duration(0), fakes).await;
    h.submit("v10").await;

    // a worker stores the result and dies before settling the job
    h.queue.claim("worker-dead").await.unwrap().unwrap();
    assert_ok!(h.records.begin_processing("v10", 1).await);
    let stored = CompletedVideo {
        transcript: "[00:00] stored words".to_string(),
        summary: Summary {
            text: "Stored summary.".to_string(),
            source: SummarySource::Generated,
        },
        embeddings: None,
        duration: 12.0,
        word_count: 2,
        chunks: BatchSummary::from_results(&[]),
    };
    assert_ok!(h.records.mark_completed("v10", 1, stored).await);
    assert_eq!(h.pool.reap_stalled().await.unwrap(), 1);

    let report = h.pool.run_once("worker-alive").await.unwrap().unwrap();
    assert_eq!(report.attempt, 2);
    assert_eq!(report.outcome, AttemptOutcome::AlreadyCompleted);
    assert_eq!(speech.calls.load(Ordering::SeqCst), 0);

    let record = h.records.get("v10").await.unwrap().unwrap();
    assert_eq!(record.transcript.as_deref(), Some("[00:00] stored words"));
    assert_eq!(h.queue.get("v10").await.unwrap().status, JobStatus::Completed);
}

#[tokio::test]
async fn test_video_in_flight_elsewhere_is_left_alone() {
    let fakes = Fakes::default();
    let speech = fakes.speech.clone();
    let h = harness(ConfigBuilder::new(), fakes).await;
    h.submit("v9").await;

    // another worker marked the video processing moments ago
    let before = h.records.begin_processing("v9", 1).await.unwrap();

    let report = h.pool.run_once("worker-test").await.unwrap().unwrap();
    assert_eq!(report.outcome, AttemptOutcome::Duplicate);
    assert_eq!(speech.calls.load(Ordering::SeqCst), 0);

    let record = h.records.get("v9").await.unwrap().unwrap();
    assert_eq!(record.status, VideoStatus::Processing);
    assert_eq!(record.processing_attempt, 1);
    assert_eq!(record.processing_started_at, before.processing_started_at);
    assert!(record.error.is_none());

    let job = h.queue.get("v9").await.unwrap();
    assert_eq!(job.status, JobStatus::Queued);
    assert!(job.lease.is_none());
    assert_eq!(h.leftover_workspaces(), 0);
}

#[tokio::test]
async fn test_heartbeat_keeps_long_attempt_leased() {
    let fakes = Fakes {
        segment_delay: Duration::from_secs(3),
        ..Fakes::default()
    };
    let h = harness(
        ConfigBuilder::new().with_lock_duration(2).with_heartbeat_interval(1),
        fakes,
    )
    .await;
    h.submit("v11").await;

    let attempt = h.spawn_attempt("worker-slow");
    let mut reclaimed = 0;
    while !attempt.is_finished() {
        reclaimed += h.pool.reap_stalled().await.unwrap();
        tokio::time::sleep(Duration::from_millis(250)).await;
    }

    assert_eq!(reclaimed, 0);
    assert_eq!(attempt.await.unwrap(), Some(AttemptOutcome::Completed));
    let record = h.records.get("v11").await.unwrap().unwrap();
    assert_eq!(record.status, VideoStatus::Completed);
    assert_eq!(record.processing_attempt, 1);
}

#[tokio::test]
async fn test_attempt_stops_once_its_lease_is_lost() {
    let fakes = Fakes {
        segment_delay: Duration::from_secs(3),
        ..Fakes::default()
    };
    let speech = fakes.speech.clone();
    let h = harness(
        ConfigBuilder::new().with_lock_duration(0).with_heartbeat_interval(1),
        fakes,
    )
    .await;
    h.submit("v12").await;

    let started = Instant::now();
    let attempt = h.spawn_attempt("worker-slow");
    h.wait_until_processing("v12").await;

    // the reaper hands the job back while the attempt is still segmenting
    assert_eq!(h.pool.reap_stalled().await.unwrap(), 1);

    let outcome = tokio::time::timeout(Duration::from_secs(5), attempt)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(outcome, Some(AttemptOutcome::LeaseLost));
    assert!(started.elapsed() < Duration::from_millis(2500));

    assert_eq!(speech.calls.load(Ordering::SeqCst), 0);
    assert_ne!(h.records.get("v12").await.unwrap().unwrap().status, VideoStatus::Completed);
    assert_eq!(h.queue.get("v12").await.unwrap().status, JobStatus::Queued);
    assert_eq!(h.leftover_workspaces(), 0);
}

#[tokio::test]
async fn test_invalid_submission_is_rejected() {
    let h = harness(ConfigBuilder::new(), Fakes::default()).await;

    let plain_http = EnqueueRequest::new("v8", "http://example.com/v8.mp4", "english");
    let err = submit_video(&h.queue, plain_http, true)
        .await
        .unwrap_err();
    assert!(matches!(err, PipelineError::Validation(_)));

    let bad_id = EnqueueRequest::new("../escape", "https://example.com/v.mp4", "english");
    assert_err!(submit_video(&h.queue, bad_id, true).await);

    assert!(h.queue.list().await.is_empty());
    assert_eq!(h.config.queue.max_attempts, 3);
}
