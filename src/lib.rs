/// vidscribe - durable video transcription and summarization pipeline
///
/// Source videos are downloaded, split into fixed-length audio chunks,
/// transcribed by a remote speech backend, assembled into a timestamped
/// transcript and enriched with a summary and an optional embedding. Jobs run
/// on a file-backed queue with leases, heartbeats and bounded retries.

pub mod audio;
pub mod config;
pub mod documents;
pub mod download;
pub mod error;
pub mod llm;
pub mod notify;
pub mod processing;
pub mod queue;
pub mod retry;
pub mod state;
pub mod transcription;
pub mod worker;
pub mod workspace;

#[cfg(feature = "api")]
pub mod api;

// Re-export main types for easy access
pub use crate::audio::{plan_chunks, AudioChunk, AudioExtractor, MediaSegmenter, SegmentedAudio};
pub use crate::config::{Config, ConfigBuilder};
pub use crate::download::{HttpFetcher, MediaFetcher};
pub use crate::error::{PipelineError, Result};
pub use crate::llm::{Embedder, Enricher, LLMConfig, LLMProvider, Summary, SummarySource, LLM};
pub use crate::notify::{JobEvent, Notifier};
pub use crate::processing::{ask_video, submit_video, JobError, PipelineServices, ProcessOutcome, VideoPipeline};
pub use crate::queue::{EnqueueOutcome, EnqueuePolicy, EnqueueRequest, Job, JobPhase, JobQueue, JobStatus, RunListener};
pub use crate::state::{FileVideoRepository, RecordReset, VideoRecord, VideoRepository, VideoStatus};
pub use crate::transcription::{BatchSummary, ChunkTranscription, SpeechToText, TranscriptionClient};
pub use crate::worker::{AttemptOutcome, AttemptReport, WorkerPool};
