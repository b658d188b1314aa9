use futures::stream::{self, StreamExt};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use super::transcript::format_clock;
use super::{BatchSummary, ChunkTranscription, LanguageMap, SpeechToText};
use crate::audio::AudioChunk;
use crate::config::TranscriptionConfig;
use crate::error::{truncate, PipelineError, Result};
use crate::retry::{retry_with_backoff, RetryPolicy};

/// Called with `(completed, total)` after each chunk finishes
pub type ChunkProgress<'a> = &'a (dyn Fn(usize, usize) + Send + Sync);

/// Transcribes audio chunks through a speech backend with validation,
/// retries and bounded fan-out
pub struct TranscriptionClient {
    backend: Arc<dyn SpeechToText>,
    languages: LanguageMap,
    retry: RetryPolicy,
    timeout: Duration,
    max_chunk_bytes: u64,
    chunk_concurrency: usize,
}

impl TranscriptionClient {
    pub fn new(backend: Arc<dyn SpeechToText>, config: &TranscriptionConfig) -> Self {
        Self {
            backend,
            languages: LanguageMap::new(&config.default_language, &config.extra_languages),
            retry: RetryPolicy::new(
                config.max_retries,
                Duration::from_millis(config.retry_base_delay_ms),
                Duration::from_millis(config.retry_max_delay_ms),
            ),
            timeout: Duration::from_secs(config.timeout),
            max_chunk_bytes: config.max_chunk_bytes,
            chunk_concurrency: config.chunk_concurrency.max(1),
        }
    }

    pub fn languages(&self) -> &LanguageMap {
        &self.languages
    }

    /// Transcribe one chunk file. `language` may be a name or a code.
    pub async fn transcribe(&self, audio_path: &Path, language: &str) -> Result<String> {
        let audio = self.read_chunk(audio_path).await?;
        let code = self.languages.resolve(language);
        let backend = &self.backend;
        let timeout = self.timeout;

        retry_with_backoff("transcription", &self.retry, |attempt| {
            let audio = audio.clone();
            let code = code.as_str();
            async move {
                debug!(
                    "Transcribing {} with {} (attempt {})",
                    audio_path.display(),
                    backend.name(),
                    attempt
                );
                match tokio::time::timeout(timeout, backend.transcribe_bytes(audio, code)).await {
                    Ok(result) => result,
                    Err(_) => Err(PipelineError::Timeout(timeout, "transcription request".to_string())),
                }
            }
        })
        .await
    }

    /// Transcribe every chunk with bounded concurrency. A failed chunk is kept
    /// at its index as a placeholder. Each chunk file is removed once consumed.
    pub async fn transcribe_chunks(
        &self,
        chunks: &[AudioChunk],
        language: &str,
        progress: Option<ChunkProgress<'_>>,
    ) -> (Vec<ChunkTranscription>, BatchSummary) {
        let total = chunks.len();
        let completed = AtomicUsize::new(0);

        info!(
            "🎙️ Transcribing {} chunks with {} (concurrency {})",
            total,
            self.backend.name(),
            self.chunk_concurrency
        );

        let mut results: Vec<ChunkTranscription> = stream::iter((0..chunks.len()).map(|i| {
            let chunk = &chunks[i];
            let completed = &completed;
            async move {
                let result = self.transcribe_one(chunk, language).await;
                let done = completed.fetch_add(1, Ordering::SeqCst) + 1;
                if let Some(report) = progress {
                    report(done, total);
                }
                result
            }
        }))
        .buffer_unordered(self.chunk_concurrency)
        .collect()
        .await;

        results.sort_by_key(|r| r.index);
        let summary = BatchSummary::from_results(&results);

        info!(
            "✅ Transcription batch done: {}/{} chunks succeeded ({}%)",
            summary.successful, summary.total, summary.success_rate
        );

        (results, summary)
    }

    async fn transcribe_one(&self, chunk: &AudioChunk, language: &str) -> ChunkTranscription {
        let outcome = self.transcribe(&chunk.path, language).await;

        if let Err(e) = tokio::fs::remove_file(&chunk.path).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!("Failed to remove chunk file {}: {}", chunk.path.display(), e);
            }
        }

        match outcome {
            Ok(text) => {
                debug!("Chunk {} transcribed ({} chars)", chunk.index, text.len());
                ChunkTranscription {
                    index: chunk.index,
                    start_time: chunk.start_time,
                    end_time: chunk.end_time,
                    text,
                    error: false,
                    error_message: None,
                }
            }
            Err(e) => {
                let reason = truncate(&e.to_string(), 200);
                warn!("❌ Chunk {} failed: {}", chunk.index, reason);
                ChunkTranscription {
                    index: chunk.index,
                    start_time: chunk.start_time,
                    end_time: chunk.end_time,
                    text: failure_placeholder(chunk.start_time, chunk.end_time, &reason),
                    error: true,
                    error_message: Some(reason),
                }
            }
        }
    }

    /// Check the chunk locally before anything is sent upstream
    async fn read_chunk(&self, path: &Path) -> Result<Vec<u8>> {
        let metadata = match tokio::fs::metadata(path).await {
            Ok(metadata) => metadata,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(PipelineError::Validation(format!(
                    "audio chunk not found: {}",
                    path.display()
                )))
            }
            Err(e) => return Err(e.into()),
        };

        if !metadata.is_file() || metadata.len() == 0 {
            return Err(PipelineError::Validation(format!(
                "audio chunk is empty: {}",
                path.display()
            )));
        }

        if metadata.len() > self.max_chunk_bytes {
            return Err(PipelineError::Validation(format!(
                "audio chunk {} is {} bytes, limit is {}",
                path.display(),
                metadata.len(),
                self.max_chunk_bytes
            )));
        }

        Ok(tokio::fs::read(path).await?)
    }
}

const FAILURE_PREFIX: &str = "[Transcription failed for ";

/// Inline marker for a chunk whose transcription failed
pub fn failure_placeholder(start: f64, end: f64, reason: &str) -> String {
    format!(
        "{}{}-{}: {}]",
        FAILURE_PREFIX,
        format_clock(start),
        format_clock(end),
        reason
    )
}

/// True when `text` is a marker written by `failure_placeholder`
pub fn is_failure_placeholder(text: &str) -> bool {
    text.trim_start().starts_with(FAILURE_PREFIX)
}
