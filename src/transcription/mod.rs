pub mod client;
pub mod languages;
pub mod transcript;
pub mod whisper;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::config::{SpeechProvider, TranscriptionConfig};
use crate::error::Result;

pub use client::TranscriptionClient;
pub use languages::LanguageMap;
pub use transcript::{assemble, format_timestamp, Transcript};

/// Result of transcribing one audio chunk
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ChunkTranscription {
    pub index: usize,
    pub start_time: f64,
    pub end_time: f64,
    /// Recognized text, or a placeholder naming the time range when `error` is set
    pub text: String,
    pub error: bool,
    pub error_message: Option<String>,
}

/// Outcome counts of one fan-out batch
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BatchSummary {
    pub total: usize,
    pub successful: usize,
    pub failed: usize,
    /// Whole percent of successful chunks
    pub success_rate: u32,
}

impl BatchSummary {
    pub fn from_results(results: &[ChunkTranscription]) -> Self {
        let total = results.len();
        let failed = results.iter().filter(|r| r.error).count();
        let successful = total - failed;
        let success_rate = if total == 0 {
            0
        } else {
            ((successful as f64 / total as f64) * 100.0).round() as u32
        };

        Self {
            total,
            successful,
            failed,
            success_rate,
        }
    }

    pub fn all_failed(&self) -> bool {
        self.total > 0 && self.successful == 0
    }
}

/// Speech-to-text backend
#[async_trait]
pub trait SpeechToText: Send + Sync {
    /// Transcribe one WAV payload. `language_code` is the backend code, e.g. `en`.
    async fn transcribe_bytes(&self, audio: Vec<u8>, language_code: &str) -> Result<String>;

    fn name(&self) -> &str;
}

/// Create the speech backend selected by configuration
pub fn create_backend(config: &TranscriptionConfig) -> Result<Arc<dyn SpeechToText>> {
    match config.provider {
        SpeechProvider::HuggingFace => Ok(Arc::new(whisper::HuggingFaceWhisper::new(config)?)),
        SpeechProvider::OpenAI => Ok(Arc::new(whisper::OpenAIWhisper::new(config)?)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn result(index: usize, error: bool) -> ChunkTranscription {
        ChunkTranscription {
            index,
            start_time: index as f64 * 30.0,
            end_time: (index + 1) as f64 * 30.0,
            text: if error { "[failed]".to_string() } else { "text".to_string() },
            error,
            error_message: None,
        }
    }

    #[test]
    fn test_batch_summary_counts() {
        let results: Vec<_> = (0..5).map(|i| result(i, i == 2)).collect();
        let summary = BatchSummary::from_results(&results);
        assert_eq!(summary.total, 5);
        assert_eq!(summary.successful, 4);
        assert_eq!(summary.failed, 1);
        assert_eq!(summary.success_rate, 80);
        assert!(!summary.all_failed());
    }

    #[test]
    fn test_batch_summary_empty_and_all_failed() {
        let empty = BatchSummary::from_results(&[]);
        assert_eq!(empty.success_rate, 0);
        assert!(!empty.all_failed());

        let failed: Vec<_> = (0..3).map(|i| result(i, true)).collect();
        assert!(BatchSummary::from_results(&failed).all_failed());
    }

    #[test]
    fn test_serialized_field_names() {
        let summary = BatchSummary::from_results(&[result(0, false)]);
        let json = serde_json::to_value(summary).unwrap();
        assert_eq!(json["successRate"], 100);
    }
}
