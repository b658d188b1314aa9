use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use super::{ChatMessage, Embedder, LLMConfig, LLM};
use crate::error::{PipelineError, Result};
use crate::retry::{retry_with_backoff, RetryPolicy};
use crate::transcription::client::is_failure_placeholder;

const TRUNCATION_MARKER: &str = "\n\n[Transcript truncated]";

/// Where a summary came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SummarySource {
    /// Produced by the generative backend
    Generated,
    /// Computed locally after the backend failed
    Fallback,
}

/// Summary of a transcript
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Summary {
    pub text: String,
    pub source: SummarySource,
}

/// Summary, embedding and question answering over an assembled transcript
pub struct Enricher {
    llm: Arc<dyn LLM>,
    embedder: Option<Arc<dyn Embedder>>,
    config: LLMConfig,
    retry: RetryPolicy,
}

impl Enricher {
    pub fn new(llm: Arc<dyn LLM>, embedder: Option<Arc<dyn Embedder>>, config: LLMConfig) -> Self {
        let base = Duration::from_millis(config.retry_base_delay_ms);
        let retry = RetryPolicy::new(config.max_retries, base, base.saturating_mul(8));
        Self {
            llm,
            embedder,
            config,
            retry,
        }
    }

    /// Summarize a transcript. Never fails: a backend failure yields a
    /// deterministic local summary instead.
    pub async fn summarize(&self, transcript: &str, language: &str) -> Summary {
        if transcript.trim().is_empty() {
            return Summary {
                text: fallback_summary(transcript),
                source: SummarySource::Fallback,
            };
        }

        let input = truncate_for_model(transcript, self.config.max_input_chars);
        let messages = vec![
            ChatMessage::system(format!(
                "You summarize video transcripts. Write the summary in {}. \
                 Give a short overview paragraph followed by the key points as a bulleted list. \
                 Ignore the bracketed timestamps and any bracketed transcription failure notes.",
                language
            )),
            ChatMessage::user(format!("Summarize this video transcript:\n\n{}", input)),
        ];

        match self.chat_with_timeout("summary", messages).await {
            Ok(text) if !text.trim().is_empty() => {
                info!("📝 Summary generated ({} chars)", text.len());
                Summary {
                    text: text.trim().to_string(),
                    source: SummarySource::Generated,
                }
            }
            Ok(_) => {
                warn!("Summary backend returned empty text, using local summary");
                Summary {
                    text: fallback_summary(transcript),
                    source: SummarySource::Fallback,
                }
            }
            Err(e) => {
                warn!("Summary generation failed, using local summary: {}", e);
                Summary {
                    text: fallback_summary(transcript),
                    source: SummarySource::Fallback,
                }
            }
        }
    }

    /// Embed text. Failure is logged and yields `None`.
    pub async fn embed(&self, text: &str) -> Option<Vec<f32>> {
        let embedder = self.embedder.as_ref()?;
        let input = truncate_for_model(text, self.config.embedding_max_chars);
        let timeout = self.config.timeout();

        let result = retry_with_backoff("embedding", &self.retry, |_| {
            let input = input.clone();
            async move {
                match tokio::time::timeout(timeout, embedder.embed(&input)).await {
                    Ok(result) => result,
                    Err(_) => Err(PipelineError::Timeout(timeout, "embedding request".to_string())),
                }
            }
        })
        .await;

        match result {
            Ok(values) if !values.is_empty() => {
                debug!("Embedding generated with {} dimensions", values.len());
                Some(values)
            }
            Ok(_) => {
                warn!("Embedding backend returned an empty vector");
                None
            }
            Err(e) => {
                warn!("Embedding generation failed, continuing without it: {}", e);
                None
            }
        }
    }

    /// Answer a natural-language question about a transcript
    pub async fn answer_question(&self, transcript: &str, question: &str) -> Result<String> {
        let question = question.trim();
        if question.is_empty() {
            return Err(PipelineError::Validation("question must not be empty".to_string()));
        }
        if transcript.trim().is_empty() {
            return Err(PipelineError::Validation(
                "video has no transcript to answer from".to_string(),
            ));
        }

        let input = truncate_for_model(transcript, self.config.max_input_chars);
        let messages = vec![
            ChatMessage::system(
                "You answer questions about a video using only its transcript. \
                 Cite the bracketed timestamps that support your answer. \
                 If the transcript does not contain the answer, say so.",
            ),
            ChatMessage::user(format!("Transcript:\n{}\n\nQuestion: {}", input, question)),
        ];

        let answer = self.chat_with_timeout("question", messages).await?;
        Ok(answer.trim().to_string())
    }

    async fn chat_with_timeout(&self, label: &str, messages: Vec<ChatMessage>) -> Result<String> {
        let timeout = self.config.timeout();
        let llm = &self.llm;

        let response = retry_with_backoff(label, &self.retry, |_| {
            let messages = messages.clone();
            async move {
                match tokio::time::timeout(timeout, llm.chat(messages)).await {
                    Ok(result) => result,
                    Err(_) => Err(PipelineError::Timeout(timeout, format!("{} request", label))),
                }
            }
        })
        .await?;

        debug!("LLM {} completed (tokens: {:?})", label, response.tokens_used);
        Ok(response.content)
    }
}

/// Cut text to at most `max_chars` characters, marking the cut
pub fn truncate_for_model(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((byte_idx, _)) => format!("{}{}", &text[..byte_idx], TRUNCATION_MARKER),
        None => text.to_string(),
    }
}

/// Deterministic summary computed from the transcript alone
pub fn fallback_summary(transcript: &str) -> String {
    let spoken: String = transcript
        .lines()
        .map(strip_timestamp)
        .filter(|line| !line.is_empty() && !is_failure_placeholder(line))
        .collect::<Vec<_>>()
        .join(" ");

    let words = spoken.split_whitespace().count();
    if words == 0 {
        return "No speech was detected in this video.".to_string();
    }

    let sentences = spoken
        .split(|c| c == '.' || c == '!' || c == '?')
        .filter(|s| !s.trim().is_empty())
        .count()
        .max(1);

    format!(
        "Automatic summary unavailable. The transcript contains {} words in {} sentences.",
        words, sentences
    )
}

fn strip_timestamp(line: &str) -> &str {
    let line = line.trim();
    if line.starts_with('[') {
        if let Some(end) = line.find(']') {
            return line[end + 1..].trim();
        }
    }
    line
}
