pub mod providers;
pub mod enrichment;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

use crate::error::Result;

pub use enrichment::{Enricher, Summary, SummarySource};

/// LLM provider types
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum LLMProvider {
    Gemini,
    OpenAI,
}

/// LLM configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LLMConfig {
    /// Provider to use for summaries, answers and embeddings
    pub provider: LLMProvider,

    /// Override for the API base URL
    pub endpoint: Option<String>,

    /// API key for the provider
    pub api_key: Option<String>,

    /// Model to use for text generation
    pub model: String,

    /// Model to use for embeddings
    pub embedding_model: String,

    /// Maximum tokens to generate
    pub max_tokens: u32,

    /// Temperature for generation
    pub temperature: f32,

    /// Request timeout in seconds
    pub timeout_seconds: u64,

    /// Attempts per request for transient failures
    pub max_retries: u32,

    /// Delay before the second attempt in milliseconds
    pub retry_base_delay_ms: u64,

    /// Transcript characters sent to the model before truncation
    pub max_input_chars: usize,

    /// Generate embeddings for completed videos
    pub enable_embeddings: bool,

    /// Characters sent to the embedding model
    pub embedding_max_chars: usize,
}

impl Default for LLMConfig {
    fn default() -> Self {
        Self {
            provider: LLMProvider::Gemini,
            endpoint: None,
            api_key: None,
            model: "gemini-1.5-flash".to_string(),
            embedding_model: "text-embedding-004".to_string(),
            max_tokens: 1024,
            temperature: 0.3,
            timeout_seconds: 60,
            max_retries: 2,
            retry_base_delay_ms: 1000,
            max_input_chars: 30_000,
            enable_embeddings: true,
            embedding_max_chars: 8_000,
        }
    }
}

impl LLMConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds)
    }
}

/// Chat message for LLM communication
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".to_string(),
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: content.into(),
        }
    }
}

/// LLM response
#[derive(Debug, Clone)]
pub struct LLMResponse {
    pub content: String,
    pub tokens_used: Option<u32>,
}

/// Trait for text generation backends
#[async_trait]
pub trait LLM: Send + Sync {
    async fn chat(&self, messages: Vec<ChatMessage>) -> Result<LLMResponse>;
    fn provider_type(&self) -> LLMProvider;
}

/// Trait for embedding backends
#[async_trait]
pub trait Embedder: Send + Sync {
    async fn embed(&self, text: &str) -> Result<Vec<f32>>;
}

/// Create LLM instance based on configuration
pub fn create_llm(config: &LLMConfig) -> Result<Arc<dyn LLM>> {
    match config.provider {
        LLMProvider::Gemini => Ok(Arc::new(providers::GeminiProvider::new(config.clone())?)),
        LLMProvider::OpenAI => Ok(Arc::new(providers::OpenAIProvider::new(config.clone())?)),
    }
}

/// Create embedding backend based on configuration, `None` when disabled
pub fn create_embedder(config: &LLMConfig) -> Result<Option<Arc<dyn Embedder>>> {
    if !config.enable_embeddings {
        return Ok(None);
    }

    match config.provider {
        LLMProvider::Gemini => Ok(Some(Arc::new(providers::GeminiProvider::new(config.clone())?))),
        LLMProvider::OpenAI => Ok(Some(Arc::new(providers::OpenAIProvider::new(config.clone())?))),
    }
}
