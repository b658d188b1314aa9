use super::{ChatMessage, Embedder, LLMConfig, LLMProvider, LLMResponse, LLM};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{PipelineError, Result};

const GEMINI_BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta";
const OPENAI_BASE_URL: &str = "https://api.openai.com/v1";

fn build_client(config: &LLMConfig) -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .timeout(config.timeout())
        .build()
        .map_err(|e| PipelineError::Backend(format!("failed to build HTTP client: {}", e)))
}

/// Gemini provider implementation
pub struct GeminiProvider {
    config: LLMConfig,
    client: reqwest::Client,
}

#[derive(Debug, Serialize)]
struct GeminiRequest {
    contents: Vec<GeminiContent>,
    #[serde(rename = "systemInstruction", skip_serializing_if = "Option::is_none")]
    system_instruction: Option<GeminiContent>,
    #[serde(rename = "generationConfig")]
    generation_config: GeminiGenerationConfig,
}

#[derive(Debug, Serialize, Deserialize)]
struct GeminiContent {
    #[serde(skip_serializing_if = "Option::is_none")]
    role: Option<String>,
    parts: Vec<GeminiPart>,
}

#[derive(Debug, Serialize, Deserialize)]
struct GeminiPart {
    text: String,
}

#[derive(Debug, Serialize)]
struct GeminiGenerationConfig {
    #[serde(rename = "maxOutputTokens")]
    max_output_tokens: u32,
    temperature: f32,
}

#[derive(Debug, Deserialize)]
struct GeminiResponse {
    #[serde(default)]
    candidates: Vec<GeminiCandidate>,
    #[serde(rename = "usageMetadata")]
    usage_metadata: Option<GeminiUsage>,
}

#[derive(Debug, Deserialize)]
struct GeminiCandidate {
    content: Option<GeminiContent>,
}

#[derive(Debug, Deserialize)]
struct GeminiUsage {
    #[serde(rename = "totalTokenCount")]
    total_token_count: u32,
}

#[derive(Debug, Serialize)]
struct GeminiEmbedRequest {
    content: GeminiContent,
}

#[derive(Debug, Deserialize)]
struct GeminiEmbedResponse {
    embedding: GeminiEmbedding,
}

#[derive(Debug, Deserialize)]
struct GeminiEmbedding {
    values: Vec<f32>,
}

impl GeminiProvider {
    pub fn new(config: LLMConfig) -> Result<Self> {
        if config.api_key.is_none() {
            return Err(PipelineError::Validation("Gemini API key required".to_string()));
        }

        let client = build_client(&config)?;
        Ok(Self { config, client })
    }

    fn base_url(&self) -> &str {
        self.config.endpoint.as_deref().unwrap_or(GEMINI_BASE_URL)
    }

    fn api_key(&self) -> &str {
        self.config.api_key.as_deref().unwrap_or_default()
    }

    async fn post<T: Serialize + ?Sized>(&self, url: &str, body: &T) -> Result<reqwest::Response> {
        let response = self
            .client
            .post(url)
            .header("x-goog-api-key", self.api_key())
            .json(body)
            .send()
            .await
            .map_err(|e| PipelineError::from_reqwest("Gemini", e))?;

        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            return Err(PipelineError::from_status("Gemini", status, &text));
        }

        Ok(response)
    }
}

#[async_trait]
impl LLM for GeminiProvider {
    async fn chat(&self, messages: Vec<ChatMessage>) -> Result<LLMResponse> {
        // Gemini takes system prompts separately and calls the assistant "model"
        let mut system_parts = Vec::new();
        let mut contents = Vec::new();
        for msg in messages {
            match msg.role.as_str() {
                "system" => system_parts.push(GeminiPart { text: msg.content }),
                "assistant" => contents.push(GeminiContent {
                    role: Some("model".to_string()),
                    parts: vec![GeminiPart { text: msg.content }],
                }),
                _ => contents.push(GeminiContent {
                    role: Some("user".to_string()),
                    parts: vec![GeminiPart { text: msg.content }],
                }),
            }
        }

        let request = GeminiRequest {
            contents,
            system_instruction: if system_parts.is_empty() {
                None
            } else {
                Some(GeminiContent {
                    role: None,
                    parts: system_parts,
                })
            },
            generation_config: GeminiGenerationConfig {
                max_output_tokens: self.config.max_tokens,
                temperature: self.config.temperature,
            },
        };

        let url = format!("{}/models/{}:generateContent", self.base_url(), self.config.model);

        debug!("Sending request to Gemini API ({})", self.config.model);

        let response = self.post(&url, &request).await?;
        let gemini_response: GeminiResponse = response
            .json()
            .await
            .map_err(|e| PipelineError::from_reqwest("Gemini", e))?;

        let content = gemini_response
            .candidates
            .first()
            .and_then(|c| c.content.as_ref())
            .and_then(|c| c.parts.first())
            .map(|p| p.text.clone())
            .ok_or_else(|| PipelineError::Backend("No response from Gemini".to_string()))?;

        let tokens_used = gemini_response
            .usage_metadata
            .map(|u| u.total_token_count);

        Ok(LLMResponse {
            content,
            tokens_used,
        })
    }

    fn provider_type(&self) -> LLMProvider {
        LLMProvider::Gemini
    }
}

#[async_trait]
impl Embedder for GeminiProvider {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let request = GeminiEmbedRequest {
            content: GeminiContent {
                role: None,
                parts: vec![GeminiPart {
                    text: text.to_string(),
                }],
            },
        };

        let url = format!(
            "{}/models/{}:embedContent",
            self.base_url(),
            self.config.embedding_model
        );

        let response = self.post(&url, &request).await?;
        let embed_response: GeminiEmbedResponse = response
            .json()
            .await
            .map_err(|e| PipelineError::from_reqwest("Gemini", e))?;

        Ok(embed_response.embedding.values)
    }
}

/// OpenAI-compatible provider implementation
pub struct OpenAIProvider {
    config: LLMConfig,
    client: reqwest::Client,
}

#[derive(Debug, Serialize)]
struct OpenAIRequest {
    model: String,
    messages: Vec<ChatMessage>,
    max_tokens: u32,
    temperature: f32,
}

#[derive(Debug, Deserialize)]
struct OpenAIResponse {
    choices: Vec<OpenAIChoice>,
    usage: Option<OpenAIUsage>,
}

#[derive(Debug, Deserialize)]
struct OpenAIChoice {
    message: ChatMessage,
}

#[derive(Debug, Deserialize)]
struct OpenAIUsage {
    total_tokens: u32,
}

#[derive(Debug, Serialize)]
struct OpenAIEmbedRequest<'a> {
    model: &'a str,
    input: &'a str,
}

#[derive(Debug, Deserialize)]
struct OpenAIEmbedResponse {
    data: Vec<OpenAIEmbedding>,
}

#[derive(Debug, Deserialize)]
struct OpenAIEmbedding {
    embedding: Vec<f32>,
}

impl OpenAIProvider {
    pub fn new(config: LLMConfig) -> Result<Self> {
        if config.api_key.is_none() && config.endpoint.is_none() {
            return Err(PipelineError::Validation("OpenAI API key required".to_string()));
        }

        let client = build_client(&config)?;
        Ok(Self { config, client })
    }

    fn base_url(&self) -> &str {
        self.config
            .endpoint
            .as_deref()
            .unwrap_or(OPENAI_BASE_URL)
            .trim_end_matches('/')
    }

    async fn post<T: Serialize + ?Sized>(&self, url: &str, body: &T) -> Result<reqwest::Response> {
        let mut request = self.client.post(url).json(body);
        if let Some(api_key) = &self.config.api_key {
            request = request.header("Authorization", format!("Bearer {}", api_key));
        }

        let response = request
            .send()
            .await
            .map_err(|e| PipelineError::from_reqwest("OpenAI", e))?;

        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            return Err(PipelineError::from_status("OpenAI", status, &text));
        }

        Ok(response)
    }
}

#[async_trait]
impl LLM for OpenAIProvider {
    async fn chat(&self, messages: Vec<ChatMessage>) -> Result<LLMResponse> {
        let request = OpenAIRequest {
            model: self.config.model.clone(),
            messages,
            max_tokens: self.config.max_tokens,
            temperature: self.config.temperature,
        };

        let url = format!("{}/chat/completions", self.base_url());

        debug!("Sending request to OpenAI API ({})", self.config.model);

        let response = self.post(&url, &request).await?;
        let openai_response: OpenAIResponse = response
            .json()
            .await
            .map_err(|e| PipelineError::from_reqwest("OpenAI", e))?;

        let content = openai_response
            .choices
            .first()
            .ok_or_else(|| PipelineError::Backend("No response from OpenAI".to_string()))?
            .message
            .content
            .clone();

        let tokens_used = openai_response.usage.map(|u| u.total_tokens);

        Ok(LLMResponse {
            content,
            tokens_used,
        })
    }

    fn provider_type(&self) -> LLMProvider {
        LLMProvider::OpenAI
    }
}

#[async_trait]
impl Embedder for OpenAIProvider {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let request = OpenAIEmbedRequest {
            model: &self.config.embedding_model,
            input: text,
        };

        let url = format!("{}/embeddings", self.base_url());
        let response = self.post(&url, &request).await?;
        let embed_response: OpenAIEmbedResponse = response
            .json()
            .await
            .map_err(|e| PipelineError::from_reqwest("OpenAI", e))?;

        embed_response
            .data
            .into_iter()
            .next()
            .map(|d| d.embedding)
            .ok_or_else(|| PipelineError::Backend("OpenAI returned no embedding".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gemini_requires_api_key() {
        let config = LLMConfig::default();
        assert!(GeminiProvider::new(config).is_err());

        let config = LLMConfig {
            api_key: Some("test".to_string()),
            ..LLMConfig::default()
        };
        let provider = GeminiProvider::new(config).unwrap();
        assert_eq!(provider.provider_type(), LLMProvider::Gemini);
        assert_eq!(provider.base_url(), GEMINI_BASE_URL);
    }

    #[test]
    fn test_gemini_request_shape() {
        let request = GeminiRequest {
            contents: vec![GeminiContent {
                role: Some("user".to_string()),
                parts: vec![GeminiPart {
                    text: "hello".to_string(),
                }],
            }],
            system_instruction: None,
            generation_config: GeminiGenerationConfig {
                max_output_tokens: 128,
                temperature: 0.2,
            },
        };

        let json = serde_json::to_value(&request).unwrap();
        assert_eq!(json["contents"][0]["parts"][0]["text"], "hello");
        assert_eq!(json["generationConfig"]["maxOutputTokens"], 128);
        assert!(json.get("systemInstruction").is_none());
    }

    #[test]
    fn test_openai_compatible_endpoint_override() {
        let config = LLMConfig {
            provider: LLMProvider::OpenAI,
            endpoint: Some("http://localhost:1234/v1/".to_string()),
            ..LLMConfig::default()
        };
        let provider = OpenAIProvider::new(config).unwrap();
        assert_eq!(provider.base_url(), "http://localhost:1234/v1");
    }
}
