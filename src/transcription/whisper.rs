use async_trait::async_trait;
use base64::Engine;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::SpeechToText;
use crate::config::TranscriptionConfig;
use crate::error::{PipelineError, Result};

const HF_INFERENCE_URL: &str = "https://api-inference.huggingface.co/models";
const OPENAI_TRANSCRIPTIONS_URL: &str = "https://api.openai.com/v1/audio/transcriptions";

fn build_client(config: &TranscriptionConfig) -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .timeout(std::time::Duration::from_secs(config.timeout))
        .build()
        .map_err(|e| PipelineError::Backend(format!("failed to build HTTP client: {}", e)))
}

/// Whisper hosted on the HuggingFace Inference API
pub struct HuggingFaceWhisper {
    client: reqwest::Client,
    url: String,
    api_key: Option<String>,
}

#[derive(Debug, Serialize)]
struct HfRequest<'a> {
    inputs: String,
    parameters: HfParameters<'a>,
}

#[derive(Debug, Serialize)]
struct HfParameters<'a> {
    generate_kwargs: HfGenerateKwargs<'a>,
}

#[derive(Debug, Serialize)]
struct HfGenerateKwargs<'a> {
    language: &'a str,
    task: &'a str,
}

#[derive(Debug, Deserialize)]
struct HfResponse {
    text: String,
}

impl HuggingFaceWhisper {
    pub fn new(config: &TranscriptionConfig) -> Result<Self> {
        if config.api_key.is_none() && config.api_endpoint.is_none() {
            return Err(PipelineError::Validation(
                "HuggingFace API key required".to_string(),
            ));
        }

        let url = match &config.api_endpoint {
            Some(endpoint) => endpoint.trim_end_matches('/').to_string(),
            None => format!("{}/{}", HF_INFERENCE_URL, config.model),
        };

        Ok(Self {
            client: build_client(config)?,
            url,
            api_key: config.api_key.clone(),
        })
    }

    fn request_body<'a>(audio: &[u8], language_code: &'a str) -> HfRequest<'a> {
        HfRequest {
            inputs: base64::engine::general_purpose::STANDARD.encode(audio),
            parameters: HfParameters {
                generate_kwargs: HfGenerateKwargs {
                    language: language_code,
                    task: "transcribe",
                },
            },
        }
    }
}

#[async_trait]
impl SpeechToText for HuggingFaceWhisper {
    async fn transcribe_bytes(&self, audio: Vec<u8>, language_code: &str) -> Result<String> {
        debug!("🤖 HuggingFace Whisper request: {} bytes ({})", audio.len(), language_code);

        let body = Self::request_body(&audio, language_code);
        let mut request = self.client.post(&self.url).json(&body);
        if let Some(api_key) = &self.api_key {
            request = request.header("Authorization", format!("Bearer {}", api_key));
        }

        let response = request
            .send()
            .await
            .map_err(|e| PipelineError::from_reqwest("HuggingFace", e))?;

        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            return Err(PipelineError::from_status("HuggingFace", status, &text));
        }

        let parsed: HfResponse = response
            .json()
            .await
            .map_err(|e| PipelineError::from_reqwest("HuggingFace", e))?;

        Ok(parsed.text.trim().to_string())
    }

    fn name(&self) -> &str {
        "huggingface-whisper"
    }
}

/// OpenAI-compatible `/audio/transcriptions` backend
pub struct OpenAIWhisper {
    client: reqwest::Client,
    url: String,
    api_key: Option<String>,
    model: String,
}

impl OpenAIWhisper {
    pub fn new(config: &TranscriptionConfig) -> Result<Self> {
        if config.api_key.is_none() && config.api_endpoint.is_none() {
            return Err(PipelineError::Validation("OpenAI API key required".to_string()));
        }

        let url = config
            .api_endpoint
            .as_deref()
            .unwrap_or(OPENAI_TRANSCRIPTIONS_URL)
            .to_string();

        // The HuggingFace model id is meaningless to OpenAI
        let model = if config.model.contains('/') {
            "whisper-1".to_string()
        } else {
            config.model.clone()
        };

        Ok(Self {
            client: build_client(config)?,
            url,
            api_key: config.api_key.clone(),
            model,
        })
    }
}

#[async_trait]
impl SpeechToText for OpenAIWhisper {
    async fn transcribe_bytes(&self, audio: Vec<u8>, language_code: &str) -> Result<String> {
        debug!("🤖 OpenAI Whisper request: {} bytes ({})", audio.len(), language_code);

        let part = reqwest::multipart::Part::bytes(audio)
            .file_name("audio.wav")
            .mime_str("audio/wav")
            .map_err(|e| PipelineError::Validation(format!("invalid audio part: {}", e)))?;

        let form = reqwest::multipart::Form::new()
            .part("file", part)
            .text("model", self.model.clone())
            .text("language", language_code.to_string())
            .text("response_format", "json");

        let mut request = self.client.post(&self.url).multipart(form);
        if let Some(api_key) = &self.api_key {
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

        let response_json: serde_json::Value = response
            .json()
            .await
            .map_err(|e| PipelineError::from_reqwest("OpenAI", e))?;

        Ok(response_json["text"].as_str().unwrap_or("").trim().to_string())
    }

    fn name(&self) -> &str {
        "openai-whisper"
    }
}
