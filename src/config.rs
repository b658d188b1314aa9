use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::llm::LLMConfig;
use crate::queue::EnqueuePolicy;

/// Shortest chunk the segmenter will produce
pub const MIN_CHUNK_SECONDS: u32 = 10;
/// Longest chunk the segmenter will produce
pub const MAX_CHUNK_SECONDS: u32 = 300;
/// Hard ceiling for one audio chunk sent to a speech backend
pub const MAX_CHUNK_BYTES: u64 = 25 * 1024 * 1024;

/// Configuration for the video processing pipeline
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Job queue and worker settings
    pub queue: QueueConfig,

    /// Where jobs, records and temporary workspaces live
    pub storage: StorageConfig,

    /// Source media download settings
    pub download: DownloadConfig,

    /// Audio extraction and chunking settings
    pub audio: AudioConfig,

    /// Speech-to-text backend settings
    pub transcription: TranscriptionConfig,

    /// Summary and embedding backend settings
    pub llm: LLMConfig,

    /// Live notification settings
    pub notifications: NotificationConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Attempts per job before it is permanently failed
    pub max_attempts: u32,

    /// Jobs processed concurrently by one worker process
    pub worker_concurrency: usize,

    /// Lease length; an active job without a heartbeat for this long is stalled
    pub lock_duration_secs: u64,

    /// How often an active attempt renews its lease
    pub heartbeat_interval_secs: u64,

    /// How often the reaper looks for stalled jobs
    pub stall_check_interval_secs: u64,

    /// Delay before the second attempt of a failed job, doubled per attempt
    pub backoff_base_secs: u64,

    /// Upper bound for the delay between attempts
    pub backoff_max_secs: u64,

    /// A record marked processing more recently than this is treated as in flight
    pub duplicate_window_secs: u64,

    /// What a second enqueue for a pending video does
    pub enqueue_policy: EnqueuePolicy,

    /// Idle worker poll interval in milliseconds
    pub poll_interval_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Base directory for job and video documents
    pub data_dir: PathBuf,

    /// Root for per-attempt workspaces (system temp dir when unset)
    pub temp_dir: Option<PathBuf>,

    /// Workspaces older than this are considered orphaned at start-up
    pub orphan_max_age_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DownloadConfig {
    /// Total transfer timeout in seconds
    pub timeout_secs: u64,

    /// Connection timeout in seconds
    pub connect_timeout_secs: u64,

    /// Largest accepted source in bytes
    pub max_bytes: u64,

    /// Reject plain http sources
    pub require_https: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AudioConfig {
    /// ffmpeg executable
    pub ffmpeg_path: String,

    /// ffprobe executable
    pub ffprobe_path: String,

    /// Target sample rate for transcription
    pub target_sample_rate: u32,

    /// Target channel count
    pub channels: u32,

    /// Chunk duration in seconds, clamped to 10-300
    pub chunk_duration: u32,

    /// Pause between chunk extractions in milliseconds
    pub inter_chunk_pause_ms: u64,

    /// Timeout for one transcoder invocation in seconds
    pub transcode_timeout_secs: u64,

    /// Full segmentation attempts before giving up
    pub segment_attempts: u32,

    /// Delay before the second segmentation attempt in milliseconds
    pub segment_backoff_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum SpeechProvider {
    HuggingFace,
    OpenAI,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TranscriptionConfig {
    /// Speech-to-text backend
    pub provider: SpeechProvider,

    /// Override for the backend endpoint
    pub api_endpoint: Option<String>,

    /// API key for the backend
    pub api_key: Option<String>,

    /// Model to use for transcription
    pub model: String,

    /// Attempts per chunk for transient failures
    pub max_retries: u32,

    /// Delay before the second attempt in milliseconds
    pub retry_base_delay_ms: u64,

    /// Upper bound for a single retry delay in milliseconds
    pub retry_max_delay_ms: u64,

    /// Timeout for one transcription request in seconds
    pub timeout: u64,

    /// Largest chunk accepted for upload in bytes
    pub max_chunk_bytes: u64,

    /// Chunks transcribed concurrently within one job
    pub chunk_concurrency: usize,

    /// Language code used when a language name is unknown
    pub default_language: String,

    /// Extra language name to code mappings
    pub extra_languages: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NotificationConfig {
    /// Buffered events per room before slow subscribers start lagging
    pub channel_capacity: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            worker_concurrency: 1,
            lock_duration_secs: 300,
            heartbeat_interval_secs: 30,
            stall_check_interval_secs: 30,
            backoff_base_secs: 5,
            backoff_max_secs: 300,
            duplicate_window_secs: 30 * 60,
            enqueue_policy: EnqueuePolicy::Ignore,
            poll_interval_ms: 1000,
        }
    }
}

impl QueueConfig {
    pub fn lock_duration(&self) -> Duration {
        Duration::from_secs(self.lock_duration_secs)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs.max(1))
    }

    pub fn stall_check_interval(&self) -> Duration {
        Duration::from_secs(self.stall_check_interval_secs.max(1))
    }

    pub fn duplicate_window(&self) -> Duration {
        Duration::from_secs(self.duplicate_window_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(10))
    }

    /// Delay before re-attempting a job whose `attempt` just failed
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        let secs = self.backoff_base_secs.saturating_mul(2_u64.pow(exponent));
        Duration::from_secs(secs.min(self.backoff_max_secs))
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data"),
            temp_dir: None,
            orphan_max_age_secs: 6 * 3600,
        }
    }
}

impl StorageConfig {
    pub fn jobs_dir(&self) -> PathBuf {
        self.data_dir.join("jobs")
    }

    pub fn videos_dir(&self) -> PathBuf {
        self.data_dir.join("videos")
    }

    pub fn workspace_root(&self) -> PathBuf {
        self.temp_dir.clone().unwrap_or_else(std::env::temp_dir)
    }
}

impl Default for DownloadConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 10 * 60,
            connect_timeout_secs: 30,
            max_bytes: 2 * 1024 * 1024 * 1024,
            require_https: true,
        }
    }
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            ffmpeg_path: "ffmpeg".to_string(),
            ffprobe_path: "ffprobe".to_string(),
            target_sample_rate: 16000, // Optimal for Whisper
            channels: 1,
            chunk_duration: 30,
            inter_chunk_pause_ms: 200,
            transcode_timeout_secs: 10 * 60,
            segment_attempts: 3,
            segment_backoff_ms: 2000,
        }
    }
}

impl AudioConfig {
    /// Chunk duration clamped to the supported range
    pub fn chunk_duration(&self) -> Duration {
        Duration::from_secs(
            self.chunk_duration
                .clamp(MIN_CHUNK_SECONDS, MAX_CHUNK_SECONDS) as u64,
        )
    }

    pub fn transcode_timeout(&self) -> Duration {
        Duration::from_secs(self.transcode_timeout_secs)
    }
}

impl Default for TranscriptionConfig {
    fn default() -> Self {
        Self {
            provider: SpeechProvider::HuggingFace,
            api_endpoint: None,
            api_key: None,
            model: "openai/whisper-large-v3".to_string(),
            max_retries: 3,
            retry_base_delay_ms: 1000,
            retry_max_delay_ms: 30_000,
            timeout: 120,
            max_chunk_bytes: MAX_CHUNK_BYTES,
            chunk_concurrency: 1,
            default_language: "en".to_string(),
            extra_languages: BTreeMap::new(),
        }
    }
}

impl Default for NotificationConfig {
    fn default() -> Self {
        Self {
            channel_capacity: 64,
        }
    }
}

impl Config {
    /// Load configuration from the first config file found, then apply
    /// environment overrides
    pub fn load() -> Result<Self> {
        let config_paths = [
            "vidscribe.toml",
            "config/vidscribe.toml",
            "/etc/vidscribe/config.toml",
        ];

        for path in &config_paths {
            if Path::new(path).exists() {
                return Self::from_file(Path::new(path));
            }
        }

        tracing::info!("📄 No configuration file found, using defaults");
        let mut config = Self::default();
        config.apply_env_overrides();
        Ok(config)
    }

    /// Load configuration from a specific file, then apply environment overrides
    pub fn from_file(path: &Path) -> Result<Self> {
        let config_str = std::fs::read_to_string(path)
            .map_err(|e| anyhow!("Failed to read config file {}: {}", path.display(), e))?;
        let mut config: Config = toml::from_str(&config_str)
            .map_err(|e| anyhow!("Failed to parse config file {}: {}", path.display(), e))?;
        tracing::info!("📄 Loaded configuration from: {}", path.display());
        config.apply_env_overrides();
        Ok(config)
    }

    /// Override settings with environment variables
    pub fn apply_env_overrides(&mut self) {
        if let Ok(dir) = std::env::var("VIDSCRIBE_DATA_DIR") {
            self.storage.data_dir = PathBuf::from(dir);
        }

        if let Ok(dir) = std::env::var("VIDSCRIBE_TEMP_DIR") {
            self.storage.temp_dir = Some(PathBuf::from(dir));
        }

        if let Ok(workers) = std::env::var("VIDSCRIBE_WORKERS") {
            self.queue.worker_concurrency = workers.parse().unwrap_or(self.queue.worker_concurrency);
        }

        if let Ok(attempts) = std::env::var("VIDSCRIBE_MAX_ATTEMPTS") {
            self.queue.max_attempts = attempts.parse().unwrap_or(self.queue.max_attempts);
        }

        if let Ok(seconds) = std::env::var("VIDSCRIBE_CHUNK_DURATION") {
            self.audio.chunk_duration = seconds.parse().unwrap_or(self.audio.chunk_duration);
        }

        let speech_key = match self.transcription.provider {
            SpeechProvider::HuggingFace => "HF_API_KEY",
            SpeechProvider::OpenAI => "OPENAI_API_KEY",
        };
        if let Ok(api_key) = std::env::var("VIDSCRIBE_STT_API_KEY").or_else(|_| std::env::var(speech_key)) {
            self.transcription.api_key = Some(api_key);
        }

        let llm_key = match self.llm.provider {
            crate::llm::LLMProvider::Gemini => "GEMINI_API_KEY",
            crate::llm::LLMProvider::OpenAI => "OPENAI_API_KEY",
        };
        if let Ok(api_key) = std::env::var("VIDSCRIBE_LLM_API_KEY").or_else(|_| std::env::var(llm_key)) {
            self.llm.api_key = Some(api_key);
        }
    }

    /// Save configuration to file
    pub fn save(&self, path: &Path) -> Result<()> {
        let config_str = toml::to_string_pretty(self)?;
        std::fs::write(path, config_str)?;
        tracing::info!("💾 Configuration saved to: {}", path.display());
        Ok(())
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.queue.max_attempts == 0 {
            return Err(anyhow!("queue.max_attempts must be greater than 0"));
        }

        if self.queue.worker_concurrency == 0 {
            return Err(anyhow!("queue.worker_concurrency must be greater than 0"));
        }

        if self.queue.heartbeat_interval_secs >= self.queue.lock_duration_secs {
            return Err(anyhow!(
                "queue.heartbeat_interval_secs must be shorter than queue.lock_duration_secs"
            ));
        }

        if self.audio.target_sample_rate == 0 {
            return Err(anyhow!("audio.target_sample_rate must be greater than 0"));
        }

        if self.transcription.chunk_concurrency == 0 {
            return Err(anyhow!("transcription.chunk_concurrency must be greater than 0"));
        }

        if self.transcription.max_chunk_bytes == 0 || self.transcription.max_chunk_bytes > MAX_CHUNK_BYTES {
            return Err(anyhow!(
                "transcription.max_chunk_bytes must be between 1 and {}",
                MAX_CHUNK_BYTES
            ));
        }

        if self.transcription.api_key.is_none() && self.transcription.api_endpoint.is_none() {
            return Err(anyhow!("API key required for the speech-to-text backend"));
        }

        if self.llm.api_key.is_none() && self.llm.endpoint.is_none() {
            return Err(anyhow!("API key required for the LLM backend"));
        }

        let clamped = self.audio.chunk_duration().as_secs() as u32;
        if clamped != self.audio.chunk_duration {
            tracing::warn!(
                "audio.chunk_duration {}s is outside {}-{}s, using {}s",
                self.audio.chunk_duration,
                MIN_CHUNK_SECONDS,
                MAX_CHUNK_SECONDS,
                clamped
            );
        }

        tracing::info!("✅ Configuration validation passed");
        Ok(())
    }

    /// Get runtime configuration summary
    pub fn summary(&self) -> String {
        format!(
            "vidscribe configuration:\n\
            - Workers: {}\n\
            - Max attempts: {}\n\
            - Chunk duration: {}s\n\
            - Speech provider: {:?} ({})\n\
            - LLM provider: {:?} ({})\n\
            - Data directory: {}",
            self.queue.worker_concurrency,
            self.queue.max_attempts,
            self.audio.chunk_duration().as_secs(),
            self.transcription.provider,
            self.transcription.model,
            self.llm.provider,
            self.llm.model,
            self.storage.data_dir.display()
        )
    }
}

/// Configuration builder for programmatic config creation
pub struct ConfigBuilder {
    config: Config,
}

impl ConfigBuilder {
    pub fn new() -> Self {
        Self {
            config: Config::default(),
        }
    }

    pub fn with_data_dir(mut self, dir: PathBuf) -> Self {
        self.config.storage.data_dir = dir;
        self
    }

    pub fn with_temp_dir(mut self, dir: PathBuf) -> Self {
        self.config.storage.temp_dir = Some(dir);
        self
    }

    pub fn with_workers(mut self, workers: usize) -> Self {
        self.config.queue.worker_concurrency = workers;
        self
    }

    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.config.queue.max_attempts = attempts;
        self
    }

    pub fn with_lock_duration(mut self, seconds: u64) -> Self {
        self.config.queue.lock_duration_secs = seconds;
        self
    }

    pub fn with_heartbeat_interval(mut self, seconds: u64) -> Self {
        self.config.queue.heartbeat_interval_secs = seconds;
        self
    }

    pub fn with_job_backoff(mut self, base_secs: u64, max_secs: u64) -> Self {
        self.config.queue.backoff_base_secs = base_secs;
        self.config.queue.backoff_max_secs = max_secs;
        self
    }

    pub fn with_enqueue_policy(mut self, policy: EnqueuePolicy) -> Self {
        self.config.queue.enqueue_policy = policy;
        self
    }

    pub fn with_chunk_duration(mut self, seconds: u32) -> Self {
        self.config.audio.chunk_duration = seconds;
        self
    }

    pub fn with_chunk_concurrency(mut self, concurrency: usize) -> Self {
        self.config.transcription.chunk_concurrency = concurrency;
        self
    }

    pub fn with_transcription_retries(mut self, attempts: u32, base_delay_ms: u64) -> Self {
        self.config.transcription.max_retries = attempts;
        self.config.transcription.retry_base_delay_ms = base_delay_ms;
        self.config.transcription.retry_max_delay_ms = base_delay_ms.saturating_mul(8);
        self
    }

    pub fn with_speech_api_key(mut self, api_key: String) -> Self {
        self.config.transcription.api_key = Some(api_key);
        self
    }

    pub fn with_llm_api_key(mut self, api_key: String) -> Self {
        self.config.llm.api_key = Some(api_key);
        self
    }

    pub fn enable_embeddings(mut self, enable: bool) -> Self {
        self.config.llm.enable_embeddings = enable;
        self
    }

    pub fn build(self) -> Config {
        self.config
    }
}

impl Default for ConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}
