use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::OnceLock;

use crate::error::{PipelineError, Result};

/// Lifecycle of a job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Queued,
    Active,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            JobStatus::Queued => "queued",
            JobStatus::Active => "active",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Pipeline stage reported for progress
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobPhase {
    Started,
    Downloading,
    Chunking,
    Transcribing,
    Summarizing,
    Embedding,
    Completed,
}

impl fmt::Display for JobPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            JobPhase::Started => "started",
            JobPhase::Downloading => "downloading",
            JobPhase::Chunking => "chunking",
            JobPhase::Transcribing => "transcribing",
            JobPhase::Summarizing => "summarizing",
            JobPhase::Embedding => "embedding",
            JobPhase::Completed => "completed",
        };
        f.write_str(name)
    }
}

/// What a second enqueue for a queued or active video does
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EnqueuePolicy {
    /// Keep the pending job untouched
    Ignore,
    /// Replace the inputs; an active attempt finishes first, then the job runs again
    Supersede,
}

/// Worker ownership of an active job
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Lease {
    pub worker_id: String,
    pub acquired_at: DateTime<Utc>,
    pub heartbeat_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

/// Job submission payload
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct EnqueueRequest {
    pub video_id: String,
    pub source_url: String,
    pub language: String,
}

impl EnqueueRequest {
    pub fn new(video_id: impl Into<String>, source_url: impl Into<String>, language: impl Into<String>) -> Self {
        Self {
            video_id: video_id.into(),
            source_url: source_url.into(),
            language: language.into(),
        }
    }

    pub fn validate(&self, require_https: bool) -> Result<()> {
        validate_video_id(&self.video_id)?;

        let url = url::Url::parse(&self.source_url).map_err(|e| {
            PipelineError::Validation(format!("invalid source URL '{}': {}", self.source_url, e))
        })?;
        let scheme_ok = match url.scheme() {
            "https" => true,
            "http" => !require_https,
            _ => false,
        };
        if !scheme_ok || url.host_str().is_none() {
            return Err(PipelineError::Validation(format!(
                "source URL must be an https URL: {}",
                self.source_url
            )));
        }

        if self.language.trim().is_empty() {
            return Err(PipelineError::Validation("language must not be empty".to_string()));
        }

        Ok(())
    }
}

/// One video's processing job
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    /// Equal to the video id
    pub id: String,
    pub status: JobStatus,
    /// Attempts started so far in the current run
    pub attempt: u32,
    pub max_attempts: u32,
    pub phase: Option<JobPhase>,
    /// Percent, monotonic within an attempt
    pub progress: u8,
    pub source_url: String,
    pub language: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Earliest time a queued job may be claimed
    pub available_at: DateTime<Utc>,
    pub lease: Option<Lease>,
    pub last_error: Option<String>,
    /// Inputs for a run requested while this one was active
    pub rerun: Option<EnqueueRequest>,
}

impl Job {
    pub fn new(request: &EnqueueRequest, max_attempts: u32) -> Self {
        let now = Utc::now();
        Self {
            id: request.video_id.clone(),
            status: JobStatus::Queued,
            attempt: 0,
            max_attempts: max_attempts.max(1),
            phase: None,
            progress: 0,
            source_url: request.source_url.clone(),
            language: request.language.clone(),
            created_at: now,
            updated_at: now,
            available_at: now,
            lease: None,
            last_error: None,
            rerun: None,
        }
    }

    /// Queued or active
    pub fn is_live(&self) -> bool {
        !self.status.is_terminal()
    }

    pub fn is_claimable(&self, now: DateTime<Utc>) -> bool {
        self.status == JobStatus::Queued && self.available_at <= now
    }

    pub fn lease_expired(&self, now: DateTime<Utc>) -> bool {
        self.status == JobStatus::Active
            && self.lease.as_ref().map_or(true, |lease| lease.expires_at <= now)
    }

    pub fn attempts_exhausted(&self) -> bool {
        self.attempt >= self.max_attempts
    }

    /// Start a fresh run with new inputs; the attempt counter restarts
    pub(crate) fn restart(&mut self, request: &EnqueueRequest, max_attempts: u32, now: DateTime<Utc>) {
        self.status = JobStatus::Queued;
        self.attempt = 0;
        self.max_attempts = max_attempts.max(1);
        self.phase = None;
        self.progress = 0;
        self.source_url = request.source_url.clone();
        self.language = request.language.clone();
        self.updated_at = now;
        self.available_at = now;
        self.lease = None;
        self.last_error = None;
        self.rerun = None;
    }
}

fn video_id_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^[A-Za-z0-9_-]{1,128}$").expect("valid video id pattern"))
}

/// Accept ids that are safe as file names and room keys
pub fn validate_video_id(id: &str) -> Result<&str> {
    let trimmed = id.trim();
    if video_id_pattern().is_match(trimmed) {
        Ok(trimmed)
    } else {
        Err(PipelineError::Validation(format!("invalid video id: {:?}", id)))
    }
}
