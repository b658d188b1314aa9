//! API data models

use serde::{Deserialize, Serialize};

use crate::queue::EnqueueOutcome;

/// API response wrapper
#[derive(Debug, Serialize, Deserialize)]
pub struct ApiResponse<T> {
    pub success: bool,
    pub data: Option<T>,
    pub error: Option<String>,
}

impl<T> ApiResponse<T> {
    pub fn success(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
        }
    }

    pub fn error(message: String) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(message),
        }
    }
}

/// Result of submitting a video
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmitResponse {
    pub video_id: String,
    pub outcome: String,
}

impl SubmitResponse {
    pub fn new(video_id: &str, outcome: EnqueueOutcome) -> Self {
        let outcome = match outcome {
            EnqueueOutcome::Enqueued => "enqueued",
            EnqueueOutcome::AlreadyPending => "already_pending",
            EnqueueOutcome::Superseded => "superseded",
            EnqueueOutcome::RerunScheduled => "rerun_scheduled",
        };
        Self {
            video_id: video_id.to_string(),
            outcome: outcome.to_string(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct AskRequest {
    pub question: String,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AskResponse {
    pub video_id: String,
    pub question: String,
    pub answer: String,
}
