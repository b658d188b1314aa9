//! API request handlers

use serde_json::Value;

use super::models::{AskRequest, AskResponse, SubmitResponse};
use super::server::AppState;
use crate::error::{PipelineError, Result};
use crate::processing::{ask_video, submit_video};
use crate::queue::{validate_video_id, EnqueueRequest, JobStatus};

/// Handle health check requests
pub async fn health_check(state: &AppState) -> Result<Value> {
    let counts = state.queue.counts().await;
    let count = |status: JobStatus| counts.get(&status).copied().unwrap_or(0);

    Ok(serde_json::json!({
        "status": "healthy",
        "service": "vidscribe",
        "version": env!("CARGO_PKG_VERSION"),
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "jobs": {
            "queued": count(JobStatus::Queued),
            "active": count(JobStatus::Active),
            "completed": count(JobStatus::Completed),
            "failed": count(JobStatus::Failed),
        }
    }))
}

/// Enqueue a video for processing
pub async fn submit(state: &AppState, request: EnqueueRequest) -> Result<SubmitResponse> {
    let video_id = request.video_id.trim().to_string();
    let outcome = submit_video(
        &state.queue,
        request,
        state.config.download.require_https,
    )
    .await?;
    Ok(SubmitResponse::new(&video_id, outcome))
}

/// Fetch the stored record of a video, `None` when unknown
pub async fn get_video(state: &AppState, id: &str) -> Result<Option<Value>> {
    validate_video_id(id)?;
    match state.records.get(id).await? {
        Some(record) => Ok(Some(serde_json::to_value(record)?)),
        None => Ok(None),
    }
}

/// Fetch the queue entry of a video, `None` when unknown
pub async fn get_job(state: &AppState, id: &str) -> Result<Option<Value>> {
    validate_video_id(id)?;
    match state.queue.get(id).await {
        Some(job) => Ok(Some(serde_json::to_value(job)?)),
        None => Ok(None),
    }
}

/// Answer a question about a completed video
pub async fn ask(state: &AppState, id: &str, request: AskRequest) -> Result<AskResponse> {
    validate_video_id(id)?;
    if request.question.trim().is_empty() {
        return Err(PipelineError::Validation("question must not be empty".to_string()));
    }

    let answer = ask_video(state.records.as_ref(), &state.enricher, id, &request.question).await?;
    Ok(AskResponse {
        video_id: id.to_string(),
        question: request.question,
        answer,
    })
}
