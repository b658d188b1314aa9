//! HTTP server implementation for the API

use anyhow::Result;
use axum::{
    extract::{
        ws::{Message, WebSocket},
        Path, State, WebSocketUpgrade,
    },
    http::{header, Method, StatusCode},
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use std::sync::Arc;
use tokio::sync::broadcast;
use tower::ServiceBuilder;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing::{debug, info, warn};

use super::{handlers, models::ApiResponse, models::AskRequest};
use crate::config::Config;
use crate::error::PipelineError;
use crate::llm::Enricher;
use crate::notify::{JobEvent, Notifier};
use crate::queue::{EnqueueRequest, JobQueue};
use crate::state::VideoRepository;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub queue: Arc<JobQueue>,
    pub records: Arc<dyn VideoRepository>,
    pub notifier: Arc<Notifier>,
    pub enricher: Arc<Enricher>,
    pub config: Arc<Config>,
}

/// Build the router with every route and middleware
pub fn router(app_state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::PUT, Method::DELETE])
        .allow_headers([header::CONTENT_TYPE, header::AUTHORIZATION]);

    Router::new()
        .route("/health", get(health_handler))
        .route("/api/health", get(health_handler))
        .route("/api/videos", post(submit_handler))
        .route("/api/videos/:id", get(video_handler))
        .route("/api/videos/:id/ask", post(ask_handler))
        .route("/api/jobs/:id", get(job_handler))
        .route("/ws/videos/:id", get(websocket_handler))
        .with_state(app_state)
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(cors),
        )
}

/// Configure and start the HTTP server
pub async fn start_http_server(app_state: AppState, port: u16) -> Result<()> {
    let app = router(app_state);

    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{}", port)).await?;
    info!("🌐 API server listening on http://0.0.0.0:{}", port);
    info!("🔗 Live events available at ws://0.0.0.0:{}/ws/videos/:id", port);

    axum::serve(listener, app).await?;

    Ok(())
}

fn status_for(error: &PipelineError) -> StatusCode {
    match error {
        PipelineError::Validation(_) => StatusCode::BAD_REQUEST,
        PipelineError::DuplicateInFlight(_) => StatusCode::CONFLICT,
        PipelineError::Transient(_) | PipelineError::Backend(_) => StatusCode::BAD_GATEWAY,
        PipelineError::Timeout(..) => StatusCode::GATEWAY_TIMEOUT,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn error_response(error: PipelineError) -> Response {
    let status = status_for(&error);
    if status.is_server_error() {
        warn!("API request failed: {}", error);
    }
    (status, Json(ApiResponse::<()>::error(error.to_string()))).into_response()
}

fn not_found_response(kind: &str, id: &str) -> Response {
    (
        StatusCode::NOT_FOUND,
        Json(ApiResponse::<()>::error(format!("unknown {} {}", kind, id))),
    )
        .into_response()
}

/// Health check handler
async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    match handlers::health_check(&state).await {
        Ok(data) => (StatusCode::OK, Json(data)).into_response(),
        Err(e) => error_response(e),
    }
}

/// Submit video handler
async fn submit_handler(
    State(state): State<AppState>,
    Json(payload): Json<EnqueueRequest>,
) -> impl IntoResponse {
    match handlers::submit(&state, payload).await {
        Ok(data) => (StatusCode::ACCEPTED, Json(ApiResponse::success(data))).into_response(),
        Err(e) => error_response(e),
    }
}

/// Video record handler
async fn video_handler(State(state): State<AppState>, Path(id): Path<String>) -> impl IntoResponse {
    match handlers::get_video(&state, &id).await {
        Ok(Some(data)) => (StatusCode::OK, Json(ApiResponse::success(data))).into_response(),
        Ok(None) => not_found_response("video", &id),
        Err(e) => error_response(e),
    }
}

/// Job handler
async fn job_handler(State(state): State<AppState>, Path(id): Path<String>) -> impl IntoResponse {
    match handlers::get_job(&state, &id).await {
        Ok(Some(data)) => (StatusCode::OK, Json(ApiResponse::success(data))).into_response(),
        Ok(None) => not_found_response("job", &id),
        Err(e) => error_response(e),
    }
}

/// Question answering handler
async fn ask_handler(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(payload): Json<AskRequest>,
) -> impl IntoResponse {
    match handlers::ask(&state, &id, payload).await {
        Ok(data) => (StatusCode::OK, Json(ApiResponse::success(data))).into_response(),
        Err(e) => error_response(e),
    }
}

/// WebSocket handler streaming one video's events
async fn websocket_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Response {
    match state.notifier.subscribe(&id) {
        Ok(events) => ws.on_upgrade(move |socket| websocket_connection(socket, id, events)),
        Err(e) => error_response(e),
    }
}

/// Forward room events to the socket until either side goes away
async fn websocket_connection(
    mut socket: WebSocket,
    video_id: String,
    mut events: broadcast::Receiver<JobEvent>,
) {
    info!("🔌 WebSocket subscribed to video {}", video_id);

    loop {
        tokio::select! {
            msg = socket.recv() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        if text == "ping" && socket.send(Message::Text("pong".to_string())).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(e)) => {
                        warn!("WebSocket error: {}", e);
                        break;
                    }
                    _ => {}
                }
            }

            event = events.recv() => {
                match event {
                    Ok(event) => {
                        let Ok(text) = serde_json::to_string(&event) else {
                            continue;
                        };
                        if socket.send(Message::Text(text)).await.is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        debug!("WebSocket for {} skipped {} events", video_id, skipped);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        }
    }

    info!("🔌 WebSocket for video {} closed", video_id);
}
