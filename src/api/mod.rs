//! HTTP and WebSocket surface over the queue, the video records and the
//! notification rooms.

use anyhow::Result;
use tokio::task::JoinHandle;
use tracing::info;

pub mod handlers;
pub mod models;
pub mod server;

pub use server::AppState;

/// API Server for handling REST requests and WebSocket connections
pub struct ApiServer {
    state: AppState,
    port: u16,
}

impl ApiServer {
    pub fn new(state: AppState, port: u16) -> Self {
        Self { state, port }
    }

    /// Start the API server in the background
    pub fn start_background(self) -> JoinHandle<Result<()>> {
        tokio::spawn(async move { self.start().await })
    }

    async fn start(self) -> Result<()> {
        info!("🚀 Starting API server on port {}", self.port);
        server::start_http_server(self.state, self.port).await
    }
}
