use async_trait::async_trait;
use futures::StreamExt;
use std::path::Path;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};

use crate::config::DownloadConfig;
use crate::error::{PipelineError, Result};

/// Fetches the source media of a job
#[async_trait]
pub trait MediaFetcher: Send + Sync {
    /// Download `source_url` to `dest`, returning the byte count. A failed
    /// download leaves no file behind.
    async fn fetch(&self, source_url: &str, dest: &Path) -> Result<u64>;
}

/// Streaming HTTP(S) download with a total-transfer timeout and a size ceiling
pub struct HttpFetcher {
    client: reqwest::Client,
    timeout: Duration,
    max_bytes: u64,
}

impl HttpFetcher {
    pub fn new(config: &DownloadConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(config.connect_timeout_secs))
            .build()
            .map_err(|e| PipelineError::Backend(format!("failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            timeout: Duration::from_secs(config.timeout_secs),
            max_bytes: config.max_bytes,
        })
    }

    async fn stream_to_file(&self, source_url: &str, dest: &Path) -> Result<u64> {
        let response = self
            .client
            .get(source_url)
            .send()
            .await
            .map_err(|e| PipelineError::from_reqwest("download", e))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(PipelineError::from_status("download", status, &body));
        }

        if let Some(length) = response.content_length() {
            if length > self.max_bytes {
                return Err(PipelineError::Validation(format!(
                    "source is {} bytes, limit is {}",
                    length, self.max_bytes
                )));
            }
        }

        let mut file = tokio::fs::File::create(dest).await?;
        let mut written: u64 = 0;
        let mut stream = response.bytes_stream();

        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| PipelineError::from_reqwest("download", e))?;
            written += chunk.len() as u64;
            if written > self.max_bytes {
                return Err(PipelineError::Validation(format!(
                    "source exceeds {} bytes",
                    self.max_bytes
                )));
            }
            file.write_all(&chunk).await?;
        }

        file.flush().await?;
        Ok(written)
    }
}

#[async_trait]
impl MediaFetcher for HttpFetcher {
    async fn fetch(&self, source_url: &str, dest: &Path) -> Result<u64> {
        info!("⬇️ Downloading {}", source_url);

        let result = match tokio::time::timeout(self.timeout, self.stream_to_file(source_url, dest)).await {
            Ok(result) => result,
            Err(_) => Err(PipelineError::Timeout(self.timeout, format!("download of {}", source_url))),
        };

        match result {
            Ok(bytes) => {
                debug!("Downloaded {} bytes to {}", bytes, dest.display());
                Ok(bytes)
            }
            Err(e) => {
                let _ = tokio::fs::remove_file(dest).await;
                Err(e)
            }
        }
    }
}
