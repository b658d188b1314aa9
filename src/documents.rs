//! JSON document files shared by the job queue and the video repository

use serde::de::DeserializeOwned;
use serde::Serialize;
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::{debug, warn};

use crate::error::{PipelineError, Result};

/// Path of the document for `id` inside `dir`
pub fn document_path(dir: &Path, id: &str) -> PathBuf {
    dir.join(format!("{}.json", id))
}

/// Write `value` next to its final path and rename it into place, so readers
/// see either the old or the new document and never a torn one
pub async fn write_atomic<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let content = serde_json::to_vec_pretty(value)?;
    let tmp_path = path.with_extension("json.tmp");

    fs::write(&tmp_path, &content)
        .await
        .map_err(|e| PipelineError::Storage(format!("failed to write {}: {}", tmp_path.display(), e)))?;

    if let Err(e) = fs::rename(&tmp_path, path).await {
        let _ = fs::remove_file(&tmp_path).await;
        return Err(PipelineError::Storage(format!(
            "failed to replace {}: {}",
            path.display(),
            e
        )));
    }

    Ok(())
}

/// Load every `*.json` document in `dir`; unreadable files are skipped
pub async fn load_all<T: DeserializeOwned>(dir: &Path) -> Result<Vec<T>> {
    let mut entries = fs::read_dir(dir).await?;
    let mut documents = Vec::new();

    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        if path.extension().map_or(false, |ext| ext == "json") {
            match fs::read(&path).await {
                Ok(bytes) => match serde_json::from_slice::<T>(&bytes) {
                    Ok(doc) => documents.push(doc),
                    Err(e) => warn!("Skipping unreadable document {}: {}", path.display(), e),
                },
                Err(e) => warn!("Failed to read {}: {}", path.display(), e),
            }
        }
    }

    debug!("📁 Loaded {} documents from {}", documents.len(), dir.display());
    Ok(documents)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Serialize, Deserialize, PartialEq)]
    struct Doc {
        id: String,
        value: u32,
    }

    #[tokio::test]
    async fn test_write_then_load() {
        let dir = tempfile::TempDir::new().unwrap();
        let doc = Doc {
            id: "a".to_string(),
            value: 7,
        };
        write_atomic(&document_path(dir.path(), "a"), &doc).await.unwrap();
        std::fs::write(dir.path().join("junk.json"), b"{not json").unwrap();
        std::fs::write(dir.path().join("notes.txt"), b"ignored").unwrap();

        let loaded: Vec<Doc> = load_all(dir.path()).await.unwrap();
        assert_eq!(loaded, vec![doc]);
        assert!(!dir.path().join("a.json.tmp").exists());
    }
}
