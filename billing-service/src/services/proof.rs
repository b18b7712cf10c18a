//! Proof-of-payment file storage.

use crate::services::ports::ProofStore;
use async_trait::async_trait;
use portal_core::error::AppError;
use std::path::PathBuf;
use uuid::Uuid;

/// Filesystem-backed proof store. Files live under `root/<stage_id>/` and
/// references are relative paths, validated on read.
pub struct LocalProofStore {
    root: PathBuf,
}

impl LocalProofStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

fn sanitize_filename(filename: &str) -> String {
    let safe: String = filename
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                c
            } else {
                '_'
            }
        })
        .collect();

    if safe.trim_matches(&['.', '_'][..]).is_empty() {
        "proof".to_string()
    } else {
        safe
    }
}

#[async_trait]
impl ProofStore for LocalProofStore {
    async fn store(
        &self,
        stage_id: Uuid,
        filename: &str,
        bytes: &[u8],
    ) -> Result<String, AppError> {
        let safe = sanitize_filename(filename);
        let dir = self.root.join(stage_id.to_string());

        tokio::fs::create_dir_all(&dir).await?;
        tokio::fs::write(dir.join(&safe), bytes).await?;

        tracing::info!(stage_id = %stage_id, filename = %safe, size = bytes.len(), "Proof stored");

        Ok(format!("{}/{}", stage_id, safe))
    }

    async fn load(&self, reference: &str) -> Result<Vec<u8>, AppError> {
        if reference.contains("..") || reference.starts_with('/') {
            return Err(AppError::BadRequest(anyhow::anyhow!(
                "invalid proof reference"
            )));
        }

        match tokio::fs::read(self.root.join(reference)).await {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(AppError::NotFound(
                anyhow::anyhow!("proof '{}' not found", reference),
            )),
            Err(e) => Err(AppError::from(e)),
        }
    }
}
