//! Object storage for run artifacts.
//!
//! Artifact bytes never go into the relational store. An [`ArtifactStore`] takes
//! the bytes and hands back a reference, which is what the artifact row records.

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tracing::warn;
use vigil_protocol::{JobId, RunId};

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid storage reference: {0}")]
    InvalidRef(String),
}

#[async_trait]
pub trait ArtifactStore: Send + Sync {
    /// Store `bytes` and return the reference to record.
    async fn put(
        &self,
        run_id: &RunId,
        job_id: &JobId,
        name: &str,
        bytes: &[u8],
    ) -> Result<String, StorageError>;

    async fn get(&self, storage_ref: &str) -> Result<Vec<u8>, StorageError>;
}

/// Filesystem-backed store: `<root>/<run_id>/<job_id>/<name>`.
///
/// References are `fs:` plus the path relative to the root.
#[derive(Debug, Clone)]
pub struct FsArtifactStore {
    root: PathBuf,
}

const FS_REF_PREFIX: &str = "fs:";

impl FsArtifactStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn resolve(&self, storage_ref: &str) -> Result<PathBuf, StorageError> {
        let relative = storage_ref
            .strip_prefix(FS_REF_PREFIX)
            .ok_or_else(|| StorageError::InvalidRef(storage_ref.to_string()))?;
        let mut path = self.root.clone();
        for part in relative.split('/') {
            if part.is_empty() || part == "." || part == ".." {
                return Err(StorageError::InvalidRef(storage_ref.to_string()));
            }
            path.push(part);
        }
        Ok(path)
    }
}

#[async_trait]
impl ArtifactStore for FsArtifactStore {
    async fn put(
        &self,
        run_id: &RunId,
        job_id: &JobId,
        name: &str,
        bytes: &[u8],
    ) -> Result<String, StorageError> {
        let file_name = sanitize_file_name(name);
        let dir = self.root.join(run_id.as_str()).join(job_id.as_str());
        tokio::fs::create_dir_all(&dir).await?;

        // Write-then-rename so readers never see a partial file.
        let final_path = dir.join(&file_name);
        let tmp_path = dir.join(format!(".{}.tmp", file_name));
        tokio::fs::write(&tmp_path, bytes).await?;
        tokio::fs::rename(&tmp_path, &final_path).await?;

        Ok(format!(
            "{}{}/{}/{}",
            FS_REF_PREFIX,
            run_id.as_str(),
            job_id.as_str(),
            file_name
        ))
    }

    async fn get(&self, storage_ref: &str) -> Result<Vec<u8>, StorageError> {
        let path = self.resolve(storage_ref)?;
        Ok(tokio::fs::read(path).await?)
    }
}

/// `put` with a bounded number of retries and linear backoff.
pub async fn put_with_retry(
    store: &dyn ArtifactStore,
    run_id: &RunId,
    job_id: &JobId,
    name: &str,
    bytes: &[u8],
    retries: u32,
    backoff: Duration,
) -> Result<String, StorageError> {
    let mut attempt = 0;
    loop {
        match store.put(run_id, job_id, name, bytes).await {
            Ok(storage_ref) => return Ok(storage_ref),
            Err(e) if attempt < retries => {
                attempt += 1;
                warn!(
                    run_id = %run_id,
                    artifact = name,
                    attempt,
                    "Artifact upload failed, retrying: {}",
                    e
                );
                tokio::time::sleep(backoff * attempt).await;
            }
            Err(e) => return Err(e),
        }
    }
}

fn sanitize_file_name(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') {
                c
            } else {
                '_'
            }
        })
        .collect();
    let cleaned = cleaned.trim_start_matches('.');
    if cleaned.is_empty() {
        "artifact".to_string()
    } else {
        cleaned.to_string()
    }
}
