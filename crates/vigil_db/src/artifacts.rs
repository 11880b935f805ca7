//! Artifact references. Bytes live in the artifact store.

use vigil_protocol::{Artifact, RunId};

use crate::error::Result;
use crate::rows::{artifact_from_row, to_millis};
use crate::VigilDb;

impl VigilDb {
    pub async fn insert_artifact(&self, artifact: &Artifact) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO artifacts (id, run_id, job_id, kind, name, storage_ref, size_bytes, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(artifact.id.as_str())
        .bind(artifact.run_id.as_str())
        .bind(artifact.job_id.as_str())
        .bind(artifact.kind.as_str())
        .bind(&artifact.name)
        .bind(&artifact.storage_ref)
        .bind(artifact.size_bytes as i64)
        .bind(to_millis(artifact.created_at))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn list_artifacts(&self, run_id: &RunId) -> Result<Vec<Artifact>> {
        let rows = sqlx::query(
            "SELECT * FROM artifacts WHERE run_id = ? ORDER BY created_at ASC, rowid ASC",
        )
        .bind(run_id.as_str())
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(artifact_from_row).collect()
    }
}
