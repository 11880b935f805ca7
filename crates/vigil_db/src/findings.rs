//! Finding persistence.
//!
//! Findings are upserted on `dedup_key`; a retried attempt or a late write from
//! a worker that lost its lease merges into the existing row instead of adding
//! a duplicate.

use vigil_protocol::{Finding, RunId};

use crate::error::Result;
use crate::rows::{finding_from_row, to_millis};
use crate::VigilDb;

impl VigilDb {
    /// Upsert a batch in one transaction. Returns the number of rows touched.
    pub async fn upsert_findings(&self, findings: &[Finding]) -> Result<usize> {
        if findings.is_empty() {
            return Ok(0);
        }

        let mut tx = self.pool.begin().await?;
        for finding in findings {
            let evidence = serde_json::to_string(&finding.evidence)?;
            sqlx::query(
                r#"
                INSERT INTO findings (
                    id, run_id, job_id, severity, severity_rank, finding_type, title,
                    location, dedup_key, status, evidence_json, occurrences, created_at, updated_at
                )
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                ON CONFLICT(dedup_key) DO UPDATE SET
                    job_id = excluded.job_id,
                    severity = CASE WHEN excluded.severity_rank > findings.severity_rank
                                    THEN excluded.severity ELSE findings.severity END,
                    severity_rank = MAX(findings.severity_rank, excluded.severity_rank),
                    title = excluded.title,
                    evidence_json = excluded.evidence_json,
                    occurrences = MAX(findings.occurrences, excluded.occurrences),
                    updated_at = excluded.updated_at
                "#,
            )
            .bind(finding.id.as_str())
            .bind(finding.run_id.as_str())
            .bind(finding.job_id.as_ref().map(|j| j.as_str()))
            .bind(finding.severity.as_str())
            .bind(i64::from(finding.severity.rank()))
            .bind(&finding.finding_type)
            .bind(&finding.title)
            .bind(&finding.location)
            .bind(&finding.dedup_key)
            .bind(finding.status.as_str())
            .bind(evidence)
            .bind(i64::from(finding.occurrences))
            .bind(to_millis(finding.created_at))
            .bind(to_millis(finding.updated_at))
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(findings.len())
    }

    /// Findings for a run, most severe first.
    pub async fn list_findings(&self, run_id: &RunId) -> Result<Vec<Finding>> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM findings
            WHERE run_id = ?
            ORDER BY severity_rank DESC, created_at ASC, rowid ASC
            "#,
        )
        .bind(run_id.as_str())
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(finding_from_row).collect()
    }
}
