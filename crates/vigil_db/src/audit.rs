//! Append-only audit trail for security-relevant decisions.

use chrono::{DateTime, Utc};
use vigil_protocol::{AuditEvent, AuditKind, RunId, TargetId};

use crate::error::Result;
use crate::rows::{audit_from_row, to_millis};
use crate::VigilDb;

impl VigilDb {
    pub async fn record_audit(
        &self,
        run_id: Option<&RunId>,
        target_id: Option<&TargetId>,
        kind: AuditKind,
        detail: &str,
        at: DateTime<Utc>,
    ) -> Result<i64> {
        let id: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO audit_events (run_id, target_id, kind, detail, created_at)
            VALUES (?, ?, ?, ?, ?)
            RETURNING id
            "#,
        )
        .bind(run_id.map(|r| r.as_str()))
        .bind(target_id.map(|t| t.as_str()))
        .bind(kind.as_str())
        .bind(detail)
        .bind(to_millis(at))
        .fetch_one(&self.pool)
        .await?;
        Ok(id)
    }

    pub async fn list_audit_for_run(&self, run_id: &RunId) -> Result<Vec<AuditEvent>> {
        let rows = sqlx::query("SELECT * FROM audit_events WHERE run_id = ? ORDER BY id ASC")
            .bind(run_id.as_str())
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(audit_from_row).collect()
    }

    pub async fn list_audit_for_target(&self, target_id: &TargetId) -> Result<Vec<AuditEvent>> {
        let rows = sqlx::query("SELECT * FROM audit_events WHERE target_id = ? ORDER BY id ASC")
            .bind(target_id.as_str())
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(audit_from_row).collect()
    }
}
