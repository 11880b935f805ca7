//! Targets, authorization records and the suite catalog.

use chrono::{DateTime, Utc};
use sqlx::Row;
use vigil_protocol::{
    AuthorizationRecord, Suite, SuiteId, Target, TargetId, VerificationStatus,
};

use crate::error::Result;
use crate::rows::{authorization_from_row, parse, suite_from_row, target_from_row, to_millis};
use crate::VigilDb;

impl VigilDb {
    pub async fn insert_target(&self, target: &Target) -> Result<()> {
        let scope_json = serde_json::to_string(&target.scope)?;
        sqlx::query(
            r#"
            INSERT INTO targets (id, project_id, name, scope_json, verification_status, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(target.id.as_str())
        .bind(target.project_id.as_str())
        .bind(&target.name)
        .bind(scope_json)
        .bind(target.verification_status.as_str())
        .bind(to_millis(target.created_at))
        .bind(to_millis(target.updated_at))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get_target(&self, id: &TargetId) -> Result<Option<Target>> {
        let row = sqlx::query("SELECT * FROM targets WHERE id = ?")
            .bind(id.as_str())
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(target_from_row).transpose()
    }

    /// Move a target between verification states if it is currently in one of
    /// `from`. Returns false when another writer got there first.
    pub async fn compare_and_set_verification(
        &self,
        id: &TargetId,
        from: &[VerificationStatus],
        to: VerificationStatus,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let mut affected = 0;
        for status in from {
            affected += sqlx::query(
                r#"
                UPDATE targets
                SET verification_status = ?, updated_at = ?
                WHERE id = ? AND verification_status = ?
                "#,
            )
            .bind(to.as_str())
            .bind(to_millis(now))
            .bind(id.as_str())
            .bind(status.as_str())
            .execute(&self.pool)
            .await?
            .rows_affected();
            if affected > 0 {
                break;
            }
        }
        Ok(affected > 0)
    }

    /// Persist a successful proof check and mark the target verified in one
    /// transaction.
    pub async fn record_authorization(&self, record: &AuthorizationRecord) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query(
            r#"
            INSERT INTO authorization_records (id, target_id, proof_type, proof_value, verified_at, expires_at)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(record.id.as_str())
        .bind(record.target_id.as_str())
        .bind(record.proof_type.as_str())
        .bind(&record.proof_value)
        .bind(to_millis(record.verified_at))
        .bind(to_millis(record.expires_at))
        .execute(&mut *tx)
        .await?;

        sqlx::query("UPDATE targets SET verification_status = ?, updated_at = ? WHERE id = ?")
            .bind(VerificationStatus::Verified.as_str())
            .bind(to_millis(record.verified_at))
            .bind(record.target_id.as_str())
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(())
    }

    /// Most recent authorization record that has not expired at `now`.
    pub async fn latest_valid_authorization(
        &self,
        target_id: &TargetId,
        now: DateTime<Utc>,
    ) -> Result<Option<AuthorizationRecord>> {
        let row = sqlx::query(
            r#"
            SELECT * FROM authorization_records
            WHERE target_id = ? AND expires_at > ?
            ORDER BY expires_at DESC
            LIMIT 1
            "#,
        )
        .bind(target_id.as_str())
        .bind(to_millis(now))
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(authorization_from_row).transpose()
    }

    pub async fn list_authorizations(
        &self,
        target_id: &TargetId,
    ) -> Result<Vec<AuthorizationRecord>> {
        let rows = sqlx::query(
            "SELECT * FROM authorization_records WHERE target_id = ? ORDER BY verified_at DESC",
        )
        .bind(target_id.as_str())
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(authorization_from_row).collect()
    }

    /// Flip every verified target with no unexpired authorization to expired.
    pub async fn expire_stale_targets(&self, now: DateTime<Utc>) -> Result<Vec<TargetId>> {
        let now_ms = to_millis(now);
        let rows = sqlx::query(
            r#"
            UPDATE targets
            SET verification_status = 'expired', updated_at = ?
            WHERE verification_status = 'verified'
              AND NOT EXISTS (
                  SELECT 1 FROM authorization_records a
                  WHERE a.target_id = targets.id AND a.expires_at > ?
              )
            RETURNING id
            "#,
        )
        .bind(now_ms)
        .bind(now_ms)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(|row| parse(row, "id")).collect()
    }

    pub async fn upsert_suite(&self, suite: &Suite) -> Result<()> {
        let defaults = serde_json::to_string(&suite.defaults)?;
        sqlx::query(
            r#"
            INSERT INTO suites (id, kind, name, defaults_json, created_at)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                kind = excluded.kind,
                name = excluded.name,
                defaults_json = excluded.defaults_json
            "#,
        )
        .bind(suite.id.as_str())
        .bind(suite.kind.as_str())
        .bind(&suite.name)
        .bind(defaults)
        .bind(Self::now_millis())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get_suite(&self, id: &SuiteId) -> Result<Option<Suite>> {
        let row = sqlx::query("SELECT * FROM suites WHERE id = ?")
            .bind(id.as_str())
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(suite_from_row).transpose()
    }

    pub async fn list_suites(&self) -> Result<Vec<Suite>> {
        let rows = sqlx::query("SELECT * FROM suites ORDER BY id")
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(suite_from_row).collect()
    }

    pub async fn count_targets_by_status(&self, status: VerificationStatus) -> Result<i64> {
        let row = sqlx::query("SELECT COUNT(*) AS n FROM targets WHERE verification_status = ?")
            .bind(status.as_str())
            .fetch_one(&self.pool)
            .await?;
        Ok(row.try_get("n")?)
    }
}
