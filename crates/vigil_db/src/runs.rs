//! Run rows and the persisted side of the run state machine.
//!
//! Every status write is a compare-and-set on the current status. Edges are
//! checked against `RunStatus::can_transition_to` before touching the row, and
//! a lost race is reported as `StaleTransition` (or `InvalidTransition` when
//! the winner already finalized the run).

use chrono::{DateTime, Utc};
use sqlx::SqliteConnection;
use vigil_protocol::{
    FailureKind, ProjectId, Run, RunConfig, RunId, RunStatus, SuiteId, SuiteKind, TargetId,
};

use crate::error::{DbError, Result};
use crate::rows::{run_from_row, to_millis};
use crate::VigilDb;

/// Insert payload for a freshly created run.
#[derive(Debug, Clone)]
pub struct NewRun {
    pub id: RunId,
    pub project_id: ProjectId,
    pub target_id: TargetId,
    pub suite_id: SuiteId,
    pub suite_kind: SuiteKind,
    pub config: RunConfig,
    pub safe_mode: bool,
    pub rate_limit: u32,
    pub priority: i32,
    pub max_attempts: u32,
    pub timeout_secs: u64,
    pub created_by: String,
    pub created_at: DateTime<Utc>,
}

/// Extra columns written together with a status change.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RunUpdate {
    pub failure_kind: Option<FailureKind>,
    pub status_reason: Option<String>,
}

impl RunUpdate {
    pub fn failed(kind: FailureKind, reason: impl Into<String>) -> Self {
        Self {
            failure_kind: Some(kind),
            status_reason: Some(reason.into()),
        }
    }

    pub fn cancelled(reason: impl Into<String>) -> Self {
        Self::failed(FailureKind::Cancelled, reason)
    }

    pub fn reason(reason: impl Into<String>) -> Self {
        Self {
            failure_kind: None,
            status_reason: Some(reason.into()),
        }
    }
}

impl VigilDb {
    /// Insert a run in `created`.
    pub async fn insert_run(&self, run: &NewRun) -> Result<Run> {
        let config_json = serde_json::to_string(&run.config)?;
        let created = to_millis(run.created_at);
        sqlx::query(
            r#"
            INSERT INTO runs (
                id, project_id, target_id, suite_id, suite_kind, status, config_json,
                safe_mode, rate_limit, priority, attempt, max_attempts, timeout_secs,
                created_by, created_at, updated_at
            )
            VALUES (?, ?, ?, ?, ?, 'created', ?, ?, ?, ?, 1, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(run.id.as_str())
        .bind(run.project_id.as_str())
        .bind(run.target_id.as_str())
        .bind(run.suite_id.as_str())
        .bind(run.suite_kind.as_str())
        .bind(config_json)
        .bind(run.safe_mode)
        .bind(i64::from(run.rate_limit))
        .bind(i64::from(run.priority))
        .bind(i64::from(run.max_attempts))
        .bind(run.timeout_secs as i64)
        .bind(&run.created_by)
        .bind(created)
        .bind(created)
        .execute(&self.pool)
        .await?;

        self.get_run(&run.id)
            .await?
            .ok_or_else(|| DbError::not_found(format!("run {}", run.id)))
    }

    pub async fn get_run(&self, id: &RunId) -> Result<Option<Run>> {
        let mut conn = self.pool.acquire().await?;
        get_run_in(&mut *conn, id).await
    }

    pub async fn require_run(&self, id: &RunId) -> Result<Run> {
        self.get_run(id)
            .await?
            .ok_or_else(|| DbError::not_found(format!("run {}", id)))
    }

    /// Runs newest first, optionally filtered.
    pub async fn list_runs(
        &self,
        project_id: Option<&ProjectId>,
        status: Option<RunStatus>,
    ) -> Result<Vec<Run>> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM runs
            WHERE (?1 IS NULL OR project_id = ?1)
              AND (?2 IS NULL OR status = ?2)
            ORDER BY created_at DESC, rowid DESC
            "#,
        )
        .bind(project_id.map(|p| p.as_str().to_string()))
        .bind(status.map(|s| s.as_str()))
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(run_from_row).collect()
    }

    /// Compare-and-set `from -> to`. Returns the run as written.
    pub async fn transition_run(
        &self,
        id: &RunId,
        from: RunStatus,
        to: RunStatus,
        update: RunUpdate,
        now: DateTime<Utc>,
    ) -> Result<Run> {
        let mut tx = self.pool.begin().await?;
        transition_run_in(&mut *tx, id, from, to, &update, now).await?;
        let run = get_run_in(&mut *tx, id)
            .await?
            .ok_or_else(|| DbError::not_found(format!("run {}", id)))?;
        tx.commit().await?;
        Ok(run)
    }

    /// Set the cancel flag on an executing run. Returns false when the run is
    /// not running or processing.
    pub async fn request_cancel(&self, id: &RunId, now: DateTime<Utc>) -> Result<bool> {
        let affected = sqlx::query(
            r#"
            UPDATE runs SET cancel_requested = 1, updated_at = ?
            WHERE id = ? AND status IN ('running', 'processing')
            "#,
        )
        .bind(to_millis(now))
        .bind(id.as_str())
        .execute(&self.pool)
        .await?
        .rows_affected();
        Ok(affected > 0)
    }

    pub async fn is_cancel_requested(&self, id: &RunId) -> Result<bool> {
        let flag: Option<bool> =
            sqlx::query_scalar("SELECT cancel_requested FROM runs WHERE id = ?")
                .bind(id.as_str())
                .fetch_optional(&self.pool)
                .await?;
        Ok(flag.unwrap_or(false))
    }

    /// Annotate a run whose output is incomplete (artifact storage gave up).
    pub async fn mark_degraded(&self, id: &RunId, reason: &str) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE runs
            SET degraded = 1,
                degraded_reason = COALESCE(degraded_reason || '; ' || ?1, ?1),
                updated_at = ?2
            WHERE id = ?3
            "#,
        )
        .bind(reason)
        .bind(Self::now_millis())
        .bind(id.as_str())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Executing runs whose hard deadline has passed.
    pub async fn runs_past_deadline(&self, now: DateTime<Utc>) -> Result<Vec<Run>> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM runs
            WHERE status IN ('queued', 'running', 'processing')
              AND deadline_at IS NOT NULL
              AND deadline_at <= ?
            ORDER BY deadline_at ASC
            "#,
        )
        .bind(to_millis(now))
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(run_from_row).collect()
    }
}

pub(crate) async fn get_run_in(conn: &mut SqliteConnection, id: &RunId) -> Result<Option<Run>> {
    let row = sqlx::query("SELECT * FROM runs WHERE id = ?")
        .bind(id.as_str())
        .fetch_optional(&mut *conn)
        .await?;
    row.as_ref().map(run_from_row).transpose()
}

/// Status CAS on an open connection or transaction.
pub(crate) async fn transition_run_in(
    conn: &mut SqliteConnection,
    id: &RunId,
    from: RunStatus,
    to: RunStatus,
    update: &RunUpdate,
    now: DateTime<Utc>,
) -> Result<()> {
    from.check_transition(to)?;

    let now_ms = to_millis(now);
    let finished = if to.is_terminal() { Some(now_ms) } else { None };
    let affected = sqlx::query(
        r#"
        UPDATE runs
        SET status = ?,
            failure_kind = COALESCE(?, failure_kind),
            status_reason = COALESCE(?, status_reason),
            finished_at = COALESCE(?, finished_at),
            updated_at = ?
        WHERE id = ? AND status = ?
        "#,
    )
    .bind(to.as_str())
    .bind(update.failure_kind.map(|k| k.as_str()))
    .bind(update.status_reason.as_deref())
    .bind(finished)
    .bind(now_ms)
    .bind(id.as_str())
    .bind(from.as_str())
    .execute(&mut *conn)
    .await?
    .rows_affected();

    if affected == 1 {
        return Ok(());
    }
    Err(diagnose_lost_transition(conn, id, from, to).await)
}

async fn diagnose_lost_transition(
    conn: &mut SqliteConnection,
    id: &RunId,
    expected: RunStatus,
    to: RunStatus,
) -> DbError {
    match get_run_in(conn, id).await {
        Ok(None) => DbError::not_found(format!("run {}", id)),
        Ok(Some(current)) if current.status.is_terminal() => current
            .status
            .check_transition(to)
            .err()
            .map(DbError::from)
            .unwrap_or_else(|| DbError::StaleTransition {
                run_id: id.clone(),
                expected,
                actual: current.status,
            }),
        Ok(Some(current)) => DbError::StaleTransition {
            run_id: id.clone(),
            expected,
            actual: current.status,
        },
        Err(e) => e,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use vigil_protocol::{Scope, Suite, Target, VerificationStatus};

    async fn seeded() -> (VigilDb, NewRun) {
        let db = VigilDb::open_in_memory().await.unwrap();
        let now = Utc::now();
        let target = Target {
            id: TargetId::new(),
            project_id: ProjectId::new(),
            name: "api".into(),
            scope: Scope::hosts(["api.example.com"]),
            verification_status: VerificationStatus::Verified,
            created_at: now,
            updated_at: now,
        };
        db.insert_target(&target).await.unwrap();
        let suite = Suite {
            id: SuiteId::parse("replay").unwrap(),
            kind: SuiteKind::Replay,
            name: "Replay".into(),
            defaults: serde_json::Value::Null,
        };
        db.upsert_suite(&suite).await.unwrap();
        let run = NewRun {
            id: RunId::new(),
            project_id: target.project_id.clone(),
            target_id: target.id.clone(),
            suite_id: suite.id.clone(),
            suite_kind: suite.kind,
            config: RunConfig::default(),
            safe_mode: true,
            rate_limit: 60,
            priority: 0,
            max_attempts: 3,
            timeout_secs: 60,
            created_by: "alice".into(),
            created_at: now,
        };
        (db, run)
    }

    #[tokio::test]
    async fn insert_starts_in_created() {
        let (db, new_run) = seeded().await;
        let run = db.insert_run(&new_run).await.unwrap();
        assert_eq!(run.status, RunStatus::Created);
        assert_eq!(run.attempt, 1);
        assert!(!run.cancel_requested);
    }

    #[tokio::test]
    async fn terminal_runs_reject_every_transition() {
        let (db, new_run) = seeded().await;
        db.insert_run(&new_run).await.unwrap();
        let now = Utc::now();
        let failed = db
            .transition_run(
                &new_run.id,
                RunStatus::Created,
                RunStatus::Failed,
                RunUpdate::failed(FailureKind::Authorization, "target not verified"),
                now,
            )
            .await
            .unwrap();
        assert_eq!(
            failed.terminal_reason(),
            Some((FailureKind::Authorization, "target not verified"))
        );
        assert!(failed.finished_at.is_some());

        for to in RunStatus::ALL {
            let err = db
                .transition_run(&new_run.id, RunStatus::Failed, *to, RunUpdate::default(), now)
                .await
                .unwrap_err();
            assert!(matches!(err, DbError::InvalidTransition(_)), "{:?}", err);
        }
    }

    #[tokio::test]
    async fn stale_expectation_is_reported() {
        let (db, new_run) = seeded().await;
        db.insert_run(&new_run).await.unwrap();
        let now = Utc::now();
        db.transition_run(&new_run.id, RunStatus::Created, RunStatus::Queued, RunUpdate::default(), now)
            .await
            .unwrap();

        let err = db
            .transition_run(&new_run.id, RunStatus::Created, RunStatus::Queued, RunUpdate::default(), now)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            DbError::StaleTransition { actual: RunStatus::Queued, .. }
        ));
    }

    #[tokio::test]
    async fn created_cannot_jump_to_running() {
        let (db, new_run) = seeded().await;
        db.insert_run(&new_run).await.unwrap();
        let err = db
            .transition_run(
                &new_run.id,
                RunStatus::Created,
                RunStatus::Running,
                RunUpdate::default(),
                Utc::now(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, DbError::InvalidTransition(_)));
        let run = db.require_run(&new_run.id).await.unwrap();
        assert_eq!(run.status, RunStatus::Created);
    }

    #[tokio::test]
    async fn cancel_flag_only_applies_while_executing() {
        let (db, new_run) = seeded().await;
        db.insert_run(&new_run).await.unwrap();
        assert!(!db.request_cancel(&new_run.id, Utc::now()).await.unwrap());
        assert!(!db.is_cancel_requested(&new_run.id).await.unwrap());
    }

    #[tokio::test]
    async fn degraded_reasons_accumulate() {
        let (db, new_run) = seeded().await;
        db.insert_run(&new_run).await.unwrap();
        db.mark_degraded(&new_run.id, "report.json not stored").await.unwrap();
        db.mark_degraded(&new_run.id, "log not stored").await.unwrap();
        let run = db.require_run(&new_run.id).await.unwrap();
        assert!(run.degraded);
        assert_eq!(
            run.degraded_reason.as_deref(),
            Some("report.json not stored; log not stored")
        );
    }
}
