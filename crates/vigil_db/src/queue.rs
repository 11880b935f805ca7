//! Job queue with leases.
//!
//! One job row per run attempt. Claiming is an atomic `UPDATE ... WHERE state =
//! 'pending'` on the best candidate, ordered by priority then age, so two
//! workers can never hold the same job. The run moves `queued -> running` in
//! the same transaction.
//!
//! Leases expire after the visibility timeout. Expired leases are reclaimed by
//! `reclaim_expired_at`, which requeues the run (transient) or dead-letters it
//! once attempts are exhausted. The visibility timeout is crash detection only;
//! the run's hard deadline is tracked separately on the run row.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use rand::Rng;
use sqlx::{Row, SqliteConnection};
use std::time::Duration;
use tracing::{debug, info, warn};
use vigil_protocol::{
    DeadLetter, FailureKind, InvalidTransition, Job, JobId, JobState, RetryPolicy, Run, RunId,
    RunStatus, WorkerId,
};

use crate::error::{DbError, Result};
use crate::rows::{dead_letter_from_row, job_from_row, to_millis};
use crate::runs::{get_run_in, transition_run_in, RunUpdate};
use crate::VigilDb;

/// Jitter applied to retry backoff (±25%).
const BACKOFF_JITTER: f64 = 0.25;

/// A claimed job and the run it executes.
#[derive(Debug, Clone)]
pub struct Lease {
    pub job: Job,
    pub run: Run,
}

/// Why a worker is giving a job back.
#[derive(Debug, Clone, PartialEq)]
pub struct NackReason {
    pub kind: FailureKind,
    pub message: String,
}

impl NackReason {
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

/// What happened to the run after a nack or a reclaimed lease.
#[derive(Debug, Clone, PartialEq)]
pub enum NackOutcome {
    /// A new job for `attempt` becomes leasable at `available_at`.
    Requeued {
        attempt: u32,
        available_at: DateTime<Utc>,
    },
    /// Moved to the dead-letter table; the run failed with `failure_kind`.
    DeadLettered { failure_kind: FailureKind },
    Cancelled,
    /// The run was already terminal; only the job row was closed.
    Discarded,
}

/// Result of one reclaim sweep.
#[derive(Debug, Clone, Default)]
pub struct ReclaimReport {
    pub reclaimed: Vec<(JobId, RunId, NackOutcome)>,
}

impl ReclaimReport {
    pub fn len(&self) -> usize {
        self.reclaimed.len()
    }

    pub fn is_empty(&self) -> bool {
        self.reclaimed.is_empty()
    }

    pub fn requeued(&self) -> usize {
        self.count(|o| matches!(o, NackOutcome::Requeued { .. }))
    }

    pub fn dead_lettered(&self) -> usize {
        self.count(|o| matches!(o, NackOutcome::DeadLettered { .. }))
    }

    fn count(&self, pred: impl Fn(&NackOutcome) -> bool) -> usize {
        self.reclaimed.iter().filter(|(_, _, o)| pred(o)).count()
    }
}

/// Job counts by state.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct QueueStats {
    pub pending: i64,
    pub leased: i64,
    pub acked: i64,
    pub failed: i64,
    pub expired: i64,
    pub dead_letter: i64,
    pub cancelled: i64,
}

#[derive(Debug, Clone)]
pub struct JobQueue {
    db: VigilDb,
    policy: RetryPolicy,
}

impl JobQueue {
    pub fn new(db: VigilDb, policy: RetryPolicy) -> Self {
        Self { db, policy }
    }

    pub fn db(&self) -> &VigilDb {
        &self.db
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Queue the first attempt of a run.
    ///
    /// A `created` run moves to `queued` in the same transaction. Idempotent:
    /// if the run already has a pending or leased job, that job is returned.
    pub async fn enqueue(&self, run_id: &RunId) -> Result<Job> {
        self.enqueue_at(run_id, Utc::now()).await
    }

    pub async fn enqueue_at(&self, run_id: &RunId, now: DateTime<Utc>) -> Result<Job> {
        let mut tx = self.db.pool.begin().await?;

        if let Some(job) = active_job_in(&mut *tx, run_id).await? {
            tx.commit().await?;
            debug!(run_id = %run_id, job_id = %job.id, "Run already has an active job");
            return Ok(job);
        }

        let run = get_run_in(&mut *tx, run_id)
            .await?
            .ok_or_else(|| DbError::not_found(format!("run {}", run_id)))?;
        match run.status {
            RunStatus::Created => {
                transition_run_in(
                    &mut *tx,
                    run_id,
                    RunStatus::Created,
                    RunStatus::Queued,
                    &RunUpdate::default(),
                    now,
                )
                .await?
            }
            RunStatus::Queued => {}
            other => {
                return Err(InvalidTransition {
                    from: other,
                    to: RunStatus::Queued,
                }
                .into())
            }
        }

        let job = insert_job_in(&mut *tx, run_id, run.attempt, run.priority, now, now).await?;
        tx.commit().await?;

        info!(run_id = %run_id, job_id = %job.id, attempt = job.attempt, "Job enqueued");
        Ok(job)
    }

    /// Claim the best available job for `worker`.
    pub async fn lease(&self, worker: &WorkerId, visibility: Duration) -> Result<Option<Lease>> {
        self.lease_at(worker, visibility, Utc::now()).await
    }

    pub async fn lease_at(
        &self,
        worker: &WorkerId,
        visibility: Duration,
        now: DateTime<Utc>,
    ) -> Result<Option<Lease>> {
        self.reclaim_expired_at(now).await?;

        let now_ms = to_millis(now);
        let deadline = now + to_chrono(visibility);
        let mut tx = self.db.pool.begin().await?;

        let row = sqlx::query(
            r#"
            UPDATE jobs
            SET state = 'leased', lease_owner = ?, lease_deadline = ?
            WHERE id = (
                SELECT j.id FROM jobs j
                JOIN runs r ON r.id = j.run_id
                WHERE j.state = 'pending'
                  AND j.available_at <= ?
                  AND r.status = 'queued'
                  AND r.cancel_requested = 0
                ORDER BY j.priority DESC, j.created_at ASC, j.rowid ASC
                LIMIT 1
            )
            AND state = 'pending'
            RETURNING *
            "#,
        )
        .bind(worker.as_str())
        .bind(to_millis(deadline))
        .bind(now_ms)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(row) = row else {
            tx.commit().await?;
            return Ok(None);
        };
        let job = job_from_row(&row)?;

        let moved = sqlx::query(
            r#"
            UPDATE runs
            SET status = 'running',
                started_at = COALESCE(started_at, ?1),
                deadline_at = COALESCE(deadline_at, ?1 + timeout_secs * 1000),
                status_reason = NULL,
                updated_at = ?1
            WHERE id = ?2 AND status = 'queued'
            "#,
        )
        .bind(now_ms)
        .bind(job.run_id.as_str())
        .execute(&mut *tx)
        .await?
        .rows_affected();

        if moved == 0 {
            // Run left `queued` underneath us; leave the job pending.
            tx.rollback().await?;
            warn!(job_id = %job.id, run_id = %job.run_id, "Run no longer queued, lease abandoned");
            return Ok(None);
        }

        let run = get_run_in(&mut *tx, &job.run_id)
            .await?
            .ok_or_else(|| DbError::not_found(format!("run {}", job.run_id)))?;
        tx.commit().await?;

        info!(
            job_id = %job.id,
            run_id = %run.id,
            attempt = job.attempt,
            worker = %worker,
            "Job leased"
        );
        Ok(Some(Lease { job, run }))
    }

    /// Extend a held lease. Fails with `LeaseLost` once the lease has expired
    /// or moved to another worker.
    pub async fn renew_at(
        &self,
        job_id: &JobId,
        worker: &WorkerId,
        visibility: Duration,
        now: DateTime<Utc>,
    ) -> Result<DateTime<Utc>> {
        let deadline = now + to_chrono(visibility);
        let affected = sqlx::query(
            r#"
            UPDATE jobs SET lease_deadline = ?
            WHERE id = ? AND state = 'leased' AND lease_owner = ? AND lease_deadline > ?
            "#,
        )
        .bind(to_millis(deadline))
        .bind(job_id.as_str())
        .bind(worker.as_str())
        .bind(to_millis(now))
        .execute(&self.db.pool)
        .await?
        .rows_affected();

        if affected == 0 {
            return Err(lease_lost(job_id, worker));
        }
        Ok(deadline)
    }

    /// Move the leased run `running -> processing` once raw output is in hand.
    pub async fn begin_processing_at(
        &self,
        job_id: &JobId,
        worker: &WorkerId,
        now: DateTime<Utc>,
    ) -> Result<Run> {
        let mut tx = self.db.pool.begin().await?;
        let job = held_job_in(&mut *tx, job_id, worker).await?;
        transition_run_in(
            &mut *tx,
            &job.run_id,
            RunStatus::Running,
            RunStatus::Processing,
            &RunUpdate::default(),
            now,
        )
        .await?;
        let run = get_run_in(&mut *tx, &job.run_id)
            .await?
            .ok_or_else(|| DbError::not_found(format!("run {}", job.run_id)))?;
        tx.commit().await?;
        Ok(run)
    }

    /// Successful completion: job acked and run `processing -> completed`.
    ///
    /// A run flagged for cancellation or past its deadline is settled as
    /// cancelled or timed out instead. Stored findings stay either way. The
    /// returned run carries the final status.
    pub async fn ack_at(&self, job_id: &JobId, worker: &WorkerId, now: DateTime<Utc>) -> Result<Run> {
        let mut tx = self.db.pool.begin().await?;
        let job = held_job_in(&mut *tx, job_id, worker).await?;
        let run = get_run_in(&mut *tx, &job.run_id)
            .await?
            .ok_or_else(|| DbError::not_found(format!("run {}", job.run_id)))?;

        if let Some(reason) = late_stop(&run, now) {
            let outcome = self
                .settle_in(&mut *tx, &job, &run, &reason, JobState::Failed, now)
                .await?;
            let run = get_run_in(&mut *tx, &job.run_id)
                .await?
                .ok_or_else(|| DbError::not_found(format!("run {}", job.run_id)))?;
            tx.commit().await?;

            warn!(
                job_id = %job_id,
                run_id = %run.id,
                outcome = ?outcome,
                "Ack refused, run was stopped during processing"
            );
            return Ok(run);
        }

        close_job_in(&mut *tx, job_id, JobState::Acked, None, now).await?;
        transition_run_in(
            &mut *tx,
            &job.run_id,
            RunStatus::Processing,
            RunStatus::Completed,
            &RunUpdate::default(),
            now,
        )
        .await?;
        let run = get_run_in(&mut *tx, &job.run_id)
            .await?
            .ok_or_else(|| DbError::not_found(format!("run {}", job.run_id)))?;
        tx.commit().await?;

        info!(job_id = %job_id, run_id = %run.id, "Job acked, run completed");
        Ok(run)
    }

    /// Give a job back. Transient failures with attempts left requeue the run
    /// with backoff; everything else finalizes it.
    pub async fn nack_at(
        &self,
        job_id: &JobId,
        worker: &WorkerId,
        reason: NackReason,
        now: DateTime<Utc>,
    ) -> Result<NackOutcome> {
        let mut tx = self.db.pool.begin().await?;
        let job = held_job_in(&mut *tx, job_id, worker).await?;
        let run = get_run_in(&mut *tx, &job.run_id)
            .await?
            .ok_or_else(|| DbError::not_found(format!("run {}", job.run_id)))?;

        let outcome = self
            .settle_in(&mut *tx, &job, &run, &reason, JobState::Failed, now)
            .await?;
        tx.commit().await?;

        info!(
            job_id = %job_id,
            run_id = %run.id,
            kind = %reason.kind,
            outcome = ?outcome,
            "Job nacked"
        );
        Ok(outcome)
    }

    /// Close every lease whose visibility deadline has passed.
    pub async fn reclaim_expired(&self) -> Result<ReclaimReport> {
        self.reclaim_expired_at(Utc::now()).await
    }

    pub async fn reclaim_expired_at(&self, now: DateTime<Utc>) -> Result<ReclaimReport> {
        let now_ms = to_millis(now);
        let rows = sqlx::query(
            "SELECT * FROM jobs WHERE state = 'leased' AND lease_deadline <= ? ORDER BY lease_deadline ASC",
        )
        .bind(now_ms)
        .fetch_all(&self.db.pool)
        .await?;

        let mut report = ReclaimReport::default();
        for row in &rows {
            let job = job_from_row(row)?;
            let mut tx = self.db.pool.begin().await?;

            let claimed = sqlx::query(
                r#"
                UPDATE jobs SET state = 'expired', finished_at = ?, last_error = 'lease expired'
                WHERE id = ? AND state = 'leased' AND lease_deadline <= ?
                "#,
            )
            .bind(now_ms)
            .bind(job.id.as_str())
            .bind(now_ms)
            .execute(&mut *tx)
            .await?
            .rows_affected();
            if claimed == 0 {
                // Renewed, acked or reclaimed concurrently.
                tx.rollback().await?;
                continue;
            }

            let Some(run) = get_run_in(&mut *tx, &job.run_id).await? else {
                tx.commit().await?;
                continue;
            };

            let reason = if run.cancel_requested {
                NackReason::new(
                    FailureKind::Cancelled,
                    vigil_protocol::defaults::CANCELLED_BY_USER_MESSAGE,
                )
            } else {
                NackReason::new(
                    FailureKind::LeaseExpired,
                    format!(
                        "lease held by {} expired",
                        job.lease_owner.as_ref().map(|w| w.as_str()).unwrap_or("unknown")
                    ),
                )
            };
            let outcome = self
                .settle_in(&mut *tx, &job, &run, &reason, JobState::Expired, now)
                .await?;
            tx.commit().await?;

            warn!(
                job_id = %job.id,
                run_id = %run.id,
                outcome = ?outcome,
                "Reclaimed expired lease"
            );
            report.reclaimed.push((job.id, run.id, outcome));
        }
        Ok(report)
    }

    /// Finalize a run that is waiting in the queue (user cancel or deadline).
    /// Pending jobs for the run are cancelled in the same transaction.
    pub async fn finalize_queued_at(
        &self,
        run_id: &RunId,
        to: RunStatus,
        update: RunUpdate,
        now: DateTime<Utc>,
    ) -> Result<Run> {
        let mut tx = self.db.pool.begin().await?;
        transition_run_in(&mut *tx, run_id, RunStatus::Queued, to, &update, now).await?;
        sqlx::query(
            r#"
            UPDATE jobs SET state = 'cancelled', finished_at = ?
            WHERE run_id = ? AND state = 'pending'
            "#,
        )
        .bind(to_millis(now))
        .bind(run_id.as_str())
        .execute(&mut *tx)
        .await?;
        let run = get_run_in(&mut *tx, run_id)
            .await?
            .ok_or_else(|| DbError::not_found(format!("run {}", run_id)))?;
        tx.commit().await?;
        Ok(run)
    }

    pub async fn jobs_for_run(&self, run_id: &RunId) -> Result<Vec<Job>> {
        let rows = sqlx::query("SELECT * FROM jobs WHERE run_id = ? ORDER BY attempt ASC")
            .bind(run_id.as_str())
            .fetch_all(&self.db.pool)
            .await?;
        rows.iter().map(job_from_row).collect()
    }

    pub async fn get_job(&self, job_id: &JobId) -> Result<Option<Job>> {
        let row = sqlx::query("SELECT * FROM jobs WHERE id = ?")
            .bind(job_id.as_str())
            .fetch_optional(&self.db.pool)
            .await?;
        row.as_ref().map(job_from_row).transpose()
    }

    pub async fn list_dead_letters(&self) -> Result<Vec<DeadLetter>> {
        let rows = sqlx::query("SELECT * FROM dead_letters ORDER BY id ASC")
            .fetch_all(&self.db.pool)
            .await?;
        rows.iter().map(dead_letter_from_row).collect()
    }

    pub async fn stats(&self) -> Result<QueueStats> {
        let row = sqlx::query(
            r#"
            SELECT
                COUNT(*) FILTER (WHERE state = 'pending') AS pending,
                COUNT(*) FILTER (WHERE state = 'leased') AS leased,
                COUNT(*) FILTER (WHERE state = 'acked') AS acked,
                COUNT(*) FILTER (WHERE state = 'failed') AS failed,
                COUNT(*) FILTER (WHERE state = 'expired') AS expired,
                COUNT(*) FILTER (WHERE state = 'dead_letter') AS dead_letter,
                COUNT(*) FILTER (WHERE state = 'cancelled') AS cancelled
            FROM jobs
            "#,
        )
        .fetch_one(&self.db.pool)
        .await?;

        Ok(QueueStats {
            pending: row.try_get("pending")?,
            leased: row.try_get("leased")?,
            acked: row.try_get("acked")?,
            failed: row.try_get("failed")?,
            expired: row.try_get("expired")?,
            dead_letter: row.try_get("dead_letter")?,
            cancelled: row.try_get("cancelled")?,
        })
    }

    /// Shared tail of nack and reclaim. The job row has already been checked
    /// (nack) or moved to `expired` (reclaim) by the caller.
    async fn settle_in(
        &self,
        conn: &mut SqliteConnection,
        job: &Job,
        run: &Run,
        reason: &NackReason,
        retry_job_state: JobState,
        now: DateTime<Utc>,
    ) -> Result<NackOutcome> {
        if run.status.is_terminal() {
            close_job_in(conn, &job.id, retry_job_state, Some(&reason.message), now).await?;
            return Ok(NackOutcome::Discarded);
        }

        // A flagged run never goes back to the queue; leases skip it.
        if reason.kind == FailureKind::Cancelled
            || (run.cancel_requested && reason.kind.is_transient())
        {
            let message = if reason.kind == FailureKind::Cancelled {
                reason.message.clone()
            } else {
                vigil_protocol::defaults::CANCELLED_BY_USER_MESSAGE.to_string()
            };
            close_job_in(conn, &job.id, JobState::Cancelled, Some(&message), now).await?;
            transition_run_in(
                conn,
                &run.id,
                run.status,
                RunStatus::Cancelled,
                &RunUpdate::cancelled(message),
                now,
            )
            .await?;
            return Ok(NackOutcome::Cancelled);
        }

        let kind = if reason.kind.is_transient() && run.is_past_deadline(now) {
            FailureKind::Timeout
        } else {
            reason.kind
        };
        let message = if kind == reason.kind {
            reason.message.clone()
        } else {
            format!("run exceeded its {}s timeout", run.timeout_secs)
        };

        if kind.is_transient() && run.attempt < run.max_attempts {
            close_job_in(conn, &job.id, retry_job_state, Some(&message), now).await?;
            transition_run_in(
                conn,
                &run.id,
                run.status,
                RunStatus::Queued,
                &RunUpdate::reason(message),
                now,
            )
            .await?;
            sqlx::query("UPDATE runs SET attempt = attempt + 1 WHERE id = ?")
                .bind(run.id.as_str())
                .execute(&mut *conn)
                .await?;

            let attempt = run.attempt + 1;
            let available_at = now + to_chrono(jittered(self.policy.base_delay(attempt)));
            insert_job_in(conn, &run.id, attempt, run.priority, available_at, now).await?;
            return Ok(NackOutcome::Requeued {
                attempt,
                available_at,
            });
        }

        close_job_in(conn, &job.id, JobState::DeadLetter, Some(&message), now).await?;
        sqlx::query(
            r#"
            INSERT INTO dead_letters (job_id, run_id, attempt, failure_kind, reason, moved_at)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(job.id.as_str())
        .bind(run.id.as_str())
        .bind(i64::from(job.attempt))
        .bind(kind.as_str())
        .bind(&message)
        .bind(to_millis(now))
        .execute(&mut *conn)
        .await?;
        transition_run_in(
            conn,
            &run.id,
            run.status,
            RunStatus::Failed,
            &RunUpdate::failed(kind, message),
            now,
        )
        .await?;
        Ok(NackOutcome::DeadLettered { failure_kind: kind })
    }
}

async fn active_job_in(conn: &mut SqliteConnection, run_id: &RunId) -> Result<Option<Job>> {
    let row = sqlx::query("SELECT * FROM jobs WHERE run_id = ? AND state IN ('pending', 'leased')")
        .bind(run_id.as_str())
        .fetch_optional(&mut *conn)
        .await?;
    row.as_ref().map(job_from_row).transpose()
}

async fn insert_job_in(
    conn: &mut SqliteConnection,
    run_id: &RunId,
    attempt: u32,
    priority: i32,
    available_at: DateTime<Utc>,
    now: DateTime<Utc>,
) -> Result<Job> {
    let id = JobId::new();
    let row = sqlx::query(
        r#"
        INSERT INTO jobs (id, run_id, attempt, priority, state, available_at, created_at)
        VALUES (?, ?, ?, ?, 'pending', ?, ?)
        RETURNING *
        "#,
    )
    .bind(id.as_str())
    .bind(run_id.as_str())
    .bind(i64::from(attempt))
    .bind(i64::from(priority))
    .bind(to_millis(available_at))
    .bind(to_millis(now))
    .fetch_one(&mut *conn)
    .await?;
    job_from_row(&row)
}

/// The job, if `worker` still owns its lease.
async fn held_job_in(conn: &mut SqliteConnection, job_id: &JobId, worker: &WorkerId) -> Result<Job> {
    let row = sqlx::query("SELECT * FROM jobs WHERE id = ? AND state = 'leased' AND lease_owner = ?")
        .bind(job_id.as_str())
        .bind(worker.as_str())
        .fetch_optional(&mut *conn)
        .await?;
    match row {
        Some(row) => job_from_row(&row),
        None => Err(lease_lost(job_id, worker)),
    }
}

async fn close_job_in(
    conn: &mut SqliteConnection,
    job_id: &JobId,
    state: JobState,
    error: Option<&str>,
    now: DateTime<Utc>,
) -> Result<()> {
    sqlx::query(
        r#"
        UPDATE jobs SET state = ?, finished_at = ?, last_error = COALESCE(?, last_error)
        WHERE id = ?
        "#,
    )
    .bind(state.as_str())
    .bind(to_millis(now))
    .bind(error)
    .bind(job_id.as_str())
    .execute(&mut *conn)
    .await?;
    Ok(())
}

/// Cancel or deadline that outranks a successful ack.
fn late_stop(run: &Run, now: DateTime<Utc>) -> Option<NackReason> {
    if run.cancel_requested {
        Some(NackReason::new(
            FailureKind::Cancelled,
            vigil_protocol::defaults::CANCELLED_BY_USER_MESSAGE,
        ))
    } else if run.is_past_deadline(now) {
        Some(NackReason::new(
            FailureKind::Timeout,
            format!("run exceeded its {}s timeout", run.timeout_secs),
        ))
    } else {
        None
    }
}

fn lease_lost(job_id: &JobId, worker: &WorkerId) -> DbError {
    DbError::LeaseLost {
        job_id: job_id.clone(),
        worker: worker.clone(),
    }
}

fn jittered(base: Duration) -> Duration {
    if base.is_zero() {
        return base;
    }
    let factor = rand::thread_rng().gen_range((1.0 - BACKOFF_JITTER)..=(1.0 + BACKOFF_JITTER));
    base.mul_f64(factor)
}

fn to_chrono(duration: Duration) -> ChronoDuration {
    ChronoDuration::from_std(duration).unwrap_or_else(|_| ChronoDuration::days(3650))
}
