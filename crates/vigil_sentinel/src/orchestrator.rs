//! Run Orchestrator
//!
//! Entry point for everything a client does with runs: create, inspect,
//! cancel, follow logs, read results. Status writes go through the database
//! state machine; this layer decides which edge to take.
//!
//! Design principles:
//! - A run is only queued when its target is authorized and has a scope;
//!   otherwise it is failed on the spot with an authorization error
//! - Cancellation of a queued run is immediate; an executing run gets the
//!   durable cancel flag plus a direct signal to a local executor
//! - Log streams replay from the table and then follow live appends; they end
//!   once the run is terminal and every line has been delivered

use async_stream::try_stream;
use chrono::Utc;
use futures::Stream;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, Notify};
use tracing::{debug, info, warn};
use vigil_db::{DbError, JobQueue, NewRun, QueueStats, RunUpdate, VigilDb};
use vigil_protocol::defaults::CANCELLED_BY_USER_MESSAGE;
use vigil_protocol::{
    Artifact, AuditEvent, AuditKind, DeadLetter, FailureKind, Finding, InvalidTransition, LogLine,
    ProjectId, Run, RunConfig, RunId, RunStatus, SuiteId, TargetId,
};
use vigil_security::AuthorizationService;
use vigil_worker::{CancelReason, CancellationRegistry};

use crate::config::RunDefaults;

/// Log lines fetched per query while streaming.
const LOG_BATCH: u32 = 500;

/// Fallback wake-up for log followers when no append notification arrives.
const DEFAULT_LOG_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Attempts at cancelling a run that keeps changing state underneath us.
const CANCEL_RACE_RETRIES: usize = 3;

#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("run {0} not found")]
    RunNotFound(RunId),

    #[error("target {0} not found")]
    TargetNotFound(TargetId),

    #[error("suite {0} not found")]
    SuiteNotFound(SuiteId),

    #[error("target {target_id} does not belong to project {project_id}")]
    ProjectMismatch {
        target_id: TargetId,
        project_id: ProjectId,
    },

    #[error("invalid run request: {0}")]
    InvalidRequest(String),

    /// The run was recorded as failed; it never reached the queue.
    #[error("authorization error for run {run_id}: {reason}")]
    Authorization { run_id: RunId, reason: String },

    #[error(transparent)]
    InvalidTransition(#[from] InvalidTransition),

    #[error(transparent)]
    Db(DbError),
}

impl From<DbError> for OrchestratorError {
    fn from(err: DbError) -> Self {
        match err {
            DbError::InvalidTransition(t) => OrchestratorError::InvalidTransition(t),
            other => OrchestratorError::Db(other),
        }
    }
}

/// Client request to start a run.
#[derive(Debug, Clone)]
pub struct CreateRunRequest {
    pub project_id: ProjectId,
    pub target_id: TargetId,
    pub suite_id: SuiteId,
    pub config: RunConfig,
    pub safe_mode: bool,
    /// Requests per minute; the node default when unset.
    pub rate_limit: Option<u32>,
    pub created_by: String,
}

impl CreateRunRequest {
    /// Safe mode on, node defaults for everything else.
    pub fn new(
        project_id: ProjectId,
        target_id: TargetId,
        suite_id: SuiteId,
        created_by: impl Into<String>,
    ) -> Self {
        Self {
            project_id,
            target_id,
            suite_id,
            config: RunConfig::default(),
            safe_mode: true,
            rate_limit: None,
            created_by: created_by.into(),
        }
    }
}

pub struct RunOrchestrator {
    db: VigilDb,
    queue: JobQueue,
    auth: Arc<AuthorizationService>,
    cancellations: CancellationRegistry,
    work_available: Arc<Notify>,
    defaults: RunDefaults,
    log_poll_interval: Duration,
}

impl RunOrchestrator {
    pub fn new(
        queue: JobQueue,
        auth: Arc<AuthorizationService>,
        cancellations: CancellationRegistry,
        work_available: Arc<Notify>,
        defaults: RunDefaults,
    ) -> Self {
        Self {
            db: queue.db().clone(),
            queue,
            auth,
            cancellations,
            work_available,
            defaults,
            log_poll_interval: DEFAULT_LOG_POLL_INTERVAL,
        }
    }

    pub fn with_log_poll_interval(mut self, interval: Duration) -> Self {
        self.log_poll_interval = interval;
        self
    }

    pub fn db(&self) -> &VigilDb {
        &self.db
    }

    pub fn queue(&self) -> &JobQueue {
        &self.queue
    }

    // ========================================================================
    // Commands
    // ========================================================================

    /// Record a run and queue its first attempt.
    ///
    /// Request validation errors leave no trace. Once the run row exists, a
    /// missing authorization fails it with `authorization_error` and returns
    /// [`OrchestratorError::Authorization`].
    pub async fn create_run(&self, request: CreateRunRequest) -> Result<Run, OrchestratorError> {
        let rate_limit = request
            .rate_limit
            .unwrap_or(self.defaults.rate_limit_per_minute);
        if rate_limit == 0 || rate_limit > self.defaults.max_rate_limit_per_minute {
            return Err(OrchestratorError::InvalidRequest(format!(
                "rate_limit must be within 1..={} requests per minute",
                self.defaults.max_rate_limit_per_minute
            )));
        }
        if request.config.timeout_secs == Some(0) {
            return Err(OrchestratorError::InvalidRequest(
                "timeout_secs must be positive".to_string(),
            ));
        }
        if request.config.max_attempts == Some(0) {
            return Err(OrchestratorError::InvalidRequest(
                "max_attempts must be at least 1".to_string(),
            ));
        }
        if request.created_by.trim().is_empty() {
            return Err(OrchestratorError::InvalidRequest(
                "created_by is required".to_string(),
            ));
        }

        let target = self
            .db
            .get_target(&request.target_id)
            .await?
            .ok_or_else(|| OrchestratorError::TargetNotFound(request.target_id.clone()))?;
        if target.project_id != request.project_id {
            return Err(OrchestratorError::ProjectMismatch {
                target_id: target.id,
                project_id: request.project_id,
            });
        }
        let suite = self
            .db
            .get_suite(&request.suite_id)
            .await?
            .ok_or_else(|| OrchestratorError::SuiteNotFound(request.suite_id.clone()))?;

        let now = Utc::now();
        let run = self
            .db
            .insert_run(&NewRun {
                id: RunId::new(),
                project_id: request.project_id,
                target_id: target.id.clone(),
                suite_id: suite.id,
                suite_kind: suite.kind,
                max_attempts: request
                    .config
                    .max_attempts
                    .unwrap_or(self.queue.policy().max_attempts),
                timeout_secs: request
                    .config
                    .timeout_secs
                    .unwrap_or(self.defaults.timeout_secs),
                priority: request.config.priority,
                config: request.config,
                safe_mode: request.safe_mode,
                rate_limit,
                created_by: request.created_by,
                created_at: now,
            })
            .await?;

        let refusal = if target.scope.is_empty() {
            Some("target has an empty scope".to_string())
        } else if !self.auth.is_authorized(&target.id, now).await? {
            Some(format!(
                "target {} has no valid authorization (status {})",
                target.id, target.verification_status
            ))
        } else {
            None
        };

        if let Some(reason) = refusal {
            self.db
                .transition_run(
                    &run.id,
                    RunStatus::Created,
                    RunStatus::Failed,
                    RunUpdate::failed(FailureKind::Authorization, reason.clone()),
                    now,
                )
                .await?;
            self.db
                .record_audit(
                    Some(&run.id),
                    Some(&target.id),
                    AuditKind::AuthorizationDenied,
                    &reason,
                    now,
                )
                .await?;
            warn!(run_id = %run.id, target_id = %target.id, "Run refused: {}", reason);
            return Err(OrchestratorError::Authorization {
                run_id: run.id,
                reason,
            });
        }

        self.queue.enqueue_at(&run.id, now).await?;
        self.work_available.notify_one();
        info!(
            run_id = %run.id,
            target_id = %target.id,
            suite = %run.suite_kind,
            safe_mode = run.safe_mode,
            "Run queued"
        );
        self.get_run(&run.id).await
    }

    /// Cancel a queued or executing run.
    ///
    /// A queued run is cancelled immediately. An executing run is flagged and
    /// returned as-is; its executor stops it within one poll interval and keeps
    /// what it had produced.
    pub async fn cancel_run(
        &self,
        run_id: &RunId,
        requested_by: &str,
    ) -> Result<Run, OrchestratorError> {
        for _ in 0..CANCEL_RACE_RETRIES {
            let now = Utc::now();
            let run = self.get_run(run_id).await?;
            run.status.check_transition(RunStatus::Cancelled)?;

            if run.status == RunStatus::Queued {
                match self
                    .queue
                    .finalize_queued_at(
                        run_id,
                        RunStatus::Cancelled,
                        RunUpdate::cancelled(CANCELLED_BY_USER_MESSAGE),
                        now,
                    )
                    .await
                {
                    Ok(run) => {
                        self.audit_cancel(&run, requested_by).await;
                        info!(run_id = %run_id, "Queued run cancelled");
                        return Ok(run);
                    }
                    Err(e) if e.is_conflict() => {
                        debug!(run_id = %run_id, "Run left the queue during cancel, retrying");
                        continue;
                    }
                    Err(e) => return Err(e.into()),
                }
            }

            if self.db.request_cancel(run_id, now).await? {
                self.cancellations.cancel(run_id, CancelReason::User);
                self.audit_cancel(&run, requested_by).await;
                info!(run_id = %run_id, status = %run.status, "Cancellation requested");
                return self.get_run(run_id).await;
            }
        }

        // Still moving after every retry: report where it ended up.
        let run = self.get_run(run_id).await?;
        Err(InvalidTransition {
            from: run.status,
            to: RunStatus::Cancelled,
        }
        .into())
    }

    async fn audit_cancel(&self, run: &Run, requested_by: &str) {
        let detail = format!("cancel requested by {}", requested_by);
        if let Err(e) = self
            .db
            .record_audit(
                Some(&run.id),
                Some(&run.target_id),
                AuditKind::RunCancelled,
                &detail,
                Utc::now(),
            )
            .await
        {
            warn!(run_id = %run.id, "Failed to record audit event: {}", e);
        }
    }

    // ========================================================================
    // Queries
    // ========================================================================

    /// Current state of a run, including the terminal reason once it has one.
    pub async fn get_run(&self, run_id: &RunId) -> Result<Run, OrchestratorError> {
        self.db
            .get_run(run_id)
            .await?
            .ok_or_else(|| OrchestratorError::RunNotFound(run_id.clone()))
    }

    pub async fn list_runs(
        &self,
        project_id: Option<&ProjectId>,
        status: Option<RunStatus>,
    ) -> Result<Vec<Run>, OrchestratorError> {
        Ok(self.db.list_runs(project_id, status).await?)
    }

    pub async fn list_findings(&self, run_id: &RunId) -> Result<Vec<Finding>, OrchestratorError> {
        self.get_run(run_id).await?;
        Ok(self.db.list_findings(run_id).await?)
    }

    pub async fn list_artifacts(&self, run_id: &RunId) -> Result<Vec<Artifact>, OrchestratorError> {
        self.get_run(run_id).await?;
        Ok(self.db.list_artifacts(run_id).await?)
    }

    pub async fn audit_trail(&self, run_id: &RunId) -> Result<Vec<AuditEvent>, OrchestratorError> {
        self.get_run(run_id).await?;
        Ok(self.db.list_audit_for_run(run_id).await?)
    }

    pub async fn dead_letters(&self) -> Result<Vec<DeadLetter>, OrchestratorError> {
        Ok(self.queue.list_dead_letters().await?)
    }

    pub async fn queue_stats(&self) -> Result<QueueStats, OrchestratorError> {
        Ok(self.queue.stats().await?)
    }

    /// Every log line of the run in order, then live lines as they are
    /// appended. Ends once the run is terminal and fully delivered.
    pub fn stream_logs(
        &self,
        run_id: &RunId,
    ) -> impl Stream<Item = Result<LogLine, OrchestratorError>> + Send + 'static {
        let db = self.db.clone();
        let run_id = run_id.clone();
        let poll = self.log_poll_interval;

        try_stream! {
            let mut events = db.subscribe_logs();
            let mut cursor = 0i64;
            loop {
                // Executors flush logs before the terminal write, so reading
                // the status first guarantees the drain below is complete.
                let run = db
                    .get_run(&run_id)
                    .await?
                    .ok_or_else(|| OrchestratorError::RunNotFound(run_id.clone()))?;
                let terminal = run.status.is_terminal();

                loop {
                    let batch = db.logs_after(&run_id, cursor, LOG_BATCH).await?;
                    let drained = batch.len() < LOG_BATCH as usize;
                    for line in batch {
                        cursor = line.seq;
                        yield line;
                    }
                    if drained {
                        break;
                    }
                }

                if terminal {
                    break;
                }
                wait_for_append(&mut events, &run_id, poll).await;
            }
        }
    }
}

/// Wait until a line for `run_id` is announced, or `poll` passes.
async fn wait_for_append(
    events: &mut broadcast::Receiver<RunId>,
    run_id: &RunId,
    poll: Duration,
) {
    let announced = async {
        loop {
            match events.recv().await {
                Ok(id) if &id == run_id => return,
                Ok(_) => continue,
                // Missed notifications; the caller re-reads the table anyway.
                Err(RecvError::Lagged(_)) => return,
                Err(RecvError::Closed) => {
                    tokio::time::sleep(poll).await;
                    return;
                }
            }
        }
    };
    let _ = tokio::time::timeout(poll, announced).await;
}
