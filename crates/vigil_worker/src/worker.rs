//! Worker Pool
//!
//! Design principles:
//! - N executors per pool, each leasing one job at a time from the shared queue
//! - Idle executors back off (doubling up to the poll interval) and wake early
//!   when the orchestrator signals new work
//! - The adapter future runs under a supervisor loop that renews the lease,
//!   enforces the run deadline and watches for cancellation or lost authorization
//! - Cancellation is cooperative first; after the grace period the adapter
//!   future is dropped
//! - Panics inside an adapter are caught and reported as worker crashes
//! - Graceful shutdown via watch channel: executors finish their current job

use anyhow::Result;
use chrono::Utc;
use futures::FutureExt;
use serde_json::Value;
use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};
use vigil_db::{DbError, JobQueue, Lease, NackOutcome, NackReason};
use vigil_protocol::defaults;
use vigil_protocol::{
    Artifact, ArtifactId, ArtifactKind, AuditKind, FailureKind, Finding, Job, JobId, LogLevel,
    ResourceLimits, Run, RunId, RunStatus, Target, WorkerId,
};
use vigil_security::{AuthorizationService, ScopeGuard};

use crate::adapters::{merge_config, AdapterError, SuiteAdapter};
use crate::artifact_store::{put_with_retry, ArtifactStore};
use crate::cancel::{CancelReason, CancellationRegistry, CancellationToken};
use crate::egress::GuardedEgress;
use crate::log_sink::{spawn_log_writer, LogSink};
use crate::normalizer::{FindingsNormalizer, NormalizeMode};
use crate::sandbox::{ArtifactPayload, ScanContext, ScanOutput};

// ============================================================================
// Error Types
// ============================================================================

/// Errors that stop an executor from settling an attempt itself. The lease then
/// runs out and the queue reclaims the job.
#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("Database error: {0}")]
    Db(#[from] DbError),

    #[error("Invalid worker configuration: {0}")]
    Config(String),
}

// ============================================================================
// Constants
// ============================================================================

/// Shortest idle wait between empty polls.
const IDLE_BACKOFF_FLOOR: Duration = Duration::from_millis(25);

/// Name of the log transcript artifact stored with every attempt.
const LOG_ARTIFACT_NAME: &str = "scan.log";

/// Worker configuration (plain data)
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Executor ids are `<pool_name>-<index>`.
    pub pool_name: String,
    pub executors: usize,
    pub visibility_timeout: Duration,
    /// Supervisor tick and upper bound of the idle backoff.
    pub poll_interval: Duration,
    /// How long a cancelled adapter gets to stop on its own.
    pub cancel_grace: Duration,
    pub limits: ResourceLimits,
    pub storage_retries: u32,
    pub storage_backoff: Duration,
    pub malformed_threshold: f64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            pool_name: "worker".to_string(),
            executors: defaults::DEFAULT_WORKER_COUNT,
            visibility_timeout: Duration::from_secs(defaults::DEFAULT_VISIBILITY_TIMEOUT_SECS),
            poll_interval: Duration::from_millis(defaults::DEFAULT_POLL_INTERVAL_MS),
            cancel_grace: Duration::from_millis(defaults::DEFAULT_CANCEL_GRACE_MS),
            limits: ResourceLimits::default(),
            storage_retries: defaults::DEFAULT_STORAGE_RETRIES,
            storage_backoff: Duration::from_millis(defaults::DEFAULT_STORAGE_BACKOFF_MS),
            malformed_threshold: defaults::DEFAULT_MALFORMED_THRESHOLD,
        }
    }
}

/// Services shared by every executor in a process.
#[derive(Clone)]
pub struct WorkerContext {
    pub queue: JobQueue,
    pub auth: Arc<AuthorizationService>,
    pub guard: Arc<ScopeGuard>,
    pub store: Arc<dyn ArtifactStore>,
    pub cancellations: CancellationRegistry,
    /// Signalled when a run is queued.
    pub work_available: Arc<Notify>,
}

/// How an attempt ended, from the executor's side.
#[derive(Debug, Clone, PartialEq)]
pub enum AttemptOutcome {
    Completed { findings: usize },
    Nacked(NackOutcome),
    /// Another worker owns the job now; nothing was settled.
    LeaseLost,
}

#[derive(Debug, Clone)]
pub struct AttemptReport {
    pub job_id: JobId,
    pub run_id: RunId,
    pub outcome: AttemptOutcome,
}

/// Handle for controlling a running pool
pub struct WorkerHandle {
    shutdown_tx: watch::Sender<bool>,
    join_handles: Vec<JoinHandle<()>>,
}

impl WorkerHandle {
    pub fn executor_count(&self) -> usize {
        self.join_handles.len()
    }

    /// Request graceful shutdown and wait for in-flight attempts to settle.
    pub async fn shutdown(self) -> Result<()> {
        let _ = self.shutdown_tx.send(true);
        info!(
            "Shutdown requested, waiting for {} executors...",
            self.join_handles.len()
        );
        for handle in self.join_handles {
            if let Err(e) = handle.await {
                warn!("Executor task panicked during shutdown: {:?}", e);
            }
        }
        info!("Worker pool stopped");
        Ok(())
    }
}

pub struct WorkerPool;

impl WorkerPool {
    /// Spawn `config.executors` executors.
    pub fn start(config: WorkerConfig, ctx: WorkerContext) -> Result<WorkerHandle, WorkerError> {
        if config.executors == 0 {
            return Err(WorkerError::Config("executors must be at least 1".to_string()));
        }
        if config.visibility_timeout.is_zero() {
            return Err(WorkerError::Config("visibility timeout must be positive".to_string()));
        }

        let config = Arc::new(config);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let mut join_handles = Vec::with_capacity(config.executors);
        for index in 0..config.executors {
            let id = WorkerId::for_executor(&config.pool_name, index)
                .map_err(|e| WorkerError::Config(e.to_string()))?;
            let executor = Executor::new(id, Arc::clone(&config), ctx.clone());
            join_handles.push(tokio::spawn(executor.run(shutdown_rx.clone())));
        }
        info!(
            pool = %config.pool_name,
            executors = config.executors,
            "Worker pool started"
        );
        Ok(WorkerHandle {
            shutdown_tx,
            join_handles,
        })
    }
}

/// What the executor decided to report for an attempt.
enum Settle {
    Ack { findings: usize },
    Nack(NackReason),
    LeaseLost,
}

/// How the supervised adapter future ended.
enum ScanEnd {
    Finished(std::result::Result<(), AdapterError>),
    Panicked(String),
    Cancelled,
    LeaseLost,
}

pub struct Executor {
    id: WorkerId,
    config: Arc<WorkerConfig>,
    ctx: WorkerContext,
    normalizer: FindingsNormalizer,
}

impl Executor {
    pub fn new(id: WorkerId, config: Arc<WorkerConfig>, ctx: WorkerContext) -> Self {
        let normalizer = FindingsNormalizer::new(config.malformed_threshold);
        Self {
            id,
            config,
            ctx,
            normalizer,
        }
    }

    pub fn id(&self) -> &WorkerId {
        &self.id
    }

    /// Main loop - consumes self (can only be called once)
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        info!(worker = %self.id, "Executor started");
        let ceiling = self.config.poll_interval.max(IDLE_BACKOFF_FLOOR);
        let mut idle = IDLE_BACKOFF_FLOOR;

        loop {
            if *shutdown.borrow() {
                break;
            }

            match self.run_once().await {
                Ok(Some(report)) => {
                    debug!(worker = %self.id, outcome = ?report.outcome, "Attempt settled");
                    idle = IDLE_BACKOFF_FLOOR;
                    continue;
                }
                Ok(None) => {}
                Err(e) => error!(worker = %self.id, "Executor error: {}", e),
            }

            tokio::select! {
                biased;

                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                _ = self.ctx.work_available.notified() => {
                    idle = IDLE_BACKOFF_FLOOR;
                }
                _ = tokio::time::sleep(idle) => {
                    idle = (idle * 2).min(ceiling);
                }
            }
        }

        info!(worker = %self.id, "Executor stopped");
    }

    /// Lease and execute at most one job.
    pub async fn run_once(&self) -> std::result::Result<Option<AttemptReport>, WorkerError> {
        let Some(lease) = self
            .ctx
            .queue
            .lease(&self.id, self.config.visibility_timeout)
            .await?
        else {
            return Ok(None);
        };
        self.execute(lease).await.map(Some)
    }

    /// Execute one leased attempt through to ack or nack.
    pub async fn execute(&self, lease: Lease) -> std::result::Result<AttemptReport, WorkerError> {
        let Lease { job, run } = lease;
        let db = self.ctx.queue.db().clone();
        let token = self.ctx.cancellations.register(&run.id);

        let (log, log_writer) = spawn_log_writer(
            db.clone(),
            run.id.clone(),
            job.id.clone(),
            self.config.limits.max_log_lines,
            self.config.storage_retries,
            self.config.storage_backoff,
        );
        log.log(
            LogLevel::Info,
            format!(
                "Attempt {} of {} started on {}",
                job.attempt, run.max_attempts, self.id
            ),
        );

        let mut settled = self.drive(&job, &run, &token, &log).await;
        if let Ok(settle) = &settled {
            match settle {
                Settle::Ack { findings } => {
                    log.log(LogLevel::Info, format!("Scan finished with {} findings", findings))
                }
                Settle::Nack(reason) => log.log(
                    LogLevel::Error,
                    format!("Attempt failed ({}): {}", reason.kind, reason.message),
                ),
                Settle::LeaseLost => log.log(LogLevel::Warn, "Lease lost, abandoning attempt"),
            };
        }

        // Logs are flushed before the terminal transition so a follower that
        // sees the run end has already seen every line.
        let log_report = log_writer.finish().await;
        if log_report.failed > 0 {
            self.degrade(
                &run.id,
                &format!("{} log lines could not be stored", log_report.failed),
            )
            .await;
        }
        if !matches!(settled, Ok(Settle::LeaseLost)) {
            let transcript = ArtifactPayload {
                kind: ArtifactKind::Log,
                name: LOG_ARTIFACT_NAME.to_string(),
                bytes: log.transcript().into_bytes(),
            };
            let stored = self
                .holding_lease(&job, self.store_artifacts(&job, &run, vec![transcript]))
                .await;
            if stored.is_none() {
                warn!(job_id = %job.id, run_id = %run.id, "Lease lost while storing the transcript");
                settled = Ok(Settle::LeaseLost);
            }
        }

        let result = match settled {
            Ok(settle) => self.settle(&job, settle).await,
            Err(e) => Err(e),
        };
        self.ctx.cancellations.unregister(&run.id);

        let outcome = result?;
        Ok(AttemptReport {
            job_id: job.id,
            run_id: run.id,
            outcome,
        })
    }

    async fn settle(
        &self,
        job: &Job,
        settle: Settle,
    ) -> std::result::Result<AttemptOutcome, WorkerError> {
        let now = Utc::now();
        let result = match settle {
            Settle::Ack { findings } => self
                .ctx
                .queue
                .ack_at(&job.id, &self.id, now)
                .await
                .map(|run| match run.status {
                    RunStatus::Completed => AttemptOutcome::Completed { findings },
                    RunStatus::Cancelled => AttemptOutcome::Nacked(NackOutcome::Cancelled),
                    _ => AttemptOutcome::Nacked(NackOutcome::DeadLettered {
                        failure_kind: run.failure_kind.unwrap_or(FailureKind::Timeout),
                    }),
                }),
            Settle::Nack(reason) => self
                .ctx
                .queue
                .nack_at(&job.id, &self.id, reason, now)
                .await
                .map(AttemptOutcome::Nacked),
            Settle::LeaseLost => return Ok(AttemptOutcome::LeaseLost),
        };
        match result {
            Ok(outcome) => Ok(outcome),
            Err(e) if e.is_conflict() => {
                warn!(job_id = %job.id, worker = %self.id, "Could not settle attempt: {}", e);
                Ok(AttemptOutcome::LeaseLost)
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn drive(
        &self,
        job: &Job,
        run: &Run,
        token: &CancellationToken,
        log: &LogSink,
    ) -> std::result::Result<Settle, WorkerError> {
        let db = self.ctx.queue.db();

        let Some(target) = db.get_target(&run.target_id).await? else {
            return Ok(Settle::Nack(NackReason::new(
                FailureKind::Adapter,
                format!("target {} no longer exists", run.target_id),
            )));
        };

        // Authorization may have lapsed while the run sat in the queue.
        if !self.ctx.auth.is_authorized(&target.id, Utc::now()).await? {
            let detail = "target authorization missing or expired at execution";
            db.record_audit(
                Some(&run.id),
                Some(&target.id),
                AuditKind::AuthorizationDenied,
                detail,
                Utc::now(),
            )
            .await?;
            return Ok(Settle::Nack(NackReason::new(FailureKind::Authorization, detail)));
        }

        let adapter = match SuiteAdapter::for_kind(run.suite_kind) {
            Ok(adapter) => adapter,
            Err(e) => return Ok(Settle::Nack(NackReason::new(e.failure_kind(), e.to_string()))),
        };
        let defaults = db
            .get_suite(&run.suite_id)
            .await?
            .map(|suite| suite.defaults)
            .unwrap_or(Value::Null);
        let config = merge_config(&defaults, &run.config.suite);

        let egress = GuardedEgress::new(
            Arc::clone(&self.ctx.guard),
            db.clone(),
            target.clone(),
            run.clone(),
            job.id.clone(),
            token.clone(),
            log.clone(),
        );
        let scan_ctx = ScanContext::new(
            run.id.clone(),
            job.id.clone(),
            run.safe_mode,
            self.config.limits.clone(),
            Arc::new(egress),
            token.clone(),
            log.clone(),
        );

        let end = self
            .supervise(job, run, &target, &adapter, &config, &scan_ctx, token)
            .await;
        let output = scan_ctx.take_output();

        match end {
            ScanEnd::LeaseLost => {
                warn!(job_id = %job.id, run_id = %run.id, "Lease lost mid-scan");
                Ok(Settle::LeaseLost)
            }
            ScanEnd::Panicked(message) => {
                error!(job_id = %job.id, run_id = %run.id, "Adapter panicked: {}", message);
                Ok(Settle::Nack(NackReason::new(
                    FailureKind::WorkerCrash,
                    format!("adapter panicked: {}", message),
                )))
            }
            ScanEnd::Cancelled => {
                let reason = token.reason().unwrap_or(CancelReason::User);
                let (kind, message) = reason.failure();
                self.keep_partial(job, run, output).await;
                Ok(Settle::Nack(NackReason::new(kind, message)))
            }
            ScanEnd::Finished(Err(e)) => {
                let (kind, message) = match token.reason() {
                    Some(reason) => reason.failure(),
                    None => (e.failure_kind(), e.to_string()),
                };
                if !kind.is_transient() {
                    self.keep_partial(job, run, output).await;
                }
                Ok(Settle::Nack(NackReason::new(kind, message)))
            }
            ScanEnd::Finished(Ok(())) => {
                if let Some(breach) = output.limit_breach.clone() {
                    self.keep_partial(job, run, output).await;
                    return Ok(Settle::Nack(NackReason::new(FailureKind::ResourceLimit, breach)));
                }
                self.complete(job, run, output, token).await
            }
        }
    }

    /// Run the adapter while watching the lease, the deadline, cancellation
    /// and authorization.
    #[allow(clippy::too_many_arguments)]
    async fn supervise(
        &self,
        job: &Job,
        run: &Run,
        target: &Target,
        adapter: &SuiteAdapter,
        config: &Value,
        scan_ctx: &ScanContext,
        token: &CancellationToken,
    ) -> ScanEnd {
        let metered = scan_ctx.metered(adapter.run_scan(target, config, scan_ctx));
        let scan = AssertUnwindSafe(metered).catch_unwind();
        tokio::pin!(scan);

        let mut ticker = tokio::time::interval(self.config.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let renew_every = self.config.visibility_timeout / 3;
        let mut last_renew = Instant::now();

        // A run can be cancelled or out of time before its first tick.
        self.watch_run(run, target, token).await;

        loop {
            tokio::select! {
                biased;

                result = &mut scan => {
                    return match result {
                        Ok(result) => ScanEnd::Finished(result),
                        Err(panic) => ScanEnd::Panicked(panic_message(panic.as_ref())),
                    };
                }
                _ = token.cancelled() => break,
                _ = ticker.tick() => {
                    if last_renew.elapsed() >= renew_every {
                        match self
                            .ctx
                            .queue
                            .renew_at(&job.id, &self.id, self.config.visibility_timeout, Utc::now())
                            .await
                        {
                            Ok(_) => last_renew = Instant::now(),
                            Err(e) if e.is_conflict() => return ScanEnd::LeaseLost,
                            Err(e) => warn!(job_id = %job.id, "Lease renewal failed: {}", e),
                        }
                    }
                    self.watch_run(run, target, token).await;
                }
            }
        }

        info!(
            run_id = %run.id,
            reason = ?token.reason(),
            "Cancelling scan, grace period {:?}",
            self.config.cancel_grace
        );
        match tokio::time::timeout(self.config.cancel_grace, &mut scan).await {
            Ok(Ok(_)) => debug!(run_id = %run.id, "Adapter stopped within grace period"),
            Ok(Err(panic)) => warn!(
                run_id = %run.id,
                "Adapter panicked while stopping: {}",
                panic_message(panic.as_ref())
            ),
            Err(_) => warn!(run_id = %run.id, "Adapter ignored cancellation, dropping it"),
        }
        ScanEnd::Cancelled
    }

    /// Deadline, user cancel and authorization checks for a running attempt.
    async fn watch_run(&self, run: &Run, target: &Target, token: &CancellationToken) {
        if token.is_cancelled() {
            return;
        }
        let db = self.ctx.queue.db();
        let now = Utc::now();

        if run.is_past_deadline(now) {
            if token.cancel(CancelReason::Timeout) {
                let detail = format!("run exceeded its {}s timeout", run.timeout_secs);
                if let Err(e) = db
                    .record_audit(Some(&run.id), Some(&target.id), AuditKind::RunTimedOut, &detail, now)
                    .await
                {
                    warn!(run_id = %run.id, "Failed to record audit event: {}", e);
                }
            }
            return;
        }

        match db.is_cancel_requested(&run.id).await {
            Ok(true) => {
                token.cancel(CancelReason::User);
                return;
            }
            Ok(false) => {}
            Err(e) => warn!(run_id = %run.id, "Cancel check failed: {}", e),
        }

        match self.ctx.auth.is_authorized(&target.id, now).await {
            Ok(true) => {}
            Ok(false) => {
                if token.cancel(CancelReason::AuthorizationExpired) {
                    if let Err(e) = db
                        .record_audit(
                            Some(&run.id),
                            Some(&target.id),
                            AuditKind::AuthorizationDenied,
                            "authorization expired during the run",
                            now,
                        )
                        .await
                    {
                        warn!(run_id = %run.id, "Failed to record audit event: {}", e);
                    }
                }
            }
            Err(e) => warn!(run_id = %run.id, "Authorization check failed: {}", e),
        }
    }

    /// Normalize and store the output of a successful scan.
    ///
    /// The lease is renewed while storage runs. A cancel or deadline that
    /// lands in the meantime turns the ack into a nack; what was stored stays.
    async fn complete(
        &self,
        job: &Job,
        run: &Run,
        output: ScanOutput,
        token: &CancellationToken,
    ) -> std::result::Result<Settle, WorkerError> {
        match self
            .ctx
            .queue
            .begin_processing_at(&job.id, &self.id, Utc::now())
            .await
        {
            Ok(_) => {}
            Err(e) if e.is_conflict() => return Ok(Settle::LeaseLost),
            Err(e) => return Err(e.into()),
        }

        let Some(settle) = self.holding_lease(job, self.process(job, run, output)).await else {
            warn!(job_id = %job.id, run_id = %run.id, "Lease lost during processing");
            return Ok(Settle::LeaseLost);
        };
        if let Settle::Ack { .. } = settle {
            if let Some(reason) = self.late_stop(run, token).await {
                info!(run_id = %run.id, kind = %reason.kind, "Run stopped during processing");
                return Ok(Settle::Nack(reason));
            }
        }
        Ok(settle)
    }

    async fn process(&self, job: &Job, run: &Run, output: ScanOutput) -> Settle {
        let normalized = match self.normalizer.normalize(
            &run.id,
            Some(&job.id),
            &output.records,
            NormalizeMode::Strict,
        ) {
            Ok(normalized) => normalized,
            Err(e) => {
                self.store_artifacts(job, run, output.artifacts).await;
                return Settle::Nack(NackReason::new(FailureKind::Normalization, e.to_string()));
            }
        };
        if normalized.malformed > 0 {
            warn!(
                run_id = %run.id,
                malformed = normalized.malformed,
                total = normalized.total,
                "Skipped malformed raw records"
            );
        }

        if let Err(e) = self.store_findings(&normalized.findings).await {
            return Settle::Nack(NackReason::new(
                FailureKind::Storage,
                format!("findings could not be stored: {}", e),
            ));
        }
        self.store_artifacts(job, run, output.artifacts).await;
        Settle::Ack {
            findings: normalized.findings.len(),
        }
    }

    /// Cancel or deadline that arrived after the adapter returned.
    async fn late_stop(&self, run: &Run, token: &CancellationToken) -> Option<NackReason> {
        if !token.is_cancelled() {
            let now = Utc::now();
            if run.is_past_deadline(now) {
                if token.cancel(CancelReason::Timeout) {
                    let detail = format!("run exceeded its {}s timeout", run.timeout_secs);
                    if let Err(e) = self
                        .ctx
                        .queue
                        .db()
                        .record_audit(Some(&run.id), Some(&run.target_id), AuditKind::RunTimedOut, &detail, now)
                        .await
                    {
                        warn!(run_id = %run.id, "Failed to record audit event: {}", e);
                    }
                }
            } else {
                match self.ctx.queue.db().is_cancel_requested(&run.id).await {
                    Ok(true) => {
                        token.cancel(CancelReason::User);
                    }
                    Ok(false) => {}
                    Err(e) => warn!(run_id = %run.id, "Cancel check failed: {}", e),
                }
            }
        }
        token.reason().map(|reason| {
            let (kind, message) = reason.failure();
            NackReason::new(kind, message)
        })
    }

    /// Drive `work` to completion while renewing the lease. `None` if the
    /// lease moved to another worker first.
    async fn holding_lease<T>(&self, job: &Job, work: impl Future<Output = T>) -> Option<T> {
        tokio::pin!(work);
        let mut ticker =
            tokio::time::interval((self.config.visibility_timeout / 3).max(Duration::from_millis(1)));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately.
        ticker.tick().await;

        loop {
            tokio::select! {
                biased;

                output = &mut work => return Some(output),
                _ = ticker.tick() => {
                    match self
                        .ctx
                        .queue
                        .renew_at(&job.id, &self.id, self.config.visibility_timeout, Utc::now())
                        .await
                    {
                        Ok(_) => {}
                        Err(e) if e.is_conflict() => return None,
                        Err(e) => warn!(job_id = %job.id, "Lease renewal failed: {}", e),
                    }
                }
            }
        }
    }

    /// Keep whatever a stopped scan produced.
    async fn keep_partial(
        &self,
        job: &Job,
        run: &Run,
        output: ScanOutput,
    ) {
        match self.normalizer.normalize(
            &run.id,
            Some(&job.id),
            &output.records,
            NormalizeMode::Lenient,
        ) {
            Ok(normalized) => {
                if let Err(e) = self.store_findings(&normalized.findings).await {
                    self.degrade(&run.id, &format!("partial findings not stored: {}", e))
                        .await;
                }
            }
            Err(e) => {
                self.degrade(&run.id, &format!("partial findings dropped: {}", e))
                    .await
            }
        }
        self.store_artifacts(job, run, output.artifacts).await;
    }

    async fn store_findings(&self, findings: &[Finding]) -> std::result::Result<(), DbError> {
        if findings.is_empty() {
            return Ok(());
        }
        let db = self.ctx.queue.db();
        let mut attempt = 0;
        loop {
            match db.upsert_findings(findings).await {
                Ok(_) => return Ok(()),
                Err(e) if attempt < self.config.storage_retries => {
                    attempt += 1;
                    warn!(attempt, "Findings upsert failed, retrying: {}", e);
                    tokio::time::sleep(self.config.storage_backoff * attempt).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Upload artifacts and record their references. Failures mark the run
    /// degraded; they never fail it.
    async fn store_artifacts(&self, job: &Job, run: &Run, artifacts: Vec<ArtifactPayload>) {
        let db = self.ctx.queue.db();
        for payload in artifacts {
            let stored = put_with_retry(
                self.ctx.store.as_ref(),
                &run.id,
                &job.id,
                &payload.name,
                &payload.bytes,
                self.config.storage_retries,
                self.config.storage_backoff,
            )
            .await;
            let storage_ref = match stored {
                Ok(storage_ref) => storage_ref,
                Err(e) => {
                    self.degrade(
                        &run.id,
                        &format!("artifact {} not stored: {}", payload.name, e),
                    )
                    .await;
                    continue;
                }
            };
            let artifact = Artifact {
                id: ArtifactId::new(),
                run_id: run.id.clone(),
                job_id: job.id.clone(),
                kind: payload.kind,
                name: payload.name.clone(),
                storage_ref,
                size_bytes: payload.bytes.len() as u64,
                created_at: Utc::now(),
            };
            if let Err(e) = db.insert_artifact(&artifact).await {
                self.degrade(
                    &run.id,
                    &format!("artifact {} not recorded: {}", payload.name, e),
                )
                .await;
            }
        }
    }

    async fn degrade(&self, run_id: &RunId, reason: &str) {
        warn!(run_id = %run_id, "Run degraded: {}", reason);
        if let Err(e) = self.ctx.queue.db().mark_degraded(run_id, reason).await {
            error!(run_id = %run_id, "Failed to mark run degraded: {}", e);
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}
