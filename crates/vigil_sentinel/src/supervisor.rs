//! Periodic housekeeping.
//!
//! Each sweep reclaims expired leases, enforces run deadlines, finishes runs
//! whose cancellation landed while they sat in the queue, and expires stale
//! authorizations. Every step is safe to repeat and safe to race with
//! executors; conflicts are skipped and picked up by the next sweep.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use vigil_db::{DbError, JobQueue, RunUpdate};
use vigil_protocol::defaults::CANCELLED_BY_USER_MESSAGE;
use vigil_protocol::{AuditKind, FailureKind, Run, RunStatus};
use vigil_security::{AuthorizationService, ScopeGuard};
use vigil_worker::{CancelReason, CancellationRegistry};

/// What one sweep did.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub reclaimed: usize,
    pub requeued: usize,
    pub dead_lettered: usize,
    pub timed_out: usize,
    pub cancelled: usize,
    pub expired_authorizations: usize,
}

impl SweepReport {
    pub fn is_idle(&self) -> bool {
        *self == SweepReport::default()
    }
}

#[derive(Clone)]
pub struct Supervisor {
    queue: JobQueue,
    auth: Arc<AuthorizationService>,
    guard: Arc<ScopeGuard>,
    cancellations: CancellationRegistry,
}

impl Supervisor {
    pub fn new(
        queue: JobQueue,
        auth: Arc<AuthorizationService>,
        guard: Arc<ScopeGuard>,
        cancellations: CancellationRegistry,
    ) -> Self {
        Self {
            queue,
            auth,
            guard,
            cancellations,
        }
    }

    pub async fn sweep(&self) -> Result<SweepReport, DbError> {
        self.sweep_at(Utc::now()).await
    }

    pub async fn sweep_at(&self, now: DateTime<Utc>) -> Result<SweepReport, DbError> {
        let mut report = SweepReport::default();

        let reclaimed = self.queue.reclaim_expired_at(now).await?;
        report.reclaimed = reclaimed.len();
        report.requeued = reclaimed.requeued();
        report.dead_lettered = reclaimed.dead_lettered();

        for run in self.queue.db().runs_past_deadline(now).await? {
            if self.enforce_deadline(&run, now).await? {
                report.timed_out += 1;
            }
        }

        let queued = self
            .queue
            .db()
            .list_runs(None, Some(RunStatus::Queued))
            .await?;
        for run in queued.iter().filter(|r| r.cancel_requested) {
            if self
                .finalize_queued(run, RunStatus::Cancelled, RunUpdate::cancelled(CANCELLED_BY_USER_MESSAGE), now)
                .await?
            {
                report.cancelled += 1;
            }
        }

        report.expired_authorizations = self.auth.expire_stale(now).await?.len();
        self.guard.prune();

        if !report.is_idle() {
            info!(?report, "Sweep finished");
        }
        Ok(report)
    }

    /// Returns true if this sweep ended the run.
    async fn enforce_deadline(&self, run: &Run, now: DateTime<Utc>) -> Result<bool, DbError> {
        let detail = format!("run exceeded its {}s timeout", run.timeout_secs);
        match run.status {
            RunStatus::Queued => {
                let finished = self
                    .finalize_queued(
                        run,
                        RunStatus::Failed,
                        RunUpdate::failed(FailureKind::Timeout, detail.clone()),
                        now,
                    )
                    .await?;
                if finished {
                    self.audit_timeout(run, &detail, now).await;
                }
                Ok(finished)
            }
            RunStatus::Running | RunStatus::Processing => {
                // A local executor stops itself; a remote one notices on its
                // own deadline check or loses the lease.
                if self.cancellations.cancel(&run.id, CancelReason::Timeout) {
                    self.audit_timeout(run, &detail, now).await;
                    debug!(run_id = %run.id, "Signalled timeout to executor");
                }
                Ok(false)
            }
            _ => Ok(false),
        }
    }

    async fn finalize_queued(
        &self,
        run: &Run,
        to: RunStatus,
        update: RunUpdate,
        now: DateTime<Utc>,
    ) -> Result<bool, DbError> {
        match self.queue.finalize_queued_at(&run.id, to, update, now).await {
            Ok(_) => {
                info!(run_id = %run.id, status = %to, "Finalized queued run");
                Ok(true)
            }
            Err(e) if e.is_conflict() => {
                debug!(run_id = %run.id, "Run left the queue before the sweep reached it");
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }

    async fn audit_timeout(&self, run: &Run, detail: &str, now: DateTime<Utc>) {
        if let Err(e) = self
            .queue
            .db()
            .record_audit(Some(&run.id), Some(&run.target_id), AuditKind::RunTimedOut, detail, now)
            .await
        {
            warn!(run_id = %run.id, "Failed to record audit event: {}", e);
        }
    }

    /// Sweep every `interval` until shut down.
    pub fn spawn(self, interval: Duration) -> SupervisorHandle {
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let join_handle = tokio::spawn(async move {
            info!(interval_ms = interval.as_millis() as u64, "Supervisor started");
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    biased;

                    changed = shutdown_rx.changed() => {
                        if changed.is_err() || *shutdown_rx.borrow() {
                            break;
                        }
                    }
                    _ = ticker.tick() => {
                        if let Err(e) = self.sweep().await {
                            error!("Sweep failed: {}", e);
                        }
                    }
                }
            }
            info!("Supervisor stopped");
        });
        SupervisorHandle {
            shutdown_tx,
            join_handle,
        }
    }
}

pub struct SupervisorHandle {
    shutdown_tx: watch::Sender<bool>,
    join_handle: JoinHandle<()>,
}

impl SupervisorHandle {
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(true);
        if let Err(e) = self.join_handle.await {
            warn!("Supervisor task panicked: {:?}", e);
        }
    }
}
