//! Egress checks for scan adapters.
//!
//! Adapters never decide scope themselves. Every outbound action goes through an
//! [`EgressChecker`]; the production implementation, [`GuardedEgress`], wraps the
//! shared [`ScopeGuard`] and turns denials into audit entries. In safe mode a
//! denial also cancels the attempt with a scope violation.

use async_trait::async_trait;
use chrono::Utc;
use std::sync::Arc;
use thiserror::Error;
use tracing::warn;
use url::Url;
use vigil_db::VigilDb;
use vigil_protocol::{JobId, LogLevel, Run, Target};
use vigil_security::{ScopeGuard, Verdict};

use crate::cancel::{CancelReason, CancellationToken};
use crate::log_sink::LogSink;

/// An outbound action was refused.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("egress to {destination} denied: {reason}")]
pub struct EgressDenied {
    pub destination: String,
    pub reason: String,
    /// The denial aborted the run (safe mode).
    pub fatal: bool,
}

#[async_trait]
pub trait EgressChecker: Send + Sync {
    /// Approve one outbound action of `cost` requests to `destination`.
    async fn check(&self, destination: &Url, cost: u32) -> Result<(), EgressDenied>;
}

/// Scope and rate enforcement for one run attempt.
pub struct GuardedEgress {
    guard: Arc<ScopeGuard>,
    db: VigilDb,
    target: Target,
    run: Run,
    job_id: JobId,
    cancel: CancellationToken,
    log: LogSink,
}

impl GuardedEgress {
    pub fn new(
        guard: Arc<ScopeGuard>,
        db: VigilDb,
        target: Target,
        run: Run,
        job_id: JobId,
        cancel: CancellationToken,
        log: LogSink,
    ) -> Self {
        Self {
            guard,
            db,
            target,
            run,
            job_id,
            cancel,
            log,
        }
    }
}

#[async_trait]
impl EgressChecker for GuardedEgress {
    async fn check(&self, destination: &Url, cost: u32) -> Result<(), EgressDenied> {
        let verdict = self.guard.check_and_consume(
            &self.target.id,
            &self.target.scope,
            self.run.rate_limit,
            destination,
            cost,
        );
        let denial = match verdict {
            Verdict::Allow => return Ok(()),
            Verdict::Deny(denial) => denial,
        };

        let detail = format!("{} ({})", denial, destination);
        warn!(
            run_id = %self.run.id,
            job_id = %self.job_id,
            target_id = %self.target.id,
            safe_mode = self.run.safe_mode,
            "Egress denied: {}",
            detail
        );
        if let Err(e) = self
            .db
            .record_audit(
                Some(&self.run.id),
                Some(&self.target.id),
                denial.audit_kind(),
                &detail,
                Utc::now(),
            )
            .await
        {
            warn!(run_id = %self.run.id, "Failed to record audit event: {}", e);
        }

        if self.run.safe_mode {
            self.log.log(LogLevel::Error, format!("Aborting: {}", detail));
            self.cancel.cancel(CancelReason::ScopeViolation(detail.clone()));
        } else {
            self.log.log(LogLevel::Warn, format!("Skipped: {}", detail));
        }

        Err(EgressDenied {
            destination: destination.to_string(),
            reason: denial.to_string(),
            fatal: self.run.safe_mode,
        })
    }
}
