//! Canonical records and status enums.
//!
//! Every status is stored as its lowercase `as_str` form and parsed back at the
//! storage boundary, so these enums are the only place the vocabulary lives.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use vigil_ids::{
    ArtifactId, AuthorizationId, FindingId, JobId, ProjectId, RunId, SuiteId, TargetId, WorkerId,
};

use crate::scope::Scope;

macro_rules! str_enum {
    ($(#[$meta:meta])* $name:ident { $($(#[$vmeta:meta])* $variant:ident => $text:expr),+ $(,)? }) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(rename_all = "snake_case")]
        pub enum $name {
            $($(#[$vmeta])* $variant),+
        }

        impl $name {
            pub const ALL: &'static [$name] = &[$($name::$variant),+];

            pub fn as_str(&self) -> &'static str {
                match self {
                    $($name::$variant => $text),+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $name {
            type Err = String;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($text => Ok($name::$variant),)+
                    other => Err(format!("invalid {}: '{}'", stringify!($name), other)),
                }
            }
        }
    };
}

// ============================================================================
// Targets & authorization
// ============================================================================

str_enum!(
    /// Ownership verification state of a target.
    VerificationStatus {
        Unverified => "unverified",
        Pending => "pending",
        Verified => "verified",
        Expired => "expired",
    }
);

str_enum!(
    ProofType {
        /// Token served over HTTP at a well-known path on the target host.
        HttpFile => "http_file",
        /// Token published as a DNS TXT record under the target host.
        DnsTxt => "dns_txt",
    }
);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Target {
    pub id: TargetId,
    pub project_id: ProjectId,
    pub name: String,
    pub scope: Scope,
    pub verification_status: VerificationStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Proof-backed, time-bound grant that a target may be tested.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuthorizationRecord {
    pub id: AuthorizationId,
    pub target_id: TargetId,
    pub proof_type: ProofType,
    pub proof_value: String,
    pub verified_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl AuthorizationRecord {
    pub fn is_valid_at(&self, at: DateTime<Utc>) -> bool {
        self.expires_at > at
    }
}

// ============================================================================
// Suites
// ============================================================================

str_enum!(
    /// Closed set of scan suite kinds; one adapter variant per kind.
    SuiteKind {
        WebBaseline => "web_baseline",
        DependencyAudit => "dependency_audit",
        Replay => "replay",
    }
);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Suite {
    pub id: SuiteId,
    pub kind: SuiteKind,
    pub name: String,
    /// Suite-level defaults; run config `suite` options are merged over these.
    pub defaults: serde_json::Value,
}

// ============================================================================
// Runs
// ============================================================================

str_enum!(
    RunStatus {
        Created => "created",
        Queued => "queued",
        Running => "running",
        Processing => "processing",
        Completed => "completed",
        Failed => "failed",
        Cancelled => "cancelled",
    }
);

impl RunStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RunStatus::Completed | RunStatus::Failed | RunStatus::Cancelled
        )
    }

    /// States that hold (or are waiting for) a job lease.
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            RunStatus::Queued | RunStatus::Running | RunStatus::Processing
        )
    }

    /// The run state machine. `Running/Processing -> Queued` is the retry edge.
    pub fn can_transition_to(&self, next: RunStatus) -> bool {
        use RunStatus::*;
        matches!(
            (self, next),
            (Created, Queued)
                | (Created, Failed)
                | (Queued, Running)
                | (Queued, Failed)
                | (Queued, Cancelled)
                | (Running, Processing)
                | (Running, Queued)
                | (Running, Failed)
                | (Running, Cancelled)
                | (Processing, Completed)
                | (Processing, Queued)
                | (Processing, Failed)
                | (Processing, Cancelled)
        )
    }

    pub fn check_transition(&self, next: RunStatus) -> Result<(), InvalidTransition> {
        if self.can_transition_to(next) {
            Ok(())
        } else {
            Err(InvalidTransition {
                from: *self,
                to: next,
            })
        }
    }
}

/// Rejected state-machine edge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("invalid run transition {from} -> {to}")]
pub struct InvalidTransition {
    pub from: RunStatus,
    pub to: RunStatus,
}

str_enum!(
    /// Canonical reason recorded with a failed or cancelled run.
    FailureKind {
        Authorization => "authorization_error",
        ScopeViolation => "scope_violation",
        WorkerCrash => "worker_crash",
        LeaseExpired => "lease_expired",
        Timeout => "timeout",
        Normalization => "normalization_error",
        Storage => "storage_error",
        Adapter => "adapter_error",
        ResourceLimit => "resource_limit",
        Cancelled => "cancelled",
    }
);

impl FailureKind {
    /// Transient failures re-enter the queue; everything else is final.
    pub fn is_transient(&self) -> bool {
        matches!(self, FailureKind::WorkerCrash | FailureKind::LeaseExpired)
    }
}

/// Per-run options supplied at creation time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct RunConfig {
    /// Hard wall-clock budget in seconds, counted from the first lease.
    #[serde(default)]
    pub timeout_secs: Option<u64>,
    #[serde(default)]
    pub max_attempts: Option<u32>,
    /// Higher is leased first.
    #[serde(default)]
    pub priority: i32,
    /// Suite-specific options, merged over the suite defaults.
    #[serde(default)]
    pub suite: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Run {
    pub id: RunId,
    pub project_id: ProjectId,
    pub target_id: TargetId,
    pub suite_id: SuiteId,
    pub suite_kind: SuiteKind,
    pub status: RunStatus,
    pub config: RunConfig,
    pub safe_mode: bool,
    /// Requests per minute.
    pub rate_limit: u32,
    pub priority: i32,
    pub attempt: u32,
    pub max_attempts: u32,
    pub timeout_secs: u64,
    pub created_by: String,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub deadline_at: Option<DateTime<Utc>>,
    pub failure_kind: Option<FailureKind>,
    pub status_reason: Option<String>,
    pub cancel_requested: bool,
    pub degraded: bool,
    pub degraded_reason: Option<String>,
}

impl Run {
    /// Terminal reason, present whenever the run failed or was cancelled.
    pub fn terminal_reason(&self) -> Option<(FailureKind, &str)> {
        match self.status {
            RunStatus::Failed | RunStatus::Cancelled => self
                .failure_kind
                .map(|kind| (kind, self.status_reason.as_deref().unwrap_or(""))),
            _ => None,
        }
    }

    pub fn is_past_deadline(&self, now: DateTime<Utc>) -> bool {
        self.deadline_at.is_some_and(|deadline| now >= deadline)
    }
}

// ============================================================================
// Jobs
// ============================================================================

str_enum!(
    JobState {
        Pending => "pending",
        Leased => "leased",
        Acked => "acked",
        Failed => "failed",
        Expired => "expired",
        DeadLetter => "dead_letter",
        Cancelled => "cancelled",
    }
);

impl JobState {
    pub fn is_active(&self) -> bool {
        matches!(self, JobState::Pending | JobState::Leased)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub run_id: RunId,
    pub attempt: u32,
    pub priority: i32,
    pub state: JobState,
    pub lease_owner: Option<WorkerId>,
    pub lease_deadline: Option<DateTime<Utc>>,
    pub available_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

impl Job {
    /// Holds an unexpired lease at `now`.
    pub fn is_leased_at(&self, now: DateTime<Utc>) -> bool {
        self.state == JobState::Leased && self.lease_deadline.is_some_and(|d| d > now)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetter {
    pub job_id: JobId,
    pub run_id: RunId,
    pub attempt: u32,
    pub failure_kind: FailureKind,
    pub reason: String,
    pub moved_at: DateTime<Utc>,
}

// ============================================================================
// Findings
// ============================================================================

str_enum!(
    /// Fixed ordinal scale; declaration order is ascending severity.
    Severity {
        Info => "info",
        Low => "low",
        Medium => "medium",
        High => "high",
        Critical => "critical",
    }
);

impl Severity {
    pub fn rank(&self) -> u8 {
        match self {
            Severity::Info => 0,
            Severity::Low => 1,
            Severity::Medium => 2,
            Severity::High => 3,
            Severity::Critical => 4,
        }
    }
}

impl PartialOrd for Severity {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Severity {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.rank().cmp(&other.rank())
    }
}

str_enum!(
    FindingStatus {
        Open => "open",
        Triaged => "triaged",
        FalsePositive => "false_positive",
        Fixed => "fixed",
    }
);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Finding {
    pub id: FindingId,
    pub run_id: RunId,
    pub job_id: Option<JobId>,
    pub severity: Severity,
    pub finding_type: String,
    pub title: String,
    pub location: String,
    pub dedup_key: String,
    pub status: FindingStatus,
    pub evidence: serde_json::Value,
    pub occurrences: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

// ============================================================================
// Artifacts, logs, audit
// ============================================================================

str_enum!(
    ArtifactKind {
        Log => "log",
        Screenshot => "screenshot",
        Report => "report",
    }
);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Artifact {
    pub id: ArtifactId,
    pub run_id: RunId,
    pub job_id: JobId,
    pub kind: ArtifactKind,
    pub name: String,
    /// Object store reference; artifact bytes never live in relational rows.
    pub storage_ref: String,
    pub size_bytes: u64,
    pub created_at: DateTime<Utc>,
}

str_enum!(
    LogLevel {
        Debug => "debug",
        Info => "info",
        Warn => "warn",
        Error => "error",
    }
);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogLine {
    /// Monotonic per database; used as the stream cursor.
    pub seq: i64,
    pub run_id: RunId,
    pub job_id: Option<JobId>,
    pub level: LogLevel,
    pub message: String,
    pub logged_at: DateTime<Utc>,
}

str_enum!(
    AuditKind {
        ScopeViolation => "scope_violation",
        RateLimited => "rate_limited",
        AuthorizationDenied => "authorization_denied",
        RunCancelled => "run_cancelled",
        RunTimedOut => "run_timed_out",
    }
);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEvent {
    pub id: i64,
    pub run_id: Option<RunId>,
    pub target_id: Option<TargetId>,
    pub kind: AuditKind,
    pub detail: String,
    pub created_at: DateTime<Utc>,
}
