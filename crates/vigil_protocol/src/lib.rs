//! Vigil domain model.
//!
//! Records and status vocabularies shared by the orchestrator, the queue, the
//! workers and the persistence layer:
//!
//! ```text
//! Target --(AuthorizationRecord)--> Run --(one Job per attempt)--> Findings / Artifacts
//! ```
//!
//! The run state machine (`RunStatus::can_transition_to`) is defined here so that
//! every writer validates edges against the same table.

pub mod config;
pub mod defaults;
pub mod idempotency;
pub mod scope;
pub mod types;

pub use config::{ResourceLimits, RetryPolicy};
pub use idempotency::{finding_dedup_key, normalize_location};
pub use scope::{Scope, ScopeEntry};
pub use types::{
    Artifact, ArtifactKind, AuditEvent, AuditKind, AuthorizationRecord, DeadLetter, FailureKind,
    Finding, FindingStatus, InvalidTransition, Job, JobState, LogLevel, LogLine, ProofType, Run,
    RunConfig, RunStatus, Severity, Suite, SuiteKind, Target, VerificationStatus,
};

pub use vigil_ids::{
    ArtifactId, AuthorizationId, FindingId, JobId, ProjectId, RunId, SuiteId, TargetId, WorkerId,
};
