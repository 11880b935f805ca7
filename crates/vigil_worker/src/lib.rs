//! Vigil scan executors.
//!
//! A [`WorkerPool`] runs a fixed number of executors against the shared
//! [`vigil_db::JobQueue`]. Each attempt runs its suite adapter inside a
//! [`ScanContext`]: egress goes through the scope guard, output is collected
//! incrementally against the resource ceiling, and log lines stream to the
//! run's log table as they are produced.

pub mod adapters;
pub mod artifact_store;
pub mod cancel;
pub mod egress;
pub mod log_sink;
pub mod normalizer;
pub mod sandbox;
pub mod worker;

pub use adapters::{AdapterError, SuiteAdapter};
pub use artifact_store::{ArtifactStore, FsArtifactStore, StorageError};
pub use cancel::{CancelReason, CancellationRegistry, CancellationToken};
pub use egress::{EgressChecker, EgressDenied, GuardedEgress};
pub use normalizer::{
    FindingsNormalizer, NormalizationError, NormalizeMode, Normalized, RawRecord, RecordFormat,
};
pub use sandbox::ScanContext;
pub use worker::{
    AttemptOutcome, AttemptReport, Executor, WorkerConfig, WorkerContext, WorkerError,
    WorkerHandle, WorkerPool,
};
