//! Scan suite adapters.
//!
//! The suite kinds are a closed set, so adapters are an enum rather than trait
//! objects: adding a suite means adding a variant and a match arm here.
//!
//! Adapters run inside a [`ScanContext`]. They never touch the network without
//! `ctx.permit`, push raw records with `ctx.emit` as they find them, and call
//! `ctx.checkpoint` between steps so cancellation lands promptly.

mod dependency_audit;
mod replay;
mod web_baseline;

pub use dependency_audit::{DependencyAuditAdapter, DependencyAuditConfig};
pub use replay::{ReplayAdapter, ReplayConfig, ReplayStep};
pub use web_baseline::{WebBaselineAdapter, WebBaselineConfig};

use serde::de::DeserializeOwned;
use serde_json::Value;
use thiserror::Error;
use vigil_protocol::{FailureKind, SuiteKind, Target};

use crate::egress::EgressDenied;
use crate::sandbox::ScanContext;

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("Invalid suite configuration: {0}")]
    Config(String),

    #[error(transparent)]
    Egress(#[from] EgressDenied),

    #[error("Scan cancelled")]
    Cancelled,

    #[error("Resource limit exceeded: {0}")]
    ResourceLimit(String),

    #[error("Request failed: {0}")]
    Http(String),

    /// The scanner died mid-run. Retry eligible.
    #[error("Scanner crashed: {0}")]
    Crashed(String),
}

impl AdapterError {
    pub fn failure_kind(&self) -> FailureKind {
        match self {
            AdapterError::Config(_) | AdapterError::Http(_) => FailureKind::Adapter,
            AdapterError::Egress(_) => FailureKind::ScopeViolation,
            AdapterError::Cancelled => FailureKind::Cancelled,
            AdapterError::ResourceLimit(_) => FailureKind::ResourceLimit,
            AdapterError::Crashed(_) => FailureKind::WorkerCrash,
        }
    }

    /// Check if this error is transient (eligible for retry)
    pub fn is_transient(&self) -> bool {
        self.failure_kind().is_transient()
    }
}

pub enum SuiteAdapter {
    WebBaseline(WebBaselineAdapter),
    DependencyAudit(DependencyAuditAdapter),
    Replay(ReplayAdapter),
}

impl SuiteAdapter {
    pub fn for_kind(kind: SuiteKind) -> Result<Self, AdapterError> {
        Ok(match kind {
            SuiteKind::WebBaseline => SuiteAdapter::WebBaseline(WebBaselineAdapter::new()?),
            SuiteKind::DependencyAudit => {
                SuiteAdapter::DependencyAudit(DependencyAuditAdapter::new()?)
            }
            SuiteKind::Replay => SuiteAdapter::Replay(ReplayAdapter),
        })
    }

    pub fn kind(&self) -> SuiteKind {
        match self {
            SuiteAdapter::WebBaseline(_) => SuiteKind::WebBaseline,
            SuiteAdapter::DependencyAudit(_) => SuiteKind::DependencyAudit,
            SuiteAdapter::Replay(_) => SuiteKind::Replay,
        }
    }

    /// Run the scan against `target`. Output is collected by `ctx`, including
    /// when this returns an error.
    pub async fn run_scan(
        &self,
        target: &Target,
        config: &Value,
        ctx: &ScanContext,
    ) -> Result<(), AdapterError> {
        match self {
            SuiteAdapter::WebBaseline(adapter) => adapter.run_scan(target, config, ctx).await,
            SuiteAdapter::DependencyAudit(adapter) => adapter.run_scan(target, config, ctx).await,
            SuiteAdapter::Replay(adapter) => adapter.run_scan(target, config, ctx).await,
        }
    }
}

/// Suite defaults with the run's options laid over them, key by key.
pub fn merge_config(defaults: &Value, overrides: &Value) -> Value {
    match (defaults, overrides) {
        (Value::Object(base), Value::Object(extra)) => {
            let mut merged = base.clone();
            for (key, value) in extra {
                merged.insert(key.clone(), value.clone());
            }
            Value::Object(merged)
        }
        (base, Value::Null) => base.clone(),
        (_, extra) => extra.clone(),
    }
}

pub(crate) fn parse_config<T: DeserializeOwned + Default>(config: &Value) -> Result<T, AdapterError> {
    if config.is_null() {
        return Ok(T::default());
    }
    serde_json::from_value(config.clone()).map_err(|e| AdapterError::Config(e.to_string()))
}
