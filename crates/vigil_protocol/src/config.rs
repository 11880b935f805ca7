//! Tunables shared across control/data plane.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::defaults;

/// Retry policy for transient job failures.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: defaults::DEFAULT_MAX_ATTEMPTS,
            backoff_base_ms: defaults::DEFAULT_RETRY_BACKOFF_BASE_MS,
            backoff_max_ms: defaults::DEFAULT_RETRY_BACKOFF_MAX_MS,
        }
    }
}

impl RetryPolicy {
    /// Retry immediately; used by tests and single-node tooling.
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            backoff_base_ms: 0,
            backoff_max_ms: 0,
        }
    }

    /// Un-jittered delay before `attempt` (1-based) becomes leasable.
    /// Attempt 1 starts immediately; later attempts double from the base.
    pub fn base_delay(&self, attempt: u32) -> Duration {
        if attempt <= 1 || self.backoff_base_ms == 0 {
            return Duration::ZERO;
        }
        let exp = attempt.saturating_sub(2).min(20);
        let scaled = self.backoff_base_ms.saturating_mul(1u64 << exp);
        Duration::from_millis(scaled.min(self.backoff_max_ms))
    }
}

/// Per-attempt resource ceiling enforced by the worker sandbox.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResourceLimits {
    /// Milliseconds spent inside the adapter's `poll`.
    pub max_cpu_ms: u64,
    /// Bytes of raw records and artifacts buffered for one attempt.
    pub max_memory_bytes: u64,
    pub max_raw_records: usize,
    pub max_artifact_bytes: u64,
    pub max_log_lines: usize,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            max_cpu_ms: defaults::DEFAULT_MAX_CPU_MS,
            max_memory_bytes: defaults::DEFAULT_MAX_MEMORY_BYTES,
            max_raw_records: defaults::DEFAULT_MAX_RAW_RECORDS,
            max_artifact_bytes: defaults::DEFAULT_MAX_ARTIFACT_BYTES,
            max_log_lines: defaults::DEFAULT_MAX_LOG_LINES,
        }
    }
}
