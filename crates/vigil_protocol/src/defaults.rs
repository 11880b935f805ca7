//! Canonical default values shared across control/data plane.

pub const DEFAULT_STATE_STORE_PATH: &str = "vigil.sqlite3";
pub const DEFAULT_ARTIFACT_ROOT: &str = "artifacts";

/// Executors per worker pool.
pub const DEFAULT_WORKER_COUNT: usize = 4;
/// Lease visibility timeout; crash detection only, never the run timeout.
pub const DEFAULT_VISIBILITY_TIMEOUT_SECS: u64 = 60;
/// Cancellation flag poll interval.
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 1_000;
/// Time an adapter gets to wind down after cancellation before it is dropped.
pub const DEFAULT_CANCEL_GRACE_MS: u64 = 5_000;
/// Supervisor sweep interval (lease reclaim, timeouts, expiry).
pub const DEFAULT_SWEEP_INTERVAL_MS: u64 = 5_000;

pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;
pub const DEFAULT_RETRY_BACKOFF_BASE_MS: u64 = 1_000;
pub const DEFAULT_RETRY_BACKOFF_MAX_MS: u64 = 60_000;

/// Hard wall-clock budget for a run when its config does not set one.
pub const DEFAULT_RUN_TIMEOUT_SECS: u64 = 3_600;
pub const DEFAULT_RATE_LIMIT_PER_MINUTE: u32 = 60;
pub const MAX_RATE_LIMIT_PER_MINUTE: u32 = 6_000;

pub const DEFAULT_AUTHORIZATION_TTL_SECS: i64 = 30 * 24 * 60 * 60;
pub const DEFAULT_MALFORMED_THRESHOLD: f64 = 0.25;

pub const DEFAULT_STORAGE_RETRIES: u32 = 3;
pub const DEFAULT_STORAGE_BACKOFF_MS: u64 = 200;

pub const DEFAULT_MAX_RAW_RECORDS: usize = 50_000;
pub const DEFAULT_MAX_ARTIFACT_BYTES: u64 = 256 * 1024 * 1024;
pub const DEFAULT_MAX_LOG_LINES: usize = 100_000;
/// Time an adapter may spend executing per attempt; waits on I/O are free.
pub const DEFAULT_MAX_CPU_MS: u64 = 15 * 60 * 1_000;
/// Raw output an attempt may hold in memory (records plus artifacts).
pub const DEFAULT_MAX_MEMORY_BYTES: u64 = 512 * 1024 * 1024;

/// Path a target serves its HTTP ownership token on.
pub const HTTP_PROOF_PATH: &str = "/.well-known/vigil-verification.txt";
/// DNS label prefix for TXT ownership proofs.
pub const DNS_PROOF_LABEL: &str = "_vigil-challenge";
pub const DNS_PROOF_PREFIX: &str = "vigil-verification=";
pub const DEFAULT_DOH_RESOLVER: &str = "https://cloudflare-dns.com/dns-query";

pub const CANCELLED_BY_USER_MESSAGE: &str = "Cancelled by user";
