//! Database schema creation for all Vigil tables.
//!
//! All CREATE TABLE statements live here. Timestamps are Unix milliseconds.

use crate::error::Result;
use crate::VigilDb;
use tracing::info;

const SCHEMA: &[&str] = &[
    r#"CREATE TABLE IF NOT EXISTS targets (
        id TEXT PRIMARY KEY,
        project_id TEXT NOT NULL,
        name TEXT NOT NULL,
        scope_json TEXT NOT NULL,
        verification_status TEXT NOT NULL DEFAULT 'unverified',
        created_at INTEGER NOT NULL,
        updated_at INTEGER NOT NULL
    )"#,
    r#"CREATE TABLE IF NOT EXISTS authorization_records (
        id TEXT PRIMARY KEY,
        target_id TEXT NOT NULL REFERENCES targets(id),
        proof_type TEXT NOT NULL,
        proof_value TEXT NOT NULL,
        verified_at INTEGER NOT NULL,
        expires_at INTEGER NOT NULL
    )"#,
    "CREATE INDEX IF NOT EXISTS idx_authorization_target ON authorization_records(target_id, expires_at)",
    r#"CREATE TABLE IF NOT EXISTS suites (
        id TEXT PRIMARY KEY,
        kind TEXT NOT NULL,
        name TEXT NOT NULL,
        defaults_json TEXT NOT NULL DEFAULT 'null',
        created_at INTEGER NOT NULL
    )"#,
    r#"CREATE TABLE IF NOT EXISTS runs (
        id TEXT PRIMARY KEY,
        project_id TEXT NOT NULL,
        target_id TEXT NOT NULL REFERENCES targets(id),
        suite_id TEXT NOT NULL REFERENCES suites(id),
        suite_kind TEXT NOT NULL,
        status TEXT NOT NULL,
        config_json TEXT NOT NULL,
        safe_mode INTEGER NOT NULL DEFAULT 1,
        rate_limit INTEGER NOT NULL,
        priority INTEGER NOT NULL DEFAULT 0,
        attempt INTEGER NOT NULL DEFAULT 1,
        max_attempts INTEGER NOT NULL,
        timeout_secs INTEGER NOT NULL,
        created_by TEXT NOT NULL,
        created_at INTEGER NOT NULL,
        updated_at INTEGER NOT NULL,
        started_at INTEGER,
        finished_at INTEGER,
        deadline_at INTEGER,
        failure_kind TEXT,
        status_reason TEXT,
        cancel_requested INTEGER NOT NULL DEFAULT 0,
        degraded INTEGER NOT NULL DEFAULT 0,
        degraded_reason TEXT
    )"#,
    "CREATE INDEX IF NOT EXISTS idx_runs_status ON runs(status)",
    "CREATE INDEX IF NOT EXISTS idx_runs_target ON runs(target_id)",
    r#"CREATE TABLE IF NOT EXISTS jobs (
        id TEXT PRIMARY KEY,
        run_id TEXT NOT NULL REFERENCES runs(id),
        attempt INTEGER NOT NULL,
        priority INTEGER NOT NULL DEFAULT 0,
        state TEXT NOT NULL DEFAULT 'pending',
        lease_owner TEXT,
        lease_deadline INTEGER,
        available_at INTEGER NOT NULL,
        created_at INTEGER NOT NULL,
        finished_at INTEGER,
        last_error TEXT,
        UNIQUE(run_id, attempt)
    )"#,
    // At most one active (pending or leased) job per run.
    "CREATE UNIQUE INDEX IF NOT EXISTS idx_jobs_one_active ON jobs(run_id) WHERE state IN ('pending', 'leased')",
    "CREATE INDEX IF NOT EXISTS idx_jobs_ready ON jobs(state, priority DESC, created_at ASC)",
    "CREATE INDEX IF NOT EXISTS idx_jobs_lease ON jobs(state, lease_deadline)",
    r#"CREATE TABLE IF NOT EXISTS dead_letters (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        job_id TEXT NOT NULL REFERENCES jobs(id),
        run_id TEXT NOT NULL REFERENCES runs(id),
        attempt INTEGER NOT NULL,
        failure_kind TEXT NOT NULL,
        reason TEXT NOT NULL,
        moved_at INTEGER NOT NULL
    )"#,
    r#"CREATE TABLE IF NOT EXISTS findings (
        id TEXT PRIMARY KEY,
        run_id TEXT NOT NULL REFERENCES runs(id),
        job_id TEXT,
        severity TEXT NOT NULL,
        severity_rank INTEGER NOT NULL,
        finding_type TEXT NOT NULL,
        title TEXT NOT NULL,
        location TEXT NOT NULL,
        dedup_key TEXT NOT NULL UNIQUE,
        status TEXT NOT NULL DEFAULT 'open',
        evidence_json TEXT NOT NULL,
        occurrences INTEGER NOT NULL DEFAULT 1,
        created_at INTEGER NOT NULL,
        updated_at INTEGER NOT NULL
    )"#,
    "CREATE INDEX IF NOT EXISTS idx_findings_run ON findings(run_id)",
    r#"CREATE TABLE IF NOT EXISTS artifacts (
        id TEXT PRIMARY KEY,
        run_id TEXT NOT NULL REFERENCES runs(id),
        job_id TEXT NOT NULL,
        kind TEXT NOT NULL,
        name TEXT NOT NULL,
        storage_ref TEXT NOT NULL,
        size_bytes INTEGER NOT NULL,
        created_at INTEGER NOT NULL
    )"#,
    "CREATE INDEX IF NOT EXISTS idx_artifacts_run ON artifacts(run_id)",
    r#"CREATE TABLE IF NOT EXISTS run_logs (
        seq INTEGER PRIMARY KEY AUTOINCREMENT,
        run_id TEXT NOT NULL,
        job_id TEXT,
        level TEXT NOT NULL,
        message TEXT NOT NULL,
        logged_at INTEGER NOT NULL
    )"#,
    "CREATE INDEX IF NOT EXISTS idx_run_logs_run ON run_logs(run_id, seq)",
    r#"CREATE TABLE IF NOT EXISTS audit_events (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        run_id TEXT,
        target_id TEXT,
        kind TEXT NOT NULL,
        detail TEXT NOT NULL,
        created_at INTEGER NOT NULL
    )"#,
    "CREATE INDEX IF NOT EXISTS idx_audit_run ON audit_events(run_id)",
];

impl VigilDb {
    /// Ensure all tables exist.
    pub(crate) async fn ensure_schema(&self, file_backed: bool) -> Result<()> {
        if file_backed {
            // WAL lets stream readers proceed while executors write.
            sqlx::query("PRAGMA journal_mode=WAL")
                .execute(&self.pool)
                .await?;
            sqlx::query("PRAGMA synchronous=NORMAL")
                .execute(&self.pool)
                .await?;
        }

        for statement in SCHEMA {
            sqlx::query(statement).execute(&self.pool).await?;
        }

        info!("Database schema verified");
        Ok(())
    }
}
