//! Row decoding at the storage boundary.
//!
//! Statuses and ids are parsed here with error propagation so the rest of the
//! crate only handles domain types.

use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::Row;
use std::fmt::Display;
use std::str::FromStr;
use vigil_protocol::{
    Artifact, AuditEvent, AuthorizationRecord, DeadLetter, Finding, Job, LogLine, Run, RunConfig,
    Scope, Suite, Target,
};

use crate::error::{DbError, Result};
use crate::VigilDb;

pub(crate) fn to_millis(at: DateTime<Utc>) -> i64 {
    at.timestamp_millis()
}

pub(crate) fn parse<T>(row: &SqliteRow, column: &str) -> Result<T>
where
    T: FromStr,
    T::Err: Display,
{
    let raw: String = row.try_get(column)?;
    raw.parse::<T>()
        .map_err(|e| DbError::decode(format!("{}: {}", column, e)))
}

pub(crate) fn parse_opt<T>(row: &SqliteRow, column: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: Display,
{
    let raw: Option<String> = row.try_get(column)?;
    raw.map(|value| {
        value
            .parse::<T>()
            .map_err(|e| DbError::decode(format!("{}: {}", column, e)))
    })
    .transpose()
}

pub(crate) fn time(row: &SqliteRow, column: &str) -> Result<DateTime<Utc>> {
    let millis: i64 = row.try_get(column)?;
    Ok(VigilDb::millis_to_datetime(millis))
}

pub(crate) fn time_opt(row: &SqliteRow, column: &str) -> Result<Option<DateTime<Utc>>> {
    let millis: Option<i64> = row.try_get(column)?;
    Ok(millis.map(VigilDb::millis_to_datetime))
}

pub(crate) fn count(row: &SqliteRow, column: &str) -> Result<u32> {
    let value: i64 = row.try_get(column)?;
    u32::try_from(value).map_err(|_| DbError::decode(format!("{} out of range: {}", column, value)))
}

fn json<T: serde::de::DeserializeOwned>(row: &SqliteRow, column: &str) -> Result<T> {
    let raw: String = row.try_get(column)?;
    Ok(serde_json::from_str(&raw)?)
}

pub(crate) fn target_from_row(row: &SqliteRow) -> Result<Target> {
    let scope: Scope = json(row, "scope_json")?;
    Ok(Target {
        id: parse(row, "id")?,
        project_id: parse(row, "project_id")?,
        name: row.try_get("name")?,
        scope,
        verification_status: parse(row, "verification_status")?,
        created_at: time(row, "created_at")?,
        updated_at: time(row, "updated_at")?,
    })
}

pub(crate) fn authorization_from_row(row: &SqliteRow) -> Result<AuthorizationRecord> {
    Ok(AuthorizationRecord {
        id: parse(row, "id")?,
        target_id: parse(row, "target_id")?,
        proof_type: parse(row, "proof_type")?,
        proof_value: row.try_get("proof_value")?,
        verified_at: time(row, "verified_at")?,
        expires_at: time(row, "expires_at")?,
    })
}

pub(crate) fn suite_from_row(row: &SqliteRow) -> Result<Suite> {
    Ok(Suite {
        id: parse(row, "id")?,
        kind: parse(row, "kind")?,
        name: row.try_get("name")?,
        defaults: json(row, "defaults_json")?,
    })
}

pub(crate) fn run_from_row(row: &SqliteRow) -> Result<Run> {
    let config: RunConfig = json(row, "config_json")?;
    let rate_limit = count(row, "rate_limit")?;
    let timeout_secs: i64 = row.try_get("timeout_secs")?;
    Ok(Run {
        id: parse(row, "id")?,
        project_id: parse(row, "project_id")?,
        target_id: parse(row, "target_id")?,
        suite_id: parse(row, "suite_id")?,
        suite_kind: parse(row, "suite_kind")?,
        status: parse(row, "status")?,
        config,
        safe_mode: row.try_get::<bool, _>("safe_mode")?,
        rate_limit,
        priority: row.try_get::<i64, _>("priority")? as i32,
        attempt: count(row, "attempt")?,
        max_attempts: count(row, "max_attempts")?,
        timeout_secs: timeout_secs.max(0) as u64,
        created_by: row.try_get("created_by")?,
        created_at: time(row, "created_at")?,
        started_at: time_opt(row, "started_at")?,
        finished_at: time_opt(row, "finished_at")?,
        deadline_at: time_opt(row, "deadline_at")?,
        failure_kind: parse_opt(row, "failure_kind")?,
        status_reason: row.try_get("status_reason")?,
        cancel_requested: row.try_get::<bool, _>("cancel_requested")?,
        degraded: row.try_get::<bool, _>("degraded")?,
        degraded_reason: row.try_get("degraded_reason")?,
    })
}

pub(crate) fn job_from_row(row: &SqliteRow) -> Result<Job> {
    Ok(Job {
        id: parse(row, "id")?,
        run_id: parse(row, "run_id")?,
        attempt: count(row, "attempt")?,
        priority: row.try_get::<i64, _>("priority")? as i32,
        state: parse(row, "state")?,
        lease_owner: parse_opt(row, "lease_owner")?,
        lease_deadline: time_opt(row, "lease_deadline")?,
        available_at: time(row, "available_at")?,
        created_at: time(row, "created_at")?,
        finished_at: time_opt(row, "finished_at")?,
        last_error: row.try_get("last_error")?,
    })
}

pub(crate) fn dead_letter_from_row(row: &SqliteRow) -> Result<DeadLetter> {
    Ok(DeadLetter {
        job_id: parse(row, "job_id")?,
        run_id: parse(row, "run_id")?,
        attempt: count(row, "attempt")?,
        failure_kind: parse(row, "failure_kind")?,
        reason: row.try_get("reason")?,
        moved_at: time(row, "moved_at")?,
    })
}

pub(crate) fn finding_from_row(row: &SqliteRow) -> Result<Finding> {
    Ok(Finding {
        id: parse(row, "id")?,
        run_id: parse(row, "run_id")?,
        job_id: parse_opt(row, "job_id")?,
        severity: parse(row, "severity")?,
        finding_type: row.try_get("finding_type")?,
        title: row.try_get("title")?,
        location: row.try_get("location")?,
        dedup_key: row.try_get("dedup_key")?,
        status: parse(row, "status")?,
        evidence: json(row, "evidence_json")?,
        occurrences: count(row, "occurrences")?,
        created_at: time(row, "created_at")?,
        updated_at: time(row, "updated_at")?,
    })
}

pub(crate) fn artifact_from_row(row: &SqliteRow) -> Result<Artifact> {
    let size: i64 = row.try_get("size_bytes")?;
    Ok(Artifact {
        id: parse(row, "id")?,
        run_id: parse(row, "run_id")?,
        job_id: parse(row, "job_id")?,
        kind: parse(row, "kind")?,
        name: row.try_get("name")?,
        storage_ref: row.try_get("storage_ref")?,
        size_bytes: size.max(0) as u64,
        created_at: time(row, "created_at")?,
    })
}

pub(crate) fn log_from_row(row: &SqliteRow) -> Result<LogLine> {
    Ok(LogLine {
        seq: row.try_get("seq")?,
        run_id: parse(row, "run_id")?,
        job_id: parse_opt(row, "job_id")?,
        level: parse(row, "level")?,
        message: row.try_get("message")?,
        logged_at: time(row, "logged_at")?,
    })
}

pub(crate) fn audit_from_row(row: &SqliteRow) -> Result<AuditEvent> {
    Ok(AuditEvent {
        id: row.try_get("id")?,
        run_id: parse_opt(row, "run_id")?,
        target_id: parse_opt(row, "target_id")?,
        kind: parse(row, "kind")?,
        detail: row.try_get("detail")?,
        created_at: time(row, "created_at")?,
    })
}
