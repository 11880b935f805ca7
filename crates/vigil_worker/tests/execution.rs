//! End-to-end attempts through a real executor, using the replay suite so no
//! traffic leaves the test.

use async_trait::async_trait;
use chrono::Utc;
use serde_json::{json, Value};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::Notify;
use vigil_db::{Lease, NackOutcome, NewRun};
use vigil_protocol::{
    ArtifactKind, AuditKind, FailureKind, JobId, JobState, ResourceLimits, RunConfig, RunId,
    RunStatus, Severity, SuiteKind, Target, WorkerId,
};
use vigil_test_utils::{suite_id, wait_for_run, TestEnv};
use vigil_worker::{
    ArtifactStore, AttemptOutcome, CancellationRegistry, Executor, FindingsNormalizer, FsArtifactStore,
    NormalizeMode, RawRecord, StorageError, WorkerConfig, WorkerContext,
};

const SHOP: &str = "shop.example.com";

struct Harness {
    env: TestEnv,
    target: Target,
    _artifacts: TempDir,
    ctx: WorkerContext,
}

impl Harness {
    async fn new() -> Self {
        let env = TestEnv::new().await.unwrap();
        let target = env.verified_target(&[SHOP]).await.unwrap();
        Self::with_target(env, target)
    }

    fn with_target(env: TestEnv, target: Target) -> Self {
        let artifacts = TempDir::new().unwrap();
        let ctx = WorkerContext {
            queue: env.queue.clone(),
            auth: env.auth.clone(),
            guard: env.guard.clone(),
            store: Arc::new(FsArtifactStore::new(artifacts.path())),
            cancellations: CancellationRegistry::new(),
            work_available: Arc::new(Notify::new()),
        };
        Self {
            env,
            target,
            _artifacts: artifacts,
            ctx,
        }
    }

    /// Every artifact write takes `delay`.
    fn with_slow_store(mut self, delay: Duration) -> Self {
        self.ctx.store = Arc::new(SlowStore {
            inner: FsArtifactStore::new(self._artifacts.path()),
            delay,
        });
        self
    }

    /// Lease the next job as a worker that then dies. The lease is already
    /// expired when this returns.
    async fn abandoned_lease(&self) -> Lease {
        let ghost = WorkerId::parse("ghost").unwrap();
        let lease = self
            .env
            .queue
            .lease_at(&ghost, Duration::from_millis(50), Utc::now())
            .await
            .unwrap()
            .unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        lease
    }

    fn executor(&self, config: WorkerConfig) -> Executor {
        Executor::new(
            WorkerId::parse("executor-test").unwrap(),
            Arc::new(config),
            self.ctx.clone(),
        )
    }

    async fn queue_replay(&self, suite: Value, safe_mode: bool) -> RunId {
        self.queue_run(suite, safe_mode, 3, 600).await
    }

    async fn queue_run(
        &self,
        suite: Value,
        safe_mode: bool,
        max_attempts: u32,
        timeout_secs: u64,
    ) -> RunId {
        let run = self
            .env
            .db
            .insert_run(&NewRun {
                id: RunId::new(),
                project_id: self.target.project_id.clone(),
                target_id: self.target.id.clone(),
                suite_id: suite_id(SuiteKind::Replay),
                suite_kind: SuiteKind::Replay,
                config: RunConfig {
                    suite,
                    ..RunConfig::default()
                },
                safe_mode,
                rate_limit: 60,
                priority: 0,
                max_attempts,
                timeout_secs,
                created_by: "tester".into(),
                created_at: Utc::now(),
            })
            .await
            .unwrap();
        self.env.queue.enqueue(&run.id).await.unwrap();
        run.id
    }
}

struct SlowStore {
    inner: FsArtifactStore,
    delay: Duration,
}

#[async_trait]
impl ArtifactStore for SlowStore {
    async fn put(
        &self,
        run_id: &RunId,
        job_id: &JobId,
        name: &str,
        bytes: &[u8],
    ) -> Result<String, StorageError> {
        tokio::time::sleep(self.delay).await;
        self.inner.put(run_id, job_id, name, bytes).await
    }

    async fn get(&self, storage_ref: &str) -> Result<Vec<u8>, StorageError> {
        self.inner.get(storage_ref).await
    }
}

fn fast_config() -> WorkerConfig {
    WorkerConfig {
        pool_name: "test".into(),
        executors: 1,
        visibility_timeout: Duration::from_secs(30),
        poll_interval: Duration::from_millis(20),
        cancel_grace: Duration::from_millis(200),
        storage_backoff: Duration::from_millis(1),
        ..WorkerConfig::default()
    }
}

fn alert(name: &str, url: &str, pluginid: &str, riskcode: &str) -> Value {
    json!({
        "format": "web_alert",
        "data": {"alert": name, "url": url, "pluginid": pluginid, "riskcode": riskcode}
    })
}

#[tokio::test]
async fn test_successful_run_persists_deduplicated_findings() {
    let h = Harness::new().await;
    let url = format!("https://{}/", SHOP);
    let run_id = h
        .queue_replay(
            json!({
                "steps": [
                    {"request": url},
                    {"log": "page fetched"},
                    {"attach": {"kind": "report", "name": "replay.txt", "content": "ok"}}
                ],
                "records": [
                    alert("CSP Header Not Set", &url, "10038", "2"),
                    alert("CSP Header Not Set", &url, "10038", "3"),
                    alert("X-Content-Type-Options Header Missing", &url, "10021", "1"),
                ]
            }),
            true,
        )
        .await;

    let report = h.executor(fast_config()).run_once().await.unwrap().unwrap();
    assert_eq!(report.run_id, run_id);
    assert_eq!(report.outcome, AttemptOutcome::Completed { findings: 2 });

    let run = h.env.db.get_run(&run_id).await.unwrap().unwrap();
    assert_eq!(run.status, RunStatus::Completed);
    assert!(run.finished_at.is_some());
    assert!(!run.degraded);

    let findings = h.env.db.list_findings(&run_id).await.unwrap();
    assert_eq!(findings.len(), 2);
    let csp = findings.iter().find(|f| f.finding_type == "web:10038").unwrap();
    assert_eq!(csp.occurrences, 2);
    assert_eq!(csp.severity, Severity::High);

    let artifacts = h.env.db.list_artifacts(&run_id).await.unwrap();
    let mut names: Vec<_> = artifacts.iter().map(|a| a.name.as_str()).collect();
    names.sort();
    assert_eq!(names, vec!["replay.txt", "scan.log"]);
    let log = artifacts.iter().find(|a| a.kind == ArtifactKind::Log).unwrap();
    let transcript = h.ctx.store.get(&log.storage_ref).await.unwrap();
    assert!(String::from_utf8_lossy(&transcript).contains("page fetched"));

    let lines = h.env.db.logs_after(&run_id, 0, 100).await.unwrap();
    assert!(lines.iter().any(|l| l.message.contains("Attempt 1 of 3")));
    assert!(lines.windows(2).all(|w| w[0].seq < w[1].seq));
}

#[tokio::test]
async fn test_scope_violation_in_safe_mode_fails_the_run() {
    let h = Harness::new().await;
    let run_id = h
        .queue_replay(
            json!({
                "steps": [
                    {"emit": alert("Found early", &format!("https://{}/a", SHOP), "1", "1")},
                    {"request": "https://evil.example.net/"},
                    {"emit": alert("Never reached", &format!("https://{}/b", SHOP), "2", "1")}
                ]
            }),
            true,
        )
        .await;

    let report = h.executor(fast_config()).run_once().await.unwrap().unwrap();
    assert_eq!(
        report.outcome,
        AttemptOutcome::Nacked(NackOutcome::DeadLettered {
            failure_kind: FailureKind::ScopeViolation
        })
    );

    let run = h.env.db.get_run(&run_id).await.unwrap().unwrap();
    assert_eq!(run.status, RunStatus::Failed);
    assert_eq!(run.failure_kind, Some(FailureKind::ScopeViolation));
    assert!(run.status_reason.unwrap().contains("evil.example.net"));

    let audit = h.env.db.list_audit_for_run(&run_id).await.unwrap();
    assert!(audit
        .iter()
        .any(|e| e.kind == AuditKind::ScopeViolation && e.detail.contains("evil.example.net")));

    // Output produced before the violation is kept.
    let findings = h.env.db.list_findings(&run_id).await.unwrap();
    assert_eq!(findings.len(), 1);
    assert_eq!(findings[0].title, "Found early");
}

#[tokio::test]
async fn test_scope_violation_without_safe_mode_is_skipped() {
    let h = Harness::new().await;
    let run_id = h
        .queue_replay(
            json!({
                "steps": [{"request": "https://evil.example.net/"}],
                "records": [alert("Still found", &format!("https://{}/", SHOP), "3", "1")]
            }),
            false,
        )
        .await;

    let report = h.executor(fast_config()).run_once().await.unwrap().unwrap();
    assert_eq!(report.outcome, AttemptOutcome::Completed { findings: 1 });

    let audit = h.env.db.list_audit_for_run(&run_id).await.unwrap();
    assert_eq!(audit.len(), 1);
    assert_eq!(audit[0].kind, AuditKind::ScopeViolation);

    let lines = h.env.db.logs_after(&run_id, 0, 100).await.unwrap();
    assert!(lines.iter().any(|l| l.message.starts_with("Skipped:")));
}

#[tokio::test]
async fn test_expired_lease_is_retried_on_next_attempt() {
    let h = Harness::new().await;
    let run_id = h
        .queue_replay(
            json!({"records": [alert("Retry me", &format!("https://{}/", SHOP), "4", "2")]}),
            true,
        )
        .await;

    // A worker that leased attempt 1 and then died.
    h.abandoned_lease().await;

    let report = h.executor(fast_config()).run_once().await.unwrap().unwrap();
    assert_eq!(report.outcome, AttemptOutcome::Completed { findings: 1 });

    let run = h.env.db.get_run(&run_id).await.unwrap().unwrap();
    assert_eq!(run.status, RunStatus::Completed);
    assert_eq!(run.attempt, 2);

    let jobs = h.env.queue.jobs_for_run(&run_id).await.unwrap();
    let states: Vec<_> = jobs.iter().map(|j| (j.attempt, j.state)).collect();
    assert!(states.contains(&(1, JobState::Expired)));
    assert!(states.contains(&(2, JobState::Acked)));
    assert_eq!(h.env.db.list_findings(&run_id).await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_repeated_crashes_dead_letter_the_run() {
    let h = Harness::new().await;
    let run_id = h
        .queue_run(json!({"steps": [{"crash": "scanner segfault"}]}), true, 2, 600)
        .await;
    let executor = h.executor(fast_config());

    let first = executor.run_once().await.unwrap().unwrap();
    assert!(matches!(
        first.outcome,
        AttemptOutcome::Nacked(NackOutcome::Requeued { attempt: 2, .. })
    ));
    let second = executor.run_once().await.unwrap().unwrap();
    assert_eq!(
        second.outcome,
        AttemptOutcome::Nacked(NackOutcome::DeadLettered {
            failure_kind: FailureKind::WorkerCrash
        })
    );

    let run = h.env.db.get_run(&run_id).await.unwrap().unwrap();
    assert_eq!(run.status, RunStatus::Failed);
    assert_eq!(run.failure_kind, Some(FailureKind::WorkerCrash));
    assert!(run.status_reason.unwrap().contains("scanner segfault"));
    assert_eq!(h.env.queue.list_dead_letters().await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_cancel_while_running_keeps_partial_output() {
    let h = Harness::new().await;
    let run_id = h
        .queue_replay(
            json!({
                "steps": [
                    {"emit": alert("Before cancel", &format!("https://{}/", SHOP), "5", "2")},
                    {"log": "halfway"},
                    {"sleep_ms": 30000},
                    {"emit": alert("After cancel", &format!("https://{}/x", SHOP), "6", "2")}
                ]
            }),
            true,
        )
        .await;

    let executor = h.executor(fast_config());
    let attempt = tokio::spawn(async move { executor.run_once().await });

    let db = h.env.db.clone();
    wait_for_run(&db, &run_id, Duration::from_secs(5), |r| {
        r.status == RunStatus::Running
    })
    .await
    .unwrap();
    let deadline = std::time::Instant::now() + Duration::from_secs(5);
    while db.count_logs(&run_id).await.unwrap() < 3 {
        assert!(std::time::Instant::now() < deadline, "replay never reached the sleep");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(db.request_cancel(&run_id, Utc::now()).await.unwrap());

    let report = tokio::time::timeout(Duration::from_secs(5), attempt)
        .await
        .expect("attempt did not stop after cancel")
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(report.outcome, AttemptOutcome::Nacked(NackOutcome::Cancelled));

    let run = db.get_run(&run_id).await.unwrap().unwrap();
    assert_eq!(run.status, RunStatus::Cancelled);
    assert_eq!(run.status_reason.as_deref(), Some("Cancelled by user"));

    let findings = db.list_findings(&run_id).await.unwrap();
    assert_eq!(findings.len(), 1);
    assert_eq!(findings[0].title, "Before cancel");
    let artifacts = db.list_artifacts(&run_id).await.unwrap();
    assert!(artifacts.iter().any(|a| a.name == "scan.log"));
}

#[tokio::test]
async fn test_run_deadline_times_out_the_scan() {
    let h = Harness::new().await;
    let run_id = h
        .queue_run(json!({"steps": [{"sleep_ms": 30000}]}), true, 3, 1)
        .await;

    let report = tokio::time::timeout(
        Duration::from_secs(10),
        h.executor(fast_config()).run_once(),
    )
    .await
    .expect("deadline was not enforced")
    .unwrap()
    .unwrap();
    assert_eq!(
        report.outcome,
        AttemptOutcome::Nacked(NackOutcome::DeadLettered {
            failure_kind: FailureKind::Timeout
        })
    );

    let run = h.env.db.get_run(&run_id).await.unwrap().unwrap();
    assert_eq!(run.status, RunStatus::Failed);
    assert_eq!(run.failure_kind, Some(FailureKind::Timeout));
    let audit = h.env.db.list_audit_for_run(&run_id).await.unwrap();
    assert!(audit.iter().any(|e| e.kind == AuditKind::RunTimedOut));
}

#[tokio::test]
async fn test_resource_ceiling_fails_the_run() {
    let h = Harness::new().await;
    let records: Vec<Value> = (0..3)
        .map(|i| alert("Many", &format!("https://{}/{}", SHOP, i), "7", "1"))
        .collect();
    let run_id = h.queue_replay(json!({ "records": records }), true).await;

    let mut config = fast_config();
    config.limits = ResourceLimits {
        max_raw_records: 2,
        ..ResourceLimits::default()
    };
    let report = h.executor(config).run_once().await.unwrap().unwrap();
    assert_eq!(
        report.outcome,
        AttemptOutcome::Nacked(NackOutcome::DeadLettered {
            failure_kind: FailureKind::ResourceLimit
        })
    );
    assert_eq!(h.env.db.list_findings(&run_id).await.unwrap().len(), 2);
}

#[tokio::test]
async fn test_malformed_batch_fails_normalization() {
    let h = Harness::new().await;
    let url = format!("https://{}/", SHOP);
    let run_id = h
        .queue_replay(
            json!({
                "records": [
                    alert("Good", &url, "8", "1"),
                    {"format": "web_alert", "data": {"alert": "no url"}},
                    {"format": "web_alert", "data": {"url": "https://shop.example.com/"}},
                ]
            }),
            true,
        )
        .await;

    let report = h.executor(fast_config()).run_once().await.unwrap().unwrap();
    assert_eq!(
        report.outcome,
        AttemptOutcome::Nacked(NackOutcome::DeadLettered {
            failure_kind: FailureKind::Normalization
        })
    );
    let run = h.env.db.get_run(&run_id).await.unwrap().unwrap();
    assert_eq!(run.status, RunStatus::Failed);
    assert!(h.env.db.list_findings(&run_id).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_unverified_target_is_refused_at_execution() {
    let env = TestEnv::new().await.unwrap();
    let target = env.unverified_target(&[SHOP]).await.unwrap();
    let h = Harness::with_target(env, target);
    let run_id = h.queue_replay(Value::Null, true).await;

    let report = h.executor(fast_config()).run_once().await.unwrap().unwrap();
    assert_eq!(
        report.outcome,
        AttemptOutcome::Nacked(NackOutcome::DeadLettered {
            failure_kind: FailureKind::Authorization
        })
    );
    let audit = h.env.db.list_audit_for_run(&run_id).await.unwrap();
    assert!(audit.iter().any(|e| e.kind == AuditKind::AuthorizationDenied));
}

#[tokio::test]
async fn test_empty_queue_yields_nothing() {
    let h = Harness::new().await;
    assert!(h.executor(fast_config()).run_once().await.unwrap().is_none());
}

#[tokio::test]
async fn test_cancel_during_processing_ends_cancelled_and_keeps_findings() {
    let h = Harness::new()
        .await
        .with_slow_store(Duration::from_millis(400));
    let url = format!("https://{}/", SHOP);
    let run_id = h
        .queue_replay(
            json!({
                "steps": [{"attach": {"kind": "report", "name": "replay.txt", "content": "ok"}}],
                "records": [alert("Late cancel", &url, "9", "2")]
            }),
            true,
        )
        .await;

    let executor = h.executor(fast_config());
    let attempt = tokio::spawn(async move { executor.run_once().await });

    let db = h.env.db.clone();
    wait_for_run(&db, &run_id, Duration::from_secs(5), |r| {
        r.status == RunStatus::Processing
    })
    .await
    .unwrap();
    assert!(db.request_cancel(&run_id, Utc::now()).await.unwrap());

    let report = tokio::time::timeout(Duration::from_secs(10), attempt)
        .await
        .expect("attempt did not finish")
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(report.outcome, AttemptOutcome::Nacked(NackOutcome::Cancelled));

    let run = db.get_run(&run_id).await.unwrap().unwrap();
    assert_eq!(run.status, RunStatus::Cancelled);
    assert_eq!(run.status_reason.as_deref(), Some("Cancelled by user"));
    let findings = db.list_findings(&run_id).await.unwrap();
    assert_eq!(findings.len(), 1);
    assert_eq!(findings[0].title, "Late cancel");
}

#[tokio::test]
async fn test_deadline_passed_during_processing_fails_with_timeout() {
    let h = Harness::new()
        .await
        .with_slow_store(Duration::from_millis(1_500));
    let run_id = h
        .queue_run(
            json!({
                "steps": [{"attach": {"kind": "report", "name": "replay.txt", "content": "ok"}}],
                "records": [alert("Slow to store", &format!("https://{}/", SHOP), "9", "2")]
            }),
            true,
            3,
            1,
        )
        .await;

    let report = tokio::time::timeout(
        Duration::from_secs(10),
        h.executor(fast_config()).run_once(),
    )
    .await
    .expect("attempt did not finish")
    .unwrap()
    .unwrap();
    assert_eq!(
        report.outcome,
        AttemptOutcome::Nacked(NackOutcome::DeadLettered {
            failure_kind: FailureKind::Timeout
        })
    );

    let run = h.env.db.get_run(&run_id).await.unwrap().unwrap();
    assert_eq!(run.status, RunStatus::Failed);
    assert_eq!(run.failure_kind, Some(FailureKind::Timeout));
    assert_eq!(h.env.db.list_findings(&run_id).await.unwrap().len(), 1);
    let audit = h.env.db.list_audit_for_run(&run_id).await.unwrap();
    assert!(audit.iter().any(|e| e.kind == AuditKind::RunTimedOut));
}

#[tokio::test]
async fn test_lease_is_renewed_while_artifacts_are_stored() {
    let h = Harness::new()
        .await
        .with_slow_store(Duration::from_millis(1_000));
    let run_id = h
        .queue_replay(
            json!({
                "steps": [{"attach": {"kind": "report", "name": "replay.txt", "content": "ok"}}],
                "records": [alert("Stored slowly", &format!("https://{}/", SHOP), "9", "2")]
            }),
            true,
        )
        .await;

    let mut config = fast_config();
    config.visibility_timeout = Duration::from_millis(300);

    // Anything left unrenewed for 300ms is reclaimed.
    let queue = h.env.queue.clone();
    let reclaimer = tokio::spawn(async move {
        loop {
            queue.reclaim_expired().await.unwrap();
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    });
    let report = h.executor(config).run_once().await.unwrap().unwrap();
    reclaimer.abort();

    assert_eq!(report.outcome, AttemptOutcome::Completed { findings: 1 });
    let run = h.env.db.get_run(&run_id).await.unwrap().unwrap();
    assert_eq!(run.status, RunStatus::Completed);
    assert_eq!(run.attempt, 1);
    let jobs = h.env.queue.jobs_for_run(&run_id).await.unwrap();
    assert_eq!(jobs.len(), 1);
    assert_eq!(jobs[0].state, JobState::Acked);
}

#[tokio::test]
async fn test_retried_attempt_does_not_duplicate_stored_findings() {
    let h = Harness::new().await;
    let url = format!("https://{}/", SHOP);
    let records = vec![
        alert("CSP Header Not Set", &url, "10038", "2"),
        alert("CSP Header Not Set", &url, "10038", "2"),
        alert("X-Content-Type-Options Header Missing", &url, "10021", "1"),
    ];
    let run_id = h.queue_replay(json!({ "records": records.clone() }), true).await;

    // Attempt 1 stored its findings, then its worker died before acking.
    let first = h.abandoned_lease().await;
    let raw: Vec<RawRecord> = records
        .iter()
        .map(|r| serde_json::from_value(r.clone()).unwrap())
        .collect();
    let normalized = FindingsNormalizer::new(0.25)
        .normalize(&run_id, Some(&first.job.id), &raw, NormalizeMode::Strict)
        .unwrap();
    h.env.db.upsert_findings(&normalized.findings).await.unwrap();
    let before = h.env.db.list_findings(&run_id).await.unwrap();
    assert_eq!(before.len(), 2);

    let report = h.executor(fast_config()).run_once().await.unwrap().unwrap();
    assert_eq!(report.outcome, AttemptOutcome::Completed { findings: 2 });
    let run = h.env.db.get_run(&run_id).await.unwrap().unwrap();
    assert_eq!(run.attempt, 2);

    let after = h.env.db.list_findings(&run_id).await.unwrap();
    assert_eq!(after.len(), before.len());
    let summary = |findings: &[vigil_protocol::Finding]| -> HashSet<(String, String, u32)> {
        findings
            .iter()
            .map(|f| (f.dedup_key.clone(), f.id.to_string(), f.occurrences))
            .collect()
    };
    assert_eq!(summary(&after), summary(&before));
}

#[tokio::test]
async fn test_cpu_ceiling_stops_a_busy_scan() {
    let h = Harness::new().await;
    let run_id = h
        .queue_replay(
            json!({
                "steps": [
                    {"emit": alert("Before the ceiling", &format!("https://{}/", SHOP), "11", "1")},
                    {"busy_ms": 40},
                    {"busy_ms": 40},
                    {"emit": alert("Never reached", &format!("https://{}/x", SHOP), "12", "1")}
                ]
            }),
            true,
        )
        .await;

    let mut config = fast_config();
    config.limits = ResourceLimits {
        max_cpu_ms: 30,
        ..ResourceLimits::default()
    };
    let report = h.executor(config).run_once().await.unwrap().unwrap();
    assert_eq!(
        report.outcome,
        AttemptOutcome::Nacked(NackOutcome::DeadLettered {
            failure_kind: FailureKind::ResourceLimit
        })
    );

    let run = h.env.db.get_run(&run_id).await.unwrap().unwrap();
    assert!(run.status_reason.unwrap().contains("CPU time ceiling"));
    let findings = h.env.db.list_findings(&run_id).await.unwrap();
    assert_eq!(findings.len(), 1);
    assert_eq!(findings[0].title, "Before the ceiling");
}
