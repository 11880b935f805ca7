//! End-to-end tests for a node: orchestrator, executors and supervisor
//! sharing one state store.

use futures::StreamExt;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tempfile::TempDir;
use vigil_db::VigilDb;
use vigil_protocol::{
    FailureKind, ProjectId, ProofType, RetryPolicy, RunConfig, RunId, RunStatus, Scope, SuiteKind,
    Target,
};
use vigil_sentinel::{
    builtin_suite_id, CreateRunRequest, Node, NodeConfig, OrchestratorError, Services,
};
use vigil_test_utils::{wait_for_run, StaticProofFetcher, PROOF_TOKEN};

const SHOP: &str = "shop.example.com";
const WAIT: Duration = Duration::from_secs(10);

struct TestNode {
    node: Node,
    project_id: ProjectId,
    target: Target,
    _artifacts: TempDir,
}

fn node_config(artifacts: &TempDir) -> NodeConfig {
    let mut config = NodeConfig {
        artifact_root: artifacts.path().to_path_buf(),
        node_name: "itest".to_string(),
        sweep_interval_ms: 50,
        retry: RetryPolicy::immediate(3),
        ..NodeConfig::default()
    };
    config.worker.count = 2;
    config.worker.poll_interval_ms = 20;
    config.worker.cancel_grace_ms = 200;
    config
}

async fn services(config: &NodeConfig) -> Services {
    let db = VigilDb::open_in_memory().await.unwrap();
    Services::build(db, config, Arc::new(StaticProofFetcher::new(PROOF_TOKEN)))
        .await
        .unwrap()
}

async fn register(services: &Services, project_id: &ProjectId, verify: bool) -> Target {
    let target = services
        .auth
        .register_target(project_id, SHOP, Scope::hosts([SHOP]))
        .await
        .unwrap();
    if verify {
        services
            .auth
            .verify(&target.id, ProofType::HttpFile, PROOF_TOKEN)
            .await
            .unwrap();
    }
    target
}

impl TestNode {
    async fn start() -> Self {
        let artifacts = TempDir::new().unwrap();
        let config = node_config(&artifacts);
        let services = services(&config).await;
        let project_id = ProjectId::new();
        let target = register(&services, &project_id, true).await;
        let node = Node::start_with(services, &config).unwrap();
        Self {
            node,
            project_id,
            target,
            _artifacts: artifacts,
        }
    }

    fn db(&self) -> &VigilDb {
        &self.node.services().db
    }

    fn replay_request(&self, suite: Value) -> CreateRunRequest {
        let mut request = CreateRunRequest::new(
            self.project_id.clone(),
            self.target.id.clone(),
            builtin_suite_id(SuiteKind::Replay).unwrap(),
            "itest",
        );
        request.config = RunConfig {
            suite,
            ..RunConfig::default()
        };
        request
    }

    async fn wait_terminal(&self, run_id: &RunId) -> vigil_protocol::Run {
        wait_for_run(self.db(), run_id, WAIT, |r| r.status.is_terminal())
            .await
            .unwrap()
    }
}

fn alert(name: &str, path: &str) -> Value {
    json!({
        "format": "web_alert",
        "data": {
            "alert": name,
            "url": format!("https://{}{}", SHOP, path),
            "pluginid": "10038",
            "riskcode": "2"
        }
    })
}

#[tokio::test]
async fn test_replay_run_completes_end_to_end() {
    let t = TestNode::start().await;
    let orchestrator = t.node.orchestrator().clone();

    let run = orchestrator
        .create_run(t.replay_request(json!({
            "steps": [
                {"request": format!("https://{}/", SHOP)},
                {"log": "crawl finished"}
            ],
            "records": [alert("CSP Header Not Set", "/"), alert("CSP Header Not Set", "/")]
        })))
        .await
        .unwrap();

    let done = t.wait_terminal(&run.id).await;
    assert_eq!(done.status, RunStatus::Completed, "reason: {:?}", done.status_reason);
    assert!(done.finished_at.is_some());

    let findings = orchestrator.list_findings(&run.id).await.unwrap();
    assert_eq!(findings.len(), 1);
    assert_eq!(findings[0].occurrences, 2);

    let artifacts = orchestrator.list_artifacts(&run.id).await.unwrap();
    assert!(artifacts.iter().any(|a| a.name == "scan.log"));

    let lines: Vec<_> = tokio::time::timeout(
        WAIT,
        orchestrator.stream_logs(&run.id).map(|l| l.unwrap()).collect::<Vec<_>>(),
    )
    .await
    .expect("log stream of a finished run must end");
    assert!(lines.iter().any(|l| l.message == "crawl finished"));
    assert!(lines.windows(2).all(|w| w[0].seq < w[1].seq));

    let stats = orchestrator.queue_stats().await.unwrap();
    assert_eq!(stats.acked, 1);
    assert_eq!(stats.pending + stats.leased, 0);

    t.node.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_unverified_target_is_refused_without_a_job() {
    let artifacts = TempDir::new().unwrap();
    let config = node_config(&artifacts);
    let services = services(&config).await;
    let project_id = ProjectId::new();
    let target = register(&services, &project_id, false).await;

    let request = CreateRunRequest::new(
        project_id,
        target.id.clone(),
        builtin_suite_id(SuiteKind::Replay).unwrap(),
        "itest",
    );
    let err = services.orchestrator.create_run(request).await.unwrap_err();
    let OrchestratorError::Authorization { run_id, .. } = err else {
        panic!("expected authorization error, got {:?}", err);
    };

    let run = services.orchestrator.get_run(&run_id).await.unwrap();
    assert_eq!(run.status, RunStatus::Failed);
    assert_eq!(run.failure_kind, Some(FailureKind::Authorization));
    assert_eq!(services.orchestrator.queue_stats().await.unwrap().pending, 0);
}

#[tokio::test]
async fn test_cancel_executing_run_keeps_partial_findings() {
    let t = TestNode::start().await;
    let orchestrator = t.node.orchestrator().clone();

    let run = orchestrator
        .create_run(t.replay_request(json!({
            "steps": [
                {"emit": alert("Before cancel", "/a")},
                {"log": "waiting"},
                {"sleep_ms": 30000},
                {"emit": alert("After cancel", "/b")}
            ]
        })))
        .await
        .unwrap();

    wait_for_run(t.db(), &run.id, WAIT, |r| r.status == RunStatus::Running)
        .await
        .unwrap();
    let deadline = Instant::now() + WAIT;
    while t.db().count_logs(&run.id).await.unwrap() < 3 {
        assert!(Instant::now() < deadline, "replay never reached the sleep");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    let flagged = orchestrator.cancel_run(&run.id, "alice").await.unwrap();
    assert!(flagged.cancel_requested);

    let done = t.wait_terminal(&run.id).await;
    assert_eq!(done.status, RunStatus::Cancelled);
    assert_eq!(done.status_reason.as_deref(), Some("Cancelled by user"));

    let findings = orchestrator.list_findings(&run.id).await.unwrap();
    assert_eq!(findings.len(), 1);
    assert_eq!(findings[0].title, "Before cancel");

    t.node.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_crashing_suite_is_retried_then_dead_lettered() {
    let t = TestNode::start().await;
    let orchestrator = t.node.orchestrator().clone();

    let mut request = t.replay_request(json!({"steps": [{"crash": "scanner segfault"}]}));
    request.config.max_attempts = Some(2);
    let run = orchestrator.create_run(request).await.unwrap();

    let done = t.wait_terminal(&run.id).await;
    assert_eq!(done.status, RunStatus::Failed);
    assert_eq!(done.failure_kind, Some(FailureKind::WorkerCrash));
    assert_eq!(done.attempt, 2);

    let dead = orchestrator.dead_letters().await.unwrap();
    assert_eq!(dead.len(), 1);
    assert_eq!(dead[0].run_id, run.id);

    t.node.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_cancel_queued_run_before_any_executor_sees_it() {
    let artifacts = TempDir::new().unwrap();
    let config = node_config(&artifacts);
    let services = services(&config).await;
    let project_id = ProjectId::new();
    let target = register(&services, &project_id, true).await;

    // No executors running: the run stays queued.
    let run = services
        .orchestrator
        .create_run(CreateRunRequest::new(
            project_id,
            target.id,
            builtin_suite_id(SuiteKind::Replay).unwrap(),
            "itest",
        ))
        .await
        .unwrap();
    assert_eq!(run.status, RunStatus::Queued);

    let cancelled = services.orchestrator.cancel_run(&run.id, "alice").await.unwrap();
    assert_eq!(cancelled.status, RunStatus::Cancelled);

    let lines: Vec<_> = services
        .orchestrator
        .stream_logs(&run.id)
        .collect::<Vec<_>>()
        .await;
    assert!(lines.is_empty());
}

#[tokio::test]
async fn test_idle_node_shuts_down_promptly() {
    let t = TestNode::start().await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    tokio::time::timeout(Duration::from_secs(5), t.node.shutdown())
        .await
        .expect("node did not stop")
        .unwrap();
}
