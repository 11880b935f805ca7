//! In-memory environment with seeded suites and verified targets.

use anyhow::{anyhow, bail, Context, Result};
use chrono::Utc;
use serde_json::Value;
use std::sync::Arc;
use std::time::{Duration, Instant};
use vigil_db::{JobQueue, VigilDb};
use vigil_protocol::{
    ProjectId, ProofType, RetryPolicy, Run, RunId, Scope, Suite, SuiteId, SuiteKind, Target,
};
use vigil_security::{AuthorizationService, ScopeGuard};

use crate::proof::StaticProofFetcher;

/// Token every fixture target publishes as its ownership proof.
pub const PROOF_TOKEN: &str = "vigil-test-proof";

/// Catalog id of the seeded suite for `kind` (`web_baseline` -> `web-baseline`).
pub fn suite_id(kind: SuiteKind) -> SuiteId {
    SuiteId::parse(&kind.as_str().replace('_', "-"))
        .unwrap_or_else(|e| panic!("suite id for {}: {}", kind, e))
}

pub struct TestEnv {
    pub db: VigilDb,
    pub queue: JobQueue,
    pub auth: Arc<AuthorizationService>,
    pub guard: Arc<ScopeGuard>,
    pub fetcher: Arc<StaticProofFetcher>,
    pub project_id: ProjectId,
}

impl TestEnv {
    /// Fresh database, one suite per kind, immediate retries with 3 attempts.
    pub async fn new() -> Result<Self> {
        Self::with_policy(RetryPolicy::immediate(3)).await
    }

    pub async fn with_policy(policy: RetryPolicy) -> Result<Self> {
        let db = VigilDb::open_in_memory()
            .await
            .context("Failed to open in-memory database")?;
        let fetcher = Arc::new(StaticProofFetcher::new(PROOF_TOKEN));
        let auth = Arc::new(AuthorizationService::new(db.clone(), fetcher.clone()));
        let env = Self {
            queue: JobQueue::new(db.clone(), policy),
            db,
            auth,
            guard: Arc::new(ScopeGuard::new()),
            fetcher,
            project_id: ProjectId::new(),
        };
        for kind in SuiteKind::ALL {
            env.seed_suite(*kind, Value::Null).await?;
        }
        Ok(env)
    }

    /// Insert or replace the catalog entry for `kind`.
    pub async fn seed_suite(&self, kind: SuiteKind, defaults: Value) -> Result<Suite> {
        let suite = Suite {
            id: suite_id(kind),
            kind,
            name: kind.as_str().replace('_', " "),
            defaults,
        };
        self.db.upsert_suite(&suite).await?;
        Ok(suite)
    }

    /// Registered target without a verified proof.
    pub async fn unverified_target(&self, hosts: &[&str]) -> Result<Target> {
        let name = hosts.first().copied().unwrap_or("target");
        let target = self
            .auth
            .register_target(&self.project_id, name, Scope::hosts(hosts.iter().copied()))
            .await?;
        Ok(target)
    }

    /// Registered and verified target covering `hosts`.
    pub async fn verified_target(&self, hosts: &[&str]) -> Result<Target> {
        self.verified_target_with_scope(Scope::hosts(hosts.iter().copied()))
            .await
    }

    pub async fn verified_target_with_scope(&self, scope: Scope) -> Result<Target> {
        let name = scope.primary_host().unwrap_or("target").to_string();
        let target = self
            .auth
            .register_target(&self.project_id, &name, scope)
            .await?;
        self.auth
            .verify(&target.id, ProofType::HttpFile, PROOF_TOKEN)
            .await?;
        self.db
            .get_target(&target.id)
            .await?
            .ok_or_else(|| anyhow!("target {} vanished after verification", target.id))
    }
}

/// Poll the run row until `done` holds or `timeout` elapses.
pub async fn wait_for_run<F>(db: &VigilDb, run_id: &RunId, timeout: Duration, done: F) -> Result<Run>
where
    F: Fn(&Run) -> bool,
{
    let started = Instant::now();
    loop {
        let run = db
            .get_run(run_id)
            .await?
            .ok_or_else(|| anyhow!("run {} not found", run_id))?;
        if done(&run) {
            return Ok(run);
        }
        if started.elapsed() >= timeout {
            bail!(
                "run {} still {} after {:?} (reason: {:?}, at {})",
                run_id,
                run.status,
                timeout,
                run.status_reason,
                Utc::now()
            );
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
