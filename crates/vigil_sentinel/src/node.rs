//! A running Vigil node: state store, orchestrator, executors and supervisor
//! wired together.

use anyhow::{Context, Result};
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::Notify;
use tracing::info;
use vigil_db::{JobQueue, VigilDb};
use vigil_protocol::{Suite, SuiteId, SuiteKind};
use vigil_security::{AuthorizationService, HttpProofFetcher, ProofFetcher, ScopeGuard};
use vigil_worker::{
    ArtifactStore, CancellationRegistry, FsArtifactStore, WorkerContext, WorkerHandle, WorkerPool,
};

use crate::config::NodeConfig;
use crate::orchestrator::RunOrchestrator;
use crate::supervisor::{Supervisor, SupervisorHandle};

/// Catalog id of the built-in suite for `kind`.
pub fn builtin_suite_id(kind: SuiteKind) -> Result<SuiteId> {
    SuiteId::parse(&kind.as_str().replace('_', "-"))
        .with_context(|| format!("Invalid built-in suite id for {}", kind))
}

/// Insert the built-in suites that are not in the catalog yet. Existing
/// entries, including edited defaults, are left alone.
pub async fn seed_builtin_suites(db: &VigilDb) -> Result<usize> {
    let mut seeded = 0;
    for kind in SuiteKind::ALL {
        let id = builtin_suite_id(*kind)?;
        if db.get_suite(&id).await?.is_some() {
            continue;
        }
        db.upsert_suite(&Suite {
            id,
            kind: *kind,
            name: kind.as_str().replace('_', " "),
            defaults: Value::Null,
        })
        .await?;
        seeded += 1;
    }
    Ok(seeded)
}

/// Services shared by the control surface and the executors, without any
/// background task running.
pub struct Services {
    pub db: VigilDb,
    pub queue: JobQueue,
    pub auth: Arc<AuthorizationService>,
    pub guard: Arc<ScopeGuard>,
    pub cancellations: CancellationRegistry,
    pub work_available: Arc<Notify>,
    pub orchestrator: Arc<RunOrchestrator>,
}

impl Services {
    pub async fn build(
        db: VigilDb,
        config: &NodeConfig,
        fetcher: Arc<dyn ProofFetcher>,
    ) -> Result<Self> {
        config.validate()?;
        let seeded = seed_builtin_suites(&db).await?;
        if seeded > 0 {
            info!(seeded, "Seeded built-in suites");
        }

        let auth = Arc::new(
            AuthorizationService::new(db.clone(), fetcher)
                .with_ttl(chrono::Duration::seconds(config.authorization_ttl_secs)),
        );
        let queue = JobQueue::new(db.clone(), config.retry.clone());
        let cancellations = CancellationRegistry::new();
        let work_available = Arc::new(Notify::new());
        let orchestrator = Arc::new(RunOrchestrator::new(
            queue.clone(),
            auth.clone(),
            cancellations.clone(),
            work_available.clone(),
            config.runs.clone(),
        ));

        Ok(Self {
            db,
            queue,
            auth,
            guard: Arc::new(ScopeGuard::new()),
            cancellations,
            work_available,
            orchestrator,
        })
    }

    /// Open the configured database with the network proof fetcher.
    pub async fn open(config: &NodeConfig) -> Result<Self> {
        let db = VigilDb::open(&config.database_path)
            .await
            .with_context(|| format!("Failed to open {}", config.database_path.display()))?;
        let fetcher = HttpProofFetcher::new().context("Failed to build proof fetcher")?;
        Self::build(db, config, Arc::new(fetcher)).await
    }
}

pub struct Node {
    services: Services,
    workers: WorkerHandle,
    supervisor: SupervisorHandle,
}

impl Node {
    pub async fn start(config: NodeConfig) -> Result<Self> {
        let services = Services::open(&config).await?;
        Self::start_with(services, &config)
    }

    /// Start executors and the supervisor on top of already built services.
    pub fn start_with(services: Services, config: &NodeConfig) -> Result<Self> {
        let store: Arc<dyn ArtifactStore> = Arc::new(FsArtifactStore::new(&config.artifact_root));
        let ctx = WorkerContext {
            queue: services.queue.clone(),
            auth: services.auth.clone(),
            guard: services.guard.clone(),
            store,
            cancellations: services.cancellations.clone(),
            work_available: services.work_available.clone(),
        };
        let workers = WorkerPool::start(config.worker_config(), ctx)?;
        let supervisor = Supervisor::new(
            services.queue.clone(),
            services.auth.clone(),
            services.guard.clone(),
            services.cancellations.clone(),
        )
        .spawn(config.sweep_interval());

        info!(
            node = %config.node_name,
            executors = workers.executor_count(),
            database = %config.database_path.display(),
            "Node started"
        );
        Ok(Self {
            services,
            workers,
            supervisor,
        })
    }

    pub fn orchestrator(&self) -> &Arc<RunOrchestrator> {
        &self.services.orchestrator
    }

    pub fn services(&self) -> &Services {
        &self.services
    }

    /// Stop the supervisor, let executors settle their current attempts, then
    /// close the database.
    pub async fn shutdown(self) -> Result<()> {
        self.supervisor.shutdown().await;
        self.workers.shutdown().await?;
        self.services.db.close().await;
        info!("Node stopped");
        Ok(())
    }
}
