//! Vigil Sentinel
//!
//! Control plane and executor host for authorized security scans. A node owns
//! the state store, accepts run requests through the [`RunOrchestrator`], runs
//! attempts on a local worker pool and sweeps expired leases and deadlines.
//!
//! Command-line operations (`target`, `run`, `queue`) work against the same
//! database, so a separate process can drive a serving node.

pub mod commands;
pub mod config;
pub mod node;
pub mod orchestrator;
pub mod supervisor;

pub use config::{ConfigError, NodeConfig, RunDefaults, WorkerSettings};
pub use node::{builtin_suite_id, seed_builtin_suites, Node, Services};
pub use orchestrator::{CreateRunRequest, OrchestratorError, RunOrchestrator};
pub use supervisor::{Supervisor, SupervisorHandle, SweepReport};

use std::path::PathBuf;
use vigil_protocol::{ProjectId, ProofType, RunId, RunStatus, SuiteId, TargetId};

#[derive(clap::Parser, Debug)]
#[command(
    name = "vigil-sentinel",
    about = "Run orchestration and safe-scan execution for authorized targets"
)]
pub struct SentinelArgs {
    /// Node configuration file (TOML). Defaults to $VIGIL_HOME/sentinel.toml when present.
    #[arg(long, env = "VIGIL_CONFIG")]
    pub config: Option<PathBuf>,

    /// State store path, overriding the configuration file
    #[arg(long, env = "VIGIL_DATABASE")]
    pub database: Option<PathBuf>,

    /// Artifact directory, overriding the configuration file
    #[arg(long, env = "VIGIL_ARTIFACTS")]
    pub artifact_root: Option<PathBuf>,

    /// Executor count, overriding the configuration file
    #[arg(long)]
    pub workers: Option<usize>,

    /// Mirror detailed logs on stderr
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Only warnings and errors on stderr
    #[arg(short, long, global = true, conflicts_with = "verbose")]
    pub quiet: bool,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(clap::Subcommand, Debug)]
pub enum Command {
    /// Run the node: executors plus the supervisor (default)
    Serve,

    /// Manage scan targets
    #[command(subcommand)]
    Target(TargetCommand),

    /// Create, inspect and cancel runs
    #[command(subcommand)]
    Run(RunCommand),

    /// Queue diagnostics
    #[command(subcommand)]
    Queue(QueueCommand),
}

#[derive(clap::Subcommand, Debug)]
pub enum TargetCommand {
    /// Register a target; it stays unverified until an ownership proof checks out
    Register {
        #[arg(long, value_parser = ProjectId::parse)]
        project: ProjectId,
        #[arg(long)]
        name: String,
        /// Hostname in scope (repeatable)
        #[arg(long = "host")]
        hosts: Vec<String>,
        /// CIDR block in scope (repeatable)
        #[arg(long = "cidr")]
        cidrs: Vec<String>,
        /// API base URL in scope (repeatable)
        #[arg(long = "api-base")]
        api_bases: Vec<url::Url>,
        /// Allowed ports; any port when omitted
        #[arg(long = "port")]
        ports: Vec<u16>,
    },

    /// Check an ownership proof and authorize the target
    Verify {
        #[arg(value_parser = TargetId::parse)]
        target: TargetId,
        #[arg(long, default_value = "http_file")]
        proof_type: ProofType,
        #[arg(long)]
        token: String,
    },

    /// Show a target and its authorization state
    Show {
        #[arg(value_parser = TargetId::parse)]
        target: TargetId,
    },
}

#[derive(clap::Subcommand, Debug)]
pub enum RunCommand {
    /// Request a new run
    Create {
        #[arg(long, value_parser = ProjectId::parse)]
        project: ProjectId,
        #[arg(long, value_parser = TargetId::parse)]
        target: TargetId,
        #[arg(long, value_parser = SuiteId::parse)]
        suite: SuiteId,
        /// Allow active checks and skip (rather than fail on) scope violations
        #[arg(long)]
        unsafe_mode: bool,
        /// Requests per minute
        #[arg(long)]
        rate_limit: Option<u32>,
        #[arg(long)]
        timeout_secs: Option<u64>,
        #[arg(long)]
        max_attempts: Option<u32>,
        #[arg(long, default_value_t = 0)]
        priority: i32,
        /// Suite options as a JSON object
        #[arg(long)]
        options: Option<String>,
        #[arg(long, env = "USER", default_value = "cli")]
        created_by: String,
    },

    /// Show a run
    Status {
        #[arg(value_parser = RunId::parse)]
        run: RunId,
    },

    /// List runs
    List {
        #[arg(long, value_parser = ProjectId::parse)]
        project: Option<ProjectId>,
        #[arg(long)]
        status: Option<RunStatus>,
    },

    /// Cancel a queued or executing run
    Cancel {
        #[arg(value_parser = RunId::parse)]
        run: RunId,
        #[arg(long, env = "USER", default_value = "cli")]
        by: String,
    },

    /// Print the run log
    Logs {
        #[arg(value_parser = RunId::parse)]
        run: RunId,
        /// Keep following until the run finishes
        #[arg(short, long)]
        follow: bool,
    },

    /// Print normalized findings
    Findings {
        #[arg(value_parser = RunId::parse)]
        run: RunId,
    },

    /// Print stored artifacts
    Artifacts {
        #[arg(value_parser = RunId::parse)]
        run: RunId,
    },

    /// Print the audit trail
    Audit {
        #[arg(value_parser = RunId::parse)]
        run: RunId,
    },
}

#[derive(clap::Subcommand, Debug)]
pub enum QueueCommand {
    /// Job counts by state
    Stats,
    /// Attempts that will not be retried
    DeadLetters,
    /// Run one supervisor sweep now
    Sweep,
}
