//! Vigil Sentinel
//!
//! Usage:
//!     vigil-sentinel [serve]
//!     vigil-sentinel target register --project <id> --name shop --host shop.example.com
//!     vigil-sentinel run create --project <id> --target <id> --suite web-baseline
//!     vigil-sentinel run logs <run-id> --follow

use anyhow::{Context, Result};
use clap::Parser;
use vigil_logging::{init_logging, vigil_home, LogConfig};
use vigil_sentinel::{commands, Command, Node, NodeConfig, SentinelArgs, Services};

const DEFAULT_CONFIG_FILE: &str = "sentinel.toml";

fn load_config(args: &SentinelArgs) -> Result<NodeConfig> {
    let mut config = match &args.config {
        Some(path) => NodeConfig::load(path)?,
        None => {
            let path = vigil_home().join(DEFAULT_CONFIG_FILE);
            if path.is_file() {
                NodeConfig::load(&path)?
            } else {
                NodeConfig::default()
            }
        }
    };
    if let Some(database) = &args.database {
        config.database_path = database.clone();
    }
    if let Some(artifact_root) = &args.artifact_root {
        config.artifact_root = artifact_root.clone();
    }
    if let Some(workers) = args.workers {
        config.worker.count = workers;
    }
    config.validate()?;
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = SentinelArgs::parse();

    init_logging(LogConfig {
        app_name: "vigil-sentinel",
        verbose: args.verbose,
        quiet: args.quiet,
        log_dir: None,
    })?;

    let config = load_config(&args)?;

    match args.command {
        None | Some(Command::Serve) => serve(config).await,
        Some(Command::Target(command)) => {
            let services = Services::open(&config).await?;
            commands::target(&services, command).await
        }
        Some(Command::Run(command)) => {
            let services = Services::open(&config).await?;
            commands::run(&services, command).await
        }
        Some(Command::Queue(command)) => {
            let services = Services::open(&config).await?;
            commands::queue(&services, command).await
        }
    }
}

async fn serve(config: NodeConfig) -> Result<()> {
    tracing::info!("Starting Vigil Sentinel");
    tracing::info!("  Database: {}", config.database_path.display());
    tracing::info!("  Artifacts: {}", config.artifact_root.display());
    tracing::info!("  Executors: {}", config.worker.count);

    let node = Node::start(config).await?;
    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    tracing::info!("Shutdown signal received");
    node.shutdown().await
}
