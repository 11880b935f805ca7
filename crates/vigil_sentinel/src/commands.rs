//! One-shot command-line operations against the state store.
//!
//! Results are printed as JSON on stdout; logs print one line per entry.

use anyhow::{bail, Context, Result};
use chrono::Utc;
use futures::StreamExt;
use serde::Serialize;
use std::io::Write;
use vigil_protocol::{LogLine, RunConfig, Scope, ScopeEntry};

use crate::node::Services;
use crate::orchestrator::CreateRunRequest;
use crate::supervisor::Supervisor;
use crate::{QueueCommand, RunCommand, TargetCommand};

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    let rendered = serde_json::to_string_pretty(value).context("Failed to render output")?;
    let mut out = std::io::stdout().lock();
    writeln!(out, "{}", rendered)?;
    Ok(())
}

fn print_log_line(line: &LogLine) -> Result<()> {
    let mut out = std::io::stdout().lock();
    writeln!(
        out,
        "{} {:>5} {}",
        line.logged_at.format("%Y-%m-%dT%H:%M:%S%.3fZ"),
        line.level.as_str().to_uppercase(),
        line.message
    )?;
    Ok(())
}

pub async fn target(services: &Services, command: TargetCommand) -> Result<()> {
    match command {
        TargetCommand::Register {
            project,
            name,
            hosts,
            cidrs,
            api_bases,
            ports,
        } => {
            let mut entries: Vec<ScopeEntry> = hosts.into_iter().map(ScopeEntry::host).collect();
            entries.extend(cidrs.into_iter().map(ScopeEntry::cidr));
            entries.extend(api_bases.into_iter().map(ScopeEntry::api_base));
            if entries.is_empty() {
                bail!("at least one --host, --cidr or --api-base is required");
            }
            let target = services
                .auth
                .register_target(&project, &name, Scope::new(entries).with_ports(ports))
                .await?;
            print_json(&target)
        }
        TargetCommand::Verify {
            target,
            proof_type,
            token,
        } => {
            let record = services.auth.verify(&target, proof_type, &token).await?;
            print_json(&record)
        }
        TargetCommand::Show { target } => {
            let found = services
                .db
                .get_target(&target)
                .await?
                .with_context(|| format!("target {} not found", target))?;
            let authorization = services
                .db
                .latest_valid_authorization(&target, Utc::now())
                .await?;
            print_json(&serde_json::json!({
                "target": found,
                "authorization": authorization,
            }))
        }
    }
}

pub async fn run(services: &Services, command: RunCommand) -> Result<()> {
    let orchestrator = &services.orchestrator;
    match command {
        RunCommand::Create {
            project,
            target,
            suite,
            unsafe_mode,
            rate_limit,
            timeout_secs,
            max_attempts,
            priority,
            options,
            created_by,
        } => {
            let suite_options = match options {
                Some(raw) => serde_json::from_str(&raw).context("--options must be valid JSON")?,
                None => serde_json::Value::Null,
            };
            let mut request = CreateRunRequest::new(project, target, suite, created_by);
            request.safe_mode = !unsafe_mode;
            request.rate_limit = rate_limit;
            request.config = RunConfig {
                timeout_secs,
                max_attempts,
                priority,
                suite: suite_options,
            };
            let run = orchestrator.create_run(request).await?;
            print_json(&run)
        }
        RunCommand::Status { run } => print_json(&orchestrator.get_run(&run).await?),
        RunCommand::List { project, status } => {
            print_json(&orchestrator.list_runs(project.as_ref(), status).await?)
        }
        RunCommand::Cancel { run, by } => print_json(&orchestrator.cancel_run(&run, &by).await?),
        RunCommand::Logs { run, follow } => {
            if follow {
                let mut lines = Box::pin(orchestrator.stream_logs(&run));
                while let Some(line) = lines.next().await {
                    print_log_line(&line?)?;
                }
            } else {
                orchestrator.get_run(&run).await?;
                let mut cursor = 0;
                loop {
                    let batch = services.db.logs_after(&run, cursor, 500).await?;
                    let Some(last) = batch.last() else {
                        break;
                    };
                    cursor = last.seq;
                    for line in &batch {
                        print_log_line(line)?;
                    }
                }
            }
            Ok(())
        }
        RunCommand::Findings { run } => print_json(&orchestrator.list_findings(&run).await?),
        RunCommand::Artifacts { run } => print_json(&orchestrator.list_artifacts(&run).await?),
        RunCommand::Audit { run } => print_json(&orchestrator.audit_trail(&run).await?),
    }
}

pub async fn queue(services: &Services, command: QueueCommand) -> Result<()> {
    match command {
        QueueCommand::Stats => print_json(&services.orchestrator.queue_stats().await?),
        QueueCommand::DeadLetters => print_json(&services.orchestrator.dead_letters().await?),
        QueueCommand::Sweep => {
            let supervisor = Supervisor::new(
                services.queue.clone(),
                services.auth.clone(),
                services.guard.clone(),
                services.cancellations.clone(),
            );
            print_json(&supervisor.sweep().await?)
        }
    }
}
