//! fleetd — the fleet scheduler daemon.
//!
//! Wires configuration, logging, and the scheduler together. The cloud
//! backends live outside this workspace, so the binary offers:
//! - `check-config`: load, validate, and print the effective configuration
//! - `simulate`: drive the scheduler against an in-process fleet
//!
//! # Usage
//!
//! ```text
//! fleetd --config fleet.toml check-config
//! fleetd simulate --hosts 5 --requests 40 --rounds 3
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use fleet_core::memory::InMemoryBackend;
use fleet_core::{FleetConfig, SchedulingRequest, TracingEventSink, epoch_secs};
use fleet_scheduler::{Scheduler, SchedulingError};
use serde_json::json;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "fleetd", about = "Build-agent fleet scheduler")]
struct Cli {
    /// Configuration file. Defaults apply when it does not exist.
    #[arg(long, global = true, default_value = "fleet.toml")]
    config: PathBuf,

    /// Emit logs as JSON lines.
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Validate the configuration and print it with defaults filled in.
    CheckConfig,

    /// Schedule synthetic requests against an in-memory fleet.
    Simulate {
        /// Hosts registered before the first request.
        #[arg(long, default_value = "5")]
        hosts: u32,

        /// Requests submitted per round.
        #[arg(long, default_value = "20")]
        requests: u32,

        /// Rounds; requests that found no capacity are resubmitted.
        #[arg(long, default_value = "3")]
        rounds: u32,

        /// Upper bound for the fleet group.
        #[arg(long, default_value = "50")]
        max_hosts: u32,

        /// CPU units per request. Defaults to the minimal container.
        #[arg(long)]
        cpu: Option<u32>,

        /// Memory (MiB) per request. Defaults to the minimal container.
        #[arg(long)]
        memory: Option<u32>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_json);

    let config = FleetConfig::from_file_or_default(&cli.config)
        .with_context(|| format!("loading {}", cli.config.display()))?;

    match cli.command {
        Command::CheckConfig => {
            print!("{}", config.to_toml_string()?);
            Ok(())
        }
        Command::Simulate {
            hosts,
            requests,
            rounds,
            max_hosts,
            cpu,
            memory,
        } => {
            let cpu = cpu.unwrap_or(config.scheduler.min_container_cpu);
            let memory = memory.unwrap_or(config.scheduler.min_container_memory);
            simulate(config, hosts, requests, rounds, max_hosts, (cpu, memory)).await
        }
    }
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,fleetd=debug,fleet_scheduler=debug,fleet_autoscale=debug"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

async fn simulate(
    config: FleetConfig,
    hosts: u32,
    requests: u32,
    rounds: u32,
    max_hosts: u32,
    (cpu, memory): (u32, u32),
) -> anyhow::Result<()> {
    info!(hosts, requests, rounds, cpu, memory, "simulation starting");

    let now = epoch_secs();
    let profile = config.default_profile();
    let backend = InMemoryBackend::new(config.cluster.fleet_group.clone(), max_hosts);
    for i in 0..hosts {
        // Spread initial load between empty and 90% used.
        let share = (i * 3 % 10) as f64 / 10.0;
        let used_cpu = (f64::from(profile.cpu) * share) as u32;
        let used_memory = (f64::from(profile.memory) * share) as u32;
        backend.add_host(&profile, used_cpu, used_memory, now.saturating_sub(20 * 60));
    }
    backend.auto_provision(profile.clone(), now);

    let scheduler = Scheduler::spawn(Arc::new(backend.clone()), Arc::new(TracingEventSink), &config);

    let mut pending: Vec<SchedulingRequest> = (0..requests)
        .map(|i| {
            SchedulingRequest::new("SIM-PLAN-JOB", format!("SIM-PLAN-JOB-{i}"), cpu, memory)
                .with_payload(json!({ "result": i }))
        })
        .collect();
    let mut placed = 0usize;
    let mut failed = 0usize;

    for round in 1..=rounds {
        if pending.is_empty() {
            break;
        }
        let waits: Vec<_> = pending
            .iter()
            .cloned()
            .map(|req| {
                let handle = scheduler.handle();
                tokio::spawn(async move {
                    let outcome = handle.schedule_and_wait(req.clone()).await;
                    (req, outcome)
                })
            })
            .collect();

        let mut retry = Vec::new();
        for wait in waits {
            let (req, outcome) = wait.await.context("request task panicked")?;
            match outcome {
                Ok(result) => {
                    placed += 1;
                    info!(result_id = %req.result_id, instance = %result.instance_id, "placed");
                }
                Err(e) if e == SchedulingError::CapacityExhausted => retry.push(req),
                Err(e) => {
                    failed += 1;
                    warn!(result_id = %req.result_id, error = %e, "request failed");
                }
            }
        }
        scheduler.sync().await?;
        info!(round, retrying = retry.len(), fleet_size = backend.members().len(), "round finished");
        pending = retry;
    }

    scheduler.shutdown().await;

    let report = json!({
        "placed": placed,
        "failed": failed,
        "unplaced": pending.len(),
        "scale_requests": backend.scale_requests(),
        "terminated": backend.detached().len(),
        "fleet_size": backend.members().len(),
    });
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}
