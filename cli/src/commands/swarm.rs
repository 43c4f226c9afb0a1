// Copyright (c) 2026 Strata Contributors
// SPDX-License-Identifier: AGPL-3.0

//! Swarm command implementations
//!
//! - `strata swarm run <file>` - plan and execute a swarm definition in-process

use anyhow::{Context, Result};
use clap::Subcommand;
use colored::Colorize;
use std::path::{Path, PathBuf};
use tracing::info;

use strata_core::domain::config::EngineConfigManifest;
use strata_core::domain::coordination::SwarmPhase;
use strata_core::domain::resources::Credits;
use strata_swarm::domain::{SwarmConfig, SwarmStatusReport};

use crate::embedded::EmbeddedEngine;

#[derive(Subcommand)]
pub enum SwarmCommand {
    /// Run a swarm definition until it completes, fails or is interrupted
    Run {
        /// Path to a swarm definition (YAML)
        #[arg(value_name = "FILE")]
        file: PathBuf,

        /// Override the swarm's credit ceiling
        #[arg(long, value_name = "N")]
        max_credits: Option<u64>,

        /// Print the final status report as JSON
        #[arg(long)]
        json: bool,
    },
}

pub async fn handle_command(command: SwarmCommand, config_override: Option<PathBuf>) -> Result<()> {
    let config = EngineConfigManifest::load_or_default(config_override).context("Failed to load configuration")?;
    match command {
        SwarmCommand::Run {
            file,
            max_credits,
            json,
        } => run(config, &file, max_credits, json).await,
    }
}

fn load(file: &Path) -> Result<SwarmConfig> {
    let content = std::fs::read_to_string(file).with_context(|| format!("Failed to read {}", file.display()))?;
    serde_yaml::from_str(&content).with_context(|| format!("Failed to parse swarm definition {}", file.display()))
}

async fn run(config: EngineConfigManifest, file: &Path, max_credits: Option<u64>, json: bool) -> Result<()> {
    let mut swarm = load(file)?;
    if let Some(credits) = max_credits {
        swarm.allocation.max_credits = Credits::from(credits);
    }

    let embedded = EmbeddedEngine::new(config)?;
    let coordinator = embedded.swarms();
    let swarm_id = coordinator.start_swarm(swarm).await.context("Swarm rejected")?;
    info!(swarm_id = %swarm_id, "Swarm started");
    if !json {
        println!("{} {}", "Swarm".cyan(), swarm_id);
    }

    coordinator.plan_swarm(swarm_id).await.context("Planning failed")?;
    let report = tokio::select! {
        report = coordinator.wait_for_completion(swarm_id) => report?,
        _ = tokio::signal::ctrl_c() => {
            println!();
            println!("{}", "Interrupted, cancelling swarm...".yellow());
            coordinator.cancel_swarm(swarm_id, "cli", "interrupted from the CLI").await?;
            coordinator.wait_for_completion(swarm_id).await?
        }
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print_report(&report);
    }
    if report.status != SwarmPhase::Completed {
        anyhow::bail!("Swarm {} ended {}", report.swarm_id, report.status);
    }
    Ok(())
}

fn print_report(report: &SwarmStatusReport) {
    let status = report.status.to_string();
    let status = if report.status == SwarmPhase::Completed {
        status.green()
    } else {
        status.red()
    };
    println!("Status:    {}", status.bold());
    println!("Progress:  {:.0}%", report.progress * 100.0);
    println!(
        "Runs:      {} completed, {} failed, {} active",
        report.completed_runs.len(),
        report.failed_runs.len(),
        report.active_runs.len()
    );
    println!("Credits:   {}", report.resource_usage.credits);
    if report.unresolved_conflicts > 0 {
        println!("Conflicts: {} unresolved", report.unresolved_conflicts);
    }
    for error in &report.errors {
        println!("  {} {}", error.code.red(), error.message);
    }
}
