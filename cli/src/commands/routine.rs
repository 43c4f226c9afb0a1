// Copyright (c) 2026 Strata Contributors
// SPDX-License-Identifier: AGPL-3.0

//! Routine command implementations
//!
//! - `strata routine validate <file>` - parse a routine manifest and dry-run it
//! - `strata routine run <file>` - execute a routine on the embedded engine

use anyhow::{Context, Result};
use clap::Subcommand;
use colored::Colorize;
use std::path::{Path, PathBuf};
use tracing::info;

use strata_core::application::routine_orchestrator::{RunConfig, RunOutcome};
use strata_core::domain::config::EngineConfigManifest;
use strata_core::domain::process::RunId;
use strata_core::domain::resources::{Credits, ResourceAllocation};
use strata_core::infrastructure::routine_parser::{ParsedRoutine, RoutineParser};

use crate::embedded::{default_allocation, parse_inputs, EmbeddedEngine};

#[derive(Subcommand)]
pub enum RoutineCommand {
    /// Parse a routine manifest and walk it without dispatching any step
    Validate {
        /// Path to routine manifest YAML file
        #[arg(value_name = "FILE")]
        file: PathBuf,
    },

    /// Execute a routine in-process
    Run {
        /// Path to routine manifest YAML file
        #[arg(value_name = "FILE")]
        file: PathBuf,

        /// Routine inputs (key=value, values parsed as JSON when possible)
        #[arg(long = "input", short = 'i', value_name = "KEY=VALUE")]
        inputs: Vec<String>,

        /// Walk the graph with placeholders instead of executing steps
        #[arg(long)]
        dry_run: bool,

        /// Override the credit ceiling of the run
        #[arg(long, value_name = "N")]
        max_credits: Option<u64>,

        /// Print the outcome as JSON
        #[arg(long)]
        json: bool,
    },
}

pub async fn handle_command(command: RoutineCommand, config_override: Option<PathBuf>) -> Result<()> {
    let config = EngineConfigManifest::load_or_default(config_override).context("Failed to load configuration")?;
    match command {
        RoutineCommand::Validate { file } => validate(config, &file).await,
        RoutineCommand::Run {
            file,
            inputs,
            dry_run,
            max_credits,
            json,
        } => run(config, &file, &inputs, dry_run, max_credits, json).await,
    }
}

fn load(file: &Path) -> Result<ParsedRoutine> {
    RoutineParser::parse_file(file).with_context(|| format!("Failed to parse routine manifest {}", file.display()))
}

fn allocation_for(parsed: &ParsedRoutine, max_credits: Option<u64>) -> ResourceAllocation {
    let mut allocation = parsed.allocation.clone().unwrap_or_else(default_allocation);
    if let Some(credits) = max_credits {
        allocation.max_credits = Credits::from(credits);
    }
    allocation
}

async fn validate(config: EngineConfigManifest, file: &Path) -> Result<()> {
    println!("{}", "Validating routine manifest...".cyan());
    println!("   File: {}", file.display());
    println!();

    let parsed = load(file)?;
    let routine = &parsed.routine;
    let allocation = allocation_for(&parsed, None);
    let embedded = EmbeddedEngine::new(config)?;
    let orchestrator = embedded.engine().orchestrator();

    let outcome = orchestrator
        .run(RunConfig::new(routine.clone(), allocation).dry_run())
        .await
        .context("Dry run could not start")?;
    let status = orchestrator.get_run_status(outcome.run_id).await?;
    if !outcome.is_completed() {
        print_errors(&outcome);
        anyhow::bail!("Dry run ended {}", outcome.status);
    }

    println!("{}", "✓ Routine is valid".green().bold());
    println!();
    println!("Routine Details:");
    println!("  Id:      {}", routine.id);
    println!("  Name:    {}", routine.name);
    println!("  Kind:    {}", if routine.is_composite() { "multi_step" } else { "single_step" });
    println!("  Inputs:  {}", names(routine.inputs.iter().map(|i| i.name.as_str())));
    println!("  Outputs: {}", names(routine.outputs.iter().map(|o| o.name.as_str())));
    println!("  Steps:   {}", status.skipped_steps.len());
    for step in &status.skipped_steps {
        println!("    - {}", step);
    }
    Ok(())
}

async fn run(
    config: EngineConfigManifest,
    file: &Path,
    inputs: &[String],
    dry_run: bool,
    max_credits: Option<u64>,
    json: bool,
) -> Result<()> {
    let parsed = load(file)?;
    let inputs = parse_inputs(inputs)?;
    let allocation = allocation_for(&parsed, max_credits);
    let embedded = EmbeddedEngine::new(config)?;
    let orchestrator = embedded.engine().orchestrator();

    let mut run_config = RunConfig::new(parsed.routine, allocation).with_inputs(inputs);
    if dry_run {
        run_config = run_config.dry_run();
    }
    let run_id = orchestrator.start_run(run_config).await.context("Run rejected")?;
    info!(run_id = %run_id, "Run started");
    if !json {
        println!("{} {}", "Run".cyan(), run_id);
    }

    let mut execution = tokio::spawn({
        let orchestrator = orchestrator.clone();
        async move { orchestrator.execute_run(run_id).await }
    });
    let joined = tokio::select! {
        joined = &mut execution => joined,
        _ = tokio::signal::ctrl_c() => {
            cancel(&embedded, run_id).await?;
            execution.await
        }
    };
    let outcome = joined.context("Run task aborted")?.context("Run could not execute")?;

    if json {
        println!("{}", serde_json::to_string_pretty(&outcome)?);
    } else {
        print_outcome(&outcome);
    }
    if !outcome.is_completed() {
        anyhow::bail!("Run {} ended {}", outcome.run_id, outcome.status);
    }
    Ok(())
}

async fn cancel(embedded: &EmbeddedEngine, run_id: RunId) -> Result<()> {
    println!();
    println!("{}", "Interrupted, cancelling run...".yellow());
    embedded
        .engine()
        .orchestrator()
        .cancel_run(run_id, "interrupted from the CLI")
        .await?;
    Ok(())
}

fn print_outcome(outcome: &RunOutcome) {
    let status = outcome.status.to_string();
    let status = if outcome.is_completed() { status.green() } else { status.red() };
    println!("Status:  {}", status.bold());
    println!(
        "Usage:   {} credits, {} tokens, {} tool calls, {}ms",
        outcome.resource_usage.credits,
        outcome.resource_usage.tokens,
        outcome.resource_usage.tool_calls,
        outcome.resource_usage.duration_ms
    );
    if !outcome.outputs.is_empty() {
        println!("Outputs:");
        for (key, value) in &outcome.outputs {
            println!("  {}: {}", key, value);
        }
    }
    print_errors(outcome);
}

fn print_errors(outcome: &RunOutcome) {
    for error in &outcome.errors {
        println!("  {} {}", error.code.red(), error.message);
    }
}

fn names<'a>(names: impl Iterator<Item = &'a str>) -> String {
    let joined: Vec<&str> = names.collect();
    if joined.is_empty() {
        "(none)".to_string()
    } else {
        joined.join(", ")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const ECHO: &str = r#"
apiVersion: strata.dev/v1
kind: Routine
metadata:
  name: echo
spec:
  inputs:
    - name: text
  outputs:
    - name: copy
  type: single_step
  step:
    transforms:
      - op: copy
        mappings:
          copy: text
"#;

    fn manifest() -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(ECHO.as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_missing_allocation_falls_back_and_credits_override() {
        let parsed = RoutineParser::parse_yaml(ECHO).unwrap();
        assert_eq!(allocation_for(&parsed, None), default_allocation());
        assert_eq!(allocation_for(&parsed, Some(7)).max_credits, Credits::new(7));
    }

    #[tokio::test]
    async fn test_validate_dry_runs_the_manifest() {
        let file = manifest();
        validate(EngineConfigManifest::default(), file.path()).await.unwrap();
    }

    #[tokio::test]
    async fn test_run_copies_input() {
        let file = manifest();
        run(
            EngineConfigManifest::default(),
            file.path(),
            &["text=hello".to_string()],
            false,
            None,
            true,
        )
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_run_fails_when_required_input_is_missing() {
        let file = manifest();
        let result = run(EngineConfigManifest::default(), file.path(), &[], false, None, true).await;
        assert!(result.is_err());
    }
}
