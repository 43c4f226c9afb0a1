// Copyright (c) 2026 Strata Contributors
// SPDX-License-Identifier: AGPL-3.0

//! Configuration management commands
//!
//! Commands: show, validate, generate

use anyhow::{Context, Result};
use clap::Subcommand;
use colored::Colorize;
use std::path::PathBuf;

use strata_core::domain::config::{EngineConfigManifest, CONFIG_PATH_ENV, DEFAULT_CONFIG_FILE};

#[derive(Subcommand)]
pub enum ConfigCommand {
    /// Show current configuration
    Show {
        /// Show config file paths checked
        #[arg(long)]
        paths: bool,
    },

    /// Validate configuration file
    Validate {
        /// Path to config file (default: discover)
        #[arg(value_name = "FILE")]
        file: Option<PathBuf>,
    },

    /// Write the built-in defaults as a manifest
    Generate {
        #[arg(short, long, default_value = DEFAULT_CONFIG_FILE)]
        output: PathBuf,
    },
}

pub async fn handle_command(command: ConfigCommand, config_override: Option<PathBuf>) -> Result<()> {
    match command {
        ConfigCommand::Show { paths } => show(config_override, paths),
        ConfigCommand::Validate { file } => validate(file.or(config_override)),
        ConfigCommand::Generate { output } => generate(output),
    }
}

fn show(config_override: Option<PathBuf>, show_paths: bool) -> Result<()> {
    let config = EngineConfigManifest::load_or_default(config_override.clone())
        .context("Failed to load configuration")?;

    if show_paths {
        println!("{}", "Configuration discovery paths:".bold());
        match &config_override {
            Some(path) => println!("  1. --config flag: {}", path.display()),
            None => println!("  1. --config flag: {}", "(not set)".dimmed()),
        }
        println!(
            "  2. {}: {}",
            CONFIG_PATH_ENV,
            std::env::var(CONFIG_PATH_ENV)
                .unwrap_or_else(|_| "(not set)".to_string())
                .dimmed()
        );
        println!("  3. {}", DEFAULT_CONFIG_FILE);
        println!("  4. built-in defaults");
        println!();
    }

    let spec = &config.spec;
    println!("{} {}", "Engine:".bold(), config.metadata.name);
    if let Some(version) = &config.metadata.version {
        println!("  Version: {}", version);
    }
    println!();

    println!("{}", "Rate Limits:".bold());
    let default = &spec.rate_limits.default;
    println!(
        "  default: {}/{:?} (burst {})",
        default.limit, default.window, default.burst_limit
    );
    let mut resources: Vec<_> = spec.rate_limits.resources.iter().collect();
    resources.sort_by(|a, b| a.0.cmp(b.0));
    for (name, limit) in resources {
        println!("  {}: {}/{:?} (burst {})", name, limit.limit, limit.window, limit.burst_limit);
    }
    println!();

    let approval = &spec.tool_approval;
    println!("{}", "Tool Approval:".bold());
    println!("  Approval by default: {}", approval.default_requires_approval);
    println!("  Risk threshold: {:?}", approval.risk_threshold);
    println!("  Overrides: {}", approval.tool_overrides.len());
    println!("  Trusted callers: {}", approval.trusted_callers.len());
    println!();

    let strategies = &spec.strategies;
    println!("{}", "Strategies:".bold());
    println!("  Conversational max turns: {}", strategies.conversational.max_turns);
    println!(
        "  Reasoning: {} iterations, confidence >= {}",
        strategies.reasoning.max_iterations, strategies.reasoning.confidence_threshold
    );
    println!("  Routing model fallback: {}", strategies.routing.model_fallback);
    println!(
        "  Base costs: conversational {}, deterministic {}, reasoning {}, routing {}",
        strategies.costs.conversational,
        strategies.costs.deterministic,
        strategies.costs.reasoning,
        strategies.costs.routing
    );
    println!();

    println!("{}", "Orchestrator:".bold());
    println!("  Checkpoint interval: {}", spec.orchestrator.checkpoint_interval);
    println!("  Max steps per run: {}", spec.orchestrator.max_steps_per_run);
    println!("  Event bus capacity: {}", spec.event_bus.capacity);
    println!(
        "  Logging: {} ({})",
        spec.observability.log_level, spec.observability.log_format
    );

    Ok(())
}

fn validate(config_path: Option<PathBuf>) -> Result<()> {
    println!("Validating configuration...");

    let config = EngineConfigManifest::load_or_default(config_path).context("Failed to load configuration")?;
    config.validate().context("Configuration validation failed")?;

    println!("{}", "✓ Configuration is valid".green());
    Ok(())
}

fn generate(output: PathBuf) -> Result<()> {
    EngineConfigManifest::default()
        .to_yaml_file(&output)
        .with_context(|| format!("Failed to write config to {:?}", output))?;

    println!(
        "{}",
        format!("✓ Configuration generated: {}", output.display()).green()
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_generated_config_validates() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("strata-config.yaml");

        handle_command(ConfigCommand::Generate { output: path.clone() }, None)
            .await
            .unwrap();
        handle_command(ConfigCommand::Validate { file: Some(path) }, None)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_invalid_config_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.yaml");
        std::fs::write(
            &path,
            "apiVersion: strata.dev/v1\nkind: Something\nmetadata:\n  name: x\n",
        )
        .unwrap();

        let result = handle_command(ConfigCommand::Validate { file: Some(path) }, None).await;
        assert!(result.is_err());
    }
}
