// Copyright (c) 2026 Strata Contributors
// SPDX-License-Identifier: AGPL-3.0

//! # Strata CLI
//!
//! The `strata` binary hosts the three execution tiers in-process.
//!
//! ## Commands
//!
//! - `strata config show|validate|generate` - Configuration management
//! - `strata routine validate|run <file>` - Dry-run or execute a routine
//! - `strata swarm run <file>` - Execute a swarm definition

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use colored::Colorize;
use std::path::PathBuf;

use strata_cli::commands::{self, ConfigCommand, RoutineCommand, SwarmCommand};
use strata_core::domain::config::EngineConfigManifest;

/// Strata - tiered execution core for agent swarms
#[derive(Parser)]
#[command(name = "strata")]
#[command(version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Path to configuration file (overrides discovery)
    #[arg(short, long, global = true, env = "STRATA_CONFIG_PATH", value_name = "FILE")]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, global = true, env = "STRATA_LOG_LEVEL")]
    log_level: Option<String>,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Configuration management
    #[command(name = "config")]
    Config {
        #[command(subcommand)]
        command: ConfigCommand,
    },

    /// Routine operations
    #[command(name = "routine")]
    Routine {
        #[command(subcommand)]
        command: RoutineCommand,
    },

    /// Swarm operations
    #[command(name = "swarm")]
    Swarm {
        #[command(subcommand)]
        command: SwarmCommand,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Flags win over the manifest's observability section.
    let observability = EngineConfigManifest::load_or_default(cli.config.clone())
        .map(|c| c.spec.observability)
        .unwrap_or_default();
    let level = cli.log_level.clone().unwrap_or(observability.log_level);
    let json = cli.log_json || observability.log_format == "json";
    init_logging(&level, json)?;

    match cli.command {
        Some(Commands::Config { command }) => commands::config::handle_command(command, cli.config).await,
        Some(Commands::Routine { command }) => commands::routine::handle_command(command, cli.config).await,
        Some(Commands::Swarm { command }) => commands::swarm::handle_command(command, cli.config).await,
        None => {
            eprintln!("{}", "No command specified. Use --help for usage.".yellow());
            std::process::exit(1);
        }
    }
}

/// Initialize tracing subscriber for logging
fn init_logging(level: &str, json: bool) -> Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .or_else(|_| tracing_subscriber::EnvFilter::try_new(level))
        .context("Failed to create log filter")?;

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr);
    if json {
        builder.json().init();
    } else {
        builder.compact().init();
    }

    Ok(())
}
