// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! # TUF Repository Worker CLI
//!
//! The `tuf-worker` binary consumes repository-management tasks and
//! commits signed, versioned TUF metadata bundles.
//!
//! ## Commands
//!
//! - `tuf-worker run --tasks <FILE|->` - Worker pool over a JSON-lines task feed
//! - `tuf-worker apply <TASK_FILE>` - Execute tasks from one file and print outcomes
//! - `tuf-worker config show|validate|generate` - Configuration management
//! - `tuf-worker keys generate|list` - Signing key material
//! - `tuf-worker migrate [--dry-run]` - Apply database migrations

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use colored::Colorize;
use std::path::PathBuf;

use tuf_worker::commands::{self, ConfigCommand, KeysCommand};
use tuf_worker_core::worker_config::WorkerConfigManifest;

/// TUF repository worker - signed metadata lifecycle engine
#[derive(Parser)]
#[command(name = "tuf-worker")]
#[command(version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Path to configuration file (overrides discovery)
    #[arg(
        short,
        long,
        global = true,
        env = "TUF_WORKER_CONFIG_PATH",
        value_name = "FILE"
    )]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error); defaults to spec.logging.level
    #[arg(long, global = true, env = "TUF_WORKER_LOG_LEVEL")]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the worker pool over a JSON-lines task feed
    #[command(name = "run")]
    Run {
        #[command(flatten)]
        command: commands::RunCommand,
    },

    /// Execute the tasks in one file and print each outcome
    #[command(name = "apply")]
    Apply {
        #[command(flatten)]
        command: commands::ApplyCommand,
    },

    /// Configuration management
    #[command(name = "config")]
    Config {
        #[command(subcommand)]
        command: ConfigCommand,
    },

    /// Signing key material
    #[command(name = "keys")]
    Keys {
        #[command(subcommand)]
        command: KeysCommand,
    },

    /// Apply database migrations
    #[command(name = "migrate")]
    Migrate {
        #[command(flatten)]
        command: commands::MigrateCommand,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();

    // Logging settings come from the config file when one parses; the
    // config commands still run against a broken file so they can report it
    let logging = WorkerConfigManifest::load_or_default(cli.config.clone())
        .map(|config| config.spec.logging)
        .unwrap_or_default();
    let level = cli.log_level.clone().unwrap_or(logging.level);
    init_logging(&level, &logging.format)?;

    match cli.command {
        Some(Commands::Run { command }) => commands::run::execute(command, cli.config).await,
        Some(Commands::Apply { command }) => commands::apply::execute(command, cli.config).await,
        Some(Commands::Config { command }) => {
            commands::config::handle_command(command, cli.config).await
        }
        Some(Commands::Keys { command }) => {
            commands::keys::handle_command(command, cli.config).await
        }
        Some(Commands::Migrate { command }) => {
            commands::migrate::execute(command, cli.config).await
        }
        None => {
            eprintln!("{}", "No command specified. Use --help for usage.".yellow());
            std::process::exit(1);
        }
    }
}

/// Initialize tracing subscriber for logging
fn init_logging(level: &str, format: &str) -> Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .or_else(|_| tracing_subscriber::EnvFilter::try_new(level))
        .context("Failed to create log filter")?;

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false);

    if format == "json" {
        builder.json().init();
    } else {
        builder.compact().init();
    }

    Ok(())
}
