// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Database Migration Command
//!
//! Implements `tuf-worker migrate`, which applies the embedded SQL
//! migrations for the PostgreSQL repository state store.
//!
//! # Usage
//!
//! ```bash
//! # Apply all pending migrations
//! tuf-worker migrate
//!
//! # Preview migrations without applying
//! tuf-worker migrate --dry-run
//! ```
//!
//! # Environment
//!
//! The database URL comes from `spec.storage` (backend `postgres`) or the
//! `TUF_WORKER_DATABASE_URL` override.

use anyhow::{Context, Result};
use clap::Args;
use colored::Colorize;
use sqlx::postgres::PgPoolOptions;
use std::path::PathBuf;

use tuf_worker_core::worker_config::{StorageConfig, WorkerConfigManifest};

static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!("./migrations");

#[derive(Args)]
pub struct MigrateCommand {
    /// Perform a dry run without applying changes
    #[arg(long)]
    dry_run: bool,
}

pub async fn execute(cmd: MigrateCommand, config_override: Option<PathBuf>) -> Result<()> {
    println!("{}", "TUF Worker Migrate".bold().green());

    let config = WorkerConfigManifest::load_or_default(config_override)
        .context("Failed to load configuration")?;
    let database_url = match &config.spec.storage {
        StorageConfig::Postgres {
            connection_string, ..
        } => connection_string.clone(),
        StorageConfig::InMemory => anyhow::bail!(
            "spec.storage is in_memory and TUF_WORKER_DATABASE_URL is not set. Nothing to migrate."
        ),
    };

    println!("Connecting to database...");
    let pool = PgPoolOptions::new()
        .max_connections(1)
        .connect(&database_url)
        .await
        .context("Failed to connect to database")?;

    // The bookkeeping table does not exist before the first run
    let applied_count = sqlx::query("SELECT version FROM _sqlx_migrations")
        .fetch_all(&pool)
        .await
        .map(|rows| rows.len())
        .unwrap_or(0);

    let total_migrations = MIGRATOR.iter().count();

    println!(
        "Migration status: {} applied, {} total available.",
        applied_count, total_migrations
    );

    if applied_count < total_migrations {
        if cmd.dry_run {
            println!("Pending migrations found (Dry Run):");
            for migration in MIGRATOR.iter().skip(applied_count) {
                println!(" - {} {}", migration.version, migration.description);
            }
            println!("Skipping application due to --dry-run");
            return Ok(());
        }

        println!("Applying pending migrations...");
        MIGRATOR
            .run(&pool)
            .await
            .context("Failed to apply migrations")?;
        println!("{}", "✓ Database updated successfully.".green());
    } else {
        println!("{}", "✓ Database is up to date.".green());
    }

    Ok(())
}
