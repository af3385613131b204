// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Signing key commands
//!
//! Commands: generate, list

use anyhow::{Context, Result};
use clap::Subcommand;
use colored::Colorize;
use std::path::PathBuf;

use tuf_worker_core::infrastructure::key_source::generate_key;
use tuf_worker_core::worker_config::{KeyEntry, WorkerConfigManifest};

#[derive(Subcommand)]
pub enum KeysCommand {
    /// Generate a fresh ed25519 key
    Generate {
        /// Name recorded in the printed key entry
        #[arg(long)]
        name: Option<String>,

        /// Print a spec.keys entry instead of the plain listing
        #[arg(long)]
        yaml: bool,
    },

    /// List configured keys with their key ids
    List,
}

pub async fn handle_command(command: KeysCommand, config_override: Option<PathBuf>) -> Result<()> {
    match command {
        KeysCommand::Generate { name, yaml } => generate(name, yaml),
        KeysCommand::List => list(config_override),
    }
}

fn generate(name: Option<String>, yaml: bool) -> Result<()> {
    let key = generate_key();

    if yaml {
        let entry = KeyEntry {
            name,
            seed: Some(key.seed_hex.clone()),
            public: None,
            offline: false,
        };
        print!("{}", serde_yaml::to_string(&vec![entry])?);
        return Ok(());
    }

    println!("{}", "Generated ed25519 key".bold());
    println!("  Key ID: {}", key.key_id()?);
    println!("  Public: {}", key.public.keyval.public);
    println!("  Seed:   {}", key.seed_hex);
    println!();
    println!(
        "{}",
        "Keep the seed secret; reference it from config as `seed: env:VAR` in production."
            .yellow()
    );
    Ok(())
}

fn list(config_override: Option<PathBuf>) -> Result<()> {
    let config = WorkerConfigManifest::load_or_default(config_override)
        .context("Failed to load configuration")?;

    if config.spec.keys.is_empty() {
        println!("{}", "No keys configured".yellow());
        return Ok(());
    }

    println!("{}", "Configured keys:".bold());
    for (index, entry) in config.spec.keys.iter().enumerate() {
        let name = entry
            .name
            .clone()
            .unwrap_or_else(|| format!("#{}", index));
        let status = if entry.offline {
            "offline".dimmed()
        } else {
            "online".green()
        };
        match entry.public_key().and_then(|public| Ok(public.key_id()?)) {
            Ok(keyid) => println!("  {} {} [{}]", keyid, name.bold(), status),
            Err(e) => println!("  {} {} [{}]", "?".red(), name.bold(), e),
        }
    }
    Ok(())
}
