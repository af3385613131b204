// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Single-shot task execution
//!
//! Executes the task (or JSON array of tasks) in one file, in order, and
//! prints each outcome. With `--output-dir`, the current documents of
//! every touched repository are written out under consistent-snapshot
//! file names, which makes the in-memory backend usable for one-off
//! repository builds.

use anyhow::{Context, Result};
use clap::Args;
use colored::Colorize;
use serde_json::Value;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use tracing::debug;

use tuf_worker_core::application::{TaskExecutor, TaskOutcome};
use tuf_worker_core::repository::RepositoryId;
use tuf_worker_core::task::TaskEnvelope;
use tuf_worker_core::worker_config::WorkerConfigManifest;

use super::run::format_versions;
use crate::runtime::WorkerRuntime;

#[derive(Args)]
pub struct ApplyCommand {
    /// JSON file holding one task object or an array of tasks
    #[arg(value_name = "TASK_FILE")]
    file: PathBuf,

    /// Write the resulting metadata documents into this directory
    #[arg(long, value_name = "DIR")]
    output_dir: Option<PathBuf>,
}

pub async fn execute(cmd: ApplyCommand, config_override: Option<PathBuf>) -> Result<()> {
    let content = std::fs::read(&cmd.file)
        .with_context(|| format!("Failed to read task file {:?}", cmd.file))?;
    let tasks = parse_tasks(&content)?;

    let config = WorkerConfigManifest::load_or_default(config_override)
        .context("Failed to load configuration")?;
    let runtime = WorkerRuntime::build(&config).await?;

    let touched = apply_all(&runtime.executor, tasks).await?;

    if let Some(dir) = &cmd.output_dir {
        for repository in &touched {
            let written = write_documents(&runtime.executor, repository, dir).await?;
            println!(
                "{}",
                format!("✓ Wrote {} documents for {} to {}", written, repository, dir.display())
                    .green()
            );
        }
    }

    Ok(())
}

/// Execute in order, stopping at the first rejected task
pub async fn apply_all(
    executor: &TaskExecutor,
    tasks: Vec<TaskEnvelope>,
) -> Result<BTreeSet<RepositoryId>> {
    let mut touched = BTreeSet::new();
    for envelope in tasks {
        let label = format!("{} {}", envelope.task.task_type(), envelope.repository);
        match executor.execute(&envelope).await {
            Ok(TaskOutcome::Committed {
                identity,
                versions,
                attempts,
            }) => {
                println!("{} {}", "✓".green(), label.bold());
                println!("  Versions: {}", format_versions(&versions));
                println!("  Bundle:   {}", identity);
                if attempts > 1 {
                    println!("  Attempts: {}", attempts);
                }
            }
            Ok(TaskOutcome::Unchanged { identity }) => {
                println!("{} {} (unchanged)", "=".dimmed(), label.bold());
                println!("  Bundle:   {}", identity);
            }
            Err(e) => {
                println!("{} {}", "✗".red(), label.bold());
                anyhow::bail!("Task rejected [{}]: {}", e.kind(), e);
            }
        }
        touched.insert(envelope.repository);
    }
    Ok(touched)
}

/// One task object, or an array of them
pub fn parse_tasks(content: &[u8]) -> Result<Vec<TaskEnvelope>> {
    let value: Value = serde_json::from_slice(content).context("Task file is not valid JSON")?;
    let values = match value {
        Value::Array(values) => values,
        other => vec![other],
    };
    values
        .into_iter()
        .enumerate()
        .map(|(index, value)| {
            TaskEnvelope::from_value(value).with_context(|| format!("Task #{} is invalid", index))
        })
        .collect()
}

/// Write each current document as `<version>.<role>.json` (timestamp as
/// `timestamp.json`) plus the unversioned `<role>.json`.
pub async fn write_documents(
    executor: &TaskExecutor,
    repository: &RepositoryId,
    dir: &Path,
) -> Result<usize> {
    let stored = executor
        .store()
        .load_current(repository)
        .await?
        .with_context(|| format!("Repository {} is not initialized", repository))?;

    let relative = Path::new(repository.as_str());
    if !relative
        .components()
        .all(|c| matches!(c, std::path::Component::Normal(_)))
    {
        anyhow::bail!("Repository id {} is not a relative path", repository);
    }
    let target = dir.join(relative);
    std::fs::create_dir_all(&target)
        .with_context(|| format!("Failed to create {:?}", target))?;

    let documents = stored.bundle.documents()?;
    for document in &documents {
        let mut names = BTreeSet::new();
        names.insert(document.role.published_filename(document.version));
        names.insert(document.role.metadata_filename());
        for name in names {
            let path = target.join(&name);
            debug!(path = %path.display(), "Writing document");
            std::fs::write(&path, &document.bytes)
                .with_context(|| format!("Failed to write {:?}", path))?;
        }
    }
    Ok(documents.len())
}
