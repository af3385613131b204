// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Worker pool command
//!
//! Reads a JSON-lines task feed (file or stdin) into the in-memory queue
//! and drains it through the task worker. Ctrl+C or SIGTERM stops intake;
//! in-flight tasks finish before the process exits.
//!
//! ```bash
//! tuf-worker run --tasks tasks.jsonl
//! cat tasks.jsonl | tuf-worker run --tasks -
//! ```

use anyhow::{Context, Result};
use clap::Args;
use colored::Colorize;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncBufRead, BufReader};
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use tuf_worker_core::application::TaskWorker;
use tuf_worker_core::events::TaskEvent;
use tuf_worker_core::infrastructure::event_bus::{EventBusError, EventReceiver};
use tuf_worker_core::infrastructure::queue::{enqueue_json_lines, InMemoryTaskQueue};
use tuf_worker_core::worker_config::WorkerConfigManifest;

use crate::runtime::WorkerRuntime;

#[derive(Args)]
pub struct RunCommand {
    /// JSON-lines task feed, or `-` for stdin
    #[arg(long, value_name = "FILE|-")]
    tasks: String,

    /// Override spec.executor.max_concurrent_tasks
    #[arg(long)]
    concurrency: Option<usize>,
}

/// Per-outcome task counts collected from the event bus
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RunSummary {
    pub committed: usize,
    pub unchanged: usize,
    pub rejected: usize,
    pub conflicts: usize,
}

impl RunSummary {
    fn record(&mut self, event: &TaskEvent) {
        match event {
            TaskEvent::TaskCommitted {
                repository,
                versions,
                ..
            } => {
                self.committed += 1;
                println!("{} {} {}", "✓".green(), repository, format_versions(versions));
            }
            TaskEvent::TaskUnchanged { repository, .. } => {
                self.unchanged += 1;
                println!("{} {} unchanged", "=".dimmed(), repository);
            }
            TaskEvent::TaskRejected {
                repository,
                kind,
                reason,
                ..
            } => {
                self.rejected += 1;
                println!("{} {} [{}] {}", "✗".red(), repository, kind, reason);
            }
            TaskEvent::CommitConflict { .. } => self.conflicts += 1,
            TaskEvent::TaskReceived { .. } => {}
        }
    }
}

pub fn format_versions(versions: &std::collections::BTreeMap<String, u64>) -> String {
    versions
        .iter()
        .map(|(role, version)| format!("{}=v{}", role, version))
        .collect::<Vec<_>>()
        .join(" ")
}

pub async fn execute(cmd: RunCommand, config_override: Option<PathBuf>) -> Result<()> {
    let config = WorkerConfigManifest::load_or_default(config_override)
        .context("Failed to load configuration")?;
    let runtime = WorkerRuntime::build(&config).await?;

    let concurrency = cmd
        .concurrency
        .unwrap_or(config.spec.executor.max_concurrent_tasks);
    info!(
        concurrency,
        max_deliveries = config.spec.executor.max_deliveries,
        "Starting TUF worker"
    );

    let queue = Arc::new(InMemoryTaskQueue::new());
    let feeder = {
        let queue = queue.clone();
        let source = cmd.tasks.clone();
        tokio::spawn(async move {
            let result = match open_feed(&source).await {
                Ok(reader) => enqueue_json_lines(&queue, reader).await,
                Err(e) => Err(e),
            };
            queue.close();
            result
        })
    };

    let stop_reporting = CancellationToken::new();
    let reporter = tokio::spawn(report_events(
        runtime.event_bus.subscribe(),
        stop_reporting.clone(),
    ));

    let worker = TaskWorker::new(
        queue.clone(),
        runtime.executor.clone(),
        concurrency,
        config.spec.executor.max_deliveries,
    );
    worker.run(shutdown_signal()).await?;

    stop_reporting.cancel();
    let summary = reporter.await.context("Event reporter panicked")?;

    let enqueued = match feeder.await {
        Ok(Ok(count)) => count,
        Ok(Err(e)) => {
            error!("Task feed failed: {:#}", e);
            0
        }
        Err(e) => {
            error!("Task feed panicked: {}", e);
            0
        }
    };

    println!();
    println!("{}", "Run summary:".bold());
    println!("  Enqueued:     {}", enqueued);
    println!("  Committed:    {}", summary.committed.to_string().green());
    println!("  Unchanged:    {}", summary.unchanged);
    println!("  Rejected:     {}", summary.rejected.to_string().red());
    println!("  Conflicts:    {}", summary.conflicts);
    println!("  Dead letters: {}", queue.dead_letters().len());
    if queue.pending() > 0 {
        println!(
            "{}",
            format!("  {} tasks left unprocessed", queue.pending()).yellow()
        );
    }

    Ok(())
}

async fn open_feed(source: &str) -> Result<Box<dyn AsyncBufRead + Send + Unpin>> {
    if source == "-" {
        return Ok(Box::new(BufReader::new(tokio::io::stdin())));
    }
    let file = tokio::fs::File::open(source)
        .await
        .with_context(|| format!("Failed to open task feed {}", source))?;
    Ok(Box::new(BufReader::new(file)))
}

/// Print events until cancelled, then drain what is already buffered
pub async fn report_events(mut events: EventReceiver, stop: CancellationToken) -> RunSummary {
    let mut summary = RunSummary::default();
    loop {
        tokio::select! {
            _ = stop.cancelled() => break,
            event = events.recv() => match event {
                Ok(event) => summary.record(&event),
                Err(EventBusError::Lagged(_)) => continue,
                Err(_) => return summary,
            },
        }
    }
    loop {
        match events.try_recv() {
            Ok(event) => summary.record(&event),
            Err(EventBusError::Lagged(_)) => continue,
            Err(_) => return summary,
        }
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C signal");
        },
        _ = terminate => {
            info!("Received SIGTERM signal");
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use std::collections::BTreeMap;
    use tuf_worker_core::bundle::BundleIdentity;
    use tuf_worker_core::infrastructure::event_bus::EventBus;
    use tuf_worker_core::repository::RepositoryId;
    use tuf_worker_core::task::TaskId;

    #[test]
    fn test_format_versions() {
        let versions = BTreeMap::from([
            ("snapshot".to_string(), 2),
            ("targets".to_string(), 2),
            ("timestamp".to_string(), 2),
        ]);
        assert_eq!(format_versions(&versions), "snapshot=v2 targets=v2 timestamp=v2");
    }

    #[tokio::test]
    async fn test_reporter_drains_buffered_events_after_cancel() {
        let bus = EventBus::with_default_capacity();
        let receiver = bus.subscribe();
        let repository = RepositoryId::new("acme/widgets");

        bus.publish(TaskEvent::TaskCommitted {
            task_id: TaskId::new(),
            repository: repository.clone(),
            identity: BundleIdentity("ab".repeat(32)),
            versions: BTreeMap::new(),
            attempts: 1,
            committed_at: Utc::now(),
        });
        bus.publish(TaskEvent::TaskRejected {
            task_id: TaskId::new(),
            repository,
            kind: "input".to_string(),
            reason: "unknown path".to_string(),
            rejected_at: Utc::now(),
        });

        let stop = CancellationToken::new();
        stop.cancel();
        let summary = report_events(receiver, stop).await;
        assert_eq!(summary.committed, 1);
        assert_eq!(summary.rejected, 1);
    }
}
