// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Queue consumer.
//!
//! Pulls deliveries off a [`TaskQueue`] and runs up to
//! `max_concurrent_tasks` of them at once through the [`TaskExecutor`].
//! Holds no repository state between tasks; every task loads its own
//! baseline from the store.

use std::future::Future;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::application::executor::{TaskError, TaskExecutor};
use crate::domain::queue::{Delivery, TaskQueue};
use crate::domain::task::TaskEnvelope;

pub struct TaskWorker {
    queue: Arc<dyn TaskQueue>,
    executor: Arc<TaskExecutor>,
    semaphore: Arc<Semaphore>,
    max_deliveries: u32,
}

/// What to tell the queue about a finished delivery
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Disposition {
    Ack,
    Requeue,
    DeadLetter,
}

impl TaskWorker {
    pub fn new(
        queue: Arc<dyn TaskQueue>,
        executor: Arc<TaskExecutor>,
        max_concurrent_tasks: usize,
        max_deliveries: u32,
    ) -> Self {
        Self {
            queue,
            executor,
            semaphore: Arc::new(Semaphore::new(max_concurrent_tasks.max(1))),
            max_deliveries,
        }
    }

    /// Consume until the queue is drained and closed, or `shutdown`
    /// resolves. In-flight tasks always run to completion.
    pub async fn run(&self, shutdown: impl Future<Output = ()>) -> anyhow::Result<()> {
        tokio::pin!(shutdown);
        let mut in_flight = JoinSet::new();

        loop {
            let permit = tokio::select! {
                _ = &mut shutdown => {
                    info!("Shutdown requested, waiting for in-flight tasks");
                    break;
                }
                permit = self.semaphore.clone().acquire_owned() => permit?,
            };

            let delivery = tokio::select! {
                _ = &mut shutdown => {
                    info!("Shutdown requested, waiting for in-flight tasks");
                    break;
                }
                next = self.queue.next_task() => next?,
            };
            let Some(delivery) = delivery else {
                debug!("Task queue drained");
                break;
            };

            let queue = self.queue.clone();
            let executor = self.executor.clone();
            let max_deliveries = self.max_deliveries;
            in_flight.spawn(async move {
                let _permit = permit;
                let id = delivery.delivery_id;
                let disposition = process(&executor, &delivery, max_deliveries).await;
                let result = match disposition {
                    Disposition::Ack => queue.ack(id).await,
                    Disposition::Requeue => queue.nack(id, true).await,
                    Disposition::DeadLetter => queue.nack(id, false).await,
                };
                if let Err(e) = result {
                    error!(delivery = %id, "Failed to settle delivery: {}", e);
                }
            });

            // Reap finished tasks so the set does not grow unbounded
            while let Some(joined) = in_flight.try_join_next() {
                if let Err(e) = joined {
                    error!("Task panicked: {}", e);
                }
            }
        }

        while let Some(joined) = in_flight.join_next().await {
            if let Err(e) = joined {
                error!("Task panicked: {}", e);
            }
        }
        Ok(())
    }
}

async fn process(executor: &TaskExecutor, delivery: &Delivery, max_deliveries: u32) -> Disposition {
    let envelope = match TaskEnvelope::from_slice(&delivery.payload) {
        Ok(envelope) => envelope,
        Err(e) => {
            warn!(delivery = %delivery.delivery_id, "Rejecting malformed task: {}", e);
            metrics::counter!("tuf_worker_tasks_total", "outcome" => "input").increment(1);
            return Disposition::DeadLetter;
        }
    };

    match executor.execute(&envelope).await {
        Ok(_) => Disposition::Ack,
        Err(e) => disposition_for(&e, delivery.attempt, max_deliveries, &envelope),
    }
}

fn disposition_for(
    error: &TaskError,
    attempt: u32,
    max_deliveries: u32,
    envelope: &TaskEnvelope,
) -> Disposition {
    if !error.is_retryable() {
        return Disposition::DeadLetter;
    }
    if attempt < max_deliveries {
        debug!(task_id = %envelope.task_id, attempt, "Requeueing transient failure");
        return Disposition::Requeue;
    }
    error!(
        task_id = %envelope.task_id,
        repository = %envelope.repository,
        attempts = attempt,
        "Task aborted after repeated transient failures: {}",
        error
    );
    metrics::counter!("tuf_worker_tasks_total", "outcome" => "aborted").increment(1);
    Disposition::DeadLetter
}
