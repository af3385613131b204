// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Runtime wiring
//!
//! Builds the task executor from a validated configuration manifest:
//! state store backend, local key source, threshold signer, planner and
//! event bus.

use anyhow::{Context, Result};
use std::sync::Arc;
use tracing::info;

use tuf_worker_core::application::{ExecutorSettings, TaskExecutor};
use tuf_worker_core::infrastructure::db::Database;
use tuf_worker_core::infrastructure::event_bus::EventBus;
use tuf_worker_core::infrastructure::key_source::LocalKeySource;
use tuf_worker_core::infrastructure::repositories::{
    InMemoryRepositoryStateStore, PostgresRepositoryStateStore,
};
use tuf_worker_core::planner::Planner;
use tuf_worker_core::repository::RepositoryStateStore;
use tuf_worker_core::signer::ThresholdSigner;
use tuf_worker_core::worker_config::{StorageConfig, WorkerConfigManifest};

pub struct WorkerRuntime {
    pub executor: Arc<TaskExecutor>,
    pub event_bus: Arc<EventBus>,
}

impl WorkerRuntime {
    pub async fn build(config: &WorkerConfigManifest) -> Result<Self> {
        config
            .validate()
            .context("Configuration validation failed")?;

        let store = build_store(&config.spec.storage).await?;

        let key_source = LocalKeySource::from_entries(&config.spec.keys)
            .context("Failed to load signing keys")?;
        let signer = Arc::new(ThresholdSigner::new(Arc::new(key_source)));

        let event_bus = Arc::new(EventBus::with_default_capacity());
        let executor = Arc::new(TaskExecutor::new(
            store,
            signer,
            Planner::new(config.spec.expiration.clone()),
            config.spec.initial_roles.clone(),
            event_bus.clone(),
            ExecutorSettings::from(&config.spec.executor),
        ));

        Ok(Self {
            executor,
            event_bus,
        })
    }
}

async fn build_store(storage: &StorageConfig) -> Result<Arc<dyn RepositoryStateStore>> {
    match storage {
        StorageConfig::InMemory => {
            info!("Using in-memory repository state store");
            Ok(Arc::new(InMemoryRepositoryStateStore::new()))
        }
        StorageConfig::Postgres {
            connection_string,
            max_connections,
        } => {
            info!("Connecting to PostgreSQL state store");
            let db = Database::new(connection_string, *max_connections)
                .await
                .context("Failed to connect to database")?;
            Ok(Arc::new(PostgresRepositoryStateStore::new(
                db.get_pool().clone(),
            )))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tuf_worker_core::infrastructure::key_source::generate_key;
    use tuf_worker_core::worker_config::KeyEntry;

    #[tokio::test]
    async fn test_build_in_memory_runtime() {
        let key = generate_key();
        let mut config = WorkerConfigManifest::default();
        config.spec.keys.push(KeyEntry {
            name: Some("online".to_string()),
            seed: Some(key.seed_hex.clone()),
            ..Default::default()
        });

        let runtime = WorkerRuntime::build(&config).await.unwrap();
        assert_eq!(runtime.executor.settings().max_commit_retries, 5);
        assert_eq!(runtime.event_bus.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn test_build_rejects_invalid_config() {
        let mut config = WorkerConfigManifest::default();
        config.spec.executor.max_commit_retries = 0;
        assert!(WorkerRuntime::build(&config).await.is_err());
    }
}
