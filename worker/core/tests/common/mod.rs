// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Shared fixture for the integration tests: six deterministic ed25519
//! keys, an in-memory store and an executor wired the way the CLI wires it.

#![allow(dead_code)]

use ed25519_dalek::SigningKey;
use std::collections::BTreeMap;
use std::sync::Arc;

use tuf_worker_core::application::{ExecutorSettings, TaskExecutor, TaskOutcome};
use tuf_worker_core::infrastructure::event_bus::EventBus;
use tuf_worker_core::infrastructure::key_source::LocalKeySource;
use tuf_worker_core::infrastructure::repositories::InMemoryRepositoryStateStore;
use tuf_worker_core::key::{KeyId, PublicKey};
use tuf_worker_core::planner::Planner;
use tuf_worker_core::repository::{RepositoryId, RepositoryStateStore};
use tuf_worker_core::signer::ThresholdSigner;
use tuf_worker_core::task::{Artifact, RoleKeySpec, Task, TaskEnvelope};
use tuf_worker_core::worker_config::KeyEntry;

pub const KEY_COUNT: u8 = 6;

pub fn seed(n: u8) -> [u8; 32] {
    [n; 32]
}

pub fn signing_key(n: u8) -> SigningKey {
    SigningKey::from_bytes(&seed(n))
}

pub fn public_key(n: u8) -> PublicKey {
    PublicKey::from_verifying_key(&signing_key(n).verifying_key())
}

/// Key id of fixture key `n` (1-based)
pub fn keyid(n: u8) -> KeyId {
    public_key(n).key_id().unwrap()
}

/// Key entries for keys 1..=KEY_COUNT; keys listed in `offline` only carry
/// public material
pub fn key_entries(offline: &[u8]) -> Vec<KeyEntry> {
    (1..=KEY_COUNT)
        .map(|n| {
            if offline.contains(&n) {
                KeyEntry {
                    name: Some(format!("key-{}", n)),
                    public: Some(hex::encode(signing_key(n).verifying_key().to_bytes())),
                    offline: true,
                    ..Default::default()
                }
            } else {
                KeyEntry {
                    name: Some(format!("key-{}", n)),
                    seed: Some(hex::encode(seed(n))),
                    ..Default::default()
                }
            }
        })
        .collect()
}

/// root: 2 of keys 1..3, targets: key 4, snapshot: key 5, timestamp: key 6
pub fn initial_roles() -> BTreeMap<String, RoleKeySpec> {
    let mut roles = BTreeMap::new();
    roles.insert(
        "root".to_string(),
        RoleKeySpec {
            keyids: vec![keyid(1), keyid(2), keyid(3)],
            threshold: 2,
        },
    );
    for (role, n) in [("targets", 4), ("snapshot", 5), ("timestamp", 6)] {
        roles.insert(
            role.to_string(),
            RoleKeySpec {
                keyids: vec![keyid(n)],
                threshold: 1,
            },
        );
    }
    roles
}

pub struct Fixture {
    pub executor: Arc<TaskExecutor>,
    pub store: Arc<dyn RepositoryStateStore>,
    pub event_bus: Arc<EventBus>,
}

pub fn fixture() -> Fixture {
    fixture_with(&[], Arc::new(InMemoryRepositoryStateStore::new()))
}

pub fn fixture_with(offline: &[u8], store: Arc<dyn RepositoryStateStore>) -> Fixture {
    fixture_full(offline, store, Planner::default())
}

pub fn fixture_full(
    offline: &[u8],
    store: Arc<dyn RepositoryStateStore>,
    planner: Planner,
) -> Fixture {
    let source = LocalKeySource::from_entries(&key_entries(offline)).unwrap();
    let event_bus = Arc::new(EventBus::with_default_capacity());
    let executor = Arc::new(TaskExecutor::new(
        store.clone(),
        Arc::new(ThresholdSigner::new(Arc::new(source))),
        planner,
        initial_roles(),
        event_bus.clone(),
        ExecutorSettings::default(),
    ));
    Fixture {
        executor,
        store,
        event_bus,
    }
}

pub fn repo() -> RepositoryId {
    RepositoryId::new("acme/widgets")
}

pub fn envelope(task: Task) -> TaskEnvelope {
    TaskEnvelope::new(repo(), task)
}

pub fn initialize() -> TaskEnvelope {
    envelope(Task::InitializeRepository {
        roles: BTreeMap::new(),
        consistent_snapshot: true,
        hash_bins: None,
    })
}

pub fn artifact(path: &str, length: u64, sha256: &str) -> Artifact {
    Artifact {
        path: path.to_string(),
        length,
        hashes: BTreeMap::from([("sha256".to_string(), sha256.to_string())]),
        custom: None,
    }
}

pub fn publish(artifacts: Vec<Artifact>) -> TaskEnvelope {
    envelope(Task::PublishArtifacts {
        artifacts,
        role: None,
    })
}

pub fn versions(outcome: &TaskOutcome) -> &BTreeMap<String, u64> {
    match outcome {
        TaskOutcome::Committed { versions, .. } => versions,
        TaskOutcome::Unchanged { .. } => panic!("expected a committed outcome"),
    }
}
