// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Repository State Store Implementations
//!
//! Infrastructure implementations of [`RepositoryStateStore`].
//!
//! # Available Implementations
//!
//! - **PostgresRepositoryStateStore** - durable store for deployments that
//!   share state between worker processes
//! - **InMemoryRepositoryStateStore** - single-process store for development
//!   and tests
//!
//! Both implement the same compare-and-swap contract: a commit succeeds only
//! while the caller's expected bundle identity is still current, and every
//! committed document stays addressable by `(repository, role, version)`.

pub mod postgres_state;

pub use postgres_state::PostgresRepositoryStateStore;

use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tracing::debug;

use crate::domain::bundle::{Bundle, BundleIdentity};
use crate::domain::repository::{RepositoryId, RepositoryStateStore, StoreError, StoredBundle};
use crate::domain::role::RoleName;

struct RepositoryEntry {
    current: StoredBundle,
    history: Vec<BundleIdentity>,
    documents: BTreeMap<(RoleName, u64), Vec<u8>>,
}

#[derive(Clone, Default)]
pub struct InMemoryRepositoryStateStore {
    repositories: Arc<RwLock<HashMap<RepositoryId, RepositoryEntry>>>,
}

impl InMemoryRepositoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RepositoryStateStore for InMemoryRepositoryStateStore {
    async fn load_current(
        &self,
        repository: &RepositoryId,
    ) -> Result<Option<StoredBundle>, StoreError> {
        Ok(self
            .repositories
            .read()
            .get(repository)
            .map(|entry| entry.current.clone()))
    }

    async fn commit(
        &self,
        repository: &RepositoryId,
        candidate: &Bundle,
        expected: Option<&BundleIdentity>,
    ) -> Result<BundleIdentity, StoreError> {
        // Encode before taking the lock
        let identity = candidate.identity()?;
        let documents = candidate.documents()?;

        let mut repositories = self.repositories.write();
        let actual = repositories
            .get(repository)
            .map(|entry| entry.current.identity.clone());
        if actual.as_ref() != expected {
            return Err(StoreError::Conflict {
                repository: repository.clone(),
                expected: expected.cloned(),
                actual,
            });
        }

        let stored = StoredBundle {
            identity: identity.clone(),
            bundle: candidate.clone(),
        };
        let entry = repositories
            .entry(repository.clone())
            .or_insert_with(|| RepositoryEntry {
                current: stored.clone(),
                history: Vec::new(),
                documents: BTreeMap::new(),
            });
        entry.current = stored;
        entry.history.push(identity.clone());
        for document in documents {
            entry
                .documents
                .entry((document.role, document.version))
                .or_insert(document.bytes);
        }

        debug!(repository = %repository, identity = %identity, "Committed bundle");
        Ok(identity)
    }

    async fn find_document(
        &self,
        repository: &RepositoryId,
        role: &RoleName,
        version: u64,
    ) -> Result<Option<Vec<u8>>, StoreError> {
        Ok(self.repositories.read().get(repository).and_then(|entry| {
            entry
                .documents
                .get(&(role.clone(), version))
                .cloned()
        }))
    }

    async fn find_latest_document(
        &self,
        repository: &RepositoryId,
        role: &RoleName,
    ) -> Result<Option<Vec<u8>>, StoreError> {
        let repositories = self.repositories.read();
        let Some(entry) = repositories.get(repository) else {
            return Ok(None);
        };
        let Some(version) = entry.current.bundle.version_of(role) else {
            return Ok(None);
        };
        Ok(entry.documents.get(&(role.clone(), version)).cloned())
    }

    async fn history(&self, repository: &RepositoryId) -> Result<Vec<BundleIdentity>, StoreError> {
        Ok(self
            .repositories
            .read()
            .get(repository)
            .map(|entry| entry.history.clone())
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::metadata::{Metadata, Root, Snapshot, Targets, Timestamp};
    use chrono::{TimeZone, Utc};

    fn bundle(targets_version: u64) -> Bundle {
        let expires = Utc.with_ymd_and_hms(2031, 1, 1, 0, 0, 0).unwrap();
        Bundle {
            root: Metadata::new(Root::new(1, expires, true)),
            targets: Metadata::new(Targets::new(targets_version, expires)),
            snapshot: Metadata::new(Snapshot::new(1, expires)),
            timestamp: Metadata::new(Timestamp::new(1, expires)),
            delegated: BTreeMap::new(),
        }
    }

    fn repo() -> RepositoryId {
        RepositoryId::new("acme")
    }

    #[tokio::test]
    async fn test_create_then_compare_and_swap() {
        let store = InMemoryRepositoryStateStore::new();
        assert!(store.load_current(&repo()).await.unwrap().is_none());

        let first = store.commit(&repo(), &bundle(1), None).await.unwrap();
        let second = store
            .commit(&repo(), &bundle(2), Some(&first))
            .await
            .unwrap();

        let current = store.load_current(&repo()).await.unwrap().unwrap();
        assert_eq!(current.identity, second);
        assert_eq!(store.history(&repo()).await.unwrap(), vec![first, second]);
    }

    #[tokio::test]
    async fn test_stale_expectation_conflicts() {
        let store = InMemoryRepositoryStateStore::new();
        let first = store.commit(&repo(), &bundle(1), None).await.unwrap();
        store
            .commit(&repo(), &bundle(2), Some(&first))
            .await
            .unwrap();

        let err = store
            .commit(&repo(), &bundle(3), Some(&first))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Conflict { .. }));
        assert_eq!(store.history(&repo()).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_second_create_conflicts() {
        let store = InMemoryRepositoryStateStore::new();
        store.commit(&repo(), &bundle(1), None).await.unwrap();
        let err = store.commit(&repo(), &bundle(1), None).await.unwrap_err();
        assert!(matches!(err, StoreError::Conflict { actual: Some(_), .. }));
    }

    #[tokio::test]
    async fn test_documents_remain_addressable() {
        let store = InMemoryRepositoryStateStore::new();
        let first = store.commit(&repo(), &bundle(1), None).await.unwrap();
        store
            .commit(&repo(), &bundle(2), Some(&first))
            .await
            .unwrap();

        let v1 = store
            .find_document(&repo(), &RoleName::Targets, 1)
            .await
            .unwrap()
            .unwrap();
        let latest = store
            .find_latest_document(&repo(), &RoleName::Targets)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(v1, bundle(1).targets.to_bytes().unwrap());
        assert_eq!(latest, bundle(2).targets.to_bytes().unwrap());
        assert!(store
            .find_document(&repo(), &RoleName::Targets, 3)
            .await
            .unwrap()
            .is_none());
    }
}
