// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # PostgreSQL Repository State Store
//!
//! `RepositoryStateStore` backed by three tables:
//!
//! - `tuf_repositories`: current bundle identity and role → version manifest
//! - `tuf_bundle_history`: every committed identity, in commit order
//! - `tuf_documents`: canonical document bytes keyed by
//!   `(repository_id, role, version)`
//!
//! The compare-and-swap is a conditional `UPDATE ... WHERE bundle_identity
//! = $expected` (or an `INSERT ... ON CONFLICT DO NOTHING` for a new
//! repository) in the same transaction as the document inserts, so a
//! losing writer leaves no trace.

use async_trait::async_trait;
use sqlx::postgres::PgPool;
use sqlx::Row;
use std::collections::BTreeMap;
use tracing::debug;

use crate::domain::bundle::{Bundle, BundleIdentity};
use crate::domain::repository::{RepositoryId, RepositoryStateStore, StoreError, StoredBundle};
use crate::domain::role::RoleName;

pub struct PostgresRepositoryStateStore {
    pool: PgPool,
}

impl PostgresRepositoryStateStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn current_identity(
        &self,
        repository: &RepositoryId,
    ) -> Result<Option<BundleIdentity>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT bundle_identity FROM tuf_repositories WHERE repository_id = $1
            "#,
        )
        .bind(repository.as_str())
        .fetch_optional(&self.pool)
        .await?;

        Ok(match row {
            Some(row) => Some(BundleIdentity(row.try_get("bundle_identity")?)),
            None => None,
        })
    }
}

fn to_db_version(version: u64) -> Result<i64, StoreError> {
    i64::try_from(version)
        .map_err(|_| StoreError::Serialization(format!("version {} exceeds BIGINT", version)))
}

/// Documents at exactly the versions listed in `manifest`
async fn fetch_documents<'e, E>(
    executor: E,
    repository: &RepositoryId,
    manifest: &serde_json::Value,
) -> Result<BTreeMap<RoleName, Vec<u8>>, StoreError>
where
    E: sqlx::Executor<'e, Database = sqlx::Postgres>,
{
    let rows = sqlx::query(
        r#"
        SELECT d.role, d.content
        FROM tuf_documents d
        WHERE d.repository_id = $1
          AND ($2::JSONB ->> d.role)::BIGINT = d.version
        "#,
    )
    .bind(repository.as_str())
    .bind(manifest)
    .fetch_all(executor)
    .await?;

    let mut documents = BTreeMap::new();
    for row in rows {
        let role: String = row.try_get("role")?;
        let content: Vec<u8> = row.try_get("content")?;
        documents.insert(RoleName::parse(&role), content);
    }
    Ok(documents)
}

/// Rebuild the bundle a manifest describes and check it against the stored
/// identity
fn assemble(
    repository: &RepositoryId,
    identity: BundleIdentity,
    manifest: &serde_json::Value,
    documents: BTreeMap<RoleName, Vec<u8>>,
) -> Result<StoredBundle, StoreError> {
    let manifest: BTreeMap<String, u64> = serde_json::from_value(manifest.clone())?;
    if documents.len() != manifest.len() {
        return Err(StoreError::Corrupt(format!(
            "repository {} lists {} documents but {} are stored",
            repository,
            manifest.len(),
            documents.len()
        )));
    }

    let bundle = Bundle::from_documents(&documents)?;
    if bundle.identity()? != identity {
        return Err(StoreError::Corrupt(format!(
            "stored documents of {} do not match bundle identity {}",
            repository, identity
        )));
    }
    Ok(StoredBundle { identity, bundle })
}

#[async_trait]
impl RepositoryStateStore for PostgresRepositoryStateStore {
    async fn load_current(
        &self,
        repository: &RepositoryId,
    ) -> Result<Option<StoredBundle>, StoreError> {
        // Both reads see one snapshot, so a concurrent commit cannot pair
        // the old identity with the new documents.
        let mut tx = self.pool.begin().await?;
        sqlx::query("SET TRANSACTION ISOLATION LEVEL REPEATABLE READ, READ ONLY")
            .execute(&mut *tx)
            .await?;

        let row = sqlx::query(
            r#"
            SELECT bundle_identity, manifest FROM tuf_repositories WHERE repository_id = $1
            "#,
        )
        .bind(repository.as_str())
        .fetch_optional(&mut *tx)
        .await?;
        let Some(row) = row else {
            tx.commit().await?;
            return Ok(None);
        };

        let identity = BundleIdentity(row.try_get("bundle_identity")?);
        let manifest: serde_json::Value = row.try_get("manifest")?;
        let documents = fetch_documents(&mut *tx, repository, &manifest).await?;
        tx.commit().await?;

        assemble(repository, identity, &manifest, documents).map(Some)
    }

    async fn commit(
        &self,
        repository: &RepositoryId,
        candidate: &Bundle,
        expected: Option<&BundleIdentity>,
    ) -> Result<BundleIdentity, StoreError> {
        let identity = candidate.identity()?;
        let documents = candidate.documents()?;
        let manifest = serde_json::to_value(candidate.manifest())?;

        let mut tx = self.pool.begin().await?;

        let swapped = match expected {
            Some(expected) => sqlx::query(
                r#"
                UPDATE tuf_repositories
                SET bundle_identity = $2, manifest = $3, updated_at = NOW()
                WHERE repository_id = $1 AND bundle_identity = $4
                "#,
            )
            .bind(repository.as_str())
            .bind(identity.as_str())
            .bind(&manifest)
            .bind(expected.as_str())
            .execute(&mut *tx)
            .await?,
            None => sqlx::query(
                r#"
                INSERT INTO tuf_repositories (repository_id, bundle_identity, manifest, created_at, updated_at)
                VALUES ($1, $2, $3, NOW(), NOW())
                ON CONFLICT (repository_id) DO NOTHING
                "#,
            )
            .bind(repository.as_str())
            .bind(identity.as_str())
            .bind(&manifest)
            .execute(&mut *tx)
            .await?,
        };

        if swapped.rows_affected() == 0 {
            tx.rollback().await?;
            return Err(StoreError::Conflict {
                repository: repository.clone(),
                expected: expected.cloned(),
                actual: self.current_identity(repository).await?,
            });
        }

        for document in &documents {
            sqlx::query(
                r#"
                INSERT INTO tuf_documents (repository_id, role, version, fingerprint, expires_at, content, created_at)
                VALUES ($1, $2, $3, $4, $5, $6, NOW())
                ON CONFLICT (repository_id, role, version) DO NOTHING
                "#,
            )
            .bind(repository.as_str())
            .bind(document.role.as_str())
            .bind(to_db_version(document.version)?)
            .bind(&document.fingerprint)
            .bind(document.expires)
            .bind(&document.bytes)
            .execute(&mut *tx)
            .await?;
        }

        sqlx::query(
            r#"
            INSERT INTO tuf_bundle_history (repository_id, bundle_identity, manifest, committed_at)
            VALUES ($1, $2, $3, NOW())
            "#,
        )
        .bind(repository.as_str())
        .bind(identity.as_str())
        .bind(&manifest)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        debug!(repository = %repository, identity = %identity, "Committed bundle");
        Ok(identity)
    }

    async fn find_document(
        &self,
        repository: &RepositoryId,
        role: &RoleName,
        version: u64,
    ) -> Result<Option<Vec<u8>>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT content FROM tuf_documents
            WHERE repository_id = $1 AND role = $2 AND version = $3
            "#,
        )
        .bind(repository.as_str())
        .bind(role.as_str())
        .bind(to_db_version(version)?)
        .fetch_optional(&self.pool)
        .await?;

        Ok(match row {
            Some(row) => Some(row.try_get("content")?),
            None => None,
        })
    }

    async fn find_latest_document(
        &self,
        repository: &RepositoryId,
        role: &RoleName,
    ) -> Result<Option<Vec<u8>>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT d.content
            FROM tuf_documents d
            JOIN tuf_repositories r ON r.repository_id = d.repository_id
            WHERE d.repository_id = $1
              AND d.role = $2
              AND d.version = (r.manifest ->> $2)::BIGINT
            "#,
        )
        .bind(repository.as_str())
        .bind(role.as_str())
        .fetch_optional(&self.pool)
        .await?;

        Ok(match row {
            Some(row) => Some(row.try_get("content")?),
            None => None,
        })
    }

    async fn history(&self, repository: &RepositoryId) -> Result<Vec<BundleIdentity>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT bundle_identity FROM tuf_bundle_history
            WHERE repository_id = $1
            ORDER BY id ASC
            "#,
        )
        .bind(repository.as_str())
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|row| Ok(BundleIdentity(row.try_get("bundle_identity")?)))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    //! Run against a scratch database:
    //! `TUF_WORKER_TEST_DATABASE_URL=postgres://... cargo test -- --ignored`

    use super::*;
    use crate::application::{ExecutorSettings, TaskExecutor};
    use crate::domain::planner::Planner;
    use crate::domain::signer::ThresholdSigner;
    use crate::domain::task::{Artifact, RoleKeySpec, Task, TaskEnvelope};
    use crate::domain::worker_config::KeyEntry;
    use crate::infrastructure::event_bus::EventBus;
    use crate::infrastructure::key_source::LocalKeySource;
    use sqlx::postgres::PgPoolOptions;
    use sqlx::Executor;
    use std::sync::Arc;

    const SCHEMA: &str =
        include_str!("../../../../../cli/migrations/20260101000000_repository_state.sql");

    async fn pool() -> PgPool {
        let url = std::env::var("TUF_WORKER_TEST_DATABASE_URL")
            .expect("TUF_WORKER_TEST_DATABASE_URL must point at a scratch database");
        let pool = PgPoolOptions::new()
            .max_connections(4)
            .connect(&url)
            .await
            .unwrap();
        pool.execute(SCHEMA).await.unwrap();
        pool
    }

    fn executor(store: Arc<PostgresRepositoryStateStore>) -> TaskExecutor {
        let entry = KeyEntry {
            seed: Some(hex::encode([7u8; 32])),
            ..Default::default()
        };
        let source = LocalKeySource::from_entries(&[entry]).unwrap();
        let keyid = source.key_ids()[0].clone();
        let initial_roles = ["root", "targets", "snapshot", "timestamp"]
            .into_iter()
            .map(|role| {
                (
                    role.to_string(),
                    RoleKeySpec {
                        keyids: vec![keyid.clone()],
                        threshold: 1,
                    },
                )
            })
            .collect();
        TaskExecutor::new(
            store,
            Arc::new(ThresholdSigner::new(Arc::new(source))),
            Planner::default(),
            initial_roles,
            Arc::new(EventBus::with_default_capacity()),
            ExecutorSettings::default(),
        )
    }

    fn scratch_repo() -> RepositoryId {
        RepositoryId::new(format!("test/{}", uuid::Uuid::new_v4()))
    }

    fn initialize(repository: &RepositoryId) -> TaskEnvelope {
        TaskEnvelope::new(
            repository.clone(),
            Task::InitializeRepository {
                roles: BTreeMap::new(),
                consistent_snapshot: true,
                hash_bins: None,
            },
        )
    }

    fn publish(repository: &RepositoryId, path: &str) -> TaskEnvelope {
        TaskEnvelope::new(
            repository.clone(),
            Task::PublishArtifacts {
                artifacts: vec![Artifact {
                    path: path.to_string(),
                    length: 64,
                    hashes: BTreeMap::from([("sha256".to_string(), "cd".repeat(32))]),
                    custom: None,
                }],
                role: None,
            },
        )
    }

    #[tokio::test]
    #[ignore]
    async fn test_documents_follow_the_manifest_read_first() {
        let pool = pool().await;
        let store = Arc::new(PostgresRepositoryStateStore::new(pool.clone()));
        let executor = executor(store.clone());
        let repository = scratch_repo();
        executor.execute(&initialize(&repository)).await.unwrap();

        // First half of a load
        let row = sqlx::query(
            "SELECT bundle_identity, manifest FROM tuf_repositories WHERE repository_id = $1",
        )
        .bind(repository.as_str())
        .fetch_one(&pool)
        .await
        .unwrap();
        let identity = BundleIdentity(row.try_get("bundle_identity").unwrap());
        let manifest: serde_json::Value = row.try_get("manifest").unwrap();

        // Another worker commits before the documents are read
        executor
            .execute(&publish(&repository, "late.bin"))
            .await
            .unwrap();

        let documents = fetch_documents(&pool, &repository, &manifest)
            .await
            .unwrap();
        let loaded = assemble(&repository, identity.clone(), &manifest, documents).unwrap();
        assert_eq!(loaded.identity, identity);
        assert_eq!(loaded.bundle.targets.version(), 1);

        let current = store.load_current(&repository).await.unwrap().unwrap();
        assert_ne!(current.identity, identity);
        assert_eq!(current.bundle.targets.version(), 2);
    }

    #[tokio::test]
    #[ignore]
    async fn test_compare_and_swap_and_history() {
        let store = Arc::new(PostgresRepositoryStateStore::new(pool().await));
        let executor = executor(store.clone());
        let repository = scratch_repo();
        assert!(store.load_current(&repository).await.unwrap().is_none());

        executor.execute(&initialize(&repository)).await.unwrap();
        let first = store.load_current(&repository).await.unwrap().unwrap();
        executor
            .execute(&publish(&repository, "a.bin"))
            .await
            .unwrap();

        let err = store
            .commit(&repository, &first.bundle, Some(&first.identity))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Conflict { actual: Some(_), .. }));

        let history = store.history(&repository).await.unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0], first.identity);
        assert!(store
            .find_document(&repository, &RoleName::Targets, 1)
            .await
            .unwrap()
            .is_some());
    }
}
