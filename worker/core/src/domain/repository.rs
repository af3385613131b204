// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Repository State Store Interface
//!
//! Persistence contract for the per-repository metadata bundle, defined in
//! the domain layer and implemented in `crate::infrastructure::repositories`.
//!
//! | Implementation | Backend |
//! |----------------|---------|
//! | `InMemoryRepositoryStateStore` | `parking_lot`-guarded maps (development, tests) |
//! | `PostgresRepositoryStateStore` | PostgreSQL via `sqlx` |
//!
//! ## Commit Protocol
//!
//! `commit` is a compare-and-swap on [`BundleIdentity`]: it succeeds only if
//! the identity the caller loaded is still current, otherwise it fails with
//! [`StoreError::Conflict`] and nothing is written. Committed documents are
//! retained forever; a commit only moves the "current" pointer.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::domain::bundle::{Bundle, BundleIdentity};
use crate::domain::metadata::MetadataError;
use crate::domain::role::RoleName;

/// Repository identifier as carried by tasks
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RepositoryId(pub String);

impl RepositoryId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for RepositoryId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The current bundle together with the identity a commit must match
#[derive(Debug, Clone, PartialEq)]
pub struct StoredBundle {
    pub identity: BundleIdentity,
    pub bundle: Bundle,
}

#[async_trait]
pub trait RepositoryStateStore: Send + Sync {
    /// Current bundle, or `None` for an uninitialized repository
    async fn load_current(&self, repository: &RepositoryId)
        -> Result<Option<StoredBundle>, StoreError>;

    /// Make `candidate` current if `expected` is still the current identity.
    /// `expected` is `None` when creating the repository.
    async fn commit(
        &self,
        repository: &RepositoryId,
        candidate: &Bundle,
        expected: Option<&BundleIdentity>,
    ) -> Result<BundleIdentity, StoreError>;

    /// Canonical bytes of one committed document
    async fn find_document(
        &self,
        repository: &RepositoryId,
        role: &RoleName,
        version: u64,
    ) -> Result<Option<Vec<u8>>, StoreError>;

    /// Canonical bytes of the current document for `role`
    async fn find_latest_document(
        &self,
        repository: &RepositoryId,
        role: &RoleName,
    ) -> Result<Option<Vec<u8>>, StoreError>;

    /// Committed bundle identities, oldest first
    async fn history(&self, repository: &RepositoryId) -> Result<Vec<BundleIdentity>, StoreError>;
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    #[error("Commit conflict on {repository}: expected {expected:?}, found {actual:?}")]
    Conflict {
        repository: RepositoryId,
        expected: Option<BundleIdentity>,
        actual: Option<BundleIdentity>,
    },

    #[error("State store unavailable: {0}")]
    Unavailable(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Stored state is corrupt: {0}")]
    Corrupt(String),
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::ColumnDecode { .. } | sqlx::Error::Decode(_) => {
                StoreError::Corrupt(err.to_string())
            }
            _ => StoreError::Unavailable(err.to_string()),
        }
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        StoreError::Serialization(err.to_string())
    }
}

impl From<MetadataError> for StoreError {
    fn from(err: MetadataError) -> Self {
        match err {
            MetadataError::Malformed(msg) => StoreError::Corrupt(msg),
            MetadataError::Encoding(msg) => StoreError::Serialization(msg),
        }
    }
}
