// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Repository Tasks
//!
//! The closed set of repository-management tasks the worker accepts from
//! the queue. A task message is a flat JSON object carrying a `type` tag,
//! the target `repository` and the type-specific parameters:
//!
//! ```json
//! {"task_id": "…", "repository": "acme", "type": "publish_artifacts",
//!  "artifacts": [{"path": "app-1.0.bin", "length": 1024, "hashes": {"sha256": "…"}}]}
//! ```
//!
//! Parsing separates an unknown tag ([`TaskInputError::UnknownTaskType`])
//! from a known tag with bad parameters
//! ([`TaskInputError::InvalidParameters`]).

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use thiserror::Error;
use uuid::Uuid;

use crate::domain::canonical;
use crate::domain::key::KeyId;
use crate::domain::repository::RepositoryId;
use crate::domain::role::{is_valid_delegated_name, RoleName};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(pub Uuid);

impl TaskId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TaskInputError {
    #[error("Unknown task type: {0}")]
    UnknownTaskType(String),

    #[error("Invalid parameters: {0}")]
    InvalidParameters(String),
}

/// Key ids and threshold for one role
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoleKeySpec {
    pub keyids: Vec<KeyId>,
    pub threshold: u32,
}

/// Succinct hash-bin delegation requested at initialization
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HashBinSpec {
    pub bit_length: u32,
    #[serde(default = "default_bin_prefix")]
    pub name_prefix: String,
    pub keyids: Vec<KeyId>,
    pub threshold: u32,
}

fn default_bin_prefix() -> String {
    "bins".to_string()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Artifact {
    pub path: String,
    pub length: u64,
    pub hashes: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub custom: Option<Value>,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Task {
    InitializeRepository {
        /// Per-role overrides of the configured initial key sets
        #[serde(default)]
        roles: BTreeMap<String, RoleKeySpec>,
        #[serde(default = "default_true")]
        consistent_snapshot: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        hash_bins: Option<HashBinSpec>,
    },
    AddKey {
        role: String,
        keyid: KeyId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        threshold: Option<u32>,
    },
    RemoveKey {
        role: String,
        keyid: KeyId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        threshold: Option<u32>,
    },
    RotateKeys {
        role: String,
        keyids: Vec<KeyId>,
        threshold: u32,
    },
    PublishArtifacts {
        artifacts: Vec<Artifact>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        role: Option<String>,
    },
    RemoveArtifacts {
        paths: Vec<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        role: Option<String>,
    },
    DelegateRole {
        name: String,
        keyids: Vec<KeyId>,
        threshold: u32,
        paths: Vec<String>,
        #[serde(default)]
        terminating: bool,
    },
    RefreshMetadata {
        #[serde(default)]
        include_snapshot: bool,
    },
    BumpExpiring {},
}

impl Task {
    pub const TYPES: [&'static str; 9] = [
        "initialize_repository",
        "add_key",
        "remove_key",
        "rotate_keys",
        "publish_artifacts",
        "remove_artifacts",
        "delegate_role",
        "refresh_metadata",
        "bump_expiring",
    ];

    pub fn task_type(&self) -> &'static str {
        match self {
            Task::InitializeRepository { .. } => "initialize_repository",
            Task::AddKey { .. } => "add_key",
            Task::RemoveKey { .. } => "remove_key",
            Task::RotateKeys { .. } => "rotate_keys",
            Task::PublishArtifacts { .. } => "publish_artifacts",
            Task::RemoveArtifacts { .. } => "remove_artifacts",
            Task::DelegateRole { .. } => "delegate_role",
            Task::RefreshMetadata { .. } => "refresh_metadata",
            Task::BumpExpiring {} => "bump_expiring",
        }
    }

    /// Shape checks that do not need repository state
    pub fn validate(&self) -> Result<(), TaskInputError> {
        match self {
            Task::InitializeRepository {
                roles, hash_bins, ..
            } => {
                for (role, spec) in roles {
                    if !RoleName::parse(role).is_top_level() {
                        return Err(invalid(format!("'{}' is not a top-level role", role)));
                    }
                    check_key_spec(role, &spec.keyids, spec.threshold)?;
                }
                if let Some(bins) = hash_bins {
                    if bins.bit_length == 0 || bins.bit_length > MAX_INITIAL_BIT_LENGTH {
                        return Err(invalid(format!(
                            "hash_bins.bit_length must be within 1..={}",
                            MAX_INITIAL_BIT_LENGTH
                        )));
                    }
                    if !is_valid_delegated_name(&bins.name_prefix) {
                        return Err(invalid(format!(
                            "invalid hash_bins.name_prefix '{}'",
                            bins.name_prefix
                        )));
                    }
                    check_key_spec(&bins.name_prefix, &bins.keyids, bins.threshold)?;
                }
                Ok(())
            }
            Task::AddKey {
                role,
                keyid,
                threshold,
            }
            | Task::RemoveKey {
                role,
                keyid,
                threshold,
            } => {
                check_role_name(role)?;
                if keyid.as_str().is_empty() {
                    return Err(invalid("keyid cannot be empty".to_string()));
                }
                if *threshold == Some(0) {
                    return Err(invalid("threshold must be at least 1".to_string()));
                }
                Ok(())
            }
            Task::RotateKeys {
                role,
                keyids,
                threshold,
            } => {
                check_role_name(role)?;
                check_key_spec(role, keyids, *threshold)
            }
            Task::PublishArtifacts { artifacts, role } => {
                if let Some(role) = role {
                    check_targets_role(role)?;
                }
                if artifacts.is_empty() {
                    return Err(invalid("artifacts cannot be empty".to_string()));
                }
                let mut seen = std::collections::BTreeSet::new();
                for artifact in artifacts {
                    check_path(&artifact.path)?;
                    if !seen.insert(artifact.path.as_str()) {
                        return Err(invalid(format!("artifact {} listed twice", artifact.path)));
                    }
                    check_hashes(&artifact.path, &artifact.hashes)?;
                    if let Some(custom) = &artifact.custom {
                        canonical::encode_value(custom).map_err(|e| {
                            invalid(format!("artifact {} custom: {}", artifact.path, e))
                        })?;
                    }
                }
                Ok(())
            }
            Task::RemoveArtifacts { paths, role } => {
                if let Some(role) = role {
                    check_targets_role(role)?;
                }
                if paths.is_empty() {
                    return Err(invalid("paths cannot be empty".to_string()));
                }
                paths.iter().try_for_each(|p| check_path(p))
            }
            Task::DelegateRole {
                name,
                keyids,
                threshold,
                paths,
                ..
            } => {
                if !is_valid_delegated_name(name) {
                    return Err(invalid(format!("invalid delegated role name '{}'", name)));
                }
                check_key_spec(name, keyids, *threshold)?;
                if paths.is_empty() {
                    return Err(invalid(format!("delegated role {} needs at least one path", name)));
                }
                paths.iter().try_for_each(|p| check_path(p))
            }
            Task::RefreshMetadata { .. } | Task::BumpExpiring {} => Ok(()),
        }
    }
}

/// Bin counts beyond this are impractical to create in one task
pub const MAX_INITIAL_BIT_LENGTH: u32 = 14;

fn invalid(message: String) -> TaskInputError {
    TaskInputError::InvalidParameters(message)
}

fn check_role_name(role: &str) -> Result<(), TaskInputError> {
    if RoleName::parse(role).is_top_level() || is_valid_delegated_name(role) {
        Ok(())
    } else {
        Err(invalid(format!("invalid role name '{}'", role)))
    }
}

fn check_targets_role(role: &str) -> Result<(), TaskInputError> {
    match RoleName::parse(role) {
        RoleName::Targets => Ok(()),
        RoleName::Delegated(name) if is_valid_delegated_name(&name) => Ok(()),
        _ => Err(invalid(format!("'{}' is not a targets role", role))),
    }
}

fn check_key_spec(role: &str, keyids: &[KeyId], threshold: u32) -> Result<(), TaskInputError> {
    let distinct: std::collections::BTreeSet<&KeyId> = keyids.iter().collect();
    if distinct.len() != keyids.len() {
        return Err(invalid(format!("role {} lists a key id twice", role)));
    }
    if threshold == 0 || threshold as usize > distinct.len() {
        return Err(invalid(format!(
            "role {} threshold {} must be within 1..={}",
            role,
            threshold,
            distinct.len()
        )));
    }
    Ok(())
}

fn check_path(path: &str) -> Result<(), TaskInputError> {
    if path.is_empty() || path.starts_with('/') || path.split('/').any(|s| s == "..") {
        return Err(invalid(format!("invalid target path '{}'", path)));
    }
    Ok(())
}

fn check_hashes(path: &str, hashes: &BTreeMap<String, String>) -> Result<(), TaskInputError> {
    if hashes.is_empty() {
        return Err(invalid(format!("artifact {} has no hashes", path)));
    }
    for (algorithm, digest) in hashes {
        if digest.is_empty() || !digest.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(invalid(format!(
                "artifact {} {} digest is not hex",
                path, algorithm
            )));
        }
    }
    Ok(())
}

/// A task addressed to one repository
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskEnvelope {
    #[serde(default)]
    pub task_id: TaskId,
    pub repository: RepositoryId,
    #[serde(flatten)]
    pub task: Task,
}

impl TaskEnvelope {
    pub fn new(repository: RepositoryId, task: Task) -> Self {
        Self {
            task_id: TaskId::new(),
            repository,
            task,
        }
    }

    pub fn from_slice(payload: &[u8]) -> Result<Self, TaskInputError> {
        let value: Value = serde_json::from_slice(payload)
            .map_err(|e| invalid(format!("task payload is not JSON: {}", e)))?;
        Self::from_value(value)
    }

    pub fn from_value(value: Value) -> Result<Self, TaskInputError> {
        let tag = value
            .get("type")
            .ok_or_else(|| invalid("task payload has no type".to_string()))?
            .as_str()
            .ok_or_else(|| invalid("task type must be a string".to_string()))?;
        if !Task::TYPES.contains(&tag) {
            return Err(TaskInputError::UnknownTaskType(tag.to_string()));
        }

        let envelope: Self = serde_json::from_value(value).map_err(|e| invalid(e.to_string()))?;
        if envelope.repository.as_str().is_empty() {
            return Err(invalid("repository cannot be empty".to_string()));
        }
        envelope.task.validate()?;
        Ok(envelope)
    }
}
