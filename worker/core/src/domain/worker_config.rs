// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

// Worker Configuration Types
//
// Defines the configuration schema for the TUF repository worker:
// - Kubernetes-style manifest format (apiVersion/kind/metadata/spec)
// - Per-role validity windows and the expiry bump window
// - Initial key sets used by initialize_repository
// - Signing key entries for the local key source
// - Executor limits, storage backend and logging

use ed25519_dalek::SigningKey;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::domain::key::{KeyId, PublicKey};
use crate::domain::planner::ExpirationPolicy;
use crate::domain::role::RoleName;
use crate::domain::task::RoleKeySpec;

pub const API_VERSION: &str = "tuf-worker/v1";
pub const KIND: &str = "WorkerConfig";

/// Top-level Kubernetes-style worker configuration manifest
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfigManifest {
    /// API version (must be "tuf-worker/v1")
    #[serde(rename = "apiVersion")]
    pub api_version: String,

    /// Resource kind (must be "WorkerConfig")
    pub kind: String,

    pub metadata: ManifestMetadata,

    pub spec: WorkerConfigSpec,
}

/// Manifest metadata (Kubernetes-style)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManifestMetadata {
    /// Human-readable worker name
    pub name: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub labels: Option<HashMap<String, String>>,
}

/// Worker configuration specification (content under spec:)
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WorkerConfigSpec {
    /// Per-role validity windows
    #[serde(default)]
    pub expiration: ExpirationPolicy,

    /// Default key sets for top-level roles at initialization
    #[serde(default)]
    pub initial_roles: BTreeMap<String, RoleKeySpec>,

    /// Signing keys available to this worker
    #[serde(default)]
    pub keys: Vec<KeyEntry>,

    #[serde(default)]
    pub executor: ExecutorConfig,

    #[serde(default)]
    pub storage: StorageConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

/// A signing key: either a private seed, or public material for a key
/// held by an offline authority
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyEntry {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    /// Hex ed25519 seed, or `env:VAR` to read it from the environment
    #[serde(skip_serializing_if = "Option::is_none")]
    pub seed: Option<String>,

    /// Hex ed25519 public key
    #[serde(skip_serializing_if = "Option::is_none")]
    pub public: Option<String>,

    /// Public material only; signing requests report the key unavailable
    #[serde(default)]
    pub offline: bool,
}

impl KeyEntry {
    /// Resolve the private seed, following `env:` indirection
    pub fn resolve_seed(&self) -> anyhow::Result<Option<[u8; 32]>> {
        let Some(seed) = &self.seed else {
            return Ok(None);
        };
        let raw = match seed.strip_prefix("env:") {
            Some(var) => std::env::var(var)
                .map_err(|_| anyhow::anyhow!("Environment variable {} is not set", var))?,
            None => seed.clone(),
        };
        Ok(Some(parse_seed(&raw)?))
    }

    /// Public key, derived from the seed when only the seed is given
    pub fn public_key(&self) -> anyhow::Result<PublicKey> {
        if let Some(public) = &self.public {
            return PublicKey::from_hex(public).map_err(|e| anyhow::anyhow!("{}", e));
        }
        match self.resolve_seed()? {
            Some(seed) => Ok(PublicKey::from_verifying_key(
                &SigningKey::from_bytes(&seed).verifying_key(),
            )),
            None => anyhow::bail!("Key entry has neither seed nor public key"),
        }
    }

    fn label(&self) -> String {
        self.name.clone().unwrap_or_else(|| "<unnamed>".to_string())
    }
}

pub fn parse_seed(raw: &str) -> anyhow::Result<[u8; 32]> {
    let bytes = hex::decode(raw.trim()).map_err(|e| anyhow::anyhow!("Seed is not hex: {}", e))?;
    bytes
        .try_into()
        .map_err(|_| anyhow::anyhow!("Ed25519 seeds are 32 bytes"))
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutorConfig {
    /// In-process retries after a commit conflict
    #[serde(default = "default_max_commit_retries")]
    pub max_commit_retries: u32,

    /// Wall-clock budget for one task
    #[serde(with = "humantime_serde", default = "default_task_timeout")]
    pub task_timeout: Duration,

    #[serde(default = "default_max_concurrent_tasks")]
    pub max_concurrent_tasks: usize,

    /// Deliveries of one message before a transient failure is aborted
    #[serde(default = "default_max_deliveries")]
    pub max_deliveries: u32,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            max_commit_retries: default_max_commit_retries(),
            task_timeout: default_task_timeout(),
            max_concurrent_tasks: default_max_concurrent_tasks(),
            max_deliveries: default_max_deliveries(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "backend", rename_all = "snake_case")]
pub enum StorageConfig {
    #[default]
    InMemory,
    Postgres {
        connection_string: String,
        #[serde(default = "default_max_connections")]
        max_connections: u32,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,

    /// "compact" or "json"
    #[serde(default = "default_log_format")]
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

fn default_max_commit_retries() -> u32 {
    5
}

fn default_task_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_max_concurrent_tasks() -> usize {
    4
}

fn default_max_deliveries() -> u32 {
    5
}

fn default_max_connections() -> u32 {
    5
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "compact".to_string()
}

impl Default for WorkerConfigManifest {
    fn default() -> Self {
        Self {
            api_version: API_VERSION.to_string(),
            kind: KIND.to_string(),
            metadata: ManifestMetadata {
                name: "tuf-worker".to_string(),
                version: Some("1.0.0".to_string()),
                labels: None,
            },
            spec: WorkerConfigSpec::default(),
        }
    }
}

impl WorkerConfigManifest {
    /// Load configuration from YAML file
    pub fn from_yaml_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config = serde_yaml::from_str(&content)?;
        Ok(config)
    }

    /// Save configuration to YAML file
    pub fn to_yaml_file(&self, path: impl AsRef<Path>) -> anyhow::Result<()> {
        let yaml = serde_yaml::to_string(self)?;
        std::fs::write(path, yaml)?;
        Ok(())
    }

    /// Parse configuration from YAML string
    pub fn from_yaml_str(yaml: &str) -> anyhow::Result<Self> {
        let config = serde_yaml::from_str(yaml)?;
        Ok(config)
    }

    /// Discover configuration file using precedence order
    /// 1. TUF_WORKER_CONFIG_PATH environment variable
    /// 2. ./tuf-worker.yaml (working directory)
    /// 3. ~/.tuf-worker/config.yaml (user home)
    /// 4. /etc/tuf-worker/config.yaml (system)
    pub fn discover_config() -> Option<PathBuf> {
        if let Ok(path) = std::env::var("TUF_WORKER_CONFIG_PATH") {
            let path = PathBuf::from(path);
            if path.exists() {
                return Some(path);
            }
        }

        let cwd = PathBuf::from("./tuf-worker.yaml");
        if cwd.exists() {
            return Some(cwd);
        }

        if let Some(home) = dirs::home_dir() {
            let user_config = home.join(".tuf-worker").join("config.yaml");
            if user_config.exists() {
                return Some(user_config);
            }
        }

        let system_config = PathBuf::from("/etc/tuf-worker/config.yaml");
        if system_config.exists() {
            return Some(system_config);
        }

        None
    }

    /// Load configuration with discovery, fallback to default
    pub fn load_or_default(cli_path: Option<PathBuf>) -> anyhow::Result<Self> {
        // Explicit CLI path must exist and parse
        if let Some(path) = cli_path {
            tracing::info!("Loading configuration from explicit path: {:?}", path);
            let mut config = Self::from_yaml_file(&path)
                .map_err(|e| anyhow::anyhow!("Failed to load config at {:?}: {}", path, e))?;
            config.apply_env_overrides();
            return Ok(config);
        }

        if let Some(config_path) = Self::discover_config() {
            tracing::info!("Loading configuration from discovered path: {:?}", config_path);
            let mut config = Self::from_yaml_file(config_path)?;
            config.apply_env_overrides();
            Ok(config)
        } else {
            tracing::warn!("No configuration file found in standard locations. Using defaults.");
            let mut config = Self::default();
            config.apply_env_overrides();
            Ok(config)
        }
    }

    /// Apply environment variable overrides to configuration
    pub fn apply_env_overrides(&mut self) {
        if let Ok(url) = std::env::var("TUF_WORKER_DATABASE_URL") {
            tracing::info!("Environment override: TUF_WORKER_DATABASE_URL");
            let max_connections = match &self.spec.storage {
                StorageConfig::Postgres {
                    max_connections, ..
                } => *max_connections,
                StorageConfig::InMemory => default_max_connections(),
            };
            self.spec.storage = StorageConfig::Postgres {
                connection_string: url,
                max_connections,
            };
        }

        if let Ok(val) = std::env::var("TUF_WORKER_MAX_CONCURRENT_TASKS") {
            match val.parse::<usize>() {
                Ok(n) => {
                    tracing::info!("Environment override: TUF_WORKER_MAX_CONCURRENT_TASKS={}", n);
                    self.spec.executor.max_concurrent_tasks = n;
                }
                Err(_) => {
                    tracing::warn!(
                        "Invalid value for TUF_WORKER_MAX_CONCURRENT_TASKS: '{}'. Expected a number. Ignoring.",
                        val
                    );
                }
            }
        }
    }

    /// Validate configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.api_version != API_VERSION {
            anyhow::bail!(
                "Invalid apiVersion: '{}'. Must be '{}'",
                self.api_version,
                API_VERSION
            );
        }

        if self.kind != KIND {
            anyhow::bail!("Invalid kind: '{}'. Must be '{}'", self.kind, KIND);
        }

        if self.metadata.name.is_empty() {
            anyhow::bail!("metadata.name cannot be empty");
        }

        let expiration = &self.spec.expiration;
        for role in [
            RoleName::Root,
            RoleName::Targets,
            RoleName::Snapshot,
            RoleName::Timestamp,
            RoleName::Delegated("*".to_string()),
        ] {
            if expiration.window(&role).is_zero() {
                let name = if role.is_top_level() { role.as_str() } else { "delegated" };
                anyhow::bail!("spec.expiration.{} cannot be zero", name);
            }
        }

        let executor = &self.spec.executor;
        if executor.max_commit_retries == 0 {
            anyhow::bail!("spec.executor.max_commit_retries must be at least 1");
        }
        if executor.task_timeout.is_zero() {
            anyhow::bail!("spec.executor.task_timeout cannot be zero");
        }
        if executor.max_concurrent_tasks == 0 {
            anyhow::bail!("spec.executor.max_concurrent_tasks must be at least 1");
        }
        if executor.max_deliveries == 0 {
            anyhow::bail!("spec.executor.max_deliveries must be at least 1");
        }

        let mut seen: BTreeSet<KeyId> = BTreeSet::new();
        for entry in &self.spec.keys {
            match (&entry.seed, &entry.public) {
                (None, None) => {
                    anyhow::bail!("Key {} needs a seed or a public key", entry.label())
                }
                (Some(_), _) if entry.offline => {
                    anyhow::bail!("Offline key {} cannot carry a seed", entry.label())
                }
                (None, Some(_)) if !entry.offline => {
                    anyhow::bail!(
                        "Key {} has no seed; mark it offline: true",
                        entry.label()
                    )
                }
                _ => {}
            }
            // Seeds behind env: are resolved when the key source is built.
            let deferred = entry.public.is_none()
                && entry.seed.as_deref().is_some_and(|s| s.starts_with("env:"));
            if deferred {
                continue;
            }
            let keyid = entry
                .public_key()
                .map_err(|e| anyhow::anyhow!("Key {}: {}", entry.label(), e))?
                .key_id()?;
            if !seen.insert(keyid.clone()) {
                anyhow::bail!("Duplicate key {} in spec.keys", keyid);
            }
        }

        for (role, spec) in &self.spec.initial_roles {
            if !RoleName::parse(role).is_top_level() {
                anyhow::bail!("spec.initial_roles.{} is not a top-level role", role);
            }
            let distinct: BTreeSet<&KeyId> = spec.keyids.iter().collect();
            if spec.threshold == 0 || spec.threshold as usize > distinct.len() {
                anyhow::bail!(
                    "spec.initial_roles.{} threshold {} must be within 1..={}",
                    role,
                    spec.threshold,
                    distinct.len()
                );
            }
        }

        match &self.spec.storage {
            StorageConfig::Postgres {
                connection_string,
                max_connections,
            } => {
                if connection_string.is_empty() {
                    anyhow::bail!("spec.storage.connection_string cannot be empty");
                }
                if *max_connections == 0 {
                    anyhow::bail!("spec.storage.max_connections must be at least 1");
                }
            }
            StorageConfig::InMemory => {}
        }

        if !matches!(self.spec.logging.format.as_str(), "compact" | "json") {
            anyhow::bail!(
                "Invalid logging format: '{}'. Must be 'compact' or 'json'",
                self.spec.logging.format
            );
        }

        Ok(())
    }
}
