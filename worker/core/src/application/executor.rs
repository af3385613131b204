// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Task Executor
//!
//! Drives one task through the lifecycle
//!
//! ```text
//! Received ──► Loaded ──► Mutated ──► Validated ──► Committed
//!     └──────────┴───────────┴────────────┴───────► Rejected
//! ```
//!
//! The executor is the only place that decides between retry, abort and
//! reject. Commit conflicts re-run the whole Loaded → Committed sequence
//! against freshly loaded state, up to `max_commit_retries` times; the
//! mutation is always re-derived, never replayed from a stale diff.

use chrono::Utc;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::application::mutation::{self, MutationContext};
use crate::domain::bundle::BundleIdentity;
use crate::domain::consistency::{ConsistencyError, ConsistencyValidator};
use crate::domain::events::TaskEvent;
use crate::domain::metadata::MetadataError;
use crate::domain::planner::{Planner, PlannerError};
use crate::domain::repository::{RepositoryId, RepositoryStateStore, StoreError};
use crate::domain::signer::{KeySourceError, SignerError, ThresholdSigner};
use crate::domain::task::{RoleKeySpec, TaskEnvelope, TaskId, TaskInputError};
use crate::domain::worker_config::ExecutorConfig;
use crate::infrastructure::event_bus::EventBus;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    Received,
    Loaded,
    Mutated,
    Validated,
    Committed,
    Rejected,
}

impl std::fmt::Display for TaskState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            TaskState::Received => "received",
            TaskState::Loaded => "loaded",
            TaskState::Mutated => "mutated",
            TaskState::Validated => "validated",
            TaskState::Committed => "committed",
            TaskState::Rejected => "rejected",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum TaskOutcome {
    Committed {
        identity: BundleIdentity,
        versions: BTreeMap<String, u64>,
        /// Commit attempts, 1 when the first commit succeeded
        attempts: u32,
    },
    /// The task did not change any document
    Unchanged { identity: BundleIdentity },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Input,
    Resource,
    Consistency,
    Conflict,
    Aborted,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Input => "input",
            ErrorKind::Resource => "resource",
            ErrorKind::Consistency => "consistency",
            ErrorKind::Conflict => "conflict",
            ErrorKind::Aborted => "aborted",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
pub enum TaskError {
    #[error(transparent)]
    Input(#[from] TaskInputError),

    #[error("Malformed document: {0}")]
    Metadata(#[from] MetadataError),

    #[error(transparent)]
    Signer(#[from] SignerError),

    #[error(transparent)]
    Planner(#[from] PlannerError),

    #[error("Consistency check {:?} failed: {}", .0.check(), .0)]
    Consistency(#[from] ConsistencyError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("Repository {0} is not initialized")]
    RepositoryNotInitialized(RepositoryId),

    #[error("Repository {0} is already initialized")]
    RepositoryAlreadyInitialized(RepositoryId),

    #[error("Task aborted after {attempts} attempts: {reason}")]
    TaskAborted { attempts: u32, reason: String },

    #[error("Task exceeded its {0:?} budget")]
    TaskTimedOut(Duration),
}

impl TaskError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            TaskError::Input(_)
            | TaskError::Metadata(_)
            | TaskError::RepositoryNotInitialized(_)
            | TaskError::RepositoryAlreadyInitialized(_) => ErrorKind::Input,
            TaskError::Signer(SignerError::Metadata(_)) => ErrorKind::Input,
            TaskError::Signer(
                SignerError::KeyUnavailable(_)
                | SignerError::InsufficientKeys { .. }
                | SignerError::InvalidSignature(_)
                | SignerError::KeySource(
                    KeySourceError::Transient(_)
                    | KeySourceError::KeyUnavailable(_)
                    | KeySourceError::UnknownKey(_),
                ),
            ) => ErrorKind::Resource,
            TaskError::Planner(_) | TaskError::Consistency(_) => ErrorKind::Consistency,
            TaskError::Store(StoreError::Conflict { .. }) => ErrorKind::Conflict,
            TaskError::Store(_) | TaskError::TaskTimedOut(_) => ErrorKind::Resource,
            TaskError::TaskAborted { .. } => ErrorKind::Aborted,
        }
    }

    /// Whether redelivering the task may succeed
    pub fn is_retryable(&self) -> bool {
        matches!(self.kind(), ErrorKind::Resource | ErrorKind::Conflict)
    }
}

#[derive(Debug, Clone)]
pub struct ExecutorSettings {
    pub max_commit_retries: u32,
    pub task_timeout: Duration,
    /// First backoff after a conflict, doubled on each further conflict
    pub retry_delay: Duration,
}

impl Default for ExecutorSettings {
    fn default() -> Self {
        Self::from(&ExecutorConfig::default())
    }
}

impl From<&ExecutorConfig> for ExecutorSettings {
    fn from(config: &ExecutorConfig) -> Self {
        Self {
            max_commit_retries: config.max_commit_retries,
            task_timeout: config.task_timeout,
            retry_delay: Duration::from_millis(10),
        }
    }
}

pub struct TaskExecutor {
    store: Arc<dyn RepositoryStateStore>,
    signer: Arc<ThresholdSigner>,
    planner: Planner,
    validator: ConsistencyValidator,
    initial_roles: BTreeMap<String, RoleKeySpec>,
    event_bus: Arc<EventBus>,
    settings: ExecutorSettings,
}

impl TaskExecutor {
    pub fn new(
        store: Arc<dyn RepositoryStateStore>,
        signer: Arc<ThresholdSigner>,
        planner: Planner,
        initial_roles: BTreeMap<String, RoleKeySpec>,
        event_bus: Arc<EventBus>,
        settings: ExecutorSettings,
    ) -> Self {
        Self {
            store,
            signer,
            planner,
            validator: ConsistencyValidator::new(),
            initial_roles,
            event_bus,
            settings,
        }
    }

    pub fn store(&self) -> &Arc<dyn RepositoryStateStore> {
        &self.store
    }

    pub fn settings(&self) -> &ExecutorSettings {
        &self.settings
    }

    /// Run one task to a terminal state within the configured time budget.
    pub async fn execute(&self, envelope: &TaskEnvelope) -> Result<TaskOutcome, TaskError> {
        let task_id = envelope.task_id;
        let repository = envelope.repository.clone();

        self.event_bus.publish(TaskEvent::TaskReceived {
            task_id,
            repository: repository.clone(),
            task_type: envelope.task.task_type().to_string(),
            received_at: Utc::now(),
        });
        transition(task_id, TaskState::Received);

        let result = match tokio::time::timeout(self.settings.task_timeout, self.run(envelope)).await
        {
            Ok(result) => result,
            Err(_) => Err(TaskError::TaskTimedOut(self.settings.task_timeout)),
        };

        match &result {
            Ok(TaskOutcome::Committed {
                identity,
                versions,
                attempts,
            }) => {
                transition(task_id, TaskState::Committed);
                info!(
                    task_id = %task_id,
                    repository = %repository,
                    identity = %identity,
                    attempts,
                    "Task committed"
                );
                metrics::counter!("tuf_worker_tasks_total", "outcome" => "committed").increment(1);
                self.event_bus.publish(TaskEvent::TaskCommitted {
                    task_id,
                    repository,
                    identity: identity.clone(),
                    versions: versions.clone(),
                    attempts: *attempts,
                    committed_at: Utc::now(),
                });
            }
            Ok(TaskOutcome::Unchanged { .. }) => {
                info!(task_id = %task_id, repository = %repository, "Task left repository unchanged");
                metrics::counter!("tuf_worker_tasks_total", "outcome" => "unchanged").increment(1);
                self.event_bus.publish(TaskEvent::TaskUnchanged {
                    task_id,
                    repository,
                    completed_at: Utc::now(),
                });
            }
            Err(e) => {
                transition(task_id, TaskState::Rejected);
                let kind = e.kind();
                warn!(
                    task_id = %task_id,
                    repository = %repository,
                    kind = %kind,
                    error = %e,
                    "Task rejected"
                );
                metrics::counter!("tuf_worker_tasks_total", "outcome" => kind.as_str())
                    .increment(1);
                self.event_bus.publish(TaskEvent::TaskRejected {
                    task_id,
                    repository,
                    kind: kind.to_string(),
                    reason: e.to_string(),
                    rejected_at: Utc::now(),
                });
            }
        }

        result
    }

    async fn run(&self, envelope: &TaskEnvelope) -> Result<TaskOutcome, TaskError> {
        envelope.task.validate()?;

        let task_id = envelope.task_id;
        let repository = &envelope.repository;
        let mut attempt: u32 = 1;

        loop {
            let current = self.store.load_current(repository).await?;
            transition(task_id, TaskState::Loaded);

            let ctx = MutationContext {
                repository,
                planner: &self.planner,
                signer: &self.signer,
                initial_roles: &self.initial_roles,
                now: Utc::now(),
            };
            let previous = current.as_ref().map(|stored| &stored.bundle);
            let Some(candidate) = mutation::mutate(&ctx, &envelope.task, previous).await? else {
                // mutate only returns None for an existing repository
                let identity = match current {
                    Some(stored) => stored.identity,
                    None => return Err(TaskError::RepositoryNotInitialized(repository.clone())),
                };
                return Ok(TaskOutcome::Unchanged { identity });
            };
            transition(task_id, TaskState::Mutated);

            self.validator.validate(&candidate, previous, Utc::now())?;
            transition(task_id, TaskState::Validated);

            let expected = current.as_ref().map(|stored| &stored.identity);
            match self.store.commit(repository, &candidate, expected).await {
                Ok(identity) => {
                    return Ok(TaskOutcome::Committed {
                        identity,
                        versions: candidate.manifest(),
                        attempts: attempt,
                    })
                }
                Err(StoreError::Conflict { .. }) => {
                    metrics::counter!("tuf_worker_commit_conflicts_total").increment(1);
                    self.event_bus.publish(TaskEvent::CommitConflict {
                        task_id,
                        repository: repository.clone(),
                        attempt,
                        detected_at: Utc::now(),
                    });
                    warn!(
                        task_id = %task_id,
                        repository = %repository,
                        attempt,
                        "Commit conflict, reloading repository state"
                    );

                    if attempt > self.settings.max_commit_retries {
                        return Err(TaskError::TaskAborted {
                            attempts: attempt,
                            reason: "commit conflicts exhausted the retry budget".to_string(),
                        });
                    }

                    let delay = self.settings.retry_delay * 2_u32.saturating_pow((attempt - 1).min(6));
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }
}

fn transition(task_id: TaskId, state: TaskState) {
    debug!(task_id = %task_id, state = %state, "Task state transition");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::key::KeyId;
    use crate::domain::role::RoleName;
    use crate::domain::task::{Artifact, Task};
    use crate::domain::worker_config::KeyEntry;
    use crate::infrastructure::key_source::LocalKeySource;
    use crate::infrastructure::repositories::InMemoryRepositoryStateStore;
    use ed25519_dalek::SigningKey;

    struct Harness {
        executor: TaskExecutor,
        store: Arc<InMemoryRepositoryStateStore>,
        event_bus: Arc<EventBus>,
        keyids: Vec<KeyId>,
    }

    fn seed(n: u8) -> [u8; 32] {
        [n; 32]
    }

    fn harness(offline: &[u8]) -> Harness {
        let mut entries = Vec::new();
        let mut keyids = Vec::new();
        for n in 1..=4u8 {
            let signing = SigningKey::from_bytes(&seed(n));
            let public = crate::domain::key::PublicKey::from_verifying_key(&signing.verifying_key());
            keyids.push(public.key_id().unwrap());
            entries.push(if offline.contains(&n) {
                KeyEntry {
                    name: None,
                    seed: None,
                    public: Some(hex::encode(signing.verifying_key().to_bytes())),
                    offline: true,
                }
            } else {
                KeyEntry {
                    name: None,
                    seed: Some(hex::encode(seed(n))),
                    public: None,
                    offline: false,
                }
            });
        }
        let source = LocalKeySource::from_entries(&entries).unwrap();

        let mut initial_roles = BTreeMap::new();
        initial_roles.insert(
            "root".to_string(),
            RoleKeySpec {
                keyids: keyids[0..3].to_vec(),
                threshold: 2,
            },
        );
        for role in ["targets", "snapshot", "timestamp"] {
            initial_roles.insert(
                role.to_string(),
                RoleKeySpec {
                    keyids: vec![keyids[3].clone()],
                    threshold: 1,
                },
            );
        }

        let store = Arc::new(InMemoryRepositoryStateStore::new());
        let event_bus = Arc::new(EventBus::with_default_capacity());
        let executor = TaskExecutor::new(
            store.clone(),
            Arc::new(ThresholdSigner::new(Arc::new(source))),
            Planner::default(),
            initial_roles,
            event_bus.clone(),
            ExecutorSettings::default(),
        );
        Harness {
            executor,
            store,
            event_bus,
            keyids,
        }
    }

    fn repo() -> RepositoryId {
        RepositoryId::new("acme")
    }

    fn initialize() -> TaskEnvelope {
        TaskEnvelope::new(
            repo(),
            Task::InitializeRepository {
                roles: BTreeMap::new(),
                consistent_snapshot: true,
                hash_bins: None,
            },
        )
    }

    fn publish(path: &str) -> TaskEnvelope {
        TaskEnvelope::new(
            repo(),
            Task::PublishArtifacts {
                artifacts: vec![Artifact {
                    path: path.to_string(),
                    length: 1024,
                    hashes: BTreeMap::from([("sha256".to_string(), "ab".repeat(32))]),
                    custom: None,
                }],
                role: None,
            },
        )
    }

    #[tokio::test]
    async fn test_initialize_creates_version_one() {
        let h = harness(&[]);
        let outcome = h.executor.execute(&initialize()).await.unwrap();

        let TaskOutcome::Committed { versions, attempts, .. } = outcome else {
            panic!("expected a commit");
        };
        assert_eq!(attempts, 1);
        for role in ["root", "targets", "snapshot", "timestamp"] {
            assert_eq!(versions.get(role), Some(&1), "{role}");
        }
        assert_eq!(h.store.history(&repo()).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_initialize_twice_is_rejected_as_input() {
        let h = harness(&[]);
        h.executor.execute(&initialize()).await.unwrap();

        let err = h.executor.execute(&initialize()).await.unwrap_err();
        assert!(matches!(err, TaskError::RepositoryAlreadyInitialized(_)));
        assert_eq!(err.kind(), ErrorKind::Input);
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn test_task_on_uninitialized_repository_is_rejected() {
        let h = harness(&[]);
        let err = h.executor.execute(&publish("a.bin")).await.unwrap_err();
        assert!(matches!(err, TaskError::RepositoryNotInitialized(_)));
        assert!(h.store.load_current(&repo()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_publish_cascades_to_snapshot_and_timestamp() {
        let h = harness(&[]);
        h.executor.execute(&initialize()).await.unwrap();

        let TaskOutcome::Committed { versions, .. } =
            h.executor.execute(&publish("app-1.0.bin")).await.unwrap()
        else {
            panic!("expected a commit");
        };
        assert_eq!(versions.get("root"), Some(&1));
        assert_eq!(versions.get("targets"), Some(&2));
        assert_eq!(versions.get("snapshot"), Some(&2));
        assert_eq!(versions.get("timestamp"), Some(&2));
    }

    #[tokio::test]
    async fn test_republishing_same_artifact_is_unchanged() {
        let h = harness(&[]);
        h.executor.execute(&initialize()).await.unwrap();
        h.executor.execute(&publish("a.bin")).await.unwrap();
        let before = h.store.load_current(&repo()).await.unwrap().unwrap();

        let outcome = h.executor.execute(&publish("a.bin")).await.unwrap();
        assert_eq!(
            outcome,
            TaskOutcome::Unchanged {
                identity: before.identity.clone()
            }
        );
        assert_eq!(h.store.history(&repo()).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_offline_targets_key_is_a_resource_error() {
        let h = harness(&[4]);
        let err = h.executor.execute(&initialize()).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Resource);
        assert!(err.is_retryable());
        assert!(h.store.load_current(&repo()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_rotation_below_threshold_is_input_error() {
        let h = harness(&[]);
        h.executor.execute(&initialize()).await.unwrap();

        let err = h
            .executor
            .execute(&TaskEnvelope::new(
                repo(),
                Task::RotateKeys {
                    role: "targets".to_string(),
                    keyids: vec![h.keyids[0].clone()],
                    threshold: 2,
                },
            ))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Input);
    }

    #[tokio::test]
    async fn test_refresh_bumps_only_timestamp() {
        let h = harness(&[]);
        h.executor.execute(&initialize()).await.unwrap();

        let TaskOutcome::Committed { versions, .. } = h
            .executor
            .execute(&TaskEnvelope::new(
                repo(),
                Task::RefreshMetadata {
                    include_snapshot: false,
                },
            ))
            .await
            .unwrap()
        else {
            panic!("expected a commit");
        };
        assert_eq!(versions.get("timestamp"), Some(&2));
        assert_eq!(versions.get("snapshot"), Some(&1));
        assert_eq!(versions.get("targets"), Some(&1));
    }

    #[tokio::test]
    async fn test_events_follow_the_lifecycle() {
        let h = harness(&[]);
        let mut events = h.event_bus.subscribe();
        h.executor.execute(&initialize()).await.unwrap();

        assert!(matches!(
            events.recv().await.unwrap(),
            TaskEvent::TaskReceived { .. }
        ));
        assert!(matches!(
            events.recv().await.unwrap(),
            TaskEvent::TaskCommitted { .. }
        ));
    }

    #[test]
    fn test_error_kinds() {
        let conflict = TaskError::Store(StoreError::Conflict {
            repository: repo(),
            expected: None,
            actual: None,
        });
        assert_eq!(conflict.kind(), ErrorKind::Conflict);
        assert!(conflict.is_retryable());

        let overflow = TaskError::Planner(PlannerError::VersionOverflow {
            role: RoleName::Targets,
            version: u64::MAX,
        });
        assert_eq!(overflow.kind(), ErrorKind::Consistency);
        assert!(!overflow.is_retryable());

        let aborted = TaskError::TaskAborted {
            attempts: 6,
            reason: "conflicts".to_string(),
        };
        assert_eq!(aborted.kind(), ErrorKind::Aborted);
        assert!(!aborted.is_retryable());

        assert_eq!(
            TaskError::TaskTimedOut(Duration::from_secs(1)).kind(),
            ErrorKind::Resource
        );
    }

    #[test]
    fn test_consistency_error_message_names_the_check() {
        let err = TaskError::from(ConsistencyError::InsufficientSignatures {
            role: RoleName::Snapshot,
        });
        assert_eq!(err.kind(), ErrorKind::Consistency);
        assert_eq!(
            err.to_string(),
            "Consistency check Signatures failed: Role snapshot is not fully signed"
        );
    }
}
