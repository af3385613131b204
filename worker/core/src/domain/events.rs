// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::domain::bundle::BundleIdentity;
use crate::domain::repository::RepositoryId;
use crate::domain::task::TaskId;

/// Task lifecycle events published by the executor
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum TaskEvent {
    TaskReceived {
        task_id: TaskId,
        repository: RepositoryId,
        task_type: String,
        received_at: DateTime<Utc>,
    },
    TaskCommitted {
        task_id: TaskId,
        repository: RepositoryId,
        identity: BundleIdentity,
        versions: BTreeMap<String, u64>,
        attempts: u32,
        committed_at: DateTime<Utc>,
    },
    TaskUnchanged {
        task_id: TaskId,
        repository: RepositoryId,
        completed_at: DateTime<Utc>,
    },
    TaskRejected {
        task_id: TaskId,
        repository: RepositoryId,
        kind: String, // "input", "resource", "consistency", "conflict", "aborted"
        reason: String,
        rejected_at: DateTime<Utc>,
    },
    CommitConflict {
        task_id: TaskId,
        repository: RepositoryId,
        attempt: u32,
        detected_at: DateTime<Utc>,
    },
}

impl TaskEvent {
    pub fn task_id(&self) -> TaskId {
        match self {
            TaskEvent::TaskReceived { task_id, .. }
            | TaskEvent::TaskCommitted { task_id, .. }
            | TaskEvent::TaskUnchanged { task_id, .. }
            | TaskEvent::TaskRejected { task_id, .. }
            | TaskEvent::CommitConflict { task_id, .. } => *task_id,
        }
    }

    pub fn repository(&self) -> &RepositoryId {
        match self {
            TaskEvent::TaskReceived { repository, .. }
            | TaskEvent::TaskCommitted { repository, .. }
            | TaskEvent::TaskUnchanged { repository, .. }
            | TaskEvent::TaskRejected { repository, .. }
            | TaskEvent::CommitConflict { repository, .. } => repository,
        }
    }
}
