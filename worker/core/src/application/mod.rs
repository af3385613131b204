// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

pub mod mutation;
pub mod executor;
pub mod worker;

// Re-export use cases for convenience
pub use executor::{ErrorKind, ExecutorSettings, TaskError, TaskExecutor, TaskOutcome, TaskState};
pub use worker::TaskWorker;
