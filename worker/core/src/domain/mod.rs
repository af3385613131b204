// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Domain model for the metadata lifecycle engine.
//!
//! # Architecture
//!
//! - **Layer:** Domain Layer
//! - **Purpose:** Documents, signing rules, planning and validation. Nothing
//!   here performs I/O except through the `KeySource`,
//!   `RepositoryStateStore` and `TaskQueue` traits.

pub mod canonical;
pub mod key;
pub mod role;
pub mod metadata;
pub mod bundle;
pub mod signer;
pub mod planner;
pub mod consistency;
pub mod task;
pub mod repository;
pub mod queue;
pub mod events;
pub mod worker_config;
