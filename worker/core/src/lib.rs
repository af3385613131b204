// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! TUF repository worker core
//!
//! Consumes repository-management tasks and produces signed, versioned,
//! internally consistent TUF metadata bundles.
//!
//! # Architecture
//!
//! - **Layer:** Core System
//! - **Purpose:** Domain model, task execution and storage adapters

pub mod domain;
pub mod application;
pub mod infrastructure;

pub use domain::*;
