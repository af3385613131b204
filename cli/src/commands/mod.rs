// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Command implementations for the TUF worker CLI

pub mod apply;
pub mod config;
pub mod keys;
pub mod migrate;
pub mod run;

pub use self::apply::ApplyCommand;
pub use self::config::ConfigCommand;
pub use self::keys::KeysCommand;
pub use self::migrate::MigrateCommand;
pub use self::run::RunCommand;
