// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Version & expiry planning.
//!
//! Validity windows are deployment policy and come from configuration
//! (`spec.expiration`); nothing here is hard-coded beyond the defaults.

use chrono::{DateTime, Duration as ChronoDuration, DurationRound, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

use crate::domain::metadata::{Metadata, RolePayload};
use crate::domain::role::RoleName;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PlannerError {
    #[error("Version of role {role} cannot advance past {version}")]
    VersionOverflow { role: RoleName, version: u64 },

    #[error("Validity window for role {role} is out of range")]
    InvalidWindow { role: RoleName },
}

/// Per-role validity windows
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExpirationPolicy {
    #[serde(with = "humantime_serde", default = "default_root")]
    pub root: Duration,

    #[serde(with = "humantime_serde", default = "default_targets")]
    pub targets: Duration,

    /// Applies to every delegated targets role, hash bins included
    #[serde(with = "humantime_serde", default = "default_delegated")]
    pub delegated: Duration,

    #[serde(with = "humantime_serde", default = "default_snapshot")]
    pub snapshot: Duration,

    #[serde(with = "humantime_serde", default = "default_timestamp")]
    pub timestamp: Duration,

    /// `bump_expiring` re-signs roles expiring within this many hours
    #[serde(default = "default_hours_before_expire")]
    pub hours_before_expire: u32,
}

const DAY: u64 = 24 * 60 * 60;

fn default_root() -> Duration {
    Duration::from_secs(365 * DAY)
}

fn default_targets() -> Duration {
    Duration::from_secs(365 * DAY)
}

fn default_delegated() -> Duration {
    Duration::from_secs(30 * DAY)
}

fn default_snapshot() -> Duration {
    Duration::from_secs(DAY)
}

fn default_timestamp() -> Duration {
    Duration::from_secs(DAY)
}

fn default_hours_before_expire() -> u32 {
    1
}

impl Default for ExpirationPolicy {
    fn default() -> Self {
        Self {
            root: default_root(),
            targets: default_targets(),
            delegated: default_delegated(),
            snapshot: default_snapshot(),
            timestamp: default_timestamp(),
            hours_before_expire: default_hours_before_expire(),
        }
    }
}

impl ExpirationPolicy {
    pub fn window(&self, role: &RoleName) -> Duration {
        match role {
            RoleName::Root => self.root,
            RoleName::Targets => self.targets,
            RoleName::Snapshot => self.snapshot,
            RoleName::Timestamp => self.timestamp,
            RoleName::Delegated(_) => self.delegated,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct Planner {
    policy: ExpirationPolicy,
}

impl Planner {
    pub fn new(policy: ExpirationPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &ExpirationPolicy {
        &self.policy
    }

    pub fn next_version(&self, role: &RoleName, previous: u64) -> Result<u64, PlannerError> {
        previous
            .checked_add(1)
            .ok_or_else(|| PlannerError::VersionOverflow {
                role: role.clone(),
                version: previous,
            })
    }

    /// `now + window(role)`, truncated to whole seconds
    pub fn compute_expiry(
        &self,
        role: &RoleName,
        now: DateTime<Utc>,
    ) -> Result<DateTime<Utc>, PlannerError> {
        let invalid = || PlannerError::InvalidWindow { role: role.clone() };
        let window = ChronoDuration::from_std(self.policy.window(role)).map_err(|_| invalid())?;
        let expires = now.checked_add_signed(window).ok_or_else(invalid)?;
        expires
            .duration_trunc(ChronoDuration::seconds(1))
            .map_err(|_| invalid())
    }

    /// Whether a document expiring at `expires` falls inside the
    /// `hours_before_expire` window
    pub fn expires_soon(&self, expires: DateTime<Utc>, now: DateTime<Utc>) -> bool {
        expires <= now + ChronoDuration::hours(self.policy.hours_before_expire as i64)
    }

    /// Advance `document` to its next version with a fresh expiry. Existing
    /// signatures no longer cover the content and are dropped.
    pub fn bump<T: RolePayload>(
        &self,
        document: &mut Metadata<T>,
        role: &RoleName,
        now: DateTime<Utc>,
    ) -> Result<(), PlannerError> {
        let version = self.next_version(role, document.version())?;
        let expires = self.compute_expiry(role, now)?;

        let common = document.signed.common_mut();
        common.version = version;
        common.expires = expires;
        document.signatures.clear();
        Ok(())
    }
}
