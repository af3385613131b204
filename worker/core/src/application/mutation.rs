// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Task Mutations
//!
//! Turns one task plus the current bundle into a signed candidate bundle.
//!
//! Each task only edits document *content* and records which roles it
//! touched. [`Draft::finish`] then runs the fixed signing pipeline:
//!
//! ```text
//! root ──► re-sign roles whose authority changed
//!      ──► delegated targets ──► targets ──► snapshot ──► timestamp
//! ```
//!
//! Any change to targets or a delegated role regenerates snapshot, and any
//! snapshot change regenerates timestamp. A task that touches nothing
//! yields `None`, which the executor reports as unchanged.

use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, warn};

use crate::application::executor::TaskError;
use crate::domain::bundle::Bundle;
use crate::domain::consistency::ConsistencyError;
use crate::domain::key::{KeyId, PublicKey};
use crate::domain::metadata::{
    self, DelegatedRole, Delegations, MetaFile, Metadata, RoleAuthority, RoleKeys, Root, Snapshot,
    SuccinctRoles, TargetFile, Targets, Timestamp,
};
use crate::domain::planner::Planner;
use crate::domain::repository::RepositoryId;
use crate::domain::role::{path_matches, RoleName};
use crate::domain::signer::{KeySourceError, SignerError, ThresholdSigner};
use crate::domain::task::{Artifact, HashBinSpec, RoleKeySpec, Task, TaskInputError};

/// Read-only collaborators for one mutation attempt
pub struct MutationContext<'a> {
    pub repository: &'a RepositoryId,
    pub planner: &'a Planner,
    pub signer: &'a ThresholdSigner,
    pub initial_roles: &'a BTreeMap<String, RoleKeySpec>,
    pub now: DateTime<Utc>,
}

/// Apply `task` to `current`. Returns `None` when the task changes nothing.
pub async fn mutate(
    ctx: &MutationContext<'_>,
    task: &Task,
    current: Option<&Bundle>,
) -> Result<Option<Bundle>, TaskError> {
    let draft = match (task, current) {
        (
            Task::InitializeRepository {
                roles,
                consistent_snapshot,
                hash_bins,
            },
            None,
        ) => Draft::initialize(ctx, roles, *consistent_snapshot, hash_bins.as_ref()).await?,
        (Task::InitializeRepository { .. }, Some(_)) => {
            return Err(TaskError::RepositoryAlreadyInitialized(ctx.repository.clone()))
        }
        (_, None) => return Err(TaskError::RepositoryNotInitialized(ctx.repository.clone())),
        (task, Some(current)) => {
            let mut draft = Draft::from_current(current);
            draft.apply(ctx, task).await?;
            draft
        }
    };
    draft.finish(ctx).await
}

fn invalid(message: impl Into<String>) -> TaskError {
    TaskError::Input(TaskInputError::InvalidParameters(message.into()))
}

/// Where a role's key set is declared
enum KeySlot {
    TopLevel(RoleName),
    Explicit { delegator: RoleName, name: String },
    Succinct { delegator: RoleName },
}

struct Draft<'b> {
    base: Option<&'b Bundle>,
    work: Bundle,
    dirty: BTreeSet<RoleName>,
    /// Root is dirty only to renew its expiry; skipped when the online
    /// root keys cannot meet the threshold
    root_renewal_only: bool,
}

impl<'b> Draft<'b> {
    fn from_current(current: &'b Bundle) -> Self {
        Self {
            base: Some(current),
            work: current.clone(),
            dirty: BTreeSet::new(),
            root_renewal_only: false,
        }
    }

    /// Every document starts at version 0; `finish` moves them all to 1.
    async fn initialize(
        ctx: &MutationContext<'_>,
        roles: &BTreeMap<String, RoleKeySpec>,
        consistent_snapshot: bool,
        hash_bins: Option<&HashBinSpec>,
    ) -> Result<Draft<'b>, TaskError> {
        let mut root = Root::new(0, ctx.now, consistent_snapshot);
        for role in RoleName::top_level() {
            let spec = roles
                .get(role.as_str())
                .or_else(|| ctx.initial_roles.get(role.as_str()))
                .ok_or_else(|| invalid(format!("no key configuration for role {}", role)))?;
            let keys = RoleKeys::new(spec.keyids.iter().cloned(), spec.threshold);
            keys.check(role.as_str())
                .map_err(|e| invalid(e.to_string()))?;
            root.keys.extend(resolve_keys(ctx, &keys.keyids).await?);
            root.roles.insert(role.to_string(), keys);
        }

        let mut targets = Targets::new(0, ctx.now);
        let mut delegated = BTreeMap::new();
        if let Some(bins) = hash_bins {
            let keys = RoleKeys::new(bins.keyids.iter().cloned(), bins.threshold);
            keys.check(&bins.name_prefix)
                .map_err(|e| invalid(e.to_string()))?;
            let succinct = SuccinctRoles {
                keyids: keys.keyids.clone(),
                threshold: keys.threshold,
                bit_length: bins.bit_length,
                name_prefix: bins.name_prefix.clone(),
            };
            for name in succinct.bin_names() {
                delegated.insert(name, Metadata::new(Targets::new(0, ctx.now)));
            }
            targets.delegations = Some(Delegations {
                keys: resolve_keys(ctx, &keys.keyids).await?,
                roles: None,
                succinct_roles: Some(succinct),
            });
        }

        let work = Bundle {
            root: Metadata::new(root),
            targets: Metadata::new(targets),
            snapshot: Metadata::new(Snapshot::new(0, ctx.now)),
            timestamp: Metadata::new(Timestamp::new(0, ctx.now)),
            delegated,
        };
        let dirty = work.roles().into_iter().collect();
        Ok(Draft {
            base: None,
            work,
            dirty,
            root_renewal_only: false,
        })
    }

    async fn apply(&mut self, ctx: &MutationContext<'_>, task: &Task) -> Result<(), TaskError> {
        match task {
            Task::InitializeRepository { .. } => Err(TaskError::RepositoryAlreadyInitialized(
                ctx.repository.clone(),
            )),
            Task::AddKey {
                role,
                keyid,
                threshold,
            } => {
                let role = RoleName::parse(role);
                let slot = self.key_slot(&role)?;
                let current = self.slot_keys(&slot)?;
                let keys = RoleKeys::new(
                    current.keyids.iter().cloned().chain([keyid.clone()]),
                    threshold.unwrap_or(current.threshold),
                );
                self.set_keys(ctx, slot, keys).await
            }
            Task::RemoveKey {
                role,
                keyid,
                threshold,
            } => {
                let role = RoleName::parse(role);
                let slot = self.key_slot(&role)?;
                let current = self.slot_keys(&slot)?;
                if !current.contains(keyid) {
                    return Err(invalid(format!(
                        "key {} is not authorized for role {}",
                        keyid, role
                    )));
                }
                let keys = RoleKeys::new(
                    current.keyids.iter().filter(|id| *id != keyid).cloned(),
                    threshold.unwrap_or(current.threshold),
                );
                self.set_keys(ctx, slot, keys).await
            }
            Task::RotateKeys {
                role,
                keyids,
                threshold,
            } => {
                let slot = self.key_slot(&RoleName::parse(role))?;
                self.set_keys(ctx, slot, RoleKeys::new(keyids.iter().cloned(), *threshold))
                    .await
            }
            Task::PublishArtifacts { artifacts, role } => {
                self.publish(artifacts, role.as_deref())
            }
            Task::RemoveArtifacts { paths, role } => self.remove(paths, role.as_deref()),
            Task::DelegateRole {
                name,
                keyids,
                threshold,
                paths,
                terminating,
            } => {
                self.delegate(ctx, name, keyids, *threshold, paths, *terminating)
                    .await
            }
            Task::RefreshMetadata { include_snapshot } => {
                self.dirty.insert(RoleName::Timestamp);
                if *include_snapshot {
                    self.dirty.insert(RoleName::Snapshot);
                }
                Ok(())
            }
            Task::BumpExpiring {} => {
                if ctx.planner.expires_soon(self.work.root.expires(), ctx.now) {
                    debug!("Root expires soon, scheduling renewal");
                    self.dirty.insert(RoleName::Root);
                    self.root_renewal_only = true;
                }

                let mut candidates = vec![RoleName::Targets];
                candidates.extend(self.work.delegated.keys().cloned().map(RoleName::Delegated));
                candidates.push(RoleName::Snapshot);

                for role in candidates {
                    let expiring = self
                        .work
                        .expires_of(&role)
                        .is_some_and(|e| ctx.planner.expires_soon(e, ctx.now));
                    if expiring {
                        debug!(role = %role, "Role expires soon, scheduling bump");
                        self.dirty.insert(role);
                    }
                }
                Ok(())
            }
        }
    }

    // ------------------------------------------------------------------
    // Keys
    // ------------------------------------------------------------------

    fn key_slot(&self, role: &RoleName) -> Result<KeySlot, TaskError> {
        let RoleName::Delegated(name) = role else {
            return Ok(KeySlot::TopLevel(role.clone()));
        };

        let succinct_prefix = self
            .work
            .targets
            .signed
            .delegations
            .as_ref()
            .and_then(|d| d.succinct_roles.as_ref())
            .map(|s| s.name_prefix.as_str());
        if succinct_prefix == Some(name.as_str()) {
            return Ok(KeySlot::Succinct {
                delegator: RoleName::Targets,
            });
        }

        let delegator = self
            .work
            .delegator_of(name)
            .ok_or_else(|| invalid(format!("role {} is not delegated", name)))?;
        let explicit = self
            .work
            .targets_document(&delegator)
            .and_then(|d| d.signed.delegations.as_ref())
            .is_some_and(|d| d.explicit_role(name).is_some());
        if !explicit {
            return Err(invalid(format!(
                "hash bin {} shares its keys with every bin; address the bins by their prefix",
                name
            )));
        }
        Ok(KeySlot::Explicit {
            delegator,
            name: name.clone(),
        })
    }

    fn slot_keys(&self, slot: &KeySlot) -> Result<RoleKeys, TaskError> {
        let keys = match slot {
            KeySlot::TopLevel(role) => self.work.root.signed.role_keys(role).cloned(),
            KeySlot::Explicit { delegator, name } => self
                .work
                .targets_document(delegator)
                .and_then(|d| d.signed.delegations.as_ref())
                .and_then(|d| d.explicit_role(name))
                .map(DelegatedRole::role_keys),
            KeySlot::Succinct { delegator } => self
                .work
                .targets_document(delegator)
                .and_then(|d| d.signed.delegations.as_ref())
                .and_then(|d| d.succinct_roles.as_ref())
                .map(SuccinctRoles::role_keys),
        };
        keys.ok_or_else(|| invalid("role has no key configuration"))
    }

    /// Write a new key set into the document that declares it. The declaring
    /// document is marked dirty only when its content actually changes.
    async fn set_keys(
        &mut self,
        ctx: &MutationContext<'_>,
        slot: KeySlot,
        keys: RoleKeys,
    ) -> Result<(), TaskError> {
        let label = match &slot {
            KeySlot::TopLevel(role) => role.to_string(),
            KeySlot::Explicit { name, .. } => name.clone(),
            KeySlot::Succinct { .. } => "hash bins".to_string(),
        };
        keys.check(&label).map_err(|e| invalid(e.to_string()))?;
        let public = resolve_keys(ctx, &keys.keyids).await?;

        let changed = match slot {
            KeySlot::TopLevel(role) => {
                let root = &mut self.work.root.signed;
                let before = root.clone();
                root.roles.insert(role.to_string(), keys);
                root.keys.extend(public);
                root.prune_unused_keys();
                (*root != before).then_some(RoleName::Root)
            }
            KeySlot::Explicit { delegator, name } => {
                let document = self
                    .work
                    .targets_document_mut(&delegator)
                    .ok_or_else(|| invalid(format!("delegator {} has no document", delegator)))?;
                let before = document.signed.clone();
                if let Some(delegations) = document.signed.delegations.as_mut() {
                    if let Some(declared) = delegations.explicit_role_mut(&name) {
                        declared.keyids = keys.keyids;
                        declared.threshold = keys.threshold;
                    }
                    delegations.keys.extend(public);
                    delegations.prune_unused_keys();
                }
                (document.signed != before).then_some(delegator)
            }
            KeySlot::Succinct { delegator } => {
                let document = self
                    .work
                    .targets_document_mut(&delegator)
                    .ok_or_else(|| invalid(format!("delegator {} has no document", delegator)))?;
                let before = document.signed.clone();
                if let Some(delegations) = document.signed.delegations.as_mut() {
                    if let Some(succinct) = delegations.succinct_roles.as_mut() {
                        succinct.keyids = keys.keyids;
                        succinct.threshold = keys.threshold;
                    }
                    delegations.keys.extend(public);
                    delegations.prune_unused_keys();
                }
                (document.signed != before).then_some(delegator)
            }
        };

        if let Some(holder) = changed {
            self.dirty.insert(holder);
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Targets
    // ------------------------------------------------------------------

    /// Document responsible for `path`
    fn route(&self, path: &str, role: Option<&str>) -> Result<RoleName, TaskError> {
        let Some(role) = role else {
            let succinct = self
                .work
                .targets
                .signed
                .delegations
                .as_ref()
                .and_then(|d| d.succinct_roles.as_ref());
            return Ok(match succinct {
                Some(bins) => RoleName::Delegated(bins.bin_for_path(path)),
                None => RoleName::Targets,
            });
        };

        let name = match RoleName::parse(role) {
            RoleName::Targets => return Ok(RoleName::Targets),
            RoleName::Delegated(name) => name,
            other => return Err(invalid(format!("{} does not hold targets", other))),
        };
        if !self.work.delegated.contains_key(&name) {
            return Err(invalid(format!("unknown delegated role {}", name)));
        }
        let delegations = self
            .work
            .delegator_of(&name)
            .and_then(|d| self.work.targets_document(&d))
            .and_then(|d| d.signed.delegations.as_ref())
            .ok_or_else(|| invalid(format!("role {} is not delegated", name)))?;

        let allowed = match (delegations.explicit_role(&name), &delegations.succinct_roles) {
            (Some(declared), _) => declared.paths.iter().any(|p| path_matches(p, path)),
            (None, Some(bins)) => bins.bin_for_path(path) == name,
            (None, None) => false,
        };
        if !allowed {
            return Err(invalid(format!(
                "path {} is outside the namespace of {}",
                path, name
            )));
        }
        Ok(RoleName::Delegated(name))
    }

    fn publish(&mut self, artifacts: &[Artifact], role: Option<&str>) -> Result<(), TaskError> {
        let mut routed: BTreeMap<RoleName, Vec<&Artifact>> = BTreeMap::new();
        for artifact in artifacts {
            routed
                .entry(self.route(&artifact.path, role)?)
                .or_default()
                .push(artifact);
        }

        for (destination, items) in routed {
            let document = self
                .work
                .targets_document_mut(&destination)
                .ok_or_else(|| invalid(format!("{} has no document", destination)))?;
            let mut changed = false;
            for artifact in items {
                let file = TargetFile {
                    length: artifact.length,
                    hashes: artifact.hashes.clone(),
                    custom: artifact.custom.clone(),
                };
                if document.signed.targets.get(&artifact.path) != Some(&file) {
                    document.signed.targets.insert(artifact.path.clone(), file);
                    changed = true;
                }
            }
            if changed {
                self.dirty.insert(destination);
            }
        }
        Ok(())
    }

    fn remove(&mut self, paths: &[String], role: Option<&str>) -> Result<(), TaskError> {
        for path in paths {
            let destination = self.route(path, role)?;
            let document = self
                .work
                .targets_document_mut(&destination)
                .ok_or_else(|| invalid(format!("{} has no document", destination)))?;
            if document.signed.targets.remove(path).is_none() {
                return Err(invalid(format!(
                    "target {} is not published in {}",
                    path, destination
                )));
            }
            self.dirty.insert(destination);
        }
        Ok(())
    }

    async fn delegate(
        &mut self,
        ctx: &MutationContext<'_>,
        name: &str,
        keyids: &[KeyId],
        threshold: u32,
        paths: &[String],
        terminating: bool,
    ) -> Result<(), TaskError> {
        if let Some(delegator) = self.work.delegator_of(name) {
            if delegator != RoleName::Targets {
                return Err(invalid(format!(
                    "role {} is already delegated by {}",
                    name, delegator
                )));
            }
        }
        let keys = RoleKeys::new(keyids.iter().cloned(), threshold);
        keys.check(name).map_err(|e| invalid(e.to_string()))?;
        let public = resolve_keys(ctx, &keys.keyids).await?;

        let targets = &mut self.work.targets.signed;
        let before = targets.clone();
        let delegations = targets.delegations.get_or_insert_with(Delegations::explicit);
        if delegations.succinct_roles.is_some() {
            return Err(invalid(
                "targets delegates to hash bins; explicit roles cannot be added",
            ));
        }

        let declared = DelegatedRole {
            name: name.to_string(),
            keyids: keys.keyids,
            threshold: keys.threshold,
            terminating,
            paths: paths.to_vec(),
        };
        match delegations.explicit_role_mut(name) {
            Some(existing) => *existing = declared,
            None => delegations.roles.get_or_insert_with(Vec::new).push(declared),
        }
        delegations.keys.extend(public);
        delegations.prune_unused_keys();

        if *targets != before {
            self.dirty.insert(RoleName::Targets);
        }
        if !self.work.delegated.contains_key(name) {
            self.work
                .delegated
                .insert(name.to_string(), Metadata::new(Targets::new(0, ctx.now)));
            self.dirty.insert(RoleName::Delegated(name.to_string()));
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Signing pipeline
    // ------------------------------------------------------------------

    /// Bump root and sign it with the union of the new and previous root
    /// key sets
    async fn sign_root(
        &mut self,
        ctx: &MutationContext<'_>,
        now: DateTime<Utc>,
    ) -> Result<(), TaskError> {
        ctx.planner.bump(&mut self.work.root, &RoleName::Root, now)?;
        let mut authorities = vec![authority(&self.work, &RoleName::Root)?];
        if let Some(previous) = self
            .base
            .and_then(|b| b.root.signed.authority(&RoleName::Root))
        {
            authorities.push(previous);
        }
        ctx.signer
            .sign_document(&mut self.work.root, &authorities)
            .await?;
        debug!(version = self.work.root.version(), "Signed root");
        Ok(())
    }

    async fn finish(mut self, ctx: &MutationContext<'_>) -> Result<Option<Bundle>, TaskError> {
        if self.dirty.is_empty() {
            return Ok(None);
        }
        let now = ctx.now;

        if self.dirty.contains(&RoleName::Root) {
            match self.sign_root(ctx, now).await {
                Ok(()) => {}
                Err(TaskError::Signer(SignerError::InsufficientKeys {
                    obtained, required, ..
                })) if self.root_renewal_only => {
                    warn!(
                        obtained,
                        required,
                        "Root expires soon but online keys cannot renew it; leaving root as is"
                    );
                    if let Some(base) = self.base {
                        self.work.root = base.root.clone();
                    }
                    self.dirty.remove(&RoleName::Root);
                    if self.dirty.is_empty() {
                        return Ok(None);
                    }
                }
                Err(e) => return Err(e),
            }
        }

        // A key change can leave untouched documents short of signatures.
        for role in self.work.roles() {
            if role == RoleName::Root || self.dirty.contains(&role) {
                continue;
            }
            if self.work.is_fully_signed(&role) == Some(false) {
                debug!(role = %role, "Authority changed, role needs new signatures");
                self.dirty.insert(role);
            }
        }

        let delegated: Vec<String> = self
            .dirty
            .iter()
            .filter_map(|role| match role {
                RoleName::Delegated(name) => Some(name.clone()),
                _ => None,
            })
            .collect();
        for name in &delegated {
            let role = RoleName::Delegated(name.clone());
            let authority = self
                .work
                .role_authority(&role)
                .ok_or_else(|| ConsistencyError::UndelegatedRole { role: name.clone() })?;
            let document = self
                .work
                .delegated
                .get_mut(name)
                .ok_or_else(|| invalid(format!("delegated role {} has no document", name)))?;
            ctx.planner.bump(document, &role, now)?;
            ctx.signer.sign_document(document, &[authority]).await?;
            debug!(role = %role, version = document.version(), "Signed delegated role");
        }

        let mut snapshot_due = self.dirty.contains(&RoleName::Snapshot) || !delegated.is_empty();

        if self.dirty.contains(&RoleName::Targets) {
            let authority = authority(&self.work, &RoleName::Targets)?;
            ctx.planner
                .bump(&mut self.work.targets, &RoleName::Targets, now)?;
            ctx.signer
                .sign_document(&mut self.work.targets, &[authority])
                .await?;
            debug!(version = self.work.targets.version(), "Signed targets");
            snapshot_due = true;
        }

        if snapshot_due {
            self.work.snapshot.signed.meta = snapshot_meta(&self.work);
            let authority = authority(&self.work, &RoleName::Snapshot)?;
            ctx.planner
                .bump(&mut self.work.snapshot, &RoleName::Snapshot, now)?;
            ctx.signer
                .sign_document(&mut self.work.snapshot, &[authority])
                .await?;
            debug!(version = self.work.snapshot.version(), "Signed snapshot");
        }

        if snapshot_due || self.dirty.contains(&RoleName::Timestamp) {
            let snapshot_bytes = self.work.snapshot.to_bytes()?;
            self.work.timestamp.signed.set_snapshot_meta(MetaFile {
                version: self.work.snapshot.version(),
                length: Some(snapshot_bytes.len() as u64),
                hashes: Some(BTreeMap::from([(
                    "sha256".to_string(),
                    metadata::fingerprint(&snapshot_bytes),
                )])),
            });
            let authority = authority(&self.work, &RoleName::Timestamp)?;
            ctx.planner
                .bump(&mut self.work.timestamp, &RoleName::Timestamp, now)?;
            ctx.signer
                .sign_document(&mut self.work.timestamp, &[authority])
                .await?;
            debug!(version = self.work.timestamp.version(), "Signed timestamp");
        }

        Ok(Some(self.work))
    }
}

fn authority(bundle: &Bundle, role: &RoleName) -> Result<RoleAuthority, TaskError> {
    bundle
        .role_authority(role)
        .ok_or_else(|| invalid(format!("root declares no keys for {}", role)))
}

fn snapshot_meta(bundle: &Bundle) -> BTreeMap<String, MetaFile> {
    let mut meta = BTreeMap::new();
    meta.insert(
        RoleName::Targets.metadata_filename(),
        MetaFile::version_only(bundle.targets.version()),
    );
    for (name, document) in &bundle.delegated {
        meta.insert(
            RoleName::Delegated(name.clone()).metadata_filename(),
            MetaFile::version_only(document.version()),
        );
    }
    meta
}

/// Fetch and check public material for every key id
async fn resolve_keys(
    ctx: &MutationContext<'_>,
    keyids: &[KeyId],
) -> Result<BTreeMap<KeyId, PublicKey>, TaskError> {
    let mut out = BTreeMap::new();
    for keyid in keyids {
        let key = match ctx.signer.public_key_for(keyid).await {
            Ok(key) => key,
            Err(SignerError::KeySource(KeySourceError::UnknownKey(id))) => {
                return Err(invalid(format!("unknown key {}", id)))
            }
            Err(e) => return Err(e.into()),
        };
        if key.key_id()? != *keyid {
            return Err(invalid(format!(
                "public material for {} hashes to a different key id",
                keyid
            )));
        }
        key.verifying_key()
            .map_err(|e| invalid(format!("key {}: {}", keyid, e)))?;
        out.insert(keyid.clone(), key);
    }
    Ok(out)
}
