// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Consistency Validator
//!
//! Checks a candidate bundle against the cross-role invariants before it
//! may be committed. Checks run in a fixed order and stop at the first
//! failure:
//!
//! 1. Version monotonicity
//! 2. Expiry validity
//! 3. Signature sufficiency
//! 4. Cross-reference integrity (snapshot and timestamp)
//! 5. Root key/threshold provenance
//! 6. Delegation well-formedness
//!
//! The validator is pure: it reads the candidate, the previous committed
//! bundle and the commit instant, and nothing else.

use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use thiserror::Error;

use crate::domain::bundle::Bundle;
use crate::domain::metadata::{self, MetadataError, Targets};
use crate::domain::role::{patterns_within, RoleName};
use crate::domain::signer::ThresholdSigner;

/// Which of the ordered checks failed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsistencyCheck {
    Versions,
    Expiry,
    Signatures,
    CrossReferences,
    RootKeys,
    Delegations,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConsistencyError {
    #[error("Role {role} version {candidate} does not advance past {previous}")]
    VersionNotMonotonic {
        role: RoleName,
        previous: u64,
        candidate: u64,
    },

    #[error("Role {role} changed content without a version bump (version {version})")]
    ContentChangedWithoutBump { role: RoleName, version: u64 },

    #[error("Role {role} expires at {expires}, which is not after {now}")]
    Expired {
        role: RoleName,
        expires: DateTime<Utc>,
        now: DateTime<Utc>,
    },

    #[error("Role {role} is not fully signed")]
    InsufficientSignatures { role: RoleName },

    #[error("Root version {version} does not satisfy both the previous and the new root threshold")]
    RootRotationUnauthorized { version: u64 },

    #[error("Snapshot lists {role} at {listed:?}, bundle has {actual:?}")]
    SnapshotMismatch {
        role: String,
        listed: Option<u64>,
        actual: Option<u64>,
    },

    #[error("Timestamp references snapshot version {referenced:?}, bundle has {actual}")]
    TimestampVersionMismatch {
        referenced: Option<u64>,
        actual: u64,
    },

    #[error("Timestamp snapshot hash or length does not match snapshot version {version}")]
    TimestampHashMismatch { version: u64 },

    #[error("Root key configuration is invalid: {0}")]
    InvalidRootKeys(String),

    #[error("Delegated role {role} declared by {delegator} has no document")]
    MissingDelegatedRole { delegator: RoleName, role: String },

    #[error("Delegated role {role} claims paths outside the namespace of {delegator}")]
    DelegationOutsideNamespace { delegator: RoleName, role: String },

    #[error("Delegated role {role} is not delegated by any targets role")]
    UndelegatedRole { role: String },

    #[error("Cannot encode candidate document: {0}")]
    Encoding(#[from] MetadataError),
}

impl ConsistencyError {
    pub fn check(&self) -> ConsistencyCheck {
        match self {
            Self::VersionNotMonotonic { .. } | Self::ContentChangedWithoutBump { .. } => {
                ConsistencyCheck::Versions
            }
            Self::Expired { .. } => ConsistencyCheck::Expiry,
            Self::InsufficientSignatures { .. } | Self::RootRotationUnauthorized { .. } => {
                ConsistencyCheck::Signatures
            }
            Self::SnapshotMismatch { .. }
            | Self::TimestampVersionMismatch { .. }
            | Self::TimestampHashMismatch { .. }
            | Self::Encoding(_) => ConsistencyCheck::CrossReferences,
            Self::InvalidRootKeys(_) => ConsistencyCheck::RootKeys,
            Self::MissingDelegatedRole { .. }
            | Self::DelegationOutsideNamespace { .. }
            | Self::UndelegatedRole { .. } => ConsistencyCheck::Delegations,
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ConsistencyValidator;

impl ConsistencyValidator {
    pub fn new() -> Self {
        Self
    }

    /// Run every check against `candidate`. `previous` is `None` only when
    /// the repository is being initialized.
    pub fn validate(
        &self,
        candidate: &Bundle,
        previous: Option<&Bundle>,
        now: DateTime<Utc>,
    ) -> Result<(), ConsistencyError> {
        let fingerprints = fingerprints_of(candidate)?;
        let previous_fingerprints = previous.map(fingerprints_of).transpose()?;

        self.check_versions(candidate, previous, &fingerprints, previous_fingerprints.as_ref())?;
        self.check_expiry(candidate, now)?;
        self.check_signatures(candidate, previous)?;
        self.check_cross_references(candidate)?;
        let root_changed = previous
            .map(|p| p.root.version() != candidate.root.version())
            .unwrap_or(true);
        if root_changed {
            self.check_root_keys(candidate)?;
        }
        self.check_delegations(candidate, previous)
    }

    fn check_versions(
        &self,
        candidate: &Bundle,
        previous: Option<&Bundle>,
        fingerprints: &BTreeMap<RoleName, String>,
        previous_fingerprints: Option<&BTreeMap<RoleName, String>>,
    ) -> Result<(), ConsistencyError> {
        let (Some(previous), Some(previous_fingerprints)) = (previous, previous_fingerprints) else {
            return Ok(());
        };

        for role in candidate.roles() {
            let (Some(new), Some(old)) = (candidate.version_of(&role), previous.version_of(&role))
            else {
                continue;
            };
            if new < old {
                return Err(ConsistencyError::VersionNotMonotonic {
                    role,
                    previous: old,
                    candidate: new,
                });
            }
            if new == old && fingerprints.get(&role) != previous_fingerprints.get(&role) {
                return Err(ConsistencyError::ContentChangedWithoutBump { role, version: new });
            }
        }
        Ok(())
    }

    fn check_expiry(&self, candidate: &Bundle, now: DateTime<Utc>) -> Result<(), ConsistencyError> {
        for role in candidate.roles() {
            if let Some(expires) = candidate.expires_of(&role) {
                if expires <= now {
                    return Err(ConsistencyError::Expired { role, expires, now });
                }
            }
        }
        Ok(())
    }

    fn check_signatures(
        &self,
        candidate: &Bundle,
        previous: Option<&Bundle>,
    ) -> Result<(), ConsistencyError> {
        let previous_root = previous
            .map(|p| &p.root)
            .filter(|root| root.version() != candidate.root.version());
        if !ThresholdSigner::is_root_fully_signed(&candidate.root, previous_root) {
            return Err(ConsistencyError::RootRotationUnauthorized {
                version: candidate.root.version(),
            });
        }

        for role in candidate.roles().into_iter().filter(|r| *r != RoleName::Root) {
            // Undelegated documents are reported by the delegation check.
            if candidate.is_fully_signed(&role) == Some(false) {
                return Err(ConsistencyError::InsufficientSignatures { role });
            }
        }
        Ok(())
    }

    fn check_cross_references(&self, candidate: &Bundle) -> Result<(), ConsistencyError> {
        let meta = &candidate.snapshot.signed.meta;

        let mut expected: BTreeMap<String, u64> = BTreeMap::new();
        expected.insert(
            RoleName::Targets.metadata_filename(),
            candidate.targets.version(),
        );
        for (name, doc) in &candidate.delegated {
            expected.insert(
                RoleName::Delegated(name.clone()).metadata_filename(),
                doc.version(),
            );
        }

        for (file, version) in &expected {
            let listed = meta.get(file).map(|m| m.version);
            if listed != Some(*version) {
                return Err(ConsistencyError::SnapshotMismatch {
                    role: file.clone(),
                    listed,
                    actual: Some(*version),
                });
            }
        }
        if let Some((file, entry)) = meta.iter().find(|(file, _)| !expected.contains_key(*file)) {
            return Err(ConsistencyError::SnapshotMismatch {
                role: file.clone(),
                listed: Some(entry.version),
                actual: None,
            });
        }

        let snapshot_version = candidate.snapshot.version();
        let reference = candidate.timestamp.signed.snapshot_meta();
        if reference.map(|m| m.version) != Some(snapshot_version) {
            return Err(ConsistencyError::TimestampVersionMismatch {
                referenced: reference.map(|m| m.version),
                actual: snapshot_version,
            });
        }

        let snapshot_bytes = candidate.snapshot.to_bytes()?;
        let digest = metadata::fingerprint(&snapshot_bytes);
        let hash_matches = reference
            .and_then(|m| m.sha256())
            .is_some_and(|h| h == digest);
        let length_matches = reference
            .and_then(|m| m.length)
            .is_some_and(|l| l == snapshot_bytes.len() as u64);
        if !hash_matches || !length_matches {
            return Err(ConsistencyError::TimestampHashMismatch {
                version: snapshot_version,
            });
        }
        Ok(())
    }

    fn check_root_keys(&self, candidate: &Bundle) -> Result<(), ConsistencyError> {
        let root = &candidate.root.signed;
        for role in RoleName::top_level() {
            let keys = root.role_keys(&role).ok_or_else(|| {
                ConsistencyError::InvalidRootKeys(format!("role {} is not declared", role))
            })?;
            keys.check(role.as_str())
                .map_err(|e| ConsistencyError::InvalidRootKeys(e.to_string()))?;
            for keyid in &keys.keyids {
                let key = root.keys.get(keyid).ok_or_else(|| {
                    ConsistencyError::InvalidRootKeys(format!(
                        "role {} key {} has no public material",
                        role, keyid
                    ))
                })?;
                key.verifying_key().map_err(|e| {
                    ConsistencyError::InvalidRootKeys(format!("key {}: {}", keyid, e))
                })?;
            }
        }
        Ok(())
    }

    fn check_delegations(
        &self,
        candidate: &Bundle,
        previous: Option<&Bundle>,
    ) -> Result<(), ConsistencyError> {
        let mut delegators: Vec<(RoleName, &Targets)> =
            vec![(RoleName::Targets, &candidate.targets.signed)];
        delegators.extend(
            candidate
                .delegated
                .iter()
                .map(|(name, doc)| (RoleName::Delegated(name.clone()), &doc.signed)),
        );

        for (delegator, targets) in &delegators {
            let Some(delegations) = &targets.delegations else {
                continue;
            };

            for name in delegations.delegated_names() {
                let present = candidate.delegated.contains_key(&name)
                    || previous.is_some_and(|p| p.delegated.contains_key(&name));
                if !present {
                    return Err(ConsistencyError::MissingDelegatedRole {
                        delegator: delegator.clone(),
                        role: name,
                    });
                }
            }

            let Some(roles) = &delegations.roles else {
                continue;
            };
            let parent_paths = self.namespace_of(candidate, delegator);
            for role in roles {
                if !patterns_within(&role.paths, parent_paths.as_deref()) {
                    return Err(ConsistencyError::DelegationOutsideNamespace {
                        delegator: delegator.clone(),
                        role: role.name.clone(),
                    });
                }
            }
        }

        if let Some(name) = candidate
            .delegated
            .keys()
            .find(|name| candidate.delegator_of(name).is_none())
        {
            return Err(ConsistencyError::UndelegatedRole { role: name.clone() });
        }
        Ok(())
    }

    /// Path patterns a delegator may hand out; `None` means unrestricted
    fn namespace_of(&self, candidate: &Bundle, role: &RoleName) -> Option<Vec<String>> {
        let RoleName::Delegated(name) = role else {
            return None;
        };
        let delegator = candidate.delegator_of(name)?;
        let delegations = candidate
            .targets_document(&delegator)?
            .signed
            .delegations
            .as_ref()?;
        match delegations.explicit_role(name) {
            Some(declared) => Some(declared.paths.clone()),
            // Hash bins own the paths routed to them, not a pattern namespace.
            None => Some(Vec::new()),
        }
    }
}

fn fingerprints_of(bundle: &Bundle) -> Result<BTreeMap<RoleName, String>, MetadataError> {
    Ok(bundle
        .documents()?
        .into_iter()
        .map(|d| (d.role, d.fingerprint))
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::key::{KeyId, PublicKey, Signature};
    use crate::domain::metadata::{
        DelegatedRole, Delegations, MetaFile, Metadata, RoleKeys, RolePayload, Root, Snapshot,
        TargetFile, Timestamp,
    };
    use chrono::Duration;
    use ed25519_dalek::{Signer, SigningKey};
    use std::collections::BTreeMap;

    struct Fixture {
        keys: Vec<SigningKey>,
        now: DateTime<Utc>,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                keys: (1..=4).map(|s| SigningKey::from_bytes(&[s; 32])).collect(),
                now: Utc::now(),
            }
        }

        fn public(&self, i: usize) -> PublicKey {
            PublicKey::from_verifying_key(&self.keys[i].verifying_key())
        }

        fn id(&self, i: usize) -> KeyId {
            self.public(i).key_id().unwrap()
        }

        fn sign<T: RolePayload>(&self, doc: &mut Metadata<T>, signers: &[usize]) {
            let bytes = doc.signed_bytes().unwrap();
            doc.signatures = signers
                .iter()
                .map(|i| Signature::new(self.id(*i), &self.keys[*i].sign(&bytes).to_bytes()))
                .collect();
        }

        /// Root 2-of-3 (keys 0..3), other top-level roles 1-of-1 with key 3
        fn root(&self, version: u64) -> Metadata<Root> {
            let mut root = Root::new(version, self.now + Duration::days(365), true);
            for i in 0..4 {
                root.keys.insert(self.id(i), self.public(i));
            }
            root.roles.insert(
                "root".to_string(),
                RoleKeys::new([self.id(0), self.id(1), self.id(2)], 2),
            );
            for role in ["targets", "snapshot", "timestamp"] {
                root.roles
                    .insert(role.to_string(), RoleKeys::new([self.id(3)], 1));
            }
            Metadata::new(root)
        }

        fn bundle(&self, targets_version: u64) -> Bundle {
            let mut root = self.root(1);
            self.sign(&mut root, &[0, 1]);

            let mut targets = Metadata::new(Targets::new(targets_version, self.now + Duration::days(30)));
            targets.signed.targets.insert(
                "app-1.0.bin".to_string(),
                TargetFile {
                    length: 1024,
                    hashes: BTreeMap::from([("sha256".to_string(), "abc".to_string())]),
                    custom: None,
                },
            );
            self.sign(&mut targets, &[3]);
            self.seal(root, targets, BTreeMap::new(), targets_version)
        }

        fn seal(
            &self,
            root: Metadata<Root>,
            targets: Metadata<Targets>,
            delegated: BTreeMap<String, Metadata<Targets>>,
            version: u64,
        ) -> Bundle {
            let mut snapshot = Snapshot::new(version, self.now + Duration::days(1));
            snapshot
                .meta
                .insert("targets.json".to_string(), MetaFile::version_only(targets.version()));
            for (name, doc) in &delegated {
                snapshot
                    .meta
                    .insert(format!("{}.json", name), MetaFile::version_only(doc.version()));
            }
            let mut snapshot = Metadata::new(snapshot);
            self.sign(&mut snapshot, &[3]);

            let bytes = snapshot.to_bytes().unwrap();
            let mut timestamp = Timestamp::new(version, self.now + Duration::days(1));
            timestamp.set_snapshot_meta(MetaFile {
                version: snapshot.version(),
                length: Some(bytes.len() as u64),
                hashes: Some(BTreeMap::from([(
                    "sha256".to_string(),
                    metadata::fingerprint(&bytes),
                )])),
            });
            let mut timestamp = Metadata::new(timestamp);
            self.sign(&mut timestamp, &[3]);

            Bundle {
                root,
                targets,
                snapshot,
                timestamp,
                delegated,
            }
        }
    }

    #[test]
    fn test_valid_bundle_passes() {
        let fx = Fixture::new();
        let previous = fx.bundle(1);
        let candidate = fx.bundle(2);
        ConsistencyValidator::new()
            .validate(&candidate, Some(&previous), fx.now)
            .unwrap();
        ConsistencyValidator::new()
            .validate(&previous, None, fx.now)
            .unwrap();
    }

    #[test]
    fn test_version_regression_is_rejected_first() {
        let fx = Fixture::new();
        let previous = fx.bundle(3);
        let candidate = fx.bundle(2);
        let err = ConsistencyValidator::new()
            .validate(&candidate, Some(&previous), fx.now)
            .unwrap_err();
        assert_eq!(err.check(), ConsistencyCheck::Versions);
    }

    #[test]
    fn test_same_version_with_new_content_is_rejected() {
        let fx = Fixture::new();
        let previous = fx.bundle(2);
        let mut candidate = fx.bundle(2);
        candidate.targets.signed.targets.clear();
        fx.sign(&mut candidate.targets, &[3]);

        let err = ConsistencyValidator::new()
            .validate(&candidate, Some(&previous), fx.now)
            .unwrap_err();
        assert!(matches!(
            err,
            ConsistencyError::ContentChangedWithoutBump { role: RoleName::Targets, version: 2 }
        ));
    }

    #[test]
    fn test_expired_role_is_rejected() {
        let fx = Fixture::new();
        let candidate = fx.bundle(1);
        let later = fx.now + Duration::days(2);
        let err = ConsistencyValidator::new()
            .validate(&candidate, None, later)
            .unwrap_err();
        assert_eq!(err.check(), ConsistencyCheck::Expiry);
    }

    #[test]
    fn test_unsigned_targets_is_rejected() {
        let fx = Fixture::new();
        let mut candidate = fx.bundle(1);
        candidate.targets.signatures.clear();
        let err = ConsistencyValidator::new()
            .validate(&candidate, None, fx.now)
            .unwrap_err();
        assert_eq!(
            err,
            ConsistencyError::InsufficientSignatures { role: RoleName::Targets }
        );
    }

    #[test]
    fn test_stale_snapshot_entry_is_rejected() {
        let fx = Fixture::new();
        let mut candidate = fx.bundle(2);
        candidate.targets.signed.common.version = 3;
        fx.sign(&mut candidate.targets, &[3]);

        let err = ConsistencyValidator::new()
            .validate(&candidate, None, fx.now)
            .unwrap_err();
        assert!(matches!(
            err,
            ConsistencyError::SnapshotMismatch { listed: Some(2), actual: Some(3), .. }
        ));
    }

    #[test]
    fn test_timestamp_must_bind_snapshot_hash() {
        let fx = Fixture::new();
        let mut candidate = fx.bundle(1);
        candidate.snapshot.signed.common.expires += Duration::hours(1);
        fx.sign(&mut candidate.snapshot, &[3]);

        let err = ConsistencyValidator::new()
            .validate(&candidate, None, fx.now)
            .unwrap_err();
        assert_eq!(err, ConsistencyError::TimestampHashMismatch { version: 1 });
    }

    #[test]
    fn test_delegation_outside_namespace_is_rejected() {
        let fx = Fixture::new();
        let mut root = fx.root(1);
        fx.sign(&mut root, &[0, 1]);

        let mut targets = Metadata::new(Targets::new(1, fx.now + Duration::days(30)));
        let mut delegations = Delegations::explicit();
        delegations.keys.insert(fx.id(3), fx.public(3));
        if let Some(roles) = delegations.roles.as_mut() {
            roles.push(DelegatedRole {
                name: "project-a".to_string(),
                keyids: vec![fx.id(3)],
                threshold: 1,
                terminating: false,
                paths: vec!["project-a/*".to_string()],
            });
        }
        let mut child = Metadata::new(Targets::new(1, fx.now + Duration::days(30)));
        let mut nested = Delegations::explicit();
        nested.keys.insert(fx.id(3), fx.public(3));
        if let Some(roles) = nested.roles.as_mut() {
            roles.push(DelegatedRole {
                name: "project-b".to_string(),
                keyids: vec![fx.id(3)],
                threshold: 1,
                terminating: false,
                paths: vec!["project-b/*".to_string()],
            });
        }
        child.signed.delegations = Some(nested);
        fx.sign(&mut child, &[3]);
        let mut grandchild = Metadata::new(Targets::new(1, fx.now + Duration::days(30)));
        fx.sign(&mut grandchild, &[3]);

        targets.signed.delegations = Some(delegations);
        fx.sign(&mut targets, &[3]);

        let delegated = BTreeMap::from([
            ("project-a".to_string(), child),
            ("project-b".to_string(), grandchild),
        ]);
        let candidate = fx.seal(root, targets, delegated, 1);

        let err = ConsistencyValidator::new()
            .validate(&candidate, None, fx.now)
            .unwrap_err();
        assert_eq!(
            err,
            ConsistencyError::DelegationOutsideNamespace {
                delegator: RoleName::Delegated("project-a".to_string()),
                role: "project-b".to_string(),
            }
        );
    }

    #[test]
    fn test_undelegated_document_is_rejected() {
        let fx = Fixture::new();
        let mut root = fx.root(1);
        fx.sign(&mut root, &[0, 1]);
        let mut targets = Metadata::new(Targets::new(1, fx.now + Duration::days(30)));
        fx.sign(&mut targets, &[3]);
        let orphan = Metadata::new(Targets::new(1, fx.now + Duration::days(30)));

        let candidate = fx.seal(root, targets, BTreeMap::from([("orphan".to_string(), orphan)]), 1);
        let err = ConsistencyValidator::new()
            .validate(&candidate, None, fx.now)
            .unwrap_err();
        assert_eq!(err, ConsistencyError::UndelegatedRole { role: "orphan".to_string() });
    }
}
