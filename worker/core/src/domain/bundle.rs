// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Metadata Bundle
//!
//! The complete set of current documents for one repository: one document
//! per top-level role plus every delegated targets role. A bundle is the
//! unit the executor builds, the validator checks and the state store
//! commits.
//!
//! Bundle identity is the SHA-256 over the sorted `(role, version,
//! fingerprint)` triples of its documents, so two bundles with the same
//! content always share an identity.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::BTreeMap;

use crate::domain::canonical;
use crate::domain::metadata::{
    self, Metadata, MetadataError, Root, RoleAuthority, RolePayload, Snapshot, Targets, Timestamp,
};
use crate::domain::role::RoleName;
use crate::domain::signer::ThresholdSigner;

/// Content address of a whole bundle
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BundleIdentity(pub String);

impl BundleIdentity {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for BundleIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One encoded document of a bundle
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DocumentSummary {
    pub role: RoleName,
    pub version: u64,
    pub expires: DateTime<Utc>,
    pub fingerprint: String,
    pub bytes: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Bundle {
    pub root: Metadata<Root>,
    pub targets: Metadata<Targets>,
    pub snapshot: Metadata<Snapshot>,
    pub timestamp: Metadata<Timestamp>,
    pub delegated: BTreeMap<String, Metadata<Targets>>,
}

impl Bundle {
    /// Rebuild a bundle from stored document bytes keyed by role
    pub fn from_documents(documents: &BTreeMap<RoleName, Vec<u8>>) -> Result<Self, MetadataError> {
        let fetch = |role: &RoleName| {
            documents
                .get(role)
                .ok_or_else(|| MetadataError::Malformed(format!("bundle is missing {}", role)))
        };

        let mut delegated = BTreeMap::new();
        for (role, bytes) in documents {
            if let RoleName::Delegated(name) = role {
                delegated.insert(name.clone(), metadata::decode::<Targets>(bytes)?);
            }
        }

        Ok(Self {
            root: metadata::decode(fetch(&RoleName::Root)?)?,
            targets: metadata::decode(fetch(&RoleName::Targets)?)?,
            snapshot: metadata::decode(fetch(&RoleName::Snapshot)?)?,
            timestamp: metadata::decode(fetch(&RoleName::Timestamp)?)?,
            delegated,
        })
    }

    /// Every role in the bundle, top-level roles first
    pub fn roles(&self) -> Vec<RoleName> {
        let mut roles = RoleName::top_level().to_vec();
        roles.extend(self.delegated.keys().cloned().map(RoleName::Delegated));
        roles
    }

    /// Encode every document
    pub fn documents(&self) -> Result<Vec<DocumentSummary>, MetadataError> {
        let mut out = vec![
            summarize(RoleName::Root, &self.root)?,
            summarize(RoleName::Targets, &self.targets)?,
            summarize(RoleName::Snapshot, &self.snapshot)?,
            summarize(RoleName::Timestamp, &self.timestamp)?,
        ];
        for (name, document) in &self.delegated {
            out.push(summarize(RoleName::Delegated(name.clone()), document)?);
        }
        Ok(out)
    }

    pub fn identity(&self) -> Result<BundleIdentity, MetadataError> {
        let mut triples: Vec<(String, u64, String)> = self
            .documents()?
            .into_iter()
            .map(|d| (d.role.to_string(), d.version, d.fingerprint))
            .collect();
        triples.sort();

        let value = json!(triples
            .into_iter()
            .map(|(role, version, fingerprint)| json!([role, version, fingerprint]))
            .collect::<Vec<_>>());
        let bytes = canonical::encode_value(&value)?;
        Ok(BundleIdentity(canonical::fingerprint(&bytes)))
    }

    pub fn version_of(&self, role: &RoleName) -> Option<u64> {
        match role {
            RoleName::Root => Some(self.root.version()),
            RoleName::Targets => Some(self.targets.version()),
            RoleName::Snapshot => Some(self.snapshot.version()),
            RoleName::Timestamp => Some(self.timestamp.version()),
            RoleName::Delegated(name) => self.delegated.get(name).map(Metadata::version),
        }
    }

    pub fn expires_of(&self, role: &RoleName) -> Option<DateTime<Utc>> {
        match role {
            RoleName::Root => Some(self.root.expires()),
            RoleName::Targets => Some(self.targets.expires()),
            RoleName::Snapshot => Some(self.snapshot.expires()),
            RoleName::Timestamp => Some(self.timestamp.expires()),
            RoleName::Delegated(name) => self.delegated.get(name).map(Metadata::expires),
        }
    }

    /// Role name to version
    pub fn manifest(&self) -> BTreeMap<String, u64> {
        self.roles()
            .into_iter()
            .filter_map(|role| self.version_of(&role).map(|v| (role.to_string(), v)))
            .collect()
    }

    /// Targets-shaped document for `targets` or a delegated role
    pub fn targets_document(&self, role: &RoleName) -> Option<&Metadata<Targets>> {
        match role {
            RoleName::Targets => Some(&self.targets),
            RoleName::Delegated(name) => self.delegated.get(name),
            _ => None,
        }
    }

    pub fn targets_document_mut(&mut self, role: &RoleName) -> Option<&mut Metadata<Targets>> {
        match role {
            RoleName::Targets => Some(&mut self.targets),
            RoleName::Delegated(name) => self.delegated.get_mut(name),
            _ => None,
        }
    }

    /// The targets-shaped role whose delegations declare `name`
    pub fn delegator_of(&self, name: &str) -> Option<RoleName> {
        let declares = |document: &Metadata<Targets>| {
            document
                .signed
                .delegations
                .as_ref()
                .is_some_and(|d| d.delegates(name))
        };

        if declares(&self.targets) {
            return Some(RoleName::Targets);
        }
        self.delegated
            .iter()
            .find(|(delegator, document)| delegator.as_str() != name && declares(document))
            .map(|(delegator, _)| RoleName::Delegated(delegator.clone()))
    }

    /// Keys and threshold currently authorized to sign `role`.
    ///
    /// Top-level roles are authorized by root, delegated roles by the
    /// `delegations` block of their delegator.
    pub fn role_authority(&self, role: &RoleName) -> Option<RoleAuthority> {
        match role {
            RoleName::Delegated(name) => {
                let delegator = self.delegator_of(name)?;
                self.targets_document(&delegator)?
                    .signed
                    .delegations
                    .as_ref()?
                    .authority(name)
            }
            top_level => self.root.signed.authority(top_level),
        }
    }

    /// Whether the document for `role` meets its current authority, or
    /// `None` when nothing authorizes the role. Root is checked against its
    /// own declaration only.
    pub fn is_fully_signed(&self, role: &RoleName) -> Option<bool> {
        let authority = self.role_authority(role)?;
        let signed = match role {
            RoleName::Root => ThresholdSigner::is_fully_signed(&self.root, &authority),
            RoleName::Snapshot => ThresholdSigner::is_fully_signed(&self.snapshot, &authority),
            RoleName::Timestamp => ThresholdSigner::is_fully_signed(&self.timestamp, &authority),
            other => self
                .targets_document(other)
                .is_some_and(|doc| ThresholdSigner::is_fully_signed(doc, &authority)),
        };
        Some(signed)
    }
}

fn summarize<T: RolePayload>(
    role: RoleName,
    document: &Metadata<T>,
) -> Result<DocumentSummary, MetadataError> {
    let bytes = document.to_bytes()?;
    Ok(DocumentSummary {
        role,
        version: document.version(),
        expires: document.expires(),
        fingerprint: metadata::fingerprint(&bytes),
        bytes,
    })
}
