// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Metadata Document Model
//!
//! Typed TUF documents (`root`, `targets`, `snapshot`, `timestamp` and
//! delegated targets) wrapped in a signature envelope:
//!
//! ```text
//! {"signatures":[{"keyid":..,"sig":..}],"signed":{"_type":..,"version":..,..}}
//! ```
//!
//! Documents are encoded with [`crate::domain::canonical`]: signatures cover
//! the canonical bytes of `signed`, while the served bytes and the document
//! fingerprint cover the whole envelope.
//!
//! Decoding runs the schema checks every document must pass before the
//! engine will touch it (positive version, thresholds within key counts,
//! role keys present in the key map, well-formed delegations).

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, BTreeSet};
use thiserror::Error;

use crate::domain::canonical;
use crate::domain::key::{KeyId, PublicKey, Signature};
use crate::domain::role::{is_valid_delegated_name, RoleName};

pub const SPEC_VERSION: &str = "1.0.31";

// ============================================================================
// Errors
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MetadataError {
    #[error("Malformed document: {0}")]
    Malformed(String),

    #[error("Canonical encoding failed: {0}")]
    Encoding(String),
}

// ============================================================================
// Shared fields
// ============================================================================

/// Fields carried by every signed payload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommonFields {
    #[serde(rename = "_type")]
    pub role_type: String,
    pub spec_version: String,
    pub version: u64,
    #[serde(with = "expiry_format")]
    pub expires: DateTime<Utc>,
}

impl CommonFields {
    pub fn new(role_type: &str, version: u64, expires: DateTime<Utc>) -> Self {
        Self {
            role_type: role_type.to_string(),
            spec_version: SPEC_VERSION.to_string(),
            version,
            expires,
        }
    }
}

/// Expiry instants are whole seconds in UTC with a `Z` suffix.
mod expiry_format {
    use chrono::{DateTime, Utc};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(expires: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&expires.format("%Y-%m-%dT%H:%M:%SZ").to_string())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<DateTime<Utc>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        DateTime::parse_from_rfc3339(&s)
            .map(|dt| dt.with_timezone(&Utc))
            .map_err(|e| serde::de::Error::custom(format!("invalid expires '{}': {}", s, e)))
    }
}

/// Key ids and signing threshold for one role
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoleKeys {
    pub keyids: Vec<KeyId>,
    pub threshold: u32,
}

impl RoleKeys {
    /// Build a key set with sorted, de-duplicated key ids
    pub fn new(keyids: impl IntoIterator<Item = KeyId>, threshold: u32) -> Self {
        let keyids: BTreeSet<KeyId> = keyids.into_iter().collect();
        Self {
            keyids: keyids.into_iter().collect(),
            threshold,
        }
    }

    pub fn distinct_keyids(&self) -> BTreeSet<&KeyId> {
        self.keyids.iter().collect()
    }

    pub fn contains(&self, keyid: &KeyId) -> bool {
        self.keyids.contains(keyid)
    }

    /// 1 <= threshold <= distinct key count
    pub fn check(&self, role: &str) -> Result<(), MetadataError> {
        if self.threshold == 0 {
            return Err(MetadataError::Malformed(format!(
                "role {} has threshold 0",
                role
            )));
        }
        let distinct = self.distinct_keyids().len();
        if self.threshold as usize > distinct {
            return Err(MetadataError::Malformed(format!(
                "role {} has threshold {} but only {} distinct keys",
                role, self.threshold, distinct
            )));
        }
        Ok(())
    }
}

/// Key set and public material that authorizes one role
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoleAuthority {
    pub role: RoleName,
    pub keys: RoleKeys,
    pub public_keys: BTreeMap<KeyId, PublicKey>,
}

/// Reference from snapshot/timestamp to another document
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetaFile {
    pub version: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub length: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hashes: Option<BTreeMap<String, String>>,
}

impl MetaFile {
    pub fn version_only(version: u64) -> Self {
        Self {
            version,
            length: None,
            hashes: None,
        }
    }

    pub fn sha256(&self) -> Option<&str> {
        self.hashes.as_ref()?.get("sha256").map(String::as_str)
    }
}

/// Description of one artifact
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TargetFile {
    pub length: u64,
    pub hashes: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub custom: Option<serde_json::Value>,
}

// ============================================================================
// Role payloads
// ============================================================================

/// A role-specific signed payload
pub trait RolePayload:
    Serialize + DeserializeOwned + Clone + PartialEq + std::fmt::Debug + Send + Sync
{
    /// Value of the `_type` field
    const TYPE: &'static str;

    fn common(&self) -> &CommonFields;

    fn common_mut(&mut self) -> &mut CommonFields;

    /// Role-specific schema checks run by [`decode`]
    fn check(&self) -> Result<(), MetadataError>;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Root {
    #[serde(flatten)]
    pub common: CommonFields,
    pub consistent_snapshot: bool,
    pub keys: BTreeMap<KeyId, PublicKey>,
    pub roles: BTreeMap<String, RoleKeys>,
}

impl Root {
    pub fn new(version: u64, expires: DateTime<Utc>, consistent_snapshot: bool) -> Self {
        Self {
            common: CommonFields::new(Self::TYPE, version, expires),
            consistent_snapshot,
            keys: BTreeMap::new(),
            roles: BTreeMap::new(),
        }
    }

    pub fn role_keys(&self, role: &RoleName) -> Option<&RoleKeys> {
        self.roles.get(role.as_str())
    }

    /// Authority for a top-level role as declared by this root
    pub fn authority(&self, role: &RoleName) -> Option<RoleAuthority> {
        let keys = self.role_keys(role)?.clone();
        let public_keys = keys
            .keyids
            .iter()
            .filter_map(|id| self.keys.get(id).map(|k| (id.clone(), k.clone())))
            .collect();
        Some(RoleAuthority {
            role: role.clone(),
            keys,
            public_keys,
        })
    }

    /// Drop key entries that no role references any more
    pub fn prune_unused_keys(&mut self) {
        let used: BTreeSet<KeyId> = self
            .roles
            .values()
            .flat_map(|r| r.keyids.iter().cloned())
            .collect();
        self.keys.retain(|id, _| used.contains(id));
    }
}

impl RolePayload for Root {
    const TYPE: &'static str = "root";

    fn common(&self) -> &CommonFields {
        &self.common
    }

    fn common_mut(&mut self) -> &mut CommonFields {
        &mut self.common
    }

    fn check(&self) -> Result<(), MetadataError> {
        check_key_map(&self.keys)?;
        for role in RoleName::top_level() {
            let keys = self.role_keys(&role).ok_or_else(|| {
                MetadataError::Malformed(format!("root does not declare role {}", role))
            })?;
            keys.check(role.as_str())?;
            for id in &keys.keyids {
                if !self.keys.contains_key(id) {
                    return Err(MetadataError::Malformed(format!(
                        "role {} references unknown key {}",
                        role, id
                    )));
                }
            }
        }
        Ok(())
    }
}

/// Hash-bin delegation: `2^bit_length` roles sharing one key set
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SuccinctRoles {
    pub keyids: Vec<KeyId>,
    pub threshold: u32,
    pub bit_length: u32,
    pub name_prefix: String,
}

impl SuccinctRoles {
    /// Upper bound accepted when decoding; 2^16 bins
    pub const MAX_BIT_LENGTH: u32 = 16;

    pub fn bin_count(&self) -> u64 {
        1u64 << self.bit_length
    }

    fn suffix_len(&self) -> usize {
        self.bit_length.div_ceil(4) as usize
    }

    pub fn bin_name(&self, index: u64) -> String {
        format!("{}-{:0width$x}", self.name_prefix, index, width = self.suffix_len())
    }

    pub fn bin_names(&self) -> Vec<String> {
        (0..self.bin_count()).map(|i| self.bin_name(i)).collect()
    }

    /// Bin responsible for `path`: the top `bit_length` bits of SHA-256(path)
    pub fn bin_for_path(&self, path: &str) -> String {
        let digest = Sha256::digest(path.as_bytes());
        let prefix = u32::from_be_bytes([digest[0], digest[1], digest[2], digest[3]]);
        let index = prefix.checked_shr(32 - self.bit_length.min(32)).unwrap_or(0) as u64;
        self.bin_name(index)
    }

    pub fn is_bin(&self, name: &str) -> bool {
        let Some(suffix) = name
            .strip_prefix(self.name_prefix.as_str())
            .and_then(|rest| rest.strip_prefix('-'))
        else {
            return false;
        };
        suffix.len() == self.suffix_len()
            && u64::from_str_radix(suffix, 16)
                .map(|i| i < self.bin_count() && self.bin_name(i) == name)
                .unwrap_or(false)
    }

    pub fn role_keys(&self) -> RoleKeys {
        RoleKeys {
            keyids: self.keyids.clone(),
            threshold: self.threshold,
        }
    }
}

/// An explicitly named delegated targets role
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DelegatedRole {
    pub name: String,
    pub keyids: Vec<KeyId>,
    pub threshold: u32,
    pub terminating: bool,
    #[serde(default)]
    pub paths: Vec<String>,
}

impl DelegatedRole {
    pub fn role_keys(&self) -> RoleKeys {
        RoleKeys {
            keyids: self.keyids.clone(),
            threshold: self.threshold,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Delegations {
    pub keys: BTreeMap<KeyId, PublicKey>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub roles: Option<Vec<DelegatedRole>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub succinct_roles: Option<SuccinctRoles>,
}

impl Delegations {
    pub fn explicit() -> Self {
        Self {
            keys: BTreeMap::new(),
            roles: Some(Vec::new()),
            succinct_roles: None,
        }
    }

    /// Names of every role delegated by this block
    pub fn delegated_names(&self) -> Vec<String> {
        match (&self.roles, &self.succinct_roles) {
            (_, Some(succinct)) => succinct.bin_names(),
            (Some(roles), None) => roles.iter().map(|r| r.name.clone()).collect(),
            (None, None) => Vec::new(),
        }
    }

    pub fn delegates(&self, name: &str) -> bool {
        match (&self.roles, &self.succinct_roles) {
            (_, Some(succinct)) => succinct.is_bin(name),
            (Some(roles), None) => roles.iter().any(|r| r.name == name),
            (None, None) => false,
        }
    }

    pub fn explicit_role(&self, name: &str) -> Option<&DelegatedRole> {
        self.roles.as_ref()?.iter().find(|r| r.name == name)
    }

    pub fn explicit_role_mut(&mut self, name: &str) -> Option<&mut DelegatedRole> {
        self.roles.as_mut()?.iter_mut().find(|r| r.name == name)
    }

    pub fn authority(&self, name: &str) -> Option<RoleAuthority> {
        let keys = match &self.succinct_roles {
            Some(succinct) if succinct.is_bin(name) => succinct.role_keys(),
            Some(_) => return None,
            None => self.explicit_role(name)?.role_keys(),
        };
        let public_keys = keys
            .keyids
            .iter()
            .filter_map(|id| self.keys.get(id).map(|k| (id.clone(), k.clone())))
            .collect();
        Some(RoleAuthority {
            role: RoleName::Delegated(name.to_string()),
            keys,
            public_keys,
        })
    }

    /// Drop key entries no delegated role references any more
    pub fn prune_unused_keys(&mut self) {
        let mut used: BTreeSet<KeyId> = BTreeSet::new();
        if let Some(roles) = &self.roles {
            used.extend(roles.iter().flat_map(|r| r.keyids.iter().cloned()));
        }
        if let Some(succinct) = &self.succinct_roles {
            used.extend(succinct.keyids.iter().cloned());
        }
        self.keys.retain(|id, _| used.contains(id));
    }

    fn check(&self) -> Result<(), MetadataError> {
        check_key_map(&self.keys)?;

        let mut declared: Vec<(String, RoleKeys)> = Vec::new();
        match (&self.roles, &self.succinct_roles) {
            (Some(_), Some(_)) => {
                return Err(MetadataError::Malformed(
                    "delegations declare both roles and succinct_roles".to_string(),
                ))
            }
            (None, None) => {
                return Err(MetadataError::Malformed(
                    "delegations declare neither roles nor succinct_roles".to_string(),
                ))
            }
            (Some(roles), None) => {
                let mut names = BTreeSet::new();
                for role in roles {
                    if !is_valid_delegated_name(&role.name) {
                        return Err(MetadataError::Malformed(format!(
                            "invalid delegated role name '{}'",
                            role.name
                        )));
                    }
                    if !names.insert(role.name.as_str()) {
                        return Err(MetadataError::Malformed(format!(
                            "delegated role {} declared twice",
                            role.name
                        )));
                    }
                    declared.push((role.name.clone(), role.role_keys()));
                }
            }
            (None, Some(succinct)) => {
                if succinct.bit_length == 0 || succinct.bit_length > SuccinctRoles::MAX_BIT_LENGTH {
                    return Err(MetadataError::Malformed(format!(
                        "succinct bit_length {} outside 1..={}",
                        succinct.bit_length,
                        SuccinctRoles::MAX_BIT_LENGTH
                    )));
                }
                if !is_valid_delegated_name(&succinct.name_prefix) {
                    return Err(MetadataError::Malformed(format!(
                        "invalid succinct name_prefix '{}'",
                        succinct.name_prefix
                    )));
                }
                declared.push((succinct.name_prefix.clone(), succinct.role_keys()));
            }
        }

        for (name, keys) in declared {
            keys.check(&name)?;
            if let Some(missing) = keys.keyids.iter().find(|id| !self.keys.contains_key(*id)) {
                return Err(MetadataError::Malformed(format!(
                    "delegated role {} references unknown key {}",
                    name, missing
                )));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Targets {
    #[serde(flatten)]
    pub common: CommonFields,
    pub targets: BTreeMap<String, TargetFile>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delegations: Option<Delegations>,
}

impl Targets {
    pub fn new(version: u64, expires: DateTime<Utc>) -> Self {
        Self {
            common: CommonFields::new(Self::TYPE, version, expires),
            targets: BTreeMap::new(),
            delegations: None,
        }
    }
}

impl RolePayload for Targets {
    const TYPE: &'static str = "targets";

    fn common(&self) -> &CommonFields {
        &self.common
    }

    fn common_mut(&mut self) -> &mut CommonFields {
        &mut self.common
    }

    fn check(&self) -> Result<(), MetadataError> {
        for (path, file) in &self.targets {
            if path.is_empty() {
                return Err(MetadataError::Malformed("empty target path".to_string()));
            }
            if file.hashes.is_empty() {
                return Err(MetadataError::Malformed(format!(
                    "target {} carries no hashes",
                    path
                )));
            }
        }
        match &self.delegations {
            Some(delegations) => delegations.check(),
            None => Ok(()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    #[serde(flatten)]
    pub common: CommonFields,
    pub meta: BTreeMap<String, MetaFile>,
}

impl Snapshot {
    pub fn new(version: u64, expires: DateTime<Utc>) -> Self {
        Self {
            common: CommonFields::new(Self::TYPE, version, expires),
            meta: BTreeMap::new(),
        }
    }

    pub fn version_of(&self, role: &RoleName) -> Option<u64> {
        self.meta.get(&role.metadata_filename()).map(|m| m.version)
    }
}

impl RolePayload for Snapshot {
    const TYPE: &'static str = "snapshot";

    fn common(&self) -> &CommonFields {
        &self.common
    }

    fn common_mut(&mut self) -> &mut CommonFields {
        &mut self.common
    }

    fn check(&self) -> Result<(), MetadataError> {
        if !self.meta.contains_key(&RoleName::Targets.metadata_filename()) {
            return Err(MetadataError::Malformed(
                "snapshot does not list targets.json".to_string(),
            ));
        }
        if let Some((name, _)) = self.meta.iter().find(|(_, m)| m.version == 0) {
            return Err(MetadataError::Malformed(format!(
                "snapshot lists {} at version 0",
                name
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Timestamp {
    #[serde(flatten)]
    pub common: CommonFields,
    pub meta: BTreeMap<String, MetaFile>,
}

impl Timestamp {
    pub fn new(version: u64, expires: DateTime<Utc>) -> Self {
        Self {
            common: CommonFields::new(Self::TYPE, version, expires),
            meta: BTreeMap::new(),
        }
    }

    pub fn snapshot_meta(&self) -> Option<&MetaFile> {
        self.meta.get(&RoleName::Snapshot.metadata_filename())
    }

    pub fn set_snapshot_meta(&mut self, meta: MetaFile) {
        self.meta.clear();
        self.meta.insert(RoleName::Snapshot.metadata_filename(), meta);
    }
}

impl RolePayload for Timestamp {
    const TYPE: &'static str = "timestamp";

    fn common(&self) -> &CommonFields {
        &self.common
    }

    fn common_mut(&mut self) -> &mut CommonFields {
        &mut self.common
    }

    fn check(&self) -> Result<(), MetadataError> {
        match self.snapshot_meta() {
            Some(meta) if meta.version > 0 => Ok(()),
            Some(_) => Err(MetadataError::Malformed(
                "timestamp references snapshot version 0".to_string(),
            )),
            None => Err(MetadataError::Malformed(
                "timestamp does not reference snapshot.json".to_string(),
            )),
        }
    }
}

fn check_key_map(keys: &BTreeMap<KeyId, PublicKey>) -> Result<(), MetadataError> {
    for (id, key) in keys {
        if key.key_id()? != *id {
            return Err(MetadataError::Malformed(format!(
                "key {} does not match its public material",
                id
            )));
        }
    }
    Ok(())
}

// ============================================================================
// Signed envelope
// ============================================================================

/// A role payload plus its attached signatures
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Metadata<T> {
    pub signatures: Vec<Signature>,
    pub signed: T,
}

impl<T: RolePayload> Metadata<T> {
    pub fn new(signed: T) -> Self {
        Self {
            signatures: Vec::new(),
            signed,
        }
    }

    pub fn version(&self) -> u64 {
        self.signed.common().version
    }

    pub fn expires(&self) -> DateTime<Utc> {
        self.signed.common().expires
    }

    /// Canonical bytes covered by signatures
    pub fn signed_bytes(&self) -> Result<Vec<u8>, MetadataError> {
        canonical::to_canonical_bytes(&self.signed)
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, MetadataError> {
        encode(self)
    }

    pub fn fingerprint(&self) -> Result<String, MetadataError> {
        Ok(fingerprint(&self.to_bytes()?))
    }
}

/// Canonical bytes of a whole document (signatures included)
pub fn encode<T: RolePayload>(document: &Metadata<T>) -> Result<Vec<u8>, MetadataError> {
    canonical::to_canonical_bytes(document)
}

/// Parse and schema-check a document
pub fn decode<T: RolePayload>(bytes: &[u8]) -> Result<Metadata<T>, MetadataError> {
    let value: serde_json::Value = serde_json::from_slice(bytes)
        .map_err(|e| MetadataError::Malformed(format!("{} document: {}", T::TYPE, e)))?;
    if let Some(path) = canonical::first_float(&value) {
        return Err(MetadataError::Malformed(format!(
            "{} document has a non-integer number at {}",
            T::TYPE,
            path
        )));
    }
    let document: Metadata<T> = serde_json::from_value(value)
        .map_err(|e| MetadataError::Malformed(format!("{} document: {}", T::TYPE, e)))?;

    let common = document.signed.common();
    if common.role_type != T::TYPE {
        return Err(MetadataError::Malformed(format!(
            "expected _type {}, found {}",
            T::TYPE,
            common.role_type
        )));
    }
    if common.version == 0 {
        return Err(MetadataError::Malformed(format!(
            "{} version must be positive",
            T::TYPE
        )));
    }
    if common.spec_version.is_empty() {
        return Err(MetadataError::Malformed("empty spec_version".to_string()));
    }

    document.signed.check()?;
    Ok(document)
}

/// Content address of encoded document bytes
pub fn fingerprint(bytes: &[u8]) -> String {
    canonical::fingerprint(bytes)
}
