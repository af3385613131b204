// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Threshold Signer
//!
//! Produces and checks signatures over canonical document bytes. Private
//! material never enters this module: every signing operation is delegated
//! to a [`KeySource`] (local key store, HSM or remote KMS).
//!
//! A document is *fully signed* for a role when it carries at least
//! `threshold` distinct valid signatures from the role's authorized keys.
//! Root is special: a new root must satisfy both the previous root's
//! requirement and its own (see [`ThresholdSigner::is_root_fully_signed`]).

use async_trait::async_trait;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, warn};

use crate::domain::key::{KeyId, PublicKey, Signature};
use crate::domain::metadata::{Metadata, MetadataError, RoleAuthority, RolePayload, Root};
use crate::domain::role::RoleName;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum KeySourceError {
    /// The key is known but its private material cannot be used here
    #[error("Key unavailable: {0}")]
    KeyUnavailable(KeyId),

    #[error("Unknown key: {0}")]
    UnknownKey(KeyId),

    #[error("Key source failure: {0}")]
    Transient(String),
}

/// External holder of private key material
#[async_trait]
pub trait KeySource: Send + Sync {
    async fn request_signature(&self, keyid: &KeyId, bytes: &[u8])
        -> Result<Signature, KeySourceError>;

    async fn public_key_for(&self, keyid: &KeyId) -> Result<PublicKey, KeySourceError>;
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SignerError {
    #[error("Key unavailable: {0}")]
    KeyUnavailable(KeyId),

    #[error("Role {role} needs {required} signatures, only {obtained} keys could sign (missing: {missing:?})")]
    InsufficientKeys {
        role: RoleName,
        obtained: usize,
        required: u32,
        missing: Vec<KeyId>,
    },

    #[error("Key source error: {0}")]
    KeySource(KeySourceError),

    #[error("Key source returned an invalid signature for key {0}")]
    InvalidSignature(KeyId),

    #[error(transparent)]
    Metadata(#[from] MetadataError),
}

impl From<KeySourceError> for SignerError {
    fn from(err: KeySourceError) -> Self {
        match err {
            KeySourceError::KeyUnavailable(keyid) => SignerError::KeyUnavailable(keyid),
            other => SignerError::KeySource(other),
        }
    }
}

pub struct ThresholdSigner {
    key_source: Arc<dyn KeySource>,
}

impl ThresholdSigner {
    pub fn new(key_source: Arc<dyn KeySource>) -> Self {
        Self { key_source }
    }

    pub fn key_source(&self) -> &Arc<dyn KeySource> {
        &self.key_source
    }

    /// Sign `bytes` with one key
    pub async fn sign(&self, bytes: &[u8], keyid: &KeyId) -> Result<Signature, SignerError> {
        Ok(self.key_source.request_signature(keyid, bytes).await?)
    }

    pub fn verify(bytes: &[u8], signature: &Signature, public_key: &PublicKey) -> bool {
        public_key.verify(bytes, signature)
    }

    /// Public material for a key id, as known to the key source
    pub async fn public_key_for(&self, keyid: &KeyId) -> Result<PublicKey, SignerError> {
        Ok(self.key_source.public_key_for(keyid).await?)
    }

    /// Replace the signatures on `document` with fresh ones from every
    /// available key of every authority, then require each authority's
    /// threshold to be met.
    ///
    /// Keys the source reports as unavailable are skipped; the call only
    /// fails on them if a threshold ends up unmet.
    pub async fn sign_document<T: RolePayload>(
        &self,
        document: &mut Metadata<T>,
        authorities: &[RoleAuthority],
    ) -> Result<(), SignerError> {
        let bytes = document.signed_bytes()?;

        let public_keys: BTreeMap<&KeyId, &PublicKey> = authorities
            .iter()
            .flat_map(|a| a.public_keys.iter())
            .collect();
        let wanted: BTreeSet<&KeyId> = authorities
            .iter()
            .flat_map(|a| a.keys.keyids.iter())
            .collect();

        let mut signatures = Vec::with_capacity(wanted.len());
        let mut unavailable = Vec::new();
        for keyid in wanted {
            match self.sign(&bytes, keyid).await {
                Ok(signature) => {
                    let valid = public_keys
                        .get(keyid)
                        .is_some_and(|key| Self::verify(&bytes, &signature, key));
                    if !valid {
                        return Err(SignerError::InvalidSignature(keyid.clone()));
                    }
                    signatures.push(signature);
                }
                Err(SignerError::KeyUnavailable(_)) => {
                    debug!(keyid = %keyid, "Key unavailable for signing, skipping");
                    unavailable.push(keyid.clone());
                }
                Err(e) => return Err(e),
            }
        }

        document.signatures = signatures;

        for authority in authorities {
            let obtained = Self::valid_signers(document, &bytes, authority).len();
            if obtained < authority.keys.threshold as usize {
                let missing: Vec<KeyId> = unavailable
                    .iter()
                    .filter(|id| authority.keys.contains(id))
                    .cloned()
                    .collect();
                warn!(
                    role = %authority.role,
                    obtained,
                    required = authority.keys.threshold,
                    "Signing threshold not reachable with available keys"
                );
                return Err(SignerError::InsufficientKeys {
                    role: authority.role.clone(),
                    obtained,
                    required: authority.keys.threshold,
                    missing,
                });
            }
        }
        Ok(())
    }

    /// Whether `document` carries `threshold` distinct valid signatures from
    /// the authority's keys
    pub fn is_fully_signed<T: RolePayload>(
        document: &Metadata<T>,
        authority: &RoleAuthority,
    ) -> bool {
        let Ok(bytes) = document.signed_bytes() else {
            return false;
        };
        Self::valid_signers(document, &bytes, authority).len() >= authority.keys.threshold as usize
    }

    /// Root rotation rule: a new root must meet the previous root's root
    /// threshold and its own.
    pub fn is_root_fully_signed(new: &Metadata<Root>, previous: Option<&Metadata<Root>>) -> bool {
        let Some(own) = new.signed.authority(&RoleName::Root) else {
            return false;
        };
        if !Self::is_fully_signed(new, &own) {
            return false;
        }
        match previous {
            None => true,
            Some(previous) => previous
                .signed
                .authority(&RoleName::Root)
                .is_some_and(|old| Self::is_fully_signed(new, &old)),
        }
    }

    fn valid_signers<'a, T: RolePayload>(
        document: &'a Metadata<T>,
        bytes: &[u8],
        authority: &RoleAuthority,
    ) -> BTreeSet<&'a KeyId> {
        document
            .signatures
            .iter()
            .filter(|sig| authority.keys.contains(&sig.keyid))
            .filter(|sig| {
                authority
                    .public_keys
                    .get(&sig.keyid)
                    .is_some_and(|key| Self::verify(bytes, sig, key))
            })
            .map(|sig| &sig.keyid)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::metadata::{RoleKeys, Targets};
    use chrono::{Duration, Utc};
    use ed25519_dalek::{Signer, SigningKey};
    use std::collections::HashMap;

    struct StaticKeys {
        keys: HashMap<KeyId, SigningKey>,
        offline: BTreeSet<KeyId>,
    }

    impl StaticKeys {
        fn new(seeds: &[u8]) -> (Self, Vec<KeyId>) {
            let mut keys = HashMap::new();
            let mut ids = Vec::new();
            for seed in seeds {
                let key = SigningKey::from_bytes(&[*seed; 32]);
                let id = PublicKey::from_verifying_key(&key.verifying_key()).key_id().unwrap();
                keys.insert(id.clone(), key);
                ids.push(id);
            }
            (
                Self {
                    keys,
                    offline: BTreeSet::new(),
                },
                ids,
            )
        }
    }

    #[async_trait]
    impl KeySource for StaticKeys {
        async fn request_signature(
            &self,
            keyid: &KeyId,
            bytes: &[u8],
        ) -> Result<Signature, KeySourceError> {
            if self.offline.contains(keyid) {
                return Err(KeySourceError::KeyUnavailable(keyid.clone()));
            }
            let key = self
                .keys
                .get(keyid)
                .ok_or_else(|| KeySourceError::UnknownKey(keyid.clone()))?;
            Ok(Signature::new(keyid.clone(), &key.sign(bytes).to_bytes()))
        }

        async fn public_key_for(&self, keyid: &KeyId) -> Result<PublicKey, KeySourceError> {
            self.keys
                .get(keyid)
                .map(|k| PublicKey::from_verifying_key(&k.verifying_key()))
                .ok_or_else(|| KeySourceError::UnknownKey(keyid.clone()))
        }
    }

    fn authority(source: &StaticKeys, ids: &[KeyId], threshold: u32) -> RoleAuthority {
        RoleAuthority {
            role: RoleName::Targets,
            keys: RoleKeys::new(ids.iter().cloned(), threshold),
            public_keys: ids
                .iter()
                .map(|id| {
                    let key = &source.keys[id];
                    (id.clone(), PublicKey::from_verifying_key(&key.verifying_key()))
                })
                .collect(),
        }
    }

    fn document() -> Metadata<Targets> {
        Metadata::new(Targets::new(1, Utc::now() + Duration::days(1)))
    }

    #[tokio::test]
    async fn test_sign_document_meets_threshold() {
        let (source, ids) = StaticKeys::new(&[1, 2, 3]);
        let authority = authority(&source, &ids, 2);
        let signer = ThresholdSigner::new(Arc::new(source));

        let mut doc = document();
        signer.sign_document(&mut doc, &[authority.clone()]).await.unwrap();

        assert_eq!(doc.signatures.len(), 3);
        assert!(ThresholdSigner::is_fully_signed(&doc, &authority));
    }

    #[tokio::test]
    async fn test_sign_document_tolerates_offline_keys_above_threshold() {
        let (mut source, ids) = StaticKeys::new(&[1, 2, 3]);
        source.offline.insert(ids[0].clone());
        let authority = authority(&source, &ids, 2);
        let signer = ThresholdSigner::new(Arc::new(source));

        let mut doc = document();
        signer.sign_document(&mut doc, &[authority.clone()]).await.unwrap();
        assert_eq!(doc.signatures.len(), 2);
    }

    #[tokio::test]
    async fn test_sign_document_fails_below_threshold() {
        let (mut source, ids) = StaticKeys::new(&[1, 2, 3]);
        source.offline.insert(ids[0].clone());
        source.offline.insert(ids[1].clone());
        let authority = authority(&source, &ids, 2);
        let signer = ThresholdSigner::new(Arc::new(source));

        let err = signer
            .sign_document(&mut document(), &[authority])
            .await
            .unwrap_err();
        match err {
            SignerError::InsufficientKeys {
                obtained,
                required,
                missing,
                ..
            } => {
                assert_eq!(obtained, 1);
                assert_eq!(required, 2);
                assert_eq!(missing.len(), 2);
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_single_sign_reports_unavailable_key() {
        let (mut source, ids) = StaticKeys::new(&[4]);
        source.offline.insert(ids[0].clone());
        let signer = ThresholdSigner::new(Arc::new(source));

        let err = signer.sign(b"bytes", &ids[0]).await.unwrap_err();
        assert_eq!(err, SignerError::KeyUnavailable(ids[0].clone()));
    }

    #[tokio::test]
    async fn test_duplicate_and_foreign_signatures_do_not_count() {
        let (source, ids) = StaticKeys::new(&[1, 2, 3]);
        let (stranger, stranger_ids) = StaticKeys::new(&[9]);
        let authority = authority(&source, &ids, 2);

        let mut doc = document();
        let bytes = doc.signed_bytes().unwrap();
        let first = source.request_signature(&ids[0], &bytes).await.unwrap();
        let foreign = stranger
            .request_signature(&stranger_ids[0], &bytes)
            .await
            .unwrap();
        doc.signatures = vec![first.clone(), first, foreign];

        assert!(!ThresholdSigner::is_fully_signed(&doc, &authority));
    }

    #[tokio::test]
    async fn test_signature_over_other_content_is_invalid() {
        let (source, ids) = StaticKeys::new(&[1]);
        let authority = authority(&source, &ids, 1);
        let signer = ThresholdSigner::new(Arc::new(source));

        let mut doc = document();
        signer.sign_document(&mut doc, &[authority.clone()]).await.unwrap();
        doc.signed.common.version = 2;
        assert!(!ThresholdSigner::is_fully_signed(&doc, &authority));
    }
}
