// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Local Key Source
//!
//! In-process [`KeySource`] backed by the `spec.keys` entries of the worker
//! configuration. Seeds are held in memory; entries marked `offline` only
//! carry public material, so signing with them reports the key as
//! unavailable. An HSM or remote KMS plugs in through the same trait.

use anyhow::Result;
use async_trait::async_trait;
use ed25519_dalek::{Signer, SigningKey};
use rand_core::OsRng;
use std::collections::BTreeMap;
use tracing::{debug, info};

use crate::domain::key::{KeyId, PublicKey, Signature};
use crate::domain::metadata::MetadataError;
use crate::domain::signer::{KeySource, KeySourceError};
use crate::domain::worker_config::KeyEntry;

struct LocalKey {
    public: PublicKey,
    signing: Option<SigningKey>,
}

pub struct LocalKeySource {
    keys: BTreeMap<KeyId, LocalKey>,
}

impl LocalKeySource {
    pub fn from_entries(entries: &[KeyEntry]) -> Result<Self> {
        let mut keys = BTreeMap::new();
        for (index, entry) in entries.iter().enumerate() {
            let label = entry.name.clone().unwrap_or_else(|| format!("#{}", index));
            let signing = if entry.offline {
                None
            } else {
                entry
                    .resolve_seed()
                    .map_err(|e| anyhow::anyhow!("Key {}: {}", label, e))?
                    .map(|seed| SigningKey::from_bytes(&seed))
            };
            let public = match &signing {
                Some(signing) => {
                    let derived = PublicKey::from_verifying_key(&signing.verifying_key());
                    if entry
                        .public
                        .as_deref()
                        .is_some_and(|public| !public.trim().eq_ignore_ascii_case(&derived.keyval.public))
                    {
                        anyhow::bail!("Key {}: seed does not match the listed public key", label);
                    }
                    derived
                }
                None => entry
                    .public_key()
                    .map_err(|e| anyhow::anyhow!("Key {}: {}", label, e))?,
            };

            let keyid = public.key_id()?;
            if keys.contains_key(&keyid) {
                anyhow::bail!("Key {} duplicates key id {}", label, keyid);
            }
            debug!(keyid = %keyid, offline = signing.is_none(), "Loaded key {}", label);
            keys.insert(keyid, LocalKey { public, signing });
        }

        info!(
            "Local key source ready: {} keys ({} online)",
            keys.len(),
            keys.values().filter(|k| k.signing.is_some()).count()
        );
        Ok(Self { keys })
    }

    pub fn key_ids(&self) -> Vec<KeyId> {
        self.keys.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}

#[async_trait]
impl KeySource for LocalKeySource {
    async fn request_signature(
        &self,
        keyid: &KeyId,
        bytes: &[u8],
    ) -> Result<Signature, KeySourceError> {
        let key = self
            .keys
            .get(keyid)
            .ok_or_else(|| KeySourceError::UnknownKey(keyid.clone()))?;
        let signing = key
            .signing
            .as_ref()
            .ok_or_else(|| KeySourceError::KeyUnavailable(keyid.clone()))?;
        Ok(Signature::new(
            keyid.clone(),
            &signing.sign(bytes).to_bytes(),
        ))
    }

    async fn public_key_for(&self, keyid: &KeyId) -> Result<PublicKey, KeySourceError> {
        self.keys
            .get(keyid)
            .map(|k| k.public.clone())
            .ok_or_else(|| KeySourceError::UnknownKey(keyid.clone()))
    }
}

/// A freshly generated key: hex seed, hex public key and key id
pub struct GeneratedKey {
    pub seed_hex: String,
    pub public: PublicKey,
}

impl GeneratedKey {
    pub fn key_id(&self) -> Result<KeyId, MetadataError> {
        self.public.key_id()
    }
}

pub fn generate_key() -> GeneratedKey {
    let signing = SigningKey::generate(&mut OsRng);
    GeneratedKey {
        seed_hex: hex::encode(signing.to_bytes()),
        public: PublicKey::from_verifying_key(&signing.verifying_key()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn online(seed: u8) -> KeyEntry {
        KeyEntry {
            seed: Some(hex::encode([seed; 32])),
            ..Default::default()
        }
    }

    fn offline(seed: u8) -> KeyEntry {
        let public = SigningKey::from_bytes(&[seed; 32]).verifying_key();
        KeyEntry {
            public: Some(hex::encode(public.to_bytes())),
            offline: true,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_online_key_signs_verifiably() {
        let source = LocalKeySource::from_entries(&[online(1)]).unwrap();
        let keyid = source.key_ids()[0].clone();

        let signature = source.request_signature(&keyid, b"payload").await.unwrap();
        let public = source.public_key_for(&keyid).await.unwrap();
        assert!(public.verify(b"payload", &signature));
        assert!(!public.verify(b"other", &signature));
    }

    #[tokio::test]
    async fn test_offline_key_is_unavailable() {
        let source = LocalKeySource::from_entries(&[offline(2)]).unwrap();
        let keyid = source.key_ids()[0].clone();

        assert!(source.public_key_for(&keyid).await.is_ok());
        assert_eq!(
            source.request_signature(&keyid, b"x").await.unwrap_err(),
            KeySourceError::KeyUnavailable(keyid)
        );
    }

    #[tokio::test]
    async fn test_unknown_key() {
        let source = LocalKeySource::from_entries(&[online(1)]).unwrap();
        let missing = KeyId::new("00".repeat(32));
        assert_eq!(
            source.public_key_for(&missing).await.unwrap_err(),
            KeySourceError::UnknownKey(missing)
        );
    }

    #[test]
    fn test_duplicate_keys_rejected() {
        assert!(LocalKeySource::from_entries(&[online(1), offline(1)]).is_err());
    }

    #[test]
    fn test_seed_must_match_listed_public_key() {
        let mut entry = online(1);
        entry.public = offline(2).public;
        assert!(LocalKeySource::from_entries(&[entry]).is_err());

        let mut entry = online(1);
        entry.public = offline(1).public;
        assert!(LocalKeySource::from_entries(&[entry]).is_ok());
    }

    #[test]
    fn test_generated_key_round_trips_through_entry() {
        let generated = generate_key();
        let entry = KeyEntry {
            seed: Some(generated.seed_hex.clone()),
            ..Default::default()
        };
        let source = LocalKeySource::from_entries(&[entry]).unwrap();
        assert_eq!(source.key_ids(), vec![generated.key_id().unwrap()]);
    }
}
