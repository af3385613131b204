// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Keys and Signatures
//!
//! Value objects for TUF public keys, key identifiers and detached
//! signatures. Only the `ed25519` scheme is accepted.
//!
//! A key identifier is the hex SHA-256 of the key object's canonical JSON
//! encoding, so any signer or verifier derives the same id from the same
//! public material.

use ed25519_dalek::{Signature as Ed25519Signature, Verifier, VerifyingKey};
use serde::{Deserialize, Serialize};
use serde_json::json;
use thiserror::Error;

use crate::domain::canonical;
use crate::domain::metadata::MetadataError;

/// Hex-encoded key identifier
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct KeyId(pub String);

impl KeyId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for KeyId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyVal {
    /// Hex-encoded public key bytes
    pub public: String,
}

/// Public key object as embedded in root and delegation metadata
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublicKey {
    pub keytype: String,
    pub scheme: String,
    pub keyval: KeyVal,
}

impl PublicKey {
    pub const ED25519: &'static str = "ed25519";

    pub fn ed25519(public: &[u8; 32]) -> Self {
        Self {
            keytype: Self::ED25519.to_string(),
            scheme: Self::ED25519.to_string(),
            keyval: KeyVal {
                public: hex::encode(public),
            },
        }
    }

    pub fn from_verifying_key(key: &VerifyingKey) -> Self {
        Self::ed25519(key.as_bytes())
    }

    /// Parse a hex-encoded ed25519 public key
    pub fn from_hex(public_hex: &str) -> Result<Self, KeyError> {
        let bytes = hex::decode(public_hex.trim())
            .map_err(|e| KeyError::InvalidPublicKey(format!("invalid hex: {}", e)))?;
        let bytes: [u8; 32] = bytes
            .try_into()
            .map_err(|_| KeyError::InvalidPublicKey("ed25519 public keys are 32 bytes".to_string()))?;
        let key = Self::ed25519(&bytes);
        key.verifying_key()?;
        Ok(key)
    }

    /// Compute the TUF key identifier for this key
    pub fn key_id(&self) -> Result<KeyId, MetadataError> {
        let object = json!({
            "keytype": self.keytype,
            "keyval": { "public": self.keyval.public },
            "scheme": self.scheme,
        });
        let bytes = canonical::encode_value(&object)?;
        Ok(KeyId(canonical::fingerprint(&bytes)))
    }

    pub fn verifying_key(&self) -> Result<VerifyingKey, KeyError> {
        if self.keytype != Self::ED25519 || self.scheme != Self::ED25519 {
            return Err(KeyError::UnsupportedScheme(format!(
                "{}/{}",
                self.keytype, self.scheme
            )));
        }

        let bytes = hex::decode(&self.keyval.public)
            .map_err(|e| KeyError::InvalidPublicKey(format!("invalid hex: {}", e)))?;
        let bytes: [u8; 32] = bytes
            .try_into()
            .map_err(|_| KeyError::InvalidPublicKey("ed25519 public keys are 32 bytes".to_string()))?;

        VerifyingKey::from_bytes(&bytes).map_err(|e| KeyError::InvalidPublicKey(e.to_string()))
    }

    /// Verify `signature` over `message`. Any decoding failure counts as invalid.
    pub fn verify(&self, message: &[u8], signature: &Signature) -> bool {
        let Ok(verifying_key) = self.verifying_key() else {
            return false;
        };
        let Some(sig_bytes) = signature.bytes() else {
            return false;
        };
        let Ok(sig_bytes) = <[u8; 64]>::try_from(sig_bytes.as_slice()) else {
            return false;
        };

        verifying_key
            .verify(message, &Ed25519Signature::from_bytes(&sig_bytes))
            .is_ok()
    }
}

/// Detached signature attached to a metadata document
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Signature {
    pub keyid: KeyId,
    /// Hex-encoded signature bytes
    pub sig: String,
}

impl Signature {
    pub fn new(keyid: KeyId, bytes: &[u8]) -> Self {
        Self {
            keyid,
            sig: hex::encode(bytes),
        }
    }

    pub fn bytes(&self) -> Option<Vec<u8>> {
        hex::decode(&self.sig).ok()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum KeyError {
    #[error("Unsupported key scheme: {0}")]
    UnsupportedScheme(String),

    #[error("Invalid public key: {0}")]
    InvalidPublicKey(String),
}
