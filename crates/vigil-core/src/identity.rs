//! Deterministic, content-derived identities.
//!
//! Two processes given the same canonical payload MUST derive the same
//! identity, on any machine.
//!
//! Algorithm:
//! 1. Canonicalize the payload (`Payload::canonical_bytes`)
//! 2. digest = SHA256(NAMESPACE || canonical bytes)
//! 3. identity = digest[0..16] with RFC 9562 version 8 / variant bits set

use crate::error::Result;
use crate::types::Payload;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use uuid::Uuid;

/// Fixed namespace mixed into every identity digest.
pub const NAMESPACE: [u8; 16] = [
    0x6b, 0x8f, 0x2a, 0x41, 0xd3, 0x5e, 0x4c, 0x07, 0x9a, 0x1b, 0xe2, 0x63, 0x70, 0xc4, 0x5d, 0x18,
];

/// 128-bit identity anchored to payload content.
#[derive(Clone, Copy, Debug, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Identity(Uuid);

impl Identity {
    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        self.0.as_bytes()
    }

    pub fn parse(s: &str) -> Option<Self> {
        Uuid::parse_str(s).ok().map(Self)
    }
}

impl std::fmt::Display for Identity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Anchor a validated payload. Pure and infallible.
pub fn anchor(payload: &Payload) -> Identity {
    let mut hasher = Sha256::new();
    hasher.update(NAMESPACE);
    hasher.update(payload.canonical_bytes());
    let digest = hasher.finalize();

    let mut bytes = [0u8; 16];
    bytes.copy_from_slice(&digest[..16]);
    bytes[6] = (bytes[6] & 0x0f) | 0x80;
    bytes[8] = (bytes[8] & 0x3f) | 0x80;
    Identity(Uuid::from_bytes(bytes))
}

/// Validate raw traits, then anchor them.
///
/// Fails `InvalidPayload` on an empty map or non-finite values.
pub fn anchor_traits(traits: &BTreeMap<String, f64>) -> Result<Identity> {
    let payload = Payload::new(traits.clone())?;
    Ok(anchor(&payload))
}
