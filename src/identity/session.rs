//! Process-lifetime session state
//!
//! A session bundles the long-term signing identity with a short-term random
//! client id and the secrets derived from them: pairwise shared secrets for
//! signaling envelopes and the local storage encryption key.

use std::collections::HashMap;

use parking_lot::RwLock;
use rand::RngCore;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::crypto;
use crate::error::ShareError;
use crate::identity::{Keypair, PublicKey};

/// Random 16-byte identifier distinguishing concurrent clients of the same
/// identity (e.g. two devices or two tabs).
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ClientId([u8; 16]);

impl ClientId {
    /// Generate a new random client id
    pub fn generate() -> Self {
        let mut bytes = [0u8; 16];
        rand::rng().fill_bytes(&mut bytes);
        Self(bytes)
    }

    /// Reconstruct a client id from raw bytes
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, ShareError> {
        let raw: [u8; 16] = bytes
            .try_into()
            .map_err(|_| ShareError::Identity("Client id must be 16 bytes".to_string()))?;
        Ok(Self(raw))
    }

    /// Get the raw bytes
    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }

    /// Encode as base58 for transport headers and display
    pub fn to_base58(&self) -> String {
        bs58::encode(&self.0).into_string()
    }

    /// Parse from a base58 string
    pub fn from_base58(s: &str) -> Result<Self, ShareError> {
        let bytes = bs58::decode(s)
            .into_vec()
            .map_err(|e| ShareError::Identity(format!("Invalid base58 client id: {}", e)))?;
        Self::from_bytes(&bytes)
    }
}

impl std::fmt::Display for ClientId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_base58())
    }
}

impl std::fmt::Debug for ClientId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ClientId({})", hex::encode(&self.0[..4]))
    }
}

impl Serialize for ClientId {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_bytes(&self.0)
    }
}

impl<'de> Deserialize<'de> for ClientId {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let bytes = serde_bytes::ByteBuf::deserialize(deserializer)?;
        Self::from_bytes(&bytes).map_err(serde::de::Error::custom)
    }
}

/// Client-side ephemeral key set.
///
/// Owns the identity keypair for the lifetime of the process, caches the
/// pairwise shared secrets derived from it, and derives the storage key used
/// by the encrypted storage pipeline. `logout` clears every derived secret;
/// dropping the manager clears the identity itself.
pub struct SessionManager {
    keypair: Keypair,
    client_id: ClientId,
    shared_secrets: RwLock<HashMap<PublicKey, [u8; 32]>>,
}

impl SessionManager {
    /// Create a session around an existing identity
    pub fn new(keypair: Keypair) -> Self {
        Self {
            keypair,
            client_id: ClientId::generate(),
            shared_secrets: RwLock::new(HashMap::new()),
        }
    }

    /// Create a session with a freshly generated identity
    pub fn generate() -> Self {
        Self::new(Keypair::generate())
    }

    /// The identity keypair
    pub fn keypair(&self) -> &Keypair {
        &self.keypair
    }

    /// The identity public key
    pub fn public_key(&self) -> PublicKey {
        self.keypair.public_key()
    }

    /// The short-term client id
    pub fn client_id(&self) -> ClientId {
        self.client_id
    }

    /// Pairwise shared secret with a remote peer, cached per peer.
    pub fn shared_secret(&self, peer: &PublicKey) -> Result<[u8; 32], ShareError> {
        if let Some(secret) = self.shared_secrets.read().get(peer) {
            return Ok(*secret);
        }
        let secret = crypto::shared_secret(&self.keypair, peer)?;
        self.shared_secrets.write().insert(*peer, secret);
        Ok(secret)
    }

    /// 32-byte key for the encrypted storage pipeline, derived from the
    /// identity seed. Stable across sessions of the same identity.
    pub fn storage_key(&self) -> [u8; 32] {
        blake3::derive_key("docshare-storage-key-v1", &self.keypair.to_bytes())
    }

    /// Clear all derived secret material.
    pub fn logout(&self) {
        self.shared_secrets.write().clear();
    }
}

impl std::fmt::Debug for SessionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionManager")
            .field("public_key", &self.public_key())
            .field("client_id", &self.client_id)
            .finish_non_exhaustive()
    }
}
