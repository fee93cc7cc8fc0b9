//! Document addresses and identifiers
//!
//! An address binds a document to its owner: the owner's public key plus a
//! random 16-byte nonce. The document id is the base58 encoding of the
//! SHA-256 hash over those 48 bytes, so ids are stable, collision-resistant,
//! and do not reveal the nonce.

use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::ShareError;
use crate::identity::PublicKey;

/// Nonce length inside an address (16 bytes)
pub const ADDRESS_NONCE_SIZE: usize = 16;

/// Serialized address length: owner key (32) + nonce (16)
pub const ADDRESS_SIZE: usize = 32 + ADDRESS_NONCE_SIZE;

/// Base58-encoded document identifier.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DocumentId(String);

impl DocumentId {
    /// Get the identifier string
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Wrap an identifier string received over the wire.
    ///
    /// Validates that the string is base58 of a 32-byte hash.
    pub fn parse(s: &str) -> Result<Self, ShareError> {
        let bytes = bs58::decode(s)
            .into_vec()
            .map_err(|e| ShareError::Identity(format!("Invalid base58 document id: {}", e)))?;
        if bytes.len() != 32 {
            return Err(ShareError::Identity(format!(
                "Document id must decode to 32 bytes, got {}",
                bytes.len()
            )));
        }
        Ok(Self(s.to_string()))
    }

    pub(crate) fn from_hash(hash: [u8; 32]) -> Self {
        Self(bs58::encode(&hash).into_string())
    }
}

impl std::fmt::Display for DocumentId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::fmt::Debug for DocumentId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "doc_{}", &self.0[..self.0.len().min(8)])
    }
}

/// Immutable document address: owner public key plus random nonce.
#[derive(Clone)]
pub struct Address {
    owner: PublicKey,
    nonce: [u8; ADDRESS_NONCE_SIZE],
    // Derived from owner + nonce, cached at construction
    id: DocumentId,
}

impl Address {
    /// Create a fresh address for an owner with a random nonce
    pub fn new(owner: PublicKey) -> Self {
        let mut nonce = [0u8; ADDRESS_NONCE_SIZE];
        rand::rng().fill_bytes(&mut nonce);
        Self::from_parts(owner, nonce)
    }

    /// Reconstruct an address from its parts, recomputing the id
    pub fn from_parts(owner: PublicKey, nonce: [u8; ADDRESS_NONCE_SIZE]) -> Self {
        let id = DocumentId::from_hash(Self::hash(&owner, &nonce));
        Self { owner, nonce, id }
    }

    /// Decode an address from its 48-byte serialized form
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, ShareError> {
        if bytes.len() != ADDRESS_SIZE {
            return Err(ShareError::InvalidHeader(format!(
                "Address must be {} bytes, got {}",
                ADDRESS_SIZE,
                bytes.len()
            )));
        }
        let owner = PublicKey::from_bytes(&bytes[..32])
            .map_err(|e| ShareError::InvalidHeader(format!("Bad owner key in address: {}", e)))?;
        let mut nonce = [0u8; ADDRESS_NONCE_SIZE];
        nonce.copy_from_slice(&bytes[32..]);
        Ok(Self::from_parts(owner, nonce))
    }

    /// Serialize to the 48-byte wire form
    pub fn to_bytes(&self) -> [u8; ADDRESS_SIZE] {
        let mut out = [0u8; ADDRESS_SIZE];
        out[..32].copy_from_slice(self.owner.as_bytes());
        out[32..].copy_from_slice(&self.nonce);
        out
    }

    /// The owner public key
    pub fn owner(&self) -> &PublicKey {
        &self.owner
    }

    /// The address nonce
    pub fn nonce(&self) -> &[u8; ADDRESS_NONCE_SIZE] {
        &self.nonce
    }

    /// The derived document id
    pub fn document_id(&self) -> &DocumentId {
        &self.id
    }

    fn hash(owner: &PublicKey, nonce: &[u8; ADDRESS_NONCE_SIZE]) -> [u8; 32] {
        let mut hasher = Sha256::new();
        hasher.update(owner.as_bytes());
        hasher.update(nonce);
        hasher.finalize().into()
    }
}

impl PartialEq for Address {
    fn eq(&self, other: &Self) -> bool {
        self.owner == other.owner && self.nonce == other.nonce
    }
}

impl Eq for Address {}

impl std::fmt::Debug for Address {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Address")
            .field("owner", &self.owner)
            .field("id", &self.id)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::Keypair;

    #[test]
    fn test_address_roundtrip() {
        let owner = Keypair::generate().public_key();
        let addr = Address::new(owner);

        let restored = Address::from_bytes(&addr.to_bytes()).unwrap();
        assert_eq!(restored, addr);
        assert_eq!(restored.document_id(), addr.document_id());
    }

    #[test]
    fn test_document_id_is_deterministic() {
        let owner = Keypair::generate().public_key();
        let nonce = [9u8; ADDRESS_NONCE_SIZE];

        let a = Address::from_parts(owner, nonce);
        let b = Address::from_parts(owner, nonce);
        assert_eq!(a.document_id(), b.document_id());
    }

    #[test]
    fn test_different_nonce_different_id() {
        let owner = Keypair::generate().public_key();
        let a = Address::new(owner);
        let b = Address::new(owner);
        assert_ne!(a.document_id(), b.document_id());
    }

    #[test]
    fn test_address_rejects_wrong_length() {
        assert!(Address::from_bytes(&[0u8; 10]).is_err());
        assert!(Address::from_bytes(&[0u8; 64]).is_err());
    }

    #[test]
    fn test_document_id_parse() {
        let owner = Keypair::generate().public_key();
        let addr = Address::new(owner);

        let parsed = DocumentId::parse(addr.document_id().as_str()).unwrap();
        assert_eq!(&parsed, addr.document_id());

        assert!(DocumentId::parse("not-base58-!!").is_err());
        assert!(DocumentId::parse("abc").is_err());
    }
}
