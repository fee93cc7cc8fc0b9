//! Ed25519 signing identity
//!
//! Every client is identified by its Ed25519 verifying key. The same keys
//! double as X25519 key-agreement material via the birational map between the
//! curves, so no separate exchange keys are stored or transmitted.

use ed25519_dalek::{Signer, SigningKey, Verifier, VerifyingKey};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::ShareError;

/// Ed25519 keypair used for signing headers, exports, and handshakes.
pub struct Keypair {
    signing: SigningKey,
}

impl Keypair {
    /// Generate a new random keypair
    pub fn generate() -> Self {
        let mut seed = [0u8; 32];
        getrandom::getrandom(&mut seed).expect("Failed to get random bytes");
        Self {
            signing: SigningKey::from_bytes(&seed),
        }
    }

    /// Create a deterministic keypair from a 32-byte seed
    pub fn from_seed(seed: &[u8; 32]) -> Self {
        Self {
            signing: SigningKey::from_bytes(seed),
        }
    }

    /// Deserialize a keypair from its 32-byte seed form
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, ShareError> {
        let seed: [u8; 32] = bytes
            .try_into()
            .map_err(|_| ShareError::Identity("Keypair seed must be 32 bytes".to_string()))?;
        Ok(Self::from_seed(&seed))
    }

    /// Serialize the private key seed to bytes
    pub fn to_bytes(&self) -> [u8; 32] {
        self.signing.to_bytes()
    }

    /// Get the public key for this keypair
    pub fn public_key(&self) -> PublicKey {
        PublicKey(self.signing.verifying_key().to_bytes())
    }

    /// Sign a message
    pub fn sign(&self, message: &[u8]) -> Signature {
        Signature(self.signing.sign(message).to_bytes())
    }

    /// Expanded secret scalar in X25519 form, for key agreement.
    pub(crate) fn exchange_scalar(&self) -> [u8; 32] {
        self.signing.to_scalar_bytes()
    }
}

impl Clone for Keypair {
    fn clone(&self) -> Self {
        Self {
            signing: SigningKey::from_bytes(&self.signing.to_bytes()),
        }
    }
}

impl std::fmt::Debug for Keypair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Keypair")
            .field("public", &self.public_key())
            .finish_non_exhaustive()
    }
}

/// 32-byte Ed25519 verifying key.
///
/// Ordering is raw byte order, which makes ACL sets sort deterministically
/// for canonical header encoding.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PublicKey([u8; 32]);

impl PublicKey {
    /// Reconstruct a public key from raw bytes
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, ShareError> {
        let raw: [u8; 32] = bytes
            .try_into()
            .map_err(|_| ShareError::Identity("Public key must be 32 bytes".to_string()))?;
        // Reject encodings that are not valid curve points up front
        VerifyingKey::from_bytes(&raw)
            .map_err(|_| ShareError::Identity("Invalid Ed25519 public key".to_string()))?;
        Ok(Self(raw))
    }

    /// Get the raw key bytes
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Encode as base58 for display and addressing
    pub fn to_base58(&self) -> String {
        bs58::encode(&self.0).into_string()
    }

    /// Parse from a base58 string
    pub fn from_base58(s: &str) -> Result<Self, ShareError> {
        let bytes = bs58::decode(s)
            .into_vec()
            .map_err(|e| ShareError::Identity(format!("Invalid base58 public key: {}", e)))?;
        Self::from_bytes(&bytes)
    }

    /// Verify a signature over a message
    pub fn verify(&self, message: &[u8], signature: &Signature) -> bool {
        let Ok(key) = VerifyingKey::from_bytes(&self.0) else {
            return false;
        };
        let sig = ed25519_dalek::Signature::from_bytes(&signature.0);
        key.verify(message, &sig).is_ok()
    }

    /// Montgomery-form point for X25519 key agreement.
    pub(crate) fn exchange_point(&self) -> Result<[u8; 32], ShareError> {
        let key = VerifyingKey::from_bytes(&self.0)
            .map_err(|_| ShareError::Identity("Invalid Ed25519 public key".to_string()))?;
        Ok(key.to_montgomery().to_bytes())
    }
}

impl std::fmt::Display for PublicKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_base58())
    }
}

impl std::fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "PublicKey({})", hex::encode(&self.0[..8]))
    }
}

impl Serialize for PublicKey {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_bytes(&self.0)
    }
}

impl<'de> Deserialize<'de> for PublicKey {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let bytes = serde_bytes::ByteBuf::deserialize(deserializer)?;
        Self::from_bytes(&bytes).map_err(serde::de::Error::custom)
    }
}

/// 64-byte Ed25519 signature.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Signature([u8; 64]);

impl Signature {
    /// Reconstruct a signature from raw bytes
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, ShareError> {
        let raw: [u8; 64] = bytes
            .try_into()
            .map_err(|_| ShareError::Identity("Signature must be 64 bytes".to_string()))?;
        Ok(Self(raw))
    }

    /// Get the raw signature bytes
    pub fn as_bytes(&self) -> &[u8; 64] {
        &self.0
    }
}

impl std::fmt::Debug for Signature {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Signature({}…)", hex::encode(&self.0[..8]))
    }
}

impl Serialize for Signature {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_bytes(&self.0)
    }
}

impl<'de> Deserialize<'de> for Signature {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let bytes = serde_bytes::ByteBuf::deserialize(deserializer)?;
        Self::from_bytes(&bytes).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sign_verify_roundtrip() {
        let keypair = Keypair::generate();
        let message = b"hello, shared world";

        let signature = keypair.sign(message);
        assert!(keypair.public_key().verify(message, &signature));
    }

    #[test]
    fn test_wrong_message_fails_verification() {
        let keypair = Keypair::generate();
        let signature = keypair.sign(b"original");
        assert!(!keypair.public_key().verify(b"modified", &signature));
    }

    #[test]
    fn test_wrong_key_fails_verification() {
        let a = Keypair::generate();
        let b = Keypair::generate();
        let signature = a.sign(b"message");
        assert!(!b.public_key().verify(b"message", &signature));
    }

    #[test]
    fn test_keypair_from_seed_is_deterministic() {
        let seed = [42u8; 32];
        let k1 = Keypair::from_seed(&seed);
        let k2 = Keypair::from_seed(&seed);
        assert_eq!(k1.public_key(), k2.public_key());
    }

    #[test]
    fn test_public_key_base58_roundtrip() {
        let pk = Keypair::generate().public_key();
        let encoded = pk.to_base58();
        assert_eq!(PublicKey::from_base58(&encoded).unwrap(), pk);
    }

    #[test]
    fn test_public_key_rejects_bad_length() {
        assert!(PublicKey::from_bytes(&[0u8; 16]).is_err());
        assert!(Signature::from_bytes(&[0u8; 16]).is_err());
    }

    #[test]
    fn test_public_key_ordering_is_byte_order() {
        let mut keys: Vec<PublicKey> = (0..8).map(|_| Keypair::generate().public_key()).collect();
        keys.sort();
        for pair in keys.windows(2) {
            assert!(pair[0].as_bytes() <= pair[1].as_bytes());
        }
    }

    #[test]
    fn test_keypair_serialization_roundtrip() {
        let keypair = Keypair::generate();
        let restored = Keypair::from_bytes(&keypair.to_bytes()).unwrap();

        let signature = restored.sign(b"still me");
        assert!(keypair.public_key().verify(b"still me", &signature));
    }
}
