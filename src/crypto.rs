//! Encryption layer using ChaCha20-Poly1305 AEAD
//!
//! Provides symmetric encryption for document content and signaling payloads,
//! plus X25519 key agreement between Ed25519 identities. Pairwise secrets are
//! derived from the identity keys alone, so a peer's public key is all that is
//! needed to seal a message to it.

use chacha20poly1305::{
    aead::{Aead, KeyInit, Payload},
    ChaCha20Poly1305, Nonce,
};
use hkdf::Hkdf;
use rand::RngCore;
use sha2::Sha256;

use crate::error::ShareError;
use crate::identity::{Keypair, PublicKey};

/// Nonce size for ChaCha20-Poly1305 (12 bytes)
pub const NONCE_SIZE: usize = 12;

/// Domain separation string for HKDF
const HKDF_INFO: &[u8] = b"docshare-key-exchange-v1";

/// Encryption utilities for content and envelope data.
///
/// Holds a cipher instance initialized with a symmetric key. Sealed data has
/// the random nonce prepended to the ciphertext.
///
/// # Wire Format
///
/// `[nonce (12 bytes)] + [ciphertext + auth_tag (16 bytes)]`
pub struct ContentCrypto {
    cipher: ChaCha20Poly1305,
}

impl ContentCrypto {
    /// Create a new instance with the given 32-byte key.
    pub fn new(key: &[u8; 32]) -> Self {
        Self {
            cipher: ChaCha20Poly1305::new(key.into()),
        }
    }

    /// Generate a new random 32-byte encryption key.
    pub fn generate_key() -> [u8; 32] {
        let mut key = [0u8; 32];
        rand::rng().fill_bytes(&mut key);
        key
    }

    /// Generate a random 12-byte nonce.
    pub fn generate_nonce() -> [u8; NONCE_SIZE] {
        let mut nonce = [0u8; NONCE_SIZE];
        rand::rng().fill_bytes(&mut nonce);
        nonce
    }

    /// Encrypt data; output is `[nonce] + [ciphertext + tag]`.
    pub fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>, ShareError> {
        self.encrypt_with_aad(plaintext, &[])
    }

    /// Decrypt data sealed by [`encrypt`](Self::encrypt).
    pub fn decrypt(&self, data: &[u8]) -> Result<Vec<u8>, ShareError> {
        self.decrypt_with_aad(data, &[])
    }

    /// Encrypt data binding associated data into the authentication tag.
    ///
    /// The associated data is not part of the output and must be supplied
    /// again on decryption.
    pub fn encrypt_with_aad(&self, plaintext: &[u8], aad: &[u8]) -> Result<Vec<u8>, ShareError> {
        let nonce_bytes = Self::generate_nonce();
        let nonce = Nonce::from_slice(&nonce_bytes);

        let ciphertext = self
            .cipher
            .encrypt(
                nonce,
                Payload {
                    msg: plaintext,
                    aad,
                },
            )
            .map_err(|e| ShareError::Crypto(format!("Encryption failed: {}", e)))?;

        let mut result = nonce_bytes.to_vec();
        result.extend_from_slice(&ciphertext);
        Ok(result)
    }

    /// Decrypt data sealed with associated data.
    ///
    /// Fails if the key, nonce, ciphertext, or associated data do not match
    /// what was sealed.
    pub fn decrypt_with_aad(&self, data: &[u8], aad: &[u8]) -> Result<Vec<u8>, ShareError> {
        if data.len() < NONCE_SIZE {
            return Err(ShareError::DecryptionFailed(
                "Data too short to contain nonce".to_string(),
            ));
        }

        let nonce = Nonce::from_slice(&data[..NONCE_SIZE]);
        let encrypted = &data[NONCE_SIZE..];

        self.cipher
            .decrypt(
                nonce,
                Payload {
                    msg: encrypted,
                    aad,
                },
            )
            .map_err(|e| ShareError::DecryptionFailed(format!("{}", e)))
    }
}

/// Derive the pairwise shared secret between our identity and a remote peer.
///
/// Both Ed25519 keys are mapped to their X25519 form (expanded scalar on our
/// side, Montgomery point on theirs), combined with a Diffie-Hellman exchange
/// and expanded through HKDF-SHA256. The operation is symmetric: both peers
/// derive the same 32-byte secret from their own private key and the other's
/// public key.
pub fn shared_secret(ours: &Keypair, theirs: &PublicKey) -> Result<[u8; 32], ShareError> {
    let scalar = ours.exchange_scalar();
    let point = theirs.exchange_point()?;
    let raw = x25519_dalek::x25519(scalar, point);
    Ok(derive_key(&raw, b"pairwise"))
}

/// Derive a 32-byte key from secret material using HKDF-SHA256.
pub(crate) fn derive_key(secret: &[u8], context: &[u8]) -> [u8; 32] {
    let mut info = Vec::with_capacity(HKDF_INFO.len() + context.len());
    info.extend_from_slice(HKDF_INFO);
    info.extend_from_slice(context);

    let hkdf = Hkdf::<Sha256>::new(None, secret);
    let mut output = [0u8; 32];
    hkdf.expand(&info, &mut output)
        .expect("HKDF expand should never fail with 32-byte output");
    output
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encrypt_decrypt_roundtrip() {
        let key = ContentCrypto::generate_key();
        let crypto = ContentCrypto::new(&key);

        let plaintext = b"Hello, World!";
        let ciphertext = crypto.encrypt(plaintext).unwrap();
        let decrypted = crypto.decrypt(&ciphertext).unwrap();

        assert_eq!(plaintext.as_slice(), decrypted.as_slice());
    }

    #[test]
    fn test_same_plaintext_different_ciphertext() {
        let key = ContentCrypto::generate_key();
        let crypto = ContentCrypto::new(&key);

        let c1 = crypto.encrypt(b"payload").unwrap();
        let c2 = crypto.encrypt(b"payload").unwrap();

        assert_ne!(c1, c2);
        assert_eq!(crypto.decrypt(&c1).unwrap(), b"payload");
        assert_eq!(crypto.decrypt(&c2).unwrap(), b"payload");
    }

    #[test]
    fn test_wrong_key_fails() {
        let crypto1 = ContentCrypto::new(&ContentCrypto::generate_key());
        let crypto2 = ContentCrypto::new(&ContentCrypto::generate_key());

        let ciphertext = crypto1.encrypt(b"secret").unwrap();
        assert!(crypto2.decrypt(&ciphertext).is_err());
    }

    #[test]
    fn test_tampered_data_fails() {
        let key = ContentCrypto::generate_key();
        let crypto = ContentCrypto::new(&key);

        let mut ciphertext = crypto.encrypt(b"original message").unwrap();
        ciphertext[NONCE_SIZE] ^= 0xFF;

        assert!(crypto.decrypt(&ciphertext).is_err());
    }

    #[test]
    fn test_truncated_data_fails() {
        let key = ContentCrypto::generate_key();
        let crypto = ContentCrypto::new(&key);

        let ciphertext = crypto.encrypt(b"original message").unwrap();
        let result = crypto.decrypt(&ciphertext[..5]);

        assert!(matches!(result, Err(ShareError::DecryptionFailed(_))));
    }

    #[test]
    fn test_aad_binds_context() {
        let key = ContentCrypto::generate_key();
        let crypto = ContentCrypto::new(&key);

        let sealed = crypto.encrypt_with_aad(b"content", b"doc-1").unwrap();

        assert_eq!(
            crypto.decrypt_with_aad(&sealed, b"doc-1").unwrap(),
            b"content"
        );
        assert!(crypto.decrypt_with_aad(&sealed, b"doc-2").is_err());
        assert!(crypto.decrypt(&sealed).is_err());
    }

    #[test]
    fn test_shared_secret_is_symmetric() {
        let a = Keypair::generate();
        let b = Keypair::generate();

        let ab = shared_secret(&a, &b.public_key()).unwrap();
        let ba = shared_secret(&b, &a.public_key()).unwrap();

        assert_eq!(ab, ba);
    }

    #[test]
    fn test_shared_secret_differs_per_pair() {
        let a = Keypair::generate();
        let b = Keypair::generate();
        let c = Keypair::generate();

        let ab = shared_secret(&a, &b.public_key()).unwrap();
        let ac = shared_secret(&a, &c.public_key()).unwrap();

        assert_ne!(ab, ac);
    }

    #[test]
    fn test_derive_key_domain_separation() {
        let secret = [7u8; 32];
        assert_ne!(derive_key(&secret, b"one"), derive_key(&secret, b"two"));
    }
}
