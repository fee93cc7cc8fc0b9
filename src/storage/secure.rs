//! Content-encrypting provider wrapper
//!
//! Transparently seals values with ChaCha20-Poly1305 before they reach the
//! underlying provider. The storage key binds each value to its location: a
//! ciphertext copied to a different key fails authentication on read.

use std::sync::Arc;

use crate::crypto::ContentCrypto;
use crate::error::ShareResult;
use crate::storage::provider::StorageProvider;

/// Encrypting wrapper over any [`StorageProvider`].
///
/// Values are sealed as `[nonce] + [ciphertext + tag]` with the storage key
/// as associated data; keys and listings pass through untouched.
pub struct SecureProvider {
    inner: Arc<dyn StorageProvider>,
    crypto: ContentCrypto,
}

impl SecureProvider {
    /// Wrap a provider with the given 32-byte content key.
    ///
    /// The key normally comes from
    /// [`SessionManager::storage_key`](crate::identity::SessionManager::storage_key).
    pub fn new(inner: Arc<dyn StorageProvider>, key: &[u8; 32]) -> Self {
        Self {
            inner,
            crypto: ContentCrypto::new(key),
        }
    }
}

impl StorageProvider for SecureProvider {
    fn get(&self, key: &str) -> ShareResult<Option<Vec<u8>>> {
        match self.inner.get(key)? {
            Some(sealed) => Ok(Some(self.crypto.decrypt_with_aad(&sealed, key.as_bytes())?)),
            None => Ok(None),
        }
    }

    fn put(&self, key: &str, value: &[u8]) -> ShareResult<()> {
        let sealed = self.crypto.encrypt_with_aad(value, key.as_bytes())?;
        self.inner.put(key, &sealed)
    }

    fn remove(&self, key: &str) -> ShareResult<()> {
        self.inner.remove(key)
    }

    fn list(&self, prefix: &str) -> ShareResult<Vec<String>> {
        self.inner.list(prefix)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::provider::MemoryProvider;

    fn secure_over_memory() -> (Arc<MemoryProvider>, SecureProvider) {
        let inner = Arc::new(MemoryProvider::new());
        let key = ContentCrypto::generate_key();
        (inner.clone(), SecureProvider::new(inner, &key))
    }

    #[test]
    fn test_roundtrip() {
        let (_, secure) = secure_over_memory();
        secure.put("bin/doc1", b"crdt bytes").unwrap();
        assert_eq!(secure.get("bin/doc1").unwrap().unwrap(), b"crdt bytes");
    }

    #[test]
    fn test_values_are_sealed_at_rest() {
        let (inner, secure) = secure_over_memory();
        secure.put("bin/doc1", b"plaintext").unwrap();

        let raw = inner.get("bin/doc1").unwrap().unwrap();
        assert_ne!(raw, b"plaintext");
        assert!(raw.len() > b"plaintext".len());
    }

    #[test]
    fn test_wrong_key_fails() {
        let inner = Arc::new(MemoryProvider::new());
        let a = SecureProvider::new(inner.clone(), &ContentCrypto::generate_key());
        let b = SecureProvider::new(inner, &ContentCrypto::generate_key());

        a.put("bin/doc1", b"secret").unwrap();
        assert!(b.get("bin/doc1").is_err());
    }

    #[test]
    fn test_value_is_bound_to_its_key() {
        let (inner, secure) = secure_over_memory();
        secure.put("bin/doc1", b"secret").unwrap();

        // Move the sealed value under another key behind the wrapper's back
        let sealed = inner.get("bin/doc1").unwrap().unwrap();
        inner.put("bin/doc2", &sealed).unwrap();

        assert!(secure.get("bin/doc2").is_err());
    }

    #[test]
    fn test_missing_key_is_none() {
        let (_, secure) = secure_over_memory();
        assert!(secure.get("bin/absent").unwrap().is_none());
    }
}
