//! Signed document headers
//!
//! The header is the authorization envelope of a document: who owns it, who
//! may read and mutate it, and a version counter that gates replacement. It
//! is signed by the owner over a canonical CBOR body, so any peer can verify
//! membership claims without trusting the relay.
//!
//! ## Canonical encoding
//!
//! CBOR array in strict order:
//!
//! ```text
//! [address (48 bytes), owner (32 bytes), version (u64),
//!  allowed_users (byte arrays, sorted), metadata (text map), signature]
//! ```
//!
//! Allowed users are sorted by raw byte order and metadata keys are
//! lexicographic, which makes the signature input deterministic. The signed
//! body is the same array without the trailing signature.

use std::collections::{BTreeMap, BTreeSet};

use ciborium::value::{Integer, Value};

use crate::document::address::Address;
use crate::document::DocumentId;
use crate::error::{ShareError, ShareResult};
use crate::identity::{Keypair, PublicKey, Signature};

/// Signed authorization envelope for a document.
#[derive(Clone, Debug)]
pub struct DocumentHeader {
    address: Address,
    allowed_users: BTreeSet<PublicKey>,
    version: u64,
    metadata: BTreeMap<String, String>,
    signature: Signature,
}

impl DocumentHeader {
    /// Create a new header owned by `keypair` at version 1.
    ///
    /// The owner is always included in the allowed set, whether or not it is
    /// listed in `allowed_users`.
    pub fn create(
        keypair: &Keypair,
        allowed_users: impl IntoIterator<Item = PublicKey>,
        metadata: BTreeMap<String, String>,
    ) -> Self {
        let owner = keypair.public_key();
        let address = Address::new(owner);

        let mut users: BTreeSet<PublicKey> = allowed_users.into_iter().collect();
        users.insert(owner);

        let body = body_bytes(&address, 1, &users, &metadata);
        let signature = keypair.sign(&body);

        Self {
            address,
            allowed_users: users,
            version: 1,
            metadata,
            signature,
        }
    }

    /// Produce the next header version with a new allowed set and metadata.
    ///
    /// Only the owner can re-sign the header; anyone else gets
    /// [`ShareError::Unauthorized`].
    pub fn next_version(
        &self,
        keypair: &Keypair,
        allowed_users: impl IntoIterator<Item = PublicKey>,
        metadata: BTreeMap<String, String>,
    ) -> ShareResult<Self> {
        let owner = *self.address.owner();
        if keypair.public_key() != owner {
            return Err(ShareError::Unauthorized(
                "Only the owner can re-sign a header".to_string(),
            ));
        }

        let mut users: BTreeSet<PublicKey> = allowed_users.into_iter().collect();
        users.insert(owner);

        let version = self.version + 1;
        let body = body_bytes(&self.address, version, &users, &metadata);
        let signature = keypair.sign(&body);

        Ok(Self {
            address: self.address.clone(),
            allowed_users: users,
            version,
            metadata,
            signature,
        })
    }

    /// Decode a header and verify its owner signature.
    pub fn import(bytes: &[u8]) -> ShareResult<Self> {
        let value: Value = ciborium::from_reader(bytes)
            .map_err(|e| ShareError::InvalidHeader(format!("Not valid CBOR: {}", e)))?;

        let Value::Array(fields) = value else {
            return Err(ShareError::InvalidHeader(
                "Header must be a CBOR array".to_string(),
            ));
        };
        if fields.len() != 6 {
            return Err(ShareError::InvalidHeader(format!(
                "Header must have 6 fields, got {}",
                fields.len()
            )));
        }
        let mut fields = fields.into_iter();

        let address = Address::from_bytes(&expect_bytes(fields.next().unwrap(), "address")?)?;

        let owner_bytes = expect_bytes(fields.next().unwrap(), "owner")?;
        let owner = PublicKey::from_bytes(&owner_bytes)
            .map_err(|e| ShareError::InvalidHeader(format!("Bad owner key: {}", e)))?;
        if &owner != address.owner() {
            return Err(ShareError::InvalidHeader(
                "Owner field does not match address".to_string(),
            ));
        }

        let version = expect_u64(fields.next().unwrap(), "version")?;

        let Value::Array(user_values) = fields.next().unwrap() else {
            return Err(ShareError::InvalidHeader(
                "allowed_users must be an array".to_string(),
            ));
        };
        let mut allowed_users = BTreeSet::new();
        for v in user_values {
            let pk = PublicKey::from_bytes(&expect_bytes(v, "allowed user")?)
                .map_err(|e| ShareError::InvalidHeader(format!("Bad allowed user: {}", e)))?;
            allowed_users.insert(pk);
        }
        if !allowed_users.contains(&owner) {
            return Err(ShareError::InvalidHeader(
                "Owner missing from allowed users".to_string(),
            ));
        }

        let Value::Map(meta_values) = fields.next().unwrap() else {
            return Err(ShareError::InvalidHeader(
                "metadata must be a map".to_string(),
            ));
        };
        let mut metadata = BTreeMap::new();
        for (k, v) in meta_values {
            let (Value::Text(key), Value::Text(value)) = (k, v) else {
                return Err(ShareError::InvalidHeader(
                    "metadata entries must be text".to_string(),
                ));
            };
            metadata.insert(key, value);
        }

        let signature = Signature::from_bytes(&expect_bytes(fields.next().unwrap(), "signature")?)
            .map_err(|e| ShareError::InvalidHeader(format!("Bad signature: {}", e)))?;

        let header = Self {
            address,
            allowed_users,
            version,
            metadata,
            signature,
        };

        let body = header.signed_body();
        if !header.owner().verify(&body, &signature) {
            return Err(ShareError::InvalidHeader(
                "Owner signature does not verify".to_string(),
            ));
        }

        Ok(header)
    }

    /// Canonical serialized form, suitable for storage and transit.
    pub fn export(&self) -> ShareResult<Vec<u8>> {
        let mut fields = self.body_values();
        fields.push(Value::Bytes(self.signature.as_bytes().to_vec()));

        let mut out = Vec::new();
        ciborium::into_writer(&Value::Array(fields), &mut out)
            .map_err(|e| ShareError::Serialization(format!("Failed to encode header: {}", e)))?;
        Ok(out)
    }

    /// Replace `current` with `candidate` if the upgrade rules hold:
    /// same address, strictly greater version, and a valid signature under
    /// the current owner. On equal versions the current header wins.
    pub fn upgrade(current: &Self, candidate: Self) -> ShareResult<Self> {
        if candidate.address != current.address {
            return Err(ShareError::HeaderUpgradeRejected(
                "Address mismatch".to_string(),
            ));
        }
        if candidate.version <= current.version {
            return Err(ShareError::HeaderUpgradeRejected(format!(
                "Version {} does not supersede {}",
                candidate.version, current.version
            )));
        }
        let body = candidate.signed_body();
        if !current.owner().verify(&body, &candidate.signature) {
            return Err(ShareError::HeaderUpgradeRejected(
                "Signature does not verify under current owner".to_string(),
            ));
        }
        Ok(candidate)
    }

    /// Verify a content signature under the owner key.
    pub fn verify_signature(&self, content: &[u8], signature: &Signature) -> bool {
        self.owner().verify(content, signature)
    }

    /// Verify a content signature under any allowed user.
    ///
    /// Exports may be signed by whichever member produced them, so imports
    /// check the owner first and then the rest of the ACL.
    pub fn verify_signature_any(&self, content: &[u8], signature: &Signature) -> bool {
        if self.verify_signature(content, signature) {
            return true;
        }
        self.allowed_users
            .iter()
            .filter(|pk| *pk != self.owner())
            .any(|pk| pk.verify(content, signature))
    }

    /// Whether a key is in the allowed set
    pub fn has_allowed_user(&self, key: &PublicKey) -> bool {
        self.allowed_users.contains(key)
    }

    /// The document address
    pub fn address(&self) -> &Address {
        &self.address
    }

    /// The derived document id
    pub fn document_id(&self) -> &DocumentId {
        self.address.document_id()
    }

    /// The owner public key
    pub fn owner(&self) -> &PublicKey {
        self.address.owner()
    }

    /// The current header version
    pub fn version(&self) -> u64 {
        self.version
    }

    /// The allowed users, sorted by raw byte order
    pub fn allowed_users(&self) -> &BTreeSet<PublicKey> {
        &self.allowed_users
    }

    /// The user-defined metadata
    pub fn metadata(&self) -> &BTreeMap<String, String> {
        &self.metadata
    }

    /// The owner signature over the canonical body
    pub fn signature(&self) -> &Signature {
        &self.signature
    }

    fn body_values(&self) -> Vec<Value> {
        body_values(
            &self.address,
            self.version,
            &self.allowed_users,
            &self.metadata,
        )
    }

    fn signed_body(&self) -> Vec<u8> {
        body_bytes(
            &self.address,
            self.version,
            &self.allowed_users,
            &self.metadata,
        )
    }
}

impl PartialEq for DocumentHeader {
    fn eq(&self, other: &Self) -> bool {
        self.address == other.address
            && self.version == other.version
            && self.allowed_users == other.allowed_users
            && self.metadata == other.metadata
    }
}

impl Eq for DocumentHeader {}

fn body_values(
    address: &Address,
    version: u64,
    users: &BTreeSet<PublicKey>,
    metadata: &BTreeMap<String, String>,
) -> Vec<Value> {
    vec![
        Value::Bytes(address.to_bytes().to_vec()),
        Value::Bytes(address.owner().as_bytes().to_vec()),
        Value::Integer(Integer::from(version)),
        Value::Array(
            users
                .iter()
                .map(|pk| Value::Bytes(pk.as_bytes().to_vec()))
                .collect(),
        ),
        Value::Map(
            metadata
                .iter()
                .map(|(k, v)| (Value::Text(k.clone()), Value::Text(v.clone())))
                .collect(),
        ),
    ]
}

fn body_bytes(
    address: &Address,
    version: u64,
    users: &BTreeSet<PublicKey>,
    metadata: &BTreeMap<String, String>,
) -> Vec<u8> {
    let mut out = Vec::new();
    ciborium::into_writer(&Value::Array(body_values(address, version, users, metadata)), &mut out)
        .expect("CBOR encoding to a Vec cannot fail");
    out
}

fn expect_bytes(value: Value, field: &str) -> ShareResult<Vec<u8>> {
    match value {
        Value::Bytes(b) => Ok(b),
        _ => Err(ShareError::InvalidHeader(format!(
            "{} must be a byte string",
            field
        ))),
    }
}

fn expect_u64(value: Value, field: &str) -> ShareResult<u64> {
    match value {
        Value::Integer(i) => u64::try_from(i).map_err(|_| {
            ShareError::InvalidHeader(format!("{} must be an unsigned integer", field))
        }),
        _ => Err(ShareError::InvalidHeader(format!(
            "{} must be an integer",
            field
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::Keypair;

    fn metadata(title: &str) -> BTreeMap<String, String> {
        let mut map = BTreeMap::new();
        map.insert("title".to_string(), title.to_string());
        map
    }

    #[test]
    fn test_create_includes_owner() {
        let keypair = Keypair::generate();
        let header = DocumentHeader::create(&keypair, [], metadata("notes"));

        assert!(header.has_allowed_user(&keypair.public_key()));
        assert_eq!(header.version(), 1);
        assert_eq!(header.metadata().get("title").unwrap(), "notes");
    }

    #[test]
    fn test_export_import_roundtrip() {
        let keypair = Keypair::generate();
        let guest = Keypair::generate().public_key();
        let header = DocumentHeader::create(&keypair, [guest], metadata("board"));

        let bytes = header.export().unwrap();
        let restored = DocumentHeader::import(&bytes).unwrap();

        assert_eq!(restored, header);
        assert!(restored.has_allowed_user(&guest));
        assert_eq!(restored.document_id(), header.document_id());
    }

    #[test]
    fn test_export_is_deterministic() {
        let keypair = Keypair::generate();
        let header = DocumentHeader::create(&keypair, [], metadata("x"));
        assert_eq!(header.export().unwrap(), header.export().unwrap());
    }

    #[test]
    fn test_import_rejects_tampered_bytes() {
        let keypair = Keypair::generate();
        let header = DocumentHeader::create(&keypair, [], metadata("x"));

        let mut bytes = header.export().unwrap();
        // Flip a byte inside the metadata region
        let len = bytes.len();
        bytes[len / 2] ^= 0x01;

        assert!(DocumentHeader::import(&bytes).is_err());
    }

    #[test]
    fn test_import_rejects_garbage() {
        assert!(matches!(
            DocumentHeader::import(b"definitely not cbor"),
            Err(ShareError::InvalidHeader(_))
        ));
        assert!(DocumentHeader::import(&[]).is_err());
    }

    #[test]
    fn test_upgrade_accepts_greater_version() {
        let keypair = Keypair::generate();
        let guest = Keypair::generate().public_key();
        let v1 = DocumentHeader::create(&keypair, [], metadata("x"));
        let v2 = v1.next_version(&keypair, [guest], metadata("x")).unwrap();

        let upgraded = DocumentHeader::upgrade(&v1, v2.clone()).unwrap();
        assert_eq!(upgraded.version(), 2);
        assert!(upgraded.has_allowed_user(&guest));
    }

    #[test]
    fn test_upgrade_rejects_equal_version() {
        let keypair = Keypair::generate();
        let v1 = DocumentHeader::create(&keypair, [], metadata("x"));

        let result = DocumentHeader::upgrade(&v1, v1.clone());
        assert!(matches!(result, Err(ShareError::HeaderUpgradeRejected(_))));
    }

    #[test]
    fn test_upgrade_rejects_stale_version() {
        let keypair = Keypair::generate();
        let v1 = DocumentHeader::create(&keypair, [], metadata("x"));
        let v2 = v1.next_version(&keypair, [], metadata("x")).unwrap();

        // Offering v1 against v2 must fail and leave v2 in place
        assert!(DocumentHeader::upgrade(&v2, v1).is_err());
    }

    #[test]
    fn test_upgrade_rejects_other_address() {
        let keypair = Keypair::generate();
        let a = DocumentHeader::create(&keypair, [], metadata("x"));
        let b = DocumentHeader::create(&keypair, [], metadata("x"));
        let b2 = b.next_version(&keypair, [], metadata("x")).unwrap();

        assert!(matches!(
            DocumentHeader::upgrade(&a, b2),
            Err(ShareError::HeaderUpgradeRejected(_))
        ));
    }

    #[test]
    fn test_next_version_requires_owner() {
        let owner = Keypair::generate();
        let intruder = Keypair::generate();
        let header = DocumentHeader::create(&owner, [], metadata("x"));

        let result = header.next_version(&intruder, [], metadata("x"));
        assert!(matches!(result, Err(ShareError::Unauthorized(_))));
    }

    #[test]
    fn test_content_signature_verification() {
        let owner = Keypair::generate();
        let member = Keypair::generate();
        let header = DocumentHeader::create(&owner, [member.public_key()], metadata("x"));

        let content = b"crdt bytes";
        let owner_sig = owner.sign(content);
        let member_sig = member.sign(content);
        let stranger_sig = Keypair::generate().sign(content);

        assert!(header.verify_signature(content, &owner_sig));
        assert!(!header.verify_signature(content, &member_sig));
        assert!(header.verify_signature_any(content, &member_sig));
        assert!(!header.verify_signature_any(content, &stranger_sig));
    }
}
