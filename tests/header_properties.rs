//! Property-based tests for header authorization invariants
//!
//! Uses proptest to verify the header round-trip, version monotonicity, and
//! export authorization over arbitrary identities and metadata.

use std::collections::BTreeMap;

use proptest::prelude::*;

use docshare_core::{Document, DocumentHeader, Keypair, PublicKey, ShareError};

// ============================================================================
// Strategy Generators
// ============================================================================

/// Arbitrary 32-byte key seeds
fn seed_strategy() -> impl Strategy<Value = [u8; 32]> {
    any::<[u8; 32]>()
}

/// Small metadata maps with printable keys and values
fn metadata_strategy() -> impl Strategy<Value = BTreeMap<String, String>> {
    prop::collection::btree_map("[a-z]{1,8}", "[ -~]{0,16}", 0..4)
}

/// Up to three additional allowed users
fn users_strategy() -> impl Strategy<Value = Vec<[u8; 32]>> {
    prop::collection::vec(seed_strategy(), 0..3)
}

fn keys_from_seeds(seeds: &[[u8; 32]]) -> Vec<PublicKey> {
    seeds
        .iter()
        .map(|seed| Keypair::from_seed(seed).public_key())
        .collect()
}

// ============================================================================
// Property Tests
// ============================================================================

proptest! {
    /// import(create(..).export()) preserves every field and the signature
    /// still verifies
    #[test]
    fn header_roundtrip(
        seed in seed_strategy(),
        user_seeds in users_strategy(),
        metadata in metadata_strategy(),
    ) {
        let keypair = Keypair::from_seed(&seed);
        let users = keys_from_seeds(&user_seeds);

        let header = DocumentHeader::create(&keypair, users.clone(), metadata.clone());
        let restored = DocumentHeader::import(&header.export().unwrap()).unwrap();

        prop_assert_eq!(&restored, &header);
        prop_assert_eq!(restored.version(), 1);
        prop_assert_eq!(restored.metadata(), &metadata);
        prop_assert!(restored.has_allowed_user(&keypair.public_key()));
        for user in &users {
            prop_assert!(restored.has_allowed_user(user));
        }

        // A content signature by the owner verifies against the restored header
        let content = b"content bytes";
        let signature = keypair.sign(content);
        prop_assert!(restored.verify_signature(content, &signature));
    }

    /// upgrade succeeds iff the candidate version is strictly greater and
    /// carries a valid owner signature
    #[test]
    fn header_monotonicity(
        seed in seed_strategy(),
        metadata in metadata_strategy(),
        steps in 1usize..4,
    ) {
        let keypair = Keypair::from_seed(&seed);
        let mut versions = vec![DocumentHeader::create(&keypair, [], metadata.clone())];
        for _ in 0..steps {
            let next = versions
                .last()
                .unwrap()
                .next_version(&keypair, [], metadata.clone())
                .unwrap();
            versions.push(next);
        }

        for (i, current) in versions.iter().enumerate() {
            for (j, candidate) in versions.iter().enumerate() {
                let result = DocumentHeader::upgrade(current, candidate.clone());
                if j > i {
                    prop_assert!(result.is_ok());
                } else {
                    prop_assert!(matches!(result, Err(ShareError::HeaderUpgradeRejected(_))));
                }
            }
        }
    }

    /// export succeeds exactly for keys in the allowed set
    #[test]
    fn export_authorization(
        owner_seed in seed_strategy(),
        member_seed in seed_strategy(),
        outsider_seed in seed_strategy(),
    ) {
        prop_assume!(owner_seed != member_seed);
        prop_assume!(owner_seed != outsider_seed);
        prop_assume!(member_seed != outsider_seed);

        let owner = Keypair::from_seed(&owner_seed);
        let member = Keypair::from_seed(&member_seed);
        let outsider = Keypair::from_seed(&outsider_seed);

        let doc = Document::create(&owner, [member.public_key()], BTreeMap::new());

        prop_assert!(doc.export(&owner).is_ok());
        prop_assert!(doc.export(&member).is_ok());
        prop_assert!(matches!(
            doc.export(&outsider),
            Err(ShareError::Unauthorized(_))
        ));
    }

    /// A tampered export never imports
    #[test]
    fn tampered_export_is_rejected(
        seed in seed_strategy(),
        flip_at in any::<prop::sample::Index>(),
    ) {
        let keypair = Keypair::from_seed(&seed);
        let header = DocumentHeader::create(&keypair, [], BTreeMap::new());

        let mut bytes = header.export().unwrap();
        let index = flip_at.index(bytes.len());
        bytes[index] ^= 0x01;

        // Either the decode fails or the signature check does; it must
        // never import as a different valid header
        if let Ok(imported) = DocumentHeader::import(&bytes) {
            prop_assert_eq!(imported, header);
        }
    }
}
