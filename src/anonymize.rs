//! Deterministic pseudonyms for non-consenting authors.
//!
//! The same seed always yields the same adjective-color-animal triple, so
//! cached and snapshotted renders stay stable. Only output is anonymized;
//! stored account rows keep the real identity.

use sha2::{Digest, Sha256};

const ADJECTIVES: &[&str] = &[
    "Brisk", "Calm", "Clever", "Daring", "Eager", "Gentle", "Glad", "Keen", "Lively", "Merry",
    "Nimble", "Patient", "Proud", "Quick", "Quiet", "Swift", "Tidy", "Vivid", "Wise", "Witty",
];

const COLORS: &[&str] = &[
    "Amber", "Azure", "Coral", "Crimson", "Emerald", "Golden", "Indigo", "Ivory", "Jade", "Lilac",
    "Maroon", "Olive", "Pearl", "Russet", "Sable", "Scarlet", "Silver", "Teal", "Umber", "Violet",
];

const ANIMALS: &[&str] = &[
    "Badger", "Bison", "Crane", "Dolphin", "Falcon", "Gecko", "Heron", "Ibis", "Jackal", "Koala",
    "Lemur", "Lynx", "Marten", "Narwhal", "Otter", "Panda", "Quail", "Raven", "Stoat", "Wren",
];

/// Derives a stable pseudonym from a seed string.
pub fn pseudonym(seed: &str) -> String {
    let digest = Sha256::digest(seed.as_bytes());
    // Three independent u64 lanes out of the digest, one per word list.
    let lane = |offset: usize| {
        let mut bytes = [0u8; 8];
        bytes.copy_from_slice(&digest[offset..offset + 8]);
        u64::from_be_bytes(bytes)
    };
    format!(
        "{} {} {}",
        ADJECTIVES[(lane(0) % ADJECTIVES.len() as u64) as usize],
        COLORS[(lane(8) % COLORS.len() as u64) as usize],
        ANIMALS[(lane(16) % ANIMALS.len() as u64) as usize],
    )
}
