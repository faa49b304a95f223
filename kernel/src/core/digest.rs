//! Hash helpers shared by the menu, the content store and the audit log.
//!
//! SHA-256 is the only digest used for audit and replay comparisons. FNV-1a 64
//! is a fast fingerprint for loop detection and must never be treated as a
//! security boundary.

use sha2::{Digest, Sha256};

const FNV_OFFSET_BASIS: u64 = 0xcbf2_9ce4_8422_2325;
const FNV_PRIME: u64 = 0x0100_0000_01b3;

/// Lowercase hex SHA-256 of `bytes`.
pub fn sha256_hex(bytes: impl AsRef<[u8]>) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes.as_ref());
    hex::encode(hasher.finalize())
}

/// Deterministic FNV-1a 64 (stable across runs and platforms).
pub fn fnv1a64(bytes: impl AsRef<[u8]>) -> u64 {
    let mut h = FNV_OFFSET_BASIS;
    for b in bytes.as_ref() {
        h ^= u64::from(*b);
        h = h.wrapping_mul(FNV_PRIME);
    }
    h
}

/// FNV-1a 64 rendered as 16 lowercase hex characters.
pub fn fnv1a64_hex(bytes: impl AsRef<[u8]>) -> String {
    format!("{:016x}", fnv1a64(bytes))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sha256_of_empty_input_is_known_vector() {
        assert_eq!(
            sha256_hex(b""),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }

    #[test]
    fn fnv1a64_matches_reference_vectors() {
        assert_eq!(fnv1a64(b""), 0xcbf2_9ce4_8422_2325);
        assert_eq!(fnv1a64(b"a"), 0xaf63_dc4c_8601_ec8c);
        assert_eq!(fnv1a64_hex(b"a"), "af63dc4c8601ec8c");
    }
}
