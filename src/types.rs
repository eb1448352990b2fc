//! Shared primitive types and the process clock

use sha3::{Digest, Sha3_256};

/// 32-byte hash used for block identity and wire checksums.
pub type Hash = [u8; 32];

/// All-zero hash, used as the null parent reference.
pub const ZERO_HASH: Hash = [0u8; 32];

/// Double SHA3-256: the protocol's 256-bit hash function.
///
/// Applied twice so a length-extension on the inner hash cannot be
/// leveraged against checksums computed over attacker-chosen payloads.
pub fn double_sha3(data: &[u8]) -> Hash {
    let first = Sha3_256::digest(data);
    let second = Sha3_256::digest(first);
    second.into()
}

/// Current unix time in whole seconds.
///
/// Every timestamp in the codebase goes through this single explicit
/// conversion from the system clock.
pub fn now() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Short hex form of a hash for log lines.
pub fn short_hash(hash: &Hash) -> String {
    hex::encode(&hash[..8])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn double_sha3_differs_from_single() {
        let single: Hash = Sha3_256::digest(b"palisade").into();
        let double = double_sha3(b"palisade");
        assert_ne!(single, double);
    }

    #[test]
    fn double_sha3_deterministic() {
        assert_eq!(double_sha3(b"x"), double_sha3(b"x"));
        assert_ne!(double_sha3(b"x"), double_sha3(b"y"));
    }
}
