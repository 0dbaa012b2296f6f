//! SHA-256 chunk integrity hashing
//!
//! Digests are taken over chunk *ciphertext*, so the relay and the wire layer
//! can validate a chunk without any ability to decrypt it.

use courier_core::{IntegrityHash, DIGEST_LEN};
use sha2::{Digest, Sha256};

/// SHA-256 of `data`
pub fn digest(data: &[u8]) -> IntegrityHash {
    Sha256::digest(data).into()
}

/// Recompute the digest of `data` and compare it against `expected`.
///
/// The comparison touches every byte regardless of where the first mismatch is.
pub fn verify(data: &[u8], expected: &IntegrityHash) -> bool {
    let actual = digest(data);
    let diff = actual
        .iter()
        .zip(expected.iter())
        .fold(0u8, |acc, (a, b)| acc | (a ^ b));
    diff == 0
}

/// Format a digest as lowercase hex (64 chars)
pub fn digest_to_hex(hash: &IntegrityHash) -> String {
    hex::encode(hash)
}

/// Parse a 64-char hex string into a digest
pub fn digest_from_hex(s: &str) -> Option<IntegrityHash> {
    let mut out = [0u8; DIGEST_LEN];
    hex::decode_to_slice(s, &mut out).ok()?;
    Some(out)
}
