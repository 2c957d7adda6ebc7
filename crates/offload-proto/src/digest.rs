use sha2::{Digest, Sha256};

/// Computes the content fingerprint of a bundle artifact.
///
/// Every participant must use the same function; the fingerprint is the
/// cache key on nodes and the dedupe key for uploads.
pub fn fingerprint(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}
