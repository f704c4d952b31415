use sha2::{Digest, Sha256};

/// Prefix the server expects in front of a hex SHA-256 digest.
pub const CHUNK_HASH_PREFIX: &str = "sha256:";

/// Computes SHA-256 of `data` and returns the hex-encoded digest.
pub fn checksum_bytes(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

/// Formats the `chunk_hash` parameter sent alongside a chunk.
pub fn chunk_hash(data: &[u8]) -> String {
    format!("{CHUNK_HASH_PREFIX}{}", checksum_bytes(data))
}
