//! # Key Derivation
//!
//! Turns a resource identifier into a stable filesystem-safe key and a
//! shard bucket.

use md5::{Digest, Md5};

/// Derived cache key for a resource identifier
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DerivedKey {
    /// Lowercase hex digest of the identifier, used as the filename stem.
    pub key: String,
    /// Shard directory index in `[0, shard_count)`.
    pub shard: u32,
}

/// Derive the cache key and shard for a resource identifier.
///
/// The key is the MD5 digest of the identifier rendered as lowercase hex.
/// The shard is an additive hash of the hex digits reduced modulo
/// `shard_count`: cheap and order-independent, its only job is to spread
/// keys roughly evenly across directories.
pub fn derive(identifier: &str, shard_count: u32) -> DerivedKey {
    let mut hasher = Md5::new();
    hasher.update(identifier.as_bytes());
    let digest = hasher.finalize();
    let key = format!("{digest:x}");
    let shard = additive_hash(&key, shard_count);
    DerivedKey { key, shard }
}

/// Sum the numeric value of each hex digit and reduce modulo `shard_count`.
fn additive_hash(hex_key: &str, shard_count: u32) -> u32 {
    let sum: u32 = hex_key
        .chars()
        .filter_map(|c| c.to_digit(16))
        .sum();
    sum % shard_count.max(1)
}
