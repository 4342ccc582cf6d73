//! Cache key generation using SHA-256 hashes

use sha2::{Digest, Sha256};

/// Generate a deterministic cache key from a category namespace, an optional
/// identifier (usually a character or type id), and request parameters.
///
/// The key is a SHA-256 hash over the parts with parameters sorted, so equal
/// inputs always yield the same key regardless of parameter order. Each part
/// is delimited before hashing; distinct parameter sets cannot collide by
/// concatenation.
pub fn cache_key(namespace: &str, identifier: Option<&str>, params: &[(&str, &str)]) -> String {
    let mut hasher = Sha256::new();

    hasher.update(namespace.as_bytes());
    hasher.update(b"|");

    if let Some(id) = identifier {
        hasher.update(id.as_bytes());
    }
    hasher.update(b"|");

    let mut sorted_params: Vec<_> = params.iter().collect();
    sorted_params.sort_by_key(|(k, _)| *k);

    for (k, v) in sorted_params {
        hasher.update(k.as_bytes());
        hasher.update(b"=");
        hasher.update(v.as_bytes());
        hasher.update(b"&");
    }

    format!("{:x}", hasher.finalize())
}
