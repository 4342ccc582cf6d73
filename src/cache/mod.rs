//! Tiered local cache for ESI responses
//!
//! A fast in-process tier backed by an optional SQLite disk tier for
//! categories that elect persistence. The cache stores opaque payload bytes
//! plus metadata; it owns no domain knowledge. Freshness policy lives in
//! [`policy::PolicyTable`], consulted by the facade on every call.

pub mod disk;
pub mod key;
pub mod policy;
pub mod store;

use chrono::{DateTime, Utc};
use std::time::Duration;

// Re-export main types
pub use key::cache_key;
pub use policy::{CategoryPolicy, PolicyTable, categories};
pub use store::{CacheStats, CacheStore, SWEEP_INTERVAL, WriteTicket};

/// One cached payload with its metadata.
///
/// Entries are immutable once written; a write with the same key replaces
/// the prior entry atomically.
#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub key: String,
    pub data: Vec<u8>,
    pub created_at: DateTime<Utc>,
    pub ttl: Duration,
    pub tags: Vec<String>,
}

impl CacheEntry {
    /// Time elapsed since the entry was written
    pub fn age(&self) -> Duration {
        (Utc::now() - self.created_at)
            .to_std()
            .unwrap_or(Duration::ZERO)
    }

    /// An entry is fresh while its age is below its TTL; stale otherwise,
    /// but stale entries remain retrievable on explicit request
    pub fn is_fresh(&self) -> bool {
        self.age() < self.ttl
    }
}
