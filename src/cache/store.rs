//! Tiered cache store: in-process fast tier plus optional SQLite disk tier
//!
//! The memory tier is authoritative; the disk tier only holds entries whose
//! policy elects persistence so they survive a restart. After the startup
//! promotion scan the memory tier is a superset of the disk tier, so reads
//! never touch disk. Disk writes run on a blocking worker and their failures
//! are logged and swallowed - the store degrades to memory-only rather than
//! surfacing disk trouble to callers.

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use super::CacheEntry;
use super::disk::DiskTier;

/// How long a stale entry is kept around for fallback before the sweeper
/// evicts it
const DEFAULT_STALE_GRACE: Duration = Duration::from_secs(60 * 60);

/// Wall-clock period between sweeps
pub const SWEEP_INTERVAL: Duration = Duration::from_secs(10 * 60);

/// Sequence number acquired at the start of a logical write.
///
/// Writes are linearized per key by start order: a write under an older
/// ticket never clobbers an entry written under a newer one, even if the
/// older write completes last. Invalidations take tickets too, so a write
/// that started before an invalidation cannot resurrect the entry.
#[derive(Debug, Clone, Copy)]
pub struct WriteTicket(u64);

#[derive(Debug, Clone)]
struct StoredEntry {
    data: Vec<u8>,
    created_at: DateTime<Utc>,
    ttl: Duration,
    tags: Vec<String>,
    seq: u64,
}

impl StoredEntry {
    fn age(&self, now: DateTime<Utc>) -> Duration {
        (now - self.created_at).to_std().unwrap_or(Duration::ZERO)
    }

    fn is_fresh(&self, now: DateTime<Utc>) -> bool {
        self.age(now) < self.ttl
    }
}

/// Entries plus per-key invalidation tombstones, guarded together.
///
/// A tombstone records the ticket of the latest invalidation of a key;
/// writes under an older ticket are dropped. Tombstones only need to
/// outlive in-flight writes and are pruned on every sweep.
#[derive(Debug, Default)]
struct MemoryTier {
    entries: HashMap<String, StoredEntry>,
    tombstones: HashMap<String, u64>,
}

/// Monotonic counters and entry ages since process start
#[derive(Debug, Clone)]
pub struct CacheStats {
    pub entry_count: usize,
    pub hit_count: u64,
    pub miss_count: u64,
    pub hit_rate: f64,
    pub oldest_entry: Option<DateTime<Utc>>,
    pub newest_entry: Option<DateTime<Utc>>,
}

/// Tiered key/value store with per-entry TTL and tag invalidation
pub struct CacheStore {
    memory: Arc<Mutex<MemoryTier>>,
    disk: Option<Arc<Mutex<DiskTier>>>,
    seq: AtomicU64,
    hits: AtomicU64,
    misses: AtomicU64,
    stale_grace: Duration,
}

/// Cache trouble is never fatal: a panic while a lock was held leaves the
/// data no worse than any other torn moment, so poisoned locks are recovered
fn recover<T>(result: std::sync::LockResult<T>) -> T {
    result.unwrap_or_else(|e| e.into_inner())
}

impl CacheStore {
    /// Open the store with a disk tier at the given directory.
    ///
    /// The disk tier is scanned once: rows past their grace window are
    /// deleted, the rest are promoted into the memory tier. A disk tier that
    /// fails to open degrades the store to memory-only.
    pub fn open(cache_dir: &Path) -> Self {
        let disk = match DiskTier::open_at(cache_dir) {
            Ok(tier) => Some(tier),
            Err(e) => {
                log::warn!("Disk cache unavailable, running memory-only: {}", e);
                None
            }
        };

        let mut tier = MemoryTier::default();
        let mut max_seq = 0u64;

        if let Some(ref disk) = disk {
            match disk.load_surviving(DEFAULT_STALE_GRACE) {
                Ok(entries) => {
                    for entry in entries {
                        max_seq = max_seq.max(entry.seq);
                        tier.entries.insert(
                            entry.key,
                            StoredEntry {
                                data: entry.data,
                                created_at: entry.created_at,
                                ttl: entry.ttl,
                                tags: entry.tags,
                                seq: entry.seq,
                            },
                        );
                    }
                    log::debug!("Promoted {} disk cache entries", tier.entries.len());
                }
                Err(e) => log::warn!("Failed to scan disk cache: {}", e),
            }
        }

        Self {
            memory: Arc::new(Mutex::new(tier)),
            disk: disk.map(|t| Arc::new(Mutex::new(t))),
            seq: AtomicU64::new(max_seq + 1),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            stale_grace: DEFAULT_STALE_GRACE,
        }
    }

    /// Memory-only store (no persistence across restarts)
    pub fn in_memory() -> Self {
        Self {
            memory: Arc::new(Mutex::new(MemoryTier::default())),
            disk: None,
            seq: AtomicU64::new(1),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            stale_grace: DEFAULT_STALE_GRACE,
        }
    }

    /// Acquire a write ticket marking the start of a logical write
    pub fn ticket(&self) -> WriteTicket {
        WriteTicket(self.seq.fetch_add(1, Ordering::SeqCst))
    }

    fn lock_memory(&self) -> MutexGuard<'_, MemoryTier> {
        recover(self.memory.lock())
    }

    /// Return the entry if present in any freshness state.
    ///
    /// Callers decide whether staleness is acceptable.
    pub fn get(&self, key: &str) -> Option<CacheEntry> {
        let tier = self.lock_memory();
        match tier.entries.get(key) {
            Some(entry) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                Some(self.to_public(key, entry))
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    /// Return the entry only while it is fresh
    pub fn get_fresh(&self, key: &str) -> Option<CacheEntry> {
        let now = Utc::now();
        let tier = self.lock_memory();
        match tier.entries.get(key) {
            Some(entry) if entry.is_fresh(now) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                Some(self.to_public(key, entry))
            }
            _ => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    /// Write an entry under a fresh ticket
    pub fn set(&self, key: &str, data: Vec<u8>, ttl: Duration, tags: &[String], persist: bool) {
        let ticket = self.ticket();
        self.set_at(ticket, key, data, ttl, tags, persist);
    }

    /// Write an entry under a previously acquired ticket.
    ///
    /// The write is dropped if the key already holds an entry from a newer
    /// ticket, or was invalidated under a newer ticket. Replacement is
    /// atomic: readers see the prior entry or the new one, never a partial
    /// state.
    pub fn set_at(
        &self,
        ticket: WriteTicket,
        key: &str,
        data: Vec<u8>,
        ttl: Duration,
        tags: &[String],
        persist: bool,
    ) {
        let created_at = Utc::now();
        {
            let mut tier = self.lock_memory();
            if let Some(&dead) = tier.tombstones.get(key)
                && dead > ticket.0
            {
                log::debug!("Dropping cache write for invalidated key {}", key);
                return;
            }
            if let Some(existing) = tier.entries.get(key)
                && existing.seq > ticket.0
            {
                log::debug!("Dropping out-of-order cache write for {}", key);
                return;
            }
            tier.tombstones.remove(key);
            tier.entries.insert(
                key.to_string(),
                StoredEntry {
                    data: data.clone(),
                    created_at,
                    ttl,
                    tags: tags.to_vec(),
                    seq: ticket.0,
                },
            );
        }

        if persist && let Some(ref disk) = self.disk {
            let disk = Arc::clone(disk);
            let memory = Arc::clone(&self.memory);
            let key = key.to_string();
            let tags = tags.to_vec();
            let write = move || {
                // Re-check under the lock: an invalidation or newer write
                // that landed while this task sat queued wins, and its disk
                // state must not be overwritten
                let still_current = {
                    let tier = recover(memory.lock());
                    tier.entries.get(&key).map(|e| e.seq) == Some(ticket.0)
                };
                if !still_current {
                    log::debug!("Skipping superseded disk write for {}", key);
                    return;
                }
                let tier = recover(disk.lock());
                if let Err(e) = tier.put(&key, &data, created_at, ttl, &tags, ticket.0) {
                    log::warn!("Failed to persist cache entry {}: {}", key, e);
                }
            };
            // Keep the caller off disk I/O when a runtime is available
            match tokio::runtime::Handle::try_current() {
                Ok(handle) => {
                    handle.spawn_blocking(write);
                }
                Err(_) => write(),
            }
        }
    }

    /// Remove one entry from both tiers.
    ///
    /// The key is tombstoned under a fresh ticket so an in-flight write that
    /// started earlier cannot resurrect it in either tier.
    pub fn invalidate(&self, key: &str) {
        let ticket = self.ticket();
        {
            let mut tier = self.lock_memory();
            tier.entries.remove(key);
            tier.tombstones.insert(key.to_string(), ticket.0);
        }

        if let Some(ref disk) = self.disk {
            let tier = recover(disk.lock());
            if let Err(e) = tier.delete(key) {
                log::warn!("Failed to invalidate disk cache entry {}: {}", key, e);
            }
        }
    }

    /// Drop every entry from both tiers
    pub fn clear(&self) -> usize {
        let ticket = self.ticket();
        let removed = {
            let mut tier = self.lock_memory();
            let count = tier.entries.len();
            let keys: Vec<String> = tier.entries.keys().cloned().collect();
            for key in keys {
                tier.tombstones.insert(key, ticket.0);
            }
            tier.entries.clear();
            count
        };

        if let Some(ref disk) = self.disk {
            let tier = recover(disk.lock());
            if let Err(e) = tier.clear_all() {
                log::warn!("Failed to clear disk cache: {}", e);
            }
        }

        removed
    }

    /// Remove every entry carrying the tag from both tiers; each removed
    /// key is tombstoned like [`invalidate`](Self::invalidate)
    pub fn invalidate_by_tag(&self, tag: &str) {
        let ticket = self.ticket();
        {
            let mut tier = self.lock_memory();
            let doomed: Vec<String> = tier
                .entries
                .iter()
                .filter(|(_, entry)| entry.tags.iter().any(|t| t == tag))
                .map(|(key, _)| key.clone())
                .collect();
            for key in doomed {
                tier.entries.remove(&key);
                tier.tombstones.insert(key, ticket.0);
            }
        }

        if let Some(ref disk) = self.disk {
            let tier = recover(disk.lock());
            if let Err(e) = tier.delete_by_tag(tag) {
                log::warn!("Failed to invalidate disk cache tag {}: {}", tag, e);
            }
        }
    }

    /// Evict entries whose staleness exceeds the grace window.
    ///
    /// This is the only place store size is bounded; entries that are merely
    /// stale stay available for fallback until their grace runs out.
    pub fn sweep_expired(&self) -> usize {
        let now = Utc::now();
        let grace = self.stale_grace;
        let evicted = {
            let mut tier = self.lock_memory();
            let before = tier.entries.len();
            tier.entries
                .retain(|_, entry| entry.age(now) <= entry.ttl + grace);
            // Tombstones only need to outlive in-flight writes; a full
            // sweep period is more than ample
            tier.tombstones.clear();
            before - tier.entries.len()
        };

        if let Some(ref disk) = self.disk {
            let tier = recover(disk.lock());
            if let Err(e) = tier.purge_expired(grace) {
                log::warn!("Failed to purge disk cache: {}", e);
            }
        }

        if evicted > 0 {
            log::debug!("Swept {} expired cache entries", evicted);
        }
        evicted
    }

    /// Periodically sweep until the task is dropped
    pub async fn run_sweeper(self: Arc<Self>, interval: Duration) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        // First tick fires immediately; skip it so startup promotion settles
        ticker.tick().await;
        loop {
            ticker.tick().await;
            self.sweep_expired();
        }
    }

    /// Counters and entry ages since process start
    pub fn stats(&self) -> CacheStats {
        let tier = self.lock_memory();
        let hit_count = self.hits.load(Ordering::Relaxed);
        let miss_count = self.misses.load(Ordering::Relaxed);
        let lookups = hit_count + miss_count;

        CacheStats {
            entry_count: tier.entries.len(),
            hit_count,
            miss_count,
            hit_rate: if lookups == 0 {
                0.0
            } else {
                hit_count as f64 / lookups as f64
            },
            oldest_entry: tier.entries.values().map(|e| e.created_at).min(),
            newest_entry: tier.entries.values().map(|e| e.created_at).max(),
        }
    }

    fn to_public(&self, key: &str, entry: &StoredEntry) -> CacheEntry {
        CacheEntry {
            key: key.to_string(),
            data: entry.data.clone(),
            created_at: entry.created_at,
            ttl: entry.ttl,
            tags: entry.tags.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_set_then_get_fresh() {
        let store = CacheStore::in_memory();
        store.set("k", b"v".to_vec(), Duration::from_secs(60), &[], false);

        let entry = store.get_fresh("k").expect("fresh entry");
        assert_eq!(entry.data, b"v");
        assert!(entry.is_fresh());
    }

    #[test]
    fn test_stale_entry_still_retrievable_via_get() {
        let store = CacheStore::in_memory();
        store.set("k", b"v".to_vec(), Duration::ZERO, &[], false);

        // Zero TTL: immediately stale
        assert!(store.get_fresh("k").is_none());
        let entry = store.get("k").expect("stale entry retrievable");
        assert_eq!(entry.data, b"v");
        assert!(!entry.is_fresh());
    }

    #[test]
    fn test_out_of_order_write_dropped() {
        let store = CacheStore::in_memory();

        // Two logical writes start in order; the earlier one completes last
        let first = store.ticket();
        let second = store.ticket();

        store.set_at(second, "k", b"second".to_vec(), Duration::from_secs(60), &[], false);
        store.set_at(first, "k", b"first".to_vec(), Duration::from_secs(60), &[], false);

        assert_eq!(store.get("k").unwrap().data, b"second");
    }

    #[test]
    fn test_in_order_write_replaces() {
        let store = CacheStore::in_memory();
        store.set("k", b"a".to_vec(), Duration::from_secs(60), &[], false);
        store.set("k", b"b".to_vec(), Duration::from_secs(60), &[], false);

        assert_eq!(store.get("k").unwrap().data, b"b");
    }

    #[test]
    fn test_clear_empties_store() {
        let store = CacheStore::in_memory();
        store.set("a", b"1".to_vec(), Duration::from_secs(60), &[], false);
        store.set("b", b"2".to_vec(), Duration::from_secs(60), &[], false);

        assert_eq!(store.clear(), 2);
        assert!(store.get("a").is_none());
        assert_eq!(store.stats().entry_count, 0);
    }

    #[test]
    fn test_invalidate() {
        let store = CacheStore::in_memory();
        store.set("k", b"v".to_vec(), Duration::from_secs(60), &[], false);
        store.invalidate("k");
        assert!(store.get("k").is_none());
    }

    #[test]
    fn test_invalidate_beats_earlier_write() {
        let store = CacheStore::in_memory();
        store.set("k", b"v".to_vec(), Duration::from_secs(60), &[], false);

        // A refresh write starts, then the key is invalidated before the
        // write completes; the late write must not resurrect the entry
        let ticket = store.ticket();
        store.invalidate("k");
        store.set_at(ticket, "k", b"late".to_vec(), Duration::from_secs(60), &[], false);

        assert!(store.get("k").is_none());
    }

    #[test]
    fn test_write_after_invalidation_lands() {
        let store = CacheStore::in_memory();
        store.set("k", b"v".to_vec(), Duration::from_secs(60), &[], false);
        store.invalidate("k");

        // A write that starts after the invalidation is a fresh value
        store.set("k", b"new".to_vec(), Duration::from_secs(60), &[], false);
        assert_eq!(store.get("k").unwrap().data, b"new");
    }

    #[test]
    fn test_invalidate_by_tag_exact() {
        let store = CacheStore::in_memory();
        let tag = vec!["character:1".to_string()];
        store.set("a", b"1".to_vec(), Duration::from_secs(60), &tag, false);
        store.set("b", b"2".to_vec(), Duration::from_secs(60), &tag, false);
        store.set(
            "c",
            b"3".to_vec(),
            Duration::from_secs(60),
            &["character:2".to_string()],
            false,
        );

        store.invalidate_by_tag("character:1");

        assert!(store.get("a").is_none());
        assert!(store.get("b").is_none());
        assert!(store.get("c").is_some());
    }

    #[test]
    fn test_tag_invalidation_beats_earlier_write() {
        let store = CacheStore::in_memory();
        let tags = vec!["character:1".to_string()];
        store.set("a", b"1".to_vec(), Duration::from_secs(60), &tags, false);

        let ticket = store.ticket();
        store.invalidate_by_tag("character:1");
        store.set_at(ticket, "a", b"late".to_vec(), Duration::from_secs(60), &tags, false);

        assert!(store.get("a").is_none());
    }

    #[test]
    fn test_sweep_keeps_graced_stale_entries() {
        let store = CacheStore::in_memory();
        // Stale immediately, but within the one-hour grace window
        store.set("stale", b"v".to_vec(), Duration::ZERO, &[], false);
        store.set("fresh", b"v".to_vec(), Duration::from_secs(600), &[], false);

        let evicted = store.sweep_expired();
        assert_eq!(evicted, 0);
        assert!(store.get("stale").is_some());
    }

    #[test]
    fn test_stats_counters() {
        let store = CacheStore::in_memory();
        store.set("k", b"v".to_vec(), Duration::from_secs(60), &[], false);

        store.get("k");
        store.get("missing");
        store.get_fresh("k");

        let stats = store.stats();
        assert_eq!(stats.entry_count, 1);
        assert_eq!(stats.hit_count, 2);
        assert_eq!(stats.miss_count, 1);
        assert!((stats.hit_rate - 2.0 / 3.0).abs() < 1e-9);
        assert!(stats.oldest_entry.is_some());
    }

    #[test]
    fn test_reads_survive_poisoned_memory_lock() {
        let store = Arc::new(CacheStore::in_memory());
        store.set("k", b"v".to_vec(), Duration::from_secs(60), &[], false);

        let poisoner = Arc::clone(&store);
        let _ = std::thread::spawn(move || {
            let _guard = poisoner.memory.lock().unwrap();
            panic!("poison the cache lock");
        })
        .join();

        // The store recovers instead of cascading the panic
        assert!(store.get("k").is_some());
        store.set("k2", b"w".to_vec(), Duration::from_secs(60), &[], false);
        assert!(store.get("k2").is_some());
    }

    #[test]
    fn test_persisted_entries_promoted_on_reopen() {
        let dir = TempDir::new().unwrap();
        {
            let store = CacheStore::open(dir.path());
            store.set("keep", b"v".to_vec(), Duration::from_secs(600), &[], true);
            store.set("skip", b"v".to_vec(), Duration::from_secs(600), &[], false);
        }

        let store = CacheStore::open(dir.path());
        assert!(store.get("keep").is_some(), "persisted entry survives restart");
        assert!(store.get("skip").is_none(), "non-persisted entry does not");
    }

    #[test]
    fn test_disk_invalidation_survives_reopen() {
        let dir = TempDir::new().unwrap();
        {
            let store = CacheStore::open(dir.path());
            store.set(
                "k",
                b"v".to_vec(),
                Duration::from_secs(600),
                &["t".to_string()],
                true,
            );
            store.invalidate_by_tag("t");
        }

        let store = CacheStore::open(dir.path());
        assert!(store.get("k").is_none());
    }

    #[test]
    fn test_late_persisted_write_cannot_resurrect_on_disk() {
        let dir = TempDir::new().unwrap();
        {
            let store = CacheStore::open(dir.path());
            // No runtime here, so the disk write runs synchronously after
            // the invalidation - the memory re-check must drop it
            let ticket = store.ticket();
            store.invalidate("k");
            store.set_at(ticket, "k", b"late".to_vec(), Duration::from_secs(600), &[], true);
            assert!(store.get("k").is_none());
        }

        let store = CacheStore::open(dir.path());
        assert!(
            store.get("k").is_none(),
            "invalidated entry must not come back from disk after restart"
        );
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_invalidate_racing_queued_disk_write() {
        let dir = TempDir::new().unwrap();
        {
            let store = CacheStore::open(dir.path());
            // The disk write is queued on the blocking pool; the
            // invalidation lands while it may still be in flight
            store.set("k", b"v".to_vec(), Duration::from_secs(600), &[], true);
            store.invalidate("k");

            tokio::time::sleep(Duration::from_millis(300)).await;
            assert!(store.get("k").is_none());
        }

        let store = CacheStore::open(dir.path());
        assert!(
            store.get("k").is_none(),
            "invalidated entry must not come back from disk after restart"
        );
    }
}
