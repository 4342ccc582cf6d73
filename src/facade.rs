//! Cached access: the cache-or-load decision point
//!
//! Every read in the crate funnels through [`CachedAccess::fetch`]: serve
//! fresh cache, otherwise load remotely under a per-key single-flight guard,
//! and on transient failure fall back to a stale entry rather than an error.
//! Callers always learn where their data came from.

use serde::Serialize;
use serde::de::DeserializeOwned;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

use crate::cache::{CacheStats, CacheStore, PolicyTable};
use crate::error::ApiError;

/// Where a fetched value came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataOrigin {
    /// Loaded from the remote API on this call
    Remote,
    /// Served from a fresh cache entry
    Cache,
    /// Served from a stale cache entry after the remote load failed
    StaleFallback,
}

/// A fetched value with its provenance.
///
/// `warning` carries the remote failure that forced a stale fallback so the
/// UI can flag degraded data without losing it.
#[derive(Debug)]
pub struct Fetched<T> {
    pub value: T,
    pub origin: DataOrigin,
    pub age: Duration,
    pub warning: Option<ApiError>,
}

/// Cache-aware fetch coordinator with per-key request coalescing
pub struct CachedAccess {
    cache: Arc<CacheStore>,
    policy: PolicyTable,
    inflight: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl CachedAccess {
    pub fn new(cache: Arc<CacheStore>, policy: PolicyTable) -> Self {
        Self {
            cache,
            policy,
            inflight: Mutex::new(HashMap::new()),
        }
    }

    /// Fetch a value, consulting the cache under the category's policy.
    ///
    /// Concurrent fetches for the same key coalesce: one runs the loader,
    /// the rest wait and read its result from the cache. A loader result is
    /// written under a ticket taken before the load starts, so a slow load
    /// never clobbers a newer entry.
    pub async fn fetch<T, F, Fut>(
        &self,
        category: &str,
        key: &str,
        tags: &[String],
        loader: F,
    ) -> Result<Fetched<T>, ApiError>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, ApiError>>,
    {
        if let Some(hit) = self.fresh_hit(key) {
            return Ok(hit);
        }

        let gate = self.gate_for(key).await;
        let _guard = gate.lock().await;

        // A coalesced caller that ran the loader while we waited has already
        // refilled the cache
        if let Some(hit) = self.fresh_hit(key) {
            self.release_gate(key, &gate).await;
            return Ok(hit);
        }

        let policy = self.policy.effective(category);
        let ticket = self.cache.ticket();
        let result = loader().await;
        self.release_gate(key, &gate).await;

        match result {
            Ok(value) => {
                match serde_json::to_vec(&value) {
                    Ok(bytes) => {
                        self.cache
                            .set_at(ticket, key, bytes, policy.ttl, tags, policy.persist);
                    }
                    Err(e) => log::warn!("Not caching unserializable value for {}: {}", key, e),
                }
                Ok(Fetched {
                    value,
                    origin: DataOrigin::Remote,
                    age: Duration::ZERO,
                    warning: None,
                })
            }
            Err(err) => self.stale_fallback(key, err),
        }
    }

    /// Serve a stale entry in place of the failure when the error kind
    /// permits it
    fn stale_fallback<T: DeserializeOwned>(
        &self,
        key: &str,
        err: ApiError,
    ) -> Result<Fetched<T>, ApiError> {
        if !err.allows_stale_fallback() {
            return Err(err);
        }

        let entry = match self.cache.get(key) {
            Some(entry) => entry,
            None => return Err(err),
        };

        match serde_json::from_slice(&entry.data) {
            Ok(value) => {
                log::info!("Serving stale cache for {} after remote failure: {}", key, err);
                Ok(Fetched {
                    value,
                    origin: DataOrigin::StaleFallback,
                    age: entry.age(),
                    warning: Some(err),
                })
            }
            Err(_) => Err(err),
        }
    }

    fn fresh_hit<T: DeserializeOwned>(&self, key: &str) -> Option<Fetched<T>> {
        let entry = self.cache.get_fresh(key)?;
        match serde_json::from_slice(&entry.data) {
            Ok(value) => Some(Fetched {
                value,
                origin: DataOrigin::Cache,
                age: entry.age(),
                warning: None,
            }),
            Err(e) => {
                // A cached payload the current model no longer parses is
                // dead weight; drop it and reload
                log::warn!("Evicting undeserializable cache entry {}: {}", key, e);
                self.cache.invalidate(key);
                None
            }
        }
    }

    async fn gate_for(&self, key: &str) -> Arc<Mutex<()>> {
        let mut inflight = self.inflight.lock().await;
        Arc::clone(
            inflight
                .entry(key.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(()))),
        )
    }

    /// Drop the gate entry once no other fetch holds a clone
    async fn release_gate(&self, key: &str, gate: &Arc<Mutex<()>>) {
        let mut inflight = self.inflight.lock().await;
        // Two strong counts: the map's and ours
        if Arc::strong_count(gate) <= 2 {
            inflight.remove(key);
        }
    }

    /// Remove one cached entry
    pub fn invalidate(&self, key: &str) {
        self.cache.invalidate(key);
    }

    /// Remove every cached entry carrying the tag
    pub fn invalidate_by_tag(&self, tag: &str) {
        self.cache.invalidate_by_tag(tag);
    }

    /// Drop the entire cache; returns the number of entries removed
    pub fn clear(&self) -> usize {
        self.cache.clear()
    }

    /// Update the user TTL ceiling; applies to subsequent fetches
    pub fn set_max_cache_age(&self, ceiling: Option<Duration>) {
        self.policy.set_ceiling(ceiling);
    }

    /// Cache counters for diagnostics
    pub fn cache_stats(&self) -> CacheStats {
        self.cache.stats()
    }
}
