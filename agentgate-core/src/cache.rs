//! Decision cache.
//!
//! An access-vector cache in the SELinux AVC tradition: evaluated
//! decisions are memoized per `(agent_type, tool)` with a TTL so that
//! repeated tool calls skip policy evaluation entirely.
//!
//! - First evaluation: policy lookup plus backend dispatch.
//! - Cached evaluation: a single concurrent-map probe.
//!
//! Entries never outlive a policy update for their agent type; the engine
//! invalidates by key prefix whenever a policy is loaded or removed.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use dashmap::DashMap;

use crate::types::Decision;

/// Default entry lifetime, balancing freshness against hit rate.
pub const DEFAULT_TTL: Duration = Duration::from_secs(60);

/// Cache lookup key. Tool names cannot contain `:`, so plain
/// concatenation is unambiguous.
pub fn cache_key(agent_type: &str, tool: &str) -> String {
    format!("{agent_type}:{tool}")
}

#[derive(Clone)]
struct CacheEntry {
    decision: Decision,
    reason: String,
    expires_at: Instant,
}

/// Hit/miss counters, taken as a consistent-enough snapshot.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    /// Percentage of lookups served from cache, 0.0 when idle.
    pub hit_rate: f64,
}

/// Concurrent TTL cache for policy decisions.
///
/// Uses a sharded concurrent map so readers and writers on the hot path
/// never serialize behind a single lock; counters are plain atomics.
pub struct DecisionCache {
    entries: DashMap<String, CacheEntry>,
    ttl: Duration,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl DecisionCache {
    /// Create a cache with the given entry TTL.
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            ttl,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// Look up a cached decision.
    ///
    /// Expired entries are removed and reported as misses.
    pub fn get(&self, key: &str) -> Option<(Decision, String)> {
        let now = Instant::now();
        let expired = match self.entries.get(key) {
            Some(entry) if entry.expires_at > now => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                return Some((entry.decision, entry.reason.clone()));
            }
            Some(_) => true,
            None => false,
        };
        if expired {
            self.entries.remove(key);
        }
        self.misses.fetch_add(1, Ordering::Relaxed);
        None
    }

    /// Store a decision under `key` with a fresh TTL.
    pub fn set(&self, key: &str, decision: Decision, reason: &str) {
        self.entries.insert(
            key.to_string(),
            CacheEntry {
                decision,
                reason: reason.to_string(),
                expires_at: Instant::now() + self.ttl,
            },
        );
    }

    /// Remove every entry whose key starts with `prefix`.
    ///
    /// Called with `"{agent_type}:"` when a policy for that agent type is
    /// loaded or removed. Returns the number of entries dropped.
    pub fn invalidate_prefix(&self, prefix: &str) -> usize {
        let mut removed = 0;
        self.entries.retain(|key, _| {
            if key.starts_with(prefix) {
                removed += 1;
                false
            } else {
                true
            }
        });
        removed
    }

    /// Drop the entire cache. Returns the number of entries removed.
    pub fn invalidate_all(&self) -> usize {
        let count = self.entries.len();
        self.entries.clear();
        count
    }

    /// Approximate number of live entries (expired entries linger until
    /// the next `get` touches them).
    pub fn size(&self) -> usize {
        self.entries.len()
    }

    /// Snapshot of the hit/miss counters.
    pub fn stats(&self) -> CacheStats {
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let total = hits + misses;
        let hit_rate = if total > 0 {
            hits as f64 / total as f64 * 100.0
        } else {
            0.0
        };
        CacheStats {
            hits,
            misses,
            hit_rate,
        }
    }
}

impl Default for DecisionCache {
    fn default() -> Self {
        Self::new(DEFAULT_TTL)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
