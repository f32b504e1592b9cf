//! Cache of contraction plans keyed by the renumbering-invariant structural
//! hash of a network.

use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::RwLock;

use log::debug;
use rustc_hash::FxHashMap;

use crate::bytepacket::BytePacket;
use crate::contractionpath::ContractionPlan;
use crate::error::TneError;

/// Hit and miss counters, exposed as a test hook.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PlanCacheStats {
    pub hits: u64,
    pub misses: u64,
}

/// Reader-writer locked plan cache with optional file persistence.
///
/// Plans are stored in canonical numbering (see
/// [`crate::contractionpath::ContractionPlan`]), so a cached plan applies to
/// any network with the same structural hash regardless of vertex ids.
#[derive(Debug, Default)]
pub struct PlanCache {
    enabled: AtomicBool,
    entries: RwLock<FxHashMap<u64, ContractionPlan>>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl PlanCache {
    /// Creates an enabled, empty cache.
    #[must_use]
    pub fn new() -> Self {
        let cache = Self::default();
        cache.enabled.store(true, Ordering::Relaxed);
        cache
    }

    /// Turns caching on or off. Lookups on a disabled cache always miss and
    /// insertions are dropped; stored entries are retained.
    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Relaxed);
    }

    /// Whether caching is enabled.
    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    /// Number of cached plans.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.read().unwrap().len()
    }

    /// Whether the cache holds no plans.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Looks up a plan by structural hash.
    #[must_use]
    pub fn lookup(&self, key: u64) -> Option<ContractionPlan> {
        if !self.is_enabled() {
            return None;
        }
        let found = self.entries.read().unwrap().get(&key).cloned();
        if found.is_some() {
            self.hits.fetch_add(1, Ordering::Relaxed);
        } else {
            self.misses.fetch_add(1, Ordering::Relaxed);
        }
        found
    }

    /// Stores a plan under the structural hash.
    pub fn insert(&self, key: u64, plan: ContractionPlan) {
        if !self.is_enabled() {
            return;
        }
        self.entries.write().unwrap().insert(key, plan);
    }

    /// Drops all cached plans and resets the counters.
    pub fn clear(&self) {
        self.entries.write().unwrap().clear();
        self.hits.store(0, Ordering::Relaxed);
        self.misses.store(0, Ordering::Relaxed);
    }

    /// Current hit/miss counters.
    #[must_use]
    pub fn stats(&self) -> PlanCacheStats {
        PlanCacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
        }
    }

    /// Writes all cached plans to a file in the byte-packet wire format:
    /// entry count, then `key` + packed plan per entry.
    pub fn persist(&self, path: impl AsRef<Path>) -> Result<(), TneError> {
        let entries = self.entries.read().unwrap();
        let mut packet = BytePacket::new();
        packet.append_u64(entries.len() as u64);
        // Deterministic file layout regardless of hash-map iteration order.
        let mut keys: Vec<u64> = entries.keys().copied().collect();
        keys.sort_unstable();
        for key in keys {
            packet.append_u64(key);
            entries[&key].pack(&mut packet);
        }
        std::fs::write(path, packet.as_bytes())?;
        Ok(())
    }

    /// Loads plans persisted by [`PlanCache::persist`], merging them into the
    /// cache. Returns the number of loaded plans.
    pub fn load(&self, path: impl AsRef<Path>) -> Result<usize, TneError> {
        let bytes = std::fs::read(&path)?;
        let mut packet = BytePacket::from_bytes(bytes);
        let count = packet
            .extract_u64()
            .ok_or_else(|| TneError::DumpIo("truncated plan cache file".to_string()))?;
        let mut entries = self.entries.write().unwrap();
        for _ in 0..count {
            let key = packet
                .extract_u64()
                .ok_or_else(|| TneError::DumpIo("truncated plan cache entry".to_string()))?;
            let plan = ContractionPlan::unpack(&mut packet)
                .ok_or_else(|| TneError::DumpIo("malformed plan cache entry".to_string()))?;
            entries.insert(key, plan);
        }
        debug!(count; "loaded persisted contraction plans");
        Ok(count as usize)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::contractionpath::ContractionTriple;

    fn sample_plan() -> ContractionPlan {
        ContractionPlan {
            triples: vec![ContractionTriple {
                result: 3,
                left: 1,
                right: 2,
            }],
            peak_volume: 8.0,
            total_flops: 128.0,
        }
    }

    #[test]
    fn test_hit_and_miss_counters() {
        let cache = PlanCache::new();
        assert_eq!(cache.lookup(7), None);
        cache.insert(7, sample_plan());
        assert_eq!(cache.lookup(7), Some(sample_plan()));
        assert_eq!(
            cache.stats(),
            PlanCacheStats { hits: 1, misses: 1 }
        );
    }

    #[test]
    fn test_disabled_cache_never_hits() {
        let cache = PlanCache::new();
        cache.insert(7, sample_plan());
        cache.set_enabled(false);
        assert_eq!(cache.lookup(7), None);
        assert_eq!(cache.stats(), PlanCacheStats { hits: 0, misses: 0 });
    }

    #[test]
    fn test_persistence_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("plans.bin");
        let cache = PlanCache::new();
        cache.insert(1, sample_plan());
        cache.insert(2, ContractionPlan::default());
        cache.persist(&path).unwrap();

        let restored = PlanCache::new();
        assert_eq!(restored.load(&path).unwrap(), 2);
        assert_eq!(restored.lookup(1), Some(sample_plan()));
        assert_eq!(restored.lookup(2), Some(ContractionPlan::default()));
    }
}
