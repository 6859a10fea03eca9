//! Result caching for the coordinator.
//!
//! Caches processed images so re-running the same pipeline on the same scan
//! is free. The cache is cost-bounded: entries are weighed by their byte size
//! and least-recently-used entries are evicted once the byte budget is
//! exceeded. The budget can be shrunk under memory pressure and restored
//! afterwards.

use crate::core::buffer::PixelBuffer;
use crate::core::format::PixelFormat;
use lru::LruCache;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::time::{Duration, Instant};

/// A cache key: the pipeline fingerprint plus the identity of the input.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CacheKey {
    /// Hash of the enabled stages' names and numeric parameters.
    pub pipeline: u64,
    /// Source dimensions.
    pub dimensions: (u32, u32),
    /// Source format.
    pub format: PixelFormat,
    /// Hash of the source pixels.
    pub content: u64,
}

impl CacheKey {
    /// Key for running the pipeline with fingerprint `pipeline` on `input`.
    pub fn new(pipeline: u64, input: &PixelBuffer) -> Self {
        Self {
            pipeline,
            dimensions: input.dimensions(),
            format: input.format(),
            content: input.content_hash(),
        }
    }

    /// Compact 64-bit digest of the whole key.
    pub fn digest(&self) -> u64 {
        let mut hasher = DefaultHasher::new();
        self.hash(&mut hasher);
        hasher.finish()
    }
}

/// Cached entry with metadata.
#[derive(Debug)]
pub struct CacheEntry {
    /// The cached output; always standalone storage.
    pub buffer: PixelBuffer,
    /// When the entry was created.
    pub created_at: Instant,
    /// How long the original computation took.
    pub computation_time: Duration,
    /// Bytes charged against the budget.
    pub memory_size: usize,
}

impl CacheEntry {
    /// Create a new cache entry.
    pub fn new(buffer: PixelBuffer, computation_time: Duration) -> Self {
        let memory_size = buffer.byte_size();
        Self {
            buffer,
            created_at: Instant::now(),
            computation_time,
            memory_size,
        }
    }

    /// Check if the entry has expired.
    pub fn is_expired(&self, ttl: Duration) -> bool {
        self.created_at.elapsed() > ttl
    }
}

/// Cache statistics.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CacheStats {
    /// Number of cache hits.
    pub hits: u64,
    /// Number of cache misses.
    pub misses: u64,
    /// Number of entries evicted to respect the budget.
    pub evictions: u64,
    /// Number of entries dropped because they outlived the TTL.
    pub expirations: u64,
    /// Entries refused because they alone exceed the budget.
    pub rejected: u64,
    /// Total computation time saved by cache hits.
    pub time_saved: Duration,
}

impl CacheStats {
    /// Calculate hit ratio.
    pub fn hit_ratio(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            return 0.0;
        }
        self.hits as f64 / total as f64
    }
}

struct CacheState {
    entries: LruCache<CacheKey, CacheEntry>,
    current_bytes: usize,
    budget: usize,
}

impl CacheState {
    /// Pop LRU entries until `incoming` more bytes fit. Returns bytes released.
    fn evict_for(&mut self, incoming: usize, stats: &mut CacheStats) -> usize {
        let mut released = 0;
        while self.current_bytes + incoming > self.budget {
            match self.entries.pop_lru() {
                Some((_, evicted)) => {
                    self.current_bytes = self.current_bytes.saturating_sub(evicted.memory_size);
                    released += evicted.memory_size;
                    stats.evictions += 1;
                }
                None => break,
            }
        }
        released
    }
}

/// Thread-safe, byte-bounded LRU result cache.
pub struct ResultCache {
    state: Mutex<CacheState>,
    max_bytes: Mutex<usize>,
    ttl: Mutex<Duration>,
    stats: Mutex<CacheStats>,
}

impl ResultCache {
    /// Create a cache holding at most `max_bytes` of pixel data.
    pub fn new(max_bytes: usize) -> Self {
        Self {
            state: Mutex::new(CacheState {
                entries: LruCache::unbounded(),
                current_bytes: 0,
                budget: max_bytes,
            }),
            max_bytes: Mutex::new(max_bytes),
            ttl: Mutex::new(Duration::from_secs(3600)),
            stats: Mutex::new(CacheStats::default()),
        }
    }

    /// Set the TTL for cache entries.
    pub fn with_ttl(self, ttl: Duration) -> Self {
        *self.ttl.lock() = ttl;
        self
    }

    /// Change the TTL.
    pub fn set_ttl(&self, ttl: Duration) {
        *self.ttl.lock() = ttl;
    }

    /// Get a copy of a cached result.
    pub fn get(&self, key: &CacheKey) -> Option<PixelBuffer> {
        let ttl = *self.ttl.lock();
        let mut state = self.state.lock();
        let mut stats = self.stats.lock();

        let expired = match state.entries.get(key) {
            Some(entry) if !entry.is_expired(ttl) => {
                stats.hits += 1;
                stats.time_saved += entry.computation_time;
                return Some(entry.buffer.clone());
            }
            Some(_) => true,
            None => false,
        };
        if expired {
            if let Some(entry) = state.entries.pop(key) {
                state.current_bytes = state.current_bytes.saturating_sub(entry.memory_size);
                stats.expirations += 1;
            }
        }
        stats.misses += 1;
        None
    }

    /// Store a result. Returns `false` when the entry alone exceeds the budget.
    pub fn put(&self, key: CacheKey, buffer: PixelBuffer, computation_time: Duration) -> bool {
        let entry = CacheEntry::new(buffer, computation_time);
        let entry_size = entry.memory_size;
        let mut state = self.state.lock();
        let mut stats = self.stats.lock();

        if entry_size > state.budget {
            stats.rejected += 1;
            return false;
        }
        if let Some(old) = state.entries.pop(&key) {
            state.current_bytes = state.current_bytes.saturating_sub(old.memory_size);
        }
        state.evict_for(entry_size, &mut stats);
        state.current_bytes += entry_size;
        state.entries.put(key, entry);
        true
    }

    /// Invalidate a specific entry.
    pub fn invalidate(&self, key: &CacheKey) {
        let mut state = self.state.lock();
        if let Some(entry) = state.entries.pop(key) {
            state.current_bytes = state.current_bytes.saturating_sub(entry.memory_size);
        }
    }

    /// Drop every entry older than the TTL. Returns the number dropped.
    pub fn purge_expired(&self) -> usize {
        let ttl = *self.ttl.lock();
        let mut state = self.state.lock();
        let expired: Vec<CacheKey> = state
            .entries
            .iter()
            .filter(|(_, entry)| entry.is_expired(ttl))
            .map(|(key, _)| *key)
            .collect();

        let mut freed = 0;
        for key in &expired {
            if let Some(entry) = state.entries.pop(key) {
                freed += entry.memory_size;
            }
        }
        state.current_bytes = state.current_bytes.saturating_sub(freed);
        self.stats.lock().expirations += expired.len() as u64;
        expired.len()
    }

    /// Multiply the active budget by `factor` (floored at zero) and evict down
    /// to it. Returns the bytes released.
    pub fn shrink_budget(&self, factor: f64) -> usize {
        let mut state = self.state.lock();
        let mut stats = self.stats.lock();
        state.budget = (state.budget as f64 * factor.clamp(0.0, 1.0)) as usize;
        let released = state.evict_for(0, &mut stats);
        log::debug!(
            "cache budget shrunk to {} bytes, released {}",
            state.budget,
            released
        );
        released
    }

    /// Return the active budget to the configured maximum.
    pub fn restore_budget(&self) {
        let max = *self.max_bytes.lock();
        self.state.lock().budget = max;
    }

    /// Change the configured maximum and reset the active budget to it.
    pub fn set_max_bytes(&self, max_bytes: usize) {
        *self.max_bytes.lock() = max_bytes;
        let mut state = self.state.lock();
        let mut stats = self.stats.lock();
        state.budget = max_bytes;
        state.evict_for(0, &mut stats);
    }

    /// Active byte budget.
    pub fn budget(&self) -> usize {
        self.state.lock().budget
    }

    /// Configured maximum budget.
    pub fn max_bytes(&self) -> usize {
        *self.max_bytes.lock()
    }

    /// Clear the entire cache.
    pub fn clear(&self) {
        let mut state = self.state.lock();
        state.entries.clear();
        state.current_bytes = 0;
    }

    /// Get cache statistics.
    pub fn stats(&self) -> CacheStats {
        self.stats.lock().clone()
    }

    /// Get current memory usage in bytes.
    pub fn memory_usage(&self) -> usize {
        self.state.lock().current_bytes
    }

    /// Get number of cached entries.
    pub fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    /// Check if cache is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for ResultCache {
    fn default() -> Self {
        Self::new(crate::core::config::DEFAULT_CACHE_BYTES)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn image(seed: u8) -> PixelBuffer {
        // 64-byte stride, 4 rows: 256 bytes per entry.
        PixelBuffer::from_bytes(8, 4, PixelFormat::Mono8, &[seed; 32]).unwrap()
    }

    fn key(seed: u8) -> CacheKey {
        CacheKey::new(7, &image(seed))
    }

    #[test]
    fn test_cache_key_creation() {
        assert_eq!(key(1), key(1));
        assert_ne!(key(1), key(2));
        assert_ne!(CacheKey::new(7, &image(1)), CacheKey::new(8, &image(1)));
        assert_eq!(key(1).digest(), key(1).digest());
    }

    #[test]
    fn test_cache_put_get() {
        let cache = ResultCache::new(4096);
        assert!(cache.put(key(1), image(1), Duration::from_millis(100)));

        let result = cache.get(&key(1)).unwrap();
        assert_eq!(result, image(1));
        assert_eq!(cache.memory_usage(), 256);
        assert_eq!(cache.stats().hits, 1);
        assert_eq!(cache.stats().time_saved, Duration::from_millis(100));
    }

    #[test]
    fn test_cache_miss() {
        let cache = ResultCache::new(4096);
        assert!(cache.get(&key(3)).is_none());
        assert_eq!(cache.stats().misses, 1);
        assert_eq!(cache.stats().hit_ratio(), 0.0);
    }

    #[test]
    fn test_byte_budget_evicts_lru() {
        let cache = ResultCache::new(512);
        cache.put(key(1), image(1), Duration::ZERO);
        cache.put(key(2), image(2), Duration::ZERO);
        // Touch 1 so 2 becomes least recently used.
        assert!(cache.get(&key(1)).is_some());
        cache.put(key(3), image(3), Duration::ZERO);

        assert_eq!(cache.len(), 2);
        assert!(cache.get(&key(2)).is_none());
        assert!(cache.get(&key(1)).is_some());
        assert_eq!(cache.memory_usage(), 512);
        assert_eq!(cache.stats().evictions, 1);
    }

    #[test]
    fn test_oversized_entry_rejected() {
        let cache = ResultCache::new(100);
        assert!(!cache.put(key(1), image(1), Duration::ZERO));
        assert!(cache.is_empty());
        assert_eq!(cache.stats().rejected, 1);
    }

    #[test]
    fn test_shrink_and_restore_budget() {
        let cache = ResultCache::new(1024);
        for seed in 0..4 {
            cache.put(key(seed), image(seed), Duration::ZERO);
        }
        assert_eq!(cache.memory_usage(), 1024);

        let released = cache.shrink_budget(0.5);
        assert_eq!(released, 512);
        assert_eq!(cache.budget(), 512);
        assert_eq!(cache.len(), 2);

        cache.restore_budget();
        assert_eq!(cache.budget(), 1024);
    }

    #[test]
    fn test_expiry() {
        let cache = ResultCache::new(4096).with_ttl(Duration::ZERO);
        cache.put(key(1), image(1), Duration::ZERO);
        cache.put(key(2), image(2), Duration::ZERO);
        std::thread::sleep(Duration::from_millis(2));

        assert!(cache.get(&key(1)).is_none());
        assert_eq!(cache.purge_expired(), 1);
        assert!(cache.is_empty());
        assert_eq!(cache.memory_usage(), 0);
        assert_eq!(cache.stats().expirations, 2);
    }

    #[test]
    fn test_invalidate_and_clear() {
        let cache = ResultCache::new(4096);
        cache.put(key(1), image(1), Duration::ZERO);
        cache.put(key(2), image(2), Duration::ZERO);

        cache.invalidate(&key(1));
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.memory_usage(), 256);

        cache.clear();
        assert!(cache.is_empty());
        assert_eq!(cache.memory_usage(), 0);
    }
}
