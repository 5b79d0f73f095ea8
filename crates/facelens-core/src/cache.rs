//! Memoization cache for facade results.
//!
//! Bounded LRU keyed by a SHA-256 digest of the operation, the pixel content
//! and every parameter. Shared between callers through `Arc<FaceCache>`.

use crate::pixels::PixelArray;
use crate::types::{FaceEncoding, FaceLandmarks, FaceLocation, FastFaceLocation};
use serde::Serialize;
use sha2::{Digest, Sha256};
use lru::LruCache;
use std::num::NonZeroUsize;
use std::sync::{Mutex, MutexGuard};

/// Digest identifying one facade call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CacheKey([u8; 32]);

/// Incremental key builder. Every field is length- or tag-prefixed so that
/// distinct parameter lists never collide by concatenation.
pub struct KeyBuilder {
    hasher: Sha256,
}

impl KeyBuilder {
    pub fn new(operation: &str) -> Self {
        Self { hasher: Sha256::new() }.str(operation)
    }

    /// Shape, channel order and pixel bytes.
    pub fn image(mut self, image: &PixelArray) -> Self {
        self.hasher.update(image.width().to_le_bytes());
        self.hasher.update(image.height().to_le_bytes());
        self.hasher.update([image.order() as u8]);
        self.hasher.update(image.as_bytes());
        self
    }

    pub fn u32(mut self, value: u32) -> Self {
        self.hasher.update(value.to_le_bytes());
        self
    }

    /// Floats are hashed by bit pattern.
    pub fn f32(mut self, value: f32) -> Self {
        self.hasher.update(value.to_bits().to_le_bytes());
        self
    }

    pub fn str(mut self, value: &str) -> Self {
        self.hasher.update((value.len() as u64).to_le_bytes());
        self.hasher.update(value.as_bytes());
        self
    }

    pub fn locations(mut self, locations: Option<&[FaceLocation]>) -> Self {
        match locations {
            None => self.hasher.update([0u8]),
            Some(locations) => {
                self.hasher.update([1u8]);
                self.hasher.update((locations.len() as u64).to_le_bytes());
                for l in locations {
                    for v in [l.top, l.right, l.bottom, l.left] {
                        self.hasher.update(v.to_le_bytes());
                    }
                }
            }
        }
        self
    }

    pub fn encoding(mut self, encoding: &FaceEncoding) -> Self {
        self.hasher.update((encoding.values.len() as u64).to_le_bytes());
        for v in &encoding.values {
            self.hasher.update(v.to_bits().to_le_bytes());
        }
        self.str(encoding.model_version.as_deref().unwrap_or(""))
    }

    pub fn encodings(mut self, encodings: &[FaceEncoding]) -> Self {
        self.hasher.update((encodings.len() as u64).to_le_bytes());
        encodings.iter().fold(self, |b, e| b.encoding(e))
    }

    pub fn finish(self) -> CacheKey {
        CacheKey(self.hasher.finalize().into())
    }
}

/// A memoized facade result.
#[derive(Debug, Clone, PartialEq)]
pub enum CachedValue {
    Locations(Vec<FaceLocation>),
    FastLocations(Vec<FastFaceLocation>),
    Encodings(Vec<FaceEncoding>),
    Landmarks(Vec<FaceLandmarks>),
    Matches(Vec<bool>),
    Distances(Vec<f32>),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub entries: usize,
    pub capacity: usize,
}

#[derive(Default)]
struct Inner {
    // None when caching is disabled.
    entries: Option<LruCache<CacheKey, CachedValue>>,
    hits: u64,
    misses: u64,
}

/// Bounded least-recently-used cache. Capacity 0 disables caching.
pub struct FaceCache {
    capacity: usize,
    inner: Mutex<Inner>,
}

impl FaceCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            inner: Mutex::new(Inner {
                entries: NonZeroUsize::new(capacity).map(LruCache::new),
                ..Inner::default()
            }),
        }
    }

    pub fn disabled() -> Self {
        Self::new(0)
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    // The cache holds no invariants a panicking holder could break.
    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn get(&self, key: &CacheKey) -> Option<CachedValue> {
        let mut inner = self.lock();
        let found = inner.entries.as_mut().and_then(|lru| lru.get(key).cloned());
        match found {
            Some(_) => inner.hits += 1,
            None => inner.misses += 1,
        }
        found
    }

    pub fn insert(&self, key: CacheKey, value: CachedValue) {
        let mut inner = self.lock();
        let Some(lru) = inner.entries.as_mut() else {
            return;
        };
        if let Some((evicted, _)) = lru.push(key, value) {
            if evicted != key {
                tracing::trace!("evicted least recently used entry");
            }
        }
    }

    pub fn clear(&self) {
        if let Some(lru) = self.lock().entries.as_mut() {
            lru.clear();
        }
    }

    pub fn len(&self) -> usize {
        self.lock().entries.as_ref().map_or(0, LruCache::len)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> CacheStats {
        let inner = self.lock();
        CacheStats {
            hits: inner.hits,
            misses: inner.misses,
            entries: inner.entries.as_ref().map_or(0, LruCache::len),
            capacity: self.capacity,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pixels::ChannelOrder;

    fn key(n: u32) -> CacheKey {
        KeyBuilder::new("test").u32(n).finish()
    }

    fn value(n: f32) -> CachedValue {
        CachedValue::Distances(vec![n])
    }

    #[test]
    fn test_get_after_insert() {
        let cache = FaceCache::new(4);
        cache.insert(key(1), value(1.0));
        assert_eq!(cache.get(&key(1)), Some(value(1.0)));
        assert_eq!(cache.get(&key(2)), None);
        let stats = cache.stats();
        assert_eq!((stats.hits, stats.misses, stats.entries), (1, 1, 1));
    }

    #[test]
    fn test_evicts_least_recently_used() {
        let cache = FaceCache::new(2);
        cache.insert(key(1), value(1.0));
        cache.insert(key(2), value(2.0));
        // Touch 1 so 2 becomes the eviction candidate.
        assert!(cache.get(&key(1)).is_some());
        cache.insert(key(3), value(3.0));
        assert_eq!(cache.len(), 2);
        assert!(cache.get(&key(1)).is_some());
        assert!(cache.get(&key(2)).is_none());
        assert!(cache.get(&key(3)).is_some());
    }

    #[test]
    fn test_reinsert_does_not_evict() {
        let cache = FaceCache::new(2);
        cache.insert(key(1), value(1.0));
        cache.insert(key(2), value(2.0));
        cache.insert(key(2), value(2.5));
        assert_eq!(cache.len(), 2);
        assert_eq!(cache.get(&key(2)), Some(value(2.5)));
    }

    #[test]
    fn test_capacity_one_keeps_latest() {
        let cache = FaceCache::new(1);
        cache.insert(key(1), value(1.0));
        cache.insert(key(2), value(2.0));
        assert_eq!(cache.len(), 1);
        assert!(cache.get(&key(1)).is_none());
        assert_eq!(cache.get(&key(2)), Some(value(2.0)));
    }

    #[test]
    fn test_clear_keeps_counters() {
        let cache = FaceCache::new(2);
        cache.insert(key(1), value(1.0));
        assert!(cache.get(&key(1)).is_some());
        cache.clear();
        assert!(cache.is_empty());
        assert_eq!(cache.stats().hits, 1);
    }

    #[test]
    fn test_zero_capacity_disables() {
        let cache = FaceCache::disabled();
        cache.insert(key(1), value(1.0));
        assert!(cache.is_empty());
        assert!(cache.get(&key(1)).is_none());
    }

    #[test]
    fn test_key_depends_on_every_field() {
        let image = PixelArray::filled(4, 4, ChannelOrder::Rgb, [1, 2, 3]);
        let base = KeyBuilder::new("locate").image(&image).u32(1).str("hog").finish();

        assert_eq!(base, KeyBuilder::new("locate").image(&image).u32(1).str("hog").finish());
        assert_ne!(base, KeyBuilder::new("locate").image(&image).u32(2).str("hog").finish());
        assert_ne!(base, KeyBuilder::new("locate").image(&image).u32(1).str("cnn").finish());
        assert_ne!(base, KeyBuilder::new("encode").image(&image).u32(1).str("hog").finish());

        let bgr = PixelArray::filled(4, 4, ChannelOrder::Bgr, [1, 2, 3]);
        assert_ne!(base, KeyBuilder::new("locate").image(&bgr).u32(1).str("hog").finish());

        let other = PixelArray::filled(4, 4, ChannelOrder::Rgb, [1, 2, 4]);
        assert_ne!(base, KeyBuilder::new("locate").image(&other).u32(1).str("hog").finish());

        let tall = PixelArray::filled(2, 8, ChannelOrder::Rgb, [1, 2, 3]);
        assert_ne!(base, KeyBuilder::new("locate").image(&tall).u32(1).str("hog").finish());
    }

    #[test]
    fn test_key_distinguishes_absent_and_empty_locations() {
        let none = KeyBuilder::new("x").locations(None).finish();
        let empty = KeyBuilder::new("x").locations(Some(&[][..])).finish();
        assert_ne!(none, empty);
    }
}
