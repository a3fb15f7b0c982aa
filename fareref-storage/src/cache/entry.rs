//! Published cache entries.

use chrono::{DateTime, Utc};
use std::ops::Deref;

/// An immutable value published by a cache.
///
/// Entries are shared as `Arc<CacheEntry<V>>` and never mutated after
/// publication. Invalidation or reload replaces the association in the cache
/// with a new entry; readers holding the old one keep a consistent view until
/// they drop it.
#[derive(Debug)]
pub struct CacheEntry<V> {
    value: V,
    loaded_at: DateTime<Utc>,
    generation: u64,
}

impl<V> CacheEntry<V> {
    pub(crate) fn new(value: V, generation: u64) -> Self {
        Self::restore(value, Utc::now(), generation)
    }

    /// Rebuild an entry decoded from compressed storage, keeping the
    /// metadata of the original load.
    pub(crate) fn restore(value: V, loaded_at: DateTime<Utc>, generation: u64) -> Self {
        Self {
            value,
            loaded_at,
            generation,
        }
    }

    pub fn value(&self) -> &V {
        &self.value
    }

    /// When the loader produced this value.
    pub fn loaded_at(&self) -> DateTime<Utc> {
        self.loaded_at
    }

    /// Publication counter, unique within one cache. A reload always yields a
    /// higher generation than the entry it replaces.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Time elapsed since the value was loaded.
    pub fn age(&self) -> chrono::Duration {
        Utc::now().signed_duration_since(self.loaded_at)
    }
}

impl<V> Deref for CacheEntry<V> {
    type Target = V;

    fn deref(&self) -> &V {
        &self.value
    }
}

impl<V> AsRef<V> for CacheEntry<V> {
    fn as_ref(&self) -> &V {
        &self.value
    }
}
