//! Date-bucketed variant of [`KeyedCache`].
//!
//! A ticket date is folded into a `[start, end)` bucket and the bucket becomes
//! part of the key, so one logical key can hold an entry per historical
//! window. The loader receives the bucket and is expected to window its query
//! to it.

use super::class::CacheClass;
use super::entry::CacheEntry;
use super::keyed::{CacheSettings, KeyedCache};
use super::stats::CacheStats;
use crate::scope::{DeferredOwnershipScope, Scoped};
use fareref_core::{
    BucketGranularity, CacheKey, CacheValue, ConfigError, Date, DateBucket, FareRefResult, Loader,
};
use serde::{de::DeserializeOwned, Serialize};
use std::fmt;
use std::sync::Arc;

/// A logical key plus the bucket it was resolved into.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HistoricalKey<K> {
    pub key: K,
    pub bucket: DateBucket,
}

impl<K> HistoricalKey<K> {
    pub fn new(key: K, bucket: DateBucket) -> Self {
        Self { key, bucket }
    }

    pub fn start_date(&self) -> Date {
        self.bucket.start
    }

    pub fn end_date(&self) -> Date {
        self.bucket.end
    }
}

impl<K: fmt::Display> fmt::Display for HistoricalKey<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.key, self.bucket)
    }
}

/// Keyed cache whose entries are partitioned by ticket-date bucket.
pub struct HistoricalKeyedCache<K, V, L> {
    granularity: BucketGranularity,
    inner: KeyedCache<HistoricalKey<K>, V, L>,
}

impl<K, V, L> HistoricalKeyedCache<K, V, L>
where
    K: CacheKey,
    V: CacheValue,
    L: Loader<HistoricalKey<K>, V>,
{
    /// Create a live cache in its own unbounded class.
    pub fn new(settings: CacheSettings, granularity: BucketGranularity, loader: L) -> Self {
        Self {
            granularity,
            inner: KeyedCache::new(settings, loader),
        }
    }

    /// Create a live cache using the budget and granularity of `class`.
    pub fn with_class(settings: CacheSettings, class: &CacheClass, loader: L) -> Self {
        Self {
            granularity: class.granularity(),
            inner: KeyedCache::with_class(settings, class, loader),
        }
    }

    pub fn granularity(&self) -> BucketGranularity {
        self.granularity
    }

    /// The underlying cache keyed by [`HistoricalKey`].
    pub fn inner(&self) -> &KeyedCache<HistoricalKey<K>, V, L> {
        &self.inner
    }

    /// Compute the bucket for `ticket_date`.
    pub fn bucket_for(&self, ticket_date: Date) -> FareRefResult<DateBucket> {
        self.granularity.bucket_for(ticket_date).ok_or_else(|| {
            ConfigError::InvalidValue {
                field: "ticket_date".to_string(),
                value: ticket_date.to_string(),
                reason: format!("no {} bucket representable around this date", self.granularity),
            }
            .into()
        })
    }

    /// Build the bucketed key for `key` at `ticket_date`.
    pub fn key_for(&self, key: &K, ticket_date: Date) -> FareRefResult<HistoricalKey<K>> {
        Ok(HistoricalKey::new(key.clone(), self.bucket_for(ticket_date)?))
    }

    /// Get the entry for `key` in the bucket containing `ticket_date`.
    pub fn get(&self, key: &K, ticket_date: Date) -> FareRefResult<Arc<CacheEntry<V>>> {
        self.inner.get(&self.key_for(key, ticket_date)?)
    }

    /// Same as [`get`](Self::get), extending the entry into `scope`.
    pub fn get_in<'s>(
        &self,
        key: &K,
        ticket_date: Date,
        scope: &'s DeferredOwnershipScope,
    ) -> FareRefResult<Scoped<'s, CacheEntry<V>>> {
        self.inner.get_in(&self.key_for(key, ticket_date)?, scope)
    }

    /// Drop the entry for `key` in the bucket containing `ticket_date`.
    pub fn invalidate(&self, key: &K, ticket_date: Date) -> FareRefResult<bool> {
        Ok(self.inner.invalidate(&self.key_for(key, ticket_date)?))
    }

    /// Drop the entries for `key` in every bucket.
    pub fn invalidate_all(&self, key: &K) -> usize {
        self.inner.invalidate_where(|hk| hk.key == *key)
    }

    /// Reload the entry for `key` in the bucket containing `ticket_date`.
    pub fn reload(&self, key: &K, ticket_date: Date) -> FareRefResult<Arc<CacheEntry<V>>> {
        self.inner.reload(&self.key_for(key, ticket_date)?)
    }

    pub fn contains(&self, key: &K, ticket_date: Date) -> bool {
        self.key_for(key, ticket_date)
            .is_ok_and(|hk| self.inner.contains(&hk))
    }

    /// Buckets currently cached for `key`, oldest first.
    pub fn buckets(&self, key: &K) -> Vec<DateBucket> {
        let mut buckets: Vec<DateBucket> = self
            .inner
            .keys()
            .into_iter()
            .filter(|hk| hk.key == *key)
            .map(|hk| hk.bucket)
            .collect();
        buckets.sort();
        buckets
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    pub fn clear(&self) -> usize {
        self.inner.clear()
    }

    pub fn stats(&self) -> CacheStats {
        self.inner.stats()
    }
}

impl<K, V, L> HistoricalKeyedCache<K, V, L>
where
    K: CacheKey,
    V: CacheValue + Serialize + DeserializeOwned,
    L: Loader<HistoricalKey<K>, V>,
{
    /// Create a cache using the storage mode, budget and granularity of
    /// `class`.
    pub fn from_class(settings: CacheSettings, class: &CacheClass, loader: L) -> Self {
        Self {
            granularity: class.granularity(),
            inner: KeyedCache::from_class(settings, class, loader),
        }
    }
}

impl<K, V, L> fmt::Debug for HistoricalKeyedCache<K, V, L>
where
    K: CacheKey,
    V: CacheValue,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HistoricalKeyedCache")
            .field("granularity", &self.granularity)
            .field("inner", &self.inner)
            .finish()
    }
}
