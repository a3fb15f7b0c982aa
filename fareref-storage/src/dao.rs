//! Effective-record lookup over a cache.
//!
//! This is the pattern every data-access object repeats: fetch the cached
//! candidates for a key, keep the records effective for the query dates, and
//! if nothing matches retry against a wildcard key. The entry that supplied
//! the selection is extended into the caller's scope; the selection itself is
//! a pooled index buffer adopted by the scope.

use crate::cache::{CacheEntry, HistoricalKey, HistoricalKeyedCache, KeyedCache};
use crate::scope::{DeferredOwnershipScope, ObjectPool, PoolStats, Scoped};
use fareref_core::{
    collect_effective_indices, CacheKey, CacheValue, Effective, EffectivityQuery, FareRefResult,
    Loader,
};
use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;

const DEFAULT_INDEX_POOL_CAPACITY: usize = 64;

/// Something that yields the cache entry for a key under a query.
pub trait EntrySource<K, V>: Send + Sync {
    fn entry(&self, key: &K, query: &EffectivityQuery) -> FareRefResult<Arc<CacheEntry<V>>>;
}

impl<K, V, L> EntrySource<K, V> for KeyedCache<K, V, L>
where
    K: CacheKey,
    V: CacheValue,
    L: Loader<K, V>,
{
    fn entry(&self, key: &K, _query: &EffectivityQuery) -> FareRefResult<Arc<CacheEntry<V>>> {
        self.get(key)
    }
}

/// Historical caches are bucketed by the query's ticket date.
impl<K, V, L> EntrySource<K, V> for HistoricalKeyedCache<K, V, L>
where
    K: CacheKey,
    V: CacheValue,
    L: Loader<HistoricalKey<K>, V>,
{
    fn entry(&self, key: &K, query: &EffectivityQuery) -> FareRefResult<Arc<CacheEntry<V>>> {
        self.get(key, query.ticket_date)
    }
}

type WildcardFn<K> = Box<dyn Fn(&K) -> Option<K> + Send + Sync>;

/// Effective-record lookup with fallback-on-miss.
pub struct EffectiveLookup<K, R, S> {
    source: S,
    wildcard: Option<WildcardFn<K>>,
    indices: ObjectPool<Vec<usize>>,
    _records: PhantomData<fn() -> R>,
}

impl<K, R, S> EffectiveLookup<K, R, S>
where
    K: CacheKey,
    R: Effective + Send + Sync + 'static,
    S: EntrySource<K, Vec<R>>,
{
    /// Lookup without a wildcard key.
    pub fn new(source: S) -> Self {
        Self {
            source,
            wildcard: None,
            indices: ObjectPool::new("effective-indices", DEFAULT_INDEX_POOL_CAPACITY, Vec::new),
            _records: PhantomData,
        }
    }

    /// Retry against `wildcard(key)` when the exact key selects nothing.
    ///
    /// Returning `None`, or the key itself, disables the retry for that key.
    pub fn with_wildcard(
        mut self,
        wildcard: impl Fn(&K) -> Option<K> + Send + Sync + 'static,
    ) -> Self {
        self.wildcard = Some(Box::new(wildcard));
        self
    }

    /// Bound the number of idle index buffers kept for reuse.
    pub fn with_pool_capacity(mut self, capacity: usize) -> Self {
        self.indices = ObjectPool::new("effective-indices", capacity, Vec::new);
        self
    }

    pub fn source(&self) -> &S {
        &self.source
    }

    pub fn pool_stats(&self) -> PoolStats {
        self.indices.stats()
    }

    /// Select the records effective for `query` under `key`.
    ///
    /// If the exact key's entry selects nothing and a distinct wildcard key
    /// exists, the wildcard's entry is used instead; the exact key's entry is
    /// then not extended into `scope`.
    pub fn get_effective<'s>(
        &self,
        key: &K,
        query: &EffectivityQuery,
        scope: &'s DeferredOwnershipScope,
    ) -> FareRefResult<EffectiveView<'s, R>> {
        let primary = self.source.entry(key, query)?;
        let mut selected = self.indices.take();
        collect_effective_indices(primary.value(), query, &mut selected);
        if !selected.is_empty() {
            return self.view(scope, &primary, selected, false);
        }

        let Some(fallback_key) = self
            .wildcard
            .as_ref()
            .and_then(|wildcard| wildcard(key))
            .filter(|candidate| candidate != key)
        else {
            return self.view(scope, &primary, selected, false);
        };
        drop(primary);

        let fallback = match self.source.entry(&fallback_key, query) {
            Ok(entry) => entry,
            Err(err) => {
                self.indices.recycle(selected);
                return Err(err);
            }
        };
        collect_effective_indices(fallback.value(), query, &mut selected);
        tracing::debug!(
            key = ?key,
            fallback = ?fallback_key,
            matched = selected.len(),
            "no effective record for key, used wildcard"
        );
        self.view(scope, &fallback, selected, true)
    }

    fn view<'s>(
        &self,
        scope: &'s DeferredOwnershipScope,
        entry: &Arc<CacheEntry<Vec<R>>>,
        selected: Vec<usize>,
        used_fallback: bool,
    ) -> FareRefResult<EffectiveView<'s, R>> {
        let entry = scope.extend(entry)?;
        let indices = scope.adopt_pooled(selected, &self.indices)?;
        Ok(EffectiveView {
            entry,
            indices,
            used_fallback,
        })
    }
}

impl<K, R, S: fmt::Debug> fmt::Debug for EffectiveLookup<K, R, S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EffectiveLookup")
            .field("source", &self.source)
            .field("wildcard", &self.wildcard.is_some())
            .field("indices", &self.indices)
            .finish()
    }
}

/// Records selected by [`EffectiveLookup::get_effective`], valid for the
/// life of the scope borrow.
pub struct EffectiveView<'s, R> {
    entry: Scoped<'s, CacheEntry<Vec<R>>>,
    indices: Scoped<'s, Vec<usize>>,
    used_fallback: bool,
}

impl<'s, R> EffectiveView<'s, R> {
    /// The selected records, in candidate order.
    pub fn iter(&self) -> impl Iterator<Item = &R> + '_ {
        self.indices
            .iter()
            .filter_map(move |&i| self.entry.value().get(i))
    }

    pub fn first(&self) -> Option<&R> {
        self.iter().next()
    }

    pub fn len(&self) -> usize {
        self.indices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.indices.is_empty()
    }

    /// Positions of the selected records within [`candidates`](Self::candidates).
    pub fn indices(&self) -> &[usize] {
        &self.indices
    }

    /// Every record of the entry the selection was made from.
    pub fn candidates(&self) -> &[R] {
        self.entry.value()
    }

    /// The entry the selection was made from.
    pub fn entry(&self) -> &CacheEntry<Vec<R>> {
        &self.entry
    }

    /// Whether the selection came from the wildcard key.
    pub fn used_fallback(&self) -> bool {
        self.used_fallback
    }
}

impl<R: fmt::Debug> fmt::Debug for EffectiveView<'_, R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EffectiveView")
            .field("selected", &self.iter().collect::<Vec<_>>())
            .field("used_fallback", &self.used_fallback)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::CacheSettings;
    use fareref_core::{BucketGranularity, Date};
    use std::collections::HashMap;

    #[derive(Debug, Clone, PartialEq)]
    struct Rule {
        carrier: &'static str,
        eff: Date,
        disc: Date,
    }

    impl Effective for Rule {
        fn effective_date(&self) -> Date {
            self.eff
        }

        fn discontinue_date(&self) -> Date {
            self.disc
        }
    }

    fn date(y: i32, m: u32, d: u32) -> Date {
        Date::from_ymd_opt(y, m, d).expect("valid date")
    }

    fn rule(carrier: &'static str, eff: Date, disc: Date) -> Rule {
        Rule { carrier, eff, disc }
    }

    /// Key is (market, carrier); the wildcard has an empty carrier.
    type MarketKey = (&'static str, &'static str);

    fn table() -> HashMap<MarketKey, Vec<Rule>> {
        let mut rows = HashMap::new();
        rows.insert(
            ("XX", "LO"),
            vec![rule("LO", date(2019, 1, 1), date(2019, 12, 31))],
        );
        rows.insert(
            ("XX", ""),
            vec![
                rule("", date(2020, 1, 1), date(2020, 6, 30)),
                rule("", date(2020, 7, 1), date(2020, 12, 31)),
                rule("", date(2020, 1, 1), date(2020, 12, 31)),
            ],
        );
        rows
    }

    type MarketLoader = Box<dyn Fn(&MarketKey) -> FareRefResult<Vec<Rule>> + Send + Sync>;
    type MarketCache = KeyedCache<MarketKey, Vec<Rule>, MarketLoader>;

    fn lookup() -> EffectiveLookup<MarketKey, Rule, MarketCache> {
        let rows = table();
        let loader: MarketLoader =
            Box::new(move |key: &MarketKey| -> FareRefResult<Vec<Rule>> {
                Ok(rows.get(key).cloned().unwrap_or_default())
            });
        let cache = KeyedCache::new(CacheSettings::new("markets"), loader);
        EffectiveLookup::new(cache).with_wildcard(|&(market, _): &MarketKey| Some((market, "")))
    }

    #[test]
    fn test_exact_match_extends_primary_only() {
        let lookup = lookup();
        let mut scope = DeferredOwnershipScope::new();
        let query = EffectivityQuery::current(date(2019, 5, 1), date(2019, 5, 1));

        {
            let view = lookup.get_effective(&("XX", "LO"), &query, &scope).expect("lookup");
            assert!(!view.used_fallback());
            assert_eq!(view.len(), 1);
            assert_eq!(view.first().map(|r| r.carrier), Some("LO"));
        }

        let primary = lookup.source().get(&("XX", "LO")).expect("cached");
        assert!(scope.is_extending(&primary));
        assert!(!lookup.source().contains(&("XX", "")), "wildcard never loaded");
        let report = scope.release().expect("release");
        assert_eq!((report.extended, report.pooled), (1, 1));
    }

    #[test]
    fn test_miss_falls_back_to_wildcard() {
        let lookup = lookup();
        let mut scope = DeferredOwnershipScope::new();
        let query = EffectivityQuery::current(date(2020, 8, 1), date(2020, 8, 1));

        {
            let view = lookup.get_effective(&("XX", "LO"), &query, &scope).expect("lookup");
            assert!(view.used_fallback());
            assert_eq!(view.indices(), &[1, 2]);
            assert_eq!(view.candidates().len(), 3);
            assert!(view.iter().all(|r| r.carrier.is_empty()));
        }

        let primary = lookup.source().get(&("XX", "LO")).expect("cached");
        let fallback = lookup.source().get(&("XX", "")).expect("cached");
        assert!(!scope.is_extending(&primary));
        assert!(scope.is_extending(&fallback));
        scope.release().expect("release");
    }

    #[test]
    fn test_empty_fallback_returns_empty_view() {
        let lookup = lookup();
        let scope = DeferredOwnershipScope::new();
        let query = EffectivityQuery::current(date(2021, 1, 1), date(2021, 1, 1));

        let view = lookup.get_effective(&("XX", "LO"), &query, &scope).expect("lookup");
        assert!(view.is_empty());
        assert!(view.used_fallback());
        assert!(view.first().is_none());
    }

    #[test]
    fn test_wildcard_equal_to_key_does_not_retry() {
        let lookup = lookup();
        let scope = DeferredOwnershipScope::new();
        let query = EffectivityQuery::current(date(2030, 1, 1), date(2030, 1, 1));

        let view = lookup.get_effective(&("XX", ""), &query, &scope).expect("lookup");
        assert!(view.is_empty());
        assert!(!view.used_fallback());
        assert_eq!(lookup.source().stats().loads, 1);
    }

    #[test]
    fn test_index_buffers_are_recycled() {
        let lookup = lookup();
        let query = EffectivityQuery::current(date(2020, 3, 1), date(2020, 3, 1));
        for _ in 0..3 {
            let mut scope = DeferredOwnershipScope::new();
            lookup.get_effective(&("XX", ""), &query, &scope).expect("lookup");
            scope.release().expect("release");
        }
        let stats = lookup.pool_stats();
        assert_eq!(stats.created, 1);
        assert_eq!(stats.reused, 2);
    }

    #[test]
    fn test_historical_source_uses_ticket_date() {
        let cache = HistoricalKeyedCache::new(
            CacheSettings::new("history"),
            BucketGranularity::Years(1),
            |hk: &HistoricalKey<&'static str>| -> FareRefResult<Vec<Rule>> {
                Ok(vec![rule(hk.key, hk.bucket.start, hk.bucket.end)])
            },
        );
        let lookup = EffectiveLookup::new(cache);
        let scope = DeferredOwnershipScope::new();
        let query = EffectivityQuery::historical(date(2018, 6, 1), date(2018, 3, 1));

        let view = lookup.get_effective(&"LO", &query, &scope).expect("lookup");
        assert_eq!(view.len(), 1);
        assert_eq!(view.first().map(|r| r.eff), Some(date(2018, 1, 1)));
        assert!(lookup.source().contains(&"LO", date(2018, 12, 31)));
    }
}
