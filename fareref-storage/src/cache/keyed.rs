//! Keyed cache with single-flight load-on-miss.
//!
//! # Publication
//!
//! Entries are published whole, under the store lock, and never mutated
//! afterwards. Invalidation, reload and replacement swap the association for a
//! key; readers holding the previous `Arc<CacheEntry<V>>` (directly or through
//! a [`DeferredOwnershipScope`]) keep it alive until they let go.
//!
//! # Single-flight
//!
//! The first caller to miss on a key becomes the leader for that key and runs
//! the loader with no cache lock held. Concurrent callers for the same key
//! wait on the leader's in-flight slot and receive the same outcome: the same
//! entry on success, a clone of the same error on failure. Nothing is
//! published on failure, so the next caller starts a fresh load.
//!
//! # Invalidation fencing
//!
//! Invalidating or replacing a key detaches that key's in-flight load, under
//! the store lock, and marks it stale. A stale load never publishes, so it
//! cannot resurrect data from before the invalidation, and callers arriving
//! afterwards start a fresh load instead of joining it. The detached leader
//! and the waiters it already had still receive the loaded value. Loads of
//! other keys are unaffected.
//!
//! Lock order: store, then in-flight map.

use super::class::{CacheClass, ClassMember};
use super::codec::{CompressedValueCodec, ValueCodec};
use super::entry::CacheEntry;
use super::stats::{CacheStats, StatsCounters};
use crate::scope::{DeferredOwnershipScope, Scoped};
use chrono::{DateTime, Utc};
use fareref_core::{
    CacheKey, CacheValue, CodecError, FareRefError, FareRefResult, Loader, LoaderError,
    StorageMode,
};
use lru::LruCache;
use parking_lot::{Condvar, Mutex};
use serde::{de::DeserializeOwned, Serialize};
use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::num::NonZeroUsize;
use std::panic::{catch_unwind, resume_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

// ============================================================================
// SETTINGS
// ============================================================================

/// Per-cache settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheSettings {
    /// Name used in logs and error messages.
    pub name: String,
    /// Local LRU bound. 0 = unbounded (the class budget may still apply).
    pub max_size: usize,
}

impl CacheSettings {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            max_size: 0,
        }
    }

    pub fn with_max_size(mut self, max_size: usize) -> Self {
        self.max_size = max_size;
        self
    }
}

// ============================================================================
// STORED REPRESENTATION
// ============================================================================

struct Frame {
    bytes: Box<[u8]>,
    loaded_at: DateTime<Utc>,
    generation: u64,
}

enum Stored<V> {
    Live(Arc<CacheEntry<V>>),
    Compressed(Arc<Frame>),
}

impl<V> Clone for Stored<V> {
    fn clone(&self) -> Self {
        match self {
            Stored::Live(entry) => Stored::Live(Arc::clone(entry)),
            Stored::Compressed(frame) => Stored::Compressed(Arc::clone(frame)),
        }
    }
}

enum Publish<'a, V> {
    /// Publish only if this load was not detached by an invalidation.
    IfFresh(&'a InflightLoad<V>),
    /// Replace unconditionally and fence off the key's in-flight load.
    Replace,
}

// ============================================================================
// SINGLE-FLIGHT
// ============================================================================

type LoadOutcome<V> = FareRefResult<Arc<CacheEntry<V>>>;

struct InflightLoad<V> {
    outcome: Mutex<Option<LoadOutcome<V>>>,
    ready: Condvar,
    stale: AtomicBool,
}

impl<V> InflightLoad<V> {
    fn new() -> Self {
        Self {
            outcome: Mutex::new(None),
            ready: Condvar::new(),
            stale: AtomicBool::new(false),
        }
    }

    /// Set under the store lock only.
    fn mark_stale(&self) {
        self.stale.store(true, Ordering::Release);
    }

    fn is_stale(&self) -> bool {
        self.stale.load(Ordering::Acquire)
    }

    fn complete(&self, outcome: LoadOutcome<V>) {
        *self.outcome.lock() = Some(outcome);
        self.ready.notify_all();
    }

    fn wait(&self) -> LoadOutcome<V> {
        let mut outcome = self.outcome.lock();
        loop {
            if let Some(result) = outcome.as_ref() {
                return result.clone();
            }
            self.ready.wait(&mut outcome);
        }
    }
}

enum InflightRole<V> {
    Leader(Arc<InflightLoad<V>>),
    Waiter(Arc<InflightLoad<V>>),
}

// ============================================================================
// SHARED CORE
// ============================================================================

/// The part of a cache its class can reach: storage, bookkeeping, counters.
struct CacheCore<K, V> {
    name: String,
    store: Mutex<LruCache<K, Stored<V>>>,
    inflight: Mutex<HashMap<K, Arc<InflightLoad<V>>>>,
    generation: AtomicU64,
    stats: StatsCounters,
}

impl<K: CacheKey, V: CacheValue> CacheCore<K, V> {
    fn new(name: String, max_size: usize) -> Self {
        let store = match NonZeroUsize::new(max_size) {
            Some(capacity) => LruCache::new(capacity),
            None => LruCache::unbounded(),
        };
        Self {
            name,
            store: Mutex::new(store),
            inflight: Mutex::new(HashMap::new()),
            generation: AtomicU64::new(0),
            stats: StatsCounters::default(),
        }
    }

    fn next_generation(&self) -> u64 {
        self.generation.fetch_add(1, Ordering::Relaxed) + 1
    }

    fn publish(&self, key: K, stored: Stored<V>, publish: Publish<'_, V>) -> bool {
        let displaced = {
            let mut store = self.store.lock();
            match publish {
                Publish::IfFresh(slot) if slot.is_stale() => return false,
                Publish::IfFresh(_) => {}
                Publish::Replace => self.detach_inflight(&key),
            }
            store.push(key.clone(), stored)
        };

        if let Some((old_key, _)) = &displaced {
            if *old_key != key {
                self.stats.evicted(1);
                tracing::trace!(cache = %self.name, key = ?old_key, "evicted least recently used entry");
            }
        }
        true
    }

    fn remove(&self, key: &K) -> Option<Stored<V>> {
        let mut store = self.store.lock();
        self.detach_inflight(key);
        store.pop(key)
    }

    fn remove_where(&self, pred: impl Fn(&K) -> bool) -> Vec<(K, Stored<V>)> {
        let mut store = self.store.lock();
        self.detach_inflight_where(&pred);
        let doomed: Vec<K> = store
            .iter()
            .filter_map(|(key, _)| pred(key).then(|| key.clone()))
            .collect();
        doomed
            .into_iter()
            .filter_map(|key| store.pop(&key).map(|stored| (key, stored)))
            .collect()
    }

    fn drain(&self) -> Vec<(K, Stored<V>)> {
        let mut store = self.store.lock();
        self.detach_inflight_where(|_| true);
        std::iter::from_fn(|| store.pop_lru()).collect()
    }

    /// Fence off the in-flight load of `key`. Caller holds the store lock.
    fn detach_inflight(&self, key: &K) {
        if let Some(slot) = self.inflight.lock().remove(key) {
            slot.mark_stale();
        }
    }

    /// Fence off every in-flight load whose key matches `pred`. Caller holds
    /// the store lock.
    fn detach_inflight_where(&self, pred: impl Fn(&K) -> bool) {
        self.inflight.lock().retain(|key, slot| {
            let doomed = pred(key);
            if doomed {
                slot.mark_stale();
            }
            !doomed
        });
    }

    /// Remove `frame` if it is still the stored value for `key`.
    fn discard_frame(&self, key: &K, frame: &Arc<Frame>) {
        let mut store = self.store.lock();
        let current = matches!(store.peek(key), Some(Stored::Compressed(f)) if Arc::ptr_eq(f, frame));
        if current {
            store.pop(key);
        }
    }
}

impl<K: CacheKey, V: CacheValue> ClassMember for CacheCore<K, V> {
    fn member_name(&self) -> &str {
        &self.name
    }

    fn entry_count(&self) -> usize {
        self.store.lock().len()
    }

    fn evict_lru(&self, count: usize) -> usize {
        let victims: Vec<(K, Stored<V>)> = {
            let mut store = self.store.lock();
            (0..count).map_while(|_| store.pop_lru()).collect()
        };
        if !victims.is_empty() {
            self.stats.evicted(victims.len());
            tracing::trace!(cache = %self.name, evicted = victims.len(), "evicted for class budget");
        }
        victims.len()
    }
}

// ============================================================================
// KEYED CACHE
// ============================================================================

/// Thread-safe keyed cache populated by a [`Loader`].
///
/// # Example
///
/// ```ignore
/// let cache = KeyedCache::new(CacheSettings::new("routings"), |key: &RoutingKey| {
///     store.query_routings(key)
/// });
///
/// let mut scope = DeferredOwnershipScope::new();
/// let routings = cache.get_in(&key, &scope)?;
/// // `routings` stays valid even if the key is invalidated meanwhile.
/// scope.release()?;
/// ```
pub struct KeyedCache<K, V, L> {
    settings: CacheSettings,
    core: Arc<CacheCore<K, V>>,
    class: CacheClass,
    codec: Option<Arc<dyn ValueCodec<V>>>,
    loader: L,
}

impl<K, V, L> KeyedCache<K, V, L>
where
    K: CacheKey,
    V: CacheValue,
    L: Loader<K, V>,
{
    /// Create a live cache in its own unbounded class.
    pub fn new(settings: CacheSettings, loader: L) -> Self {
        let class = CacheClass::unbounded(settings.name.clone());
        Self::build(settings, class, None, loader)
    }

    /// Create a live cache sharing the budget of `class`.
    pub fn with_class(settings: CacheSettings, class: &CacheClass, loader: L) -> Self {
        Self::build(settings, class.clone(), None, loader)
    }

    /// Create a cache that stores entries through `codec`.
    pub fn with_codec(
        settings: CacheSettings,
        class: &CacheClass,
        codec: Arc<dyn ValueCodec<V>>,
        loader: L,
    ) -> Self {
        Self::build(settings, class.clone(), Some(codec), loader)
    }

    fn build(
        settings: CacheSettings,
        class: CacheClass,
        codec: Option<Arc<dyn ValueCodec<V>>>,
        loader: L,
    ) -> Self {
        let core = Arc::new(CacheCore::new(settings.name.clone(), settings.max_size));
        let member: Weak<dyn ClassMember> = Arc::downgrade(&core) as Weak<dyn ClassMember>;
        class.register(member);

        tracing::debug!(
            cache = %settings.name,
            class = %class.name(),
            max_size = settings.max_size,
            compressed = codec.is_some(),
            "cache created"
        );

        Self {
            settings,
            core,
            class,
            codec,
            loader,
        }
    }

    pub fn name(&self) -> &str {
        &self.settings.name
    }

    pub fn settings(&self) -> &CacheSettings {
        &self.settings
    }

    pub fn class(&self) -> &CacheClass {
        &self.class
    }

    pub fn is_compressed(&self) -> bool {
        self.codec.is_some()
    }

    /// Get the entry for `key`, loading it on first access.
    ///
    /// Concurrent first accesses to the same key run the loader once and all
    /// observe the same entry. In compressed storage every hit decodes a
    /// fresh entry.
    pub fn get(&self, key: &K) -> FareRefResult<Arc<CacheEntry<V>>> {
        if let Some(entry) = self.lookup(key)? {
            self.core.stats.hit();
            return Ok(entry);
        }
        self.core.stats.miss();

        match self.claim_inflight_slot(key) {
            InflightRole::Leader(slot) => self.lead_load(key, &slot),
            InflightRole::Waiter(slot) => slot.wait(),
        }
    }

    /// Get the entry for `key` and extend its life into `scope`.
    pub fn get_in<'s>(
        &self,
        key: &K,
        scope: &'s DeferredOwnershipScope,
    ) -> FareRefResult<Scoped<'s, CacheEntry<V>>> {
        let entry = self.get(key)?;
        scope.extend(&entry)
    }

    /// Publish `value` for `key`, replacing any current entry.
    pub fn replace(&self, key: &K, value: V) -> FareRefResult<Arc<CacheEntry<V>>> {
        let entry = self.admit(key, value, Publish::Replace)?;
        tracing::debug!(cache = %self.settings.name, key = ?key, generation = entry.generation(), "entry replaced");
        self.class.enforce_budget();
        Ok(entry)
    }

    /// Run the loader for `key` and atomically replace the current entry.
    ///
    /// Unlike [`get`](Self::get) this never joins an in-flight load, since
    /// that load may have started before the data changed.
    pub fn reload(&self, key: &K) -> FareRefResult<Arc<CacheEntry<V>>> {
        let outcome = self
            .load_fresh(key, Publish::Replace)
            .unwrap_or_else(|payload| {
                self.note_panic(key);
                resume_unwind(payload)
            })?;
        tracing::debug!(cache = %self.settings.name, key = ?key, generation = outcome.generation(), "entry reloaded");
        self.class.enforce_budget();
        Ok(outcome)
    }

    /// Drop the entry for `key`. Returns whether one was present.
    pub fn invalidate(&self, key: &K) -> bool {
        let removed = self.core.remove(key);
        let found = removed.is_some();
        if found {
            self.core.stats.invalidated(1);
        }
        tracing::debug!(cache = %self.settings.name, key = ?key, found, "entry invalidated");
        found
    }

    /// Drop every entry whose key matches `pred`. Returns how many were
    /// dropped.
    pub fn invalidate_where(&self, pred: impl Fn(&K) -> bool) -> usize {
        let removed = self.core.remove_where(pred).len();
        self.core.stats.invalidated(removed);
        tracing::debug!(cache = %self.settings.name, removed, "entries invalidated");
        removed
    }

    /// Drop every entry.
    pub fn clear(&self) -> usize {
        let removed = self.core.drain().len();
        self.core.stats.invalidated(removed);
        tracing::debug!(cache = %self.settings.name, removed, "cache cleared");
        removed
    }

    /// Check for an entry without loading or touching recency.
    pub fn contains(&self, key: &K) -> bool {
        self.core.store.lock().contains(key)
    }

    pub fn len(&self) -> usize {
        self.core.store.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Cached keys, most recently used first.
    pub fn keys(&self) -> Vec<K> {
        self.core
            .store
            .lock()
            .iter()
            .map(|(key, _)| key.clone())
            .collect()
    }

    pub fn stats(&self) -> CacheStats {
        self.core.stats.snapshot(self.len())
    }

    fn lookup(&self, key: &K) -> FareRefResult<Option<Arc<CacheEntry<V>>>> {
        let stored = self.core.store.lock().get(key).cloned();
        match stored {
            None => Ok(None),
            Some(Stored::Live(entry)) => Ok(Some(entry)),
            Some(Stored::Compressed(frame)) => self.decode(key, &frame).map(Some),
        }
    }

    fn decode(&self, key: &K, frame: &Arc<Frame>) -> FareRefResult<Arc<CacheEntry<V>>> {
        let decoded = match &self.codec {
            Some(codec) => codec.decode(&frame.bytes),
            None => Err(CodecError::Deserialize {
                reason: "compressed entry in a cache without a codec".to_string(),
            }
            .into()),
        };
        match decoded {
            Ok(value) => Ok(Arc::new(CacheEntry::restore(
                value,
                frame.loaded_at,
                frame.generation,
            ))),
            Err(err) => {
                self.core.discard_frame(key, frame);
                tracing::warn!(cache = %self.settings.name, key = ?key, error = %err, "discarded undecodable entry");
                Err(err)
            }
        }
    }

    fn claim_inflight_slot(&self, key: &K) -> InflightRole<V> {
        let mut inflight = self.core.inflight.lock();
        if let Some(existing) = inflight.get(key) {
            return InflightRole::Waiter(Arc::clone(existing));
        }
        let slot = Arc::new(InflightLoad::new());
        inflight.insert(key.clone(), Arc::clone(&slot));
        InflightRole::Leader(slot)
    }

    fn lead_load(&self, key: &K, slot: &Arc<InflightLoad<V>>) -> LoadOutcome<V> {
        // A previous leader may have published between our miss and the claim.
        let outcome = match self.lookup(key) {
            Ok(Some(entry)) => Ok(entry),
            Err(err) => Err(err),
            Ok(None) => self
                .load_fresh(key, Publish::IfFresh(slot.as_ref()))
                .unwrap_or_else(|payload| {
                    let err = self.note_panic(key);
                    self.release_inflight_slot(key, slot, Err(err));
                    resume_unwind(payload)
                }),
        };

        self.release_inflight_slot(key, slot, outcome.clone());
        if outcome.is_ok() {
            self.class.enforce_budget();
        }
        outcome
    }

    fn load_fresh(
        &self,
        key: &K,
        publish: Publish<'_, V>,
    ) -> Result<LoadOutcome<V>, Box<dyn Any + Send>> {
        self.core.stats.load();
        tracing::debug!(cache = %self.settings.name, key = ?key, "loading entry");

        let loaded = catch_unwind(AssertUnwindSafe(|| self.loader.load(key)))?;
        let outcome = loaded.and_then(|value| self.admit(key, value, publish));
        match &outcome {
            Ok(entry) => {
                tracing::debug!(cache = %self.settings.name, key = ?key, generation = entry.generation(), "entry loaded");
            }
            Err(err) => {
                self.core.stats.load_failure();
                tracing::warn!(cache = %self.settings.name, key = ?key, error = %err, "load failed");
            }
        }
        Ok(outcome)
    }

    fn admit(&self, key: &K, value: V, publish: Publish<'_, V>) -> LoadOutcome<V> {
        let entry = Arc::new(CacheEntry::new(value, self.core.next_generation()));
        let stored = match &self.codec {
            None => Stored::Live(Arc::clone(&entry)),
            Some(codec) => Stored::Compressed(Arc::new(Frame {
                bytes: codec.encode(entry.value())?.into_boxed_slice(),
                loaded_at: entry.loaded_at(),
                generation: entry.generation(),
            })),
        };
        if !self.core.publish(key.clone(), stored, publish) {
            tracing::debug!(cache = %self.settings.name, key = ?key, "entry invalidated during load, not published");
        }
        Ok(entry)
    }

    fn release_inflight_slot(&self, key: &K, slot: &Arc<InflightLoad<V>>, outcome: LoadOutcome<V>) {
        {
            let mut inflight = self.core.inflight.lock();
            if inflight
                .get(key)
                .is_some_and(|current| Arc::ptr_eq(current, slot))
            {
                inflight.remove(key);
            }
        }
        slot.complete(outcome);
    }

    fn note_panic(&self, key: &K) -> FareRefError {
        self.core.stats.load_failure();
        tracing::error!(cache = %self.settings.name, key = ?key, "loader panicked");
        LoaderError::Panicked {
            cache: self.settings.name.clone(),
            key: format!("{:?}", key),
        }
        .into()
    }
}

impl<K, V, L> KeyedCache<K, V, L>
where
    K: CacheKey,
    V: CacheValue + Serialize + DeserializeOwned,
    L: Loader<K, V>,
{
    /// Create a cache storing entries with [`CompressedValueCodec`].
    pub fn compressed(settings: CacheSettings, class: &CacheClass, loader: L) -> Self {
        Self::with_codec(settings, class, Arc::new(CompressedValueCodec::new()), loader)
    }

    /// Create a cache using the storage mode of `class`.
    pub fn from_class(settings: CacheSettings, class: &CacheClass, loader: L) -> Self {
        match class.storage() {
            StorageMode::Live => Self::with_class(settings, class, loader),
            StorageMode::Compressed => Self::compressed(settings, class, loader),
        }
    }
}

impl<K, V, L> fmt::Debug for KeyedCache<K, V, L>
where
    K: CacheKey,
    V: CacheValue,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyedCache")
            .field("name", &self.settings.name)
            .field("class", &self.class.name())
            .field("len", &self.core.store.lock().len())
            .field("compressed", &self.codec.is_some())
            .finish()
    }
}
