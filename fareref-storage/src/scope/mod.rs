//! Deferred-ownership scope ("delete list").
//!
//! One scope is created per unit of work and passed by reference into every
//! cache call made during it. The scope keeps alive everything those calls
//! hand out:
//!
//! - **extend**: an extra co-owning reference to an already-shared object,
//!   typically a cache entry, so it outlives eviction or reload.
//! - **adopt**: sole ownership of a freshly built object, typically a
//!   filtered result, disposed of by its [`Deallocator`].
//!
//! Everything registered is released exactly once, in reverse registration
//! order, when [`DeferredOwnershipScope::release`] runs or the scope drops.
//!
//! # State Transition Diagram
//!
//! ```text
//! Empty ── extend/adopt/import ──→ Active ── release() ──→ Releasing ──→ Released
//!   │                                ↺                                   (terminal)
//!   └──────────────────────── release() ─────────────────────────────────────↗
//! ```
//!
//! # Handles
//!
//! Registrations return a [`Scoped`] handle bound to the scope borrow.
//! `release` takes `&mut self`, so the borrow checker proves that no handle
//! is alive when the scope disposes of its contents. Handles are backed by
//! `Arc`, so memory safety never depends on that bound alone.
//!
//! # Sharding
//!
//! Storage is split across a fixed number of shards so workers of one
//! transaction registering concurrently do not serialize on one lock.
//! Unpinned calls pick shards round-robin; [`DeferredOwnershipScope::shard`]
//! pins calls to an explicit shard. Shard 0 lives inline and the other shards
//! are only built on first use, so a scope that holds a single item never
//! allocates storage for its bookkeeping.

mod deallocator;
mod pool;

pub use deallocator::Deallocator;
pub use pool::{ObjectPool, PoolStats, Recyclable};

use deallocator::{Adoption, Releasable, ReleaseKind};
use fareref_core::{
    FareRefConfig, FareRefResult, ScopeError, ScopeId, DEFAULT_SCOPE_SHARDS, MAX_SCOPE_SHARDS,
};
use parking_lot::Mutex;
use std::any::Any;
use std::marker::PhantomData;
use std::ops::Deref;
use std::sync::atomic::{AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};
use std::{fmt, mem};

/// Alias matching the name used by data-access code.
pub type DeleteList = DeferredOwnershipScope;

// ============================================================================
// STATE
// ============================================================================

/// Lifecycle of a scope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ScopeState {
    Empty,
    Active,
    Releasing,
    Released,
}

impl ScopeState {
    const fn as_u8(self) -> u8 {
        match self {
            ScopeState::Empty => 0,
            ScopeState::Active => 1,
            ScopeState::Releasing => 2,
            ScopeState::Released => 3,
        }
    }

    const fn from_u8(raw: u8) -> Self {
        match raw {
            0 => ScopeState::Empty,
            1 => ScopeState::Active,
            2 => ScopeState::Releasing,
            _ => ScopeState::Released,
        }
    }
}

/// Counts of what a release disposed of.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReleaseReport {
    /// Extended references dropped.
    pub extended: usize,
    /// Adopted objects freed.
    pub adopted: usize,
    /// Adopted objects returned to a pool.
    pub pooled: usize,
}

impl ReleaseReport {
    pub fn total(&self) -> usize {
        self.extended + self.adopted + self.pooled
    }
}

// ============================================================================
// SHARD STORAGE
// ============================================================================

struct Slot {
    seq: u64,
    item: Item,
}

/// A registration. Extensions hold the caller's `Arc` directly, so extending
/// never allocates.
enum Item {
    Extended(Arc<dyn Any + Send + Sync>),
    Adopted(Box<dyn Releasable>),
}

impl Item {
    fn extends(&self, target: *const ()) -> bool {
        match self {
            Item::Extended(shared) => Arc::as_ptr(shared) as *const () == target,
            Item::Adopted(_) => false,
        }
    }

    fn release(self) -> ReleaseKind {
        match self {
            Item::Extended(shared) => {
                drop(shared);
                ReleaseKind::Extended
            }
            Item::Adopted(adoption) => adoption.release(),
        }
    }
}

#[derive(Default)]
enum ShardSlots {
    #[default]
    Empty,
    One(Slot),
    Many(Vec<Slot>),
}

impl ShardSlots {
    fn push(&mut self, slot: Slot) {
        *self = match mem::take(self) {
            ShardSlots::Empty => ShardSlots::One(slot),
            ShardSlots::One(first) => ShardSlots::Many(vec![first, slot]),
            ShardSlots::Many(mut slots) => {
                slots.push(slot);
                ShardSlots::Many(slots)
            }
        };
    }

    fn as_slice(&self) -> &[Slot] {
        match self {
            ShardSlots::Empty => &[],
            ShardSlots::One(slot) => std::slice::from_ref(slot),
            ShardSlots::Many(slots) => slots,
        }
    }

    fn len(&self) -> usize {
        self.as_slice().len()
    }

    fn drain_into(&mut self, out: &mut Vec<Slot>) {
        match mem::take(self) {
            ShardSlots::Empty => {}
            ShardSlots::One(slot) => out.push(slot),
            ShardSlots::Many(slots) => out.extend(slots),
        }
    }
}

// ============================================================================
// HANDLES
// ============================================================================

/// A reference to an object kept alive by a scope.
///
/// The `'s` lifetime ties the handle to the scope borrow it came from.
pub struct Scoped<'s, T: ?Sized> {
    value: Arc<T>,
    _scope: PhantomData<&'s DeferredOwnershipScope>,
}

impl<'s, T: ?Sized> Scoped<'s, T> {
    fn new(value: Arc<T>) -> Self {
        Self {
            value,
            _scope: PhantomData,
        }
    }

    /// Check whether two handles point at the same object.
    pub fn ptr_eq(this: &Self, other: &Self) -> bool {
        Arc::ptr_eq(&this.value, &other.value)
    }

    /// Check whether this handle points at the object behind `shared`.
    pub fn is(this: &Self, shared: &Arc<T>) -> bool {
        Arc::ptr_eq(&this.value, shared)
    }
}

impl<T: ?Sized> Deref for Scoped<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.value
    }
}

impl<T: ?Sized> AsRef<T> for Scoped<'_, T> {
    fn as_ref(&self) -> &T {
        &self.value
    }
}

impl<T: ?Sized> Clone for Scoped<'_, T> {
    fn clone(&self) -> Self {
        Self::new(Arc::clone(&self.value))
    }
}

impl<T: ?Sized + fmt::Debug> fmt::Debug for Scoped<'_, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Scoped").field(&&*self.value).finish()
    }
}

// ============================================================================
// SCOPE
// ============================================================================

/// Per-unit-of-work owner of extended and adopted objects.
pub struct DeferredOwnershipScope {
    id: ScopeId,
    state: AtomicU8,
    next_seq: AtomicU64,
    next_shard: AtomicUsize,
    shard_count: usize,
    first: Mutex<ShardSlots>,
    rest: OnceLock<Box<[Mutex<ShardSlots>]>>,
}

impl DeferredOwnershipScope {
    /// Create a scope with the default shard count.
    pub fn new() -> Self {
        Self::with_shards(DEFAULT_SCOPE_SHARDS)
    }

    /// Create a scope with `shards` shards, clamped to `1..=MAX_SCOPE_SHARDS`.
    pub fn with_shards(shards: usize) -> Self {
        Self {
            id: ScopeId::now_v7(),
            state: AtomicU8::new(ScopeState::Empty.as_u8()),
            next_seq: AtomicU64::new(0),
            next_shard: AtomicUsize::new(0),
            shard_count: shards.clamp(1, MAX_SCOPE_SHARDS),
            first: Mutex::new(ShardSlots::Empty),
            rest: OnceLock::new(),
        }
    }

    /// Create a scope with the shard count from `config`.
    pub fn from_config(config: &FareRefConfig) -> Self {
        Self::with_shards(config.scope_shards)
    }

    pub fn id(&self) -> ScopeId {
        self.id
    }

    pub fn state(&self) -> ScopeState {
        ScopeState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn shard_count(&self) -> usize {
        self.shard_count
    }

    /// Number of live registrations across all shards.
    pub fn len(&self) -> usize {
        self.existing_shards().map(|(_, shard)| shard.lock().len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Check whether this scope holds an extension of `shared`.
    pub fn is_extending<T: ?Sized>(&self, shared: &Arc<T>) -> bool {
        let target = Arc::as_ptr(shared) as *const ();
        self.existing_shards().any(|(_, shard)| {
            shard
                .lock()
                .as_slice()
                .iter()
                .any(|slot| slot.item.extends(target))
        })
    }

    /// Pin registrations to shard `index`.
    pub fn shard(&self, index: usize) -> FareRefResult<ShardHandle<'_>> {
        if index >= self.shard_count {
            return Err(ScopeError::ShardOutOfRange {
                shard: index,
                shards: self.shard_count,
            }
            .into());
        }
        Ok(ShardHandle { scope: self, index })
    }

    /// Pin registrations to the shard owned by `worker`.
    pub fn shard_for(&self, worker: usize) -> ShardHandle<'_> {
        ShardHandle {
            scope: self,
            index: worker % self.shard_count,
        }
    }

    /// Extend the life of an already-shared object until this scope releases.
    pub fn extend<T: Send + Sync + 'static>(&self, shared: &Arc<T>) -> FareRefResult<Scoped<'_, T>> {
        self.extend_on(self.round_robin(), shared)
    }

    /// Take ownership of a new object; it is dropped at release.
    pub fn adopt<T: Send + Sync + 'static>(&self, value: T) -> FareRefResult<Scoped<'_, T>> {
        self.adopt_on(self.round_robin(), value, Deallocator::Heap)
    }

    /// Take ownership of a new object with an explicit disposal strategy.
    pub fn adopt_with<T: Send + Sync + 'static>(
        &self,
        value: T,
        deallocator: Deallocator<T>,
    ) -> FareRefResult<Scoped<'_, T>> {
        self.adopt_on(self.round_robin(), value, deallocator)
    }

    /// Take ownership of an object that goes back to `pool` at release.
    pub fn adopt_pooled<T: Send + Sync + 'static>(
        &self,
        value: T,
        pool: &ObjectPool<T>,
    ) -> FareRefResult<Scoped<'_, T>> {
        self.adopt_on(self.round_robin(), value, Deallocator::pooled(pool))
    }

    /// Move every registration of `other` into this scope, leaving `other`
    /// empty.
    ///
    /// Imported items keep their relative order and are released after
    /// anything registered here later, before anything registered earlier.
    /// Each shard of `other` is drained under its own lock, so concurrent
    /// imports from the same source never move an item twice.
    pub fn import_from(&self, other: &DeferredOwnershipScope) -> FareRefResult<usize> {
        self.ensure_usable()?;
        if std::ptr::eq(self, other) {
            return Ok(0);
        }

        let mut moved: Vec<(usize, Slot)> = Vec::new();
        let mut drained = Vec::new();
        for (index, shard) in other.existing_shards() {
            shard.lock().drain_into(&mut drained);
            moved.extend(drained.drain(..).map(|slot| (index, slot)));
        }
        if moved.is_empty() {
            return Ok(0);
        }
        moved.sort_by_key(|(_, slot)| slot.seq);

        self.mark_active();
        let count = moved.len();
        for (index, slot) in moved {
            let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
            self.shard_slots(index % self.shard_count).lock().push(Slot {
                seq,
                item: slot.item,
            });
        }

        tracing::trace!(scope = %self.id, from = %other.id, count, "imported scope contents");
        Ok(count)
    }

    /// Release everything registered, newest first.
    ///
    /// A second call reports [`ScopeError::DoubleRelease`] and disposes of
    /// nothing.
    pub fn release(&mut self) -> FareRefResult<ReleaseReport> {
        if self.state() == ScopeState::Released {
            tracing::error!(scope = %self.id, "scope released twice");
            return Err(ScopeError::DoubleRelease {
                scope_id: self.id.as_uuid(),
            }
            .into());
        }
        Ok(self.release_all())
    }

    fn release_all(&mut self) -> ReleaseReport {
        self.state
            .store(ScopeState::Releasing.as_u8(), Ordering::Release);

        let mut report = ReleaseReport::default();
        let single = self.rest.get().is_none() && matches!(*self.first.get_mut(), ShardSlots::One(_));
        if single {
            if let ShardSlots::One(slot) = mem::take(self.first.get_mut()) {
                report.record(slot.item.release());
            }
        } else {
            let mut slots = Vec::new();
            self.first.get_mut().drain_into(&mut slots);
            if let Some(rest) = self.rest.get_mut() {
                for shard in rest.iter_mut() {
                    shard.get_mut().drain_into(&mut slots);
                }
            }
            slots.sort_unstable_by(|a, b| b.seq.cmp(&a.seq));
            for slot in slots {
                report.record(slot.item.release());
            }
        }

        self.state
            .store(ScopeState::Released.as_u8(), Ordering::Release);
        tracing::trace!(
            scope = %self.id,
            extended = report.extended,
            adopted = report.adopted,
            pooled = report.pooled,
            "scope released"
        );
        report
    }

    fn extend_on<T: Send + Sync + 'static>(
        &self,
        shard: usize,
        shared: &Arc<T>,
    ) -> FareRefResult<Scoped<'_, T>> {
        let shared_any: Arc<dyn Any + Send + Sync> = Arc::<T>::clone(shared);
        self.register(shard, Item::Extended(shared_any))?;
        Ok(Scoped::new(Arc::clone(shared)))
    }

    fn adopt_on<T: Send + Sync + 'static>(
        &self,
        shard: usize,
        value: T,
        deallocator: Deallocator<T>,
    ) -> FareRefResult<Scoped<'_, T>> {
        let owned = Arc::new(value);
        let adoption = Adoption::new(Arc::clone(&owned), deallocator);
        self.register(shard, Item::Adopted(Box::new(adoption)))?;
        Ok(Scoped::new(owned))
    }

    fn register(&self, shard: usize, item: Item) -> FareRefResult<()> {
        self.ensure_usable()?;
        self.mark_active();
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        self.shard_slots(shard).lock().push(Slot { seq, item });
        Ok(())
    }

    fn ensure_usable(&self) -> FareRefResult<()> {
        match self.state() {
            ScopeState::Empty | ScopeState::Active => Ok(()),
            ScopeState::Releasing | ScopeState::Released => {
                tracing::error!(scope = %self.id, "registration on released scope");
                Err(ScopeError::UseAfterRelease {
                    scope_id: self.id.as_uuid(),
                }
                .into())
            }
        }
    }

    fn mark_active(&self) {
        let _ = self.state.compare_exchange(
            ScopeState::Empty.as_u8(),
            ScopeState::Active.as_u8(),
            Ordering::AcqRel,
            Ordering::Acquire,
        );
    }

    fn round_robin(&self) -> usize {
        self.next_shard.fetch_add(1, Ordering::Relaxed) % self.shard_count
    }

    fn shard_slots(&self, index: usize) -> &Mutex<ShardSlots> {
        if index == 0 {
            return &self.first;
        }
        let rest = self.rest.get_or_init(|| {
            (1..self.shard_count)
                .map(|_| Mutex::new(ShardSlots::Empty))
                .collect()
        });
        &rest[index - 1]
    }

    fn existing_shards(&self) -> impl Iterator<Item = (usize, &Mutex<ShardSlots>)> {
        std::iter::once((0, &self.first)).chain(
            self.rest
                .get()
                .into_iter()
                .flat_map(|rest| rest.iter().enumerate().map(|(i, shard)| (i + 1, shard))),
        )
    }
}

impl ReleaseReport {
    fn record(&mut self, kind: ReleaseKind) {
        match kind {
            ReleaseKind::Extended => self.extended += 1,
            ReleaseKind::Adopted => self.adopted += 1,
            ReleaseKind::Pooled => self.pooled += 1,
        }
    }
}

impl Default for DeferredOwnershipScope {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for DeferredOwnershipScope {
    fn drop(&mut self) {
        if self.state() != ScopeState::Released {
            self.release_all();
        }
    }
}

impl fmt::Debug for DeferredOwnershipScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeferredOwnershipScope")
            .field("id", &self.id)
            .field("state", &self.state())
            .field("shards", &self.shard_count)
            .field("len", &self.len())
            .finish()
    }
}

/// Registrations pinned to one shard of a scope.
#[derive(Debug, Clone, Copy)]
pub struct ShardHandle<'s> {
    scope: &'s DeferredOwnershipScope,
    index: usize,
}

impl<'s> ShardHandle<'s> {
    pub fn index(&self) -> usize {
        self.index
    }

    pub fn extend<T: Send + Sync + 'static>(&self, shared: &Arc<T>) -> FareRefResult<Scoped<'s, T>> {
        self.scope.extend_on(self.index, shared)
    }

    pub fn adopt<T: Send + Sync + 'static>(&self, value: T) -> FareRefResult<Scoped<'s, T>> {
        self.scope.adopt_on(self.index, value, Deallocator::Heap)
    }

    pub fn adopt_with<T: Send + Sync + 'static>(
        &self,
        value: T,
        deallocator: Deallocator<T>,
    ) -> FareRefResult<Scoped<'s, T>> {
        self.scope.adopt_on(self.index, value, deallocator)
    }

    pub fn adopt_pooled<T: Send + Sync + 'static>(
        &self,
        value: T,
        pool: &ObjectPool<T>,
    ) -> FareRefResult<Scoped<'s, T>> {
        self.scope.adopt_on(self.index, value, Deallocator::pooled(pool))
    }
}
