//! Type-erased release strategies for scope registrations.

use super::pool::ObjectPool;
use std::fmt;
use std::sync::Arc;

/// How an adopted object is disposed of when its scope releases.
pub enum Deallocator<T> {
    /// Drop the object and free its allocation.
    Heap,
    /// Reset the object and return it to a fixed-capacity pool.
    Pooled(ObjectPool<T>),
}

impl<T> Deallocator<T> {
    pub fn pooled(pool: &ObjectPool<T>) -> Self {
        Deallocator::Pooled(pool.clone())
    }
}

impl<T> fmt::Debug for Deallocator<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Deallocator::Heap => f.write_str("Heap"),
            Deallocator::Pooled(pool) => f.debug_tuple("Pooled").field(&pool.name()).finish(),
        }
    }
}

/// What a registration turned out to be when it was released.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ReleaseKind {
    Extended,
    Adopted,
    Pooled,
}

/// An adopted registration the scope can release without knowing its type.
pub(crate) trait Releasable: Send + Sync {
    /// Run the disposal strategy. Called exactly once.
    fn release(self: Box<Self>) -> ReleaseKind;
}

/// Sole ownership of a freshly allocated object plus how to dispose of it.
pub(crate) struct Adoption<T> {
    owned: Arc<T>,
    deallocator: Deallocator<T>,
}

impl<T> Adoption<T> {
    pub(crate) fn new(owned: Arc<T>, deallocator: Deallocator<T>) -> Self {
        Self { owned, deallocator }
    }
}

impl<T: Send + Sync + 'static> Releasable for Adoption<T> {
    fn release(self: Box<Self>) -> ReleaseKind {
        let Adoption { owned, deallocator } = *self;
        match deallocator {
            Deallocator::Heap => {
                drop(owned);
                ReleaseKind::Adopted
            }
            Deallocator::Pooled(pool) => match Arc::into_inner(owned) {
                Some(value) => {
                    pool.recycle(value);
                    ReleaseKind::Pooled
                }
                None => {
                    // A handle escaped the scope; the last holder frees it.
                    tracing::warn!(pool = pool.name(), "pooled object still shared at release");
                    ReleaseKind::Adopted
                }
            },
        }
    }
}
