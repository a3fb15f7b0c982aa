//! Fixed-capacity object pool.
//!
//! Objects adopted into a scope with [`Deallocator::Pooled`] are reset and
//! handed back here on release instead of being freed, so hot paths that
//! build a filtered collection per call can reuse the backing buffers.
//!
//! [`Deallocator::Pooled`]: super::Deallocator::Pooled

use parking_lot::Mutex;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// A value that can be reset for reuse.
pub trait Recyclable: Send + Sync + 'static {
    /// Reset to an empty state. Capacity may be kept.
    fn recycle(&mut self);
}

impl<T: Send + Sync + 'static> Recyclable for Vec<T> {
    fn recycle(&mut self) {
        self.clear();
    }
}

impl Recyclable for String {
    fn recycle(&mut self) {
        self.clear();
    }
}

/// Counters for one pool.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// Objects built by the factory because the pool was empty.
    pub created: u64,
    /// Objects served from the free list.
    pub reused: u64,
    /// Objects accepted back into the free list.
    pub recycled: u64,
    /// Objects dropped because the free list was full.
    pub discarded: u64,
}

type Factory<T> = Box<dyn Fn() -> T + Send + Sync>;

struct PoolInner<T> {
    name: String,
    capacity: usize,
    free: Mutex<Vec<T>>,
    factory: Factory<T>,
    reset: fn(&mut T),
    created: AtomicU64,
    reused: AtomicU64,
    recycled: AtomicU64,
    discarded: AtomicU64,
}

/// Shared handle to a pool of reusable objects. Cloning shares the pool.
pub struct ObjectPool<T> {
    inner: Arc<PoolInner<T>>,
}

impl<T: Recyclable> ObjectPool<T> {
    /// Create a pool holding at most `capacity` idle objects.
    pub fn new(
        name: impl Into<String>,
        capacity: usize,
        factory: impl Fn() -> T + Send + Sync + 'static,
    ) -> Self {
        Self::with_reset(name, capacity, factory, T::recycle)
    }
}

impl<T> ObjectPool<T> {
    /// Create a pool for a type that does not implement [`Recyclable`].
    pub fn with_reset(
        name: impl Into<String>,
        capacity: usize,
        factory: impl Fn() -> T + Send + Sync + 'static,
        reset: fn(&mut T),
    ) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                name: name.into(),
                capacity,
                free: Mutex::new(Vec::with_capacity(capacity)),
                factory: Box::new(factory),
                reset,
                created: AtomicU64::new(0),
                reused: AtomicU64::new(0),
                recycled: AtomicU64::new(0),
                discarded: AtomicU64::new(0),
            }),
        }
    }

    /// Take an idle object, or build a new one if none is idle.
    pub fn take(&self) -> T {
        let idle = self.inner.free.lock().pop();
        match idle {
            Some(value) => {
                self.inner.reused.fetch_add(1, Ordering::Relaxed);
                value
            }
            None => {
                self.inner.created.fetch_add(1, Ordering::Relaxed);
                (self.inner.factory)()
            }
        }
    }

    /// Reset `value` and return it to the pool.
    ///
    /// Returns `false` if the pool was full and the value was dropped.
    pub fn recycle(&self, mut value: T) -> bool {
        (self.inner.reset)(&mut value);
        let mut free = self.inner.free.lock();
        if free.len() < self.inner.capacity {
            free.push(value);
            self.inner.recycled.fetch_add(1, Ordering::Relaxed);
            true
        } else {
            drop(free);
            self.inner.discarded.fetch_add(1, Ordering::Relaxed);
            false
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn capacity(&self) -> usize {
        self.inner.capacity
    }

    /// Number of idle objects.
    pub fn len(&self) -> usize {
        self.inner.free.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            created: self.inner.created.load(Ordering::Relaxed),
            reused: self.inner.reused.load(Ordering::Relaxed),
            recycled: self.inner.recycled.load(Ordering::Relaxed),
            discarded: self.inner.discarded.load(Ordering::Relaxed),
        }
    }

    /// Check whether two handles share the same pool.
    pub fn same_pool(&self, other: &ObjectPool<T>) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl<T> Clone for ObjectPool<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> fmt::Debug for ObjectPool<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ObjectPool")
            .field("name", &self.inner.name)
            .field("capacity", &self.inner.capacity)
            .field("idle", &self.len())
            .finish()
    }
}
