//! fareref Storage - Keyed Caches and Deferred-Ownership Scopes
//!
//! The concurrency and resource-management layer every reference-data
//! lookup goes through: keyed caches with single-flight load-on-miss,
//! date-bucketed historical caches, compressed entry storage, and the
//! per-transaction scope that keeps cache-owned and derived data alive
//! until the unit of work ends.

pub mod cache;
pub mod dao;
pub mod scope;

pub use cache::{
    CacheClass, CacheClasses, CacheEntry, CacheSettings, CacheStats, CompressedValueCodec,
    CompressionStats, HistoricalKey, HistoricalKeyedCache, KeyedCache, ValueCodec, FRAME_MAGIC,
    FRAME_VERSION,
};
pub use dao::{EffectiveLookup, EffectiveView, EntrySource};
pub use scope::{
    Deallocator, DeferredOwnershipScope, DeleteList, ObjectPool, PoolStats, Recyclable,
    ReleaseReport, ScopeState, ShardHandle, Scoped,
};
