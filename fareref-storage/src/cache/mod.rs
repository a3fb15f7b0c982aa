//! Keyed caches for read-mostly, backing-store-derived records.
//!
//! # Design Philosophy
//!
//! A cache never hands out anything a caller could observe half-built:
//! entries are published whole and replaced whole. Lifetime is plain
//! reference counting, so an entry dropped from the cache stays valid for
//! every reader (or [`DeferredOwnershipScope`](crate::DeferredOwnershipScope))
//! still holding it.
//!
//! # Example
//!
//! ```ignore
//! let classes = CacheClasses::from_config(&FareRefConfig::from_env())?;
//! let fares = HistoricalKeyedCache::from_class(
//!     CacheSettings::new("fares"),
//!     &classes.get("fare_rules")?,
//!     FareLoader::new(pool.clone()),
//! );
//!
//! let scope = DeferredOwnershipScope::new();
//! let entry = fares.get_in(&key, ticket_date, &scope)?;
//! ```

pub mod class;
pub mod codec;
pub mod entry;
pub mod historical;
pub mod keyed;
pub mod stats;

pub use class::{CacheClass, CacheClasses};
pub use codec::{
    CompressedValueCodec, CompressionStats, ValueCodec, FRAME_MAGIC, FRAME_VERSION, MAX_DECODED_LEN,
};
pub use entry::CacheEntry;
pub use historical::{HistoricalKey, HistoricalKeyedCache};
pub use keyed::{CacheSettings, KeyedCache};
pub use stats::CacheStats;
