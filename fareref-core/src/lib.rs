//! fareref Core - Reference Data Types
//!
//! Pure data structures and stateless rules shared by the cache engine:
//! dates and date buckets, the effectivity contract, configuration and the
//! error taxonomy. Nothing in this crate locks or allocates on behalf of a
//! cache.

pub mod bucket;
pub mod config;
pub mod effectivity;
pub mod error;
pub mod traits;

pub use bucket::{BucketGranularity, DateBucket};
pub use config::{
    CacheClassConfig, FareRefConfig, StorageMode, DEFAULT_CACHE_CLASS, DEFAULT_SCOPE_SHARDS,
    MAX_SCOPE_SHARDS,
};
pub use effectivity::{
    collect_effective_indices, effective_indices, first_effective, is_effective,
    select_effective, Effective, EffectivityMode, EffectivityQuery, SalesRestriction,
};
pub use error::{CodecError, ConfigError, FareRefError, FareRefResult, LoaderError, ScopeError};
pub use traits::{CacheKey, CacheValue, Loader};

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

// ============================================================================
// IDENTITY TYPES
// ============================================================================

/// Calendar date used for every effectivity and bucketing decision.
pub type Date = chrono::NaiveDate;

/// Identifier of one deferred-ownership scope, used to correlate log lines
/// of a unit of work. UUIDv7 keeps ids sortable by creation time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ScopeId(Uuid);

impl ScopeId {
    /// Generate a new timestamp-sortable id.
    pub fn now_v7() -> Self {
        Self(Uuid::now_v7())
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl fmt::Display for ScopeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<ScopeId> for Uuid {
    fn from(id: ScopeId) -> Self {
        id.0
    }
}
