//! Collaborator traits consumed by the cache engine.

use crate::error::FareRefResult;
use std::fmt::Debug;
use std::hash::Hash;

/// Bound shared by every cache key.
///
/// Keys are immutable, structurally compared tuples of domain fields.
/// `Debug` is required so failures and log lines can name the key.
pub trait CacheKey: Clone + Eq + Hash + Debug + Send + Sync + 'static {}

impl<T> CacheKey for T where T: Clone + Eq + Hash + Debug + Send + Sync + 'static {}

/// Bound shared by every cached value.
pub trait CacheValue: Send + Sync + 'static {}

impl<T> CacheValue for T where T: Send + Sync + 'static {}

/// Populates a cache entry on a miss, typically by running a backing-store
/// query.
///
/// The cache invokes `load` at most once concurrently per missing key. An
/// error is handed back to the callers of that load and is never cached.
pub trait Loader<K, V>: Send + Sync {
    fn load(&self, key: &K) -> FareRefResult<V>;
}

impl<K, V, F> Loader<K, V> for F
where
    F: Fn(&K) -> FareRefResult<V> + Send + Sync,
{
    fn load(&self, key: &K) -> FareRefResult<V> {
        self(key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::LoaderError;

    fn load_via<L: Loader<String, usize>>(loader: &L, key: &str) -> FareRefResult<usize> {
        loader.load(&key.to_string())
    }

    #[test]
    fn test_closures_are_loaders() {
        let loader = |key: &String| -> FareRefResult<usize> { Ok(key.len()) };
        assert_eq!(load_via(&loader, "LO/WAW"), Ok(6));
    }

    #[test]
    fn test_closure_errors_propagate() {
        let loader = |key: &String| -> FareRefResult<usize> {
            Err(LoaderError::failed("test", key.clone(), "offline").into())
        };
        assert!(load_via(&loader, "XX").is_err());
    }
}
