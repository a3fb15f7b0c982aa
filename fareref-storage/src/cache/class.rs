//! Cache classes: named policy groups sharing one size budget.
//!
//! Every cache built against a [`CacheClass`] registers itself with it. After
//! a cache publishes a new entry it asks its class to enforce the budget; the
//! class then evicts least-recently-used entries from its largest member until
//! the total entry count is back within `max_size`.
//!
//! Members are held weakly, so dropping a cache unregisters it.

use fareref_core::{
    BucketGranularity, CacheClassConfig, ConfigError, FareRefConfig, FareRefResult, StorageMode,
};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

/// A cache the class can measure and shrink.
pub(crate) trait ClassMember: Send + Sync {
    fn member_name(&self) -> &str;

    fn entry_count(&self) -> usize;

    /// Evict up to `count` least-recently-used entries. Returns how many were
    /// evicted.
    fn evict_lru(&self, count: usize) -> usize;
}

struct ClassInner {
    config: CacheClassConfig,
    members: Mutex<Vec<Weak<dyn ClassMember>>>,
    evictions: AtomicU64,
}

/// Shared runtime handle for one cache class. Cloning shares the budget.
#[derive(Clone)]
pub struct CacheClass {
    inner: Arc<ClassInner>,
}

impl CacheClass {
    pub fn new(config: CacheClassConfig) -> Self {
        Self {
            inner: Arc::new(ClassInner {
                config,
                members: Mutex::new(Vec::new()),
                evictions: AtomicU64::new(0),
            }),
        }
    }

    /// A class with no shared budget.
    pub fn unbounded(name: impl Into<String>) -> Self {
        Self::new(CacheClassConfig::new(name))
    }

    pub fn name(&self) -> &str {
        &self.inner.config.name
    }

    pub fn config(&self) -> &CacheClassConfig {
        &self.inner.config
    }

    pub fn max_size(&self) -> usize {
        self.inner.config.max_size
    }

    pub fn granularity(&self) -> BucketGranularity {
        self.inner.config.bucket_granularity
    }

    pub fn storage(&self) -> StorageMode {
        self.inner.config.storage
    }

    /// Number of live caches registered with this class.
    pub fn member_count(&self) -> usize {
        self.live_members().len()
    }

    /// Entries held across all members.
    pub fn total_entries(&self) -> usize {
        self.live_members().iter().map(|m| m.entry_count()).sum()
    }

    /// Entries evicted to enforce the shared budget.
    pub fn evictions(&self) -> u64 {
        self.inner.evictions.load(Ordering::Relaxed)
    }

    pub(crate) fn register(&self, member: Weak<dyn ClassMember>) {
        let mut members = self.inner.members.lock();
        members.retain(|m| m.strong_count() > 0);
        members.push(member);
    }

    /// Evict from the largest member until the class is within budget.
    ///
    /// Must be called without any member lock held.
    pub(crate) fn enforce_budget(&self) -> usize {
        let max = self.max_size();
        if max == 0 {
            return 0;
        }

        let members = self.live_members();
        let mut evicted = 0;
        loop {
            let counts: Vec<usize> = members.iter().map(|m| m.entry_count()).collect();
            let total: usize = counts.iter().sum();
            if total <= max {
                break;
            }
            let Some((largest, _)) = counts.iter().enumerate().max_by_key(|(_, count)| **count)
            else {
                break;
            };
            let n = members[largest].evict_lru(total - max);
            if n == 0 {
                break;
            }
            tracing::debug!(
                class = %self.name(),
                cache = %members[largest].member_name(),
                evicted = n,
                "class budget exceeded, evicted entries"
            );
            evicted += n;
        }

        if evicted > 0 {
            self.inner
                .evictions
                .fetch_add(evicted as u64, Ordering::Relaxed);
        }
        evicted
    }

    fn live_members(&self) -> Vec<Arc<dyn ClassMember>> {
        let mut members = self.inner.members.lock();
        members.retain(|m| m.strong_count() > 0);
        members.iter().filter_map(Weak::upgrade).collect()
    }
}

impl Default for CacheClass {
    fn default() -> Self {
        Self::new(CacheClassConfig::default())
    }
}

impl fmt::Debug for CacheClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CacheClass")
            .field("config", &self.inner.config)
            .field("evictions", &self.evictions())
            .finish()
    }
}

/// All cache classes of one application, built from configuration.
///
/// This is the explicit init/teardown handle for cache policy: create it at
/// startup, hand classes to caches, drop it at shutdown.
#[derive(Debug, Clone, Default)]
pub struct CacheClasses {
    classes: HashMap<String, CacheClass>,
}

impl CacheClasses {
    /// Validate `config` and build one class per entry.
    pub fn from_config(config: &FareRefConfig) -> FareRefResult<Self> {
        config.validate()?;
        let classes = config
            .classes
            .iter()
            .map(|c| (c.name.clone(), CacheClass::new(c.clone())))
            .collect();
        Ok(Self { classes })
    }

    pub fn get(&self, name: &str) -> FareRefResult<CacheClass> {
        self.classes.get(name).cloned().ok_or_else(|| {
            ConfigError::UnknownCacheClass {
                name: name.to_string(),
            }
            .into()
        })
    }

    pub fn len(&self) -> usize {
        self.classes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.classes.is_empty()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.classes.keys().map(String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fareref_core::{FareRefError, DEFAULT_CACHE_CLASS};
    use std::sync::atomic::AtomicUsize;

    struct FakeMember {
        name: &'static str,
        entries: AtomicUsize,
    }

    impl FakeMember {
        fn new(name: &'static str, entries: usize) -> Arc<Self> {
            Arc::new(Self {
                name,
                entries: AtomicUsize::new(entries),
            })
        }

        fn entries(&self) -> usize {
            self.entries.load(Ordering::SeqCst)
        }
    }

    impl ClassMember for FakeMember {
        fn member_name(&self) -> &str {
            self.name
        }

        fn entry_count(&self) -> usize {
            self.entries()
        }

        fn evict_lru(&self, count: usize) -> usize {
            let n = count.min(self.entries());
            self.entries.fetch_sub(n, Ordering::SeqCst);
            n
        }
    }

    fn register(class: &CacheClass, member: &Arc<FakeMember>) {
        let weak: Weak<dyn ClassMember> = Arc::downgrade(member) as Weak<dyn ClassMember>;
        class.register(weak);
    }

    #[test]
    fn test_unbounded_class_never_evicts() {
        let class = CacheClass::unbounded("fares");
        let member = FakeMember::new("a", 1_000);
        register(&class, &member);
        assert_eq!(class.enforce_budget(), 0);
        assert_eq!(member.entries(), 1_000);
    }

    #[test]
    fn test_budget_evicts_from_largest_member() {
        let class = CacheClass::new(CacheClassConfig::new("rules").with_max_size(10));
        let small = FakeMember::new("small", 4);
        let large = FakeMember::new("large", 9);
        register(&class, &small);
        register(&class, &large);

        assert_eq!(class.enforce_budget(), 3);
        assert_eq!(small.entries(), 4);
        assert_eq!(large.entries(), 6);
        assert_eq!(class.total_entries(), 10);
        assert_eq!(class.evictions(), 3);
    }

    #[test]
    fn test_dropped_members_unregister() {
        let class = CacheClass::unbounded("tmp");
        let kept = FakeMember::new("kept", 1);
        register(&class, &kept);
        {
            let dropped = FakeMember::new("dropped", 1);
            register(&class, &dropped);
            assert_eq!(class.member_count(), 2);
        }
        assert_eq!(class.member_count(), 1);
    }

    #[test]
    fn test_classes_from_config() {
        let config = FareRefConfig {
            classes: vec![
                CacheClassConfig::new(DEFAULT_CACHE_CLASS),
                CacheClassConfig::new("fare_rules")
                    .with_max_size(500)
                    .with_storage(StorageMode::Compressed),
            ],
            ..Default::default()
        };
        let classes = CacheClasses::from_config(&config).expect("valid config");
        assert_eq!(classes.len(), 2);

        let rules = classes.get("fare_rules").expect("known class");
        assert_eq!(rules.max_size(), 500);
        assert_eq!(rules.storage(), StorageMode::Compressed);

        assert!(matches!(
            classes.get("missing"),
            Err(FareRefError::Config(ConfigError::UnknownCacheClass { .. }))
        ));
    }

    #[test]
    fn test_clones_share_budget_state() {
        let class = CacheClass::new(CacheClassConfig::new("shared").with_max_size(1));
        let member = FakeMember::new("m", 3);
        register(&class.clone(), &member);
        assert_eq!(class.enforce_budget(), 2);
        assert_eq!(class.clone().evictions(), 2);
    }
}
