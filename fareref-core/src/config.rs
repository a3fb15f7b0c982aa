//! Configuration types

use crate::bucket::BucketGranularity;
use crate::error::{ConfigError, FareRefError, FareRefResult};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// Name of the class used when a cache does not ask for one.
pub const DEFAULT_CACHE_CLASS: &str = "default";

/// Default number of shards in a deferred-ownership scope.
pub const DEFAULT_SCOPE_SHARDS: usize = 8;

/// Upper bound on scope shards.
pub const MAX_SCOPE_SHARDS: usize = 64;

/// How a cache class retains its entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageMode {
    /// Keep decoded values and hand out shared references to them.
    #[default]
    Live,
    /// Keep compressed bytes; each read decodes a fresh value.
    Compressed,
}

/// Policy group shared by logically related caches.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheClassConfig {
    pub name: String,
    /// Shared entry budget across every cache in the class. 0 = unbounded.
    #[serde(default)]
    pub max_size: usize,
    #[serde(default)]
    pub bucket_granularity: BucketGranularity,
    #[serde(default)]
    pub storage: StorageMode,
}

impl CacheClassConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            max_size: 0,
            bucket_granularity: BucketGranularity::default(),
            storage: StorageMode::default(),
        }
    }

    pub fn with_max_size(mut self, max_size: usize) -> Self {
        self.max_size = max_size;
        self
    }

    pub fn with_granularity(mut self, granularity: BucketGranularity) -> Self {
        self.bucket_granularity = granularity;
        self
    }

    pub fn with_storage(mut self, storage: StorageMode) -> Self {
        self.storage = storage;
        self
    }

    pub fn is_unbounded(&self) -> bool {
        self.max_size == 0
    }
}

impl Default for CacheClassConfig {
    fn default() -> Self {
        Self::new(DEFAULT_CACHE_CLASS)
    }
}

/// Master configuration struct.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FareRefConfig {
    #[serde(default = "default_classes")]
    pub classes: Vec<CacheClassConfig>,
    #[serde(default = "default_scope_shards")]
    pub scope_shards: usize,
}

fn default_classes() -> Vec<CacheClassConfig> {
    vec![CacheClassConfig::new(DEFAULT_CACHE_CLASS)]
}

fn default_scope_shards() -> usize {
    DEFAULT_SCOPE_SHARDS
}

impl Default for FareRefConfig {
    fn default() -> Self {
        Self {
            classes: default_classes(),
            scope_shards: DEFAULT_SCOPE_SHARDS,
        }
    }
}

impl FareRefConfig {
    /// Parse and validate a TOML document.
    ///
    /// ```toml
    /// scope_shards = 4
    ///
    /// [[classes]]
    /// name = "fare_rules"
    /// max_size = 50000
    /// bucket_granularity = { unit = "months", count = 3 }
    /// storage = "compressed"
    /// ```
    pub fn from_toml_str(source: &str) -> FareRefResult<Self> {
        let config: Self = toml::from_str(source).map_err(|e| ConfigError::Parse {
            reason: e.to_string(),
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Apply environment overrides on top of `self`.
    ///
    /// Environment variables:
    /// - `FAREREF_SCOPE_SHARDS`: shard count for new scopes
    /// - `FAREREF_DEFAULT_MAX_SIZE`: `max_size` of the `default` class
    pub fn with_env_overrides(mut self) -> Self {
        if let Some(shards) = std::env::var("FAREREF_SCOPE_SHARDS")
            .ok()
            .and_then(|s| s.parse().ok())
        {
            self.scope_shards = shards;
        }
        if let Some(max_size) = std::env::var("FAREREF_DEFAULT_MAX_SIZE")
            .ok()
            .and_then(|s| s.parse().ok())
        {
            if let Some(class) = self
                .classes
                .iter_mut()
                .find(|c| c.name == DEFAULT_CACHE_CLASS)
            {
                class.max_size = max_size;
            }
        }
        self
    }

    /// Defaults with environment overrides applied.
    pub fn from_env() -> Self {
        Self::default().with_env_overrides()
    }

    /// Look up a cache class by name.
    pub fn class(&self, name: &str) -> FareRefResult<&CacheClassConfig> {
        self.classes
            .iter()
            .find(|c| c.name == name)
            .ok_or_else(|| {
                FareRefError::Config(ConfigError::UnknownCacheClass {
                    name: name.to_string(),
                })
            })
    }

    /// Validate the configuration.
    ///
    /// Validates:
    /// - scope_shards in 1..=64
    /// - class names are non-empty and unique
    /// - bucket granularity counts are positive
    pub fn validate(&self) -> FareRefResult<()> {
        if self.scope_shards == 0 || self.scope_shards > MAX_SCOPE_SHARDS {
            return Err(FareRefError::Config(ConfigError::InvalidValue {
                field: "scope_shards".to_string(),
                value: self.scope_shards.to_string(),
                reason: format!("scope_shards must be between 1 and {}", MAX_SCOPE_SHARDS),
            }));
        }

        let mut seen = HashSet::new();
        for class in &self.classes {
            if class.name.trim().is_empty() {
                return Err(FareRefError::Config(ConfigError::MissingRequired {
                    field: "classes.name".to_string(),
                }));
            }
            if !seen.insert(class.name.as_str()) {
                return Err(FareRefError::Config(ConfigError::InvalidValue {
                    field: "classes.name".to_string(),
                    value: class.name.clone(),
                    reason: "cache class names must be unique".to_string(),
                }));
            }
            if class.bucket_granularity.count() == 0 {
                return Err(FareRefError::Config(ConfigError::InvalidValue {
                    field: format!("classes.{}.bucket_granularity", class.name),
                    value: class.bucket_granularity.to_string(),
                    reason: "bucket granularity count must be positive".to_string(),
                }));
            }
        }

        Ok(())
    }
}


#[cfg(test)]
mod prop_tests {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        /// Any shard count above the maximum is rejected.
        #[test]
        fn prop_config_rejects_too_many_shards(shards in (MAX_SCOPE_SHARDS + 1)..10_000usize) {
            let config = FareRefConfig { scope_shards: shards, ..Default::default() };
            prop_assert!(config.validate().is_err());
        }

        /// Any shard count in range is accepted.
        #[test]
        fn prop_config_accepts_shards_in_range(shards in 1..=MAX_SCOPE_SHARDS) {
            let config = FareRefConfig { scope_shards: shards, ..Default::default() };
            prop_assert!(config.validate().is_ok());
        }
    }
}
