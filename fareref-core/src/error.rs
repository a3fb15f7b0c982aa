//! Error types for fareref operations

use thiserror::Error;
use uuid::Uuid;

/// Cache population errors raised by (or on behalf of) a loader.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum LoaderError {
    #[error("Load failed for cache {cache} key {key}: {reason}")]
    Failed {
        cache: String,
        key: String,
        reason: String,
    },

    #[error("Loader panicked for cache {cache} key {key}")]
    Panicked { cache: String, key: String },
}

impl LoaderError {
    /// Convenience constructor for loaders reporting a backing-store failure.
    pub fn failed(
        cache: impl Into<String>,
        key: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        LoaderError::Failed {
            cache: cache.into(),
            key: key.into(),
            reason: reason.into(),
        }
    }
}

/// Compressed cache value encode/decode errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CodecError {
    #[error("Serialization failed: {reason}")]
    Serialize { reason: String },

    #[error("Deserialization failed: {reason}")]
    Deserialize { reason: String },

    #[error("Decompression failed: {reason}")]
    Decompress { reason: String },

    #[error("Bad frame magic: {found:02x?}")]
    BadMagic { found: Vec<u8> },

    #[error("Unsupported frame version {version}")]
    UnsupportedVersion { version: u8 },

    #[error("Frame truncated: need at least {needed} bytes, got {got}")]
    Truncated { needed: usize, got: usize },

    #[error("Checksum mismatch on compressed block")]
    ChecksumMismatch,

    #[error("Frame declares {declared} decompressed bytes, limit is {limit}")]
    Oversized { declared: usize, limit: usize },
}

/// Deferred-ownership scope contract violations.
///
/// These are programming errors in the caller, reported as errors so they can
/// never turn into a double free or a silently dropped registration.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ScopeError {
    #[error("Scope {scope_id} used after release")]
    UseAfterRelease { scope_id: Uuid },

    #[error("Scope {scope_id} released twice")]
    DoubleRelease { scope_id: Uuid },

    #[error("Shard {shard} out of range for scope with {shards} shards")]
    ShardOutOfRange { shard: usize, shards: usize },
}

/// Configuration errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Missing required configuration field: {field}")]
    MissingRequired { field: String },

    #[error("Invalid value for {field}: {value} - {reason}")]
    InvalidValue {
        field: String,
        value: String,
        reason: String,
    },

    #[error("Unknown cache class: {name}")]
    UnknownCacheClass { name: String },

    #[error("Failed to parse configuration: {reason}")]
    Parse { reason: String },
}

/// Master error type for all fareref errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum FareRefError {
    #[error("Loader error: {0}")]
    Loader(#[from] LoaderError),

    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("Scope error: {0}")]
    Scope(#[from] ScopeError),

    #[error("Config error: {0}")]
    Config(#[from] ConfigError),
}

/// Result type alias for fareref operations.
pub type FareRefResult<T> = Result<T, FareRefError>;

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_loader_error_display() {
        let err = LoaderError::failed("fare_rules", "AA/LO", "connection reset");
        let msg = format!("{}", err);
        assert!(msg.contains("fare_rules"));
        assert!(msg.contains("AA/LO"));
        assert!(msg.contains("connection reset"));
    }

    #[test]
    fn test_scope_error_display() {
        let err = ScopeError::ShardOutOfRange {
            shard: 9,
            shards: 8,
        };
        assert_eq!(
            format!("{}", err),
            "Shard 9 out of range for scope with 8 shards"
        );
    }

    #[test]
    fn test_codec_error_bad_magic_display() {
        let err = CodecError::BadMagic {
            found: vec![0xde, 0xad],
        };
        assert!(format!("{}", err).contains("de"));
    }

    #[test]
    fn test_master_error_from_conversions() {
        let err: FareRefError = CodecError::ChecksumMismatch.into();
        assert!(matches!(err, FareRefError::Codec(CodecError::ChecksumMismatch)));

        let err: FareRefError = ScopeError::DoubleRelease {
            scope_id: Uuid::nil(),
        }
        .into();
        assert!(format!("{}", err).starts_with("Scope error:"));

        let err: FareRefError = ConfigError::UnknownCacheClass {
            name: "routing".into(),
        }
        .into();
        assert!(matches!(err, FareRefError::Config(_)));
    }

    #[test]
    fn test_errors_are_cloneable_for_waiters() {
        let err: FareRefError = LoaderError::Panicked {
            cache: "c".into(),
            key: "k".into(),
        }
        .into();
        let copy = err.clone();
        assert_eq!(err, copy);
    }
}
