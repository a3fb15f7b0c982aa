//! Compressed representation of cache values.
//!
//! Cache classes configured with [`StorageMode::Compressed`] keep entries as
//! framed byte blocks instead of live values, and decode a fresh value on
//! every read.
//!
//! # Frame layout
//!
//! ```text
//! +-------+---------+---------------------+------------------------------+
//! | FRZ1  | version | sha256(block)[..8]  | lz4 block (size-prepended)   |
//! | 4 B   | 1 B     | 8 B                 | serde_json bytes, compressed |
//! +-------+---------+---------------------+------------------------------+
//! ```
//!
//! The checksum covers the compressed block, so corruption is reported as
//! [`CodecError::ChecksumMismatch`] before any decompression is attempted.
//! The declared decompressed size is checked against [`MAX_DECODED_LEN`]
//! before the output buffer is allocated.
//!
//! [`StorageMode::Compressed`]: fareref_core::StorageMode::Compressed

use fareref_core::{CodecError, FareRefResult};
use serde::{de::DeserializeOwned, Serialize};
use sha2::{Digest, Sha256};

/// Magic bytes opening every frame.
pub const FRAME_MAGIC: [u8; 4] = *b"FRZ1";

/// Current frame format version.
pub const FRAME_VERSION: u8 = 1;

/// Largest decompressed size a frame may declare.
pub const MAX_DECODED_LEN: usize = 64 * 1024 * 1024;

const CHECKSUM_LEN: usize = 8;
const HEADER_LEN: usize = FRAME_MAGIC.len() + 1 + CHECKSUM_LEN;
const SIZE_PREFIX_LEN: usize = 4;

/// Encodes and decodes cache values to bytes.
///
/// Caches hold codecs as `Arc<dyn ValueCodec<V>>`, so alternative formats can
/// be plugged in without changing the cache type.
pub trait ValueCodec<V>: Send + Sync {
    fn encode(&self, value: &V) -> FareRefResult<Vec<u8>>;

    fn decode(&self, bytes: &[u8]) -> FareRefResult<V>;
}

/// Size accounting for one encode.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CompressionStats {
    /// Serialized size before compression.
    pub original_bytes: usize,
    /// Frame size including the header.
    pub compressed_bytes: usize,
}

impl CompressionStats {
    /// Frame size relative to the serialized size (lower is better).
    pub fn ratio(&self) -> f64 {
        if self.original_bytes == 0 {
            1.0
        } else {
            self.compressed_bytes as f64 / self.original_bytes as f64
        }
    }
}

/// JSON + LZ4 codec with a checksummed frame.
#[derive(Debug, Clone, Copy, Default)]
pub struct CompressedValueCodec;

impl CompressedValueCodec {
    pub fn new() -> Self {
        Self
    }

    /// Serialize and compress `value` into a frame.
    pub fn compress<V: Serialize>(value: &V) -> FareRefResult<Vec<u8>> {
        Self::compress_with_stats(value).map(|(frame, _)| frame)
    }

    /// Same as [`compress`](Self::compress), also reporting sizes.
    pub fn compress_with_stats<V: Serialize>(
        value: &V,
    ) -> FareRefResult<(Vec<u8>, CompressionStats)> {
        let json = serde_json::to_vec(value).map_err(|e| CodecError::Serialize {
            reason: e.to_string(),
        })?;
        let block = lz4_flex::compress_prepend_size(&json);

        let mut frame = Vec::with_capacity(HEADER_LEN + block.len());
        frame.extend_from_slice(&FRAME_MAGIC);
        frame.push(FRAME_VERSION);
        frame.extend_from_slice(&checksum(&block));
        frame.extend_from_slice(&block);

        let stats = CompressionStats {
            original_bytes: json.len(),
            compressed_bytes: frame.len(),
        };
        Ok((frame, stats))
    }

    /// Validate a frame and decode its value.
    pub fn decompress<V: DeserializeOwned>(frame: &[u8]) -> FareRefResult<V> {
        if frame.len() < HEADER_LEN {
            return Err(CodecError::Truncated {
                needed: HEADER_LEN,
                got: frame.len(),
            }
            .into());
        }

        let (magic, rest) = frame.split_at(FRAME_MAGIC.len());
        if magic != FRAME_MAGIC {
            return Err(CodecError::BadMagic {
                found: magic.to_vec(),
            }
            .into());
        }

        let version = rest[0];
        if version != FRAME_VERSION {
            return Err(CodecError::UnsupportedVersion { version }.into());
        }

        let (expected, block) = rest[1..].split_at(CHECKSUM_LEN);
        if checksum(block) != expected {
            return Err(CodecError::ChecksumMismatch.into());
        }

        let declared = match block.get(..SIZE_PREFIX_LEN) {
            Some(&[a, b, c, d]) => u32::from_le_bytes([a, b, c, d]) as usize,
            _ => {
                return Err(CodecError::Truncated {
                    needed: HEADER_LEN + SIZE_PREFIX_LEN,
                    got: frame.len(),
                }
                .into())
            }
        };
        if declared > MAX_DECODED_LEN {
            return Err(CodecError::Oversized {
                declared,
                limit: MAX_DECODED_LEN,
            }
            .into());
        }

        let json = lz4_flex::decompress_size_prepended(block).map_err(|e| {
            CodecError::Decompress {
                reason: e.to_string(),
            }
        })?;
        let value = serde_json::from_slice(&json).map_err(|e| CodecError::Deserialize {
            reason: e.to_string(),
        })?;
        Ok(value)
    }
}

impl<V> ValueCodec<V> for CompressedValueCodec
where
    V: Serialize + DeserializeOwned,
{
    fn encode(&self, value: &V) -> FareRefResult<Vec<u8>> {
        Self::compress(value)
    }

    fn decode(&self, bytes: &[u8]) -> FareRefResult<V> {
        Self::decompress(bytes)
    }
}

fn checksum(block: &[u8]) -> [u8; CHECKSUM_LEN] {
    let digest = Sha256::digest(block);
    let mut out = [0u8; CHECKSUM_LEN];
    out.copy_from_slice(&digest[..CHECKSUM_LEN]);
    out
}


#[cfg(test)]
mod prop_tests {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(64))]

        #[test]
        fn prop_round_trip(entries in prop::collection::vec(("[A-Z0-9]{0,3}", any::<u32>()), 0..40)) {
            let frame = CompressedValueCodec::compress(&entries).expect("compress");
            let decoded: Vec<(String, u32)> = CompressedValueCodec::decompress(&frame).expect("decompress");
            prop_assert_eq!(decoded, entries);
        }
    }
}
