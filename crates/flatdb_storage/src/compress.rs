//! Block compression for table images.

use crate::error::{StorageError, StorageResult};
use std::io::{Read, Write};

/// Brotli quality (0-11). 5 trades well between ratio and write latency.
const BROTLI_QUALITY: u32 = 5;
/// Brotli window size (log2).
const BROTLI_LGWIN: u32 = 22;

/// Compression applied to a table's serialized payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CompressionType {
    /// Payload is stored as-is.
    #[default]
    None,
    /// Payload is Brotli-compressed.
    Brotli,
}

impl CompressionType {
    /// Converts the compression type to its on-disk byte tag.
    #[must_use]
    pub const fn as_byte(self) -> u8 {
        match self {
            Self::None => 0,
            Self::Brotli => 1,
        }
    }

    /// Converts an on-disk byte tag to a compression type.
    #[must_use]
    pub fn from_byte(b: u8) -> Option<Self> {
        match b {
            0 => Some(Self::None),
            1 => Some(Self::Brotli),
            _ => None,
        }
    }
}

/// Compresses `data` according to `compression`.
///
/// `CompressionType::None` returns the input unchanged.
///
/// # Errors
///
/// Returns an error if the compressor fails.
pub fn compress(compression: CompressionType, data: &[u8]) -> StorageResult<Vec<u8>> {
    match compression {
        CompressionType::None => Ok(data.to_vec()),
        CompressionType::Brotli => {
            let mut out = Vec::new();
            {
                let mut writer =
                    brotli::CompressorWriter::new(&mut out, 4096, BROTLI_QUALITY, BROTLI_LGWIN);
                writer.write_all(data)?;
                writer.flush()?;
            }
            Ok(out)
        }
    }
}

/// Decompresses `data` according to `compression`.
///
/// # Errors
///
/// Returns `StorageError::Corrupted` if the payload is not a valid
/// stream for the declared compression type.
pub fn decompress(compression: CompressionType, data: &[u8]) -> StorageResult<Vec<u8>> {
    match compression {
        CompressionType::None => Ok(data.to_vec()),
        CompressionType::Brotli => {
            let mut out = Vec::new();
            let mut reader = brotli::Decompressor::new(data, 4096);
            reader
                .read_to_end(&mut out)
                .map_err(|e| StorageError::Corrupted(format!("brotli payload: {e}")))?;
            Ok(out)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn none_is_identity() {
        let data = b"uncompressed payload".to_vec();
        let packed = compress(CompressionType::None, &data).unwrap();
        assert_eq!(packed, data);
        let unpacked = decompress(CompressionType::None, &packed).unwrap();
        assert_eq!(unpacked, data);
    }

    #[test]
    fn brotli_round_trip() {
        let data = b"some payload that will be compressed".repeat(10);
        let packed = compress(CompressionType::Brotli, &data).unwrap();
        let unpacked = decompress(CompressionType::Brotli, &packed).unwrap();
        assert_eq!(unpacked, data);
    }

    #[test]
    fn brotli_shrinks_repetitive_data() {
        let data = b"abcdefgh".repeat(1000);
        let packed = compress(CompressionType::Brotli, &data).unwrap();
        assert!(packed.len() < data.len());
    }

    #[test]
    fn brotli_rejects_garbage() {
        let result = decompress(CompressionType::Brotli, b"definitely not brotli");
        assert!(matches!(result, Err(StorageError::Corrupted(_))));
    }

    #[test]
    fn byte_tags_round_trip() {
        for ty in [CompressionType::None, CompressionType::Brotli] {
            assert_eq!(CompressionType::from_byte(ty.as_byte()), Some(ty));
        }
        assert_eq!(CompressionType::from_byte(99), None);
    }

    #[test]
    fn empty_payload() {
        for ty in [CompressionType::None, CompressionType::Brotli] {
            let packed = compress(ty, b"").unwrap();
            let unpacked = decompress(ty, &packed).unwrap();
            assert!(unpacked.is_empty());
        }
    }

    mod props {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn brotli_round_trips_arbitrary_bytes(
                data in proptest::collection::vec(any::<u8>(), 0..4096)
            ) {
                let packed = compress(CompressionType::Brotli, &data).unwrap();
                let unpacked = decompress(CompressionType::Brotli, &packed).unwrap();
                prop_assert_eq!(unpacked, data);
            }
        }
    }
}
