//! On-disk table image format.
//!
//! One file per table, rewritten whole on every flush:
//!
//! ```text
//! offset  size  field
//! 0       4     magic "FTBL"
//! 4       2     format version (u16 LE)
//! 6       2     schema version (u16 LE)
//! 8       1     compression byte
//! 9       8     primary sequence (i64 LE)
//! 17      8     secondary sequence (i64 LE)
//! 25      4     row count (u32 LE)
//! 29      4     payload length (u32 LE)
//! 33      32    SHA-256 of the payload
//! 65      n     payload: optionally compressed CBOR row vector
//! ```
//!
//! The checksum covers the payload as stored (after compression), so a
//! torn or bit-flipped file is rejected before any deserialization.

use crate::error::{DbError, DbResult};
use crate::row::Row;
use flatdb_storage::{compress, decompress, CompressionType};
use sha2::{Digest, Sha256};

/// Magic bytes at the start of every table file.
pub const MAGIC: [u8; 4] = *b"FTBL";

/// Current format version written by this build.
pub const FORMAT_VERSION: u16 = 1;

/// Oldest format version this build can read.
pub const MIN_FORMAT_VERSION: u16 = 1;

const HEADER_LEN: usize = 65;
const CHECKSUM_LEN: usize = 32;

/// The decoded contents of one table file.
#[derive(Debug, Clone)]
pub struct TableImage<T> {
    /// Schema (seed) version the table was last written at.
    pub schema_version: u16,
    /// Compression the payload was stored with.
    pub compression: CompressionType,
    /// Primary id sequence: the highest value handed out so far.
    pub primary_sequence: i64,
    /// Secondary sequence, application-defined.
    pub secondary_sequence: i64,
    /// All rows, in id order.
    pub rows: Vec<T>,
}

impl<T: Row> TableImage<T> {
    /// Encodes the image into the on-disk byte layout.
    ///
    /// # Errors
    ///
    /// Fails with a codec error if row serialization fails, or a storage
    /// error if compression fails.
    pub fn encode(&self) -> DbResult<Vec<u8>> {
        let mut raw = Vec::new();
        ciborium::ser::into_writer(&self.rows, &mut raw)
            .map_err(|e| DbError::codec(format!("row serialization failed: {e}")))?;

        let payload = compress(self.compression, &raw)?;
        let payload_len = u32::try_from(payload.len())
            .map_err(|_| DbError::codec("payload exceeds 4 GiB"))?;
        let row_count = u32::try_from(self.rows.len())
            .map_err(|_| DbError::codec("row count exceeds u32"))?;

        let checksum = Sha256::digest(&payload);

        let mut buf = Vec::with_capacity(HEADER_LEN + payload.len());
        buf.extend_from_slice(&MAGIC);
        buf.extend_from_slice(&FORMAT_VERSION.to_le_bytes());
        buf.extend_from_slice(&self.schema_version.to_le_bytes());
        buf.push(self.compression.as_byte());
        buf.extend_from_slice(&self.primary_sequence.to_le_bytes());
        buf.extend_from_slice(&self.secondary_sequence.to_le_bytes());
        buf.extend_from_slice(&row_count.to_le_bytes());
        buf.extend_from_slice(&payload_len.to_le_bytes());
        buf.extend_from_slice(&checksum);
        buf.extend_from_slice(&payload);
        Ok(buf)
    }

    /// Decodes a table file.
    ///
    /// # Errors
    ///
    /// - [`DbError::InvalidFormat`] for bad magic, truncation, checksum
    ///   mismatch, or an unknown compression byte.
    /// - [`DbError::UnsupportedVersion`] when the format version is
    ///   outside `MIN_FORMAT_VERSION..=FORMAT_VERSION`.
    /// - [`DbError::Codec`] when the payload fails to deserialize.
    pub fn decode(bytes: &[u8]) -> DbResult<Self> {
        if bytes.len() < HEADER_LEN {
            return Err(DbError::invalid_format(format!(
                "table image truncated: {} bytes, header needs {HEADER_LEN}",
                bytes.len()
            )));
        }
        if bytes[0..4] != MAGIC {
            return Err(DbError::invalid_format("bad magic bytes"));
        }

        let version = u16::from_le_bytes([bytes[4], bytes[5]]);
        if !(MIN_FORMAT_VERSION..=FORMAT_VERSION).contains(&version) {
            return Err(DbError::UnsupportedVersion {
                found: version,
                minimum: MIN_FORMAT_VERSION,
                current: FORMAT_VERSION,
            });
        }

        let schema_version = u16::from_le_bytes([bytes[6], bytes[7]]);
        let compression = CompressionType::from_byte(bytes[8])
            .ok_or_else(|| DbError::invalid_format(format!("unknown compression byte {}", bytes[8])))?;

        let mut i64_buf = [0u8; 8];
        i64_buf.copy_from_slice(&bytes[9..17]);
        let primary_sequence = i64::from_le_bytes(i64_buf);
        i64_buf.copy_from_slice(&bytes[17..25]);
        let secondary_sequence = i64::from_le_bytes(i64_buf);

        let row_count = u32::from_le_bytes([bytes[25], bytes[26], bytes[27], bytes[28]]) as usize;
        let payload_len = u32::from_le_bytes([bytes[29], bytes[30], bytes[31], bytes[32]]) as usize;

        let payload_start = HEADER_LEN;
        let payload_end = payload_start
            .checked_add(payload_len)
            .ok_or_else(|| DbError::invalid_format("payload length overflow"))?;
        if bytes.len() < payload_end {
            return Err(DbError::invalid_format(format!(
                "table image truncated: payload needs {payload_len} bytes, {} present",
                bytes.len() - payload_start
            )));
        }
        let payload = &bytes[payload_start..payload_end];

        let checksum: [u8; CHECKSUM_LEN] = bytes[33..65]
            .try_into()
            .map_err(|_| DbError::invalid_format("checksum slice"))?;
        let actual: [u8; CHECKSUM_LEN] = Sha256::digest(payload).into();
        if checksum != actual {
            return Err(DbError::invalid_format("payload checksum mismatch"));
        }

        let raw = decompress(compression, payload)?;
        let rows: Vec<T> = ciborium::de::from_reader(raw.as_slice())
            .map_err(|e| DbError::codec(format!("row deserialization failed: {e}")))?;

        if rows.len() != row_count {
            return Err(DbError::invalid_format(format!(
                "header declares {row_count} rows, payload holds {}",
                rows.len()
            )));
        }

        Ok(Self {
            schema_version,
            compression,
            primary_sequence,
            secondary_sequence,
            rows,
        })
    }
}
