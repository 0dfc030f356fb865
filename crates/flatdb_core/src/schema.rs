//! Table definition and per-table policies.

use crate::error::{DbError, DbResult};
use flatdb_storage::CompressionType;
use std::time::Duration;

/// Maximum length of a table name.
pub const MAX_TABLE_NAME_LEN: usize = 128;

/// Policy governing whether a table's rows are held fully in memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CachingStrategy {
    /// Rows are read from the locked table state on every select.
    #[default]
    None,
    /// A full-table snapshot is kept in memory with sliding expiration.
    Memory,
}

/// Policy governing when in-memory changes are flushed to disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WriteStrategy {
    /// Every mutation is persisted before the call returns.
    #[default]
    Forced,
    /// Mutations mark the table dirty; `force_write` (or close) persists.
    Lazy,
}

/// Definition of a table: name, schema version, and policies.
///
/// # Example
///
/// ```rust,ignore
/// use flatdb_core::{CachingStrategy, TableDef, WriteStrategy};
/// use flatdb_storage::CompressionType;
///
/// let def = TableDef::new("users")?
///     .compression(CompressionType::Brotli)
///     .caching(CachingStrategy::Memory)
///     .write_strategy(WriteStrategy::Lazy)
///     .version(2);
/// ```
#[derive(Debug, Clone)]
pub struct TableDef {
    /// Table name; also the on-disk file stem.
    pub name: String,
    /// Compression applied to the serialized row payload.
    pub compression: CompressionType,
    /// Whether selects are served from a memory-resident snapshot.
    pub caching: CachingStrategy,
    /// When mutations reach disk.
    pub write_strategy: WriteStrategy,
    /// Sliding expiration for the memory cache.
    pub cache_timeout: Duration,
    /// How long a mutation waits for the table lock before failing.
    pub lock_timeout: Duration,
    /// Schema version; drives incremental seed data.
    pub version: u16,
}

impl TableDef {
    /// Creates a definition with default policies.
    ///
    /// # Errors
    ///
    /// Fails with a validation error if the name is empty, too long, or
    /// contains characters that are not file-system safe.
    pub fn new(name: impl Into<String>) -> DbResult<Self> {
        let name = name.into();
        validate_table_name(&name)?;
        Ok(Self {
            name,
            compression: CompressionType::None,
            caching: CachingStrategy::None,
            write_strategy: WriteStrategy::Forced,
            cache_timeout: Duration::from_secs(120),
            lock_timeout: Duration::from_secs(30),
            version: 1,
        })
    }

    /// Sets the payload compression.
    #[must_use]
    pub const fn compression(mut self, compression: CompressionType) -> Self {
        self.compression = compression;
        self
    }

    /// Sets the caching strategy.
    #[must_use]
    pub const fn caching(mut self, caching: CachingStrategy) -> Self {
        self.caching = caching;
        self
    }

    /// Sets the write strategy.
    #[must_use]
    pub const fn write_strategy(mut self, strategy: WriteStrategy) -> Self {
        self.write_strategy = strategy;
        self
    }

    /// Sets the sliding cache expiration.
    #[must_use]
    pub const fn cache_timeout(mut self, timeout: Duration) -> Self {
        self.cache_timeout = timeout;
        self
    }

    /// Sets the table lock acquisition timeout.
    #[must_use]
    pub const fn lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = timeout;
        self
    }

    /// Sets the schema version (minimum 1).
    #[must_use]
    pub const fn version(mut self, version: u16) -> Self {
        self.version = version;
        self
    }
}

/// Validates that a table name is usable as a file name.
///
/// # Errors
///
/// Fails with a validation error for an empty name, a name longer than
/// [`MAX_TABLE_NAME_LEN`], or any character outside `[A-Za-z0-9_-]`.
pub fn validate_table_name(name: &str) -> DbResult<()> {
    if name.is_empty() {
        return Err(DbError::validation("table name must not be empty"));
    }
    if name.len() > MAX_TABLE_NAME_LEN {
        return Err(DbError::validation(format!(
            "table name exceeds {MAX_TABLE_NAME_LEN} characters"
        )));
    }
    if let Some(c) = name
        .chars()
        .find(|c| !c.is_ascii_alphanumeric() && *c != '_' && *c != '-')
    {
        return Err(DbError::validation(format!(
            "table name contains invalid character {c:?}"
        )));
    }
    Ok(())
}
