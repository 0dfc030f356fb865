//! Error types for FlatDB core.

use std::io;
use thiserror::Error;

/// Result type for core operations.
pub type DbResult<T> = Result<T, DbError>;

/// Errors that can occur in FlatDB core operations.
///
/// Trigger vetoes are not errors; a vetoed row is simply absent from the
/// persisted batch. Every variant here is a definite failure that the
/// caller can match on.
#[derive(Debug, Error)]
pub enum DbError {
    /// Storage backend error.
    #[error("storage error: {0}")]
    Storage(#[from] flatdb_storage::StorageError),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Row serialization or deserialization failed.
    #[error("codec error: {message}")]
    Codec {
        /// Description of the codec failure.
        message: String,
    },

    /// Invalid argument or state: empty batch, malformed table name,
    /// out-of-range sequence increment, unique index violation.
    #[error("validation error: {message}")]
    Validation {
        /// Description of what was invalid.
        message: String,
    },

    /// A definite row was required but does not exist.
    #[error("row {id} not found in table {table}")]
    NotFound {
        /// Table that was searched.
        table: String,
        /// The id that was not found.
        id: i64,
    },

    /// An insert/update referenced an id absent from the target table.
    #[error(
        "foreign key violation: {table}.{property} = {value} does not exist in table {target}"
    )]
    ForeignKeyMissing {
        /// Table holding the foreign key.
        table: String,
        /// Property holding the foreign key.
        property: String,
        /// The missing value.
        value: i64,
        /// The table the value should exist in.
        target: String,
    },

    /// A delete/truncate was blocked by an inbound reference.
    #[error(
        "foreign key violation: {table} id {value} is still referenced by \
         {holder_table}.{holder_property}"
    )]
    ForeignKeyInUse {
        /// Table the delete was attempted on.
        table: String,
        /// The referenced id.
        value: i64,
        /// Table holding the inbound reference.
        holder_table: String,
        /// Property holding the inbound reference.
        holder_property: String,
    },

    /// A table was registered twice under the same name.
    #[error("table already registered: {name}")]
    DuplicateTable {
        /// Name of the table.
        name: String,
    },

    /// A table lookup used a name that was never registered, or a
    /// different row type than the one it was registered with.
    #[error("unknown table: {name}")]
    UnknownTable {
        /// Name of the table.
        name: String,
    },

    /// The on-disk image is corrupt or unreadable.
    #[error("invalid table format: {message}")]
    InvalidFormat {
        /// Description of the format issue.
        message: String,
    },

    /// The on-disk format version is outside the supported range.
    #[error(
        "unsupported format version {found}: this build supports \
         versions {minimum} through {current}"
    )]
    UnsupportedVersion {
        /// Version found on disk.
        found: u16,
        /// Minimum supported version.
        minimum: u16,
        /// Current format version.
        current: u16,
    },

    /// The table lock was not acquired within the configured timeout.
    #[error("lock timeout on table {table}")]
    LockTimeout {
        /// Name of the table.
        table: String,
    },

    /// Another process holds the database directory lock.
    #[error("database locked: another process has exclusive access")]
    DatabaseLocked,

    /// The database has been closed.
    #[error("database is closed")]
    DatabaseClosed,

    /// Index and row storage disagree. The table refuses further writes.
    #[error("table {table} is inconsistent: {message}")]
    Inconsistent {
        /// Name of the table.
        table: String,
        /// Description of the disagreement.
        message: String,
    },
}

impl DbError {
    /// Creates a codec error.
    pub fn codec(message: impl Into<String>) -> Self {
        Self::Codec {
            message: message.into(),
        }
    }

    /// Creates a validation error.
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation {
            message: message.into(),
        }
    }

    /// Creates a not-found error.
    pub fn not_found(table: impl Into<String>, id: i64) -> Self {
        Self::NotFound {
            table: table.into(),
            id,
        }
    }

    /// Creates an unknown-table error.
    pub fn unknown_table(name: impl Into<String>) -> Self {
        Self::UnknownTable { name: name.into() }
    }

    /// Creates an invalid format error.
    pub fn invalid_format(message: impl Into<String>) -> Self {
        Self::InvalidFormat {
            message: message.into(),
        }
    }

    /// Creates an inconsistency error.
    pub fn inconsistent(table: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Inconsistent {
            table: table.into(),
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_messages() {
        let err = DbError::not_found("users", 42);
        assert_eq!(err.to_string(), "row 42 not found in table users");

        let err = DbError::ForeignKeyInUse {
            table: "users".into(),
            value: 7,
            holder_table: "orders".into(),
            holder_property: "user_id".into(),
        };
        assert!(err.to_string().contains("orders.user_id"));
    }

    #[test]
    fn variants_are_distinguishable() {
        let not_found = DbError::not_found("t", 1);
        let fk = DbError::ForeignKeyMissing {
            table: "t".into(),
            property: "p".into(),
            value: 1,
            target: "u".into(),
        };
        assert!(matches!(not_found, DbError::NotFound { .. }));
        assert!(matches!(fk, DbError::ForeignKeyMissing { .. }));
    }
}
