//! Row identifier and the row trait.

use crate::error::{DbError, DbResult};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;

/// Primary key of a row.
///
/// Row ids are 64-bit signed integers that are:
/// - Unique within a table
/// - Assigned monotonically from the table's primary sequence
/// - Immutable once the row has been persisted
///
/// A value of `0` means "not yet assigned"; live ids start at 1. The
/// sealed flag is set when the engine persists the row, and any id
/// loaded from disk is sealed on deserialization.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct RowId {
    value: i64,
    sealed: bool,
}

impl RowId {
    /// An unassigned row id.
    pub const UNSET: Self = Self {
        value: 0,
        sealed: false,
    };

    /// Creates an unassigned row id.
    #[must_use]
    pub const fn new() -> Self {
        Self::UNSET
    }

    /// Creates a sealed row id with the given value.
    ///
    /// Used when reconstructing rows that are already persisted.
    #[must_use]
    pub const fn sealed(value: i64) -> Self {
        Self {
            value,
            sealed: true,
        }
    }

    /// Returns the id value (0 if unassigned).
    #[inline]
    #[must_use]
    pub const fn value(&self) -> i64 {
        self.value
    }

    /// Returns true if an id has been assigned.
    #[inline]
    #[must_use]
    pub const fn is_set(&self) -> bool {
        self.value != 0
    }

    /// Returns true if the id can no longer be changed.
    #[inline]
    #[must_use]
    pub const fn is_sealed(&self) -> bool {
        self.sealed
    }

    /// Assigns the id value.
    ///
    /// # Errors
    ///
    /// Fails with a validation error if the id is sealed.
    pub fn set(&mut self, value: i64) -> DbResult<()> {
        if self.sealed {
            return Err(DbError::validation(format!(
                "row id {} is immutable once persisted",
                self.value
            )));
        }
        self.value = value;
        Ok(())
    }

    /// Marks the id as immutable. Called by the engine on persist.
    pub fn seal(&mut self) {
        self.sealed = true;
    }
}

impl fmt::Debug for RowId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.sealed {
            write!(f, "RowId({})", self.value)
        } else {
            write!(f, "RowId({}, unsealed)", self.value)
        }
    }
}

impl fmt::Display for RowId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.value)
    }
}

impl From<RowId> for i64 {
    fn from(id: RowId) -> Self {
        id.value
    }
}

// On the wire a RowId is a bare i64. Any non-zero id read back from
// storage is sealed: persisted ids are immutable.
impl Serialize for RowId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_i64(self.value)
    }
}

impl<'de> Deserialize<'de> for RowId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = i64::deserialize(deserializer)?;
        Ok(if value == 0 {
            Self::UNSET
        } else {
            Self::sealed(value)
        })
    }
}

/// Trait for types that can be stored as rows in a FlatDB table.
///
/// Rows are plain serde types carrying a [`RowId`]. The engine assigns
/// ids from the table's primary sequence and seals them on persist.
///
/// # Example
///
/// ```rust,ignore
/// use flatdb_core::{Row, RowId};
/// use serde::{Deserialize, Serialize};
///
/// #[derive(Debug, Clone, Serialize, Deserialize)]
/// struct User {
///     id: RowId,
///     name: String,
///     email: String,
/// }
///
/// impl Row for User {
///     fn row_id(&self) -> &RowId {
///         &self.id
///     }
///
///     fn row_id_mut(&mut self) -> &mut RowId {
///         &mut self.id
///     }
/// }
/// ```
pub trait Row: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {
    /// Returns the row's identifier.
    fn row_id(&self) -> &RowId;

    /// Returns a mutable reference to the row's identifier.
    fn row_id_mut(&mut self) -> &mut RowId;

    /// Returns the id value (0 if unassigned).
    fn id(&self) -> i64 {
        self.row_id().value()
    }

    /// Returns true if the row has an assigned id.
    fn has_id(&self) -> bool {
        self.row_id().is_set()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn new_is_unset() {
        let id = RowId::new();
        assert!(!id.is_set());
        assert!(!id.is_sealed());
        assert_eq!(id.value(), 0);
    }

    #[test]
    fn set_then_seal() {
        let mut id = RowId::new();
        id.set(17).unwrap();
        assert_eq!(id.value(), 17);
        assert!(!id.is_sealed());

        id.seal();
        assert!(id.is_sealed());
    }

    #[test]
    fn sealed_id_rejects_reassignment() {
        let mut id = RowId::sealed(5);
        let result = id.set(6);
        assert!(matches!(result, Err(DbError::Validation { .. })));
        assert_eq!(id.value(), 5);
    }

    #[test]
    fn unsealed_id_can_be_reassigned() {
        let mut id = RowId::new();
        id.set(1).unwrap();
        id.set(2).unwrap();
        assert_eq!(id.value(), 2);
    }

    #[test]
    fn serde_as_bare_integer() {
        let id = RowId::sealed(42);
        let mut buf = Vec::new();
        ciborium::ser::into_writer(&id, &mut buf).unwrap();

        let raw: i64 = ciborium::de::from_reader(buf.as_slice()).unwrap();
        assert_eq!(raw, 42);
    }

    #[test]
    fn deserialized_id_is_sealed() {
        let mut buf = Vec::new();
        ciborium::ser::into_writer(&7i64, &mut buf).unwrap();

        let id: RowId = ciborium::de::from_reader(buf.as_slice()).unwrap();
        assert_eq!(id.value(), 7);
        assert!(id.is_sealed());
    }

    #[test]
    fn deserialized_zero_stays_unset() {
        let mut buf = Vec::new();
        ciborium::ser::into_writer(&0i64, &mut buf).unwrap();

        let id: RowId = ciborium::de::from_reader(buf.as_slice()).unwrap();
        assert!(!id.is_set());
        assert!(!id.is_sealed());
    }

    proptest! {
        #[test]
        fn round_trip_preserves_value(value in 1i64..i64::MAX) {
            let id = RowId::sealed(value);
            let mut buf = Vec::new();
            ciborium::ser::into_writer(&id, &mut buf).unwrap();
            let back: RowId = ciborium::de::from_reader(buf.as_slice()).unwrap();
            prop_assert_eq!(back.value(), value);
            prop_assert!(back.is_sealed());
        }
    }
}
