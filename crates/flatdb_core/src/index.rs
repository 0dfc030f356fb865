//! Secondary index maintenance.

use crate::error::{DbError, DbResult};
use crate::row::Row;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

/// A value extracted from a row for indexing.
///
/// Values of different variants order by variant first (integers before
/// text); within one index every entry normally uses the same variant.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum IndexValue {
    /// A 64-bit integer key.
    Integer(i64),
    /// A text key.
    Text(String),
    /// A composite key over several properties, compared element-wise.
    Composite(Vec<IndexValue>),
}

impl fmt::Display for IndexValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Integer(v) => write!(f, "{v}"),
            Self::Text(s) => write!(f, "{s}"),
            Self::Composite(parts) => {
                for (i, part) in parts.iter().enumerate() {
                    if i > 0 {
                        write!(f, "|")?;
                    }
                    write!(f, "{part}")?;
                }
                Ok(())
            }
        }
    }
}

impl From<i64> for IndexValue {
    fn from(v: i64) -> Self {
        Self::Integer(v)
    }
}

impl From<&str> for IndexValue {
    fn from(v: &str) -> Self {
        Self::Text(v.to_string())
    }
}

impl From<String> for IndexValue {
    fn from(v: String) -> Self {
        Self::Text(v)
    }
}

/// Sort direction of an index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum IndexDirection {
    /// Keys iterate smallest first.
    #[default]
    Ascending,
    /// Keys iterate largest first.
    Descending,
}

/// Describes one secondary index on a row type: a name, a direction,
/// and a key extraction function.
///
/// Descriptors are supplied at table registration time; this replaces
/// attribute-driven schema declaration with explicit configuration.
///
/// # Example
///
/// ```rust,ignore
/// let by_name = IndexDescriptor::new("Name", |w: &Widget| w.name.as_str().into());
/// let unique_sku = IndexDescriptor::new("Sku", |w: &Widget| w.sku.as_str().into())
///     .unique()
///     .direction(IndexDirection::Descending);
/// ```
pub struct IndexDescriptor<T> {
    /// Index name, unique within the table.
    pub name: String,
    /// Sort direction.
    pub direction: IndexDirection,
    /// Whether duplicate keys are rejected.
    pub unique: bool,
    /// Extracts the index key from a row.
    pub extract: Arc<dyn Fn(&T) -> IndexValue + Send + Sync>,
}

impl<T: Row> IndexDescriptor<T> {
    /// Creates an ascending, non-unique index descriptor.
    pub fn new(
        name: impl Into<String>,
        extract: impl Fn(&T) -> IndexValue + Send + Sync + 'static,
    ) -> Self {
        Self {
            name: name.into(),
            direction: IndexDirection::Ascending,
            unique: false,
            extract: Arc::new(extract),
        }
    }

    /// Sets the sort direction.
    #[must_use]
    pub fn direction(mut self, direction: IndexDirection) -> Self {
        self.direction = direction;
        self
    }

    /// Makes this a unique index.
    #[must_use]
    pub fn unique(mut self) -> Self {
        self.unique = true;
        self
    }
}

impl<T> Clone for IndexDescriptor<T> {
    fn clone(&self) -> Self {
        Self {
            name: self.name.clone(),
            direction: self.direction,
            unique: self.unique,
            extract: Arc::clone(&self.extract),
        }
    }
}

impl<T> fmt::Debug for IndexDescriptor<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IndexDescriptor")
            .field("name", &self.name)
            .field("direction", &self.direction)
            .field("unique", &self.unique)
            .finish_non_exhaustive()
    }
}

/// One maintained secondary index: an ordered key-to-ids mapping.
///
/// Entries are added and removed in lockstep with row mutations, under
/// the owning table's lock. Per key, ids keep insertion order.
#[derive(Debug, Clone)]
pub struct IndexManager {
    name: String,
    direction: IndexDirection,
    unique: bool,
    entries: BTreeMap<IndexValue, Vec<i64>>,
    count: usize,
}

impl IndexManager {
    /// Creates an empty index.
    #[must_use]
    pub fn new(name: impl Into<String>, direction: IndexDirection, unique: bool) -> Self {
        Self {
            name: name.into(),
            direction,
            unique,
            entries: BTreeMap::new(),
            count: 0,
        }
    }

    /// Returns the index name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the sort direction.
    #[must_use]
    pub fn direction(&self) -> IndexDirection {
        self.direction
    }

    /// Checks whether a key is present.
    #[must_use]
    pub fn contains(&self, value: &IndexValue) -> bool {
        self.entries.contains_key(value)
    }

    /// Returns the ids stored under a key (empty if absent).
    #[must_use]
    pub fn lookup(&self, value: &IndexValue) -> Vec<i64> {
        self.entries.get(value).cloned().unwrap_or_default()
    }

    /// Inserts a key-id entry.
    ///
    /// # Errors
    ///
    /// On a unique index, fails with a validation error if the key is
    /// already held by a different id.
    pub fn add(&mut self, value: IndexValue, id: i64) -> DbResult<()> {
        if self.unique {
            if let Some(existing) = self.entries.get(&value) {
                if !existing.contains(&id) && !existing.is_empty() {
                    return Err(DbError::validation(format!(
                        "unique index {} already contains key {value}",
                        self.name
                    )));
                }
            }
        }

        let ids = self.entries.entry(value).or_default();
        if !ids.contains(&id) {
            ids.push(id);
            self.count += 1;
        }
        Ok(())
    }

    /// Inserts a batch of key-id entries.
    ///
    /// # Errors
    ///
    /// Fails on the first unique violation; earlier entries of the
    /// batch remain applied, so callers roll back on error.
    pub fn add_batch<I>(&mut self, batch: I) -> DbResult<()>
    where
        I: IntoIterator<Item = (IndexValue, i64)>,
    {
        for (value, id) in batch {
            self.add(value, id)?;
        }
        Ok(())
    }

    /// Removes a key-id entry.
    ///
    /// Returns true if the entry was present. Removing an absent entry
    /// is a no-op, matching the engine-wide convention for missing
    /// removals.
    pub fn remove(&mut self, value: &IndexValue, id: i64) -> bool {
        if let Some(ids) = self.entries.get_mut(value) {
            if let Some(pos) = ids.iter().position(|&x| x == id) {
                ids.remove(pos);
                self.count -= 1;
                if ids.is_empty() {
                    self.entries.remove(value);
                }
                return true;
            }
        }
        false
    }

    /// Returns all ids in key order, honoring the index direction.
    #[must_use]
    pub fn ids_ordered(&self) -> Vec<i64> {
        let mut result = Vec::with_capacity(self.count);
        match self.direction {
            IndexDirection::Ascending => {
                for ids in self.entries.values() {
                    result.extend_from_slice(ids);
                }
            }
            IndexDirection::Descending => {
                for ids in self.entries.values().rev() {
                    result.extend_from_slice(ids);
                }
            }
        }
        result
    }

    /// Returns all keys in direction order.
    #[must_use]
    pub fn keys_ordered(&self) -> Vec<IndexValue> {
        match self.direction {
            IndexDirection::Ascending => self.entries.keys().cloned().collect(),
            IndexDirection::Descending => self.entries.keys().rev().cloned().collect(),
        }
    }

    /// Returns the number of entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.count
    }

    /// Returns true if the index has no entries.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// Removes all entries.
    pub fn clear(&mut self) {
        self.entries.clear();
        self.count = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn ascending() -> IndexManager {
        IndexManager::new("Name", IndexDirection::Ascending, false)
    }

    #[test]
    fn add_and_contains() {
        let mut index = ascending();
        index.add("alice".into(), 1).unwrap();

        assert!(index.contains(&"alice".into()));
        assert!(!index.contains(&"bob".into()));
        assert_eq!(index.lookup(&"alice".into()), vec![1]);
    }

    #[test]
    fn duplicate_keys_allowed_when_not_unique() {
        let mut index = ascending();
        index.add("dup".into(), 1).unwrap();
        index.add("dup".into(), 2).unwrap();

        assert_eq!(index.lookup(&"dup".into()), vec![1, 2]);
        assert_eq!(index.len(), 2);
    }

    #[test]
    fn same_entry_twice_is_idempotent() {
        let mut index = ascending();
        index.add("a".into(), 1).unwrap();
        index.add("a".into(), 1).unwrap();
        assert_eq!(index.len(), 1);
    }

    #[test]
    fn unique_index_rejects_second_id() {
        let mut index = IndexManager::new("Email", IndexDirection::Ascending, true);
        index.add("a@example.com".into(), 1).unwrap();

        let result = index.add("a@example.com".into(), 2);
        assert!(matches!(result, Err(DbError::Validation { .. })));
    }

    #[test]
    fn remove_entry() {
        let mut index = ascending();
        index.add("x".into(), 1).unwrap();

        assert!(index.remove(&"x".into(), 1));
        assert!(!index.contains(&"x".into()));
        assert!(index.is_empty());
    }

    #[test]
    fn remove_absent_is_noop() {
        let mut index = ascending();
        assert!(!index.remove(&"missing".into(), 9));
    }

    #[test]
    fn ascending_order() {
        let mut index = ascending();
        index.add("b".into(), 1).unwrap();
        index.add("a".into(), 2).unwrap();
        index.add("c".into(), 3).unwrap();

        assert_eq!(index.ids_ordered(), vec![2, 1, 3]);
        assert_eq!(
            index.keys_ordered(),
            vec!["a".into(), "b".into(), "c".into()]
        );
    }

    #[test]
    fn descending_order() {
        let mut index = IndexManager::new("Score", IndexDirection::Descending, false);
        index.add(10.into(), 1).unwrap();
        index.add(30.into(), 2).unwrap();
        index.add(20.into(), 3).unwrap();

        assert_eq!(index.ids_ordered(), vec![2, 3, 1]);
    }

    #[test]
    fn batch_add() {
        let mut index = ascending();
        index
            .add_batch(vec![("a".into(), 1), ("b".into(), 2)])
            .unwrap();
        assert_eq!(index.len(), 2);
    }

    #[test]
    fn clear_resets() {
        let mut index = ascending();
        index.add("a".into(), 1).unwrap();
        index.clear();
        assert!(index.is_empty());
        assert!(!index.contains(&"a".into()));
    }

    #[test]
    fn composite_keys_compare_elementwise() {
        let a = IndexValue::Composite(vec![1.into(), "x".into()]);
        let b = IndexValue::Composite(vec![1.into(), "y".into()]);
        let c = IndexValue::Composite(vec![2.into(), "a".into()]);
        assert!(a < b);
        assert!(b < c);
    }

    proptest! {
        #[test]
        fn ids_ordered_matches_sorted_model(keys in proptest::collection::vec(0i64..1000, 1..50)) {
            let mut index = IndexManager::new("K", IndexDirection::Ascending, false);
            for (id, key) in keys.iter().enumerate() {
                index.add((*key).into(), id as i64 + 1).unwrap();
            }

            let mut model: Vec<(i64, i64)> = keys
                .iter()
                .enumerate()
                .map(|(id, key)| (*key, id as i64 + 1))
                .collect();
            model.sort_by(|a, b| a.0.cmp(&b.0).then(a.1.cmp(&b.1)));

            let expected: Vec<i64> = model.into_iter().map(|(_, id)| id).collect();
            prop_assert_eq!(index.ids_ordered(), expected);
        }
    }
}
