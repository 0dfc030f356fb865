//! Cross-table referential integrity.
//!
//! Relationships are declared explicitly at wiring time rather than
//! discovered from row types. The manager never holds a table lock of
//! its own: it reads other tables through their [`RowSource`] accessor,
//! each of which takes its table's lock briefly. Callers validate
//! foreign keys *before* taking their own table lock, so no operation
//! ever holds two table locks at once.

use crate::error::{DbError, DbResult};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Weak;

/// One declared foreign-key relationship.
///
/// `source_table.property` must hold an id that exists as
/// `target_table.target_property` (in practice the target's primary id).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Relationship {
    /// Table holding the foreign key.
    pub source_table: String,
    /// Property on the source rows holding the referenced id.
    pub property: String,
    /// Table being referenced.
    pub target_table: String,
    /// Property on the target rows being referenced.
    pub target_property: String,
}

/// Lock-scoped read access a table exposes to the foreign-key manager.
///
/// Each method acquires and releases the table's own lock internally.
pub trait RowSource: Send + Sync {
    /// The table name this source reads from.
    fn source_name(&self) -> &str;

    /// Checks whether a row with the given id exists.
    fn id_exists(&self, id: i64) -> DbResult<bool>;

    /// Returns the values of a declared foreign-key property across all
    /// rows. Unset references (0) are omitted.
    fn property_values(&self, property: &str) -> DbResult<Vec<i64>>;
}

/// Process-wide foreign-key registry, owned by the database and shared
/// with every table.
pub struct ForeignKeyManager {
    relationships: RwLock<Vec<Relationship>>,
    sources: RwLock<HashMap<String, Weak<dyn RowSource>>>,
}

impl Default for ForeignKeyManager {
    fn default() -> Self {
        Self::new()
    }
}

impl ForeignKeyManager {
    /// Creates an empty manager.
    #[must_use]
    pub fn new() -> Self {
        Self {
            relationships: RwLock::new(Vec::new()),
            sources: RwLock::new(HashMap::new()),
        }
    }

    /// Declares a relationship. Declaring the same relationship twice is
    /// an idempotent no-op.
    pub fn add_relationship(&self, relationship: Relationship) {
        let mut relationships = self.relationships.write();
        if !relationships.contains(&relationship) {
            tracing::debug!(
                source = %relationship.source_table,
                property = %relationship.property,
                target = %relationship.target_table,
                "declared foreign-key relationship"
            );
            relationships.push(relationship);
        }
    }

    /// Registers the read accessor for a table.
    ///
    /// Held weakly so a dropped table never keeps the manager alive in a
    /// cycle; a stale entry behaves like an unregistered one.
    pub fn register_source(&self, name: impl Into<String>, source: Weak<dyn RowSource>) {
        self.sources.write().insert(name.into(), source);
    }

    /// Removes a table's read accessor. Unknown names are a no-op.
    ///
    /// Declared relationships are kept: other tables continue to declare
    /// their integrity constraints even while this table is offline.
    pub fn unregister_source(&self, name: &str) {
        self.sources.write().remove(name);
    }

    /// Checks whether `id` exists in `table`.
    ///
    /// # Errors
    ///
    /// Fails with [`DbError::UnknownTable`] if no live source is
    /// registered under that name.
    pub fn value_exists(&self, table: &str, id: i64) -> DbResult<bool> {
        let source = self.upgrade(table)?;
        source.id_exists(id)
    }

    /// Checks whether any declared relationship still references
    /// `value` in `table.target_property`.
    ///
    /// Only tables that declared a relationship to that target are
    /// scanned. Returns the first referencing `(holder_table,
    /// holder_property)` pair, or `None` if the value is unreferenced.
    ///
    /// # Errors
    ///
    /// Fails if a declaring table's source cannot be read.
    pub fn value_in_use(
        &self,
        table: &str,
        target_property: &str,
        value: i64,
    ) -> DbResult<Option<(String, String)>> {
        let inbound: Vec<Relationship> = self
            .relationships
            .read()
            .iter()
            .filter(|r| r.target_table == table && r.target_property == target_property)
            .cloned()
            .collect();

        for relationship in inbound {
            // A holder whose source is gone has no live rows to hold
            // references; skip it rather than failing the delete.
            let Some(source) = self.try_upgrade(&relationship.source_table) else {
                continue;
            };
            if source.property_values(&relationship.property)?.contains(&value) {
                return Ok(Some((
                    relationship.source_table,
                    relationship.property,
                )));
            }
        }
        Ok(None)
    }

    /// Returns the relationships declared *from* a table (its outbound
    /// foreign keys).
    #[must_use]
    pub fn relationships_from(&self, table: &str) -> Vec<Relationship> {
        self.relationships
            .read()
            .iter()
            .filter(|r| r.source_table == table)
            .cloned()
            .collect()
    }

    /// Returns true if any relationship targets the given table.
    #[must_use]
    pub fn has_inbound(&self, table: &str) -> bool {
        self.relationships
            .read()
            .iter()
            .any(|r| r.target_table == table)
    }

    fn upgrade(&self, table: &str) -> DbResult<std::sync::Arc<dyn RowSource>> {
        self.try_upgrade(table)
            .ok_or_else(|| DbError::unknown_table(table))
    }

    fn try_upgrade(&self, table: &str) -> Option<std::sync::Arc<dyn RowSource>> {
        self.sources.read().get(table).and_then(Weak::upgrade)
    }
}

impl std::fmt::Debug for ForeignKeyManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ForeignKeyManager")
            .field("relationships", &self.relationships.read().len())
            .field("sources", &self.sources.read().len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    struct StubSource {
        name: String,
        ids: Vec<i64>,
        refs: HashMap<String, Vec<i64>>,
    }

    impl RowSource for StubSource {
        fn source_name(&self) -> &str {
            &self.name
        }

        fn id_exists(&self, id: i64) -> DbResult<bool> {
            Ok(self.ids.contains(&id))
        }

        fn property_values(&self, property: &str) -> DbResult<Vec<i64>> {
            Ok(self.refs.get(property).cloned().unwrap_or_default())
        }
    }

    fn stub(name: &str, ids: &[i64], refs: &[(&str, &[i64])]) -> Arc<StubSource> {
        Arc::new(StubSource {
            name: name.into(),
            ids: ids.to_vec(),
            refs: refs
                .iter()
                .map(|(p, v)| (p.to_string(), v.to_vec()))
                .collect(),
        })
    }

    fn rel(source: &str, property: &str, target: &str) -> Relationship {
        Relationship {
            source_table: source.into(),
            property: property.into(),
            target_table: target.into(),
            target_property: "Id".into(),
        }
    }

    #[test]
    fn value_exists_via_source() {
        let manager = ForeignKeyManager::new();
        let users = stub("users", &[1, 2], &[]);
        manager.register_source("users", Arc::downgrade(&users) as Weak<dyn RowSource>);

        assert!(manager.value_exists("users", 1).unwrap());
        assert!(!manager.value_exists("users", 9).unwrap());
    }

    #[test]
    fn unknown_source_is_error() {
        let manager = ForeignKeyManager::new();
        let result = manager.value_exists("missing", 1);
        assert!(matches!(result, Err(DbError::UnknownTable { .. })));
    }

    #[test]
    fn dropped_source_is_unknown() {
        let manager = ForeignKeyManager::new();
        let users = stub("users", &[1], &[]);
        manager.register_source("users", Arc::downgrade(&users) as Weak<dyn RowSource>);
        drop(users);

        assert!(manager.value_exists("users", 1).is_err());
    }

    #[test]
    fn add_relationship_is_idempotent() {
        let manager = ForeignKeyManager::new();
        manager.add_relationship(rel("orders", "UserId", "users"));
        manager.add_relationship(rel("orders", "UserId", "users"));

        assert_eq!(manager.relationships_from("orders").len(), 1);
    }

    #[test]
    fn value_in_use_finds_holder() {
        let manager = ForeignKeyManager::new();
        manager.add_relationship(rel("orders", "UserId", "users"));

        let orders = stub("orders", &[10], &[("UserId", &[7])]);
        manager.register_source("orders", Arc::downgrade(&orders) as Weak<dyn RowSource>);

        let holder = manager.value_in_use("users", "Id", 7).unwrap();
        assert_eq!(holder, Some(("orders".into(), "UserId".into())));

        assert!(manager.value_in_use("users", "Id", 8).unwrap().is_none());
    }

    #[test]
    fn value_in_use_scans_only_declared_relationships() {
        let manager = ForeignKeyManager::new();
        // orders references users, but no relationship targets "items".
        manager.add_relationship(rel("orders", "UserId", "users"));

        let orders = stub("orders", &[10], &[("UserId", &[7])]);
        manager.register_source("orders", Arc::downgrade(&orders) as Weak<dyn RowSource>);

        assert!(manager.value_in_use("items", "Id", 7).unwrap().is_none());
    }

    #[test]
    fn unregistered_holder_is_skipped() {
        let manager = ForeignKeyManager::new();
        manager.add_relationship(rel("orders", "UserId", "users"));

        // No source for "orders": its rows are offline, so nothing can
        // hold a reference.
        assert!(manager.value_in_use("users", "Id", 7).unwrap().is_none());
    }

    #[test]
    fn unregister_source_keeps_relationships() {
        let manager = ForeignKeyManager::new();
        manager.add_relationship(rel("orders", "UserId", "users"));
        manager.unregister_source("orders");

        assert!(manager.has_inbound("users"));
        manager.unregister_source("never-registered");
    }

    #[test]
    fn has_inbound() {
        let manager = ForeignKeyManager::new();
        assert!(!manager.has_inbound("users"));
        manager.add_relationship(rel("orders", "UserId", "users"));
        assert!(manager.has_inbound("users"));
        assert!(!manager.has_inbound("orders"));
    }
}
