//! The table engine.
//!
//! One `Table<T>` owns one on-disk image and one mutex over all mutable
//! state (rows, sequences, secondary indexes, dirty counter). Mutations
//! follow a fixed shape: cross-table foreign-key validation and
//! before-hooks run *outside* the table lock, the state change and the
//! image write happen inside it, after-hooks run outside it again. A
//! failed image write rolls the in-memory state back, so persisted and
//! observable state never diverge.

use crate::cache::TableCache;
use crate::error::{DbError, DbResult};
use crate::foreign_key::{ForeignKeyManager, RowSource};
use crate::format::TableImage;
use crate::index::{IndexDescriptor, IndexManager, IndexValue};
use crate::row::Row;
use crate::schema::{CachingStrategy, TableDef, WriteStrategy};
use crate::stats::{TableStats, TableStatsSnapshot};
use crate::trigger::{Candidate, TableTrigger, TriggerSet};
use flatdb_storage::StorageBackend;
use parking_lot::{Mutex, MutexGuard, RwLock};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

/// Property name rows are referenced by in foreign-key relationships.
pub const PRIMARY_PROPERTY: &str = "Id";

/// Declares that a property of `T` references another table's primary
/// id. A value of `0` means "no reference" and is never validated.
pub struct ForeignKeyDef<T> {
    /// Property name, used in relationship declarations and errors.
    pub property: String,
    /// The referenced table.
    pub target_table: String,
    /// Extracts the referenced id from a row.
    pub extract: Arc<dyn Fn(&T) -> i64 + Send + Sync>,
}

impl<T> ForeignKeyDef<T> {
    /// Creates a foreign-key declaration.
    pub fn new(
        property: impl Into<String>,
        target_table: impl Into<String>,
        extract: impl Fn(&T) -> i64 + Send + Sync + 'static,
    ) -> Self {
        Self {
            property: property.into(),
            target_table: target_table.into(),
            extract: Arc::new(extract),
        }
    }
}

impl<T> Clone for ForeignKeyDef<T> {
    fn clone(&self) -> Self {
        Self {
            property: self.property.clone(),
            target_table: self.target_table.clone(),
            extract: Arc::clone(&self.extract),
        }
    }
}

impl<T> std::fmt::Debug for ForeignKeyDef<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ForeignKeyDef")
            .field("property", &self.property)
            .field("target_table", &self.target_table)
            .finish_non_exhaustive()
    }
}

/// Options for batch inserts.
#[derive(Debug, Clone, Copy, Default)]
pub struct InsertOptions {
    /// Skip the trigger pipeline (used for seed data).
    pub skip_triggers: bool,
    /// Skip foreign-key validation.
    pub skip_validation: bool,
}

struct IndexSlot<T> {
    descriptor: IndexDescriptor<T>,
    manager: IndexManager,
}

struct TableState<T> {
    rows: BTreeMap<i64, T>,
    primary_sequence: i64,
    secondary_sequence: i64,
    indexes: Vec<IndexSlot<T>>,
    /// Mutations applied but not yet flushed (Lazy strategy).
    dirty: u64,
    /// Size in bytes of the last persisted image.
    data_length: u64,
    poisoned: bool,
}

struct StateUndo<T> {
    rows: BTreeMap<i64, T>,
    primary_sequence: i64,
    secondary_sequence: i64,
    managers: Vec<IndexManager>,
    dirty: u64,
}

impl<T: Row> TableState<T> {
    fn snapshot(&self) -> StateUndo<T> {
        StateUndo {
            rows: self.rows.clone(),
            primary_sequence: self.primary_sequence,
            secondary_sequence: self.secondary_sequence,
            managers: self.indexes.iter().map(|s| s.manager.clone()).collect(),
            dirty: self.dirty,
        }
    }

    fn restore(&mut self, undo: StateUndo<T>) {
        self.rows = undo.rows;
        self.primary_sequence = undo.primary_sequence;
        self.secondary_sequence = undo.secondary_sequence;
        for (slot, manager) in self.indexes.iter_mut().zip(undo.managers) {
            slot.manager = manager;
        }
        self.dirty = undo.dirty;
    }

    fn index_add(&mut self, row: &T) -> DbResult<()> {
        let id = row.id();
        for slot in &mut self.indexes {
            let key = (slot.descriptor.extract)(row);
            slot.manager.add(key, id)?;
        }
        Ok(())
    }

    /// Removes a row's index entries; a missing entry means index and
    /// row storage disagree.
    fn index_remove(&mut self, row: &T, table: &str) -> DbResult<()> {
        let id = row.id();
        for slot in &mut self.indexes {
            let key = (slot.descriptor.extract)(row);
            if !slot.manager.remove(&key, id) {
                self.poisoned = true;
                return Err(DbError::inconsistent(
                    table,
                    format!("index {} has no entry for row {id}", slot.manager.name()),
                ));
            }
        }
        Ok(())
    }
}

/// A typed table backed by a single storage image.
pub struct Table<T: Row> {
    def: TableDef,
    backend: Arc<dyn StorageBackend>,
    fk: Arc<ForeignKeyManager>,
    foreign_keys: Vec<ForeignKeyDef<T>>,
    state: Mutex<TableState<T>>,
    triggers: RwLock<TriggerSet<T>>,
    cache: TableCache<T>,
    stats: TableStats,
    loaded_schema_version: Option<u16>,
    closed: AtomicBool,
}

impl<T: Row> Table<T> {
    /// Opens a table over a backend, loading the existing image if one
    /// is present and rebuilding all secondary indexes.
    ///
    /// # Errors
    ///
    /// Fails if the stored image is corrupt, carries an unsupported
    /// format version, holds duplicate or unassigned ids, or violates a
    /// unique index.
    pub fn open(
        def: TableDef,
        backend: Arc<dyn StorageBackend>,
        fk: Arc<ForeignKeyManager>,
        indexes: Vec<IndexDescriptor<T>>,
        foreign_keys: Vec<ForeignKeyDef<T>>,
    ) -> DbResult<Self> {
        let mut state = TableState {
            rows: BTreeMap::new(),
            primary_sequence: 0,
            secondary_sequence: 0,
            indexes: indexes
                .into_iter()
                .map(|descriptor| IndexSlot {
                    manager: IndexManager::new(
                        descriptor.name.clone(),
                        descriptor.direction,
                        descriptor.unique,
                    ),
                    descriptor,
                })
                .collect(),
            dirty: 0,
            data_length: 0,
            poisoned: false,
        };

        let mut loaded_schema_version = None;
        if let Some(bytes) = backend.load()? {
            let image: TableImage<T> = TableImage::decode(&bytes)?;
            state.primary_sequence = image.primary_sequence;
            state.secondary_sequence = image.secondary_sequence;
            state.data_length = bytes.len() as u64;
            loaded_schema_version = Some(image.schema_version);

            for row in image.rows {
                let id = row.id();
                if id == 0 {
                    return Err(DbError::invalid_format(format!(
                        "table {} holds a row without an id",
                        def.name
                    )));
                }
                state
                    .index_add(&row)
                    .map_err(|e| DbError::invalid_format(format!(
                        "table {} index rebuild failed: {e}",
                        def.name
                    )))?;
                if state.rows.insert(id, row).is_some() {
                    return Err(DbError::invalid_format(format!(
                        "table {} holds duplicate id {id}",
                        def.name
                    )));
                }
            }
        }

        tracing::info!(
            table = %def.name,
            rows = state.rows.len(),
            "opened table"
        );

        let cache_timeout = def.cache_timeout;
        Ok(Self {
            def,
            backend,
            fk,
            foreign_keys,
            state: Mutex::new(state),
            triggers: RwLock::new(TriggerSet::new()),
            cache: TableCache::new(cache_timeout),
            stats: TableStats::new(),
            loaded_schema_version,
            closed: AtomicBool::new(false),
        })
    }

    /// Returns the table name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.def.name
    }

    /// Returns the table definition.
    #[must_use]
    pub fn def(&self) -> &TableDef {
        &self.def
    }

    /// Schema version the stored image was written at, `None` for a
    /// freshly created table. Drives incremental seeding.
    #[must_use]
    pub fn loaded_schema_version(&self) -> Option<u16> {
        self.loaded_schema_version
    }

    /// Registers a trigger on this table.
    pub fn register_trigger(&self, trigger: Arc<dyn TableTrigger<T>>) {
        self.triggers.write().register(trigger);
    }

    /// Returns a snapshot of the table's operation counters.
    #[must_use]
    pub fn stats(&self) -> TableStatsSnapshot {
        self.stats.snapshot()
    }

    /// Drops the memory cache; the next read repopulates it.
    pub fn clear_cache(&self) {
        self.cache.clear();
    }

    // --- reads ---------------------------------------------------------

    /// Returns a snapshot of all rows in id order.
    ///
    /// Under `CachingStrategy::Memory` a fresh cached snapshot is served
    /// without taking the table lock.
    pub fn select_all(&self) -> DbResult<Vec<T>> {
        let start = Instant::now();
        self.check_closed()?;
        if self.def.caching == CachingStrategy::Memory {
            if let Some(rows) = self.cache.get() {
                self.stats.record_select(start.elapsed());
                return Ok(rows.as_ref().clone());
            }
        }

        let state = self.lock()?;
        let rows: Vec<T> = state.rows.values().cloned().collect();
        // Publish while still holding the lock: a writer that commits
        // after our copy must not have its cache refresh overwritten by
        // this older snapshot.
        if self.def.caching == CachingStrategy::Memory {
            self.cache.replace(Arc::new(rows.clone()));
        }
        drop(state);

        self.stats.record_select(start.elapsed());
        Ok(rows)
    }

    /// Looks a row up by id.
    pub fn select(&self, id: i64) -> DbResult<Option<T>> {
        let start = Instant::now();
        let state = self.lock()?;
        let row = state.rows.get(&id).cloned();
        drop(state);
        self.stats.record_select(start.elapsed());
        Ok(row)
    }

    /// Returns the rows matching a predicate, in id order.
    pub fn select_where(&self, predicate: impl Fn(&T) -> bool) -> DbResult<Vec<T>> {
        Ok(self.select_all()?.into_iter().filter(predicate).collect())
    }

    /// Returns all rows ordered by a named secondary index.
    ///
    /// # Errors
    ///
    /// Fails with a validation error for an unknown index name, or an
    /// inconsistency error if the index references a missing row.
    pub fn select_by_index(&self, index: &str) -> DbResult<Vec<T>> {
        let start = Instant::now();
        let state = self.lock()?;
        let slot = state
            .indexes
            .iter()
            .find(|s| s.manager.name() == index)
            .ok_or_else(|| {
                DbError::validation(format!("table {} has no index {index}", self.def.name))
            })?;

        let mut rows = Vec::with_capacity(state.rows.len());
        for id in slot.manager.ids_ordered() {
            let row = state.rows.get(&id).ok_or_else(|| {
                DbError::inconsistent(
                    &self.def.name,
                    format!("index {index} references missing row {id}"),
                )
            })?;
            rows.push(row.clone());
        }
        drop(state);
        self.stats.record_select(start.elapsed());
        Ok(rows)
    }

    /// Returns the row with the lowest id, if any.
    pub fn first(&self) -> DbResult<Option<T>> {
        let state = self.lock()?;
        Ok(state.rows.values().next().cloned())
    }

    /// Returns the number of rows.
    pub fn count(&self) -> DbResult<usize> {
        Ok(self.lock()?.rows.len())
    }

    /// Returns true if the table holds no rows.
    pub fn is_empty(&self) -> DbResult<bool> {
        Ok(self.count()? == 0)
    }

    /// Checks whether a row with the given id exists.
    pub fn id_exists(&self, id: i64) -> DbResult<bool> {
        Ok(self.lock()?.rows.contains_key(&id))
    }

    /// Checks whether a named index contains a key.
    ///
    /// # Errors
    ///
    /// Fails with a validation error for an unknown index name.
    pub fn index_exists(&self, index: &str, value: &IndexValue) -> DbResult<bool> {
        let state = self.lock()?;
        let slot = state
            .indexes
            .iter()
            .find(|s| s.manager.name() == index)
            .ok_or_else(|| {
                DbError::validation(format!("table {} has no index {index}", self.def.name))
            })?;
        Ok(slot.manager.contains(value))
    }

    // --- metadata ------------------------------------------------------

    /// Returns the number of rows (alias of [`Table::count`]).
    pub fn row_count(&self) -> DbResult<usize> {
        self.count()
    }

    /// Returns the size in bytes of the last persisted image.
    pub fn data_length(&self) -> DbResult<u64> {
        Ok(self.lock()?.data_length)
    }

    /// Reports how much of the in-memory state has reached disk, as a
    /// percentage. A clean table reports 100; pending mutations under
    /// the lazy write strategy degrade the figure.
    pub fn compact_percent(&self) -> DbResult<f64> {
        let state = self.lock()?;
        if state.dirty == 0 {
            return Ok(100.0);
        }
        let total = state.rows.len() as f64 + state.dirty as f64;
        Ok(state.rows.len() as f64 / total * 100.0)
    }

    // --- sequences -----------------------------------------------------

    /// Reserves and returns the next primary sequence value.
    pub fn next_sequence(&self) -> DbResult<i64> {
        self.next_sequence_by(1)
    }

    /// Advances the primary sequence by `increment` (≥ 1) and returns
    /// the new value.
    pub fn next_sequence_by(&self, increment: i64) -> DbResult<i64> {
        if increment < 1 {
            return Err(DbError::validation(format!(
                "sequence increment must be at least 1, got {increment}"
            )));
        }
        let mut state = self.lock()?;
        self.check_poisoned(&state)?;
        state.primary_sequence += increment;
        let value = state.primary_sequence;
        self.commit(&mut state, 1)?;
        Ok(value)
    }

    /// Advances the secondary sequence by `increment` (≥ 1) and returns
    /// the new value.
    pub fn next_secondary_sequence(&self, increment: i64) -> DbResult<i64> {
        if increment < 1 {
            return Err(DbError::validation(format!(
                "sequence increment must be at least 1, got {increment}"
            )));
        }
        let mut state = self.lock()?;
        self.check_poisoned(&state)?;
        state.secondary_sequence += increment;
        let value = state.secondary_sequence;
        self.commit(&mut state, 1)?;
        Ok(value)
    }

    /// Sets both sequence counters.
    ///
    /// # Errors
    ///
    /// Fails with a validation error if `primary` is below the highest
    /// live row id, which would make future ids collide.
    pub fn reset_sequence(&self, primary: i64, secondary: i64) -> DbResult<()> {
        let mut state = self.lock()?;
        self.check_poisoned(&state)?;
        if let Some(max_id) = state.rows.keys().next_back() {
            if primary < *max_id {
                return Err(DbError::validation(format!(
                    "cannot reset primary sequence to {primary}: row id {max_id} is live"
                )));
            }
        }
        state.primary_sequence = primary;
        state.secondary_sequence = secondary;
        self.commit(&mut state, 1)
    }

    // --- mutations -----------------------------------------------------

    /// Inserts one row, assigning an id from the primary sequence.
    ///
    /// Returns the persisted row with its sealed id, or `None` if a
    /// trigger vetoed it.
    pub fn insert(&self, row: T) -> DbResult<Option<T>> {
        Ok(self
            .insert_many(vec![row], InsertOptions::default())?
            .into_iter()
            .next())
    }

    /// Inserts a batch of rows in one image write.
    ///
    /// Vetoed rows are excluded; the returned vector holds the rows
    /// actually persisted, with sealed ids. Any error leaves the table
    /// untouched.
    pub fn insert_many(&self, rows: Vec<T>, options: InsertOptions) -> DbResult<Vec<T>> {
        if rows.is_empty() {
            return Err(DbError::validation("insert batch is empty"));
        }
        let start = Instant::now();

        if !options.skip_validation {
            self.validate_outbound(&rows)?;
        }

        let mut candidates: Vec<Candidate<T>> = rows.into_iter().map(Candidate::new).collect();
        if !options.skip_triggers {
            self.triggers.read().before_insert(&mut candidates)?;
        }
        let rows: Vec<T> = candidates
            .into_iter()
            .filter(Candidate::is_allowed)
            .map(Candidate::into_row)
            .collect();
        if rows.is_empty() {
            return Ok(Vec::new());
        }

        let mut state = self.lock()?;
        self.check_poisoned(&state)?;
        let undo = state.snapshot();

        let mut inserted = Vec::with_capacity(rows.len());
        for mut row in rows {
            if row.has_id() {
                let id = row.id();
                if state.rows.contains_key(&id) {
                    state.restore(undo);
                    return Err(DbError::validation(format!(
                        "table {} already holds id {id}",
                        self.def.name
                    )));
                }
                state.primary_sequence = state.primary_sequence.max(id);
            } else {
                let next = state.primary_sequence + 1;
                state.primary_sequence = next;
                if let Err(e) = row.row_id_mut().set(next) {
                    state.restore(undo);
                    return Err(e);
                }
            }
            row.row_id_mut().seal();

            if let Err(e) = state.index_add(&row) {
                state.restore(undo);
                return Err(e);
            }
            state.rows.insert(row.id(), row.clone());
            inserted.push(row);
        }

        if let Err(e) = self.commit_or_restore(&mut state, undo, inserted.len() as u64) {
            return Err(e);
        }
        drop(state);

        if !options.skip_triggers {
            self.triggers.read().after_insert(&inserted)?;
        }
        self.stats.record_insert(inserted.len() as u64, start.elapsed());
        Ok(inserted)
    }

    /// Updates one row in place.
    ///
    /// Returns the persisted row, or `None` if a trigger vetoed the
    /// update.
    pub fn update(&self, row: T) -> DbResult<Option<T>> {
        Ok(self.update_many(vec![row])?.into_iter().next())
    }

    /// Updates a batch of rows in one image write.
    ///
    /// Every row must already exist; vetoed rows keep their stored
    /// version. Any error leaves the table untouched.
    pub fn update_many(&self, rows: Vec<T>) -> DbResult<Vec<T>> {
        if rows.is_empty() {
            return Err(DbError::validation("update batch is empty"));
        }
        let start = Instant::now();

        for row in &rows {
            if !row.has_id() {
                return Err(DbError::validation(format!(
                    "cannot update a row without an id in table {}",
                    self.def.name
                )));
            }
        }
        self.validate_outbound(&rows)?;

        // Fetch the stored versions for the compare hooks.
        let olds: Vec<T> = {
            let state = self.lock()?;
            rows.iter()
                .map(|row| {
                    state
                        .rows
                        .get(&row.id())
                        .cloned()
                        .ok_or_else(|| DbError::not_found(&self.def.name, row.id()))
                })
                .collect::<DbResult<_>>()?
        };

        let mut candidates: Vec<Candidate<T>> = rows.into_iter().map(Candidate::new).collect();
        let triggers = self.triggers.read();
        triggers.before_update(&mut candidates)?;
        for (old, candidate) in olds.iter().zip(candidates.iter_mut()) {
            if candidate.is_allowed() {
                triggers.before_update_compare(old, candidate)?;
            }
        }
        drop(triggers);

        let rows: Vec<T> = candidates
            .into_iter()
            .filter(Candidate::is_allowed)
            .map(Candidate::into_row)
            .collect();
        if rows.is_empty() {
            return Ok(Vec::new());
        }

        let mut state = self.lock()?;
        self.check_poisoned(&state)?;
        let undo = state.snapshot();

        let mut updated = Vec::with_capacity(rows.len());
        for row in rows {
            let id = row.id();
            let Some(old) = state.rows.get(&id).cloned() else {
                state.restore(undo);
                return Err(DbError::not_found(&self.def.name, id));
            };
            if let Err(e) = state.index_remove(&old, &self.def.name) {
                // Poisoned: the undo cannot be trusted either, leave the
                // flag set and surface the inconsistency.
                return Err(e);
            }
            if let Err(e) = state.index_add(&row) {
                state.restore(undo);
                return Err(e);
            }
            state.rows.insert(id, row.clone());
            updated.push(row);
        }

        if let Err(e) = self.commit_or_restore(&mut state, undo, updated.len() as u64) {
            return Err(e);
        }
        drop(state);

        self.triggers.read().after_update(&updated)?;
        self.stats.record_update(updated.len() as u64, start.elapsed());
        Ok(updated)
    }

    /// Inserts the row if it has no id (or an unknown one), updates it
    /// otherwise.
    pub fn insert_or_update(&self, row: T) -> DbResult<Option<T>> {
        if row.has_id() && self.id_exists(row.id())? {
            self.update(row)
        } else {
            self.insert(row)
        }
    }

    /// Deletes one row. Deleting a row that is not stored is a no-op.
    ///
    /// Returns true if the row was removed.
    pub fn delete(&self, row: &T) -> DbResult<bool> {
        Ok(self.delete_many(std::slice::from_ref(row))? == 1)
    }

    /// Deletes a batch of rows in one image write; returns how many
    /// were removed. Rows without an id or not stored are skipped.
    ///
    /// # Errors
    ///
    /// Fails with [`DbError::ForeignKeyInUse`] if any row is still
    /// referenced through a declared relationship.
    pub fn delete_many(&self, rows: &[T]) -> DbResult<usize> {
        if rows.is_empty() {
            return Err(DbError::validation("delete batch is empty"));
        }
        let start = Instant::now();

        for row in rows {
            if !row.has_id() {
                continue;
            }
            self.check_not_referenced(row.id())?;
        }

        let mut candidates: Vec<Candidate<T>> =
            rows.iter().cloned().map(Candidate::new).collect();
        self.triggers.read().before_delete(&mut candidates)?;

        let mut state = self.lock()?;
        self.check_poisoned(&state)?;
        let undo = state.snapshot();

        let mut deleted = Vec::new();
        for candidate in candidates {
            if !candidate.is_allowed() {
                continue;
            }
            let id = candidate.row.id();
            let Some(stored) = state.rows.remove(&id) else {
                continue;
            };
            if let Err(e) = state.index_remove(&stored, &self.def.name) {
                return Err(e);
            }
            deleted.push(stored);
        }

        if deleted.is_empty() {
            return Ok(0);
        }

        if let Err(e) = self.commit_or_restore(&mut state, undo, deleted.len() as u64) {
            return Err(e);
        }
        drop(state);

        self.triggers.read().after_delete(&deleted)?;
        self.stats.record_delete(deleted.len() as u64, start.elapsed());
        Ok(deleted.len())
    }

    /// Removes all rows, keeping both sequence counters so ids stay
    /// monotonic across a truncate.
    ///
    /// # Errors
    ///
    /// Fails with [`DbError::ForeignKeyInUse`] if any live row is still
    /// referenced through a declared relationship.
    pub fn truncate(&self) -> DbResult<()> {
        if self.fk.has_inbound(&self.def.name) {
            let ids: Vec<i64> = self.lock()?.rows.keys().copied().collect();
            for id in ids {
                self.check_not_referenced(id)?;
            }
        }

        let mut state = self.lock()?;
        self.check_poisoned(&state)?;
        let undo = state.snapshot();

        state.rows.clear();
        for slot in &mut state.indexes {
            slot.manager.clear();
        }

        self.commit_or_restore(&mut state, undo, 1)?;
        tracing::info!(table = %self.def.name, "truncated table");
        Ok(())
    }

    /// Flushes pending state to disk regardless of write strategy.
    /// A no-op when the table is clean.
    pub fn force_write(&self) -> DbResult<()> {
        let mut state = self.lock()?;
        self.check_poisoned(&state)?;
        if state.dirty == 0 {
            return Ok(());
        }
        self.persist(&mut state)
    }

    /// Runs `f` with exclusive access to the table, applying all of its
    /// mutations as one unit with a single image write.
    ///
    /// Guard operations are raw state edits: the trigger pipeline and
    /// outbound foreign-key validation do not run inside the closure.
    /// Deletes still refuse to remove rows that other tables reference;
    /// that check reads the holder tables through their own locks and
    /// never re-enters this one. If `f` returns an error the table is
    /// restored to its state before the call.
    pub fn atomically<R>(&self, f: impl FnOnce(&mut TableTxn<'_, T>) -> DbResult<R>) -> DbResult<R> {
        let mut state = self.lock()?;
        self.check_poisoned(&state)?;
        let undo = state.snapshot();

        let mut txn = TableTxn {
            state: &mut *state,
            table: self,
        };
        match f(&mut txn) {
            Ok(value) => {
                self.commit_or_restore(&mut state, undo, 1)?;
                Ok(value)
            }
            Err(e) => {
                state.restore(undo);
                Err(e)
            }
        }
    }

    // --- internals -----------------------------------------------------

    fn lock(&self) -> DbResult<MutexGuard<'_, TableState<T>>> {
        self.check_closed()?;
        self.state
            .try_lock_for(self.def.lock_timeout)
            .ok_or_else(|| DbError::LockTimeout {
                table: self.def.name.clone(),
            })
    }

    fn check_closed(&self) -> DbResult<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(DbError::DatabaseClosed);
        }
        Ok(())
    }

    /// Marks the table closed; all subsequent operations that touch the
    /// table state fail. Called by the registry when the database
    /// closes, after the final flush.
    pub(crate) fn mark_closed(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    fn check_poisoned(&self, state: &TableState<T>) -> DbResult<()> {
        if state.poisoned {
            return Err(DbError::inconsistent(
                &self.def.name,
                "table is poisoned after an index/storage disagreement",
            ));
        }
        Ok(())
    }

    /// Validates every declared outbound foreign key of a batch. Runs
    /// before this table's lock is taken; each check briefly takes the
    /// target table's lock through its row source.
    fn validate_outbound(&self, rows: &[T]) -> DbResult<()> {
        for def in &self.foreign_keys {
            for row in rows {
                let value = (def.extract)(row);
                if value == 0 {
                    continue;
                }
                if !self.fk.value_exists(&def.target_table, value)? {
                    return Err(DbError::ForeignKeyMissing {
                        table: self.def.name.clone(),
                        property: def.property.clone(),
                        value,
                        target: def.target_table.clone(),
                    });
                }
            }
        }
        Ok(())
    }

    fn check_not_referenced(&self, id: i64) -> DbResult<()> {
        if let Some((holder_table, holder_property)) =
            self.fk.value_in_use(&self.def.name, PRIMARY_PROPERTY, id)?
        {
            return Err(DbError::ForeignKeyInUse {
                table: self.def.name.clone(),
                value: id,
                holder_table,
                holder_property,
            });
        }
        Ok(())
    }

    /// Applies the write strategy after a successful state change and
    /// refreshes the cache.
    fn commit(&self, state: &mut TableState<T>, mutations: u64) -> DbResult<()> {
        match self.def.write_strategy {
            WriteStrategy::Forced => self.persist(state)?,
            WriteStrategy::Lazy => state.dirty += mutations,
        }
        self.refresh_cache(state);
        Ok(())
    }

    fn commit_or_restore(
        &self,
        state: &mut TableState<T>,
        undo: StateUndo<T>,
        mutations: u64,
    ) -> DbResult<()> {
        match self.def.write_strategy {
            WriteStrategy::Forced => {
                if let Err(e) = self.persist(state) {
                    state.restore(undo);
                    return Err(e);
                }
            }
            WriteStrategy::Lazy => state.dirty += mutations,
        }
        self.refresh_cache(state);
        Ok(())
    }

    fn persist(&self, state: &mut TableState<T>) -> DbResult<()> {
        let start = Instant::now();
        let image = TableImage {
            schema_version: self.def.version,
            compression: self.def.compression,
            primary_sequence: state.primary_sequence,
            secondary_sequence: state.secondary_sequence,
            rows: state.rows.values().cloned().collect(),
        };
        let bytes = image.encode()?;
        self.backend.store(&bytes)?;

        state.data_length = bytes.len() as u64;
        state.dirty = 0;
        let elapsed = start.elapsed();
        self.stats.record_flush(bytes.len() as u64, elapsed);
        tracing::debug!(
            table = %self.def.name,
            bytes = bytes.len(),
            elapsed_us = elapsed.as_micros() as u64,
            "flushed table image"
        );
        Ok(())
    }

    fn refresh_cache(&self, state: &TableState<T>) {
        if self.def.caching == CachingStrategy::Memory {
            self.cache
                .replace(Arc::new(state.rows.values().cloned().collect()));
        }
    }
}

impl<T: Row> RowSource for Table<T> {
    fn source_name(&self) -> &str {
        &self.def.name
    }

    fn id_exists(&self, id: i64) -> DbResult<bool> {
        Ok(self.lock()?.rows.contains_key(&id))
    }

    fn property_values(&self, property: &str) -> DbResult<Vec<i64>> {
        let def = self
            .foreign_keys
            .iter()
            .find(|d| d.property == property)
            .ok_or_else(|| {
                DbError::validation(format!(
                    "table {} declares no foreign-key property {property}",
                    self.def.name
                ))
            })?;
        let state = self.lock()?;
        Ok(state
            .rows
            .values()
            .map(|row| (def.extract)(row))
            .filter(|v| *v != 0)
            .collect())
    }
}

impl<T: Row> std::fmt::Debug for Table<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Table")
            .field("name", &self.def.name)
            .finish_non_exhaustive()
    }
}

/// Exclusive access to a table inside [`Table::atomically`].
pub struct TableTxn<'a, T: Row> {
    state: &'a mut TableState<T>,
    table: &'a Table<T>,
}

impl<T: Row> TableTxn<'_, T> {
    fn table_name(&self) -> &str {
        &self.table.def.name
    }

    /// Inserts a row, assigning an id from the primary sequence.
    /// Triggers and outbound foreign-key validation do not run.
    pub fn insert(&mut self, mut row: T) -> DbResult<T> {
        if row.has_id() {
            let id = row.id();
            if self.state.rows.contains_key(&id) {
                return Err(DbError::validation(format!(
                    "table {} already holds id {id}",
                    self.table_name()
                )));
            }
            self.state.primary_sequence = self.state.primary_sequence.max(id);
        } else {
            let next = self.state.primary_sequence + 1;
            self.state.primary_sequence = next;
            row.row_id_mut().set(next)?;
        }
        row.row_id_mut().seal();

        self.state.index_add(&row)?;
        self.state.rows.insert(row.id(), row.clone());
        Ok(row)
    }

    /// Replaces a stored row. Triggers and outbound foreign-key
    /// validation do not run.
    pub fn update(&mut self, row: T) -> DbResult<T> {
        let id = row.id();
        let name = self.table.def.name.clone();
        let old = self
            .state
            .rows
            .get(&id)
            .cloned()
            .ok_or_else(|| DbError::not_found(name.as_str(), id))?;
        self.state.index_remove(&old, &name)?;
        self.state.index_add(&row)?;
        self.state.rows.insert(id, row.clone());
        Ok(row)
    }

    /// Removes a row by id. Unknown ids are a no-op; triggers do not
    /// run.
    ///
    /// # Errors
    ///
    /// Fails with [`DbError::ForeignKeyInUse`] if the row is still
    /// referenced through a declared relationship. The check reads the
    /// holder tables through their own briefly-taken locks, never this
    /// table's.
    pub fn delete(&mut self, id: i64) -> DbResult<bool> {
        if !self.state.rows.contains_key(&id) {
            return Ok(false);
        }
        self.table.check_not_referenced(id)?;

        let Some(stored) = self.state.rows.remove(&id) else {
            return Ok(false);
        };
        let name = self.table.def.name.clone();
        self.state.index_remove(&stored, &name)?;
        Ok(true)
    }

    /// Looks a row up by id.
    #[must_use]
    pub fn select(&self, id: i64) -> Option<T> {
        self.state.rows.get(&id).cloned()
    }

    /// Returns a snapshot of all rows in id order.
    #[must_use]
    pub fn select_all(&self) -> Vec<T> {
        self.state.rows.values().cloned().collect()
    }

    /// Returns the number of rows.
    #[must_use]
    pub fn count(&self) -> usize {
        self.state.rows.len()
    }

    /// Reserves and returns the next primary sequence value.
    pub fn next_sequence(&mut self) -> i64 {
        self.state.primary_sequence += 1;
        self.state.primary_sequence
    }
}
