//! Database registry and initializer.
//!
//! A [`FlatDb`] owns the directory lock, the process-wide foreign-key
//! manager, and the map of registered tables. Registration is the only
//! entry point that wires a table's backend, indexes, foreign keys,
//! triggers, and seed data, and it is checked eagerly: duplicate names
//! and unreadable images fail at startup, not first use.

use crate::dir::DbDir;
use crate::error::{DbError, DbResult};
use crate::foreign_key::{ForeignKeyManager, Relationship, RowSource};
use crate::index::IndexDescriptor;
use crate::row::Row;
use crate::schema::TableDef;
use crate::table::{ForeignKeyDef, InsertOptions, Table, PRIMARY_PROPERTY};
use crate::trigger::TableTrigger;
use flatdb_storage::{FileBackend, InMemoryBackend, StorageBackend};
use parking_lot::{Mutex, RwLock};
use std::any::Any;
use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

/// Options controlling how a database directory is opened.
#[derive(Debug, Clone)]
pub struct DbConfig {
    /// Create the directory if it does not exist (default true).
    pub create_if_missing: bool,
    /// Fail if the directory already exists (default false).
    pub error_if_exists: bool,
}

impl Default for DbConfig {
    fn default() -> Self {
        Self {
            create_if_missing: true,
            error_if_exists: false,
        }
    }
}

impl DbConfig {
    /// Creates the default configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets whether a missing directory is created.
    #[must_use]
    pub const fn create_if_missing(mut self, value: bool) -> Self {
        self.create_if_missing = value;
        self
    }

    /// Sets whether an existing directory is an error.
    #[must_use]
    pub const fn error_if_exists(mut self, value: bool) -> Self {
        self.error_if_exists = value;
        self
    }
}

/// Provides default rows for a table, versioned by schema version.
///
/// On first creation the source is consulted for every version up to
/// the table's current one; on upgrade only for the versions above the
/// stored image's. Seed rows carrying an id that already exists are
/// skipped, so user edits to seeded rows survive restarts.
pub trait SeedSource<T>: Send + Sync {
    /// Returns the rows introduced at the given schema version.
    fn initial_rows(&self, version: u16) -> Vec<T>;
}

impl<T, F> SeedSource<T> for F
where
    F: Fn(u16) -> Vec<T> + Send + Sync,
{
    fn initial_rows(&self, version: u16) -> Vec<T> {
        self(version)
    }
}

/// Everything a table needs beyond its [`TableDef`]: indexes, foreign
/// keys, triggers, and seed data.
pub struct TableOptions<T: Row> {
    indexes: Vec<IndexDescriptor<T>>,
    foreign_keys: Vec<ForeignKeyDef<T>>,
    triggers: Vec<Arc<dyn TableTrigger<T>>>,
    seed: Option<Arc<dyn SeedSource<T>>>,
}

impl<T: Row> Default for TableOptions<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Row> TableOptions<T> {
    /// Creates empty options.
    #[must_use]
    pub fn new() -> Self {
        Self {
            indexes: Vec::new(),
            foreign_keys: Vec::new(),
            triggers: Vec::new(),
            seed: None,
        }
    }

    /// Adds a secondary index.
    #[must_use]
    pub fn index(mut self, descriptor: IndexDescriptor<T>) -> Self {
        self.indexes.push(descriptor);
        self
    }

    /// Declares an outbound foreign key.
    #[must_use]
    pub fn foreign_key(mut self, def: ForeignKeyDef<T>) -> Self {
        self.foreign_keys.push(def);
        self
    }

    /// Registers a trigger at wiring time.
    #[must_use]
    pub fn trigger(mut self, trigger: Arc<dyn TableTrigger<T>>) -> Self {
        self.triggers.push(trigger);
        self
    }

    /// Supplies versioned seed data.
    #[must_use]
    pub fn seed(mut self, seed: Arc<dyn SeedSource<T>>) -> Self {
        self.seed = Some(seed);
        self
    }
}

/// Type-erased view of a registered table, used for flush-all and
/// shutdown paths.
trait AnyTable: Send + Sync {
    fn flush(&self) -> DbResult<()>;
    fn mark_closed(&self);
}

impl<T: Row> AnyTable for Table<T> {
    fn flush(&self) -> DbResult<()> {
        self.force_write()
    }

    fn mark_closed(&self) {
        Table::mark_closed(self);
    }
}

struct TableEntry {
    erased: Arc<dyn AnyTable>,
    typed: Arc<dyn Any + Send + Sync>,
}

enum Backing {
    Disk(Mutex<Option<DbDir>>),
    Memory,
}

/// An open database: directory lock, foreign-key manager, and table
/// registry.
///
/// # Example
///
/// ```rust,ignore
/// let db = FlatDb::open("/var/lib/myapp/db")?;
/// let users: Arc<Table<User>> =
///     db.register_table(TableDef::new("users")?, TableOptions::new())?;
/// users.insert(User::named("alice"))?;
/// db.close()?;
/// ```
pub struct FlatDb {
    backing: Backing,
    fk: Arc<ForeignKeyManager>,
    tables: RwLock<HashMap<String, TableEntry>>,
    closed: AtomicBool,
}

impl FlatDb {
    /// Opens a database directory with the default configuration.
    ///
    /// # Errors
    ///
    /// Fails if the directory cannot be created or another process
    /// holds its lock.
    pub fn open(path: impl AsRef<Path>) -> DbResult<Self> {
        Self::open_with_config(path, DbConfig::default())
    }

    /// Opens a database directory.
    ///
    /// # Errors
    ///
    /// Fails with a validation error if the directory is missing and
    /// `create_if_missing` is off, or present and `error_if_exists` is
    /// on; with [`DbError::DatabaseLocked`] if another process holds
    /// the directory lock.
    pub fn open_with_config(path: impl AsRef<Path>, config: DbConfig) -> DbResult<Self> {
        let path = path.as_ref();
        if path.exists() {
            if config.error_if_exists {
                return Err(DbError::validation(format!(
                    "database directory already exists: {}",
                    path.display()
                )));
            }
        } else if config.create_if_missing {
            std::fs::create_dir_all(path)?;
        } else {
            return Err(DbError::validation(format!(
                "database directory does not exist: {}",
                path.display()
            )));
        }

        let dir = DbDir::open(path)?;
        tracing::info!(path = %path.display(), "opened database");
        Ok(Self {
            backing: Backing::Disk(Mutex::new(Some(dir))),
            fk: Arc::new(ForeignKeyManager::new()),
            tables: RwLock::new(HashMap::new()),
            closed: AtomicBool::new(false),
        })
    }

    /// Opens a database with no disk presence; every table is backed by
    /// memory. Intended for tests.
    #[must_use]
    pub fn open_in_memory() -> Self {
        Self {
            backing: Backing::Memory,
            fk: Arc::new(ForeignKeyManager::new()),
            tables: RwLock::new(HashMap::new()),
            closed: AtomicBool::new(false),
        }
    }

    /// Registers a table, loading its stored image and applying seed
    /// data.
    ///
    /// # Errors
    ///
    /// Fails with [`DbError::DuplicateTable`] if the name is taken,
    /// or with a format/codec error if the stored image is unreadable.
    pub fn register_table<T: Row>(
        &self,
        def: TableDef,
        options: TableOptions<T>,
    ) -> DbResult<Arc<Table<T>>> {
        self.check_open()?;

        // The whole registration runs under the registry write lock, so
        // two racing callers cannot both load the image, wire foreign
        // keys, and seed the same name. Nothing below re-enters the
        // registry.
        let mut tables = self.tables.write();
        if tables.contains_key(&def.name) {
            return Err(DbError::DuplicateTable {
                name: def.name.clone(),
            });
        }

        let backend = self.backend_for(&def.name)?;
        let table = Arc::new(Table::open(
            def,
            backend,
            Arc::clone(&self.fk),
            options.indexes,
            options.foreign_keys.clone(),
        )?);

        for trigger in options.triggers {
            table.register_trigger(trigger);
        }

        let name = table.name().to_string();
        self.fk
            .register_source(&name, Arc::downgrade(&table) as Weak<dyn RowSource>);
        for fk_def in &options.foreign_keys {
            self.fk.add_relationship(Relationship {
                source_table: name.clone(),
                property: fk_def.property.clone(),
                target_table: fk_def.target_table.clone(),
                target_property: PRIMARY_PROPERTY.into(),
            });
        }

        if let Some(seed) = options.seed {
            if let Err(e) = self.apply_seed(&table, seed.as_ref()) {
                self.fk.unregister_source(&name);
                return Err(e);
            }
        }

        tracing::info!(
            table = %name,
            rows = table.count()?,
            "registered table"
        );
        tables.insert(
            name,
            TableEntry {
                erased: Arc::clone(&table) as Arc<dyn AnyTable>,
                typed: Arc::clone(&table) as Arc<dyn Any + Send + Sync>,
            },
        );
        Ok(table)
    }

    /// Flushes and removes a table from the registry. An unknown name
    /// is a no-op.
    pub fn unregister_table(&self, name: &str) -> DbResult<()> {
        self.check_open()?;
        let entry = self.tables.write().remove(name);
        if let Some(entry) = entry {
            entry.erased.flush()?;
            self.fk.unregister_source(name);
            tracing::info!(table = %name, "unregistered table");
        }
        Ok(())
    }

    /// Returns the typed handle for a registered table.
    ///
    /// # Errors
    ///
    /// Fails with [`DbError::UnknownTable`] if the name was never
    /// registered, or was registered with a different row type.
    pub fn table<T: Row>(&self, name: &str) -> DbResult<Arc<Table<T>>> {
        self.check_open()?;
        let tables = self.tables.read();
        let entry = tables
            .get(name)
            .ok_or_else(|| DbError::unknown_table(name))?;
        Arc::clone(&entry.typed)
            .downcast::<Table<T>>()
            .map_err(|_| DbError::unknown_table(name))
    }

    /// Returns the registered table names, sorted.
    #[must_use]
    pub fn table_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tables.read().keys().cloned().collect();
        names.sort();
        names
    }

    /// Declares a foreign-key relationship from `source.property` to
    /// `target`'s primary id. Declaring it twice is a no-op.
    pub fn add_relationship(
        &self,
        source: impl Into<String>,
        property: impl Into<String>,
        target: impl Into<String>,
    ) {
        self.fk.add_relationship(Relationship {
            source_table: source.into(),
            property: property.into(),
            target_table: target.into(),
            target_property: PRIMARY_PROPERTY.into(),
        });
    }

    /// Returns the shared foreign-key manager.
    #[must_use]
    pub fn foreign_keys(&self) -> &Arc<ForeignKeyManager> {
        &self.fk
    }

    /// Flushes every table and releases the directory lock. Operations
    /// after close fail.
    ///
    /// # Errors
    ///
    /// Returns the first flush failure; remaining tables are still
    /// flushed.
    pub fn close(&self) -> DbResult<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let mut first_error = None;
        let tables = std::mem::take(&mut *self.tables.write());
        for (name, entry) in &tables {
            if let Err(e) = entry.erased.flush() {
                tracing::warn!(table = %name, error = %e, "flush on close failed");
                if first_error.is_none() {
                    first_error = Some(e);
                }
            }
            // Retained handles must stop mutating once the directory
            // lock is gone.
            entry.erased.mark_closed();
            self.fk.unregister_source(name);
        }
        drop(tables);

        if let Backing::Disk(dir) = &self.backing {
            *dir.lock() = None;
        }
        tracing::info!("closed database");

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn check_open(&self) -> DbResult<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(DbError::DatabaseClosed);
        }
        Ok(())
    }

    fn backend_for(&self, name: &str) -> DbResult<Arc<dyn StorageBackend>> {
        match &self.backing {
            Backing::Disk(dir) => {
                let dir = dir.lock();
                let dir = dir.as_ref().ok_or(DbError::DatabaseClosed)?;
                Ok(Arc::new(FileBackend::open(&dir.table_path(name))?))
            }
            Backing::Memory => Ok(Arc::new(InMemoryBackend::new())),
        }
    }

    /// Applies versioned seed data after a table is opened.
    fn apply_seed<T: Row>(&self, table: &Table<T>, seed: &dyn SeedSource<T>) -> DbResult<()> {
        let target = table.def().version;
        let from = match table.loaded_schema_version() {
            None => 1,
            Some(stored) if stored < target => stored + 1,
            Some(_) => return Ok(()),
        };

        let mut seeded = 0usize;
        for version in from..=target {
            let mut rows = Vec::new();
            for row in seed.initial_rows(version) {
                // A seed row whose id is already live was created (or
                // edited) earlier; never clobber it.
                if row.has_id() && table.id_exists(row.id())? {
                    continue;
                }
                rows.push(row);
            }
            if rows.is_empty() {
                continue;
            }
            seeded += rows.len();
            table.insert_many(
                rows,
                InsertOptions {
                    skip_triggers: true,
                    skip_validation: false,
                },
            )?;
        }
        if seeded > 0 {
            tracing::info!(table = %table.name(), rows = seeded, "applied seed data");
        }
        Ok(())
    }
}

impl Drop for FlatDb {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

impl std::fmt::Debug for FlatDb {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FlatDb")
            .field("tables", &self.table_names())
            .field("closed", &self.closed.load(Ordering::SeqCst))
            .finish()
    }
}
