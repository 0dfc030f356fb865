//! # FlatDB Core
//!
//! Embedded flat-file database engine for typed records.
//!
//! This crate provides:
//! - Typed tables of serde rows with monotonic i64 ids
//! - Secondary indexes and declared foreign-key relationships
//! - A vetoable trigger pipeline around every mutation
//! - Whole-image persistence with checksums and optional compression
//! - A registry that wires tables, seed data, and the directory lock
//!
//! # Example
//!
//! ```rust,ignore
//! use flatdb_core::{FlatDb, Row, RowId, TableDef, TableOptions};
//! use serde::{Deserialize, Serialize};
//!
//! #[derive(Debug, Clone, Serialize, Deserialize)]
//! struct User {
//!     id: RowId,
//!     name: String,
//! }
//!
//! impl Row for User {
//!     fn row_id(&self) -> &RowId { &self.id }
//!     fn row_id_mut(&mut self) -> &mut RowId { &mut self.id }
//! }
//!
//! let db = FlatDb::open("my_database")?;
//! let users = db.register_table::<User>(
//!     TableDef::new("users")?,
//!     TableOptions::new(),
//! )?;
//! users.insert(User { id: RowId::new(), name: "alice".into() })?;
//! db.close()?;
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod cache;
pub mod database;
pub mod dir;
pub mod error;
pub mod foreign_key;
pub mod format;
pub mod index;
pub mod row;
pub mod schema;
pub mod stats;
pub mod table;
pub mod trigger;

pub use cache::TableCache;
pub use database::{DbConfig, FlatDb, SeedSource, TableOptions};
pub use dir::DbDir;
pub use error::{DbError, DbResult};
pub use foreign_key::{ForeignKeyManager, Relationship, RowSource};
pub use format::{TableImage, FORMAT_VERSION, MIN_FORMAT_VERSION};
pub use index::{IndexDescriptor, IndexDirection, IndexManager, IndexValue};
pub use row::{Row, RowId};
pub use schema::{CachingStrategy, TableDef, WriteStrategy};
pub use stats::{TableStats, TableStatsSnapshot};
pub use table::{ForeignKeyDef, InsertOptions, Table, TableTxn, PRIMARY_PROPERTY};
pub use trigger::{Candidate, TableTrigger, TriggerKinds, TriggerSet};

pub use flatdb_storage::CompressionType;
