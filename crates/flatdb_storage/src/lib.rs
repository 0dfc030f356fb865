//! # FlatDB Storage
//!
//! Storage backend trait and implementations for FlatDB.
//!
//! This crate provides the lowest-level storage abstraction for FlatDB.
//! Storage backends are **opaque byte stores** - they hold one table
//! image each and do not interpret the data they store.
//!
//! ## Design Principles
//!
//! - Backends hold a single replaceable image (load, store, sync)
//! - No knowledge of FlatDB file formats, rows, or indexes
//! - Must be `Send + Sync` for concurrent access
//! - FlatDB owns all file format interpretation
//!
//! ## Available Backends
//!
//! - [`InMemoryBackend`] - For testing and ephemeral tables
//! - [`FileBackend`] - For persistent storage using OS file APIs
//!
//! ## Example
//!
//! ```rust
//! use flatdb_storage::{StorageBackend, InMemoryBackend};
//!
//! let backend = InMemoryBackend::new();
//! backend.store(b"table image").unwrap();
//! let data = backend.load().unwrap();
//! assert_eq!(data.as_deref(), Some(&b"table image"[..]));
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod backend;
mod compress;
mod error;
mod file;
mod memory;

pub use backend::StorageBackend;
pub use compress::{compress, decompress, CompressionType};
pub use error::{StorageError, StorageResult};
pub use file::FileBackend;
pub use memory::InMemoryBackend;
