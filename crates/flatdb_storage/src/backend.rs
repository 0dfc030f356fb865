//! Storage backend trait definition.

use crate::error::StorageResult;

/// A low-level storage backend for FlatDB.
///
/// Storage backends are **opaque byte stores**. Each backend holds the
/// current image of exactly one table; `store` replaces the image as a
/// whole. FlatDB owns all file format interpretation - backends do not
/// understand headers, rows, or indexes.
///
/// # Invariants
///
/// - `load` returns exactly the bytes passed to the most recent `store`,
///   or `None` if nothing was ever stored
/// - `store` replaces the image atomically: a reader never observes a
///   partially written image, even across a crash
/// - Backends must be `Send + Sync` for concurrent access
///
/// # Implementors
///
/// - [`super::InMemoryBackend`] - For testing
/// - [`super::FileBackend`] - For persistent storage
pub trait StorageBackend: Send + Sync {
    /// Loads the current image.
    ///
    /// Returns `None` if no image has ever been stored.
    ///
    /// # Errors
    ///
    /// Returns an error if an I/O error occurs.
    fn load(&self) -> StorageResult<Option<Vec<u8>>>;

    /// Replaces the stored image with `data`.
    ///
    /// The replacement is atomic: after a crash either the previous or
    /// the new image is present in full, never a mixture.
    ///
    /// # Errors
    ///
    /// Returns an error if an I/O error occurs.
    fn store(&self, data: &[u8]) -> StorageResult<()>;

    /// Syncs the image and its metadata to durable storage.
    ///
    /// After this returns successfully, the most recently stored image
    /// is guaranteed to survive process termination.
    ///
    /// # Errors
    ///
    /// Returns an error if the sync operation fails.
    fn sync(&self) -> StorageResult<()>;

    /// Returns the size of the stored image in bytes (0 if none).
    ///
    /// # Errors
    ///
    /// Returns an error if the size cannot be determined.
    fn len(&self) -> StorageResult<u64>;

    /// Returns true if no image has ever been stored.
    ///
    /// # Errors
    ///
    /// Returns an error if the state cannot be determined.
    fn is_empty(&self) -> StorageResult<bool> {
        Ok(self.len()? == 0)
    }
}
