//! In-memory storage backend for testing.

use crate::backend::StorageBackend;
use crate::error::StorageResult;
use parking_lot::RwLock;

/// An in-memory storage backend.
///
/// This backend stores the table image in memory and is suitable for:
/// - Unit tests
/// - Integration tests
/// - Ephemeral tables that don't need persistence
///
/// # Thread Safety
///
/// This backend is thread-safe and can be shared across threads.
///
/// # Example
///
/// ```rust
/// use flatdb_storage::{StorageBackend, InMemoryBackend};
///
/// let backend = InMemoryBackend::new();
/// assert!(backend.load().unwrap().is_none());
/// backend.store(b"image").unwrap();
/// assert_eq!(backend.len().unwrap(), 5);
/// ```
#[derive(Debug, Default)]
pub struct InMemoryBackend {
    image: RwLock<Option<Vec<u8>>>,
}

impl InMemoryBackend {
    /// Creates a new empty in-memory backend.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a new in-memory backend with a pre-existing image.
    ///
    /// Useful for testing reopen scenarios.
    #[must_use]
    pub fn with_image(image: Vec<u8>) -> Self {
        Self {
            image: RwLock::new(Some(image)),
        }
    }

    /// Removes the stored image, if any.
    pub fn clear(&self) {
        *self.image.write() = None;
    }
}

impl StorageBackend for InMemoryBackend {
    fn load(&self) -> StorageResult<Option<Vec<u8>>> {
        Ok(self.image.read().clone())
    }

    fn store(&self, data: &[u8]) -> StorageResult<()> {
        *self.image.write() = Some(data.to_vec());
        Ok(())
    }

    fn sync(&self) -> StorageResult<()> {
        // Nothing to sync for memory
        Ok(())
    }

    fn len(&self) -> StorageResult<u64> {
        Ok(self.image.read().as_ref().map_or(0, |d| d.len() as u64))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_new_is_empty() {
        let backend = InMemoryBackend::new();
        assert!(backend.load().unwrap().is_none());
        assert_eq!(backend.len().unwrap(), 0);
        assert!(backend.is_empty().unwrap());
    }

    #[test]
    fn memory_store_replaces_image() {
        let backend = InMemoryBackend::new();

        backend.store(b"first").unwrap();
        assert_eq!(backend.load().unwrap().as_deref(), Some(&b"first"[..]));

        backend.store(b"second image").unwrap();
        assert_eq!(
            backend.load().unwrap().as_deref(),
            Some(&b"second image"[..])
        );
        assert_eq!(backend.len().unwrap(), 12);
    }

    #[test]
    fn memory_with_image() {
        let backend = InMemoryBackend::with_image(b"preloaded".to_vec());
        assert_eq!(backend.len().unwrap(), 9);
        assert_eq!(backend.load().unwrap().as_deref(), Some(&b"preloaded"[..]));
    }

    #[test]
    fn memory_clear() {
        let backend = InMemoryBackend::new();
        backend.store(b"some data").unwrap();
        backend.clear();
        assert!(backend.load().unwrap().is_none());
        assert_eq!(backend.len().unwrap(), 0);
    }

    #[test]
    fn memory_empty_store_is_distinct_from_never_stored() {
        let backend = InMemoryBackend::new();
        backend.store(b"").unwrap();
        assert_eq!(backend.load().unwrap().as_deref(), Some(&b""[..]));
        assert_eq!(backend.len().unwrap(), 0);
    }

    #[test]
    fn memory_sync_succeeds() {
        let backend = InMemoryBackend::new();
        backend.store(b"data").unwrap();
        assert!(backend.sync().is_ok());
    }
}
