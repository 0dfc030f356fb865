//! File-based storage backend for persistent storage.

use crate::backend::StorageBackend;
use crate::error::StorageResult;
use parking_lot::Mutex;
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

/// A file-based storage backend.
///
/// This backend persists the table image using OS file APIs. Data
/// survives process restarts.
///
/// # Durability
///
/// `store` uses the write-then-rename pattern for crash safety:
/// 1. Write the image to a temporary file next to the target
/// 2. Sync the temporary file to disk
/// 3. Rename the temporary file over the target
/// 4. Fsync the directory so the rename itself is durable
///
/// A crash at any point leaves either the previous or the new image in
/// place, never a torn mixture.
///
/// # Thread Safety
///
/// This backend is thread-safe; an internal lock serializes writers.
///
/// # Example
///
/// ```no_run
/// use flatdb_storage::{StorageBackend, FileBackend};
/// use std::path::Path;
///
/// let backend = FileBackend::open(Path::new("users.tbl")).unwrap();
/// backend.store(b"table image").unwrap();
/// backend.sync().unwrap();
/// ```
#[derive(Debug)]
pub struct FileBackend {
    path: PathBuf,
    temp_path: PathBuf,
    write_lock: Mutex<()>,
}

impl FileBackend {
    /// Opens a file backend at the given path.
    ///
    /// The file itself is not created until the first `store`; a path
    /// with no file behind it reports an empty backend.
    ///
    /// # Errors
    ///
    /// Returns an error if the path has no parent directory component.
    pub fn open(path: &Path) -> StorageResult<Self> {
        let mut temp_name = path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_default();
        temp_name.push(".tmp");
        let temp_path = path.with_file_name(temp_name);

        Ok(Self {
            path: path.to_path_buf(),
            temp_path,
            write_lock: Mutex::new(()),
        })
    }

    /// Opens a file backend, creating parent directories if needed.
    ///
    /// # Errors
    ///
    /// Returns an error if directories cannot be created.
    pub fn open_with_create_dirs(path: &Path) -> StorageResult<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        Self::open(path)
    }

    /// Returns the path to the underlying file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    #[cfg(unix)]
    fn sync_parent_dir(&self) -> StorageResult<()> {
        if let Some(parent) = self.path.parent() {
            if parent.as_os_str().is_empty() {
                return Ok(());
            }
            let dir = File::open(parent)?;
            dir.sync_all()?;
        }
        Ok(())
    }

    #[cfg(not(unix))]
    fn sync_parent_dir(&self) -> StorageResult<()> {
        // Windows NTFS journal provides metadata durability for renames
        Ok(())
    }
}

impl StorageBackend for FileBackend {
    fn load(&self) -> StorageResult<Option<Vec<u8>>> {
        if !self.path.exists() {
            return Ok(None);
        }
        Ok(Some(fs::read(&self.path)?))
    }

    fn store(&self, data: &[u8]) -> StorageResult<()> {
        let _guard = self.write_lock.lock();

        let mut file = File::create(&self.temp_path)?;
        file.write_all(data)?;
        file.sync_all()?;
        drop(file);

        fs::rename(&self.temp_path, &self.path)?;
        self.sync_parent_dir()?;

        Ok(())
    }

    fn sync(&self) -> StorageResult<()> {
        let _guard = self.write_lock.lock();
        if self.path.exists() {
            let file = File::open(&self.path)?;
            file.sync_all()?;
        }
        Ok(())
    }

    fn len(&self) -> StorageResult<u64> {
        if !self.path.exists() {
            return Ok(0);
        }
        Ok(fs::metadata(&self.path)?.len())
    }
}
