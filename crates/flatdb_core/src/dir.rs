//! Database directory layout and process-exclusive locking.

use crate::error::{DbError, DbResult};
use fs2::FileExt;
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};

/// File name of the advisory lock inside a database directory.
pub const LOCK_FILE: &str = "LOCK";

/// Extension of table image files.
pub const TABLE_EXT: &str = "tbl";

/// An open database directory, holding the exclusive advisory lock.
///
/// The lock is released when the value is dropped.
#[derive(Debug)]
pub struct DbDir {
    root: PathBuf,
    lock: File,
}

impl DbDir {
    /// Opens a database directory and takes the exclusive lock.
    ///
    /// The directory must already exist; callers create it first when
    /// their configuration allows.
    ///
    /// # Errors
    ///
    /// Fails with [`DbError::DatabaseLocked`] if another process holds
    /// the lock, or an I/O error if the lock file cannot be created.
    pub fn open(root: impl Into<PathBuf>) -> DbResult<Self> {
        let root = root.into();
        let lock = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(root.join(LOCK_FILE))?;
        lock.try_lock_exclusive()
            .map_err(|_| DbError::DatabaseLocked)?;

        tracing::debug!(path = %root.display(), "locked database directory");
        Ok(Self { root, lock })
    }

    /// Returns the directory root.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Returns the image file path for a table name.
    #[must_use]
    pub fn table_path(&self, name: &str) -> PathBuf {
        self.root.join(format!("{name}.{TABLE_EXT}"))
    }
}

impl Drop for DbDir {
    fn drop(&mut self) {
        let _ = fs2::FileExt::unlock(&self.lock);
    }
}
