//! Database directory management.
//!
//! This module handles the file system layout of a file-backed database:
//!
//! ```text
//! <db_path>/
//! ├─ LOCK              # Advisory lock for single-process access
//! ├─ data/             # Collection blobs (<name>.data, <name>.metadata)
//! ├─ wal/              # wal.log and wal.index
//! └─ backups/          # Default backup directory
//! ```
//!
//! The LOCK file ensures only one process opens the database at a time.

use crate::error::{CoreError, CoreResult};
use fs2::FileExt;
use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};

const LOCK_FILE: &str = "LOCK";
const DATA_DIR: &str = "data";
const WAL_DIR: &str = "wal";
/// Default backup directory name under the database root.
pub const BACKUPS_DIR: &str = "backups";

/// Holds the database directory and its exclusive lock.
///
/// The lock is released when the value is dropped.
#[derive(Debug)]
pub struct DatabaseDir {
    path: PathBuf,
    _lock_file: File,
}

impl DatabaseDir {
    /// Opens or creates a database directory and its subdirectories.
    ///
    /// # Errors
    ///
    /// - `Configuration` if the directory is missing and `create_if_missing`
    ///   is false, or the path is not a directory
    /// - `DatabaseLocked` if another handle holds the lock
    pub fn open(path: &Path, create_if_missing: bool) -> CoreResult<Self> {
        if !path.exists() {
            if create_if_missing {
                fs::create_dir_all(path)?;
            } else {
                return Err(CoreError::configuration(format!(
                    "database directory does not exist: {}",
                    path.display()
                )));
            }
        }
        if !path.is_dir() {
            return Err(CoreError::configuration(format!(
                "path is not a directory: {}",
                path.display()
            )));
        }

        let lock_file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path.join(LOCK_FILE))?;
        if lock_file.try_lock_exclusive().is_err() {
            return Err(CoreError::DatabaseLocked);
        }

        fs::create_dir_all(path.join(DATA_DIR))?;
        fs::create_dir_all(path.join(WAL_DIR))?;
        sync_directory(path)?;

        Ok(Self {
            path: path.to_path_buf(),
            _lock_file: lock_file,
        })
    }

    /// Returns the root directory.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns the directory holding collection blobs.
    #[must_use]
    pub fn data_dir(&self) -> PathBuf {
        self.path.join(DATA_DIR)
    }

    /// Returns the directory holding the WAL.
    #[must_use]
    pub fn wal_dir(&self) -> PathBuf {
        self.path.join(WAL_DIR)
    }

    /// Returns the default backup directory.
    #[must_use]
    pub fn backups_dir(&self) -> PathBuf {
        self.path.join(BACKUPS_DIR)
    }
}

#[cfg(unix)]
fn sync_directory(path: &Path) -> CoreResult<()> {
    File::open(path)?.sync_all()?;
    Ok(())
}

#[cfg(not(unix))]
fn sync_directory(_path: &Path) -> CoreResult<()> {
    Ok(())
}
