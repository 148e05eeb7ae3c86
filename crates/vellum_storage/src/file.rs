//! File-based storage backend for persistent storage.

use crate::backend::{compile_pattern, matches, Backend};
use crate::cancel::CancellationToken;
use crate::error::{StorageError, StorageResult};
use parking_lot::Mutex;
use std::collections::BTreeSet;
use std::fs::{self, File, OpenOptions};
use std::io::{BufReader, BufWriter, ErrorKind, Read, Seek, SeekFrom, Write};
use std::path::{Component, Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use tempfile::NamedTempFile;
use walkdir::WalkDir;

/// Transfers at least this large take the buffered large-file path when the
/// large-file hint is enabled.
pub const LARGE_IO_THRESHOLD: usize = 1024 * 1024;

/// Buffer capacity used on the large-file path.
const LARGE_IO_BUFFER: usize = 256 * 1024;

/// Prefix of temporary files created by [`FileStorage::replace`].
const TEMP_PREFIX: &str = ".vellum-tmp";

/// A file-based storage backend.
///
/// Every location maps to one file below a root directory; `/` in a location
/// creates sub-directories. Data survives process restarts.
///
/// # Durability
///
/// - `write()` hands data to the OS and marks the file dirty
/// - `flush()` calls `File::sync_all()` on every dirty file
/// - `replace()` writes a temporary file, syncs it and renames it into place
///
/// # Example
///
/// ```no_run
/// use vellum_storage::{Backend, FileStorage};
/// use std::path::Path;
///
/// let backend = FileStorage::open(Path::new("data")).unwrap();
/// backend.write("users.data", 0, b"persistent data").unwrap();
/// backend.flush().unwrap();  // Ensure data is durable
/// ```
#[derive(Debug)]
pub struct FileStorage {
    root: PathBuf,
    large_file_hint: bool,
    dirty: Mutex<BTreeSet<PathBuf>>,
    disposed: AtomicBool,
}

impl FileStorage {
    /// Opens or creates a file backend rooted at `root`.
    ///
    /// # Errors
    ///
    /// Returns an error if the root directory cannot be created.
    pub fn open(root: &Path) -> StorageResult<Self> {
        Self::open_with_hint(root, false)
    }

    /// Opens a file backend with the large-file I/O hint set.
    ///
    /// The hint is advisory: transfers of at least [`LARGE_IO_THRESHOLD`]
    /// bytes go through large buffered readers and writers.
    ///
    /// # Errors
    ///
    /// Returns an error if the root directory cannot be created.
    pub fn open_with_hint(root: &Path, large_file_hint: bool) -> StorageResult<Self> {
        fs::create_dir_all(root)?;
        tracing::debug!(root = %root.display(), large_file_hint, "opened file storage");
        Ok(Self {
            root: root.to_path_buf(),
            large_file_hint,
            dirty: Mutex::new(BTreeSet::new()),
            disposed: AtomicBool::new(false),
        })
    }

    /// Returns the root directory.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Returns whether the large-file hint is enabled.
    #[must_use]
    pub fn large_file_hint(&self) -> bool {
        self.large_file_hint
    }

    /// Maps a location onto a path below the root.
    ///
    /// Rejects empty, absolute and parent-relative locations so that no
    /// location can escape the root directory.
    fn resolve(&self, location: &str) -> StorageResult<PathBuf> {
        if location.is_empty() {
            return Err(StorageError::invalid_location(location, "empty location"));
        }
        let relative = Path::new(location);
        for component in relative.components() {
            match component {
                Component::Normal(part) => {
                    if part.to_string_lossy().starts_with(TEMP_PREFIX) {
                        return Err(StorageError::invalid_location(
                            location,
                            "reserved temporary-file prefix",
                        ));
                    }
                }
                _ => {
                    return Err(StorageError::invalid_location(
                        location,
                        "only plain relative path segments are allowed",
                    ))
                }
            }
        }
        Ok(self.root.join(relative))
    }

    fn ensure_open(&self) -> StorageResult<()> {
        if self.disposed.load(Ordering::SeqCst) {
            return Err(StorageError::Disposed);
        }
        Ok(())
    }

    fn use_large_path(&self, len: usize) -> bool {
        self.large_file_hint && len >= LARGE_IO_THRESHOLD
    }

    fn location_of(&self, path: &Path) -> Option<String> {
        let relative = path.strip_prefix(&self.root).ok()?;
        let parts: Vec<String> = relative
            .components()
            .map(|c| c.as_os_str().to_string_lossy().into_owned())
            .collect();
        Some(parts.join("/"))
    }
}

impl Backend for FileStorage {
    fn read(&self, location: &str, offset: u64, len: usize) -> StorageResult<Vec<u8>> {
        self.ensure_open()?;
        let path = self.resolve(location)?;

        let mut file = match File::open(&path) {
            Ok(file) => file,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Err(StorageError::not_found(location))
            }
            Err(e) => return Err(e.into()),
        };

        let size = file.metadata()?.len();
        let end = offset.saturating_add(len as u64);
        if offset > size || end > size {
            return Err(StorageError::ReadPastEnd {
                location: location.to_string(),
                offset,
                len,
                size,
            });
        }

        if len == 0 {
            return Ok(Vec::new());
        }

        file.seek(SeekFrom::Start(offset))?;
        let mut buffer = vec![0u8; len];
        if self.use_large_path(len) {
            let mut reader = BufReader::with_capacity(LARGE_IO_BUFFER, file);
            reader.read_exact(&mut buffer)?;
        } else {
            file.read_exact(&mut buffer)?;
        }
        Ok(buffer)
    }

    fn write(&self, location: &str, offset: u64, data: &[u8]) -> StorageResult<()> {
        self.ensure_open()?;
        let path = self.resolve(location)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)?;

        // Seeking past the end and writing leaves a zero-filled gap.
        file.seek(SeekFrom::Start(offset))?;
        if self.use_large_path(data.len()) {
            let mut writer = BufWriter::with_capacity(LARGE_IO_BUFFER, file);
            writer.write_all(data)?;
            writer.flush()?;
        } else {
            file.write_all(data)?;
        }

        self.dirty.lock().insert(path);
        Ok(())
    }

    fn delete(&self, location: &str) -> StorageResult<()> {
        self.ensure_open()?;
        let path = self.resolve(location)?;
        match fs::remove_file(&path) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        self.dirty.lock().remove(&path);
        Ok(())
    }

    fn exists(&self, location: &str) -> StorageResult<bool> {
        self.ensure_open()?;
        Ok(self.resolve(location)?.is_file())
    }

    fn size(&self, location: &str) -> StorageResult<Option<u64>> {
        self.ensure_open()?;
        let path = self.resolve(location)?;
        match fs::metadata(&path) {
            Ok(meta) if meta.is_file() => Ok(Some(meta.len())),
            Ok(_) => Ok(None),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn list_cancellable(
        &self,
        pattern: Option<&str>,
        cancel: &CancellationToken,
    ) -> StorageResult<Vec<String>> {
        self.ensure_open()?;
        let matcher = compile_pattern(pattern)?;

        let mut locations = Vec::new();
        for entry in WalkDir::new(&self.root).min_depth(1) {
            cancel.check()?;
            let entry = entry.map_err(|e| {
                StorageError::Io(std::io::Error::new(ErrorKind::Other, e.to_string()))
            })?;
            if !entry.file_type().is_file() {
                continue;
            }
            if entry
                .file_name()
                .to_string_lossy()
                .starts_with(TEMP_PREFIX)
            {
                continue;
            }
            if let Some(location) = self.location_of(entry.path()) {
                if matches(matcher.as_ref(), &location) {
                    locations.push(location);
                }
            }
        }

        locations.sort();
        Ok(locations)
    }

    fn flush(&self) -> StorageResult<()> {
        self.ensure_open()?;
        let dirty: Vec<PathBuf> = std::mem::take(&mut *self.dirty.lock()).into_iter().collect();
        for path in dirty {
            match OpenOptions::new().write(true).open(&path) {
                Ok(file) => file.sync_all()?,
                // Deleted after being written; nothing left to sync.
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    fn dispose(&self) -> StorageResult<()> {
        if self.disposed.load(Ordering::SeqCst) {
            return Ok(());
        }
        self.flush()?;
        self.disposed.store(true, Ordering::SeqCst);
        Ok(())
    }

    /// Reads through one open handle, so a concurrent `replace` yields
    /// either the old file or the new one.
    fn read_all(&self, location: &str) -> StorageResult<Vec<u8>> {
        self.ensure_open()?;
        let path = self.resolve(location)?;

        let mut file = match File::open(&path) {
            Ok(file) => file,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Err(StorageError::not_found(location))
            }
            Err(e) => return Err(e.into()),
        };
        let len = usize::try_from(file.metadata()?.len()).map_err(|_| {
            StorageError::invalid_location(location, "location too large to read into memory")
        })?;

        let mut buffer = Vec::with_capacity(len);
        if self.use_large_path(len) {
            BufReader::with_capacity(LARGE_IO_BUFFER, &mut file).read_to_end(&mut buffer)?;
        } else {
            file.read_to_end(&mut buffer)?;
        }
        Ok(buffer)
    }

    fn replace(&self, location: &str, data: &[u8]) -> StorageResult<()> {
        self.ensure_open()?;
        let path = self.resolve(location)?;
        let parent = path.parent().unwrap_or(&self.root).to_path_buf();
        fs::create_dir_all(&parent)?;

        let mut temp = tempfile::Builder::new()
            .prefix(TEMP_PREFIX)
            .tempfile_in(&parent)?;
        write_and_sync(&mut temp, data)?;
        temp.persist(&path).map_err(|e| StorageError::Io(e.error))?;

        self.dirty.lock().remove(&path);
        Ok(())
    }
}

fn write_and_sync(temp: &mut NamedTempFile, data: &[u8]) -> StorageResult<()> {
    temp.write_all(data)?;
    temp.as_file().sync_all()?;
    Ok(())
}
