//! In-memory storage backend.

use crate::backend::{compile_pattern, matches, Backend};
use crate::cancel::CancellationToken;
use crate::error::{StorageError, StorageResult};
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};

/// An in-memory storage backend.
///
/// This backend stores every location as a byte vector in a map and is
/// suitable for:
/// - Unit tests
/// - Integration tests
/// - Ephemeral databases that don't need persistence
///
/// # Thread Safety
///
/// This backend is thread-safe and can be shared across threads.
///
/// # Example
///
/// ```rust
/// use vellum_storage::{Backend, MemoryStorage};
///
/// let backend = MemoryStorage::new();
/// backend.write("greeting", 0, b"hello").unwrap();
/// backend.write("greeting", 5, b" world").unwrap();
/// assert_eq!(backend.read_all("greeting").unwrap(), b"hello world");
/// assert_eq!(backend.size("greeting").unwrap(), Some(11));
/// ```
#[derive(Debug, Default)]
pub struct MemoryStorage {
    slots: RwLock<BTreeMap<String, Vec<u8>>>,
    disposed: AtomicBool,
}

impl MemoryStorage {
    /// Creates a new empty in-memory backend.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a backend pre-populated with `(location, bytes)` pairs.
    ///
    /// Useful for testing recovery scenarios.
    #[must_use]
    pub fn with_locations<I, S>(locations: I) -> Self
    where
        I: IntoIterator<Item = (S, Vec<u8>)>,
        S: Into<String>,
    {
        let slots = locations
            .into_iter()
            .map(|(location, data)| (location.into(), data))
            .collect();
        Self {
            slots: RwLock::new(slots),
            disposed: AtomicBool::new(false),
        }
    }

    /// Returns a copy of every location and its bytes.
    #[must_use]
    pub fn snapshot(&self) -> BTreeMap<String, Vec<u8>> {
        self.slots.read().clone()
    }

    /// Removes every location.
    pub fn clear(&self) {
        self.slots.write().clear();
    }

    fn ensure_open(&self) -> StorageResult<()> {
        if self.disposed.load(Ordering::SeqCst) {
            return Err(StorageError::Disposed);
        }
        Ok(())
    }
}

impl Backend for MemoryStorage {
    fn read(&self, location: &str, offset: u64, len: usize) -> StorageResult<Vec<u8>> {
        self.ensure_open()?;
        let slots = self.slots.read();
        let data = slots
            .get(location)
            .ok_or_else(|| StorageError::not_found(location))?;

        let size = data.len() as u64;
        let end = offset.saturating_add(len as u64);
        if offset > size || end > size {
            return Err(StorageError::ReadPastEnd {
                location: location.to_string(),
                offset,
                len,
                size,
            });
        }

        let start = offset as usize;
        Ok(data[start..start + len].to_vec())
    }

    fn write(&self, location: &str, offset: u64, data: &[u8]) -> StorageResult<()> {
        self.ensure_open()?;
        let start = usize::try_from(offset)
            .map_err(|_| StorageError::invalid_location(location, "offset exceeds address space"))?;

        let mut slots = self.slots.write();
        let slot = slots.entry(location.to_string()).or_default();
        let end = start + data.len();
        if slot.len() < end {
            slot.resize(end, 0);
        }
        slot[start..end].copy_from_slice(data);
        Ok(())
    }

    fn delete(&self, location: &str) -> StorageResult<()> {
        self.ensure_open()?;
        self.slots.write().remove(location);
        Ok(())
    }

    fn exists(&self, location: &str) -> StorageResult<bool> {
        self.ensure_open()?;
        Ok(self.slots.read().contains_key(location))
    }

    fn size(&self, location: &str) -> StorageResult<Option<u64>> {
        self.ensure_open()?;
        Ok(self.slots.read().get(location).map(|d| d.len() as u64))
    }

    fn list_cancellable(
        &self,
        pattern: Option<&str>,
        cancel: &CancellationToken,
    ) -> StorageResult<Vec<String>> {
        self.ensure_open()?;
        let matcher = compile_pattern(pattern)?;
        let slots = self.slots.read();

        let mut locations = Vec::new();
        for location in slots.keys() {
            cancel.check()?;
            if matches(matcher.as_ref(), location) {
                locations.push(location.clone());
            }
        }
        Ok(locations)
    }

    fn flush(&self) -> StorageResult<()> {
        // No pending writes in memory
        self.ensure_open()
    }

    fn dispose(&self) -> StorageResult<()> {
        self.disposed.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn read_all(&self, location: &str) -> StorageResult<Vec<u8>> {
        self.ensure_open()?;
        self.slots
            .read()
            .get(location)
            .cloned()
            .ok_or_else(|| StorageError::not_found(location))
    }

    fn replace(&self, location: &str, data: &[u8]) -> StorageResult<()> {
        self.ensure_open()?;
        self.slots.write().insert(location.to_string(), data.to_vec());
        Ok(())
    }
}
