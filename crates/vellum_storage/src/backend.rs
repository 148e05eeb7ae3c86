//! Storage backend trait definition.

use crate::cancel::CancellationToken;
use crate::error::{StorageError, StorageResult};
use globset::{Glob, GlobMatcher};

/// A byte-range storage backend keyed by logical *location*.
///
/// Backends are **opaque byte stores**. A location is an arbitrary string
/// that the backend maps onto a physical unit (a file, a map slot). Backends
/// know nothing about collections, WAL entries or archives.
///
/// # Invariants
///
/// - `write` past the current end extends the location, zero-filling any gap
/// - `read` returns exactly the bytes previously written in that range
/// - `delete` of an absent location is a no-op
/// - after `dispose`, every operation fails with [`StorageError::Disposed`]
/// - implementations must be `Send + Sync`; concurrent access to *different*
///   locations is safe, concurrent writers to the same location must
///   coordinate among themselves
///
/// # Implementors
///
/// - [`super::MemoryStorage`] - For testing and ephemeral databases
/// - [`super::FileStorage`] - One file per location under a root directory
/// - [`super::EncryptedBackend`] - Decorator adding authenticated encryption
pub trait Backend: Send + Sync {
    /// Reads `len` bytes of `location` starting at `offset`.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - The location does not exist (`NotFound`)
    /// - The range extends beyond the current size (`ReadPastEnd`)
    /// - An I/O error occurs
    fn read(&self, location: &str, offset: u64, len: usize) -> StorageResult<Vec<u8>>;

    /// Writes `data` into `location` starting at `offset`.
    ///
    /// Creates the location if it does not exist. Writing past the current
    /// end extends the location.
    ///
    /// # Errors
    ///
    /// Returns an error if an I/O error occurs.
    fn write(&self, location: &str, offset: u64, data: &[u8]) -> StorageResult<()>;

    /// Removes `location`. Removing an absent location succeeds.
    ///
    /// # Errors
    ///
    /// Returns an error if an I/O error occurs.
    fn delete(&self, location: &str) -> StorageResult<()>;

    /// Returns true if `location` exists.
    fn exists(&self, location: &str) -> StorageResult<bool>;

    /// Returns the size of `location` in bytes, or `None` if it is absent.
    fn size(&self, location: &str) -> StorageResult<Option<u64>>;

    /// Lists locations matching an optional glob `pattern`, checking
    /// `cancel` between elements.
    ///
    /// Results are sorted lexicographically.
    ///
    /// # Errors
    ///
    /// Returns `Cancelled` if the token fires, `InvalidPattern` if the
    /// pattern does not compile.
    fn list_cancellable(
        &self,
        pattern: Option<&str>,
        cancel: &CancellationToken,
    ) -> StorageResult<Vec<String>>;

    /// Flushes all pending writes to durable storage.
    ///
    /// After this returns successfully, all previously written data
    /// is guaranteed to survive process termination.
    fn flush(&self) -> StorageResult<()>;

    /// Releases the backend. Subsequent calls fail with `Disposed`.
    fn dispose(&self) -> StorageResult<()>;

    /// Lists locations matching an optional glob `pattern`.
    fn list(&self, pattern: Option<&str>) -> StorageResult<Vec<String>> {
        self.list_cancellable(pattern, &CancellationToken::new())
    }

    /// Reads the full contents of `location`.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if the location does not exist.
    fn read_all(&self, location: &str) -> StorageResult<Vec<u8>> {
        let size = self
            .size(location)?
            .ok_or_else(|| StorageError::not_found(location))?;
        let len = usize::try_from(size).map_err(|_| {
            StorageError::invalid_location(location, "location too large to read into memory")
        })?;
        self.read(location, 0, len)
    }

    /// Replaces the full contents of `location` with `data`.
    ///
    /// The default implementation deletes and rewrites. Backends that can do
    /// better (an atomic rename, a fresh ciphertext blob) override it.
    fn replace(&self, location: &str, data: &[u8]) -> StorageResult<()> {
        self.delete(location)?;
        self.write(location, 0, data)
    }

    /// Cuts off a partially written record the backend itself framed, as
    /// left by a crash in the middle of an append. Returns the number of
    /// physical bytes removed.
    ///
    /// Backends that store bytes unframed have nothing to cut; callers with
    /// their own record format still check the logical tail.
    fn trim_torn_tail(&self, location: &str) -> StorageResult<u64> {
        let _ = location;
        Ok(0)
    }
}

/// Compiles an optional glob pattern into a matcher.
///
/// `None`, `""` and `"*"` match everything.
pub(crate) fn compile_pattern(pattern: Option<&str>) -> StorageResult<Option<GlobMatcher>> {
    match pattern {
        None | Some("") | Some("*") => Ok(None),
        Some(p) => Glob::new(p)
            .map(|glob| Some(glob.compile_matcher()))
            .map_err(|e| StorageError::InvalidPattern {
                pattern: p.to_string(),
                reason: e.to_string(),
            }),
    }
}

/// Returns true if `location` passes the optional matcher.
pub(crate) fn matches(matcher: Option<&GlobMatcher>, location: &str) -> bool {
    matcher.map_or(true, |m| m.is_match(location))
}
