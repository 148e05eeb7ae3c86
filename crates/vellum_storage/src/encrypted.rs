//! Encrypted storage backend wrapper.
//!
//! [`EncryptedBackend`] wraps any other backend and encrypts every write
//! with an [`EncryptionProvider`] before it reaches the inner medium.
//!
//! ## Frame Layout
//!
//! Each logical write becomes one physical frame:
//!
//! ```text
//! frameLength (u32 LE) | nonce (12) | ciphertext | tag (16)
//! ```
//!
//! `frameLength` counts everything after the length prefix, so the
//! plaintext length of a frame is `frameLength - overhead` and the logical
//! size of a location is known without decrypting anything.
//!
//! ## Write Semantics
//!
//! - `offset == 0` replaces the location with a single fresh frame
//! - any other offset appends a frame at the current *physical* end
//!
//! Random-access writes into the middle of a location are therefore not
//! supported; every caller in this workspace either rewrites a whole blob
//! or appends.

use crate::backend::Backend;
use crate::cancel::CancellationToken;
use crate::crypto::EncryptionProvider;
use crate::error::{StorageError, StorageResult};
use parking_lot::Mutex;
use std::sync::Arc;

/// Size of the per-frame length prefix.
const FRAME_HEADER_SIZE: usize = 4;

/// A backend decorator providing authenticated encryption at rest.
///
/// # Example
///
/// ```rust
/// use std::sync::Arc;
/// use vellum_storage::{AesGcmEncryption, Backend, EncryptedBackend, EncryptionKey, MemoryStorage};
///
/// let key = EncryptionKey::generate();
/// let backend = EncryptedBackend::new(
///     Arc::new(MemoryStorage::new()),
///     Arc::new(AesGcmEncryption::new(&key)),
/// );
/// backend.write("secret", 0, b"hello").unwrap();
/// backend.write("secret", 5, b" world").unwrap();
/// assert_eq!(backend.read_all("secret").unwrap(), b"hello world");
/// ```
pub struct EncryptedBackend {
    inner: Arc<dyn Backend>,
    provider: Arc<dyn EncryptionProvider>,
    /// Serializes the size-then-append sequence of non-zero offset writes.
    append_lock: Mutex<()>,
}

impl EncryptedBackend {
    /// Creates a new encrypted backend wrapping `inner`.
    pub fn new(inner: Arc<dyn Backend>, provider: Arc<dyn EncryptionProvider>) -> Self {
        Self {
            inner,
            provider,
            append_lock: Mutex::new(()),
        }
    }

    /// Returns the wrapped backend.
    #[must_use]
    pub fn inner(&self) -> &Arc<dyn Backend> {
        &self.inner
    }

    fn encode_frame(&self, plaintext: &[u8]) -> StorageResult<Vec<u8>> {
        let sealed = self.provider.encrypt(plaintext)?;
        let frame_len = u32::try_from(sealed.len())
            .map_err(|_| StorageError::Encryption("frame exceeds 4 GiB".to_string()))?;

        let mut frame = Vec::with_capacity(FRAME_HEADER_SIZE + sealed.len());
        frame.extend_from_slice(&frame_len.to_le_bytes());
        frame.extend(sealed);
        Ok(frame)
    }

    /// Splits a physical blob into sealed frame bodies.
    fn split_frames<'a>(&self, location: &str, raw: &'a [u8]) -> StorageResult<Vec<&'a [u8]>> {
        let mut frames = Vec::new();
        let mut pos = 0usize;
        while pos < raw.len() {
            let header = raw.get(pos..pos + FRAME_HEADER_SIZE).ok_or_else(|| {
                StorageError::integrity(format!("{location}: truncated frame header at {pos}"))
            })?;
            let len = u32::from_le_bytes([header[0], header[1], header[2], header[3]]) as usize;
            if len < self.provider.overhead() {
                return Err(StorageError::integrity(format!(
                    "{location}: frame at {pos} shorter than cipher overhead"
                )));
            }
            let start = pos + FRAME_HEADER_SIZE;
            let body = raw.get(start..start + len).ok_or_else(|| {
                StorageError::integrity(format!("{location}: truncated frame at {pos}"))
            })?;
            frames.push(body);
            pos = start + len;
        }
        Ok(frames)
    }

    /// Returns the length of the longest prefix of `raw` made of whole
    /// frames. Only a frame running past the end counts as torn.
    fn complete_prefix_len(&self, location: &str, raw: &[u8]) -> StorageResult<usize> {
        let mut pos = 0usize;
        while pos < raw.len() {
            let Some(header) = raw.get(pos..pos + FRAME_HEADER_SIZE) else {
                break;
            };
            let len = u32::from_le_bytes([header[0], header[1], header[2], header[3]]) as usize;
            let end = pos + FRAME_HEADER_SIZE + len;
            if end > raw.len() {
                break;
            }
            if len < self.provider.overhead() {
                return Err(StorageError::integrity(format!(
                    "{location}: frame at {pos} shorter than cipher overhead"
                )));
            }
            pos = end;
        }
        Ok(pos)
    }

    fn decrypt_location(&self, location: &str) -> StorageResult<Vec<u8>> {
        let raw = self.inner.read_all(location)?;
        let mut plaintext = Vec::new();
        for frame in self.split_frames(location, &raw)? {
            let chunk = self.provider.decrypt(frame).map_err(|e| {
                tracing::warn!(location, error = %e, "failed to decrypt frame");
                e
            })?;
            plaintext.extend(chunk);
        }
        Ok(plaintext)
    }
}

impl std::fmt::Debug for EncryptedBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EncryptedBackend")
            .field("algorithm", &self.provider.algorithm())
            .finish_non_exhaustive()
    }
}

impl Backend for EncryptedBackend {
    fn read(&self, location: &str, offset: u64, len: usize) -> StorageResult<Vec<u8>> {
        let plaintext = self.decrypt_location(location)?;
        let size = plaintext.len() as u64;
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
        Ok(plaintext[start..start + len].to_vec())
    }

    fn write(&self, location: &str, offset: u64, data: &[u8]) -> StorageResult<()> {
        let frame = self.encode_frame(data)?;
        if offset == 0 {
            return self.inner.replace(location, &frame);
        }

        let _guard = self.append_lock.lock();
        let physical_end = self.inner.size(location)?.unwrap_or(0);
        self.inner.write(location, physical_end, &frame)
    }

    fn delete(&self, location: &str) -> StorageResult<()> {
        self.inner.delete(location)
    }

    fn exists(&self, location: &str) -> StorageResult<bool> {
        self.inner.exists(location)
    }

    fn size(&self, location: &str) -> StorageResult<Option<u64>> {
        let Some(physical) = self.inner.size(location)? else {
            return Ok(None);
        };

        let overhead = self.provider.overhead() as u64;
        let mut logical = 0u64;
        let mut pos = 0u64;
        while pos < physical {
            if pos + FRAME_HEADER_SIZE as u64 > physical {
                return Err(StorageError::integrity(format!(
                    "{location}: truncated frame header at {pos}"
                )));
            }
            let header = self.inner.read(location, pos, FRAME_HEADER_SIZE)?;
            let len = u64::from(u32::from_le_bytes([
                header[0], header[1], header[2], header[3],
            ]));
            if len < overhead {
                return Err(StorageError::integrity(format!(
                    "{location}: frame at {pos} shorter than cipher overhead"
                )));
            }
            logical += len - overhead;
            pos += FRAME_HEADER_SIZE as u64 + len;
        }
        if pos != physical {
            return Err(StorageError::integrity(format!("{location}: truncated frame")));
        }
        Ok(Some(logical))
    }

    fn list_cancellable(
        &self,
        pattern: Option<&str>,
        cancel: &CancellationToken,
    ) -> StorageResult<Vec<String>> {
        self.inner.list_cancellable(pattern, cancel)
    }

    fn flush(&self) -> StorageResult<()> {
        self.inner.flush()
    }

    fn dispose(&self) -> StorageResult<()> {
        self.inner.dispose()
    }

    fn read_all(&self, location: &str) -> StorageResult<Vec<u8>> {
        self.decrypt_location(location)
    }

    fn replace(&self, location: &str, data: &[u8]) -> StorageResult<()> {
        let frame = self.encode_frame(data)?;
        self.inner.replace(location, &frame)
    }

    fn trim_torn_tail(&self, location: &str) -> StorageResult<u64> {
        let _guard = self.append_lock.lock();
        if self.inner.size(location)?.is_none() {
            return Ok(0);
        }
        let raw = self.inner.read_all(location)?;
        let keep = self.complete_prefix_len(location, &raw)?;
        if keep == raw.len() {
            return Ok(0);
        }
        tracing::warn!(
            location,
            kept = keep,
            total = raw.len(),
            "discarding partially written frame"
        );
        self.inner.replace(location, &raw[..keep])?;
        Ok((raw.len() - keep) as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::{AesGcmEncryption, EncryptionKey, KEY_SIZE, NONCE_SIZE};
    use crate::MemoryStorage;
    use proptest::prelude::*;

    fn provider(byte: u8) -> Arc<dyn EncryptionProvider> {
        Arc::new(AesGcmEncryption::new(
            &EncryptionKey::from_bytes(&[byte; KEY_SIZE]).unwrap(),
        ))
    }

    fn encrypted(inner: &Arc<MemoryStorage>) -> EncryptedBackend {
        EncryptedBackend::new(inner.clone(), provider(0x42))
    }

    #[test]
    fn ciphertext_does_not_leak_plaintext() {
        let inner = Arc::new(MemoryStorage::new());
        let backend = encrypted(&inner);
        backend.write("loc", 0, b"top secret payload").unwrap();

        let raw = inner.read_all("loc").unwrap();
        assert!(!raw.windows(6).any(|w| w == b"secret"));
        assert_eq!(raw.len(), FRAME_HEADER_SIZE + 18 + 28);
    }

    #[test]
    fn append_at_nonzero_offset_concatenates() {
        let inner = Arc::new(MemoryStorage::new());
        let backend = encrypted(&inner);
        backend.write("loc", 0, b"AAAA").unwrap();
        // The literal offset is ignored; the frame lands at the physical end.
        backend.write("loc", 1, b"BB").unwrap();

        assert_eq!(backend.read_all("loc").unwrap(), b"AAAABB");
        assert_eq!(backend.size("loc").unwrap(), Some(6));
        assert_eq!(backend.read("loc", 3, 2).unwrap(), b"AB");
    }

    #[test]
    fn offset_zero_truncates() {
        let inner = Arc::new(MemoryStorage::new());
        let backend = encrypted(&inner);
        backend.write("loc", 0, b"a long first payload").unwrap();
        backend.write("loc", 20, b"more").unwrap();
        backend.write("loc", 0, b"short").unwrap();

        assert_eq!(backend.read_all("loc").unwrap(), b"short");
        assert_eq!(backend.size("loc").unwrap(), Some(5));
    }

    #[test]
    fn tampering_is_an_integrity_failure() {
        let inner = Arc::new(MemoryStorage::new());
        let backend = encrypted(&inner);
        backend.write("loc", 0, b"payload").unwrap();

        let mut raw = inner.read_all("loc").unwrap();
        raw[FRAME_HEADER_SIZE + NONCE_SIZE] ^= 0x01;
        inner.replace("loc", &raw).unwrap();

        assert!(matches!(
            backend.read_all("loc"),
            Err(StorageError::Integrity(_))
        ));
    }

    #[test]
    fn wrong_key_is_an_integrity_failure() {
        let inner = Arc::new(MemoryStorage::new());
        encrypted(&inner).write("loc", 0, b"payload").unwrap();

        let other = EncryptedBackend::new(inner.clone(), provider(0x43));
        assert!(matches!(
            other.read("loc", 0, 7),
            Err(StorageError::Integrity(_))
        ));
    }

    #[test]
    fn truncated_frame_is_detected() {
        let inner = Arc::new(MemoryStorage::new());
        let backend = encrypted(&inner);
        backend.write("loc", 0, b"payload").unwrap();

        let raw = inner.read_all("loc").unwrap();
        inner.replace("loc", &raw[..raw.len() - 3]).unwrap();

        assert!(backend.size("loc").is_err());
        assert!(matches!(
            backend.read_all("loc"),
            Err(StorageError::Integrity(_))
        ));
    }

    #[test]
    fn torn_final_frame_is_trimmed() {
        let inner = Arc::new(MemoryStorage::new());
        let backend = encrypted(&inner);
        backend.write("log", 0, b"first").unwrap();
        backend.write("log", 5, b"second").unwrap();
        let whole = inner.read_all("log").unwrap();
        backend.write("log", 11, b"third").unwrap();

        let raw = inner.read_all("log").unwrap();
        inner.replace("log", &raw[..raw.len() - 3]).unwrap();
        assert!(backend.read_all("log").is_err());

        assert_eq!(
            backend.trim_torn_tail("log").unwrap(),
            (raw.len() - 3 - whole.len()) as u64
        );
        assert_eq!(backend.read_all("log").unwrap(), b"firstsecond");
        assert_eq!(backend.trim_torn_tail("log").unwrap(), 0);
        assert_eq!(backend.trim_torn_tail("missing").unwrap(), 0);
    }

    #[test]
    fn trim_keeps_tampered_whole_frames() {
        let inner = Arc::new(MemoryStorage::new());
        let backend = encrypted(&inner);
        backend.write("loc", 0, b"payload").unwrap();

        let mut raw = inner.read_all("loc").unwrap();
        raw[FRAME_HEADER_SIZE + NONCE_SIZE] ^= 0x01;
        inner.replace("loc", &raw).unwrap();

        assert_eq!(backend.trim_torn_tail("loc").unwrap(), 0);
        assert!(matches!(
            backend.read_all("loc"),
            Err(StorageError::Integrity(_))
        ));
    }

    #[test]
    fn size_of_missing_location_is_none() {
        let inner = Arc::new(MemoryStorage::new());
        let backend = encrypted(&inner);
        assert_eq!(backend.size("missing").unwrap(), None);
        assert!(matches!(
            backend.read_all("missing"),
            Err(StorageError::NotFound { .. })
        ));
    }

    #[test]
    fn read_past_logical_end_fails() {
        let inner = Arc::new(MemoryStorage::new());
        let backend = encrypted(&inner);
        backend.write("loc", 0, b"abc").unwrap();
        assert!(matches!(
            backend.read("loc", 2, 5),
            Err(StorageError::ReadPastEnd { .. })
        ));
    }

    proptest! {
        #[test]
        fn append_invariant(
            a in proptest::collection::vec(any::<u8>(), 0..256),
            b in proptest::collection::vec(any::<u8>(), 0..256),
            offset in 1u64..10_000,
        ) {
            let inner = Arc::new(MemoryStorage::new());
            let backend = encrypted(&inner);
            backend.write("loc", 0, &a).unwrap();
            backend.write("loc", offset, &b).unwrap();

            let mut expected = a.clone();
            expected.extend_from_slice(&b);
            prop_assert_eq!(backend.read_all("loc").unwrap(), expected);
            prop_assert_eq!(backend.size("loc").unwrap(), Some((a.len() + b.len()) as u64));
        }
    }
}
