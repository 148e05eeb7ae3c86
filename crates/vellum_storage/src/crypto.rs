//! Encryption providers.
//!
//! An [`EncryptionProvider`] is a stateless transform: it holds a key and
//! turns plaintext into self-contained ciphertext and back. The only
//! implementation shipped is [`AesGcmEncryption`] (AES-256-GCM).
//!
//! ## Security Model
//!
//! - Every call to `encrypt` draws a fresh random 96-bit nonce
//! - Output layout: `nonce (12 bytes) || ciphertext || tag (16 bytes)`
//! - Keys are never generated implicitly and are zeroized on drop
//! - Tampered, truncated or foreign ciphertext fails with
//!   [`StorageError::Integrity`], never with partial plaintext

use crate::error::{StorageError, StorageResult};
use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use rand::RngCore;
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Size of AES-256 key in bytes.
pub const KEY_SIZE: usize = 32;
/// Size of GCM nonce in bytes.
pub const NONCE_SIZE: usize = 12;
/// Size of GCM authentication tag in bytes.
pub const TAG_SIZE: usize = 16;

/// Encryption key for AES-256-GCM.
///
/// The key is automatically zeroized when dropped.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct EncryptionKey {
    bytes: [u8; KEY_SIZE],
}

impl EncryptionKey {
    /// Generates a new random encryption key.
    #[must_use]
    pub fn generate() -> Self {
        let mut bytes = [0u8; KEY_SIZE];
        rand::thread_rng().fill_bytes(&mut bytes);
        Self { bytes }
    }

    /// Creates a key from raw bytes.
    ///
    /// # Errors
    ///
    /// Returns an error if the bytes slice is not exactly 32 bytes.
    pub fn from_bytes(bytes: &[u8]) -> StorageResult<Self> {
        if bytes.len() != KEY_SIZE {
            return Err(StorageError::Encryption(format!(
                "invalid key size: expected {KEY_SIZE}, got {}",
                bytes.len()
            )));
        }
        let mut key_bytes = [0u8; KEY_SIZE];
        key_bytes.copy_from_slice(bytes);
        Ok(Self { bytes: key_bytes })
    }

    /// Derives a key from a passphrase using HKDF-SHA256.
    ///
    /// HKDF is not a password hash; the passphrase should already carry
    /// high entropy.
    pub fn derive_from_passphrase(passphrase: &[u8], salt: &[u8]) -> StorageResult<Self> {
        use hkdf::Hkdf;
        use sha2::Sha256;

        let hk = Hkdf::<Sha256>::new(Some(salt), passphrase);
        let mut bytes = [0u8; KEY_SIZE];
        hk.expand(b"vellum-encryption-key-v1", &mut bytes)
            .map_err(|_| StorageError::Encryption("HKDF expand failed".to_string()))?;
        Ok(Self { bytes })
    }

    /// Returns the key as a byte slice.
    ///
    /// Don't log or serialize the result.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.bytes
    }
}

impl std::fmt::Debug for EncryptionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EncryptionKey")
            .field("bytes", &"[REDACTED]")
            .finish()
    }
}

/// A stateless, keyed cipher transform.
pub trait EncryptionProvider: Send + Sync {
    /// Short algorithm name for logs and metadata.
    fn algorithm(&self) -> &'static str;

    /// Number of bytes `encrypt` adds to a plaintext.
    fn overhead(&self) -> usize;

    /// Encrypts `plaintext` into a self-contained ciphertext.
    fn encrypt(&self, plaintext: &[u8]) -> StorageResult<Vec<u8>>;

    /// Decrypts a ciphertext produced by [`encrypt`](Self::encrypt).
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Integrity`] if the input is short, tampered
    /// with, or was produced under a different key.
    fn decrypt(&self, ciphertext: &[u8]) -> StorageResult<Vec<u8>>;

    /// Generates a fresh key suitable for this provider.
    fn generate_key(&self) -> EncryptionKey {
        EncryptionKey::generate()
    }

    /// Returns true if `key` is usable with this provider.
    fn validate_key(&self, key: &[u8]) -> bool;
}

/// AES-256-GCM encryption provider.
pub struct AesGcmEncryption {
    cipher: Aes256Gcm,
}

impl AesGcmEncryption {
    /// Creates a provider bound to `key`.
    #[must_use]
    pub fn new(key: &EncryptionKey) -> Self {
        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key.as_bytes()));
        Self { cipher }
    }
}

impl std::fmt::Debug for AesGcmEncryption {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AesGcmEncryption").finish_non_exhaustive()
    }
}

impl EncryptionProvider for AesGcmEncryption {
    fn algorithm(&self) -> &'static str {
        "aes-256-gcm"
    }

    fn overhead(&self) -> usize {
        NONCE_SIZE + TAG_SIZE
    }

    fn encrypt(&self, plaintext: &[u8]) -> StorageResult<Vec<u8>> {
        let mut nonce_bytes = [0u8; NONCE_SIZE];
        rand::thread_rng().fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let ciphertext = self
            .cipher
            .encrypt(nonce, plaintext)
            .map_err(|_| StorageError::Encryption("encryption error".to_string()))?;

        let mut result = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
        result.extend_from_slice(&nonce_bytes);
        result.extend(ciphertext);
        Ok(result)
    }

    fn decrypt(&self, ciphertext: &[u8]) -> StorageResult<Vec<u8>> {
        if ciphertext.len() < NONCE_SIZE + TAG_SIZE {
            return Err(StorageError::integrity("ciphertext too short"));
        }

        let nonce = Nonce::from_slice(&ciphertext[..NONCE_SIZE]);
        self.cipher
            .decrypt(nonce, &ciphertext[NONCE_SIZE..])
            .map_err(|_| StorageError::integrity("authentication failed"))
    }

    fn validate_key(&self, key: &[u8]) -> bool {
        key.len() == KEY_SIZE
    }
}
