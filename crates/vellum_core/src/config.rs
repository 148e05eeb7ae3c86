//! Database configuration.
//!
//! [`DatabaseConfig`] can be built in code with the builder methods or read
//! from a flat string map with [`DatabaseConfig::from_map`]:
//!
//! | Key | Effect |
//! |---|---|
//! | `StorageType` | `File` (default) or `Memory` |
//! | `FilePath` | base directory of a file database |
//! | `EnableWAL` | `true` enables the write-ahead log |
//! | `CompressionType` | `None`, `GZip` or `Deflate` |
//! | `EncryptionType` | `None` or `Aes` |
//! | `EncryptionKey` | base64 AES-256 key, required with `Aes` |
//! | `EnableBackup` | `true` enables the backup provider |
//! | `BackupPath` | backup directory, defaults to `<FilePath>/backups` |
//! | `EnableMemoryMappedIO` | large-file I/O hint |
//! | `TransactionTimeoutSeconds` | age at which active transactions are reaped |

use crate::error::{CoreError, CoreResult};
use base64::Engine;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use vellum_storage::{EncryptionKey, KEY_SIZE};

/// Default age after which an active transaction is force-rolled-back.
pub const DEFAULT_TRANSACTION_TIMEOUT: Duration = Duration::from_secs(30);

/// Which backend a database is opened on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StorageType {
    /// One file per location under `FilePath/data`.
    #[default]
    File,
    /// Process-local map; nothing survives the process.
    Memory,
}

impl FromStr for StorageType {
    type Err = CoreError;

    fn from_str(s: &str) -> CoreResult<Self> {
        match s.to_ascii_lowercase().as_str() {
            "file" => Ok(Self::File),
            "memory" => Ok(Self::Memory),
            _ => Err(CoreError::configuration(format!(
                "unknown StorageType: {s}"
            ))),
        }
    }
}

/// Compression applied to collection data blobs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CompressionType {
    /// Blobs are stored as serialized.
    #[default]
    None,
    /// Gzip framing.
    GZip,
    /// Zlib-framed deflate.
    Deflate,
}

impl FromStr for CompressionType {
    type Err = CoreError;

    fn from_str(s: &str) -> CoreResult<Self> {
        match s.to_ascii_lowercase().as_str() {
            "none" => Ok(Self::None),
            "gzip" => Ok(Self::GZip),
            "deflate" => Ok(Self::Deflate),
            _ => Err(CoreError::configuration(format!(
                "unknown CompressionType: {s}"
            ))),
        }
    }
}

/// Encryption applied to every backend location.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EncryptionType {
    /// No encryption.
    #[default]
    None,
    /// AES-256-GCM.
    Aes,
}

impl FromStr for EncryptionType {
    type Err = CoreError;

    fn from_str(s: &str) -> CoreResult<Self> {
        match s.to_ascii_lowercase().as_str() {
            "none" => Ok(Self::None),
            "aes" => Ok(Self::Aes),
            _ => Err(CoreError::configuration(format!(
                "unknown EncryptionType: {s}"
            ))),
        }
    }
}

/// Configuration for opening a database.
#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    /// Backend selection.
    pub storage_type: StorageType,

    /// Base directory for a file database.
    pub file_path: Option<PathBuf>,

    /// Whether mutations are logged to the write-ahead log.
    pub enable_wal: bool,

    /// Compression applied to collection data blobs.
    pub compression: CompressionType,

    /// Encryption applied to every location.
    pub encryption: EncryptionType,

    /// Key used when `encryption` is [`EncryptionType::Aes`].
    pub encryption_key: Option<EncryptionKey>,

    /// Whether the backup provider is available.
    pub enable_backup: bool,

    /// Backup directory; defaults to `<file_path>/backups`.
    pub backup_path: Option<PathBuf>,

    /// Use the buffered large-file path for big transfers.
    pub memory_mapped_io: bool,

    /// Age after which an active transaction is force-rolled-back.
    pub transaction_timeout: Duration,

    /// Whether to create the database directory if it doesn't exist.
    pub create_if_missing: bool,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            storage_type: StorageType::File,
            file_path: None,
            enable_wal: false,
            compression: CompressionType::None,
            encryption: EncryptionType::None,
            encryption_key: None,
            enable_backup: false,
            backup_path: None,
            memory_mapped_io: false,
            transaction_timeout: DEFAULT_TRANSACTION_TIMEOUT,
            create_if_missing: true,
        }
    }
}

impl DatabaseConfig {
    /// Creates a new configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a configuration for an in-memory database.
    #[must_use]
    pub fn in_memory() -> Self {
        Self::default().storage_type(StorageType::Memory)
    }

    /// Creates a configuration for a file database rooted at `path`.
    #[must_use]
    pub fn file(path: impl Into<PathBuf>) -> Self {
        Self::default().file_path(path)
    }

    /// Sets the backend type.
    #[must_use]
    pub const fn storage_type(mut self, value: StorageType) -> Self {
        self.storage_type = value;
        self
    }

    /// Sets the base directory.
    #[must_use]
    pub fn file_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.file_path = Some(path.into());
        self
    }

    /// Enables or disables the write-ahead log.
    #[must_use]
    pub const fn enable_wal(mut self, value: bool) -> Self {
        self.enable_wal = value;
        self
    }

    /// Sets the compression type.
    #[must_use]
    pub const fn compression(mut self, value: CompressionType) -> Self {
        self.compression = value;
        self
    }

    /// Enables AES-256-GCM encryption with `key`.
    #[must_use]
    pub fn encryption(mut self, key: EncryptionKey) -> Self {
        self.encryption = EncryptionType::Aes;
        self.encryption_key = Some(key);
        self
    }

    /// Enables or disables the backup provider.
    #[must_use]
    pub const fn enable_backup(mut self, value: bool) -> Self {
        self.enable_backup = value;
        self
    }

    /// Sets the backup directory.
    #[must_use]
    pub fn backup_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.backup_path = Some(path.into());
        self
    }

    /// Sets the large-file I/O hint.
    #[must_use]
    pub const fn memory_mapped_io(mut self, value: bool) -> Self {
        self.memory_mapped_io = value;
        self
    }

    /// Sets the transaction timeout used by deadlock detection.
    #[must_use]
    pub const fn transaction_timeout(mut self, value: Duration) -> Self {
        self.transaction_timeout = value;
        self
    }

    /// Sets whether to create the database directory if missing.
    #[must_use]
    pub const fn create_if_missing(mut self, value: bool) -> Self {
        self.create_if_missing = value;
        self
    }

    /// Reads a configuration from a flat string map.
    ///
    /// Unknown keys are ignored. Malformed values fail with a
    /// configuration error.
    pub fn from_map<I, K, V>(entries: I) -> CoreResult<Self>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        let mut config = Self::default();
        for (key, value) in entries {
            let key = key.as_ref();
            let value = value.as_ref().trim();
            match key {
                "StorageType" => config.storage_type = value.parse()?,
                "FilePath" => config.file_path = Some(PathBuf::from(value)),
                "EnableWAL" => config.enable_wal = parse_bool(key, value)?,
                "CompressionType" => config.compression = value.parse()?,
                "EncryptionType" => config.encryption = value.parse()?,
                "EncryptionKey" => config.encryption_key = Some(decode_key(value)?),
                "EnableBackup" => config.enable_backup = parse_bool(key, value)?,
                "BackupPath" => config.backup_path = Some(PathBuf::from(value)),
                "EnableMemoryMappedIO" => config.memory_mapped_io = parse_bool(key, value)?,
                "TransactionTimeoutSeconds" => {
                    let secs: u64 = value.parse().map_err(|_| {
                        CoreError::configuration(format!(
                            "TransactionTimeoutSeconds is not a number: {value}"
                        ))
                    })?;
                    config.transaction_timeout = Duration::from_secs(secs);
                }
                other => tracing::debug!(key = other, "ignoring unknown configuration key"),
            }
        }
        Ok(config)
    }

    /// Checks cross-field requirements.
    ///
    /// # Errors
    ///
    /// Returns a configuration error if:
    /// - a file database has no `file_path`
    /// - AES encryption is selected without a key
    /// - backups are enabled on a memory database without a `backup_path`
    pub fn validate(&self) -> CoreResult<()> {
        if self.storage_type == StorageType::File && self.file_path.is_none() {
            return Err(CoreError::configuration(
                "FilePath is required for file storage",
            ));
        }
        if self.encryption == EncryptionType::Aes && self.encryption_key.is_none() {
            return Err(CoreError::configuration(
                "EncryptionKey is required when EncryptionType is Aes",
            ));
        }
        if self.enable_backup && self.resolved_backup_path().is_none() {
            return Err(CoreError::configuration(
                "BackupPath is required when backups are enabled without a FilePath",
            ));
        }
        Ok(())
    }

    /// Returns the backup directory, falling back to `<file_path>/backups`.
    #[must_use]
    pub fn resolved_backup_path(&self) -> Option<PathBuf> {
        self.backup_path
            .clone()
            .or_else(|| self.file_path.as_ref().map(|p| p.join("backups")))
    }
}

fn parse_bool(key: &str, value: &str) -> CoreResult<bool> {
    match value.to_ascii_lowercase().as_str() {
        "true" => Ok(true),
        "false" => Ok(false),
        _ => Err(CoreError::configuration(format!(
            "{key} must be true or false, got {value}"
        ))),
    }
}

fn decode_key(value: &str) -> CoreResult<EncryptionKey> {
    let bytes = base64::engine::general_purpose::STANDARD
        .decode(value)
        .map_err(|e| CoreError::configuration(format!("EncryptionKey is not base64: {e}")))?;
    if bytes.len() != KEY_SIZE {
        return Err(CoreError::configuration(format!(
            "EncryptionKey must decode to {KEY_SIZE} bytes, got {}",
            bytes.len()
        )));
    }
    EncryptionKey::from_bytes(&bytes).map_err(|e| CoreError::configuration(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    #[test]
    fn default_config() {
        let config = DatabaseConfig::default();
        assert_eq!(config.storage_type, StorageType::File);
        assert!(!config.enable_wal);
        assert!(config.create_if_missing);
        assert_eq!(config.transaction_timeout, DEFAULT_TRANSACTION_TIMEOUT);
    }

    #[test]
    fn builder_pattern() {
        let config = DatabaseConfig::file("/tmp/db")
            .enable_wal(true)
            .compression(CompressionType::GZip)
            .transaction_timeout(Duration::from_secs(5));

        assert!(config.enable_wal);
        assert_eq!(config.compression, CompressionType::GZip);
        assert_eq!(config.transaction_timeout, Duration::from_secs(5));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn from_map_reads_every_key() {
        let key = base64::engine::general_purpose::STANDARD.encode([7u8; KEY_SIZE]);
        let config = DatabaseConfig::from_map([
            ("StorageType", "File"),
            ("FilePath", "/var/lib/vellum"),
            ("EnableWAL", "true"),
            ("CompressionType", "Deflate"),
            ("EncryptionType", "Aes"),
            ("EncryptionKey", key.as_str()),
            ("EnableBackup", "TRUE"),
            ("EnableMemoryMappedIO", "false"),
            ("TransactionTimeoutSeconds", "12"),
            ("SomethingElse", "ignored"),
        ])
        .unwrap();

        assert!(config.enable_wal);
        assert_eq!(config.compression, CompressionType::Deflate);
        assert_eq!(config.encryption, EncryptionType::Aes);
        assert_eq!(
            config.encryption_key.as_ref().unwrap().as_bytes(),
            &[7u8; KEY_SIZE]
        );
        assert_eq!(
            config.resolved_backup_path(),
            Some(PathBuf::from("/var/lib/vellum/backups"))
        );
        assert_eq!(config.transaction_timeout, Duration::from_secs(12));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn malformed_values_are_configuration_errors() {
        let err = DatabaseConfig::from_map([("EnableWAL", "yes")]).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ConfigurationError);

        let err = DatabaseConfig::from_map([("CompressionType", "lz4")]).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ConfigurationError);

        let err = DatabaseConfig::from_map([("EncryptionKey", "c2hvcnQ=")]).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ConfigurationError);
    }

    #[test]
    fn aes_without_key_is_rejected() {
        let config =
            DatabaseConfig::from_map([("StorageType", "Memory"), ("EncryptionType", "Aes")])
                .unwrap();
        let err = config.validate().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ConfigurationError);
    }

    #[test]
    fn file_storage_requires_path() {
        assert!(DatabaseConfig::new().validate().is_err());
        assert!(DatabaseConfig::in_memory().validate().is_ok());
    }
}
