//! Database facade and recovery.

use crate::backup::{BackupMetadata, FileBackupProvider};
use crate::collection::{CollectionItem, ManagedCollection, PersistentCollection};
use crate::compression::{provider_for, CompressionProvider};
use crate::config::{DatabaseConfig, EncryptionType, StorageType};
use crate::dir::DatabaseDir;
use crate::error::{CoreError, CoreResult};
use crate::serializer::{JsonSerializer, Serializer};
use crate::transaction::{IsolationLevel, Transaction, TransactionManager};
use crate::types::{data_location, metadata_location};
use crate::wal::WriteAheadLog;
use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::any::Any;
use std::collections::{BTreeSet, HashMap};
use std::path::Path;
use std::sync::Arc;
use vellum_storage::{
    AesGcmEncryption, Backend, CancellationToken, EncryptedBackend, EncryptionProvider,
    FileStorage, MemoryStorage,
};

const METADATA_SUFFIX: &str = ".metadata";

/// Creates a backend of `storage_type`.
///
/// File backends are rooted at `root`, which is required for them.
pub fn create_backend(
    storage_type: StorageType,
    root: Option<&Path>,
    large_file_hint: bool,
) -> CoreResult<Arc<dyn Backend>> {
    match storage_type {
        StorageType::Memory => Ok(Arc::new(MemoryStorage::new())),
        StorageType::File => {
            let root = root.ok_or_else(|| {
                CoreError::configuration("FilePath is required for file storage")
            })?;
            Ok(Arc::new(FileStorage::open_with_hint(root, large_file_hint)?))
        }
    }
}

struct CollectionEntry {
    managed: Arc<dyn ManagedCollection>,
    typed: Arc<dyn Any + Send + Sync>,
}

/// The main database handle.
///
/// `Database` wires configuration into a backend, optional encryption and
/// WAL, compression and backups, and manages named collections on top.
///
/// # Opening a Database
///
/// ```
/// use vellum_core::{Database, DatabaseConfig};
///
/// let dir = tempfile::tempdir().unwrap();
/// let db = Database::open(DatabaseConfig::file(dir.path()).enable_wal(true)).unwrap();
///
/// let users = db.create_collection::<String>("users").unwrap();
/// users.add("ada".to_string()).unwrap();
/// assert_eq!(users.count(), 1);
///
/// db.close().unwrap();
/// ```
///
/// # Recovery
///
/// With the WAL enabled, opening replays committed transactions into the
/// data backend, logs a rollback for transactions that never finished and
/// checkpoints the log.
pub struct Database {
    config: DatabaseConfig,
    /// Holds the directory lock for file databases.
    dir: Option<DatabaseDir>,
    /// Collection storage as collections see it, decrypting if enabled.
    data: Arc<dyn Backend>,
    /// Physical collection storage; backups copy it byte for byte.
    raw_data: Arc<dyn Backend>,
    wal_backend: Arc<dyn Backend>,
    wal: Option<Arc<WriteAheadLog>>,
    transactions: Arc<TransactionManager>,
    compression: Arc<dyn CompressionProvider>,
    backups: Option<FileBackupProvider>,
    collections: RwLock<HashMap<String, CollectionEntry>>,
    owns_backends: bool,
    is_open: RwLock<bool>,
}

impl Database {
    /// Opens a database described by `config`.
    ///
    /// # Errors
    ///
    /// - `Configuration` if the configuration is inconsistent
    /// - `DatabaseLocked` if another handle has the directory open
    /// - any recovery error
    pub fn open(config: DatabaseConfig) -> CoreResult<Self> {
        config.validate()?;
        match config.storage_type {
            StorageType::Memory => {
                let data = create_backend(StorageType::Memory, None, false)?;
                let wal = create_backend(StorageType::Memory, None, false)?;
                Self::assemble(config, None, data, wal, true)
            }
            StorageType::File => {
                let root = config.file_path.clone().ok_or_else(|| {
                    CoreError::configuration("FilePath is required for file storage")
                })?;
                let dir = DatabaseDir::open(&root, config.create_if_missing)?;
                let hint = config.memory_mapped_io;
                let data = create_backend(StorageType::File, Some(&dir.data_dir()), hint)?;
                let wal = create_backend(StorageType::File, Some(&dir.wal_dir()), hint)?;
                tracing::info!(path = %root.display(), "opening database");
                Self::assemble(config, Some(dir), data, wal, true)
            }
        }
    }

    /// Opens a database over caller-supplied backends.
    ///
    /// `storage_type` and `file_path` are ignored. The backends are not
    /// disposed on close.
    pub fn open_with_backends(
        config: DatabaseConfig,
        data: Arc<dyn Backend>,
        wal: Arc<dyn Backend>,
    ) -> CoreResult<Self> {
        Self::assemble(config, None, data, wal, false)
    }

    /// Opens a fresh in-memory database.
    pub fn open_in_memory() -> CoreResult<Self> {
        Self::open(DatabaseConfig::in_memory())
    }

    fn assemble(
        config: DatabaseConfig,
        dir: Option<DatabaseDir>,
        raw_data: Arc<dyn Backend>,
        raw_wal: Arc<dyn Backend>,
        owns_backends: bool,
    ) -> CoreResult<Self> {
        let (data, wal_backend) = match config.encryption {
            EncryptionType::Aes => {
                let key = config.encryption_key.as_ref().ok_or_else(|| {
                    CoreError::configuration("EncryptionKey is required when EncryptionType is Aes")
                })?;
                let provider: Arc<dyn EncryptionProvider> = Arc::new(AesGcmEncryption::new(key));
                let data: Arc<dyn Backend> =
                    Arc::new(EncryptedBackend::new(Arc::clone(&raw_data), Arc::clone(&provider)));
                let wal: Arc<dyn Backend> = Arc::new(EncryptedBackend::new(raw_wal, provider));
                (data, wal)
            }
            EncryptionType::None => (Arc::clone(&raw_data), raw_wal),
        };

        let wal = if config.enable_wal {
            let wal = Arc::new(WriteAheadLog::open(Arc::clone(&wal_backend))?);
            Self::recover(&wal, data.as_ref())?;
            Some(wal)
        } else {
            None
        };

        let transactions = Arc::new(TransactionManager::new(
            Arc::clone(&data),
            wal.clone(),
            config.transaction_timeout,
        ));
        transactions.checkpoint()?;

        let backups = if config.enable_backup {
            let path = config
                .resolved_backup_path()
                .or_else(|| dir.as_ref().map(DatabaseDir::backups_dir))
                .ok_or_else(|| {
                    CoreError::configuration("BackupPath is required when backups are enabled")
                })?;
            Some(FileBackupProvider::open(path)?)
        } else {
            None
        };

        tracing::info!(
            storage = ?config.storage_type,
            wal = config.enable_wal,
            compression = ?config.compression,
            encryption = ?config.encryption,
            backups = config.enable_backup,
            "database opened"
        );

        Ok(Self {
            compression: provider_for(config.compression),
            config,
            dir,
            data,
            raw_data,
            wal_backend,
            wal,
            transactions,
            backups,
            collections: RwLock::new(HashMap::new()),
            owns_backends,
            is_open: RwLock::new(true),
        })
    }

    /// Replays committed work into `data` and closes out dead transactions.
    fn recover(wal: &WriteAheadLog, data: &dyn Backend) -> CoreResult<()> {
        let stats = wal.replay(data, &CancellationToken::new())?;
        data.flush()?;
        let rolled_back = wal.resolve_incomplete()?;
        tracing::debug!(
            committed = stats.committed_transactions,
            applied = stats.applied_entries,
            skipped = stats.skipped_entries,
            rolled_back,
            "WAL recovery finished"
        );
        Ok(())
    }

    // ========================================================================
    // Collections
    // ========================================================================

    /// Creates a collection of `T` stored as JSON.
    pub fn create_collection<T>(&self, name: &str) -> CoreResult<Arc<PersistentCollection<T>>>
    where
        T: CollectionItem + Serialize + DeserializeOwned,
    {
        self.create_collection_with(name, Arc::new(JsonSerializer::new()))
    }

    /// Creates a collection of `T` stored with `serializer`.
    ///
    /// # Errors
    ///
    /// `CollectionExists` if the name is registered or already has blobs.
    pub fn create_collection_with<T: CollectionItem>(
        &self,
        name: &str,
        serializer: Arc<dyn Serializer<Vec<T>>>,
    ) -> CoreResult<Arc<PersistentCollection<T>>> {
        self.ensure_open()?;
        validate_name(name)?;
        let mut collections = self.collections.write();
        if collections.contains_key(name) || self.data.exists(&metadata_location(name))? {
            return Err(CoreError::CollectionExists {
                name: name.to_string(),
            });
        }

        let collection = self.load_collection(name, serializer)?;
        collections.insert(name.to_string(), entry_for(&collection));
        tracing::debug!(collection = name, "collection created");
        Ok(collection)
    }

    /// Returns the JSON-stored collection `name`.
    pub fn get_collection<T>(&self, name: &str) -> CoreResult<Arc<PersistentCollection<T>>>
    where
        T: CollectionItem + Serialize + DeserializeOwned,
    {
        self.get_collection_with(name, Arc::new(JsonSerializer::new()))
    }

    /// Returns collection `name`, loading it with `serializer` if it is not
    /// open yet.
    ///
    /// # Errors
    ///
    /// - `CollectionNotFound` if it neither is open nor has stored metadata
    /// - `InvalidOperation` if it is open with a different item type
    pub fn get_collection_with<T: CollectionItem>(
        &self,
        name: &str,
        serializer: Arc<dyn Serializer<Vec<T>>>,
    ) -> CoreResult<Arc<PersistentCollection<T>>> {
        self.ensure_open()?;
        if let Some(entry) = self.collections.read().get(name) {
            return downcast(name, entry);
        }

        let mut collections = self.collections.write();
        if let Some(entry) = collections.get(name) {
            return downcast(name, entry);
        }
        if !self.data.exists(&metadata_location(name))? {
            return Err(CoreError::collection_not_found(name));
        }
        let collection = self.load_collection(name, serializer)?;
        collections.insert(name.to_string(), entry_for(&collection));
        Ok(collection)
    }

    fn load_collection<T: CollectionItem>(
        &self,
        name: &str,
        serializer: Arc<dyn Serializer<Vec<T>>>,
    ) -> CoreResult<Arc<PersistentCollection<T>>> {
        let collection = Arc::new(PersistentCollection::new(
            name,
            Arc::clone(&self.transactions),
            serializer,
            Arc::clone(&self.compression),
        ));
        collection.initialize()?;
        Ok(collection)
    }

    /// Deletes collection `name`, its blobs and its indexes.
    pub fn drop_collection(&self, name: &str) -> CoreResult<()> {
        self.ensure_open()?;
        let mut collections = self.collections.write();
        let registered = collections.remove(name);
        if registered.is_none() && !self.data.exists(&metadata_location(name))? {
            return Err(CoreError::collection_not_found(name));
        }
        if let Some(entry) = registered {
            entry.managed.dispose();
        }

        self.transactions.execute(|tx| {
            tx.stage_delete(&data_location(name))?;
            tx.stage_delete(&metadata_location(name))
        })?;
        tracing::debug!(collection = name, "collection dropped");
        Ok(())
    }

    /// Returns the names of every stored or open collection, sorted.
    pub fn list_collections(&self) -> CoreResult<Vec<String>> {
        self.ensure_open()?;
        let mut names: BTreeSet<String> = self.collections.read().keys().cloned().collect();
        for location in self.data.list(Some("*.metadata"))? {
            if let Some(name) = location.strip_suffix(METADATA_SUFFIX) {
                names.insert(name.to_string());
            }
        }
        Ok(names.into_iter().collect())
    }

    // ========================================================================
    // Transactions
    // ========================================================================

    /// Begins an explicit transaction.
    pub fn begin_transaction(
        &self,
        isolation_level: IsolationLevel,
    ) -> CoreResult<Arc<Transaction>> {
        self.ensure_open()?;
        Ok(self.transactions.begin_transaction(isolation_level))
    }

    /// Commits `tx`.
    pub fn commit_transaction(&self, tx: &Transaction) -> CoreResult<()> {
        self.ensure_open()?;
        self.transactions.commit(tx)
    }

    /// Rolls back `tx`.
    pub fn rollback_transaction(&self, tx: &Transaction) -> CoreResult<()> {
        self.ensure_open()?;
        self.transactions.rollback(tx)
    }

    /// Runs `f` in a transaction, committing on success and rolling back on
    /// error.
    pub fn transaction<F, R>(&self, f: F) -> CoreResult<R>
    where
        F: FnOnce(&Transaction) -> CoreResult<R>,
    {
        self.ensure_open()?;
        self.transactions.execute(f)
    }

    /// Rolls back transactions older than the configured timeout.
    pub fn detect_and_resolve_deadlocks(&self) -> CoreResult<usize> {
        self.ensure_open()?;
        Ok(self.transactions.detect_and_resolve_deadlocks())
    }

    /// Returns the transaction manager.
    pub fn transactions(&self) -> &Arc<TransactionManager> {
        &self.transactions
    }

    // ========================================================================
    // Backup and Restore
    // ========================================================================

    fn backup_provider(&self) -> CoreResult<&FileBackupProvider> {
        self.backups
            .as_ref()
            .ok_or_else(|| CoreError::configuration("backups are not enabled"))
    }

    /// Creates a full backup of the collection storage.
    pub fn create_backup(&self, backup_id: &str) -> CoreResult<BackupMetadata> {
        self.ensure_open()?;
        let provider = self.backup_provider()?;
        self.transactions
            .with_checkpoint(|| provider.create_backup(self.raw_data.as_ref(), backup_id))
    }

    /// Creates a backup of what changed since `base_backup_id`.
    pub fn create_incremental_backup(
        &self,
        backup_id: &str,
        base_backup_id: &str,
    ) -> CoreResult<BackupMetadata> {
        self.ensure_open()?;
        let provider = self.backup_provider()?;
        self.transactions.with_checkpoint(|| {
            provider.create_incremental_backup(self.raw_data.as_ref(), backup_id, base_backup_id)
        })
    }

    /// Restores `backup_id` and reloads every open collection.
    pub fn restore_backup(&self, backup_id: &str) -> CoreResult<()> {
        self.ensure_open()?;
        let provider = self.backup_provider()?;
        self.transactions
            .with_checkpoint(|| provider.restore_backup(self.raw_data.as_ref(), backup_id))?;

        for entry in self.collections.read().values() {
            entry.managed.reload()?;
        }
        Ok(())
    }

    /// Returns every backup, oldest first.
    pub fn list_backups(&self) -> CoreResult<Vec<BackupMetadata>> {
        Ok(self.backup_provider()?.list_backups())
    }

    /// Returns the metadata of `backup_id`.
    pub fn get_backup_metadata(&self, backup_id: &str) -> CoreResult<BackupMetadata> {
        self.backup_provider()?.get_backup_metadata(backup_id)
    }

    /// Deletes `backup_id`.
    pub fn delete_backup(&self, backup_id: &str) -> CoreResult<()> {
        self.backup_provider()?.delete_backup(backup_id)
    }

    /// Checks the archive of `backup_id` against its checksum.
    pub fn validate_backup(&self, backup_id: &str) -> CoreResult<bool> {
        self.backup_provider()?.validate_backup(backup_id)
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Flushes the data and WAL backends.
    pub fn flush(&self) -> CoreResult<()> {
        self.ensure_open()?;
        self.data.flush()?;
        if let Some(wal) = &self.wal {
            wal.flush()?;
        }
        Ok(())
    }

    /// Compacts the WAL up to the last committed entry.
    pub fn checkpoint(&self) -> CoreResult<()> {
        self.ensure_open()?;
        self.transactions.checkpoint()
    }

    /// Returns the WAL, if enabled.
    pub fn wal(&self) -> Option<&Arc<WriteAheadLog>> {
        self.wal.as_ref()
    }

    /// Returns the configuration the database was opened with.
    #[must_use]
    pub fn config(&self) -> &DatabaseConfig {
        &self.config
    }

    /// Returns the root directory of a file database.
    pub fn path(&self) -> Option<&Path> {
        self.dir.as_ref().map(DatabaseDir::path)
    }

    /// Closes the database.
    ///
    /// Checkpoints and persists the WAL index, disposes every collection
    /// and, for backends the database created, the backends themselves.
    pub fn close(&self) -> CoreResult<()> {
        let mut is_open = self.is_open.write();
        if !*is_open {
            return Ok(());
        }

        self.transactions.checkpoint()?;
        if let Some(wal) = &self.wal {
            wal.close()?;
        }
        for entry in self.collections.write().drain().map(|(_, e)| e) {
            entry.managed.dispose();
        }
        self.data.flush()?;
        self.wal_backend.flush()?;
        if self.owns_backends {
            self.data.dispose()?;
            self.wal_backend.dispose()?;
        }

        *is_open = false;
        tracing::info!("database closed");
        Ok(())
    }

    /// Checks if the database is open.
    #[must_use]
    pub fn is_open(&self) -> bool {
        *self.is_open.read()
    }

    fn ensure_open(&self) -> CoreResult<()> {
        if *self.is_open.read() {
            Ok(())
        } else {
            Err(CoreError::DatabaseClosed)
        }
    }
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database")
            .field("is_open", &self.is_open())
            .field("storage", &self.config.storage_type)
            .field("wal", &self.wal.is_some())
            .field("collections", &self.collections.read().len())
            .finish_non_exhaustive()
    }
}

impl Drop for Database {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            tracing::warn!(error = %e, "failed to close database on drop");
        }
    }
}

fn entry_for<T: CollectionItem>(collection: &Arc<PersistentCollection<T>>) -> CollectionEntry {
    CollectionEntry {
        managed: Arc::clone(collection) as Arc<dyn ManagedCollection>,
        typed: Arc::clone(collection) as Arc<dyn Any + Send + Sync>,
    }
}

fn downcast<T: CollectionItem>(
    name: &str,
    entry: &CollectionEntry,
) -> CoreResult<Arc<PersistentCollection<T>>> {
    Arc::clone(&entry.typed)
        .downcast::<PersistentCollection<T>>()
        .map_err(|_| {
            CoreError::invalid_operation(format!(
                "collection '{name}' is open with a different item type"
            ))
        })
}

fn validate_name(name: &str) -> CoreResult<()> {
    if name.is_empty() || name.contains(['/', '\\']) || name.starts_with('.') {
        return Err(CoreError::invalid_operation(format!(
            "invalid collection name '{name}'"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CompressionType;
    use tempfile::tempdir;
    use vellum_storage::EncryptionKey;

    fn all<T: CollectionItem>(c: &PersistentCollection<T>) -> Vec<T> {
        c.get_all(&CancellationToken::new())
            .collect::<CoreResult<_>>()
            .unwrap()
    }

    #[test]
    fn open_in_memory() {
        let db = Database::open_in_memory().unwrap();
        assert!(db.is_open());
        assert!(db.path().is_none());
        assert!(db.list_collections().unwrap().is_empty());
    }

    #[test]
    fn create_and_get_collection() {
        let db = Database::open_in_memory().unwrap();
        let created = db.create_collection::<u32>("nums").unwrap();
        created.add_range([1, 2, 3]).unwrap();

        let fetched = db.get_collection::<u32>("nums").unwrap();
        assert!(Arc::ptr_eq(&created, &fetched));
        assert!(matches!(
            db.create_collection::<u32>("nums"),
            Err(CoreError::CollectionExists { .. })
        ));
        assert!(db.get_collection::<String>("nums").is_err());
        assert!(matches!(
            db.get_collection::<u32>("missing"),
            Err(CoreError::CollectionNotFound { .. })
        ));
        assert_eq!(db.list_collections().unwrap(), vec!["nums".to_string()]);
    }

    #[test]
    fn drop_collection_removes_blobs() {
        let data: Arc<MemoryStorage> = Arc::new(MemoryStorage::new());
        let db = Database::open_with_backends(
            DatabaseConfig::in_memory().enable_wal(true),
            data.clone(),
            Arc::new(MemoryStorage::new()),
        )
        .unwrap();
        let c = db.create_collection::<u32>("nums").unwrap();
        let idx = c.create_index("id", |v: &u32| *v).unwrap();
        c.add(7).unwrap();

        db.drop_collection("nums").unwrap();
        assert!(idx.is_disposed());
        assert!(!data.exists("nums.data").unwrap());
        assert!(!data.exists("nums.metadata").unwrap());
        assert!(matches!(
            db.drop_collection("nums"),
            Err(CoreError::CollectionNotFound { .. })
        ));
    }

    #[test]
    fn collections_persist_across_restarts() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("db");
        {
            let db = Database::open(
                DatabaseConfig::file(&path)
                    .enable_wal(true)
                    .compression(CompressionType::Deflate),
            )
            .unwrap();
            let c = db.create_collection::<String>("words").unwrap();
            c.add_range(["x".to_string(), "y".to_string()]).unwrap();
            db.close().unwrap();
        }

        let db = Database::open(
            DatabaseConfig::file(&path)
                .enable_wal(true)
                .compression(CompressionType::Deflate),
        )
        .unwrap();
        let c = db.get_collection::<String>("words").unwrap();
        assert_eq!(c.count(), 2);
        assert_eq!(all(&c), vec!["x".to_string(), "y".to_string()]);
    }

    #[test]
    fn closed_database_rejects_operations() {
        let db = Database::open_in_memory().unwrap();
        db.close().unwrap();
        db.close().unwrap();
        assert!(matches!(
            db.create_collection::<u32>("late"),
            Err(CoreError::DatabaseClosed)
        ));
        assert!(matches!(
            db.begin_transaction(IsolationLevel::default()),
            Err(CoreError::DatabaseClosed)
        ));
    }

    #[test]
    fn backup_requires_enabling() {
        let db = Database::open_in_memory().unwrap();
        assert!(matches!(
            db.create_backup("b1"),
            Err(CoreError::Configuration { .. })
        ));
    }

    #[test]
    fn encrypted_database_hides_plaintext() {
        let data: Arc<MemoryStorage> = Arc::new(MemoryStorage::new());
        let key = EncryptionKey::generate();
        {
            let db = Database::open_with_backends(
                DatabaseConfig::in_memory()
                    .enable_wal(true)
                    .encryption(key.clone()),
                data.clone(),
                Arc::new(MemoryStorage::new()),
            )
            .unwrap();
            let c = db.create_collection::<String>("secrets").unwrap();
            c.add("attack at dawn".to_string()).unwrap();
        }

        for bytes in data.snapshot().values() {
            assert!(!bytes.windows(6).any(|w| w == b"attack"));
        }

        let db = Database::open_with_backends(
            DatabaseConfig::in_memory().encryption(key),
            data,
            Arc::new(MemoryStorage::new()),
        )
        .unwrap();
        let c = db.get_collection::<String>("secrets").unwrap();
        assert_eq!(all(&c), vec!["attack at dawn".to_string()]);
    }

    #[test]
    fn aes_without_key_is_rejected() {
        let mut config = DatabaseConfig::in_memory();
        config.encryption = EncryptionType::Aes;
        assert!(matches!(
            Database::open(config),
            Err(CoreError::Configuration { .. })
        ));
    }

    #[test]
    fn second_open_of_same_directory_is_locked() {
        let temp = tempdir().unwrap();
        let _db = Database::open(DatabaseConfig::file(temp.path())).unwrap();
        assert!(matches!(
            Database::open(DatabaseConfig::file(temp.path())),
            Err(CoreError::DatabaseLocked)
        ));
    }
}
