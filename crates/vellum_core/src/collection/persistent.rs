//! Whole-object collection storage.

use crate::collection::metadata::{CollectionMetadata, CollectionStatistics};
use crate::compression::CompressionProvider;
use crate::error::{CoreError, CoreResult};
use crate::index::{AttachedIndex, HashIndex, IndexKey};
use crate::serializer::Serializer;
use crate::transaction::{Transaction, TransactionManager};
use crate::types::{data_location, metadata_location};
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use std::any::Any;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use vellum_storage::{Backend, CancellationToken, StorageError};

/// Item bounds for a persistent collection.
pub trait CollectionItem: Clone + PartialEq + Send + Sync + 'static {}

impl<T> CollectionItem for T where T: Clone + PartialEq + Send + Sync + 'static {}

/// The type-erased surface the database uses to manage its collections.
pub trait ManagedCollection: Send + Sync {
    /// Collection name.
    fn name(&self) -> &str;

    /// Re-reads both blobs and rebuilds every index.
    fn reload(&self) -> CoreResult<()>;

    /// Flushes the backend.
    fn flush(&self) -> CoreResult<()>;

    /// Disposes every index; later operations fail.
    fn dispose(&self);
}

struct RegisteredIndex<T> {
    name: String,
    index: Arc<dyn AttachedIndex<T>>,
    typed: Arc<dyn Any + Send + Sync>,
}

#[derive(Debug, Clone, Copy)]
struct Counters {
    count: u64,
    created_at: DateTime<Utc>,
    last_modified: DateTime<Utc>,
}

type IndexList<T> = Arc<RwLock<Vec<RegisteredIndex<T>>>>;

/// Attempts a plain mutation makes when explicit transactions keep
/// committing the same collection underneath it.
const MAX_CONFLICT_RETRIES: usize = 8;

#[derive(Clone)]
enum Mutation<T> {
    Add(Vec<T>),
    Remove(T),
    Clear,
}

/// A named list of items stored as one serialized blob.
///
/// The items live at `<name>.data` (serialized, then compressed) and a JSON
/// [`CollectionMetadata`] lives at `<name>.metadata`. Every mutation reads
/// the whole list, changes it and writes it back, followed by the metadata.
///
/// Mutations without a transaction run as implicit single-operation
/// transactions. The `_in_txn` variants stage into a caller-owned
/// transaction; their effects on the count and indexes appear at commit.
/// Such a commit fails with `WriteConflict` if the collection was changed
/// by anyone else after the transaction first read it.
///
/// # Example
///
/// ```
/// use std::sync::Arc;
/// use std::time::Duration;
/// use vellum_core::{
///     JsonSerializer, NoCompression, PersistentCollection, TransactionManager,
/// };
/// use vellum_storage::{CancellationToken, MemoryStorage};
///
/// let backend = Arc::new(MemoryStorage::new());
/// let tm = Arc::new(TransactionManager::new(backend, None, Duration::from_secs(30)));
/// let names: PersistentCollection<String> = PersistentCollection::new(
///     "names",
///     tm,
///     Arc::new(JsonSerializer::new()),
///     Arc::new(NoCompression),
/// );
/// names.initialize().unwrap();
/// names.add("ada".to_string()).unwrap();
///
/// let all: Vec<String> = names
///     .get_all(&CancellationToken::new())
///     .collect::<Result<_, _>>()
///     .unwrap();
/// assert_eq!(all, vec!["ada".to_string()]);
/// ```
pub struct PersistentCollection<T: CollectionItem> {
    name: String,
    data_location: String,
    metadata_location: String,
    backend: Arc<dyn Backend>,
    transactions: Arc<TransactionManager>,
    serializer: Arc<dyn Serializer<Vec<T>>>,
    compression: Arc<dyn CompressionProvider>,
    /// Serializes read-modify-write cycles on the data blob.
    mutation_lock: Mutex<()>,
    counters: Arc<Mutex<Counters>>,
    indexes: IndexList<T>,
    disposed: AtomicBool,
}

impl<T: CollectionItem> PersistentCollection<T> {
    /// Creates a handle; call [`initialize`](Self::initialize) before use.
    pub fn new(
        name: impl Into<String>,
        transactions: Arc<TransactionManager>,
        serializer: Arc<dyn Serializer<Vec<T>>>,
        compression: Arc<dyn CompressionProvider>,
    ) -> Self {
        let name = name.into();
        let now = Utc::now();
        Self {
            data_location: data_location(&name),
            metadata_location: metadata_location(&name),
            name,
            backend: Arc::clone(transactions.backend()),
            transactions,
            serializer,
            compression,
            mutation_lock: Mutex::new(()),
            counters: Arc::new(Mutex::new(Counters {
                count: 0,
                created_at: now,
                last_modified: now,
            })),
            indexes: Arc::new(RwLock::new(Vec::new())),
            disposed: AtomicBool::new(false),
        }
    }

    /// Returns the collection name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Loads the count from storage, creating the metadata if needed.
    ///
    /// A missing data blob means a fresh collection. A data blob without
    /// metadata has its count re-derived from the items.
    pub fn initialize(&self) -> CoreResult<()> {
        self.ensure_open()?;
        let _guard = self.mutation_lock.lock();

        if self.backend.size(&self.data_location)?.is_none() {
            let mut meta = match self.backend.size(&self.metadata_location)? {
                Some(_) => {
                    let bytes = self.backend.read_all(&self.metadata_location)?;
                    CollectionMetadata::from_bytes(&bytes)?
                }
                None => CollectionMetadata::new(self.name.clone()),
            };
            meta.count = 0;
            self.write_metadata(&meta)?;
            self.set_counters(&meta);
            tracing::debug!(collection = %self.name, "created collection");
            return Ok(());
        }

        let meta = if self.backend.size(&self.metadata_location)?.is_some() {
            CollectionMetadata::from_bytes(&self.backend.read_all(&self.metadata_location)?)?
        } else {
            tracing::warn!(collection = %self.name, "metadata missing, re-deriving count");
            let items = self.decode(Some(self.backend.read_all(&self.data_location)?))?;
            let mut meta = CollectionMetadata::new(self.name.clone());
            meta.count = items.len() as u64;
            self.write_metadata(&meta)?;
            meta
        };
        self.set_counters(&meta);
        tracing::debug!(collection = %self.name, count = meta.count, "loaded collection");
        Ok(())
    }

    /// Returns the number of items.
    pub fn count(&self) -> u64 {
        self.counters.lock().count
    }

    /// Returns when the collection was created.
    pub fn created_at(&self) -> DateTime<Utc> {
        self.counters.lock().created_at
    }

    /// Returns when the collection was last mutated.
    pub fn last_modified(&self) -> DateTime<Utc> {
        self.counters.lock().last_modified
    }

    /// Appends `item`.
    pub fn add(&self, item: T) -> CoreResult<()> {
        self.add_range(vec![item])
    }

    /// Appends every item in order.
    pub fn add_range(&self, items: impl IntoIterator<Item = T>) -> CoreResult<()> {
        let items: Vec<T> = items.into_iter().collect();
        self.run(Mutation::Add(items)).map(|_| ())
    }

    /// Removes the first item equal to `item`. Returns whether one was found.
    pub fn remove(&self, item: &T) -> CoreResult<bool> {
        self.run(Mutation::Remove(item.clone()))
    }

    /// Removes every item.
    pub fn clear(&self) -> CoreResult<()> {
        self.run(Mutation::Clear).map(|_| ())
    }

    /// Stages an append of `item` into `tx`.
    pub fn add_in_txn(&self, tx: &Transaction, item: T) -> CoreResult<()> {
        self.add_range_in_txn(tx, vec![item])
    }

    /// Stages an append of every item into `tx`.
    pub fn add_range_in_txn(
        &self,
        tx: &Transaction,
        items: impl IntoIterator<Item = T>,
    ) -> CoreResult<()> {
        let items: Vec<T> = items.into_iter().collect();
        self.run_in_txn(tx, Mutation::Add(items)).map(|_| ())
    }

    /// Stages removal of the first item equal to `item` into `tx`.
    pub fn remove_in_txn(&self, tx: &Transaction, item: &T) -> CoreResult<bool> {
        self.run_in_txn(tx, Mutation::Remove(item.clone()))
    }

    /// Stages removal of every item into `tx`.
    pub fn clear_in_txn(&self, tx: &Transaction) -> CoreResult<()> {
        self.run_in_txn(tx, Mutation::Clear).map(|_| ())
    }

    fn run(&self, mutation: Mutation<T>) -> CoreResult<bool> {
        self.ensure_open()?;
        let _guard = self.mutation_lock.lock();
        let mut attempt = 1;
        loop {
            match self
                .transactions
                .execute(|tx| self.stage(tx, mutation.clone()))
            {
                Err(CoreError::WriteConflict { .. }) if attempt < MAX_CONFLICT_RETRIES => {
                    tracing::debug!(
                        collection = %self.name,
                        attempt,
                        "retrying after write conflict"
                    );
                    attempt += 1;
                }
                result => return result,
            }
        }
    }

    fn run_in_txn(&self, tx: &Transaction, mutation: Mutation<T>) -> CoreResult<bool> {
        self.ensure_open()?;
        let _guard = self.mutation_lock.lock();
        self.stage(tx, mutation)
    }

    fn stage(&self, tx: &Transaction, mutation: Mutation<T>) -> CoreResult<bool> {
        let mut items = self.decode(tx.read(self.backend.as_ref(), &self.data_location)?)?;

        let (added, removed) = match mutation {
            Mutation::Add(new) => {
                items.extend(new.iter().cloned());
                (new, Vec::new())
            }
            Mutation::Remove(item) => match items.iter().position(|i| *i == item) {
                Some(pos) => (Vec::new(), vec![items.remove(pos)]),
                None => return Ok(false),
            },
            Mutation::Clear => (Vec::new(), std::mem::take(&mut items)),
        };

        let payload = self.encode(&items)?;
        tx.stage_replace(&self.data_location, &payload)?;

        let count = items.len() as u64;
        let now = Utc::now();
        let meta = CollectionMetadata {
            name: self.name.clone(),
            count,
            created_at: self.created_at(),
            last_modified: now,
        };
        tx.stage_replace(&self.metadata_location, &meta.to_bytes()?)?;

        let counters = Arc::clone(&self.counters);
        let indexes = Arc::clone(&self.indexes);
        let name = self.name.clone();
        tx.on_commit(Box::new(move || {
            {
                let mut c = counters.lock();
                c.count = count;
                c.last_modified = now;
            }
            for registered in indexes.read().iter() {
                for item in &removed {
                    if let Err(e) = registered.index.remove_item(item) {
                        tracing::warn!(
                            collection = %name,
                            index = %registered.name,
                            error = %e,
                            "index removal failed"
                        );
                    }
                }
                for item in &added {
                    if let Err(e) = registered.index.add_item(item) {
                        tracing::warn!(
                            collection = %name,
                            index = %registered.name,
                            error = %e,
                            "index insert failed"
                        );
                    }
                }
            }
        }))?;
        Ok(true)
    }

    /// Returns a lazy sequence over the items.
    ///
    /// Nothing is read until the first call to `next`. Each call to
    /// `get_all` starts a fresh read. The token is checked between items.
    pub fn get_all(&self, cancel: &CancellationToken) -> Items<'_, T> {
        Items::new(
            Box::new(move || {
                self.ensure_open()?;
                self.load_committed()
            }),
            cancel.clone(),
        )
    }

    /// Like [`get_all`](Self::get_all), but sees the writes staged in `tx`.
    pub fn get_all_in_txn<'a>(
        &'a self,
        tx: &'a Transaction,
        cancel: &CancellationToken,
    ) -> Items<'a, T> {
        Items::new(
            Box::new(move || {
                self.ensure_open()?;
                self.decode(tx.read(self.backend.as_ref(), &self.data_location)?)
            }),
            cancel.clone(),
        )
    }

    /// Creates a hash index named `name` over the key `selector` projects.
    ///
    /// The index is filled from the current items before it is returned.
    pub fn create_index<K, F>(&self, name: &str, selector: F) -> CoreResult<Arc<HashIndex<K, T>>>
    where
        K: IndexKey,
        F: Fn(&T) -> K + Send + Sync + 'static,
    {
        self.ensure_open()?;
        let _guard = self.mutation_lock.lock();
        if self.indexes.read().iter().any(|r| r.name == name) {
            return Err(CoreError::IndexExists {
                name: name.to_string(),
            });
        }

        let index = Arc::new(HashIndex::new(name, selector));
        index.rebuild(self.load_committed()?)?;

        self.indexes.write().push(RegisteredIndex {
            name: name.to_string(),
            index: Arc::clone(&index) as Arc<dyn AttachedIndex<T>>,
            typed: Arc::clone(&index) as Arc<dyn Any + Send + Sync>,
        });
        tracing::debug!(collection = %self.name, index = name, "created index");
        Ok(index)
    }

    /// Returns the index named `name`.
    ///
    /// # Errors
    ///
    /// `IndexNotFound` if absent; `InvalidOperation` if it was created with
    /// a different key type.
    pub fn get_index<K: IndexKey>(&self, name: &str) -> CoreResult<Arc<HashIndex<K, T>>> {
        let indexes = self.indexes.read();
        let registered = indexes
            .iter()
            .find(|r| r.name == name)
            .ok_or_else(|| CoreError::IndexNotFound {
                name: name.to_string(),
            })?;
        Arc::clone(&registered.typed)
            .downcast::<HashIndex<K, T>>()
            .map_err(|_| {
                CoreError::invalid_operation(format!("index '{name}' has a different key type"))
            })
    }

    /// Returns the names of the attached indexes.
    pub fn index_names(&self) -> Vec<String> {
        self.indexes.read().iter().map(|r| r.name.clone()).collect()
    }

    /// Detaches and disposes the index named `name`.
    pub fn drop_index(&self, name: &str) -> CoreResult<()> {
        let mut indexes = self.indexes.write();
        let pos = indexes
            .iter()
            .position(|r| r.name == name)
            .ok_or_else(|| CoreError::IndexNotFound {
                name: name.to_string(),
            })?;
        let registered = indexes.remove(pos);
        registered.index.dispose();
        tracing::debug!(collection = %self.name, index = name, "dropped index");
        Ok(())
    }

    /// Rebuilds every index from a full scan.
    ///
    /// On cancellation, indexes not yet rebuilt keep their contents.
    pub fn rebuild_indexes(&self, cancel: &CancellationToken) -> CoreResult<()> {
        self.ensure_open()?;
        let items = self.load_committed()?;
        for registered in self.indexes.read().iter() {
            if cancel.is_cancelled() {
                return Err(CoreError::Cancelled);
            }
            registered.index.rebuild_from(&items, cancel)?;
        }
        Ok(())
    }

    /// Returns item count, index sizes and blob sizes.
    pub fn statistics(&self) -> CoreResult<CollectionStatistics> {
        self.ensure_open()?;
        let (index_count, index_entry_count) = {
            let indexes = self.indexes.read();
            let mut entries = 0;
            for registered in indexes.iter() {
                entries += registered.index.entry_count()?;
            }
            (indexes.len(), entries)
        };
        Ok(CollectionStatistics {
            item_count: self.count(),
            index_count,
            index_entry_count,
            data_size: self.backend.size(&self.data_location)?.unwrap_or(0),
            metadata_size: self.backend.size(&self.metadata_location)?.unwrap_or(0),
        })
    }

    /// Flushes the backend.
    pub fn flush(&self) -> CoreResult<()> {
        self.ensure_open()?;
        self.backend.flush()?;
        Ok(())
    }

    /// Re-reads storage and rebuilds every index.
    ///
    /// Used after the backend changed underneath the collection, such as
    /// after a restore.
    pub fn reload(&self) -> CoreResult<()> {
        self.initialize()?;
        self.rebuild_indexes(&CancellationToken::new())
    }

    /// Disposes every index and rejects later operations.
    pub fn dispose(&self) {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        for registered in self.indexes.write().drain(..) {
            registered.index.dispose();
        }
    }

    fn load_committed(&self) -> CoreResult<Vec<T>> {
        let bytes = match self.backend.size(&self.data_location)? {
            Some(_) => Some(self.backend.read_all(&self.data_location)?),
            None => None,
        };
        self.decode(bytes)
    }

    fn decode(&self, bytes: Option<Vec<u8>>) -> CoreResult<Vec<T>> {
        match bytes {
            Some(bytes) if !bytes.is_empty() => {
                let raw = self.compression.decompress(&bytes).map_err(|e| {
                    tracing::error!(
                        collection = %self.name,
                        error = %e,
                        "failed to decompress data blob"
                    );
                    e
                })?;
                self.serializer.deserialize(&raw)
            }
            _ => Ok(Vec::new()),
        }
    }

    #[allow(clippy::ptr_arg)]
    fn encode(&self, items: &Vec<T>) -> CoreResult<Vec<u8>> {
        let raw = self.serializer.serialize(items)?;
        self.compression.compress(&raw)
    }

    fn write_metadata(&self, meta: &CollectionMetadata) -> CoreResult<()> {
        let bytes = meta.to_bytes()?;
        self.transactions
            .execute(|tx| tx.stage_replace(&self.metadata_location, &bytes))
    }

    fn set_counters(&self, meta: &CollectionMetadata) {
        *self.counters.lock() = Counters {
            count: meta.count,
            created_at: meta.created_at,
            last_modified: meta.last_modified,
        };
    }

    fn ensure_open(&self) -> CoreResult<()> {
        if self.disposed.load(Ordering::SeqCst) {
            return Err(StorageError::Disposed.into());
        }
        Ok(())
    }
}

impl<T: CollectionItem> ManagedCollection for PersistentCollection<T> {
    fn name(&self) -> &str {
        &self.name
    }

    fn reload(&self) -> CoreResult<()> {
        PersistentCollection::reload(self)
    }

    fn flush(&self) -> CoreResult<()> {
        PersistentCollection::flush(self)
    }

    fn dispose(&self) {
        PersistentCollection::dispose(self);
    }
}

impl<T: CollectionItem> std::fmt::Debug for PersistentCollection<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PersistentCollection")
            .field("name", &self.name)
            .field("count", &self.count())
            .field("indexes", &self.index_names())
            .finish()
    }
}

type Loader<'a, T> = Box<dyn FnOnce() -> CoreResult<Vec<T>> + 'a>;

/// Lazy sequence returned by [`PersistentCollection::get_all`].
///
/// Yields `Err(Cancelled)` once if the token fires, then ends.
pub struct Items<'a, T> {
    loader: Option<Loader<'a, T>>,
    items: std::vec::IntoIter<T>,
    cancel: CancellationToken,
    done: bool,
}

impl<'a, T> Items<'a, T> {
    fn new(loader: Loader<'a, T>, cancel: CancellationToken) -> Self {
        Self {
            loader: Some(loader),
            items: Vec::new().into_iter(),
            cancel,
            done: false,
        }
    }
}

impl<T> Iterator for Items<'_, T> {
    type Item = CoreResult<T>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        if let Some(load) = self.loader.take() {
            match load() {
                Ok(items) => self.items = items.into_iter(),
                Err(e) => {
                    self.done = true;
                    return Some(Err(e));
                }
            }
        }
        if self.cancel.is_cancelled() {
            self.done = true;
            return Some(Err(CoreError::Cancelled));
        }
        match self.items.next() {
            Some(item) => Some(Ok(item)),
            None => {
                self.done = true;
                None
            }
        }
    }
}
