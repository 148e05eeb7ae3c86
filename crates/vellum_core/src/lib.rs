//! # Vellum Core
//!
//! Embedded storage engine for Vellum.
//!
//! This crate provides:
//! - Persistent collections stored as whole serialized blobs
//! - WAL (Write-Ahead Log) for durability and crash replay
//! - Explicit transactions with savepoints
//! - In-memory hash indexes maintained on every mutation
//! - Full and incremental backups with checksums
//! - Transparent compression, with encryption supplied by `vellum_storage`
//!
//! ## Example
//!
//! ```rust
//! use vellum_core::{Database, IsolationLevel};
//! use vellum_storage::CancellationToken;
//!
//! let db = Database::open_in_memory().unwrap();
//! let fruit = db.create_collection::<String>("fruit").unwrap();
//! let by_initial = fruit
//!     .create_index("initial", |s: &String| s.chars().next())
//!     .unwrap();
//!
//! let tx = db.begin_transaction(IsolationLevel::ReadCommitted).unwrap();
//! fruit.add_in_txn(&tx, "apple".to_string()).unwrap();
//! fruit.add_in_txn(&tx, "banana".to_string()).unwrap();
//! db.commit_transaction(&tx).unwrap();
//!
//! assert_eq!(fruit.count(), 2);
//! assert_eq!(by_initial.find(&Some('b')).unwrap(), vec!["banana".to_string()]);
//! let items: Vec<String> = fruit
//!     .get_all(&CancellationToken::new())
//!     .collect::<Result<_, _>>()
//!     .unwrap();
//! assert_eq!(items.len(), 2);
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod backup;
pub mod collection;
mod compression;
mod config;
mod database;
mod dir;
mod error;
pub mod index;
mod serializer;
pub mod transaction;
mod types;
pub mod wal;

pub use backup::{BackupMetadata, BackupStatus, BackupType, FileBackupProvider};
pub use collection::{
    CollectionItem, CollectionMetadata, CollectionStatistics, Items, ManagedCollection,
    PersistentCollection,
};
pub use compression::{
    provider_for, CompressionProvider, DeflateCompression, GzipCompression, NoCompression,
};
pub use config::{
    CompressionType, DatabaseConfig, EncryptionType, StorageType, DEFAULT_TRANSACTION_TIMEOUT,
};
pub use database::{create_backend, Database};
pub use dir::DatabaseDir;
pub use error::{CoreError, CoreResult, ErrorKind};
pub use index::{AttachedIndex, HashIndex, IndexKey, KeySelector};
pub use serializer::{CborSerializer, JsonSerializer, Serializer};
pub use transaction::{
    IsolationLevel, PendingOp, Savepoint, Transaction, TransactionManager, TransactionState,
};
pub use types::{data_location, metadata_location, EntryId, TransactionId};
pub use wal::{WalEntry, WalEntryType, WriteAheadLog};
