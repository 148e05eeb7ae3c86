//! Crash recovery tests.
//!
//! A crash is simulated by capturing backend contents at a chosen point and
//! reopening a database over copies of them.

use std::collections::BTreeMap;
use std::sync::Arc;
use vellum_core::{
    Database, DatabaseConfig, IsolationLevel, TransactionId, WalEntryType, WriteAheadLog,
};
use vellum_storage::{Backend, CancellationToken, EncryptionKey, MemoryStorage};

fn restored(snapshot: &BTreeMap<String, Vec<u8>>) -> Arc<MemoryStorage> {
    Arc::new(MemoryStorage::with_locations(snapshot.clone()))
}

fn config() -> DatabaseConfig {
    DatabaseConfig::in_memory().enable_wal(true)
}

/// Commits three items, then "crashes" with the data writes lost.
fn crash_after_commit() -> (BTreeMap<String, Vec<u8>>, BTreeMap<String, Vec<u8>>) {
    let data = Arc::new(MemoryStorage::new());
    let wal = Arc::new(MemoryStorage::new());
    let db = Database::open_with_backends(config(), data.clone(), wal.clone()).unwrap();
    let c = db.create_collection::<String>("items").unwrap();
    let data_before_commit = data.snapshot();

    let tx = db.begin_transaction(IsolationLevel::ReadCommitted).unwrap();
    for item in ["one", "two", "three"] {
        c.add_in_txn(&tx, item.to_string()).unwrap();
    }
    db.commit_transaction(&tx).unwrap();
    let wal_after_commit = wal.snapshot();

    (data_before_commit, wal_after_commit)
}

#[test]
fn committed_transaction_is_replayed() {
    let (data, wal) = crash_after_commit();

    let db = Database::open_with_backends(config(), restored(&data), restored(&wal)).unwrap();
    let c = db.get_collection::<String>("items").unwrap();
    assert_eq!(c.count(), 3);
    let items: Vec<String> = c
        .get_all(&CancellationToken::new())
        .collect::<Result<_, _>>()
        .unwrap();
    assert_eq!(items, vec!["one", "two", "three"]);
}

#[test]
fn unfinished_transaction_is_discarded() {
    let (data, wal) = crash_after_commit();

    // A later transaction got its writes into the log but died before Commit.
    let wal_backend = restored(&wal);
    let dead_tx = {
        let log = WriteAheadLog::open(wal_backend.clone()).unwrap();
        let tx = TransactionId::new(log.highest_transaction_id().as_u64() + 1);
        log.log_delete("items.data", tx).unwrap();
        log.log_write("items.data", 0, b"garbage", tx).unwrap();
        tx
    };

    let db = Database::open_with_backends(config(), restored(&data), wal_backend.clone()).unwrap();
    let c = db.get_collection::<String>("items").unwrap();
    assert_eq!(c.count(), 3);

    let items: Vec<String> = c
        .get_all(&CancellationToken::new())
        .collect::<Result<_, _>>()
        .unwrap();
    assert_eq!(items, vec!["one", "two", "three"]);

    let entries = db.wal().unwrap().entries().unwrap();
    assert!(entries
        .iter()
        .any(|e| e.entry_type == WalEntryType::Rollback && e.transaction_id == dead_tx));
}

#[test]
fn torn_wal_tail_is_ignored() {
    let (data, mut wal) = crash_after_commit();
    if let Some(log) = wal.get_mut("wal.log") {
        log.extend_from_slice(&[0xAB; 7]);
    }

    let db = Database::open_with_backends(config(), restored(&data), restored(&wal)).unwrap();
    let c = db.get_collection::<String>("items").unwrap();
    assert_eq!(c.count(), 3);
}

#[test]
fn torn_encrypted_commit_frame_is_discarded() {
    let key = EncryptionKey::generate();
    let encrypted_config = || config().encryption(key.clone());

    let data = Arc::new(MemoryStorage::new());
    let wal = Arc::new(MemoryStorage::new());
    let (data_before_commit, mut wal_after_commit) = {
        let db = Database::open_with_backends(encrypted_config(), data.clone(), wal.clone())
            .unwrap();
        let c = db.create_collection::<String>("items").unwrap();
        let before = data.snapshot();
        let tx = db.begin_transaction(IsolationLevel::ReadCommitted).unwrap();
        c.add_in_txn(&tx, "lost".to_string()).unwrap();
        db.commit_transaction(&tx).unwrap();
        (before, wal.snapshot())
    };

    // The Commit frame only partly reached the medium.
    if let Some(log) = wal_after_commit.get_mut("wal.log") {
        let len = log.len();
        log.truncate(len - 3);
    }

    let db = Database::open_with_backends(
        encrypted_config(),
        restored(&data_before_commit),
        restored(&wal_after_commit),
    )
    .unwrap();
    let c = db.get_collection::<String>("items").unwrap();
    assert_eq!(c.count(), 0);
    assert!(c.get_all(&CancellationToken::new()).next().is_none());
}

#[test]
fn clean_shutdown_leaves_nothing_to_replay() {
    let data = Arc::new(MemoryStorage::new());
    let wal = Arc::new(MemoryStorage::new());
    {
        let db = Database::open_with_backends(config(), data.clone(), wal.clone()).unwrap();
        let c = db.create_collection::<u8>("bytes").unwrap();
        c.add_range([1, 2, 3]).unwrap();
        db.close().unwrap();
    }

    assert_eq!(wal.size("wal.log").unwrap().unwrap_or(0), 0);
    let db = Database::open_with_backends(config(), data, wal).unwrap();
    assert_eq!(db.get_collection::<u8>("bytes").unwrap().count(), 3);
}
