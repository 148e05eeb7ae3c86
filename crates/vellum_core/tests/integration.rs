//! End-to-end tests across collections, indexes, transactions and backups.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::thread;
use tempfile::tempdir;
use vellum_core::{
    BackupStatus, BackupType, CborSerializer, CompressionType, CoreError, Database,
    DatabaseConfig, IsolationLevel, PersistentCollection, TransactionState,
};
use vellum_storage::{CancellationToken, EncryptionKey};

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn items<T: Clone + PartialEq + Send + Sync + 'static>(c: &PersistentCollection<T>) -> Vec<T> {
    c.get_all(&CancellationToken::new())
        .collect::<Result<_, _>>()
        .unwrap()
}

fn strings(values: &[&str]) -> Vec<String> {
    values.iter().map(|s| s.to_string()).collect()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Order {
    id: u64,
    customer: String,
    total_cents: i64,
}

#[test]
fn identity_index_survives_rebuild() {
    init_tracing();
    let db = Database::open_in_memory().unwrap();
    let letters = db.create_collection::<String>("letters").unwrap();
    letters.add_range(strings(&["a", "b", "c"])).unwrap();

    let index = letters
        .create_index("identity", |s: &String| s.clone())
        .unwrap();
    assert_eq!(index.find(&"b".to_string()).unwrap(), strings(&["b"]));

    letters.rebuild_indexes(&CancellationToken::new()).unwrap();
    assert_eq!(index.find(&"b".to_string()).unwrap(), strings(&["b"]));
    assert_eq!(index.count().unwrap(), 3);
}

#[test]
fn backup_then_restore_returns_original_items() {
    init_tracing();
    let temp = tempdir().unwrap();
    let db = Database::open(
        DatabaseConfig::file(temp.path().join("db"))
            .enable_wal(true)
            .enable_backup(true),
    )
    .unwrap();
    let names = db.create_collection::<String>("names").unwrap();
    let original = strings(&["ann", "bob", "cy", "dee", "eve"]);
    names.add_range(original.clone()).unwrap();

    let meta = db.create_backup("b1").unwrap();
    assert_eq!(meta.status, BackupStatus::Completed);
    assert!(temp.path().join("db/backups/b1.tar.gz").exists());
    assert!(temp.path().join("db/backups/backups.json").exists());

    names.add_range(strings(&["fay", "gus"])).unwrap();
    assert_eq!(names.count(), 7);

    db.restore_backup("b1").unwrap();
    assert_eq!(names.count(), 5);
    assert_eq!(items(&names), original);
    assert!(db.validate_backup("b1").unwrap());
}

#[test]
fn incremental_backup_restores_through_chain() {
    init_tracing();
    let temp = tempdir().unwrap();
    let db = Database::open(DatabaseConfig::file(temp.path()).enable_backup(true)).unwrap();
    let keep = db.create_collection::<u32>("keep").unwrap();
    let churn = db.create_collection::<u32>("churn").unwrap();
    keep.add_range([1, 2, 3]).unwrap();
    churn.add(9).unwrap();
    db.create_backup("full").unwrap();

    churn.add(10).unwrap();
    let inc = db.create_incremental_backup("inc", "full").unwrap();
    assert_eq!(inc.backup_type, BackupType::Incremental);
    // Only churn's blobs changed.
    assert_eq!(inc.location_count, 2);

    churn.clear().unwrap();
    keep.clear().unwrap();
    db.restore_backup("inc").unwrap();
    assert_eq!(items(&keep), vec![1, 2, 3]);
    assert_eq!(items(&churn), vec![9, 10]);

    let ids: Vec<String> = db
        .list_backups()
        .unwrap()
        .into_iter()
        .map(|m| m.backup_id)
        .collect();
    assert_eq!(ids, strings(&["full", "inc"]));
    assert!(db.delete_backup("full").is_err());
}

#[test]
fn encrypted_compressed_database_round_trips() {
    init_tracing();
    let temp = tempdir().unwrap();
    let key = EncryptionKey::generate();
    let config = || {
        DatabaseConfig::file(temp.path())
            .enable_wal(true)
            .compression(CompressionType::GZip)
            .encryption(key.clone())
    };

    let orders = vec![
        Order {
            id: 1,
            customer: "harriet".into(),
            total_cents: 1999,
        },
        Order {
            id: 2,
            customer: "ignatius".into(),
            total_cents: 250,
        },
    ];
    {
        let db = Database::open(config()).unwrap();
        let c = db
            .create_collection_with::<Order>("orders", Arc::new(CborSerializer::new()))
            .unwrap();
        c.add_range(orders.clone()).unwrap();
        db.close().unwrap();
    }

    let raw = std::fs::read(temp.path().join("data/orders.metadata")).unwrap();
    assert!(!raw.windows(6).any(|w| w == b"orders"));

    let db = Database::open(config()).unwrap();
    let c = db
        .get_collection_with::<Order>("orders", Arc::new(CborSerializer::new()))
        .unwrap();
    assert_eq!(items(&c), orders);

    drop(db);
    let wrong = Database::open(
        DatabaseConfig::file(temp.path()).encryption(EncryptionKey::generate()),
    )
    .unwrap();
    assert!(wrong.get_collection::<Order>("orders").is_err());
}

#[test]
fn count_survives_reopen() {
    init_tracing();
    let temp = tempdir().unwrap();
    {
        let db = Database::open(DatabaseConfig::file(temp.path()).enable_wal(true)).unwrap();
        let c = db.create_collection::<i32>("nums").unwrap();
        c.add_range([5, 6, 7, 8]).unwrap();
        assert!(c.remove(&6).unwrap());
        c.add(9).unwrap();
        assert_eq!(c.count(), 4);
    }

    let db = Database::open(DatabaseConfig::file(temp.path()).enable_wal(true)).unwrap();
    let c = db.get_collection::<i32>("nums").unwrap();
    assert_eq!(c.count(), 4);
    assert_eq!(items(&c), vec![5, 7, 8, 9]);
    let stats = c.statistics().unwrap();
    assert_eq!(stats.item_count, 4);
    assert!(stats.total_size() > 0);
}

#[test]
fn savepoint_discards_later_work() {
    init_tracing();
    let db = Database::open(DatabaseConfig::in_memory().enable_wal(true)).unwrap();
    let c = db.create_collection::<String>("log").unwrap();
    let index = c.create_index("len", |s: &String| s.len()).unwrap();

    let tx = db.begin_transaction(IsolationLevel::Serializable).unwrap();
    c.add_in_txn(&tx, "kept".to_string()).unwrap();
    tx.create_savepoint("before-noise").unwrap();
    c.add_in_txn(&tx, "noise".to_string()).unwrap();
    tx.rollback_to_savepoint("before-noise").unwrap();
    db.commit_transaction(&tx).unwrap();

    assert_eq!(tx.state(), TransactionState::Committed);
    assert_eq!(items(&c), strings(&["kept"]));
    assert_eq!(c.count(), 1);
    assert!(index.find(&5).unwrap().is_empty());
}

#[test]
fn closure_transaction_rolls_back_on_error() {
    init_tracing();
    let db = Database::open(DatabaseConfig::in_memory().enable_wal(true)).unwrap();
    let c = db.create_collection::<u8>("bytes").unwrap();

    let result: Result<(), CoreError> = db.transaction(|tx| {
        c.add_in_txn(tx, 1)?;
        Err(CoreError::invalid_operation("changed my mind"))
    });
    assert!(result.is_err());
    assert_eq!(c.count(), 0);
    assert!(items(&c).is_empty());
}

#[test]
fn concurrent_adds_are_serialized() {
    init_tracing();
    let db = Database::open(DatabaseConfig::in_memory().enable_wal(true)).unwrap();
    let c = db.create_collection::<u32>("shared").unwrap();

    let handles: Vec<_> = (0..4)
        .map(|t| {
            let c = Arc::clone(&c);
            thread::spawn(move || {
                for i in 0..10 {
                    c.add(t * 100 + i).unwrap();
                }
            })
        })
        .collect();
    for h in handles {
        h.join().unwrap();
    }

    assert_eq!(c.count(), 40);
    assert_eq!(items(&c).len(), 40);
}

#[test]
fn config_from_map_opens_database() {
    init_tracing();
    let temp = tempdir().unwrap();
    let path = temp.path().display().to_string();
    let config = DatabaseConfig::from_map([
        ("StorageType", "File"),
        ("FilePath", path.as_str()),
        ("EnableWAL", "true"),
        ("CompressionType", "Deflate"),
        ("EnableBackup", "true"),
        ("TransactionTimeoutSeconds", "5"),
        ("SomethingElse", "ignored"),
    ])
    .unwrap();

    let db = Database::open(config).unwrap();
    assert!(db.wal().is_some());
    let c = db.create_collection::<String>("cfg").unwrap();
    c.add("hello".to_string()).unwrap();
    db.create_backup("from-map").unwrap();
    assert!(temp.path().join("backups/from-map.tar.gz").exists());
}
