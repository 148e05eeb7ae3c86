//! Transaction state.

use crate::error::{CoreError, CoreResult};
use crate::types::TransactionId;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::fmt;
use std::time::{Duration, Instant};
use uuid::Uuid;
use vellum_storage::Backend;

/// State of a transaction.
///
/// ```text
/// Active -> Committing -> Committed
///    |          |
///    v          v
/// RollingBack -> RolledBack
/// ```
///
/// `Aborted` is reachable from `Committing` and `RollingBack` on failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransactionState {
    /// Transaction is active and can stage operations.
    Active,
    /// Commit is in progress.
    Committing,
    /// Transaction has been committed.
    Committed,
    /// Rollback is in progress or has been requested mid-commit.
    RollingBack,
    /// Transaction has been rolled back.
    RolledBack,
    /// Commit or rollback failed.
    Aborted,
}

impl TransactionState {
    /// Returns true for states no transition leaves.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Committed | Self::RolledBack | Self::Aborted)
    }
}

/// Requested isolation level.
///
/// Every level defers writes until commit; the level is recorded for
/// callers and does not change visibility rules.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum IsolationLevel {
    /// Dirty reads allowed.
    ReadUncommitted,
    /// Only committed data is read.
    #[default]
    ReadCommitted,
    /// Reads are repeatable within the transaction.
    RepeatableRead,
    /// Full serializability.
    Serializable,
}

/// An operation staged in a transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PendingOp {
    /// Write bytes at an offset.
    Write {
        /// Target location.
        location: String,
        /// Byte offset.
        offset: u64,
        /// Payload.
        data: Vec<u8>,
    },
    /// Delete a location.
    Delete {
        /// Target location.
        location: String,
    },
}

impl PendingOp {
    /// Returns the target location.
    #[must_use]
    pub fn location(&self) -> &str {
        match self {
            Self::Write { location, .. } | Self::Delete { location } => location,
        }
    }
}

/// A named rollback point inside a transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Savepoint {
    /// Name, unique within the transaction.
    pub name: String,
    /// Owning transaction.
    pub transaction_id: Uuid,
    /// Creation time.
    pub created_at: DateTime<Utc>,
}

/// In-memory effect run after a successful commit.
pub(crate) type CommitHook = Box<dyn FnOnce() + Send>;

/// Fingerprint of a location's contents; `None` = absent.
pub(crate) type ContentDigest = Option<[u8; 32]>;

pub(crate) fn content_digest(contents: Option<&[u8]>) -> ContentDigest {
    contents.map(|bytes| Sha256::digest(bytes).into())
}

struct SavepointMark {
    savepoint: Savepoint,
    ops_len: usize,
    hooks_len: usize,
    overlay: HashMap<String, Option<Vec<u8>>>,
}

pub(crate) struct TxInner {
    pub(crate) state: TransactionState,
    /// Set once the Commit entry is durable; rollback is no longer possible.
    pub(crate) commit_durable: bool,
    pub(crate) ops: Vec<PendingOp>,
    pub(crate) hooks: Vec<CommitHook>,
    /// Location contents as this transaction sees them; `None` = deleted.
    overlay: HashMap<String, Option<Vec<u8>>>,
    /// Committed contents first read from the backend, per location.
    pub(crate) read_versions: HashMap<String, ContentDigest>,
    savepoints: Vec<SavepointMark>,
}

impl TxInner {
    pub(crate) fn discard(&mut self) {
        self.ops.clear();
        self.hooks.clear();
        self.overlay.clear();
        self.read_versions.clear();
        self.savepoints.clear();
    }

    fn note_read(&mut self, location: &str, contents: Option<&[u8]>) {
        self.read_versions
            .entry(location.to_string())
            .or_insert_with(|| content_digest(contents));
    }
}

/// A transaction handle.
///
/// Transactions are explicit: every transactional call takes the handle.
/// Operations are staged in the handle and reach the backend only when
/// [`TransactionManager::commit`](super::TransactionManager::commit)
/// succeeds. Reads through the handle see its own staged writes.
pub struct Transaction {
    id: Uuid,
    wal_id: TransactionId,
    isolation_level: IsolationLevel,
    created_at: DateTime<Utc>,
    started: Instant,
    pub(crate) inner: Mutex<TxInner>,
}

impl Transaction {
    pub(crate) fn new(wal_id: TransactionId, isolation_level: IsolationLevel) -> Self {
        Self {
            id: Uuid::new_v4(),
            wal_id,
            isolation_level,
            created_at: Utc::now(),
            started: Instant::now(),
            inner: Mutex::new(TxInner {
                state: TransactionState::Active,
                commit_durable: false,
                ops: Vec::new(),
                hooks: Vec::new(),
                overlay: HashMap::new(),
                read_versions: HashMap::new(),
                savepoints: Vec::new(),
            }),
        }
    }

    /// Returns the transaction's unique id.
    #[must_use]
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Returns the id recorded in WAL entries.
    #[must_use]
    pub fn wal_id(&self) -> TransactionId {
        self.wal_id
    }

    /// Returns the requested isolation level.
    #[must_use]
    pub fn isolation_level(&self) -> IsolationLevel {
        self.isolation_level
    }

    /// Returns the current state.
    #[must_use]
    pub fn state(&self) -> TransactionState {
        self.inner.lock().state
    }

    /// Checks if the transaction is still active.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.state() == TransactionState::Active
    }

    /// Returns the creation time.
    #[must_use]
    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Returns how long the transaction has existed.
    #[must_use]
    pub fn age(&self) -> Duration {
        self.started.elapsed()
    }

    /// Returns the number of staged operations.
    #[must_use]
    pub fn pending_operations(&self) -> usize {
        self.inner.lock().ops.len()
    }

    /// Returns a copy of the staged operations.
    #[must_use]
    pub fn operations(&self) -> Vec<PendingOp> {
        self.inner.lock().ops.clone()
    }

    /// Returns the live savepoints, oldest first.
    #[must_use]
    pub fn savepoints(&self) -> Vec<Savepoint> {
        self.inner
            .lock()
            .savepoints
            .iter()
            .map(|m| m.savepoint.clone())
            .collect()
    }

    /// Creates a savepoint named `name`.
    ///
    /// # Errors
    ///
    /// Fails if the transaction is not active or the name is taken.
    pub fn create_savepoint(&self, name: &str) -> CoreResult<Savepoint> {
        let mut inner = self.inner.lock();
        ensure_active(&inner)?;
        if inner.savepoints.iter().any(|m| m.savepoint.name == name) {
            return Err(CoreError::SavepointExists {
                name: name.to_string(),
            });
        }
        let savepoint = Savepoint {
            name: name.to_string(),
            transaction_id: self.id,
            created_at: Utc::now(),
        };
        let mark = SavepointMark {
            savepoint: savepoint.clone(),
            ops_len: inner.ops.len(),
            hooks_len: inner.hooks.len(),
            overlay: inner.overlay.clone(),
        };
        inner.savepoints.push(mark);
        Ok(savepoint)
    }

    /// Discards work staged after `name` and forgets every later savepoint.
    ///
    /// The savepoint itself survives and can be rolled back to again.
    pub fn rollback_to_savepoint(&self, name: &str) -> CoreResult<()> {
        let mut inner = self.inner.lock();
        ensure_active(&inner)?;
        let pos = find_savepoint(&inner, name)?;
        inner.savepoints.truncate(pos + 1);

        let mark = &inner.savepoints[pos];
        let (ops_len, hooks_len, overlay) = (mark.ops_len, mark.hooks_len, mark.overlay.clone());
        inner.ops.truncate(ops_len);
        inner.hooks.truncate(hooks_len);
        inner.overlay = overlay;
        Ok(())
    }

    /// Forgets `name` and every later savepoint, keeping staged work.
    pub fn release_savepoint(&self, name: &str) -> CoreResult<()> {
        let mut inner = self.inner.lock();
        ensure_active(&inner)?;
        let pos = find_savepoint(&inner, name)?;
        inner.savepoints.truncate(pos);
        Ok(())
    }

    /// Returns `location` as this transaction sees it.
    ///
    /// Staged writes and deletes win; otherwise the backend is read. The
    /// first backend read of a location is remembered, and committing a
    /// rewrite of it fails with `WriteConflict` if it changed since.
    pub fn read(&self, backend: &dyn Backend, location: &str) -> CoreResult<Option<Vec<u8>>> {
        if let Some(staged) = self.inner.lock().overlay.get(location) {
            return Ok(staged.clone());
        }
        let contents = read_backend(backend, location)?;
        self.inner.lock().note_read(location, contents.as_deref());
        Ok(contents)
    }

    /// Stages a write of `data` at `offset`.
    pub fn stage_write(
        &self,
        backend: &dyn Backend,
        location: &str,
        offset: u64,
        data: &[u8],
    ) -> CoreResult<()> {
        let mut inner = self.inner.lock();
        ensure_active(&inner)?;

        let mut current = match inner.overlay.get(location) {
            Some(staged) => staged.clone().unwrap_or_default(),
            None => {
                let contents = read_backend(backend, location)?;
                inner.note_read(location, contents.as_deref());
                contents.unwrap_or_default()
            }
        };
        let start = usize::try_from(offset)
            .map_err(|_| CoreError::invalid_operation("offset exceeds address space"))?;
        let end = start + data.len();
        if current.len() < end {
            current.resize(end, 0);
        }
        current[start..end].copy_from_slice(data);

        inner.overlay.insert(location.to_string(), Some(current));
        inner.ops.push(PendingOp::Write {
            location: location.to_string(),
            offset,
            data: data.to_vec(),
        });
        Ok(())
    }

    /// Stages deletion of `location`.
    pub fn stage_delete(&self, location: &str) -> CoreResult<()> {
        let mut inner = self.inner.lock();
        ensure_active(&inner)?;
        inner.overlay.insert(location.to_string(), None);
        inner.ops.push(PendingOp::Delete {
            location: location.to_string(),
        });
        Ok(())
    }

    /// Stages a whole-blob rewrite as Delete followed by Write at offset 0.
    pub fn stage_replace(&self, location: &str, data: &[u8]) -> CoreResult<()> {
        let mut inner = self.inner.lock();
        ensure_active(&inner)?;
        inner
            .overlay
            .insert(location.to_string(), Some(data.to_vec()));
        inner.ops.push(PendingOp::Delete {
            location: location.to_string(),
        });
        inner.ops.push(PendingOp::Write {
            location: location.to_string(),
            offset: 0,
            data: data.to_vec(),
        });
        Ok(())
    }

    /// Registers an in-memory effect to run after a successful commit.
    pub(crate) fn on_commit(&self, hook: CommitHook) -> CoreResult<()> {
        let mut inner = self.inner.lock();
        ensure_active(&inner)?;
        inner.hooks.push(hook);
        Ok(())
    }
}

impl fmt::Debug for Transaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("Transaction")
            .field("id", &self.id)
            .field("wal_id", &self.wal_id)
            .field("isolation_level", &self.isolation_level)
            .field("state", &inner.state)
            .field("ops", &inner.ops.len())
            .field("savepoints", &inner.savepoints.len())
            .finish()
    }
}

fn ensure_active(inner: &TxInner) -> CoreResult<()> {
    if inner.state != TransactionState::Active {
        return Err(CoreError::invalid_operation(format!(
            "transaction is {:?}, expected Active",
            inner.state
        )));
    }
    Ok(())
}

fn find_savepoint(inner: &TxInner, name: &str) -> CoreResult<usize> {
    inner
        .savepoints
        .iter()
        .position(|m| m.savepoint.name == name)
        .ok_or_else(|| CoreError::SavepointNotFound {
            name: name.to_string(),
        })
}

fn read_backend(backend: &dyn Backend, location: &str) -> CoreResult<Option<Vec<u8>>> {
    if backend.size(location)?.is_none() {
        return Ok(None);
    }
    Ok(Some(backend.read_all(location)?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use vellum_storage::MemoryStorage;

    fn txn() -> Transaction {
        Transaction::new(TransactionId::new(1), IsolationLevel::default())
    }

    #[test]
    fn new_transaction_is_active() {
        let tx = txn();
        assert!(tx.is_active());
        assert_eq!(tx.isolation_level(), IsolationLevel::ReadCommitted);
        assert_eq!(tx.pending_operations(), 0);
    }

    #[test]
    fn reads_see_staged_writes() {
        let backend = MemoryStorage::new();
        backend.write("loc", 0, b"committed").unwrap();
        let tx = txn();

        tx.stage_write(&backend, "loc", 0, b"STAGED").unwrap();
        assert_eq!(tx.read(&backend, "loc").unwrap().unwrap(), b"STAGEDted");
        assert_eq!(backend.read_all("loc").unwrap(), b"committed");

        tx.stage_delete("loc").unwrap();
        assert_eq!(tx.read(&backend, "loc").unwrap(), None);
    }

    #[test]
    fn replace_stages_delete_then_write() {
        let tx = txn();
        tx.stage_replace("blob", b"v2").unwrap();
        assert_eq!(
            tx.operations(),
            vec![
                PendingOp::Delete {
                    location: "blob".into()
                },
                PendingOp::Write {
                    location: "blob".into(),
                    offset: 0,
                    data: b"v2".to_vec()
                },
            ]
        );
    }

    #[test]
    fn savepoint_names_are_unique() {
        let tx = txn();
        tx.create_savepoint("a").unwrap();
        assert!(matches!(
            tx.create_savepoint("a"),
            Err(CoreError::SavepointExists { .. })
        ));
    }

    #[test]
    fn rollback_to_savepoint_discards_later_work() {
        let backend = MemoryStorage::new();
        let tx = txn();
        tx.stage_replace("x", b"1").unwrap();
        tx.create_savepoint("first").unwrap();
        tx.stage_replace("x", b"2").unwrap();
        tx.create_savepoint("second").unwrap();
        tx.stage_replace("y", b"3").unwrap();

        tx.rollback_to_savepoint("first").unwrap();

        assert_eq!(tx.pending_operations(), 2);
        assert_eq!(tx.read(&backend, "x").unwrap().unwrap(), b"1");
        assert_eq!(tx.read(&backend, "y").unwrap(), None);
        let names: Vec<String> = tx.savepoints().into_iter().map(|s| s.name).collect();
        assert_eq!(names, vec!["first".to_string()]);
    }

    #[test]
    fn release_savepoint_keeps_work() {
        let tx = txn();
        tx.create_savepoint("a").unwrap();
        tx.stage_replace("x", b"1").unwrap();
        tx.create_savepoint("b").unwrap();

        tx.release_savepoint("a").unwrap();
        assert!(tx.savepoints().is_empty());
        assert_eq!(tx.pending_operations(), 2);
        assert!(matches!(
            tx.rollback_to_savepoint("b"),
            Err(CoreError::SavepointNotFound { .. })
        ));
    }

    #[test]
    fn inactive_transaction_rejects_staging() {
        let tx = txn();
        tx.inner.lock().state = TransactionState::Committed;
        assert!(tx.stage_delete("x").is_err());
        assert!(tx.create_savepoint("late").is_err());
    }
}
