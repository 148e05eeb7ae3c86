//! Transaction manager.

use crate::error::{CoreError, CoreResult};
use crate::transaction::state::{
    content_digest, ContentDigest, IsolationLevel, PendingOp, Transaction, TransactionState,
};
use crate::types::TransactionId;
use crate::wal::WriteAheadLog;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;
use vellum_storage::Backend;

/// Coordinates transaction lifecycles against a backend and an optional WAL.
///
/// ## Commit protocol
///
/// 1. Every location the transaction rewrites is checked against the
///    version it read; a change means another commit got there first
/// 2. Every staged operation is appended to the WAL
/// 3. A Commit entry is appended and the log is flushed
/// 4. The operations are applied to the backend in staging order, a
///    Delete directly followed by a Write at offset 0 as one `replace`
/// 5. In-memory effects registered by collections run
///
/// A crash after step 3 is repaired by WAL replay at the next open. A crash
/// before it leaves an unresolved transaction that replay ignores.
///
/// Commits are serialized. Blind writes to a location the transaction never
/// read are not checked, so the last of those wins.
pub struct TransactionManager {
    backend: Arc<dyn Backend>,
    wal: Option<Arc<WriteAheadLog>>,
    next_wal_id: AtomicU64,
    active: Mutex<HashMap<Uuid, Arc<Transaction>>>,
    /// Held across a whole commit and across checkpoints.
    commit_lock: Mutex<()>,
    timeout: Duration,
}

impl TransactionManager {
    /// Creates a manager applying to `backend`, logging to `wal` if given.
    pub fn new(
        backend: Arc<dyn Backend>,
        wal: Option<Arc<WriteAheadLog>>,
        timeout: Duration,
    ) -> Self {
        let first_id = wal
            .as_ref()
            .map_or(1, |w| w.highest_transaction_id().as_u64() + 1);
        Self {
            backend,
            wal,
            next_wal_id: AtomicU64::new(first_id),
            active: Mutex::new(HashMap::new()),
            commit_lock: Mutex::new(()),
            timeout,
        }
    }

    /// Returns the backend transactions apply to.
    pub fn backend(&self) -> &Arc<dyn Backend> {
        &self.backend
    }

    /// Returns the WAL, if durability logging is enabled.
    pub fn wal(&self) -> Option<&Arc<WriteAheadLog>> {
        self.wal.as_ref()
    }

    /// Returns the age after which an active transaction is force-rolled back.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Begins a new transaction.
    pub fn begin_transaction(&self, isolation_level: IsolationLevel) -> Arc<Transaction> {
        let wal_id = TransactionId::new(self.next_wal_id.fetch_add(1, Ordering::SeqCst));
        let tx = Arc::new(Transaction::new(wal_id, isolation_level));
        self.active.lock().insert(tx.id(), Arc::clone(&tx));
        tracing::debug!(
            transaction = %tx.id(),
            wal_id = %wal_id,
            ?isolation_level,
            "began transaction"
        );
        tx
    }

    /// Commits `tx`.
    ///
    /// # Errors
    ///
    /// - `InvalidOperation` if the transaction is not active
    /// - `WriteConflict` if a location it read and rewrites was changed by
    ///   another commit in the meantime
    /// - `TransactionAborted` if a rollback was requested before the Commit
    ///   entry was written
    /// - any I/O error, after which the transaction is `Aborted`
    pub fn commit(&self, tx: &Transaction) -> CoreResult<()> {
        let _guard = self.commit_lock.lock();

        let (ops, hooks, read_versions) = {
            let mut inner = tx.inner.lock();
            if inner.state != TransactionState::Active {
                return Err(CoreError::invalid_operation(format!(
                    "cannot commit transaction in state {:?}",
                    inner.state
                )));
            }
            inner.state = TransactionState::Committing;
            (
                std::mem::take(&mut inner.ops),
                std::mem::take(&mut inner.hooks),
                std::mem::take(&mut inner.read_versions),
            )
        };

        let result = self
            .check_read_versions(&ops, &read_versions)
            .and_then(|()| self.commit_inner(tx, &ops));
        match &result {
            Ok(true) => {
                for hook in hooks {
                    hook();
                }
                tx.inner.lock().state = TransactionState::Committed;
                tracing::debug!(transaction = %tx.id(), ops = ops.len(), "committed transaction");
            }
            Ok(false) => {}
            Err(e) => {
                tracing::error!(transaction = %tx.id(), error = %e, "commit failed");
                let durable = {
                    let mut inner = tx.inner.lock();
                    inner.state = TransactionState::Aborted;
                    inner.discard();
                    inner.commit_durable
                };
                if !durable {
                    if let Some(wal) = &self.wal {
                        if let Err(log_err) = wal.log_rollback(tx.wal_id()) {
                            tracing::warn!(
                                transaction = %tx.id(),
                                error = %log_err,
                                "failed to log rollback"
                            );
                        }
                    }
                }
            }
        }
        self.active.lock().remove(&tx.id());

        match result {
            Ok(true) => Ok(()),
            Ok(false) => Err(CoreError::transaction_aborted(
                "rollback requested during commit",
            )),
            Err(e) => Err(e),
        }
    }

    fn check_read_versions(
        &self,
        ops: &[PendingOp],
        read_versions: &HashMap<String, ContentDigest>,
    ) -> CoreResult<()> {
        let mut checked = HashSet::new();
        for op in ops {
            let location = op.location();
            let Some(expected) = read_versions.get(location) else {
                continue;
            };
            if !checked.insert(location) {
                continue;
            }
            let current = match self.backend.size(location)? {
                Some(_) => Some(self.backend.read_all(location)?),
                None => None,
            };
            if content_digest(current.as_deref()) != *expected {
                return Err(CoreError::WriteConflict {
                    location: location.to_string(),
                });
            }
        }
        Ok(())
    }

    /// Returns `Ok(false)` when a concurrent rollback won before the Commit
    /// entry was written.
    fn commit_inner(&self, tx: &Transaction, ops: &[PendingOp]) -> CoreResult<bool> {
        if let Some(wal) = &self.wal {
            for op in ops {
                match op {
                    PendingOp::Write {
                        location,
                        offset,
                        data,
                    } => wal.log_write(location, *offset, data, tx.wal_id())?,
                    PendingOp::Delete { location } => wal.log_delete(location, tx.wal_id())?,
                };
            }

            // The tx lock is held across the Commit append so a rollback
            // request either lands before it or is refused.
            let mut inner = tx.inner.lock();
            if inner.state == TransactionState::RollingBack {
                wal.log_rollback(tx.wal_id())?;
                inner.state = TransactionState::RolledBack;
                inner.discard();
                tracing::debug!(transaction = %tx.id(), "rolled back during commit");
                return Ok(false);
            }
            wal.log_commit(tx.wal_id())?;
            inner.commit_durable = true;
        }

        let mut pending = ops.iter().peekable();
        while let Some(op) = pending.next() {
            match op {
                PendingOp::Write {
                    location,
                    offset,
                    data,
                } => self.backend.write(location, *offset, data)?,
                PendingOp::Delete { location } => match pending.peek() {
                    // Delete + Write@0 is a whole-blob rewrite.
                    Some(PendingOp::Write {
                        location: next,
                        offset: 0,
                        data,
                    }) if next == location => {
                        self.backend.replace(location, data)?;
                        pending.next();
                    }
                    _ => self.backend.delete(location)?,
                },
            }
        }
        self.backend.flush()?;
        Ok(true)
    }

    /// Rolls back `tx`.
    ///
    /// From `Active` the staged work is discarded immediately. While a
    /// commit is in flight and its Commit entry has not been written yet,
    /// the rollback is recorded and the committing thread finishes it.
    pub fn rollback(&self, tx: &Transaction) -> CoreResult<()> {
        let mut inner = tx.inner.lock();
        let state = inner.state;
        match state {
            TransactionState::Active => {
                inner.state = TransactionState::RollingBack;
                inner.discard();
                if let Some(wal) = &self.wal {
                    if let Err(e) = wal.log_rollback(tx.wal_id()) {
                        inner.state = TransactionState::Aborted;
                        drop(inner);
                        self.active.lock().remove(&tx.id());
                        return Err(e);
                    }
                }
                inner.state = TransactionState::RolledBack;
                drop(inner);
                self.active.lock().remove(&tx.id());
                tracing::debug!(transaction = %tx.id(), "rolled back transaction");
                Ok(())
            }
            TransactionState::Committing if !inner.commit_durable => {
                inner.state = TransactionState::RollingBack;
                tracing::debug!(transaction = %tx.id(), "rollback requested during commit");
                Ok(())
            }
            state => Err(CoreError::invalid_operation(format!(
                "cannot roll back transaction in state {state:?}"
            ))),
        }
    }

    /// Runs `f` inside an implicit transaction and commits it.
    ///
    /// The transaction is rolled back if `f` fails.
    pub fn execute<R, F>(&self, f: F) -> CoreResult<R>
    where
        F: FnOnce(&Transaction) -> CoreResult<R>,
    {
        let tx = self.begin_transaction(IsolationLevel::default());
        match f(&tx) {
            Ok(value) => {
                self.commit(&tx)?;
                Ok(value)
            }
            Err(e) => {
                if let Err(rollback_err) = self.rollback(&tx) {
                    tracing::warn!(
                        transaction = %tx.id(),
                        error = %rollback_err,
                        "implicit rollback failed"
                    );
                }
                Err(e)
            }
        }
    }

    /// Force-rolls back active transactions older than the timeout and drops
    /// finished transactions from the active set.
    ///
    /// Returns the number of transactions rolled back.
    pub fn detect_and_resolve_deadlocks(&self) -> usize {
        let snapshot: Vec<Arc<Transaction>> = self.active.lock().values().cloned().collect();

        let mut resolved = 0;
        for tx in snapshot {
            let state = tx.state();
            if state.is_terminal() {
                self.active.lock().remove(&tx.id());
            } else if state == TransactionState::Active && tx.age() > self.timeout {
                tracing::warn!(
                    transaction = %tx.id(),
                    age = ?tx.age(),
                    "rolling back timed-out transaction"
                );
                match self.rollback(&tx) {
                    Ok(()) => resolved += 1,
                    Err(e) => {
                        tracing::warn!(
                            transaction = %tx.id(),
                            error = %e,
                            "forced rollback failed"
                        );
                    }
                }
            }
        }
        resolved
    }

    /// Returns the transactions that have not finished.
    pub fn active_transactions(&self) -> Vec<Arc<Transaction>> {
        self.active.lock().values().cloned().collect()
    }

    /// Looks up a transaction by id.
    pub fn get_transaction(&self, id: Uuid) -> Option<Arc<Transaction>> {
        self.active.lock().get(&id).cloned()
    }

    /// Compacts the WAL up to the last committed entry.
    ///
    /// Runs under the commit lock so no commit is between its Commit entry
    /// and its backend writes.
    pub fn checkpoint(&self) -> CoreResult<()> {
        let _guard = self.commit_lock.lock();
        self.checkpoint_locked()
    }

    /// Checkpoints, then runs `f` with commits blocked.
    ///
    /// Used to rewrite the backend underneath the log, as a restore does.
    pub(crate) fn with_checkpoint<R>(&self, f: impl FnOnce() -> CoreResult<R>) -> CoreResult<R> {
        let _guard = self.commit_lock.lock();
        self.checkpoint_locked()?;
        f()
    }

    fn checkpoint_locked(&self) -> CoreResult<()> {
        if let Some(wal) = &self.wal {
            self.backend.flush()?;
            wal.checkpoint()?;
        }
        Ok(())
    }
}

impl std::fmt::Debug for TransactionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransactionManager")
            .field("wal", &self.wal.is_some())
            .field("active", &self.active.lock().len())
            .field("timeout", &self.timeout)
            .finish()
    }
}
