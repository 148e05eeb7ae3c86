//! WAL writer, replay and compaction.

use crate::error::{CoreError, CoreResult};
use crate::types::{EntryId, TransactionId};
use crate::wal::record::{parse_log, WalEntry, WalEntryType};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use vellum_storage::{Backend, CancellationToken};

/// Location of the entry log.
pub const LOG_LOCATION: &str = "wal.log";

/// Location of the id index.
pub const INDEX_LOCATION: &str = "wal.index";

/// Index layout: next entry id (8) + last committed entry id (8).
const INDEX_SIZE: usize = 16;

/// Counters guarded by the writer lock.
#[derive(Debug)]
struct WalState {
    next_entry_id: EntryId,
    last_committed: EntryId,
    highest_transaction: TransactionId,
    /// Logical size of the log location.
    log_size: u64,
}

/// Outcome of a replay pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReplayStats {
    /// Committed transactions found in the log.
    pub committed_transactions: usize,
    /// Write/Delete entries re-applied.
    pub applied_entries: usize,
    /// Write/Delete entries skipped as uncommitted or rolled back.
    pub skipped_entries: usize,
}

/// Manages the write-ahead log.
///
/// Every append is serialized by a single writer lock, which also assigns
/// entry ids. Each append is flushed before the call returns.
pub struct WriteAheadLog {
    /// Storage backend holding `wal.log` and `wal.index`.
    backend: Arc<dyn Backend>,
    state: Mutex<WalState>,
}

impl WriteAheadLog {
    /// Opens the log on `backend`, recovering counters from the index and
    /// the log itself.
    ///
    /// A torn final entry left by a crash is cut off so later appends stay
    /// readable.
    ///
    /// # Errors
    ///
    /// Returns an error if the log contains a structurally invalid entry.
    pub fn open(backend: Arc<dyn Backend>) -> CoreResult<Self> {
        let (mut next_entry_id, mut last_committed) = read_index(backend.as_ref())?;

        let trimmed = backend.trim_torn_tail(LOG_LOCATION)?;
        if trimmed > 0 {
            tracing::warn!(bytes = trimmed, "discarding torn WAL frame");
            backend.flush()?;
        }

        let raw = match backend.size(LOG_LOCATION)? {
            Some(_) => backend.read_all(LOG_LOCATION)?,
            None => Vec::new(),
        };
        let parsed = parse_log(&raw)?;

        let mut highest_transaction = TransactionId::new(0);
        for entry in &parsed.entries {
            next_entry_id = next_entry_id.max(entry.id.next());
            highest_transaction = highest_transaction.max(entry.transaction_id);
            if entry.entry_type == WalEntryType::Commit {
                last_committed = last_committed.max(entry.id);
            }
        }

        if parsed.valid_len < raw.len() {
            tracing::warn!(
                valid = parsed.valid_len,
                total = raw.len(),
                "discarding torn WAL tail"
            );
            backend.replace(LOG_LOCATION, &raw[..parsed.valid_len])?;
            backend.flush()?;
        }

        tracing::debug!(
            entries = parsed.entries.len(),
            next = next_entry_id.as_u64(),
            last_committed = last_committed.as_u64(),
            "opened WAL"
        );

        Ok(Self {
            backend,
            state: Mutex::new(WalState {
                next_entry_id: next_entry_id.max(EntryId::new(1)),
                last_committed,
                highest_transaction,
                log_size: parsed.valid_len as u64,
            }),
        })
    }

    /// Logs a write of `data` to `location` at `offset`.
    pub fn log_write(
        &self,
        location: &str,
        offset: u64,
        data: &[u8],
        tx: TransactionId,
    ) -> CoreResult<EntryId> {
        self.append(
            WalEntryType::Write,
            tx,
            Some(location.to_string()),
            offset,
            data.to_vec(),
        )
    }

    /// Logs the deletion of `location`.
    pub fn log_delete(&self, location: &str, tx: TransactionId) -> CoreResult<EntryId> {
        self.append(
            WalEntryType::Delete,
            tx,
            Some(location.to_string()),
            0,
            Vec::new(),
        )
    }

    /// Logs that `tx` committed.
    pub fn log_commit(&self, tx: TransactionId) -> CoreResult<EntryId> {
        self.append(WalEntryType::Commit, tx, None, 0, Vec::new())
    }

    /// Logs that `tx` rolled back.
    pub fn log_rollback(&self, tx: TransactionId) -> CoreResult<EntryId> {
        self.append(WalEntryType::Rollback, tx, None, 0, Vec::new())
    }

    fn append(
        &self,
        entry_type: WalEntryType,
        tx: TransactionId,
        location: Option<String>,
        offset: u64,
        data: Vec<u8>,
    ) -> CoreResult<EntryId> {
        let mut state = self.state.lock();
        let id = state.next_entry_id;
        let bytes = WalEntry::new(id, entry_type, tx, location, offset, data).encode()?;

        self.backend
            .write(LOG_LOCATION, state.log_size, &bytes)
            .map_err(|e| {
                tracing::error!(entry = id.as_u64(), error = %e, "WAL append failed");
                e
            })?;
        self.backend.flush()?;

        state.log_size += bytes.len() as u64;
        state.next_entry_id = id.next();
        state.highest_transaction = state.highest_transaction.max(tx);
        if entry_type == WalEntryType::Commit {
            state.last_committed = id;
        }
        Ok(id)
    }

    /// Returns every complete entry in log order.
    pub fn entries(&self) -> CoreResult<Vec<WalEntry>> {
        let _state = self.state.lock();
        self.read_entries()
    }

    fn read_entries(&self) -> CoreResult<Vec<WalEntry>> {
        if self.backend.size(LOG_LOCATION)?.is_none() {
            return Ok(Vec::new());
        }
        let raw = self.backend.read_all(LOG_LOCATION)?;
        Ok(parse_log(&raw)?.entries)
    }

    /// Re-applies committed Write/Delete entries to `target`.
    ///
    /// Pass one collects the committed transaction set (a Commit adds the
    /// transaction, a later Rollback removes it). Pass two applies the
    /// surviving entries in log order.
    ///
    /// # Errors
    ///
    /// Returns `Cancelled` if `cancel` fires between entries; entries
    /// already applied stay applied.
    pub fn replay(
        &self,
        target: &dyn Backend,
        cancel: &CancellationToken,
    ) -> CoreResult<ReplayStats> {
        let entries = self.entries()?;

        let mut committed = HashSet::new();
        for entry in &entries {
            check_cancel(cancel)?;
            match entry.entry_type {
                WalEntryType::Commit => {
                    committed.insert(entry.transaction_id);
                }
                WalEntryType::Rollback => {
                    committed.remove(&entry.transaction_id);
                }
                WalEntryType::Write | WalEntryType::Delete => {}
            }
        }

        let mut stats = ReplayStats {
            committed_transactions: committed.len(),
            ..ReplayStats::default()
        };
        for entry in &entries {
            check_cancel(cancel)?;
            if entry.entry_type.is_terminal() {
                continue;
            }
            if !committed.contains(&entry.transaction_id) {
                stats.skipped_entries += 1;
                continue;
            }
            let location = entry.location.as_deref().ok_or_else(|| {
                CoreError::wal_corruption(format!("entry {} has no location", entry.id))
            })?;
            match entry.entry_type {
                WalEntryType::Write => target.write(location, entry.offset, &entry.data)?,
                WalEntryType::Delete => target.delete(location)?,
                WalEntryType::Commit | WalEntryType::Rollback => {}
            }
            stats.applied_entries += 1;
        }
        target.flush()?;

        tracing::debug!(
            committed = stats.committed_transactions,
            applied = stats.applied_entries,
            skipped = stats.skipped_entries,
            "WAL replay complete"
        );
        Ok(stats)
    }

    /// Logs a Rollback for every transaction that has entries but neither a
    /// Commit nor a Rollback.
    ///
    /// Used during recovery: such transactions died with the previous
    /// process.
    pub fn resolve_incomplete(&self) -> CoreResult<usize> {
        let entries = self.entries()?;
        let mut open: Vec<TransactionId> = Vec::new();
        let mut seen = HashSet::new();
        let mut resolved = HashSet::new();
        for entry in &entries {
            if entry.entry_type.is_terminal() {
                resolved.insert(entry.transaction_id);
            } else if seen.insert(entry.transaction_id) {
                open.push(entry.transaction_id);
            }
        }
        open.retain(|tx| !resolved.contains(tx));

        for tx in &open {
            tracing::warn!(transaction = %tx, "rolling back incomplete transaction");
            self.log_rollback(*tx)?;
        }
        Ok(open.len())
    }

    /// Drops every entry up to and including `upto`, except entries of
    /// transactions still unresolved at that point.
    ///
    /// # Errors
    ///
    /// Returns `InvalidOperation` if `upto` is past the last committed
    /// entry.
    pub fn truncate(&self, upto: EntryId) -> CoreResult<()> {
        let mut state = self.state.lock();
        if upto > state.last_committed {
            return Err(CoreError::invalid_operation(format!(
                "cannot truncate WAL to {upto}: last committed entry is {}",
                state.last_committed
            )));
        }

        let entries = self.read_entries()?;
        let mut resolved_at: HashMap<TransactionId, EntryId> = HashMap::new();
        for entry in &entries {
            if entry.entry_type.is_terminal() {
                resolved_at.entry(entry.transaction_id).or_insert(entry.id);
            }
        }

        let mut kept = Vec::new();
        let mut dropped = 0usize;
        for entry in &entries {
            let resolved = resolved_at
                .get(&entry.transaction_id)
                .is_some_and(|at| *at <= upto);
            if entry.id <= upto && resolved {
                dropped += 1;
            } else {
                kept.extend(entry.encode()?);
            }
        }

        if kept.is_empty() {
            self.backend.delete(LOG_LOCATION)?;
        } else {
            self.backend.replace(LOG_LOCATION, &kept)?;
        }
        self.backend.flush()?;
        state.log_size = kept.len() as u64;

        tracing::debug!(upto = upto.as_u64(), dropped, "truncated WAL");
        Ok(())
    }

    /// Truncates up to the last committed entry and persists the index.
    pub fn checkpoint(&self) -> CoreResult<()> {
        let last_committed = self.state.lock().last_committed;
        self.truncate(last_committed)?;
        self.persist_index()
    }

    /// Writes `nextLogEntryId` and `lastCommittedEntryId` to the index.
    pub fn persist_index(&self) -> CoreResult<()> {
        let state = self.state.lock();
        let mut buf = Vec::with_capacity(INDEX_SIZE);
        buf.extend_from_slice(&state.next_entry_id.as_u64().to_le_bytes());
        buf.extend_from_slice(&state.last_committed.as_u64().to_le_bytes());
        self.backend.replace(INDEX_LOCATION, &buf)?;
        self.backend.flush()?;
        Ok(())
    }

    /// Persists the index and flushes the backend.
    pub fn close(&self) -> CoreResult<()> {
        self.persist_index()
    }

    /// Returns the logical size of the log in bytes.
    pub fn size(&self) -> CoreResult<u64> {
        Ok(self.state.lock().log_size)
    }

    /// Flushes the backend.
    pub fn flush(&self) -> CoreResult<()> {
        self.backend.flush()?;
        Ok(())
    }

    /// Returns the id the next appended entry will receive.
    #[must_use]
    pub fn next_entry_id(&self) -> EntryId {
        self.state.lock().next_entry_id
    }

    /// Returns the id of the most recent Commit entry.
    #[must_use]
    pub fn last_committed_entry_id(&self) -> EntryId {
        self.state.lock().last_committed
    }

    /// Returns the highest transaction id seen in the log.
    #[must_use]
    pub fn highest_transaction_id(&self) -> TransactionId {
        self.state.lock().highest_transaction
    }
}

impl std::fmt::Debug for WriteAheadLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WriteAheadLog")
            .field("state", &*self.state.lock())
            .finish_non_exhaustive()
    }
}

fn read_index(backend: &dyn Backend) -> CoreResult<(EntryId, EntryId)> {
    if backend.size(INDEX_LOCATION)?.is_none() {
        return Ok((EntryId::new(1), EntryId::new(0)));
    }
    let raw = backend.read_all(INDEX_LOCATION)?;
    if raw.len() != INDEX_SIZE {
        return Err(CoreError::wal_corruption(format!(
            "WAL index has {} bytes, expected {INDEX_SIZE}",
            raw.len()
        )));
    }
    let mut next = [0u8; 8];
    let mut last = [0u8; 8];
    next.copy_from_slice(&raw[..8]);
    last.copy_from_slice(&raw[8..]);
    Ok((
        EntryId::new(u64::from_le_bytes(next)),
        EntryId::new(u64::from_le_bytes(last)),
    ))
}

fn check_cancel(cancel: &CancellationToken) -> CoreResult<()> {
    if cancel.is_cancelled() {
        return Err(CoreError::Cancelled);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use proptest::prelude::*;
    use vellum_storage::{AesGcmEncryption, EncryptedBackend, EncryptionKey, MemoryStorage};

    fn create_wal() -> (Arc<MemoryStorage>, WriteAheadLog) {
        let backend = Arc::new(MemoryStorage::new());
        let wal = WriteAheadLog::open(backend.clone()).unwrap();
        (backend, wal)
    }

    fn tx(id: u64) -> TransactionId {
        TransactionId::new(id)
    }

    #[test]
    fn ids_are_strictly_increasing() {
        let (_, wal) = create_wal();
        let a = wal.log_write("a", 0, b"1", tx(1)).unwrap();
        let b = wal.log_delete("a", tx(1)).unwrap();
        let c = wal.log_commit(tx(1)).unwrap();
        assert!(a < b && b < c);
        assert_eq!(wal.last_committed_entry_id(), c);
        assert_eq!(wal.entries().unwrap().len(), 3);
    }

    #[test]
    fn read_empty_wal() {
        let (_, wal) = create_wal();
        assert!(wal.entries().unwrap().is_empty());
        assert_eq!(wal.size().unwrap(), 0);
    }

    #[test]
    fn replay_applies_only_committed() {
        let (_, wal) = create_wal();
        wal.log_write("users.data", 0, b"alice", tx(1)).unwrap();
        wal.log_commit(tx(1)).unwrap();

        wal.log_write("users.data", 0, b"mallory", tx(2)).unwrap();
        wal.log_rollback(tx(2)).unwrap();

        wal.log_write("orders.data", 0, b"pending", tx(3)).unwrap();

        let target = MemoryStorage::new();
        let stats = wal.replay(&target, &CancellationToken::new()).unwrap();

        assert_eq!(stats.applied_entries, 1);
        assert_eq!(stats.skipped_entries, 2);
        assert_eq!(target.read_all("users.data").unwrap(), b"alice");
        assert!(!target.exists("orders.data").unwrap());
    }

    #[test]
    fn later_rollback_supersedes_commit() {
        let (_, wal) = create_wal();
        wal.log_write("x", 0, b"1", tx(1)).unwrap();
        wal.log_commit(tx(1)).unwrap();
        wal.log_rollback(tx(1)).unwrap();

        let target = MemoryStorage::new();
        let stats = wal.replay(&target, &CancellationToken::new()).unwrap();
        assert_eq!(stats.committed_transactions, 0);
        assert!(!target.exists("x").unwrap());
    }

    #[test]
    fn replay_honours_cancellation() {
        let (_, wal) = create_wal();
        wal.log_write("x", 0, b"1", tx(1)).unwrap();
        wal.log_commit(tx(1)).unwrap();

        let token = CancellationToken::new();
        token.cancel();
        let err = wal.replay(&MemoryStorage::new(), &token).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Cancelled);
    }

    #[test]
    fn reopen_recovers_counters_without_index() {
        let (backend, wal) = create_wal();
        wal.log_write("x", 0, b"1", tx(4)).unwrap();
        let commit = wal.log_commit(tx(4)).unwrap();
        drop(wal);

        let reopened = WriteAheadLog::open(backend).unwrap();
        assert_eq!(reopened.next_entry_id(), commit.next());
        assert_eq!(reopened.last_committed_entry_id(), commit);
        assert_eq!(reopened.highest_transaction_id(), tx(4));
    }

    #[test]
    fn torn_tail_is_trimmed_on_open() {
        let (backend, wal) = create_wal();
        wal.log_write("x", 0, b"kept", tx(1)).unwrap();
        wal.log_commit(tx(1)).unwrap();
        let good_len = wal.size().unwrap();
        drop(wal);

        backend
            .write(LOG_LOCATION, good_len, &[1, 0, 0, 0, 0])
            .unwrap();

        let reopened = WriteAheadLog::open(backend.clone()).unwrap();
        assert_eq!(reopened.size().unwrap(), good_len);
        reopened.log_write("y", 0, b"after", tx(2)).unwrap();
        assert_eq!(reopened.entries().unwrap().len(), 3);
    }

    #[test]
    fn torn_tail_is_trimmed_under_encryption() {
        let raw = Arc::new(MemoryStorage::new());
        let key = EncryptionKey::generate();
        let encrypted = || -> Arc<dyn Backend> {
            Arc::new(EncryptedBackend::new(
                raw.clone(),
                Arc::new(AesGcmEncryption::new(&key)),
            ))
        };

        let wal = WriteAheadLog::open(encrypted()).unwrap();
        wal.log_write("x", 0, b"kept", tx(1)).unwrap();
        let commit = wal.log_commit(tx(1)).unwrap();
        wal.log_write("y", 0, b"torn", tx(2)).unwrap();
        drop(wal);

        let bytes = raw.read_all(LOG_LOCATION).unwrap();
        raw.replace(LOG_LOCATION, &bytes[..bytes.len() - 3]).unwrap();

        let reopened = WriteAheadLog::open(encrypted()).unwrap();
        let entries = reopened.entries().unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(reopened.last_committed_entry_id(), commit);

        reopened.log_write("z", 0, b"after", tx(3)).unwrap();
        assert_eq!(reopened.entries().unwrap().len(), 3);
    }

    #[test]
    fn truncate_past_last_commit_fails() {
        let (_, wal) = create_wal();
        wal.log_write("x", 0, b"1", tx(1)).unwrap();
        let err = wal.truncate(EntryId::new(1)).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidState);
    }

    #[test]
    fn truncate_keeps_unresolved_transactions() {
        let (_, wal) = create_wal();
        wal.log_write("open.data", 0, b"in flight", tx(2)).unwrap();
        wal.log_write("done.data", 0, b"durable", tx(1)).unwrap();
        let commit = wal.log_commit(tx(1)).unwrap();

        wal.truncate(commit).unwrap();

        let remaining = wal.entries().unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].transaction_id, tx(2));

        // Appends continue after the rewritten log.
        wal.log_commit(tx(2)).unwrap();
        assert_eq!(wal.entries().unwrap().len(), 2);
    }

    #[test]
    fn checkpoint_persists_index() {
        let (backend, wal) = create_wal();
        wal.log_write("x", 0, b"1", tx(1)).unwrap();
        let commit = wal.log_commit(tx(1)).unwrap();
        wal.checkpoint().unwrap();

        assert!(wal.entries().unwrap().is_empty());
        assert!(!backend.exists(LOG_LOCATION).unwrap());

        let reopened = WriteAheadLog::open(backend).unwrap();
        assert_eq!(reopened.next_entry_id(), commit.next());
        assert_eq!(reopened.last_committed_entry_id(), commit);
    }

    #[test]
    fn resolve_incomplete_logs_rollbacks() {
        let (_, wal) = create_wal();
        wal.log_write("a", 0, b"1", tx(1)).unwrap();
        wal.log_write("b", 0, b"2", tx(2)).unwrap();
        wal.log_commit(tx(2)).unwrap();

        assert_eq!(wal.resolve_incomplete().unwrap(), 1);
        let last = wal.entries().unwrap().pop().unwrap();
        assert_eq!(last.entry_type, WalEntryType::Rollback);
        assert_eq!(last.transaction_id, tx(1));
    }

    #[test]
    fn invalid_entry_fails_open() {
        let backend = Arc::new(MemoryStorage::new());
        let mut garbage = vec![0u8; 64];
        garbage[8..12].copy_from_slice(&77i32.to_le_bytes());
        backend.write(LOG_LOCATION, 0, &garbage).unwrap();

        let err = WriteAheadLog::open(backend).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::IntegrityFailure);
    }

    #[derive(Debug, Clone)]
    enum Op {
        Write(u8, Vec<u8>),
        Delete(u8),
    }

    fn op_strategy() -> impl Strategy<Value = Op> {
        prop_oneof![
            (0u8..4, proptest::collection::vec(any::<u8>(), 0..32))
                .prop_map(|(loc, data)| Op::Write(loc, data)),
            (0u8..4).prop_map(Op::Delete),
        ]
    }

    proptest! {
        #[test]
        fn replay_matches_direct_application(
            txs in proptest::collection::vec(
                (proptest::collection::vec(op_strategy(), 1..5), any::<bool>()),
                1..6,
            )
        ) {
            let (_, wal) = create_wal();
            let expected = MemoryStorage::new();

            for (i, (ops, commit)) in txs.iter().enumerate() {
                let id = tx(i as u64 + 1);
                for op in ops {
                    match op {
                        Op::Write(loc, data) => {
                            let location = format!("loc{loc}");
                            wal.log_write(&location, 0, data, id).unwrap();
                            if *commit {
                                expected.write(&location, 0, data).unwrap();
                            }
                        }
                        Op::Delete(loc) => {
                            let location = format!("loc{loc}");
                            wal.log_delete(&location, id).unwrap();
                            if *commit {
                                expected.delete(&location).unwrap();
                            }
                        }
                    }
                }
                if *commit {
                    wal.log_commit(id).unwrap();
                } else {
                    wal.log_rollback(id).unwrap();
                }
            }

            let target = MemoryStorage::new();
            wal.replay(&target, &CancellationToken::new()).unwrap();
            prop_assert_eq!(target.snapshot(), expected.snapshot());
        }
    }
}
