//! Write-Ahead Log (WAL) for durability and crash recovery.
//!
//! Mutations are logged before they reach the data backend. On reopen the
//! log is replayed and only operations of committed transactions are
//! re-applied.
//!
//! ## Entry Format
//!
//! All integers are little-endian:
//!
//! ```text
//! | id (i64) | type (i32) | txid (i64) | timestamp (i64) |
//! | location length (i32) | location (UTF-8) | offset (i64) |
//! | data length (i32) | data |
//! ```
//!
//! The log lives at location `wal.log`; `wal.index` holds the next entry id
//! and the last committed entry id as two little-endian `u64`s.
//!
//! ## Recovery Policy
//!
//! - **Torn tail**: an entry cut short by a crash is treated as the end of
//!   the log and trimmed on open
//! - **Unknown type, negative length or id**: fatal `WalCorruption`
//!
//! ## Invariants
//!
//! - Entry ids are strictly increasing and never reused
//! - Every append is flushed before the call returns
//! - A Write/Delete is visible after replay only if a Commit for its
//!   transaction exists and no later Rollback supersedes it

mod record;
mod writer;

pub use record::{parse_log, ParsedLog, WalEntry, WalEntryType};
pub use writer::{ReplayStats, WriteAheadLog, INDEX_LOCATION, LOG_LOCATION};
