//! Transactions and savepoints.
//!
//! Transactions are explicit handles. Work staged in a handle reaches the
//! backend only on commit, after it has been made durable in the WAL.

mod manager;
mod state;

pub use manager::TransactionManager;
pub use state::{IsolationLevel, PendingOp, Savepoint, Transaction, TransactionState};
