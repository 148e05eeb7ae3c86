//! Index implementations for collection access paths.
//!
//! Indexes are in-memory, derived data:
//! - Declared on a collection with a key-selector closure
//! - Maintained by every collection mutation
//! - Fully rebuildable from a scan of the owning collection
//!
//! # Index Types
//!
//! - [`HashIndex`]: O(1) equality lookup, linear inclusive range scan

mod hash;
mod traits;

pub use hash::{HashIndex, KeySelector};
pub use traits::{AttachedIndex, IndexKey};
