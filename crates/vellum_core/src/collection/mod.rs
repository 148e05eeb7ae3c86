//! Persistent collections.
//!
//! A collection is a named list of items stored as a single serialized blob
//! plus a JSON metadata blob, with hash indexes maintained on every mutation.

mod metadata;
mod persistent;

pub use metadata::{CollectionMetadata, CollectionStatistics};
pub use persistent::{CollectionItem, Items, ManagedCollection, PersistentCollection};
