//! Index traits and key types.

use crate::error::CoreResult;
use std::hash::Hash;
use vellum_storage::CancellationToken;

/// A key that can be indexed.
///
/// Index keys must be hashable and cheap to clone. Any type meeting the
/// bounds is a key.
pub trait IndexKey: Clone + Eq + Hash + Send + Sync + 'static {}

impl<K> IndexKey for K where K: Clone + Eq + Hash + Send + Sync + 'static {}

/// An index attached to a collection of `T`, seen through the key-erased
/// surface the collection needs for maintenance.
///
/// Collections hold their indexes as `Arc<dyn AttachedIndex<T>>` so that
/// indexes with different key types can live side by side.
pub trait AttachedIndex<T>: Send + Sync {
    /// Name the index was registered under.
    fn name(&self) -> &str;

    /// Indexes `item` under the key its selector produces.
    fn add_item(&self, item: &T) -> CoreResult<()>;

    /// Removes one occurrence of `item` from the bucket of its key.
    fn remove_item(&self, item: &T) -> CoreResult<()>;

    /// Replaces the contents with a full scan of `items`.
    ///
    /// On cancellation the previous contents are kept.
    fn rebuild_from(&self, items: &[T], cancel: &CancellationToken) -> CoreResult<()>;

    /// Number of key/value entries.
    fn entry_count(&self) -> CoreResult<usize>;

    /// Releases the index; later operations fail.
    fn dispose(&self);
}
