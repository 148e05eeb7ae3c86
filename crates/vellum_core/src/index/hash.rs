//! Hash index implementation.

use crate::error::{CoreError, CoreResult};
use crate::index::traits::{AttachedIndex, IndexKey};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use vellum_storage::CancellationToken;

/// Key selector shared by an index and its owner.
pub type KeySelector<K, V> = Arc<dyn Fn(&V) -> K + Send + Sync>;

/// Hash-based multimap index for O(1) equality lookups.
///
/// `HashIndex` maps a projected key to every value that produced it.
/// Duplicate keys are legal and accumulate; the same value may appear in a
/// bucket more than once.
///
/// The index is derived data: [`rebuild`](Self::rebuild) from a full scan
/// of the owning collection reproduces it exactly.
///
/// # Example
///
/// ```rust
/// use vellum_core::HashIndex;
///
/// let index = HashIndex::new("by_len", |s: &String| s.len());
/// index.add_item(&"ab".to_string()).unwrap();
/// index.add_item(&"cd".to_string()).unwrap();
///
/// assert_eq!(index.find(&2).unwrap().len(), 2);
/// ```
pub struct HashIndex<K: IndexKey, V> {
    name: String,
    selector: KeySelector<K, V>,
    /// Key to values mapping.
    entries: RwLock<HashMap<K, Vec<V>>>,
    disposed: AtomicBool,
}

impl<K, V> HashIndex<K, V>
where
    K: IndexKey,
    V: Clone + PartialEq + Send + Sync,
{
    /// Creates an empty index projecting keys with `selector`.
    pub fn new<F>(name: impl Into<String>, selector: F) -> Self
    where
        F: Fn(&V) -> K + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            selector: Arc::new(selector),
            entries: RwLock::new(HashMap::new()),
            disposed: AtomicBool::new(false),
        }
    }

    /// Returns the index name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Projects the key of `value`.
    pub fn key_of(&self, value: &V) -> K {
        (self.selector)(value)
    }

    fn ensure_open(&self) -> CoreResult<()> {
        if self.disposed.load(Ordering::Acquire) {
            return Err(CoreError::IndexDisposed);
        }
        Ok(())
    }

    /// Adds `value` under `key`.
    pub fn add(&self, key: K, value: V) -> CoreResult<()> {
        self.ensure_open()?;
        self.entries.write().entry(key).or_default().push(value);
        Ok(())
    }

    /// Removes one occurrence of `value` under `key`.
    ///
    /// The bucket is dropped once empty. Returns whether anything was
    /// removed.
    pub fn remove(&self, key: &K, value: &V) -> CoreResult<bool> {
        self.ensure_open()?;
        let mut entries = self.entries.write();
        let Some(bucket) = entries.get_mut(key) else {
            return Ok(false);
        };
        let Some(pos) = bucket.iter().position(|v| v == value) else {
            return Ok(false);
        };
        bucket.remove(pos);
        if bucket.is_empty() {
            entries.remove(key);
        }
        Ok(true)
    }

    /// Moves `value` from `old_key` to `new_key`.
    pub fn update(&self, old_key: &K, new_key: K, value: V) -> CoreResult<()> {
        self.ensure_open()?;
        let mut entries = self.entries.write();
        if let Some(bucket) = entries.get_mut(old_key) {
            if let Some(pos) = bucket.iter().position(|v| *v == value) {
                bucket.remove(pos);
            }
            if bucket.is_empty() {
                entries.remove(old_key);
            }
        }
        entries.entry(new_key).or_default().push(value);
        Ok(())
    }

    /// Returns every value indexed under `key`.
    pub fn find(&self, key: &K) -> CoreResult<Vec<V>> {
        self.ensure_open()?;
        Ok(self.entries.read().get(key).cloned().unwrap_or_default())
    }

    /// Returns every key.
    pub fn all_keys(&self) -> CoreResult<Vec<K>> {
        self.ensure_open()?;
        Ok(self.entries.read().keys().cloned().collect())
    }

    /// Returns every indexed value.
    pub fn all_values(&self) -> CoreResult<Vec<V>> {
        self.ensure_open()?;
        Ok(self.entries.read().values().flatten().cloned().collect())
    }

    /// Returns the number of key/value entries.
    pub fn count(&self) -> CoreResult<usize> {
        self.ensure_open()?;
        Ok(self.entries.read().values().map(Vec::len).sum())
    }

    /// Returns the number of distinct keys.
    pub fn key_count(&self) -> CoreResult<usize> {
        self.ensure_open()?;
        Ok(self.entries.read().len())
    }

    /// Returns true if `key` has at least one value.
    pub fn contains_key(&self, key: &K) -> CoreResult<bool> {
        self.ensure_open()?;
        Ok(self.entries.read().contains_key(key))
    }

    /// Removes every entry.
    pub fn clear(&self) -> CoreResult<()> {
        self.ensure_open()?;
        self.entries.write().clear();
        Ok(())
    }

    /// Indexes `item` under its projected key.
    pub fn add_item(&self, item: &V) -> CoreResult<()> {
        let key = self.key_of(item);
        self.add(key, item.clone())
    }

    /// Removes one occurrence of `item` from its projected key.
    pub fn remove_item(&self, item: &V) -> CoreResult<bool> {
        let key = self.key_of(item);
        self.remove(&key, item)
    }

    /// Replaces the contents with a full scan of `items`.
    pub fn rebuild<I>(&self, items: I) -> CoreResult<()>
    where
        I: IntoIterator<Item = V>,
    {
        self.rebuild_cancellable(items, &CancellationToken::new())
    }

    /// Like [`rebuild`](Self::rebuild), checking `cancel` between items.
    ///
    /// The new mapping is built aside and swapped in at the end, so a
    /// cancelled rebuild leaves the previous contents untouched.
    pub fn rebuild_cancellable<I>(&self, items: I, cancel: &CancellationToken) -> CoreResult<()>
    where
        I: IntoIterator<Item = V>,
    {
        self.ensure_open()?;
        let mut rebuilt: HashMap<K, Vec<V>> = HashMap::new();
        for item in items {
            if cancel.is_cancelled() {
                return Err(CoreError::Cancelled);
            }
            rebuilt.entry(self.key_of(&item)).or_default().push(item);
        }
        *self.entries.write() = rebuilt;
        Ok(())
    }

    /// Releases the index. Subsequent operations fail with `IndexDisposed`.
    pub fn dispose(&self) {
        self.disposed.store(true, Ordering::Release);
        self.entries.write().clear();
    }

    /// Returns true once the index has been disposed.
    #[must_use]
    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }
}

impl<K, V> HashIndex<K, V>
where
    K: IndexKey + Ord,
    V: Clone + PartialEq + Send + Sync,
{
    /// Returns every value whose key lies in `start..=end`.
    ///
    /// This is a linear scan over all keys; results follow key order.
    pub fn find_range(&self, start: &K, end: &K) -> CoreResult<Vec<V>> {
        self.ensure_open()?;
        let entries = self.entries.read();
        let mut keys: Vec<&K> = entries
            .keys()
            .filter(|k| *k >= start && *k <= end)
            .collect();
        keys.sort();
        Ok(keys
            .into_iter()
            .flat_map(|k| entries[k].iter().cloned())
            .collect())
    }
}

impl<K, V> AttachedIndex<V> for HashIndex<K, V>
where
    K: IndexKey,
    V: Clone + PartialEq + Send + Sync,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn add_item(&self, item: &V) -> CoreResult<()> {
        HashIndex::add_item(self, item)
    }

    fn remove_item(&self, item: &V) -> CoreResult<()> {
        HashIndex::remove_item(self, item).map(|_| ())
    }

    fn rebuild_from(&self, items: &[V], cancel: &CancellationToken) -> CoreResult<()> {
        self.rebuild_cancellable(items.iter().cloned(), cancel)
    }

    fn entry_count(&self) -> CoreResult<usize> {
        self.count()
    }

    fn dispose(&self) {
        HashIndex::dispose(self);
    }
}

impl<K: IndexKey, V> std::fmt::Debug for HashIndex<K, V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HashIndex")
            .field("name", &self.name)
            .field("keys", &self.entries.read().len())
            .field("disposed", &self.disposed.load(Ordering::Relaxed))
            .finish()
    }
}
