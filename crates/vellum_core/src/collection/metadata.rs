//! Collection metadata blob and statistics.

use crate::error::CoreResult;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Contents of `<name>.metadata`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CollectionMetadata {
    /// Collection name.
    pub name: String,
    /// Number of items in the data blob.
    pub count: u64,
    /// When the collection was first created.
    pub created_at: DateTime<Utc>,
    /// When the collection was last mutated.
    pub last_modified: DateTime<Utc>,
}

impl CollectionMetadata {
    /// Creates metadata for an empty collection.
    pub fn new(name: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            name: name.into(),
            count: 0,
            created_at: now,
            last_modified: now,
        }
    }

    /// Encodes as JSON.
    pub fn to_bytes(&self) -> CoreResult<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Decodes from JSON.
    pub fn from_bytes(bytes: &[u8]) -> CoreResult<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

/// Size and shape of a collection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CollectionStatistics {
    /// Number of items.
    pub item_count: u64,
    /// Number of attached indexes.
    pub index_count: usize,
    /// Key/value entries held across all attached indexes.
    pub index_entry_count: usize,
    /// Size of the data blob in bytes.
    pub data_size: u64,
    /// Size of the metadata blob in bytes.
    pub metadata_size: u64,
}

impl CollectionStatistics {
    /// Combined size of both blobs.
    #[must_use]
    pub fn total_size(&self) -> u64 {
        self.data_size + self.metadata_size
    }
}
