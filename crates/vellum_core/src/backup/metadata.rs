//! Backup catalog records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Kind of backup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BackupType {
    /// Every location.
    Full,
    /// Only locations changed since a base backup.
    Incremental,
}

/// Lifecycle of a backup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BackupStatus {
    /// Archive is being written.
    InProgress,
    /// Archive is closed and checksummed; restorable.
    Completed,
    /// Creation or restore failed.
    Failed,
    /// A restore from this backup is running.
    Restoring,
}

impl fmt::Display for BackupStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::InProgress => "in progress",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Restoring => "restoring",
        };
        write!(f, "{s}")
    }
}

/// One entry of `backups.json`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackupMetadata {
    /// Caller-chosen id; also the archive file stem.
    pub backup_id: String,
    /// Full or incremental.
    #[serde(rename = "type")]
    pub backup_type: BackupType,
    /// Base of an incremental backup.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_backup_id: Option<String>,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Archive size in bytes.
    pub size_bytes: u64,
    /// Number of locations stored in the archive.
    pub location_count: u64,
    /// Current status.
    pub status: BackupStatus,
    /// Hex SHA-256 of the closed archive.
    #[serde(default)]
    pub checksum: Option<String>,
    /// Hex SHA-256 of every location in the backend at backup time.
    ///
    /// Incremental backups diff against this map.
    #[serde(default)]
    pub digests: BTreeMap<String, String>,
    /// Locations present in the base but gone at backup time.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub deleted_locations: Vec<String>,
}

impl BackupMetadata {
    pub(crate) fn in_progress(
        backup_id: &str,
        backup_type: BackupType,
        base_backup_id: Option<&str>,
    ) -> Self {
        Self {
            backup_id: backup_id.to_string(),
            backup_type,
            base_backup_id: base_backup_id.map(str::to_string),
            created_at: Utc::now(),
            size_bytes: 0,
            location_count: 0,
            status: BackupStatus::InProgress,
            checksum: None,
            digests: BTreeMap::new(),
            deleted_locations: Vec::new(),
        }
    }

    /// Returns true if the backup can be restored.
    #[must_use]
    pub fn is_restorable(&self) -> bool {
        self.status == BackupStatus::Completed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serializes_type_field() {
        let meta = BackupMetadata::in_progress("b1", BackupType::Incremental, Some("b0"));
        let json = serde_json::to_string(&meta).unwrap();
        assert!(json.contains("\"type\":\"Incremental\""));
        assert!(json.contains("\"baseBackupId\":\"b0\""));
        assert!(json.contains("\"status\":\"InProgress\""));

        let back: BackupMetadata = serde_json::from_str(&json).unwrap();
        assert_eq!(back, meta);
        assert!(!back.is_restorable());
    }
}
