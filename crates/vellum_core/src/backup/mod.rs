//! Backup and restore.
//!
//! Full backups archive every backend location; incremental backups archive
//! only what changed since a base backup and record what was removed.

mod metadata;
mod provider;

pub use metadata::{BackupMetadata, BackupStatus, BackupType};
pub use provider::{FileBackupProvider, CATALOG_FILE};
