//! Archive-based backup provider.

use crate::backup::metadata::{BackupMetadata, BackupStatus, BackupType};
use crate::error::{CoreError, CoreResult};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use vellum_storage::Backend;

/// Catalog file inside the backup directory.
pub const CATALOG_FILE: &str = "backups.json";
const CATALOG_TEMP: &str = "backups.json.tmp";
const ARCHIVE_EXTENSION: &str = "tar.gz";

/// Stores backups as gzip-compressed tar archives in a directory.
///
/// ```text
/// <dir>/
/// ├─ backups.json      # backupId -> metadata
/// ├─ <id>.tar.gz       # one entry per location, named after it
/// └─ ...
/// ```
///
/// Operations are serialized by the catalog lock.
pub struct FileBackupProvider {
    dir: PathBuf,
    catalog: Mutex<BTreeMap<String, BackupMetadata>>,
}

impl FileBackupProvider {
    /// Opens the backup directory, creating it if needed.
    pub fn open(dir: impl AsRef<Path>) -> CoreResult<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;

        let catalog_path = dir.join(CATALOG_FILE);
        let catalog = if catalog_path.exists() {
            serde_json::from_slice(&fs::read(&catalog_path)?)?
        } else {
            BTreeMap::new()
        };
        Ok(Self {
            dir,
            catalog: Mutex::new(catalog),
        })
    }

    /// Returns the backup directory.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Returns the archive path for `backup_id`.
    pub fn archive_path(&self, backup_id: &str) -> PathBuf {
        self.dir.join(format!("{backup_id}.{ARCHIVE_EXTENSION}"))
    }

    /// Archives every location in `backend`.
    pub fn create_backup(
        &self,
        backend: &dyn Backend,
        backup_id: &str,
    ) -> CoreResult<BackupMetadata> {
        self.create(backend, backup_id, None)
    }

    /// Archives the locations added or changed since `base_backup_id`.
    ///
    /// Locations present in the base but missing now are recorded as
    /// deletions.
    pub fn create_incremental_backup(
        &self,
        backend: &dyn Backend,
        backup_id: &str,
        base_backup_id: &str,
    ) -> CoreResult<BackupMetadata> {
        self.create(backend, backup_id, Some(base_backup_id))
    }

    fn create(
        &self,
        backend: &dyn Backend,
        backup_id: &str,
        base_backup_id: Option<&str>,
    ) -> CoreResult<BackupMetadata> {
        validate_id(backup_id)?;
        let mut catalog = self.catalog.lock();
        if catalog.contains_key(backup_id) {
            return Err(CoreError::BackupExists {
                backup_id: backup_id.to_string(),
            });
        }
        let base = match base_backup_id {
            Some(base_id) => {
                let base = catalog
                    .get(base_id)
                    .ok_or_else(|| CoreError::backup_not_found(base_id))?;
                if !base.is_restorable() {
                    return Err(CoreError::invalid_operation(format!(
                        "base backup '{base_id}' is {}",
                        base.status
                    )));
                }
                Some(base.clone())
            }
            None => None,
        };

        let backup_type = if base.is_some() {
            BackupType::Incremental
        } else {
            BackupType::Full
        };
        tracing::info!(backup_id, ?backup_type, "creating backup");
        catalog.insert(
            backup_id.to_string(),
            BackupMetadata::in_progress(backup_id, backup_type, base_backup_id),
        );
        self.persist_catalog(&catalog)?;

        let result = self.write_archive(backend, backup_id, base.as_ref());
        let meta = match catalog.get_mut(backup_id) {
            Some(meta) => meta,
            None => return Err(CoreError::backup_not_found(backup_id)),
        };
        match result {
            Ok(written) => {
                meta.size_bytes = written.size_bytes;
                meta.location_count = written.location_count;
                meta.checksum = Some(written.checksum);
                meta.digests = written.digests;
                meta.deleted_locations = written.deleted_locations;
                meta.status = BackupStatus::Completed;
                let meta = meta.clone();
                self.persist_catalog(&catalog)?;
                tracing::info!(
                    backup_id,
                    locations = meta.location_count,
                    bytes = meta.size_bytes,
                    "backup completed"
                );
                Ok(meta)
            }
            Err(e) => {
                tracing::error!(backup_id, error = %e, "backup failed");
                meta.status = BackupStatus::Failed;
                self.persist_catalog(&catalog)?;
                Err(e)
            }
        }
    }

    fn write_archive(
        &self,
        backend: &dyn Backend,
        backup_id: &str,
        base: Option<&BackupMetadata>,
    ) -> CoreResult<WrittenArchive> {
        let path = self.archive_path(backup_id);
        let file = File::create(&path)?;
        let encoder = GzEncoder::new(BufWriter::new(file), Compression::default());
        let mut builder = tar::Builder::new(encoder);

        let mut digests = BTreeMap::new();
        let mut location_count = 0u64;
        for location in backend.list(None)? {
            let data = backend.read_all(&location)?;
            let digest = hex::encode(Sha256::digest(&data));

            let unchanged = base
                .and_then(|b| b.digests.get(&location))
                .is_some_and(|d| *d == digest);
            if !unchanged {
                let mut header = tar::Header::new_gnu();
                header.set_size(data.len() as u64);
                header.set_mode(0o644);
                header.set_cksum();
                builder.append_data(&mut header, &location, data.as_slice())?;
                location_count += 1;
            }
            digests.insert(location, digest);
        }

        let deleted_locations = base
            .map(|b| {
                b.digests
                    .keys()
                    .filter(|l| !digests.contains_key(*l))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();

        let encoder = builder.into_inner()?;
        let mut writer = encoder.finish()?;
        writer.flush()?;
        let file = writer.into_inner().map_err(|e| e.into_error())?;
        file.sync_all()?;
        drop(file);

        // Checksum only once the archive is closed.
        let checksum = file_sha256(&path)?;
        let size_bytes = fs::metadata(&path)?.len();
        Ok(WrittenArchive {
            size_bytes,
            location_count,
            checksum,
            digests,
            deleted_locations,
        })
    }

    /// Restores `backup_id` into `backend`.
    ///
    /// The base chain is restored oldest first. Every archived location
    /// replaces the current contents; recorded deletions are applied.
    /// Locations created after the backup are left alone.
    pub fn restore_backup(&self, backend: &dyn Backend, backup_id: &str) -> CoreResult<()> {
        let mut catalog = self.catalog.lock();
        if !catalog.contains_key(backup_id) {
            return Err(CoreError::backup_not_found(backup_id));
        }

        let result = match self.restore_chain(&catalog, backup_id) {
            Ok(chain) => {
                set_status(&mut catalog, backup_id, BackupStatus::Restoring);
                self.persist_catalog(&catalog)?;
                tracing::info!(backup_id, chain = chain.len(), "restoring backup");
                chain
                    .iter()
                    .try_for_each(|meta| self.apply_archive(backend, meta))
                    .and_then(|()| Ok(backend.flush()?))
            }
            Err(e) => Err(e),
        };

        match result {
            Ok(()) => {
                set_status(&mut catalog, backup_id, BackupStatus::Completed);
                self.persist_catalog(&catalog)?;
                tracing::info!(backup_id, "restore completed");
                Ok(())
            }
            Err(e) => {
                tracing::error!(backup_id, error = %e, "restore failed");
                set_status(&mut catalog, backup_id, BackupStatus::Failed);
                self.persist_catalog(&catalog)?;
                Err(e)
            }
        }
    }

    /// Returns `backup_id` and its bases, oldest first, after checking each
    /// is restorable and intact.
    fn restore_chain(
        &self,
        catalog: &BTreeMap<String, BackupMetadata>,
        backup_id: &str,
    ) -> CoreResult<Vec<BackupMetadata>> {
        let mut chain = Vec::new();
        let mut next = Some(backup_id.to_string());
        while let Some(id) = next {
            let meta = catalog
                .get(&id)
                .ok_or_else(|| CoreError::backup_not_found(&id))?;
            if !meta.is_restorable() {
                return Err(CoreError::invalid_operation(format!(
                    "backup '{id}' is {}",
                    meta.status
                )));
            }
            if chain.iter().any(|m: &BackupMetadata| m.backup_id == id) {
                return Err(CoreError::integrity(format!(
                    "backup chain of '{backup_id}' loops at '{id}'"
                )));
            }
            self.verify_checksum(meta)?;
            next = meta.base_backup_id.clone();
            chain.push(meta.clone());
        }
        chain.reverse();
        Ok(chain)
    }

    fn apply_archive(&self, backend: &dyn Backend, meta: &BackupMetadata) -> CoreResult<()> {
        let file = File::open(self.archive_path(&meta.backup_id))?;
        let mut archive = tar::Archive::new(GzDecoder::new(BufReader::new(file)));
        for entry in archive.entries()? {
            let mut entry = entry?;
            let location = entry.path()?.to_string_lossy().into_owned();
            let mut data = Vec::with_capacity(usize::try_from(entry.size()).unwrap_or(0));
            entry.read_to_end(&mut data)?;
            backend.replace(&location, &data).map_err(|e| {
                tracing::error!(
                    backup_id = %meta.backup_id,
                    location = %location,
                    error = %e,
                    "failed to restore location"
                );
                e
            })?;
        }
        for location in &meta.deleted_locations {
            backend.delete(location)?;
        }
        Ok(())
    }

    /// Returns every backup, oldest first.
    pub fn list_backups(&self) -> Vec<BackupMetadata> {
        let mut backups: Vec<BackupMetadata> = self.catalog.lock().values().cloned().collect();
        backups.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then_with(|| a.backup_id.cmp(&b.backup_id))
        });
        backups
    }

    /// Returns the metadata of `backup_id`.
    pub fn get_backup_metadata(&self, backup_id: &str) -> CoreResult<BackupMetadata> {
        self.catalog
            .lock()
            .get(backup_id)
            .cloned()
            .ok_or_else(|| CoreError::backup_not_found(backup_id))
    }

    /// Deletes `backup_id` and its archive.
    ///
    /// # Errors
    ///
    /// `InvalidOperation` if another backup uses it as a base.
    pub fn delete_backup(&self, backup_id: &str) -> CoreResult<()> {
        let mut catalog = self.catalog.lock();
        if !catalog.contains_key(backup_id) {
            return Err(CoreError::backup_not_found(backup_id));
        }
        if let Some(dependent) = catalog
            .values()
            .find(|m| m.base_backup_id.as_deref() == Some(backup_id))
        {
            return Err(CoreError::invalid_operation(format!(
                "backup '{backup_id}' is the base of '{}'",
                dependent.backup_id
            )));
        }

        let path = self.archive_path(backup_id);
        if path.exists() {
            fs::remove_file(&path)?;
        }
        catalog.remove(backup_id);
        self.persist_catalog(&catalog)?;
        tracing::info!(backup_id, "deleted backup");
        Ok(())
    }

    /// Checks that `backup_id` is completed and its archive matches the
    /// recorded checksum.
    pub fn validate_backup(&self, backup_id: &str) -> CoreResult<bool> {
        let meta = self.get_backup_metadata(backup_id)?;
        if !meta.is_restorable() {
            return Ok(false);
        }
        match self.verify_checksum(&meta) {
            Ok(()) => Ok(true),
            Err(CoreError::ChecksumMismatch { .. }) => Ok(false),
            Err(CoreError::Io(e)) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e),
        }
    }

    fn verify_checksum(&self, meta: &BackupMetadata) -> CoreResult<()> {
        let expected = meta.checksum.clone().unwrap_or_default();
        let actual = file_sha256(&self.archive_path(&meta.backup_id))?;
        if actual != expected {
            tracing::warn!(backup_id = %meta.backup_id, "backup checksum mismatch");
            return Err(CoreError::ChecksumMismatch { expected, actual });
        }
        Ok(())
    }

    fn persist_catalog(&self, catalog: &BTreeMap<String, BackupMetadata>) -> CoreResult<()> {
        let temp = self.dir.join(CATALOG_TEMP);
        {
            let mut file = File::create(&temp)?;
            file.write_all(&serde_json::to_vec_pretty(catalog)?)?;
            file.sync_all()?;
        }
        fs::rename(&temp, self.dir.join(CATALOG_FILE))?;
        Ok(())
    }
}

impl std::fmt::Debug for FileBackupProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileBackupProvider")
            .field("dir", &self.dir)
            .field("backups", &self.catalog.lock().len())
            .finish()
    }
}

struct WrittenArchive {
    size_bytes: u64,
    location_count: u64,
    checksum: String,
    digests: BTreeMap<String, String>,
    deleted_locations: Vec<String>,
}

fn set_status(
    catalog: &mut BTreeMap<String, BackupMetadata>,
    backup_id: &str,
    status: BackupStatus,
) {
    if let Some(meta) = catalog.get_mut(backup_id) {
        meta.status = status;
    }
}

fn validate_id(backup_id: &str) -> CoreResult<()> {
    if backup_id.is_empty()
        || backup_id.contains(['/', '\\'])
        || backup_id.starts_with('.')
    {
        return Err(CoreError::invalid_operation(format!(
            "invalid backup id '{backup_id}'"
        )));
    }
    Ok(())
}

fn file_sha256(path: &Path) -> CoreResult<String> {
    let mut reader = BufReader::new(File::open(path)?);
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 64 * 1024];
    loop {
        let n = reader.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}
