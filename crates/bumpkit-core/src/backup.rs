//! Content-addressed backups and rollback.
//!
//! # Layout
//!
//! ```text
//! <backup_dir>/
//!   objects/<sha256>.bak          file contents, named by their hash
//!   manifests/<operation_id>.json records staged by one run
//! ```
//!
//! A snapshot is all-or-nothing: every target is read before anything is
//! written, and blobs written by a failed snapshot are removed again by a
//! staging guard. Identical contents share one blob.

use std::io::Write;

use camino::{Utf8Path, Utf8PathBuf};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

use crate::digest::content_hash;
use crate::version::{AtomicFileWriter, DocumentWriter};

/// Errors from backup and restore operations.
#[derive(Error, Debug)]
pub enum BackupError {
    /// A file to snapshot, or a backup blob, could not be read.
    #[error("failed to read {path}: {source}")]
    Read {
        /// Path that failed.
        path: Utf8PathBuf,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// A blob, manifest, or restored file could not be written.
    #[error("failed to write {path}: {source}")]
    Write {
        /// Path that failed.
        path: Utf8PathBuf,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// A manifest exists but is not valid JSON.
    #[error("corrupt backup manifest {path}: {source}")]
    Manifest {
        /// Manifest path.
        path: Utf8PathBuf,
        /// Parse error.
        #[source]
        source: serde_json::Error,
    },

    /// No manifest for the requested operation.
    #[error("no backup recorded for operation {0}")]
    NotFound(String),

    /// Restored content does not hash to the recorded value.
    #[error(
        "restore of {path} could not be verified: expected {expected}, found {actual} (backup at {backup_location})"
    )]
    RestoreVerification {
        /// File being restored.
        path: Utf8PathBuf,
        /// Hash recorded at snapshot time.
        expected: String,
        /// Hash actually observed.
        actual: String,
        /// Blob the content came from.
        backup_location: Utf8PathBuf,
    },
}

/// Result alias for backup operations.
pub type BackupResult<T> = Result<T, BackupError>;

/// Snapshot of one file taken before it was mutated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupRecord {
    /// Absolute path of the original file.
    pub path: Utf8PathBuf,
    /// Hash of the file at snapshot time.
    pub original_content_hash: String,
    /// Blob holding the snapshot.
    pub backup_location: Utf8PathBuf,
    /// When the snapshot was taken.
    pub created_at: DateTime<Utc>,
    /// Hash the operation left the file with, once its write succeeded.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub written_hash: Option<String>,
}

/// Records staged by one operation, persisted for later rollback.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupManifest {
    /// Operation that staged the records.
    pub operation_id: String,
    /// When the manifest was written.
    pub created_at: DateTime<Utc>,
    /// Staged records, in snapshot order.
    pub records: Vec<BackupRecord>,
}

/// Owns a backup directory.
#[derive(Debug, Clone)]
pub struct BackupManager {
    root: Utf8PathBuf,
}

impl BackupManager {
    /// Manage backups under `root`. Nothing is created until the first
    /// snapshot.
    pub fn new(root: impl Into<Utf8PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// The backup directory.
    pub fn root(&self) -> &Utf8Path {
        &self.root
    }

    fn objects_dir(&self) -> Utf8PathBuf {
        self.root.join("objects")
    }

    fn manifests_dir(&self) -> Utf8PathBuf {
        self.root.join("manifests")
    }

    fn manifest_path(&self, operation_id: &str) -> Utf8PathBuf {
        self.manifests_dir().join(format!("{operation_id}.json"))
    }

    /// Snapshot `paths` without recording a manifest.
    pub fn snapshot(&self, paths: &[Utf8PathBuf]) -> BackupResult<Vec<BackupRecord>> {
        self.stage(None, paths)
    }

    /// Snapshot `paths` and record them under `operation_id` so the
    /// operation can be rolled back later.
    pub fn snapshot_for(
        &self,
        operation_id: &str,
        paths: &[Utf8PathBuf],
    ) -> BackupResult<Vec<BackupRecord>> {
        self.stage(Some(operation_id), paths)
    }

    #[instrument(skip(self, paths), fields(root = %self.root, files = paths.len()))]
    fn stage(
        &self,
        operation_id: Option<&str>,
        paths: &[Utf8PathBuf],
    ) -> BackupResult<Vec<BackupRecord>> {
        // Read everything first: an unreadable target aborts before any write.
        let mut contents = Vec::with_capacity(paths.len());
        for path in paths {
            let absolute = path.canonicalize_utf8().map_err(|source| BackupError::Read {
                path: path.clone(),
                source,
            })?;
            let bytes = std::fs::read(&absolute).map_err(|source| BackupError::Read {
                path: absolute.clone(),
                source,
            })?;
            contents.push((absolute, bytes));
        }

        let objects = self.objects_dir();
        create_dir(&objects)?;

        let mut staging = Staging::default();
        let created_at = Utc::now();
        let mut records = Vec::with_capacity(contents.len());
        for (path, bytes) in contents {
            let hash = content_hash(&bytes);
            let location = objects.join(format!("{hash}.bak"));

            if blob_matches(&location, &hash) {
                debug!(%path, %hash, "identical snapshot already stored");
            } else {
                write_atomic(&location, &bytes)?;
                staging.created.push(location.clone());
            }

            records.push(BackupRecord {
                path,
                original_content_hash: hash,
                backup_location: location,
                created_at,
                written_hash: None,
            });
        }

        if let Some(operation_id) = operation_id {
            let manifest = BackupManifest {
                operation_id: operation_id.to_owned(),
                created_at,
                records: records.clone(),
            };
            let path = self.manifest_path(operation_id);
            create_dir(&self.manifests_dir())?;
            let json = serde_json::to_vec_pretty(&manifest).map_err(|source| {
                BackupError::Manifest {
                    path: path.clone(),
                    source,
                }
            })?;
            write_atomic(&path, &json)?;
        }

        staging.commit();
        info!(records = records.len(), "snapshot staged");
        Ok(records)
    }

    /// Copy each record's blob back over its original path, verifying the
    /// result.
    ///
    /// Records are restored in reverse order, undoing the most recent
    /// mutation first.
    #[instrument(skip(self, records), fields(records = records.len()))]
    pub fn restore(&self, records: &[BackupRecord]) -> BackupResult<()> {
        for record in records.iter().rev() {
            let blob = std::fs::read(&record.backup_location).map_err(|source| BackupError::Read {
                path: record.backup_location.clone(),
                source,
            })?;
            let blob_hash = content_hash(&blob);
            if blob_hash != record.original_content_hash {
                return Err(verification_error(record, blob_hash));
            }

            AtomicFileWriter
                .write(&record.path, &blob)
                .map_err(|source| BackupError::Write {
                    path: record.path.clone(),
                    source,
                })?;

            let restored = std::fs::read(&record.path).map_err(|source| BackupError::Read {
                path: record.path.clone(),
                source,
            })?;
            let restored_hash = content_hash(&restored);
            if restored_hash != record.original_content_hash {
                return Err(verification_error(record, restored_hash));
            }
            info!(path = %record.path, "restored from backup");
        }
        Ok(())
    }

    /// Read the manifest recorded for `operation_id`.
    pub fn load(&self, operation_id: &str) -> BackupResult<BackupManifest> {
        let path = self.manifest_path(operation_id);
        let bytes = match std::fs::read(&path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(BackupError::NotFound(operation_id.to_owned()));
            }
            Err(source) => return Err(BackupError::Read { path, source }),
        };
        serde_json::from_slice(&bytes).map_err(|source| BackupError::Manifest { path, source })
    }

    /// Note in the manifest of `operation_id` that `path` now hashes to
    /// `hash`.
    #[instrument(skip(self))]
    pub fn mark_written(&self, operation_id: &str, path: &Utf8Path, hash: &str) -> BackupResult<()> {
        let mut manifest = self.load(operation_id)?;
        for record in manifest.records.iter_mut().filter(|r| r.path.as_path() == path) {
            record.written_hash = Some(hash.to_owned());
        }
        let manifest_path = self.manifest_path(operation_id);
        let json = serde_json::to_vec_pretty(&manifest).map_err(|source| BackupError::Manifest {
            path: manifest_path.clone(),
            source,
        })?;
        write_atomic(&manifest_path, &json)
    }

    /// Restore the records of `operation_id` and retire its manifest.
    ///
    /// The manifest is only removed once every record restored cleanly.
    #[instrument(skip(self))]
    pub fn consume(&self, operation_id: &str) -> BackupResult<Vec<BackupRecord>> {
        let manifest = self.load(operation_id)?;
        self.restore(&manifest.records)?;
        let path = self.manifest_path(operation_id);
        std::fs::remove_file(&path).map_err(|source| BackupError::Write { path, source })?;
        info!(records = manifest.records.len(), "backup consumed");
        Ok(manifest.records)
    }

    /// Remove backups older than `retention`. Returns the number of records
    /// purged.
    pub fn purge_expired(&self, retention: Duration) -> BackupResult<usize> {
        self.purge_expired_at(retention, Utc::now())
    }

    /// [`purge_expired`](Self::purge_expired) against a fixed clock.
    #[instrument(skip(self), fields(root = %self.root))]
    pub fn purge_expired_at(&self, retention: Duration, now: DateTime<Utc>) -> BackupResult<usize> {
        let cutoff = now - retention;
        let mut purged = 0;
        let mut referenced = std::collections::HashSet::new();

        for path in list_files(&self.manifests_dir(), "json")? {
            let bytes = std::fs::read(&path).map_err(|source| BackupError::Read {
                path: path.clone(),
                source,
            })?;
            let manifest: BackupManifest = match serde_json::from_slice(&bytes) {
                Ok(m) => m,
                Err(e) => {
                    warn!(%path, error = %e, "skipping unreadable manifest");
                    continue;
                }
            };

            let newest = manifest
                .records
                .iter()
                .map(|r| r.created_at)
                .max()
                .unwrap_or(manifest.created_at);
            if newest < cutoff {
                std::fs::remove_file(&path).map_err(|source| BackupError::Write {
                    path: path.clone(),
                    source,
                })?;
                purged += manifest.records.len();
                debug!(operation_id = %manifest.operation_id, "purged expired manifest");
            } else {
                referenced.extend(manifest.records.into_iter().map(|r| r.backup_location));
            }
        }

        // Blobs are shared between manifests; drop only those nothing points at
        // and that are themselves past the window.
        for blob in list_files(&self.objects_dir(), "bak")? {
            if referenced.contains(&blob) {
                continue;
            }
            let modified = std::fs::metadata(&blob)
                .and_then(|m| m.modified())
                .map(DateTime::<Utc>::from)
                .map_err(|source| BackupError::Read {
                    path: blob.clone(),
                    source,
                })?;
            if modified < cutoff {
                std::fs::remove_file(&blob).map_err(|source| BackupError::Write {
                    path: blob.clone(),
                    source,
                })?;
                debug!(%blob, "removed unreferenced blob");
            }
        }

        info!(purged, "retention purge complete");
        Ok(purged)
    }
}

/// Removes blobs written by an unfinished snapshot.
#[derive(Default)]
struct Staging {
    created: Vec<Utf8PathBuf>,
    committed: bool,
}

impl Staging {
    const fn commit(&mut self) {
        self.committed = true;
    }
}

impl Drop for Staging {
    fn drop(&mut self) {
        if self.committed {
            return;
        }
        for path in &self.created {
            if let Err(e) = std::fs::remove_file(path) {
                warn!(%path, error = %e, "failed to remove partial snapshot");
            }
        }
    }
}

fn verification_error(record: &BackupRecord, actual: String) -> BackupError {
    BackupError::RestoreVerification {
        path: record.path.clone(),
        expected: record.original_content_hash.clone(),
        actual,
        backup_location: record.backup_location.clone(),
    }
}

fn blob_matches(location: &Utf8Path, hash: &str) -> bool {
    std::fs::read(location).is_ok_and(|existing| content_hash(existing) == hash)
}

fn create_dir(dir: &Utf8Path) -> BackupResult<()> {
    std::fs::create_dir_all(dir).map_err(|source| BackupError::Write {
        path: dir.to_path_buf(),
        source,
    })
}

fn write_atomic(path: &Utf8Path, bytes: &[u8]) -> BackupResult<()> {
    let write = || -> std::io::Result<()> {
        let dir = path.parent().unwrap_or_else(|| Utf8Path::new("."));
        let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
        tmp.write_all(bytes)?;
        tmp.as_file().sync_all()?;
        tmp.persist(path).map_err(|e| e.error)?;
        Ok(())
    };
    write().map_err(|source| BackupError::Write {
        path: path.to_path_buf(),
        source,
    })
}

fn list_files(dir: &Utf8Path, extension: &str) -> BackupResult<Vec<Utf8PathBuf>> {
    let entries = match dir.read_dir_utf8() {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(source) => {
            return Err(BackupError::Read {
                path: dir.to_path_buf(),
                source,
            });
        }
    };

    let mut files = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|source| BackupError::Read {
            path: dir.to_path_buf(),
            source,
        })?;
        let path = entry.path();
        if path.extension() == Some(extension) && path.is_file() {
            files.push(path.to_path_buf());
        }
    }
    files.sort();
    Ok(files)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    struct Fixture {
        _tmp: TempDir,
        dir: Utf8PathBuf,
        manager: BackupManager,
    }

    fn fixture() -> Fixture {
        let tmp = TempDir::new().unwrap();
        let dir = Utf8PathBuf::try_from(tmp.path().to_path_buf()).unwrap();
        let manager = BackupManager::new(dir.join("backups"));
        Fixture {
            _tmp: tmp,
            dir,
            manager,
        }
    }

    fn write(dir: &Utf8Path, name: &str, contents: &str) -> Utf8PathBuf {
        let path = dir.join(name);
        std::fs::write(&path, contents).unwrap();
        path
    }

    fn blob_count(manager: &BackupManager) -> usize {
        list_files(&manager.objects_dir(), "bak").unwrap().len()
    }

    #[test]
    fn snapshot_then_restore_round_trips() {
        let fx = fixture();
        let doc = write(&fx.dir, "doc.md", "VERSION: 1.0.0\n");

        let records = fx.manager.snapshot(std::slice::from_ref(&doc)).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].original_content_hash, content_hash("VERSION: 1.0.0\n"));
        assert!(
            records[0]
                .backup_location
                .as_str()
                .ends_with(&format!("{}.bak", records[0].original_content_hash))
        );

        std::fs::write(&doc, "VERSION: 9.9.9\n").unwrap();
        fx.manager.restore(&records).unwrap();
        assert_eq!(std::fs::read_to_string(&doc).unwrap(), "VERSION: 1.0.0\n");
    }

    #[test]
    fn unreadable_target_aborts_without_blobs() {
        let fx = fixture();
        let good = write(&fx.dir, "good.md", "VERSION: 1.0.0\n");
        let missing = fx.dir.join("missing.md");

        let err = fx.manager.snapshot(&[good, missing]).unwrap_err();
        assert!(matches!(err, BackupError::Read { .. }));
        assert_eq!(blob_count(&fx.manager), 0);
    }

    #[test]
    fn identical_contents_share_one_blob() {
        let fx = fixture();
        let a = write(&fx.dir, "a.md", "same\n");
        let b = write(&fx.dir, "b.md", "same\n");

        let records = fx.manager.snapshot(&[a, b]).unwrap();
        assert_eq!(records[0].backup_location, records[1].backup_location);
        assert_eq!(blob_count(&fx.manager), 1);

        // A second snapshot reuses the stored blob.
        let c = write(&fx.dir, "c.md", "same\n");
        fx.manager.snapshot(&[c]).unwrap();
        assert_eq!(blob_count(&fx.manager), 1);
    }

    #[test]
    fn tampered_blob_fails_verification() {
        let fx = fixture();
        let doc = write(&fx.dir, "doc.md", "original\n");
        let records = fx.manager.snapshot(std::slice::from_ref(&doc)).unwrap();

        std::fs::write(&records[0].backup_location, "tampered\n").unwrap();
        std::fs::write(&doc, "changed\n").unwrap();

        let err = fx.manager.restore(&records).unwrap_err();
        assert!(matches!(err, BackupError::RestoreVerification { .. }));
        assert_eq!(std::fs::read_to_string(&doc).unwrap(), "changed\n");
    }

    #[test]
    fn manifest_round_trips_and_is_consumed() {
        let fx = fixture();
        let doc = write(&fx.dir, "doc.md", "VERSION: 2.0.0\n");
        let records = fx.manager.snapshot_for("op-1", std::slice::from_ref(&doc)).unwrap();

        let manifest = fx.manager.load("op-1").unwrap();
        assert_eq!(manifest.operation_id, "op-1");
        assert_eq!(manifest.records, records);

        std::fs::write(&doc, "VERSION: 3.0.0\n").unwrap();
        let consumed = fx.manager.consume("op-1").unwrap();
        assert_eq!(consumed, records);
        assert_eq!(std::fs::read_to_string(&doc).unwrap(), "VERSION: 2.0.0\n");
        assert!(matches!(fx.manager.load("op-1"), Err(BackupError::NotFound(_))));
    }

    #[test]
    fn written_hash_is_recorded_in_the_manifest() {
        let fx = fixture();
        let doc = write(&fx.dir, "doc.md", "VERSION: 1.0.0\n");
        let records = fx.manager.snapshot_for("op-1", std::slice::from_ref(&doc)).unwrap();
        assert_eq!(records[0].written_hash, None);

        let after = content_hash("VERSION: 1.1.0\n");
        fx.manager.mark_written("op-1", &records[0].path, &after).unwrap();

        let manifest = fx.manager.load("op-1").unwrap();
        assert_eq!(manifest.records[0].written_hash.as_deref(), Some(after.as_str()));
        assert_eq!(
            manifest.records[0].original_content_hash,
            records[0].original_content_hash
        );
    }

    #[test]
    fn unknown_operation_is_not_found() {
        let fx = fixture();
        assert!(matches!(fx.manager.consume("nope"), Err(BackupError::NotFound(_))));
    }

    #[test]
    fn purge_respects_retention_window() {
        let fx = fixture();
        let doc = write(&fx.dir, "doc.md", "VERSION: 1.0.0\n");
        fx.manager.snapshot_for("op-old", std::slice::from_ref(&doc)).unwrap();

        // Nothing is old enough yet.
        let purged = fx.manager.purge_expired(Duration::days(30)).unwrap();
        assert_eq!(purged, 0);
        assert!(fx.manager.load("op-old").is_ok());

        // Forty days later the manifest and its now-unreferenced blob go.
        let later = Utc::now() + Duration::days(40);
        let purged = fx.manager.purge_expired_at(Duration::days(30), later).unwrap();
        assert_eq!(purged, 1);
        assert!(matches!(fx.manager.load("op-old"), Err(BackupError::NotFound(_))));
        assert_eq!(blob_count(&fx.manager), 0);
    }

    #[test]
    fn purge_keeps_blobs_still_referenced() {
        let fx = fixture();
        let doc = write(&fx.dir, "doc.md", "shared\n");
        fx.manager.snapshot_for("op-a", std::slice::from_ref(&doc)).unwrap();

        // Age op-a's manifest by rewriting its timestamps.
        let mut manifest = fx.manager.load("op-a").unwrap();
        let old = Utc::now() - Duration::days(90);
        manifest.created_at = old;
        for record in &mut manifest.records {
            record.created_at = old;
        }
        std::fs::write(
            fx.manager.manifest_path("op-a"),
            serde_json::to_vec(&manifest).unwrap(),
        )
        .unwrap();

        fx.manager.snapshot_for("op-b", std::slice::from_ref(&doc)).unwrap();

        let purged = fx.manager.purge_expired(Duration::days(30)).unwrap();
        assert_eq!(purged, 1);
        assert!(fx.manager.load("op-b").is_ok());
        assert_eq!(blob_count(&fx.manager), 1);
    }

    #[test]
    fn purge_on_empty_directory_is_zero() {
        let fx = fixture();
        assert_eq!(fx.manager.purge_expired(Duration::days(1)).unwrap(), 0);
    }
}
