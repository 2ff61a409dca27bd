//! Append-only audit trail.
//!
//! Every apply or rollback produces one [`AuditEntry`]. Entries go through
//! the [`AuditSink`] port: [`FileAuditLog`] is the durable implementation,
//! [`MemoryAuditLog`] is for tests and embedding.
//!
//! # On-disk format
//!
//! One JSON object per line, one file per UTC day:
//! `<audit_dir>/audit-YYYY-MM-DD.jsonl`. Each append holds an exclusive lock
//! on the partition only for the duration of the write, so concurrent
//! processes never interleave partial lines.

use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::sync::{Arc, Mutex};

use camino::{Utf8Path, Utf8PathBuf};
use chrono::{DateTime, NaiveDate, Utc};
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, instrument};

use crate::classify::BumpDecision;

const PARTITION_PREFIX: &str = "audit-";
const PARTITION_SUFFIX: &str = ".jsonl";

/// Errors from the audit trail.
#[derive(Error, Debug)]
pub enum AuditError {
    /// Opening, locking, or writing a partition failed.
    #[error("audit log I/O on {path}: {source}")]
    Io {
        /// Partition or directory path.
        path: Utf8PathBuf,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// An entry could not be serialized.
    #[error("failed to serialize audit entry: {0}")]
    Serialize(#[source] serde_json::Error),

    /// A stored line is not a valid entry.
    #[error("corrupt audit entry at {path}:{line}: {source}")]
    Corrupt {
        /// Partition path.
        path: Utf8PathBuf,
        /// 1-based line number.
        line: usize,
        /// Parse error.
        #[source]
        source: serde_json::Error,
    },

    /// The sink refused the entry.
    #[error("audit sink unavailable: {0}")]
    Unavailable(String),
}

/// Result alias for audit operations.
pub type AuditResult<T> = Result<T, AuditError>;

/// Final state of an audited operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    /// The operation completed.
    Success,
    /// The operation failed; nothing was left changed, or the failure could
    /// not be undone.
    Failed,
    /// The operation failed after mutating and was undone.
    RolledBack,
}

impl std::fmt::Display for Outcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Success => write!(f, "success"),
            Self::Failed => write!(f, "failed"),
            Self::RolledBack => write!(f, "rolled_back"),
        }
    }
}

/// What the audited operation was.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    /// Classify-then-apply run.
    Apply,
    /// Explicit rollback of an earlier run.
    Rollback,
}

/// Hashes of one file around a mutation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileChange {
    /// File path.
    pub path: Utf8PathBuf,
    /// Hash immediately before the mutation.
    pub hash_before: String,
    /// Hash immediately after the mutation.
    pub hash_after: String,
}

/// One immutable audit record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEntry {
    /// Unique operation identifier.
    pub operation_id: String,
    /// When the operation finished.
    pub timestamp: DateTime<Utc>,
    /// Kind of operation.
    pub action: Action,
    /// SHA-256 of the classified text.
    pub input_digest: String,
    /// The classification that drove the operation.
    pub decision: BumpDecision,
    /// For rollbacks, the operation that was undone.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reverts: Option<String>,
    /// Target document, when one was involved.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<Utf8PathBuf>,
    /// Version before the operation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub previous_version: Option<String>,
    /// Version after the operation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub new_version: Option<String>,
    /// Files touched, in mutation order.
    pub files_affected: Vec<FileChange>,
    /// Final state.
    pub result: Outcome,
    /// Error message for failed or rolled-back operations.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Port through which runs record their outcome.
pub trait AuditSink {
    /// Append `entry`. Earlier entries are never rewritten.
    fn record(&self, entry: &AuditEntry) -> AuditResult<()>;
}

impl<T: AuditSink + ?Sized> AuditSink for Arc<T> {
    fn record(&self, entry: &AuditEntry) -> AuditResult<()> {
        (**self).record(entry)
    }
}

/// Entry selection for [`FileAuditLog::query`].
#[derive(Debug, Clone, Default)]
pub struct AuditFilter {
    /// First UTC day to include.
    pub since: Option<NaiveDate>,
    /// Last UTC day to include.
    pub until: Option<NaiveDate>,
    /// Only entries with this result.
    pub result: Option<Outcome>,
}

impl AuditFilter {
    fn includes_day(&self, day: NaiveDate) -> bool {
        self.since.is_none_or(|since| day >= since) && self.until.is_none_or(|until| day <= until)
    }

    fn matches(&self, entry: &AuditEntry) -> bool {
        self.includes_day(entry.timestamp.date_naive())
            && self.result.is_none_or(|result| entry.result == result)
    }
}

/// Durable audit log, partitioned by UTC day.
#[derive(Debug, Clone)]
pub struct FileAuditLog {
    dir: Utf8PathBuf,
}

impl FileAuditLog {
    /// A log stored under `dir`. The directory is created on first write.
    pub fn new(dir: impl Into<Utf8PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// The log directory.
    pub fn dir(&self) -> &Utf8Path {
        &self.dir
    }

    /// Partition file for `day`.
    pub fn partition_path(&self, day: NaiveDate) -> Utf8PathBuf {
        self.dir.join(format!(
            "{PARTITION_PREFIX}{}{PARTITION_SUFFIX}",
            day.format("%Y-%m-%d")
        ))
    }

    /// Entries matching `filter`, read lazily.
    ///
    /// The returned query can be iterated any number of times; each pass
    /// rescans the partitions from the start.
    pub fn query(&self, filter: AuditFilter) -> AuditQuery<'_> {
        AuditQuery { log: self, filter }
    }

    /// Partitions overlapping the filter, oldest first.
    fn partitions(&self, filter: &AuditFilter) -> AuditResult<Vec<Utf8PathBuf>> {
        let entries = match self.dir.read_dir_utf8() {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(source) => {
                return Err(AuditError::Io {
                    path: self.dir.clone(),
                    source,
                });
            }
        };

        let mut days = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|source| AuditError::Io {
                path: self.dir.clone(),
                source,
            })?;
            let Some(day) = partition_day(entry.file_name()) else {
                continue;
            };
            if filter.includes_day(day) {
                days.push((day, entry.path().to_path_buf()));
            }
        }
        days.sort();
        Ok(days.into_iter().map(|(_, path)| path).collect())
    }
}

impl AuditSink for FileAuditLog {
    #[instrument(skip(self, entry), fields(operation_id = %entry.operation_id, result = %entry.result))]
    fn record(&self, entry: &AuditEntry) -> AuditResult<()> {
        let mut line = serde_json::to_vec(entry).map_err(AuditError::Serialize)?;
        line.push(b'\n');

        std::fs::create_dir_all(&self.dir).map_err(|source| AuditError::Io {
            path: self.dir.clone(),
            source,
        })?;

        let path = self.partition_path(entry.timestamp.date_naive());
        let io_err = |source: std::io::Error| AuditError::Io {
            path: path.clone(),
            source,
        };

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(io_err)?;
        FileExt::lock_exclusive(&file).map_err(io_err)?;
        let written = (&file).write_all(&line).and_then(|()| file.sync_data());
        let unlocked = FileExt::unlock(&file);
        written.map_err(io_err)?;
        unlocked.map_err(io_err)?;

        debug!(%path, "audit entry appended");
        Ok(())
    }
}

fn partition_day(file_name: &str) -> Option<NaiveDate> {
    let day = file_name
        .strip_prefix(PARTITION_PREFIX)?
        .strip_suffix(PARTITION_SUFFIX)?;
    NaiveDate::parse_from_str(day, "%Y-%m-%d").ok()
}

/// A restartable, read-only view over matching entries.
#[derive(Debug, Clone)]
pub struct AuditQuery<'a> {
    log: &'a FileAuditLog,
    filter: AuditFilter,
}

impl AuditQuery<'_> {
    /// Start a fresh pass over the matching entries.
    pub fn iter(&self) -> AuditEntries {
        match self.log.partitions(&self.filter) {
            Ok(partitions) => AuditEntries {
                filter: self.filter.clone(),
                partitions: partitions.into_iter(),
                current: None,
                pending_error: None,
            },
            Err(e) => AuditEntries {
                filter: self.filter.clone(),
                partitions: Vec::new().into_iter(),
                current: None,
                pending_error: Some(e),
            },
        }
    }
}

impl<'q> IntoIterator for &'q AuditQuery<'_> {
    type Item = AuditResult<AuditEntry>;
    type IntoIter = AuditEntries;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

struct OpenPartition {
    path: Utf8PathBuf,
    reader: BufReader<File>,
    line: usize,
}

/// Lazy iterator over audit entries; see [`AuditQuery::iter`].
pub struct AuditEntries {
    filter: AuditFilter,
    partitions: std::vec::IntoIter<Utf8PathBuf>,
    current: Option<OpenPartition>,
    pending_error: Option<AuditError>,
}

impl Iterator for AuditEntries {
    type Item = AuditResult<AuditEntry>;

    fn next(&mut self) -> Option<Self::Item> {
        if let Some(e) = self.pending_error.take() {
            return Some(Err(e));
        }

        let mut buf = String::new();
        loop {
            let Some(partition) = self.current.as_mut() else {
                let path = self.partitions.next()?;
                match File::open(&path) {
                    Ok(file) => {
                        self.current = Some(OpenPartition {
                            path,
                            reader: BufReader::new(file),
                            line: 0,
                        });
                    }
                    // Removed between listing and opening.
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                    Err(source) => return Some(Err(AuditError::Io { path, source })),
                }
                continue;
            };

            buf.clear();
            match partition.reader.read_line(&mut buf) {
                Ok(0) => {
                    self.current = None;
                    continue;
                }
                Ok(_) => {}
                Err(source) => {
                    let path = partition.path.clone();
                    self.current = None;
                    return Some(Err(AuditError::Io { path, source }));
                }
            }
            partition.line += 1;

            // A line without its newline is an append still in progress.
            if !buf.ends_with('\n') {
                self.current = None;
                continue;
            }
            if buf.trim().is_empty() {
                continue;
            }

            match serde_json::from_str::<AuditEntry>(&buf) {
                Ok(entry) if self.filter.matches(&entry) => return Some(Ok(entry)),
                Ok(_) => {}
                Err(source) => {
                    return Some(Err(AuditError::Corrupt {
                        path: partition.path.clone(),
                        line: partition.line,
                        source,
                    }));
                }
            }
        }
    }
}

/// In-memory sink.
#[derive(Debug, Default)]
pub struct MemoryAuditLog {
    entries: Mutex<Vec<AuditEntry>>,
}

impl MemoryAuditLog {
    /// An empty log.
    pub fn new() -> Self {
        Self::default()
    }

    /// Everything recorded so far, in order.
    pub fn entries(&self) -> Vec<AuditEntry> {
        self.entries
            .lock()
            .map(|entries| entries.clone())
            .unwrap_or_default()
    }
}

impl AuditSink for MemoryAuditLog {
    fn record(&self, entry: &AuditEntry) -> AuditResult<()> {
        self.entries
            .lock()
            .map_err(|_| AuditError::Unavailable("memory log poisoned".into()))?
            .push(entry.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classify::{BumpKind, classify};
    use chrono::TimeZone;
    use tempfile::TempDir;

    fn entry(id: &str, timestamp: DateTime<Utc>, result: Outcome) -> AuditEntry {
        AuditEntry {
            operation_id: id.to_string(),
            timestamp,
            action: Action::Apply,
            input_digest: crate::digest::content_hash(id),
            decision: classify("fix: thing", None),
            reverts: None,
            target: Some(Utf8PathBuf::from("STANDARDS.md")),
            previous_version: Some("1.0.0".into()),
            new_version: Some("1.0.1".into()),
            files_affected: vec![FileChange {
                path: Utf8PathBuf::from("STANDARDS.md"),
                hash_before: "a".repeat(64),
                hash_after: "b".repeat(64),
            }],
            result,
            error: None,
        }
    }

    fn day(y: i32, m: u32, d: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, 12, 0, 0).unwrap()
    }

    fn log() -> (TempDir, FileAuditLog) {
        let tmp = TempDir::new().unwrap();
        let dir = Utf8PathBuf::try_from(tmp.path().join("audit")).unwrap();
        (tmp, FileAuditLog::new(dir))
    }

    fn ids(query: &AuditQuery<'_>) -> Vec<String> {
        query
            .iter()
            .map(|e| e.unwrap().operation_id)
            .collect()
    }

    #[test]
    fn entries_are_partitioned_by_day() {
        let (_tmp, log) = log();
        log.record(&entry("a", day(2026, 3, 1), Outcome::Success)).unwrap();
        log.record(&entry("b", day(2026, 3, 2), Outcome::Success)).unwrap();

        let first = NaiveDate::from_ymd_opt(2026, 3, 1).unwrap();
        let contents = std::fs::read_to_string(log.partition_path(first)).unwrap();
        assert_eq!(contents.lines().count(), 1);
        assert!(log.dir().join("audit-2026-03-02.jsonl").is_file());
    }

    #[test]
    fn appends_never_rewrite_earlier_lines() {
        let (_tmp, log) = log();
        let first = entry("a", day(2026, 3, 1), Outcome::Success);
        log.record(&first).unwrap();
        let path = log.partition_path(first.timestamp.date_naive());
        let before = std::fs::read(&path).unwrap();

        log.record(&entry("b", day(2026, 3, 1), Outcome::Failed)).unwrap();
        let after = std::fs::read(&path).unwrap();
        assert!(after.starts_with(&before));
    }

    #[test]
    fn query_filters_by_date_and_result() {
        let (_tmp, log) = log();
        log.record(&entry("a", day(2026, 3, 1), Outcome::Success)).unwrap();
        log.record(&entry("b", day(2026, 3, 2), Outcome::RolledBack)).unwrap();
        log.record(&entry("c", day(2026, 3, 3), Outcome::Success)).unwrap();

        assert_eq!(ids(&log.query(AuditFilter::default())), ["a", "b", "c"]);

        let ranged = log.query(AuditFilter {
            since: NaiveDate::from_ymd_opt(2026, 3, 2),
            until: NaiveDate::from_ymd_opt(2026, 3, 3),
            result: None,
        });
        assert_eq!(ids(&ranged), ["b", "c"]);

        let rolled_back = log.query(AuditFilter {
            result: Some(Outcome::RolledBack),
            ..AuditFilter::default()
        });
        assert_eq!(ids(&rolled_back), ["b"]);
    }

    #[test]
    fn query_is_restartable_and_sees_new_entries() {
        let (_tmp, log) = log();
        log.record(&entry("a", day(2026, 3, 1), Outcome::Success)).unwrap();

        let query = log.query(AuditFilter::default());
        assert_eq!(ids(&query), ["a"]);
        assert_eq!(ids(&query), ["a"]);

        log.record(&entry("b", day(2026, 3, 1), Outcome::Success)).unwrap();
        assert_eq!(ids(&query), ["a", "b"]);
    }

    #[test]
    fn entry_round_trips_through_the_log() {
        let (_tmp, log) = log();
        let original = entry("a", day(2026, 3, 1), Outcome::Success);
        log.record(&original).unwrap();

        let read: Vec<_> = log
            .query(AuditFilter::default())
            .iter()
            .collect::<Result<_, _>>()
            .unwrap();
        assert_eq!(read, vec![original]);
    }

    #[test]
    fn partial_trailing_line_is_skipped() {
        let (_tmp, log) = log();
        let e = entry("a", day(2026, 3, 1), Outcome::Success);
        log.record(&e).unwrap();
        let path = log.partition_path(e.timestamp.date_naive());
        let mut file = OpenOptions::new().append(true).open(&path).unwrap();
        file.write_all(b"{\"operation_id\":\"half").unwrap();

        assert_eq!(ids(&log.query(AuditFilter::default())), ["a"]);
    }

    #[test]
    fn corrupt_line_is_reported() {
        let (_tmp, log) = log();
        std::fs::create_dir_all(log.dir()).unwrap();
        std::fs::write(log.dir().join("audit-2026-03-01.jsonl"), "not json\n").unwrap();

        let items: Vec<_> = log.query(AuditFilter::default()).iter().collect();
        assert_eq!(items.len(), 1);
        assert!(matches!(items[0], Err(AuditError::Corrupt { line: 1, .. })));
    }

    #[test]
    fn missing_directory_yields_nothing() {
        let (_tmp, log) = log();
        assert!(log.query(AuditFilter::default()).iter().next().is_none());
    }

    #[test]
    fn unrelated_files_are_ignored() {
        let (_tmp, log) = log();
        std::fs::create_dir_all(log.dir()).unwrap();
        std::fs::write(log.dir().join("notes.txt"), "hello\n").unwrap();
        std::fs::write(log.dir().join("audit-latest.jsonl"), "junk\n").unwrap();
        assert!(log.query(AuditFilter::default()).iter().next().is_none());
    }

    #[test]
    fn concurrent_writers_do_not_corrupt_each_other() {
        let (_tmp, log) = log();
        let threads: Vec<_> = (0..8)
            .map(|t| {
                let log = log.clone();
                std::thread::spawn(move || {
                    for i in 0..25 {
                        let id = format!("t{t}-{i}");
                        log.record(&entry(&id, day(2026, 3, 1), Outcome::Success))
                            .unwrap();
                    }
                })
            })
            .collect();
        for handle in threads {
            handle.join().unwrap();
        }

        let entries: Vec<_> = log
            .query(AuditFilter::default())
            .iter()
            .collect::<Result<_, _>>()
            .unwrap();
        assert_eq!(entries.len(), 200);
    }

    #[test]
    fn memory_log_keeps_order() {
        let memory = MemoryAuditLog::new();
        memory.record(&entry("a", day(2026, 3, 1), Outcome::Success)).unwrap();
        memory.record(&entry("b", day(2026, 3, 1), Outcome::Failed)).unwrap();
        let ids: Vec<_> = memory.entries().into_iter().map(|e| e.operation_id).collect();
        assert_eq!(ids, ["a", "b"]);
    }

    #[test]
    fn outcome_serializes_snake_case() {
        let json = serde_json::to_string(&Outcome::RolledBack).unwrap();
        assert_eq!(json, "\"rolled_back\"");
        let decision = BumpDecision::explicit(BumpKind::Patch);
        let json = serde_json::to_value(&decision).unwrap();
        assert_eq!(json["kind"], "patch");
    }
}
