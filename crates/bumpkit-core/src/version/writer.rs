//! Reading and rewriting versioned documents.
//!
//! Rewriting is split in two so callers can stage a backup in between:
//! [`VersionDocument::load`] + [`LoadedDocument::plan`] read and compute
//! without side effects, and [`PlannedBump::write`] performs the mutation
//! through a [`DocumentWriter`].

use std::io::Write;

use camino::{Utf8Path, Utf8PathBuf};
use serde::Serialize;
use tracing::{debug, info, instrument};

use super::{SemanticVersion, VersionError, VersionResult, VersionToken, locate};
use crate::classify::{BumpDecision, BumpKind};
use crate::digest::content_hash;

/// Port for the single destructive operation of a run.
///
/// The default is [`AtomicFileWriter`]; tests substitute writers that fail
/// part-way to exercise rollback.
pub trait DocumentWriter {
    /// Replace the contents of `path` with `contents`.
    fn write(&self, path: &Utf8Path, contents: &[u8]) -> std::io::Result<()>;
}

/// Writes through a temp file in the target's directory, then renames it
/// over the target. Readers see either the old or the new document.
#[derive(Debug, Clone, Copy, Default)]
pub struct AtomicFileWriter;

impl DocumentWriter for AtomicFileWriter {
    fn write(&self, path: &Utf8Path, contents: &[u8]) -> std::io::Result<()> {
        let dir = match path.parent() {
            Some(p) if !p.as_str().is_empty() => p,
            _ => Utf8Path::new("."),
        };
        let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
        tmp.write_all(contents)?;
        tmp.as_file().sync_all()?;
        if let Ok(meta) = std::fs::metadata(path) {
            tmp.as_file().set_permissions(meta.permissions())?;
        }
        tmp.persist(path).map_err(|e| e.error)?;
        Ok(())
    }
}

/// Outcome of a successful rewrite.
#[derive(Debug, Clone, Serialize)]
pub struct WriteResult {
    /// Rewritten document.
    pub path: Utf8PathBuf,
    /// Version before the rewrite.
    pub previous: SemanticVersion,
    /// Version after the rewrite.
    pub next: SemanticVersion,
    /// Content hash before the rewrite.
    pub hash_before: String,
    /// Content hash after the rewrite, as read back from disk.
    pub hash_after: String,
}

/// A document that declares its version with a labelled token.
#[derive(Debug, Clone)]
pub struct VersionDocument {
    path: Utf8PathBuf,
    labels: Vec<String>,
}

impl VersionDocument {
    /// A document at `path` whose token is introduced by one of `labels`.
    pub fn new(path: impl Into<Utf8PathBuf>, labels: Vec<String>) -> Self {
        Self {
            path: path.into(),
            labels,
        }
    }

    /// Path of the document.
    pub fn path(&self) -> &Utf8Path {
        &self.path
    }

    /// Read the document and locate its version token.
    ///
    /// The document is handled as raw bytes, so any encoding that spells the
    /// label and token in ASCII works.
    #[instrument(skip(self), fields(path = %self.path))]
    pub fn load(&self) -> VersionResult<LoadedDocument> {
        let contents = std::fs::read(&self.path).map_err(|source| VersionError::Read {
            path: self.path.to_string(),
            source,
        })?;
        let token = locate(&contents, &self.labels)?;
        debug!(version = %token.version, label = %token.label, "found version token");
        Ok(LoadedDocument {
            path: self.path.clone(),
            hash: content_hash(&contents),
            contents,
            token,
        })
    }

    /// Apply `decision` to this document in one step.
    ///
    /// Returns `None` without touching the file when the decision is
    /// [`BumpKind::None`].
    pub fn apply_bump(
        &self,
        decision: &BumpDecision,
        writer: &dyn DocumentWriter,
    ) -> VersionResult<Option<WriteResult>> {
        if decision.is_none() {
            debug!("no bump requested");
            return Ok(None);
        }
        let loaded = self.load()?;
        loaded.plan(decision.kind)?.write(writer).map(Some)
    }
}

/// A document read into memory with its token located.
#[derive(Debug, Clone)]
pub struct LoadedDocument {
    /// Document path.
    pub path: Utf8PathBuf,
    /// Full contents.
    pub contents: Vec<u8>,
    /// Content hash of `contents`.
    pub hash: String,
    /// The located token.
    pub token: VersionToken,
}

impl LoadedDocument {
    /// Compute the rewrite for `kind` without touching the file.
    pub fn plan(&self, kind: BumpKind) -> VersionResult<PlannedBump> {
        let next = self.token.version.bumped(kind)?;
        Ok(PlannedBump {
            path: self.path.clone(),
            previous: self.token.version,
            next,
            hash_before: self.hash.clone(),
            contents: self.token.rewrite(&self.contents, &next),
        })
    }
}

/// A rewrite ready to be written.
#[derive(Debug, Clone)]
pub struct PlannedBump {
    /// Target document.
    pub path: Utf8PathBuf,
    /// Current version.
    pub previous: SemanticVersion,
    /// Version after the write.
    pub next: SemanticVersion,
    /// Hash of the document as loaded.
    pub hash_before: String,
    /// Full new contents.
    pub contents: Vec<u8>,
}

impl PlannedBump {
    /// Write the new contents and verify them by reading the file back.
    #[instrument(skip(self, writer), fields(path = %self.path, next = %self.next))]
    pub fn write(&self, writer: &dyn DocumentWriter) -> VersionResult<WriteResult> {
        let write_err = |source: std::io::Error| VersionError::Write {
            path: self.path.to_string(),
            source,
        };

        writer
            .write(&self.path, &self.contents)
            .map_err(write_err)?;

        let written = std::fs::read(&self.path).map_err(write_err)?;
        let hash_after = content_hash(&written);
        if hash_after != content_hash(&self.contents) {
            return Err(write_err(std::io::Error::other(
                "document contents differ from what was written",
            )));
        }

        info!(previous = %self.previous, next = %self.next, "version token rewritten");
        Ok(WriteResult {
            path: self.path.clone(),
            previous: self.previous,
            next: self.next,
            hash_before: self.hash_before.clone(),
            hash_after,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classify::classify;
    use tempfile::TempDir;

    fn doc_in(tmp: &TempDir, contents: &str) -> VersionDocument {
        let path = Utf8PathBuf::try_from(tmp.path().join("STANDARDS.md")).unwrap();
        std::fs::write(&path, contents).unwrap();
        VersionDocument::new(path, vec!["VERSION".into()])
    }

    #[test]
    fn major_bump_rewrites_token() {
        let tmp = TempDir::new().unwrap();
        let doc = doc_in(&tmp, "# Title\nVERSION: 01.05.02\n");
        let decision = classify("BREAKING CHANGE: removed v1 API", None);

        let result = doc.apply_bump(&decision, &AtomicFileWriter).unwrap().unwrap();

        assert_eq!(
            std::fs::read_to_string(doc.path()).unwrap(),
            "# Title\nVERSION: 02.00.00\n"
        );
        assert_eq!(result.previous.to_string(), "01.05.02");
        assert_eq!(result.next.to_string(), "02.00.00");
        assert_eq!(result.hash_before, content_hash("# Title\nVERSION: 01.05.02\n"));
        assert_eq!(result.hash_after, content_hash("# Title\nVERSION: 02.00.00\n"));
    }

    #[test]
    fn none_decision_leaves_file_alone() {
        let tmp = TempDir::new().unwrap();
        let doc = doc_in(&tmp, "VERSION: 1.0.0\n");
        let result = doc.apply_bump(&BumpDecision::none(), &AtomicFileWriter).unwrap();
        assert!(result.is_none());
        assert_eq!(std::fs::read_to_string(doc.path()).unwrap(), "VERSION: 1.0.0\n");
    }

    #[test]
    fn ambiguous_document_is_untouched() {
        let tmp = TempDir::new().unwrap();
        let original = "VERSION: 1.0.0\nVERSION: 1.0.1\n";
        let doc = doc_in(&tmp, original);
        let err = doc
            .apply_bump(&BumpDecision::explicit(BumpKind::Patch), &AtomicFileWriter)
            .unwrap_err();
        assert!(matches!(err, VersionError::TokenNotFound { found: 2, .. }));
        assert_eq!(std::fs::read(doc.path()).unwrap(), original.as_bytes());
    }

    #[test]
    fn tokenless_document_is_untouched() {
        let tmp = TempDir::new().unwrap();
        let original = "# Nothing to see\r\n";
        let doc = doc_in(&tmp, original);
        let err = doc
            .apply_bump(&BumpDecision::explicit(BumpKind::Minor), &AtomicFileWriter)
            .unwrap_err();
        assert!(matches!(err, VersionError::TokenNotFound { found: 0, .. }));
        assert_eq!(std::fs::read(doc.path()).unwrap(), original.as_bytes());
    }

    #[test]
    fn missing_document_is_a_read_error() {
        let doc = VersionDocument::new("/nonexistent/STANDARDS.md", vec![]);
        assert!(matches!(doc.load(), Err(VersionError::Read { .. })));
    }

    #[test]
    fn non_utf8_document_is_rewritten_byte_for_byte() {
        let tmp = TempDir::new().unwrap();
        let path = Utf8PathBuf::try_from(tmp.path().join("legacy.txt")).unwrap();
        std::fs::write(&path, b"R\xe9vision\r\nVERSION: 2.4.9\r\n\xa9 1998\r\n").unwrap();
        let doc = VersionDocument::new(path, vec!["VERSION".into()]);

        let result = doc
            .apply_bump(&BumpDecision::explicit(BumpKind::Patch), &AtomicFileWriter)
            .unwrap()
            .unwrap();

        assert_eq!(result.next.to_string(), "2.4.10");
        assert_eq!(
            std::fs::read(doc.path()).unwrap(),
            b"R\xe9vision\r\nVERSION: 2.4.10\r\n\xa9 1998\r\n"
        );
    }

    #[test]
    fn overflowing_bump_is_refused_before_writing() {
        let tmp = TempDir::new().unwrap();
        let original = format!("VERSION: 1.0.{}\n", u64::MAX);
        let doc = doc_in(&tmp, &original);

        let err = doc.load().unwrap().plan(BumpKind::Patch).unwrap_err();
        assert!(matches!(err, VersionError::Overflow { .. }));
        assert_eq!(std::fs::read_to_string(doc.path()).unwrap(), original);
    }

    struct RefusingWriter;

    impl DocumentWriter for RefusingWriter {
        fn write(&self, _path: &Utf8Path, _contents: &[u8]) -> std::io::Result<()> {
            Err(std::io::Error::other("disk full"))
        }
    }

    #[test]
    fn writer_failure_surfaces_as_write_error() {
        let tmp = TempDir::new().unwrap();
        let doc = doc_in(&tmp, "VERSION: 1.0.0\n");
        let planned = doc.load().unwrap().plan(BumpKind::Patch).unwrap();
        assert!(matches!(
            planned.write(&RefusingWriter),
            Err(VersionError::Write { .. })
        ));
    }
}
