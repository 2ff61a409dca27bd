//! Version tokens embedded in documents.
//!
//! Documents declare their version with a label, e.g. `VERSION: 01.02.03`.
//! This module finds that token ([`token`]), computes the next value while
//! keeping each component's zero-padded width ([`SemanticVersion`]), and
//! writes it back touching nothing but the token's bytes ([`writer`]).

pub mod token;
pub mod writer;

use serde::{Serialize, Serializer};
use thiserror::Error;

use crate::classify::BumpKind;

pub use token::{VersionToken, locate};
pub use writer::{AtomicFileWriter, DocumentWriter, VersionDocument, WriteResult};

/// Errors from version operations.
#[derive(Error, Debug)]
pub enum VersionError {
    /// Zero or several labelled tokens were found; an ambiguous target is
    /// never guessed.
    #[error("expected exactly one version token labelled {labels}, found {found}")]
    TokenNotFound {
        /// Labels that were searched for, joined for display.
        labels: String,
        /// How many labelled tokens were found.
        found: usize,
    },

    /// The labelled token is not three dot-separated non-negative integers.
    #[error("malformed version `{token}`: expected MAJOR.MINOR.PATCH")]
    MalformedVersion {
        /// The token as it appears in the document.
        token: String,
    },

    /// The token is valid semver but carries a pre-release or build suffix.
    #[error("version `{token}` has a pre-release or build suffix; only MAJOR.MINOR.PATCH can be bumped")]
    PreRelease {
        /// The token as it appears in the document.
        token: String,
    },

    /// Bumping would take a component past `u64::MAX`.
    #[error("cannot bump `{token}`: {component} component is already at its maximum")]
    Overflow {
        /// The current version.
        token: String,
        /// Which component would overflow.
        component: &'static str,
    },

    /// Reading the document failed.
    #[error("failed to read {path}: {source}")]
    Read {
        /// Document path.
        path: String,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// Writing the document failed.
    #[error("failed to write {path}: {source}")]
    Write {
        /// Document path.
        path: String,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },
}

impl VersionError {
    /// Whether the error is about the token itself rather than I/O.
    pub const fn is_token_problem(&self) -> bool {
        matches!(
            self,
            Self::TokenNotFound { .. }
                | Self::MalformedVersion { .. }
                | Self::PreRelease { .. }
                | Self::Overflow { .. }
        )
    }
}

/// Result alias for version operations.
pub type VersionResult<T> = Result<T, VersionError>;

/// A `MAJOR.MINOR.PATCH` triple that remembers how wide each component was
/// written.
///
/// Serializes as its padded text form (`"01.02.03"`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SemanticVersion {
    /// Major component.
    pub major: u64,
    /// Minor component.
    pub minor: u64,
    /// Patch component.
    pub patch: u64,
    /// Textual width of each component (`01` has width 2).
    widths: [usize; 3],
}

impl SemanticVersion {
    /// A version rendered without padding.
    pub const fn new(major: u64, minor: u64, patch: u64) -> Self {
        Self {
            major,
            minor,
            patch,
            widths: [1, 1, 1],
        }
    }

    /// Parse `MAJOR.MINOR.PATCH`, keeping each component's width.
    ///
    /// Only ASCII digits are accepted. Signs and prefixes are malformed;
    /// a semver pre-release or build suffix is reported as
    /// [`VersionError::PreRelease`].
    pub fn parse(token: &str) -> VersionResult<Self> {
        let malformed = || rejected(token);

        let parts: Vec<&str> = token.split('.').collect();
        let &[major, minor, patch] = parts.as_slice() else {
            return Err(malformed());
        };

        let component = |s: &str| -> VersionResult<u64> {
            if s.is_empty() || !s.bytes().all(|b| b.is_ascii_digit()) {
                return Err(malformed());
            }
            s.parse().map_err(|_| malformed())
        };

        Ok(Self {
            major: component(major)?,
            minor: component(minor)?,
            patch: component(patch)?,
            widths: [major.len(), minor.len(), patch.len()],
        })
    }

    /// The version after applying `kind`. Widths carry over unchanged.
    pub fn bumped(&self, kind: BumpKind) -> VersionResult<Self> {
        let increment = |value: u64, component: &'static str| {
            value.checked_add(1).ok_or_else(|| VersionError::Overflow {
                token: self.to_string(),
                component,
            })
        };
        let (major, minor, patch) = match kind {
            BumpKind::None => (self.major, self.minor, self.patch),
            BumpKind::Patch => (self.major, self.minor, increment(self.patch, "patch")?),
            BumpKind::Minor => (self.major, increment(self.minor, "minor")?, 0),
            BumpKind::Major => (increment(self.major, "major")?, 0, 0),
        };
        Ok(Self {
            major,
            minor,
            patch,
            widths: self.widths,
        })
    }
}

fn rejected(token: &str) -> VersionError {
    if let Ok(version) = semver::Version::parse(token)
        && (!version.pre.is_empty() || !version.build.is_empty())
    {
        return VersionError::PreRelease {
            token: token.to_owned(),
        };
    }
    VersionError::MalformedVersion {
        token: token.to_owned(),
    }
}

impl std::fmt::Display for SemanticVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let [w0, w1, w2] = self.widths;
        write!(
            f,
            "{:0w0$}.{:0w1$}.{:0w2$}",
            self.major, self.minor, self.patch
        )
    }
}

impl Serialize for SemanticVersion {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}
