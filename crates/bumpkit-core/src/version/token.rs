//! Locating the labelled version token in a document.

use std::ops::Range;

use regex::bytes::Regex;
use tracing::{debug, instrument};

use super::{SemanticVersion, VersionError, VersionResult};

/// Label used when none is configured.
pub const DEFAULT_LABEL: &str = "VERSION";

/// The single version token of a document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionToken {
    /// Label that introduced the token.
    pub label: String,
    /// Byte span of the token within the document.
    pub span: Range<usize>,
    /// Parsed value.
    pub version: SemanticVersion,
}

impl VersionToken {
    /// Replace this token's span in `text` with `next`, leaving every other
    /// byte alone.
    pub fn rewrite(&self, text: &[u8], next: &SemanticVersion) -> Vec<u8> {
        let rendered = next.to_string();
        let mut out = Vec::with_capacity(text.len() + rendered.len());
        out.extend_from_slice(&text[..self.span.start]);
        out.extend_from_slice(rendered.as_bytes());
        out.extend_from_slice(&text[self.span.end..]);
        out
    }
}

/// Find exactly one `LABEL: MAJOR.MINOR.PATCH` token in `text`.
///
/// The label is matched case-sensitively at a word boundary and may be
/// wrapped in punctuation, so both `VERSION: 1.2.3` and
/// `(VERSION: 01.02.03)` are found. The token ends at whitespace, a closing
/// bracket, `,` or `;`, and trailing periods are left to the prose.
///
/// `text` need not be UTF-8; only the token itself must be.
#[instrument(skip(text), fields(len = text.len()))]
pub fn locate(text: &[u8], labels: &[String]) -> VersionResult<VersionToken> {
    let labels: Vec<&str> = if labels.is_empty() {
        vec![DEFAULT_LABEL]
    } else {
        labels.iter().map(String::as_str).collect()
    };
    let regex = label_regex(&labels);

    let candidates: Vec<_> = regex.captures_iter(text).collect();
    debug!(found = candidates.len(), "labelled tokens");

    let [caps] = candidates.as_slice() else {
        return Err(VersionError::TokenNotFound {
            labels: labels.join(", "),
            found: candidates.len(),
        });
    };

    let (Some(label), Some(token)) = (caps.name("label"), caps.name("token")) else {
        return Err(VersionError::TokenNotFound {
            labels: labels.join(", "),
            found: 0,
        });
    };

    let raw = token.as_bytes();
    let len = raw.len() - raw.iter().rev().take_while(|&&b| b == b'.').count();
    let version = SemanticVersion::parse(&String::from_utf8_lossy(&raw[..len]))?;
    Ok(VersionToken {
        label: String::from_utf8_lossy(label.as_bytes()).into_owned(),
        span: token.start()..token.start() + len,
        version,
    })
}

fn label_regex(labels: &[&str]) -> Regex {
    let alternatives = labels
        .iter()
        .map(|label| regex::escape(label))
        .collect::<Vec<_>>()
        .join("|");
    let pattern = format!(r"\b(?P<label>{alternatives})[ \t]*:[ \t]*(?P<token>[^\s)\],;]*)");
    // Labels are escaped, so the pattern is always valid.
    Regex::new(&pattern).expect("escaped label pattern is valid")
}
