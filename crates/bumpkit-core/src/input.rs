//! Where the text to classify comes from.

use std::io::Read;
use std::sync::LazyLock;

use camino::{Utf8Path, Utf8PathBuf};
use regex::Regex;
use thiserror::Error;
use tracing::debug;

/// Errors from selecting or reading the input.
#[derive(Error, Debug)]
pub enum InputError {
    /// No input source was given.
    #[error("no input given: pass one of --file, --stdin, --text, --checkboxes")]
    Missing,

    /// More than one input source was given.
    #[error("conflicting inputs: {0} (pass exactly one)")]
    Conflicting(String),

    /// The input file could not be read.
    #[error("failed to read input file {path}: {source}")]
    File {
        /// Input path.
        path: Utf8PathBuf,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// Standard input could not be read.
    #[error("failed to read standard input: {0}")]
    Stdin(#[source] std::io::Error),
}

/// Result alias for input operations.
pub type InputResult<T> = Result<T, InputError>;

/// A single input source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InputSource {
    /// Read a file.
    File(Utf8PathBuf),
    /// Read standard input to the end.
    Stdin,
    /// Literal text.
    Text(String),
    /// A PR checklist, as markdown or a comma-separated list of checked items.
    Checkboxes(String),
}

impl InputSource {
    /// Pick the one source among the given options.
    pub fn select(
        file: Option<Utf8PathBuf>,
        stdin: bool,
        text: Option<String>,
        checkboxes: Option<String>,
    ) -> InputResult<Self> {
        let mut given = Vec::new();
        if let Some(path) = file {
            given.push(("--file", Self::File(path)));
        }
        if stdin {
            given.push(("--stdin", Self::Stdin));
        }
        if let Some(text) = text {
            given.push(("--text", Self::Text(text)));
        }
        if let Some(list) = checkboxes {
            given.push(("--checkboxes", Self::Checkboxes(list)));
        }

        match given.len() {
            0 => Err(InputError::Missing),
            1 => Ok(given.remove(0).1),
            _ => Err(InputError::Conflicting(
                given
                    .iter()
                    .map(|(flag, _)| *flag)
                    .collect::<Vec<_>>()
                    .join(", "),
            )),
        }
    }

    /// Read the text, taking standard input from `stdin` when needed.
    pub fn read(&self, stdin: impl Read) -> InputResult<String> {
        let text = match self {
            Self::File(path) => read_file(path)?,
            Self::Stdin => {
                let mut buf = String::new();
                let mut stdin = stdin;
                stdin.read_to_string(&mut buf).map_err(InputError::Stdin)?;
                buf
            }
            Self::Text(text) => text.clone(),
            Self::Checkboxes(list) => checklist(list),
        };
        debug!(source = self.kind(), len = text.len(), "input read");
        Ok(text)
    }

    const fn kind(&self) -> &'static str {
        match self {
            Self::File(_) => "file",
            Self::Stdin => "stdin",
            Self::Text(_) => "text",
            Self::Checkboxes(_) => "checkboxes",
        }
    }
}

fn read_file(path: &Utf8Path) -> InputResult<String> {
    std::fs::read_to_string(path).map_err(|source| InputError::File {
        path: path.to_path_buf(),
        source,
    })
}

static CHECKBOX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\[[ xX]\]").expect("valid checkbox pattern"));

/// Normalize a checkbox argument to markdown checklist text.
///
/// Markdown is passed through; `"New feature, Bug fix"` becomes one ticked
/// item per entry.
pub fn checklist(list: &str) -> String {
    if list.contains('\n') || CHECKBOX.is_match(list) {
        return list.to_owned();
    }
    list.split(',')
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .map(|item| format!("- [x] {item}\n"))
        .collect()
}
