//! Core library for bumpkit.
//!
//! Classifies change descriptions into semantic-version bumps and applies
//! them to a version token embedded in a document, with content-addressed
//! backups and an append-only audit trail.
//!
//! # Modules
//!
//! - [`audit`] - Append-only audit trail, partitioned by day
//! - [`backup`] - Content-addressed snapshots and rollback
//! - [`classify`] - Rule-based bump classification
//! - [`config`] - Configuration loading and management
//! - [`error`] - Configuration error types
//! - [`input`] - Selecting and reading the text to classify
//! - [`lock`] - Cross-process lock on a target document
//! - [`run`] - The classify-then-apply state machine
//! - [`version`] - Locating, bumping, and rewriting version tokens
//!
//! # Quick Start
//!
//! ```no_run
//! use bumpkit_core::classify::{BumpKind, classify};
//!
//! let decision = classify("feat: add retry logic", None);
//! assert_eq!(decision.kind, BumpKind::Minor);
//! ```
#![deny(unsafe_code)]

pub mod audit;

pub mod backup;

pub mod classify;

pub mod config;

mod digest;

pub mod error;

pub mod input;

pub mod lock;

pub mod run;

pub mod version;

pub use classify::{BumpDecision, BumpKind, classify};

pub use config::{Config, ConfigLoader, LogLevel};

pub use digest::content_hash;

pub use error::{ConfigError, ConfigResult};

pub use run::{Mode, Pipeline, RunReport, RunRequest};

