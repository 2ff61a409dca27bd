//! Configuration loading and discovery.
//!
//! This module provides configuration file discovery by:
//! 1. Walking up from the current directory to find project config
//! 2. Loading user config from XDG config directory
//! 3. Merging with sensible defaults
//!
//! # Supported formats
//!
//! The following configuration file formats are supported:
//! - TOML (`.toml`)
//! - YAML (`.yaml`, `.yml`)
//! - JSON (`.json`)
//!
//! # Config file locations (in order of precedence, highest first):
//! - `.bumpkit.<ext>` in current directory or any parent
//! - `bumpkit.<ext>` in current directory or any parent
//!
//! The parent walk ends at the directory holding `.git`.
//! - `~/.config/bumpkit/config.<ext>` (user config)
//!
//! Where `<ext>` is one of: `toml`, `yaml`, `yml`, `json`
//!
//! # Example
//! ```no_run
//! use camino::Utf8PathBuf;
//! use bumpkit_core::config::{Config, ConfigLoader};
//!
//! let cwd = std::env::current_dir().unwrap();
//! let cwd = Utf8PathBuf::try_from(cwd).expect("current directory is not valid UTF-8");
//! let config = ConfigLoader::new()
//!     .with_project_search(&cwd)
//!     .load()
//!     .unwrap();
//! println!("backups go to {}", config.backup_dir(&cwd));
//! ```

use camino::{Utf8Path, Utf8PathBuf};
use figment::Figment;
use figment::providers::{Format, Json, Serialized, Toml, Yaml};
use serde::{Deserialize, Serialize};

use crate::error::{ConfigError, ConfigResult};
use crate::version::token::DEFAULT_LABEL;

/// The configuration for bumpkit.
///
/// Deserialized from config files found during discovery (TOML, YAML, or JSON).
/// Every section has working defaults, so an empty file is a valid config.
#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(default)]
pub struct Config {
    /// Log level for the application (e.g., "debug", "info", "warn", "error").
    pub log_level: LogLevel,
    /// Directory for JSONL log files (falls back to platform defaults if unset).
    pub log_dir: Option<Utf8PathBuf>,
    /// The versioned document.
    pub version: VersionConfig,
    /// Snapshots taken before each write.
    pub backup: BackupConfig,
    /// The append-only audit trail.
    pub audit: AuditConfig,
}

/// Where the version token lives.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(default)]
pub struct VersionConfig {
    /// Default target document when `--target` is not given.
    pub file: Option<Utf8PathBuf>,
    /// Labels that introduce the version token (e.g., `VERSION`).
    pub labels: Vec<String>,
}

impl Default for VersionConfig {
    fn default() -> Self {
        Self {
            file: None,
            labels: vec![DEFAULT_LABEL.to_string()],
        }
    }
}

/// Backup behavior.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(default)]
pub struct BackupConfig {
    /// Snapshot targets before writing (default: `true`).
    ///
    /// `--backup` / `--no-backup` override this per run.
    pub enabled: bool,
    /// Backup directory; relative paths resolve against the working directory.
    pub dir: Utf8PathBuf,
    /// Days a snapshot is kept before `bumpkit purge` removes it.
    pub retention_days: u32,
}

impl Default for BackupConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            dir: Utf8PathBuf::from(".bumpkit/backups"),
            retention_days: 30,
        }
    }
}

/// Audit trail behavior.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(default)]
pub struct AuditConfig {
    /// Record apply and rollback outcomes (default: `true`).
    pub enabled: bool,
    /// Audit directory; relative paths resolve against the working directory.
    pub dir: Utf8PathBuf,
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            dir: Utf8PathBuf::from(".bumpkit/audit"),
        }
    }
}

impl Config {
    /// The configured target document, resolved against `cwd`.
    pub fn version_file(&self, cwd: &Utf8Path) -> Option<Utf8PathBuf> {
        self.version.file.as_deref().map(|file| cwd.join(file))
    }

    /// Backup directory resolved against `cwd`.
    pub fn backup_dir(&self, cwd: &Utf8Path) -> Utf8PathBuf {
        cwd.join(&self.backup.dir)
    }

    /// Audit directory resolved against `cwd`.
    pub fn audit_dir(&self, cwd: &Utf8Path) -> Utf8PathBuf {
        cwd.join(&self.audit.dir)
    }

    /// Backup retention as a duration.
    pub fn retention(&self) -> chrono::Duration {
        chrono::Duration::days(i64::from(self.backup.retention_days))
    }

    /// Reject values that deserialize but cannot work.
    pub fn validate(&self) -> ConfigResult<()> {
        if self.version.labels.is_empty() {
            return Err(ConfigError::InvalidValue {
                key: "version.labels",
                message: "at least one label is required".into(),
            });
        }
        if let Some(label) = self
            .version
            .labels
            .iter()
            .find(|l| l.is_empty() || l.chars().any(char::is_whitespace))
        {
            return Err(ConfigError::InvalidValue {
                key: "version.labels",
                message: format!("`{label}` must be a non-empty word"),
            });
        }
        if self.backup.retention_days == 0 {
            return Err(ConfigError::InvalidValue {
                key: "backup.retention_days",
                message: "must be at least 1".into(),
            });
        }
        Ok(())
    }
}

/// Log level configuration.
#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    /// Verbose output for debugging and development.
    Debug,
    /// Standard operational information (default).
    #[default]
    Info,
    /// Warnings about potential issues.
    Warn,
    /// Errors that indicate failures.
    Error,
}

impl LogLevel {
    /// Returns the log level as a lowercase string slice.
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Debug => "debug",
            Self::Info => "info",
            Self::Warn => "warn",
            Self::Error => "error",
        }
    }
}

/// Supported configuration file extensions (in order of preference).
const CONFIG_EXTENSIONS: &[&str] = &["toml", "yaml", "yml", "json"];

/// Application name for XDG directory lookup and config file names.
const APP_NAME: &str = "bumpkit";

/// Project search stops below a directory containing this entry.
const BOUNDARY_MARKER: &str = ".git";

/// Builder for loading configuration from multiple sources.
#[derive(Debug, Default)]
pub struct ConfigLoader {
    /// Starting directory for project config search.
    project_search_root: Option<Utf8PathBuf>,
    /// Whether to include user config from XDG directory.
    include_user_config: bool,
    /// Explicit config files to load (for testing or programmatic use).
    explicit_files: Vec<Utf8PathBuf>,
}

impl ConfigLoader {
    /// Create a new config loader with default settings.
    pub fn new() -> Self {
        Self {
            project_search_root: None,
            include_user_config: true,
            explicit_files: Vec::new(),
        }
    }

    /// Set the starting directory for project config search.
    ///
    /// The loader will walk up from this directory looking for config files.
    pub fn with_project_search<P: AsRef<Utf8Path>>(mut self, path: P) -> Self {
        self.project_search_root = Some(path.as_ref().to_path_buf());
        self
    }

    /// Set whether to include user config from `~/.config/bumpkit/`.
    pub const fn with_user_config(mut self, include: bool) -> Self {
        self.include_user_config = include;
        self
    }

    /// Add an explicit config file to load.
    ///
    /// Files are loaded in order, with later files taking precedence.
    /// Explicit files are loaded after discovered files.
    pub fn with_file<P: AsRef<Utf8Path>>(mut self, path: P) -> Self {
        self.explicit_files.push(path.as_ref().to_path_buf());
        self
    }

    /// Load configuration, merging all discovered sources.
    ///
    /// Precedence (highest to lowest):
    /// 1. Explicit files (in order added via `with_file`)
    /// 2. Project config (closest to search root)
    /// 3. User config (`~/.config/bumpkit/config.<ext>`)
    /// 4. Default values
    #[tracing::instrument(skip(self), fields(search_root = ?self.project_search_root))]
    pub fn load(self) -> ConfigResult<Config> {
        tracing::debug!("loading configuration");
        let mut figment = Figment::new().merge(Serialized::defaults(Config::default()));

        if self.include_user_config
            && let Some(user_config) = self.find_user_config()
        {
            figment = Self::merge_file(figment, &user_config);
        }

        if let Some(ref root) = self.project_search_root
            && let Some(project_config) = find_project_config(root)
        {
            figment = Self::merge_file(figment, &project_config);
        }

        for file in &self.explicit_files {
            figment = Self::merge_file(figment, file);
        }

        let config: Config = figment
            .extract()
            .map_err(|e| ConfigError::Deserialize(Box::new(e)))?;
        config.validate()?;
        tracing::info!(
            log_level = config.log_level.as_str(),
            backup = config.backup.enabled,
            audit = config.audit.enabled,
            "configuration loaded"
        );
        Ok(config)
    }

    /// Find user config in XDG config directory.
    fn find_user_config(&self) -> Option<Utf8PathBuf> {
        let config_dir = user_config_dir()?;
        CONFIG_EXTENSIONS
            .iter()
            .map(|ext| config_dir.join(format!("config.{ext}")))
            .find(|path| path.is_file())
    }

    /// Merge a config file into the figment, detecting format from extension.
    fn merge_file(figment: Figment, path: &Utf8Path) -> Figment {
        match path.extension() {
            Some("toml") => figment.merge(Toml::file_exact(path.as_str())),
            Some("yaml" | "yml") => figment.merge(Yaml::file_exact(path.as_str())),
            Some("json") => figment.merge(Json::file_exact(path.as_str())),
            _ => figment.merge(Toml::file_exact(path.as_str())),
        }
    }
}

/// Find the project config file that [`ConfigLoader::load`] would use,
/// walking up from `start`.
///
/// The directory holding `.git` is the last one searched.
pub fn find_project_config<P: AsRef<Utf8Path>>(start: P) -> Option<Utf8PathBuf> {
    let mut current = Some(start.as_ref());

    while let Some(dir) = current {
        for ext in CONFIG_EXTENSIONS {
            let dotfile = dir.join(format!(".{APP_NAME}.{ext}"));
            if dotfile.is_file() {
                return Some(dotfile);
            }

            let regular = dir.join(format!("{APP_NAME}.{ext}"));
            if regular.is_file() {
                return Some(regular);
            }
        }

        if dir.join(BOUNDARY_MARKER).exists() {
            break;
        }
        current = dir.parent();
    }

    None
}

fn project_dirs() -> Option<directories::ProjectDirs> {
    directories::ProjectDirs::from("", "", APP_NAME)
}

/// Get the user config directory path.
///
/// Returns `~/.config/bumpkit/` on Linux, `~/Library/Application Support/bumpkit/`
/// on macOS, and equivalent on other platforms.
pub fn user_config_dir() -> Option<Utf8PathBuf> {
    let proj_dirs = project_dirs()?;
    Utf8PathBuf::from_path_buf(proj_dirs.config_dir().to_path_buf()).ok()
}

/// Get the user data directory path.
///
/// Returns `~/.local/share/bumpkit/` on Linux, `~/Library/Application Support/bumpkit/`
/// on macOS, and equivalent on other platforms.
pub fn user_data_dir() -> Option<Utf8PathBuf> {
    let proj_dirs = project_dirs()?;
    Utf8PathBuf::from_path_buf(proj_dirs.data_dir().to_path_buf()).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn load_toml(contents: &str) -> ConfigResult<Config> {
        let tmp = TempDir::new().unwrap();
        let config_path = tmp.path().join("config.toml");
        fs::write(&config_path, contents).unwrap();
        let config_path = Utf8PathBuf::try_from(config_path).unwrap();
        ConfigLoader::new()
            .with_user_config(false)
            .with_file(&config_path)
            .load()
    }

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.log_level, LogLevel::Info);
        assert!(config.log_dir.is_none());
        assert_eq!(config.version.labels, ["VERSION"]);
        assert!(config.version.file.is_none());
        assert!(config.backup.enabled);
        assert_eq!(config.backup.retention_days, 30);
        assert!(config.audit.enabled);
    }

    #[test]
    fn test_loader_builds_with_defaults() {
        let loader = ConfigLoader::new().with_user_config(false);

        let config = loader.load().unwrap();
        assert_eq!(config.log_level, LogLevel::Info);
    }

    #[test]
    fn test_single_file_overrides_default() {
        let config = load_toml(
            r#"log_level = "debug"
log_dir = "/tmp/bumpkit"
"#,
        )
        .unwrap();

        assert_eq!(config.log_level, LogLevel::Debug);
        assert_eq!(
            config.log_dir.as_ref().map(|dir| dir.as_str()),
            Some("/tmp/bumpkit")
        );
    }

    #[test]
    fn test_later_file_overrides_earlier() {
        let tmp = TempDir::new().unwrap();

        let base_config = tmp.path().join("base.toml");
        fs::write(&base_config, r#"log_level = "warn""#).unwrap();

        let override_config = tmp.path().join("override.toml");
        fs::write(&override_config, r#"log_level = "error""#).unwrap();

        let base_config = Utf8PathBuf::try_from(base_config).unwrap();
        let override_config = Utf8PathBuf::try_from(override_config).unwrap();

        let config = ConfigLoader::new()
            .with_user_config(false)
            .with_file(&base_config)
            .with_file(&override_config)
            .load()
            .unwrap();

        assert_eq!(config.log_level, LogLevel::Error);
    }

    #[test]
    fn test_project_config_discovery() {
        let tmp = TempDir::new().unwrap();
        let project_dir = tmp.path().join("project");
        let sub_dir = project_dir.join("src").join("deep");
        fs::create_dir_all(&sub_dir).unwrap();

        let config_path = project_dir.join(".bumpkit.toml");
        fs::write(&config_path, r#"log_level = "debug""#).unwrap();

        let sub_dir = Utf8PathBuf::try_from(sub_dir).unwrap();

        let config = ConfigLoader::new()
            .with_user_config(false)
            .with_project_search(&sub_dir)
            .load()
            .unwrap();

        assert_eq!(config.log_level, LogLevel::Debug);
    }

    #[test]
    fn test_boundary_marker_stops_search() {
        let tmp = TempDir::new().unwrap();

        // /parent/.bumpkit.toml, /parent/child/.git/, /parent/child/work/
        let parent = tmp.path().join("parent");
        let child = parent.join("child");
        let work = child.join("work");
        fs::create_dir_all(&work).unwrap();

        fs::write(parent.join(".bumpkit.toml"), r#"log_level = "warn""#).unwrap();
        fs::create_dir(child.join(".git")).unwrap();

        let work = Utf8PathBuf::try_from(work).unwrap();

        let config = ConfigLoader::new()
            .with_user_config(false)
            .with_project_search(&work)
            .load()
            .unwrap();

        assert_eq!(config.log_level, LogLevel::Info);
        assert_eq!(find_project_config(&work), None);
    }

    #[test]
    fn test_config_beside_git_is_found() {
        let tmp = TempDir::new().unwrap();
        let repo = tmp.path().join("repo");
        let nested = repo.join("docs");
        fs::create_dir_all(&nested).unwrap();
        fs::create_dir(repo.join(".git")).unwrap();
        fs::write(repo.join("bumpkit.toml"), "[version]\nlabels = [\"Revision\"]\n").unwrap();

        let nested = Utf8PathBuf::try_from(nested).unwrap();
        let found = find_project_config(&nested).unwrap();
        assert!(found.as_str().ends_with("repo/bumpkit.toml"), "{found}");

        let config = ConfigLoader::new()
            .with_user_config(false)
            .with_project_search(&nested)
            .load()
            .unwrap();
        assert_eq!(config.version.labels, ["Revision"]);
    }

    #[test]
    fn test_explicit_file_overrides_project_config() {
        let tmp = TempDir::new().unwrap();

        let project_config = tmp.path().join(".bumpkit.toml");
        fs::write(&project_config, r#"log_level = "warn""#).unwrap();

        let override_config = tmp.path().join("override.toml");
        fs::write(&override_config, r#"log_level = "error""#).unwrap();

        let tmp_path = Utf8PathBuf::try_from(tmp.path().to_path_buf()).unwrap();
        let override_config = Utf8PathBuf::try_from(override_config).unwrap();

        let config = ConfigLoader::new()
            .with_user_config(false)
            .with_project_search(&tmp_path)
            .with_file(&override_config)
            .load()
            .unwrap();

        assert_eq!(config.log_level, LogLevel::Error);
    }

    #[test]
    fn test_user_config_dir() {
        if let Some(path) = user_config_dir() {
            assert!(path.as_str().contains("bumpkit"));
        }
    }

    #[test]
    fn test_sections_from_toml() {
        let config = load_toml(
            r#"
[version]
file = "docs/STANDARDS.md"
labels = ["VERSION", "Doc-Version"]

[backup]
enabled = false
dir = "/var/backups/bumpkit"
retention_days = 7

[audit]
dir = "logs/audit"
"#,
        )
        .unwrap();

        assert_eq!(
            config.version.file.as_deref().map(Utf8Path::as_str),
            Some("docs/STANDARDS.md")
        );
        assert_eq!(config.version.labels, ["VERSION", "Doc-Version"]);
        assert!(!config.backup.enabled);
        assert_eq!(config.backup.retention_days, 7);
        assert!(config.audit.enabled, "unset keys keep their defaults");
        assert_eq!(config.audit.dir.as_str(), "logs/audit");
    }

    #[test]
    fn test_partial_section_keeps_defaults() {
        let config = load_toml("[backup]\nretention_days = 90\n").unwrap();
        assert!(config.backup.enabled);
        assert_eq!(config.backup.dir.as_str(), ".bumpkit/backups");
        assert_eq!(config.retention(), chrono::Duration::days(90));
    }

    #[test]
    fn test_yaml_config() {
        let tmp = TempDir::new().unwrap();
        let config_path = tmp.path().join("bumpkit.yaml");
        fs::write(&config_path, "audit:\n  enabled: false\n").unwrap();
        let config_path = Utf8PathBuf::try_from(config_path).unwrap();

        let config = ConfigLoader::new()
            .with_user_config(false)
            .with_file(&config_path)
            .load()
            .unwrap();
        assert!(!config.audit.enabled);
    }

    #[test]
    fn test_relative_dirs_resolve_against_cwd() {
        let config = Config::default();
        let cwd = Utf8Path::new("/work/repo");
        assert_eq!(config.backup_dir(cwd), "/work/repo/.bumpkit/backups");
        assert_eq!(config.audit_dir(cwd), "/work/repo/.bumpkit/audit");

        let mut absolute = Config::default();
        absolute.backup.dir = Utf8PathBuf::from("/srv/backups");
        assert_eq!(absolute.backup_dir(cwd), "/srv/backups");
    }

    #[test]
    fn test_zero_retention_is_rejected() {
        let err = load_toml("[backup]\nretention_days = 0\n").unwrap_err();
        assert!(matches!(
            err,
            ConfigError::InvalidValue {
                key: "backup.retention_days",
                ..
            }
        ));
    }

    #[test]
    fn test_empty_labels_are_rejected() {
        assert!(load_toml("[version]\nlabels = []\n").is_err());
        assert!(load_toml("[version]\nlabels = [\"two words\"]\n").is_err());
    }

    #[test]
    fn test_unknown_log_level_is_a_deserialize_error() {
        let err = load_toml(r#"log_level = "loud""#).unwrap_err();
        assert!(matches!(err, ConfigError::Deserialize(_)));
    }
}
