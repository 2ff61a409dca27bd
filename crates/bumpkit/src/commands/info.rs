//! Info command: show package and effective configuration.

use camino::Utf8Path;
use clap::Args;
use owo_colors::OwoColorize;
use serde::Serialize;
use tracing::{debug, instrument};

use bumpkit_core::config::{self, Config};

use crate::exit::Exit;

/// Arguments for the `info` subcommand.
#[derive(Args, Debug, Default)]
pub struct InfoArgs {
    // No subcommand-specific arguments; uses global --json flag
}

#[derive(Serialize)]
struct PackageInfo {
    name: &'static str,
    version: &'static str,
    #[serde(skip_serializing_if = "str::is_empty")]
    description: &'static str,
    #[serde(skip_serializing_if = "str::is_empty")]
    repository: &'static str,
    #[serde(skip_serializing_if = "str::is_empty")]
    homepage: &'static str,
    #[serde(skip_serializing_if = "str::is_empty")]
    license: &'static str,
}

impl PackageInfo {
    const fn new() -> Self {
        Self {
            name: env!("CARGO_PKG_NAME"),
            version: env!("CARGO_PKG_VERSION"),
            description: env!("CARGO_PKG_DESCRIPTION"),
            repository: env!("CARGO_PKG_REPOSITORY"),
            homepage: env!("CARGO_PKG_HOMEPAGE"),
            license: env!("CARGO_PKG_LICENSE"),
        }
    }
}

#[derive(Serialize)]
struct ConfigInfo {
    #[serde(skip_serializing_if = "Option::is_none")]
    config_file: Option<String>,
    log_level: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    log_dir: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    version_file: Option<String>,
    labels: Vec<String>,
    backup_enabled: bool,
    backup_dir: String,
    retention_days: u32,
    audit_enabled: bool,
    audit_dir: String,
}

impl ConfigInfo {
    fn from_config(config: &Config, cwd: &Utf8Path) -> Self {
        Self {
            config_file: config::find_project_config(cwd).map(|p| p.to_string()),
            log_level: config.log_level.as_str().to_string(),
            log_dir: config.log_dir.as_ref().map(|p| p.to_string()),
            version_file: config.version_file(cwd).map(|p| p.to_string()),
            labels: config.version.labels.clone(),
            backup_enabled: config.backup.enabled,
            backup_dir: config.backup_dir(cwd).to_string(),
            retention_days: config.backup.retention_days,
            audit_enabled: config.audit.enabled,
            audit_dir: config.audit_dir(cwd).to_string(),
        }
    }
}

#[derive(Serialize)]
struct FullInfo {
    #[serde(flatten)]
    package: PackageInfo,
    config: ConfigInfo,
}

/// Print package information.
///
/// # Arguments
/// * `global_json` - Global `--json` flag from CLI
/// * `config` - Loaded configuration
/// * `cwd` - Current working directory for config discovery
#[instrument(name = "cmd_info", skip_all, fields(json_output))]
pub fn cmd_info(
    _args: InfoArgs,
    global_json: bool,
    config: &Config,
    cwd: &Utf8Path,
) -> anyhow::Result<Exit> {
    debug!(json_output = global_json, "executing info command");

    let info = FullInfo {
        package: PackageInfo::new(),
        config: ConfigInfo::from_config(config, cwd),
    };

    if global_json {
        println!("{}", serde_json::to_string_pretty(&info)?);
        return Ok(Exit::Success);
    }

    println!("{} {}", info.package.name.bold(), info.package.version.green());
    if !info.package.description.is_empty() {
        println!("{}", info.package.description);
    }
    if !info.package.license.is_empty() {
        println!("{}: {}", "License".dimmed(), info.package.license);
    }
    if !info.package.repository.is_empty() {
        println!("{}: {}", "Repository".dimmed(), info.package.repository.cyan());
    }
    if !info.package.homepage.is_empty() {
        println!("{}: {}", "Homepage".dimmed(), info.package.homepage.cyan());
    }

    let cfg = &info.config;
    println!();
    println!("{}", "Configuration".bold().underline());
    if let Some(ref path) = cfg.config_file {
        println!("{}: {}", "Config file".dimmed(), path.cyan());
    } else {
        println!("{}: {}", "Config file".dimmed(), "none loaded".yellow());
    }
    println!("{}: {}", "Log level".dimmed(), cfg.log_level);
    if let Some(ref dir) = cfg.log_dir {
        println!("{}: {}", "Log directory".dimmed(), dir);
    }

    println!();
    println!("{}", "Versioning".bold().underline());
    match cfg.version_file {
        Some(ref file) => println!("{}: {}", "Version file".dimmed(), file.cyan()),
        None => println!("{}: {}", "Version file".dimmed(), "unset (pass --target)".yellow()),
    }
    println!("{}: {}", "Token labels".dimmed(), cfg.labels.join(", "));
    print_store("Backups", cfg.backup_enabled, &cfg.backup_dir);
    println!("{}: {} day(s)", "Retention".dimmed(), cfg.retention_days);
    print_store("Audit trail", cfg.audit_enabled, &cfg.audit_dir);

    Ok(Exit::Success)
}

fn print_store(label: &str, enabled: bool, dir: &str) {
    if enabled {
        println!("{}: {}", label.dimmed(), dir.cyan());
    } else {
        println!("{}: {}", label.dimmed(), "disabled".yellow());
    }
}
