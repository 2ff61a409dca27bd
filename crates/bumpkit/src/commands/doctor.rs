//! Doctor command: diagnose configuration and environment.

use camino::{Utf8Path, Utf8PathBuf};
use clap::Args;
use indicatif::{ProgressBar, ProgressStyle};
use inquire::Confirm;
use owo_colors::OwoColorize;
use serde::Serialize;
use tracing::{debug, instrument};

use bumpkit_core::config::{self, Config};
use bumpkit_core::version::VersionDocument;

use crate::exit::Exit;

/// Arguments for the `doctor` subcommand.
#[derive(Args, Debug, Default)]
pub struct DoctorArgs {
    // No subcommand-specific arguments; uses global --json flag
}

#[derive(Serialize)]
struct DoctorReport {
    directories: DirectoryPaths,
    config: ConfigStatus,
    target: TargetStatus,
    stores: Vec<StoreStatus>,
    environment: EnvironmentInfo,
}

#[derive(Serialize)]
struct DirectoryPaths {
    config: Option<String>,
    data: Option<String>,
}

#[derive(Serialize)]
struct ConfigStatus {
    /// Path to loaded config file, if any
    file: Option<String>,
    /// Whether a config file was found
    found: bool,
}

#[derive(Serialize)]
struct TargetStatus {
    file: Option<String>,
    /// Version found in the target
    version: Option<String>,
    /// Why the version could not be read
    problem: Option<String>,
}

#[derive(Serialize)]
struct StoreStatus {
    name: &'static str,
    dir: String,
    enabled: bool,
    /// Exists, or could be created under an existing writable parent
    writable: bool,
}

#[derive(Serialize)]
struct EnvironmentInfo {
    /// Current working directory
    cwd: Option<String>,
    /// Relevant environment variables
    env_vars: Vec<EnvVar>,
}

#[derive(Serialize)]
struct EnvVar {
    name: &'static str,
    value: Option<String>,
    description: &'static str,
}

impl DoctorReport {
    fn gather(config: &Config, cwd: &Utf8Path) -> Self {
        let config_file = config::find_project_config(cwd);

        Self {
            directories: DirectoryPaths {
                config: config::user_config_dir().map(|p| p.to_string()),
                data: config::user_data_dir().map(|p| p.to_string()),
            },
            config: ConfigStatus {
                found: config_file.is_some(),
                file: config_file.map(|p| p.to_string()),
            },
            target: TargetStatus::check(config, cwd),
            stores: vec![
                StoreStatus::check("backups", config.backup.enabled, config.backup_dir(cwd)),
                StoreStatus::check("audit", config.audit.enabled, config.audit_dir(cwd)),
            ],
            environment: EnvironmentInfo {
                cwd: Some(cwd.to_string()),
                env_vars: vec![
                    EnvVar {
                        name: "XDG_CONFIG_HOME",
                        value: std::env::var("XDG_CONFIG_HOME").ok(),
                        description: "Override config directory",
                    },
                    EnvVar {
                        name: "XDG_DATA_HOME",
                        value: std::env::var("XDG_DATA_HOME").ok(),
                        description: "Override data directory",
                    },
                    EnvVar {
                        name: "RUST_LOG",
                        value: std::env::var("RUST_LOG").ok(),
                        description: "Log filter directive",
                    },
                    EnvVar {
                        name: "BUMPKIT_LOG_PATH",
                        value: std::env::var("BUMPKIT_LOG_PATH").ok(),
                        description: "Explicit log file path",
                    },
                    EnvVar {
                        name: "BUMPKIT_LOG_DIR",
                        value: std::env::var("BUMPKIT_LOG_DIR").ok(),
                        description: "Log directory",
                    },
                ],
            },
        }
    }
}

impl TargetStatus {
    fn check(config: &Config, cwd: &Utf8Path) -> Self {
        let Some(file) = config.version_file(cwd) else {
            return Self {
                file: None,
                version: None,
                problem: None,
            };
        };
        match VersionDocument::new(&file, config.version.labels.clone()).load() {
            Ok(doc) => Self {
                file: Some(file.to_string()),
                version: Some(doc.token.version.to_string()),
                problem: None,
            },
            Err(e) => Self {
                file: Some(file.to_string()),
                version: None,
                problem: Some(e.to_string()),
            },
        }
    }
}

impl StoreStatus {
    fn check(name: &'static str, enabled: bool, dir: Utf8PathBuf) -> Self {
        // Nearest existing ancestor decides whether the dir can be created.
        let writable = dir
            .ancestors()
            .find(|p| p.exists())
            .and_then(|p| std::fs::metadata(p).ok())
            .is_some_and(|m| m.is_dir() && !m.permissions().readonly());
        Self {
            name,
            dir: dir.to_string(),
            enabled,
            writable,
        }
    }
}

/// Run diagnostics and report configuration status.
///
/// # Arguments
/// * `global_json` - Global `--json` flag from CLI
/// * `config` - Loaded configuration
/// * `cwd` - Current working directory
#[instrument(name = "cmd_doctor", skip_all, fields(json_output))]
pub fn cmd_doctor(
    _args: DoctorArgs,
    global_json: bool,
    config: &Config,
    cwd: &Utf8Path,
) -> anyhow::Result<Exit> {
    debug!(json_output = global_json, "executing doctor command");

    let spinner = ProgressBar::new_spinner();
    spinner.set_style(
        ProgressStyle::default_spinner()
            .template("{spinner:.cyan} {msg}")
            .expect("valid template"),
    );
    spinner.set_message("Gathering diagnostics...");
    spinner.enable_steady_tick(std::time::Duration::from_millis(80));

    let report = DoctorReport::gather(config, cwd);
    spinner.finish_and_clear();

    if global_json {
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(Exit::Success);
    }

    println!("{}", "Configuration".bold().underline());
    if report.config.found {
        println!(
            "  {} Config file: {}",
            "✓".green(),
            report.config.file.as_deref().unwrap_or("").cyan()
        );
    } else {
        println!("  {} No config file found", "○".yellow());
        offer_config_creation()?;
    }
    println!();

    println!("{}", "Version file".bold().underline());
    match (&report.target.file, &report.target.version, &report.target.problem) {
        (Some(file), Some(version), _) => {
            println!("  {} {}: {}", "✓".green(), file.cyan(), version.green());
        }
        (Some(file), None, Some(problem)) => {
            println!("  {} {}: {}", "✗".red(), file.cyan(), problem.red());
        }
        _ => println!("  {} version.file not set; pass --target", "○".yellow()),
    }
    println!();

    println!("{}", "Stores".bold().underline());
    for store in &report.stores {
        if !store.enabled {
            println!("  {} {}: {}", "○".dimmed(), store.name, "disabled".dimmed());
        } else if store.writable {
            println!("  {} {}: {}", "✓".green(), store.name, store.dir.cyan());
        } else {
            println!(
                "  {} {}: {} {}",
                "✗".red(),
                store.name,
                store.dir.cyan(),
                "(not writable)".red()
            );
        }
    }
    println!();

    println!("{}", "Directories".bold().underline());
    print_dir("  Config", report.directories.config.as_deref());
    print_dir("  Data", report.directories.data.as_deref());
    println!();

    println!("{}", "Environment".bold().underline());
    println!("  {}: {}", "Working directory".dimmed(), cwd.cyan());
    let set_vars: Vec<_> = report
        .environment
        .env_vars
        .iter()
        .filter(|v| v.value.is_some())
        .collect();
    if set_vars.is_empty() {
        println!("  {} No XDG/logging overrides set", "○".dimmed());
    } else {
        for var in set_vars {
            println!(
                "  {}: {}",
                var.name.dimmed(),
                var.value.as_deref().unwrap_or("").cyan()
            );
        }
    }

    Ok(Exit::Success)
}

fn print_dir(label: &str, path: Option<&str>) {
    print!("{}: ", label.dimmed());
    match path {
        Some(p) => println!("{}", p.cyan()),
        None => println!("{}", "(unavailable)".yellow()),
    }
}

/// Offer to create a default config file when none exists.
fn offer_config_creation() -> anyhow::Result<()> {
    let Some(config_dir) = config::user_config_dir() else {
        return Ok(());
    };

    let config_path = config_dir.join("config.yaml");

    // Don't prompt if running non-interactively
    if !std::io::IsTerminal::is_terminal(&std::io::stdin()) {
        return Ok(());
    }

    let create = Confirm::new("Create a default config file?")
        .with_default(false)
        .with_help_message(&format!("Will create {config_path}"))
        .prompt();

    if let Ok(true) = create {
        if let Some(parent) = config_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let yaml = serde_saphyr::to_string(&Config::default())?;
        std::fs::write(&config_path, yaml)?;
        println!("  {} Created {}", "✓".green(), config_path.cyan());
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_cwd() -> Utf8PathBuf {
        Utf8PathBuf::from("/tmp")
    }

    #[test]
    fn test_cmd_doctor_text_succeeds() {
        assert!(cmd_doctor(DoctorArgs::default(), false, &Config::default(), &test_cwd()).is_ok());
    }

    #[test]
    fn test_cmd_doctor_json_succeeds() {
        assert!(cmd_doctor(DoctorArgs::default(), true, &Config::default(), &test_cwd()).is_ok());
    }

    #[test]
    fn test_doctor_report_gathers() {
        let report = DoctorReport::gather(&Config::default(), &test_cwd());
        assert!(report.directories.config.is_some() || report.directories.data.is_some());
        assert_eq!(report.stores.len(), 2);
        assert!(report.target.file.is_none());
    }

    #[test]
    fn target_problem_is_reported() {
        let tmp = tempfile::TempDir::new().unwrap();
        let root = Utf8PathBuf::try_from(tmp.path().to_path_buf()).unwrap();
        std::fs::write(root.join("STANDARDS.md"), "no token\n").unwrap();
        let mut config = Config::default();
        config.version.file = Some("STANDARDS.md".into());

        let status = TargetStatus::check(&config, &root);
        assert!(status.version.is_none());
        assert!(status.problem.is_some());
    }

    #[test]
    fn target_version_is_reported() {
        let tmp = tempfile::TempDir::new().unwrap();
        let root = Utf8PathBuf::try_from(tmp.path().to_path_buf()).unwrap();
        std::fs::write(root.join("STANDARDS.md"), "VERSION: 01.02.03\n").unwrap();
        let mut config = Config::default();
        config.version.file = Some("STANDARDS.md".into());

        let status = TargetStatus::check(&config, &root);
        assert_eq!(status.version.as_deref(), Some("01.02.03"));
    }
}
