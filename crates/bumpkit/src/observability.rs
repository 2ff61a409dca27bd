//! Structured logging.
//!
//! Every event is written as one JSON object per line. Events raised inside
//! a bump or rollback carry that run's `operation_id` and current `state` at
//! the top level, so a log file can be joined against the audit trail by id.
//!
//! stdout carries command output (including `--json` reports) and is never
//! written here. Logs go to a daily-rolled file, or to stderr when no file
//! can be opened.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::Result;
use camino::Utf8Path;
use serde_json::{Map, Value};
use tracing::Event;
use tracing::field::{Field, Visit};
use tracing_appender::non_blocking::{NonBlocking, WorkerGuard};
use tracing_subscriber::filter::EnvFilter;
use tracing_subscriber::layer::{Context as LayerContext, SubscriberExt};
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::util::SubscriberInitExt;

const ENV_LOG_PATH: &str = "BUMPKIT_LOG_PATH";
const ENV_LOG_DIR: &str = "BUMPKIT_LOG_DIR";
const LOG_FILE_NAME: &str = "bumpkit.jsonl";

/// Span fields lifted out of `context` onto the event itself.
const CORRELATION_FIELDS: &[&str] = &["operation_id", "reverts", "state"];

/// Where log lines are written.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogDestination {
    /// A daily-rolled file `dir/file_name.YYYY-MM-DD`.
    File {
        /// Directory holding the log files.
        dir: PathBuf,
        /// File name prefix.
        file_name: String,
    },
    /// Standard error.
    Stderr,
}

/// Log location inputs, highest precedence first.
#[derive(Debug, Clone, Default)]
pub struct LogSettings {
    /// Exact log file from `BUMPKIT_LOG_PATH`.
    pub path: Option<PathBuf>,
    /// Log directory from `BUMPKIT_LOG_DIR`.
    pub dir: Option<PathBuf>,
    /// `log_dir` from the configuration.
    pub config_dir: Option<PathBuf>,
}

impl LogSettings {
    /// Settings from the environment, falling back to the configured
    /// directory.
    pub fn from_env(config_dir: Option<&Utf8Path>) -> Self {
        Self {
            path: std::env::var_os(ENV_LOG_PATH).map(PathBuf::from),
            dir: std::env::var_os(ENV_LOG_DIR).map(PathBuf::from),
            config_dir: config_dir.map(|dir| dir.as_std_path().to_path_buf()),
        }
    }

    /// Resolve the log location and check it is writable.
    ///
    /// Without any setting, logs go under the per-user data directory.
    pub fn destination(&self) -> Result<LogDestination, String> {
        if let Some(path) = &self.path {
            return file_destination_from_path(path);
        }
        let dir = match (&self.dir, &self.config_dir) {
            (Some(dir), _) | (None, Some(dir)) => dir.clone(),
            (None, None) => directories::ProjectDirs::from("", "", env!("CARGO_PKG_NAME"))
                .map(|dirs| dirs.data_local_dir().join("logs"))
                .ok_or("no home directory to keep logs in")?,
        };
        ensure_writable(&dir, LOG_FILE_NAME)?;
        Ok(LogDestination::File {
            dir,
            file_name: LOG_FILE_NAME.to_string(),
        })
    }
}

/// Keeps the background log writer alive; drop it last.
pub struct LogGuard {
    _worker: WorkerGuard,
}

/// Install the global JSON log subscriber.
///
/// An unusable log location is reported on stderr and logging continues
/// there.
///
/// # Errors
///
/// Returns an error if a global subscriber is already installed.
pub fn init(settings: &LogSettings, filter: EnvFilter) -> Result<LogGuard> {
    let destination = settings.destination().unwrap_or_else(|err| {
        eprintln!("warning: {err}; logging to stderr");
        LogDestination::Stderr
    });
    let (writer, worker) = open(&destination);

    tracing_subscriber::registry()
        .with(filter)
        .with(JsonLogLayer::new(writer))
        .try_init()?;

    tracing::debug!(?destination, "logging initialized");
    Ok(LogGuard { _worker: worker })
}

fn open(destination: &LogDestination) -> (NonBlocking, WorkerGuard) {
    match destination {
        LogDestination::File { dir, file_name } => {
            tracing_appender::non_blocking(tracing_appender::rolling::daily(dir, file_name))
        }
        LogDestination::Stderr => tracing_appender::non_blocking(std::io::stderr()),
    }
}

/// Build an `EnvFilter` based on CLI flags and environment.
///
/// Priority: quiet flag > verbose flag > RUST_LOG env > default_level
pub fn env_filter(quiet: bool, verbose: u8, default_level: &str) -> EnvFilter {
    if quiet {
        return EnvFilter::new("error");
    }

    if verbose > 0 {
        let level = match verbose {
            1 => "debug",
            _ => "trace",
        };
        return EnvFilter::new(level);
    }

    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level))
}

fn file_destination_from_path(path: &Path) -> Result<LogDestination, String> {
    let file_name = path
        .file_name()
        .and_then(|name| name.to_str())
        .ok_or_else(|| format!("{ENV_LOG_PATH} must end in a UTF-8 file name"))?
        .to_string();
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    };
    ensure_writable(&dir, &file_name)?;
    Ok(LogDestination::File { dir, file_name })
}

fn ensure_writable(dir: &Path, file_name: &str) -> Result<(), String> {
    std::fs::create_dir_all(dir)
        .map_err(|e| format!("cannot create log directory {}: {e}", dir.display()))?;
    let path = dir.join(file_name);
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
        .map_err(|e| format!("cannot open log file {}: {e}", path.display()))?;
    Ok(())
}

// ============================================================================
// JSON layer
// ============================================================================

/// Writes `{timestamp, level, target, spans, operation_id?, state?,
/// context?, message, ...event fields}` per event.
struct JsonLogLayer<W> {
    writer: W,
}

impl<W> JsonLogLayer<W> {
    const fn new(writer: W) -> Self {
        Self { writer }
    }
}

#[derive(Default)]
struct SpanFields(Map<String, Value>);

impl<S, W> tracing_subscriber::Layer<S> for JsonLogLayer<W>
where
    S: tracing::Subscriber + for<'a> LookupSpan<'a>,
    W: for<'writer> tracing_subscriber::fmt::MakeWriter<'writer> + Send + Sync + 'static,
{
    fn on_new_span(
        &self,
        attrs: &tracing::span::Attributes<'_>,
        id: &tracing::span::Id,
        ctx: LayerContext<'_, S>,
    ) {
        if let Some(span) = ctx.span(id) {
            let mut visitor = JsonVisitor::default();
            attrs.record(&mut visitor);
            span.extensions_mut().insert(SpanFields(visitor.0));
        }
    }

    fn on_record(
        &self,
        id: &tracing::span::Id,
        values: &tracing::span::Record<'_>,
        ctx: LayerContext<'_, S>,
    ) {
        if let Some(span) = ctx.span(id) {
            let mut visitor = JsonVisitor::default();
            values.record(&mut visitor);
            let mut extensions = span.extensions_mut();
            match extensions.get_mut::<SpanFields>() {
                Some(fields) => fields.0.extend(visitor.0),
                None => extensions.insert(SpanFields(visitor.0)),
            }
        }
    }

    fn on_event(&self, event: &Event<'_>, ctx: LayerContext<'_, S>) {
        let metadata = event.metadata();
        let mut line = Map::new();
        line.insert("timestamp".into(), Value::String(timestamp()));
        line.insert(
            "level".into(),
            Value::String(metadata.level().as_str().to_lowercase()),
        );
        line.insert("target".into(), Value::String(metadata.target().into()));

        let mut spans = Vec::new();
        let mut context = Map::new();
        if let Some(scope) = ctx.event_scope(event) {
            for span in scope.from_root() {
                spans.push(Value::String(span.name().into()));
                if let Some(fields) = span.extensions().get::<SpanFields>() {
                    context.extend(fields.0.clone());
                }
            }
        }
        if !spans.is_empty() {
            line.insert("spans".into(), Value::Array(spans));
        }
        for key in CORRELATION_FIELDS {
            if let Some(value) = context.remove(*key) {
                line.insert((*key).into(), value);
            }
        }
        if !context.is_empty() {
            line.insert("context".into(), Value::Object(context));
        }

        let mut visitor = JsonVisitor::default();
        event.record(&mut visitor);
        line.extend(visitor.0);

        let mut writer = self.writer.make_writer();
        if serde_json::to_writer(&mut writer, &Value::Object(line)).is_ok() {
            let _ = writer.write_all(b"\n");
        }
    }
}

#[derive(Default)]
struct JsonVisitor(Map<String, Value>);

impl Visit for JsonVisitor {
    fn record_bool(&mut self, field: &Field, value: bool) {
        self.0.insert(field.name().into(), Value::Bool(value));
    }

    fn record_i64(&mut self, field: &Field, value: i64) {
        self.0.insert(field.name().into(), value.into());
    }

    fn record_u64(&mut self, field: &Field, value: u64) {
        self.0.insert(field.name().into(), value.into());
    }

    fn record_f64(&mut self, field: &Field, value: f64) {
        if let Some(number) = serde_json::Number::from_f64(value) {
            self.0.insert(field.name().into(), Value::Number(number));
        }
    }

    fn record_str(&mut self, field: &Field, value: &str) {
        self.0.insert(field.name().into(), value.into());
    }

    fn record_error(&mut self, field: &Field, value: &(dyn std::error::Error + 'static)) {
        self.0.insert(field.name().into(), value.to_string().into());
    }

    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        self.0.insert(field.name().into(), format!("{value:?}").into());
    }
}

fn timestamp() -> String {
    chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};
    use tracing::field::Empty;

    #[derive(Clone, Default)]
    struct Capture(Arc<Mutex<Vec<u8>>>);

    impl Write for Capture {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    fn capture(f: impl FnOnce()) -> Vec<Value> {
        let capture = Capture::default();
        let writer = capture.clone();
        let subscriber =
            tracing_subscriber::registry().with(JsonLogLayer::new(move || writer.clone()));
        tracing::subscriber::with_default(subscriber, f);

        let bytes = capture.0.lock().unwrap().clone();
        String::from_utf8(bytes)
            .unwrap()
            .lines()
            .map(|line| serde_json::from_str(line).unwrap())
            .collect()
    }

    #[test]
    fn run_events_carry_operation_id_and_state() {
        let lines = capture(|| {
            let span = tracing::info_span!(
                "run",
                mode = "apply",
                operation_id = "5f0c-op",
                state = Empty
            );
            let _entered = span.enter();
            span.record("state", "backed_up");
            tracing::info!(records = 1, "snapshot staged");
        });

        assert_eq!(lines.len(), 1);
        let line = &lines[0];
        assert_eq!(line["level"], "info");
        assert_eq!(line["message"], "snapshot staged");
        assert_eq!(line["records"], 1);
        assert_eq!(line["operation_id"], "5f0c-op");
        assert_eq!(line["state"], "backed_up");
        assert_eq!(line["spans"], serde_json::json!(["run"]));
        assert_eq!(line["context"]["mode"], "apply");
        assert!(line["context"].get("operation_id").is_none());
    }

    #[test]
    fn innermost_span_wins_and_bare_events_have_no_context() {
        let lines = capture(|| {
            tracing::warn!("before any run");
            let outer = tracing::info_span!("cmd_rollback", operation_id = "outer");
            let _outer = outer.enter();
            let inner = tracing::info_span!("rollback", reverts = "op-1", operation_id = "op-2");
            let _inner = inner.enter();
            tracing::info!("restored");
        });

        assert_eq!(lines.len(), 2);
        assert!(lines[0].get("spans").is_none());
        assert!(lines[0].get("context").is_none());
        assert_eq!(lines[1]["operation_id"], "op-2");
        assert_eq!(lines[1]["reverts"], "op-1");
        assert_eq!(lines[1]["spans"], serde_json::json!(["cmd_rollback", "rollback"]));
    }

    #[test]
    fn env_filter_quiet_overrides() {
        assert_eq!(env_filter(true, 3, "info").to_string(), "error");
    }

    #[test]
    fn env_filter_verbose_maps_to_debug_and_trace() {
        assert_eq!(env_filter(false, 1, "info").to_string(), "debug");
        assert_eq!(env_filter(false, 2, "info").to_string(), "trace");
    }

    #[test]
    fn log_path_wins_over_directories() {
        let tmp = tempfile::TempDir::new().unwrap();
        let settings = LogSettings {
            path: Some(tmp.path().join("custom.jsonl")),
            dir: Some(tmp.path().join("ignored")),
            config_dir: Some(tmp.path().join("also-ignored")),
        };

        assert_eq!(
            settings.destination().unwrap(),
            LogDestination::File {
                dir: tmp.path().to_path_buf(),
                file_name: "custom.jsonl".into(),
            }
        );
        assert!(!tmp.path().join("ignored").exists());
    }

    #[test]
    fn env_dir_wins_over_config_dir() {
        let tmp = tempfile::TempDir::new().unwrap();
        let settings = LogSettings {
            path: None,
            dir: Some(tmp.path().join("env")),
            config_dir: Some(tmp.path().join("config")),
        };

        let LogDestination::File { dir, file_name } = settings.destination().unwrap() else {
            panic!("expected a file destination");
        };
        assert_eq!(dir, tmp.path().join("env"));
        assert_eq!(file_name, LOG_FILE_NAME);
        assert!(tmp.path().join("env").join(LOG_FILE_NAME).is_file());
    }

    #[test]
    fn config_dir_is_used_when_env_is_unset() {
        let tmp = tempfile::TempDir::new().unwrap();
        let config_dir = camino::Utf8PathBuf::try_from(tmp.path().join("logs")).unwrap();
        let settings = LogSettings {
            config_dir: Some(config_dir.as_std_path().to_path_buf()),
            ..LogSettings::default()
        };
        assert!(matches!(
            settings.destination().unwrap(),
            LogDestination::File { dir, .. } if dir == config_dir.as_std_path()
        ));
    }

    #[test]
    fn unwritable_directory_is_an_error() {
        let tmp = tempfile::TempDir::new().unwrap();
        let blocker = tmp.path().join("file");
        std::fs::write(&blocker, "").unwrap();
        let settings = LogSettings {
            dir: Some(blocker.join("logs")),
            ..LogSettings::default()
        };
        assert!(settings.destination().is_err());
    }

    #[test]
    fn timestamps_are_utc_millis() {
        let ts = timestamp();
        assert!(ts.ends_with('Z'), "{ts}");
        assert_eq!(ts.len(), 24, "{ts}");
    }
}
