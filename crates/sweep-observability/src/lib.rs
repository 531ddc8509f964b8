use std::fs;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use chrono::{DateTime, NaiveDate, Utc};
use tracing::Level;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Target of every structured run event, so they can be filtered apart
/// from free-form logs (`RUST_LOG=sweep.obs=info`).
pub const OBS_TARGET: &str = "sweep.obs";

static PROCESS: OnceLock<ProcessKind> = OnceLock::new();

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessKind {
    Engine,
    Cli,
}

impl ProcessKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ProcessKind::Engine => "engine",
            ProcessKind::Cli => "cli",
        }
    }

    /// Daily files are named `<prefix>.YYYY-MM-DD.jsonl`.
    fn file_prefix(self) -> String {
        format!("sweep.{}", self.as_str())
    }
}

/// The process kind installed by [`init_process_logging`]. Library code
/// running without it (tests, embedding) reports as the engine.
pub fn current_process() -> ProcessKind {
    PROCESS.get().copied().unwrap_or(ProcessKind::Engine)
}

/// Keeps the JSONL writer alive; drop it last so buffered lines are flushed.
pub struct ProcessLogging {
    pub process: ProcessKind,
    pub dir: PathBuf,
    pub retention_days: u64,
    pub removed_files: usize,
    _guard: WorkerGuard,
}

impl std::fmt::Debug for ProcessLogging {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessLogging")
            .field("process", &self.process.as_str())
            .field("dir", &self.dir)
            .field("retention_days", &self.retention_days)
            .field("removed_files", &self.removed_files)
            .finish()
    }
}

/// Console (stderr, compact) plus daily-rolling JSONL under `logs_dir`.
/// A second call in the same process keeps the first subscriber.
pub fn init_process_logging(
    process: ProcessKind,
    logs_dir: &Path,
    retention_days: u64,
) -> anyhow::Result<ProcessLogging> {
    fs::create_dir_all(logs_dir)?;
    let removed_files = prune_expired_logs(logs_dir, process, retention_days, Utc::now())?;

    let file_appender = tracing_appender::rolling::Builder::new()
        .rotation(tracing_appender::rolling::Rotation::DAILY)
        .filename_prefix(process.file_prefix())
        .filename_suffix("jsonl")
        .build(logs_dir)?;
    let (writer, guard) = tracing_appender::non_blocking(file_appender);

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .compact()
                .with_target(true)
                .with_writer(std::io::stderr),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .json()
                .with_ansi(false)
                .with_current_span(false)
                .with_span_list(false)
                .with_writer(writer),
        )
        .try_init()
        .ok();
    let _ = PROCESS.set(process);

    Ok(ProcessLogging {
        process,
        dir: logs_dir.to_path_buf(),
        retention_days,
        removed_files,
        _guard: guard,
    })
}

fn prune_expired_logs(
    logs_dir: &Path,
    process: ProcessKind,
    retention_days: u64,
    now: DateTime<Utc>,
) -> anyhow::Result<usize> {
    let cutoff = (now - chrono::Duration::days(retention_days as i64)).date_naive();
    let prefix = format!("{}.", process.file_prefix());
    let mut removed = 0;

    for entry in fs::read_dir(logs_dir)?.flatten() {
        let path = entry.path();
        let Some(date) = path
            .file_name()
            .and_then(|name| name.to_str())
            .and_then(|name| name.strip_prefix(&prefix))
            .and_then(|rest| rest.strip_suffix(".jsonl"))
            .and_then(|date| NaiveDate::parse_from_str(date, "%Y-%m-%d").ok())
        else {
            continue;
        };
        if date < cutoff && path.is_file() && fs::remove_file(&path).is_ok() {
            removed += 1;
        }
    }
    Ok(removed)
}

/// One structured lifecycle event of a run, written to [`OBS_TARGET`].
#[derive(Debug, Clone, Default)]
pub struct RunEvent<'a> {
    event: &'a str,
    component: &'a str,
    run_id: Option<&'a str>,
    group: Option<&'a str>,
    action: Option<&'a str>,
    item_id: Option<&'a str>,
    status: Option<&'a str>,
    error_code: Option<&'a str>,
    detail: Option<&'a str>,
}

macro_rules! emit_at {
    ($level:expr, $process:expr, $ev:expr) => {
        tracing::event!(
            target: "sweep.obs",
            $level,
            process = $process.as_str(),
            component = $ev.component,
            event = $ev.event,
            run_id = $ev.run_id.unwrap_or(""),
            group = $ev.group.unwrap_or(""),
            action = $ev.action.unwrap_or(""),
            item_id = $ev.item_id.unwrap_or(""),
            status = $ev.status.unwrap_or(""),
            error_code = $ev.error_code.unwrap_or(""),
            detail = $ev.detail.unwrap_or(""),
            "run_event"
        )
    };
}

impl<'a> RunEvent<'a> {
    pub fn new(event: &'a str, component: &'a str) -> Self {
        Self {
            event,
            component,
            ..Default::default()
        }
    }

    pub fn run(mut self, run_id: impl Into<Option<&'a str>>) -> Self {
        self.run_id = run_id.into();
        self
    }

    pub fn action(mut self, group: &'a str, action: &'a str) -> Self {
        self.group = Some(group);
        self.action = Some(action);
        self
    }

    pub fn item(mut self, item_id: &'a str) -> Self {
        self.item_id = Some(item_id);
        self
    }

    pub fn status(mut self, status: &'a str) -> Self {
        self.status = Some(status);
        self
    }

    pub fn error_code(mut self, code: &'a str) -> Self {
        self.error_code = Some(code);
        self
    }

    pub fn detail(mut self, detail: &'a str) -> Self {
        self.detail = Some(detail);
        self
    }

    /// `tracing` levels are static per callsite, hence one arm per level.
    pub fn emit(&self, level: Level) {
        let process = current_process();
        match level {
            Level::ERROR => emit_at!(Level::ERROR, process, self),
            Level::WARN => emit_at!(Level::WARN, process, self),
            Level::DEBUG | Level::TRACE => emit_at!(Level::DEBUG, process, self),
            _ => emit_at!(Level::INFO, process, self),
        }
    }
}

/// Stands in for a secret in logs: length and a short hash, never the text.
pub fn redact_text(input: &str) -> String {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return String::new();
    }
    format!("[redacted len={} hash={}]", trimmed.len(), short_hash(trimmed))
}

pub fn short_hash(input: &str) -> String {
    use std::hash::{Hash, Hasher};
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    input.hash(&mut hasher);
    format!("{:016x}", hasher.finish())
}
