//! Logging setup shared by the server and worker processes.
//!
//! Both processes write to the same daily-rolling file under `<data_dir>/logs`, which is
//! where the progress store looks for a worker's final `time cost` line.

use std::any::Any;
use std::backtrace::{Backtrace, BacktraceStatus};
use std::fs;
use std::io::Write;
use std::panic::{self, PanicHookInfo};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Mutex, OnceLock};
use std::thread;

use chrono::{DateTime, Utc};
use tracing_appender::rolling::{RollingFileAppender, Rotation};

pub const DEFAULT_LOG_FILTER: &str = "info";
pub const DEFAULT_NOISE_FILTER: &str = "hyper=warn,tower_http=warn,sysinfo=error";
pub const DEFAULT_LOG_RETENTION_FILES: usize = 14;
pub const LOG_DIR_NAME: &str = "logs";
pub const CRASH_DIR_NAME: &str = "crash";
pub const LOG_FILE_PREFIX: &str = "stemflow";
pub const LOG_FILE_SUFFIX: &str = "log";

static PANIC_HOOK_LOCK: Mutex<()> = Mutex::new(());
static PANIC_CRASH_DIR: OnceLock<PathBuf> = OnceLock::new();
static PANIC_WRITING: AtomicBool = AtomicBool::new(false);
static PANIC_SEQUENCE: AtomicU64 = AtomicU64::new(0);

/// Which process is logging. Recorded in the startup line so interleaved server and
/// worker output in the shared file can be told apart.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessRole {
    Server,
    Worker,
}

impl ProcessRole {
    pub fn as_str(self) -> &'static str {
        match self {
            ProcessRole::Server => "server",
            ProcessRole::Worker => "worker",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoggingOptions {
    pub role: ProcessRole,
    pub data_dir: Option<PathBuf>,
    pub verbose: u8,
    pub cli_filter: Option<String>,
    pub rust_log: Option<String>,
    pub noise_filter: String,
    pub retention_files: usize,
}

impl Default for LoggingOptions {
    fn default() -> Self {
        Self {
            role: ProcessRole::Server,
            data_dir: None,
            verbose: 0,
            cli_filter: None,
            rust_log: None,
            noise_filter: DEFAULT_NOISE_FILTER.to_string(),
            retention_files: DEFAULT_LOG_RETENTION_FILES,
        }
    }
}

/// Where the effective filter came from, highest precedence first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FilterSource {
    Cli(String),
    Verbose(u8),
    Env(String),
    Default,
}

impl FilterSource {
    pub fn select(options: &LoggingOptions) -> Self {
        if let Some(filter) = &options.cli_filter {
            FilterSource::Cli(filter.clone())
        } else if options.verbose > 0 {
            FilterSource::Verbose(options.verbose)
        } else if let Some(filter) = &options.rust_log {
            FilterSource::Env(filter.clone())
        } else {
            FilterSource::Default
        }
    }

    pub fn directive(&self) -> String {
        match self {
            FilterSource::Cli(filter) | FilterSource::Env(filter) => filter.clone(),
            FilterSource::Verbose(1) => "debug".to_string(),
            FilterSource::Verbose(_) => "trace".to_string(),
            FilterSource::Default => DEFAULT_LOG_FILTER.to_string(),
        }
    }

    /// Noise suppression applies only when nobody asked for a specific level.
    pub fn is_implicit(&self) -> bool {
        matches!(self, FilterSource::Env(_) | FilterSource::Default)
    }
}

/// The filter string both sinks use.
pub fn compose_filter(options: &LoggingOptions) -> String {
    let source = FilterSource::select(options);
    let directive = source.directive();
    let noise = options.noise_filter.trim();
    if source.is_implicit() && !noise.is_empty() {
        format!("{noise},{directive}")
    } else {
        directive
    }
}

pub fn log_dir(data_dir: &Path) -> PathBuf {
    data_dir.join(LOG_DIR_NAME)
}

pub fn crash_dir(data_dir: &Path) -> PathBuf {
    log_dir(data_dir).join(CRASH_DIR_NAME)
}

/// Outcome of preparing the persistent log file.
#[derive(Debug)]
pub enum FileSink {
    Ready {
        log_dir: PathBuf,
        appender: RollingFileAppender,
    },
    Unavailable {
        attempted: Option<PathBuf>,
        reason: String,
    },
}

impl FileSink {
    pub fn is_ready(&self) -> bool {
        matches!(self, FileSink::Ready { .. })
    }
}

pub fn prepare_file_sink(options: &LoggingOptions) -> FileSink {
    let Some(data_dir) = options.data_dir.as_deref() else {
        return FileSink::Unavailable {
            attempted: None,
            reason: "no data directory configured".to_string(),
        };
    };

    let dir = log_dir(data_dir);
    if let Err(err) = fs::create_dir_all(&dir) {
        return FileSink::Unavailable {
            attempted: Some(dir),
            reason: format!("failed to create log directory: {err}"),
        };
    }

    let retention = if options.retention_files == 0 {
        DEFAULT_LOG_RETENTION_FILES
    } else {
        options.retention_files
    };
    match RollingFileAppender::builder()
        .rotation(Rotation::DAILY)
        .filename_prefix(LOG_FILE_PREFIX)
        .filename_suffix(LOG_FILE_SUFFIX)
        .max_log_files(retention)
        .build(&dir)
    {
        Ok(appender) => FileSink::Ready {
            log_dir: dir,
            appender,
        },
        Err(err) => FileSink::Unavailable {
            attempted: Some(dir),
            reason: format!("failed to open rolling log file: {err}"),
        },
    }
}

/// Result of [`install_panic_hook`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PanicHookStatus {
    Installed(PathBuf),
    AlreadyInstalled(PathBuf),
    Unavailable(String),
}

/// Persist every panic to `<data_dir>/logs/crash/panic-*.log`, then run the previous hook.
pub fn install_panic_hook(data_dir: Option<&Path>) -> PanicHookStatus {
    let Some(data_dir) = data_dir else {
        return PanicHookStatus::Unavailable("no data directory configured".to_string());
    };

    let _guard = PANIC_HOOK_LOCK
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner());
    if let Some(existing) = PANIC_CRASH_DIR.get() {
        return PanicHookStatus::AlreadyInstalled(existing.clone());
    }

    let dir = crash_dir(data_dir);
    if let Err(err) = fs::create_dir_all(&dir) {
        return PanicHookStatus::Unavailable(format!(
            "failed to create {}: {err}",
            dir.display()
        ));
    }

    let previous = panic::take_hook();
    let hook_dir = dir.clone();
    panic::set_hook(Box::new(move |info| {
        record_panic(&hook_dir, info);
        previous(info);
    }));
    let _ = PANIC_CRASH_DIR.set(dir.clone());
    PanicHookStatus::Installed(dir)
}

#[derive(Debug)]
struct CrashReport {
    at: DateTime<Utc>,
    pid: u32,
    thread: String,
    location: String,
    message: String,
    backtrace: String,
}

fn record_panic(dir: &Path, info: &PanicHookInfo<'_>) {
    if PANIC_WRITING.swap(true, Ordering::AcqRel) {
        return;
    }
    let written = panic::catch_unwind(panic::AssertUnwindSafe(|| {
        write_crash_report(dir, &crash_report(info))
    }));
    match written {
        Ok(Ok(_)) => {}
        Ok(Err(err)) => eprintln!(
            "Warning: could not write crash report to {}: {err}",
            dir.display()
        ),
        Err(_) => eprintln!("Warning: crash report writer panicked ({})", dir.display()),
    }
    PANIC_WRITING.store(false, Ordering::Release);
}

fn crash_report(info: &PanicHookInfo<'_>) -> CrashReport {
    let backtrace = Backtrace::capture();
    let backtrace = match backtrace.status() {
        BacktraceStatus::Captured => backtrace.to_string(),
        BacktraceStatus::Disabled => "<disabled; set RUST_BACKTRACE=1>".to_string(),
        _ => "<unavailable>".to_string(),
    };
    CrashReport {
        at: Utc::now(),
        pid: std::process::id(),
        thread: thread::current().name().unwrap_or("<unnamed>").to_string(),
        location: info
            .location()
            .map(|location| format!("{}:{}", location.file(), location.line()))
            .unwrap_or_else(|| "<unknown>".to_string()),
        message: payload_message(info.payload()),
        backtrace,
    }
}

fn write_crash_report(dir: &Path, report: &CrashReport) -> std::io::Result<PathBuf> {
    fs::create_dir_all(dir)?;
    let sequence = PANIC_SEQUENCE.fetch_add(1, Ordering::Relaxed);
    let path = dir.join(format!(
        "panic-{}-{}-{sequence:04}.log",
        report.at.format("%Y%m%d-%H%M%S"),
        report.pid
    ));
    let mut file = fs::File::create(&path)?;
    writeln!(file, "time={}", report.at.to_rfc3339())?;
    writeln!(file, "pid={}", report.pid)?;
    writeln!(file, "thread={}", report.thread)?;
    writeln!(file, "location={}", report.location)?;
    writeln!(file, "message={}", report.message)?;
    writeln!(file, "backtrace:\n{}", report.backtrace)?;
    file.flush()?;
    Ok(path)
}

fn payload_message(payload: &(dyn Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|message| message.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "<non-string panic payload>".to_string())
}
