use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{ArgAction, Args, Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::prelude::*;

use stemflow_core::config::{config_path, data_dir, initialize_data_dir, AppConfig};
use stemflow_core::logging::{
    self, FileSink, LoggingOptions, PanicHookStatus, ProcessRole, DEFAULT_LOG_FILTER,
};
use stemflow_core::mission::OutputFormat;
use stemflow_core::preset::PresetCatalog;
use stemflow_core::progress::ProgressStore;
use stemflow_core::scheduler::{Scheduler, SchedulerSettings};
use stemflow_core::server::{app_router, AppState};
use stemflow_core::worker::{self, WorkerArgs, EXIT_FAILURE};

#[derive(Parser)]
#[command(name = "stemflow", about = "Audio stem separation job server")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    #[arg(
        short = 'v',
        long = "verbose",
        action = ArgAction::Count,
        global = true,
        help = "Increase log verbosity (-v: debug, -vv: trace)"
    )]
    verbose: u8,

    #[arg(
        long = "log-filter",
        value_name = "FILTER",
        global = true,
        help = "Explicit tracing filter (overrides RUST_LOG and -v)"
    )]
    log_filter: Option<String>,

    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    #[arg(short, long)]
    port: Option<u16>,

    #[arg(long)]
    host: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run one mission's preset over its inputs. Spawned by the scheduler.
    Worker(WorkerCommand),
}

#[derive(Args)]
struct WorkerCommand {
    #[arg(short = 'p', long, help = "Path to the preset JSON file")]
    preset: PathBuf,
    #[arg(short = 'i', long = "input", required = true, help = "Input directory (repeatable)")]
    inputs: Vec<PathBuf>,
    #[arg(short = 'o', long = "output", help = "Directory final stems are stored in")]
    output: PathBuf,
    #[arg(short = 'f', long, default_value = "wav", help = "Output format: wav, mp3 or flac")]
    format: OutputFormat,
    #[arg(long, help = "Skip inputs whose outputs already exist")]
    skip_existing: bool,
    #[arg(long)]
    debug: bool,
    #[arg(long, help = "Process all inputs through each step before the next step")]
    batch: bool,
    #[arg(long, help = "Mission directory holding progress.json")]
    mission_dir: Option<PathBuf>,
}

impl From<WorkerCommand> for WorkerArgs {
    fn from(command: WorkerCommand) -> Self {
        WorkerArgs {
            preset: command.preset,
            inputs: command.inputs,
            output_dir: command.output,
            format: command.format,
            skip_existing: command.skip_existing,
            debug: command.debug,
            batch: command.batch,
            mission_dir: command.mission_dir,
        }
    }
}

/// Parse the command line and run it. Returns the process exit code.
pub async fn run_from_env() -> Result<i32> {
    let cli = Cli::parse();
    let role = if cli.command.is_some() {
        ProcessRole::Worker
    } else {
        ProcessRole::Server
    };
    let resolved_data_dir = data_dir(cli.data_dir.as_deref());

    init_logging(
        role,
        Some(resolved_data_dir.as_path()),
        cli.verbose,
        cli.log_filter.as_deref(),
    );
    log_startup_metadata(role, &resolved_data_dir);

    match cli.command {
        Some(Commands::Worker(command)) => run_worker(command.into(), resolved_data_dir).await,
        None => {
            run_server(cli.port, cli.host, resolved_data_dir).await?;
            Ok(0)
        }
    }
}

fn logging_options(
    role: ProcessRole,
    data_dir: Option<&Path>,
    verbose: u8,
    cli_log_filter: Option<&str>,
    rust_log: Option<String>,
) -> LoggingOptions {
    LoggingOptions {
        role,
        data_dir: data_dir.map(Path::to_path_buf),
        verbose,
        cli_filter: cli_log_filter.map(ToString::to_string),
        rust_log,
        ..Default::default()
    }
}

fn init_logging(
    role: ProcessRole,
    data_dir: Option<&Path>,
    verbose: u8,
    cli_log_filter: Option<&str>,
) {
    let panic_hook = logging::install_panic_hook(data_dir);
    if let PanicHookStatus::Unavailable(reason) = &panic_hook {
        eprintln!("Warning: panic crash reports unavailable ({reason}). Panics will not be persisted.");
    }

    let options = logging_options(
        role,
        data_dir,
        verbose,
        cli_log_filter,
        std::env::var("RUST_LOG").ok(),
    );
    let filter = logging::compose_filter(&options);

    match logging::prepare_file_sink(&options) {
        FileSink::Ready { appender, .. } => {
            let subscriber = tracing_subscriber::registry()
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_writer(std::io::stderr)
                        .with_filter(parse_env_filter_with_fallback(&filter, "console")),
                )
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_ansi(false)
                        .with_writer(appender)
                        .with_filter(parse_env_filter_with_fallback(&filter, "file")),
                );

            if let Err(error) = tracing::subscriber::set_global_default(subscriber) {
                eprintln!(
                    "Failed to initialize tracing subscriber: {error}. Continuing without structured tracing."
                );
            }
        }
        FileSink::Unavailable { attempted, reason } => {
            let attempted = attempted
                .as_ref()
                .map(|path| path.display().to_string())
                .unwrap_or_else(|| "<none>".to_string());

            let subscriber = tracing_subscriber::registry().with(
                tracing_subscriber::fmt::layer()
                    .with_writer(std::io::stderr)
                    .with_filter(parse_env_filter_with_fallback(&filter, "console")),
            );
            if let Err(error) = tracing::subscriber::set_global_default(subscriber) {
                eprintln!(
                    "Failed to initialize tracing subscriber: {error}. Continuing without structured tracing."
                );
                return;
            }

            warn!(
                attempted_log_dir = %attempted,
                reason = %reason,
                "Persistent file logging unavailable; continuing with console-only logging"
            );
        }
    }

    if let PanicHookStatus::Unavailable(reason) = panic_hook {
        warn!(reason = %reason, "Panic crash reports unavailable");
    }
}

fn parse_env_filter_with_fallback(filter: &str, sink_name: &str) -> tracing_subscriber::EnvFilter {
    tracing_subscriber::EnvFilter::try_new(filter).unwrap_or_else(|error| {
        eprintln!(
            "Invalid {sink_name} log filter '{filter}': {error}. Falling back to '{DEFAULT_LOG_FILTER}'."
        );
        tracing_subscriber::EnvFilter::new(DEFAULT_LOG_FILTER)
    })
}

fn log_startup_metadata(role: ProcessRole, data_dir: &Path) {
    info!(
        role = role.as_str(),
        pid = std::process::id(),
        data_dir = %data_dir.display(),
        config_path = %config_path(data_dir).display(),
        "Runtime startup metadata"
    );
}

fn load_config(data_dir: &Path) -> AppConfig {
    match AppConfig::load_from_path(&config_path(data_dir)) {
        Ok(config) => config,
        Err(err) => {
            warn!(error = %format!("{err:#}"), "Failed to load config file, using defaults");
            AppConfig::default()
        }
    }
}

async fn run_server(
    port_override: Option<u16>,
    host_override: Option<String>,
    data_dir: PathBuf,
) -> Result<()> {
    if let Err(e) = initialize_data_dir(&data_dir) {
        warn!(error = %format!("{e:#}"), "Failed to initialize data directory");
    }
    let config = load_config(&data_dir);

    let port = port_override
        .or_else(|| std::env::var("PORT").ok().and_then(|v| v.parse().ok()))
        .unwrap_or(config.server.port);
    let host = host_override.unwrap_or_else(|| config.server.host.clone());

    let paths = config.resolved_paths(&data_dir);
    let settings = SchedulerSettings::from_config(&config, &data_dir)?;
    let store = Arc::new(
        ProgressStore::new()
            .with_presets(PresetCatalog::new(&paths.presets_dir))
            .with_log_dir(logging::log_dir(&data_dir)),
    );
    let scheduler = Scheduler::new(settings, store)?;

    let shutdown = CancellationToken::new();
    let scheduler_loop = scheduler.start(shutdown.clone());

    let app = app_router(AppState::new(scheduler, paths.missions_dir));
    let addr = format!("{host}:{port}");
    info!(%addr, "Starting stemflow server");

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    let server_shutdown = shutdown.clone();
    let served = axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            wait_for_shutdown_signal().await;
            info!("Shutdown signal received");
            server_shutdown.cancel();
        })
        .await;

    shutdown.cancel();
    if let Err(err) = scheduler_loop.await {
        warn!(error = %err, "Scheduler loop ended abnormally");
    }
    served.context("server error")?;
    Ok(())
}

async fn run_worker(args: WorkerArgs, data_dir: PathBuf) -> Result<i32> {
    let config = load_config(&data_dir);
    let cancel = CancellationToken::new();

    let signal_cancel = cancel.clone();
    let signals = tokio::spawn(async move {
        wait_for_shutdown_signal().await;
        info!("Cancellation signal received; stopping worker");
        signal_cancel.cancel();
    });

    let worker_cancel = cancel.clone();
    let exit = tokio::task::spawn_blocking(move || {
        worker::run(&args, &config, &data_dir, &worker_cancel).code()
    })
    .await;
    signals.abort();

    match exit {
        Ok(code) => Ok(code),
        Err(err) => {
            tracing::error!(error = %err, "Worker task panicked");
            Ok(EXIT_FAILURE)
        }
    }
}

/// Resolves on Ctrl-C, or on SIGTERM where available. Administrative kills of worker
/// trees send SIGKILL directly; this signal only stops the hosting process.
async fn wait_for_shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            warn!(error = %err, "Failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(err) => {
                warn!(error = %err, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}

#[cfg(test)]
mod cli_tests {
    use super::*;

    #[test]
    fn worker_subcommand_parses_scheduler_arguments() {
        let cli = Cli::try_parse_from([
            "stemflow",
            "worker",
            "-p",
            "/presets/vocals.json",
            "-i",
            "/in/a",
            "-i",
            "/in/b",
            "-o",
            "/out",
            "-f",
            "flac",
            "--mission-dir",
            "/missions/m1",
            "--data-dir",
            "/data",
            "--skip-existing",
            "--batch",
        ])
        .unwrap();

        assert_eq!(cli.data_dir, Some(PathBuf::from("/data")));
        let Some(Commands::Worker(command)) = cli.command else {
            panic!("expected worker subcommand");
        };
        let args = WorkerArgs::from(command);
        assert_eq!(args.inputs, vec![PathBuf::from("/in/a"), PathBuf::from("/in/b")]);
        assert_eq!(args.format, OutputFormat::Flac);
        assert_eq!(args.mission_dir, Some(PathBuf::from("/missions/m1")));
        assert!(args.skip_existing);
        assert!(args.batch);
        assert!(!args.debug);
    }

    #[test]
    fn worker_requires_an_input() {
        let result = Cli::try_parse_from(["stemflow", "worker", "-p", "p.json", "-o", "/out"]);
        assert!(result.is_err());
    }

    #[test]
    fn worker_rejects_unknown_format() {
        let result = Cli::try_parse_from([
            "stemflow", "worker", "-p", "p.json", "-i", "/in", "-o", "/out", "-f", "ogg",
        ]);
        assert!(result.is_err());
    }

    #[test]
    fn server_flags_parse_without_subcommand() {
        let cli = Cli::try_parse_from(["stemflow", "-vv", "--port", "9000"]).unwrap();
        assert!(cli.command.is_none());
        assert_eq!(cli.verbose, 2);
        assert_eq!(cli.port, Some(9000));
    }
}
