use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{ArgAction, Args, Parser, Subcommand};
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::prelude::*;

use ltxgate_core::backend::BackendClient;
use ltxgate_core::config::{config_path, data_dir, initialize_data_dir, resolve_relative_to, AppConfig};
use ltxgate_core::logging::{self, FileSinkPlan, LoggingOptions, RedactingMakeWriter, DEFAULT_LOG_FILTER};
use ltxgate_core::server::{build_router, AppState};
use ltxgate_core::{wait_until_ready, BackendReady, Handler, TemplateStore};

#[derive(Parser)]
#[command(
    name = "ltxgate",
    about = "Serverless LTX-2 image-to-video worker",
    args_conflicts_with_subcommands = true
)]
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

    #[arg(short, long)]
    port: Option<u16>,

    #[arg(long)]
    host: Option<String>,

    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    #[arg(
        long = "backend-url",
        value_name = "URL",
        global = true,
        help = "Override [backend].base_url from config.toml"
    )]
    backend_url: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Execute one job envelope from a file and print the reply.
    Run(RunArgs),
    /// Run the readiness gate once and report.
    Probe,
}

#[derive(Args)]
struct RunArgs {
    #[arg(help = "Path to a job JSON file ({\"id\", \"input\"} or a bare input object)")]
    job: PathBuf,
    #[arg(short = 'o', long, help = "Write the reply JSON here instead of stdout")]
    output: Option<PathBuf>,
}

pub async fn run_from_env() -> Result<()> {
    let cli = Cli::parse();
    let resolved_data_dir = data_dir(cli.data_dir.as_deref());

    init_logging(&resolved_data_dir, cli.verbose, cli.log_filter.as_deref());
    log_startup_metadata(command_name(cli.command.as_ref()), &resolved_data_dir);

    let config = load_config(&resolved_data_dir, cli.backend_url.as_deref());
    let shutdown = CancellationToken::new();
    spawn_shutdown_listener(shutdown.clone());

    match cli.command {
        Some(Commands::Run(run)) => run_job(run, config, &resolved_data_dir, shutdown).await,
        Some(Commands::Probe) => probe(config, shutdown).await,
        None => run_server(cli.port, cli.host, config, &resolved_data_dir, shutdown).await,
    }
}

fn command_name(command: Option<&Commands>) -> &'static str {
    match command {
        Some(Commands::Run(_)) => "run",
        Some(Commands::Probe) => "probe",
        None => "server",
    }
}

fn init_logging(data_dir: &Path, verbose: u8, cli_log_filter: Option<&str>) {
    let options = LoggingOptions {
        data_dir: Some(data_dir.to_path_buf()),
        verbose,
        cli_log_filter: cli_log_filter.map(ToString::to_string),
        rust_log_env: std::env::var("RUST_LOG").ok(),
        ..Default::default()
    };
    let filter = logging::compose_log_filter(&options);

    match logging::build_file_sink_plan(&options) {
        FileSinkPlan::Ready { appender, .. } => {
            let subscriber = tracing_subscriber::registry()
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_writer(std::io::stderr)
                        .with_filter(parse_env_filter_with_fallback(&filter, "console")),
                )
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_ansi(false)
                        .with_writer(RedactingMakeWriter::new(appender))
                        .with_filter(parse_env_filter_with_fallback(&filter, "file")),
                );

            if let Err(error) = tracing::subscriber::set_global_default(subscriber) {
                eprintln!(
                    "Failed to initialize tracing subscriber: {error}. Continuing without structured tracing."
                );
            }
        }
        FileSinkPlan::Fallback {
            attempted_log_dir,
            reason,
        } => {
            let attempted_log_dir = attempted_log_dir
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
                attempted_log_dir = %attempted_log_dir,
                reason = %reason,
                "Persistent file logging unavailable; continuing with console-only logging"
            );
        }
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

fn log_startup_metadata(mode: &'static str, data_dir: &Path) {
    info!(
        mode,
        pid = std::process::id(),
        version = env!("CARGO_PKG_VERSION"),
        started_at = %chrono::Utc::now().to_rfc3339(),
        data_dir = %data_dir.display(),
        config_path = %config_path(data_dir).display(),
        "Runtime startup metadata"
    );
}

fn load_config(data_dir: &Path, backend_url: Option<&str>) -> AppConfig {
    if let Err(e) = initialize_data_dir(data_dir) {
        warn!(error = %e, "Failed to initialize data directory");
    }
    let cfg_path = config_path(data_dir);
    let mut config = match AppConfig::load_from_path(&cfg_path) {
        Ok(config) => config,
        Err(err) => {
            warn!(error = %format!("{err:#}"), "Failed to load config file, using defaults");
            AppConfig::default()
        }
    };

    if let Some(url) = backend_url {
        config.backend.base_url = url.to_string();
    }
    config
}

fn spawn_shutdown_listener(shutdown: CancellationToken) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Shutdown requested; cancelling in-flight work");
            shutdown.cancel();
        }
    });
}

fn resolve_port(cli_port: Option<u16>, env_port: Option<&str>, config_port: u16) -> u16 {
    cli_port
        .or_else(|| env_port.and_then(|value| value.trim().parse().ok()))
        .unwrap_or(config_port)
}

fn load_templates(config: &AppConfig, data_dir: &Path) -> Result<TemplateStore> {
    let templates_dir = resolve_relative_to(data_dir, &config.paths.templates_dir);
    let store = TemplateStore::load(&templates_dir)
        .with_context(|| format!("failed to load graph templates from {}", templates_dir.display()))?;
    info!(templates_dir = %templates_dir.display(), "Graph templates loaded");
    Ok(store)
}

async fn await_backend(config: &AppConfig, shutdown: &CancellationToken) -> Result<BackendReady> {
    let backend = BackendClient::new(&config.backend)?;
    info!(
        base_url = %backend.base_url(),
        max_attempts = config.readiness.max_attempts,
        interval_ms = config.readiness.interval_ms,
        "Waiting for backend readiness"
    );
    let ready = wait_until_ready(backend, &config.readiness, shutdown)
        .await
        .into_result()?;
    Ok(ready)
}

async fn run_server(
    port_override: Option<u16>,
    host_override: Option<String>,
    config: AppConfig,
    data_dir: &Path,
    shutdown: CancellationToken,
) -> Result<()> {
    let port = resolve_port(
        port_override,
        std::env::var("PORT").ok().as_deref(),
        config.server.port,
    );
    let host = host_override.unwrap_or_else(|| config.server.host.clone());

    let templates = load_templates(&config, data_dir)?;
    let ready = await_backend(&config, &shutdown).await?;
    let handler = Handler::new(ready, &config, Arc::new(templates));
    let app = build_router(
        AppState::new(handler, shutdown.clone()),
        config.server.max_body_bytes,
    );

    let addr = format!("{host}:{port}");
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    info!(%addr, "Starting ltxgate worker");

    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;
    info!("Worker stopped");
    Ok(())
}

/// Accepts either the serverless envelope `{"id", "input"}` or a bare input
/// object.
fn unwrap_job_envelope(value: Value) -> (Option<String>, Value) {
    match value {
        Value::Object(mut map) if map.get("input").is_some_and(Value::is_object) => {
            let id = map.get("id").and_then(Value::as_str).map(ToString::to_string);
            let input = map.remove("input").unwrap_or(Value::Null);
            (id, input)
        }
        other => (None, other),
    }
}

async fn run_job(
    args: RunArgs,
    config: AppConfig,
    data_dir: &Path,
    shutdown: CancellationToken,
) -> Result<()> {
    let raw = std::fs::read_to_string(&args.job)
        .with_context(|| format!("failed to read job file: {}", args.job.display()))?;
    let value: Value = serde_json::from_str(&raw)
        .with_context(|| format!("failed to parse job file: {}", args.job.display()))?;
    let (id, input) = unwrap_job_envelope(value);

    let templates = load_templates(&config, data_dir)?;
    let ready = await_backend(&config, &shutdown).await?;
    let handler = Handler::new(ready, &config, Arc::new(templates));

    let reply = handler.handle(&input, id.as_deref(), &shutdown).await;
    let (encoded, failure) = match &reply {
        Ok(response) => (serde_json::to_string_pretty(response)?, None),
        Err(envelope) => (
            serde_json::to_string_pretty(envelope)?,
            Some(format!("{}: {}", envelope.error, envelope.message)),
        ),
    };

    match &args.output {
        Some(path) => {
            std::fs::write(path, &encoded)
                .with_context(|| format!("failed to write reply: {}", path.display()))?;
            info!(path = %path.display(), "Reply written");
        }
        None => println!("{encoded}"),
    }

    if let Some(failure) = failure {
        bail!("job did not produce a video ({failure})");
    }
    Ok(())
}

async fn probe(config: AppConfig, shutdown: CancellationToken) -> Result<()> {
    let ready = await_backend(&config, &shutdown).await?;
    println!("backend ready at {}", ready.backend().base_url());
    Ok(())
}
