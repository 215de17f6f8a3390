//! Stratum pipeline - main entry point

use anyhow::Context;
use clap::{value_parser, Arg, ArgAction, ArgMatches, Command};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::signal;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use stratum_pipeline::{Pipeline, PipelineConfig, SYSTEM_NAME, VERSION};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let matches = build_cli().get_matches();

    let log_level = matches.get_one::<String>("log-level").map(String::as_str).unwrap_or("info");
    init_logging(log_level, matches.get_flag("log-json"))?;

    info!(version = VERSION, system = SYSTEM_NAME, "Starting Stratum pipeline");

    let config_path = matches.get_one::<String>("config").map(PathBuf::from);
    let mut config = load_config(config_path.as_deref())?;
    apply_overrides(&mut config, &matches);
    config.validate().context("Invalid configuration")?;

    if let Some(ref addr) = config.monitoring.metrics_addr {
        init_metrics(addr)?;
    }

    let stack = matches.get_one::<String>("stack").cloned().unwrap_or_else(|| "rust".to_string());
    let status_interval = Duration::from_secs(config.monitoring.status_interval_secs.max(1));
    let run_for = matches.get_one::<u64>("run-for").copied().map(Duration::from_secs);

    let pipeline = Pipeline::new(config, stack).await.context("Failed to build pipeline")?;
    pipeline.start().await?;

    let shutdown = setup_shutdown_signal();
    tokio::pin!(shutdown);
    let deadline = async {
        match run_for {
            Some(duration) => tokio::time::sleep(duration).await,
            None => std::future::pending::<()>().await,
        }
    };
    tokio::pin!(deadline);

    let mut ticker = tokio::time::interval(status_interval);
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = &mut shutdown => {
                info!("Shutdown signal received, stopping pipeline...");
                break;
            }
            _ = &mut deadline => {
                info!("Run duration elapsed, stopping pipeline...");
                break;
            }
            _ = ticker.tick() => log_status(&pipeline),
        }
    }

    if let Err(e) = pipeline.stop().await {
        error!(error = %e, "Pipeline stopped with error");
    }

    println!("{}", serde_json::to_string_pretty(&pipeline.status())?);
    info!("Stratum pipeline stopped");
    Ok(())
}

fn build_cli() -> Command {
    Command::new("stratum")
        .version(VERSION)
        .about("Staged blockchain event pipeline: raw ingestion, cleaning and feature extraction")
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("FILE")
                .help("Configuration file path")
                .default_value("config/pipeline.toml"),
        )
        .arg(
            Arg::new("stack")
                .long("stack")
                .value_name("STACK")
                .help("Deployment stack label reported in status")
                .default_value("rust"),
        )
        .arg(
            Arg::new("rpc-endpoint")
                .long("rpc-endpoint")
                .value_name("URL")
                .help("Override the endpoint of the first ingestion source"),
        )
        .arg(
            Arg::new("storage-backend")
                .long("storage-backend")
                .value_name("BACKEND")
                .help("Override the storage backend (file, memory, postgres, redis, s3)"),
        )
        .arg(
            Arg::new("metrics-addr")
                .long("metrics-addr")
                .value_name("ADDR")
                .help("Serve Prometheus metrics on this address"),
        )
        .arg(
            Arg::new("run-for")
                .long("run-for")
                .value_name("SECONDS")
                .help("Stop after this many seconds instead of waiting for a signal")
                .value_parser(value_parser!(u64)),
        )
        .arg(
            Arg::new("log-level")
                .short('l')
                .long("log-level")
                .value_name("LEVEL")
                .help("Log level (trace, debug, info, warn, error)")
                .default_value("info"),
        )
        .arg(
            Arg::new("log-json")
                .long("log-json")
                .help("Emit logs as JSON lines")
                .action(ArgAction::SetTrue),
        )
}

/// Initialize logging with the specified level
fn init_logging(log_level: &str, json: bool) -> anyhow::Result<()> {
    let level = match log_level.to_lowercase().as_str() {
        "trace" => tracing::Level::TRACE,
        "debug" => tracing::Level::DEBUG,
        "info" => tracing::Level::INFO,
        "warn" => tracing::Level::WARN,
        "error" => tracing::Level::ERROR,
        _ => {
            eprintln!("Invalid log level: {}. Using 'info'", log_level);
            tracing::Level::INFO
        }
    };

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| format!("stratum_pipeline={},stratum={}", level, level).into());

    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry.with(tracing_subscriber::fmt::layer().json()).try_init()?;
    } else {
        registry.with(tracing_subscriber::fmt::layer()).try_init()?;
    }

    Ok(())
}

/// Load configuration from file when present, otherwise from the environment only
fn load_config(path: Option<&Path>) -> anyhow::Result<PipelineConfig> {
    match path {
        Some(path) if path.exists() => {
            info!(config_path = %path.display(), "Loading configuration");
            PipelineConfig::load(Some(path)).with_context(|| format!("Failed to load {}", path.display()))
        }
        Some(path) => {
            warn!(config_path = %path.display(), "Configuration file not found, using defaults and environment");
            Ok(PipelineConfig::load(None)?)
        }
        None => Ok(PipelineConfig::load(None)?),
    }
}

/// Apply command line overrides on top of the loaded configuration
fn apply_overrides(config: &mut PipelineConfig, matches: &ArgMatches) {
    if let Some(endpoint) = matches.get_one::<String>("rpc-endpoint") {
        match config.ingestion.sources.first_mut() {
            Some(source) => source.endpoint = Some(endpoint.clone()),
            None => warn!("--rpc-endpoint given but no ingestion sources are configured"),
        }
    }

    if let Some(backend) = matches.get_one::<String>("storage-backend") {
        config.storage.backend = backend.clone();
    }

    if let Some(addr) = matches.get_one::<String>("metrics-addr") {
        config.monitoring.metrics_addr = Some(addr.clone());
    }
}

/// Install the Prometheus exporter
fn init_metrics(addr: &str) -> anyhow::Result<()> {
    let addr: SocketAddr = addr.parse().with_context(|| format!("Invalid metrics address {}", addr))?;
    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .context("Failed to install Prometheus exporter")?;
    info!(%addr, "Metrics exporter listening");
    Ok(())
}

fn log_status(pipeline: &Pipeline) {
    let status = pipeline.status();
    info!(
        running = status.running,
        active_sources = status.ingestion.active,
        raw_buffered = status.raw.buffered_count,
        cleaned_buffered = status.cleaned.buffered_count,
        feature_buffered = status.feature.buffered_count,
        "Pipeline status"
    );
}

/// Set up graceful shutdown signal handling
async fn setup_shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
