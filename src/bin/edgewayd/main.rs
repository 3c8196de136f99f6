//! `edgewayd` - gateway-side cloud connectivity and configuration storage.
//!
//! Dials cloud services through the control proxy (or directly, as the
//! control-proxy configuration dictates) and stores configuration blobs with
//! crash-safe file swaps.
//!
//! # Usage
//!
//! ```sh
//! edgewayd -c path/to/config.toml connect configurator
//! edgewayd -c path/to/config.toml save gateway.mconfig --read-old
//! ```

mod settings;

use std::{fs, path::Path, process, sync::Arc};

use anyhow::{Context, Result};
use clap::Parser;
use edgeway::{CloudConnector, ConfigWriter, StaticUpdate};
use settings::{Args, Command, Config};
use tracing::level_filters::LevelFilter;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{EnvFilter, Layer, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Initializes tracing/logging infrastructure.
///
/// Writes through a non-blocking appender to `log_path`, or to stdout when no
/// log file is configured. The log level can be controlled via the `RUST_LOG`
/// environment variable, defaulting to INFO.
///
/// # Errors
///
/// Returns an error if the log file cannot be opened or created.
fn init_tracing(log_path: Option<&Path>) -> Result<WorkerGuard> {
    let (non_blocking, guard) = match log_path {
        Some(path) => {
            let file = fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("Failed to open the log file: {}", path.display()))?;
            tracing_appender::non_blocking(file)
        }
        None => tracing_appender::non_blocking(std::io::stdout()),
    };
    let env_filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::INFO.into())
        .from_env_lossy();
    let layer = fmt::Layer::default()
        .with_ansi(false)
        .with_target(false)
        .with_writer(non_blocking)
        .with_filter(env_filter);

    tracing_subscriber::Registry::default().with(layer).init();
    Ok(guard)
}

fn log_config_status(config: &Config) {
    tracing::info!("edgewayd started");
    tracing::info!("Service configuration directory: {}", config.config_dir.display());
    tracing::debug!(
        "Dial config: timeout_secs={}, max_backoff_delay_secs={}",
        config.dial.timeout_secs,
        config.dial.max_backoff_delay_secs
    );
    tracing::debug!(
        "Persist config: config_path={:?}, static_config_path={:?}, static_update_interval_min={}",
        config.persist.config_path,
        config.persist.static_config_path,
        config.persist.static_update_interval_min
    );
}

async fn connect(config: &Config, service: &str) -> Result<()> {
    let connector = CloudConnector::new(
        Arc::new(config.registry()),
        Arc::new(config.loader()),
        config.dial_settings(),
    );
    let channel = connector
        .connect(service)
        .await
        .with_context(|| format!("Failed to connect to {service}"))?;

    tracing::info!(
        "Channel to {} ready at {}",
        channel.authority(),
        channel.remote_addr()
    );
    println!("{}", channel.remote_addr());
    channel.close().await;
    Ok(())
}

fn save(config: &Config, blob: &Path, read_old: bool) -> Result<()> {
    let contents =
        fs::read(blob).with_context(|| format!("Failed to read {}", blob.display()))?;

    let persist = &config.persist;
    let mut writer = ConfigWriter::new(
        &persist.config_path,
        &persist.static_config_path,
        persist.static_update_interval_min,
    );
    let old = writer
        .save_config(&contents, read_old)
        .context("Failed to save gateway configuration")?;
    if read_old {
        tracing::info!("Replaced {} bytes of previous configuration", old.len());
    }

    match writer.maybe_update_static(&contents) {
        Ok(StaticUpdate::Written) => tracing::info!("Static configuration updated"),
        Ok(StaticUpdate::Skipped) => tracing::debug!("Static configuration is recent, skipped"),
        Ok(StaticUpdate::Disabled) => tracing::debug!("Static configuration updates disabled"),
        Err(e) => tracing::warn!("Failed to update static configuration: {e}"),
    }
    Ok(())
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    let config = match Config::load(&args.config) {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("Failed to load config from {}: {e}", args.config.display());
            process::exit(1);
        }
    };

    let guard = match init_tracing(config.log_path.as_deref()) {
        Ok(guard) => guard,
        Err(e) => {
            eprintln!("Failed to initialize tracing: {e}");
            process::exit(1);
        }
    };

    tracing::info!("Loaded config from: {:?}", args.config);
    log_config_status(&config);

    let result = match &args.command {
        Command::Connect { service } => connect(&config, service).await,
        Command::Save { blob, read_old } => save(&config, blob, *read_old),
    };
    if let Err(e) = result {
        tracing::error!("{e:#}");
        eprintln!("{e:#}");
        drop(guard);
        process::exit(1);
    }
}
