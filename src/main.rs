use anyhow::Context;
use clap::Parser;
use page_footprint::{
    apply_cli_overrides, setup_logging, Cli, CliRunner, Config, HealthMonitor, PrometheusExporter,
};
use std::time::Duration;
use tracing::{error, info, warn};

const HEALTH_INTERVAL: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Cli::parse();

    setup_logging(args.verbose)?;

    info!("Starting page-footprint v{}", env!("CARGO_PKG_VERSION"));

    let config = load_config(&args)?;

    // Handles bind to whichever recorder is installed when the service is built
    if let Some(port) = args.metrics_port {
        PrometheusExporter::new(port).start()?;
    }

    let cli_runner = CliRunner::new(config).await?;

    let monitor_service = cli_runner.service.clone();
    let monitor = tokio::spawn(async move {
        HealthMonitor::new(monitor_service)
            .start_monitoring(HEALTH_INTERVAL)
            .await;
    });

    let result = tokio::select! {
        result = cli_runner.run(args.command) => {
            info!("Application completed");
            result
        }
        _ = wait_for_shutdown_signal() => {
            info!("Received shutdown signal");
            Ok(())
        }
    };

    info!("Shutting down...");
    monitor.abort();
    cli_runner.service.shutdown().await;

    if let Err(e) = result {
        error!("Application error: {:#}", e);
        std::process::exit(1);
    }

    info!("page-footprint stopped");
    Ok(())
}

/// Defaults, then the `--config` file, then environment, then flags.
fn load_config(args: &Cli) -> anyhow::Result<Config> {
    let mut config = match &args.config {
        Some(path) => Config::from_file(path)
            .with_context(|| format!("loading configuration from {}", path.display()))?,
        None => Config::default(),
    };

    config.apply_env().context("reading environment overrides")?;
    apply_cli_overrides(&mut config, args);
    config.validate()?;

    info!("Configuration loaded successfully");
    info!("Max concurrent measurements: {}", config.max_concurrent_measurements);
    info!("Request timeout: {:?}", config.request_timeout);
    info!("Cache TTL: {:?}", config.cache_ttl);

    Ok(config)
}

#[cfg(unix)]
async fn wait_for_shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    match (signal(SignalKind::interrupt()), signal(SignalKind::terminate())) {
        (Ok(mut sigint), Ok(mut sigterm)) => {
            tokio::select! {
                _ = sigint.recv() => info!("Received SIGINT"),
                _ = sigterm.recv() => info!("Received SIGTERM"),
            }
        }
        _ => {
            warn!("Could not install signal handlers; falling back to Ctrl-C");
            let _ = tokio::signal::ctrl_c().await;
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
