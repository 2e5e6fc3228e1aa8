use crate::{
    format_duration, parse_url_list, Config, FootprintReport, FootprintService, HealthChecker,
    ProgressTracker,
};
use anyhow::Context;
use clap::{Parser, Subcommand};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::fs;
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "page-footprint")]
#[command(about = "Measure the transfer size and carbon footprint of web pages")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    #[arg(long, global = true, help = "Configuration file path")]
    pub config: Option<PathBuf>,

    #[arg(long, global = true, help = "Measurements allowed to run at once")]
    pub max_concurrent: Option<usize>,

    #[arg(long, global = true, help = "Per-request timeout in seconds")]
    pub timeout: Option<u64>,

    #[arg(long, global = true, help = "Enable verbose logging")]
    pub verbose: bool,

    #[arg(long, global = true, help = "Chrome executable path")]
    pub chrome_path: Option<String>,

    #[arg(long, global = true, help = "Serve Prometheus metrics on this port")]
    pub metrics_port: Option<u16>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Measure a single URL
    Measure {
        #[arg(short, long, help = "URL to measure")]
        url: String,

        #[arg(long, help = "Print the report as JSON")]
        json: bool,
    },

    /// Measure every URL in a file (one per line)
    Batch {
        #[arg(short, long, help = "Input file containing URLs (one per line)")]
        input: PathBuf,

        #[arg(long, help = "Progress reporting interval in seconds")]
        progress_interval: Option<u64>,
    },

    /// Show service statistics and health
    Stats,

    /// Validate configuration (the given file, or the one passed with --config)
    Validate {
        #[arg(value_name = "FILE", help = "Configuration file to validate")]
        file: Option<PathBuf>,
    },
}

/// One line of `batch` output.
#[derive(Debug, Serialize)]
#[serde(untagged)]
pub enum BatchLine {
    Measured(FootprintReport),
    Failed { url: String, error: String, kind: String },
}

/// Apply command-line flags on top of file and environment settings.
pub fn apply_cli_overrides(config: &mut Config, args: &Cli) {
    if let Some(max_concurrent) = args.max_concurrent {
        config.max_concurrent_measurements = max_concurrent;
    }
    if let Some(timeout) = args.timeout {
        config.request_timeout = Duration::from_secs(timeout);
    }
    if let Some(chrome_path) = &args.chrome_path {
        config.chrome_path = Some(chrome_path.clone());
    }
}

pub struct CliRunner {
    pub config: Config,
    pub service: Arc<FootprintService>,
}

impl CliRunner {
    pub async fn new(config: Config) -> anyhow::Result<Self> {
        let service = Arc::new(FootprintService::new(config.clone()).await?);
        Ok(Self { config, service })
    }

    pub async fn run(&self, command: Commands) -> anyhow::Result<()> {
        match command {
            Commands::Measure { url, json } => self.run_measure(&url, json).await,
            Commands::Batch {
                input,
                progress_interval,
            } => self.run_batch(&input, progress_interval).await,
            Commands::Stats => self.show_stats().await,
            Commands::Validate { file } => match file {
                Some(path) => validate_config_file(&path),
                None => describe_valid_config(&self.config),
            },
        }
    }

    pub async fn run_measure(&self, url: &str, json: bool) -> anyhow::Result<()> {
        info!("Measuring: {}", url);
        let report = self.service.measure_report(url).await?;

        if json {
            println!("{}", serde_json::to_string_pretty(&report)?);
        } else {
            println!("Footprint of {}:", report.url);
            println!("  Transferred: {:.3} MB", report.page_bytes_mb);
            println!("  Requests: {}", report.request_count);
            println!(
                "  Load time: {}",
                format_duration(Duration::from_secs_f64(report.duration_seconds))
            );
            println!("  Energy: {:.4} Wh", report.energy_wh);
            println!("  CO2: {:.4} g", report.co2_grams);
        }

        Ok(())
    }

    pub async fn run_batch(&self, input: &Path, progress_interval: Option<u64>) -> anyhow::Result<()> {
        let content = fs::read_to_string(input)
            .await
            .with_context(|| format!("reading {}", input.display()))?;
        let urls = parse_url_list(&content);
        info!("Loaded {} URLs from {}", urls.len(), input.display());

        let progress_tracker = Arc::new(ProgressTracker::new(urls.len()));

        if let Some(interval) = progress_interval {
            let tracker = progress_tracker.clone();
            tokio::spawn(async move {
                let mut interval = tokio::time::interval(Duration::from_secs(interval.max(1)));

                while !tracker.is_complete() {
                    interval.tick().await;
                    let progress = tracker.get_progress();

                    eprintln!(
                        "Progress: {}/{} - Success: {}, Errors: {}, Rate: {:.2}/s, ETA: {:?}",
                        progress.completed,
                        progress.total,
                        progress.success,
                        progress.errors,
                        progress.rate,
                        progress.eta
                    );
                }
            });
        }

        let results = self.service.measure_many(urls).await;

        let mut success_count = 0;
        let mut error_count = 0;
        for (url, result) in results {
            progress_tracker.record_completion(result.is_ok());
            let line = match result {
                Ok(report) => {
                    success_count += 1;
                    BatchLine::Measured(report)
                }
                Err(e) => {
                    error_count += 1;
                    warn!("Failed to measure {}: {}", url, e);
                    BatchLine::Failed {
                        url,
                        kind: e.kind().to_string(),
                        error: e.to_string(),
                    }
                }
            };
            println!("{}", serde_json::to_string(&line)?);
        }

        info!(
            "Batch completed. Success: {}, Errors: {}",
            success_count, error_count
        );
        Ok(())
    }

    pub async fn show_stats(&self) -> anyhow::Result<()> {
        let stats = self.service.stats();
        let health = HealthChecker::default().check(&self.service);

        println!("{}", serde_json::to_string_pretty(&stats)?);
        println!("{}", serde_json::to_string_pretty(&health)?);
        Ok(())
    }
}

pub fn validate_config_file(config_path: &Path) -> anyhow::Result<()> {
    println!("Validating configuration: {}", config_path.display());

    let mut config = Config::from_file(config_path)?;
    config.apply_env()?;
    describe_valid_config(&config)
}

fn describe_valid_config(config: &Config) -> anyhow::Result<()> {
    config.validate()?;

    println!("Configuration is valid:");
    println!("  Max concurrent: {}", config.max_concurrent_measurements);
    println!("  Request timeout: {:?}", config.request_timeout);
    println!("  Attempt timeout: {:?}", config.attempt_timeout);
    println!("  Navigation wait: {:?}", config.navigation_wait);
    println!("  Cache TTL: {:?}", config.cache_ttl);
    println!("  Recycle after: {} measurements", config.recycle_after);
    println!(
        "  Profiles: {} (fallback: {})",
        config.primary_profile,
        config
            .fallback_profile
            .map(|p| p.to_string())
            .unwrap_or_else(|| "none".to_string())
    );

    Ok(())
}

pub fn setup_logging(verbose: bool) -> anyhow::Result<()> {
    let level = if verbose {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };

    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_target(false)
        .with_writer(std::io::stderr)
        .try_init()
        .map_err(|e| anyhow::anyhow!(e.to_string()))?;

    Ok(())
}
