//! # Page Footprint
//!
//! Estimates the environmental footprint of a web page (bytes transferred,
//! request count, load duration and the derived energy and CO2 figures) by
//! loading it in one shared headless Chrome and reading the performance
//! timeline.
//!
//! The service is built for small hosts: a bounded number of measurements
//! drive the browser at once, repeat requests inside the cache window never
//! reach the browser, and the browser process is relaunched after crashes,
//! wedged measurements or a configurable number of page loads.
//!
//! ## Pipeline
//!
//! | Stage | Type | Role |
//! |-------|------|------|
//! | Admission | [`normalise_url`] | Rejects non-HTTP and private targets, builds the cache key |
//! | Dedup cache | [`SingleFlightCache`] | One computation per key, results cached for the TTL |
//! | Admission queue | [`AdmissionQueue`] | FIFO, at most N measurements at once |
//! | Attempt | [`MeasurementAttempt`] | Navigate, settle, read; recovers known transient failures once each |
//! | Browser | [`SharedBrowser`] | Lazily launched, recycled and relaunched single process |
//! | Report | [`FootprintReport`] | Energy and CO2 estimate from the measurement |
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use page_footprint::{Config, FootprintService};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let service = FootprintService::new(Config::default()).await?;
//!
//!     let report = service.measure_report("https://example.com").await?;
//!     println!("{:.2} MB in {} requests", report.page_bytes_mb, report.request_count);
//!
//!     service.shutdown().await;
//!     Ok(())
//! }
//! ```
//!
//! ## CLI Usage
//!
//! ```bash
//! page-footprint measure --url https://example.com --json
//! page-footprint batch --input urls.txt --max-concurrent 2
//! page-footprint validate footprint.json
//! ```

/// Configuration and settings for the service
pub mod config;

/// Error types and error handling utilities
pub mod error;

/// Browser engine contract used by the measurement core
pub mod engine;

/// Chromium implementation of the engine contract
pub mod chromium;

/// Lifecycle of the single shared browser process
pub mod browser_handle;

/// One measurement with its recovery policy
pub mod attempt;

/// Single-flight result cache
pub mod cache;

/// Bounded FIFO admission workers
pub mod worker;

/// Main service orchestrating the measurement pipeline
pub mod footprint_service;

/// Energy and CO2 report
pub mod report;

/// Command-line interface implementation
pub mod cli;

/// Metrics handles and the Prometheus exporter
pub mod telemetry;

/// Health checking for the queue, browser and process
pub mod health;

/// Utility functions and helpers
pub mod utils;

#[cfg(test)]
mod tests;

pub use attempt::*;
pub use browser_handle::*;
pub use cache::*;
pub use chromium::*;
pub use cli::*;
pub use config::*;
pub use engine::*;
pub use error::*;
pub use footprint_service::*;
pub use health::*;
pub use report::*;
pub use telemetry::*;
pub use utils::*;
pub use worker::*;
