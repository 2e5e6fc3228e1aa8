//! Request orchestration for footprint measurements
//!
//! This module provides the primary `FootprintService`, which ties URL
//! admission, the single-flight cache, the admission queue, the measurement
//! attempt and the shared browser together behind one `measure` call.

use crate::{
    normalise_url, AdmissionQueue, BrowserEngine, BrowserState, ChromiumEngine, Config,
    EnergyModel, EscalationPolicy, FootprintReport, MeasureError, MeasurementAttempt,
    MeasurementResult, Metrics, QueueStats, SharedBrowser, SingleFlightCache, WorkerStats,
};
use futures::future::join_all;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{sleep, timeout, Instant};
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;

const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Footprint measurement service over one shared headless browser
///
/// Concurrent requests for the same URL share one measurement, results are
/// cached for the configured TTL and at most
/// `max_concurrent_measurements` measurements drive the browser at once.
///
/// # Examples
///
/// ```rust,no_run
/// use page_footprint::{Config, FootprintService};
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let service = FootprintService::new(Config::default()).await?;
///
///     let report = service.measure_report("https://example.com").await?;
///     println!("{:.2} MB, {:.3} g CO2", report.page_bytes_mb, report.co2_grams);
///
///     service.shutdown().await;
///     Ok(())
/// }
/// ```
pub struct FootprintService {
    config: Config,
    browser: SharedBrowser,
    attempt: Arc<MeasurementAttempt>,
    cache: SingleFlightCache<MeasurementResult>,
    queue: Arc<AdmissionQueue>,
    metrics: Arc<Metrics>,
    energy: EnergyModel,
}

#[derive(Debug, Clone, Serialize)]
pub struct ServiceStats {
    pub queue: QueueStats,
    pub browser_state: BrowserState,
    pub browser_launches: usize,
    pub served_since_launch: usize,
    pub cache_entries: usize,
    pub in_flight: usize,
    pub processed: usize,
    pub errors: usize,
    pub workers: Vec<WorkerStats>,
}

impl FootprintService {
    /// Build a service backed by a locally launched Chromium.
    ///
    /// The browser itself is started lazily by the first measurement.
    pub async fn new(config: Config) -> Result<Self, MeasureError> {
        let engine = Arc::new(ChromiumEngine::new(config.clone()));
        Self::with_engine(config, engine)
    }

    /// Build a service over any engine. Must be called inside a Tokio runtime.
    pub fn with_engine(config: Config, engine: Arc<dyn BrowserEngine>) -> Result<Self, MeasureError> {
        config.validate()?;

        let metrics = Arc::new(Metrics::new());
        let browser = SharedBrowser::new(engine, config.recycle_after, metrics.clone());
        let attempt = Arc::new(MeasurementAttempt::new(
            browser.clone(),
            config.clone(),
            EscalationPolicy::standard(),
            metrics.clone(),
        ));
        let cache = SingleFlightCache::new(config.cache_ttl, metrics.clone());
        let queue = Arc::new(AdmissionQueue::new(
            config.max_concurrent_measurements,
            metrics.clone(),
        ));

        info!(
            "Footprint service ready: {} concurrent measurement(s), cache TTL {:?}",
            config.max_concurrent_measurements, config.cache_ttl
        );

        Ok(Self {
            energy: EnergyModel::new(&config.energy),
            config,
            browser,
            attempt,
            cache,
            queue,
            metrics,
        })
    }

    /// Measure `url`, sharing work with concurrent callers and serving fresh
    /// cached results.
    ///
    /// The caller waits at most `request_timeout`. A measurement still running
    /// when that fires keeps going and populates the cache.
    pub async fn measure(&self, url: &str) -> Result<MeasurementResult, MeasureError> {
        let request_id = Uuid::new_v4();
        let span = info_span!("measure", %request_id, url = %url);

        async {
            if self.queue.is_closed() {
                return Err(MeasureError::ShuttingDown);
            }
            let key = normalise_url(url)?;
            let started = Instant::now();

            let result = match timeout(self.config.request_timeout, self.measure_key(key)).await {
                Ok(result) => result,
                Err(_) => {
                    self.handle_global_timeout();
                    Err(MeasureError::GlobalTimeout(self.config.request_timeout))
                }
            };

            self.metrics.record_measurement(started.elapsed(), result.is_ok());
            match &result {
                Ok(measurement) => info!(
                    "Measured {} bytes over {} requests in {:.2}s",
                    measurement.bytes_transferred,
                    measurement.resource_count,
                    measurement.duration_seconds
                ),
                Err(e) => warn!("Measurement failed ({}): {}", e.kind(), e),
            }
            result
        }
        .instrument(span)
        .await
    }

    async fn measure_key(&self, key: String) -> Result<MeasurementResult, MeasureError> {
        let attempt = self.attempt.clone();
        let queue = self.queue.clone();
        let url = key.clone();

        self.cache
            .get_or_compute(&key, move || async move {
                queue
                    .submit(move || async move { attempt.run(&url, false).await })
                    .await
            })
            .await
    }

    /// The caller gave up. A measurement that has held its slot for the
    /// caller's entire wait looks hung, so later requests get a fresh browser.
    /// The hung measurement keeps its lease on the old process until it ends.
    fn handle_global_timeout(&self) {
        self.metrics.global_timeouts.increment(1);

        let hung = self
            .queue
            .longest_running()
            .map_or(false, |held| held >= self.config.request_timeout);
        if hung {
            warn!(
                "A measurement has run for the whole {:?} request window; invalidating browser",
                self.config.request_timeout
            );
            self.browser.invalidate();
        } else {
            warn!(
                "Request timed out after {:?}; measurement continues in the background",
                self.config.request_timeout
            );
        }
    }

    pub async fn measure_report(&self, url: &str) -> Result<FootprintReport, MeasureError> {
        let result = self.measure(url).await?;
        Ok(FootprintReport::from_measurement(url, &result, &self.energy))
    }

    /// Measure every URL concurrently through the shared cache and queue.
    pub async fn measure_many(
        &self,
        urls: Vec<String>,
    ) -> Vec<(String, Result<FootprintReport, MeasureError>)> {
        let tasks = urls.into_iter().map(|url| async move {
            let report = self.measure_report(&url).await;
            (url, report)
        });
        join_all(tasks).await
    }

    pub fn stats(&self) -> ServiceStats {
        ServiceStats {
            queue: self.queue.stats(),
            browser_state: self.browser.state(),
            browser_launches: self.browser.launch_count(),
            served_since_launch: self.browser.served_count(),
            cache_entries: self.cache.len(),
            in_flight: self.cache.in_flight_len(),
            processed: self.queue.total_processed(),
            errors: self.queue.total_errors(),
            workers: self.queue.get_worker_stats(),
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn browser(&self) -> &SharedBrowser {
        &self.browser
    }

    pub fn cache(&self) -> &SingleFlightCache<MeasurementResult> {
        &self.cache
    }

    pub fn metrics(&self) -> Arc<Metrics> {
        self.metrics.clone()
    }

    /// Stop admitting work, give running measurements a moment and close the browser.
    pub async fn shutdown(&self) {
        info!("Shutting down footprint service...");
        self.queue.close();

        let deadline = Instant::now() + SHUTDOWN_GRACE;
        while self.queue.stats().running > 0 && Instant::now() < deadline {
            sleep(Duration::from_millis(50)).await;
        }
        if self.queue.stats().running > 0 {
            warn!("Closing browser with measurements still running");
        }

        self.browser.shutdown().await;
        info!("Footprint service shutdown complete");
    }
}
