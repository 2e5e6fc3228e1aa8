use metrics::{register_counter, register_gauge, register_histogram, Counter, Gauge, Histogram};
use std::net::SocketAddr;
use std::time::Duration;
use tracing::info;

/// Handles for every metric the service records.
///
/// Handles are resolved against the recorder installed at construction time;
/// without a recorder they are no-ops.
pub struct Metrics {
    pub measurements_succeeded: Counter,
    pub measurements_failed: Counter,
    pub measurement_duration: Histogram,
    pub cache_hits: Counter,
    pub dedup_joins: Counter,
    pub browser_launches: Counter,
    pub browser_recycles: Counter,
    pub browser_invalidations: Counter,
    pub escalations: Counter,
    pub global_timeouts: Counter,
    pub queue_waiting: Gauge,
    pub queue_running: Gauge,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            measurements_succeeded: register_counter!("footprint_measurements_succeeded_total"),
            measurements_failed: register_counter!("footprint_measurements_failed_total"),
            measurement_duration: register_histogram!("footprint_measurement_seconds"),
            cache_hits: register_counter!("footprint_cache_hits_total"),
            dedup_joins: register_counter!("footprint_dedup_joins_total"),
            browser_launches: register_counter!("footprint_browser_launches_total"),
            browser_recycles: register_counter!("footprint_browser_recycles_total"),
            browser_invalidations: register_counter!("footprint_browser_invalidations_total"),
            escalations: register_counter!("footprint_escalations_total"),
            global_timeouts: register_counter!("footprint_global_timeouts_total"),
            queue_waiting: register_gauge!("footprint_queue_waiting"),
            queue_running: register_gauge!("footprint_queue_running"),
        }
    }

    pub fn record_measurement(&self, duration: Duration, success: bool) {
        if success {
            self.measurements_succeeded.increment(1);
        } else {
            self.measurements_failed.increment(1);
        }

        self.measurement_duration.record(duration.as_secs_f64());
    }

    pub fn set_queue(&self, waiting: usize, running: usize) {
        self.queue_waiting.set(waiting as f64);
        self.queue_running.set(running as f64);
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Serves the Prometheus scrape endpoint.
///
/// Must be started before the service is built so metric handles bind to the
/// Prometheus recorder.
pub struct PrometheusExporter {
    addr: SocketAddr,
}

impl PrometheusExporter {
    pub fn new(port: u16) -> Self {
        Self {
            addr: SocketAddr::from(([0, 0, 0, 0], port)),
        }
    }

    pub fn start(&self) -> anyhow::Result<()> {
        metrics_exporter_prometheus::PrometheusBuilder::new()
            .with_http_listener(self.addr)
            .install()?;

        info!("Prometheus metrics listening on {}", self.addr);
        Ok(())
    }
}
