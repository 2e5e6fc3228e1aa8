use crate::{process_memory_bytes, BrowserState, FootprintService, QueueStats};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::time::interval;
use tracing::{error, info, warn};

#[derive(Debug, Clone)]
pub struct HealthThresholds {
    pub queue_warning: usize,
    pub queue_critical: usize,
    pub max_memory_usage: usize,
}

impl Default for HealthThresholds {
    fn default() -> Self {
        Self {
            queue_warning: 10,
            queue_critical: 50,
            max_memory_usage: 1024 * 1024 * 1024, // 1GB
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthLevel {
    Healthy,
    Warning,
    Critical,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthStatus {
    pub overall: HealthLevel,
    pub queue: HealthLevel,
    pub browser: HealthLevel,
    pub resources: HealthLevel,
    pub timestamp: DateTime<Utc>,
}

pub struct HealthChecker {
    thresholds: HealthThresholds,
}

impl HealthChecker {
    pub fn new(thresholds: HealthThresholds) -> Self {
        Self { thresholds }
    }

    pub fn check(&self, service: &FootprintService) -> HealthStatus {
        let start_time = Instant::now();
        let stats = service.stats();

        let queue = self.queue_health(&stats.queue);
        let browser = self.browser_health(stats.browser_state);
        let resources = self.resource_health(process_memory_bytes());
        let overall = determine_overall_health(&[queue, browser, resources]);

        info!(
            "Health check completed in {:?}: {:?}",
            start_time.elapsed(),
            overall
        );

        HealthStatus {
            overall,
            queue,
            browser,
            resources,
            timestamp: Utc::now(),
        }
    }

    pub fn queue_health(&self, stats: &QueueStats) -> HealthLevel {
        if stats.waiting > self.thresholds.queue_critical {
            error!("Queue health critical: {} measurements waiting", stats.waiting);
            HealthLevel::Critical
        } else if stats.waiting > self.thresholds.queue_warning {
            warn!("Queue health warning: {} measurements waiting", stats.waiting);
            HealthLevel::Warning
        } else {
            HealthLevel::Healthy
        }
    }

    pub fn browser_health(&self, state: BrowserState) -> HealthLevel {
        match state {
            BrowserState::Unstarted | BrowserState::Launching | BrowserState::Ready => {
                HealthLevel::Healthy
            }
            BrowserState::Disconnected | BrowserState::ShutDown => {
                warn!("Browser health warning: {:?}", state);
                HealthLevel::Warning
            }
        }
    }

    pub fn resource_health(&self, memory_usage: Option<usize>) -> HealthLevel {
        let Some(memory_usage) = memory_usage else {
            return HealthLevel::Healthy;
        };

        if memory_usage > self.thresholds.max_memory_usage {
            error!(
                "Resource health critical: memory usage {} MB",
                memory_usage / 1024 / 1024
            );
            HealthLevel::Critical
        } else if memory_usage > self.thresholds.max_memory_usage * 8 / 10 {
            warn!(
                "Resource health warning: memory usage {} MB",
                memory_usage / 1024 / 1024
            );
            HealthLevel::Warning
        } else {
            HealthLevel::Healthy
        }
    }
}

impl Default for HealthChecker {
    fn default() -> Self {
        Self::new(HealthThresholds::default())
    }
}

fn determine_overall_health(levels: &[HealthLevel]) -> HealthLevel {
    if levels.contains(&HealthLevel::Critical) {
        HealthLevel::Critical
    } else if levels.contains(&HealthLevel::Warning) {
        HealthLevel::Warning
    } else {
        HealthLevel::Healthy
    }
}

/// Periodically checks a running service and logs an alert for each
/// component in trouble.
pub struct HealthMonitor {
    service: Arc<FootprintService>,
    checker: HealthChecker,
}

impl HealthMonitor {
    pub fn new(service: Arc<FootprintService>) -> Self {
        Self {
            service,
            checker: HealthChecker::default(),
        }
    }

    pub async fn start_monitoring(&self, period: Duration) {
        let mut interval_timer = interval(period);

        loop {
            interval_timer.tick().await;
            self.check_once();
        }
    }

    pub fn check_once(&self) -> HealthStatus {
        let status = self.checker.check(&self.service);

        match status.overall {
            HealthLevel::Healthy => info!("System health: OK"),
            HealthLevel::Warning => warn!(
                "System health: WARNING - Queue: {:?}, Browser: {:?}, Resources: {:?}",
                status.queue, status.browser, status.resources
            ),
            HealthLevel::Critical => error!(
                "System health: CRITICAL - Queue: {:?}, Browser: {:?}, Resources: {:?}",
                status.queue, status.browser, status.resources
            ),
        }

        for alert in alerts_for(&status) {
            error!("Health Alert [{}]: {}", alert, alert.message());
        }
        status
    }
}

fn alerts_for(status: &HealthStatus) -> Vec<AlertType> {
    let mut alerts = Vec::new();
    if status.queue == HealthLevel::Critical {
        alerts.push(AlertType::QueueBacklog);
    }
    if status.browser != HealthLevel::Healthy {
        alerts.push(AlertType::BrowserUnavailable);
    }
    if status.resources == HealthLevel::Critical {
        alerts.push(AlertType::ResourceExhaustion);
    }
    alerts
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum AlertType {
    QueueBacklog,
    BrowserUnavailable,
    ResourceExhaustion,
}

impl AlertType {
    pub fn message(&self) -> &'static str {
        match self {
            AlertType::QueueBacklog => "Admission queue backlog is critical",
            AlertType::BrowserUnavailable => "Shared browser is not connected",
            AlertType::ResourceExhaustion => "Memory usage is critical",
        }
    }
}

impl std::fmt::Display for AlertType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AlertType::QueueBacklog => write!(f, "QUEUE_BACKLOG"),
            AlertType::BrowserUnavailable => write!(f, "BROWSER_UNAVAILABLE"),
            AlertType::ResourceExhaustion => write!(f, "RESOURCE_EXHAUSTION"),
        }
    }
}
