//! One measurement of one URL against the shared browser
//!
//! An attempt opens an isolated session, navigates to an early milestone,
//! lets the page settle and reads the performance timeline. Known transient
//! failures are recovered by an [`EscalationPolicy`], each recovery at most
//! once per attempt, so a single call never performs more than three
//! navigations.

use crate::{
    Config, EngineError, EngineSession, MeasureError, Metrics, NavigationFailure,
    PerformanceSample, Profile, SharedBrowser,
};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::time::{sleep, timeout};
use tracing::{debug, warn};

/// Statuses that usually mean bot filtering rather than a broken page.
const BLOCKING_STATUSES: &[u16] = &[403, 429];

/// Browser generations start at 1.
const NO_GENERATION: u64 = 0;

/// Bytes, request count and load duration of one page view.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MeasurementResult {
    pub bytes_transferred: f64,
    pub resource_count: u64,
    pub duration_seconds: f64,
}

impl MeasurementResult {
    /// Clamp the sample's duration to at least `min_duration_secs`.
    pub fn from_sample(sample: PerformanceSample, min_duration_secs: f64) -> Self {
        Self {
            bytes_transferred: sample.bytes_transferred.max(0.0),
            resource_count: sample.resource_count,
            duration_seconds: sample.duration_seconds.max(min_duration_secs),
        }
    }
}

/// Failure classes an attempt knows how to recover from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailureClass {
    /// The session or browser went away while the attempt was using it
    ClosedConcurrently,
    /// The navigation on the current profile looks filtered or tarpitted
    LikelyBlocked,
}

impl FailureClass {
    pub fn of(error: &MeasureError) -> Option<Self> {
        if error.is_closed_concurrently() {
            Some(FailureClass::ClosedConcurrently)
        } else if error.is_likely_blocked() {
            Some(FailureClass::LikelyBlocked)
        } else {
            None
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Recovery {
    /// Relaunch the browser and rerun the whole attempt
    RecreateBrowser,
    /// Rerun navigation and read under the fallback profile
    FallbackProfile,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EscalationRule {
    pub when: FailureClass,
    pub then: Recovery,
}

/// Ordered mapping from failure class to recovery action.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EscalationPolicy {
    rules: Vec<EscalationRule>,
}

impl EscalationPolicy {
    pub fn new(rules: Vec<EscalationRule>) -> Self {
        Self { rules }
    }

    /// Recreate the browser on a concurrent close, switch profile on blocking.
    pub fn standard() -> Self {
        Self::new(vec![
            EscalationRule {
                when: FailureClass::ClosedConcurrently,
                then: Recovery::RecreateBrowser,
            },
            EscalationRule {
                when: FailureClass::LikelyBlocked,
                then: Recovery::FallbackProfile,
            },
        ])
    }

    pub fn none() -> Self {
        Self::new(Vec::new())
    }

    pub fn recovery_for(&self, error: &MeasureError) -> Option<Recovery> {
        let class = FailureClass::of(error)?;
        self.rules
            .iter()
            .find(|rule| rule.when == class)
            .map(|rule| rule.then)
    }
}

impl Default for EscalationPolicy {
    fn default() -> Self {
        Self::standard()
    }
}

/// What to do with the shared browser before a try.
#[derive(Debug, Clone, Copy)]
enum Refresh {
    /// Recycle only if the current process reached its threshold
    IfDue,
    /// Replace the given generation, or whatever is current
    Replace(Option<u64>),
}

pub struct MeasurementAttempt {
    browser: SharedBrowser,
    config: Config,
    policy: EscalationPolicy,
    metrics: Arc<Metrics>,
}

impl MeasurementAttempt {
    pub fn new(
        browser: SharedBrowser,
        config: Config,
        policy: EscalationPolicy,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            browser,
            config,
            policy,
            metrics,
        }
    }

    /// Measure `url`, bounded by the configured attempt timeout.
    ///
    /// With `force_fresh_resource` the browser is relaunched first and a
    /// concurrent close is no longer recovered by another relaunch.
    pub async fn run(&self, url: &str, force_fresh_resource: bool) -> Result<MeasurementResult, MeasureError> {
        let generation = AtomicU64::new(NO_GENERATION);
        let attempt = self.run_escalating(url, force_fresh_resource, &generation);

        match timeout(self.config.attempt_timeout, attempt).await {
            Ok(result) => result,
            Err(_) => {
                warn!("Attempt for {} exceeded {:?}; browser looks wedged", url, self.config.attempt_timeout);
                match generation.load(Ordering::SeqCst) {
                    NO_GENERATION => self.browser.invalidate(),
                    used => self.browser.invalidate_generation(used),
                }
                Err(MeasureError::AttemptTimeout(self.config.attempt_timeout))
            }
        }
    }

    async fn run_escalating(
        &self,
        url: &str,
        force_fresh_resource: bool,
        generation: &AtomicU64,
    ) -> Result<MeasurementResult, MeasureError> {
        let mut refresh = if force_fresh_resource {
            Refresh::Replace(None)
        } else {
            Refresh::IfDue
        };
        let mut profile = self.config.primary_profile;
        let mut spent: Vec<Recovery> = Vec::new();
        if force_fresh_resource {
            spent.push(Recovery::RecreateBrowser);
        }

        loop {
            let error = match self.try_once(url, profile, refresh, generation).await {
                Ok(sample) => {
                    return Ok(MeasurementResult::from_sample(sample, self.config.min_duration_secs));
                }
                Err(error) => error,
            };

            let recovery = self
                .policy
                .recovery_for(&error)
                .filter(|recovery| !spent.contains(recovery))
                .filter(|recovery| self.applicable(*recovery, profile));

            match recovery {
                Some(Recovery::RecreateBrowser) => {
                    warn!("{} for {}; relaunching browser and retrying", error, url);
                    refresh = match generation.load(Ordering::SeqCst) {
                        NO_GENERATION => Refresh::Replace(None),
                        used => Refresh::Replace(Some(used)),
                    };
                }
                Some(Recovery::FallbackProfile) => {
                    let Some(fallback) = self.config.fallback_profile else {
                        return Err(self.give_up(url, error, generation));
                    };
                    warn!("{}; retrying with the {} profile", error, fallback);
                    profile = fallback;
                    refresh = Refresh::IfDue;
                }
                None => return Err(self.give_up(url, error, generation)),
            }

            if let Some(recovery) = recovery {
                spent.push(recovery);
                self.metrics.escalations.increment(1);
            }
        }
    }

    fn applicable(&self, recovery: Recovery, current: Profile) -> bool {
        match recovery {
            Recovery::RecreateBrowser => true,
            Recovery::FallbackProfile => self
                .config
                .fallback_profile
                .map_or(false, |fallback| fallback != current),
        }
    }

    fn give_up(&self, url: &str, error: MeasureError, generation: &AtomicU64) -> MeasureError {
        if error.poisons_browser() {
            match generation.load(Ordering::SeqCst) {
                NO_GENERATION => {}
                used => self.browser.invalidate_generation(used),
            }
        }
        debug!("Giving up on {}: {}", url, error);
        error.into_terminal()
    }

    /// One pass of session, navigation and read on whatever process is
    /// current. The generation it ran on is stored in `generation`.
    async fn try_once(
        &self,
        url: &str,
        profile: Profile,
        refresh: Refresh,
        generation: &AtomicU64,
    ) -> Result<PerformanceSample, MeasureError> {
        match refresh {
            Refresh::Replace(Some(used)) => self.browser.recreate_generation(used).await,
            Refresh::Replace(None) => self.browser.force_recreate().await,
            Refresh::IfDue => {
                if self.browser.recycle_if_due().await {
                    debug!("Recycled browser before measuring {}", url);
                }
            }
        }

        let lease = self.browser.acquire().await?;
        generation.store(lease.generation(), Ordering::SeqCst);

        let session = lease
            .process()
            .new_session(profile)
            .await
            .map_err(session_error)?;

        let mut guard = SessionGuard::new(session);
        let result = self.measure_in(&mut guard, url, profile).await;
        guard.release().await;

        if result.is_ok() {
            lease.record_success();
        }
        result
    }

    async fn measure_in(&self, guard: &mut SessionGuard, url: &str, profile: Profile) -> Result<PerformanceSample, MeasureError> {
        let session = guard.session()?;

        let outcome = session
            .navigate(url, self.config.navigation_wait, self.config.navigation_timeout)
            .await
            .map_err(|e| navigation_error(url, profile, e))?;

        if let Some(status) = outcome.status.filter(|s| BLOCKING_STATUSES.contains(s)) {
            return Err(MeasureError::LikelyBlocked {
                url: url.to_string(),
                profile,
                reason: NavigationFailure::HttpStatus(status),
            });
        }

        match session.wait_for_dom_ready(self.config.dom_ready_timeout).await {
            Ok(()) => {}
            Err(EngineError::TargetClosed(reason)) => {
                return Err(MeasureError::ResourceClosedConcurrently(reason))
            }
            Err(e) => debug!("DOM not ready for {}: {}", url, e),
        }

        sleep(self.config.settle_delay).await;

        match session.read_performance().await {
            Ok(sample) => Ok(sample),
            Err(EngineError::ContextDestroyed(reason)) => {
                debug!("{} navigated during read ({}); retrying once", url, reason);
                if let Err(e) = session.wait_for_dom_ready(self.config.renavigation_wait).await {
                    debug!("New document for {} not ready: {}", url, e);
                }
                session.read_performance().await.map_err(read_error)
            }
            Err(e) => Err(read_error(e)),
        }
    }
}

/// Owns a session for the length of one try and guarantees it is closed.
///
/// `release` closes it in place. If the try is cancelled first, `Drop` hands
/// the session to a background task to close.
struct SessionGuard {
    session: Option<Box<dyn EngineSession>>,
}

impl SessionGuard {
    fn new(session: Box<dyn EngineSession>) -> Self {
        Self {
            session: Some(session),
        }
    }

    fn session(&mut self) -> Result<&mut Box<dyn EngineSession>, MeasureError> {
        self.session
            .as_mut()
            .ok_or_else(|| MeasureError::Internal("session already released".to_string()))
    }

    async fn release(mut self) {
        if let Some(session) = self.session.take() {
            session.close().await;
        }
    }
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        if let Some(session) = self.session.take() {
            tokio::spawn(async move {
                session.close().await;
            });
        }
    }
}

fn session_error(error: EngineError) -> MeasureError {
    match error {
        EngineError::TargetClosed(reason) => MeasureError::ResourceClosedConcurrently(reason),
        EngineError::Launch(reason) => MeasureError::ResourceLaunchFailed(reason),
        other => MeasureError::SessionOpenFailed(other.to_string()),
    }
}

fn navigation_error(url: &str, profile: Profile, error: EngineError) -> MeasureError {
    let url = url.to_string();
    match error {
        EngineError::TargetClosed(reason) => MeasureError::ResourceClosedConcurrently(reason),
        EngineError::Timeout(after) => MeasureError::LikelyBlocked {
            url,
            profile,
            reason: NavigationFailure::Timeout(after),
        },
        EngineError::Blocked(reason) => MeasureError::LikelyBlocked {
            url,
            profile,
            reason: NavigationFailure::Network(reason),
        },
        EngineError::NoResponse => MeasureError::NavigationFailed {
            url,
            reason: NavigationFailure::NoResponse,
        },
        EngineError::Launch(reason) => MeasureError::ResourceLaunchFailed(reason),
        EngineError::ContextDestroyed(reason) | EngineError::Protocol(reason) => {
            MeasureError::NavigationFailed {
                url,
                reason: NavigationFailure::Network(reason),
            }
        }
    }
}

fn read_error(error: EngineError) -> MeasureError {
    match error {
        EngineError::TargetClosed(reason) => MeasureError::ResourceClosedConcurrently(reason),
        other => MeasureError::MeasurementReadFailed(other.to_string()),
    }
}
