//! Configuration management with serde serialization/deserialization
//!
//! Settings are layered: built-in defaults, then an optional JSON file, then
//! `FOOTPRINT_*` environment variables, then command-line flags.

use crate::{MeasureError, Profile, WaitCondition};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::time::Duration;

/// Main configuration structure for the footprint service
///
/// # Examples
///
/// ```rust
/// use page_footprint::Config;
/// use std::time::Duration;
///
/// let config = Config {
///     max_concurrent_measurements: 2,
///     cache_ttl: Duration::from_secs(60),
///     ..Default::default()
/// };
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct Config {
    /// Measurements allowed to drive the browser at once (default: 1)
    ///
    /// Every admitted measurement holds a session against the single shared
    /// browser for its whole run, so this is also the session limit.
    pub max_concurrent_measurements: usize,

    /// Time allowed for the navigation to reach `navigation_wait` (default: 15 seconds)
    pub navigation_timeout: Duration,

    /// Milestone a navigation waits for before the soft DOM wait (default: commit)
    pub navigation_wait: WaitCondition,

    /// Soft wait for `DOMContentLoaded` after the commit (default: 5 seconds)
    ///
    /// Not reaching it is logged and the measurement carries on.
    pub dom_ready_timeout: Duration,

    /// Pause before reading the performance timeline (default: 1.5 seconds)
    ///
    /// Lets trailing asynchronous requests register as resource entries.
    pub settle_delay: Duration,

    /// Wait for the new document when the page navigated away mid-read (default: 2 seconds)
    pub renavigation_wait: Duration,

    /// Upper bound on one measurement attempt including its retries (default: 40 seconds)
    pub attempt_timeout: Duration,

    /// Upper bound a caller waits for a result (default: 45 seconds)
    pub request_timeout: Duration,

    /// How long a successful result is served from cache (default: 5 minutes)
    pub cache_ttl: Duration,

    /// Relaunch the browser after this many successful attempts (default: 50)
    pub recycle_after: usize,

    /// Floor applied to measured load durations, in seconds (default: 1.0)
    pub min_duration_secs: f64,

    /// Profile used for the first navigation (default: desktop)
    pub primary_profile: Profile,

    /// Profile retried once when the primary looks blocked (default: mobile)
    pub fallback_profile: Option<Profile>,

    /// Also block images at the network layer (default: false)
    ///
    /// Fonts and media are always blocked.
    pub block_images: bool,

    /// Path to Chrome/Chromium executable (default: auto-detect)
    pub chrome_path: Option<String>,

    /// Memory limit passed to the renderer's JS heap in bytes (default: 512MB)
    pub memory_limit: Option<usize>,

    /// Coefficients for the energy and CO2 estimate
    pub energy: EnergyModelConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_concurrent_measurements: 1,
            navigation_timeout: Duration::from_secs(15),
            navigation_wait: WaitCondition::Commit,
            dom_ready_timeout: Duration::from_secs(5),
            settle_delay: Duration::from_millis(1500),
            renavigation_wait: Duration::from_secs(2),
            attempt_timeout: Duration::from_secs(40),
            request_timeout: Duration::from_secs(45),
            cache_ttl: Duration::from_secs(300),
            recycle_after: 50,
            min_duration_secs: 1.0,
            primary_profile: Profile::Desktop,
            fallback_profile: Some(Profile::Mobile),
            block_images: false,
            chrome_path: None,
            memory_limit: Some(512 * 1024 * 1024),
            energy: EnergyModelConfig::default(),
        }
    }
}

/// Browser viewport used to emulate a device
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct Viewport {
    /// Viewport width in pixels (default: 1920)
    pub width: u32,

    /// Viewport height in pixels (default: 1080)
    pub height: u32,

    /// Device pixel ratio (default: 1.0)
    pub device_scale_factor: f64,

    /// Whether to emulate a mobile device (default: false)
    pub mobile: bool,
}

impl Default for Viewport {
    fn default() -> Self {
        Self {
            width: 1920,
            height: 1080,
            device_scale_factor: 1.0,
            mobile: false,
        }
    }
}

/// Coefficients of the downstream energy model
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct EnergyModelConfig {
    /// Network and data-centre energy per transferred gigabyte (default: 0.81 kWh/GB)
    pub kwh_per_gb: f64,

    /// Average client device draw while the page loads (default: 20 W)
    pub device_watts: f64,

    /// Grid carbon intensity (default: 442 gCO2e/kWh)
    pub grid_intensity_g_per_kwh: f64,
}

impl Default for EnergyModelConfig {
    fn default() -> Self {
        Self {
            kwh_per_gb: 0.81,
            device_watts: 20.0,
            grid_intensity_g_per_kwh: 442.0,
        }
    }
}

impl Config {
    /// Load a JSON configuration file. Missing fields take their defaults.
    pub fn from_file(path: &std::path::Path) -> Result<Self, MeasureError> {
        let content = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&content)?)
    }

    /// Apply `FOOTPRINT_*` and `CHROME_PATH` overrides from the process environment.
    pub fn apply_env(&mut self) -> Result<(), MeasureError> {
        self.apply_overrides(|name| std::env::var(name).ok())
    }

    /// Apply overrides read through `lookup`, which maps a variable name to its value.
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<(), MeasureError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(ms) = parse_var::<u64, _>(&lookup, "FOOTPRINT_NAVIGATION_TIMEOUT_MS")? {
            self.navigation_timeout = Duration::from_millis(ms);
        }
        if let Some(wait) = parse_var::<WaitCondition, _>(&lookup, "FOOTPRINT_NAVIGATION_WAIT")? {
            self.navigation_wait = wait;
        }
        if let Some(ms) = parse_var::<u64, _>(&lookup, "FOOTPRINT_DOM_READY_TIMEOUT_MS")? {
            self.dom_ready_timeout = Duration::from_millis(ms);
        }
        if let Some(ms) = parse_var::<u64, _>(&lookup, "FOOTPRINT_SETTLE_DELAY_MS")? {
            self.settle_delay = Duration::from_millis(ms);
        }
        if let Some(ms) = parse_var::<u64, _>(&lookup, "FOOTPRINT_ATTEMPT_TIMEOUT_MS")? {
            self.attempt_timeout = Duration::from_millis(ms);
        }
        if let Some(ms) = parse_var::<u64, _>(&lookup, "FOOTPRINT_REQUEST_TIMEOUT_MS")? {
            self.request_timeout = Duration::from_millis(ms);
        }
        if let Some(secs) = parse_var::<u64, _>(&lookup, "FOOTPRINT_CACHE_TTL_SECS")? {
            self.cache_ttl = Duration::from_secs(secs);
        }
        if let Some(count) = parse_var::<usize, _>(&lookup, "FOOTPRINT_RECYCLE_AFTER")? {
            self.recycle_after = count;
        }
        if let Some(count) = parse_var::<usize, _>(&lookup, "FOOTPRINT_MAX_CONCURRENT")? {
            self.max_concurrent_measurements = count;
        }
        if let Some(flag) = parse_var::<u8, _>(&lookup, "FOOTPRINT_BLOCK_IMAGES")? {
            self.block_images = flag != 0;
        }
        if let Some(path) = lookup("CHROME_PATH").filter(|p| !p.trim().is_empty()) {
            self.chrome_path = Some(path);
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), MeasureError> {
        let invalid = |msg: &str| Err(MeasureError::ConfigurationError(msg.to_string()));

        if self.max_concurrent_measurements == 0 {
            return invalid("max_concurrent_measurements must be greater than 0");
        }
        if self.navigation_timeout.is_zero()
            || self.attempt_timeout.is_zero()
            || self.request_timeout.is_zero()
        {
            return invalid("timeouts must be greater than 0");
        }
        if self.cache_ttl.is_zero() {
            return invalid("cache_ttl must be greater than 0");
        }
        if self.recycle_after == 0 {
            return invalid("recycle_after must be greater than 0");
        }
        if !self.min_duration_secs.is_finite() || self.min_duration_secs <= 0.0 {
            return invalid("min_duration_secs must be a positive number");
        }
        if self.fallback_profile == Some(self.primary_profile) {
            return invalid("fallback_profile must differ from primary_profile");
        }
        Ok(())
    }
}

fn parse_var<T, F>(lookup: &F, name: &str) -> Result<Option<T>, MeasureError>
where
    T: FromStr,
    F: Fn(&str) -> Option<String>,
{
    match lookup(name) {
        Some(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|_| MeasureError::ConfigurationError(format!("{name} has invalid value {raw:?}"))),
        _ => Ok(None),
    }
}
