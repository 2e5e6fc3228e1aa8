//! Energy and carbon estimate derived from a measurement

use crate::{EnergyModelConfig, MeasurementResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

const BYTES_PER_MB: f64 = 1_048_576.0;
const BYTES_PER_GB: f64 = 1_073_741_824.0;

/// Fixed coefficients turning bytes and seconds into watt-hours and grams of CO2.
#[derive(Debug, Clone, PartialEq)]
pub struct EnergyModel {
    kwh_per_gb: f64,
    device_watts: f64,
    grid_intensity_g_per_kwh: f64,
}

impl EnergyModel {
    pub fn new(config: &EnergyModelConfig) -> Self {
        Self {
            kwh_per_gb: config.kwh_per_gb,
            device_watts: config.device_watts,
            grid_intensity_g_per_kwh: config.grid_intensity_g_per_kwh,
        }
    }

    /// Transfer energy plus device energy for the load duration.
    pub fn energy_wh(&self, bytes: f64, duration_seconds: f64) -> f64 {
        let transfer_wh = bytes / BYTES_PER_GB * self.kwh_per_gb * 1000.0;
        let device_wh = duration_seconds / 3600.0 * self.device_watts;
        transfer_wh + device_wh
    }

    pub fn co2_grams(&self, energy_wh: f64) -> f64 {
        energy_wh / 1000.0 * self.grid_intensity_g_per_kwh
    }
}

impl Default for EnergyModel {
    fn default() -> Self {
        Self::new(&EnergyModelConfig::default())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FootprintReport {
    pub url: String,
    pub page_bytes_mb: f64,
    pub request_count: u64,
    pub duration_seconds: f64,
    pub energy_wh: f64,
    pub co2_grams: f64,
    pub measured_at: DateTime<Utc>,
}

impl FootprintReport {
    pub fn from_measurement(url: &str, result: &MeasurementResult, model: &EnergyModel) -> Self {
        let energy_wh = model.energy_wh(result.bytes_transferred, result.duration_seconds);

        Self {
            url: url.to_string(),
            page_bytes_mb: result.bytes_transferred / BYTES_PER_MB,
            request_count: result.resource_count,
            duration_seconds: result.duration_seconds,
            energy_wh,
            co2_grams: model.co2_grams(energy_wh),
            measured_at: Utc::now(),
        }
    }
}
