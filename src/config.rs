//! Configuration loading for the Zumy estimator

use crate::error::{EstimatorError, Result};
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

/// Slowest loop the engine will pace (one tick every 100 s)
const MIN_RATE_HZ: f64 = 0.01;
/// Upper bound on one IMU request
const MAX_IMU_TIMEOUT_MS: u64 = 60_000;
/// Upper bound on the samples buffered by one calibration run
const MAX_CALIBRATION_SAMPLES: f64 = 1_000_000.0;

/// How calibration treats a tick where the IMU did not answer
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CalibrationGapPolicy {
    /// Leave the missing slot out of the statistics
    #[default]
    Exclude,
    /// Record a zero sample in the missing slot (legacy behaviour, biases
    /// both mean and covariance toward zero)
    ZeroFill,
}

/// Estimator configuration
#[derive(Clone, Debug, Deserialize)]
pub struct EstimatorConfig {
    /// Control loop rate in Hz (default: 10)
    #[serde(default = "default_rate_hz")]
    pub rate_hz: f64,

    /// Calibration window in seconds (default: 5)
    #[serde(default = "default_calibration_secs")]
    pub calibration_secs: f64,

    /// Accelerometer bias smoothing constant (default: 0.8)
    #[serde(default = "default_bias_alpha")]
    pub bias_alpha: f64,

    /// Initial position standard deviation in meters (default: 0.10)
    #[serde(default = "default_initial_position_uncertainty")]
    pub initial_position_uncertainty: f64,

    /// Initial heading standard deviation in radians (default: 0.3, ~15deg)
    #[serde(default = "default_initial_orientation_uncertainty")]
    pub initial_orientation_uncertainty: f64,

    /// Tag tracker position error in meters (default: 0.05)
    #[serde(default = "default_camera_position_error")]
    pub camera_position_error: f64,

    /// Tag tracker heading error in radians (default: 0.1, ~5deg)
    #[serde(default = "default_camera_orientation_error")]
    pub camera_orientation_error: f64,

    /// Upper bound on a single IMU request in milliseconds (default: 50)
    #[serde(default = "default_imu_timeout_ms")]
    pub imu_timeout_ms: u64,

    /// Consecutive missed IMU ticks before the source is reported dead
    #[serde(default = "default_stale_warn_ticks")]
    pub stale_warn_ticks: u32,

    #[serde(default)]
    pub calibration_gaps: CalibrationGapPolicy,

    /// Contract the heading variance after a correction (default: true)
    #[serde(default = "default_shrink_angular_covariance")]
    pub shrink_angular_covariance: bool,

    /// Parent frame used before any correction names one
    #[serde(default = "default_origin_frame")]
    pub default_origin_frame: String,
}

impl EstimatorConfig {
    /// Load and validate a configuration file
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_toml(&text)
    }

    /// Parse and validate a configuration from TOML text
    pub fn from_toml(text: &str) -> Result<Self> {
        let config: EstimatorConfig = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if !(self.rate_hz.is_finite() && self.rate_hz >= MIN_RATE_HZ) {
            return Err(EstimatorError::Config(format!(
                "rate_hz must be finite and at least {}",
                MIN_RATE_HZ
            )));
        }
        if !(self.calibration_secs.is_finite() && self.calibration_secs >= 0.0) {
            return Err(EstimatorError::Config(
                "calibration_secs must be finite and non-negative".to_string(),
            ));
        }
        if (self.rate_hz * self.calibration_secs).round() > MAX_CALIBRATION_SAMPLES {
            return Err(EstimatorError::Config(format!(
                "calibration window exceeds {} samples",
                MAX_CALIBRATION_SAMPLES
            )));
        }
        if !(0.0..=1.0).contains(&self.bias_alpha) {
            return Err(EstimatorError::Config(
                "bias_alpha must lie in [0, 1]".to_string(),
            ));
        }
        let noise = [
            ("initial_position_uncertainty", self.initial_position_uncertainty),
            ("initial_orientation_uncertainty", self.initial_orientation_uncertainty),
            ("camera_position_error", self.camera_position_error),
            ("camera_orientation_error", self.camera_orientation_error),
        ];
        for (name, value) in noise {
            if !(value.is_finite() && value >= 0.0) {
                return Err(EstimatorError::Config(format!(
                    "{} must be finite and non-negative",
                    name
                )));
            }
        }
        if self.imu_timeout_ms > MAX_IMU_TIMEOUT_MS {
            return Err(EstimatorError::Config(format!(
                "imu_timeout_ms must not exceed {}",
                MAX_IMU_TIMEOUT_MS
            )));
        }
        Ok(())
    }

    /// Control period in seconds
    pub fn dt(&self) -> f64 {
        1.0 / self.rate_hz
    }

    /// Control period, used to pace the loop
    pub fn period(&self) -> Duration {
        Duration::from_secs_f64(self.dt())
    }

    pub fn imu_timeout(&self) -> Duration {
        Duration::from_millis(self.imu_timeout_ms)
    }

    /// Number of samples collected by one calibration run
    pub fn calibration_samples(&self) -> usize {
        (self.rate_hz * self.calibration_secs).round() as usize
    }
}

fn default_rate_hz() -> f64 {
    10.0
}
fn default_calibration_secs() -> f64 {
    5.0
}
fn default_bias_alpha() -> f64 {
    0.8
}
fn default_initial_position_uncertainty() -> f64 {
    0.10
}
fn default_initial_orientation_uncertainty() -> f64 {
    0.3
}
fn default_camera_position_error() -> f64 {
    0.05
}
fn default_camera_orientation_error() -> f64 {
    0.1
}
fn default_imu_timeout_ms() -> u64 {
    50
}
fn default_stale_warn_ticks() -> u32 {
    10
}
fn default_shrink_angular_covariance() -> bool {
    true
}
fn default_origin_frame() -> String {
    "usb_cam".to_string()
}

impl Default for EstimatorConfig {
    fn default() -> Self {
        Self {
            rate_hz: default_rate_hz(),
            calibration_secs: default_calibration_secs(),
            bias_alpha: default_bias_alpha(),
            initial_position_uncertainty: default_initial_position_uncertainty(),
            initial_orientation_uncertainty: default_initial_orientation_uncertainty(),
            camera_position_error: default_camera_position_error(),
            camera_orientation_error: default_camera_orientation_error(),
            imu_timeout_ms: default_imu_timeout_ms(),
            stale_warn_ticks: default_stale_warn_ticks(),
            calibration_gaps: CalibrationGapPolicy::default(),
            shrink_angular_covariance: default_shrink_angular_covariance(),
            default_origin_frame: default_origin_frame(),
        }
    }
}
