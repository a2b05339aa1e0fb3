//! Startup IMU calibration
//!
//! Samples the IMU at the control rate for a fixed window and estimates the
//! per-channel mean (sensor bias) and the 6x6 sample covariance (sensor
//! noise). The window never extends: a source that fails to answer costs a
//! slot, it is not retried.

use super::sensors::{ImuSample, ImuSource};
use crate::common::rate::Pacer;
use crate::config::CalibrationGapPolicy;
use nalgebra::{Matrix2, Matrix6, Vector2, Vector6};
use std::time::{Duration, Instant};
use tracing::{info, warn};

/// Frozen output of one calibration run
#[derive(Debug, Clone, PartialEq)]
pub struct CalibrationResult {
    /// Mean of all six channels (accel x,y,z then gyro x,y,z)
    pub mean: Vector6<f64>,
    /// Population covariance over the same six channels
    pub covariance: Matrix6<f64>,
    /// Slots that actually held a sample
    pub samples_used: usize,
    /// Slots where the source failed
    pub gaps: usize,
}

impl CalibrationResult {
    /// Zero bias with unit covariance, used when nothing could be measured
    pub fn fallback() -> Self {
        CalibrationResult {
            mean: Vector6::zeros(),
            covariance: Matrix6::identity(),
            samples_used: 0,
            gaps: 0,
        }
    }

    /// Build a result from collected samples
    pub fn from_samples(samples: &[Vector6<f64>], gaps: usize) -> Self {
        if samples.is_empty() {
            return CalibrationResult {
                gaps,
                ..Self::fallback()
            };
        }

        let n = samples.len() as f64;
        let mean = samples.iter().fold(Vector6::zeros(), |acc, s| acc + s) / n;
        let covariance = samples.iter().fold(Matrix6::zeros(), |acc, s| {
            let d = s - mean;
            acc + d * d.transpose()
        }) / n;

        CalibrationResult {
            mean,
            covariance,
            samples_used: samples.len(),
            gaps,
        }
    }

    /// Planar accelerometer bias
    pub fn accel_bias(&self) -> Vector2<f64> {
        Vector2::new(self.mean[0], self.mean[1])
    }

    /// Vertical-axis gyro bias
    pub fn gyro_bias(&self) -> f64 {
        self.mean[5]
    }

    /// Covariance of the planar accelerometer channels
    pub fn accel_xy_covariance(&self) -> Matrix2<f64> {
        self.covariance.fixed_view::<2, 2>(0, 0).into_owned()
    }

    /// Variance of the vertical-axis gyro channel
    pub fn gyro_z_variance(&self) -> f64 {
        self.covariance[(5, 5)]
    }
}

/// Collect `samples` IMU readings, one per tick, and summarise them.
pub fn calibrate(
    source: &mut dyn ImuSource,
    pacer: &mut dyn Pacer,
    samples: usize,
    timeout: Duration,
    gaps: CalibrationGapPolicy,
) -> CalibrationResult {
    info!(
        "Starting sensor calibration on {} ({} samples)...",
        source.name(),
        samples
    );
    let started = Instant::now();

    let mut collected = Vec::with_capacity(samples);
    let mut missing = 0;
    for slot in 0..samples {
        match source.fetch(timeout) {
            Ok(sample) => collected.push(sample.channels()),
            Err(e) => {
                warn!("No IMU sample for calibration slot {}: {}", slot, e);
                missing += 1;
                if gaps == CalibrationGapPolicy::ZeroFill {
                    collected.push(ImuSample::default().channels());
                }
            }
        }
        pacer.sleep();
    }

    if collected.is_empty() {
        warn!("Calibration collected no samples, using zero bias and unit covariance");
    }
    let result = CalibrationResult::from_samples(&collected, missing);

    info!(
        "Calibration complete. Took {:.3} seconds ({} gaps)",
        started.elapsed().as_secs_f64(),
        missing
    );
    let m = &result.mean;
    info!(
        "Average accelerometer measurement: [{:.5}, {:.5}, {:.5}]",
        m[0], m[1], m[2]
    );
    info!(
        "Accelerometer covariance: {:?}",
        result.covariance.fixed_view::<3, 3>(0, 0)
    );
    info!(
        "Average gyroscope measurement: [{:.5}, {:.5}, {:.5}]",
        m[3], m[4], m[5]
    );
    info!(
        "Gyroscope covariance: {:?}",
        result.covariance.fixed_view::<3, 3>(3, 3)
    );

    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::rate::Unpaced;
    use crate::error::SensorError;
    use crate::perception::sensors::ScriptedImu;
    use approx::assert_relative_eq;
    use nalgebra::Vector3;

    fn sample(ax: f64, ay: f64, gz: f64) -> ImuSample {
        ImuSample::new(Vector3::new(ax, ay, 9.81), Vector3::new(0.0, 0.0, gz))
    }

    #[test]
    fn test_constant_stream_has_zero_covariance() {
        let v = sample(0.12, -0.05, 0.01);
        let mut imu = ScriptedImu::constant(v);
        let result = calibrate(
            &mut imu,
            &mut Unpaced,
            50,
            Duration::from_millis(1),
            CalibrationGapPolicy::Exclude,
        );
        assert_eq!(result.samples_used, 50);
        assert_relative_eq!(result.mean, v.channels(), epsilon = 1e-12);
        assert_relative_eq!(result.covariance, Matrix6::zeros(), epsilon = 1e-12);
        assert_relative_eq!(result.accel_bias(), Vector2::new(0.12, -0.05), epsilon = 1e-12);
        assert_relative_eq!(result.gyro_bias(), 0.01, epsilon = 1e-12);
    }

    #[test]
    fn test_population_covariance() {
        // Normalised by N, not N - 1
        let samples = vec![
            Vector6::new(1.0, 0.0, 0.0, 0.0, 0.0, 2.0),
            Vector6::new(3.0, 0.0, 0.0, 0.0, 0.0, 4.0),
        ];
        let result = CalibrationResult::from_samples(&samples, 0);
        assert_relative_eq!(result.mean[0], 2.0);
        assert_relative_eq!(result.covariance[(0, 0)], 1.0);
        assert_relative_eq!(result.covariance[(0, 5)], 1.0);
        assert_relative_eq!(result.gyro_z_variance(), 1.0);
        assert_eq!(result.covariance, result.covariance.transpose());
    }

    #[test]
    fn test_zero_fill_biases_toward_zero() {
        let v = sample(1.0, 1.0, 0.0);
        let mut imu = ScriptedImu::new(vec![Ok(v), Err(SensorError::Timeout), Ok(v), Ok(v)]);
        let result = calibrate(
            &mut imu,
            &mut Unpaced,
            4,
            Duration::from_millis(1),
            CalibrationGapPolicy::ZeroFill,
        );
        assert_eq!(result.gaps, 1);
        assert_eq!(result.samples_used, 4);
        assert_relative_eq!(result.accel_bias(), Vector2::new(0.75, 0.75), epsilon = 1e-12);
        assert!(result.accel_xy_covariance()[(0, 0)] > 0.0);
    }

    #[test]
    fn test_exclude_skips_gaps() {
        let v = sample(1.0, 1.0, 0.0);
        let mut imu = ScriptedImu::new(vec![Ok(v), Err(SensorError::Timeout), Ok(v), Ok(v)]);
        let result = calibrate(
            &mut imu,
            &mut Unpaced,
            4,
            Duration::from_millis(1),
            CalibrationGapPolicy::Exclude,
        );
        assert_eq!(result.gaps, 1);
        assert_eq!(result.samples_used, 3);
        assert_relative_eq!(result.accel_bias(), Vector2::new(1.0, 1.0), epsilon = 1e-12);
        assert_relative_eq!(result.accel_xy_covariance(), Matrix2::zeros(), epsilon = 1e-12);
    }

    #[test]
    fn test_dead_source_falls_back() {
        let mut imu = ScriptedImu::new(vec![]);
        let result = calibrate(
            &mut imu,
            &mut Unpaced,
            5,
            Duration::from_millis(1),
            CalibrationGapPolicy::Exclude,
        );
        assert_eq!(result.gaps, 5);
        assert_eq!(result.mean, Vector6::zeros());
        assert_eq!(result.covariance, Matrix6::identity());
    }
}
