//! Localization module
//!
//! Planar Kalman filter fusing IMU dead reckoning with absolute pose fixes
//! from the tag tracker. The linear part tracks (x, vx, y, vy) with a 4x4
//! covariance; the heading is a separate scalar filter.

use super::calibration::CalibrationResult;
use super::mailbox::PoseCorrection;
use super::sensors::ImuSample;
use crate::common::wrap_angle;
use crate::config::EstimatorConfig;
use crate::error::{EstimatorError, Result};
use nalgebra::{Matrix2, Matrix2x4, Matrix4, Matrix4x2, Rotation2, Vector2, Vector4};
use tracing::warn;

const SYMMETRY_TOLERANCE: f64 = 1e-9;

/// Position sensor model: the tracker observes x and y only
fn observation_matrix() -> Matrix2x4<f64> {
    Matrix2x4::new(
        1.0, 0.0, 0.0, 0.0, //
        0.0, 0.0, 1.0, 0.0,
    )
}

/// Constant-velocity transition over (x, vx, y, vy)
fn transition_matrix(dt: f64) -> Matrix4<f64> {
    Matrix4::new(
        1.0, dt, 0.0, 0.0, //
        0.0, 1.0, 0.0, 0.0, //
        0.0, 0.0, 1.0, dt, //
        0.0, 0.0, 0.0, 1.0,
    )
}

/// How a body-frame acceleration enters (x, vx, y, vy) over one period
fn input_matrix(dt: f64) -> Matrix4x2<f64> {
    let h = 0.5 * dt * dt;
    Matrix4x2::new(
        h, 0.0, //
        dt, 0.0, //
        0.0, h, //
        0.0, dt,
    )
}

/// `rot ⊗ I2`: applies a planar rotation to both position and velocity
fn rotation_kron(rot: &Matrix2<f64>) -> Matrix4<f64> {
    let (c, s) = (rot[(0, 0)], rot[(1, 0)]);
    Matrix4::new(
        c, 0.0, -s, 0.0, //
        0.0, c, 0.0, -s, //
        s, 0.0, c, 0.0, //
        0.0, s, 0.0, c,
    )
}

/// Process and measurement noise, fixed for one run
#[derive(Debug, Clone, PartialEq)]
pub struct NoiseModel {
    pub dt: f64,
    pub q_lin: Matrix4<f64>,
    pub q_ang: f64,
    pub r_lin: Matrix2<f64>,
    pub r_ang: f64,
}

impl NoiseModel {
    /// Project the calibrated IMU noise through the input model and take the
    /// tracker noise from configuration
    pub fn from_calibration(calibration: &CalibrationResult, config: &EstimatorConfig) -> Self {
        let dt = config.dt();
        let g = input_matrix(dt);
        NoiseModel {
            dt,
            q_lin: g * calibration.accel_xy_covariance() * g.transpose(),
            q_ang: dt * calibration.gyro_z_variance() * dt,
            r_lin: Matrix2::identity() * config.camera_position_error.powi(2),
            r_ang: config.camera_orientation_error.powi(2),
        }
    }
}

/// Filter state
#[derive(Debug, Clone, PartialEq)]
pub struct EstimatorState {
    pub position: Vector2<f64>,
    pub velocity: Vector2<f64>,
    /// Heading in radians, accumulated without wrapping
    pub heading: f64,
    /// Covariance over (x, vx, y, vy)
    pub linear_covariance: Matrix4<f64>,
    pub angular_covariance: f64,
}

impl EstimatorState {
    /// State at rest at a known pose, with the configured initial uncertainty
    pub fn at_rest(position: Vector2<f64>, heading: f64, config: &EstimatorConfig) -> Self {
        let sigma_pos = config.initial_position_uncertainty.powi(2);
        EstimatorState {
            position,
            velocity: Vector2::zeros(),
            heading,
            linear_covariance: Matrix4::from_diagonal(&Vector4::new(1.0, 0.0, 1.0, 0.0))
                * sigma_pos,
            angular_covariance: config.initial_orientation_uncertainty.powi(2),
        }
    }

    /// Stacked (x, vx, y, vy)
    fn stacked(&self) -> Vector4<f64> {
        Vector4::new(
            self.position.x,
            self.velocity.x,
            self.position.y,
            self.velocity.y,
        )
    }

    fn unstack(&mut self, xv: &Vector4<f64>) {
        self.position = Vector2::new(xv[0], xv[2]);
        self.velocity = Vector2::new(xv[1], xv[3]);
    }
}

/// A localizer for the robot
pub struct Localizer {
    state: EstimatorState,
    noise: NoiseModel,
    shrink_angular: bool,
}

impl Localizer {
    /// Create a new localizer
    pub fn new(state: EstimatorState, noise: NoiseModel, shrink_angular: bool) -> Self {
        Localizer {
            state,
            noise,
            shrink_angular,
        }
    }

    pub fn state(&self) -> &EstimatorState {
        &self.state
    }

    pub fn noise(&self) -> &NoiseModel {
        &self.noise
    }

    /// Time update: propagate the state one period with a bias-corrected IMU
    /// sample.
    pub fn predict(&mut self, accel_bias: Vector2<f64>, gyro_bias: f64, sample: &ImuSample) {
        let dt = self.noise.dt;
        let accel = sample.planar_acceleration() - accel_bias;
        let omega = sample.yaw_rate() - gyro_bias;

        let rot = Rotation2::new(self.state.heading).into_inner();
        let world_accel = rot * accel;

        let s = &mut self.state;
        s.position += s.velocity * dt + 0.5 * world_accel * dt * dt;
        s.velocity += world_accel * dt;
        s.heading += omega * dt;

        let a = transition_matrix(dt);
        let r = rotation_kron(&rot);
        s.linear_covariance =
            a * s.linear_covariance * a.transpose() + r * self.noise.q_lin * r.transpose();
        s.angular_covariance += self.noise.q_ang;
    }

    /// Measurement update from one tag-tracker fix.
    ///
    /// Leaves the state untouched and returns `SingularCovariance` when either
    /// innovation covariance cannot be inverted.
    pub fn correct(&mut self, fix: &PoseCorrection) -> Result<()> {
        let c = observation_matrix();
        let p = self.state.linear_covariance;

        let s_lin = c * p * c.transpose() + self.noise.r_lin;
        let s_lin_inv = s_lin
            .try_inverse()
            .ok_or(EstimatorError::SingularCovariance)?;
        let s_ang = self.state.angular_covariance + self.noise.r_ang;
        if s_ang <= 0.0 {
            return Err(EstimatorError::SingularCovariance);
        }

        let k_lin = p * c.transpose() * s_lin_inv;
        let e_lin = fix.position - self.state.position;
        let xv = self.state.stacked() + k_lin * e_lin;
        self.state.unstack(&xv);
        self.state.linear_covariance = (Matrix4::identity() - k_lin * c) * p;

        let k_ang = self.state.angular_covariance / s_ang;
        let e_ang = heading_innovation(fix.heading, self.state.heading);
        self.state.heading += k_ang * e_ang;
        if self.shrink_angular {
            self.state.angular_covariance *= 1.0 - k_ang;
        }

        self.check_covariance();
        Ok(())
    }

    /// Warn when numerical error has broken symmetry or positivity
    fn check_covariance(&self) {
        let p = &self.state.linear_covariance;
        let asymmetry = (p - p.transpose()).amax();
        if asymmetry > SYMMETRY_TOLERANCE {
            warn!("Linear covariance lost symmetry (max deviation {:e})", asymmetry);
        }
        if p.diagonal().iter().any(|v| *v < 0.0) || self.state.angular_covariance < 0.0 {
            warn!("Covariance has a negative variance: {:?}", p.diagonal());
        }
    }
}

/// Signed heading error in `(-pi, pi]` between a measured and an estimated
/// heading, whatever turns either has accumulated
pub fn heading_innovation(measured: f64, estimated: f64) -> f64 {
    wrap_angle(wrap_angle(measured) - wrap_angle(estimated))
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use nalgebra::{Matrix6, Vector3, Vector6};
    use std::f64::consts::PI;

    fn calibration(accel_var: f64, gyro_var: f64) -> CalibrationResult {
        let mut covariance = Matrix6::zeros();
        covariance[(0, 0)] = accel_var;
        covariance[(1, 1)] = accel_var;
        covariance[(5, 5)] = gyro_var;
        CalibrationResult {
            mean: Vector6::zeros(),
            covariance,
            samples_used: 50,
            gaps: 0,
        }
    }

    fn localizer() -> Localizer {
        let config = EstimatorConfig::default();
        let noise = NoiseModel::from_calibration(&calibration(0.01, 0.001), &config);
        let state = EstimatorState::at_rest(Vector2::zeros(), 0.0, &config);
        Localizer::new(state, noise, true)
    }

    fn fix(x: f64, y: f64, heading: f64) -> PoseCorrection {
        PoseCorrection::new(Vector2::new(x, y), heading, "usb_cam")
    }

    #[test]
    fn test_noise_model_projection() {
        let config = EstimatorConfig::default();
        let noise = NoiseModel::from_calibration(&calibration(4.0, 2.0), &config);
        let dt: f64 = 0.1;
        assert_relative_eq!(noise.q_lin[(0, 0)], 4.0 * (0.5 * dt * dt).powi(2), epsilon = 1e-15);
        assert_relative_eq!(noise.q_lin[(1, 1)], 4.0 * dt * dt, epsilon = 1e-15);
        assert_relative_eq!(noise.q_lin[(0, 1)], 4.0 * 0.5 * dt * dt * dt, epsilon = 1e-15);
        assert_relative_eq!(noise.q_lin[(0, 2)], 0.0);
        assert_relative_eq!(noise.q_ang, 2.0 * dt * dt, epsilon = 1e-15);
        assert_relative_eq!(noise.r_lin, Matrix2::identity() * 0.0025, epsilon = 1e-15);
        assert_relative_eq!(noise.r_ang, 0.01, epsilon = 1e-15);
    }

    #[test]
    fn test_predict_zero_input_keeps_state_and_grows_uncertainty() {
        let mut loc = localizer();
        let still = ImuSample::default();
        for _ in 0..20 {
            let before = loc.state().clone();
            loc.predict(Vector2::zeros(), 0.0, &still);
            let after = loc.state();
            assert_eq!(after.position, before.position);
            assert_eq!(after.velocity, before.velocity);
            assert_eq!(after.heading, before.heading);
            assert!(after.linear_covariance.trace() >= before.linear_covariance.trace());
            assert!(after.angular_covariance >= before.angular_covariance);
        }
    }

    #[test]
    fn test_predict_integrates_rotated_acceleration() {
        let config = EstimatorConfig::default();
        let noise = NoiseModel::from_calibration(&calibration(0.0, 0.0), &config);
        let state = EstimatorState::at_rest(Vector2::zeros(), PI / 2.0, &config);
        let mut loc = Localizer::new(state, noise, true);

        // Forward in the body frame is +y in the world when facing pi/2
        let sample = ImuSample::new(Vector3::new(1.0, 0.0, 9.8), Vector3::new(0.0, 0.0, 0.5));
        loc.predict(Vector2::zeros(), 0.0, &sample);
        let s = loc.state();
        assert_relative_eq!(s.position, Vector2::new(0.0, 0.005), epsilon = 1e-12);
        assert_relative_eq!(s.velocity, Vector2::new(0.0, 0.1), epsilon = 1e-12);
        assert_relative_eq!(s.heading, PI / 2.0 + 0.05, epsilon = 1e-12);

        // Velocity carries into the next step
        loc.predict(Vector2::new(1.0, 0.0), 0.5, &sample);
        assert_relative_eq!(loc.state().position.y, 0.015, epsilon = 1e-12);
    }

    #[test]
    fn test_predict_subtracts_bias() {
        let mut loc = localizer();
        let sample = ImuSample::new(Vector3::new(0.3, -0.2, 9.8), Vector3::new(0.0, 0.0, 0.02));
        loc.predict(Vector2::new(0.3, -0.2), 0.02, &sample);
        assert_relative_eq!(loc.state().position, Vector2::zeros());
        assert_relative_eq!(loc.state().heading, 0.0);
    }

    #[test]
    fn test_correct_pulls_toward_fix() {
        let mut loc = localizer();
        let p = loc.state().linear_covariance;
        let r = loc.noise().r_lin;
        let expected_gain = p[(0, 0)] / (p[(0, 0)] + r[(0, 0)]);

        loc.correct(&fix(1.0, 0.0, 0.0)).unwrap();
        let s = loc.state();
        assert_relative_eq!(s.position.x, expected_gain, epsilon = 1e-12);
        assert_relative_eq!(s.position.y, 0.0);
        assert!(s.position.x > 0.0 && s.position.x < 1.0);
    }

    #[test]
    fn test_correct_never_increases_uncertainty() {
        let mut loc = localizer();
        for _ in 0..5 {
            loc.predict(Vector2::zeros(), 0.0, &ImuSample::default());
        }
        let prior = loc.state().linear_covariance.trace();
        loc.correct(&fix(0.2, 0.1, 0.0)).unwrap();
        let once = loc.state().linear_covariance.trace();
        loc.correct(&fix(0.2, 0.1, 0.0)).unwrap();
        let twice = loc.state().linear_covariance.trace();
        assert!(once <= prior);
        assert!(twice <= once);
    }

    #[test]
    fn test_correct_updates_velocity_through_cross_covariance() {
        let mut loc = localizer();
        for _ in 0..10 {
            loc.predict(Vector2::zeros(), 0.0, &ImuSample::default());
        }
        loc.correct(&fix(0.5, 0.0, 0.0)).unwrap();
        assert!(loc.state().velocity.x > 0.0);
    }

    #[test]
    fn test_heading_innovation_is_wrapped() {
        let e = heading_innovation(0.0, 3.5 * PI);
        assert!(e > -PI && e <= PI);
        assert_relative_eq!(e, PI / 2.0, epsilon = 1e-12);
        assert_relative_eq!(heading_innovation(-3.0, 3.0), 2.0 * PI - 6.0, epsilon = 1e-12);
    }

    #[test]
    fn test_correct_heading_from_accumulated_turns() {
        let config = EstimatorConfig::default();
        let noise = NoiseModel::from_calibration(&calibration(0.01, 0.001), &config);
        let state = EstimatorState::at_rest(Vector2::zeros(), 3.5 * PI, &config);
        let mut loc = Localizer::new(state, noise, true);
        loc.correct(&fix(0.0, 0.0, 0.0)).unwrap();
        let step = loc.state().heading - 3.5 * PI;
        assert!(step > 0.0 && step < PI / 2.0);
    }

    #[test]
    fn test_angular_covariance_shrink_is_configurable() {
        let mut shrinking = localizer();
        shrinking.correct(&fix(0.0, 0.0, 0.1)).unwrap();
        assert!(shrinking.state().angular_covariance < 0.09);

        let config = EstimatorConfig::default();
        let noise = NoiseModel::from_calibration(&calibration(0.01, 0.001), &config);
        let state = EstimatorState::at_rest(Vector2::zeros(), 0.0, &config);
        let mut legacy = Localizer::new(state, noise, false);
        legacy.correct(&fix(0.0, 0.0, 0.1)).unwrap();
        assert_relative_eq!(legacy.state().angular_covariance, 0.09, epsilon = 1e-12);
        assert!(legacy.state().heading > 0.0);
    }

    #[test]
    fn test_singular_covariance_leaves_state_untouched() {
        let config = EstimatorConfig {
            camera_position_error: 0.0,
            initial_position_uncertainty: 0.0,
            ..EstimatorConfig::default()
        };
        let noise = NoiseModel::from_calibration(&calibration(0.0, 0.0), &config);
        let state = EstimatorState::at_rest(Vector2::zeros(), 0.0, &config);
        let mut loc = Localizer::new(state.clone(), noise, true);

        let result = loc.correct(&fix(1.0, 0.0, 0.5));
        assert!(matches!(result, Err(EstimatorError::SingularCovariance)));
        assert_eq!(loc.state(), &state);
    }
}
