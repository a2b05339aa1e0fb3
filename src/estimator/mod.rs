//! Estimation engine and its fixed-rate loop
//!
//! One [`Estimator`] owns all filter state. Events from other threads reach it
//! only through an [`EstimatorHandle`], which writes into single-slot shared
//! fields that the loop reads at fixed points in each tick.
//!
//! [`Estimator::run`] returns when shutdown is requested. Restarting the
//! engine after any other exit (a panic in a collaborator, say) is the
//! caller's job; the node binary does so from a fresh `Calibrating` state.
pub mod publisher;

use self::publisher::{EstimatePublisher, StateEstimate};
use crate::common::rate::Pacer;
use crate::config::EstimatorConfig;
use crate::error::{EstimatorError, Result};
use crate::lifecycle::{Lifecycle, State};
use crate::perception::calibration::calibrate;
use crate::perception::filters::{BiasTracker, Filter};
use crate::perception::localization::{EstimatorState, Localizer, NoiseModel};
use crate::perception::mailbox::{CorrectionMailbox, EventFlag, PoseCorrection};
use crate::perception::sensors::{ImuSample, ImuSource};
use nalgebra::Vector2;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// What happened to the pose fix queue during one tick
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CorrectionOutcome {
    /// Nothing was pending
    Idle,
    Applied,
    /// A fix was consumed but could not be fused
    Skipped,
}

/// Summary of one tick
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TickReport {
    pub seq: u64,
    /// False when the previous sample was held
    pub fresh_sample: bool,
    pub correction: CorrectionOutcome,
}

/// Event-delivery side of the estimator. Cheap to clone and `Send`.
#[derive(Debug, Clone, Default)]
pub struct EstimatorHandle {
    corrections: Arc<CorrectionMailbox>,
    recalibrate: Arc<EventFlag>,
    shutdown: Arc<EventFlag>,
}

impl EstimatorHandle {
    /// Deliver a pose fix; replaces any fix not yet consumed
    pub fn submit_correction(&self, fix: PoseCorrection) {
        debug!(
            "Pose fix from {}: ({:.3}, {:.3}, {:.3})",
            fix.frame_id, fix.position.x, fix.position.y, fix.heading
        );
        self.corrections.post(fix);
    }

    /// Ask the loop to recalibrate at the start of its next tick
    pub fn request_recalibration(&self) {
        self.recalibrate.raise();
    }

    /// Ask the loop to exit at the next tick boundary
    pub fn shutdown(&self) {
        self.shutdown.raise();
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown.is_raised()
    }

    pub fn correction_pending(&self) -> bool {
        self.corrections.is_pending()
    }
}

/// The state estimator for one robot
pub struct Estimator {
    lifecycle: Lifecycle,
    config: EstimatorConfig,
    imu: Box<dyn ImuSource>,
    publisher: Box<dyn EstimatePublisher>,
    pacer: Box<dyn Pacer>,
    handle: EstimatorHandle,
    localizer: Option<Localizer>,
    accel_bias: BiasTracker,
    gyro_bias: f64,
    last_sample: Option<ImuSample>,
    origin_frame: String,
    seq: u64,
    missed_ticks: u32,
}

impl Estimator {
    /// Create an estimator for the unit `name`
    pub fn new(
        name: &str,
        config: EstimatorConfig,
        imu: Box<dyn ImuSource>,
        publisher: Box<dyn EstimatePublisher>,
        pacer: Box<dyn Pacer>,
    ) -> Self {
        Estimator {
            lifecycle: Lifecycle::new(name),
            accel_bias: BiasTracker::new(config.bias_alpha, Vector2::zeros()),
            origin_frame: config.default_origin_frame.clone(),
            config,
            imu,
            publisher,
            pacer,
            handle: EstimatorHandle::default(),
            localizer: None,
            gyro_bias: 0.0,
            last_sample: None,
            seq: 0,
            missed_ticks: 0,
        }
    }

    /// Attach to an existing handle so events delivered before the estimator
    /// was built are not lost
    pub fn with_handle(mut self, handle: EstimatorHandle) -> Self {
        self.handle = handle;
        self
    }

    pub fn handle(&self) -> EstimatorHandle {
        self.handle.clone()
    }

    pub fn name(&self) -> &str {
        &self.lifecycle.name
    }

    pub fn lifecycle_state(&self) -> State {
        self.lifecycle.get_state()
    }

    /// Current filter state, once calibrated
    pub fn state(&self) -> Option<&EstimatorState> {
        self.localizer.as_ref().map(|l| l.state())
    }

    pub fn noise(&self) -> Option<&NoiseModel> {
        self.localizer.as_ref().map(|l| l.noise())
    }

    pub fn accel_bias(&self) -> Vector2<f64> {
        self.accel_bias.bias()
    }

    pub fn gyro_bias(&self) -> f64 {
        self.gyro_bias
    }

    pub fn origin_frame(&self) -> &str {
        &self.origin_frame
    }

    /// Run calibration and seed the filter. Leaves the engine `Running`.
    pub fn calibrate(&mut self) {
        self.lifecycle.transition(State::Calibrating);

        let calibration = calibrate(
            self.imu.as_mut(),
            self.pacer.as_mut(),
            self.config.calibration_samples(),
            self.config.imu_timeout(),
            self.config.calibration_gaps,
        );
        let noise = NoiseModel::from_calibration(&calibration, &self.config);

        let (position, heading) = match self.handle.corrections.latest() {
            Some(fix) => {
                self.origin_frame = fix.frame_id.clone();
                (fix.position, fix.heading)
            }
            None => (Vector2::zeros(), 0.0),
        };
        info!(
            "Seeding filter at ({:.3}, {:.3}) heading {:.3} in {}",
            position.x, position.y, heading, self.origin_frame
        );

        let state = EstimatorState::at_rest(position, heading, &self.config);
        self.localizer = Some(Localizer::new(
            state,
            noise,
            self.config.shrink_angular_covariance,
        ));
        self.accel_bias.reset(calibration.accel_bias());
        self.gyro_bias = calibration.gyro_bias();

        self.lifecycle.transition(State::Running);
    }

    /// Fetch a sample, holding the last good one on failure.
    ///
    /// Returns the sample and whether it is fresh. If no sample has ever been
    /// received this blocks, retrying until one arrives or shutdown is
    /// requested.
    fn acquire_sample(&mut self) -> Result<(ImuSample, bool)> {
        let timeout = self.config.imu_timeout();
        match self.imu.fetch(timeout) {
            Ok(sample) => {
                if self.missed_ticks >= self.config.stale_warn_ticks {
                    info!("IMU source {} recovered", self.imu.name());
                }
                self.missed_ticks = 0;
                self.last_sample = Some(sample);
                return Ok((sample, true));
            }
            Err(e) => {
                self.missed_ticks = self.missed_ticks.saturating_add(1);
                if self.missed_ticks == self.config.stale_warn_ticks {
                    error!(
                        "IMU source {} has not answered for {} ticks",
                        self.imu.name(),
                        self.missed_ticks
                    );
                }
                if let Some(held) = self.last_sample {
                    warn!("{}", EstimatorError::SampleUnavailable(e));
                    return Ok((held, false));
                }
            }
        }

        warn!("{}, waiting for first IMU sample", EstimatorError::UninitializedSample);
        loop {
            if self.handle.is_shutdown() {
                return Err(EstimatorError::UninitializedSample);
            }
            match self.imu.fetch(timeout) {
                Ok(sample) => {
                    self.missed_ticks = 0;
                    self.last_sample = Some(sample);
                    return Ok((sample, true));
                }
                Err(e) => {
                    debug!("Trying to initialize IMU: {}", e);
                    self.pacer.sleep();
                }
            }
        }
    }

    /// Run one tick: sample, bias update, predict, optional correct, publish.
    ///
    /// Calibrates first if the engine has not been calibrated yet.
    pub fn tick(&mut self) -> Result<TickReport> {
        if self.localizer.is_none() {
            self.calibrate();
        }

        let (sample, fresh_sample) = self.acquire_sample()?;
        if fresh_sample {
            self.accel_bias.filter(sample.planar_acceleration());
        }

        let accel_bias = self.accel_bias.bias();
        let gyro_bias = self.gyro_bias;
        let fix = self.handle.corrections.take();

        let localizer = self
            .localizer
            .as_mut()
            .ok_or(EstimatorError::UninitializedSample)?;
        localizer.predict(accel_bias, gyro_bias, &sample);

        let correction = match fix {
            None => CorrectionOutcome::Idle,
            Some(fix) => match localizer.correct(&fix) {
                Ok(()) => {
                    // The tf parent follows the last fix actually fused
                    self.origin_frame = fix.frame_id;
                    CorrectionOutcome::Applied
                }
                Err(e) => {
                    warn!("{}", e);
                    CorrectionOutcome::Skipped
                }
            },
        };

        let estimate = self.estimate();
        debug!(
            "#{} pose ({:.3}, {:.3}) heading {:.3}",
            estimate.seq, estimate.position.x, estimate.position.y, estimate.heading
        );
        if let Err(e) = self.publisher.publish(&estimate) {
            warn!("{}", e);
        }

        let report = TickReport {
            seq: self.seq,
            fresh_sample,
            correction,
        };
        self.seq += 1;
        Ok(report)
    }

    /// Snapshot of the current estimate
    pub fn estimate(&self) -> StateEstimate {
        let state = self
            .state()
            .cloned()
            .unwrap_or_else(|| EstimatorState::at_rest(Vector2::zeros(), 0.0, &self.config));
        StateEstimate {
            seq: self.seq,
            position: state.position,
            velocity: state.velocity,
            heading: state.heading,
            linear_covariance: state.linear_covariance,
            angular_covariance: state.angular_covariance,
            frame_id: self.origin_frame.clone(),
            child_frame_id: self.lifecycle.name.clone(),
        }
    }

    /// Loop until shutdown. Recalibration requests are honoured at the top of
    /// each tick; shutdown is checked after publishing, before sleeping.
    pub fn run(&mut self) {
        info!("{}: estimator loop starting", self.name());
        while !self.handle.is_shutdown() {
            if self.handle.recalibrate.take() {
                info!("{}: recalibration requested", self.name());
                if self.lifecycle.transition(State::Recalibrating) {
                    self.localizer = None;
                }
            }

            match self.tick() {
                Ok(_) => {}
                Err(EstimatorError::UninitializedSample) => break,
                Err(e) => warn!("Tick failed: {}", e),
            }

            if self.handle.is_shutdown() {
                break;
            }
            self.pacer.sleep();
        }
        self.lifecycle.transition(State::Finalized);
        info!("{}: estimator loop stopped after {} ticks", self.name(), self.seq);
    }
}
