use nalgebra::{Rotation2, Vector2, Vector3};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::EnvFilter;
use zumy_core::common::rate::Unpaced;
use zumy_core::estimator::publisher::RecordingPublisher;
use zumy_core::perception::{ImuSample, ImuSource, PoseCorrection};
use zumy_core::{Estimator, EstimatorConfig, SensorError};

const GRAVITY: f64 = 9.81;

/// Ground truth shared between the simulated IMU and the simulated tracker
#[derive(Debug, Clone, Copy, Default)]
struct Truth {
    position: Vector2<f64>,
    velocity: Vector2<f64>,
    heading: f64,
}

/// IMU on a robot that sits still through calibration, accelerates, then
/// turns. Every seventh request goes unanswered.
struct SimulatedImu {
    dt: f64,
    step: u64,
    calibration_steps: u64,
    truth: Arc<Mutex<Truth>>,
}

impl SimulatedImu {
    fn body_input(&self, t: f64) -> (Vector2<f64>, f64) {
        match t {
            t if t < 2.0 => (Vector2::new(0.2, 0.0), 0.0),
            t if t < 4.0 => (Vector2::zeros(), 0.4),
            _ => (Vector2::new(-0.1, 0.0), 0.0),
        }
    }

    /// Deterministic sensor jitter
    fn jitter(&self, phase: f64) -> f64 {
        0.01 * (self.step as f64 * 1.7 + phase).sin()
    }
}

impl ImuSource for SimulatedImu {
    fn name(&self) -> &str {
        "simulated_imu"
    }

    fn fetch(&mut self, _timeout: Duration) -> Result<ImuSample, SensorError> {
        self.step += 1;
        let (accel, omega) = if self.step <= self.calibration_steps {
            (Vector2::zeros(), 0.0)
        } else {
            let t = (self.step - self.calibration_steps) as f64 * self.dt;
            let (accel, omega) = self.body_input(t);
            let mut truth = self.truth.lock();
            let world = Rotation2::new(truth.heading) * accel;
            let velocity = truth.velocity;
            truth.position += velocity * self.dt + 0.5 * world * self.dt * self.dt;
            truth.velocity += world * self.dt;
            truth.heading += omega * self.dt;
            (accel, omega)
        };

        if self.step % 7 == 0 {
            return Err(SensorError::Timeout);
        }
        Ok(ImuSample::new(
            Vector3::new(accel.x + self.jitter(0.0), accel.y + self.jitter(1.0), GRAVITY),
            Vector3::new(0.0, 0.0, omega + self.jitter(2.0)),
        ))
    }
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("zumy_core=info")),
        )
        .init();

    info!("Initializing simulated Zumy estimator...");

    let config = EstimatorConfig {
        calibration_secs: 2.0,
        ..EstimatorConfig::default()
    };
    let truth = Arc::new(Mutex::new(Truth::default()));
    let imu = SimulatedImu {
        dt: config.dt(),
        step: 0,
        calibration_steps: config.calibration_samples() as u64,
        truth: Arc::clone(&truth),
    };
    let publisher = RecordingPublisher::new();
    let mut estimator = Estimator::new(
        "zumy_sim",
        config,
        Box::new(imu),
        Box::new(publisher.clone()),
        Box::new(Unpaced),
    );
    let handle = estimator.handle();

    for tick in 0..80 {
        if tick % 10 == 5 {
            let t = *truth.lock();
            handle.submit_correction(PoseCorrection::new(t.position, t.heading, "usb_cam"));
        }
        match estimator.tick() {
            Ok(report) => {
                let estimate = estimator.estimate();
                let t = *truth.lock();
                info!(
                    "#{:>3} fresh={} {:?} est=({:+.3}, {:+.3}, {:+.3}) truth=({:+.3}, {:+.3}, {:+.3})",
                    report.seq,
                    report.fresh_sample,
                    report.correction,
                    estimate.position.x,
                    estimate.position.y,
                    estimate.heading,
                    t.position.x,
                    t.position.y,
                    t.heading
                );
            }
            Err(e) => info!("Tick failed: {}", e),
        }
    }

    info!("Published {} estimates", publisher.len());
}
