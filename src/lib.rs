//! State estimation for the Zumy robot
//!
//! Fuses IMU dead reckoning with intermittent absolute pose fixes from an
//! overhead tag tracker into a planar pose (x, y, heading) and velocity,
//! updated at a fixed rate.
pub mod common;
pub mod config;
pub mod error;
pub mod estimator;
pub mod lifecycle;
pub mod perception;

pub use crate::config::EstimatorConfig;
pub use crate::error::{EstimatorError, Result, SensorError};
pub use crate::estimator::publisher::{EstimatePublisher, StateEstimate};
pub use crate::estimator::{CorrectionOutcome, Estimator, EstimatorHandle, TickReport};
