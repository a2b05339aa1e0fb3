//! Output side of the estimator

use crate::common::quaternion_from_yaw;
use crate::error::Result;
use nalgebra::{Matrix4, Vector2};
use parking_lot::Mutex;
use std::sync::Arc;

/// Snapshot published once per tick
#[derive(Debug, Clone, PartialEq)]
pub struct StateEstimate {
    /// Monotonic tick counter
    pub seq: u64,
    pub position: Vector2<f64>,
    pub velocity: Vector2<f64>,
    pub heading: f64,
    /// Covariance over (x, vx, y, vy)
    pub linear_covariance: Matrix4<f64>,
    pub angular_covariance: f64,
    /// Reference frame of the last pose fix
    pub frame_id: String,
    /// This unit's name
    pub child_frame_id: String,
}

impl StateEstimate {
    /// Heading as a quaternion (x, y, z, w) about the vertical axis
    pub fn orientation(&self) -> (f64, f64, f64, f64) {
        quaternion_from_yaw(self.heading)
    }
}

/// Fire-and-forget sink for estimates
pub trait EstimatePublisher: Send {
    fn publish(&mut self, estimate: &StateEstimate) -> Result<()>;
}

/// Keeps every published estimate in memory
#[derive(Debug, Clone, Default)]
pub struct RecordingPublisher {
    published: Arc<Mutex<Vec<StateEstimate>>>,
}

impl RecordingPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Everything published so far
    pub fn published(&self) -> Vec<StateEstimate> {
        self.published.lock().clone()
    }

    pub fn last(&self) -> Option<StateEstimate> {
        self.published.lock().last().cloned()
    }

    pub fn len(&self) -> usize {
        self.published.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.published.lock().is_empty()
    }
}

impl EstimatePublisher for RecordingPublisher {
    fn publish(&mut self, estimate: &StateEstimate) -> Result<()> {
        self.published.lock().push(estimate.clone());
        Ok(())
    }
}
