//! Filtering algorithms for sensor data

use nalgebra::Vector2;

/// A generic filter interface
pub trait Filter<T> {
    /// Feed one input and return the filtered value
    fn filter(&mut self, input: T) -> T;
}

/// First-order low-pass tracker for the planar accelerometer bias.
///
/// Assumes the vehicle averages zero acceleration over the long run, so a
/// sustained real acceleration drifts into the bias estimate.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BiasTracker {
    alpha: f64,
    bias: Vector2<f64>,
}

impl BiasTracker {
    /// Create a tracker seeded with an initial bias
    pub fn new(alpha: f64, initial: Vector2<f64>) -> Self {
        BiasTracker {
            alpha,
            bias: initial,
        }
    }

    /// Current bias estimate
    pub fn bias(&self) -> Vector2<f64> {
        self.bias
    }

    /// Replace the estimate, e.g. after recalibration
    pub fn reset(&mut self, bias: Vector2<f64>) {
        self.bias = bias;
    }

    /// `alpha * previous + (1 - alpha) * sample`
    pub fn update(&mut self, sample: Vector2<f64>) -> Vector2<f64> {
        self.bias = self.alpha * self.bias + (1.0 - self.alpha) * sample;
        self.bias
    }
}

impl Filter<Vector2<f64>> for BiasTracker {
    fn filter(&mut self, input: Vector2<f64>) -> Vector2<f64> {
        self.update(input)
    }
}
