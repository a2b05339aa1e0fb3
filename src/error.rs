//! Error types for the Zumy estimator

use thiserror::Error;

/// Failure reported by an inertial sample source for a single request
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SensorError {
    #[error("no sample arrived before the request timed out")]
    Timeout,

    #[error("sample source unavailable: {0}")]
    Unavailable(String),
}

/// Estimator error type
///
/// None of these stop the tick loop. They are returned so the caller can log
/// them and keep going.
#[derive(Error, Debug)]
pub enum EstimatorError {
    #[error("IMU sample unavailable this tick: {0}")]
    SampleUnavailable(#[from] SensorError),

    #[error("no IMU sample has been received yet")]
    UninitializedSample,

    #[error("innovation covariance is singular, correction skipped")]
    SingularCovariance,

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Publish failed: {0}")]
    Publish(String),
}

impl From<toml::de::Error> for EstimatorError {
    fn from(e: toml::de::Error) -> Self {
        EstimatorError::Config(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, EstimatorError>;
