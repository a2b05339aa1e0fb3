//! Sensor interfaces for the Zumy robot

use crate::error::SensorError;
use nalgebra::{Vector2, Vector3, Vector6};
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// One filtered IMU reading in the body frame
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct ImuSample {
    /// Linear acceleration (x, y, z) in m/s^2
    pub linear_acceleration: Vector3<f64>,
    /// Angular velocity (x, y, z) in rad/s
    pub angular_velocity: Vector3<f64>,
}

impl ImuSample {
    pub fn new(linear_acceleration: Vector3<f64>, angular_velocity: Vector3<f64>) -> Self {
        ImuSample {
            linear_acceleration,
            angular_velocity,
        }
    }

    /// Planar part of the acceleration
    pub fn planar_acceleration(&self) -> Vector2<f64> {
        self.linear_acceleration.xy()
    }

    /// Rotation rate about the vertical axis
    pub fn yaw_rate(&self) -> f64 {
        self.angular_velocity.z
    }

    /// All six channels, accelerometer first
    pub fn channels(&self) -> Vector6<f64> {
        let a = &self.linear_acceleration;
        let w = &self.angular_velocity;
        Vector6::new(a.x, a.y, a.z, w.x, w.y, w.z)
    }
}

/// A request/response source of the latest IMU reading
pub trait ImuSource: Send {
    /// Get the sensor name
    fn name(&self) -> &str;

    /// Request the latest sample, waiting at most `timeout`
    fn fetch(&mut self, timeout: Duration) -> Result<ImuSample, SensorError>;
}

/// A source that replays a fixed script of responses, then repeats the last
/// one forever. Used by the offline driver and tests.
pub struct ScriptedImu {
    script: VecDeque<Result<ImuSample, SensorError>>,
    last: Result<ImuSample, SensorError>,
}

impl ScriptedImu {
    pub fn new(script: Vec<Result<ImuSample, SensorError>>) -> Self {
        ScriptedImu {
            script: script.into(),
            last: Err(SensorError::Timeout),
        }
    }

    /// A source that always answers with the same sample
    pub fn constant(sample: ImuSample) -> Self {
        ScriptedImu {
            script: VecDeque::new(),
            last: Ok(sample),
        }
    }

    /// Queue another response
    pub fn push(&mut self, response: Result<ImuSample, SensorError>) {
        self.script.push_back(response);
    }
}

impl ImuSource for ScriptedImu {
    fn name(&self) -> &str {
        "scripted_imu"
    }

    fn fetch(&mut self, _timeout: Duration) -> Result<ImuSample, SensorError> {
        if let Some(next) = self.script.pop_front() {
            self.last = next;
        }
        self.last.clone()
    }
}

#[derive(Debug, Default)]
struct CacheSlot {
    sample: Mutex<Option<ImuSample>>,
    ready: Condvar,
}

/// Push-fed IMU source: a subscriber callback stores each reading, and
/// [`ImuSource::fetch`] hands out the newest unread one, waiting up to the
/// timeout for it to arrive. A reading is handed out at most once.
#[derive(Debug, Clone, Default)]
pub struct SampleCache {
    inner: Arc<CacheSlot>,
}

impl SampleCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a reading, replacing any unread one
    pub fn push(&self, sample: ImuSample) {
        *self.inner.sample.lock() = Some(sample);
        self.inner.ready.notify_one();
    }
}

impl ImuSource for SampleCache {
    fn name(&self) -> &str {
        "imu_topic"
    }

    fn fetch(&mut self, timeout: Duration) -> Result<ImuSample, SensorError> {
        let deadline = Instant::now() + timeout;
        let mut slot = self.inner.sample.lock();
        while slot.is_none() {
            if self.inner.ready.wait_until(&mut slot, deadline).timed_out() {
                break;
            }
        }
        slot.take().ok_or(SensorError::Timeout)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_cache_hands_out_each_sample_once() {
        let mut cache = SampleCache::new();
        let sample = ImuSample::new(Vector3::new(0.1, 0.2, 9.8), Vector3::zeros());
        cache.push(sample);
        let timeout = Duration::from_millis(5);
        assert_eq!(cache.fetch(timeout), Ok(sample));
        assert_eq!(cache.fetch(timeout), Err(SensorError::Timeout));
    }

    #[test]
    fn test_cache_waits_for_producer() {
        let mut cache = SampleCache::new();
        let producer = cache.clone();
        let sample = ImuSample::new(Vector3::new(0.0, 0.0, 9.8), Vector3::new(0.0, 0.0, 0.1));
        let writer = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            producer.push(sample);
        });
        assert_eq!(cache.fetch(Duration::from_secs(2)), Ok(sample));
        writer.join().unwrap();
    }

    #[test]
    fn test_sample_channels() {
        let sample = ImuSample::new(Vector3::new(1.0, 2.0, 3.0), Vector3::new(4.0, 5.0, 6.0));
        assert_eq!(sample.channels(), Vector6::new(1.0, 2.0, 3.0, 4.0, 5.0, 6.0));
        assert_eq!(sample.planar_acceleration(), Vector2::new(1.0, 2.0));
        assert_eq!(sample.yaw_rate(), 6.0);
    }

    #[test]
    fn test_scripted_source_repeats_last() {
        let sample = ImuSample::new(Vector3::new(0.1, 0.0, 9.8), Vector3::zeros());
        let mut imu = ScriptedImu::new(vec![Err(SensorError::Timeout), Ok(sample)]);
        let timeout = Duration::from_millis(1);
        assert_eq!(imu.fetch(timeout), Err(SensorError::Timeout));
        assert_eq!(imu.fetch(timeout), Ok(sample));
        assert_eq!(imu.fetch(timeout), Ok(sample));
    }
}
