//! Perception module for the Zumy robot
pub mod calibration;
pub mod filters;
pub mod localization;
pub mod mailbox;
pub mod sensors;

pub use self::calibration::{calibrate, CalibrationResult};
pub use self::filters::{BiasTracker, Filter};
pub use self::localization::{EstimatorState, Localizer, NoiseModel};
pub use self::mailbox::{CorrectionMailbox, EventFlag, PoseCorrection};
pub use self::sensors::{ImuSample, ImuSource, SampleCache, ScriptedImu};
