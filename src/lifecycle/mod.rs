//! Lifecycle management for the estimator

use tracing::{info, warn};

/// Phase of the estimation state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    /// Built but never calibrated
    Unconfigured,
    /// Sampling the IMU to estimate bias and noise
    Calibrating,
    /// Ticking predict/correct/publish
    Running,
    /// A recalibration was requested; calibration follows
    Recalibrating,
    /// Shut down; no further transitions
    Finalized,
}

impl State {
    /// Whether `next` may follow `self`
    pub fn can_transition_to(self, next: State) -> bool {
        use State::*;
        matches!(
            (self, next),
            (Unconfigured, Calibrating)
                | (Calibrating, Running)
                | (Running, Recalibrating)
                | (Recalibrating, Calibrating)
                | (Unconfigured | Calibrating | Running | Recalibrating, Finalized)
        )
    }
}

/// Tracks and logs the phase of a named component
#[derive(Debug)]
pub struct Lifecycle {
    pub name: String,
    state: State,
}

impl Lifecycle {
    /// Create a new lifecycle in `Unconfigured`
    pub fn new(name: &str) -> Self {
        Lifecycle {
            name: name.to_string(),
            state: State::Unconfigured,
        }
    }

    /// Get the current state
    pub fn get_state(&self) -> State {
        self.state
    }

    /// Move to `next`, refusing transitions the state machine does not allow
    pub fn transition(&mut self, next: State) -> bool {
        if !self.state.can_transition_to(next) {
            warn!(
                "{}: refusing transition {:?} -> {:?}",
                self.name, self.state, next
            );
            return false;
        }
        info!("{}: {:?} -> {:?}", self.name, self.state, next);
        self.state = next;
        true
    }
}
