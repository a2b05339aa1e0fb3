//! Single-slot handoff between event callbacks and the tick loop
//!
//! Writers overwrite, the reader takes and clears. Only the newest pose fix
//! is ever applied; older unread ones are dropped.

use crate::common::yaw_from_quaternion;
use nalgebra::Vector2;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

/// An absolute pose fix from the tag tracker
#[derive(Debug, Clone, PartialEq)]
pub struct PoseCorrection {
    pub position: Vector2<f64>,
    /// Yaw about the vertical axis in radians
    pub heading: f64,
    /// Reference frame the fix is expressed in
    pub frame_id: String,
}

impl PoseCorrection {
    pub fn new(position: Vector2<f64>, heading: f64, frame_id: &str) -> Self {
        PoseCorrection {
            position,
            heading,
            frame_id: frame_id.to_string(),
        }
    }

    /// Build a fix from a rigid transform. Only x, y and yaw are kept.
    pub fn from_transform(
        translation: (f64, f64, f64),
        rotation: (f64, f64, f64, f64),
        frame_id: &str,
    ) -> Self {
        let (qx, qy, qz, qw) = rotation;
        PoseCorrection::new(
            Vector2::new(translation.0, translation.1),
            yaw_from_quaternion(qx, qy, qz, qw),
            frame_id,
        )
    }
}

#[derive(Debug, Default)]
struct Slot {
    latest: Option<PoseCorrection>,
    dirty: bool,
}

/// Latest-wins mailbox for pose fixes
#[derive(Debug, Default)]
pub struct CorrectionMailbox {
    slot: Mutex<Slot>,
}

impl CorrectionMailbox {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a fix, replacing any unread one
    pub fn post(&self, fix: PoseCorrection) {
        let mut slot = self.slot.lock();
        slot.latest = Some(fix);
        slot.dirty = true;
    }

    /// Take the unread fix, if any, and mark it consumed
    pub fn take(&self) -> Option<PoseCorrection> {
        let mut slot = self.slot.lock();
        if !slot.dirty {
            return None;
        }
        slot.dirty = false;
        slot.latest.clone()
    }

    /// The most recent fix whether or not it has been consumed
    pub fn latest(&self) -> Option<PoseCorrection> {
        self.slot.lock().latest.clone()
    }

    pub fn is_pending(&self) -> bool {
        self.slot.lock().dirty
    }
}

/// A one-bit request raised by an event and cleared by the loop
#[derive(Debug, Default)]
pub struct EventFlag(AtomicBool);

impl EventFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn raise(&self) {
        self.0.store(true, Ordering::Release);
    }

    /// Clear the flag, returning whether it was set
    pub fn take(&self) -> bool {
        self.0.swap(false, Ordering::AcqRel)
    }

    pub fn is_raised(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}
