//! Common utilities and types for the Zumy robot
pub mod rate;

use nalgebra::{Quaternion, UnitQuaternion};
use std::f64::consts::{PI, TAU};

/// Reduce an angle to `(-pi, pi]`
pub fn wrap_angle(angle: f64) -> f64 {
    let reduced = angle.rem_euclid(TAU);
    if reduced > PI {
        reduced - TAU
    } else {
        reduced
    }
}

/// Yaw of a quaternion given as (x, y, z, w)
///
/// A degenerate all-zero quaternion yields zero heading.
pub fn yaw_from_quaternion(x: f64, y: f64, z: f64, w: f64) -> f64 {
    let q = Quaternion::new(w, x, y, z);
    if q.norm() == 0.0 {
        return 0.0;
    }
    UnitQuaternion::from_quaternion(q).euler_angles().2
}

/// Quaternion (x, y, z, w) for a pure rotation about the vertical axis
pub fn quaternion_from_yaw(yaw: f64) -> (f64, f64, f64, f64) {
    (0.0, 0.0, (yaw / 2.0).sin(), (yaw / 2.0).cos())
}
