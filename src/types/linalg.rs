//! Linear algebra types for the vertical estimator
//!
//! Vectors and quaternions come straight from nalgebra. The sensor's
//! scalar-first fixed-point words are decoded in [`crate::orientation`].

use nalgebra::{Unit, UnitQuaternion, Vector3};

// ===== Vectors =====
pub type Vec3 = Vector3<f64>;

/// World "up" axis the estimator integrates along.
pub const WORLD_UP: usize = 2;

// ===== Quaternion =====

/// Hamilton quaternion, built scalar first with `Quaternion::new(w, i, j, k)`.
/// Unit norm when decoded from a healthy sensor.
pub type Quaternion = nalgebra::Quaternion<f64>;

/// Rotation of `angle` radians about `axis` (axis need not be normalised).
/// A zero axis gives the identity.
pub fn axis_angle(axis: &Vec3, angle: f64) -> Quaternion {
    match Unit::try_new(*axis, 0.0) {
        Some(axis) => UnitQuaternion::from_axis_angle(&axis, angle).into_inner(),
        None => Quaternion::identity(),
    }
}

/// Every component is finite.
pub fn quaternion_is_finite(q: &Quaternion) -> bool {
    q.coords.iter().all(|c| c.is_finite())
}
