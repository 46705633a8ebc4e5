//! Body-to-world rotation of measured acceleration
//!
//! The IMU reports its attitude as a scalar-first unit quaternion in 2^14
//! fixed point. Acceleration is rotated with `v' = q v q*` so the world
//! vertical component can be fed to the altitude estimator.

use crate::types::{Quaternion, Vec3};

/// One unit of a quaternion component in the sensor's fixed-point encoding.
pub const QUATERNION_SCALE: f64 = 16384.0;

/// Decode `[w, x, y, z]` fixed-point quaternion words.
pub fn decode_quaternion(words: [i16; 4]) -> Quaternion {
    Quaternion::new(
        f64::from(words[0]) / QUATERNION_SCALE,
        f64::from(words[1]) / QUATERNION_SCALE,
        f64::from(words[2]) / QUATERNION_SCALE,
        f64::from(words[3]) / QUATERNION_SCALE,
    )
}

/// Inverse of [`decode_quaternion`], rounding to the nearest word.
pub fn encode_quaternion(q: &Quaternion) -> [i16; 4] {
    let enc = |c: f64| (c * QUATERNION_SCALE).round().clamp(i16::MIN as f64, i16::MAX as f64) as i16;
    [enc(q.w), enc(q.i), enc(q.j), enc(q.k)]
}

/// Decode a raw `[x, y, z]` vector given the sensor's LSB-per-unit scale
/// (e.g. 100 LSB per m/s^2 for linear acceleration).
pub fn decode_vector(words: [i16; 3], lsb_per_unit: f64) -> Vec3 {
    Vec3::new(
        f64::from(words[0]) / lsb_per_unit,
        f64::from(words[1]) / lsb_per_unit,
        f64::from(words[2]) / lsb_per_unit,
    )
}

pub fn cross(a: &Vec3, b: &Vec3) -> Vec3 {
    a.cross(b)
}

/// Rotate `v` by unit quaternion `q` using the double cross product form
/// `v + 2 r x (w v + r x v)` where `r` is the vector part of `q`.
pub fn rotate(v: &Vec3, q: &Quaternion) -> Vec3 {
    let r = q.imag();
    let inner = q.w * v + cross(&r, v);
    v + 2.0 * cross(&r, &inner)
}

/// Same rotation computed as the explicit product `q (0, v) q*`.
pub fn rotate_by_product(v: &Vec3, q: &Quaternion) -> Vec3 {
    (q * Quaternion::from_imag(*v) * q.conjugate()).imag()
}

/// World-frame to body-frame (inverse rotation).
pub fn unrotate(v: &Vec3, q: &Quaternion) -> Vec3 {
    rotate(v, &q.conjugate())
}
