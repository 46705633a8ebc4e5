//! World-frame vertical acceleration from an absolute-orientation IMU
//!
//! The IMU reports gravity-free linear acceleration in its own body frame plus
//! its attitude. We subtract the static zero-offset measured at rest, then
//! rotate into the world frame and hand the vertical axis to the estimator.

use log::{debug, info};
use std::time::Duration;

use crate::error::{FusionError, FusionResult, SensorError, SensorResult};
use crate::orientation::rotate;
use crate::sensors::AccelSource;
use crate::smoothing::population_std_dev;
use crate::types::{quaternion_is_finite, CalibrationConfidence, Quaternion, Vec3, WORLD_UP};

/// Reported attitude this far from unit norm is treated as garbage.
const MAX_NORM_ERROR: f64 = 0.1;

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ImuSample {
    pub accel_world: Vec3,
    pub orientation: Quaternion,
}

impl ImuSample {
    pub fn vertical(&self) -> f64 {
        self.accel_world[WORLD_UP]
    }
}

pub struct Imu<S> {
    source: S,
    bias: Vec3,
}

impl<S: AccelSource> Imu<S> {
    pub fn new(source: S) -> Self {
        Self {
            source,
            bias: Vec3::zeros(),
        }
    }

    /// Apply a bias measured earlier instead of calibrating now.
    pub fn with_bias(mut self, bias: Vec3) -> Self {
        self.bias = bias;
        self
    }

    pub fn bias(&self) -> Vec3 {
        self.bias
    }

    pub fn source_mut(&mut self) -> &mut S {
        &mut self.source
    }

    fn orientation(&mut self) -> SensorResult<Quaternion> {
        let q = self.source.read_orientation()?;
        // A powered-down fusion core reports all-zero words
        if !quaternion_is_finite(&q) || (q.norm() - 1.0).abs() > MAX_NORM_ERROR {
            return Err(SensorError::NotReady);
        }
        Ok(q.normalize())
    }

    /// Bias-corrected acceleration rotated into the world frame.
    pub fn read(&mut self) -> SensorResult<ImuSample> {
        let body = self.source.read_body_accel()? - self.bias;
        let orientation = self.orientation()?;
        Ok(ImuSample {
            accel_world: rotate(&body, &orientation),
            orientation,
        })
    }

    pub fn vertical_accel(&mut self) -> SensorResult<f64> {
        self.read().map(|s| s.vertical())
    }

    pub fn calibration(&mut self) -> SensorResult<CalibrationConfidence> {
        self.source.read_calibration_confidence()
    }

    pub fn reset(&mut self) -> SensorResult<bool> {
        self.source.reset()
    }

    /// Average `samples` raw body-frame readings taken at rest, `interval`
    /// apart, and use the mean as the zero offset.
    ///
    /// The previous bias stays in effect if any read fails. An exact zero mean
    /// on every axis means the device answers but is not producing data.
    pub fn calibrate_static_bias(&mut self, samples: usize, interval: Duration) -> FusionResult<Vec3> {
        if samples == 0 {
            return Err(FusionError::CalibrationFailure("zero bias samples".to_string()));
        }

        let mut total = Vec3::zeros();
        for i in 0..samples {
            let accel = self.source.read_body_accel().map_err(|e| {
                FusionError::CalibrationFailure(format!("accelerometer read failed at sample {}/{}: {}", i + 1, samples, e))
            })?;
            total += accel;
            self.source.wait(interval);
        }

        let bias = total / samples as f64;
        if bias == Vec3::zeros() {
            return Err(FusionError::CalibrationFailure(
                "accelerometer found, but not transmitting data".to_string(),
            ));
        }

        self.bias = bias;
        info!("IMU static bias: x={:.4} y={:.4} z={:.4}", bias.x, bias.y, bias.z);
        Ok(bias)
    }

    /// Standard deviation of `iter` world-vertical readings.
    pub fn noise(&mut self, iter: usize, interval: Duration) -> FusionResult<f64> {
        let mut values = Vec::with_capacity(iter);
        for _ in 0..iter {
            let a = self.vertical_accel().map_err(|e| {
                FusionError::CalibrationFailure(format!("accelerometer noise sampling failed: {}", e))
            })?;
            values.push(a);
            self.source.wait(interval);
        }

        let noise = population_std_dev(&values)
            .ok_or_else(|| FusionError::CalibrationFailure("zero noise samples".to_string()))?;
        debug!("IMU vertical noise over {} samples: {:.5} m/s^2", iter, noise);
        Ok(noise)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    struct StaticImu {
        accel: Vec3,
        orientation: Quaternion,
        fail_after: Option<usize>,
        reads: usize,
    }

    impl StaticImu {
        fn new(accel: Vec3, orientation: Quaternion) -> Self {
            Self {
                accel,
                orientation,
                fail_after: None,
                reads: 0,
            }
        }
    }

    impl AccelSource for StaticImu {
        fn read_body_accel(&mut self) -> SensorResult<Vec3> {
            self.reads += 1;
            match self.fail_after {
                Some(n) if self.reads > n => Err(SensorError::Bus("timeout".to_string())),
                _ => Ok(self.accel),
            }
        }

        fn read_orientation(&mut self) -> SensorResult<Quaternion> {
            Ok(self.orientation)
        }

        fn read_calibration_confidence(&mut self) -> SensorResult<CalibrationConfidence> {
            Ok(CalibrationConfidence::from_register(0xFF))
        }

        fn reset(&mut self) -> SensorResult<bool> {
            Ok(false)
        }

        fn wait(&mut self, _delay: Duration) {}
    }

    #[test]
    fn test_bias_then_rotate() {
        // Sensor lying on its side: body y points up
        let q = crate::types::axis_angle(&Vec3::x(), std::f64::consts::FRAC_PI_2);
        let mut imu = Imu::new(StaticImu::new(Vec3::new(0.1, 2.05, -0.02), q));
        imu = imu.with_bias(Vec3::new(0.1, 0.05, -0.02));

        let sample = imu.read().unwrap();
        assert_abs_diff_eq!(sample.vertical(), 2.0, epsilon = 1e-9);
        assert_abs_diff_eq!(sample.accel_world.x, 0.0, epsilon = 1e-9);
    }

    #[test]
    fn test_calibrate_static_bias() {
        let mut imu = Imu::new(StaticImu::new(Vec3::new(0.02, -0.01, 0.15), Quaternion::identity()));
        let bias = imu.calibrate_static_bias(10, Duration::from_millis(20)).unwrap();
        assert_abs_diff_eq!(bias, Vec3::new(0.02, -0.01, 0.15), epsilon = 1e-12);
        assert_abs_diff_eq!(imu.vertical_accel().unwrap(), 0.0, epsilon = 1e-12);
    }

    #[test]
    fn test_bias_calibration_failures_keep_old_bias() {
        let mut src = StaticImu::new(Vec3::new(0.3, 0.3, 0.3), Quaternion::identity());
        src.fail_after = Some(3);
        let mut imu = Imu::new(src).with_bias(Vec3::new(1.0, 1.0, 1.0));
        assert!(imu.calibrate_static_bias(5, Duration::ZERO).is_err());
        assert_eq!(imu.bias(), Vec3::new(1.0, 1.0, 1.0));

        let mut silent = Imu::new(StaticImu::new(Vec3::zeros(), Quaternion::identity()));
        assert!(matches!(
            silent.calibrate_static_bias(5, Duration::ZERO),
            Err(FusionError::CalibrationFailure(_))
        ));
        assert!(silent.calibrate_static_bias(0, Duration::ZERO).is_err());
    }

    #[test]
    fn test_zero_quaternion_is_not_ready() {
        let mut imu = Imu::new(StaticImu::new(Vec3::z(), Quaternion::new(0.0, 0.0, 0.0, 0.0)));
        assert_eq!(imu.read(), Err(SensorError::NotReady));
    }

    #[test]
    fn test_noise_of_constant_signal_is_zero() {
        let mut imu = Imu::new(StaticImu::new(Vec3::new(0.0, 0.0, 0.4), Quaternion::identity()));
        assert_abs_diff_eq!(imu.noise(8, Duration::ZERO).unwrap(), 0.0, epsilon = 1e-12);
        assert_eq!(imu.calibration().unwrap().sys, 3);
    }
}
