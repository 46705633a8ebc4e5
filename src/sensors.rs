//! Collaborator interfaces for the sensor hardware
//!
//! The estimator never touches a bus directly. Drivers (or the simulated
//! sources in [`crate::sim`]) implement these traits and are handed to the
//! orchestrator at start.

use std::time::Duration;

use crate::bmp180::Oversampling;
use crate::error::SensorResult;
use crate::types::{CalibrationConfidence, GpsFix, Quaternion, Vec3};

/// Absolute-orientation IMU producing gravity-compensated linear acceleration.
pub trait AccelSource {
    /// Linear acceleration in the sensor body frame, m/s^2, gravity removed.
    fn read_body_accel(&mut self) -> SensorResult<Vec3>;

    /// Body-to-world attitude.
    fn read_orientation(&mut self) -> SensorResult<Quaternion>;

    fn read_calibration_confidence(&mut self) -> SensorResult<CalibrationConfidence>;

    /// Hardware reset. Returns `false` when the device has no reset line.
    fn reset(&mut self) -> SensorResult<bool>;

    /// Pause between calibration samples.
    fn wait(&mut self, delay: Duration) {
        std::thread::sleep(delay);
    }
}

/// Barometric pressure/temperature IC with explicit start/read conversions.
///
/// Callers must wait [`Oversampling::conversion_delay`] (or
/// [`TEMPERATURE_CONVERSION_DELAY`]) between a start and the matching read.
pub trait BaroSource {
    fn start_pressure_conversion(&mut self, oversampling: Oversampling) -> SensorResult<()>;

    /// Compensated pressure in Pa.
    fn read_pressure(&mut self) -> SensorResult<i32>;

    fn start_temp_conversion(&mut self) -> SensorResult<()>;

    /// Compensated temperature in degrees C.
    fn read_temp(&mut self) -> SensorResult<f32>;

    /// Conversion wait. Sources that need no settling time may override this.
    fn wait(&mut self, delay: Duration) {
        std::thread::sleep(delay);
    }
}

pub const TEMPERATURE_CONVERSION_DELAY: Duration = Duration::from_millis(5);

/// Optional GPS receiver. Only the most recent complete fix is exposed.
pub trait GpsSource {
    fn latest_fix(&mut self) -> Option<GpsFix>;
}

/// Byte-level register access used by [`crate::bmp180::Bmp180`].
pub trait RegisterBus {
    /// Write `data` starting at register `reg`.
    fn write_register(&mut self, reg: u8, data: &[u8]) -> SensorResult<()>;

    /// Fill `buf` reading consecutively from register `reg`.
    fn read_registers(&mut self, reg: u8, buf: &mut [u8]) -> SensorResult<()>;

    /// Conversion wait on behalf of the device driver.
    fn delay(&mut self, delay: Duration) {
        std::thread::sleep(delay);
    }
}

impl<T: AccelSource + ?Sized> AccelSource for Box<T> {
    fn read_body_accel(&mut self) -> SensorResult<Vec3> {
        (**self).read_body_accel()
    }

    fn read_orientation(&mut self) -> SensorResult<Quaternion> {
        (**self).read_orientation()
    }

    fn read_calibration_confidence(&mut self) -> SensorResult<CalibrationConfidence> {
        (**self).read_calibration_confidence()
    }

    fn reset(&mut self) -> SensorResult<bool> {
        (**self).reset()
    }

    fn wait(&mut self, delay: Duration) {
        (**self).wait(delay)
    }
}

impl<T: BaroSource + ?Sized> BaroSource for Box<T> {
    fn start_pressure_conversion(&mut self, oversampling: Oversampling) -> SensorResult<()> {
        (**self).start_pressure_conversion(oversampling)
    }

    fn read_pressure(&mut self) -> SensorResult<i32> {
        (**self).read_pressure()
    }

    fn start_temp_conversion(&mut self) -> SensorResult<()> {
        (**self).start_temp_conversion()
    }

    fn read_temp(&mut self) -> SensorResult<f32> {
        (**self).read_temp()
    }

    fn wait(&mut self, delay: Duration) {
        (**self).wait(delay)
    }
}

impl<T: GpsSource + ?Sized> GpsSource for Box<T> {
    fn latest_fix(&mut self) -> Option<GpsFix> {
        (**self).latest_fix()
    }
}
