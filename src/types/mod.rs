pub mod linalg;

pub use linalg::*;

use serde::{Deserialize, Serialize};

/// Gaussian point estimate snapshot handed out by the accessors.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Estimate {
    pub mean: f64,
    pub variance: f64,
}

/// Per-subsystem calibration confidence reported by the IMU, each 0..=3.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CalibrationConfidence {
    pub sys: u8,
    pub gyro: u8,
    pub accel: u8,
    pub mag: u8,
}

impl CalibrationConfidence {
    /// Unpack the status byte: sys in bits 7..6, gyro 5..4, accel 3..2, mag 1..0.
    pub fn from_register(reg: u8) -> Self {
        Self {
            sys: (reg >> 6) & 3,
            gyro: (reg >> 4) & 3,
            accel: (reg >> 2) & 3,
            mag: reg & 3,
        }
    }

    pub fn fully_calibrated(&self) -> bool {
        self.sys == 3 && self.gyro == 3 && self.accel == 3 && self.mag == 3
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct GpsFix {
    pub lat: f64,
    pub lon: f64,
    pub alt: f64,
    pub pdop: f64,
    pub hdop: f64,
    pub vdop: f64,
    /// UTC time of fix as reported by the receiver (hhmmss.ss)
    pub time: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_calibration_register_unpack() {
        let c = CalibrationConfidence::from_register(0b11_10_01_00);
        assert_eq!(c.sys, 3);
        assert_eq!(c.gyro, 2);
        assert_eq!(c.accel, 1);
        assert_eq!(c.mag, 0);
        assert!(!c.fully_calibrated());
        assert!(CalibrationConfidence::from_register(0xFF).fully_calibrated());
    }
}
