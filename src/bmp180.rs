//! Bosch BMP180 compensation and register driver
//!
//! The compensation is the datasheet fixed-point algorithm, reproduced with
//! the same intermediate widths: signed 32-bit throughout, unsigned 32-bit for
//! `b4`/`b7`. Multiplications wrap instead of trapping so out-of-range
//! calibration words behave like the reference C rather than panicking.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::{SensorError, SensorResult};
use crate::sensors::{BaroSource, RegisterBus};

pub const CHIP_ID: u8 = 0x55;

pub const REG_CALIB: u8 = 0xAA;
pub const REG_ID: u8 = 0xD0;
pub const REG_CTRL: u8 = 0xF4;
pub const REG_DATA: u8 = 0xF6;

pub const CTRL_TEMPERATURE: u8 = 0x2E;
pub const CTRL_PRESSURE: u8 = 0x34;

pub const CALIBRATION_LEN: usize = 22;

/// Factory calibration words, read once from the device EEPROM.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CalibrationBlock {
    pub ac1: i16,
    pub ac2: i16,
    pub ac3: i16,
    pub ac4: u16,
    pub ac5: u16,
    pub ac6: u16,
    pub b1: i16,
    pub b2: i16,
    pub mb: i16,
    pub mc: i16,
    pub md: i16,
}

impl CalibrationBlock {
    /// Datasheet worked example coefficients.
    pub const DATASHEET_EXAMPLE: CalibrationBlock = CalibrationBlock {
        ac1: 408,
        ac2: -72,
        ac3: -14383,
        ac4: 32741,
        ac5: 32757,
        ac6: 23153,
        b1: 6190,
        b2: 4,
        mb: -32768,
        mc: -8711,
        md: 2868,
    };

    /// Parse the 22-byte big-endian EEPROM dump starting at 0xAA.
    ///
    /// A word of 0x0000 or 0xFFFF means the read did not reach the device.
    pub fn from_bytes(data: &[u8; CALIBRATION_LEN]) -> SensorResult<Self> {
        let mut words = [0u16; CALIBRATION_LEN / 2];
        for (i, word) in words.iter_mut().enumerate() {
            *word = u16::from_be_bytes([data[2 * i], data[2 * i + 1]]);
            if *word == 0x0000 || *word == 0xFFFF {
                return Err(SensorError::InvalidCalibration("blank EEPROM word"));
            }
        }

        Ok(Self {
            ac1: words[0] as i16,
            ac2: words[1] as i16,
            ac3: words[2] as i16,
            ac4: words[3],
            ac5: words[4],
            ac6: words[5],
            b1: words[6] as i16,
            b2: words[7] as i16,
            mb: words[8] as i16,
            mc: words[9] as i16,
            md: words[10] as i16,
        })
    }

    pub fn to_bytes(&self) -> [u8; CALIBRATION_LEN] {
        let words = [
            self.ac1 as u16,
            self.ac2 as u16,
            self.ac3 as u16,
            self.ac4,
            self.ac5,
            self.ac6,
            self.b1 as u16,
            self.b2 as u16,
            self.mb as u16,
            self.mc as u16,
            self.md as u16,
        ];
        let mut out = [0u8; CALIBRATION_LEN];
        for (i, w) in words.iter().enumerate() {
            out[2 * i..2 * i + 2].copy_from_slice(&w.to_be_bytes());
        }
        out
    }
}

/// Pressure oversampling setting (`oss`). More samples, longer conversion.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Oversampling {
    UltraLowPower = 0,
    #[default]
    Standard = 1,
    HighResolution = 2,
    UltraHighResolution = 3,
}

impl Oversampling {
    pub fn from_bits(oss: u8) -> Option<Self> {
        match oss {
            0 => Some(Self::UltraLowPower),
            1 => Some(Self::Standard),
            2 => Some(Self::HighResolution),
            3 => Some(Self::UltraHighResolution),
            _ => None,
        }
    }

    pub fn bits(self) -> u8 {
        self as u8
    }

    /// Maximum conversion time from the datasheet.
    pub fn conversion_delay(self) -> Duration {
        Duration::from_millis(match self {
            Self::UltraLowPower => 5,
            Self::Standard => 8,
            Self::HighResolution => 14,
            Self::UltraHighResolution => 26,
        })
    }
}

/// Result of the temperature stage. `b5` feeds the pressure stage.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct TemperatureReading {
    pub b5: i32,
    pub celsius: f32,
    /// Temperature in 0.1 degC, `(b5 + 8) >> 4`.
    pub tenths: i32,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Compensated {
    pub pressure_pa: i32,
    pub temperature_c: f32,
    pub temperature_tenths: i32,
}

pub fn compensate_temperature(raw_temp: u16, calib: &CalibrationBlock) -> SensorResult<TemperatureReading> {
    let x1 = (i32::from(raw_temp) - i32::from(calib.ac6)).wrapping_mul(i32::from(calib.ac5)) >> 15;
    let divisor = x1 + i32::from(calib.md);
    if divisor == 0 {
        return Err(SensorError::InvalidCalibration("temperature divisor is zero"));
    }
    let x2 = (i32::from(calib.mc) << 11) / divisor;
    let b5 = x1 + x2;

    Ok(TemperatureReading {
        b5,
        celsius: (b5 + 8) as f32 / 160.0,
        tenths: (b5 + 8) >> 4,
    })
}

pub fn compensate_pressure(
    raw_pressure: u32,
    oversampling: Oversampling,
    calib: &CalibrationBlock,
    b5: i32,
) -> SensorResult<i32> {
    let oss = u32::from(oversampling.bits());

    let b6 = b5 - 4000;
    let b6_sq = b6.wrapping_mul(b6) >> 12;

    let x1 = i32::from(calib.b2).wrapping_mul(b6_sq) >> 11;
    let x2 = i32::from(calib.ac2).wrapping_mul(b6) >> 11;
    let x3 = x1 + x2;
    let b3 = (((i32::from(calib.ac1) * 4 + x3) << oss) + 2) >> 2;

    let x1 = i32::from(calib.ac3).wrapping_mul(b6) >> 13;
    let x2 = i32::from(calib.b1).wrapping_mul(b6_sq) >> 16;
    let x3 = (x1 + x2 + 2) >> 2;
    let b4 = u32::from(calib.ac4).wrapping_mul((x3 + 32768) as u32) >> 15;
    if b4 == 0 {
        return Err(SensorError::InvalidCalibration("pressure divisor is zero"));
    }

    let b7 = raw_pressure.wrapping_sub(b3 as u32).wrapping_mul(50000 >> oss);
    let mut p = if b7 < 0x8000_0000 {
        ((b7 << 1) / b4) as i32
    } else {
        ((b7 / b4) * 2) as i32
    };

    let mut x1 = p >> 8;
    x1 = x1.wrapping_mul(x1);
    x1 = x1.wrapping_mul(3038) >> 16;
    let x2 = (-7357i32).wrapping_mul(p) >> 16;
    p += (x1 + x2 + 3791) >> 4;

    Ok(p)
}

/// Raw counts to calibrated pressure (Pa) and temperature (degC).
///
/// `raw_pressure` is the already shifted `UP`, i.e. `raw24 >> (8 - oss)`.
pub fn compensate(
    raw_temp: u16,
    raw_pressure: u32,
    oversampling: Oversampling,
    calib: &CalibrationBlock,
) -> SensorResult<Compensated> {
    let temperature = compensate_temperature(raw_temp, calib)?;
    let pressure_pa = compensate_pressure(raw_pressure, oversampling, calib, temperature.b5)?;

    Ok(Compensated {
        pressure_pa,
        temperature_c: temperature.celsius,
        temperature_tenths: temperature.tenths,
    })
}

/// BMP180 on a register bus.
///
/// Pressure compensation depends on `b5` from the latest temperature
/// conversion, so a temperature read must precede the first pressure read.
pub struct Bmp180<B> {
    bus: B,
    calib: CalibrationBlock,
    oversampling: Oversampling,
    b5: Option<i32>,
}

impl<B: RegisterBus> Bmp180<B> {
    /// Verify the chip id and load the calibration block.
    pub fn init(mut bus: B) -> SensorResult<Self> {
        let mut id = [0u8; 1];
        bus.read_registers(REG_ID, &mut id)?;
        if id[0] != CHIP_ID {
            return Err(SensorError::InvalidChipId(id[0]));
        }

        let mut data = [0u8; CALIBRATION_LEN];
        bus.read_registers(REG_CALIB, &mut data)?;
        let calib = CalibrationBlock::from_bytes(&data)?;

        Ok(Self {
            bus,
            calib,
            oversampling: Oversampling::default(),
            b5: None,
        })
    }

    pub fn calibration(&self) -> &CalibrationBlock {
        &self.calib
    }

    pub fn into_bus(self) -> B {
        self.bus
    }

    fn read_raw_temperature(&mut self) -> SensorResult<u16> {
        let mut raw = [0u8; 2];
        self.bus.read_registers(REG_DATA, &mut raw)?;
        Ok(u16::from_be_bytes(raw))
    }

    fn read_raw_pressure(&mut self) -> SensorResult<u32> {
        let mut raw = [0u8; 3];
        self.bus.read_registers(REG_DATA, &mut raw)?;
        let up = (u32::from(raw[0]) << 16) | (u32::from(raw[1]) << 8) | u32::from(raw[2]);
        Ok(up >> (8 - u32::from(self.oversampling.bits())))
    }

    /// Temperature in 0.1 degC. Call after `start_temp_conversion` and the wait.
    pub fn read_temp_tenths(&mut self) -> SensorResult<i32> {
        let raw = self.read_raw_temperature()?;
        let reading = compensate_temperature(raw, &self.calib)?;
        self.b5 = Some(reading.b5);
        Ok(reading.tenths)
    }
}

impl<B: RegisterBus> BaroSource for Bmp180<B> {
    fn start_pressure_conversion(&mut self, oversampling: Oversampling) -> SensorResult<()> {
        self.oversampling = oversampling;
        self.bus
            .write_register(REG_CTRL, &[CTRL_PRESSURE | (oversampling.bits() << 6)])
    }

    fn read_pressure(&mut self) -> SensorResult<i32> {
        let b5 = self.b5.ok_or(SensorError::NotReady)?;
        let raw = self.read_raw_pressure()?;
        compensate_pressure(raw, self.oversampling, &self.calib, b5)
    }

    fn start_temp_conversion(&mut self) -> SensorResult<()> {
        self.bus.write_register(REG_CTRL, &[CTRL_TEMPERATURE])
    }

    fn read_temp(&mut self) -> SensorResult<f32> {
        let raw = self.read_raw_temperature()?;
        let reading = compensate_temperature(raw, &self.calib)?;
        self.b5 = Some(reading.b5);
        Ok(reading.celsius)
    }

    fn wait(&mut self, delay: Duration) {
        self.bus.delay(delay);
    }
}
