//! Barometric altimeter on top of a pressure/temperature source
//!
//! Altitude is taken relative to a one-time reference point (known altitude,
//! averaged pressure) using the international barometric formula.

use log::{debug, info};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::bmp180::Oversampling;
use crate::error::{FusionError, FusionResult, SensorResult};
use crate::sensors::{BaroSource, TEMPERATURE_CONVERSION_DELAY};
use crate::smoothing::population_std_dev;

/// Exponent `R * L / (g * M)` of the barometric formula.
pub const PRESSURE_EXPONENT: f64 = 0.19022256;
/// Standard temperature lapse rate, K/m.
pub const LAPSE_RATE: f64 = 0.0065;
pub const CELSIUS_TO_KELVIN: f64 = 273.15;

/// `base_altitude + T * ((base_pressure / pressure)^0.19022256 - 1) / 0.0065`
///
/// `temperature` is absolute (K). Pressures share any unit.
pub fn altitude_from_pressure(pressure: f64, base_pressure: f64, temperature: f64, base_altitude: f64) -> f64 {
    base_altitude + temperature * ((base_pressure / pressure).powf(PRESSURE_EXPONENT) - 1.0) / LAPSE_RATE
}

/// Inverse of [`altitude_from_pressure`].
pub fn pressure_at_altitude(altitude: f64, base_pressure: f64, temperature: f64, base_altitude: f64) -> f64 {
    let ratio = 1.0 + (altitude - base_altitude) * LAPSE_RATE / temperature;
    base_pressure / ratio.powf(1.0 / PRESSURE_EXPONENT)
}

/// Calibration point the altitude is measured from.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct BaroReference {
    pub base_altitude: f64,
    pub base_pressure: f64,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct BaroReading {
    pub pressure_pa: i32,
    pub temperature_c: f32,
    pub altitude: f64,
}

pub struct Barometer<S> {
    source: S,
    oversampling: Oversampling,
    reference: Option<BaroReference>,
}

impl<S: BaroSource> Barometer<S> {
    pub fn new(source: S, oversampling: Oversampling) -> Self {
        Self {
            source,
            oversampling,
            reference: None,
        }
    }

    /// Use a previously measured reference instead of calibrating.
    pub fn with_reference(mut self, reference: BaroReference) -> Self {
        self.reference = Some(reference);
        self
    }

    pub fn reference(&self) -> Option<BaroReference> {
        self.reference
    }

    pub fn oversampling(&self) -> Oversampling {
        self.oversampling
    }

    pub fn source_mut(&mut self) -> &mut S {
        &mut self.source
    }

    fn read_temperature(&mut self) -> SensorResult<f32> {
        self.source.start_temp_conversion()?;
        self.source.wait(TEMPERATURE_CONVERSION_DELAY);
        self.source.read_temp()
    }

    fn read_pressure(&mut self) -> SensorResult<i32> {
        self.source.start_pressure_conversion(self.oversampling)?;
        self.source.wait(self.oversampling.conversion_delay());
        self.source.read_pressure()
    }

    /// One temperature + pressure conversion pair. Temperature goes first so the
    /// pressure compensation uses a fresh temperature term.
    pub fn sample(&mut self) -> SensorResult<(i32, f32)> {
        let temperature = self.read_temperature()?;
        let pressure = self.read_pressure()?;
        Ok((pressure, temperature))
    }

    pub fn read(&mut self) -> FusionResult<BaroReading> {
        let reference = self
            .reference
            .ok_or_else(|| FusionError::CalibrationFailure("barometer has no reference point".to_string()))?;
        let (pressure_pa, temperature_c) = self.sample()?;
        if pressure_pa <= 0 {
            return Err(FusionError::NonFinite("non-positive pressure"));
        }

        let altitude = altitude_from_pressure(
            f64::from(pressure_pa),
            reference.base_pressure,
            f64::from(temperature_c) + CELSIUS_TO_KELVIN,
            reference.base_altitude,
        );

        Ok(BaroReading {
            pressure_pa,
            temperature_c,
            altitude,
        })
    }

    pub fn read_altitude(&mut self) -> FusionResult<f64> {
        self.read().map(|r| r.altitude)
    }

    /// Average `iter` pressure samples taken `interval` apart and pin them to
    /// `base_altitude`. Nothing is committed unless every sample succeeds.
    pub fn calibrate(&mut self, base_altitude: f64, iter: usize, interval: Duration) -> FusionResult<BaroReference> {
        if iter == 0 {
            return Err(FusionError::CalibrationFailure("zero calibration samples".to_string()));
        }

        let mut total = 0.0;
        for i in 0..iter {
            let (pressure, _) = self.sample().map_err(|e| {
                FusionError::CalibrationFailure(format!("no data from barometer at sample {}/{}: {}", i + 1, iter, e))
            })?;
            total += f64::from(pressure);
            self.source.wait(interval);
        }

        let base_pressure = total / iter as f64;
        if base_pressure <= 0.0 {
            return Err(FusionError::CalibrationFailure("non-positive base pressure".to_string()));
        }

        let reference = BaroReference {
            base_altitude,
            base_pressure,
        };
        self.reference = Some(reference);
        info!(
            "Barometer calibrated: base pressure {:.1} Pa at {:.2} m ({} samples)",
            base_pressure, base_altitude, iter
        );
        Ok(reference)
    }

    /// Standard deviation of `iter` altitude readings, used to weight the
    /// barometer against the accelerometer.
    pub fn noise(&mut self, iter: usize) -> FusionResult<f64> {
        let mut values = Vec::with_capacity(iter);
        for _ in 0..iter {
            let alt = self.read_altitude().map_err(|e| {
                FusionError::CalibrationFailure(format!("barometer noise sampling failed: {}", e))
            })?;
            values.push(alt);
        }

        let noise = population_std_dev(&values)
            .ok_or_else(|| FusionError::CalibrationFailure("zero noise samples".to_string()))?;
        debug!("Barometer noise over {} samples: {:.4} m", iter, noise);
        Ok(noise)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SensorError;
    use approx::assert_abs_diff_eq;
    use std::collections::VecDeque;

    /// Scripted source: pops one pressure per pressure read, fixed temperature.
    struct ScriptedBaro {
        pressures: VecDeque<SensorResult<i32>>,
        temperature: f32,
        waited: Duration,
    }

    impl ScriptedBaro {
        fn new(pressures: Vec<SensorResult<i32>>) -> Self {
            Self {
                pressures: pressures.into(),
                temperature: 15.0,
                waited: Duration::ZERO,
            }
        }
    }

    impl BaroSource for ScriptedBaro {
        fn start_pressure_conversion(&mut self, _oversampling: Oversampling) -> SensorResult<()> {
            Ok(())
        }

        fn read_pressure(&mut self) -> SensorResult<i32> {
            self.pressures.pop_front().unwrap_or(Err(SensorError::NoData))
        }

        fn start_temp_conversion(&mut self) -> SensorResult<()> {
            Ok(())
        }

        fn read_temp(&mut self) -> SensorResult<f32> {
            Ok(self.temperature)
        }

        fn wait(&mut self, delay: Duration) {
            self.waited += delay;
        }
    }

    #[test]
    fn test_altitude_at_base_pressure_is_base_altitude() {
        assert_abs_diff_eq!(altitude_from_pressure(101325.0, 101325.0, 288.15, 48.0), 48.0, epsilon = 1e-9);
    }

    #[test]
    fn test_hundred_metres_of_standard_atmosphere() {
        let alt = altitude_from_pressure(100129.0, 101325.0, 288.15, 0.0);
        assert!((alt - 100.0).abs() < 1.0, "got {}", alt);
        let lower_pressure_higher = altitude_from_pressure(90000.0, 101325.0, 288.15, 0.0);
        assert!(lower_pressure_higher > alt);
    }

    #[test]
    fn test_pressure_inverse() {
        let p = pressure_at_altitude(350.0, 100000.0, 280.0, 48.0);
        assert_abs_diff_eq!(altitude_from_pressure(p, 100000.0, 280.0, 48.0), 350.0, epsilon = 1e-6);
    }

    #[test]
    fn test_calibrate_averages_pressure() {
        let mut baro = Barometer::new(
            ScriptedBaro::new(vec![Ok(100000), Ok(100010), Ok(100020)]),
            Oversampling::Standard,
        );
        let reference = baro.calibrate(48.0, 3, Duration::from_millis(20)).unwrap();
        assert_abs_diff_eq!(reference.base_pressure, 100010.0, epsilon = 1e-9);
        assert_eq!(reference.base_altitude, 48.0);
        assert_eq!(baro.reference(), Some(reference));
        // three temperature + three pressure conversions + three intervals
        let expected = TEMPERATURE_CONVERSION_DELAY * 3 + Oversampling::Standard.conversion_delay() * 3 + Duration::from_millis(60);
        assert_eq!(baro.source_mut().waited, expected);
    }

    #[test]
    fn test_failed_calibration_keeps_previous_reference() {
        let previous = BaroReference {
            base_altitude: 10.0,
            base_pressure: 101000.0,
        };
        let mut baro = Barometer::new(
            ScriptedBaro::new(vec![Ok(100000), Err(SensorError::NoData)]),
            Oversampling::UltraLowPower,
        )
        .with_reference(previous);

        let err = baro.calibrate(48.0, 3, Duration::ZERO).unwrap_err();
        assert!(matches!(err, FusionError::CalibrationFailure(_)));
        assert_eq!(baro.reference(), Some(previous));

        assert!(baro.calibrate(48.0, 0, Duration::ZERO).is_err());
    }

    #[test]
    fn test_read_requires_reference() {
        let mut baro = Barometer::new(ScriptedBaro::new(vec![Ok(100000)]), Oversampling::Standard);
        assert!(matches!(baro.read(), Err(FusionError::CalibrationFailure(_))));
    }

    #[test]
    fn test_noise_is_std_dev_of_altitude() {
        let reference = BaroReference {
            base_altitude: 0.0,
            base_pressure: 100000.0,
        };
        let mut constant = Barometer::new(ScriptedBaro::new(vec![Ok(100000); 4]), Oversampling::Standard)
            .with_reference(reference);
        assert_abs_diff_eq!(constant.noise(4).unwrap(), 0.0, epsilon = 1e-12);

        let mut jittery = Barometer::new(
            ScriptedBaro::new(vec![Ok(100000), Ok(100012), Ok(99988), Ok(100000)]),
            Oversampling::Standard,
        )
        .with_reference(reference);
        let noise = jittery.noise(4).unwrap();
        // 12 Pa is roughly one metre near sea level
        assert!(noise > 0.5 && noise < 1.5, "got {}", noise);

        let mut failing = Barometer::new(ScriptedBaro::new(vec![Ok(100000)]), Oversampling::Standard)
            .with_reference(reference);
        assert!(failing.noise(2).is_err());
    }
}
