//! Deterministic simulated flight and sensors
//!
//! Stands in for the hardware in the demo binary and the tests. Every source
//! reads the same [`SimClock`], so the IMU, barometer and GPS describe one
//! consistent trajectory. Readings go through the same quantisation as the
//! real parts: IMU words at 100 LSB per m/s^2 and 2^14 per unit quaternion,
//! BMP180 raw counts that the real compensation has to turn back into Pa.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::barometer::{pressure_at_altitude, CELSIUS_TO_KELVIN};
use crate::bmp180::{
    compensate_pressure, compensate_temperature, CalibrationBlock, Oversampling, CHIP_ID, CTRL_PRESSURE,
    CTRL_TEMPERATURE, REG_CALIB, REG_CTRL, REG_DATA, REG_ID,
};
use crate::error::{SensorError, SensorResult};
use crate::orientation::{decode_quaternion, decode_vector, encode_quaternion, unrotate};
use crate::sensors::{AccelSource, GpsSource, RegisterBus};
use crate::types::{axis_angle, CalibrationConfidence, GpsFix, Quaternion, Vec3};

/// Linear acceleration LSB per m/s^2.
const ACCEL_LSB_PER_MS2: f64 = 100.0;
const GRAVITY: f64 = 9.81;

// ─── Clock ───────────────────────────────────────────────────────────────────

/// Time source shared by all simulated sensors, seconds since start.
#[derive(Clone, Debug)]
pub enum SimClock {
    /// Wall clock; waits really sleep.
    Realtime(Instant),
    /// Advances only through `set`/`advance` and sensor waits.
    Manual(Arc<AtomicU64>),
}

impl SimClock {
    pub fn realtime() -> Self {
        SimClock::Realtime(Instant::now())
    }

    pub fn manual() -> Self {
        SimClock::Manual(Arc::new(AtomicU64::new(0f64.to_bits())))
    }

    pub fn now(&self) -> f64 {
        match self {
            SimClock::Realtime(start) => start.elapsed().as_secs_f64(),
            SimClock::Manual(t) => f64::from_bits(t.load(Ordering::Acquire)),
        }
    }

    /// Jump a manual clock to `t`. No effect on a realtime clock.
    pub fn set(&self, t: f64) {
        if let SimClock::Manual(cell) = self {
            cell.store(t.to_bits(), Ordering::Release);
        }
    }

    pub fn advance(&self, delay: Duration) {
        match self {
            SimClock::Realtime(_) => std::thread::sleep(delay),
            SimClock::Manual(_) => self.set(self.now() + delay.as_secs_f64()),
        }
    }
}

// ─── Flight profile ──────────────────────────────────────────────────────────

/// Pad, powered boost at constant acceleration, ballistic coast, landed.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct FlightProfile {
    pub ground_altitude: f64,
    pub launch_at: f64,
    pub boost_accel: f64,
    pub boost_secs: f64,
}

impl Default for FlightProfile {
    fn default() -> Self {
        Self {
            ground_altitude: 48.0,
            launch_at: 5.0,
            boost_accel: 30.0,
            boost_secs: 2.0,
        }
    }
}

/// Kinematic state at one instant.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct FlightState {
    pub altitude: f64,
    pub velocity: f64,
    pub accel: f64,
}

impl FlightProfile {
    pub fn burnout_velocity(&self) -> f64 {
        self.boost_accel * self.boost_secs
    }

    pub fn burnout_altitude(&self) -> f64 {
        self.ground_altitude + 0.5 * self.boost_accel * self.boost_secs * self.boost_secs
    }

    pub fn apogee(&self) -> f64 {
        let vb = self.burnout_velocity();
        self.burnout_altitude() + vb * vb / (2.0 * GRAVITY)
    }

    /// Seconds after launch when the vehicle is back on the ground.
    pub fn flight_secs(&self) -> f64 {
        let vb = self.burnout_velocity();
        let hb = self.burnout_altitude() - self.ground_altitude;
        // hb + vb t - g t^2 / 2 = 0
        let coast = (vb + (vb * vb + 2.0 * GRAVITY * hb).sqrt()) / GRAVITY;
        self.boost_secs + coast
    }

    pub fn state_at(&self, t: f64) -> FlightState {
        let since_launch = t - self.launch_at;
        if since_launch <= 0.0 || since_launch >= self.flight_secs() {
            return FlightState {
                altitude: self.ground_altitude,
                velocity: 0.0,
                accel: 0.0,
            };
        }

        if since_launch < self.boost_secs {
            let a = self.boost_accel;
            return FlightState {
                altitude: self.ground_altitude + 0.5 * a * since_launch * since_launch,
                velocity: a * since_launch,
                accel: a,
            };
        }

        let tau = since_launch - self.boost_secs;
        let vb = self.burnout_velocity();
        FlightState {
            altitude: self.burnout_altitude() + vb * tau - 0.5 * GRAVITY * tau * tau,
            velocity: vb - GRAVITY * tau,
            accel: -GRAVITY,
        }
    }
}

/// Deterministic zero-mean disturbance for sample `n`.
fn ripple(n: u64, amplitude: f64, rate: f64) -> f64 {
    amplitude * (n as f64 * rate).sin()
}

// ─── Simulated IMU ───────────────────────────────────────────────────────────

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct ImuModel {
    /// Body-to-world mounting attitude
    pub mount: Quaternion,
    /// Constant body-frame offset, m/s^2
    pub bias: Vec3,
    pub noise: f64,
}

impl Default for ImuModel {
    fn default() -> Self {
        Self {
            mount: axis_angle(&Vec3::new(1.0, 0.4, 0.0), 0.12),
            bias: Vec3::new(0.04, -0.03, 0.12),
            noise: 0.05,
        }
    }
}

pub struct SimulatedImu {
    profile: FlightProfile,
    model: ImuModel,
    clock: SimClock,
    samples: u64,
}

impl AccelSource for SimulatedImu {
    fn read_body_accel(&mut self) -> SensorResult<Vec3> {
        self.samples += 1;
        let n = self.samples;
        let state = self.profile.state_at(self.clock.now());
        let world = Vec3::new(
            ripple(n, self.model.noise, 0.9),
            ripple(n, self.model.noise, 1.3),
            state.accel + ripple(n, self.model.noise, 2.1),
        );
        let body = unrotate(&world, &self.model.mount) + self.model.bias;

        let quantise = |x: f64| (x * ACCEL_LSB_PER_MS2).round().clamp(f64::from(i16::MIN), f64::from(i16::MAX)) as i16;
        Ok(decode_vector(
            [quantise(body.x), quantise(body.y), quantise(body.z)],
            ACCEL_LSB_PER_MS2,
        ))
    }

    fn read_orientation(&mut self) -> SensorResult<Quaternion> {
        Ok(decode_quaternion(encode_quaternion(&self.model.mount)))
    }

    fn read_calibration_confidence(&mut self) -> SensorResult<CalibrationConfidence> {
        Ok(CalibrationConfidence::from_register(0xFF))
    }

    fn reset(&mut self) -> SensorResult<bool> {
        self.samples = 0;
        Ok(true)
    }

    fn wait(&mut self, delay: Duration) {
        self.clock.advance(delay);
    }
}

// ─── Simulated BMP180 ────────────────────────────────────────────────────────

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct BaroModel {
    pub ground_pressure: f64,
    pub temperature_c: f64,
    /// Altitude ripple amplitude, m
    pub noise: f64,
    /// Every n-th data read NACKs; 0 disables
    pub dropout_every: u64,
}

impl Default for BaroModel {
    fn default() -> Self {
        Self {
            ground_pressure: 101_325.0,
            temperature_c: 15.0,
            noise: 0.4,
            dropout_every: 0,
        }
    }
}

/// Register bank answering like a BMP180 flying the profile.
pub struct SimulatedBmp180Bus {
    profile: FlightProfile,
    model: BaroModel,
    clock: SimClock,
    calib: CalibrationBlock,
    data: [u8; 3],
    conversions: u64,
    data_reads: u64,
}

impl SimulatedBmp180Bus {
    fn convert(&mut self, command: u8) -> SensorResult<()> {
        self.conversions += 1;
        let ut = raw_temperature_for(self.model.temperature_c, &self.calib)?;

        if command == CTRL_TEMPERATURE {
            self.data = [(ut >> 8) as u8, ut as u8, 0];
            return Ok(());
        }

        let oss = Oversampling::from_bits(command >> 6).ok_or(SensorError::NotReady)?;
        if command & 0x3F != CTRL_PRESSURE {
            return Err(SensorError::Bus(format!("unknown conversion 0x{command:02x}")));
        }

        let altitude = self.profile.state_at(self.clock.now()).altitude + ripple(self.conversions, self.model.noise, 2.7);
        let pressure = pressure_at_altitude(
            altitude,
            self.model.ground_pressure,
            self.model.temperature_c + CELSIUS_TO_KELVIN,
            self.profile.ground_altitude,
        );
        let b5 = compensate_temperature(ut, &self.calib)?.b5;
        let up = raw_pressure_for(pressure, oss, &self.calib, b5)?;
        let raw24 = up << (8 - u32::from(oss.bits()));
        self.data = [(raw24 >> 16) as u8, (raw24 >> 8) as u8, raw24 as u8];
        Ok(())
    }
}

impl RegisterBus for SimulatedBmp180Bus {
    fn write_register(&mut self, reg: u8, data: &[u8]) -> SensorResult<()> {
        match (reg, data.first()) {
            (REG_CTRL, Some(&command)) => self.convert(command),
            _ => Err(SensorError::Bus(format!("unexpected write to 0x{reg:02x}"))),
        }
    }

    fn read_registers(&mut self, reg: u8, buf: &mut [u8]) -> SensorResult<()> {
        match reg {
            REG_ID if buf.len() == 1 => buf[0] = CHIP_ID,
            REG_CALIB if buf.len() <= 22 => buf.copy_from_slice(&self.calib.to_bytes()[..buf.len()]),
            REG_DATA if buf.len() <= 3 => {
                self.data_reads += 1;
                if self.model.dropout_every > 0 && self.data_reads % self.model.dropout_every == 0 {
                    return Err(SensorError::Bus("nack".to_string()));
                }
                buf.copy_from_slice(&self.data[..buf.len()]);
            }
            _ => return Err(SensorError::Bus(format!("unmapped read of 0x{reg:02x}"))),
        }
        Ok(())
    }

    fn delay(&mut self, delay: Duration) {
        self.clock.advance(delay);
    }
}

/// Smallest raw count at which `f(raw)` reaches `target`, for `f` increasing on `[lo, hi]`.
fn bisect<F>(mut lo: u32, mut hi: u32, target: i32, f: F) -> SensorResult<u32>
where
    F: Fn(u32) -> SensorResult<i32>,
{
    if f(hi)? < target {
        return Ok(hi);
    }
    while lo < hi {
        let mid = lo + (hi - lo) / 2;
        if f(mid)? < target {
            lo = mid + 1;
        } else {
            hi = mid;
        }
    }
    Ok(lo)
}

/// Raw UT the device would report at `celsius`.
pub fn raw_temperature_for(celsius: f64, calib: &CalibrationBlock) -> SensorResult<u16> {
    // b5 grows with UT once x1 + md is positive; start just above that point
    let lo = (i64::from(calib.ac6) - i64::from(calib.md) + 1).clamp(0, i64::from(u16::MAX)) as u32;
    let target_b5 = (celsius * 160.0).round() as i32 - 8;
    let ut = bisect(lo, u32::from(u16::MAX), target_b5, |raw| {
        compensate_temperature(raw as u16, calib).map(|t| t.b5)
    })?;
    Ok(ut as u16)
}

/// Raw UP (already shifted by `8 - oss`) that compensates to `pressure_pa`.
pub fn raw_pressure_for(pressure_pa: f64, oss: Oversampling, calib: &CalibrationBlock, b5: i32) -> SensorResult<u32> {
    let bits = 14 + u32::from(oss.bits());
    let target = pressure_pa.round() as i32;
    bisect(1 << bits, (1 << (bits + 2)) - 1, target, |raw| {
        compensate_pressure(raw, oss, calib, b5)
    })
}

// ─── Simulated GPS ───────────────────────────────────────────────────────────

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct GpsModel {
    pub rate_hz: f64,
    pub vdop: f64,
    /// Receiver altitude error, m
    pub offset: f64,
    pub fix_after_secs: f64,
    pub lat: f64,
    pub lon: f64,
}

impl Default for GpsModel {
    fn default() -> Self {
        Self {
            rate_hz: 5.0,
            vdop: 1.8,
            offset: 2.5,
            fix_after_secs: 1.0,
            lat: 51.4769,
            lon: -0.0005,
        }
    }
}

pub struct SimulatedGps {
    profile: FlightProfile,
    model: GpsModel,
    clock: SimClock,
}

impl GpsSource for SimulatedGps {
    fn latest_fix(&mut self) -> Option<GpsFix> {
        let now = self.clock.now();
        if now < self.model.fix_after_secs || self.model.rate_hz <= 0.0 {
            return None;
        }
        // The receiver only produces a new solution every 1/rate seconds
        let epoch = (now * self.model.rate_hz).floor() / self.model.rate_hz;
        let state = self.profile.state_at(epoch);
        Some(GpsFix {
            lat: self.model.lat,
            lon: self.model.lon,
            alt: state.altitude + self.model.offset,
            pdop: self.model.vdop * 1.2,
            hdop: self.model.vdop * 0.6,
            vdop: self.model.vdop,
            time: 120_000.0 + epoch,
        })
    }
}

// ─── Bundle ──────────────────────────────────────────────────────────────────

/// One flight and the sensor models observing it.
#[derive(Clone, Debug)]
pub struct SimulatedFlight {
    pub profile: FlightProfile,
    pub imu: ImuModel,
    pub baro: BaroModel,
    pub gps: GpsModel,
    clock: SimClock,
}

impl SimulatedFlight {
    pub fn new(profile: FlightProfile, clock: SimClock) -> Self {
        Self {
            profile,
            imu: ImuModel::default(),
            baro: BaroModel::default(),
            gps: GpsModel::default(),
            clock,
        }
    }

    pub fn clock(&self) -> &SimClock {
        &self.clock
    }

    pub fn truth(&self) -> FlightState {
        self.profile.state_at(self.clock.now())
    }

    pub fn imu_source(&self) -> SimulatedImu {
        SimulatedImu {
            profile: self.profile,
            model: self.imu,
            clock: self.clock.clone(),
            samples: 0,
        }
    }

    pub fn bmp180_bus(&self) -> SimulatedBmp180Bus {
        SimulatedBmp180Bus {
            profile: self.profile,
            model: self.baro,
            clock: self.clock.clone(),
            calib: CalibrationBlock::DATASHEET_EXAMPLE,
            data: [0; 3],
            conversions: 0,
            data_reads: 0,
        }
    }

    pub fn gps_source(&self) -> SimulatedGps {
        SimulatedGps {
            profile: self.profile,
            model: self.gps,
            clock: self.clock.clone(),
        }
    }
}
