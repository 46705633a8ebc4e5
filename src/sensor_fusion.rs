// sensor_fusion.rs - Pure computation layer for the vertical estimator
//
// Nothing in here spawns threads, sleeps, or touches a sensor. The loops in
// `orchestrator` feed samples in; this module owns the arithmetic:
//   - FusionCore: altitude/velocity estimates and the split-step correction
//   - BaroStage: rolling-average smoothing and implied velocity
//   - GpsStage: fix de-duplication
// That keeps the correction laws unit-testable with synthetic timing.

use log::{debug, warn};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::{Duration, Instant};

use crate::bmp180::Oversampling;
use crate::error::{FusionError, FusionResult};
use crate::filters::ScalarEstimate;
use crate::smoothing::RollingAverage;
use crate::types::{Estimate, GpsFix};

// ─── Configuration ───────────────────────────────────────────────────────────

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FusionConfig {
    // ── Initial state ──
    pub initial_altitude: f64,

    // ── Noise weights ──
    pub accel_weight: f64,
    pub baro_weight: f64,
    pub baro_vel_weight: f64,
    pub gps_weight: f64,

    // ── Loop cadence ──
    pub accel_period_ms: u64,
    pub baro_period_ms: u64,
    pub gps_period_ms: u64,

    // ── Barometer ──
    pub baro_window: usize,
    pub oversampling: Oversampling,

    // ── Health ──
    pub accel_failure_limit: u32,
    pub accel_silence_secs: f64,
    pub baro_silence_secs: f64,
    pub gps_silence_secs: f64,
}

impl Default for FusionConfig {
    fn default() -> Self {
        Self {
            initial_altitude: 48.0,
            accel_weight: 1.0,
            baro_weight: 100.0,
            baro_vel_weight: 200.0,
            gps_weight: 1.0,
            accel_period_ms: 10,
            baro_period_ms: 0,
            gps_period_ms: 200,
            baro_window: 100,
            oversampling: Oversampling::Standard,
            accel_failure_limit: 50,
            accel_silence_secs: 0.5,
            baro_silence_secs: 1.0,
            gps_silence_secs: 5.0,
        }
    }
}

impl FusionConfig {
    /// Load overrides from a JSON file; missing fields keep their defaults.
    pub fn from_json_file(path: impl AsRef<Path>) -> FusionResult<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| FusionError::Config(format!("{}: {}", path.display(), e)))?;
        let config: FusionConfig =
            serde_json::from_str(&text).map_err(|e| FusionError::Config(format!("{}: {}", path.display(), e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> FusionResult<()> {
        if !self.initial_altitude.is_finite() {
            return Err(FusionError::Config("initial_altitude must be finite".to_string()));
        }
        if !self.accel_weight.is_finite() || self.accel_weight < 0.0 {
            return Err(FusionError::Config(format!(
                "accel_weight must be finite and >= 0, got {}",
                self.accel_weight
            )));
        }
        let positive = [
            ("baro_weight", self.baro_weight),
            ("baro_vel_weight", self.baro_vel_weight),
            ("gps_weight", self.gps_weight),
        ];
        for (name, value) in positive {
            if !value.is_finite() || value <= 0.0 {
                return Err(FusionError::Config(format!("{} must be finite and > 0, got {}", name, value)));
            }
        }
        let silences = [
            ("accel_silence_secs", self.accel_silence_secs),
            ("baro_silence_secs", self.baro_silence_secs),
            ("gps_silence_secs", self.gps_silence_secs),
        ];
        for (name, value) in silences {
            if value < 0.0 || Duration::try_from_secs_f64(value).is_err() {
                return Err(FusionError::Config(format!(
                    "{} must be a finite duration >= 0, got {}",
                    name, value
                )));
            }
        }
        if self.accel_period_ms == 0 {
            return Err(FusionError::Config("accel_period_ms must be > 0".to_string()));
        }
        if self.baro_window == 0 {
            return Err(FusionError::Config("baro_window must be > 0".to_string()));
        }
        Ok(())
    }

    pub fn accel_period(&self) -> Duration {
        Duration::from_millis(self.accel_period_ms)
    }

    pub fn baro_period(&self) -> Duration {
        Duration::from_millis(self.baro_period_ms)
    }

    pub fn gps_period(&self) -> Duration {
        Duration::from_millis(self.gps_period_ms)
    }
}

// ─── Handoff records ─────────────────────────────────────────────────────────

/// Barometer correction waiting to be applied by the accel context.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct PendingBaro {
    /// Smoothed barometric altitude
    pub value: f64,
    /// Change of smoothed altitude over the baro interval
    pub implied_velocity: f64,
    /// Baro loop interval, seconds
    pub dt: f64,
    /// When the underlying reading was taken
    pub measured_at: Instant,
}

/// Offset of `measured_at` inside the accel interval that began at `last_tick`,
/// clamped to `[0, dt]`.
pub fn resync_offset(last_tick: Instant, measured_at: Instant, dt: f64) -> f64 {
    measured_at
        .saturating_duration_since(last_tick)
        .as_secs_f64()
        .clamp(0.0, dt.max(0.0))
}

// ─── Fusion core ─────────────────────────────────────────────────────────────

#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct CoreStats {
    pub accel_steps: u64,
    pub baro_updates: u64,
    pub gps_updates: u64,
    pub rejected_updates: u64,
}

#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct StepReport {
    pub baro_applied: bool,
    pub dt_since_resync: Option<f64>,
}

/// Altitude and vertical velocity estimates with their correction laws.
#[derive(Clone, Debug)]
pub struct FusionCore {
    altitude: ScalarEstimate,
    velocity: ScalarEstimate,
    accel_weight: f64,
    baro_weight: f64,
    baro_vel_weight: f64,
    gps_weight: f64,
    stats: CoreStats,
}

impl FusionCore {
    /// Altitude seeded at `config.initial_altitude`, velocity at rest, both certain.
    pub fn new(config: &FusionConfig) -> FusionResult<Self> {
        config.validate()?;
        Self::from_estimates(
            ScalarEstimate::certain(config.initial_altitude)?,
            ScalarEstimate::certain(0.0)?,
            config,
        )
    }

    pub fn from_estimates(altitude: ScalarEstimate, velocity: ScalarEstimate, config: &FusionConfig) -> FusionResult<Self> {
        config.validate()?;
        Ok(Self {
            altitude,
            velocity,
            accel_weight: config.accel_weight,
            baro_weight: config.baro_weight,
            baro_vel_weight: config.baro_vel_weight,
            gps_weight: config.gps_weight,
            stats: CoreStats::default(),
        })
    }

    pub fn altitude(&self) -> Estimate {
        self.altitude.snapshot()
    }

    pub fn velocity(&self) -> Estimate {
        self.velocity.snapshot()
    }

    pub fn stats(&self) -> CoreStats {
        self.stats
    }

    /// Dead-reckon both estimates forward `dt` seconds under constant `accel`.
    ///
    /// Altitude uses the velocity from before this step. Either both estimates
    /// advance or neither does.
    pub fn predict(&mut self, accel: f64, dt: f64) -> FusionResult<()> {
        if !dt.is_finite() || dt < 0.0 {
            return Err(FusionError::NonFinite("predict interval"));
        }
        if !accel.is_finite() {
            return Err(FusionError::NonFinite("acceleration"));
        }

        let mut altitude = self.altitude;
        let mut velocity = self.velocity;
        altitude.predict(
            velocity.mean() * dt + 0.5 * accel * dt * dt,
            self.accel_weight * dt + velocity.variance() * dt,
        )?;
        velocity.predict(accel * dt, self.accel_weight * dt)?;

        self.altitude = altitude;
        self.velocity = velocity;
        Ok(())
    }

    /// Fuse a barometer correction. Variances scale with the baro interval.
    pub fn apply_baro(&mut self, pending: &PendingBaro) -> FusionResult<()> {
        let mut altitude = self.altitude;
        let mut velocity = self.velocity;
        altitude.update(pending.value, self.baro_weight * pending.dt)?;
        velocity.update(pending.implied_velocity, self.baro_vel_weight * pending.dt)?;

        self.altitude = altitude;
        self.velocity = velocity;
        self.stats.baro_updates += 1;
        Ok(())
    }

    /// Fuse a GPS altitude with variance `gps_weight * vdop^2`.
    pub fn apply_gps(&mut self, fix: &GpsFix) -> FusionResult<()> {
        if !fix.vdop.is_finite() || fix.vdop <= 0.0 {
            self.stats.rejected_updates += 1;
            return Err(FusionError::DivisionHazard { variance: fix.vdop });
        }
        let result = self.altitude.update(fix.alt, self.gps_weight * fix.vdop * fix.vdop);
        match result {
            Ok(()) => self.stats.gps_updates += 1,
            Err(_) => self.stats.rejected_updates += 1,
        }
        result
    }

    /// One accel-loop iteration over an interval of `dt` seconds.
    ///
    /// With a pending barometer record whose reading falls `dt_since_resync`
    /// into the interval, the correction is applied at that instant: predict
    /// to it, update, then predict the remainder. A rejected correction is
    /// dropped and the interval is still fully integrated. Any other error
    /// leaves the core as it was.
    pub fn step(&mut self, accel: f64, dt: f64, pending: Option<(&PendingBaro, f64)>) -> FusionResult<StepReport> {
        if !dt.is_finite() || dt < 0.0 {
            return Err(FusionError::NonFinite("step interval"));
        }
        if !accel.is_finite() {
            return Err(FusionError::NonFinite("acceleration"));
        }

        // Work on a copy so a failure part way through commits nothing
        let mut next = self.clone();
        next.stats.accel_steps += 1;

        let Some((record, dt_since_resync)) = pending else {
            next.predict(accel, dt)?;
            *self = next;
            return Ok(StepReport::default());
        };

        let split = if dt_since_resync.is_finite() {
            dt_since_resync.clamp(0.0, dt)
        } else {
            0.0
        };
        next.predict(accel, split)?;

        let baro_applied = match next.apply_baro(record) {
            Ok(()) => true,
            Err(e) => {
                next.stats.rejected_updates += 1;
                warn!("Barometer correction rejected: {}", e);
                false
            }
        };

        next.predict(accel, dt - split)?;
        debug!("Split-step correction at {:.4}s of {:.4}s", split, dt);

        *self = next;
        Ok(StepReport {
            baro_applied,
            dt_since_resync: Some(split),
        })
    }
}

// ─── Barometer stage ─────────────────────────────────────────────────────────

/// Turns raw barometric altitudes into pending corrections.
pub struct BaroStage {
    average: RollingAverage,
    last_filtered: f64,
    fallbacks: u64,
}

impl BaroStage {
    /// `initial_altitude` seeds the previous filtered value used for the first
    /// implied velocity.
    pub fn new(window: usize, initial_altitude: f64) -> Self {
        Self {
            average: RollingAverage::new(window),
            last_filtered: initial_altitude,
            fallbacks: 0,
        }
    }

    pub fn last_filtered(&self) -> f64 {
        self.last_filtered
    }

    pub fn fallbacks(&self) -> u64 {
        self.fallbacks
    }

    pub fn window_len(&self) -> usize {
        self.average.len()
    }

    /// Smooth one reading taken `dt` seconds after the previous iteration.
    ///
    /// A missing or non-finite reading falls back to the current average
    /// without disturbing it. Returns `None` when there is nothing to publish
    /// yet (no history) or `dt` is not a usable interval.
    pub fn ingest(&mut self, reading: Option<f64>, dt: f64, measured_at: Instant) -> Option<PendingBaro> {
        let filtered = match reading {
            Some(altitude) if altitude.is_finite() => self.average.push(altitude),
            _ => {
                self.fallbacks += 1;
                self.average.mean()?
            }
        };

        if !dt.is_finite() || dt <= 0.0 {
            self.last_filtered = filtered;
            return None;
        }

        let implied_velocity = (filtered - self.last_filtered) / dt;
        self.last_filtered = filtered;

        Some(PendingBaro {
            value: filtered,
            implied_velocity,
            dt,
            measured_at,
        })
    }
}

// ─── GPS stage ───────────────────────────────────────────────────────────────

/// Forwards each receiver fix once, keyed on the fix time.
#[derive(Default)]
pub struct GpsStage {
    last_time: Option<f64>,
}

impl GpsStage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn accept(&mut self, fix: Option<GpsFix>) -> Option<GpsFix> {
        let fix = fix?;
        if self.last_time == Some(fix.time) {
            return None;
        }
        self.last_time = Some(fix.time);
        Some(fix)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    fn config(accel_weight: f64) -> FusionConfig {
        FusionConfig {
            initial_altitude: 100.0,
            accel_weight,
            baro_weight: 40.0,
            baro_vel_weight: 80.0,
            ..FusionConfig::default()
        }
    }

    fn core_with(alt: (f64, f64), vel: (f64, f64), accel_weight: f64) -> FusionCore {
        FusionCore::from_estimates(
            ScalarEstimate::new(alt.0, alt.1).unwrap(),
            ScalarEstimate::new(vel.0, vel.1).unwrap(),
            &config(accel_weight),
        )
        .unwrap()
    }

    fn pending(value: f64, implied_velocity: f64, dt: f64) -> PendingBaro {
        PendingBaro {
            value,
            implied_velocity,
            dt,
            measured_at: Instant::now(),
        }
    }

    #[test]
    fn test_predict_double_integrates() {
        let mut core = core_with((100.0, 0.0), (2.0, 0.0), 1.0);
        core.predict(4.0, 0.5).unwrap();
        // alt += v dt + a dt^2 / 2, vel += a dt
        assert_abs_diff_eq!(core.altitude().mean, 100.0 + 1.0 + 0.5, epsilon = 1e-12);
        assert_abs_diff_eq!(core.velocity().mean, 4.0, epsilon = 1e-12);
        // both variances grow by accel_weight * dt, altitude also by old vel variance * dt
        assert_abs_diff_eq!(core.altitude().variance, 0.5, epsilon = 1e-12);
        assert_abs_diff_eq!(core.velocity().variance, 0.5, epsilon = 1e-12);
    }

    #[test]
    fn test_split_step_matches_continuous_integration() {
        // No process noise: fine-grained integration is then exact in both
        // mean and variance, so the two paths must agree completely.
        let record = pending(101.5, 3.0, 0.05);
        let (accel, dt, resync) = (4.0, 0.05, 0.02);

        let mut split = core_with((100.0, 0.3), (2.0, 0.2), 0.0);
        let report = split.step(accel, dt, Some((&record, resync))).unwrap();
        assert!(report.baro_applied);
        assert_eq!(report.dt_since_resync, Some(0.02));

        let mut continuous = core_with((100.0, 0.3), (2.0, 0.2), 0.0);
        let h = 1e-4;
        for _ in 0..200 {
            continuous.predict(accel, h).unwrap();
        }
        continuous.apply_baro(&record).unwrap();
        for _ in 0..300 {
            continuous.predict(accel, h).unwrap();
        }

        assert_abs_diff_eq!(split.altitude().mean, continuous.altitude().mean, epsilon = 1e-9);
        assert_abs_diff_eq!(split.velocity().mean, continuous.velocity().mean, epsilon = 1e-9);
        assert_abs_diff_eq!(split.altitude().variance, continuous.altitude().variance, epsilon = 1e-9);
        assert_abs_diff_eq!(split.velocity().variance, continuous.velocity().variance, epsilon = 1e-9);
    }

    #[test]
    fn test_split_step_closed_form_with_process_noise() {
        let q = 1.5;
        let (a0, pa0, v0, pv0) = (100.0, 0.3, 2.0, 0.2);
        let (accel, dt, s) = (4.0, 0.05, 0.02);
        let record = pending(101.5, 3.0, 0.05);

        let mut core = core_with((a0, pa0), (v0, pv0), q);
        core.step(accel, dt, Some((&record, s))).unwrap();

        // stage 1: [0, s]
        let alt1 = a0 + v0 * s + 0.5 * accel * s * s;
        let palt1 = pa0 + q * s + pv0 * s;
        let vel1 = v0 + accel * s;
        let pvel1 = pv0 + q * s;
        // update at s
        let r_alt = 40.0 * record.dt;
        let r_vel = 80.0 * record.dt;
        let alt2 = (alt1 * r_alt + record.value * palt1) / (palt1 + r_alt);
        let palt2 = 1.0 / (1.0 / palt1 + 1.0 / r_alt);
        let vel2 = (vel1 * r_vel + record.implied_velocity * pvel1) / (pvel1 + r_vel);
        let pvel2 = 1.0 / (1.0 / pvel1 + 1.0 / r_vel);
        // stage 2: [s, dt]
        let rest = dt - s;
        let alt3 = alt2 + vel2 * rest + 0.5 * accel * rest * rest;
        let palt3 = palt2 + q * rest + pvel2 * rest;
        let vel3 = vel2 + accel * rest;
        let pvel3 = pvel2 + q * rest;

        assert_abs_diff_eq!(core.altitude().mean, alt3, epsilon = 1e-10);
        assert_abs_diff_eq!(core.altitude().variance, palt3, epsilon = 1e-10);
        assert_abs_diff_eq!(core.velocity().mean, vel3, epsilon = 1e-10);
        assert_abs_diff_eq!(core.velocity().variance, pvel3, epsilon = 1e-10);
    }

    #[test]
    fn test_split_step_differs_from_late_update() {
        let record = pending(101.5, 3.0, 0.05);
        let mut split = core_with((100.0, 0.3), (2.0, 0.2), 1.0);
        split.step(4.0, 0.05, Some((&record, 0.02))).unwrap();

        let mut late = core_with((100.0, 0.3), (2.0, 0.2), 1.0);
        late.step(4.0, 0.05, Some((&record, 0.05))).unwrap();

        assert!((split.altitude().mean - late.altitude().mean).abs() > 1e-6);
    }

    #[test]
    fn test_rejected_correction_still_integrates() {
        let record = pending(500.0, 0.0, 0.0); // zero baro dt -> zero variance
        let mut core = core_with((100.0, 0.3), (0.0, 0.2), 1.0);
        let report = core.step(0.0, 0.01, Some((&record, 0.005))).unwrap();
        assert!(!report.baro_applied);
        assert_abs_diff_eq!(core.altitude().mean, 100.0, epsilon = 1e-12);
        assert!(core.altitude().variance > 0.3);
        assert_eq!(core.stats().rejected_updates, 1);
        assert_eq!(core.stats().accel_steps, 1);
    }

    #[test]
    fn test_resync_offset_is_clamped() {
        let t0 = Instant::now();
        let later = t0 + Duration::from_millis(20);
        assert_abs_diff_eq!(resync_offset(t0, later, 0.05), 0.02, epsilon = 1e-9);
        // reading older than the interval start
        assert_eq!(resync_offset(later, t0, 0.05), 0.0);
        // reading newer than the interval end
        assert_abs_diff_eq!(resync_offset(t0, t0 + Duration::from_millis(90), 0.05), 0.05, epsilon = 1e-12);
    }

    #[test]
    fn test_gps_update_uses_vdop() {
        let mut core = core_with((100.0, 4.0), (0.0, 1.0), 1.0);
        let fix = GpsFix {
            alt: 110.0,
            vdop: 2.0,
            ..GpsFix::default()
        };
        core.apply_gps(&fix).unwrap();
        // r = 1.0 * 2^2 = 4, equal weights
        assert_abs_diff_eq!(core.altitude().mean, 105.0, epsilon = 1e-12);
        assert_abs_diff_eq!(core.altitude().variance, 2.0, epsilon = 1e-12);

        let bad = GpsFix { vdop: 0.0, ..fix };
        assert!(core.apply_gps(&bad).is_err());
        assert_eq!(core.stats().gps_updates, 1);
        assert_eq!(core.stats().rejected_updates, 1);
    }

    #[test]
    fn test_baro_stage_smooths_and_differentiates() {
        let mut stage = BaroStage::new(100, 48.0);
        let t = Instant::now();

        let first = stage.ingest(Some(48.0), 0.05, t).unwrap();
        assert_eq!(first.value, 48.0);
        assert_eq!(first.implied_velocity, 0.0);

        let second = stage.ingest(Some(50.0), 0.05, t).unwrap();
        assert_abs_diff_eq!(second.value, 49.0, epsilon = 1e-12);
        assert_abs_diff_eq!(second.implied_velocity, 20.0, epsilon = 1e-9);
        assert_eq!(stage.last_filtered(), 49.0);
    }

    #[test]
    fn test_baro_stage_falls_back_on_failure() {
        let mut stage = BaroStage::new(100, 48.0);
        let t = Instant::now();

        // nothing to fall back on yet
        assert!(stage.ingest(None, 0.05, t).is_none());

        stage.ingest(Some(52.0), 0.05, t);
        let fallback = stage.ingest(None, 0.05, t).unwrap();
        assert_eq!(fallback.value, 52.0);
        assert_eq!(fallback.implied_velocity, 0.0);
        assert_eq!(stage.window_len(), 1);
        assert_eq!(stage.fallbacks(), 2);

        assert_eq!(stage.ingest(Some(f64::NAN), 0.05, t).unwrap().value, 52.0);
        assert!(stage.ingest(Some(53.0), 0.0, t).is_none());
    }

    #[test]
    fn test_gps_stage_deduplicates() {
        let mut stage = GpsStage::new();
        let fix = GpsFix {
            time: 120000.0,
            ..GpsFix::default()
        };
        assert!(stage.accept(None).is_none());
        assert!(stage.accept(Some(fix)).is_some());
        assert!(stage.accept(Some(fix)).is_none());
        assert!(stage.accept(Some(GpsFix { time: 120001.0, ..fix })).is_some());
    }

    #[test]
    fn test_config_validation_and_json() {
        assert!(FusionConfig::default().validate().is_ok());
        let bad = FusionConfig {
            baro_weight: 0.0,
            ..FusionConfig::default()
        };
        assert!(matches!(bad.validate(), Err(FusionError::Config(_))));

        let parsed: FusionConfig = serde_json::from_str(r#"{"baro_weight": 12.5, "oversampling": "high_resolution"}"#).unwrap();
        assert_eq!(parsed.baro_weight, 12.5);
        assert_eq!(parsed.oversampling, Oversampling::HighResolution);
        assert_eq!(parsed.accel_period_ms, 10);
    }

    #[test]
    fn test_config_rejects_unrepresentable_silence() {
        for secs in [1e20, f64::INFINITY, f64::NAN, -0.5] {
            let bad = FusionConfig {
                gps_silence_secs: secs,
                ..FusionConfig::default()
            };
            assert!(matches!(bad.validate(), Err(FusionError::Config(_))), "accepted {}", secs);
        }
        let bad = FusionConfig {
            accel_silence_secs: f64::INFINITY,
            ..FusionConfig::default()
        };
        assert!(bad.validate().is_err());
        let bad = FusionConfig {
            baro_silence_secs: 1e30,
            ..FusionConfig::default()
        };
        assert!(FusionCore::new(&bad).is_err());
    }

    #[test]
    fn test_failed_step_leaves_core_untouched() {
        let record = pending(101.0, 1.0, 0.05);
        let mut core = core_with((100.0, 0.3), (2.0, 0.2), 1.0);
        let before = core.clone();

        assert!(core.step(f64::NAN, 0.05, Some((&record, 0.02))).is_err());
        assert!(core.step(4.0, f64::INFINITY, None).is_err());
        assert!(core.step(4.0, -0.01, Some((&record, 0.0))).is_err());

        assert_eq!(core.altitude(), before.altitude());
        assert_eq!(core.velocity(), before.velocity());
        assert_eq!(core.stats(), CoreStats::default());
    }
}
