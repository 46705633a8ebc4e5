//! Dual-rate estimator runtime
//!
//! Three loops run on their own OS threads while the orchestrator is running:
//!
//! - **accel**: owns the [`FusionCore`] outright. Every tick it integrates the
//!   world-vertical acceleration and applies whatever corrections arrived.
//! - **baro**: smooths barometric altitude and sends [`PendingBaro`] records to
//!   the accel loop over a channel. It never touches the estimate.
//! - **gps** (optional): forwards each new receiver fix the same way.
//!
//! Both channels hold a single item. A record the accel loop has not picked up
//! yet is replaced by the next one, so a stalled accel loop never makes the
//! queues grow.
//!
//! Results are published into one mutex-guarded [`TelemetrySnapshot`] that the
//! accessors copy out whole.

use crossbeam::channel::{self, Receiver, Sender, TrySendError};
use log::{debug, error, info, warn};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::barometer::Barometer;
use crate::error::{FusionError, FusionResult};
use crate::filters::ScalarEstimate;
use crate::health_monitor::{HealthMonitor, HealthReport};
use crate::imu::Imu;
use crate::live_status::{current_timestamp, TelemetrySnapshot};
use crate::sensor_fusion::{resync_offset, BaroStage, FusionConfig, FusionCore, GpsStage, PendingBaro, StepReport};
use crate::sensors::{AccelSource, BaroSource, GpsSource};
use crate::types::{Estimate, GpsFix, Quaternion};

type NoGps = Box<dyn GpsSource + Send>;

/// State every loop thread gets a handle to.
#[derive(Clone)]
struct LoopContext {
    config: FusionConfig,
    running: Arc<AtomicBool>,
    shared: Arc<Mutex<TelemetrySnapshot>>,
    health: HealthMonitor,
}

impl LoopContext {
    fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    fn publish(&self) -> MutexGuard<'_, TelemetrySnapshot> {
        self.shared.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

struct Workers {
    accel: JoinHandle<FusionCore>,
    baro: JoinHandle<BaroStage>,
    gps: Option<JoinHandle<()>>,
}

pub struct FusionOrchestrator {
    config: FusionConfig,
    running: Arc<AtomicBool>,
    shared: Arc<Mutex<TelemetrySnapshot>>,
    health: HealthMonitor,
    // Parked here while stopped, moved into the loops while running
    core: Option<FusionCore>,
    baro_stage: Option<BaroStage>,
    workers: Option<Workers>,
    // Initial state, for recovering from a panicked accel loop
    seed: FusionCore,
}

impl FusionOrchestrator {
    /// Estimator seeded at `initial_altitude` with default loop settings.
    pub fn new(
        initial_altitude: f64,
        accel_weight: f64,
        baro_weight: f64,
        baro_vel_weight: f64,
        gps_weight: f64,
    ) -> FusionResult<Self> {
        Self::with_config(FusionConfig {
            initial_altitude,
            accel_weight,
            baro_weight,
            baro_vel_weight,
            gps_weight,
            ..FusionConfig::default()
        })
    }

    pub fn with_config(config: FusionConfig) -> FusionResult<Self> {
        let core = FusionCore::new(&config)?;
        let baro_stage = BaroStage::new(config.baro_window, config.initial_altitude);
        let health = HealthMonitor::new(
            config.accel_silence_secs,
            config.baro_silence_secs,
            config.gps_silence_secs,
            config.accel_failure_limit,
        );

        Ok(Self {
            running: Arc::new(AtomicBool::new(false)),
            shared: Arc::new(Mutex::new(TelemetrySnapshot::new(config.initial_altitude))),
            health,
            seed: core.clone(),
            core: Some(core),
            baro_stage: Some(baro_stage),
            workers: None,
            config,
        })
    }

    pub fn config(&self) -> &FusionConfig {
        &self.config
    }

    pub fn is_running(&self) -> bool {
        self.workers.is_some()
    }

    /// Start the accel and baro loops.
    ///
    /// The barometer must already hold a reference point (see
    /// [`Barometer::calibrate`]).
    pub fn start<A, B>(&mut self, imu: Imu<A>, baro: Barometer<B>) -> FusionResult<()>
    where
        A: AccelSource + Send + 'static,
        B: BaroSource + Send + 'static,
    {
        self.launch(imu, baro, None::<NoGps>)
    }

    /// Start the accel and baro loops plus the GPS loop.
    pub fn start_with_gps<A, B, G>(&mut self, imu: Imu<A>, baro: Barometer<B>, gps: G) -> FusionResult<()>
    where
        A: AccelSource + Send + 'static,
        B: BaroSource + Send + 'static,
        G: GpsSource + Send + 'static,
    {
        self.launch(imu, baro, Some(gps))
    }

    fn launch<A, B, G>(&mut self, imu: Imu<A>, baro: Barometer<B>, gps: Option<G>) -> FusionResult<()>
    where
        A: AccelSource + Send + 'static,
        B: BaroSource + Send + 'static,
        G: GpsSource + Send + 'static,
    {
        if self.workers.is_some() {
            return Err(FusionError::AlreadyRunning);
        }
        if baro.reference().is_none() {
            return Err(FusionError::CalibrationFailure(
                "barometer has no reference point".to_string(),
            ));
        }
        let (core, stage) = match (self.core.take(), self.baro_stage.take()) {
            (Some(core), Some(stage)) => (core, stage),
            (core, stage) => {
                self.core = core;
                self.baro_stage = stage;
                return Err(FusionError::AlreadyRunning);
            }
        };

        self.running.store(true, Ordering::Release);
        let ctx = LoopContext {
            config: self.config.clone(),
            running: self.running.clone(),
            shared: self.shared.clone(),
            health: self.health.clone(),
        };

        let (baro_tx, baro_rx) = channel::bounded::<PendingBaro>(1);
        let (gps_tx, gps_rx) = channel::bounded::<GpsFix>(1);
        let baro_stale = baro_rx.clone();
        let gps_stale = gps_rx.clone();

        let accel_ctx = ctx.clone();
        let accel = match thread::Builder::new()
            .name("accel-loop".to_string())
            .spawn(move || accel_loop(imu, core, accel_ctx, baro_rx, gps_rx))
        {
            Ok(handle) => handle,
            Err(e) => {
                // The closure (and the core with it) is gone; rebuild from the last publish
                self.running.store(false, Ordering::Release);
                self.core = Some(self.recover_core());
                self.baro_stage = Some(stage);
                return Err(FusionError::Spawn("accel", e.to_string()));
            }
        };

        let baro_ctx = ctx.clone();
        let baro = match thread::Builder::new()
            .name("baro-loop".to_string())
            .spawn(move || baro_loop(baro, stage, baro_ctx, baro_tx, baro_stale))
        {
            Ok(handle) => handle,
            Err(e) => {
                self.running.store(false, Ordering::Release);
                self.core = Some(accel.join().unwrap_or_else(|_| self.recover_core()));
                self.baro_stage = Some(BaroStage::new(self.config.baro_window, self.last_baro_altitude()));
                return Err(FusionError::Spawn("baro", e.to_string()));
            }
        };

        let gps = match gps {
            Some(source) => {
                let gps_ctx = ctx.clone();
                match thread::Builder::new()
                    .name("gps-loop".to_string())
                    .spawn(move || gps_loop(source, gps_ctx, gps_tx, gps_stale))
                {
                    Ok(handle) => Some(handle),
                    Err(e) => {
                        // Altitude estimation does not depend on GPS
                        warn!("GPS loop not started: {}", e);
                        None
                    }
                }
            }
            None => None,
        };

        self.workers = Some(Workers { accel, baro, gps });
        ctx.publish().running = true;
        info!(
            "Estimator started at {:.2} m (gps {})",
            self.altitude().mean,
            if self.workers.as_ref().is_some_and(|w| w.gps.is_some()) { "on" } else { "off" }
        );
        Ok(())
    }

    /// Ask every loop to finish its current iteration and join them.
    ///
    /// The estimate survives; a later `start` resumes from it.
    pub fn stop(&mut self) -> FusionResult<()> {
        let workers = self.workers.take().ok_or(FusionError::NotRunning)?;
        self.running.store(false, Ordering::Release);

        if let Some(gps) = workers.gps {
            if gps.join().is_err() {
                error!("GPS loop panicked");
            }
        }

        let stage = match workers.baro.join() {
            Ok(stage) => stage,
            Err(_) => {
                error!("Baro loop panicked, smoothing history lost");
                BaroStage::new(self.config.baro_window, self.last_baro_altitude())
            }
        };

        let core = match workers.accel.join() {
            Ok(core) => core,
            Err(_) => {
                error!("Accel loop panicked, resuming from last published estimate");
                self.recover_core()
            }
        };

        self.core = Some(core);
        self.baro_stage = Some(stage);
        self.shared.lock().unwrap_or_else(PoisonError::into_inner).running = false;
        info!(
            "Estimator stopped at {:.2} m, {:.2} m/s",
            self.altitude().mean,
            self.velocity().mean
        );
        Ok(())
    }

    fn recover_core(&self) -> FusionCore {
        let snap = self.read();
        let rebuilt = ScalarEstimate::new(snap.altitude.mean, snap.altitude.variance).and_then(|alt| {
            let vel = ScalarEstimate::new(snap.velocity.mean, snap.velocity.variance)?;
            FusionCore::from_estimates(alt, vel, &self.config)
        });
        rebuilt.unwrap_or_else(|_| self.seed.clone())
    }

    fn read(&self) -> TelemetrySnapshot {
        *self.shared.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // ─── Accessors ───────────────────────────────────────────────────────────

    pub fn altitude(&self) -> Estimate {
        self.read().altitude
    }

    pub fn velocity(&self) -> Estimate {
        self.read().velocity
    }

    /// World-vertical acceleration used by the last accel tick, m/s^2.
    pub fn last_acc(&self) -> f64 {
        self.read().last_acc
    }

    /// Smoothed barometric altitude most recently sent for fusion.
    pub fn last_baro_altitude(&self) -> f64 {
        self.read().last_baro_altitude
    }

    /// Length of the last accel interval, seconds.
    pub fn last_dt(&self) -> f64 {
        self.read().last_dt
    }

    pub fn last_quaternion(&self) -> Quaternion {
        self.read().last_quaternion
    }

    pub fn last_gps(&self) -> Option<GpsFix> {
        self.read().last_gps
    }

    pub fn health(&self) -> HealthReport {
        self.health.check_health()
    }

    /// Shared handle to the per-loop counters, e.g. for a periodic logger.
    pub fn health_monitor(&self) -> &HealthMonitor {
        &self.health
    }

    /// Every accessor value at once, taken under a single lock.
    pub fn snapshot(&self) -> TelemetrySnapshot {
        let mut snap = self.read();
        snap.health = self.health.check_health();
        snap
    }
}

impl Drop for FusionOrchestrator {
    fn drop(&mut self) {
        if self.workers.is_some() {
            let _ = self.stop();
        }
    }
}

fn sleep_remaining(started: Instant, period: Duration) {
    let elapsed = started.elapsed();
    if elapsed < period {
        thread::sleep(period - elapsed);
    }
}

/// Hand `item` to the single-slot channel, evicting an item the consumer has
/// not taken yet. Returns false once the channel is disconnected.
fn send_latest<T>(tx: &Sender<T>, stale: &Receiver<T>, item: T) -> bool {
    let mut item = item;
    loop {
        match tx.try_send(item) {
            Ok(()) => return true,
            Err(TrySendError::Full(back)) => {
                if stale.try_recv().is_ok() {
                    debug!("Replaced an unconsumed record");
                }
                item = back;
            }
            Err(TrySendError::Disconnected(_)) => return false,
        }
    }
}

/// Integrate the accel interval `last_tick..now`, fusing the newest pending
/// barometer record at the instant it was measured.
fn integrate_tick(
    core: &mut FusionCore,
    accel: f64,
    last_tick: Instant,
    now: Instant,
    baro_rx: &Receiver<PendingBaro>,
) -> FusionResult<StepReport> {
    let dt = now.duration_since(last_tick).as_secs_f64();
    let pending = baro_rx.try_iter().last();
    let correction = pending.as_ref().map(|p| (p, resync_offset(last_tick, p.measured_at, dt)));
    core.step(accel, dt, correction)
}

// ─── Loops ───────────────────────────────────────────────────────────────────

fn accel_loop<A: AccelSource>(
    mut imu: Imu<A>,
    mut core: FusionCore,
    ctx: LoopContext,
    baro_rx: Receiver<PendingBaro>,
    gps_rx: Receiver<GpsFix>,
) -> FusionCore {
    let period = ctx.config.accel_period();
    let limit = ctx.config.accel_failure_limit;
    // Resync timer: start of the interval the next tick integrates over
    let mut last_tick = Instant::now();

    while ctx.is_running() {
        let iteration = Instant::now();

        let sample = match imu.read() {
            Ok(sample) => {
                ctx.health.accel.record_success();
                sample
            }
            Err(e) => {
                // The next good tick integrates over the gap
                let streak = ctx.health.accel.record_failure();
                if streak == limit {
                    error!("Accelerometer failed {} times in a row: {}", streak, e);
                } else {
                    debug!("Accelerometer read failed ({} in a row): {}", streak, e);
                }
                sleep_remaining(iteration, period);
                continue;
            }
        };

        let now = Instant::now();
        let dt = now.duration_since(last_tick).as_secs_f64();
        let accel = sample.vertical();

        if let Err(e) = integrate_tick(&mut core, accel, last_tick, now, &baro_rx) {
            warn!("Accel step rejected (a={:.3}, dt={:.4}): {}", accel, dt, e);
        }

        for fix in gps_rx.try_iter() {
            if let Err(e) = core.apply_gps(&fix) {
                warn!("GPS correction rejected (vdop={:.2}): {}", fix.vdop, e);
            }
        }

        last_tick = now;

        {
            let mut snap = ctx.publish();
            snap.timestamp = current_timestamp();
            snap.altitude = core.altitude();
            snap.velocity = core.velocity();
            snap.last_acc = accel;
            snap.last_dt = dt;
            snap.last_quaternion = sample.orientation;
            snap.stats = core.stats();
        }

        sleep_remaining(iteration, period);
    }

    core
}

fn baro_loop<B: BaroSource>(
    mut baro: Barometer<B>,
    mut stage: BaroStage,
    ctx: LoopContext,
    tx: Sender<PendingBaro>,
    stale: Receiver<PendingBaro>,
) -> BaroStage {
    let period = ctx.config.baro_period();
    let retry = period.max(baro.oversampling().conversion_delay());
    let mut last = Instant::now();

    while ctx.is_running() {
        let reading = match baro.read_altitude() {
            Ok(altitude) => {
                ctx.health.baro.record_success();
                Some(altitude)
            }
            Err(e) => {
                let streak = ctx.health.baro.record_failure();
                if streak == 1 {
                    warn!("Barometer read failed, using smoothed history: {}", e);
                } else {
                    debug!("Barometer read failed ({} in a row): {}", streak, e);
                }
                None
            }
        };

        let measured_at = Instant::now();
        let dt = measured_at.duration_since(last).as_secs_f64();
        last = measured_at;

        let failed = reading.is_none();
        if let Some(record) = stage.ingest(reading, dt, measured_at) {
            {
                let mut snap = ctx.publish();
                snap.last_baro_altitude = record.value;
                snap.baro_samples += 1;
                snap.baro_fallbacks = stage.fallbacks();
            }
            if !send_latest(&tx, &stale, record) {
                break;
            }
        }

        thread::sleep(if failed { retry } else { period });
    }

    stage
}

fn gps_loop<G: GpsSource>(mut gps: G, ctx: LoopContext, tx: Sender<GpsFix>, stale: Receiver<GpsFix>) {
    let period = ctx.config.gps_period();
    let mut stage = GpsStage::new();

    while ctx.is_running() {
        let iteration = Instant::now();

        if let Some(fix) = stage.accept(gps.latest_fix()) {
            ctx.health.gps.record_success();
            {
                let mut snap = ctx.publish();
                snap.last_gps = Some(fix);
                snap.gps_fixes += 1;
            }
            if !send_latest(&tx, &stale, fix) {
                break;
            }
        }

        sleep_remaining(iteration, period);
    }
}
