use altitude_fusion::barometer::Barometer;
use altitude_fusion::bmp180::Bmp180;
use altitude_fusion::health_monitor::health_monitor_task;
use altitude_fusion::imu::Imu;
use altitude_fusion::sim::{FlightProfile, SimClock, SimulatedFlight};
use altitude_fusion::{FusionConfig, FusionOrchestrator};
use anyhow::{Context, Result};
use chrono::Utc;
use clap::Parser;
use log::warn;
use serde::Serialize;
use tokio::time::{interval, Duration, Instant};

// Noise-to-weight factors from flight tuning
const ACCEL_WEIGHT: f64 = 1.0;
const BARO_WEIGHT: f64 = 100.0;
const BARO_VEL_WEIGHT: f64 = 200.0;

#[derive(Parser, Debug)]
#[command(name = "altitude_fusion")]
#[command(about = "Vertical altitude/velocity estimator on a simulated flight", long_about = None)]
struct Args {
    /// Duration in seconds (0 = until Ctrl-C)
    #[arg(long, default_value = "25")]
    duration: u64,

    /// JSON file overriding estimator settings
    #[arg(long)]
    config: Option<String>,

    /// Launch site altitude in metres (overrides the config file)
    #[arg(long)]
    base_altitude: Option<f64>,

    /// Samples for IMU bias, barometer reference and noise estimates
    #[arg(long, default_value = "50")]
    calibration_samples: usize,

    /// Fuse the simulated GPS receiver as well
    #[arg(long)]
    gps: bool,

    /// Print telemetry as JSON lines
    #[arg(long)]
    json: bool,

    /// Write the final telemetry snapshot to this file
    #[arg(long)]
    status_file: Option<String>,
}

#[derive(Serialize)]
struct TelemetryLine {
    t: f64,
    altitude: f64,
    altitude_var: f64,
    velocity: f64,
    velocity_var: f64,
    baro_altitude: f64,
    accel: f64,
    dt: f64,
    truth_altitude: f64,
    truth_velocity: f64,
}

/// Weight from a measured noise figure, falling back to the configured value
/// when the measurement is unusable.
fn derive_weight(name: &str, measured: f64, fallback: f64) -> f64 {
    if measured.is_finite() && measured > 0.0 {
        measured
    } else {
        warn!("{} noise estimate {:.3e} unusable, keeping configured {}", name, measured, fallback);
        fallback
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => FusionConfig::from_json_file(path).with_context(|| format!("loading {}", path))?,
        None => FusionConfig::default(),
    };
    if let Some(alt) = args.base_altitude {
        config.initial_altitude = alt;
    }

    println!("[{}] Altitude Fusion Starting", ts_now());
    println!("  Duration: {} seconds (0=continuous)", args.duration);
    println!("  Base altitude: {:.2} m", config.initial_altitude);
    println!("  GPS: {}", if args.gps { "enabled" } else { "disabled" });

    let flight = SimulatedFlight::new(
        FlightProfile {
            ground_altitude: config.initial_altitude,
            ..FlightProfile::default()
        },
        SimClock::realtime(),
    );
    let samples = args.calibration_samples;
    let interval_10ms = Duration::from_millis(10);

    // Sensor bring-up and calibration on the pad
    println!("[{}] Calibrating sensors ({} samples)...", ts_now(), samples);
    let mut imu = Imu::new(flight.imu_source());
    let confidence = imu.calibration()?;
    println!(
        "  IMU calibration: sys={} gyro={} accel={} mag={}",
        confidence.sys, confidence.gyro, confidence.accel, confidence.mag
    );
    imu.calibrate_static_bias(samples, interval_10ms)
        .context("IMU bias calibration")?;

    let device = Bmp180::init(flight.bmp180_bus()).context("BMP180 init")?;
    let mut baro = Barometer::new(device, config.oversampling);
    baro.calibrate(config.initial_altitude, samples, interval_10ms)
        .context("barometer calibration")?;

    let accel_noise = imu.noise(samples, interval_10ms)?;
    let baro_noise = baro.noise(samples)?;
    config.accel_weight = derive_weight("Accel", accel_noise * ACCEL_WEIGHT, config.accel_weight);
    config.baro_weight = derive_weight("Baro", baro_noise * BARO_WEIGHT, config.baro_weight);
    config.baro_vel_weight = derive_weight("Baro velocity", baro_noise * baro_noise * BARO_VEL_WEIGHT, config.baro_vel_weight);
    println!(
        "  Noise: accel {:.4} m/s^2, baro {:.4} m -> weights {:.4} / {:.4} / {:.4}",
        accel_noise, baro_noise, config.accel_weight, config.baro_weight, config.baro_vel_weight
    );

    let mut orchestrator = FusionOrchestrator::with_config(config)?;
    if args.gps {
        orchestrator.start_with_gps(imu, baro, flight.gps_source())?;
    } else {
        orchestrator.start(imu, baro)?;
    }

    let health_handle = tokio::spawn(health_monitor_task(
        orchestrator.health_monitor().clone(),
        Duration::from_secs(2),
        args.gps,
    ));

    println!(
        "[{}] Running (launch at t={:.1}s, apogee {:.1} m)",
        ts_now(),
        flight.profile.launch_at,
        flight.profile.apogee()
    );

    let start = Instant::now();
    let mut ticker = interval(Duration::from_millis(40));
    let mut peak = f64::MIN;
    let mut worst_error: f64 = 0.0;

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                println!("[{}] Interrupted, stopping...", ts_now());
                break;
            }
            _ = ticker.tick() => {}
        }

        if args.duration > 0 && start.elapsed() >= Duration::from_secs(args.duration) {
            println!("[{}] Duration reached, stopping...", ts_now());
            break;
        }

        let snap = orchestrator.snapshot();
        let truth = flight.truth();
        peak = peak.max(snap.altitude.mean);
        worst_error = worst_error.max((snap.altitude.mean - truth.altitude).abs());

        let line = TelemetryLine {
            t: flight.clock().now(),
            altitude: snap.altitude.mean,
            altitude_var: snap.altitude.variance,
            velocity: snap.velocity.mean,
            velocity_var: snap.velocity.variance,
            baro_altitude: snap.last_baro_altitude,
            accel: snap.last_acc,
            dt: snap.last_dt,
            truth_altitude: truth.altitude,
            truth_velocity: truth.velocity,
        };

        if args.json {
            println!("{}", serde_json::to_string(&line)?);
        } else {
            println!(
                "[{}] t={:6.2}s alt={:8.2}m (±{:.3}) vel={:7.2}m/s baro={:8.2}m acc={:6.2} | truth {:8.2}m {:7.2}m/s",
                ts_now(),
                line.t,
                line.altitude,
                line.altitude_var.sqrt(),
                line.velocity,
                line.baro_altitude,
                line.accel,
                line.truth_altitude,
                line.truth_velocity
            );
        }
    }

    health_handle.abort();
    orchestrator.stop()?;

    let final_snapshot = orchestrator.snapshot();
    if let Some(path) = &args.status_file {
        final_snapshot
            .save(path)
            .with_context(|| format!("writing {}", path))?;
    }

    println!("\n=== Final Stats ===");
    println!("Accel steps: {}", final_snapshot.stats.accel_steps);
    println!(
        "Baro updates: {} ({} fallbacks)",
        final_snapshot.stats.baro_updates, final_snapshot.baro_fallbacks
    );
    println!("GPS updates: {}", final_snapshot.stats.gps_updates);
    println!("Rejected updates: {}", final_snapshot.stats.rejected_updates);
    println!(
        "Peak estimate: {:.2} m (true apogee {:.2} m)",
        peak,
        flight.profile.apogee()
    );
    println!("Worst altitude error: {:.2} m", worst_error);
    println!("{}", orchestrator.health_monitor().format_status());

    Ok(())
}

fn ts_now() -> String {
    Utc::now().format("%H:%M:%S%.3f").to_string()
}
