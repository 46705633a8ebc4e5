use log::{error, warn};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

#[derive(Debug, Default)]
struct Counters {
    successes: u64,
    failures: u64,
    consecutive_failures: u32,
}

/// Tracks read outcomes for one sampling loop
#[derive(Clone, Debug)]
pub struct SensorHealth {
    pub name: String,
    pub last_update: Arc<Mutex<Instant>>,
    pub silence_threshold: Duration,
    pub failure_limit: u32,
    counters: Arc<Mutex<Counters>>,
}

impl SensorHealth {
    pub fn new(name: &str, silence_threshold_secs: f64, failure_limit: u32) -> Self {
        SensorHealth {
            name: name.to_string(),
            last_update: Arc::new(Mutex::new(Instant::now())),
            silence_threshold: Duration::try_from_secs_f64(silence_threshold_secs.max(0.0)).unwrap_or(Duration::MAX),
            failure_limit,
            counters: Arc::new(Mutex::new(Counters::default())),
        }
    }

    /// Record a good read; clears the failure streak.
    pub fn record_success(&self) {
        if let Ok(mut time) = self.last_update.lock() {
            *time = Instant::now();
        }
        if let Ok(mut c) = self.counters.lock() {
            c.successes += 1;
            c.consecutive_failures = 0;
        }
    }

    /// Record a failed read and return the current failure streak.
    pub fn record_failure(&self) -> u32 {
        self.counters
            .lock()
            .map(|mut c| {
                c.failures += 1;
                c.consecutive_failures = c.consecutive_failures.saturating_add(1);
                c.consecutive_failures
            })
            .unwrap_or(0)
    }

    pub fn time_since_last_update(&self) -> Option<Duration> {
        self.last_update.lock().ok().map(|t| t.elapsed())
    }

    pub fn is_silent(&self) -> bool {
        self.time_since_last_update()
            .map(|d| d > self.silence_threshold)
            .unwrap_or(false)
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.counters.lock().map(|c| c.consecutive_failures).unwrap_or(0)
    }

    /// Failure streak has reached the limit (a limit of 0 never trips).
    pub fn is_failed(&self) -> bool {
        self.failure_limit > 0 && self.consecutive_failures() >= self.failure_limit
    }

    fn status(&self) -> LoopHealth {
        let (successes, failures, consecutive_failures) = self
            .counters
            .lock()
            .map(|c| (c.successes, c.failures, c.consecutive_failures))
            .unwrap_or_default();
        LoopHealth {
            healthy: !self.is_silent() && !self.is_failed(),
            failed: self.is_failed(),
            silence_secs: self.time_since_last_update().map(|d| d.as_secs_f64()).unwrap_or(0.0),
            successes,
            failures,
            consecutive_failures,
        }
    }
}

/// Health of all estimator loops
#[derive(Clone, Debug)]
pub struct HealthMonitor {
    pub accel: SensorHealth,
    pub baro: SensorHealth,
    pub gps: SensorHealth,
}

impl HealthMonitor {
    pub fn new(accel_silence_secs: f64, baro_silence_secs: f64, gps_silence_secs: f64, accel_failure_limit: u32) -> Self {
        // Baro and GPS have a fallback, so only the accelerometer gets a failure limit
        HealthMonitor {
            accel: SensorHealth::new("Accel", accel_silence_secs, accel_failure_limit),
            baro: SensorHealth::new("Baro", baro_silence_secs, 0),
            gps: SensorHealth::new("GPS", gps_silence_secs, 0),
        }
    }

    pub fn check_health(&self) -> HealthReport {
        HealthReport {
            accel: self.accel.status(),
            baro: self.baro.status(),
            gps: self.gps.status(),
        }
    }

    /// One-line status for logging
    pub fn format_status(&self) -> String {
        let report = self.check_health();
        format!(
            "Health: Accel {} | Baro {} | GPS {}",
            report.accel.describe(),
            report.baro.describe(),
            report.gps.describe()
        )
    }
}

impl Default for HealthMonitor {
    fn default() -> Self {
        Self::new(0.5, 1.0, 5.0, 50)
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct LoopHealth {
    pub healthy: bool,
    pub failed: bool,
    pub silence_secs: f64,
    pub successes: u64,
    pub failures: u64,
    pub consecutive_failures: u32,
}

impl LoopHealth {
    fn describe(&self) -> String {
        if self.failed {
            format!("✗ ({} consecutive failures)", self.consecutive_failures)
        } else if self.healthy {
            "✓".to_string()
        } else {
            format!("⚠ (silent {:.1}s)", self.silence_secs)
        }
    }
}

/// Report of loop health status
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct HealthReport {
    pub accel: LoopHealth,
    pub baro: LoopHealth,
    pub gps: LoopHealth,
}

/// Periodically log silent or failed loops. Runs until the task is dropped.
pub async fn health_monitor_task(monitor: HealthMonitor, check_interval: Duration, gps_enabled: bool) {
    loop {
        tokio::time::sleep(check_interval).await;

        let report = monitor.check_health();

        if report.accel.failed {
            error!(
                "Accel DEAD - {} consecutive read failures, estimate is coasting",
                report.accel.consecutive_failures
            );
        } else if !report.accel.healthy {
            warn!("Accel SILENT for {:.1}s", report.accel.silence_secs);
        }

        if !report.baro.healthy {
            warn!("Baro SILENT for {:.1}s, using smoothed history", report.baro.silence_secs);
        }

        if gps_enabled && !report.gps.healthy {
            warn!("GPS SILENT for {:.1}s", report.gps.silence_secs);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_sensor_health_detection() {
        let health = SensorHealth::new("test", 0.1, 3);

        // Initially healthy (just created)
        assert!(!health.is_silent());

        thread::sleep(Duration::from_millis(150));
        assert!(health.is_silent());

        // Success should reset
        health.record_success();
        assert!(!health.is_silent());
    }

    #[test]
    fn test_failure_streak() {
        let health = SensorHealth::new("test", 10.0, 3);

        assert_eq!(health.record_failure(), 1);
        assert_eq!(health.record_failure(), 2);
        assert!(!health.is_failed());
        assert_eq!(health.record_failure(), 3);
        assert!(health.is_failed());

        health.record_success();
        assert_eq!(health.consecutive_failures(), 0);
        assert!(!health.is_failed());

        let report = health.status();
        assert_eq!(report.failures, 3);
        assert_eq!(report.successes, 1);
    }

    #[test]
    fn test_out_of_range_threshold_saturates() {
        for secs in [1e20, f64::INFINITY] {
            let health = SensorHealth::new("test", secs, 3);
            assert_eq!(health.silence_threshold, Duration::MAX);
            assert!(!health.is_silent());
        }
        assert_eq!(SensorHealth::new("test", -1.0, 3).silence_threshold, Duration::ZERO);
    }

    #[test]
    fn test_zero_limit_never_fails() {
        let health = SensorHealth::new("test", 10.0, 0);
        for _ in 0..100 {
            health.record_failure();
        }
        assert!(!health.is_failed());
    }

    #[test]
    fn test_health_monitor() {
        let monitor = HealthMonitor::default();

        let report = monitor.check_health();
        assert!(report.accel.healthy);
        assert!(report.baro.healthy);

        let status = monitor.format_status();
        assert!(status.contains("✓"));

        // Clones share counters with the loops that hold them
        let accel = monitor.accel.clone();
        for _ in 0..50 {
            accel.record_failure();
        }
        assert!(monitor.check_health().accel.failed);
        assert!(monitor.format_status().contains("✗"));
    }
}
