use serde::{Deserialize, Serialize};
use std::fs;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::health_monitor::HealthReport;
use crate::sensor_fusion::CoreStats;
use crate::types::{Estimate, GpsFix, Quaternion};

/// Everything the accessors expose, published whole by the loops.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq)]
pub struct TelemetrySnapshot {
    pub timestamp: f64,
    pub running: bool,
    // Estimates
    pub altitude: Estimate,
    pub velocity: Estimate,
    // Last raw inputs
    pub last_acc: f64,
    pub last_baro_altitude: f64,
    pub last_dt: f64,
    pub last_quaternion: Quaternion,
    pub last_gps: Option<GpsFix>,
    // Counters
    pub stats: CoreStats,
    pub baro_samples: u64,
    pub baro_fallbacks: u64,
    pub gps_fixes: u64,
    // Health monitoring
    pub health: HealthReport,
}

impl TelemetrySnapshot {
    pub fn new(initial_altitude: f64) -> Self {
        Self {
            timestamp: current_timestamp(),
            running: false,
            altitude: Estimate {
                mean: initial_altitude,
                variance: 0.0,
            },
            velocity: Estimate::default(),
            last_acc: 0.0,
            last_baro_altitude: initial_altitude,
            last_dt: 0.0,
            last_quaternion: Quaternion::identity(),
            last_gps: None,
            stats: CoreStats::default(),
            baro_samples: 0,
            baro_fallbacks: 0,
            gps_fixes: 0,
            health: HealthReport::default(),
        }
    }

    pub fn save(&self, path: &str) -> std::io::Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        fs::write(path, json)?;
        Ok(())
    }
}

pub fn current_timestamp() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs_f64()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_snapshot_is_seeded() {
        let snap = TelemetrySnapshot::new(48.0);
        assert_eq!(snap.altitude.mean, 48.0);
        assert_eq!(snap.altitude.variance, 0.0);
        assert_eq!(snap.last_baro_altitude, 48.0);
        assert!(!snap.running);
        assert!(snap.timestamp > 0.0);
    }

    #[test]
    fn test_snapshot_json_shape() {
        let snap = TelemetrySnapshot::new(12.5);
        let value = serde_json::to_value(snap).unwrap();
        assert_eq!(value["altitude"]["mean"], 12.5);
        assert!(value["last_gps"].is_null());
        assert!(value["health"]["accel"]["healthy"].is_boolean());
    }

    #[test]
    fn test_save_writes_json() {
        let path = std::env::temp_dir().join(format!("altitude_fusion_status_{}.json", std::process::id()));
        let path = path.to_string_lossy().to_string();
        TelemetrySnapshot::new(3.0).save(&path).unwrap();
        let text = std::fs::read_to_string(&path).unwrap();
        let back: TelemetrySnapshot = serde_json::from_str(&text).unwrap();
        assert_eq!(back.altitude.mean, 3.0);
        let _ = std::fs::remove_file(&path);
    }
}
