//! Vertical altitude/velocity estimation for a flight computer
//!
//! An absolute-orientation IMU and a BMP180 barometer (plus an optional GPS)
//! are fused by two scalar Kalman estimates running on independent loops. See
//! [`orchestrator::FusionOrchestrator`] for the runtime and
//! [`sensor_fusion::FusionCore`] for the correction laws.

pub mod barometer;
pub mod bmp180;
pub mod error;
pub mod filters;
pub mod health_monitor;
pub mod imu;
pub mod live_status;
pub mod orchestrator;
pub mod orientation;
pub mod sensor_fusion;
pub mod sensors;
pub mod sim;
pub mod smoothing;
pub mod types;

pub use error::{FusionError, FusionResult, SensorError, SensorResult};
pub use filters::ScalarEstimate;
pub use orchestrator::FusionOrchestrator;
pub use sensor_fusion::FusionConfig;
pub use types::{Estimate, GpsFix, Quaternion, Vec3};
