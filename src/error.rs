use thiserror::Error;

/// Failure of a single sensor transaction.
///
/// These are transient by nature: the sampling loops absorb them (fallback or
/// skipped tick) and never let them escape as a fatal fault.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SensorError {
    #[error("Bus transaction failed: {0}")]
    Bus(String),

    #[error("Sensor not ready")]
    NotReady,

    #[error("Unexpected chip id: 0x{0:02x}")]
    InvalidChipId(u8),

    #[error("Invalid calibration data: {0}")]
    InvalidCalibration(&'static str),

    #[error("No data available")]
    NoData,
}

/// Estimator error types
#[derive(Error, Debug, Clone, PartialEq)]
pub enum FusionError {
    #[error("Sensor read failed: {0}")]
    Sensor(#[from] SensorError),

    #[error("Calibration failed: {0}")]
    CalibrationFailure(String),

    #[error("Measurement variance must be strictly positive, got {variance}")]
    DivisionHazard { variance: f64 },

    #[error("Process variance must be finite and non-negative, got {variance}")]
    InvalidProcessNoise { variance: f64 },

    #[error("Non-finite input: {0}")]
    NonFinite(&'static str),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Failed to spawn {0} loop: {1}")]
    Spawn(&'static str, String),

    #[error("Estimator already running")]
    AlreadyRunning,

    #[error("Estimator not running")]
    NotRunning,
}

pub type SensorResult<T> = Result<T, SensorError>;

pub type FusionResult<T> = Result<T, FusionError>;
