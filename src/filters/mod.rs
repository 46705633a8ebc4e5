/// Estimation filters
///
/// The vertical estimator is built from two independent scalar Gaussians
/// (altitude, vertical velocity) rather than a joint covariance filter.

pub mod scalar;

pub use scalar::ScalarEstimate;
