//! Error types for autonomous_driving
//!
//! Planning failure, planning cancellation and controller non-convergence are
//! normal outcomes and are reported through outcome enums, not through this type.

use thiserror::Error;

/// Main error type for the planning-and-control pipeline
#[derive(Debug, Error)]
pub enum DriveError {
    /// Invalid configuration or argument
    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),
    /// Trajectory that cannot be tracked (too short, zero directions, ...)
    #[error("Invalid trajectory: {0}")]
    InvalidTrajectory(String),
    /// Numerical computation failed (factorisation, spline fit, etc.)
    #[error("Numerical error: {0}")]
    NumericalError(String),
    /// A component channel was closed unexpectedly
    #[error("Channel error: {0}")]
    Channel(String),
}

/// Result type alias for fallible operations
pub type DriveResult<T> = Result<T, DriveError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = DriveError::InvalidTrajectory("needs at least two points".to_string());
        assert_eq!(format!("{}", err), "Invalid trajectory: needs at least two points");
    }

    #[test]
    fn test_result_alias() {
        fn check(value: f64) -> DriveResult<f64> {
            if value > 0.0 {
                Ok(value)
            } else {
                Err(DriveError::InvalidParameter(format!("{} must be positive", value)))
            }
        }
        assert!(check(1.0).is_ok());
        assert!(matches!(check(-1.0), Err(DriveError::InvalidParameter(_))));
    }
}
