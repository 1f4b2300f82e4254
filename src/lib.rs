//! autonomous_driving - planning and control pipeline for a car-like vehicle
//!
//! A hybrid A* global planner produces drivable trajectories, a model
//! predictive controller tracks them, and a collision monitor interrupts
//! tracking when the range sensor reveals obstacles on the path. The
//! `mission_planning` module coordinates these with a vehicle simulator.

// Core modules
pub mod common;
pub mod utils;
pub mod vehicle;

// Algorithm modules
pub mod mapping;
pub mod path_planning;
pub mod path_tracking;

// Coordination
pub mod simulation;
pub mod mission_planning;

// Re-export common types for convenience
pub use common::{Direction, Point2D, Pose2D, Trajectory, TrajectoryPoint};
pub use common::{NullProgress, ProgressSink};
pub use common::{DriveError, DriveResult};
pub use mission_planning::{DrivingSession, SessionCommand, SessionConfig, SessionOutput};
