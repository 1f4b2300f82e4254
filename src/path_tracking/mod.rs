// Path Tracking module: reference profiling, MPC and collision monitoring

pub mod reference;
pub mod qp_solver;
pub mod mpc;
pub mod collision_monitor;

pub use reference::ReferenceTrajectory;
pub use qp_solver::{QpProblem, QpSettings, QpSolution, QpStatus};
pub use mpc::*;
pub use collision_monitor::*;
