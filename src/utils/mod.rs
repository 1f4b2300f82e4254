//! Utility modules for autonomous_driving

pub mod spline;

pub use spline::*;
