//! Common types, traits, and error definitions for autonomous_driving
//!
//! This module provides the foundational building blocks shared by the
//! planner, the tracker and the coordination layer.

pub mod types;
pub mod traits;
pub mod error;

pub use types::*;
pub use traits::*;
pub use error::*;
