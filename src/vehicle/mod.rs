// Vehicle model module

pub mod car;

pub use car::*;
