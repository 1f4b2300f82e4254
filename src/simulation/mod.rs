// Vehicle simulation module

pub mod car_simulator;

pub use car_simulator::*;
