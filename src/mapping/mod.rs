// Mapping and sensing module

pub mod obstacles;
pub mod map_server;

pub use obstacles::*;
pub use map_server::*;
