// Path planning algorithms module

pub mod reeds_shepp_path;
pub mod holonomic_heuristic;
pub mod hybrid_a_star;

pub use holonomic_heuristic::*;
pub use hybrid_a_star::*;
