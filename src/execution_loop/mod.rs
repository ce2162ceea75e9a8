pub mod error_classifier;
pub mod turn_loop;

pub use error_classifier::*;
pub use turn_loop::*;
