pub mod expr;
pub mod matrix;
pub mod plan;
pub mod trigger;
pub mod workflow;

pub use expr::*;
pub use matrix::*;
pub use plan::*;
pub use trigger::*;
pub use workflow::*;
