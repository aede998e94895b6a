pub mod checks;
pub mod config;
pub mod doctor;
pub mod events;
pub mod exec;
pub mod job;
pub mod pipeline;
pub mod provision;
pub mod runner;
pub mod scenario;
pub mod scripted;

pub use config::*;
pub use doctor::*;
pub use events::*;
pub use exec::*;
pub use job::*;
pub use pipeline::*;
pub use provision::*;
pub use runner::*;
