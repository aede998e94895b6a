//! Shared models for the ciflow pipeline: ids, statuses, the job phase
//! machine and the records passed between provisioner, checks and notifier.

pub mod backoff;
pub mod ids;
pub mod model;
pub mod outcomes;
pub mod phase;
pub mod time;
pub mod types;

pub use backoff::*;
pub use ids::*;
pub use model::*;
pub use outcomes::*;
pub use phase::*;
pub use time::*;
pub use types::*;
