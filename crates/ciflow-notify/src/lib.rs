//! Failure notifications: when to send one, what it looks like, and how it
//! is delivered. Shared by every job so the notification block is defined
//! exactly once.

pub mod payload;
pub mod policy;
pub mod webhook;

pub use payload::*;
pub use policy::*;
pub use webhook::*;
