//! License scanning service contract and its HTTP client.

pub mod client;
pub mod memory;
pub mod poll;
pub mod types;

pub use client::*;
pub use memory::*;
pub use poll::*;
pub use types::*;
