//! Streaming delegation to remote workers speaking the control-marker
//! protocol.

pub mod client;
pub mod error;
pub mod relay;

pub use client::{DelegationClient, DelegationConfig};
pub use error::DelegationError;
pub use relay::StreamRelay;
