//! Domain layer for the agent cache
//!
//! Cache identity, bounds and configuration models, the agent port, and the
//! caller-visible error type.

pub mod errors;
pub mod models;
pub mod ports;

pub use errors::{CacheError, CacheResult};
