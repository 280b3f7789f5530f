//! Port trait definitions (Hexagonal Architecture)
//!
//! The cache consumes agents through [`CachedAgent`]; how an agent is built
//! is supplied per call as an async factory.

pub mod agent;

pub use agent::CachedAgent;
