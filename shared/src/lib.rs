//! Utilities shared between the resolver library and the binary.

pub mod chunk;
pub mod metrics_defs;
pub mod retry;

pub use metrics;
