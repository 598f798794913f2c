//! Configuration and error types shared by every convolution component.
//!
//! Grids use the channel-last layout `[batch, target, source, channels]`
//! throughout; no component permutes to channel-first.

pub mod config;
pub mod errors;

pub use config::ConvConfig;
pub use errors::GridError;
