//! Incremental caches for step-by-step decoding.
//!
//! Caches hold detached activations: gradients never flow across steps.

pub mod api;
pub mod layout;

pub use api::{next_owner_id, ConvCache, StackCache};
pub use layout::CacheLayout;

#[cfg(test)]
mod tests;
