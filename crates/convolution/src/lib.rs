//! Causal masked convolutions over (target, source) grids.
//!
//! Grids are channel-last tensors `[batch, target, source, channels]`. A
//! [`MaskedConv2d`] never lets output cell `(i, j)` depend on target rows
//! after `i`; with double masking it also ignores source columns after `j`.
//!
//! Two calling conventions are supported:
//!
//! * full-grid [`MaskedConv2d::forward`], used for training and for scoring
//!   whole sequences; it keeps no state;
//! * incremental [`MaskedConv2d::forward_cached`], which takes the newest
//!   target row(s) and a [`ConvCache`] holding the trailing rows from earlier
//!   steps. Incremental calls are evaluation-only and fail with
//!   [`GridError::ModeMismatch`] under [`layers::Mode::Train`].
//!
//! Networks built from several convolutions keep one cache slot per layer in a
//! [`StackCache`] bound to the network that created it.

pub mod cache;
pub mod core;
pub mod masked;
pub mod masks;

pub use crate::core::{ConvConfig, GridError};
pub use cache::{next_owner_id, CacheLayout, ConvCache, StackCache};
pub use masked::MaskedConv2d;
pub use masks::{GridMask, PaddingMask};
