//! Dense building blocks shared by the grid network.
//!
//! Everything here works on channel-last tensors of arbitrary rank: sequences
//! `(batch, seq, hidden)` and grids `(batch, target, source, hidden)` go
//! through the same code paths. Components take a [`PrecisionPolicy`] for
//! casting and a [`Mode`] wherever behaviour differs between training and
//! evaluation.

pub mod activations;
pub mod checks;
pub mod dtypes;
pub mod linear;
pub mod mlp;
pub mod residual;

pub use activations::ActivationKind;
pub use dtypes::PrecisionPolicy;
pub use linear::{Linear, LinearConfig, LinearInit};
pub use mlp::{FeedForward, FeedForwardConfig};
pub use residual::{Dropout, Mode, Residual};
