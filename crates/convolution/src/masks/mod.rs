//! Kernel and padding masks.
//!
//! Kernel masks are multiplicative and shaped like the convolution weight
//! `[out, in, k, k]`. Padding masks are `u8` `[batch, len]` tensors with `1`
//! marking padding; grids are zeroed at padded cells rather than filled with
//! `-inf`, since convolutions sum over neighbours.

pub mod causal;
pub mod padding;

pub use causal::{build_kernel_mask, kernel_mask_tensor, live_taps};
pub use padding::{GridMask, PaddingMask};

#[cfg(test)]
mod tests;
