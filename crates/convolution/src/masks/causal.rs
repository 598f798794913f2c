//! Kernel masks for causal convolutions.
//!
//! A kernel tap `(r, c)` of a `k × k` kernel centred at `(half, half)` is live
//! when `r <= half` (it never reads a future target row) and, for double
//! masked kernels, `c <= half` as well.

use candle_core::{DType, Device, Result, Tensor};

/// Row-major `k × k` liveness pattern of a causal kernel.
pub fn build_kernel_mask(kernel_size: usize, double_masked: bool) -> Vec<bool> {
    let half = kernel_size.saturating_sub(1) / 2;
    let mut mask = vec![false; kernel_size * kernel_size];
    for r in 0..kernel_size {
        for c in 0..kernel_size {
            mask[r * kernel_size + c] = r <= half && (!double_masked || c <= half);
        }
    }
    mask
}

/// Multiplicative `(out, in, k, k)` mask: `1.0` on live taps, `0.0` elsewhere.
pub fn kernel_mask_tensor(
    device: &Device,
    dtype: DType,
    out_channels: usize,
    in_channels: usize,
    kernel_size: usize,
    double_masked: bool,
) -> Result<Tensor> {
    let pattern = build_kernel_mask(kernel_size, double_masked)
        .into_iter()
        .map(|live| if live { 1f32 } else { 0f32 })
        .collect::<Vec<_>>();
    Tensor::from_vec(pattern, (1, 1, kernel_size, kernel_size), device)?
        .to_dtype(dtype)?
        .broadcast_as((out_channels, in_channels, kernel_size, kernel_size))?
        .contiguous()
}

/// Live taps as `(row, col)` kernel coordinates in row-major order.
pub fn live_taps(kernel_size: usize, double_masked: bool) -> Vec<(usize, usize)> {
    build_kernel_mask(kernel_size, double_masked)
        .into_iter()
        .enumerate()
        .filter(|(_, live)| *live)
        .map(|(idx, _)| (idx / kernel_size, idx % kernel_size))
        .collect()
}
