//! Grid networks: stacks of causal masked convolutions that map a grid
//! `[b, t, s, c_in]` to `[b, t, s, c_out]`.
//!
//! Every variant implements [`GridNetwork`] and is selected by
//! [`NetworkKind`] through [`build_network`].

pub mod dense;
pub mod residual;

use std::fmt;

use candle_core::{DType, Device, Tensor, Var};
use convolution::{ConvCache, GridError, GridMask, MaskedConv2d, StackCache};
use layers::Mode;

use crate::config::{ModelConfig, NetworkKind};

pub use dense::DenseNetwork;
pub use residual::ResidualNetwork;

/// Dropout site offset for the layers of a network.
pub(crate) const NETWORK_DROPOUT_SITE: u64 = 1_000;

pub trait GridNetwork: fmt::Debug + Send + Sync {
    fn input_channels(&self) -> usize;

    fn output_channels(&self) -> usize;

    /// Number of masked convolutions, i.e. cache slots per session.
    fn num_layers(&self) -> usize;

    /// Identifier that binds a [`StackCache`] to this instance.
    fn owner_id(&self) -> u64;

    /// Full-grid forward when `cache` is `None`; otherwise `grid` holds only
    /// the newest target row(s) and every layer advances its cache slot.
    ///
    /// Padded cells are zeroed after each convolution in full-grid calls
    /// unless the network was built with `nonzero_padding`. Cached calls never
    /// zero and fail under [`Mode::Train`].
    fn forward(
        &self,
        grid: &Tensor,
        mask: &GridMask,
        cache: Option<&mut StackCache>,
        mode: Mode,
    ) -> Result<Tensor, GridError>;

    fn named_parameters(&self, prefix: &str) -> Vec<(String, Var)>;

    /// Fresh per-session cache with one slot per layer.
    fn new_cache(&self) -> StackCache {
        StackCache::new(self.owner_id(), self.num_layers())
    }
}

/// Builds the network variant named by `config.network`.
pub fn build_network(
    config: &ModelConfig,
    device: &Device,
    dtype: DType,
) -> Result<Box<dyn GridNetwork>, GridError> {
    let network: Box<dyn GridNetwork> = match config.network {
        NetworkKind::Residual => Box::new(ResidualNetwork::new(config, device, dtype)?),
        NetworkKind::Dense => Box::new(DenseNetwork::new(config, device, dtype)?),
    };
    log::info!(
        "built {:?} grid network: {} layers, {} -> {} channels, kernel {} (double masked: {})",
        config.network,
        network.num_layers(),
        network.input_channels(),
        network.output_channels(),
        config.kernel_size,
        config.double_masked
    );
    Ok(network)
}

/// Runs one layer's convolution. Full-grid calls zero padded cells of the
/// input and of the result when `zero_padding` is set, so padded positions
/// never reach a real cell; cached calls never zero.
pub(crate) fn convolve(
    conv: &MaskedConv2d,
    x: &Tensor,
    mask: &GridMask,
    cache: Option<&mut ConvCache>,
    mode: Mode,
    zero_padding: bool,
) -> Result<Tensor, GridError> {
    match cache {
        Some(cache) => conv.forward_cached(x, cache, mode),
        None if zero_padding => mask.apply(&conv.forward(&mask.apply(x)?)?),
        None => conv.forward(x),
    }
}

/// Shared entry checks: rank, channel width, cache ownership and mode.
pub(crate) fn check_call(
    network: &dyn GridNetwork,
    grid: &Tensor,
    cache: Option<&StackCache>,
    mode: Mode,
) -> Result<(), GridError> {
    let (_, _, _, channels) = grid.dims4().map_err(|_| {
        GridError::shape(format!(
            "grid network expects [batch, target, source, channels], got {:?}",
            grid.dims()
        ))
    })?;
    if channels != network.input_channels() {
        return Err(GridError::shape(format!(
            "grid network expects {} channels, got {channels}",
            network.input_channels()
        )));
    }
    if let Some(cache) = cache {
        if mode.is_training() {
            return Err(GridError::ModeMismatch(
                "incremental decoding cannot run in training mode".into(),
            ));
        }
        cache.check(network.owner_id(), network.num_layers())?;
    }
    Ok(())
}
