use candle_core::{DType, Device, Tensor, Var};
use convolution::{GridError, MaskedConv2d};
use layers::{ActivationKind, PrecisionPolicy};

use crate::config::ModelConfig;

/// Observation extractor: `x <- x + relu(conv(x))` over double-masked
/// convolutions on the raw grid, so an observation at `(i, j)` only depends
/// on cells `(<= i, <= j)`.
#[derive(Debug, Clone)]
pub struct ControlFeatures {
    layers: Vec<MaskedConv2d>,
    channels: usize,
    policy: PrecisionPolicy,
}

impl ControlFeatures {
    pub fn new(config: &ModelConfig, device: &Device, dtype: DType) -> Result<Self, GridError> {
        let conv = config.control_conv_config();
        let layers = (0..config.num_control_layers)
            .map(|_| MaskedConv2d::new(conv.clone(), device, dtype))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self {
            layers,
            channels: conv.in_channels,
            policy: PrecisionPolicy::from_parameter_dtype(dtype),
        })
    }

    pub fn channels(&self) -> usize {
        self.channels
    }

    pub fn forward(&self, grid: &Tensor) -> Result<Tensor, GridError> {
        let mut x = grid.clone();
        for conv in &self.layers {
            let h = ActivationKind::Relu.forward(&conv.forward(&x)?, &self.policy)?;
            x = x.add(&h)?;
        }
        Ok(x)
    }

    pub fn named_parameters(&self, prefix: &str) -> Vec<(String, Var)> {
        self.layers
            .iter()
            .enumerate()
            .flat_map(|(index, conv)| conv.named_parameters(&format!("{prefix}.{index}")))
            .collect()
    }
}
