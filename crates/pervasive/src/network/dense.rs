//! Densely connected variant: every layer sees the concatenation of the
//! network input and all earlier layer outputs, and contributes
//! `growth_rate` new channels. A final linear transition maps the
//! concatenation back to the network width.

use candle_core::{DType, Device, Tensor, Var};
use convolution::{next_owner_id, ConvCache, GridError, GridMask, MaskedConv2d, StackCache};
use layers::{ActivationKind, Dropout, Linear, LinearConfig, LinearInit, Mode, PrecisionPolicy};

use super::{check_call, convolve, GridNetwork, NETWORK_DROPOUT_SITE};
use crate::config::ModelConfig;

#[derive(Debug, Clone)]
pub struct DenseLayer {
    bottleneck: Linear,
    conv: MaskedConv2d,
    dropout: Dropout,
    zero_padding: bool,
    policy: PrecisionPolicy,
}

impl DenseLayer {
    fn new(
        index: usize,
        in_channels: usize,
        config: &ModelConfig,
        device: &Device,
        dtype: DType,
    ) -> Result<Self, GridError> {
        let mid = config.bn_size * config.growth_rate;
        let bottleneck = Linear::with_init(
            LinearConfig::no_bias(in_channels, mid),
            &LinearInit::XavierUniform,
            device,
            dtype,
        )?;
        let conv = MaskedConv2d::new(config.conv_config(mid, config.growth_rate), device, dtype)?;
        Ok(Self {
            bottleneck,
            conv,
            dropout: config.dropout(config.convolution_dropout, NETWORK_DROPOUT_SITE + index as u64),
            zero_padding: !config.nonzero_padding,
            policy: PrecisionPolicy::from_parameter_dtype(dtype),
        })
    }

    /// New features only: `[b, t, s, growth_rate]`.
    fn forward(
        &self,
        x: &Tensor,
        mask: &GridMask,
        cache: Option<&mut ConvCache>,
        mode: Mode,
    ) -> Result<Tensor, GridError> {
        let h = self.bottleneck.forward(x, &self.policy)?;
        let h = ActivationKind::Relu.forward(&h, &self.policy)?;
        let h = convolve(&self.conv, &h, mask, cache, mode, self.zero_padding)?;
        Ok(self.dropout.apply(&h, mode, &self.policy)?)
    }

    fn named_parameters(&self, prefix: &str) -> Vec<(String, Var)> {
        let mut params = self.bottleneck.named_parameters(&format!("{prefix}.bottleneck"));
        params.extend(self.conv.named_parameters(&format!("{prefix}.conv")));
        params
    }
}

#[derive(Debug, Clone)]
pub struct DenseNetwork {
    owner: u64,
    input_channels: usize,
    output_channels: usize,
    reduce_channels: Option<Linear>,
    layers: Vec<DenseLayer>,
    transition: Linear,
    policy: PrecisionPolicy,
}

impl DenseNetwork {
    pub fn new(config: &ModelConfig, device: &Device, dtype: DType) -> Result<Self, GridError> {
        config.validate()?;
        let input_channels = config.grid_channels();
        let width = config.network_channels();
        let reduce_channels = if config.divide_channels > 1 {
            Some(Linear::with_init(
                LinearConfig::new(input_channels, width),
                &LinearInit::XavierUniform,
                device,
                dtype,
            )?)
        } else {
            None
        };
        let mut layers = Vec::with_capacity(config.num_layers);
        let mut channels = width;
        for index in 0..config.num_layers {
            layers.push(DenseLayer::new(index, channels, config, device, dtype)?);
            channels += config.growth_rate;
        }
        let transition = Linear::with_init(
            LinearConfig::new(channels, width),
            &LinearInit::XavierUniform,
            device,
            dtype,
        )?;
        Ok(Self {
            owner: next_owner_id(),
            input_channels,
            output_channels: width,
            reduce_channels,
            layers,
            transition,
            policy: PrecisionPolicy::from_parameter_dtype(dtype),
        })
    }
}

impl GridNetwork for DenseNetwork {
    fn input_channels(&self) -> usize {
        self.input_channels
    }

    fn output_channels(&self) -> usize {
        self.output_channels
    }

    fn num_layers(&self) -> usize {
        self.layers.len()
    }

    fn owner_id(&self) -> u64 {
        self.owner
    }

    fn forward(
        &self,
        grid: &Tensor,
        mask: &GridMask,
        mut cache: Option<&mut StackCache>,
        mode: Mode,
    ) -> Result<Tensor, GridError> {
        check_call(self, grid, cache.as_deref(), mode)?;
        let mut features = match &self.reduce_channels {
            Some(linear) => linear.forward(grid, &self.policy)?,
            None => grid.clone(),
        };
        for (index, layer) in self.layers.iter().enumerate() {
            let slot = match cache.as_deref_mut() {
                Some(stack) => Some(stack.slot_mut(index)?),
                None => None,
            };
            let fresh = layer.forward(&features, mask, slot, mode)?;
            features = Tensor::cat(&[&features, &fresh], 3)?;
        }
        Ok(self.transition.forward(&features, &self.policy)?)
    }

    fn named_parameters(&self, prefix: &str) -> Vec<(String, Var)> {
        let mut params = match &self.reduce_channels {
            Some(linear) => linear.named_parameters(&format!("{prefix}.reduce_channels")),
            None => Vec::new(),
        };
        for (index, layer) in self.layers.iter().enumerate() {
            params.extend(layer.named_parameters(&format!("{prefix}.layers.{index}")));
        }
        params.extend(self.transition.named_parameters(&format!("{prefix}.transition")));
        params
    }
}
