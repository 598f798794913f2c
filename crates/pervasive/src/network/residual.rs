use candle_core::{DType, Device, Tensor, Var};
use convolution::{next_owner_id, ConvCache, GridError, GridMask, MaskedConv2d, StackCache};
use layers::{
    Dropout, FeedForward, FeedForwardConfig, Linear, LinearConfig, LinearInit, Mode,
    PrecisionPolicy, Residual,
};

use super::{check_call, convolve, GridNetwork, NETWORK_DROPOUT_SITE};
use crate::config::ModelConfig;

/// One residual unit: `x + conv(reduce(x))`, then `x + ffn(x)`, each sum
/// scaled by `residual_scale`.
#[derive(Debug, Clone)]
pub struct ResidualBlock {
    reduce: Linear,
    conv: MaskedConv2d,
    ffn: FeedForward,
    conv_dropout: Dropout,
    ffn_dropout: Dropout,
    residual: Residual,
    zero_padding: bool,
    policy: PrecisionPolicy,
}

impl ResidualBlock {
    pub fn new(
        index: usize,
        config: &ModelConfig,
        device: &Device,
        dtype: DType,
    ) -> Result<Self, GridError> {
        let channels = config.network_channels();
        let reduce_dim = config.reduce_dim();
        let reduce = Linear::with_init(
            LinearConfig::no_bias(channels, reduce_dim),
            &LinearInit::XavierUniform,
            device,
            dtype,
        )?;
        let conv = MaskedConv2d::new(config.conv_config(reduce_dim, channels), device, dtype)?;
        let ffn = FeedForward::with_init(FeedForwardConfig::new(channels, config.ffn_dim), device, dtype)?;
        let site = NETWORK_DROPOUT_SITE + 2 * index as u64;
        Ok(Self {
            reduce,
            conv,
            ffn,
            conv_dropout: config.dropout(config.convolution_dropout, site),
            ffn_dropout: config.dropout(config.convolution_dropout, site + 1),
            residual: Residual::new(config.residual_scale),
            zero_padding: !config.nonzero_padding,
            policy: PrecisionPolicy::from_parameter_dtype(dtype),
        })
    }

    pub fn forward(
        &self,
        x: &Tensor,
        mask: &GridMask,
        cache: Option<&mut ConvCache>,
        mode: Mode,
    ) -> Result<Tensor, GridError> {
        let reduced = self.reduce.forward(x, &self.policy)?;
        let conv = convolve(&self.conv, &reduced, mask, cache, mode, self.zero_padding)?;
        let conv = self.conv_dropout.apply(&conv, mode, &self.policy)?;
        let x = self.residual.add(&conv, x, &self.policy)?;

        let ffn = self.ffn.forward(&x, &self.policy)?;
        let ffn = self.ffn_dropout.apply(&ffn, mode, &self.policy)?;
        Ok(self.residual.add(&ffn, &x, &self.policy)?)
    }

    pub fn named_parameters(&self, prefix: &str) -> Vec<(String, Var)> {
        let mut params = self.reduce.named_parameters(&format!("{prefix}.reduce"));
        params.extend(self.conv.named_parameters(&format!("{prefix}.conv")));
        params.extend(self.ffn.named_parameters(&format!("{prefix}.ffn")));
        params
    }
}

/// Optional channel reduction followed by a fixed-depth stack of
/// [`ResidualBlock`]s.
#[derive(Debug, Clone)]
pub struct ResidualNetwork {
    owner: u64,
    input_channels: usize,
    output_channels: usize,
    reduce_channels: Option<Linear>,
    blocks: Vec<ResidualBlock>,
    policy: PrecisionPolicy,
}

impl ResidualNetwork {
    pub fn new(config: &ModelConfig, device: &Device, dtype: DType) -> Result<Self, GridError> {
        config.validate()?;
        let input_channels = config.grid_channels();
        let output_channels = config.network_channels();
        let reduce_channels = if config.divide_channels > 1 {
            Some(Linear::with_init(
                LinearConfig::new(input_channels, output_channels),
                &LinearInit::XavierUniform,
                device,
                dtype,
            )?)
        } else {
            None
        };
        let blocks = (0..config.num_layers)
            .map(|index| ResidualBlock::new(index, config, device, dtype))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self {
            owner: next_owner_id(),
            input_channels,
            output_channels,
            reduce_channels,
            blocks,
            policy: PrecisionPolicy::from_parameter_dtype(dtype),
        })
    }
}

impl GridNetwork for ResidualNetwork {
    fn input_channels(&self) -> usize {
        self.input_channels
    }

    fn output_channels(&self) -> usize {
        self.output_channels
    }

    fn num_layers(&self) -> usize {
        self.blocks.len()
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
        let mut x = match &self.reduce_channels {
            Some(linear) => linear.forward(grid, &self.policy)?,
            None => grid.clone(),
        };
        for (layer, block) in self.blocks.iter().enumerate() {
            let slot = match cache.as_deref_mut() {
                Some(stack) => Some(stack.slot_mut(layer)?),
                None => None,
            };
            x = block.forward(&x, mask, slot, mode)?;
        }
        Ok(x)
    }

    fn named_parameters(&self, prefix: &str) -> Vec<(String, Var)> {
        let mut params = match &self.reduce_channels {
            Some(linear) => linear.named_parameters(&format!("{prefix}.reduce_channels")),
            None => Vec::new(),
        };
        for (index, block) in self.blocks.iter().enumerate() {
            params.extend(block.named_parameters(&format!("{prefix}.blocks.{index}")));
        }
        params
    }
}
