//! Position-wise feed-forward sublayer (expand, activate, contract).
//!
//! Operates on any channel-last tensor; every grid cell is transformed
//! independently, so `(batch, target, source, hidden)` maps to the same shape.

use candle_core::{DType, Device, Result, Tensor, Var};

use crate::{
    activations::ActivationKind,
    dtypes::PrecisionPolicy,
    linear::{Linear, LinearConfig, LinearInit},
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeedForwardConfig {
    pub hidden_size: usize,
    /// Width of the expanded (inner) space.
    pub intermediate_size: usize,
    pub activation: ActivationKind,
}

impl FeedForwardConfig {
    pub fn new(hidden_size: usize, intermediate_size: usize) -> Self {
        Self {
            hidden_size,
            intermediate_size,
            activation: ActivationKind::Relu,
        }
    }
}

/// Two-projection MLP: `fc2(act(fc1(x)))`.
#[derive(Debug, Clone)]
pub struct FeedForward {
    config: FeedForwardConfig,
    fc1: Linear,
    fc2: Linear,
}

impl FeedForward {
    pub fn new(config: FeedForwardConfig, fc1: Linear, fc2: Linear) -> Result<Self> {
        if fc1.config().input_dim != config.hidden_size
            || fc1.config().output_dim != config.intermediate_size
            || fc2.config().input_dim != config.intermediate_size
            || fc2.config().output_dim != config.hidden_size
        {
            return Err(candle_core::Error::Msg(format!(
                "feed-forward projections do not match {}->{}->{}",
                config.hidden_size, config.intermediate_size, config.hidden_size
            )));
        }
        Ok(Self { config, fc1, fc2 })
    }

    /// Samples both projections with Xavier-uniform weights and zero biases.
    pub fn with_init(config: FeedForwardConfig, device: &Device, dtype: DType) -> Result<Self> {
        let fc1 = Linear::with_init(
            LinearConfig::new(config.hidden_size, config.intermediate_size),
            &LinearInit::XavierUniform,
            device,
            dtype,
        )?;
        let fc2 = Linear::with_init(
            LinearConfig::new(config.intermediate_size, config.hidden_size),
            &LinearInit::XavierUniform,
            device,
            dtype,
        )?;
        Self::new(config, fc1, fc2)
    }

    pub fn config(&self) -> &FeedForwardConfig {
        &self.config
    }

    pub fn named_parameters(&self, prefix: &str) -> Vec<(String, Var)> {
        let mut params = self.fc1.named_parameters(&format!("{prefix}.fc1"));
        params.extend(self.fc2.named_parameters(&format!("{prefix}.fc2")));
        params
    }

    pub fn forward(&self, hidden: &Tensor, policy: &PrecisionPolicy) -> Result<Tensor> {
        let expanded = self.fc1.forward(hidden, policy)?;
        let activated = self.config.activation.forward(&expanded, policy)?;
        self.fc2.forward(&activated, policy)
    }
}
