//! Read/write controller for simultaneous decoding.
//!
//! [`ControlFeatures`] turns the raw grid into per-cell observations, a
//! single gate logit `g` per cell gives log-probabilities
//! `[log σ(-g), log σ(g)]` ordered `[read, write]`, and the [`Oracle`]
//! derives supervision for them from ground-truth likelihoods.

pub mod features;
pub mod oracle;

use candle_core::{DType, Device, IndexOp, Tensor, Var};
use convolution::GridError;
use layers::{Linear, LinearConfig, LinearInit, PrecisionPolicy};

use crate::config::ModelConfig;

pub use features::ControlFeatures;
pub use oracle::{Oracle, OracleLabels, PADDING_SCORE};

/// Index of the read log-probability in the last controller axis.
pub const READ: usize = 0;
/// Index of the write log-probability in the last controller axis.
pub const WRITE: usize = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Read,
    Write,
}

impl Action {
    /// Writes when `p_write >= threshold`.
    pub fn from_probability(p_write: f32, threshold: f32) -> Self {
        if p_write >= threshold {
            Action::Write
        } else {
            Action::Read
        }
    }
}

#[derive(Debug, Clone)]
pub struct ControllerOutput {
    /// `[b, t, s, c]` observation features.
    pub observations: Tensor,
    /// `[b, t, s, 2]` log-probabilities `[read, write]`.
    pub controls: Tensor,
    pub labels: OracleLabels,
}

#[derive(Debug, Clone)]
pub struct Controller {
    features: ControlFeatures,
    gate: Linear,
    oracle: Oracle,
    detach: bool,
    policy: PrecisionPolicy,
}

impl Controller {
    pub fn new(config: &ModelConfig, device: &Device, dtype: DType) -> Result<Self, GridError> {
        let features = ControlFeatures::new(config, device, dtype)?;
        let gate = Linear::with_init(
            LinearConfig::new(features.channels(), 1),
            &LinearInit::XavierUniform,
            device,
            dtype,
        )?;
        if !config.double_masked {
            log::warn!(
                "controller paired with a network that is not double masked; per-cell predictions will see future source tokens"
            );
        }
        Ok(Self {
            features,
            gate,
            oracle: Oracle::new(config.oracle_penalty, config.write_right),
            detach: config.detach_controls,
            policy: PrecisionPolicy::from_parameter_dtype(dtype),
        })
    }

    /// Observation features for `grid`. With `detach_controls` the extractor
    /// reads a copy of the grid that carries no gradient back to its producer.
    pub fn observe(&self, grid: &Tensor) -> Result<Tensor, GridError> {
        if self.detach {
            self.features.forward(&grid.detach())
        } else {
            self.features.forward(grid)
        }
    }

    /// `[b, t, s, c]` observations -> `[b, t, s, 2]` log-probabilities.
    pub fn predict(&self, observations: &Tensor) -> Result<Tensor, GridError> {
        let g = self
            .policy
            .cast_for_compute(&self.gate.forward(observations, &self.policy)?)?;
        let read = log_sigmoid(&g.neg()?)?;
        let write = log_sigmoid(&g)?;
        Ok(self
            .policy
            .cast_to_storage(&Tensor::cat(&[&read, &write], 3)?)?)
    }

    /// Training pass: observations, action log-probabilities and oracle labels
    /// for `scores` `[b, t, s]` (ground-truth log-likelihood per cell, padded
    /// cells at [`PADDING_SCORE`]).
    pub fn forward_train(&self, grid: &Tensor, scores: &Tensor) -> Result<ControllerOutput, GridError> {
        let observations = self.observe(grid)?;
        let controls = self.predict(&observations)?;
        let labels = self.oracle.label(&scores.detach())?;
        Ok(ControllerOutput {
            observations,
            controls,
            labels,
        })
    }

    /// Write probability at the last `(target, source)` cell of `grid`, per
    /// batch element.
    pub fn write_probability(&self, grid: &Tensor) -> Result<Tensor, GridError> {
        let controls = self.predict(&self.observe(grid)?)?;
        let (_, tgt_len, src_len, _) = controls.dims4()?;
        Ok(controls
            .i((.., tgt_len - 1, src_len - 1, WRITE))?
            .exp()?)
    }

    pub fn named_parameters(&self, prefix: &str) -> Vec<(String, Var)> {
        let mut params = self.features.named_parameters(&format!("{prefix}.features"));
        params.extend(self.gate.named_parameters(&format!("{prefix}.gate")));
        params
    }
}

/// `log σ(x) = -(relu(-x) + log(1 + exp(-|x|)))`, finite for any `x`.
fn log_sigmoid(x: &Tensor) -> Result<Tensor, GridError> {
    let softplus_tail = x.abs()?.neg()?.exp()?.affine(1.0, 1.0)?.log()?;
    Ok(x.neg()?.relu()?.add(&softplus_tail)?.neg()?)
}
