//! Point-wise non-linearities used by feed-forward sublayers and the
//! controller feature extractor.
//!
//! Activations keep the input layout and evaluate in the policy's compute
//! dtype before casting back to storage.

use candle_core::{Result, Tensor};

use crate::dtypes::PrecisionPolicy;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ActivationKind {
    Identity,
    #[default]
    Relu,
}

impl ActivationKind {
    pub fn forward(&self, input: &Tensor, policy: &PrecisionPolicy) -> Result<Tensor> {
        let compute = policy.cast_for_compute(input)?;
        let activated = match self {
            ActivationKind::Identity => compute,
            ActivationKind::Relu => compute.relu()?,
        };
        policy.cast_to_storage(&activated)
    }
}
