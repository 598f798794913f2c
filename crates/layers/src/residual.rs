//! Execution mode, dropout and residual-sum helpers.
//!
//! Dropout is never driven by hidden module state: every forward call receives
//! a [`Mode`] and dropout only fires under [`Mode::Train`]. Masks come from a
//! seeded generator so a given module produces reproducible masks.

use std::{fmt, sync::Mutex};

use candle_core::{Error, Result, Tensor};

use crate::{checks, dtypes::PrecisionPolicy};

/// Explicit execution mode passed into every forward call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Mode {
    /// Dropout active, padding masks applied.
    Train,
    /// Deterministic evaluation / inference.
    #[default]
    Eval,
}

impl Mode {
    pub fn is_training(self) -> bool {
        matches!(self, Mode::Train)
    }
}

/// Inverted dropout over tensors of any rank.
pub struct Dropout {
    probability: f32,
    rng: Mutex<Lcg64>,
}

impl Dropout {
    /// `probability` outside `(0, 1)` disables the layer.
    pub fn new(probability: f32, seed: u64) -> Self {
        let probability = if probability > 0.0 && probability < 1.0 {
            probability
        } else {
            0.0
        };
        Self {
            probability,
            rng: Mutex::new(Lcg64::new(seed)),
        }
    }

    pub fn disabled() -> Self {
        Self::new(0.0, 0)
    }

    /// Zeroes each element with `probability` and rescales survivors, in
    /// training mode only.
    pub fn apply(&self, tensor: &Tensor, mode: Mode, policy: &PrecisionPolicy) -> Result<Tensor> {
        if !mode.is_training() || self.probability == 0.0 {
            return Ok(tensor.clone());
        }
        let keep_prob = 1.0 - self.probability;
        let total = tensor.elem_count();
        let mask_data = {
            let mut rng = self
                .rng
                .lock()
                .map_err(|_| Error::Msg("dropout RNG mutex poisoned".into()))?;
            (0..total)
                .map(|_| {
                    if rng.next_f32() < keep_prob {
                        1.0f32 / keep_prob
                    } else {
                        0.0
                    }
                })
                .collect::<Vec<_>>()
        };
        let compute = policy.cast_for_compute(tensor)?;
        let mask = Tensor::from_vec(mask_data, tensor.dims(), tensor.device())?
            .to_dtype(compute.dtype())?;
        policy.cast_to_storage(&compute.mul(&mask)?)
    }
}

impl Clone for Dropout {
    fn clone(&self) -> Self {
        let state = match self.rng.lock() {
            Ok(guard) => guard.clone(),
            // A poisoned generator cannot be recovered; restart the sequence.
            Err(_poisoned) => Lcg64::new(0),
        };
        Self {
            probability: self.probability,
            rng: Mutex::new(state),
        }
    }
}

impl fmt::Debug for Dropout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dropout")
            .field("probability", &self.probability)
            .finish()
    }
}

/// Residual sum `scale * (branch + residual)`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Residual {
    scale: f32,
}

impl Residual {
    pub fn new(scale: f32) -> Self {
        Self { scale }
    }

    pub fn add(&self, branch: &Tensor, residual: &Tensor, policy: &PrecisionPolicy) -> Result<Tensor> {
        checks::expect_shape("residual.branch", branch, residual.dims())?;
        checks::expect_same_dtype("residual.branch", branch, "residual.input", residual)?;
        let summed = policy
            .cast_for_compute(branch)?
            .add(&policy.cast_for_compute(residual)?)?;
        let scaled = if self.scale == 1.0 {
            summed
        } else {
            summed.affine(f64::from(self.scale), 0.0)?
        };
        policy.cast_to_storage(&scaled)
    }
}

impl Default for Residual {
    fn default() -> Self {
        Self::new(1.0)
    }
}

/// 64-bit linear congruential generator for reproducible dropout masks.
#[derive(Debug, Clone)]
pub(crate) struct Lcg64 {
    state: u64,
}

impl Lcg64 {
    fn new(seed: u64) -> Self {
        Self { state: seed }
    }

    fn next_u64(&mut self) -> u64 {
        // Knuth's MMIX constants.
        self.state = self
            .state
            .wrapping_mul(6364136223846793005)
            .wrapping_add(1442695040888963407);
        self.state
    }

    fn next_f32(&mut self) -> f32 {
        const SCALE: f64 = 1.0 / ((1u64 << 53) as f64);
        let bits = self.next_u64() >> 11;
        (bits as f64 * SCALE) as f32
    }
}
