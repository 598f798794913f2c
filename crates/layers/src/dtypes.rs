//! Precision policy shared by every grid component.
//!
//! Parameters may be stored in `f16`/`bf16`, but the grid stack is deep and
//! its max-reductions are sensitive to rounding, so matmuls and reductions are
//! promoted to a compute dtype (at least `f32`) and cast back afterwards.

use candle_core::{DType, Result, Tensor};

/// Describes how tensors should be cast around projections and reductions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PrecisionPolicy {
    storage: DType,
    compute: DType,
}

impl PrecisionPolicy {
    /// Constructs a policy from explicit dtype selections.
    pub fn new(storage: DType, compute: DType) -> Self {
        Self { storage, compute }
    }

    /// Builds a policy from the parameter storage dtype.
    pub fn from_parameter_dtype(storage: DType) -> Self {
        let compute = match storage {
            DType::F16 | DType::BF16 => DType::F32,
            other => other,
        };
        Self::new(storage, compute)
    }

    /// Dtype used for parameters and layer outputs.
    pub fn storage(&self) -> DType {
        self.storage
    }

    /// Dtype used for matmuls, activations and reductions.
    pub fn compute(&self) -> DType {
        self.compute
    }

    /// Comparison tolerance appropriate for the storage dtype.
    pub fn tolerance(&self) -> f32 {
        match self.storage {
            DType::BF16 => 2e-2,
            DType::F16 => 5e-3,
            DType::F64 => 1e-7,
            _ => 1e-5,
        }
    }

    /// Casts a tensor to the compute dtype.
    pub fn cast_for_compute(&self, tensor: &Tensor) -> Result<Tensor> {
        cast_tensor(tensor, self.compute)
    }

    /// Casts a tensor back to the storage dtype (or leaves it unchanged).
    pub fn cast_to_storage(&self, tensor: &Tensor) -> Result<Tensor> {
        cast_tensor(tensor, self.storage)
    }
}

impl Default for PrecisionPolicy {
    fn default() -> Self {
        Self::from_parameter_dtype(DType::F32)
    }
}

fn cast_tensor(tensor: &Tensor, dtype: DType) -> Result<Tensor> {
    if tensor.dtype() == dtype {
        Ok(tensor.clone())
    } else {
        tensor.to_dtype(dtype)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    #[test]
    fn half_precision_storage_promotes_compute() {
        let policy = PrecisionPolicy::from_parameter_dtype(DType::BF16);
        assert_eq!(policy.storage(), DType::BF16);
        assert_eq!(policy.compute(), DType::F32);
        assert_eq!(PrecisionPolicy::default().compute(), DType::F32);
    }

    #[test]
    fn cast_round_trip_stays_within_tolerance() -> Result<()> {
        let policy = PrecisionPolicy::from_parameter_dtype(DType::F16);
        let base = Tensor::from_vec(vec![0.125f32, -0.75, 3.5], (3,), &Device::Cpu)?;
        let stored = policy.cast_to_storage(&base)?;
        assert_eq!(stored.dtype(), DType::F16);
        let restored = policy.cast_for_compute(&stored)?.to_vec1::<f32>()?;
        for (orig, back) in base.to_vec1::<f32>()?.iter().zip(restored.iter()) {
            assert!((orig - back).abs() <= policy.tolerance());
        }
        Ok(())
    }
}
