//! Lightweight validation helpers shared across layer components.
//!
//! Every helper takes a `label` naming the tensor being checked so that the
//! error message points at the offending call site. They return
//! `candle_core::Result<()>` so callers can propagate with `?`.

use candle_core::{DType, Error, Result, Tensor};

/// Ensures a tensor matches the expected dimensions exactly.
pub fn expect_shape(label: &str, tensor: &Tensor, expected: &[usize]) -> Result<()> {
    if tensor.dims() == expected {
        Ok(())
    } else {
        Err(Error::Msg(format!(
            "{label}: expected shape {:?}, got {:?}",
            expected,
            tensor.dims()
        )))
    }
}

/// Validates the trailing (feature) dimension of a channel-last tensor.
pub fn expect_last_dim(label: &str, tensor: &Tensor, features: usize) -> Result<()> {
    match tensor.dims().last() {
        Some(&last) if last == features => Ok(()),
        _ => Err(Error::Msg(format!(
            "{label}: expected trailing dim {features}, got shape {:?}",
            tensor.dims()
        ))),
    }
}

/// Checks two tensors share a dtype.
pub fn expect_same_dtype(label_a: &str, a: &Tensor, label_b: &str, b: &Tensor) -> Result<()> {
    if a.dtype() == b.dtype() {
        Ok(())
    } else {
        Err(Error::Msg(format!(
            "{label_a} has dtype {:?} but {label_b} has dtype {:?}",
            a.dtype(),
            b.dtype()
        )))
    }
}

/// Checks the tensor dtype is one of the allowed values.
pub fn expect_dtype_in(label: &str, tensor: &Tensor, allowed: &[DType]) -> Result<()> {
    let dtype = tensor.dtype();
    if allowed.contains(&dtype) {
        Ok(())
    } else {
        Err(Error::Msg(format!(
            "{label}: expected dtype in {:?}, got {:?}",
            allowed, dtype
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    #[test]
    fn shape_checks_report_labels() -> Result<()> {
        let t = Tensor::zeros((2, 3, 4, 5), DType::F32, &Device::Cpu)?;
        expect_last_dim("grid", &t, 5)?;
        expect_dtype_in("grid", &t, &[DType::F16, DType::F32])?;
        let err = expect_shape("grid", &t, &[2, 3, 4, 6]).unwrap_err();
        assert!(err.to_string().contains("grid"));
        Ok(())
    }

    #[test]
    fn dtype_mismatch_names_both_tensors() -> Result<()> {
        let a = Tensor::zeros((2, 3), DType::F32, &Device::Cpu)?;
        let b = Tensor::zeros((2, 3), DType::F16, &Device::Cpu)?;
        let err = expect_same_dtype("branch", &a, "residual", &b).unwrap_err();
        assert!(err.to_string().contains("branch") && err.to_string().contains("residual"));
        Ok(())
    }
}
