//! Source and target padding masks.
//!
//! Masks are `u8` tensors shaped `[batch, len]` with `1` marking a padding
//! placeholder. A [`GridMask`] pairs the optional source and target masks of a
//! batch and zeroes padded cells of channel-last grids.

use candle_core::{DType, Device, Tensor};

use crate::core::GridError;

#[derive(Debug, Clone)]
pub struct PaddingMask {
    mask: Tensor,
}

impl PaddingMask {
    /// Wraps an existing `[batch, len]` `u8` tensor.
    pub fn new(mask: Tensor) -> Result<Self, GridError> {
        if mask.rank() != 2 {
            return Err(GridError::shape(format!(
                "padding mask must be [batch, len], got {:?}",
                mask.dims()
            )));
        }
        let mask = if mask.dtype() == DType::U8 {
            mask
        } else {
            mask.ne(0f64)?
        };
        Ok(Self { mask })
    }

    /// `true` marks a padded position; every row must share the same length.
    pub fn from_booleans(device: &Device, padding: &[Vec<bool>]) -> Result<Self, GridError> {
        let len = padding.first().map(Vec::len).unwrap_or(0);
        if let Some(row) = padding.iter().find(|row| row.len() != len) {
            return Err(GridError::shape(format!(
                "padding rows must share one length, got {} and {}",
                len,
                row.len()
            )));
        }
        let data = padding
            .iter()
            .flat_map(|row| row.iter().map(|&pad| u8::from(pad)))
            .collect::<Vec<_>>();
        Self::new(Tensor::from_vec(data, (padding.len(), len), device)?)
    }

    /// Positions at or after each length are padding.
    pub fn from_lengths(device: &Device, lengths: &[usize], len: usize) -> Result<Self, GridError> {
        let rows = lengths
            .iter()
            .map(|&valid| (0..len).map(|pos| pos >= valid).collect())
            .collect::<Vec<Vec<bool>>>();
        if rows.is_empty() {
            return Self::new(Tensor::zeros((0, len), DType::U8, device)?);
        }
        Self::from_booleans(device, &rows)
    }

    pub fn tensor(&self) -> &Tensor {
        &self.mask
    }

    pub fn batch(&self) -> usize {
        self.mask.dims()[0]
    }

    pub fn len(&self) -> usize {
        self.mask.dims()[1]
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// `[batch, len]` tensor in `dtype`: `1` where the position is real.
    pub fn keep(&self, dtype: DType) -> Result<Tensor, GridError> {
        Ok(self.mask.eq(0u8)?.to_dtype(dtype)?)
    }

    /// Whether each batch row consists of padding only.
    pub fn all_padding(&self) -> Result<Vec<bool>, GridError> {
        let rows = self.mask.to_vec2::<u8>()?;
        Ok(rows.iter().map(|row| row.iter().all(|&pad| pad != 0)).collect())
    }

    /// Number of real positions in every batch row.
    pub fn lengths(&self) -> Result<Vec<usize>, GridError> {
        let rows = self.mask.to_vec2::<u8>()?;
        Ok(rows
            .iter()
            .map(|row| row.iter().filter(|&&pad| pad == 0).count())
            .collect())
    }

    fn expect_geometry(&self, label: &str, batch: usize, len: usize) -> Result<(), GridError> {
        if self.batch() != batch || self.len() != len {
            return Err(GridError::shape(format!(
                "{label} padding mask is {:?} but the grid expects [{batch}, {len}]",
                self.mask.dims()
            )));
        }
        Ok(())
    }
}

/// Optional source and target padding of one batch.
#[derive(Debug, Clone, Default)]
pub struct GridMask {
    source: Option<PaddingMask>,
    target: Option<PaddingMask>,
}

impl GridMask {
    pub fn new(source: Option<PaddingMask>, target: Option<PaddingMask>) -> Self {
        Self { source, target }
    }

    pub fn none() -> Self {
        Self::default()
    }

    pub fn source(&self) -> Option<&PaddingMask> {
        self.source.as_ref()
    }

    /// `[batch, tgt, src, 1]` multiplicative keep-mask, or `None` without
    /// padding.
    pub fn cell_keep(
        &self,
        batch: usize,
        tgt_len: usize,
        src_len: usize,
        dtype: DType,
    ) -> Result<Option<Tensor>, GridError> {
        let shape = (batch, tgt_len, src_len, 1);
        let source = match &self.source {
            Some(mask) => {
                mask.expect_geometry("source", batch, src_len)?;
                Some(mask.keep(dtype)?.reshape((batch, 1, src_len, 1))?)
            }
            None => None,
        };
        let target = match &self.target {
            Some(mask) => {
                mask.expect_geometry("target", batch, tgt_len)?;
                Some(mask.keep(dtype)?.reshape((batch, tgt_len, 1, 1))?)
            }
            None => None,
        };
        let keep = match (source, target) {
            (None, None) => return Ok(None),
            (Some(s), None) => s.broadcast_as(shape)?.contiguous()?,
            (None, Some(t)) => t.broadcast_as(shape)?.contiguous()?,
            (Some(s), Some(t)) => s.broadcast_mul(&t)?,
        };
        Ok(Some(keep))
    }

    /// Zeroes every cell whose source or target position is padding.
    pub fn apply(&self, grid: &Tensor) -> Result<Tensor, GridError> {
        let (batch, tgt_len, src_len, _) = grid.dims4()?;
        match self.cell_keep(batch, tgt_len, src_len, grid.dtype())? {
            Some(keep) => Ok(grid.broadcast_mul(&keep)?),
            None => Ok(grid.clone()),
        }
    }
}
