//! Collapses the source axis of a processed grid.
//!
//! Padded source cells are filled with a large negative value before a max so
//! they can never win against a real cell; a row with no real source cell
//! reduces to zeros.

use candle_core::{DType, Tensor};
use convolution::{GridError, PaddingMask};
use layers::PrecisionPolicy;

use crate::config::Aggregation;

const PADDING_FILL: f64 = -1e9;

/// Reduced values and, for max aggregation, the winning source index of every
/// channel.
#[derive(Debug, Clone)]
pub struct Aggregated {
    /// `[b, t, c]`
    pub values: Tensor,
    /// `[b, t, c]` `u32`, `None` for mean aggregation.
    pub indices: Option<Tensor>,
}

#[derive(Debug, Clone, Copy)]
pub struct Aggregator {
    kind: Aggregation,
    policy: PrecisionPolicy,
}

impl Aggregator {
    pub fn new(kind: Aggregation, policy: PrecisionPolicy) -> Self {
        Self { kind, policy }
    }

    /// `[b, t, s, c]` -> `[b, t, c]` over every real source position.
    pub fn reduce(
        &self,
        grid: &Tensor,
        source_mask: Option<&PaddingMask>,
    ) -> Result<Aggregated, GridError> {
        let x = self.policy.cast_for_compute(grid)?;
        let (batch, _, src_len, _) = x.dims4()?;
        let keep = source_keep(source_mask, batch, src_len, x.dtype())?;
        match self.kind {
            Aggregation::Max => {
                let filled = fill_padding(&x, keep.as_ref())?;
                let values = filled.max(2)?;
                let indices = filled.argmax(2)?;
                let values = match &keep {
                    // [b, 1, s, 1] -> [b, 1, 1]
                    Some(keep) => zero_empty(&values, &keep.max(2)?)?,
                    None => values,
                };
                Ok(Aggregated {
                    values: self.policy.cast_to_storage(&values)?,
                    indices: Some(indices),
                })
            }
            Aggregation::Mean => {
                let values = match &keep {
                    Some(keep) => {
                        let total = x.broadcast_mul(keep)?.sum(2)?;
                        let count = keep.sum(2)?.maximum(1f64)?;
                        total.broadcast_div(&count)?
                    }
                    None => x.mean(2)?,
                };
                Ok(Aggregated {
                    values: self.policy.cast_to_storage(&values)?,
                    indices: None,
                })
            }
        }
    }

    /// Running reduction: cell `(i, j)` of the `[b, t, s, c]` result reduces
    /// source positions `0..=j`. The last column equals [`Self::reduce`].
    pub fn prefix_reduce(
        &self,
        grid: &Tensor,
        source_mask: Option<&PaddingMask>,
    ) -> Result<Tensor, GridError> {
        let x = self.policy.cast_for_compute(grid)?;
        let (batch, _, src_len, _) = x.dims4()?;
        let keep = source_keep(source_mask, batch, src_len, x.dtype())?;
        // [b, 1, s, 1] count of real positions in 0..=j
        let seen = match &keep {
            Some(keep) => Some(keep.cumsum(2)?),
            None => None,
        };
        let values = match self.kind {
            Aggregation::Max => {
                let filled = fill_padding(&x, keep.as_ref())?;
                let mut running = filled.narrow(2, 0, 1)?;
                let mut columns = Vec::with_capacity(src_len);
                columns.push(running.clone());
                for j in 1..src_len {
                    running = running.maximum(&filled.narrow(2, j, 1)?)?;
                    columns.push(running.clone());
                }
                let values = Tensor::cat(&columns, 2)?;
                match &seen {
                    Some(seen) => zero_empty(&values, &seen.ne(0f64)?.to_dtype(x.dtype())?)?,
                    None => values,
                }
            }
            Aggregation::Mean => {
                let (total, count) = match (&keep, &seen) {
                    (Some(keep), Some(seen)) => (x.broadcast_mul(keep)?.cumsum(2)?, seen.clone()),
                    _ => {
                        let ones = Tensor::ones((1, 1, src_len, 1), x.dtype(), x.device())?;
                        (x.cumsum(2)?, ones.cumsum(2)?)
                    }
                };
                total.broadcast_div(&count.maximum(1f64)?)?
            }
        };
        Ok(self.policy.cast_to_storage(&values)?)
    }
}

/// `[b, 1, s, 1]` keep-mask in `dtype`, or `None` without a mask.
fn source_keep(
    mask: Option<&PaddingMask>,
    batch: usize,
    src_len: usize,
    dtype: DType,
) -> Result<Option<Tensor>, GridError> {
    let Some(mask) = mask else {
        return Ok(None);
    };
    if mask.batch() != batch || mask.len() != src_len {
        return Err(GridError::shape(format!(
            "source padding mask is [{}, {}] but the grid is [{batch}, *, {src_len}, *]",
            mask.batch(),
            mask.len()
        )));
    }
    Ok(Some(mask.keep(dtype)?.reshape((batch, 1, src_len, 1))?))
}

fn fill_padding(x: &Tensor, keep: Option<&Tensor>) -> Result<Tensor, GridError> {
    let Some(keep) = keep else {
        return Ok(x.clone());
    };
    let keep = keep.broadcast_as(x.dims())?.ne(0f64)?;
    let fill = Tensor::full(PADDING_FILL as f32, x.dims(), x.device())?.to_dtype(x.dtype())?;
    Ok(keep.where_cond(x, &fill)?)
}

/// Zeroes values whose reduction saw no real position (`any` broadcastable to
/// `values`, `1` where at least one real position was seen).
fn zero_empty(values: &Tensor, any: &Tensor) -> Result<Tensor, GridError> {
    let any = any.broadcast_as(values.dims())?.ne(0f64)?;
    Ok(any.where_cond(values, &values.zeros_like()?)?)
}
