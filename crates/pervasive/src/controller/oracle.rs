//! Read/write supervision derived from per-cell ground-truth likelihoods.
//!
//! For target step `i`, `s(i, j)` is the log-likelihood of the reference
//! token when the model has read source positions `0..=j`. With penalty `p`
//! the oracle scores `s'(i, j) = s(i, j) - p * j` and picks the boundary
//! `b_i` as the first column attaining the maximum of `s'(i, ·)`: reading
//! further requires a strict improvement, so ties write early. Boundaries are
//! then made non-decreasing in `i`.
//!
//! Cells left of the boundary are labelled read. The boundary cell is
//! labelled write, and with `write_right` so is every cell after it.

use candle_core::{DType, Device, Tensor};
use convolution::GridError;

/// Score given to padded cells before the oracle runs.
pub const PADDING_SCORE: f32 = -1000.0;

#[derive(Debug, Clone)]
pub struct OracleLabels {
    /// `[b, t, s]`, `1.0` where the oracle reads.
    pub read: Tensor,
    /// `[b, t, s]`, `1.0` where the oracle writes.
    pub write: Tensor,
    /// `[b, t]` likelihood gain of the boundary over writing after one source
    /// token: `s(i, b_i) - s(i, 0)`.
    pub gamma: Tensor,
    /// Boundary column of every target step, per batch element.
    pub boundaries: Vec<Vec<usize>>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Oracle {
    penalty: f32,
    write_right: bool,
}

impl Oracle {
    pub fn new(penalty: f32, write_right: bool) -> Self {
        Self {
            penalty,
            write_right,
        }
    }

    /// Boundaries for one `[t][s]` score table.
    pub fn boundaries(&self, scores: &[Vec<f32>]) -> Vec<usize> {
        let mut previous = 0usize;
        scores
            .iter()
            .map(|row| {
                let mut best = 0usize;
                let mut best_score = f32::NEG_INFINITY;
                for (j, &s) in row.iter().enumerate() {
                    let penalized = s - self.penalty * j as f32;
                    if penalized > best_score {
                        best = j;
                        best_score = penalized;
                    }
                }
                previous = previous.max(best);
                previous
            })
            .collect()
    }

    /// Labels for `scores` `[b, t, s]` (padded cells already at
    /// [`PADDING_SCORE`]).
    pub fn label(&self, scores: &Tensor) -> Result<OracleLabels, GridError> {
        let (batch, tgt_len, src_len) = scores.dims3().map_err(|_| {
            GridError::shape(format!(
                "oracle scores must be [batch, target, source], got {:?}",
                scores.dims()
            ))
        })?;
        if src_len == 0 {
            return Err(GridError::shape("oracle needs at least one source position"));
        }
        let device = scores.device();
        let table = scores.to_dtype(DType::F32)?.to_vec3::<f32>()?;

        let cells = batch * tgt_len * src_len;
        let mut read = vec![0f32; cells];
        let mut write = vec![0f32; cells];
        let mut gamma = vec![0f32; batch * tgt_len];
        let mut boundaries = Vec::with_capacity(batch);
        for (b, rows) in table.iter().enumerate() {
            let bounds = self.boundaries(rows);
            for (i, (&boundary, row)) in bounds.iter().zip(rows.iter()).enumerate() {
                let offset = (b * tgt_len + i) * src_len;
                for j in 0..src_len {
                    if j < boundary {
                        read[offset + j] = 1.0;
                    } else if j == boundary || self.write_right {
                        write[offset + j] = 1.0;
                    }
                }
                gamma[b * tgt_len + i] = row[boundary] - row[0];
            }
            boundaries.push(bounds);
        }

        let shape = (batch, tgt_len, src_len);
        Ok(OracleLabels {
            read: to_tensor(read, shape, device, scores.dtype())?,
            write: to_tensor(write, shape, device, scores.dtype())?,
            gamma: to_tensor(gamma, (batch, tgt_len), device, scores.dtype())?,
            boundaries,
        })
    }
}

fn to_tensor<S: Into<candle_core::Shape>>(
    data: Vec<f32>,
    shape: S,
    device: &Device,
    dtype: DType,
) -> Result<Tensor, GridError> {
    Ok(Tensor::from_vec(data, shape, device)?.to_dtype(dtype)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn boundary_is_first_maximum() {
        let oracle = Oracle::new(0.0, false);
        let scores = vec![
            vec![-3.0, -1.0, -1.0, -2.0],
            vec![-0.5, -0.5, -0.5, -0.5],
        ];
        // Row 1 ties everywhere; monotonicity keeps it at row 0's boundary.
        assert_eq!(oracle.boundaries(&scores), vec![1, 1]);
    }

    #[test]
    fn penalty_favours_earlier_writes() {
        let scores = vec![vec![-2.0, -1.8, -1.7]];
        assert_eq!(Oracle::new(0.0, false).boundaries(&scores), vec![2]);
        assert_eq!(Oracle::new(0.15, false).boundaries(&scores), vec![1]);
        assert_eq!(Oracle::new(1.0, false).boundaries(&scores), vec![0]);
    }

    #[test]
    fn labels_form_a_staircase() -> Result<(), GridError> {
        let device = Device::Cpu;
        let scores = Tensor::from_vec(
            vec![
                -1.0f32, -0.2, -0.3, // boundary 1
                -2.0, -2.0, -2.0, // boundary 0 -> 1
                -4.0, -3.0, -0.1, // boundary 2
            ],
            (1, 3, 3),
            &device,
        )?;
        let labels = Oracle::new(0.0, false).label(&scores)?;
        assert_eq!(labels.boundaries, vec![vec![1, 1, 2]]);
        assert_eq!(
            labels.read.squeeze(0)?.to_vec2::<f32>()?,
            vec![
                vec![1.0, 0.0, 0.0],
                vec![1.0, 0.0, 0.0],
                vec![1.0, 1.0, 0.0]
            ]
        );
        assert_eq!(
            labels.write.squeeze(0)?.to_vec2::<f32>()?,
            vec![
                vec![0.0, 1.0, 0.0],
                vec![0.0, 1.0, 0.0],
                vec![0.0, 0.0, 1.0]
            ]
        );
        let gamma = labels.gamma.squeeze(0)?.to_vec1::<f32>()?;
        assert!((gamma[0] - 0.8).abs() < 1e-6);
        assert_eq!(gamma[1], 0.0);
        assert!((gamma[2] - 3.9).abs() < 1e-6);
        Ok(())
    }

    #[test]
    fn write_right_fills_the_tail() -> Result<(), GridError> {
        let scores = Tensor::from_vec(vec![-3.0f32, -1.0, -2.0, -2.5], (1, 1, 4), &Device::Cpu)?;
        let labels = Oracle::new(0.0, true).label(&scores)?;
        assert_eq!(
            labels.write.flatten_all()?.to_vec1::<f32>()?,
            vec![0.0, 1.0, 1.0, 1.0]
        );
        assert_eq!(
            labels.read.flatten_all()?.to_vec1::<f32>()?,
            vec![1.0, 0.0, 0.0, 0.0]
        );
        Ok(())
    }

    #[test]
    fn padded_source_columns_never_become_boundaries() {
        let oracle = Oracle::new(0.0, false);
        let scores = vec![vec![-5.0, -4.0, PADDING_SCORE, PADDING_SCORE]];
        assert_eq!(oracle.boundaries(&scores), vec![1]);
    }
}
