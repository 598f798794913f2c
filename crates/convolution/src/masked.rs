//! Causal masked 2D convolution over channel-last grids.
//!
//! The convolution is evaluated as a sum over live kernel taps: every tap
//! `(r, c)` reads a shifted window of the zero-padded input and contributes a
//! `[in, out]` matmul. This keeps dilation independent per axis and never
//! touches the dead half of the kernel.
//!
//! Geometry for a kernel of size `k`, `half = (k - 1) / 2`:
//!
//! * the input gets `half * target_dilation` zero rows on top, none below, so
//!   output row `i` sees rows `i - half * dt ..= i`;
//! * the source axis gets `half * source_dilation` zero columns on the left
//!   and, unless double masked, the same on the right.
//!
//! [`MaskedConv2d::forward_cached`] consumes only the newest rows and reuses
//! the rows held in a [`ConvCache`]; its output is identical to the matching
//! rows of [`MaskedConv2d::forward`] on the full grid.

use candle_core::{DType, Device, IndexOp, Tensor, Var};
use layers::{Mode, PrecisionPolicy};

use crate::{
    cache::ConvCache,
    core::{ConvConfig, GridError},
    masks,
};

#[derive(Debug, Clone)]
pub struct MaskedConv2d {
    config: ConvConfig,
    weight: Var,
    bias: Option<Var>,
    taps: Vec<(usize, usize)>,
    policy: PrecisionPolicy,
}

impl MaskedConv2d {
    /// Xavier-uniform weights over the live taps, masked taps zeroed, zero bias.
    pub fn new(config: ConvConfig, device: &Device, dtype: DType) -> Result<Self, GridError> {
        config.validate()?;
        let k = config.kernel_size;
        let taps = masks::live_taps(k, config.double_masked);
        let fan_in = (config.in_channels * taps.len()) as f64;
        let fan_out = (config.out_channels * taps.len()) as f64;
        let bound = (6.0 / (fan_in + fan_out)).sqrt() as f32;
        let shape = (config.out_channels, config.in_channels, k, k);
        let mask = masks::kernel_mask_tensor(
            device,
            DType::F32,
            config.out_channels,
            config.in_channels,
            k,
            config.double_masked,
        )?;
        let sampled = Tensor::rand(-bound, bound, shape, device)?
            .mul(&mask)?
            .to_dtype(dtype)?;
        let weight = Var::from_tensor(&sampled)?;
        let bias = if config.bias {
            Some(Var::zeros(config.out_channels, dtype, device)?)
        } else {
            None
        };
        Self::from_parameters(config, weight, bias)
    }

    /// Wraps existing parameters. Values at masked taps are ignored.
    pub fn from_parameters(
        config: ConvConfig,
        weight: Var,
        bias: Option<Var>,
    ) -> Result<Self, GridError> {
        config.validate()?;
        let k = config.kernel_size;
        let expected = [config.out_channels, config.in_channels, k, k];
        if weight.dims() != expected.as_slice() {
            return Err(GridError::shape(format!(
                "convolution weight must be {expected:?}, got {:?}",
                weight.dims()
            )));
        }
        match (&bias, config.bias) {
            (Some(b), true) if b.dims() == [config.out_channels].as_slice() => {}
            (None, false) => {}
            (Some(b), _) => {
                return Err(GridError::shape(format!(
                    "unexpected convolution bias {:?} (bias enabled: {})",
                    b.dims(),
                    config.bias
                )))
            }
            (None, true) => return Err(GridError::config("config expects a convolution bias")),
        }
        let taps = masks::live_taps(k, config.double_masked);
        let policy = PrecisionPolicy::from_parameter_dtype(weight.dtype());
        Ok(Self {
            config,
            weight,
            bias,
            taps,
            policy,
        })
    }

    pub fn config(&self) -> &ConvConfig {
        &self.config
    }

    pub fn history_rows(&self) -> usize {
        self.config.history_rows()
    }

    pub fn output_width(&self, source_len: usize) -> Result<usize, GridError> {
        self.config.output_width(source_len)
    }

    pub fn weight(&self) -> &Var {
        &self.weight
    }

    /// Weight with masked taps zeroed.
    pub fn effective_weight(&self) -> Result<Tensor, GridError> {
        let c = &self.config;
        let mask = masks::kernel_mask_tensor(
            self.weight.device(),
            self.weight.dtype(),
            c.out_channels,
            c.in_channels,
            c.kernel_size,
            c.double_masked,
        )?;
        Ok(self.weight.as_tensor().mul(&mask)?)
    }

    pub fn named_parameters(&self, prefix: &str) -> Vec<(String, Var)> {
        let mut params = vec![(format!("{prefix}.weight"), self.weight.clone())];
        if let Some(bias) = &self.bias {
            params.push((format!("{prefix}.bias"), bias.clone()));
        }
        params
    }

    /// Full-grid convolution: `[b, t, s, in]` -> `[b, t, s', out]`.
    pub fn forward(&self, grid: &Tensor) -> Result<Tensor, GridError> {
        let (batch, tgt_len, src_len, channels) = self.expect_input(grid)?;
        let history = self.history_rows();
        let padded = if history == 0 {
            grid.clone()
        } else {
            let top = Tensor::zeros(
                (batch, history, src_len, channels),
                grid.dtype(),
                grid.device(),
            )?;
            Tensor::cat(&[&top, grid], 1)?
        };
        self.convolve_rows(&padded, tgt_len)
    }

    /// Convolves the newest `rows` (`[b, n, s, in]`, usually `n = 1`) against
    /// the history held in `cache` and advances the cache by `n` rows.
    pub fn forward_cached(
        &self,
        rows: &Tensor,
        cache: &mut ConvCache,
        mode: Mode,
    ) -> Result<Tensor, GridError> {
        if mode.is_training() {
            return Err(GridError::ModeMismatch(
                "incremental convolution is evaluation-only".into(),
            ));
        }
        let (_, n, _, _) = self.expect_input(rows)?;
        let extended = cache.advance(rows, self.history_rows())?;
        self.convolve_rows(&extended, n)
    }

    fn expect_input(&self, grid: &Tensor) -> Result<(usize, usize, usize, usize), GridError> {
        let dims = grid.dims4().map_err(|_| {
            GridError::shape(format!(
                "masked convolution expects [batch, target, source, channels], got {:?}",
                grid.dims()
            ))
        })?;
        if dims.3 != self.config.in_channels {
            return Err(GridError::shape(format!(
                "masked convolution expects {} input channels, got {}",
                self.config.in_channels, dims.3
            )));
        }
        if dims.1 == 0 || dims.2 == 0 {
            return Err(GridError::shape(format!(
                "masked convolution got an empty grid {:?}",
                grid.dims()
            )));
        }
        Ok(dims)
    }

    /// `padded` carries `history_rows` leading rows; produces the last
    /// `out_rows` output rows.
    fn convolve_rows(&self, padded: &Tensor, out_rows: usize) -> Result<Tensor, GridError> {
        let c = &self.config;
        let policy = &self.policy;
        let input = policy.cast_for_compute(padded)?;
        let (batch, _, src_len, in_ch) = input.dims4()?;
        let out_w = c.output_width(src_len)?;

        let (left, right) = c.source_padding();
        let input = pad_source(&input, left, right)?;

        let weight = policy.cast_for_compute(self.weight.as_tensor())?;
        let mut acc: Option<Tensor> = None;
        for &(r, col) in &self.taps {
            let rows = input.narrow(1, r * c.target_dilation, out_rows)?;
            let offset = col * c.source_dilation;
            let window = if c.stride == 1 {
                rows.narrow(2, offset, out_w)?
            } else {
                let index = (0..out_w)
                    .map(|j| (j * c.stride + offset) as u32)
                    .collect::<Vec<_>>();
                let index = Tensor::from_vec(index, out_w, input.device())?;
                rows.contiguous()?.index_select(&index, 2)?
            };
            let flat = window
                .contiguous()?
                .reshape((batch * out_rows * out_w, in_ch))?;
            let tap = weight.i((.., .., r, col))?.t()?.contiguous()?;
            let term = flat.matmul(&tap)?;
            acc = Some(match acc {
                Some(sum) => sum.add(&term)?,
                None => term,
            });
        }
        let summed = acc.ok_or_else(|| GridError::config("masked kernel has no live taps"))?;
        let mut output = summed.reshape((batch, out_rows, out_w, c.out_channels))?;
        if let Some(bias) = &self.bias {
            output = output.broadcast_add(&policy.cast_for_compute(bias.as_tensor())?)?;
        }
        Ok(policy.cast_to_storage(&output)?)
    }
}

fn pad_source(grid: &Tensor, left: usize, right: usize) -> candle_core::Result<Tensor> {
    if left == 0 && right == 0 {
        return Ok(grid.clone());
    }
    let (batch, rows, _, channels) = grid.dims4()?;
    let zeros = |width| Tensor::zeros((batch, rows, width, channels), grid.dtype(), grid.device());
    let mut parts = Vec::with_capacity(3);
    if left > 0 {
        parts.push(zeros(left)?);
    }
    parts.push(grid.clone());
    if right > 0 {
        parts.push(zeros(right)?);
    }
    Tensor::cat(&parts, 2)
}
