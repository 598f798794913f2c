//! Affine projections over channel-last tensors.
//!
//! A [`Linear`] accepts any tensor whose trailing dimension is `input_dim`
//! (sequences `(batch, seq, in)` and grids `(batch, target, source, in)` alike)
//! and maps it to the same leading layout with `output_dim` features. Leading
//! dimensions are flattened into one matmul, so a 1×1 convolution over a grid
//! is just a `Linear`. Weights are [`Var`]s so an external optimizer can train
//! them and tied projections share storage with their source.

use candle_core::{DType, Device, Error, Result, Tensor, Var};

use crate::{checks, dtypes::PrecisionPolicy};

/// Static shape of a projection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinearConfig {
    pub input_dim: usize,
    pub output_dim: usize,
    /// Whether a learnable bias vector is applied.
    pub bias: bool,
}

impl LinearConfig {
    /// Creates a configuration for a projection with bias.
    pub fn new(input_dim: usize, output_dim: usize) -> Self {
        Self {
            input_dim,
            output_dim,
            bias: true,
        }
    }

    /// Same projection without a bias term.
    pub fn no_bias(input_dim: usize, output_dim: usize) -> Self {
        Self {
            bias: false,
            ..Self::new(input_dim, output_dim)
        }
    }
}

/// Weight initialisation policies.
#[derive(Debug, Clone)]
pub enum LinearInit {
    /// Xavier/Glorot uniform initialisation.
    XavierUniform,
    /// Zero-mean normal with an explicit standard deviation.
    Normal { std: f64 },
    /// Normal with `std = sqrt((1 - dropout) / fan_in)`, used for projections
    /// that sit directly behind a dropout layer.
    DropoutScaled { dropout: f32 },
}

impl LinearInit {
    /// Samples a `(out_dim, in_dim)` weight tensor in `f32`.
    pub fn sample(&self, shape: (usize, usize), device: &Device) -> Result<Tensor> {
        let (out_dim, in_dim) = shape;
        let (fan_in, fan_out) = (in_dim as f64, out_dim as f64);
        match self {
            LinearInit::XavierUniform => {
                let bound = (6.0f64 / (fan_in + fan_out)).sqrt();
                Tensor::rand(-bound as f32, bound as f32, shape, device)
            }
            LinearInit::Normal { std } => Tensor::randn(0f32, *std as f32, shape, device),
            LinearInit::DropoutScaled { dropout } => {
                let std = ((1.0 - f64::from(*dropout)) / fan_in).sqrt();
                Tensor::randn(0f32, std as f32, shape, device)
            }
        }
    }
}

/// Dense affine projection with optional bias.
#[derive(Debug, Clone)]
pub struct Linear {
    config: LinearConfig,
    weight: Var,
    bias: Option<Var>,
}

impl Linear {
    /// Constructs a projection from existing parameters.
    pub fn new(config: LinearConfig, weight: Var, bias: Option<Var>) -> Result<Self> {
        Self::validate_weight(&config, &weight)?;
        Self::validate_bias(&config, bias.as_ref())?;
        Ok(Self {
            config,
            weight,
            bias,
        })
    }

    /// Builds a projection with freshly sampled weights and a zero bias.
    pub fn with_init(
        config: LinearConfig,
        init: &LinearInit,
        device: &Device,
        dtype: DType,
    ) -> Result<Self> {
        let sampled = init
            .sample((config.output_dim, config.input_dim), device)?
            .to_dtype(dtype)?;
        let weight = Var::from_tensor(&sampled)?;
        let bias = if config.bias {
            Some(Var::zeros(config.output_dim, dtype, device)?)
        } else {
            None
        };
        Self::new(config, weight, bias)
    }

    /// Creates a projection whose weight *is* `weight` (shared storage).
    ///
    /// Used to tie the output prediction to an embedding table shaped
    /// `(vocab, hidden)`. The bias, when configured, is owned by the new layer.
    pub fn tied(config: LinearConfig, weight: &Var) -> Result<Self> {
        Self::validate_weight(&config, weight)?;
        let bias = if config.bias {
            Some(Var::zeros(
                config.output_dim,
                weight.dtype(),
                weight.device(),
            )?)
        } else {
            None
        };
        Ok(Self {
            config,
            weight: weight.clone(),
            bias,
        })
    }

    pub fn config(&self) -> &LinearConfig {
        &self.config
    }

    /// Returns the weight tensor (no copy).
    pub fn weight(&self) -> &Tensor {
        self.weight.as_tensor()
    }

    /// Trainable parameters keyed by `{prefix}.weight` / `{prefix}.bias`.
    pub fn named_parameters(&self, prefix: &str) -> Vec<(String, Var)> {
        let mut params = vec![(format!("{prefix}.weight"), self.weight.clone())];
        if let Some(bias) = &self.bias {
            params.push((format!("{prefix}.bias"), bias.clone()));
        }
        params
    }

    fn validate_weight(config: &LinearConfig, weight: &Tensor) -> Result<()> {
        checks::expect_shape(
            "linear.weight",
            weight,
            &[config.output_dim, config.input_dim],
        )?;
        checks::expect_dtype_in(
            "linear.weight",
            weight,
            &[DType::F16, DType::BF16, DType::F32, DType::F64],
        )
    }

    fn validate_bias(config: &LinearConfig, bias: Option<&Var>) -> Result<()> {
        match (config.bias, bias) {
            (true, Some(tensor)) => {
                checks::expect_shape("linear.bias", tensor, &[config.output_dim])
            }
            (false, Some(_)) => Err(Error::Msg("bias provided but config disables bias".into())),
            (true, None) => Err(Error::Msg("config expects bias but none supplied".into())),
            (false, None) => Ok(()),
        }
    }

    /// Applies the projection over the trailing dimension of `input`.
    pub fn forward(&self, input: &Tensor, policy: &PrecisionPolicy) -> Result<Tensor> {
        if input.rank() < 2 {
            return Err(Error::Msg(format!(
                "linear expects at least [rows, {}], got {:?}",
                self.config.input_dim,
                input.dims()
            )));
        }
        checks::expect_last_dim("linear.input", input, self.config.input_dim)?;

        let dims = input.dims();
        let rows: usize = dims[..dims.len() - 1].iter().product();
        let mut out_dims = dims[..dims.len() - 1].to_vec();
        out_dims.push(self.config.output_dim);

        let flat = policy
            .cast_for_compute(input)?
            .contiguous()?
            .reshape((rows, self.config.input_dim))?;
        let weight = policy.cast_for_compute(self.weight.as_tensor())?;
        let mut output = flat.matmul(&weight.t()?)?;
        if let Some(bias) = &self.bias {
            output = output.broadcast_add(&policy.cast_for_compute(bias.as_tensor())?)?;
        }
        policy.cast_to_storage(&output.reshape(out_dims)?)
    }
}
