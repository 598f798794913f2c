//! Maps aggregated features to log-probabilities over the output vocabulary.

use candle_core::{DType, Device, Tensor, Var, D};
use convolution::GridError;
use layers::{Dropout, Linear, LinearConfig, LinearInit, Mode, PrecisionPolicy};

use crate::config::ModelConfig;

pub(crate) const PREDICTION_DROPOUT_SITE: u64 = 3;

#[derive(Debug, Clone)]
pub struct Predictor {
    projection: Option<Linear>,
    dropout: Dropout,
    prediction: Linear,
    policy: PrecisionPolicy,
}

impl Predictor {
    /// `tied` is the decoder embedding table `[vocab, decoder_embed_dim]`,
    /// required when `share_decoder_input_output_embed` is set.
    pub fn new(
        config: &ModelConfig,
        device: &Device,
        dtype: DType,
        tied: Option<&Var>,
    ) -> Result<Self, GridError> {
        let input = config.network_channels();
        let projection = if config.uses_output_projection() {
            Some(Linear::with_init(
                LinearConfig::new(input, config.output_dim()),
                &LinearInit::DropoutScaled {
                    dropout: config.prediction_dropout,
                },
                device,
                dtype,
            )?)
        } else {
            None
        };
        let width = projection
            .as_ref()
            .map(|p| p.config().output_dim)
            .unwrap_or(input);
        let prediction_config = LinearConfig::new(width, config.vocab_size);
        let prediction = match (config.share_decoder_input_output_embed, tied) {
            (true, Some(embedding)) => Linear::tied(prediction_config, embedding)?,
            (true, None) => {
                return Err(GridError::config(
                    "share_decoder_input_output_embed needs the decoder embedding table",
                ))
            }
            (false, _) => Linear::with_init(
                prediction_config,
                &LinearInit::DropoutScaled { dropout: 0.0 },
                device,
                dtype,
            )?,
        };
        Ok(Self {
            projection,
            dropout: config.dropout(config.prediction_dropout, PREDICTION_DROPOUT_SITE),
            prediction,
            policy: PrecisionPolicy::from_parameter_dtype(dtype),
        })
    }

    pub fn vocab_size(&self) -> usize {
        self.prediction.config().output_dim
    }

    /// Unnormalized scores `[.., vocab]` for features `[.., channels]`.
    pub fn logits(&self, features: &Tensor, mode: Mode) -> Result<Tensor, GridError> {
        let x = match &self.projection {
            Some(projection) => projection.forward(features, &self.policy)?,
            None => features.clone(),
        };
        let x = self.dropout.apply(&x, mode, &self.policy)?;
        Ok(self.prediction.forward(&x, &self.policy)?)
    }

    /// Log-probabilities `[.., vocab]`, normalized in the compute dtype.
    pub fn forward(&self, features: &Tensor, mode: Mode) -> Result<Tensor, GridError> {
        let logits = self.policy.cast_for_compute(&self.logits(features, mode)?)?;
        let log_probs = candle_nn::ops::log_softmax(&logits, D::Minus1)?;
        Ok(self.policy.cast_to_storage(&log_probs)?)
    }

    pub fn named_parameters(&self, prefix: &str) -> Vec<(String, Var)> {
        let mut params = match &self.projection {
            Some(projection) => projection.named_parameters(&format!("{prefix}.projection")),
            None => Vec::new(),
        };
        params.extend(self.prediction.named_parameters(&format!("{prefix}.prediction")));
        params
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> ModelConfig {
        let mut config = ModelConfig::new(9);
        config.encoder_embed_dim = 4;
        config.decoder_embed_dim = 4;
        config.divide_channels = 1;
        config.prediction_dropout = 0.0;
        config
    }

    #[test]
    fn rows_are_normalized_distributions() -> Result<(), GridError> {
        let predictor = Predictor::new(&config(), &Device::Cpu, DType::F32, None)?;
        let features = Tensor::randn(0f32, 1.0, (2, 3, 5, 8), &Device::Cpu)?;
        let log_probs = predictor.forward(&features, Mode::Eval)?;
        assert_eq!(log_probs.dims(), &[2, 3, 5, 9]);
        let sums = log_probs.exp()?.sum(3)?.flatten_all()?.to_vec1::<f32>()?;
        assert!(sums.iter().all(|s| (s - 1.0).abs() < 1e-5));
        Ok(())
    }

    #[test]
    fn skipping_the_projection_needs_matching_width() -> Result<(), GridError> {
        let mut config = config();
        config.skip_output_mapping = true;
        config.output_dim = Some(8);
        let predictor = Predictor::new(&config, &Device::Cpu, DType::F32, None)?;
        assert!(predictor.projection.is_none());

        config.output_dim = Some(6);
        let predictor = Predictor::new(&config, &Device::Cpu, DType::F32, None)?;
        assert!(predictor.projection.is_some());
        Ok(())
    }

    #[test]
    fn tied_prediction_shares_the_embedding_storage() -> Result<(), GridError> {
        let mut config = config();
        config.share_decoder_input_output_embed = true;
        assert!(Predictor::new(&config, &Device::Cpu, DType::F32, None).is_err());

        let embedding = Var::randn(0f32, 1.0, (9, 4), &Device::Cpu)?;
        let predictor = Predictor::new(&config, &Device::Cpu, DType::F32, Some(&embedding))?;
        let (_, shared) = predictor
            .named_parameters("out")
            .into_iter()
            .find(|(name, _)| name == "out.prediction.weight")
            .ok_or_else(|| GridError::shape("missing prediction weight"))?;
        assert_eq!(shared.as_tensor().id(), embedding.as_tensor().id());
        Ok(())
    }
}
