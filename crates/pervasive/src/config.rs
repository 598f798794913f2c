use std::{fmt, fs, path::Path};

use convolution::{ConvConfig, GridError};
use layers::Dropout;
use serde::{Deserialize, Serialize};

/// Which grid network sits between the grid builder and the aggregator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NetworkKind {
    #[default]
    Residual,
    Dense,
}

/// Reduction over the source axis.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Aggregation {
    #[default]
    Max,
    Mean,
}

/// Hyperparameters of the grid model, controller included.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct ModelConfig {
    pub vocab_size: usize,
    #[serde(default = "default_embed_dim")]
    pub encoder_embed_dim: usize,
    #[serde(default = "default_embed_dim")]
    pub decoder_embed_dim: usize,

    #[serde(default)]
    pub network: NetworkKind,
    #[serde(default = "default_num_layers")]
    pub num_layers: usize,
    #[serde(default = "default_kernel_size")]
    pub kernel_size: usize,
    #[serde(default = "default_one")]
    pub source_dilation: usize,
    #[serde(default = "default_one")]
    pub target_dilation: usize,
    #[serde(default = "default_one")]
    pub conv_stride: usize,
    #[serde(default = "default_true")]
    pub maintain_resolution: bool,
    #[serde(default = "default_true")]
    pub double_masked: bool,
    #[serde(default = "default_divide_channels")]
    pub divide_channels: usize,
    /// Width of the 1x1 projection in each residual block; defaults to the
    /// network width.
    #[serde(default)]
    pub reduce_dim: Option<usize>,
    #[serde(default = "default_ffn_dim")]
    pub ffn_dim: usize,
    #[serde(default)]
    pub conv_bias: bool,
    #[serde(default = "default_residual_scale")]
    pub residual_scale: f32,
    #[serde(default = "default_growth_rate")]
    pub growth_rate: usize,
    #[serde(default = "default_bn_size")]
    pub bn_size: usize,
    #[serde(default)]
    pub nonzero_padding: bool,
    #[serde(default)]
    pub aggregation: Aggregation,

    /// Width of the pre-softmax projection; defaults to `decoder_embed_dim`.
    #[serde(default)]
    pub output_dim: Option<usize>,
    #[serde(default)]
    pub skip_output_mapping: bool,
    #[serde(default)]
    pub share_decoder_input_output_embed: bool,

    #[serde(default = "default_dropout")]
    pub input_dropout: f32,
    #[serde(default)]
    pub embeddings_dropout: f32,
    #[serde(default = "default_dropout")]
    pub convolution_dropout: f32,
    #[serde(default = "default_dropout")]
    pub prediction_dropout: f32,

    #[serde(default = "default_num_control_layers")]
    pub num_control_layers: usize,
    #[serde(default = "default_kernel_size")]
    pub control_kernel_size: usize,
    #[serde(default)]
    pub detach_controls: bool,
    #[serde(default)]
    pub oracle_penalty: f32,
    #[serde(default)]
    pub write_right: bool,

    #[serde(default = "default_seed")]
    pub seed: u64,
}

fn default_embed_dim() -> usize {
    256
}

fn default_num_layers() -> usize {
    24
}

fn default_kernel_size() -> usize {
    3
}

fn default_one() -> usize {
    1
}

fn default_true() -> bool {
    true
}

fn default_divide_channels() -> usize {
    2
}

fn default_ffn_dim() -> usize {
    512
}

fn default_residual_scale() -> f32 {
    1.0
}

fn default_growth_rate() -> usize {
    32
}

fn default_bn_size() -> usize {
    4
}

fn default_dropout() -> f32 {
    0.2
}

fn default_num_control_layers() -> usize {
    8
}

fn default_seed() -> u64 {
    42
}

impl ModelConfig {
    /// Base architecture for a vocabulary of `vocab_size` tokens.
    pub fn new(vocab_size: usize) -> Self {
        Self {
            vocab_size,
            encoder_embed_dim: default_embed_dim(),
            decoder_embed_dim: default_embed_dim(),
            network: NetworkKind::default(),
            num_layers: default_num_layers(),
            kernel_size: default_kernel_size(),
            source_dilation: 1,
            target_dilation: 1,
            conv_stride: 1,
            maintain_resolution: true,
            double_masked: true,
            divide_channels: default_divide_channels(),
            reduce_dim: None,
            ffn_dim: default_ffn_dim(),
            conv_bias: false,
            residual_scale: default_residual_scale(),
            growth_rate: default_growth_rate(),
            bn_size: default_bn_size(),
            nonzero_padding: false,
            aggregation: Aggregation::default(),
            output_dim: None,
            skip_output_mapping: false,
            share_decoder_input_output_embed: false,
            input_dropout: default_dropout(),
            embeddings_dropout: 0.0,
            convolution_dropout: default_dropout(),
            prediction_dropout: default_dropout(),
            num_control_layers: default_num_control_layers(),
            control_kernel_size: default_kernel_size(),
            detach_controls: false,
            oracle_penalty: 0.0,
            write_right: false,
            seed: default_seed(),
        }
    }

    /// Reads a TOML (`.toml` or no extension) or JSON (`.json`) file and
    /// validates it.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path)?;
        let config: ModelConfig = match path.extension().and_then(|ext| ext.to_str()) {
            Some("json") => serde_json::from_str(&contents)?,
            Some("toml") | Some("tml") | None => toml::from_str(&contents)?,
            Some(other) => {
                return Err(ConfigError::Format(format!(
                    "unsupported configuration extension '{}'",
                    other
                )));
            }
        };
        config.validate()?;
        Ok(config)
    }

    /// Channels of the raw grid: `encoder_embed_dim + decoder_embed_dim`.
    pub fn grid_channels(&self) -> usize {
        self.encoder_embed_dim + self.decoder_embed_dim
    }

    /// Channels carried through the network after the optional reduction.
    pub fn network_channels(&self) -> usize {
        self.grid_channels() / self.divide_channels.max(1)
    }

    pub fn reduce_dim(&self) -> usize {
        self.reduce_dim.unwrap_or_else(|| self.network_channels())
    }

    pub fn output_dim(&self) -> usize {
        self.output_dim.unwrap_or(self.decoder_embed_dim)
    }

    /// Whether the predictor projects network features before the vocabulary
    /// matrix.
    pub fn uses_output_projection(&self) -> bool {
        !(self.skip_output_mapping && self.output_dim() == self.network_channels())
    }

    /// Masked convolution geometry shared by every network layer.
    pub fn conv_config(&self, in_channels: usize, out_channels: usize) -> ConvConfig {
        ConvConfig {
            in_channels,
            out_channels,
            kernel_size: self.kernel_size,
            source_dilation: self.source_dilation,
            target_dilation: self.target_dilation,
            stride: self.conv_stride,
            maintain_resolution: self.maintain_resolution,
            double_masked: self.double_masked,
            bias: self.conv_bias,
        }
    }

    /// Controller convolutions: double masked, undilated, on the raw grid.
    pub fn control_conv_config(&self) -> ConvConfig {
        let channels = self.grid_channels();
        ConvConfig::new(channels, channels, self.control_kernel_size).with_double_masking(true)
    }

    /// Dropout layer for one dropout site; every site draws its own mask
    /// stream derived from `seed`.
    pub fn dropout(&self, probability: f32, site: u64) -> Dropout {
        let stream = self
            .seed
            .wrapping_add(site.wrapping_mul(0x9E37_79B9_7F4A_7C15));
        Dropout::new(probability, stream)
    }

    /// Collects every violation before failing.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut errors = Vec::new();

        if self.vocab_size == 0 {
            errors.push("vocab_size must be greater than 0".to_string());
        }
        if self.encoder_embed_dim == 0 || self.decoder_embed_dim == 0 {
            errors.push("encoder_embed_dim and decoder_embed_dim must be greater than 0".to_string());
        }
        if self.num_layers == 0 {
            errors.push("num_layers must be greater than 0".to_string());
        }
        if self.kernel_size % 2 == 0 {
            errors.push(format!("kernel_size must be odd, got {}", self.kernel_size));
        }
        if self.control_kernel_size % 2 == 0 {
            errors.push(format!(
                "control_kernel_size must be odd, got {}",
                self.control_kernel_size
            ));
        }
        if self.source_dilation == 0 || self.target_dilation == 0 {
            errors.push("source_dilation and target_dilation must be at least 1".to_string());
        }
        if self.conv_stride == 0 {
            errors.push("conv_stride must be at least 1".to_string());
        }
        if self.maintain_resolution && self.conv_stride != 1 {
            errors.push(format!(
                "could not maintain the resolution with conv_stride={}",
                self.conv_stride
            ));
        }
        if !self.maintain_resolution {
            errors.push(
                "grid networks require maintain_resolution = true (residual sums and padding masks need a fixed source extent)"
                    .to_string(),
            );
        }
        if self.divide_channels == 0 {
            errors.push("divide_channels must be greater than 0".to_string());
        } else if self.grid_channels() % self.divide_channels != 0 {
            errors.push(format!(
                "divide_channels ({}) must divide the grid channels ({})",
                self.divide_channels,
                self.grid_channels()
            ));
        }
        if self.reduce_dim == Some(0) {
            errors.push("reduce_dim must be greater than 0".to_string());
        }
        if self.ffn_dim == 0 {
            errors.push("ffn_dim must be greater than 0".to_string());
        }
        if self.network == NetworkKind::Dense && (self.growth_rate == 0 || self.bn_size == 0) {
            errors.push("growth_rate and bn_size must be greater than 0".to_string());
        }
        if !(self.residual_scale.is_finite() && self.residual_scale > 0.0) {
            errors.push("residual_scale must be a positive finite number".to_string());
        }
        if !self.oracle_penalty.is_finite() {
            errors.push("oracle_penalty must be finite".to_string());
        }
        if self.output_dim == Some(0) {
            errors.push("output_dim must be greater than 0".to_string());
        }
        for (name, p) in [
            ("input_dropout", self.input_dropout),
            ("embeddings_dropout", self.embeddings_dropout),
            ("convolution_dropout", self.convolution_dropout),
            ("prediction_dropout", self.prediction_dropout),
        ] {
            if !(0.0..1.0).contains(&p) {
                errors.push(format!("{name} must be in [0, 1)"));
            }
        }
        if self.share_decoder_input_output_embed {
            let width = if self.uses_output_projection() {
                self.output_dim()
            } else {
                self.network_channels()
            };
            if width != self.decoder_embed_dim {
                errors.push(format!(
                    "sharing the decoder embedding needs prediction inputs of width decoder_embed_dim ({}), got {}",
                    self.decoder_embed_dim, width
                ));
            }
        }

        if !errors.is_empty() {
            return Err(ConfigError::validation(errors));
        }
        Ok(())
    }
}

#[derive(Debug)]
pub enum ConfigError {
    Io(std::io::Error),
    Format(String),
    Validation(Vec<String>),
}

impl ConfigError {
    pub fn validation(messages: Vec<String>) -> Self {
        Self::Validation(messages)
    }
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::Io(err) => write!(f, "failed to read config: {}", err),
            ConfigError::Format(err) => write!(f, "failed to parse config: {}", err),
            ConfigError::Validation(messages) => {
                write!(f, "invalid configuration: {}", messages.join("; "))
            }
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConfigError::Io(err) => Some(err),
            ConfigError::Format(_) | ConfigError::Validation(_) => None,
        }
    }
}

impl From<std::io::Error> for ConfigError {
    fn from(value: std::io::Error) -> Self {
        ConfigError::Io(value)
    }
}

impl From<toml::de::Error> for ConfigError {
    fn from(value: toml::de::Error) -> Self {
        ConfigError::Format(value.to_string())
    }
}

impl From<serde_json::Error> for ConfigError {
    fn from(value: serde_json::Error) -> Self {
        ConfigError::Format(value.to_string())
    }
}

impl From<ConfigError> for GridError {
    fn from(value: ConfigError) -> Self {
        GridError::UnsupportedConfig(value.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_follow_the_base_architecture() {
        let config = ModelConfig::new(100);
        assert!(config.validate().is_ok());
        assert_eq!(config.grid_channels(), 512);
        assert_eq!(config.network_channels(), 256);
        assert_eq!(config.reduce_dim(), 256);
        assert_eq!(config.output_dim(), 256);
        assert!(config.uses_output_projection());
        assert_eq!(config.num_layers, 24);
        assert!(config.double_masked);
    }

    #[test]
    fn validation_reports_every_problem() {
        let mut config = ModelConfig::new(0);
        config.kernel_size = 4;
        config.conv_stride = 2;
        config.input_dropout = 1.5;
        match config.validate() {
            Err(ConfigError::Validation(messages)) => {
                assert_eq!(messages.len(), 4, "{messages:?}");
                assert!(messages.iter().any(|m| m.contains("conv_stride")));
            }
            other => panic!("expected validation error, got {other:?}"),
        }
    }

    #[test]
    fn dropping_resolution_is_rejected_for_networks() {
        let mut config = ModelConfig::new(10);
        config.maintain_resolution = false;
        assert!(config.validate().is_err());
    }

    #[test]
    fn loads_toml_with_defaults() -> anyhow::Result<()> {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile()?;
        writeln!(
            file,
            "vocab_size = 32\nencoder_embed_dim = 8\ndecoder_embed_dim = 8\nnetwork = \"dense\"\naggregation = \"mean\"\nnum_layers = 2"
        )?;
        let config = ModelConfig::from_path(file.path())?;
        assert_eq!(config.network, NetworkKind::Dense);
        assert_eq!(config.aggregation, Aggregation::Mean);
        assert_eq!(config.network_channels(), 8);
        assert_eq!(config.ffn_dim, 512);
        Ok(())
    }

    #[test]
    fn loads_json_and_rejects_unknown_fields() -> anyhow::Result<()> {
        let mut good = tempfile::Builder::new().suffix(".json").tempfile()?;
        write!(good, r#"{{"vocab_size": 12, "oracle_penalty": 0.5}}"#)?;
        let config = ModelConfig::from_path(good.path())?;
        assert_eq!(config.oracle_penalty, 0.5);

        let mut bad = tempfile::Builder::new().suffix(".json").tempfile()?;
        write!(bad, r#"{{"vocab_size": 12, "attention_heads": 4}}"#)?;
        assert!(matches!(
            ModelConfig::from_path(bad.path()),
            Err(ConfigError::Format(_))
        ));
        Ok(())
    }

    #[test]
    fn unsupported_extension_is_a_format_error() -> anyhow::Result<()> {
        let file = tempfile::Builder::new().suffix(".yaml").tempfile()?;
        assert!(matches!(
            ModelConfig::from_path(file.path()),
            Err(ConfigError::Format(_))
        ));
        Ok(())
    }
}
