//! Error type shared by the convolution stack and everything built on it.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum GridError {
    /// Tensor shapes do not line up with the documented contract.
    #[error("invalid tensor shape: {context}")]
    InvalidShape { context: String },
    /// The configuration cannot be built (rejected at construction time).
    #[error("unsupported configuration: {0}")]
    UnsupportedConfig(String),
    /// An incremental cache was used with the wrong layer, network or width.
    #[error("cache mismatch: {0}")]
    CacheMismatch(String),
    /// A call was made in a mode it does not support.
    #[error("mode mismatch: {0}")]
    ModeMismatch(String),
    #[error(transparent)]
    Backend(#[from] candle_core::Error),
}

impl GridError {
    pub fn shape(context: impl Into<String>) -> Self {
        GridError::InvalidShape {
            context: context.into(),
        }
    }

    pub fn config(message: impl Into<String>) -> Self {
        GridError::UnsupportedConfig(message.into())
    }

    pub fn cache(message: impl Into<String>) -> Self {
        GridError::CacheMismatch(message.into())
    }
}
