//! Geometry recorded by a primed convolution cache.

use crate::core::GridError;

/// Shape of the rows held by a [`ConvCache`](super::ConvCache):
/// `[batch, history_rows, source_len, channels]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheLayout {
    pub batch: usize,
    /// Trailing target rows kept between steps (`half * target_dilation`).
    pub history_rows: usize,
    /// Source extent every cached row was computed against.
    pub source_len: usize,
    pub channels: usize,
}

impl CacheLayout {
    pub fn dims(&self) -> (usize, usize, usize, usize) {
        (self.batch, self.history_rows, self.source_len, self.channels)
    }

    /// Checks that an incoming `[batch, rows, source_len, channels]` slice can
    /// be appended to rows with this layout.
    pub fn expect_compatible(&self, dims: &[usize]) -> Result<(), GridError> {
        match dims {
            [batch, _, source_len, channels]
                if *batch == self.batch
                    && *source_len == self.source_len
                    && *channels == self.channels =>
            {
                Ok(())
            }
            _ => Err(GridError::cache(format!(
                "incoming rows {dims:?} do not extend cached rows [{}, *, {}, {}]",
                self.batch, self.source_len, self.channels
            ))),
        }
    }
}
