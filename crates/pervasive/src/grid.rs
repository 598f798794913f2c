//! Builds the `(target × source)` grid from two embedding sequences.

use candle_core::Tensor;
use convolution::GridError;
use layers::{Dropout, Mode, PrecisionPolicy};

/// Broadcasts source `[b, ts, cs]` along the target axis and target
/// `[b, tt, ct]` along the source axis, then concatenates channels as
/// `[source, target]`.
pub fn build_grid(source: &Tensor, target: &Tensor) -> Result<Tensor, GridError> {
    let (src_batch, src_len, src_ch) = source.dims3().map_err(|_| {
        GridError::shape(format!(
            "source embeddings must be [batch, len, channels], got {:?}",
            source.dims()
        ))
    })?;
    let (tgt_batch, tgt_len, tgt_ch) = target.dims3().map_err(|_| {
        GridError::shape(format!(
            "target embeddings must be [batch, len, channels], got {:?}",
            target.dims()
        ))
    })?;
    if src_batch != tgt_batch {
        return Err(GridError::shape(format!(
            "source batch {src_batch} differs from target batch {tgt_batch}"
        )));
    }
    if src_len == 0 || tgt_len == 0 {
        return Err(GridError::shape(format!(
            "grid needs non-empty sequences, got source length {src_len} and target length {tgt_len}"
        )));
    }
    if source.dtype() != target.dtype() {
        return Err(GridError::shape(format!(
            "source dtype {:?} differs from target dtype {:?}",
            source.dtype(),
            target.dtype()
        )));
    }
    let src = source
        .unsqueeze(1)?
        .broadcast_as((src_batch, tgt_len, src_len, src_ch))?;
    let tgt = target
        .unsqueeze(2)?
        .broadcast_as((tgt_batch, tgt_len, src_len, tgt_ch))?;
    Ok(Tensor::cat(&[&src.contiguous()?, &tgt.contiguous()?], 3)?)
}

/// Grid construction with the embedding and input dropout stages.
#[derive(Debug, Clone)]
pub struct GridBuilder {
    source_channels: usize,
    target_channels: usize,
    embeddings_dropout: Dropout,
    input_dropout: Dropout,
    policy: PrecisionPolicy,
}

impl GridBuilder {
    pub fn new(
        source_channels: usize,
        target_channels: usize,
        embeddings_dropout: Dropout,
        input_dropout: Dropout,
        policy: PrecisionPolicy,
    ) -> Self {
        Self {
            source_channels,
            target_channels,
            embeddings_dropout,
            input_dropout,
            policy,
        }
    }

    pub fn channels(&self) -> usize {
        self.source_channels + self.target_channels
    }

    /// `[b, ts, cs]` + `[b, tt, ct]` -> `[b, tt, ts, cs + ct]`.
    pub fn build(&self, source: &Tensor, target: &Tensor, mode: Mode) -> Result<Tensor, GridError> {
        self.expect_channels(source, target)?;
        let source = self.embeddings_dropout.apply(source, mode, &self.policy)?;
        let target = self.embeddings_dropout.apply(target, mode, &self.policy)?;
        let grid = build_grid(&source, &target)?;
        Ok(self.input_dropout.apply(&grid, mode, &self.policy)?)
    }

    fn expect_channels(&self, source: &Tensor, target: &Tensor) -> Result<(), GridError> {
        let src_ch = source.dims().last().copied().unwrap_or(0);
        let tgt_ch = target.dims().last().copied().unwrap_or(0);
        if src_ch != self.source_channels || tgt_ch != self.target_channels {
            return Err(GridError::shape(format!(
                "expected source/target channels {}/{}, got {src_ch}/{tgt_ch}",
                self.source_channels, self.target_channels
            )));
        }
        Ok(())
    }
}
