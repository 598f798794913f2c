//! Controller-driven simultaneous decoding.
//!
//! Starting from one source token, the controller decides at every point
//! whether to read the next source token or to write a target token with the
//! source read so far. Writing runs one incremental step of the model and
//! emits the greedy token.

use candle_core::{DType, Device, IndexOp, Tensor, Var, D};
use convolution::GridError;
use layers::Mode;

use crate::{controller::Action, model::GridModel};

/// Embeds a target prefix. Called with the full prefix so position-dependent
/// embeddings stay consistent; must return `[1, tokens.len(), channels]`.
pub trait TargetEmbedder {
    fn embed(&self, tokens: &[u32]) -> Result<Tensor, GridError>;
}

/// Plain lookup table `[vocab, channels]`.
#[derive(Debug, Clone)]
pub struct EmbeddingTable {
    weight: Var,
}

impl EmbeddingTable {
    pub fn new(weight: Var) -> Result<Self, GridError> {
        if weight.rank() != 2 {
            return Err(GridError::shape(format!(
                "embedding table must be [vocab, channels], got {:?}",
                weight.dims()
            )));
        }
        Ok(Self { weight })
    }

    pub fn randn(vocab: usize, channels: usize, device: &Device, dtype: DType) -> Result<Self, GridError> {
        let std = (channels as f64).powf(-0.5);
        let weight = Tensor::randn(0f32, std as f32, (vocab, channels), device)?.to_dtype(dtype)?;
        Self::new(Var::from_tensor(&weight)?)
    }

    pub fn weight(&self) -> &Var {
        &self.weight
    }

    /// Embeds a `[batch, len]` id tensor.
    pub fn lookup(&self, ids: &Tensor) -> Result<Tensor, GridError> {
        let (batch, len) = ids.dims2()?;
        let flat = ids.flatten_all()?.to_dtype(DType::U32)?;
        let rows = self.weight.as_tensor().index_select(&flat, 0)?;
        Ok(rows.reshape((batch, len, self.weight.dims()[1]))?)
    }
}

impl TargetEmbedder for EmbeddingTable {
    fn embed(&self, tokens: &[u32]) -> Result<Tensor, GridError> {
        let ids = Tensor::new(tokens, self.weight.device())?.unsqueeze(0)?;
        self.lookup(&ids)
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DecodeOptions {
    pub bos: u32,
    pub eos: u32,
    pub max_len: usize,
    /// Write when the controller's write probability reaches this value.
    pub threshold: f32,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct DecodeOutput {
    /// Emitted tokens, without the leading `bos`.
    pub tokens: Vec<u32>,
    /// Every decision taken, in order.
    pub actions: Vec<Action>,
    /// Source tokens read when each output token was written.
    pub delays: Vec<usize>,
}

/// Greedy simultaneous decode of a single source sequence `[1, s, cs]`.
pub fn greedy_decode(
    model: &GridModel,
    source: &Tensor,
    embedder: &dyn TargetEmbedder,
    options: &DecodeOptions,
) -> Result<DecodeOutput, GridError> {
    let (batch, src_len, _) = source.dims3()?;
    if batch != 1 {
        return Err(GridError::config(format!(
            "simultaneous decoding runs one sequence at a time, got batch {batch}"
        )));
    }
    if src_len == 0 {
        return Err(GridError::shape("cannot decode an empty source"));
    }

    let mut session = model.begin_session();
    let mut prefix = vec![options.bos];
    let mut output = DecodeOutput::default();
    let mut read = 1usize;

    while output.tokens.len() < options.max_len {
        let target = embedder.embed(&prefix)?;
        let source_prefix = source.narrow(1, 0, read)?;

        if read < src_len {
            let p_write = model
                .decide(&source_prefix, &target)?
                .to_dtype(DType::F32)?
                .i(0)?
                .to_scalar::<f32>()?;
            if Action::from_probability(p_write, options.threshold) == Action::Read {
                output.actions.push(Action::Read);
                read += 1;
                continue;
            }
        }

        output.actions.push(Action::Write);
        let row = target.narrow(1, prefix.len() - 1, 1)?;
        let log_probs = model.step(&mut session, &source_prefix, &row, None, Mode::Eval)?;
        let token = log_probs
            .squeeze(1)?
            .argmax(D::Minus1)?
            .i(0)?
            .to_scalar::<u32>()?;
        output.tokens.push(token);
        output.delays.push(read);
        prefix.push(token);
        if token == options.eos {
            break;
        }
    }

    log::debug!(
        "decoded {} tokens after reading {read}/{src_len} source positions",
        output.tokens.len()
    );
    Ok(output)
}
