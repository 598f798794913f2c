use candle_core::{DType, Device, Tensor, Var};
use convolution::{GridError, GridMask, PaddingMask};
use layers::{Mode, PrecisionPolicy};

use crate::{
    aggregate::{Aggregated, Aggregator},
    config::ModelConfig,
    controller::{Controller, ControllerOutput, PADDING_SCORE},
    grid::GridBuilder,
    network::{build_network, GridNetwork},
    predictor::Predictor,
    session::DecodingSession,
};

const EMBEDDINGS_DROPOUT_SITE: u64 = 1;
const INPUT_DROPOUT_SITE: u64 = 2;

/// Everything a training step needs from one forward pass.
#[derive(Debug, Clone)]
pub struct TrainOutput {
    /// `[b, t, s, vocab]`: column `j` predicts with source context `0..=j`.
    pub log_probs: Tensor,
    /// `[b, t, s]` detached ground-truth log-likelihood, padded cells at
    /// [`PADDING_SCORE`].
    pub scores: Tensor,
    /// `[b, t, s, c]` controller observations.
    pub observations: Tensor,
    /// `[b, t, s, 2]` controller log-probabilities `[read, write]`.
    pub controls: Tensor,
    /// `[b, t]`
    pub gamma: Tensor,
    /// `[b, t, s]`
    pub read_labels: Tensor,
    /// `[b, t, s]`
    pub write_labels: Tensor,
}

/// Grid builder, network, aggregator, predictor and controller.
#[derive(Debug)]
pub struct GridModel {
    config: ModelConfig,
    builder: GridBuilder,
    network: Box<dyn GridNetwork>,
    aggregator: Aggregator,
    predictor: Predictor,
    controller: Controller,
}

impl GridModel {
    /// `tied` is the decoder embedding table, used as the prediction matrix
    /// when `share_decoder_input_output_embed` is set.
    pub fn new(
        config: &ModelConfig,
        device: &Device,
        dtype: DType,
        tied: Option<&Var>,
    ) -> Result<Self, GridError> {
        config.validate()?;
        let policy = PrecisionPolicy::from_parameter_dtype(dtype);
        let builder = GridBuilder::new(
            config.encoder_embed_dim,
            config.decoder_embed_dim,
            config.dropout(config.embeddings_dropout, EMBEDDINGS_DROPOUT_SITE),
            config.dropout(config.input_dropout, INPUT_DROPOUT_SITE),
            policy,
        );
        let network = build_network(config, device, dtype)?;
        let aggregator = Aggregator::new(config.aggregation, policy);
        let predictor = Predictor::new(config, device, dtype, tied)?;
        let controller = Controller::new(config, device, dtype)?;
        let model = Self {
            config: config.clone(),
            builder,
            network,
            aggregator,
            predictor,
            controller,
        };
        log::info!(
            "grid model ready: vocab {}, grid channels {}, network width {}, {} parameters tensors",
            config.vocab_size,
            config.grid_channels(),
            config.network_channels(),
            model.named_parameters().len()
        );
        Ok(model)
    }

    pub fn config(&self) -> &ModelConfig {
        &self.config
    }

    pub fn network(&self) -> &dyn GridNetwork {
        self.network.as_ref()
    }

    pub fn controller(&self) -> &Controller {
        &self.controller
    }

    pub fn vocab_size(&self) -> usize {
        self.predictor.vocab_size()
    }

    /// Full-sequence scoring. `source` is `[b, ts, cs]`, `target` is
    /// `[b, tt, ct]` (embedded previous outputs) and `target_ids` `[b, tt]`
    /// holds the reference tokens.
    pub fn forward_train(
        &self,
        source: &Tensor,
        target: &Tensor,
        mask: &GridMask,
        target_ids: &Tensor,
        mode: Mode,
    ) -> Result<TrainOutput, GridError> {
        let grid = self.builder.build(source, target, mode)?;
        let (batch, tgt_len, src_len, _) = grid.dims4()?;
        let ids = self.check_target_ids(target_ids, batch, tgt_len)?;

        let features = self.network.forward(&grid, mask, None, mode)?;
        let prefix = self.aggregator.prefix_reduce(&features, mask.source())?;
        let log_probs = self.predictor.forward(&prefix, mode)?;

        let index = ids
            .reshape((batch, tgt_len, 1, 1))?
            .broadcast_as((batch, tgt_len, src_len, 1))?
            .contiguous()?;
        let scores = log_probs.gather(&index, 3)?.squeeze(3)?.detach();
        let scores = match mask.cell_keep(batch, tgt_len, src_len, DType::U8)? {
            Some(keep) => {
                let keep = keep.squeeze(3)?;
                let fill = Tensor::full(PADDING_SCORE, (batch, tgt_len, src_len), scores.device())?
                    .to_dtype(scores.dtype())?;
                keep.where_cond(&scores, &fill)?
            }
            None => scores,
        };

        let ControllerOutput {
            observations,
            controls,
            labels,
        } = self.controller.forward_train(&grid, &scores)?;
        Ok(TrainOutput {
            log_probs,
            scores,
            observations,
            controls,
            gamma: labels.gamma,
            read_labels: labels.read,
            write_labels: labels.write,
        })
    }

    /// Full-context prediction `[b, tt, vocab]` for every target position.
    pub fn forward(
        &self,
        source: &Tensor,
        target: &Tensor,
        mask: &GridMask,
        mode: Mode,
    ) -> Result<Tensor, GridError> {
        let grid = self.builder.build(source, target, mode)?;
        let features = self.network.forward(&grid, mask, None, mode)?;
        let Aggregated { values, .. } = self.aggregator.reduce(&features, mask.source())?;
        self.predictor.forward(&values, mode)
    }

    /// Opens an incremental decoding session bound to this model.
    pub fn begin_session(&self) -> DecodingSession {
        DecodingSession::new(self.network.new_cache())
    }

    /// Advances `session` by one target row (`[b, 1, ct]`) against the source
    /// read so far (`[b, ts, cs]`) and returns `[b, 1, vocab]`.
    ///
    /// When the source grew since the previous step the session is re-primed:
    /// its caches are reset and every earlier target row is replayed against
    /// the longer source. A failed step leaves the session as it was.
    pub fn step(
        &self,
        session: &mut DecodingSession,
        source: &Tensor,
        target_row: &Tensor,
        source_mask: Option<&PaddingMask>,
        mode: Mode,
    ) -> Result<Tensor, GridError> {
        if mode.is_training() {
            return Err(GridError::ModeMismatch(
                "incremental decoding is evaluation-only".into(),
            ));
        }
        // Layers advance their caches one by one; a failure part way through
        // must not leave the session holding a half-applied step.
        let snapshot = session.clone();
        match self.advance(session, source, target_row, source_mask, mode) {
            Ok(log_probs) => {
                session.commit(source.dims()[1], target_row);
                Ok(log_probs)
            }
            Err(err) => {
                *session = snapshot;
                Err(err)
            }
        }
    }

    fn advance(
        &self,
        session: &mut DecodingSession,
        source: &Tensor,
        target_row: &Tensor,
        source_mask: Option<&PaddingMask>,
        mode: Mode,
    ) -> Result<Tensor, GridError> {
        let rows = session.prepare(source, target_row)?;
        let grid = self.builder.build(source, &rows, mode)?;
        let mask = GridMask::new(source_mask.cloned(), None);
        let features = self
            .network
            .forward(&grid, &mask, Some(session.cache_mut()), mode)?;
        let last = features.narrow(1, features.dims()[1] - 1, 1)?;
        let Aggregated { values, .. } = self.aggregator.reduce(&last, source_mask)?;
        self.predictor.forward(&values, mode)
    }

    /// Write probability `[b]` of the controller at the last cell of the grid
    /// built from the source prefix and target prefix.
    pub fn decide(&self, source: &Tensor, target: &Tensor) -> Result<Tensor, GridError> {
        let grid = self.builder.build(source, target, Mode::Eval)?;
        self.controller.write_probability(&grid)
    }

    /// All trainable parameters under stable dotted names.
    pub fn named_parameters(&self) -> Vec<(String, Var)> {
        let mut params = self.network.named_parameters("network");
        params.extend(self.predictor.named_parameters("predictor"));
        params.extend(self.controller.named_parameters("controller"));
        params
    }

    fn check_target_ids(
        &self,
        target_ids: &Tensor,
        batch: usize,
        tgt_len: usize,
    ) -> Result<Tensor, GridError> {
        if target_ids.dims() != [batch, tgt_len].as_slice() {
            return Err(GridError::shape(format!(
                "target ids must be [{batch}, {tgt_len}], got {:?}",
                target_ids.dims()
            )));
        }
        let ids = target_ids.to_dtype(DType::U32)?;
        let vocab = self.vocab_size();
        let rows = ids.to_vec2::<u32>()?;
        if let Some(bad) = rows.iter().flatten().find(|&&id| id as usize >= vocab) {
            return Err(GridError::shape(format!(
                "target id {bad} out of range for vocabulary of {vocab}"
            )));
        }
        Ok(ids)
    }
}
