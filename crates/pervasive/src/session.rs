use candle_core::Tensor;
use convolution::{GridError, StackCache};

/// State of one incremental decode: per-layer caches plus the target rows
/// consumed so far, kept so the caches can be rebuilt when more source is
/// read.
#[derive(Debug, Clone)]
pub struct DecodingSession {
    cache: StackCache,
    history: Vec<Tensor>,
    source_len: Option<usize>,
}

impl DecodingSession {
    pub(crate) fn new(cache: StackCache) -> Self {
        Self {
            cache,
            history: Vec::new(),
            source_len: None,
        }
    }

    /// Target rows consumed so far.
    pub fn steps(&self) -> usize {
        self.history.len()
    }

    /// Source length the caches were built against.
    pub fn source_len(&self) -> Option<usize> {
        self.source_len
    }

    pub fn cache(&self) -> &StackCache {
        &self.cache
    }

    pub(crate) fn cache_mut(&mut self) -> &mut StackCache {
        &mut self.cache
    }

    /// Returns the target rows to feed through the network for this step.
    ///
    /// Normally that is `target_row` alone. If the source grew, the caches are
    /// reset and the whole history is returned in front of it.
    pub(crate) fn prepare(&mut self, source: &Tensor, target_row: &Tensor) -> Result<Tensor, GridError> {
        let (batch, src_len, _) = source.dims3().map_err(|_| {
            GridError::shape(format!(
                "source must be [batch, source, channels], got {:?}",
                source.dims()
            ))
        })?;
        let (row_batch, rows, _) = target_row.dims3().map_err(|_| {
            GridError::shape(format!(
                "target row must be [batch, 1, channels], got {:?}",
                target_row.dims()
            ))
        })?;
        if rows != 1 || row_batch != batch {
            return Err(GridError::shape(format!(
                "target row must be [{batch}, 1, channels], got {:?}",
                target_row.dims()
            )));
        }

        match self.source_len {
            Some(previous) if src_len < previous => Err(GridError::cache(format!(
                "source shrank from {previous} to {src_len} positions during decoding"
            ))),
            Some(previous) if src_len > previous && !self.history.is_empty() => {
                log::debug!(
                    "source grew from {previous} to {src_len}; replaying {} target rows",
                    self.history.len()
                );
                self.cache.reset();
                let mut rows: Vec<&Tensor> = self.history.iter().collect();
                rows.push(target_row);
                Ok(Tensor::cat(&rows, 1)?)
            }
            _ => Ok(target_row.clone()),
        }
    }

    /// Records a completed step.
    pub(crate) fn commit(&mut self, source_len: usize, target_row: &Tensor) {
        self.history.push(target_row.detach());
        self.source_len = Some(source_len);
    }

    /// Forgets every step, keeping the binding to the model.
    pub fn reset(&mut self) {
        self.cache.reset();
        self.history.clear();
        self.source_len = None;
    }
}
