//! Append-only row caches for incremental decoding.
//!
//! A [`ConvCache`] belongs to exactly one masked convolution and keeps the
//! trailing input rows that convolution needs for its next step. A
//! [`StackCache`] owns one slot per layer of a network and is bound to the
//! network instance that created it.

use std::sync::atomic::{AtomicU64, Ordering};

use candle_core::Tensor;

use super::CacheLayout;
use crate::core::GridError;

static NEXT_OWNER: AtomicU64 = AtomicU64::new(1);

/// Process-unique identifier handed to every network that creates caches.
pub fn next_owner_id() -> u64 {
    NEXT_OWNER.fetch_add(1, Ordering::Relaxed)
}

#[derive(Debug, Clone, Default)]
pub struct ConvCache {
    history: Option<Tensor>,
    layout: Option<CacheLayout>,
    steps: usize,
}

impl ConvCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_primed(&self) -> bool {
        self.layout.is_some()
    }

    pub fn layout(&self) -> Option<&CacheLayout> {
        self.layout.as_ref()
    }

    /// Held-over rows, `None` before the first step or when the kernel keeps
    /// no history.
    pub fn history(&self) -> Option<&Tensor> {
        self.history.as_ref()
    }

    /// Target rows appended since the cache was created or reset.
    pub fn steps(&self) -> usize {
        self.steps
    }

    pub fn reset(&mut self) {
        self.history = None;
        self.layout = None;
        self.steps = 0;
    }

    /// Prepends the held-over rows to `rows` (`[batch, n, source, channels]`)
    /// and keeps the last `history_rows` rows of the result for the next step.
    ///
    /// Returns the extended window `[batch, history_rows + n, source,
    /// channels]`. An unprimed cache behaves as if it held zero rows.
    pub fn advance(&mut self, rows: &Tensor, history_rows: usize) -> Result<Tensor, GridError> {
        let (batch, n, source_len, channels) = rows.dims4()?;
        if n == 0 {
            return Err(GridError::shape("incremental step needs at least one row"));
        }
        match &self.layout {
            Some(layout) => {
                if layout.history_rows != history_rows {
                    return Err(GridError::cache(format!(
                        "cache keeps {} rows but the layer asked for {history_rows}",
                        layout.history_rows
                    )));
                }
                layout.expect_compatible(rows.dims())?;
            }
            None => {
                let layout = CacheLayout {
                    batch,
                    history_rows,
                    source_len,
                    channels,
                };
                log::debug!("priming convolution cache {:?}", layout.dims());
                self.layout = Some(layout);
            }
        }

        if history_rows == 0 {
            self.steps += n;
            return Ok(rows.clone());
        }
        let history = match &self.history {
            Some(history) => history.clone(),
            None => Tensor::zeros(
                (batch, history_rows, source_len, channels),
                rows.dtype(),
                rows.device(),
            )?,
        };
        let extended = Tensor::cat(&[&history, rows], 1)?;
        self.history = Some(extended.narrow(1, n, history_rows)?.detach());
        self.steps += n;
        Ok(extended)
    }
}

/// Per-session cache of a whole network, one slot per layer.
#[derive(Debug, Clone)]
pub struct StackCache {
    owner: u64,
    slots: Vec<ConvCache>,
}

impl StackCache {
    pub fn new(owner: u64, layers: usize) -> Self {
        Self {
            owner,
            slots: vec![ConvCache::new(); layers],
        }
    }

    pub fn owner(&self) -> u64 {
        self.owner
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Fails unless this cache was created by `owner` for `layers` layers.
    pub fn check(&self, owner: u64, layers: usize) -> Result<(), GridError> {
        if self.owner != owner {
            return Err(GridError::cache(format!(
                "cache belongs to network {} but was passed to network {owner}",
                self.owner
            )));
        }
        if self.slots.len() != layers {
            return Err(GridError::cache(format!(
                "cache has {} slots, network has {layers} layers",
                self.slots.len()
            )));
        }
        Ok(())
    }

    pub fn slot_mut(&mut self, layer: usize) -> Result<&mut ConvCache, GridError> {
        let len = self.slots.len();
        self.slots
            .get_mut(layer)
            .ok_or_else(|| GridError::cache(format!("layer {layer} out of range for {len} slots")))
    }

    /// Steps taken by the first layer (all layers advance together).
    pub fn steps(&self) -> usize {
        self.slots.first().map(ConvCache::steps).unwrap_or(0)
    }

    pub fn reset(&mut self) {
        self.slots.iter_mut().for_each(ConvCache::reset);
    }
}
