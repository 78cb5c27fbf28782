// THEORY:
// The batch dispatcher turns a trickle of preprocessed PASS items into
// fixed-stride backend calls and scatters the results back to their slots.
//
// Key architectural principles:
// 1.  **Index order**: the accumulator receives PASS items in ascending index
//     order and cuts a batch every `batch_size` items. Output row `i` of a
//     backend call always belongs to input row `i`, and therefore to the
//     `i`-th index of the plan.
// 2.  **Two shape variants**: a color produces full batches plus at most one
//     remainder, so a dispatcher only ever sees two batch sizes. A third size
//     means the accumulator was misused and is reported instead of silently
//     handed to a backend that may have compiled for two shapes only.
// 3.  **Scoped buffers**: the contiguous input buffer is created for one call
//     and dropped when `run_batch` returns. Nothing is reused across batches.
// 4.  **Padding**: when configured, or when the backend cannot take a variable
//     batch dimension, remainders are zero-padded to `batch_size` and the
//     padded output rows are discarded.

use tracing::{debug, trace};

use crate::collaborators::features::FeatureBackend;
use crate::core_modules::region::VectorRegion;
use crate::error::{PipelineError, Result};

/// Row count and per-row stride of one backend call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BatchShape {
    pub count: usize,
    pub item_len: usize,
}

impl BatchShape {
    pub const fn len(&self) -> usize {
        self.count * self.item_len
    }
}

/// A packed, read-only batch handed to the backend.
#[derive(Debug, Clone, Copy)]
pub struct BatchInput<'a> {
    shape: BatchShape,
    data: &'a [f32],
}

impl<'a> BatchInput<'a> {
    pub fn new(shape: BatchShape, data: &'a [f32]) -> Result<Self> {
        if data.len() != shape.len() {
            return Err(PipelineError::BatchShape(format!(
                "buffer holds {} values, shape {:?} needs {}",
                data.len(),
                shape,
                shape.len()
            )));
        }
        Ok(Self { shape, data })
    }

    pub fn shape(&self) -> BatchShape {
        self.shape
    }

    pub fn data(&self) -> &'a [f32] {
        self.data
    }

    /// Row `i` of the batch.
    pub fn item(&self, i: usize) -> &'a [f32] {
        let stride = self.shape.item_len;
        &self.data[i * stride..(i + 1) * stride]
    }

    pub fn items(&self) -> impl Iterator<Item = &'a [f32]> + 'a {
        let data = self.data;
        data.chunks_exact(self.shape.item_len.max(1))
            .take(self.shape.count)
    }
}

/// A preprocessed item waiting for its batch.
#[derive(Debug, Clone, PartialEq)]
pub struct PreparedItem {
    pub index: usize,
    pub input: Vec<f32>,
}

/// Collects PASS items in index order and cuts them into batches.
#[derive(Debug)]
pub struct BatchAccumulator {
    batch_size: usize,
    pending: Vec<PreparedItem>,
}

impl BatchAccumulator {
    pub fn new(batch_size: usize) -> Self {
        Self {
            batch_size: batch_size.max(1),
            pending: Vec::with_capacity(batch_size),
        }
    }

    /// Adds an item, returning a full batch once `batch_size` are pending.
    pub fn push(&mut self, item: PreparedItem) -> Option<Vec<PreparedItem>> {
        debug_assert!(
            self.pending.last().is_none_or(|last| last.index < item.index),
            "items must arrive in index order"
        );
        self.pending.push(item);
        (self.pending.len() == self.batch_size)
            .then(|| std::mem::replace(&mut self.pending, Vec::with_capacity(self.batch_size)))
    }

    /// Hands back the remainder, if any.
    pub fn flush(&mut self) -> Option<Vec<PreparedItem>> {
        (!self.pending.is_empty()).then(|| std::mem::take(&mut self.pending))
    }

    /// Items waiting for a full batch.
    pub fn pending(&self) -> usize {
        self.pending.len()
    }
}

/// A batch ready for the backend: the dispatched shape plus the real items.
/// `shape.count` exceeds `indices.len()` only when the batch is padded.
#[derive(Debug, Clone, PartialEq)]
pub struct BatchPlan {
    pub shape: BatchShape,
    pub indices: Vec<usize>,
    inputs: Vec<Vec<f32>>,
}

impl BatchPlan {
    pub fn first_index(&self) -> usize {
        self.indices.first().copied().unwrap_or_default()
    }

    pub fn is_padded(&self) -> bool {
        self.shape.count > self.indices.len()
    }

    /// Copies every item into one fresh contiguous buffer, zero-filling padded
    /// rows.
    pub fn pack(&self) -> Vec<f32> {
        let mut buffer = vec![0.0f32; self.shape.len()];
        for (row, input) in buffer
            .chunks_exact_mut(self.shape.item_len.max(1))
            .zip(&self.inputs)
        {
            row.copy_from_slice(input);
        }
        buffer
    }
}

/// Per-color bookkeeping of batch shapes.
#[derive(Debug)]
pub struct BatchDispatcher {
    batch_size: usize,
    item_len: usize,
    pad_remainder: bool,
    current: Option<BatchShape>,
    variants: Vec<usize>,
}

impl BatchDispatcher {
    pub fn new(batch_size: usize, item_len: usize, pad_remainder: bool) -> Self {
        Self {
            batch_size,
            item_len,
            pad_remainder,
            current: None,
            variants: Vec::with_capacity(2),
        }
    }

    /// Batch sizes dispatched so far, in first-seen order.
    pub fn variants(&self) -> &[usize] {
        &self.variants
    }

    pub fn plan(&mut self, items: Vec<PreparedItem>) -> Result<BatchPlan> {
        let count = items.len();
        if count == 0 || count > self.batch_size {
            return Err(PipelineError::BatchShape(format!(
                "batch of {count} items, expected 1..={}",
                self.batch_size
            )));
        }
        if let Some(bad) = items.iter().find(|item| item.input.len() != self.item_len) {
            return Err(PipelineError::BatchShape(format!(
                "item {} has {} input values, stride is {}",
                bad.index,
                bad.input.len(),
                self.item_len
            )));
        }

        let dispatched = if self.pad_remainder { self.batch_size } else { count };
        if !self.variants.contains(&dispatched) {
            if self.variants.len() == 2 {
                return Err(PipelineError::UnsupportedBatchVariant {
                    size: dispatched,
                    seen: self.variants.clone(),
                });
            }
            self.variants.push(dispatched);
        }

        let shape = match self.current {
            Some(shape) if shape.count == dispatched => shape,
            previous => {
                let shape = BatchShape {
                    count: dispatched,
                    item_len: self.item_len,
                };
                debug!(from = ?previous.map(|s| s.count), to = dispatched, "batch shape derived");
                self.current = Some(shape);
                shape
            }
        };

        let (indices, inputs) = items.into_iter().map(|item| (item.index, item.input)).unzip();
        Ok(BatchPlan {
            shape,
            indices,
            inputs,
        })
    }
}

/// Packs `plan`, invokes the backend once and writes each real output row to
/// the vector slot of the matching input. Returns the number of vectors written.
pub fn run_batch(
    backend: &dyn FeatureBackend,
    plan: &BatchPlan,
    vectors: &VectorRegion,
) -> Result<usize> {
    let buffer = plan.pack();
    let input = BatchInput::new(plan.shape, &buffer)?;
    let first_index = plan.first_index();

    let output = backend
        .forward(&input)
        .map_err(|source| PipelineError::Backend {
            first_index,
            source,
        })?;

    let dim = backend.vector_dim();
    let expected = plan.shape.count * dim;
    if output.len() != expected {
        return Err(PipelineError::Backend {
            first_index,
            source: crate::error::BackendError::OutputSize {
                expected,
                actual: output.len(),
            },
        });
    }

    // Padded rows sit past the last real index and are never written.
    let rows = plan
        .indices
        .iter()
        .zip(output.chunks_exact(dim.max(1)))
        .map(|(index, row)| (*index, row));
    let written = vectors.write_vectors(rows)?;
    trace!(first_index, written, padded = plan.is_padded(), "batch written");
    Ok(written)
}
