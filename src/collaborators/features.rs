// THEORY:
// Feature extraction contracts: per-item preprocessing and the batched
// backend call, plus the reference implementations the binary runs with.

use std::fmt::Debug;

use crate::core_modules::batch_dispatcher::BatchInput;
use crate::core_modules::region::{Frame, FrameShape};
use crate::error::BackendError;

/// Turns a decoded frame into the backend's per-item input row.
pub trait Preprocessor: Send + Sync + Debug {
    /// Length of the row produced for frames of `shape`.
    fn item_len(&self, shape: FrameShape) -> usize;

    fn preprocess(&self, frame: &Frame) -> Vec<f32>;
}

/// Maps every byte to `(byte / 255 - mean) / std`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct NormalizePreprocessor {
    pub mean: f32,
    pub std: f32,
}

impl Default for NormalizePreprocessor {
    fn default() -> Self {
        Self { mean: 0.5, std: 0.5 }
    }
}

impl Preprocessor for NormalizePreprocessor {
    fn item_len(&self, shape: FrameShape) -> usize {
        shape.len()
    }

    fn preprocess(&self, frame: &Frame) -> Vec<f32> {
        let scale = if self.std == 0.0 { 1.0 } else { self.std };
        frame
            .as_bytes()
            .iter()
            .map(|&byte| (f32::from(byte) / 255.0 - self.mean) / scale)
            .collect()
    }
}

pub trait FeatureBackend: Send + Sync + Debug {
    fn vector_dim(&self) -> usize;

    /// Whether the backend accepts any batch count, or only `batch_size`.
    fn supports_variable_batch(&self) -> bool {
        true
    }

    /// Returns `count * vector_dim` values, row `i` for input row `i`.
    fn forward(&self, input: &BatchInput<'_>) -> Result<Vec<f32>, BackendError>;
}

/// Mean-pools each channel over a `grid x grid` lattice of cells. Rows must
/// be frames of `shape` laid out row-major with interleaved channels.
#[derive(Debug, Clone, Copy)]
pub struct PooledStatsBackend {
    shape: FrameShape,
    grid: u32,
}

impl PooledStatsBackend {
    pub fn new(shape: FrameShape, grid: u32) -> Self {
        Self {
            shape,
            grid: grid.max(1),
        }
    }

    fn pool(&self, item: &[f32], out: &mut [f32]) {
        let FrameShape {
            width,
            height,
            channels,
        } = self.shape;
        let (grid, channels) = (self.grid as usize, channels as usize);
        let mut counts = vec![0u32; grid * grid];

        for y in 0..height as usize {
            let cell_y = y * grid / height as usize;
            for x in 0..width as usize {
                let cell = cell_y * grid + x * grid / width as usize;
                counts[cell] += 1;
                let pixel = (y * width as usize + x) * channels;
                for c in 0..channels {
                    out[cell * channels + c] += item[pixel + c];
                }
            }
        }

        for (cell, &count) in counts.iter().enumerate().filter(|(_, count)| **count > 0) {
            for value in &mut out[cell * channels..(cell + 1) * channels] {
                *value /= count as f32;
            }
        }
    }
}

impl FeatureBackend for PooledStatsBackend {
    fn vector_dim(&self) -> usize {
        (self.grid * self.grid * self.shape.channels) as usize
    }

    fn forward(&self, input: &BatchInput<'_>) -> Result<Vec<f32>, BackendError> {
        let shape = input.shape();
        if shape.item_len != self.shape.len() {
            return Err(BackendError::Rejected(format!(
                "row length {} does not match frame {}x{}x{}",
                shape.item_len, self.shape.width, self.shape.height, self.shape.channels
            )));
        }
        let dim = self.vector_dim();
        let mut output = vec![0.0f32; shape.count * dim];
        for (item, out) in input.items().zip(output.chunks_exact_mut(dim)) {
            self.pool(item, out);
        }
        Ok(output)
    }
}
