// THEORY:
// The unified error types for the visualdb pipeline.
//
// `PipelineError` is the run-level error returned by every stage. The
// collaborator errors (`StoreError`, `CodecError`, `BackendError`,
// `SearchError`) are what the external adapters report; the orchestrator wraps
// them with the item key or batch they belong to.

use std::time::Duration;

use thiserror::Error;

use crate::core_modules::placement::TaskKind;
use crate::core_modules::region::{FrameShape, ItemState};

/// Result type alias using `PipelineError`.
pub type Result<T> = std::result::Result<T, PipelineError>;

#[derive(Debug, Error)]
pub enum PipelineError {
    // =========================================================================
    // === Startup / configuration
    // =========================================================================
    #[error("Path longer than maximum path size ({limit}): {entry}")]
    PathTooLong { limit: usize, entry: String },

    #[error("Failed to read manifest {path}: {source}")]
    ManifestIo {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Failed to parse configuration: {0}")]
    ConfigParse(#[from] toml::de::Error),

    #[error("Invalid partition request: {0}")]
    Partition(String),

    // =========================================================================
    // === Per-item stages
    // =========================================================================
    #[error("Load failed for '{key}': {source}")]
    Store {
        key: String,
        #[source]
        source: StoreError,
    },

    #[error("Decode failed for '{key}': {source}")]
    Decode {
        key: String,
        #[source]
        source: CodecError,
    },

    #[error("Load of '{key}' did not complete within {timeout:?}")]
    LoadTimeout { key: String, timeout: Duration },

    #[error("Item {index} cannot move from {from:?} to {to:?}")]
    InvalidTransition {
        index: usize,
        from: ItemState,
        to: ItemState,
    },

    #[error("Item {index} has no decoded frame")]
    MissingFrame { index: usize },

    #[error("Frame for item {index} has shape {actual:?}, region expects {expected:?}")]
    ShapeMismatch {
        index: usize,
        expected: FrameShape,
        actual: FrameShape,
    },

    // =========================================================================
    // === Regions, batches and compaction
    // =========================================================================
    #[error("Slot {index} of field '{field}' was already written")]
    SlotRewritten { field: &'static str, index: usize },

    #[error("Index {index} is outside a region of {len} slots")]
    OutOfBounds { index: usize, len: usize },

    #[error("Filter has not run for item {index}; compaction needs every flag")]
    FilterIncomplete { index: usize },

    #[error("Item {index} passed the filter but has no feature vector")]
    MissingVector { index: usize },

    #[error("Batch shape error: {0}")]
    BatchShape(String),

    #[error("Batch of {size} items is a third size variant (already dispatched {seen:?})")]
    UnsupportedBatchVariant { size: usize, seen: Vec<usize> },

    #[error("Feature backend failed on batch starting at item {first_index}: {source}")]
    Backend {
        first_index: usize,
        #[source]
        source: BackendError,
    },

    #[error("Feature backend circuit is open after {failures} consecutive failures")]
    BackendUnavailable { failures: usize },

    #[error("Downstream search failed: {0}")]
    Search(#[from] SearchError),

    // =========================================================================
    // === Scheduling
    // =========================================================================
    #[error("{kind:?} task was dropped before it produced a result")]
    TaskLost { kind: TaskKind },

    #[error("Worker pool is shut down")]
    PoolClosed,

    #[error("Color {color} task failed: {reason}")]
    ColorPanicked { color: usize, reason: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl PipelineError {
    /// Errors that only concern one item and may be isolated under
    /// `FailurePolicy::Isolate`.
    pub fn is_item_local(&self) -> bool {
        matches!(
            self,
            PipelineError::Store { .. }
                | PipelineError::Decode { .. }
                | PipelineError::LoadTimeout { .. }
        )
    }
}

/// Errors reported by an `ObjectStore`.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("object not found: {0}")]
    NotFound(String),

    /// A failure that may succeed on retry (network hiccup, throttling).
    #[error("transient store failure: {0}")]
    Transient(#[source] std::io::Error),

    #[error("store I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl StoreError {
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Transient(_))
    }
}

/// Errors reported by a `Codec`.
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("image decoding failed: {0}")]
    Image(#[from] image::ImageError),

    #[error("decoded {actual} bytes, expected {expected}")]
    SizeMismatch { expected: usize, actual: usize },

    #[error("unsupported channel count {0}")]
    UnsupportedChannels(u32),
}

/// Errors reported by a `FeatureBackend`.
#[derive(Debug, Error)]
pub enum BackendError {
    #[error("backend returned {actual} values, expected {expected}")]
    OutputSize { expected: usize, actual: usize },

    #[error("backend rejected input: {0}")]
    Rejected(String),

    #[error("backend failure: {0}")]
    Failed(String),
}

/// Errors reported by a `NeighborSearch` consumer.
#[derive(Debug, Error)]
pub enum SearchError {
    #[error("result region holds {actual} rows, expected {expected}")]
    RegionSize { expected: usize, actual: usize },

    #[error("search failed: {0}")]
    Failed(String),
}
