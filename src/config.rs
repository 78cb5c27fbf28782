// THEORY:
// The `config` module is the single source of truth for every tunable of a run.
// A `PipelineConfig` is built once at the application boundary (defaults, or a
// TOML file) and then shared read-only behind an `Arc` by the driver, every
// color orchestrator and the collaborator adapters. Nothing in the pipeline
// reads global state: the object-store location and credentials arrive through
// `StoreConfig`, injected at construction.
//
// The defaults reproduce the constants of the reference deployment: 400x225
// RGB frames, 256-byte path slots, batches of 32, two colors, five neighbors.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::core_modules::region::FrameShape;
use crate::error::{PipelineError, Result};

/// What to do when a single item cannot be loaded or decoded.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, Default, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    /// Any Load/Decode failure aborts the whole run.
    #[default]
    Abort,
    /// The item is marked FAIL and excluded from Feature and compaction.
    Isolate,
}

/// Location and credentials of the object store. Handed to the store adapter
/// when it is constructed.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(default)]
pub struct StoreConfig {
    /// Root directory (filesystem store) or endpoint prefix.
    pub root: PathBuf,
    pub bucket: String,
    /// Path to a credentials file, if the store needs one.
    pub credentials: Option<PathBuf>,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("."),
            bucket: String::from("images"),
            credentials: None,
        }
    }
}

/// Retry behaviour for transient object-store failures.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(default)]
pub struct RetryConfig {
    /// Total attempts, including the first one.
    pub max_attempts: u32,
    pub backoff_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff_ms: 1000,
        }
    }
}

impl RetryConfig {
    pub fn backoff(&self) -> Duration {
        Duration::from_millis(self.backoff_ms)
    }
}

/// Configuration for a pipeline run.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct PipelineConfig {
    /// Newline separated list of object keys.
    pub manifest_path: PathBuf,
    /// Size of one manifest slot including the terminator; entries may hold
    /// at most `path_size - 1` bytes.
    pub path_size: usize,
    pub image_width: u32,
    pub image_height: u32,
    pub image_channels: u32,
    pub batch_size: usize,
    /// Number of even partition colors processed concurrently.
    pub num_colors: usize,
    /// Worker threads available to item and batch tasks.
    pub workers: usize,
    /// Neighbors per query reserved in the downstream result region.
    pub k_neighbors: usize,
    /// Cells per side of the pooling grid used by the reference backend.
    pub feature_grid: u32,
    /// Chunk size used when streaming objects out of the store.
    pub read_chunk_size: usize,
    /// Zero-pad remainder batches up to `batch_size`.
    pub pad_remainder: bool,
    pub load_timeout_ms: Option<u64>,
    /// Consecutive backend failures that open the circuit breaker.
    pub breaker_threshold: usize,
    pub on_item_error: FailurePolicy,
    pub retry: RetryConfig,
    pub store: StoreConfig,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            manifest_path: PathBuf::from("images.txt"),
            path_size: 256,
            image_width: 400,
            image_height: 225,
            image_channels: 3,
            batch_size: 32,
            num_colors: 2,
            workers: num_cpus::get(),
            k_neighbors: 5,
            feature_grid: 8,
            read_chunk_size: 1024,
            pad_remainder: false,
            load_timeout_ms: None,
            breaker_threshold: 3,
            on_item_error: FailurePolicy::default(),
            retry: RetryConfig::default(),
            store: StoreConfig::default(),
        }
    }
}

impl PipelineConfig {
    pub fn from_toml_str(source: &str) -> Result<Self> {
        let config: PipelineConfig = toml::from_str(source)?;
        config.validate()?;
        Ok(config)
    }

    /// Reads and validates a TOML configuration file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let source = std::fs::read_to_string(path.as_ref())?;
        Self::from_toml_str(&source)
    }

    pub fn frame_shape(&self) -> FrameShape {
        FrameShape::new(self.image_width, self.image_height, self.image_channels)
    }

    pub fn load_timeout(&self) -> Option<Duration> {
        self.load_timeout_ms.map(Duration::from_millis)
    }

    pub fn validate(&self) -> Result<()> {
        if self.batch_size == 0 {
            return Err(PipelineError::Config("batch_size must be at least 1".into()));
        }
        if self.num_colors == 0 {
            return Err(PipelineError::Config("num_colors must be at least 1".into()));
        }
        if self.workers == 0 {
            return Err(PipelineError::Config("workers must be at least 1".into()));
        }
        if self.path_size < 2 {
            return Err(PipelineError::Config("path_size must be at least 2".into()));
        }
        if self.read_chunk_size == 0 {
            return Err(PipelineError::Config("read_chunk_size must be at least 1".into()));
        }
        if self.retry.max_attempts == 0 {
            return Err(PipelineError::Config("retry.max_attempts must be at least 1".into()));
        }
        if self.feature_grid == 0 {
            return Err(PipelineError::Config("feature_grid must be at least 1".into()));
        }
        if self.frame_shape().len() == 0 {
            return Err(PipelineError::Config(format!(
                "frame shape {}x{}x{} is empty",
                self.image_width, self.image_height, self.image_channels
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_reference_constants() {
        let config = PipelineConfig::default();
        assert_eq!(config.path_size, 256);
        assert_eq!(config.frame_shape(), FrameShape::new(400, 225, 3));
        assert_eq!(config.batch_size, 32);
        assert_eq!(config.k_neighbors, 5);
        assert_eq!(config.retry.max_attempts, 3);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn partial_toml_keeps_defaults() {
        let config = PipelineConfig::from_toml_str(
            r#"
            batch_size = 2
            on_item_error = "isolate"

            [store]
            bucket = "vdb-imagenet"
            "#,
        )
        .expect("valid config");
        assert_eq!(config.batch_size, 2);
        assert_eq!(config.on_item_error, FailurePolicy::Isolate);
        assert_eq!(config.store.bucket, "vdb-imagenet");
        assert_eq!(config.num_colors, 2);
        assert_eq!(config.retry, RetryConfig::default());
    }

    #[test]
    fn zero_batch_size_is_rejected() {
        let err = PipelineConfig::from_toml_str("batch_size = 0").unwrap_err();
        assert!(matches!(err, PipelineError::Config(_)));
    }

    #[test]
    fn empty_frame_shape_is_rejected() {
        let config = PipelineConfig {
            image_channels: 0,
            ..PipelineConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn malformed_toml_is_a_parse_error() {
        let err = PipelineConfig::from_toml_str("batch_size = \"lots\"").unwrap_err();
        assert!(matches!(err, PipelineError::ConfigParse(_)));
    }
}
