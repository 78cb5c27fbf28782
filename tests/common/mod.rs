#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use visualdb::collaborators::Collaborators;
use visualdb::collaborators::codec::RawCodec;
use visualdb::collaborators::features::FeatureBackend;
use visualdb::collaborators::store::{MemoryObjectStore, ObjectStore};
use visualdb::core_modules::batch_dispatcher::BatchInput;
use visualdb::core_modules::manifest::Manifest;
use visualdb::error::{BackendError, StoreError};
use visualdb::{PipelineConfig, RetryConfig};

/// 2x1 single-channel frames: the first byte decides the filter outcome.
pub fn small_config() -> PipelineConfig {
    PipelineConfig {
        image_width: 2,
        image_height: 1,
        image_channels: 1,
        batch_size: 2,
        num_colors: 1,
        workers: 2,
        retry: RetryConfig {
            max_attempts: 3,
            backoff_ms: 0,
        },
        ..PipelineConfig::default()
    }
}

/// Stores `item-<i>` objects whose first byte is `first_bytes[i]`.
pub fn store_with(first_bytes: &[u8]) -> (Arc<MemoryObjectStore>, Manifest) {
    let store = Arc::new(MemoryObjectStore::new());
    let mut keys = Vec::new();
    for (i, byte) in first_bytes.iter().enumerate() {
        let key = format!("item-{i}");
        store.insert(key.clone(), vec![*byte, 100]);
        keys.push(key);
    }
    (store, Manifest::from_entries(keys))
}

/// Echoes each preprocessed row as its feature vector and records the row
/// count of every call.
#[derive(Debug, Default)]
pub struct RecordingBackend {
    pub calls: Mutex<Vec<usize>>,
    pub fail: bool,
    pub fixed_batch: bool,
    /// How long every call takes.
    pub delay: Duration,
    /// Calls currently inside `forward`.
    pub active: AtomicUsize,
    pub finished: AtomicUsize,
}

impl RecordingBackend {
    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::default()
        }
    }

    pub fn slow(delay: Duration) -> Self {
        Self {
            delay,
            ..Self::default()
        }
    }

    pub fn active(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    pub fn finished(&self) -> usize {
        self.finished.load(Ordering::SeqCst)
    }

    pub fn sorted_calls(&self) -> Vec<usize> {
        let mut calls = self.calls.lock().unwrap().clone();
        calls.sort_unstable_by(|a, b| b.cmp(a));
        calls
    }
}

impl FeatureBackend for RecordingBackend {
    fn vector_dim(&self) -> usize {
        2
    }

    fn supports_variable_batch(&self) -> bool {
        !self.fixed_batch
    }

    fn forward(&self, input: &BatchInput<'_>) -> Result<Vec<f32>, BackendError> {
        self.calls.lock().unwrap().push(input.shape().count);
        self.active.fetch_add(1, Ordering::SeqCst);
        std::thread::sleep(self.delay);
        let result = if self.fail {
            Err(BackendError::Failed("device lost".into()))
        } else {
            Ok(input.data().to_vec())
        };
        self.active.fetch_sub(1, Ordering::SeqCst);
        self.finished.fetch_add(1, Ordering::SeqCst);
        result
    }
}

pub fn collaborators(
    store: Arc<dyn ObjectStore>,
    backend: Arc<RecordingBackend>,
) -> Collaborators {
    Collaborators::new(store, backend).with_codec(Arc::new(RawCodec))
}

/// Sleeps before serving every object.
#[derive(Debug)]
pub struct SlowStore {
    pub inner: Arc<MemoryObjectStore>,
    pub delay: Duration,
}

impl ObjectStore for SlowStore {
    fn open(&self, key: &str) -> Result<Box<dyn std::io::Read + Send>, StoreError> {
        std::thread::sleep(self.delay);
        self.inner.open(key)
    }
}
