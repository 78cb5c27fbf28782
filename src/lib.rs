// THEORY:
// This file is the entry point for the `visualdb` library crate. It exposes
// the `Driver` and its configuration as the high-level interface: build a
// `PipelineConfig`, hand it a `Collaborators` bundle (object store, codec,
// feature backend, downstream search) and run a manifest to completion.
//
// The partitioning, scheduling, batching and compaction machinery lives in
// `core_modules` and is public so embedders can drive individual stages, but
// most callers only ever touch `Driver::run` and the `RunReport` it returns.

pub mod collaborators;
pub mod config;
pub mod core_modules;
pub mod driver;
pub mod error;
pub mod pipeline;

pub use collaborators::Collaborators;
pub use config::{FailurePolicy, PipelineConfig, RetryConfig, StoreConfig};
pub use driver::{Driver, RunReport};
pub use error::{PipelineError, Result};
