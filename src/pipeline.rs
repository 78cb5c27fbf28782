// THEORY:
// The `pipeline` module runs one even-partition color from its first Load to
// its last feature batch. Each color is an independent async task spawned by
// the driver; it owns a contiguous slice of the index domain and never touches
// a slot outside it.
//
// Per item the orchestrator builds a small dependency chain on the worker pool:
//
//     Load ──▶ Filter ──(flag == PASS)──▶ Preprocess ──▶ batch Feature
//
// The Preprocess task is submitted through `submit_when`, so an item that
// fails the filter is never queued for feature work at all. Preprocessed items
// are handed to the batch accumulator in index order; every full batch is
// submitted immediately and not awaited, so feature extraction for earlier
// windows overlaps with the loads of later ones.
//
// Items are admitted in windows of `batch_size`, taken from a batched
// partition of the color's range. At most one window of loads is in flight
// per color, which bounds how many decoded frames are resident at once.
//
// Failure handling: with `FailurePolicy::Abort` the first error stops the
// color from admitting further windows and, through the driver, fails the
// run. Batches already submitted are still awaited before the color returns. With `FailurePolicy::Isolate` a Load or Decode
// failure marks just that item FAIL and the color carries on. Filter and
// Feature failures are always run-level. A circuit breaker stops submitting
// feature batches after repeated backend failures.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use futures::future::join_all;
use tokio::sync::oneshot;
use tracing::{debug, error, info, warn};

use crate::collaborators::Collaborators;
use crate::collaborators::store::fetch_with_retry;
use crate::config::{FailurePolicy, PipelineConfig};
use crate::core_modules::batch_dispatcher::{
    BatchAccumulator, BatchDispatcher, PreparedItem, run_batch,
};
use crate::core_modules::filter::filter_item;
use crate::core_modules::manifest::Manifest;
use crate::core_modules::partition::{IndexRange, batched_partition};
use crate::core_modules::placement::{RegionRole, TaskKind};
use crate::core_modules::region::{FilterFlag, ItemRegion, ItemState, Residency, VectorRegion};
use crate::core_modules::worker_pool::{AccessSet, TaskHandle, TaskSpec, WorkerPool};
use crate::error::{PipelineError, Result};

/// Opens after `threshold` consecutive backend failures and stays open.
#[derive(Debug)]
pub struct CircuitBreaker {
    threshold: usize,
    consecutive: AtomicUsize,
    open: AtomicBool,
}

impl CircuitBreaker {
    /// A threshold of zero never opens.
    pub fn new(threshold: usize) -> Self {
        Self {
            threshold,
            consecutive: AtomicUsize::new(0),
            open: AtomicBool::new(false),
        }
    }

    pub fn check(&self) -> Result<()> {
        if self.open.load(Ordering::Acquire) {
            return Err(PipelineError::BackendUnavailable {
                failures: self.consecutive.load(Ordering::Acquire),
            });
        }
        Ok(())
    }

    pub fn record(&self, succeeded: bool) {
        if succeeded {
            self.consecutive.store(0, Ordering::Release);
            return;
        }
        let failures = self.consecutive.fetch_add(1, Ordering::AcqRel) + 1;
        if self.threshold > 0 && failures >= self.threshold && !self.open.swap(true, Ordering::AcqRel) {
            error!(failures, "feature backend circuit opened");
        }
    }

    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }
}

/// Everything a color needs, shared by all colors of a run.
#[derive(Debug)]
pub struct StageContext {
    pub config: Arc<PipelineConfig>,
    pub collaborators: Collaborators,
    pub manifest: Arc<Manifest>,
    pub items: Arc<ItemRegion>,
    pub vectors: Arc<VectorRegion>,
    pub pool: WorkerPool,
    pub breaker: Arc<CircuitBreaker>,
}

/// What one color did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ColorReport {
    pub color: usize,
    pub range: Option<IndexRange>,
    /// Admission window sizes, in order.
    pub windows: Vec<usize>,
    /// Row counts handed to the backend, in order.
    pub batches: Vec<usize>,
    pub passed: usize,
    /// Items isolated after a Load or Decode failure.
    pub failed: Vec<usize>,
}

enum ItemOutcome {
    Prepared(PreparedItem),
    Skipped,
    Failed(usize),
}

/// Item identifiers as the color sees them. A resident copy is only made when
/// the placement policy asks for one.
enum ColorPaths {
    Shared(Arc<Manifest>),
    Local { start: usize, keys: Vec<String> },
}

impl ColorPaths {
    fn new(manifest: &Arc<Manifest>, range: IndexRange, residency: Residency) -> Self {
        match residency {
            Residency::Virtual => ColorPaths::Shared(Arc::clone(manifest)),
            Residency::Resident => ColorPaths::Local {
                start: range.start,
                keys: range
                    .iter()
                    .filter_map(|index| manifest.get(index).map(str::to_string))
                    .collect(),
            },
        }
    }

    fn key(&self, index: usize) -> Result<String> {
        let key = match self {
            ColorPaths::Shared(manifest) => manifest.get(index).map(str::to_string),
            ColorPaths::Local { start, keys } => index
                .checked_sub(*start)
                .and_then(|offset| keys.get(offset))
                .cloned(),
        };
        key.ok_or(PipelineError::OutOfBounds {
            index,
            len: match self {
                ColorPaths::Shared(manifest) => manifest.len(),
                ColorPaths::Local { keys, .. } => keys.len(),
            },
        })
    }
}

pub struct Orchestrator {
    ctx: Arc<StageContext>,
    color: usize,
    paths: ColorPaths,
    late_loads: Mutex<Vec<TaskHandle<Result<()>>>>,
}

impl Orchestrator {
    /// Runs every item of `range` through the pipeline.
    pub async fn run_color(ctx: Arc<StageContext>, color: usize, range: IndexRange) -> Result<ColorReport> {
        let residency = ctx
            .collaborators
            .placement
            .residency(TaskKind::Orchestration, RegionRole::Paths);
        let paths = ColorPaths::new(&ctx.manifest, range, residency);
        let orchestrator = Orchestrator {
            ctx,
            color,
            paths,
            late_loads: Mutex::new(Vec::new()),
        };

        info!(color, start = range.start, end = range.end, "color started");
        let result = orchestrator.run(range).await;
        match &result {
            Ok(report) => info!(
                color,
                passed = report.passed,
                failed = report.failed.len(),
                batches = report.batches.len(),
                "color finished"
            ),
            Err(err) => error!(color, %err, "color aborted"),
        }
        result
    }

    async fn run(&self, range: IndexRange) -> Result<ColorReport> {
        let config = &self.ctx.config;
        let backend = &self.ctx.collaborators.backend;
        let item_len = self
            .ctx
            .collaborators
            .preprocessor
            .item_len(self.ctx.items.shape());
        let pad = config.pad_remainder || !backend.supports_variable_batch();

        let mut report = ColorReport {
            color: self.color,
            range: Some(range),
            ..ColorReport::default()
        };
        let mut accumulator = BatchAccumulator::new(config.batch_size);
        let mut dispatcher = BatchDispatcher::new(config.batch_size, item_len, pad);
        let mut in_flight: Vec<TaskHandle<Result<usize>>> = Vec::new();
        let mut first_error = None;

        let windows = batched_partition(range.len(), config.batch_size)?;
        for window in windows.colors() {
            if first_error.is_some() {
                break;
            }
            let window = IndexRange::new(range.start + window.start, range.start + window.end);
            debug!(color = self.color, start = window.start, end = window.end, "window admitted");
            report.windows.push(window.len());

            let outcomes = join_all(window.iter().map(|index| self.item_chain(index))).await;
            for outcome in outcomes {
                match outcome {
                    Ok(ItemOutcome::Prepared(item)) => {
                        report.passed += 1;
                        let Some(batch) = accumulator.push(item) else {
                            continue;
                        };
                        if first_error.is_some() {
                            continue;
                        }
                        match self.submit_batch(&mut dispatcher, batch, &mut report) {
                            Ok(handle) => in_flight.push(handle),
                            Err(err) => {
                                first_error.get_or_insert(err);
                            }
                        }
                    }
                    Ok(ItemOutcome::Skipped) => {}
                    Ok(ItemOutcome::Failed(index)) => report.failed.push(index),
                    Err(err) => {
                        first_error.get_or_insert(err);
                    }
                }
            }
        }
        if first_error.is_none() {
            if let Some(batch) = accumulator.flush() {
                match self.submit_batch(&mut dispatcher, batch, &mut report) {
                    Ok(handle) => in_flight.push(handle),
                    Err(err) => {
                        first_error.get_or_insert(err);
                    }
                }
            }
        } else if accumulator.pending() > 0 {
            debug!(
                color = self.color,
                dropped = accumulator.pending(),
                "prepared items dropped after failure"
            );
        }

        // Every submitted task is awaited, on success and failure alike, so
        // nothing still holds the regions once the color returns.
        for result in join_all(in_flight).await {
            if let Err(err) = result.and_then(|written| written) {
                first_error.get_or_insert(err);
            }
        }
        self.drain_late_loads().await;

        match first_error {
            Some(err) => Err(err),
            None => Ok(report),
        }
    }

    /// Waits for loads that outlived their timeout. Their results are
    /// discarded: the item was already failed or the color is aborting.
    async fn drain_late_loads(&self) {
        let late = std::mem::take(
            &mut *self
                .late_loads
                .lock()
                .unwrap_or_else(PoisonError::into_inner),
        );
        if late.is_empty() {
            return;
        }
        let count = late.len();
        join_all(late).await;
        debug!(color = self.color, count, "late loads drained");
    }

    async fn item_chain(&self, index: usize) -> Result<ItemOutcome> {
        let key = self.paths.key(index)?;
        match self.load(index, key.clone()).await {
            Ok(()) => {}
            Err(err) if err.is_item_local() && self.ctx.config.on_item_error == FailurePolicy::Isolate => {
                warn!(color = self.color, index, key = %key, %err, "item isolated");
                self.ctx.items.advance(index, ItemState::Failed)?;
                self.ctx.vectors.write_flag(index, FilterFlag::Fail)?;
                return Ok(ItemOutcome::Failed(index));
            }
            Err(err) => return Err(err),
        }

        let single = IndexRange::single(index);
        let filter = {
            let (items, vectors) = (Arc::clone(&self.ctx.items), Arc::clone(&self.ctx.vectors));
            let predicate = Arc::clone(&self.ctx.collaborators.predicate);
            self.ctx.pool.submit(
                TaskSpec::new(
                    TaskKind::Filter,
                    AccessSet::new()
                        .write(RegionRole::Items, single)
                        .write(RegionRole::VectorFlags, single),
                ),
                move || filter_item(predicate.as_ref(), &items, &vectors, index),
            )
        };

        let items = Arc::clone(&self.ctx.items);
        let preprocessor = Arc::clone(&self.ctx.collaborators.preprocessor);
        let prepared = self
            .ctx
            .pool
            .submit_when(
                async move { filter.await? },
                TaskSpec::new(
                    TaskKind::Feature,
                    AccessSet::new().write(RegionRole::Items, single),
                ),
                move || -> Result<PreparedItem> {
                    let frame = items.take_frame(index)?;
                    Ok(PreparedItem {
                        index,
                        input: preprocessor.preprocess(&frame),
                    })
                },
            )
            .await?;

        match prepared {
            Some(item) => Ok(ItemOutcome::Prepared(item?)),
            None => Ok(ItemOutcome::Skipped),
        }
    }

    async fn load(&self, index: usize, key: String) -> Result<()> {
        let config = &self.ctx.config;
        let store = Arc::clone(&self.ctx.collaborators.store);
        let codec = Arc::clone(&self.ctx.collaborators.codec);
        let items = Arc::clone(&self.ctx.items);
        let (retry, chunk, shape) = (config.retry, config.read_chunk_size, items.shape());
        let task_key = key.clone();
        let (started_sender, started) = oneshot::channel::<()>();

        let mut handle = self.ctx.pool.submit(
            TaskSpec::new(
                TaskKind::Load,
                AccessSet::new().write(RegionRole::Items, IndexRange::single(index)),
            ),
            move || -> Result<()> {
                let _ = started_sender.send(());
                let bytes = fetch_with_retry(store.as_ref(), &task_key, &retry, chunk).map_err(
                    |source| PipelineError::Store {
                        key: task_key.clone(),
                        source,
                    },
                )?;
                let frame = codec
                    .decode(&bytes, shape)
                    .map_err(|source| PipelineError::Decode {
                        key: task_key,
                        source,
                    })?;
                items.store_frame(index, frame)
            },
        );

        let Some(timeout) = config.load_timeout() else {
            return handle.await?;
        };
        // The clock starts when a worker picks the load up, not while it waits
        // in the queue behind higher-priority work.
        if started.await.is_err() {
            return handle.await?;
        }
        match tokio::time::timeout(timeout, &mut handle).await {
            Ok(loaded) => loaded?,
            Err(_) => {
                // A late load finds the slot already Failed and its write is
                // refused, or lands first and is released by the failure.
                self.late_loads
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .push(handle);
                Err(PipelineError::LoadTimeout { key, timeout })
            }
        }
    }

    fn submit_batch(
        &self,
        dispatcher: &mut BatchDispatcher,
        batch: Vec<PreparedItem>,
        report: &mut ColorReport,
    ) -> Result<TaskHandle<Result<usize>>> {
        self.ctx.breaker.check()?;
        let plan = dispatcher.plan(batch)?;
        report.batches.push(plan.shape.count);
        debug!(
            color = self.color,
            first_index = plan.first_index(),
            rows = plan.shape.count,
            padded = plan.is_padded(),
            "feature batch submitted"
        );

        let access = AccessSet::new()
            .write_indices(RegionRole::Items, &plan.indices)
            .write_indices(RegionRole::VectorData, &plan.indices);
        let backend = Arc::clone(&self.ctx.collaborators.backend);
        let items = Arc::clone(&self.ctx.items);
        let vectors = Arc::clone(&self.ctx.vectors);
        let breaker = Arc::clone(&self.ctx.breaker);

        Ok(self
            .ctx
            .pool
            .submit(TaskSpec::new(TaskKind::Feature, access), move || -> Result<usize> {
                breaker.check()?;
                let written = run_batch(backend.as_ref(), &plan, &vectors);
                breaker.record(written.is_ok());
                let written = written?;
                for &index in &plan.indices {
                    items.advance(index, ItemState::Featured)?;
                }
                Ok(written)
            }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn breaker_opens_after_consecutive_failures() {
        let breaker = CircuitBreaker::new(2);
        breaker.record(false);
        breaker.record(true);
        breaker.record(false);
        assert!(breaker.check().is_ok());
        breaker.record(false);
        assert!(breaker.is_open());
        assert!(matches!(
            breaker.check(),
            Err(PipelineError::BackendUnavailable { failures: 2 })
        ));
    }

    #[test]
    fn zero_threshold_never_opens() {
        let breaker = CircuitBreaker::new(0);
        for _ in 0..10 {
            breaker.record(false);
        }
        assert!(!breaker.is_open());
    }

    #[test]
    fn local_paths_are_offset_by_the_color_start() {
        let manifest = Arc::new(Manifest::from_entries(
            ["a", "b", "c", "d"].map(String::from).to_vec(),
        ));
        let range = IndexRange::new(2, 4);
        let local = ColorPaths::new(&manifest, range, Residency::Resident);
        assert_eq!(local.key(3).unwrap(), "d");
        assert!(local.key(1).is_err());

        let shared = ColorPaths::new(&manifest, range, Residency::Virtual);
        assert_eq!(shared.key(1).unwrap(), "b");
    }
}
