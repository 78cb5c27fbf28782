// THEORY:
// The driver sequences one whole run:
//
// manifest → regions → even partition → colors (concurrently) → barrier →
// compaction → downstream hand-off → release.
//
// Regions live in `RunRegions`, which is dropped on every exit path, so a
// failed run releases exactly what a successful one does. Each color awaits
// every task it submitted before returning, so once the barrier passes no
// pool task still holds a region.

use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::future::join_all;
use tracing::{debug, info, warn};

use crate::collaborators::Collaborators;
use crate::collaborators::search::KnnRegion;
use crate::config::PipelineConfig;
use crate::core_modules::compaction::{CompactedVectors, compact, gather};
use crate::core_modules::manifest::Manifest;
use crate::core_modules::partition::even_partition;
use crate::core_modules::placement::{RegionRole, TaskKind};
use crate::core_modules::region::{ItemRegion, VectorRegion};
use crate::core_modules::worker_pool::{PoolStats, WorkerPool};
use crate::error::{PipelineError, Result};
use crate::pipeline::{CircuitBreaker, ColorReport, Orchestrator, StageContext};

/// Summary of a finished run.
#[derive(Debug, Clone)]
pub struct RunReport {
    pub input_size: usize,
    pub filtered_size: usize,
    /// Indices that passed the filter, ascending.
    pub passed: Vec<usize>,
    pub failed: Vec<usize>,
    pub colors: Vec<ColorReport>,
    /// The dense vectors handed to the downstream consumer.
    pub vectors: CompactedVectors,
    pub neighbors: KnnRegion,
    pub pool: PoolStats,
    pub elapsed: Duration,
}

struct RunRegions {
    items: Arc<ItemRegion>,
    vectors: Arc<VectorRegion>,
}

impl Drop for RunRegions {
    fn drop(&mut self) {
        debug!(
            items = self.items.len(),
            resident_frames = self.items.resident_frames(),
            "regions released"
        );
    }
}

pub struct Driver {
    config: Arc<PipelineConfig>,
    collaborators: Collaborators,
}

impl Driver {
    pub fn new(config: PipelineConfig, collaborators: Collaborators) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config: Arc::new(config),
            collaborators,
        })
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Reads the configured manifest and runs it.
    pub async fn run(&self) -> Result<RunReport> {
        let manifest = Manifest::open(&self.config.manifest_path, self.config.path_size)?;
        self.run_manifest(manifest).await
    }

    pub async fn run_manifest(&self, manifest: Manifest) -> Result<RunReport> {
        let started = Instant::now();
        let config = &self.config;
        let input_size = manifest.len();
        info!(input_size, "input size");

        let dim = self.collaborators.backend.vector_dim();
        let residency = self
            .collaborators
            .placement
            .residency(TaskKind::Orchestration, RegionRole::VectorData);
        let regions = RunRegions {
            items: Arc::new(ItemRegion::new(input_size, config.frame_shape())),
            vectors: Arc::new(VectorRegion::new(input_size, dim, residency)),
        };

        let pool = WorkerPool::new(config.workers, Arc::clone(&self.collaborators.placement));
        if input_size == 0 {
            info!("empty manifest, nothing to process");
            return Ok(RunReport {
                input_size,
                filtered_size: 0,
                passed: Vec::new(),
                failed: Vec::new(),
                colors: Vec::new(),
                vectors: CompactedVectors::empty(dim),
                neighbors: KnnRegion::new(0, config.k_neighbors),
                pool: pool.stats(),
                elapsed: started.elapsed(),
            });
        }
        let colors = self.run_colors(manifest, &regions, pool.clone()).await?;

        let compaction = compact(&regions.vectors)?;
        let filtered_size = compaction.filtered_size();
        info!(filtered_size, "filtered size");

        let vectors = gather(&compaction, &regions.vectors)?;
        let mut neighbors = KnnRegion::new(filtered_size, config.k_neighbors);
        self.collaborators.search.search(&vectors, &mut neighbors)?;

        let failed: Vec<usize> = colors.iter().flat_map(|c| c.failed.iter().copied()).collect();
        if !failed.is_empty() {
            warn!(count = failed.len(), "items isolated after load failures");
        }

        Ok(RunReport {
            input_size,
            filtered_size,
            passed: compaction.passed().to_vec(),
            failed,
            colors,
            vectors,
            neighbors,
            pool: pool.stats(),
            elapsed: started.elapsed(),
        })
    }

    async fn run_colors(
        &self,
        manifest: Manifest,
        regions: &RunRegions,
        pool: WorkerPool,
    ) -> Result<Vec<ColorReport>> {
        let partition = even_partition(manifest.len(), self.config.num_colors)?;
        debug!(sizes = ?partition.sizes(), "even partition");

        let ctx = Arc::new(StageContext {
            config: Arc::clone(&self.config),
            collaborators: self.collaborators.clone(),
            manifest: Arc::new(manifest),
            items: Arc::clone(&regions.items),
            vectors: Arc::clone(&regions.vectors),
            pool,
            breaker: Arc::new(CircuitBreaker::new(self.config.breaker_threshold)),
        });

        let handles = partition
            .colors()
            .iter()
            .enumerate()
            .map(|(color, range)| tokio::spawn(Orchestrator::run_color(Arc::clone(&ctx), color, *range)));

        // Every color finishes before anything is reported.
        let mut reports = Vec::with_capacity(partition.num_colors());
        let mut first_error = None;
        for (color, joined) in join_all(handles).await.into_iter().enumerate() {
            let result = joined.map_err(|join| PipelineError::ColorPanicked {
                color,
                reason: join.to_string(),
            });
            match result.and_then(|report| report) {
                Ok(report) => reports.push(report),
                Err(err) => {
                    first_error.get_or_insert(err);
                }
            }
        }
        match first_error {
            Some(err) => Err(err),
            None => Ok(reports),
        }
    }
}
