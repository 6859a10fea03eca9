//! Memory-bounded processing coordinator.
//!
//! The coordinator decides per image whether to run the pipeline on the whole
//! buffer or tile by tile, caches results, and keeps memory in check through
//! a background maintenance thread.
//!
//! # Routing
//!
//! The footprint of an image is its packed size plus an equally sized output.
//! In [`ProcessingMode::Auto`] the image is tiled when the footprint exceeds
//! half the memory threshold, or while the monitor reports memory pressure.
//! Tiles are processed with a halo of the pipeline's spatial reach and
//! cropped back before merging.
//!
//! # Maintenance
//!
//! Every `monitor_interval_ms` the monitor compares cache plus pool usage
//! against the threshold. Above 80% it flags pressure; above the threshold it
//! runs [`optimize_memory_usage`](TiledProcessingCoordinator::optimize_memory_usage).
//! Every `housekeeping_interval_ms` expired cache entries are purged and the
//! pool is compacted. Maintenance never runs while a `process` call is in
//! flight: a busy cycle is skipped.

use crate::core::buffer::PixelBuffer;
use crate::core::config::{ProcessingConfig, ProcessingMode};
use crate::core::context::NodeContext;
use crate::core::error::{ConfigError, ProcessingError, ProcessingResult, ScanResult};
use crate::core::pool::{MemoryPool, PoolStatistics};
use crate::core::tile::TileEngine;
use crate::execution::cache::{CacheKey, ResultCache};
use crate::execution::future::{BatchFuture, ProcessingFuture, TaskFuture};
use crate::execution::monitor::{MaintenanceOutcome, MaintenanceScheduler, MaintenanceTarget};
use crate::execution::pipeline::{PerformanceStats, Pipeline};
use crate::execution::progress::{ProgressCallback, ProgressTracker, SkipReason};
use parking_lot::RwLock;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

/// Fraction of the threshold above which the monitor flags pressure.
const PRESSURE_RATIO: f64 = 0.8;

/// Memory telemetry of a coordinator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryStats {
    pub pool: PoolStatistics,
    /// Bytes held by cached results.
    pub cache_bytes: usize,
    pub cache_entries: usize,
    /// Active cache budget (shrinks under pressure).
    pub cache_budget: usize,
    /// Tiles produced by the most recent tiled run.
    pub cached_tiles: usize,
    /// Tiles being processed right now.
    pub active_tiles: usize,
    pub peak_active_tiles: usize,
    pub tiled_runs: u64,
    pub direct_runs: u64,
    pub cache_hits: u64,
    /// Optimization passes run, automatic or explicit.
    pub optimizations: u64,
    pub high_memory_pressure: bool,
    pub memory_threshold: usize,
}

impl MemoryStats {
    /// Cache plus pool-resident bytes.
    pub fn total_usage(&self) -> usize {
        self.cache_bytes + self.pool.resident_bytes()
    }
}

/// What an optimization pass released.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OptimizationReport {
    pub cache_bytes_released: usize,
    pub pool_bytes_compacted: usize,
    pub pool_bytes_purged: usize,
}

impl OptimizationReport {
    pub fn total_released(&self) -> usize {
        self.cache_bytes_released + self.pool_bytes_compacted + self.pool_bytes_purged
    }
}

/// What a housekeeping pass did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HousekeepingReport {
    pub expired_entries: usize,
    pub pool_bytes_released: usize,
    /// Whether the cache budget went back to its configured maximum.
    pub budget_restored: bool,
}

struct CoordinatorShared {
    /// Held shared by `process`, exclusively by maintenance and reconfiguration.
    gate: RwLock<()>,
    config: RwLock<ProcessingConfig>,
    pipeline: Pipeline,
    pool: Arc<MemoryPool>,
    cache: ResultCache,
    tiles: RwLock<TileEngine>,
    workers: RwLock<Arc<rayon::ThreadPool>>,
    progress: RwLock<Option<ProgressCallback>>,
    high_pressure: AtomicBool,
    cached_tiles: AtomicUsize,
    active_tiles: AtomicUsize,
    peak_active_tiles: AtomicUsize,
    tiled_runs: AtomicU64,
    direct_runs: AtomicU64,
    cache_hits: AtomicU64,
    optimizations: AtomicU64,
}

fn build_workers(threads: usize) -> ProcessingResult<Arc<rayon::ThreadPool>> {
    rayon::ThreadPoolBuilder::new()
        .num_threads(threads)
        .thread_name(|i| format!("scanpipe-tile-{}", i))
        .build()
        .map(Arc::new)
        .map_err(|e| ProcessingError::Worker(e.to_string()))
}

impl CoordinatorShared {
    fn context(&self) -> NodeContext {
        NodeContext::with_pool(Arc::clone(&self.pool)).with_kernels(self.pipeline.kernels())
    }

    fn current_usage(&self) -> usize {
        self.cache.memory_usage() + self.pool.statistics().resident_bytes()
    }

    fn should_tile_with(&self, input: &PixelBuffer, config: &ProcessingConfig) -> bool {
        match config.mode {
            ProcessingMode::ForceTiled => true,
            ProcessingMode::ForceDirect => false,
            ProcessingMode::Auto => {
                let footprint = input.row_bytes() * input.height() as usize * 2;
                footprint > config.tiling_threshold() || self.high_pressure.load(Ordering::Relaxed)
            }
        }
    }

    fn process(&self, input: &PixelBuffer) -> ProcessingResult<PixelBuffer> {
        let _gate = self.gate.read();
        let config = self.config.read().clone();
        let progress = self.progress.read().clone();

        let key = CacheKey::new(self.pipeline.fingerprint(), input);
        if let Some(hit) = self.cache.get(&key) {
            self.cache_hits.fetch_add(1, Ordering::Relaxed);
            log::debug!("cache hit for {}x{} {}", input.width(), input.height(), input.format());
            if progress.is_some() {
                let tracker = ProgressTracker::new(self.pipeline.len()).with_callback(progress);
                tracker.start();
                for stage in self.pipeline.stages() {
                    tracker.stage_skipped(stage.id, SkipReason::Cached);
                }
                tracker.complete();
            }
            return Ok(hit);
        }

        let started = Instant::now();
        let output = if self.should_tile_with(input, &config) {
            self.process_tiled(input, progress)?
        } else {
            self.process_direct(input, progress)?
        };
        let elapsed = started.elapsed();

        if output.byte_size() <= self.cache.budget() {
            self.cache.put(key, output.to_standalone()?, elapsed);
        } else {
            log::debug!("result of {} bytes exceeds the cache budget", output.byte_size());
        }
        Ok(output)
    }

    fn process_direct(&self, input: &PixelBuffer, progress: Option<ProgressCallback>) -> ProcessingResult<PixelBuffer> {
        self.direct_runs.fetch_add(1, Ordering::Relaxed);
        log::debug!("processing {}x{} {} directly", input.width(), input.height(), input.format());
        let pipeline = match progress {
            Some(callback) => self.pipeline.clone().with_progress(callback),
            None => self.pipeline.clone(),
        };
        pipeline.process_in(input, &self.context())
    }

    fn process_tiled(&self, input: &PixelBuffer, progress: Option<ProgressCallback>) -> ProcessingResult<PixelBuffer> {
        self.tiled_runs.fetch_add(1, Ordering::Relaxed);
        let engine = *self.tiles.read();
        let workers = self.workers.read().clone();
        let tiles = engine.calculate_tiles_for(input.width(), input.height(), input.format());
        let halo = if tiles.len() > 1 { self.pipeline.spatial_reach() } else { 0 };
        log::debug!(
            "processing {}x{} {} as {} tiles of {:?} (overlap {}, halo {})",
            input.width(),
            input.height(),
            input.format(),
            tiles.len(),
            engine.tile_size(),
            engine.overlap(),
            halo
        );

        let tracker = ProgressTracker::new(tiles.len()).with_callback(progress);
        tracker.start();
        tracker.tiles_planned(tiles.len());
        self.cached_tiles.store(tiles.len(), Ordering::Relaxed);
        self.pipeline.begin_run();

        let ctx = self.context();
        let started = Instant::now();
        let processed: ProcessingResult<Vec<PixelBuffer>> = workers.install(|| {
            tiles
                .par_iter()
                .map(|tile| {
                    let active = self.active_tiles.fetch_add(1, Ordering::Relaxed) + 1;
                    self.peak_active_tiles.fetch_max(active, Ordering::Relaxed);
                    let tile_start = Instant::now();
                    let context = tile.context_region(halo);
                    let result = engine
                        .extract_context_in(input, tile, halo, &ctx)
                        .and_then(|buffer| self.pipeline.process_tile(&buffer, &ctx))
                        .and_then(|processed| engine.crop_to_tile(processed, context, tile, &ctx));
                    self.active_tiles.fetch_sub(1, Ordering::Relaxed);
                    if result.is_ok() {
                        tracker.tile_completed(tile.index, tile_start.elapsed().as_millis() as u64);
                    }
                    result
                })
                .collect()
        });

        let result =
            processed.and_then(|buffers| engine.merge_tiles(&buffers, &tiles, input.dimensions()));
        self.pipeline
            .finish_run(input.pixel_count(), started.elapsed(), result.as_ref().err());
        if let Err(err) = &result {
            tracker.report_error(err.node_id(), err.to_string());
        }
        tracker.complete();
        result
    }

    fn optimize(&self, config: &ProcessingConfig) -> OptimizationReport {
        let report = OptimizationReport {
            cache_bytes_released: self.cache.shrink_budget(config.cache_shrink_factor),
            pool_bytes_compacted: self.pool.compact(),
            pool_bytes_purged: self.pool.purge_free_above(config.large_block_bytes),
        };
        self.optimizations.fetch_add(1, Ordering::Relaxed);
        log::debug!("memory optimization released {} bytes", report.total_released());
        report
    }

    fn housekeep(&self) -> HousekeepingReport {
        let expired_entries = self.cache.purge_expired();
        let pool_bytes_released = self.pool.compact();
        let budget_restored = !self.high_pressure.load(Ordering::Relaxed)
            && self.cache.budget() < self.cache.max_bytes();
        if budget_restored {
            self.cache.restore_budget();
        }
        log::trace!(
            "housekeeping: {} expired entries, {} pool bytes released",
            expired_entries,
            pool_bytes_released
        );
        HousekeepingReport {
            expired_entries,
            pool_bytes_released,
            budget_restored,
        }
    }

    fn memory_stats(&self) -> MemoryStats {
        MemoryStats {
            pool: self.pool.statistics(),
            cache_bytes: self.cache.memory_usage(),
            cache_entries: self.cache.len(),
            cache_budget: self.cache.budget(),
            cached_tiles: self.cached_tiles.load(Ordering::Relaxed),
            active_tiles: self.active_tiles.load(Ordering::Relaxed),
            peak_active_tiles: self.peak_active_tiles.load(Ordering::Relaxed),
            tiled_runs: self.tiled_runs.load(Ordering::Relaxed),
            direct_runs: self.direct_runs.load(Ordering::Relaxed),
            cache_hits: self.cache_hits.load(Ordering::Relaxed),
            optimizations: self.optimizations.load(Ordering::Relaxed),
            high_memory_pressure: self.high_pressure.load(Ordering::Relaxed),
            memory_threshold: self.config.read().memory_threshold_bytes,
        }
    }
}

impl MaintenanceTarget for CoordinatorShared {
    fn check_memory(&self) -> MaintenanceOutcome {
        let Some(_gate) = self.gate.try_write() else {
            return MaintenanceOutcome::Skipped;
        };
        let config = self.config.read().clone();
        let threshold = config.memory_threshold_bytes;
        let usage = self.current_usage();

        let pressure = usage as f64 > threshold as f64 * PRESSURE_RATIO;
        if self.high_pressure.swap(pressure, Ordering::Relaxed) != pressure {
            log::debug!(
                "memory pressure {} ({} of {} bytes)",
                if pressure { "raised" } else { "cleared" },
                usage,
                threshold
            );
        }
        if usage > threshold {
            log::warn!(
                "memory usage {} bytes exceeds threshold {} bytes, optimizing",
                usage,
                threshold
            );
            self.optimize(&config);
        }
        MaintenanceOutcome::Completed
    }

    fn routine_housekeeping(&self) -> MaintenanceOutcome {
        match self.gate.try_write() {
            Some(_gate) => {
                self.housekeep();
                MaintenanceOutcome::Completed
            }
            None => MaintenanceOutcome::Skipped,
        }
    }
}

/// Runs a [`Pipeline`] over images of any size within a memory budget.
///
/// ```no_run
/// use scanpipe::prelude::*;
///
/// let mut pipeline = Pipeline::new();
/// pipeline.add_node(Box::new(ColorCorrectionNode::new().with_gamma(1.8)))?;
///
/// let coordinator = TiledProcessingCoordinator::new(pipeline, ProcessingConfig::default())?;
/// let scan = PixelBuffer::new(2550, 3300, PixelFormat::Rgb24)?;
/// let corrected = coordinator.process(&scan)?;
/// # Ok::<(), scanpipe::core::ScanError>(())
/// ```
pub struct TiledProcessingCoordinator {
    shared: Arc<CoordinatorShared>,
    scheduler: Option<MaintenanceScheduler>,
}

impl TiledProcessingCoordinator {
    /// Build the pool, cache, tile engine and worker pool, and start the
    /// maintenance thread when enabled.
    pub fn new(pipeline: Pipeline, config: ProcessingConfig) -> ScanResult<Self> {
        config.validate()?;
        let tiles = TileEngine::from_config(&config)?;
        let workers = build_workers(config.worker_threads)?;
        let cache = ResultCache::new(config.max_cache_bytes)
            .with_ttl(Duration::from_secs(config.cache_ttl_secs));

        let shared = Arc::new(CoordinatorShared {
            gate: RwLock::new(()),
            pool: Arc::new(MemoryPool::new(config.pool_initial_bytes)),
            cache,
            tiles: RwLock::new(tiles),
            workers: RwLock::new(workers),
            progress: RwLock::new(None),
            pipeline,
            config: RwLock::new(config),
            high_pressure: AtomicBool::new(false),
            cached_tiles: AtomicUsize::new(0),
            active_tiles: AtomicUsize::new(0),
            peak_active_tiles: AtomicUsize::new(0),
            tiled_runs: AtomicU64::new(0),
            direct_runs: AtomicU64::new(0),
            cache_hits: AtomicU64::new(0),
            optimizations: AtomicU64::new(0),
        });

        let mut coordinator = Self {
            shared,
            scheduler: None,
        };
        coordinator.restart_scheduler()?;
        Ok(coordinator)
    }

    /// Report progress of every run through `callback`.
    pub fn with_progress(self, callback: ProgressCallback) -> Self {
        *self.shared.progress.write() = Some(callback);
        self
    }

    fn restart_scheduler(&mut self) -> std::io::Result<()> {
        if let Some(mut scheduler) = self.scheduler.take() {
            scheduler.stop();
        }
        let config = self.shared.config.read().clone();
        if config.monitor_enabled {
            let target: Weak<dyn MaintenanceTarget> =
                Arc::downgrade(&self.shared) as Weak<dyn MaintenanceTarget>;
            self.scheduler = Some(MaintenanceScheduler::start(
                target,
                Duration::from_millis(config.monitor_interval_ms),
                Duration::from_millis(config.housekeeping_interval_ms),
            )?);
        }
        Ok(())
    }

    // ========================================================================
    // Processing
    // ========================================================================

    /// Process one image, tiling it when it does not fit the memory budget.
    pub fn process(&self, input: &PixelBuffer) -> ProcessingResult<PixelBuffer> {
        self.shared.process(input)
    }

    /// Process one image on a worker thread.
    pub fn process_async(&self, input: PixelBuffer) -> ProcessingFuture {
        let shared = Arc::clone(&self.shared);
        TaskFuture::spawn(move || shared.process(&input))
    }

    /// Process every image on worker threads; items complete independently.
    pub fn process_batch(&self, inputs: Vec<PixelBuffer>) -> BatchFuture {
        BatchFuture::new(
            inputs
                .into_iter()
                .map(|input| self.process_async(input))
                .collect(),
        )
    }

    /// Whether `input` would be processed tile by tile right now.
    pub fn should_tile(&self, input: &PixelBuffer) -> bool {
        let config = self.shared.config.read().clone();
        self.shared.should_tile_with(input, &config)
    }

    // ========================================================================
    // Maintenance
    // ========================================================================

    /// Replace the configuration. Waits for in-flight processing.
    ///
    /// The pool keeps its arena; `pool_initial_bytes` only applies at
    /// construction.
    pub fn reconfigure(&mut self, config: ProcessingConfig) -> Result<(), ConfigError> {
        config.validate()?;
        let tiles =
            TileEngine::from_config(&config).map_err(|e| ConfigError::Invalid(e.to_string()))?;
        let shared = Arc::clone(&self.shared);
        let old = shared.config.read().clone();

        let workers = if config.worker_threads != old.worker_threads {
            Some(build_workers(config.worker_threads).map_err(|e| ConfigError::Invalid(e.to_string()))?)
        } else {
            None
        };

        {
            let _gate = shared.gate.write();
            *shared.tiles.write() = tiles;
            if let Some(workers) = workers {
                *shared.workers.write() = workers;
            }
            shared.cache.set_max_bytes(config.max_cache_bytes);
            shared.cache.set_ttl(Duration::from_secs(config.cache_ttl_secs));
            if config.mode != old.mode
                || config.max_tile_size != old.max_tile_size
                || config.tile_overlap != old.tile_overlap
            {
                shared.cache.clear();
            }
            *shared.config.write() = config.clone();
        }
        log::debug!("coordinator reconfigured: {:?}", config);

        if config.monitor_enabled != old.monitor_enabled
            || config.monitor_interval_ms != old.monitor_interval_ms
            || config.housekeeping_interval_ms != old.housekeeping_interval_ms
        {
            self.restart_scheduler()?;
        }
        Ok(())
    }

    /// Shrink the cache budget, compact the pool and purge large free blocks.
    /// Waits for in-flight processing.
    pub fn optimize_memory_usage(&self) -> OptimizationReport {
        let _gate = self.shared.gate.write();
        let config = self.shared.config.read().clone();
        self.shared.optimize(&config)
    }

    /// Purge expired cache entries, compact the pool, and restore the cache
    /// budget when there is no memory pressure. Waits for in-flight processing.
    pub fn housekeeping(&self) -> HousekeepingReport {
        let _gate = self.shared.gate.write();
        self.shared.housekeep()
    }

    /// Run one memory-monitor cycle now.
    pub fn check_memory(&self) -> MaintenanceOutcome {
        self.shared.check_memory()
    }

    pub fn clear_cache(&self) {
        self.shared.cache.clear();
    }

    // ========================================================================
    // Inspection
    // ========================================================================

    pub fn memory_stats(&self) -> MemoryStats {
        self.shared.memory_stats()
    }

    pub fn performance_stats(&self) -> PerformanceStats {
        self.shared.pipeline.statistics()
    }

    pub fn config(&self) -> ProcessingConfig {
        self.shared.config.read().clone()
    }

    pub fn pipeline(&self) -> &Pipeline {
        &self.shared.pipeline
    }

    pub fn pool(&self) -> &Arc<MemoryPool> {
        &self.shared.pool
    }

    /// The maintenance thread, when running.
    pub fn scheduler(&self) -> Option<&MaintenanceScheduler> {
        self.scheduler.as_ref()
    }
}

impl Drop for TiledProcessingCoordinator {
    fn drop(&mut self) {
        if let Some(mut scheduler) = self.scheduler.take() {
            scheduler.stop();
        }
    }
}

impl std::fmt::Debug for TiledProcessingCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TiledProcessingCoordinator")
            .field("config", &self.config())
            .field("pipeline", &self.shared.pipeline)
            .field("scheduler", &self.scheduler)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::format::PixelFormat;
    use crate::execution::progress::ProgressUpdate;
    use crate::core::node::ProcessingNode;
    use crate::nodes::{
        ColorCorrectionNode, FormatConvertNode, NoiseAlgorithm, NoiseReductionNode, PixelShiftNode,
        SinkNode,
    };
    use parking_lot::Mutex;
    use proptest::prelude::*;

    fn quiet_config() -> ProcessingConfig {
        ProcessingConfig::default()
            .with_monitor(false)
            .with_threads(2)
            .with_pool_bytes(1 << 20)
    }

    fn pointwise_pipeline() -> Pipeline {
        let mut pipeline = Pipeline::new();
        pipeline
            .add_node(Box::new(
                ColorCorrectionNode::new()
                    .with_brightness(1.2)
                    .with_contrast(0.9)
                    .with_gamma(1.4)
                    .with_saturation(1.3),
            ))
            .unwrap();
        pipeline
    }

    /// Stages that read neighbouring pixels.
    fn neighbourhood_stage(kind: usize) -> Box<dyn ProcessingNode> {
        match kind {
            0 => Box::new(PixelShiftNode::new(3.0, 2.0)),
            1 => Box::new(PixelShiftNode::new(-1.5, 2.5)),
            2 => Box::new(NoiseReductionNode::new(NoiseAlgorithm::MedianFilter, 0.8)),
            _ => Box::new(NoiseReductionNode::new(NoiseAlgorithm::Wavelet, 0.6)),
        }
    }

    fn pipeline_of(stages: Vec<Box<dyn ProcessingNode>>) -> Pipeline {
        let mut pipeline = Pipeline::new();
        for stage in stages {
            pipeline.add_node(stage).unwrap();
        }
        pipeline
    }

    fn direct_and_tiled(
        stages: impl Fn() -> Vec<Box<dyn ProcessingNode>>,
        input: &PixelBuffer,
        tile: u32,
        overlap: u32,
    ) -> (PixelBuffer, PixelBuffer) {
        let direct = TiledProcessingCoordinator::new(
            pipeline_of(stages()),
            quiet_config().with_mode(ProcessingMode::ForceDirect),
        )
        .unwrap();
        let tiled = TiledProcessingCoordinator::new(
            pipeline_of(stages()),
            quiet_config()
                .with_mode(ProcessingMode::ForceTiled)
                .with_tile_size(tile)
                .with_overlap(overlap),
        )
        .unwrap();
        (direct.process(input).unwrap(), tiled.process(input).unwrap())
    }

    fn noise(width: u32, height: u32, format: PixelFormat, seed: u32) -> PixelBuffer {
        let len = format.row_bytes(width) * height as usize;
        let mut state = seed.wrapping_mul(2_654_435_761).wrapping_add(1);
        let bytes: Vec<u8> = (0..len)
            .map(|_| {
                state ^= state << 13;
                state ^= state >> 17;
                state ^= state << 5;
                (state >> 24) as u8
            })
            .collect();
        PixelBuffer::from_bytes(width, height, format, &bytes).unwrap()
    }

    fn max_difference(a: &PixelBuffer, b: &PixelBuffer) -> u8 {
        a.rows()
            .zip(b.rows())
            .flat_map(|(ra, rb)| ra.iter().zip(rb.iter()).map(|(x, y)| x.abs_diff(*y)))
            .max()
            .unwrap_or(0)
    }

    #[test]
    fn test_identity_pipeline_returns_input() {
        let coordinator = TiledProcessingCoordinator::new(
            Pipeline::new(),
            quiet_config().with_mode(ProcessingMode::ForceTiled).with_tile_size(16).with_overlap(4),
        )
        .unwrap();
        let input = noise(50, 37, PixelFormat::Rgba32, 3);
        assert_eq!(coordinator.process(&input).unwrap(), input);
    }

    #[test]
    fn test_small_image_runs_directly() {
        let coordinator = TiledProcessingCoordinator::new(pointwise_pipeline(), quiet_config()).unwrap();
        let input = noise(64, 64, PixelFormat::Rgb24, 1);
        assert!(!coordinator.should_tile(&input));

        let expected = coordinator.pipeline().process_image(&input).unwrap();
        assert_eq!(coordinator.process(&input).unwrap(), expected);
        let stats = coordinator.memory_stats();
        assert_eq!(stats.direct_runs, 1);
        assert_eq!(stats.tiled_runs, 0);
    }

    #[test]
    fn test_large_image_routes_through_tiles() {
        let mut pipeline = Pipeline::new();
        pipeline
            .add_node(Box::new(ColorCorrectionNode::new().with_brightness(1.1)))
            .unwrap();
        let config = quiet_config()
            .with_memory_threshold_mb(16)
            .with_cache_bytes(1 << 20)
            .with_threads(4);
        let coordinator = TiledProcessingCoordinator::new(pipeline, config).unwrap();
        let input = PixelBuffer::new(4096, 4096, PixelFormat::Rgba32).unwrap();
        assert!(coordinator.should_tile(&input));

        let output = coordinator.process(&input).unwrap();
        assert_eq!(output.dimensions(), (4096, 4096));

        let stats = coordinator.memory_stats();
        assert_eq!(stats.tiled_runs, 1);
        assert_eq!(stats.cached_tiles, 64);
        assert!(stats.peak_active_tiles > 0);
        assert_eq!(stats.active_tiles, 0);
        // The result alone exceeds the cache budget.
        assert_eq!(stats.cache_entries, 0);
    }

    #[test]
    fn test_cache_hit_skips_processing() {
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&events);
        let coordinator = TiledProcessingCoordinator::new(pointwise_pipeline(), quiet_config())
            .unwrap()
            .with_progress(Arc::new(move |u: ProgressUpdate| sink.lock().push(u)));
        let input = noise(40, 30, PixelFormat::Rgba32, 9);

        let first = coordinator.process(&input).unwrap();
        events.lock().clear();
        let second = coordinator.process(&input).unwrap();

        assert_eq!(first, second);
        assert!(!second.is_pooled());
        let stats = coordinator.memory_stats();
        assert_eq!(stats.cache_hits, 1);
        assert_eq!(stats.direct_runs, 1);
        assert_eq!(stats.cache_entries, 1);
        assert!(events
            .lock()
            .iter()
            .any(|e| matches!(e, ProgressUpdate::StageSkipped { reason: SkipReason::Cached, .. })));
        assert_eq!(coordinator.performance_stats().runs, 1);
    }

    #[test]
    fn test_failed_run_is_not_cached() {
        let mut pipeline = Pipeline::new();
        pipeline.add_node(Box::new(FormatConvertNode::new(PixelFormat::Lab))).unwrap();
        let coordinator = TiledProcessingCoordinator::new(pipeline, quiet_config()).unwrap();
        let input = noise(8, 8, PixelFormat::Mono8, 2);

        let err = coordinator.process(&input).unwrap_err();
        assert!(matches!(err.root_cause(), ProcessingError::UnsupportedConversion { .. }));
        assert_eq!(coordinator.memory_stats().cache_entries, 0);
        assert_eq!(coordinator.performance_stats().failed_runs, 1);
    }

    #[test]
    fn test_tiled_failure_surfaces() {
        let mut pipeline = Pipeline::new();
        pipeline.add_node(Box::new(FormatConvertNode::new(PixelFormat::Lab))).unwrap();
        let config = quiet_config().with_mode(ProcessingMode::ForceTiled).with_tile_size(8).with_overlap(2);
        let coordinator = TiledProcessingCoordinator::new(pipeline, config).unwrap();

        let err = coordinator.process(&noise(20, 20, PixelFormat::Mono8, 4)).unwrap_err();
        assert!(matches!(err, ProcessingError::NodeFailed { .. }));
        assert_eq!(coordinator.memory_stats().active_tiles, 0);
    }

    #[test]
    fn test_tiled_format_change() {
        let mut pipeline = Pipeline::new();
        pipeline.add_node(Box::new(FormatConvertNode::new(PixelFormat::Mono8))).unwrap();
        pipeline.add_node(Box::new(SinkNode::new())).unwrap();
        let direct = TiledProcessingCoordinator::new(pipeline.clone(), quiet_config().with_mode(ProcessingMode::ForceDirect)).unwrap();
        let tiled = TiledProcessingCoordinator::new(
            pipeline,
            quiet_config().with_mode(ProcessingMode::ForceTiled).with_tile_size(8).with_overlap(3),
        )
        .unwrap();

        let input = noise(30, 21, PixelFormat::Rgb24, 5);
        let a = direct.process(&input).unwrap();
        let b = tiled.process(&input).unwrap();
        assert_eq!(b.format(), PixelFormat::Mono8);
        assert!(max_difference(&a, &b) <= 1);
    }

    #[test]
    fn test_reconfigure_changes_routing() {
        let mut coordinator = TiledProcessingCoordinator::new(pointwise_pipeline(), quiet_config()).unwrap();
        let input = noise(32, 32, PixelFormat::Rgba32, 6);
        coordinator.process(&input).unwrap();
        assert_eq!(coordinator.memory_stats().cache_entries, 1);

        coordinator
            .reconfigure(quiet_config().with_mode(ProcessingMode::ForceTiled).with_tile_size(8).with_overlap(2))
            .unwrap();
        assert!(coordinator.should_tile(&input));
        // Tiling parameters changed, so earlier results are gone.
        assert_eq!(coordinator.memory_stats().cache_entries, 0);

        coordinator.process(&input).unwrap();
        let stats = coordinator.memory_stats();
        assert_eq!(stats.tiled_runs, 1);
        assert_eq!(stats.cached_tiles, 16);
    }

    #[test]
    fn test_reconfigure_rejects_invalid_config() {
        let mut coordinator = TiledProcessingCoordinator::new(Pipeline::new(), quiet_config()).unwrap();
        let bad = quiet_config().with_tile_size(4).with_overlap(4);
        assert!(matches!(coordinator.reconfigure(bad), Err(ConfigError::Invalid(_))));
        assert_eq!(coordinator.config().max_tile_size, quiet_config().max_tile_size);
    }

    #[test]
    fn test_new_rejects_invalid_config() {
        let result = TiledProcessingCoordinator::new(Pipeline::new(), quiet_config().with_tile_size(0));
        assert!(result.is_err());
    }

    #[test]
    fn test_monitor_flags_pressure_and_optimizes() {
        let config = quiet_config().with_memory_threshold(64 * 1024).with_cache_bytes(1 << 20);
        let coordinator = TiledProcessingCoordinator::new(pointwise_pipeline(), config).unwrap();
        let input = noise(100, 100, PixelFormat::Rgba32, 7);
        coordinator.process(&input).unwrap();

        assert_eq!(coordinator.check_memory(), MaintenanceOutcome::Completed);
        let stats = coordinator.memory_stats();
        assert!(stats.high_memory_pressure);
        assert_eq!(stats.optimizations, 1);
        assert!(stats.cache_budget < 1 << 20);

        // Pressure forces tiling even for small images.
        assert!(coordinator.should_tile(&noise(4, 4, PixelFormat::Rgba32, 1)));
    }

    #[test]
    fn test_explicit_optimize_and_housekeeping() {
        let coordinator = TiledProcessingCoordinator::new(
            pointwise_pipeline(),
            quiet_config().with_cache_bytes(1 << 20),
        )
        .unwrap();
        coordinator.process(&noise(64, 64, PixelFormat::Rgba32, 8)).unwrap();

        coordinator.optimize_memory_usage();
        assert_eq!(coordinator.memory_stats().cache_budget, (1 << 20) * 3 / 4);

        let report = coordinator.housekeeping();
        assert!(report.budget_restored);
        assert_eq!(coordinator.memory_stats().cache_budget, 1 << 20);

        coordinator.clear_cache();
        assert_eq!(coordinator.memory_stats().cache_bytes, 0);
    }

    #[test]
    fn test_background_monitor_runs() {
        let config = quiet_config().with_monitor(true).with_intervals(5, 10);
        let coordinator = TiledProcessingCoordinator::new(Pipeline::new(), config).unwrap();
        let deadline = Instant::now() + Duration::from_secs(5);
        while coordinator.scheduler().map_or(0, |s| s.runs()) < 2 && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
        assert!(coordinator.scheduler().unwrap().runs() >= 2);
        drop(coordinator);
    }

    #[test]
    fn test_async_and_batch() {
        let coordinator = TiledProcessingCoordinator::new(pointwise_pipeline(), quiet_config()).unwrap();
        let inputs: Vec<PixelBuffer> = (0..4).map(|i| noise(20, 20, PixelFormat::Rgb24, i)).collect();
        let expected: Vec<PixelBuffer> = inputs
            .iter()
            .map(|i| coordinator.pipeline().process_image(i).unwrap())
            .collect();

        let single = pollster::block_on(coordinator.process_async(inputs[0].clone())).unwrap();
        assert_eq!(single, expected[0]);

        let results = coordinator.process_batch(inputs).wait();
        for (result, expected) in results.into_iter().zip(expected.iter()) {
            assert_eq!(&result.unwrap(), expected);
        }
    }

    #[test]
    fn test_neighbourhood_stages_have_no_seams() {
        let input = noise(200, 150, PixelFormat::Rgb24, 17);
        let stages: [fn() -> Box<dyn ProcessingNode>; 4] = [
            || Box::new(NoiseReductionNode::new(NoiseAlgorithm::Gaussian, 0.5)),
            || Box::new(PixelShiftNode::new(3.0, 2.0)),
            || Box::new(NoiseReductionNode::new(NoiseAlgorithm::Wavelet, 0.6)),
            || Box::new(NoiseReductionNode::new(NoiseAlgorithm::MedianFilter, 0.8)),
        ];
        for stage in stages {
            let (direct, tiled) = direct_and_tiled(|| vec![stage()], &input, 64, 16);
            assert_eq!(direct.dimensions(), tiled.dimensions());
            assert!(max_difference(&direct, &tiled) <= 1, "{}", stage().name());
        }
    }

    #[test]
    fn test_chained_reach_wider_than_overlap() {
        // Shift, median and blur read 3 + 2 + 3 pixels away; the overlap is 2.
        let input = noise(90, 70, PixelFormat::Rgba32, 29);
        let stages = || {
            let mut stages: Vec<Box<dyn ProcessingNode>> = Vec::new();
            stages.push(Box::new(PixelShiftNode::new(3.0, 2.0)));
            stages.push(Box::new(NoiseReductionNode::new(NoiseAlgorithm::MedianFilter, 0.8)));
            stages.push(Box::new(NoiseReductionNode::new(NoiseAlgorithm::Gaussian, 0.5)));
            stages
        };
        assert_eq!(pipeline_of(stages()).spatial_reach(), 8);
        let (direct, tiled) = direct_and_tiled(stages, &input, 24, 2);
        assert!(max_difference(&direct, &tiled) <= 1);
    }

    #[test]
    fn test_memory_stats_serialize() {
        let coordinator = TiledProcessingCoordinator::new(Pipeline::new(), quiet_config()).unwrap();
        let json = serde_json::to_string(&coordinator.memory_stats()).unwrap();
        assert!(json.contains("high_memory_pressure"));
        assert!(json.contains("peak_active_tiles"));
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(24))]

        #[test]
        fn prop_tiling_is_transparent(
            width in 1u32..48,
            height in 1u32..48,
            tile in 4u32..20,
            overlap in 0u32..4,
            rgba in any::<bool>(),
            seed in any::<u32>(),
        ) {
            let format = if rgba { PixelFormat::Rgba32 } else { PixelFormat::Rgb24 };
            let input = noise(width, height, format, seed);
            let direct = TiledProcessingCoordinator::new(
                pointwise_pipeline(),
                quiet_config().with_mode(ProcessingMode::ForceDirect),
            ).unwrap();
            let tiled = TiledProcessingCoordinator::new(
                pointwise_pipeline(),
                quiet_config().with_mode(ProcessingMode::ForceTiled).with_tile_size(tile).with_overlap(overlap),
            ).unwrap();

            let a = direct.process(&input).unwrap();
            let b = tiled.process(&input).unwrap();
            prop_assert_eq!(a.dimensions(), b.dimensions());
            prop_assert!(max_difference(&a, &b) <= 1);
        }

        #[test]
        fn prop_tiling_is_transparent_for_neighbourhood_stages(
            width in 1u32..80,
            height in 1u32..64,
            tile in 8u32..32,
            overlap in 0u32..6,
            kinds in proptest::collection::vec(0usize..4, 0..3),
            blur in any::<bool>(),
            rgba in any::<bool>(),
            seed in any::<u32>(),
        ) {
            let format = if rgba { PixelFormat::Rgba32 } else { PixelFormat::Rgb24 };
            let input = noise(width, height, format, seed);
            let stages = || {
                let mut stages: Vec<Box<dyn ProcessingNode>> =
                    kinds.iter().map(|&kind| neighbourhood_stage(kind)).collect();
                if blur {
                    stages.push(Box::new(NoiseReductionNode::new(NoiseAlgorithm::Gaussian, 0.5)));
                }
                stages
            };

            let (a, b) = direct_and_tiled(stages, &input, tile, overlap);
            prop_assert_eq!(a.dimensions(), b.dimensions());
            prop_assert!(max_difference(&a, &b) <= 1);
        }
    }
}
