//! Linear processing pipeline.
//!
//! A pipeline runs its stages in list order, feeding each stage the previous
//! stage's output. Disabled stages pass their input through. A stage that
//! cannot handle its input fails the whole run.

use crate::core::buffer::PixelBuffer;
use crate::core::context::NodeContext;
use crate::core::error::{NodeId, ProcessingError, ProcessingResult};
use crate::core::format::PixelFormat;
use crate::core::node::ProcessingNode;
use crate::execution::future::{BatchFuture, ProcessingFuture, TaskFuture};
use crate::execution::progress::{ProgressCallback, ProgressTracker, SkipReason};
use crate::nodes::StageConfig;
use crate::simd::SimdKernels;
use indexmap::IndexMap;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// One node in the pipeline.
#[derive(Debug, Clone)]
pub struct PipelineStage {
    pub id: NodeId,
    pub node: Box<dyn ProcessingNode>,
    pub enabled: bool,
}

/// Run state of a pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum PipelineState {
    #[default]
    Idle,
    /// Executing the stage at `index`.
    Running { index: usize },
    Completed,
    Failed { node_id: Option<NodeId>, message: String },
}

/// Accumulated timing of one stage.
#[derive(Debug, Clone, Serialize)]
pub struct NodeTiming {
    pub name: &'static str,
    /// Number of invocations (one per tile in tiled runs).
    pub calls: u64,
    pub total_time: Duration,
    pub last_time: Duration,
}

impl NodeTiming {
    pub fn average_time(&self) -> Duration {
        if self.calls == 0 {
            return Duration::ZERO;
        }
        self.total_time / self.calls as u32
    }
}

/// Statistics accumulated over all runs of a pipeline.
#[derive(Debug, Clone, Default, Serialize)]
pub struct PerformanceStats {
    /// Successful runs.
    pub runs: u64,
    pub failed_runs: u64,
    /// Pixels of all successfully processed images.
    pub pixels_processed: u64,
    pub total_time: Duration,
    pub last_run_time: Duration,
    /// Pixels per second over all successful runs.
    pub average_throughput: f64,
    /// Per-stage timings in stage order.
    pub node_timings: IndexMap<NodeId, NodeTiming>,
}

impl PerformanceStats {
    fn record_run(&mut self, pixels: u64, elapsed: Duration) {
        self.runs += 1;
        self.pixels_processed += pixels;
        self.total_time += elapsed;
        self.last_run_time = elapsed;
        let seconds = self.total_time.as_secs_f64();
        if seconds > 0.0 {
            self.average_throughput = self.pixels_processed as f64 / seconds;
        }
    }

    fn record_node(&mut self, id: NodeId, name: &'static str, elapsed: Duration) {
        let timing = self.node_timings.entry(id).or_insert_with(|| NodeTiming {
            name,
            calls: 0,
            total_time: Duration::ZERO,
            last_time: Duration::ZERO,
        });
        timing.calls += 1;
        timing.total_time += elapsed;
        timing.last_time = elapsed;
    }
}

#[derive(Default)]
struct PipelineShared {
    state: Mutex<PipelineState>,
    stats: Mutex<PerformanceStats>,
}

/// An ordered list of processing nodes.
///
/// Cloning is cheap: stages are copied on write, while run state and
/// statistics stay shared with the clone so background runs report into the
/// same statistics block.
#[derive(Clone)]
pub struct Pipeline {
    stages: Arc<Vec<PipelineStage>>,
    shared: Arc<PipelineShared>,
    progress: Option<ProgressCallback>,
    kernels: SimdKernels,
}

impl Pipeline {
    /// Create an empty pipeline using the detected kernels.
    pub fn new() -> Self {
        Self {
            stages: Arc::new(Vec::new()),
            shared: Arc::new(PipelineShared::default()),
            progress: None,
            kernels: SimdKernels::detect(),
        }
    }

    /// Build a pipeline from stage descriptions.
    pub fn from_stages(stages: &[StageConfig]) -> ProcessingResult<Self> {
        let mut pipeline = Self::new();
        for stage in stages {
            pipeline.add_node(stage.build()?)?;
        }
        Ok(pipeline)
    }

    /// Report progress of every run through `callback`.
    pub fn with_progress(mut self, callback: ProgressCallback) -> Self {
        self.progress = Some(callback);
        self
    }

    /// Use a specific kernel dispatcher.
    pub fn with_kernels(mut self, kernels: SimdKernels) -> Self {
        self.kernels = kernels;
        self
    }

    pub fn kernels(&self) -> SimdKernels {
        self.kernels
    }

    // ========================================================================
    // Stage management
    // ========================================================================

    /// Validate and append a node.
    pub fn add_node(&mut self, node: Box<dyn ProcessingNode>) -> ProcessingResult<NodeId> {
        node.validate()?;
        let id = NodeId::new();
        log::debug!("pipeline: adding {} as {}", node.name(), id);
        Arc::make_mut(&mut self.stages).push(PipelineStage {
            id,
            node,
            enabled: true,
        });
        Ok(id)
    }

    /// Remove a node, returning it.
    pub fn remove_node(&mut self, id: NodeId) -> Option<Box<dyn ProcessingNode>> {
        let index = self.stages.iter().position(|s| s.id == id)?;
        let stage = Arc::make_mut(&mut self.stages).remove(index);
        self.shared.stats.lock().node_timings.shift_remove(&id);
        Some(stage.node)
    }

    /// Enable or disable a node. Returns `false` if the id is unknown.
    pub fn set_enabled(&mut self, id: NodeId, enabled: bool) -> bool {
        match Arc::make_mut(&mut self.stages).iter_mut().find(|s| s.id == id) {
            Some(stage) => {
                stage.enabled = enabled;
                true
            }
            None => false,
        }
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    pub fn stages(&self) -> &[PipelineStage] {
        &self.stages
    }

    /// Look up a node by id.
    pub fn node(&self, id: NodeId) -> Option<&dyn ProcessingNode> {
        self.stages
            .iter()
            .find(|s| s.id == id)
            .map(|s| s.node.as_ref())
    }

    pub fn state(&self) -> PipelineState {
        self.shared.state.lock().clone()
    }

    // ========================================================================
    // Analysis
    // ========================================================================

    /// Hash of every enabled stage's name and numeric parameters.
    pub fn fingerprint(&self) -> u64 {
        let mut hasher = DefaultHasher::new();
        for stage in self.stages.iter().filter(|s| s.enabled) {
            stage.node.name().hash(&mut hasher);
            for (name, value) in stage.node.parameters() {
                name.hash(&mut hasher);
                value.to_bits().hash(&mut hasher);
            }
        }
        hasher.finish()
    }

    /// How far from a pixel the enabled stages read, taken together.
    ///
    /// Chained neighbourhoods compound, so this is the sum of every enabled
    /// stage's extent.
    pub fn spatial_reach(&self) -> u32 {
        self.stages
            .iter()
            .filter(|s| s.enabled)
            .map(|s| s.node.spatial_extent())
            .fold(0u32, u32::saturating_add)
    }

    /// Format a run on `input` would produce.
    pub fn output_format(&self, input: PixelFormat) -> PixelFormat {
        self.stages
            .iter()
            .filter(|s| s.enabled)
            .fold(input, |format, s| s.node.output_format(format))
    }

    // ========================================================================
    // Execution
    // ========================================================================

    /// Run every stage on `input` with standalone allocations.
    pub fn process_image(&self, input: &PixelBuffer) -> ProcessingResult<PixelBuffer> {
        let ctx = NodeContext::new().with_kernels(self.kernels);
        self.process_in(input, &ctx)
    }

    /// Run every stage on `input`, allocating outputs through `ctx`.
    pub fn process_in(&self, input: &PixelBuffer, ctx: &NodeContext) -> ProcessingResult<PixelBuffer> {
        let tracker = ProgressTracker::new(self.stages.len()).with_callback(self.progress.clone());
        tracker.start();
        let started = Instant::now();

        let result = self.run_stages(input, ctx, Some(&tracker));

        self.finish_run(input.pixel_count(), started.elapsed(), result.as_ref().err());
        if let Err(err) = &result {
            tracker.report_error(err.node_id(), err.to_string());
        }
        tracker.complete();
        result
    }

    /// Run on a worker thread.
    pub fn process_image_async(&self, input: PixelBuffer) -> ProcessingFuture {
        let pipeline = self.clone();
        TaskFuture::spawn(move || pipeline.process_image(&input))
    }

    /// Run every image on worker threads; each item completes independently.
    pub fn process_batch(&self, inputs: Vec<PixelBuffer>) -> BatchFuture {
        BatchFuture::new(
            inputs
                .into_iter()
                .map(|input| self.process_image_async(input))
                .collect(),
        )
    }

    /// Run the stages on one tile. Run state and progress are left to the
    /// caller, which reports the whole tiled run through [`finish_run`](Self::finish_run).
    pub(crate) fn process_tile(&self, tile: &PixelBuffer, ctx: &NodeContext) -> ProcessingResult<PixelBuffer> {
        self.run_stages(tile, ctx, None)
    }

    /// Mark a run as started.
    pub(crate) fn begin_run(&self) {
        *self.shared.state.lock() = PipelineState::Running { index: 0 };
    }

    /// Record the outcome of a run over `pixels` pixels.
    pub(crate) fn finish_run(&self, pixels: u64, elapsed: Duration, error: Option<&ProcessingError>) {
        let mut stats = self.shared.stats.lock();
        let mut state = self.shared.state.lock();
        match error {
            None => {
                stats.record_run(pixels, elapsed);
                *state = PipelineState::Completed;
                log::trace!("pipeline run of {} pixels took {:?}", pixels, elapsed);
            }
            Some(err) => {
                stats.failed_runs += 1;
                *state = PipelineState::Failed {
                    node_id: err.node_id(),
                    message: err.to_string(),
                };
            }
        }
    }

    fn run_stages(
        &self,
        input: &PixelBuffer,
        ctx: &NodeContext,
        tracker: Option<&ProgressTracker>,
    ) -> ProcessingResult<PixelBuffer> {
        let mut current: Option<PixelBuffer> = None;

        for (index, stage) in self.stages.iter().enumerate() {
            if !stage.enabled {
                if let Some(tracker) = tracker {
                    tracker.stage_skipped(stage.id, SkipReason::Disabled);
                }
                continue;
            }
            if let Some(tracker) = tracker {
                *self.shared.state.lock() = PipelineState::Running { index };
                tracker.stage_started(stage.id, stage.node.name(), index);
            }

            let stage_start = Instant::now();
            let source = current.as_ref().unwrap_or(input);
            let output = Self::run_stage(stage, source, ctx)?;
            let elapsed = stage_start.elapsed();

            log::trace!("{} ({}) took {:?}", stage.node.name(), stage.id, elapsed);
            self.shared
                .stats
                .lock()
                .record_node(stage.id, stage.node.name(), elapsed);
            if let Some(tracker) = tracker {
                tracker.stage_completed(stage.id, index, elapsed.as_millis() as u64);
            }
            current = Some(output);
        }

        match current {
            Some(output) => Ok(output),
            None => ctx.copy_of(input),
        }
    }

    fn run_stage(stage: &PipelineStage, input: &PixelBuffer, ctx: &NodeContext) -> ProcessingResult<PixelBuffer> {
        let node = stage.node.as_ref();
        let attribute = |error: ProcessingError| ProcessingError::NodeFailed {
            node_id: stage.id,
            node: node.name().to_string(),
            error: Box::new(error),
        };

        if !node.can_process(input) {
            let target = node.output_format(input.format());
            let error = if target != input.format() {
                ProcessingError::UnsupportedConversion {
                    from: input.format(),
                    to: target,
                }
            } else {
                ProcessingError::UnsupportedFormat {
                    node: node.name().to_string(),
                    format: input.format(),
                }
            };
            return Err(attribute(error));
        }

        let output = node.process(input, ctx).map_err(attribute)?;
        if output.dimensions() != input.dimensions() {
            return Err(attribute(ProcessingError::DimensionMismatch {
                node: node.name().to_string(),
                expected: input.dimensions(),
                got: output.dimensions(),
            }));
        }
        Ok(output)
    }

    // ========================================================================
    // Statistics
    // ========================================================================

    pub fn statistics(&self) -> PerformanceStats {
        self.shared.stats.lock().clone()
    }

    pub fn reset_statistics(&self) {
        *self.shared.stats.lock() = PerformanceStats::default();
    }
}

impl Default for Pipeline {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline")
            .field("stages", &self.stages)
            .field("state", &self.state())
            .field("kernels", &self.kernels.level())
            .finish()
    }
}
