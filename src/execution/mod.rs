//! Execution layer.
//!
//! This module runs pipelines: directly, tile by tile under the memory-bounded
//! coordinator, on background threads, and with result caching.

pub mod pipeline;
pub mod progress;
pub mod future;
pub mod cache;
pub mod monitor;
pub mod coordinator;

pub use pipeline::{NodeTiming, PerformanceStats, Pipeline, PipelineStage, PipelineState};
pub use progress::{ProgressCallback, ProgressTracker, ProgressUpdate, SkipReason};
pub use future::{BatchFuture, ProcessingFuture, TaskFuture};
pub use cache::{CacheKey, CacheStats, ResultCache};
pub use monitor::{MaintenanceOutcome, MaintenanceScheduler, MaintenanceTarget};
pub use coordinator::{HousekeepingReport, MemoryStats, OptimizationReport, TiledProcessingCoordinator};
