//! # Scanpipe - Raster Processing for Scanner Output
//!
//! Scanpipe takes raw pixel buffers as they come off a scanner's sensor and
//! runs them through a configurable pipeline of correction stages. Images of
//! any size are processed within a fixed memory budget: oversized scans are
//! split into overlapping tiles, processed in parallel and merged back.
//!
//! ## Features
//!
//! - **Pixel formats**: packed 8-bit, 16-bit raw, 12-bit packed raw, YUV 4:2:2 and Lab
//! - **Pooled memory**: buffers are carved from an index-based arena allocator
//! - **SIMD kernels**: scalar, SSE2, AVX2 and NEON backends producing identical output
//! - **Memory-bounded execution**: automatic tiling, result caching and a background monitor
//! - **Declarative pipelines**: stages can be described in TOML
//!
//! ## Quick Start
//!
//! ```no_run
//! use scanpipe::prelude::*;
//!
//! let mut pipeline = Pipeline::new();
//! pipeline.add_node(Box::new(FormatConvertNode::new(PixelFormat::Rgb24)))?;
//! pipeline.add_node(Box::new(
//!     ColorCorrectionNode::new()
//!         .with_auto_white_balance(true)
//!         .with_gamma(1.8),
//! ))?;
//! pipeline.add_node(Box::new(NoiseReductionNode::new(NoiseAlgorithm::Bilateral, 0.3)))?;
//!
//! let config = ProcessingConfig::default().with_memory_threshold_mb(256);
//! let coordinator = TiledProcessingCoordinator::new(pipeline, config)?;
//!
//! let scan = PixelBuffer::new(5100, 7020, PixelFormat::Rgba32)?;
//! let corrected = coordinator.process(&scan)?;
//! println!("{:?}", coordinator.memory_stats());
//! # let _ = corrected;
//! # Ok::<(), ScanError>(())
//! ```
//!
//! ## Architecture
//!
//! - [`core`]: pixel formats, buffers, the memory pool, tiling, configuration and errors
//! - [`simd`]: capability detection and kernel backends
//! - [`nodes`]: the built-in pipeline stages and their TOML description
//! - [`execution`]: pipeline, coordinator, cache, futures and maintenance

#![warn(clippy::all)]

pub mod core;
pub mod simd;
pub mod nodes;
pub mod execution;

/// Prelude module for convenient imports.
///
/// ```rust
/// use scanpipe::prelude::*;
/// ```
pub mod prelude {
    // Core
    pub use crate::core::{
        ConfigError, MemoryPool, NodeContext, NodeId, NodeKind, PixelBuffer, PixelFormat,
        PoolStatistics, ProcessingConfig, ProcessingError, ProcessingMode, ProcessingNode,
        ProcessingResult, ScanError, ScanResult, Tile, TileEngine, TileRegion,
    };

    // Kernels
    pub use crate::simd::{SimdKernels, SimdLevel};

    // Nodes
    pub use crate::nodes::{
        ColorCorrectionNode, FormatConvertNode, NoiseAlgorithm, NoiseReductionNode,
        PipelineDescription, PixelShiftNode, SinkNode, SinkSlot, SourceNode, StageConfig,
    };

    // Execution
    pub use crate::execution::{
        BatchFuture, MemoryStats, PerformanceStats, Pipeline, PipelineState, ProcessingFuture,
        ProgressCallback, ProgressUpdate, TiledProcessingCoordinator,
    };
}

/// Library version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name.
pub const NAME: &str = env!("CARGO_PKG_NAME");
