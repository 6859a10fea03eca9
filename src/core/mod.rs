//! Core types and traits for the Scanpipe processing system.
//!
//! This module contains the foundational pieces the pipeline is built from:
//! - Pixel formats and pixel buffers
//! - The arena memory pool buffers are carved from
//! - Tiling of oversized images
//! - Processing configuration
//! - Node trait, node context and error types

pub mod format;
pub mod buffer;
pub mod pool;
pub mod tile;
pub mod config;
pub mod error;
pub mod context;
pub mod node;

// Re-export commonly used types
pub use format::{PixelFormat, SampleLayout};
pub use buffer::PixelBuffer;
pub use pool::{BlockId, BlockInfo, MemoryPool, PoolBlock, PoolStatistics};
pub use tile::{Tile, TileEngine, TileRegion};
pub use config::{ProcessingConfig, ProcessingMode};
pub use error::{ConfigError, NodeId, ProcessingError, ProcessingResult, ScanError, ScanResult};
pub use context::NodeContext;
pub use node::{NodeKind, ProcessingNode};
