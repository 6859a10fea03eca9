//! Error types for Scanpipe.
//!
//! Uses thiserror for structured errors with context. Every failure is local to
//! one `process()` invocation: nothing partial is cached or returned, and
//! memory pressure is never reported as an error (it reroutes work through the
//! tiled path instead).

use crate::core::format::PixelFormat;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;
use uuid::Uuid;

/// Unique identifier for a node held by a pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NodeId(pub Uuid);

impl NodeId {
    /// Create a new random node ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Create a node ID from a UUID.
    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl Default for NodeId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", &self.0.to_string()[..8])
    }
}

/// Top-level error type for Scanpipe.
#[derive(Error, Debug)]
pub enum ScanError {
    #[error("Processing error: {0}")]
    Processing(#[from] ProcessingError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Image error: {0}")]
    Image(#[from] image::ImageError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("{0}")]
    Other(String),
}

/// Errors raised while allocating, converting or processing pixel data.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ProcessingError {
    #[error("Allocation of {requested} bytes (alignment {alignment}) failed")]
    AllocationFailure { requested: usize, alignment: usize },

    #[error("Unsupported conversion from {from} to {to}")]
    UnsupportedConversion { from: PixelFormat, to: PixelFormat },

    #[error("{node} cannot process {format} input")]
    UnsupportedFormat { node: String, format: PixelFormat },

    #[error("Invalid parameter '{parameter}': {reason}")]
    InvalidParameters { parameter: String, reason: String },

    #[error("Invalid dimensions {width}x{height}")]
    InvalidDimensions { width: u32, height: u32 },

    #[error("{node} changed dimensions from {expected:?} to {got:?}")]
    DimensionMismatch {
        node: String,
        expected: (u32, u32),
        got: (u32, u32),
    },

    #[error("Tile merge inconsistency: {reason}")]
    TileMergeInconsistency { reason: String },

    #[error("Node {node_id} ({node}) failed: {error}")]
    NodeFailed {
        node_id: NodeId,
        node: String,
        error: Box<ProcessingError>,
    },

    #[error("Worker failure: {0}")]
    Worker(String),
}

/// Errors from loading or validating a [`ProcessingConfig`](crate::core::config::ProcessingConfig).
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read configuration: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse configuration: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

// ============================================================================
// Error Utilities
// ============================================================================

impl ProcessingError {
    /// Shorthand for an [`InvalidParameters`](Self::InvalidParameters) error.
    pub fn invalid(parameter: impl Into<String>, reason: impl Into<String>) -> Self {
        ProcessingError::InvalidParameters {
            parameter: parameter.into(),
            reason: reason.into(),
        }
    }

    /// Shorthand for a [`TileMergeInconsistency`](Self::TileMergeInconsistency) error.
    pub fn merge(reason: impl Into<String>) -> Self {
        ProcessingError::TileMergeInconsistency {
            reason: reason.into(),
        }
    }

    /// Get the node ID that caused this error, if applicable.
    pub fn node_id(&self) -> Option<NodeId> {
        match self {
            ProcessingError::NodeFailed { node_id, .. } => Some(*node_id),
            _ => None,
        }
    }

    /// The innermost error, unwrapping node attribution.
    pub fn root_cause(&self) -> &ProcessingError {
        match self {
            ProcessingError::NodeFailed { error, .. } => error.root_cause(),
            other => other,
        }
    }

    /// Check if this error is recoverable (a retry with other input may succeed).
    pub fn is_recoverable(&self) -> bool {
        !matches!(
            self.root_cause(),
            ProcessingError::AllocationFailure { .. }
                | ProcessingError::TileMergeInconsistency { .. }
                | ProcessingError::Worker(_)
        )
    }
}

/// Result type alias for Scanpipe operations.
pub type ScanResult<T> = Result<T, ScanError>;

/// Result type alias for processing operations.
pub type ProcessingResult<T> = Result<T, ProcessingError>;
