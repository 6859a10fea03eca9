//! ProcessingNode trait and node kinds.
//!
//! A node is one pipeline stage. It uses a two-phase design: parameter
//! validation (when the node is added to a pipeline, before any pixels move)
//! and processing (once per image or tile).

use crate::core::buffer::PixelBuffer;
use crate::core::context::NodeContext;
use crate::core::error::ProcessingResult;
use crate::core::format::PixelFormat;
use serde::{Deserialize, Serialize};
use std::fmt;

/// The six stage kinds a scan pipeline is built from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeKind {
    /// Entry point; checks the incoming buffer.
    Source,
    /// Pixel format conversion.
    FormatConvert,
    /// Sub-pixel sensor misalignment correction.
    PixelShift,
    /// White balance, color matrix, tone and saturation.
    ColorCorrection,
    /// Denoising.
    NoiseReduction,
    /// Exit point; publishes the final buffer.
    Sink,
}

impl NodeKind {
    /// Get the display name for this kind.
    pub fn display_name(&self) -> &'static str {
        match self {
            NodeKind::Source => "Source",
            NodeKind::FormatConvert => "Format Convert",
            NodeKind::PixelShift => "Pixel Shift",
            NodeKind::ColorCorrection => "Color Correction",
            NodeKind::NoiseReduction => "Noise Reduction",
            NodeKind::Sink => "Sink",
        }
    }

    /// Get all kinds in pipeline order.
    pub fn all() -> &'static [NodeKind] {
        &[
            NodeKind::Source,
            NodeKind::FormatConvert,
            NodeKind::PixelShift,
            NodeKind::ColorCorrection,
            NodeKind::NoiseReduction,
            NodeKind::Sink,
        ]
    }
}

impl fmt::Display for NodeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.display_name())
    }
}

/// The core trait for pipeline stages.
///
/// # Contract
///
/// - [`validate`](Self::validate) rejects out-of-range parameters. A pipeline
///   calls it when the node is added, so a badly configured node never runs.
/// - [`can_process`](Self::can_process) is a cheap format check. A pipeline
///   fails the whole run when it returns `false`.
/// - [`process`](Self::process) never changes the width or height of its
///   input. The output format may differ from the input format only when
///   [`output_format`](Self::output_format) says so.
///
/// # Thread Safety
///
/// `Send + Sync` lets the coordinator run one pipeline over many tiles in
/// parallel; `process` takes `&self`, so nodes hold no per-run state.
pub trait ProcessingNode: Send + Sync {
    /// Stable snake_case name used in logs, errors and fingerprints.
    fn name(&self) -> &'static str;

    /// Which of the six stage kinds this is.
    fn kind(&self) -> NodeKind;

    /// Check parameter ranges.
    fn validate(&self) -> ProcessingResult<()>;

    /// Whether `input` has a format this node handles.
    fn can_process(&self, input: &PixelBuffer) -> bool;

    /// Run the stage. The result must have the same dimensions as `input`.
    fn process(&self, input: &PixelBuffer, ctx: &NodeContext) -> ProcessingResult<PixelBuffer>;

    /// Every numeric parameter, in a fixed order, for result fingerprinting.
    fn parameters(&self) -> Vec<(&'static str, f64)>;

    /// Pixels of context the node reads around each output pixel.
    ///
    /// Used to warn when tile overlap is smaller than a neighbourhood filter.
    fn spatial_extent(&self) -> u32 {
        0
    }

    /// Format produced for an input of format `input`.
    fn output_format(&self, input: PixelFormat) -> PixelFormat {
        input
    }

    /// Reset any internal state between batches. Default implementation does nothing.
    fn reset(&mut self) {}

    /// Clone this node into a boxed trait object.
    fn clone_box(&self) -> Box<dyn ProcessingNode>;
}

// Allow cloning Box<dyn ProcessingNode>
impl Clone for Box<dyn ProcessingNode> {
    fn clone(&self) -> Self {
        self.clone_box()
    }
}

impl fmt::Debug for dyn ProcessingNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProcessingNode")
            .field("name", &self.name())
            .field("kind", &self.kind())
            .field("parameters", &self.parameters())
            .finish()
    }
}
