//! Pipeline entry stage.

use crate::core::buffer::PixelBuffer;
use crate::core::context::NodeContext;
use crate::core::error::{ProcessingError, ProcessingResult};
use crate::core::format::PixelFormat;
use crate::core::node::{NodeKind, ProcessingNode};

/// Checks the buffer handed over by the device layer and passes it on.
///
/// Limits are upper bounds rather than exact sizes: under tiling the source
/// sees tiles, which are never larger than the scan itself.
#[derive(Debug, Clone, Default)]
pub struct SourceNode {
    expected_format: Option<PixelFormat>,
    max_dimensions: Option<(u32, u32)>,
}

impl SourceNode {
    /// Accept any concrete format and size.
    pub fn new() -> Self {
        Self::default()
    }

    /// Only accept `format`.
    pub fn with_format(mut self, format: PixelFormat) -> Self {
        self.expected_format = Some(format);
        self
    }

    /// Reject buffers wider or taller than this.
    pub fn with_max_dimensions(mut self, width: u32, height: u32) -> Self {
        self.max_dimensions = Some((width, height));
        self
    }

    pub fn expected_format(&self) -> Option<PixelFormat> {
        self.expected_format
    }
}

impl ProcessingNode for SourceNode {
    fn name(&self) -> &'static str {
        "source"
    }

    fn kind(&self) -> NodeKind {
        NodeKind::Source
    }

    fn validate(&self) -> ProcessingResult<()> {
        if self.expected_format == Some(PixelFormat::Unknown) {
            return Err(ProcessingError::invalid(
                "expected_format",
                "must be a concrete pixel format",
            ));
        }
        if let Some((w, h)) = self.max_dimensions {
            if w == 0 || h == 0 {
                return Err(ProcessingError::invalid("max_dimensions", "must be non-zero"));
            }
        }
        Ok(())
    }

    fn can_process(&self, input: &PixelBuffer) -> bool {
        input.format() != PixelFormat::Unknown
            && self.expected_format.map_or(true, |f| f == input.format())
    }

    fn process(&self, input: &PixelBuffer, ctx: &NodeContext) -> ProcessingResult<PixelBuffer> {
        if let Some((max_w, max_h)) = self.max_dimensions {
            if input.width() > max_w || input.height() > max_h {
                return Err(ProcessingError::InvalidDimensions {
                    width: input.width(),
                    height: input.height(),
                });
            }
        }
        ctx.copy_of(input)
    }

    fn parameters(&self) -> Vec<(&'static str, f64)> {
        let (w, h) = self.max_dimensions.unwrap_or((0, 0));
        vec![("max_width", w as f64), ("max_height", h as f64)]
    }

    fn clone_box(&self) -> Box<dyn ProcessingNode> {
        Box::new(self.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_passes_input_through() {
        let input = PixelBuffer::from_bytes(2, 2, PixelFormat::Mono8, &[1, 2, 3, 4]).unwrap();
        let node = SourceNode::new().with_format(PixelFormat::Mono8);

        assert!(node.can_process(&input));
        let output = node.process(&input, &NodeContext::new()).unwrap();
        assert_eq!(output, input);
    }

    #[test]
    fn test_rejects_other_format() {
        let input = PixelBuffer::new(2, 2, PixelFormat::Rgb24).unwrap();
        let node = SourceNode::new().with_format(PixelFormat::Mono8);
        assert!(!node.can_process(&input));
    }

    #[test]
    fn test_rejects_oversized_input() {
        let input = PixelBuffer::new(8, 2, PixelFormat::Mono8).unwrap();
        let node = SourceNode::new().with_max_dimensions(4, 4);
        let err = node.process(&input, &NodeContext::new()).unwrap_err();
        assert!(matches!(err, ProcessingError::InvalidDimensions { width: 8, .. }));
    }

    #[test]
    fn test_validate_unknown_format() {
        assert!(SourceNode::new()
            .with_format(PixelFormat::Unknown)
            .validate()
            .is_err());
    }
}
