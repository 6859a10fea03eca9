//! Pipeline exit stage.

use crate::core::buffer::PixelBuffer;
use crate::core::context::NodeContext;
use crate::core::error::ProcessingResult;
use crate::core::format::PixelFormat;
use crate::core::node::{NodeKind, ProcessingNode};
use crate::nodes::convert::{self, FormatConvertNode};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Shared mailbox the sink publishes its last output into.
///
/// The slot holds a standalone copy so it never pins pool memory. When the
/// pipeline runs per tile, the slot sees each tile in turn.
#[derive(Debug, Clone, Default)]
pub struct SinkSlot {
    inner: Arc<SlotInner>,
}

#[derive(Debug, Default)]
struct SlotInner {
    latest: Mutex<Option<PixelBuffer>>,
    published: AtomicU64,
}

impl SinkSlot {
    pub fn new() -> Self {
        Self::default()
    }

    fn publish(&self, buffer: PixelBuffer) {
        *self.inner.latest.lock() = Some(buffer);
        self.inner.published.fetch_add(1, Ordering::Relaxed);
    }

    /// Take the most recent output, leaving the slot empty.
    pub fn take(&self) -> Option<PixelBuffer> {
        self.inner.latest.lock().take()
    }

    /// Dimensions of the most recent output.
    pub fn latest_dimensions(&self) -> Option<(u32, u32)> {
        self.inner.latest.lock().as_ref().map(|b| b.dimensions())
    }

    /// How many buffers have been published.
    pub fn published(&self) -> u64 {
        self.inner.published.load(Ordering::Relaxed)
    }
}

/// Records the final buffer, optionally converting it first.
#[derive(Debug, Clone, Default)]
pub struct SinkNode {
    slot: SinkSlot,
    convert_to: Option<PixelFormat>,
}

impl SinkNode {
    pub fn new() -> Self {
        Self::default()
    }

    /// Publish into an existing slot.
    pub fn with_slot(mut self, slot: SinkSlot) -> Self {
        self.slot = slot;
        self
    }

    /// Convert to `format` before publishing.
    pub fn with_output_format(mut self, format: PixelFormat) -> Self {
        self.convert_to = Some(format);
        self
    }

    pub fn slot(&self) -> &SinkSlot {
        &self.slot
    }
}

impl ProcessingNode for SinkNode {
    fn name(&self) -> &'static str {
        "sink"
    }

    fn kind(&self) -> NodeKind {
        NodeKind::Sink
    }

    fn validate(&self) -> ProcessingResult<()> {
        match self.convert_to {
            Some(format) => FormatConvertNode::new(format).validate(),
            None => Ok(()),
        }
    }

    fn can_process(&self, input: &PixelBuffer) -> bool {
        self.convert_to
            .map_or(true, |to| convert::is_supported(input.format(), to))
    }

    fn process(&self, input: &PixelBuffer, ctx: &NodeContext) -> ProcessingResult<PixelBuffer> {
        let output = match self.convert_to {
            Some(to) => FormatConvertNode::new(to).convert(input, ctx)?,
            None => ctx.copy_of(input)?,
        };
        self.slot.publish(output.to_standalone()?);
        Ok(output)
    }

    fn parameters(&self) -> Vec<(&'static str, f64)> {
        let target = self
            .convert_to
            .and_then(|to| PixelFormat::all().iter().position(|f| *f == to))
            .map_or(-1.0, |i| i as f64);
        vec![("convert_to", target)]
    }

    fn output_format(&self, input: PixelFormat) -> PixelFormat {
        self.convert_to.unwrap_or(input)
    }

    fn clone_box(&self) -> Box<dyn ProcessingNode> {
        Box::new(self.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_publishes_standalone_copy() {
        let pool = Arc::new(crate::core::pool::MemoryPool::new(1 << 16));
        let ctx = NodeContext::with_pool(Arc::clone(&pool));
        let input = PixelBuffer::from_bytes_in(&pool, 2, 1, PixelFormat::Mono8, &[3, 4]).unwrap();
        let sink = SinkNode::new();

        let output = sink.process(&input, &ctx).unwrap();
        assert_eq!(output, input);
        assert_eq!(sink.slot().published(), 1);

        let published = sink.slot().take().unwrap();
        assert!(!published.is_pooled());
        assert_eq!(published, input);
        assert!(sink.slot().take().is_none());
    }

    #[test]
    fn test_converts_before_publishing() {
        let input = PixelBuffer::from_bytes(1, 1, PixelFormat::Mono8, &[9]).unwrap();
        let slot = SinkSlot::new();
        let sink = SinkNode::new()
            .with_slot(slot.clone())
            .with_output_format(PixelFormat::Rgb24);

        assert_eq!(sink.output_format(PixelFormat::Mono8), PixelFormat::Rgb24);
        let output = sink.process(&input, &NodeContext::new()).unwrap();
        assert_eq!(output.row(0), &[9, 9, 9]);
        assert_eq!(slot.latest_dimensions(), Some((1, 1)));
    }

    #[test]
    fn test_cannot_process_unsupported_conversion() {
        let input = PixelBuffer::new(2, 1, PixelFormat::Yuv422).unwrap();
        let sink = SinkNode::new().with_output_format(PixelFormat::Lab);
        assert!(!sink.can_process(&input));
    }
}
