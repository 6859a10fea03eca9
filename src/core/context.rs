//! Execution context handed to every processing node.
//!
//! The context carries what a node needs besides its input: the kernel
//! dispatcher and, when the caller runs under a coordinator, the memory pool
//! output buffers should come from.

use crate::core::buffer::PixelBuffer;
use crate::core::error::ProcessingResult;
use crate::core::format::PixelFormat;
use crate::core::pool::MemoryPool;
use crate::simd::SimdKernels;
use std::sync::Arc;

/// Context provided to [`ProcessingNode::process`](crate::core::node::ProcessingNode::process).
#[derive(Debug, Clone, Default)]
pub struct NodeContext {
    kernels: SimdKernels,
    pool: Option<Arc<MemoryPool>>,
}

impl NodeContext {
    /// Standalone context: detected kernels, no pool.
    pub fn new() -> Self {
        Self::default()
    }

    /// Context allocating outputs from `pool`.
    pub fn with_pool(pool: Arc<MemoryPool>) -> Self {
        Self {
            kernels: SimdKernels::detect(),
            pool: Some(pool),
        }
    }

    /// Override the kernel dispatcher.
    pub fn with_kernels(mut self, kernels: SimdKernels) -> Self {
        self.kernels = kernels;
        self
    }

    /// The kernel dispatcher nodes should use.
    pub fn kernels(&self) -> &SimdKernels {
        &self.kernels
    }

    /// The pool outputs are allocated from, if any.
    pub fn pool(&self) -> Option<&Arc<MemoryPool>> {
        self.pool.as_ref()
    }

    // ========================================================================
    // Allocation
    // ========================================================================

    /// Allocate a zero-filled output buffer.
    pub fn allocate(&self, width: u32, height: u32, format: PixelFormat) -> ProcessingResult<PixelBuffer> {
        match &self.pool {
            Some(pool) => PixelBuffer::new_in(pool, width, height, format),
            None => PixelBuffer::new(width, height, format),
        }
    }

    /// Allocate a zero-filled buffer shaped like `input`.
    pub fn allocate_like(&self, input: &PixelBuffer) -> ProcessingResult<PixelBuffer> {
        self.allocate(input.width(), input.height(), input.format())
    }

    /// Copy `input` into a buffer owned by this context.
    pub fn copy_of(&self, input: &PixelBuffer) -> ProcessingResult<PixelBuffer> {
        let mut output = self.allocate_like(input)?;
        for (dst, src) in output.rows_mut().zip(input.rows()) {
            dst.copy_from_slice(src);
        }
        Ok(output)
    }
}
