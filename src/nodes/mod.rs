//! Built-in pipeline stages.
//!
//! Each stage implements [`ProcessingNode`](crate::core::node::ProcessingNode).
//! Stages can also be described declaratively with [`StageConfig`] and built
//! from TOML.

pub mod source;
pub mod convert;
pub mod shift;
pub mod color;
pub mod denoise;
pub mod sink;
pub mod stage;

pub use source::SourceNode;
pub use convert::FormatConvertNode;
pub use shift::PixelShiftNode;
pub use color::ColorCorrectionNode;
pub use denoise::{NoiseAlgorithm, NoiseReductionNode};
pub use sink::{SinkNode, SinkSlot};
pub use stage::{PipelineDescription, StageConfig};

use crate::core::buffer::PixelBuffer;
use crate::core::error::{ProcessingError, ProcessingResult};
use rayon::prelude::*;

/// Buffers above this size are filtered one rayon task per row.
const PARALLEL_ROWS_BYTES: usize = 64 * 1024;

/// Reject values outside `[min, max]` (and NaN).
pub(crate) fn check_range(parameter: &str, value: f32, min: f32, max: f32) -> ProcessingResult<()> {
    if !(value >= min && value <= max) {
        return Err(ProcessingError::invalid(
            parameter,
            format!("{} is outside [{}, {}]", value, min, max),
        ));
    }
    Ok(())
}

/// Fill `output` row by row from `f(y, row)`, in parallel for large buffers.
pub(crate) fn fill_rows<F>(output: &mut PixelBuffer, f: F)
where
    F: Fn(u32, &mut [u8]) + Send + Sync,
{
    if output.byte_size() > PARALLEL_ROWS_BYTES {
        output
            .par_rows_mut()
            .enumerate()
            .for_each(|(y, row)| f(y as u32, row));
    } else {
        output
            .rows_mut()
            .enumerate()
            .for_each(|(y, row)| f(y as u32, row));
    }
}

/// Clamp `pos + delta` into `0..len`.
#[inline]
pub(crate) fn clamp_offset(pos: usize, delta: isize, len: usize) -> usize {
    (pos as isize + delta).clamp(0, len as isize - 1) as usize
}
