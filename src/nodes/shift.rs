//! Sensor misalignment correction.
//!
//! Line sensors often sample each color channel a fraction of a pixel apart.
//! This stage moves image content by a global offset plus optional
//! per-channel offsets, resampling bilinearly. Samples that would come from
//! outside the buffer take the nearest edge value.

use crate::core::buffer::PixelBuffer;
use crate::core::context::NodeContext;
use crate::core::error::{ProcessingError, ProcessingResult};
use crate::core::node::{NodeKind, ProcessingNode};
use crate::nodes::{check_range, fill_rows};
use crate::simd::scalar::round_sample;

/// Largest accepted shift magnitude in pixels.
pub const MAX_SHIFT: f32 = 64.0;

/// Shifts content right/down by `(dx, dy)` (negative values shift left/up).
#[derive(Debug, Clone, Default)]
pub struct PixelShiftNode {
    dx: f32,
    dy: f32,
    channel_offsets: Vec<(f32, f32)>,
}

/// Precomputed source taps along one axis.
#[derive(Debug, Clone, Copy)]
struct Tap {
    lo: usize,
    hi: usize,
    frac: f32,
}

impl PixelShiftNode {
    pub fn new(dx: f32, dy: f32) -> Self {
        Self {
            dx,
            dy,
            channel_offsets: Vec::new(),
        }
    }

    /// Extra offsets added to the global shift, one `(dx, dy)` per channel.
    /// Channels beyond the list use the global shift only.
    pub fn with_channel_offsets(mut self, offsets: Vec<(f32, f32)>) -> Self {
        self.channel_offsets = offsets;
        self
    }

    /// Total shift applied to `channel`.
    pub fn shift_for(&self, channel: usize) -> (f32, f32) {
        let (cx, cy) = self.channel_offsets.get(channel).copied().unwrap_or((0.0, 0.0));
        (self.dx + cx, self.dy + cy)
    }

    fn taps(len: usize, shift: f32) -> Vec<Tap> {
        let last = len as f32 - 1.0;
        (0..len)
            .map(|i| {
                let pos = (i as f32 - shift).clamp(0.0, last);
                let lo = pos.floor();
                let frac = pos - lo;
                let lo = lo as usize;
                Tap {
                    lo,
                    hi: (lo + 1).min(len - 1),
                    frac,
                }
            })
            .collect()
    }
}

impl ProcessingNode for PixelShiftNode {
    fn name(&self) -> &'static str {
        "pixel_shift"
    }

    fn kind(&self) -> NodeKind {
        NodeKind::PixelShift
    }

    fn validate(&self) -> ProcessingResult<()> {
        check_range("dx", self.dx, -MAX_SHIFT, MAX_SHIFT)?;
        check_range("dy", self.dy, -MAX_SHIFT, MAX_SHIFT)?;
        if self.channel_offsets.len() > 4 {
            return Err(ProcessingError::invalid(
                "channel_offsets",
                format!("{} entries for at most 4 channels", self.channel_offsets.len()),
            ));
        }
        for c in 0..self.channel_offsets.len() {
            let (dx, dy) = self.shift_for(c);
            check_range("channel_offsets", dx, -MAX_SHIFT, MAX_SHIFT)?;
            check_range("channel_offsets", dy, -MAX_SHIFT, MAX_SHIFT)?;
        }
        Ok(())
    }

    fn can_process(&self, input: &PixelBuffer) -> bool {
        input.format().is_8bit_interleaved()
    }

    fn process(&self, input: &PixelBuffer, ctx: &NodeContext) -> ProcessingResult<PixelBuffer> {
        let format = input.format();
        if !format.is_8bit_interleaved() {
            return Err(ProcessingError::UnsupportedFormat {
                node: self.name().to_string(),
                format,
            });
        }

        let channels = format.channels();
        let shifts: Vec<(f32, f32)> = (0..channels).map(|c| self.shift_for(c)).collect();
        if shifts.iter().all(|&(dx, dy)| dx == 0.0 && dy == 0.0) {
            return ctx.copy_of(input);
        }

        let (width, height) = (input.width() as usize, input.height() as usize);
        let x_taps: Vec<Vec<Tap>> = shifts.iter().map(|&(dx, _)| Self::taps(width, dx)).collect();
        let y_taps: Vec<Vec<Tap>> = shifts.iter().map(|&(_, dy)| Self::taps(height, dy)).collect();

        let mut output = ctx.allocate_like(input)?;
        fill_rows(&mut output, |y, dst| {
            for c in 0..channels {
                let ty = y_taps[c][y as usize];
                let top = input.row(ty.lo as u32);
                let bottom = input.row(ty.hi as u32);
                for (x, tx) in x_taps[c].iter().enumerate() {
                    let a = top[tx.lo * channels + c] as f32;
                    let b = top[tx.hi * channels + c] as f32;
                    let d = bottom[tx.lo * channels + c] as f32;
                    let e = bottom[tx.hi * channels + c] as f32;
                    let upper = a + (b - a) * tx.frac;
                    let lower = d + (e - d) * tx.frac;
                    dst[x * channels + c] = round_sample(upper + (lower - upper) * ty.frac);
                }
            }
        });
        Ok(output)
    }

    fn parameters(&self) -> Vec<(&'static str, f64)> {
        let mut params = vec![("dx", self.dx as f64), ("dy", self.dy as f64)];
        for &(cx, cy) in &self.channel_offsets {
            params.push(("channel_dx", cx as f64));
            params.push(("channel_dy", cy as f64));
        }
        params
    }

    fn spatial_extent(&self) -> u32 {
        (0..4)
            .map(|c| {
                let (dx, dy) = self.shift_for(c);
                dx.abs().max(dy.abs()).ceil() as u32
            })
            .max()
            .unwrap_or(0)
    }

    fn clone_box(&self) -> Box<dyn ProcessingNode> {
        Box::new(self.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::format::PixelFormat;

    fn ramp(width: u32) -> PixelBuffer {
        let data: Vec<u8> = (0..width).map(|x| (x * 10) as u8).collect();
        PixelBuffer::from_bytes(width, 1, PixelFormat::Mono8, &data).unwrap()
    }

    #[test]
    fn test_integer_shift_clamps_to_edge() {
        let output = PixelShiftNode::new(2.0, 0.0)
            .process(&ramp(5), &NodeContext::new())
            .unwrap();
        assert_eq!(output.row(0), &[0, 0, 0, 10, 20]);

        let output = PixelShiftNode::new(-1.0, 0.0)
            .process(&ramp(5), &NodeContext::new())
            .unwrap();
        assert_eq!(output.row(0), &[10, 20, 30, 40, 40]);
    }

    #[test]
    fn test_half_pixel_shift_interpolates() {
        let output = PixelShiftNode::new(0.5, 0.0)
            .process(&ramp(4), &NodeContext::new())
            .unwrap();
        assert_eq!(output.row(0), &[0, 5, 15, 25]);
    }

    #[test]
    fn test_vertical_shift() {
        let input = PixelBuffer::from_bytes(1, 3, PixelFormat::Mono8, &[10, 20, 30]).unwrap();
        let output = PixelShiftNode::new(0.0, 1.0)
            .process(&input, &NodeContext::new())
            .unwrap();
        assert_eq!(output.to_packed_bytes(), vec![10, 10, 20]);
    }

    #[test]
    fn test_per_channel_offsets() {
        let input = PixelBuffer::from_bytes(3, 1, PixelFormat::Rgb24, &[1, 2, 3, 4, 5, 6, 7, 8, 9]).unwrap();
        let node = PixelShiftNode::new(0.0, 0.0).with_channel_offsets(vec![(1.0, 0.0)]);
        let output = node.process(&input, &NodeContext::new()).unwrap();
        assert_eq!(output.row(0), &[1, 2, 3, 1, 5, 6, 4, 8, 9]);
        assert_eq!(node.spatial_extent(), 1);
    }

    #[test]
    fn test_zero_shift_is_identity() {
        let input = ramp(7);
        let output = PixelShiftNode::new(0.0, 0.0)
            .process(&input, &NodeContext::new())
            .unwrap();
        assert_eq!(output, input);
    }

    #[test]
    fn test_validation() {
        assert!(PixelShiftNode::new(65.0, 0.0).validate().is_err());
        assert!(PixelShiftNode::new(0.0, f32::NAN).validate().is_err());
        assert!(PixelShiftNode::new(3.5, -2.0).validate().is_ok());
    }

    #[test]
    fn test_rejects_packed_formats() {
        let input = PixelBuffer::new(4, 1, PixelFormat::Raw12Packed).unwrap();
        assert!(!PixelShiftNode::new(1.0, 0.0).can_process(&input));
    }
}
