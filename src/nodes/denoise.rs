//! Noise reduction stage.
//!
//! `strength` in `[0, 1]` scales every algorithm; zero leaves the input
//! untouched. On RGBA input the alpha channel is carried over unchanged by
//! every algorithm except Gaussian, which filters all channels.

use crate::core::buffer::PixelBuffer;
use crate::core::context::NodeContext;
use crate::core::error::{ProcessingError, ProcessingResult};
use crate::core::node::{NodeKind, ProcessingNode};
use crate::nodes::{check_range, clamp_offset, fill_rows};
use crate::simd::scalar::round_sample;
use serde::{Deserialize, Serialize};

/// Patch half-size for non-local means (3×3 patches).
const NLM_PATCH: isize = 1;
/// Search window half-size for non-local means (7×7 window).
const NLM_SEARCH: isize = 3;

/// Denoising algorithm.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NoiseAlgorithm {
    /// Separable Gaussian blur.
    #[default]
    Gaussian,
    /// Edge-preserving bilateral filter.
    Bilateral,
    /// Patch-similarity weighted average.
    NonLocalMeans,
    /// One-level Haar transform with soft thresholding.
    Wavelet,
    /// Per-channel median.
    MedianFilter,
}

impl NoiseAlgorithm {
    pub fn all() -> &'static [NoiseAlgorithm] {
        &[
            NoiseAlgorithm::Gaussian,
            NoiseAlgorithm::Bilateral,
            NoiseAlgorithm::NonLocalMeans,
            NoiseAlgorithm::Wavelet,
            NoiseAlgorithm::MedianFilter,
        ]
    }

    /// Whether the algorithm keeps edges sharp.
    pub fn is_edge_aware(&self) -> bool {
        matches!(self, NoiseAlgorithm::Bilateral | NoiseAlgorithm::NonLocalMeans)
    }
}

/// Denoising with a selectable algorithm.
#[derive(Debug, Clone)]
pub struct NoiseReductionNode {
    algorithm: NoiseAlgorithm,
    strength: f32,
    preserve_details: bool,
}

impl Default for NoiseReductionNode {
    fn default() -> Self {
        Self::new(NoiseAlgorithm::Gaussian, 0.5)
    }
}

impl NoiseReductionNode {
    pub fn new(algorithm: NoiseAlgorithm, strength: f32) -> Self {
        Self {
            algorithm,
            strength,
            preserve_details: false,
        }
    }

    /// Prefer an edge-aware algorithm over uniform blur.
    pub fn with_preserve_details(mut self, enabled: bool) -> Self {
        self.preserve_details = enabled;
        self
    }

    pub fn strength(&self) -> f32 {
        self.strength
    }

    /// The algorithm that actually runs.
    pub fn effective_algorithm(&self) -> NoiseAlgorithm {
        match self.algorithm {
            NoiseAlgorithm::Gaussian if self.preserve_details => NoiseAlgorithm::Bilateral,
            other => other,
        }
    }

    fn gaussian_radius(&self) -> u32 {
        1 + (self.strength * 4.0).round() as u32
    }

    fn bilateral_radius(&self) -> usize {
        1 + (self.strength * 3.0).round() as usize
    }

    fn median_size(&self) -> usize {
        if self.strength < 0.5 {
            3
        } else {
            5
        }
    }
}

impl ProcessingNode for NoiseReductionNode {
    fn name(&self) -> &'static str {
        "noise_reduction"
    }

    fn kind(&self) -> NodeKind {
        NodeKind::NoiseReduction
    }

    fn validate(&self) -> ProcessingResult<()> {
        check_range("strength", self.strength, 0.0, 1.0)
    }

    fn can_process(&self, input: &PixelBuffer) -> bool {
        input.format().is_kernel_compatible()
    }

    fn process(&self, input: &PixelBuffer, ctx: &NodeContext) -> ProcessingResult<PixelBuffer> {
        let format = input.format();
        if !format.is_kernel_compatible() {
            return Err(ProcessingError::UnsupportedFormat {
                node: self.name().to_string(),
                format,
            });
        }
        if self.strength == 0.0 {
            return ctx.copy_of(input);
        }

        let algorithm = self.effective_algorithm();
        log::trace!("noise reduction: {:?} at strength {}", algorithm, self.strength);
        match algorithm {
            NoiseAlgorithm::Gaussian => {
                let blurred = ctx.kernels().gaussian_blur(input, self.gaussian_radius(), None)?;
                if ctx.pool().is_some() && !blurred.is_pooled() {
                    ctx.copy_of(&blurred)
                } else {
                    Ok(blurred)
                }
            }
            NoiseAlgorithm::Bilateral => bilateral(input, ctx, self.bilateral_radius(), self.strength),
            NoiseAlgorithm::NonLocalMeans => non_local_means(input, ctx, self.strength),
            NoiseAlgorithm::Wavelet => wavelet(input, ctx, self.strength),
            NoiseAlgorithm::MedianFilter => median(input, ctx, self.median_size()),
        }
    }

    fn parameters(&self) -> Vec<(&'static str, f64)> {
        let index = NoiseAlgorithm::all()
            .iter()
            .position(|a| *a == self.effective_algorithm())
            .unwrap_or(0);
        vec![
            ("algorithm", index as f64),
            ("strength", self.strength as f64),
            ("preserve_details", self.preserve_details as u8 as f64),
        ]
    }

    fn spatial_extent(&self) -> u32 {
        if self.strength == 0.0 {
            return 0;
        }
        match self.effective_algorithm() {
            NoiseAlgorithm::Gaussian => self.gaussian_radius(),
            NoiseAlgorithm::Bilateral => self.bilateral_radius() as u32,
            NoiseAlgorithm::NonLocalMeans => (NLM_PATCH + NLM_SEARCH) as u32,
            NoiseAlgorithm::Wavelet => 1,
            NoiseAlgorithm::MedianFilter => (self.median_size() / 2) as u32,
        }
    }

    fn clone_box(&self) -> Box<dyn ProcessingNode> {
        Box::new(self.clone())
    }
}

// ============================================================================
// Algorithms
// ============================================================================

/// Build an output by computing every pixel from `f(x, y, out_pixel)`.
fn map_pixels<F>(input: &PixelBuffer, ctx: &NodeContext, f: F) -> ProcessingResult<PixelBuffer>
where
    F: Fn(usize, usize, &mut [u8]) + Send + Sync,
{
    let channels = input.format().channels();
    let mut output = ctx.allocate_like(input)?;
    fill_rows(&mut output, |y, row| {
        for (x, px) in row.chunks_exact_mut(channels).enumerate() {
            f(x, y as usize, px);
        }
    });
    Ok(output)
}

fn sample(input: &PixelBuffer, x: usize, y: usize, c: usize, channels: usize) -> f32 {
    input.row(y as u32)[x * channels + c] as f32
}

fn bilateral(
    input: &PixelBuffer,
    ctx: &NodeContext,
    radius: usize,
    strength: f32,
) -> ProcessingResult<PixelBuffer> {
    let channels = input.format().channels();
    let colors = channels.min(3);
    let (width, height) = (input.width() as usize, input.height() as usize);
    let r = radius as isize;
    let sigma_s = (radius as f32 / 2.0).max(0.5);
    let sigma_r = 10.0 + 40.0 * strength;
    let range_denom = 2.0 * sigma_r * sigma_r;

    let spatial: Vec<f32> = (-r..=r)
        .flat_map(|dy| (-r..=r).map(move |dx| (dx, dy)))
        .map(|(dx, dy)| (-((dx * dx + dy * dy) as f32) / (2.0 * sigma_s * sigma_s)).exp())
        .collect();

    map_pixels(input, ctx, |x, y, out| {
        let center = input.pixel(x as u32, y as u32);
        let mut acc = [0.0f32; 3];
        let mut total = 0.0f32;
        let mut k = 0;
        for dy in -r..=r {
            let row = input.row(clamp_offset(y, dy, height) as u32);
            for dx in -r..=r {
                let sx = clamp_offset(x, dx, width) * channels;
                let neighbour = &row[sx..sx + channels];
                let d2: f32 = (0..colors)
                    .map(|c| {
                        let d = neighbour[c] as f32 - center[c] as f32;
                        d * d
                    })
                    .sum::<f32>()
                    / colors as f32;
                let w = spatial[k] * (-d2 / range_denom).exp();
                for c in 0..colors {
                    acc[c] += neighbour[c] as f32 * w;
                }
                total += w;
                k += 1;
            }
        }
        for c in 0..colors {
            out[c] = round_sample(acc[c] / total);
        }
        if channels == 4 {
            out[3] = center[3];
        }
    })
}

fn non_local_means(input: &PixelBuffer, ctx: &NodeContext, strength: f32) -> ProcessingResult<PixelBuffer> {
    let channels = input.format().channels();
    let colors = channels.min(3);
    let (width, height) = (input.width() as usize, input.height() as usize);
    let h = (strength * 30.0).max(1.0);
    let h2 = h * h;
    let patch_samples = ((2 * NLM_PATCH + 1) * (2 * NLM_PATCH + 1)) as f32 * colors as f32;

    map_pixels(input, ctx, |x, y, out| {
        let mut acc = [0.0f32; 3];
        let mut total = 0.0f32;
        for sy in -NLM_SEARCH..=NLM_SEARCH {
            let qy = clamp_offset(y, sy, height);
            for sx in -NLM_SEARCH..=NLM_SEARCH {
                let qx = clamp_offset(x, sx, width);
                let mut d2 = 0.0f32;
                for py in -NLM_PATCH..=NLM_PATCH {
                    let ay = clamp_offset(y, py, height);
                    let by = clamp_offset(qy, py, height);
                    for px in -NLM_PATCH..=NLM_PATCH {
                        let ax = clamp_offset(x, px, width);
                        let bx = clamp_offset(qx, px, width);
                        for c in 0..colors {
                            let d = sample(input, ax, ay, c, channels) - sample(input, bx, by, c, channels);
                            d2 += d * d;
                        }
                    }
                }
                let w = (-(d2 / patch_samples) / h2).exp();
                for c in 0..colors {
                    acc[c] += sample(input, qx, qy, c, channels) * w;
                }
                total += w;
            }
        }
        for c in 0..colors {
            out[c] = round_sample(acc[c] / total);
        }
        if channels == 4 {
            out[3] = input.pixel(x as u32, y as u32)[3];
        }
    })
}

fn soft_threshold(v: f32, t: f32) -> f32 {
    v.signum() * (v.abs() - t).max(0.0)
}

/// One-level Haar shrinkage on 2×2 blocks. A trailing odd row or column is
/// paired with a mirrored copy of itself, so it gets the one-dimensional
/// transform along the other axis instead of passing through untouched.
fn wavelet(input: &PixelBuffer, ctx: &NodeContext, strength: f32) -> ProcessingResult<PixelBuffer> {
    let channels = input.format().channels();
    let colors = channels.min(3);
    let (width, height) = (input.width() as usize, input.height() as usize);
    let threshold = strength * 20.0;
    let row_bytes = input.row_bytes();
    let mut data = input.to_packed_bytes();

    for by in (0..height).step_by(2) {
        let ny = (by + 1).min(height - 1);
        for bx in (0..width).step_by(2) {
            let nx = (bx + 1).min(width - 1);
            for c in 0..colors {
                let i00 = by * row_bytes + bx * channels + c;
                let i01 = by * row_bytes + nx * channels + c;
                let i10 = ny * row_bytes + bx * channels + c;
                let i11 = ny * row_bytes + nx * channels + c;
                let (p00, p01) = (data[i00] as f32, data[i01] as f32);
                let (p10, p11) = (data[i10] as f32, data[i11] as f32);

                let a = (p00 + p01 + p10 + p11) / 4.0;
                let h = soft_threshold((p00 - p01 + p10 - p11) / 4.0, threshold);
                let v = soft_threshold((p00 + p01 - p10 - p11) / 4.0, threshold);
                let d = soft_threshold((p00 - p01 - p10 + p11) / 4.0, threshold);

                // Mirrored samples alias their source; the detail terms that
                // would tell them apart are zero, so every write agrees.
                data[i00] = round_sample(a + h + v + d);
                data[i01] = round_sample(a - h + v - d);
                data[i10] = round_sample(a + h - v - d);
                data[i11] = round_sample(a - h - v + d);
            }
        }
    }

    let mut output = ctx.allocate_like(input)?;
    for (dst, src) in output.rows_mut().zip(data.chunks_exact(row_bytes)) {
        dst.copy_from_slice(src);
    }
    Ok(output)
}

fn median(input: &PixelBuffer, ctx: &NodeContext, size: usize) -> ProcessingResult<PixelBuffer> {
    let channels = input.format().channels();
    let colors = channels.min(3);
    let (width, height) = (input.width() as usize, input.height() as usize);
    let half = (size / 2) as isize;

    map_pixels(input, ctx, |x, y, out| {
        let mut window = [0u8; 25];
        for c in 0..colors {
            let mut n = 0;
            for dy in -half..=half {
                let row = input.row(clamp_offset(y, dy, height) as u32);
                for dx in -half..=half {
                    window[n] = row[clamp_offset(x, dx, width) * channels + c];
                    n += 1;
                }
            }
            let values = &mut window[..n];
            let mid = n / 2;
            out[c] = *values.select_nth_unstable(mid).1;
        }
        if channels == 4 {
            out[3] = input.pixel(x as u32, y as u32)[3];
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::format::PixelFormat;

    fn noisy_gray(width: u32, height: u32) -> PixelBuffer {
        let bytes: Vec<u8> = (0..width * height)
            .map(|i| if i % 7 == 3 { 220 } else { 100 })
            .collect();
        PixelBuffer::from_bytes(width, height, PixelFormat::Mono8, &bytes).unwrap()
    }

    fn spread(buffer: &PixelBuffer) -> i32 {
        let bytes = buffer.to_packed_bytes();
        let max = *bytes.iter().max().unwrap() as i32;
        let min = *bytes.iter().min().unwrap() as i32;
        max - min
    }

    #[test]
    fn test_zero_strength_is_identity() {
        let input = noisy_gray(9, 9);
        for &algorithm in NoiseAlgorithm::all() {
            let output = NoiseReductionNode::new(algorithm, 0.0)
                .process(&input, &NodeContext::new())
                .unwrap();
            assert_eq!(output, input, "{:?}", algorithm);
        }
    }

    #[test]
    fn test_every_algorithm_reduces_spread() {
        let input = noisy_gray(16, 16);
        for &algorithm in NoiseAlgorithm::all() {
            let output = NoiseReductionNode::new(algorithm, 1.0)
                .process(&input, &NodeContext::new())
                .unwrap();
            assert_eq!(output.dimensions(), input.dimensions());
            assert!(spread(&output) < spread(&input), "{:?}", algorithm);
        }
    }

    #[test]
    fn test_flat_image_is_unchanged() {
        let input = PixelBuffer::from_bytes(6, 6, PixelFormat::Rgb24, &[77u8; 108]).unwrap();
        for &algorithm in NoiseAlgorithm::all() {
            let output = NoiseReductionNode::new(algorithm, 0.7)
                .process(&input, &NodeContext::new())
                .unwrap();
            assert_eq!(output, input, "{:?}", algorithm);
        }
    }

    #[test]
    fn test_median_removes_impulse() {
        let mut bytes = vec![50u8; 25];
        bytes[12] = 255;
        let input = PixelBuffer::from_bytes(5, 5, PixelFormat::Mono8, &bytes).unwrap();
        let output = NoiseReductionNode::new(NoiseAlgorithm::MedianFilter, 0.2)
            .process(&input, &NodeContext::new())
            .unwrap();
        assert_eq!(output.to_packed_bytes(), vec![50u8; 25]);
    }

    #[test]
    fn test_alpha_preserved_by_edge_aware_filters() {
        let bytes: Vec<u8> = (0..16).flat_map(|i| [i * 10, 5, 200, 33]).collect();
        let input = PixelBuffer::from_bytes(4, 4, PixelFormat::Rgba32, &bytes).unwrap();
        for algorithm in [NoiseAlgorithm::Bilateral, NoiseAlgorithm::MedianFilter, NoiseAlgorithm::Wavelet] {
            let output = NoiseReductionNode::new(algorithm, 0.8)
                .process(&input, &NodeContext::new())
                .unwrap();
            assert!(output.rows().all(|row| row.chunks_exact(4).all(|px| px[3] == 33)));
        }
    }

    #[test]
    fn test_wavelet_smooths_trailing_column_and_row() {
        // 3x3: the last column and the last row have no partner.
        let bytes = [
            100, 110, 60, //
            104, 106, 66, //
            90, 96, 200,
        ];
        let input = PixelBuffer::from_bytes(3, 3, PixelFormat::Mono8, &bytes).unwrap();
        let output = NoiseReductionNode::new(NoiseAlgorithm::Wavelet, 1.0)
            .process(&input, &NodeContext::new())
            .unwrap();
        assert_eq!(output.row(0), &[105, 105, 63]);
        assert_eq!(output.row(1), &[105, 105, 63]);
        // The bottom-right corner pairs only with itself.
        assert_eq!(output.row(2), &[93, 93, 200]);
    }

    #[test]
    fn test_wavelet_on_odd_flat_image_is_unchanged() {
        let input = PixelBuffer::from_bytes(5, 3, PixelFormat::Rgb24, &[77u8; 45]).unwrap();
        let output = NoiseReductionNode::new(NoiseAlgorithm::Wavelet, 1.0)
            .process(&input, &NodeContext::new())
            .unwrap();
        assert_eq!(output, input);
    }

    #[test]
    fn test_preserve_details_upgrades_gaussian() {
        let node = NoiseReductionNode::new(NoiseAlgorithm::Gaussian, 0.5).with_preserve_details(true);
        assert_eq!(node.effective_algorithm(), NoiseAlgorithm::Bilateral);
        let node = NoiseReductionNode::new(NoiseAlgorithm::Wavelet, 0.5).with_preserve_details(true);
        assert_eq!(node.effective_algorithm(), NoiseAlgorithm::Wavelet);
    }

    #[test]
    fn test_strength_validation() {
        assert!(NoiseReductionNode::new(NoiseAlgorithm::Gaussian, 1.5).validate().is_err());
        assert!(NoiseReductionNode::new(NoiseAlgorithm::Gaussian, -0.1).validate().is_err());
        assert!(NoiseReductionNode::new(NoiseAlgorithm::MedianFilter, 1.0).validate().is_ok());
    }
}
