//! Color correction stage.
//!
//! Steps run in a fixed order, and each step is skipped entirely when its
//! parameters are neutral, so the default node reproduces its input exactly:
//!
//! 1. auto white balance (gray world)
//! 2. auto color restoration (1% / 99% per-channel stretch)
//! 3. 3×3 color matrix
//! 4. brightness
//! 5. contrast
//! 6. gamma (lookup table)
//! 7. saturation

use crate::core::buffer::PixelBuffer;
use crate::core::context::NodeContext;
use crate::core::error::{ProcessingError, ProcessingResult};
use crate::core::node::{NodeKind, ProcessingNode};
use crate::nodes::check_range;
use crate::simd::scalar::round_sample;
use rayon::prelude::*;

/// The identity color matrix.
pub const IDENTITY_MATRIX: [[f32; 3]; 3] = [[1.0, 0.0, 0.0], [0.0, 1.0, 0.0], [0.0, 0.0, 1.0]];

/// Fraction of samples clipped at each end by color restoration.
const STRETCH_CLIP: f64 = 0.01;

/// White balance, matrix, tone and saturation adjustments.
#[derive(Debug, Clone)]
pub struct ColorCorrectionNode {
    brightness: f32,
    contrast: f32,
    gamma: f32,
    saturation: f32,
    matrix: [[f32; 3]; 3],
    auto_white_balance: bool,
    auto_color_restoration: bool,
}

impl Default for ColorCorrectionNode {
    fn default() -> Self {
        Self {
            brightness: 1.0,
            contrast: 1.0,
            gamma: 1.0,
            saturation: 1.0,
            matrix: IDENTITY_MATRIX,
            auto_white_balance: false,
            auto_color_restoration: false,
        }
    }
}

impl ColorCorrectionNode {
    /// Neutral settings.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_brightness(mut self, factor: f32) -> Self {
        self.brightness = factor;
        self
    }

    pub fn with_contrast(mut self, factor: f32) -> Self {
        self.contrast = factor;
        self
    }

    pub fn with_gamma(mut self, gamma: f32) -> Self {
        self.gamma = gamma;
        self
    }

    pub fn with_saturation(mut self, factor: f32) -> Self {
        self.saturation = factor;
        self
    }

    /// Row-major matrix applied to `[r, g, b]`.
    pub fn with_matrix(mut self, matrix: [[f32; 3]; 3]) -> Self {
        self.matrix = matrix;
        self
    }

    pub fn with_auto_white_balance(mut self, enabled: bool) -> Self {
        self.auto_white_balance = enabled;
        self
    }

    pub fn with_auto_color_restoration(mut self, enabled: bool) -> Self {
        self.auto_color_restoration = enabled;
        self
    }

    /// Whether every step is neutral.
    pub fn is_identity(&self) -> bool {
        self.brightness == 1.0
            && self.contrast == 1.0
            && self.gamma == 1.0
            && self.saturation == 1.0
            && self.matrix == IDENTITY_MATRIX
            && !self.auto_white_balance
            && !self.auto_color_restoration
    }
}

impl ProcessingNode for ColorCorrectionNode {
    fn name(&self) -> &'static str {
        "color_correction"
    }

    fn kind(&self) -> NodeKind {
        NodeKind::ColorCorrection
    }

    fn validate(&self) -> ProcessingResult<()> {
        check_range("brightness", self.brightness, 0.0, 4.0)?;
        check_range("contrast", self.contrast, 0.0, 4.0)?;
        check_range("saturation", self.saturation, 0.0, 4.0)?;
        check_range("gamma", self.gamma, 0.1, 3.0)?;
        if self.matrix.iter().flatten().any(|v| !v.is_finite()) {
            return Err(ProcessingError::invalid("matrix", "entries must be finite"));
        }
        Ok(())
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
        let channels = format.channels();
        let color_channels = channels.min(3);
        let kernels = ctx.kernels();
        let mut output = ctx.copy_of(input)?;

        if self.auto_white_balance && color_channels == 3 {
            let means = channel_means(&output, channels);
            if means.iter().all(|&m| m > 0.0) {
                let gray = (means[0] + means[1] + means[2]) / 3.0;
                let gains = [
                    (gray / means[0]) as f32,
                    (gray / means[1]) as f32,
                    (gray / means[2]) as f32,
                ];
                log::trace!("white balance gains {:?}", gains);
                let luts = gains.map(|g| build_lut(|v| v * g));
                apply_luts(&mut output, channels, &luts);
            }
        }

        if self.auto_color_restoration {
            let luts: Vec<[u8; 256]> = channel_histograms(&output, channels)
                .iter()
                .take(color_channels)
                .map(|hist| {
                    let (lo, hi) = percentile_bounds(hist);
                    if hi > lo {
                        let scale = 255.0 / (hi - lo) as f32;
                        build_lut(|v| (v - lo as f32) * scale)
                    } else {
                        build_lut(|v| v)
                    }
                })
                .collect();
            apply_luts(&mut output, channels, &luts);
        }

        if self.matrix != IDENTITY_MATRIX && color_channels == 3 {
            let m = self.matrix;
            output.par_rows_mut().for_each(|row| {
                for px in row.chunks_exact_mut(channels) {
                    let (r, g, b) = (px[0] as f32, px[1] as f32, px[2] as f32);
                    px[0] = round_sample(m[0][0] * r + m[0][1] * g + m[0][2] * b);
                    px[1] = round_sample(m[1][0] * r + m[1][1] * g + m[1][2] * b);
                    px[2] = round_sample(m[2][0] * r + m[2][1] * g + m[2][2] * b);
                }
            });
        }

        if self.brightness != 1.0 {
            kernels.brightness_in_place(&mut output, self.brightness)?;
        }
        if self.contrast != 1.0 {
            kernels.contrast_in_place(&mut output, self.contrast)?;
        }
        if self.gamma != 1.0 {
            let inv = 1.0 / self.gamma;
            let lut = build_lut(|v| 255.0 * (v / 255.0).powf(inv));
            let luts = vec![lut; color_channels];
            apply_luts(&mut output, channels, &luts);
        }
        if self.saturation != 1.0 {
            kernels.saturation_in_place(&mut output, self.saturation)?;
        }
        Ok(output)
    }

    fn parameters(&self) -> Vec<(&'static str, f64)> {
        let mut params = vec![
            ("brightness", self.brightness as f64),
            ("contrast", self.contrast as f64),
            ("gamma", self.gamma as f64),
            ("saturation", self.saturation as f64),
            ("auto_white_balance", self.auto_white_balance as u8 as f64),
            ("auto_color_restoration", self.auto_color_restoration as u8 as f64),
        ];
        params.extend(self.matrix.iter().flatten().map(|&v| ("matrix", v as f64)));
        params
    }

    fn clone_box(&self) -> Box<dyn ProcessingNode> {
        Box::new(self.clone())
    }
}

// ============================================================================
// Helpers
// ============================================================================

fn build_lut(f: impl Fn(f32) -> f32) -> [u8; 256] {
    let mut lut = [0u8; 256];
    for (i, v) in lut.iter_mut().enumerate() {
        *v = round_sample(f(i as f32));
    }
    lut
}

/// Apply `luts[c]` to channel `c` for every channel that has a table.
fn apply_luts(buffer: &mut PixelBuffer, channels: usize, luts: &[[u8; 256]]) {
    buffer.par_rows_mut().for_each(|row| {
        for px in row.chunks_exact_mut(channels) {
            for (sample, lut) in px.iter_mut().zip(luts) {
                *sample = lut[*sample as usize];
            }
        }
    });
}

fn channel_histograms(buffer: &PixelBuffer, channels: usize) -> Vec<[u64; 256]> {
    let mut hists = vec![[0u64; 256]; channels];
    for row in buffer.rows() {
        for px in row.chunks_exact(channels) {
            for (hist, &v) in hists.iter_mut().zip(px) {
                hist[v as usize] += 1;
            }
        }
    }
    hists
}

fn channel_means(buffer: &PixelBuffer, channels: usize) -> [f64; 3] {
    let hists = channel_histograms(buffer, channels);
    let mut means = [0.0f64; 3];
    for (mean, hist) in means.iter_mut().zip(&hists) {
        let count: u64 = hist.iter().sum();
        let sum: u64 = hist.iter().enumerate().map(|(v, &n)| v as u64 * n).sum();
        *mean = sum as f64 / count.max(1) as f64;
    }
    means
}

/// Sample values at the low and high clip percentiles.
fn percentile_bounds(hist: &[u64; 256]) -> (u8, u8) {
    let total: u64 = hist.iter().sum();
    let clip = (total as f64 * STRETCH_CLIP) as u64;

    let mut seen = 0;
    let mut lo = 0u8;
    for (v, &n) in hist.iter().enumerate() {
        seen += n;
        if seen > clip {
            lo = v as u8;
            break;
        }
    }
    seen = 0;
    let mut hi = 255u8;
    for (v, &n) in hist.iter().enumerate().rev() {
        seen += n;
        if seen > clip {
            hi = v as u8;
            break;
        }
    }
    (lo, hi)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::format::PixelFormat;
    use proptest::prelude::*;

    fn rgba(pixels: &[[u8; 4]]) -> PixelBuffer {
        let bytes: Vec<u8> = pixels.iter().flatten().copied().collect();
        PixelBuffer::from_bytes(pixels.len() as u32, 1, PixelFormat::Rgba32, &bytes).unwrap()
    }

    #[test]
    fn test_brightness_and_contrast() {
        let input = rgba(&[[100, 200, 50, 7]]);
        let node = ColorCorrectionNode::new().with_brightness(2.0);
        let output = node.process(&input, &NodeContext::new()).unwrap();
        assert_eq!(output.row(0), &[200, 255, 100, 7]);

        let node = ColorCorrectionNode::new().with_contrast(0.0);
        let output = node.process(&input, &NodeContext::new()).unwrap();
        assert_eq!(output.row(0), &[128, 128, 128, 7]);
    }

    #[test]
    fn test_gamma_keeps_endpoints() {
        let input = rgba(&[[0, 255, 64, 1]]);
        let output = ColorCorrectionNode::new()
            .with_gamma(2.2)
            .process(&input, &NodeContext::new())
            .unwrap();
        let px = output.row(0);
        assert_eq!(px[0], 0);
        assert_eq!(px[1], 255);
        assert!(px[2] > 64);
        assert_eq!(px[3], 1);
    }

    #[test]
    fn test_matrix_swaps_channels() {
        let input = rgba(&[[10, 20, 30, 255]]);
        let swap = [[0.0, 0.0, 1.0], [0.0, 1.0, 0.0], [1.0, 0.0, 0.0]];
        let output = ColorCorrectionNode::new()
            .with_matrix(swap)
            .process(&input, &NodeContext::new())
            .unwrap();
        assert_eq!(output.row(0), &[30, 20, 10, 255]);
    }

    #[test]
    fn test_white_balance_neutralizes_cast() {
        let input = rgba(&[[200, 100, 100, 255], [100, 50, 50, 255]]);
        let output = ColorCorrectionNode::new()
            .with_auto_white_balance(true)
            .process(&input, &NodeContext::new())
            .unwrap();
        let px = output.pixel(0, 0);
        assert!((px[0] as i32 - px[1] as i32).abs() <= 1);
        assert!((px[1] as i32 - px[2] as i32).abs() <= 1);
    }

    #[test]
    fn test_color_restoration_stretches_range() {
        let bytes: Vec<u8> = (0..100).map(|i| 100 + (i % 50) as u8).collect();
        let input = PixelBuffer::from_bytes(100, 1, PixelFormat::Mono8, &bytes).unwrap();
        let output = ColorCorrectionNode::new()
            .with_auto_color_restoration(true)
            .process(&input, &NodeContext::new())
            .unwrap();
        let row = output.row(0);
        assert_eq!(*row.iter().min().unwrap(), 0);
        assert_eq!(*row.iter().max().unwrap(), 255);
    }

    #[test]
    fn test_validation_ranges() {
        assert!(ColorCorrectionNode::new().with_gamma(0.05).validate().is_err());
        assert!(ColorCorrectionNode::new().with_gamma(3.5).validate().is_err());
        assert!(ColorCorrectionNode::new().with_brightness(-1.0).validate().is_err());
        let mut bad = IDENTITY_MATRIX;
        bad[1][1] = f32::INFINITY;
        assert!(ColorCorrectionNode::new().with_matrix(bad).validate().is_err());
        assert!(ColorCorrectionNode::new().validate().is_ok());
    }

    #[test]
    fn test_rejects_raw_formats() {
        let input = PixelBuffer::new(2, 2, PixelFormat::Raw16BigEndian).unwrap();
        assert!(!ColorCorrectionNode::new().can_process(&input));
    }

    proptest! {
        #[test]
        fn prop_identity_settings_are_exact(
            bytes in proptest::collection::vec(any::<u8>(), 3 * 17 * 5),
        ) {
            let input = PixelBuffer::from_bytes(17, 5, PixelFormat::Rgb24, &bytes).unwrap();
            let node = ColorCorrectionNode::new();
            prop_assert!(node.is_identity());
            let output = node.process(&input, &NodeContext::new()).unwrap();
            prop_assert_eq!(output, input);
        }
    }
}
