//! Vectorized pixel kernels with runtime CPU-feature dispatch.
//!
//! Every kernel is expressed as row primitives on a [`KernelBackend`]. One
//! backend exists per [`SimdLevel`]; the widest level the CPU supports is
//! picked once at startup (AVX2, then SSE2, then NEON, then scalar).
//!
//! All backends share one rounding rule (clamp to `[0, 255]`, add 0.5,
//! truncate) and evaluate every arithmetic expression in the same order
//! without fused multiply-add, so their outputs are bit-identical. Vector
//! loops hand any remainder shorter than one vector to the scalar code.
//!
//! Supported buffer formats are Mono8, RGB24 and RGBA32. On RGBA32 the alpha
//! channel is left untouched by every kernel except the blur, which filters
//! all four channels.

pub mod scalar;

#[cfg(target_arch = "x86_64")]
pub mod x86;

#[cfg(target_arch = "aarch64")]
pub mod neon;

use crate::core::buffer::PixelBuffer;
use crate::core::error::{ProcessingError, ProcessingResult};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::OnceLock;

/// Buffers larger than this are processed with one rayon task per row.
pub const PARALLEL_THRESHOLD_BYTES: usize = 64 * 1024;

/// Largest accepted blur radius.
pub const MAX_BLUR_RADIUS: u32 = 64;

/// ITU-R BT.709 luma weights.
pub const LUMA_R: f32 = 0.2126;
pub const LUMA_G: f32 = 0.7152;
pub const LUMA_B: f32 = 0.0722;

/// Vector instruction set used by a kernel backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SimdLevel {
    /// 256-bit x86 integer and float lanes.
    Avx2,
    /// 128-bit x86 lanes.
    Sse2,
    /// 128-bit ARM lanes.
    Neon,
    /// Plain Rust, one sample at a time.
    Scalar,
}

impl SimdLevel {
    /// Widest level supported by this CPU, detected once and cached.
    pub fn detect() -> SimdLevel {
        static LEVEL: OnceLock<SimdLevel> = OnceLock::new();
        *LEVEL.get_or_init(|| {
            let level = Self::query_cpu();
            log::debug!("SIMD capability detection selected {}", level);
            level
        })
    }

    fn query_cpu() -> SimdLevel {
        SimdLevel::all()
            .iter()
            .copied()
            .find(SimdLevel::is_supported)
            .unwrap_or(SimdLevel::Scalar)
    }

    /// Every level, widest first.
    pub fn all() -> &'static [SimdLevel] {
        &[
            SimdLevel::Avx2,
            SimdLevel::Sse2,
            SimdLevel::Neon,
            SimdLevel::Scalar,
        ]
    }

    /// Levels usable on this machine, widest first.
    pub fn available() -> Vec<SimdLevel> {
        Self::all().iter().copied().filter(Self::is_supported).collect()
    }

    /// Whether the running CPU can execute this level.
    pub fn is_supported(&self) -> bool {
        match self {
            #[cfg(target_arch = "x86_64")]
            SimdLevel::Avx2 => is_x86_feature_detected!("avx2"),
            #[cfg(target_arch = "x86_64")]
            SimdLevel::Sse2 => is_x86_feature_detected!("sse2"),
            #[cfg(target_arch = "aarch64")]
            SimdLevel::Neon => std::arch::is_aarch64_feature_detected!("neon"),
            SimdLevel::Scalar => true,
            #[allow(unreachable_patterns)]
            _ => false,
        }
    }

    /// Register width in bytes.
    pub fn vector_bytes(&self) -> usize {
        match self {
            SimdLevel::Avx2 => 32,
            SimdLevel::Sse2 | SimdLevel::Neon => 16,
            SimdLevel::Scalar => 1,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            SimdLevel::Avx2 => "avx2",
            SimdLevel::Sse2 => "sse2",
            SimdLevel::Neon => "neon",
            SimdLevel::Scalar => "scalar",
        }
    }
}

impl fmt::Display for SimdLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Row primitives implemented once per instruction set.
///
/// `row` slices hold whole pixels of `channels` interleaved 8-bit samples.
/// When `channels == 4` the fourth sample is alpha.
pub trait KernelBackend: Send + Sync {
    /// Instruction set this backend uses.
    fn level(&self) -> SimdLevel;

    /// `v = round(v * scale + offset)` on every color sample.
    fn affine_row(&self, row: &mut [u8], channels: usize, scale: f32, offset: f32);

    /// Replace R, G and B with BT.709 luma. No-op for one channel.
    fn grayscale_row(&self, row: &mut [u8], channels: usize);

    /// Move R, G and B away from (factor > 1) or toward (factor < 1) luma.
    fn saturation_row(&self, row: &mut [u8], channels: usize, factor: f32);

    /// Convolve one row horizontally with clamped edges into `dst`
    /// (same sample count as `src`).
    fn blur_row_horizontal(&self, src: &[u8], dst: &mut [f32], channels: usize, kernel: &[f32]);

    /// Combine `kernel.len()` horizontally blurred rows into one output row.
    fn blur_row_vertical(&self, rows: &[&[f32]], dst: &mut [u8], kernel: &[f32]);
}

fn backend_for(level: SimdLevel) -> &'static dyn KernelBackend {
    match level {
        #[cfg(target_arch = "x86_64")]
        SimdLevel::Avx2 => &x86::Avx2Backend,
        #[cfg(target_arch = "x86_64")]
        SimdLevel::Sse2 => &x86::Sse2Backend,
        #[cfg(target_arch = "aarch64")]
        SimdLevel::Neon => &neon::NeonBackend,
        _ => &scalar::ScalarBackend,
    }
}

/// Build a normalized 1-D Gaussian kernel of `2 * radius + 1` taps.
///
/// A non-positive `sigma` means `radius / 3`.
pub fn gaussian_kernel(radius: u32, sigma: f32) -> Vec<f32> {
    if radius == 0 {
        return vec![1.0];
    }
    let sigma = if sigma > 0.0 {
        sigma
    } else {
        (radius as f32 / 3.0).max(0.1)
    };
    let denom = 2.0 * sigma * sigma;
    let r = radius as i32;
    let mut weights: Vec<f32> = (-r..=r)
        .map(|i| (-((i * i) as f32) / denom).exp())
        .collect();
    let sum: f32 = weights.iter().sum();
    for w in &mut weights {
        *w /= sum;
    }
    weights
}

/// Kernel dispatcher bound to one backend.
///
/// The dispatcher is `Copy` and holds no state besides the backend, so every
/// kernel is a pure function of its inputs.
#[derive(Clone, Copy)]
pub struct SimdKernels {
    backend: &'static dyn KernelBackend,
}

impl SimdKernels {
    /// Use the widest backend the CPU supports.
    pub fn detect() -> Self {
        Self::with_level(SimdLevel::detect())
    }

    /// Use the scalar backend.
    pub fn scalar() -> Self {
        Self {
            backend: &scalar::ScalarBackend,
        }
    }

    /// Use a specific backend, falling back to scalar if the CPU lacks it.
    pub fn with_level(level: SimdLevel) -> Self {
        if !level.is_supported() {
            log::debug!("{} not supported on this CPU, using scalar kernels", level);
            return Self::scalar();
        }
        Self {
            backend: backend_for(level),
        }
    }

    /// Level of the selected backend.
    pub fn level(&self) -> SimdLevel {
        self.backend.level()
    }

    /// The selected backend.
    pub fn backend(&self) -> &'static dyn KernelBackend {
        self.backend
    }

    // ========================================================================
    // In-place kernels
    // ========================================================================

    /// `out = clamp(in * factor)` on color channels.
    pub fn brightness_in_place(&self, buffer: &mut PixelBuffer, factor: f32) -> ProcessingResult<()> {
        check_factor("brightness", factor)?;
        self.affine_in_place(buffer, factor, 0.0)
    }

    /// `out = clamp((in - 128) * factor + 128)` on color channels.
    pub fn contrast_in_place(&self, buffer: &mut PixelBuffer, factor: f32) -> ProcessingResult<()> {
        check_factor("contrast", factor)?;
        self.affine_in_place(buffer, factor, 128.0 - 128.0 * factor)
    }

    /// Scale chroma around BT.709 luma. Mono8 input is left unchanged.
    pub fn saturation_in_place(&self, buffer: &mut PixelBuffer, factor: f32) -> ProcessingResult<()> {
        check_factor("saturation", factor)?;
        let channels = kernel_channels(buffer, "saturation")?;
        let backend = self.backend;
        for_each_row(buffer, |row| backend.saturation_row(row, channels, factor));
        Ok(())
    }

    /// Replace color with BT.709 luma, keeping the format (and alpha).
    pub fn grayscale_in_place(&self, buffer: &mut PixelBuffer) -> ProcessingResult<()> {
        let channels = kernel_channels(buffer, "grayscale")?;
        let backend = self.backend;
        for_each_row(buffer, |row| backend.grayscale_row(row, channels));
        Ok(())
    }

    /// `out = clamp(in * scale + offset)` on color channels.
    pub fn affine_in_place(
        &self,
        buffer: &mut PixelBuffer,
        scale: f32,
        offset: f32,
    ) -> ProcessingResult<()> {
        if !offset.is_finite() {
            return Err(ProcessingError::invalid("offset", "must be finite"));
        }
        let channels = kernel_channels(buffer, "affine")?;
        let backend = self.backend;
        for_each_row(buffer, |row| backend.affine_row(row, channels, scale, offset));
        Ok(())
    }

    // ========================================================================
    // Pure kernels
    // ========================================================================

    /// Brightness adjustment returning a new buffer.
    pub fn brightness_adjust(&self, input: &PixelBuffer, factor: f32) -> ProcessingResult<PixelBuffer> {
        let mut output = input.clone();
        self.brightness_in_place(&mut output, factor)?;
        Ok(output)
    }

    /// Contrast adjustment returning a new buffer.
    pub fn contrast_adjust(&self, input: &PixelBuffer, factor: f32) -> ProcessingResult<PixelBuffer> {
        let mut output = input.clone();
        self.contrast_in_place(&mut output, factor)?;
        Ok(output)
    }

    /// Saturation adjustment returning a new buffer.
    pub fn saturation_adjust(&self, input: &PixelBuffer, factor: f32) -> ProcessingResult<PixelBuffer> {
        let mut output = input.clone();
        self.saturation_in_place(&mut output, factor)?;
        Ok(output)
    }

    /// Grayscale conversion returning a new buffer of the same format.
    pub fn to_grayscale(&self, input: &PixelBuffer) -> ProcessingResult<PixelBuffer> {
        let mut output = input.clone();
        self.grayscale_in_place(&mut output)?;
        Ok(output)
    }

    /// Separable Gaussian blur, horizontal pass then vertical pass.
    ///
    /// `sigma` defaults to `radius / 3`. Edges are clamped.
    pub fn gaussian_blur(
        &self,
        input: &PixelBuffer,
        radius: u32,
        sigma: Option<f32>,
    ) -> ProcessingResult<PixelBuffer> {
        let channels = kernel_channels(input, "gaussian blur")?;
        if radius > MAX_BLUR_RADIUS {
            return Err(ProcessingError::invalid(
                "radius",
                format!("{} exceeds the maximum of {}", radius, MAX_BLUR_RADIUS),
            ));
        }
        if let Some(s) = sigma {
            if !s.is_finite() || s < 0.0 {
                return Err(ProcessingError::invalid("sigma", "must be finite and non-negative"));
            }
        }
        if radius == 0 {
            return Ok(input.clone());
        }

        let kernel = gaussian_kernel(radius, sigma.unwrap_or(0.0));
        let backend = self.backend;
        let row_len = input.row_bytes();
        let height = input.height() as usize;
        let parallel = input.byte_size() > PARALLEL_THRESHOLD_BYTES;

        let mut horizontal = Vec::new();
        horizontal
            .try_reserve_exact(row_len * height)
            .map_err(|_| ProcessingError::AllocationFailure {
                requested: row_len * height * std::mem::size_of::<f32>(),
                alignment: std::mem::align_of::<f32>(),
            })?;
        horizontal.resize(row_len * height, 0.0f32);

        let blur_h = |(y, dst): (usize, &mut [f32])| {
            backend.blur_row_horizontal(input.row(y as u32), dst, channels, &kernel)
        };
        if parallel {
            horizontal.par_chunks_mut(row_len).enumerate().for_each(blur_h);
        } else {
            horizontal.chunks_mut(row_len).enumerate().for_each(blur_h);
        }

        let r = radius as usize;
        let horizontal = &horizontal;
        let blur_v = |(y, dst): (usize, &mut [u8])| {
            let rows: Vec<&[f32]> = (0..kernel.len())
                .map(|k| {
                    let sy = (y + k).saturating_sub(r).min(height - 1);
                    &horizontal[sy * row_len..(sy + 1) * row_len]
                })
                .collect();
            backend.blur_row_vertical(&rows, dst, &kernel);
        };

        let mut output = input.empty_like()?;
        if parallel {
            output.par_rows_mut().enumerate().for_each(blur_v);
        } else {
            output.rows_mut().enumerate().for_each(blur_v);
        }
        Ok(output)
    }
}

impl Default for SimdKernels {
    fn default() -> Self {
        Self::detect()
    }
}

impl fmt::Debug for SimdKernels {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SimdKernels")
            .field("level", &self.level())
            .finish()
    }
}

fn check_factor(parameter: &str, factor: f32) -> ProcessingResult<()> {
    if !factor.is_finite() || factor < 0.0 {
        return Err(ProcessingError::invalid(
            parameter,
            format!("factor {} must be finite and non-negative", factor),
        ));
    }
    Ok(())
}

fn kernel_channels(buffer: &PixelBuffer, kernel: &str) -> ProcessingResult<usize> {
    let format = buffer.format();
    if !format.is_kernel_compatible() {
        return Err(ProcessingError::UnsupportedFormat {
            node: kernel.to_string(),
            format,
        });
    }
    Ok(format.channels())
}

fn for_each_row<F>(buffer: &mut PixelBuffer, op: F)
where
    F: Fn(&mut [u8]) + Send + Sync,
{
    if buffer.byte_size() > PARALLEL_THRESHOLD_BYTES {
        buffer.par_rows_mut().for_each(op);
    } else {
        buffer.rows_mut().for_each(op);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::format::PixelFormat;
    use proptest::prelude::*;

    fn noise(width: u32, height: u32, format: PixelFormat, seed: u32) -> PixelBuffer {
        let len = format.row_bytes(width) * height as usize;
        let mut state = seed.wrapping_mul(2_654_435_761).wrapping_add(1);
        let bytes: Vec<u8> = (0..len)
            .map(|_| {
                state ^= state << 13;
                state ^= state >> 17;
                state ^= state << 5;
                (state >> 24) as u8
            })
            .collect();
        PixelBuffer::from_bytes(width, height, format, &bytes).unwrap()
    }

    fn max_channel_diff(a: &PixelBuffer, b: &PixelBuffer) -> u8 {
        a.rows()
            .zip(b.rows())
            .flat_map(|(ra, rb)| ra.iter().zip(rb).map(|(x, y)| x.abs_diff(*y)))
            .max()
            .unwrap_or(0)
    }

    fn run_all(kernels: &SimdKernels, input: &PixelBuffer) -> Vec<PixelBuffer> {
        vec![
            kernels.brightness_adjust(input, 1.37).unwrap(),
            kernels.contrast_adjust(input, 0.6).unwrap(),
            kernels.saturation_adjust(input, 1.8).unwrap(),
            kernels.to_grayscale(input).unwrap(),
            kernels.gaussian_blur(input, 2, None).unwrap(),
        ]
    }

    fn assert_backends_agree(width: u32, height: u32) {
        let scalar = SimdKernels::scalar();
        for format in [PixelFormat::Mono8, PixelFormat::Rgb24, PixelFormat::Rgba32] {
            let input = noise(width, height, format, width ^ height);
            let expected = run_all(&scalar, &input);
            for level in SimdLevel::available() {
                let actual = run_all(&SimdKernels::with_level(level), &input);
                for (kernel, (e, a)) in expected.iter().zip(&actual).enumerate() {
                    assert!(
                        max_channel_diff(e, a) <= 1,
                        "kernel {} on {} differs for {} at {}x{}",
                        kernel,
                        level,
                        format,
                        width,
                        height
                    );
                }
            }
        }
    }

    #[test]
    fn test_detect_is_supported() {
        let level = SimdLevel::detect();
        assert!(level.is_supported());
        assert!(SimdLevel::available().contains(&SimdLevel::Scalar));
        assert_eq!(SimdKernels::detect().level(), level);
    }

    #[test]
    fn test_unsupported_level_falls_back() {
        for level in SimdLevel::all() {
            let kernels = SimdKernels::with_level(*level);
            if level.is_supported() {
                assert_eq!(kernels.level(), *level);
            } else {
                assert_eq!(kernels.level(), SimdLevel::Scalar);
            }
        }
    }

    #[test]
    fn test_grayscale_scenario() {
        let mut input = PixelBuffer::new(4, 4, PixelFormat::Rgba32).unwrap();
        input.set_pixel(0, 0, &[255, 0, 0, 255]);
        for level in SimdLevel::available() {
            let output = SimdKernels::with_level(level).to_grayscale(&input).unwrap();
            assert_eq!(output.pixel(0, 0), &[54, 54, 54, 255]);
        }
    }

    #[test]
    fn test_brightness_keeps_alpha_and_clamps() {
        let input = PixelBuffer::from_bytes(1, 1, PixelFormat::Rgba32, &[100, 200, 10, 77]).unwrap();
        let output = SimdKernels::detect().brightness_adjust(&input, 1.5).unwrap();
        assert_eq!(output.pixel(0, 0), &[150, 255, 15, 77]);
    }

    #[test]
    fn test_contrast_pivot() {
        let input = PixelBuffer::from_bytes(3, 1, PixelFormat::Mono8, &[128, 0, 255]).unwrap();
        let output = SimdKernels::detect().contrast_adjust(&input, 0.5).unwrap();
        assert_eq!(output.row(0), &[128, 64, 192]);
    }

    #[test]
    fn test_rejects_unsupported_format_and_bad_factor() {
        let yuv = PixelBuffer::new(4, 2, PixelFormat::Yuv422).unwrap();
        let kernels = SimdKernels::detect();
        assert!(matches!(
            kernels.to_grayscale(&yuv),
            Err(ProcessingError::UnsupportedFormat { .. })
        ));

        let rgb = PixelBuffer::new(4, 2, PixelFormat::Rgb24).unwrap();
        assert!(kernels.brightness_adjust(&rgb, f32::NAN).is_err());
        assert!(kernels.contrast_adjust(&rgb, -1.0).is_err());
        assert!(kernels.gaussian_blur(&rgb, MAX_BLUR_RADIUS + 1, None).is_err());
    }

    #[test]
    fn test_gaussian_kernel_is_normalized() {
        let kernel = gaussian_kernel(4, 0.0);
        assert_eq!(kernel.len(), 9);
        let sum: f32 = kernel.iter().sum();
        assert!((sum - 1.0).abs() < 1e-5);
        assert!(kernel[4] > kernel[3] && kernel[3] > kernel[0]);
        assert_eq!(gaussian_kernel(0, 1.0), vec![1.0]);
    }

    #[test]
    fn test_blur_preserves_constant_image() {
        let input = PixelBuffer::from_bytes(9, 7, PixelFormat::Rgb24, &[90; 9 * 7 * 3]).unwrap();
        let output = SimdKernels::detect().gaussian_blur(&input, 3, Some(1.5)).unwrap();
        assert_eq!(output, input);
    }

    #[test]
    fn test_backends_agree_on_single_pixel() {
        assert_backends_agree(1, 1);
    }

    #[test]
    fn test_backends_agree_on_odd_width() {
        assert_backends_agree(37, 5);
    }

    #[test]
    fn test_backends_agree_on_multi_megapixel() {
        assert_backends_agree(1600, 1300);
    }

    proptest! {
        #[test]
        fn prop_brightness_round_trip(factor in 0.5f32..=2.0, seed in any::<u32>()) {
            let limit = (255.0 / factor).floor() as u32;
            let base = noise(17, 3, PixelFormat::Rgb24, seed);
            let bytes: Vec<u8> = base
                .to_packed_bytes()
                .iter()
                .map(|&v| (v as u32 * limit / 255) as u8)
                .collect();
            let input = PixelBuffer::from_bytes(17, 3, PixelFormat::Rgb24, &bytes).unwrap();

            let kernels = SimdKernels::detect();
            let once = kernels.brightness_adjust(&input, factor).unwrap();
            let back = kernels.brightness_adjust(&once, 1.0 / factor).unwrap();
            prop_assert!(max_channel_diff(&input, &back) <= 2);
        }

        #[test]
        fn prop_identity_factors_are_exact(seed in any::<u32>(), width in 1u32..70) {
            let input = noise(width, 2, PixelFormat::Rgba32, seed);
            let kernels = SimdKernels::detect();
            prop_assert_eq!(&kernels.brightness_adjust(&input, 1.0).unwrap(), &input);
            prop_assert_eq!(&kernels.contrast_adjust(&input, 1.0).unwrap(), &input);
            prop_assert_eq!(&kernels.saturation_adjust(&input, 1.0).unwrap(), &input);
        }
    }
}
