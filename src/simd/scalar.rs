//! Scalar kernels: the reference every vector backend must match, and the
//! tail handler for remainders shorter than one vector.

use super::{KernelBackend, SimdLevel, LUMA_B, LUMA_G, LUMA_R};

/// Portable backend available on every CPU.
pub struct ScalarBackend;

impl KernelBackend for ScalarBackend {
    fn level(&self) -> SimdLevel {
        SimdLevel::Scalar
    }

    fn affine_row(&self, row: &mut [u8], channels: usize, scale: f32, offset: f32) {
        affine_row(row, channels, scale, offset);
    }

    fn grayscale_row(&self, row: &mut [u8], channels: usize) {
        grayscale_row(row, channels);
    }

    fn saturation_row(&self, row: &mut [u8], channels: usize, factor: f32) {
        saturation_row(row, channels, factor);
    }

    fn blur_row_horizontal(&self, src: &[u8], dst: &mut [f32], channels: usize, kernel: &[f32]) {
        blur_row_horizontal(src, dst, channels, kernel, 0);
    }

    fn blur_row_vertical(&self, rows: &[&[f32]], dst: &mut [u8], kernel: &[f32]) {
        blur_row_vertical(rows, dst, kernel, 0);
    }
}

/// Clamp to `[0, 255]`, add 0.5, truncate.
#[inline]
pub fn round_sample(value: f32) -> u8 {
    (value.clamp(0.0, 255.0) + 0.5) as u8
}

/// BT.709 luma, evaluated left to right.
#[inline]
pub fn luma(r: f32, g: f32, b: f32) -> f32 {
    r * LUMA_R + g * LUMA_G + b * LUMA_B
}

pub fn affine_row(row: &mut [u8], channels: usize, scale: f32, offset: f32) {
    if channels == 4 {
        for px in row.chunks_exact_mut(4) {
            for sample in &mut px[..3] {
                *sample = round_sample(*sample as f32 * scale + offset);
            }
        }
    } else {
        for sample in row.iter_mut() {
            *sample = round_sample(*sample as f32 * scale + offset);
        }
    }
}

pub fn grayscale_row(row: &mut [u8], channels: usize) {
    if channels < 3 {
        return;
    }
    for px in row.chunks_exact_mut(channels) {
        let gray = round_sample(luma(px[0] as f32, px[1] as f32, px[2] as f32));
        px[..3].fill(gray);
    }
}

pub fn saturation_row(row: &mut [u8], channels: usize, factor: f32) {
    if channels < 3 {
        return;
    }
    for px in row.chunks_exact_mut(channels) {
        let gray = luma(px[0] as f32, px[1] as f32, px[2] as f32);
        for sample in &mut px[..3] {
            *sample = round_sample(gray + (*sample as f32 - gray) * factor);
        }
    }
}

/// Horizontal pass for pixels `first_pixel..` of the row.
pub fn blur_row_horizontal(
    src: &[u8],
    dst: &mut [f32],
    channels: usize,
    kernel: &[f32],
    first_pixel: usize,
) {
    let width = src.len() / channels;
    let radius = kernel.len() / 2;
    for x in first_pixel..width {
        for c in 0..channels {
            let mut acc = 0.0f32;
            for (k, &w) in kernel.iter().enumerate() {
                let sx = (x + k).saturating_sub(radius).min(width - 1);
                acc += src[sx * channels + c] as f32 * w;
            }
            dst[x * channels + c] = acc;
        }
    }
}

/// Vertical pass for samples `first..` of the row.
pub fn blur_row_vertical(rows: &[&[f32]], dst: &mut [u8], kernel: &[f32], first: usize) {
    for i in first..dst.len() {
        let mut acc = 0.0f32;
        for (row, &w) in rows.iter().zip(kernel) {
            acc += row[i] * w;
        }
        dst[i] = round_sample(acc);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rounding_rule() {
        assert_eq!(round_sample(-3.0), 0);
        assert_eq!(round_sample(54.213), 54);
        assert_eq!(round_sample(54.5), 55);
        assert_eq!(round_sample(300.0), 255);
    }

    #[test]
    fn test_saturation_zero_is_gray() {
        let mut row = [200, 100, 50, 9];
        saturation_row(&mut row, 4, 0.0);
        let gray = round_sample(luma(200.0, 100.0, 50.0));
        assert_eq!(row, [gray, gray, gray, 9]);
    }

    #[test]
    fn test_horizontal_clamps_edges() {
        let src = [10u8, 20, 30];
        let mut dst = [0.0f32; 3];
        blur_row_horizontal(&src, &mut dst, 1, &[0.25, 0.5, 0.25], 0);
        assert_eq!(dst, [12.5, 20.0, 27.5]);
    }
}
