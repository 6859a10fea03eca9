//! NEON backend for aarch64.

use super::scalar;
use super::{KernelBackend, SimdLevel, LUMA_B, LUMA_G, LUMA_R};
use std::arch::aarch64::*;

const ALPHA_MASK: u32 = 0xFF00_0000;

/// 128-bit ARM backend. Only handed out after capability detection confirms NEON.
pub struct NeonBackend;

impl KernelBackend for NeonBackend {
    fn level(&self) -> SimdLevel {
        SimdLevel::Neon
    }

    fn affine_row(&self, row: &mut [u8], channels: usize, scale: f32, offset: f32) {
        // SAFETY: NEON support was verified before this backend was selected.
        let done = unsafe { neon_affine(row, channels == 4, scale, offset) };
        scalar::affine_row(&mut row[done..], channels, scale, offset);
    }

    fn grayscale_row(&self, row: &mut [u8], channels: usize) {
        let done = if channels == 4 {
            // SAFETY: see affine_row.
            unsafe { neon_grayscale_rgba(row) }
        } else {
            0
        };
        scalar::grayscale_row(&mut row[done..], channels);
    }

    fn saturation_row(&self, row: &mut [u8], channels: usize, factor: f32) {
        let done = if channels == 4 {
            // SAFETY: see affine_row.
            unsafe { neon_saturation_rgba(row, factor) }
        } else {
            0
        };
        scalar::saturation_row(&mut row[done..], channels, factor);
    }

    fn blur_row_horizontal(&self, src: &[u8], dst: &mut [f32], channels: usize, kernel: &[f32]) {
        if channels == 4 {
            // SAFETY: see affine_row.
            unsafe { neon_blur_horizontal_rgba(src, dst, kernel) }
        } else {
            scalar::blur_row_horizontal(src, dst, channels, kernel, 0);
        }
    }

    fn blur_row_vertical(&self, rows: &[&[f32]], dst: &mut [u8], kernel: &[f32]) {
        // SAFETY: see affine_row.
        let done = unsafe { neon_blur_vertical(rows, dst, kernel) };
        scalar::blur_row_vertical(rows, dst, kernel, done);
    }
}

#[inline]
#[target_feature(enable = "neon")]
unsafe fn neon_round(value: float32x4_t) -> uint32x4_t {
    let clamped = vminq_f32(vmaxq_f32(value, vdupq_n_f32(0.0)), vdupq_n_f32(255.0));
    vcvtq_u32_f32(vaddq_f32(clamped, vdupq_n_f32(0.5)))
}

#[inline]
#[target_feature(enable = "neon")]
unsafe fn neon_luma(r: float32x4_t, g: float32x4_t, b: float32x4_t) -> float32x4_t {
    let rg = vaddq_f32(
        vmulq_f32(r, vdupq_n_f32(LUMA_R)),
        vmulq_f32(g, vdupq_n_f32(LUMA_G)),
    );
    vaddq_f32(rg, vmulq_f32(b, vdupq_n_f32(LUMA_B)))
}

#[inline]
#[target_feature(enable = "neon")]
unsafe fn neon_affine4(lanes: uint32x4_t, scale: float32x4_t, offset: float32x4_t) -> uint16x4_t {
    let value = vaddq_f32(vmulq_f32(vcvtq_f32_u32(lanes), scale), offset);
    vmovn_u32(neon_round(value))
}

#[inline]
#[target_feature(enable = "neon")]
unsafe fn neon_split_rgba(px: uint32x4_t) -> (float32x4_t, float32x4_t, float32x4_t, uint32x4_t) {
    let byte = vdupq_n_u32(0xFF);
    let r = vcvtq_f32_u32(vandq_u32(px, byte));
    let g = vcvtq_f32_u32(vandq_u32(vshrq_n_u32::<8>(px), byte));
    let b = vcvtq_f32_u32(vandq_u32(vshrq_n_u32::<16>(px), byte));
    let alpha = vandq_u32(px, vdupq_n_u32(ALPHA_MASK));
    (r, g, b, alpha)
}

#[inline]
#[target_feature(enable = "neon")]
unsafe fn neon_join_rgba(r: uint32x4_t, g: uint32x4_t, b: uint32x4_t, alpha: uint32x4_t) -> uint8x16_t {
    let rg = vorrq_u32(r, vshlq_n_u32::<8>(g));
    let ba = vorrq_u32(vshlq_n_u32::<16>(b), alpha);
    vreinterpretq_u8_u32(vorrq_u32(rg, ba))
}

#[target_feature(enable = "neon")]
unsafe fn neon_affine(row: &mut [u8], keep_alpha: bool, scale: f32, offset: f32) -> usize {
    let len = row.len() - row.len() % 16;
    let ptr = row.as_mut_ptr();
    let scale = vdupq_n_f32(scale);
    let offset = vdupq_n_f32(offset);
    let mask = vreinterpretq_u8_u32(vdupq_n_u32(ALPHA_MASK));

    let mut i = 0;
    while i < len {
        let p = ptr.add(i);
        let src = vld1q_u8(p);
        let lo = vmovl_u8(vget_low_u8(src));
        let hi = vmovl_u8(vget_high_u8(src));
        let a = neon_affine4(vmovl_u16(vget_low_u16(lo)), scale, offset);
        let b = neon_affine4(vmovl_u16(vget_high_u16(lo)), scale, offset);
        let c = neon_affine4(vmovl_u16(vget_low_u16(hi)), scale, offset);
        let d = neon_affine4(vmovl_u16(vget_high_u16(hi)), scale, offset);
        let packed = vcombine_u8(vmovn_u16(vcombine_u16(a, b)), vmovn_u16(vcombine_u16(c, d)));
        let out = if keep_alpha {
            vbslq_u8(mask, src, packed)
        } else {
            packed
        };
        vst1q_u8(p, out);
        i += 16;
    }
    len
}

#[target_feature(enable = "neon")]
unsafe fn neon_grayscale_rgba(row: &mut [u8]) -> usize {
    let len = row.len() - row.len() % 16;
    let ptr = row.as_mut_ptr();
    let mut i = 0;
    while i < len {
        let p = ptr.add(i);
        let (r, g, b, alpha) = neon_split_rgba(vreinterpretq_u32_u8(vld1q_u8(p)));
        let gray = neon_round(neon_luma(r, g, b));
        vst1q_u8(p, neon_join_rgba(gray, gray, gray, alpha));
        i += 16;
    }
    len
}

#[target_feature(enable = "neon")]
unsafe fn neon_saturation_rgba(row: &mut [u8], factor: f32) -> usize {
    let len = row.len() - row.len() % 16;
    let ptr = row.as_mut_ptr();
    let factor = vdupq_n_f32(factor);
    let mut i = 0;
    while i < len {
        let p = ptr.add(i);
        let (r, g, b, alpha) = neon_split_rgba(vreinterpretq_u32_u8(vld1q_u8(p)));
        let gray = neon_luma(r, g, b);
        let r = neon_round(vaddq_f32(gray, vmulq_f32(vsubq_f32(r, gray), factor)));
        let g = neon_round(vaddq_f32(gray, vmulq_f32(vsubq_f32(g, gray), factor)));
        let b = neon_round(vaddq_f32(gray, vmulq_f32(vsubq_f32(b, gray), factor)));
        vst1q_u8(p, neon_join_rgba(r, g, b, alpha));
        i += 16;
    }
    len
}

#[target_feature(enable = "neon")]
unsafe fn neon_blur_horizontal_rgba(src: &[u8], dst: &mut [f32], kernel: &[f32]) {
    let width = src.len() / 4;
    let radius = kernel.len() / 2;
    let mut lanes = [0.0f32; 4];
    for x in 0..width {
        let mut acc = vdupq_n_f32(0.0);
        for (k, &w) in kernel.iter().enumerate() {
            let s = (x + k).saturating_sub(radius).min(width - 1) * 4;
            let px = [
                src[s] as f32,
                src[s + 1] as f32,
                src[s + 2] as f32,
                src[s + 3] as f32,
            ];
            acc = vaddq_f32(acc, vmulq_f32(vld1q_f32(px.as_ptr()), vdupq_n_f32(w)));
        }
        vst1q_f32(lanes.as_mut_ptr(), acc);
        dst[x * 4..x * 4 + 4].copy_from_slice(&lanes);
    }
}

#[target_feature(enable = "neon")]
unsafe fn neon_blur_vertical(rows: &[&[f32]], dst: &mut [u8], kernel: &[f32]) -> usize {
    let len = dst.len() - dst.len() % 4;
    let mut words = [0u32; 4];
    let mut i = 0;
    while i < len {
        let mut acc = vdupq_n_f32(0.0);
        for (row, &w) in rows.iter().zip(kernel) {
            let v = vld1q_f32(row[i..i + 4].as_ptr());
            acc = vaddq_f32(acc, vmulq_f32(v, vdupq_n_f32(w)));
        }
        vst1q_u32(words.as_mut_ptr(), neon_round(acc));
        for (out, &word) in dst[i..i + 4].iter_mut().zip(&words) {
            *out = word as u8;
        }
        i += 4;
    }
    len
}
