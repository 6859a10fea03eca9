//! SSE2 and AVX2 backends.
//!
//! Byte lanes are widened to `i32`, converted to `f32`, processed, rounded
//! with the shared rule and packed back with saturation. RGBA rows are also
//! handled as one `i32` per pixel, which lets grayscale and saturation split
//! channels with shifts and masks.

use super::scalar;
use super::{KernelBackend, SimdLevel, LUMA_B, LUMA_G, LUMA_R};
use std::arch::x86_64::*;

const ALPHA_MASK: i32 = 0xFF00_0000u32 as i32;

/// 128-bit backend. Only handed out after capability detection confirms SSE2.
pub struct Sse2Backend;

/// 256-bit backend. Only handed out after capability detection confirms AVX2.
pub struct Avx2Backend;

impl KernelBackend for Sse2Backend {
    fn level(&self) -> SimdLevel {
        SimdLevel::Sse2
    }

    fn affine_row(&self, row: &mut [u8], channels: usize, scale: f32, offset: f32) {
        // SAFETY: SSE2 support was verified before this backend was selected.
        let done = unsafe { sse2_affine(row, channels == 4, scale, offset) };
        scalar::affine_row(&mut row[done..], channels, scale, offset);
    }

    fn grayscale_row(&self, row: &mut [u8], channels: usize) {
        let done = if channels == 4 {
            // SAFETY: see affine_row.
            unsafe { sse2_grayscale_rgba(row) }
        } else {
            0
        };
        scalar::grayscale_row(&mut row[done..], channels);
    }

    fn saturation_row(&self, row: &mut [u8], channels: usize, factor: f32) {
        let done = if channels == 4 {
            // SAFETY: see affine_row.
            unsafe { sse2_saturation_rgba(row, factor) }
        } else {
            0
        };
        scalar::saturation_row(&mut row[done..], channels, factor);
    }

    fn blur_row_horizontal(&self, src: &[u8], dst: &mut [f32], channels: usize, kernel: &[f32]) {
        if channels == 4 {
            // SAFETY: see affine_row.
            unsafe { sse2_blur_horizontal_rgba(src, dst, kernel) }
        } else {
            scalar::blur_row_horizontal(src, dst, channels, kernel, 0);
        }
    }

    fn blur_row_vertical(&self, rows: &[&[f32]], dst: &mut [u8], kernel: &[f32]) {
        // SAFETY: see affine_row.
        let done = unsafe { sse2_blur_vertical(rows, dst, kernel) };
        scalar::blur_row_vertical(rows, dst, kernel, done);
    }
}

impl KernelBackend for Avx2Backend {
    fn level(&self) -> SimdLevel {
        SimdLevel::Avx2
    }

    fn affine_row(&self, row: &mut [u8], channels: usize, scale: f32, offset: f32) {
        // SAFETY: AVX2 support was verified before this backend was selected.
        let done = unsafe { avx2_affine(row, channels == 4, scale, offset) };
        Sse2Backend.affine_row(&mut row[done..], channels, scale, offset);
    }

    fn grayscale_row(&self, row: &mut [u8], channels: usize) {
        let done = if channels == 4 {
            // SAFETY: see affine_row.
            unsafe { avx2_grayscale_rgba(row) }
        } else {
            0
        };
        Sse2Backend.grayscale_row(&mut row[done..], channels);
    }

    fn saturation_row(&self, row: &mut [u8], channels: usize, factor: f32) {
        let done = if channels == 4 {
            // SAFETY: see affine_row.
            unsafe { avx2_saturation_rgba(row, factor) }
        } else {
            0
        };
        Sse2Backend.saturation_row(&mut row[done..], channels, factor);
    }

    fn blur_row_horizontal(&self, src: &[u8], dst: &mut [f32], channels: usize, kernel: &[f32]) {
        // One RGBA pixel fills a 128-bit register; AVX2 implies SSE2.
        Sse2Backend.blur_row_horizontal(src, dst, channels, kernel);
    }

    fn blur_row_vertical(&self, rows: &[&[f32]], dst: &mut [u8], kernel: &[f32]) {
        // SAFETY: see affine_row.
        let done = unsafe { avx2_blur_vertical(rows, dst, kernel) };
        scalar::blur_row_vertical(rows, dst, kernel, done);
    }
}

// ============================================================================
// SSE2
// ============================================================================

#[inline]
#[target_feature(enable = "sse2")]
unsafe fn sse2_round(value: __m128) -> __m128i {
    let clamped = _mm_min_ps(_mm_max_ps(value, _mm_setzero_ps()), _mm_set1_ps(255.0));
    _mm_cvttps_epi32(_mm_add_ps(clamped, _mm_set1_ps(0.5)))
}

#[inline]
#[target_feature(enable = "sse2")]
unsafe fn sse2_luma(r: __m128, g: __m128, b: __m128) -> __m128 {
    let rg = _mm_add_ps(
        _mm_mul_ps(r, _mm_set1_ps(LUMA_R)),
        _mm_mul_ps(g, _mm_set1_ps(LUMA_G)),
    );
    _mm_add_ps(rg, _mm_mul_ps(b, _mm_set1_ps(LUMA_B)))
}

/// Split packed RGBA pixels into float R, G, B and the raw alpha bits.
#[inline]
#[target_feature(enable = "sse2")]
unsafe fn sse2_split_rgba(px: __m128i) -> (__m128, __m128, __m128, __m128i) {
    let byte = _mm_set1_epi32(0xFF);
    let r = _mm_cvtepi32_ps(_mm_and_si128(px, byte));
    let g = _mm_cvtepi32_ps(_mm_and_si128(_mm_srli_epi32::<8>(px), byte));
    let b = _mm_cvtepi32_ps(_mm_and_si128(_mm_srli_epi32::<16>(px), byte));
    let alpha = _mm_and_si128(px, _mm_set1_epi32(ALPHA_MASK));
    (r, g, b, alpha)
}

#[inline]
#[target_feature(enable = "sse2")]
unsafe fn sse2_join_rgba(r: __m128i, g: __m128i, b: __m128i, alpha: __m128i) -> __m128i {
    _mm_or_si128(
        _mm_or_si128(r, _mm_slli_epi32::<8>(g)),
        _mm_or_si128(_mm_slli_epi32::<16>(b), alpha),
    )
}

#[inline]
#[target_feature(enable = "sse2")]
unsafe fn sse2_affine4(lanes: __m128i, scale: __m128, offset: __m128) -> __m128i {
    sse2_round(_mm_add_ps(_mm_mul_ps(_mm_cvtepi32_ps(lanes), scale), offset))
}

#[target_feature(enable = "sse2")]
unsafe fn sse2_affine(row: &mut [u8], keep_alpha: bool, scale: f32, offset: f32) -> usize {
    let len = row.len() - row.len() % 16;
    let ptr = row.as_mut_ptr();
    let zero = _mm_setzero_si128();
    let scale = _mm_set1_ps(scale);
    let offset = _mm_set1_ps(offset);
    let mask = _mm_set1_epi32(ALPHA_MASK);

    let mut i = 0;
    while i < len {
        let p = ptr.add(i) as *mut __m128i;
        let src = _mm_loadu_si128(p);
        let lo = _mm_unpacklo_epi8(src, zero);
        let hi = _mm_unpackhi_epi8(src, zero);
        let a = sse2_affine4(_mm_unpacklo_epi16(lo, zero), scale, offset);
        let b = sse2_affine4(_mm_unpackhi_epi16(lo, zero), scale, offset);
        let c = sse2_affine4(_mm_unpacklo_epi16(hi, zero), scale, offset);
        let d = sse2_affine4(_mm_unpackhi_epi16(hi, zero), scale, offset);
        let packed = _mm_packus_epi16(_mm_packs_epi32(a, b), _mm_packs_epi32(c, d));
        let out = if keep_alpha {
            _mm_or_si128(_mm_andnot_si128(mask, packed), _mm_and_si128(mask, src))
        } else {
            packed
        };
        _mm_storeu_si128(p, out);
        i += 16;
    }
    len
}

#[target_feature(enable = "sse2")]
unsafe fn sse2_grayscale_rgba(row: &mut [u8]) -> usize {
    let len = row.len() - row.len() % 16;
    let ptr = row.as_mut_ptr();
    let mut i = 0;
    while i < len {
        let p = ptr.add(i) as *mut __m128i;
        let (r, g, b, alpha) = sse2_split_rgba(_mm_loadu_si128(p));
        let gray = sse2_round(sse2_luma(r, g, b));
        _mm_storeu_si128(p, sse2_join_rgba(gray, gray, gray, alpha));
        i += 16;
    }
    len
}

#[target_feature(enable = "sse2")]
unsafe fn sse2_saturation_rgba(row: &mut [u8], factor: f32) -> usize {
    let len = row.len() - row.len() % 16;
    let ptr = row.as_mut_ptr();
    let factor = _mm_set1_ps(factor);
    let mut i = 0;
    while i < len {
        let p = ptr.add(i) as *mut __m128i;
        let (r, g, b, alpha) = sse2_split_rgba(_mm_loadu_si128(p));
        let gray = sse2_luma(r, g, b);
        let r = sse2_round(_mm_add_ps(gray, _mm_mul_ps(_mm_sub_ps(r, gray), factor)));
        let g = sse2_round(_mm_add_ps(gray, _mm_mul_ps(_mm_sub_ps(g, gray), factor)));
        let b = sse2_round(_mm_add_ps(gray, _mm_mul_ps(_mm_sub_ps(b, gray), factor)));
        _mm_storeu_si128(p, sse2_join_rgba(r, g, b, alpha));
        i += 16;
    }
    len
}

#[target_feature(enable = "sse2")]
unsafe fn sse2_blur_horizontal_rgba(src: &[u8], dst: &mut [f32], kernel: &[f32]) {
    let width = src.len() / 4;
    let radius = kernel.len() / 2;
    let mut lanes = [0.0f32; 4];
    for x in 0..width {
        let mut acc = _mm_setzero_ps();
        for (k, &w) in kernel.iter().enumerate() {
            let s = (x + k).saturating_sub(radius).min(width - 1) * 4;
            let v = _mm_setr_ps(
                src[s] as f32,
                src[s + 1] as f32,
                src[s + 2] as f32,
                src[s + 3] as f32,
            );
            acc = _mm_add_ps(acc, _mm_mul_ps(v, _mm_set1_ps(w)));
        }
        _mm_storeu_ps(lanes.as_mut_ptr(), acc);
        dst[x * 4..x * 4 + 4].copy_from_slice(&lanes);
    }
}

#[target_feature(enable = "sse2")]
unsafe fn sse2_blur_vertical(rows: &[&[f32]], dst: &mut [u8], kernel: &[f32]) -> usize {
    let len = dst.len() - dst.len() % 4;
    let zero = _mm_setzero_si128();
    let mut i = 0;
    while i < len {
        let mut acc = _mm_setzero_ps();
        for (row, &w) in rows.iter().zip(kernel) {
            let v = _mm_loadu_ps(row[i..i + 4].as_ptr());
            acc = _mm_add_ps(acc, _mm_mul_ps(v, _mm_set1_ps(w)));
        }
        let q = sse2_round(acc);
        let packed = _mm_packus_epi16(_mm_packs_epi32(q, zero), zero);
        let word = _mm_cvtsi128_si32(packed) as u32;
        dst[i..i + 4].copy_from_slice(&word.to_le_bytes());
        i += 4;
    }
    len
}

// ============================================================================
// AVX2
// ============================================================================

#[inline]
#[target_feature(enable = "avx2")]
unsafe fn avx2_round(value: __m256) -> __m256i {
    let clamped = _mm256_min_ps(
        _mm256_max_ps(value, _mm256_setzero_ps()),
        _mm256_set1_ps(255.0),
    );
    _mm256_cvttps_epi32(_mm256_add_ps(clamped, _mm256_set1_ps(0.5)))
}

#[inline]
#[target_feature(enable = "avx2")]
unsafe fn avx2_luma(r: __m256, g: __m256, b: __m256) -> __m256 {
    let rg = _mm256_add_ps(
        _mm256_mul_ps(r, _mm256_set1_ps(LUMA_R)),
        _mm256_mul_ps(g, _mm256_set1_ps(LUMA_G)),
    );
    _mm256_add_ps(rg, _mm256_mul_ps(b, _mm256_set1_ps(LUMA_B)))
}

#[inline]
#[target_feature(enable = "avx2")]
unsafe fn avx2_split_rgba(px: __m256i) -> (__m256, __m256, __m256, __m256i) {
    let byte = _mm256_set1_epi32(0xFF);
    let r = _mm256_cvtepi32_ps(_mm256_and_si256(px, byte));
    let g = _mm256_cvtepi32_ps(_mm256_and_si256(_mm256_srli_epi32::<8>(px), byte));
    let b = _mm256_cvtepi32_ps(_mm256_and_si256(_mm256_srli_epi32::<16>(px), byte));
    let alpha = _mm256_and_si256(px, _mm256_set1_epi32(ALPHA_MASK));
    (r, g, b, alpha)
}

#[inline]
#[target_feature(enable = "avx2")]
unsafe fn avx2_join_rgba(r: __m256i, g: __m256i, b: __m256i, alpha: __m256i) -> __m256i {
    _mm256_or_si256(
        _mm256_or_si256(r, _mm256_slli_epi32::<8>(g)),
        _mm256_or_si256(_mm256_slli_epi32::<16>(b), alpha),
    )
}

/// Widen the eight bytes at `p` and apply the affine map.
#[inline]
#[target_feature(enable = "avx2")]
unsafe fn avx2_affine8(p: *const u8, scale: __m256, offset: __m256) -> __m256i {
    let lanes = _mm256_cvtepu8_epi32(_mm_loadl_epi64(p as *const __m128i));
    avx2_round(_mm256_add_ps(_mm256_mul_ps(_mm256_cvtepi32_ps(lanes), scale), offset))
}

#[target_feature(enable = "avx2")]
unsafe fn avx2_affine(row: &mut [u8], keep_alpha: bool, scale: f32, offset: f32) -> usize {
    let len = row.len() - row.len() % 32;
    let ptr = row.as_mut_ptr();
    let scale = _mm256_set1_ps(scale);
    let offset = _mm256_set1_ps(offset);
    let mask = _mm256_set1_epi32(ALPHA_MASK);
    // packs/packus interleave 128-bit halves; this restores byte order
    let order = _mm256_setr_epi32(0, 4, 1, 5, 2, 6, 3, 7);

    let mut i = 0;
    while i < len {
        let p = ptr.add(i);
        let src = _mm256_loadu_si256(p as *const __m256i);
        let a = avx2_affine8(p, scale, offset);
        let b = avx2_affine8(p.add(8), scale, offset);
        let c = avx2_affine8(p.add(16), scale, offset);
        let d = avx2_affine8(p.add(24), scale, offset);
        let packed = _mm256_packus_epi16(_mm256_packs_epi32(a, b), _mm256_packs_epi32(c, d));
        let packed = _mm256_permutevar8x32_epi32(packed, order);
        let out = if keep_alpha {
            _mm256_or_si256(_mm256_andnot_si256(mask, packed), _mm256_and_si256(mask, src))
        } else {
            packed
        };
        _mm256_storeu_si256(p as *mut __m256i, out);
        i += 32;
    }
    len
}

#[target_feature(enable = "avx2")]
unsafe fn avx2_grayscale_rgba(row: &mut [u8]) -> usize {
    let len = row.len() - row.len() % 32;
    let ptr = row.as_mut_ptr();
    let mut i = 0;
    while i < len {
        let p = ptr.add(i) as *mut __m256i;
        let (r, g, b, alpha) = avx2_split_rgba(_mm256_loadu_si256(p));
        let gray = avx2_round(avx2_luma(r, g, b));
        _mm256_storeu_si256(p, avx2_join_rgba(gray, gray, gray, alpha));
        i += 32;
    }
    len
}

#[target_feature(enable = "avx2")]
unsafe fn avx2_saturation_rgba(row: &mut [u8], factor: f32) -> usize {
    let len = row.len() - row.len() % 32;
    let ptr = row.as_mut_ptr();
    let factor = _mm256_set1_ps(factor);
    let mut i = 0;
    while i < len {
        let p = ptr.add(i) as *mut __m256i;
        let (r, g, b, alpha) = avx2_split_rgba(_mm256_loadu_si256(p));
        let gray = avx2_luma(r, g, b);
        let r = avx2_round(_mm256_add_ps(gray, _mm256_mul_ps(_mm256_sub_ps(r, gray), factor)));
        let g = avx2_round(_mm256_add_ps(gray, _mm256_mul_ps(_mm256_sub_ps(g, gray), factor)));
        let b = avx2_round(_mm256_add_ps(gray, _mm256_mul_ps(_mm256_sub_ps(b, gray), factor)));
        _mm256_storeu_si256(p, avx2_join_rgba(r, g, b, alpha));
        i += 32;
    }
    len
}

#[target_feature(enable = "avx2")]
unsafe fn avx2_blur_vertical(rows: &[&[f32]], dst: &mut [u8], kernel: &[f32]) -> usize {
    let len = dst.len() - dst.len() % 8;
    let mut words = [0i32; 8];
    let mut i = 0;
    while i < len {
        let mut acc = _mm256_setzero_ps();
        for (row, &w) in rows.iter().zip(kernel) {
            let v = _mm256_loadu_ps(row[i..i + 8].as_ptr());
            acc = _mm256_add_ps(acc, _mm256_mul_ps(v, _mm256_set1_ps(w)));
        }
        _mm256_storeu_si256(words.as_mut_ptr() as *mut __m256i, avx2_round(acc));
        for (out, &word) in dst[i..i + 8].iter_mut().zip(&words) {
            *out = word as u8;
        }
        i += 8;
    }
    len
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sse2_affine_matches_scalar_with_tail() {
        if !SimdLevel::Sse2.is_supported() {
            return;
        }
        let original: Vec<u8> = (0..=255u8).chain(0..21).collect();
        let mut simd = original.clone();
        let mut reference = original.clone();
        Sse2Backend.affine_row(&mut simd, 4, 1.3, -7.0);
        scalar::affine_row(&mut reference, 4, 1.3, -7.0);
        assert_eq!(simd, reference);
    }

    #[test]
    fn test_avx2_affine_keeps_alpha() {
        if !SimdLevel::Avx2.is_supported() {
            return;
        }
        let mut row: Vec<u8> = (0..64).map(|i| (i * 4) as u8).collect();
        let alpha: Vec<u8> = row.iter().skip(3).step_by(4).copied().collect();
        Avx2Backend.affine_row(&mut row, 4, 0.5, 0.0);
        let after: Vec<u8> = row.iter().skip(3).step_by(4).copied().collect();
        assert_eq!(alpha, after);
        assert_eq!(row[4], 8);
    }
}
