//! Pixel format conversion.
//!
//! Supported pairs (identity pairs are plain copies):
//!
//! | from | to |
//! |------|----|
//! | RGB24, RGBA32 | Mono8, LAB |
//! | Mono8 | RGB24, RGBA32 |
//! | RGB24 | RGBA32 (opaque alpha) |
//! | RGBA32 | RGB24 (alpha dropped) |
//! | Raw16BigEndian | RGB24, Mono8 |
//! | HighPrecision16 | RGB24 |
//! | Raw12Packed | Mono8, RGB24 |
//! | YUV422 | RGB24 (BT.601, full range) |
//! | LAB | RGB24 |

use crate::core::buffer::PixelBuffer;
use crate::core::context::NodeContext;
use crate::core::error::{ProcessingError, ProcessingResult};
use crate::core::format::PixelFormat;
use crate::core::node::{NodeKind, ProcessingNode};
use crate::nodes::fill_rows;
use crate::simd::scalar::{luma, round_sample};
use std::sync::OnceLock;

// ============================================================================
// Conversion constants
// ============================================================================

/// Linear sRGB to CIE XYZ (D65).
const RGB_TO_XYZ: [[f32; 3]; 3] = [
    [0.412_456_4, 0.357_576_1, 0.180_437_5],
    [0.212_672_9, 0.715_152_2, 0.072_175_0],
    [0.019_333_9, 0.119_192_0, 0.950_304_1],
];

/// CIE XYZ (D65) to linear sRGB.
const XYZ_TO_RGB: [[f32; 3]; 3] = [
    [3.240_454_2, -1.537_138_5, -0.498_531_4],
    [-0.969_266_0, 1.876_010_8, 0.041_556_0],
    [0.055_643_4, -0.204_025_9, 1.057_225_2],
];

/// D65 reference white.
const WHITE: [f32; 3] = [0.950_47, 1.0, 1.088_83];

const LAB_EPSILON: f32 = 6.0 / 29.0;

/// BT.601 YCbCr to RGB coefficients.
const YUV_R_V: f32 = 1.402;
const YUV_G_U: f32 = 0.344_136;
const YUV_G_V: f32 = 0.714_136;
const YUV_B_U: f32 = 1.772;

/// Whether `from -> to` is in the conversion table.
pub fn is_supported(from: PixelFormat, to: PixelFormat) -> bool {
    use PixelFormat::*;
    if from == Unknown || to == Unknown {
        return false;
    }
    from == to
        || matches!(
            (from, to),
            (Rgb24 | Rgba32, Mono8)
                | (Mono8, Rgb24 | Rgba32)
                | (Rgb24, Rgba32)
                | (Rgba32, Rgb24)
                | (Raw16BigEndian, Rgb24 | Mono8)
                | (HighPrecision16, Rgb24)
                | (Raw12Packed, Mono8 | Rgb24)
                | (Yuv422, Rgb24)
                | (Rgb24 | Rgba32, Lab)
                | (Lab, Rgb24)
        )
}

/// Converts every pixel to a fixed target format.
#[derive(Debug, Clone)]
pub struct FormatConvertNode {
    target: PixelFormat,
}

impl FormatConvertNode {
    pub fn new(target: PixelFormat) -> Self {
        Self { target }
    }

    pub fn target(&self) -> PixelFormat {
        self.target
    }

    /// Convert `input`, failing with `UnsupportedConversion` for pairs outside the table.
    pub fn convert(&self, input: &PixelBuffer, ctx: &NodeContext) -> ProcessingResult<PixelBuffer> {
        let from = input.format();
        let to = self.target;
        if !is_supported(from, to) {
            return Err(ProcessingError::UnsupportedConversion { from, to });
        }
        if from == to {
            return ctx.copy_of(input);
        }

        let width = input.width() as usize;
        let mut output = ctx.allocate(input.width(), input.height(), to)?;
        fill_rows(&mut output, |y, dst| convert_row(from, to, input.row(y), dst, width));
        Ok(output)
    }
}

impl ProcessingNode for FormatConvertNode {
    fn name(&self) -> &'static str {
        "format_convert"
    }

    fn kind(&self) -> NodeKind {
        NodeKind::FormatConvert
    }

    fn validate(&self) -> ProcessingResult<()> {
        if self.target == PixelFormat::Unknown {
            return Err(ProcessingError::invalid("target", "must be a concrete pixel format"));
        }
        Ok(())
    }

    fn can_process(&self, input: &PixelBuffer) -> bool {
        is_supported(input.format(), self.target)
    }

    fn process(&self, input: &PixelBuffer, ctx: &NodeContext) -> ProcessingResult<PixelBuffer> {
        self.convert(input, ctx)
    }

    fn parameters(&self) -> Vec<(&'static str, f64)> {
        let index = PixelFormat::all()
            .iter()
            .position(|f| *f == self.target)
            .map_or(-1.0, |i| i as f64);
        vec![("target", index)]
    }

    fn output_format(&self, _input: PixelFormat) -> PixelFormat {
        self.target
    }

    fn clone_box(&self) -> Box<dyn ProcessingNode> {
        Box::new(self.clone())
    }
}

// ============================================================================
// Row conversions
// ============================================================================

fn convert_row(from: PixelFormat, to: PixelFormat, src: &[u8], dst: &mut [u8], width: usize) {
    use PixelFormat::*;
    match (from, to) {
        (Rgb24 | Rgba32, Mono8) => {
            let bpp = from.bytes_per_pixel();
            for (out, px) in dst.iter_mut().zip(src.chunks_exact(bpp)) {
                *out = round_sample(luma(px[0] as f32, px[1] as f32, px[2] as f32));
            }
        }
        (Mono8, Rgb24 | Rgba32) => {
            let bpp = to.bytes_per_pixel();
            for (px, &v) in dst.chunks_exact_mut(bpp).zip(src) {
                px[..3].fill(v);
                if bpp == 4 {
                    px[3] = 255;
                }
            }
        }
        (Rgb24, Rgba32) => {
            for (out, px) in dst.chunks_exact_mut(4).zip(src.chunks_exact(3)) {
                out[..3].copy_from_slice(px);
                out[3] = 255;
            }
        }
        (Rgba32, Rgb24) => {
            for (out, px) in dst.chunks_exact_mut(3).zip(src.chunks_exact(4)) {
                out.copy_from_slice(&px[..3]);
            }
        }
        (Raw16BigEndian, Mono8 | Rgb24) => {
            let bpp = to.bytes_per_pixel();
            for (out, sample) in dst.chunks_exact_mut(bpp).zip(src.chunks_exact(2)) {
                out.fill(sample[0]);
            }
        }
        (HighPrecision16, Rgb24) => {
            // Little-endian samples: the high byte is the second one.
            for (out, sample) in dst.iter_mut().zip(src.chunks_exact(2)) {
                *out = sample[1];
            }
        }
        (Raw12Packed, Mono8 | Rgb24) => {
            let bpp = to.bytes_per_pixel();
            for (x, out) in dst.chunks_exact_mut(bpp).enumerate().take(width) {
                out.fill(raw12_high_byte(src, x));
            }
        }
        (Yuv422, Rgb24) => yuv422_row(src, dst, width),
        (Rgb24 | Rgba32, Lab) => {
            let bpp = from.bytes_per_pixel();
            for (out, px) in dst.chunks_exact_mut(3).zip(src.chunks_exact(bpp)) {
                out.copy_from_slice(&rgb_to_lab([px[0], px[1], px[2]]));
            }
        }
        (Lab, Rgb24) => {
            for (out, px) in dst.chunks_exact_mut(3).zip(src.chunks_exact(3)) {
                out.copy_from_slice(&lab_to_rgb([px[0], px[1], px[2]]));
            }
        }
        _ => dst.copy_from_slice(&src[..dst.len()]),
    }
}

/// Upper 8 bits of pixel `x` in a 12-bit packed row.
///
/// Each three-byte group holds two pixels: the high bytes of both, then a
/// byte with their low nibbles.
#[inline]
fn raw12_high_byte(row: &[u8], x: usize) -> u8 {
    row[(x / 2) * 3 + (x % 2)]
}

fn yuv422_row(src: &[u8], dst: &mut [u8], width: usize) {
    for x in 0..width {
        let group = (x / 2) * 4;
        let y = src[group + (x % 2) * 2] as f32;
        let u = src[group + 1] as f32 - 128.0;
        // An odd trailing pixel has no V sample.
        let v = src.get(group + 3).map_or(0.0, |&v| v as f32 - 128.0);
        let out = &mut dst[x * 3..x * 3 + 3];
        out[0] = round_sample(y + YUV_R_V * v);
        out[1] = round_sample(y - YUV_G_U * u - YUV_G_V * v);
        out[2] = round_sample(y + YUV_B_U * u);
    }
}

fn srgb_to_linear_table() -> &'static [f32; 256] {
    static TABLE: OnceLock<[f32; 256]> = OnceLock::new();
    TABLE.get_or_init(|| {
        let mut table = [0.0f32; 256];
        for (i, v) in table.iter_mut().enumerate() {
            let c = i as f32 / 255.0;
            *v = if c <= 0.040_45 {
                c / 12.92
            } else {
                ((c + 0.055) / 1.055).powf(2.4)
            };
        }
        table
    })
}

fn linear_to_srgb(c: f32) -> u8 {
    let c = c.clamp(0.0, 1.0);
    let v = if c <= 0.003_130_8 {
        c * 12.92
    } else {
        1.055 * c.powf(1.0 / 2.4) - 0.055
    };
    round_sample(v * 255.0)
}

fn lab_f(t: f32) -> f32 {
    if t > LAB_EPSILON.powi(3) {
        t.cbrt()
    } else {
        t / (3.0 * LAB_EPSILON * LAB_EPSILON) + 4.0 / 29.0
    }
}

fn lab_f_inv(t: f32) -> f32 {
    if t > LAB_EPSILON {
        t * t * t
    } else {
        3.0 * LAB_EPSILON * LAB_EPSILON * (t - 4.0 / 29.0)
    }
}

fn mat3(m: &[[f32; 3]; 3], v: [f32; 3]) -> [f32; 3] {
    [
        m[0][0] * v[0] + m[0][1] * v[1] + m[0][2] * v[2],
        m[1][0] * v[0] + m[1][1] * v[1] + m[1][2] * v[2],
        m[2][0] * v[0] + m[2][1] * v[1] + m[2][2] * v[2],
    ]
}

/// sRGB to 8-bit encoded L*a*b*.
pub fn rgb_to_lab(rgb: [u8; 3]) -> [u8; 3] {
    let table = srgb_to_linear_table();
    let linear = [
        table[rgb[0] as usize],
        table[rgb[1] as usize],
        table[rgb[2] as usize],
    ];
    let xyz = mat3(&RGB_TO_XYZ, linear);
    let fx = lab_f(xyz[0] / WHITE[0]);
    let fy = lab_f(xyz[1] / WHITE[1]);
    let fz = lab_f(xyz[2] / WHITE[2]);

    let l = 116.0 * fy - 16.0;
    let a = 500.0 * (fx - fy);
    let b = 200.0 * (fy - fz);
    [
        round_sample(l * 255.0 / 100.0),
        round_sample(a + 128.0),
        round_sample(b + 128.0),
    ]
}

/// 8-bit encoded L*a*b* to sRGB.
pub fn lab_to_rgb(lab: [u8; 3]) -> [u8; 3] {
    let l = lab[0] as f32 * 100.0 / 255.0;
    let a = lab[1] as f32 - 128.0;
    let b = lab[2] as f32 - 128.0;

    let fy = (l + 16.0) / 116.0;
    let xyz = [
        WHITE[0] * lab_f_inv(fy + a / 500.0),
        WHITE[1] * lab_f_inv(fy),
        WHITE[2] * lab_f_inv(fy - b / 200.0),
    ];
    let linear = mat3(&XYZ_TO_RGB, xyz);
    [
        linear_to_srgb(linear[0]),
        linear_to_srgb(linear[1]),
        linear_to_srgb(linear[2]),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn convert(input: &PixelBuffer, to: PixelFormat) -> ProcessingResult<PixelBuffer> {
        FormatConvertNode::new(to).process(input, &NodeContext::new())
    }

    #[test]
    fn test_rgb_to_gray_and_back() {
        let input = PixelBuffer::from_bytes(2, 1, PixelFormat::Rgb24, &[255, 0, 0, 10, 10, 10]).unwrap();
        let gray = convert(&input, PixelFormat::Mono8).unwrap();
        assert_eq!(gray.row(0), &[54, 10]);

        let rgba = convert(&gray, PixelFormat::Rgba32).unwrap();
        assert_eq!(rgba.row(0), &[54, 54, 54, 255, 10, 10, 10, 255]);
    }

    #[test]
    fn test_alpha_add_and_drop() {
        let input = PixelBuffer::from_bytes(1, 1, PixelFormat::Rgb24, &[1, 2, 3]).unwrap();
        let rgba = convert(&input, PixelFormat::Rgba32).unwrap();
        assert_eq!(rgba.row(0), &[1, 2, 3, 255]);
        let back = convert(&rgba, PixelFormat::Rgb24).unwrap();
        assert_eq!(back, input);
    }

    #[test]
    fn test_raw16_big_endian_takes_high_byte() {
        let input =
            PixelBuffer::from_bytes(2, 1, PixelFormat::Raw16BigEndian, &[0xAB, 0xCD, 0x01, 0xFF]).unwrap();
        let rgb = convert(&input, PixelFormat::Rgb24).unwrap();
        assert_eq!(rgb.row(0), &[0xAB, 0xAB, 0xAB, 0x01, 0x01, 0x01]);
    }

    #[test]
    fn test_high_precision_takes_high_byte() {
        let input =
            PixelBuffer::from_bytes(1, 1, PixelFormat::HighPrecision16, &[0x34, 0x12, 0xFF, 0x80, 0x00, 0x00])
                .unwrap();
        let rgb = convert(&input, PixelFormat::Rgb24).unwrap();
        assert_eq!(rgb.row(0), &[0x12, 0x80, 0x00]);
    }

    #[test]
    fn test_raw12_packed_odd_width() {
        // Three pixels: 0xAB?, 0xCD?, 0xEF? -> five bytes.
        let input =
            PixelBuffer::from_bytes(3, 1, PixelFormat::Raw12Packed, &[0xAB, 0xCD, 0x21, 0xEF, 0x03]).unwrap();
        let gray = convert(&input, PixelFormat::Mono8).unwrap();
        assert_eq!(gray.row(0), &[0xAB, 0xCD, 0xEF]);
    }

    #[test]
    fn test_yuv_gray_maps_to_gray() {
        let input =
            PixelBuffer::from_bytes(2, 1, PixelFormat::Yuv422, &[100, 128, 200, 128]).unwrap();
        let rgb = convert(&input, PixelFormat::Rgb24).unwrap();
        assert_eq!(rgb.row(0), &[100, 100, 100, 200, 200, 200]);
    }

    #[test]
    fn test_lab_known_values() {
        assert_eq!(rgb_to_lab([255, 255, 255]), [255, 128, 128]);
        assert_eq!(rgb_to_lab([0, 0, 0]), [0, 128, 128]);
        let red = rgb_to_lab([255, 0, 0]);
        // L* 53.2, a* 80.1, b* 67.2
        assert!((red[0] as i32 - 136).abs() <= 1);
        assert!((red[1] as i32 - 208).abs() <= 1);
        assert!((red[2] as i32 - 195).abs() <= 1);
    }

    #[test]
    fn test_lab_round_trip_is_close() {
        for rgb in [[200u8, 30, 60], [12, 140, 220], [128, 128, 128]] {
            let back = lab_to_rgb(rgb_to_lab(rgb));
            for c in 0..3 {
                assert!((back[c] as i32 - rgb[c] as i32).abs() <= 4, "{:?} -> {:?}", rgb, back);
            }
        }
    }

    #[test]
    fn test_unsupported_pair() {
        let input = PixelBuffer::new(2, 1, PixelFormat::Yuv422).unwrap();
        let node = FormatConvertNode::new(PixelFormat::Lab);
        assert!(!node.can_process(&input));
        let err = node.process(&input, &NodeContext::new()).unwrap_err();
        assert_eq!(
            err,
            ProcessingError::UnsupportedConversion {
                from: PixelFormat::Yuv422,
                to: PixelFormat::Lab
            }
        );
    }

    #[test]
    fn test_identity_is_copy() {
        let input = PixelBuffer::from_bytes(2, 1, PixelFormat::Lab, &[1, 2, 3, 4, 5, 6]).unwrap();
        assert_eq!(convert(&input, PixelFormat::Lab).unwrap(), input);
    }
}
