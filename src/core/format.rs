//! Pixel formats produced by scanner sensors and consumed by the pipeline.
//!
//! A closed enum keeps every per-format decision (row size, sample layout,
//! channel semantics) in exhaustive matches.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Supported raw and packed pixel formats.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum PixelFormat {
    /// Format not known; no buffer can be created with it.
    #[default]
    Unknown,
    /// 8-bit single channel.
    Mono8,
    /// 8-bit R, G, B.
    Rgb24,
    /// 8-bit R, G, B, A.
    Rgba32,
    /// 16-bit R, G, B with little-endian samples.
    HighPrecision16,
    /// One 16-bit big-endian sensor sample per pixel.
    Raw16BigEndian,
    /// 12-bit sensor samples, two pixels packed into three bytes.
    Raw12Packed,
    /// YUYV 4:2:2, two pixels share one U and one V sample.
    Yuv422,
    /// 8-bit encoded CIE L*a*b* (L scaled to 0..255, a and b offset by 128).
    Lab,
}

/// How the bytes of a row decompose into individual samples.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SampleLayout {
    /// One byte per sample.
    U8,
    /// Two bytes per sample, little-endian.
    U16Le,
    /// Two bytes per sample, big-endian.
    U16Be,
    /// Two 12-bit samples in three bytes; not independently addressable.
    Packed12,
}

impl PixelFormat {
    /// All concrete formats (excluding `Unknown`).
    pub fn all() -> &'static [PixelFormat] {
        &[
            PixelFormat::Mono8,
            PixelFormat::Rgb24,
            PixelFormat::Rgba32,
            PixelFormat::HighPrecision16,
            PixelFormat::Raw16BigEndian,
            PixelFormat::Raw12Packed,
            PixelFormat::Yuv422,
            PixelFormat::Lab,
        ]
    }

    /// Bits occupied by one pixel.
    pub fn bits_per_pixel(&self) -> usize {
        match self {
            PixelFormat::Unknown => 0,
            PixelFormat::Mono8 => 8,
            PixelFormat::Rgb24 | PixelFormat::Lab => 24,
            PixelFormat::Rgba32 => 32,
            PixelFormat::HighPrecision16 => 48,
            PixelFormat::Raw16BigEndian | PixelFormat::Yuv422 => 16,
            PixelFormat::Raw12Packed => 12,
        }
    }

    /// Bytes per pixel, rounded up for packed formats.
    pub fn bytes_per_pixel(&self) -> usize {
        (self.bits_per_pixel() + 7) / 8
    }

    /// Bytes needed for one tightly packed row of `width` pixels.
    pub fn row_bytes(&self, width: u32) -> usize {
        (width as usize * self.bits_per_pixel() + 7) / 8
    }

    /// Number of logical channels.
    pub fn channels(&self) -> usize {
        match self {
            PixelFormat::Unknown => 0,
            PixelFormat::Mono8 | PixelFormat::Raw16BigEndian | PixelFormat::Raw12Packed => 1,
            PixelFormat::Rgb24 | PixelFormat::HighPrecision16 | PixelFormat::Lab => 3,
            PixelFormat::Rgba32 => 4,
            // Y plus alternating chroma per pixel
            PixelFormat::Yuv422 => 2,
        }
    }

    /// Whether the last channel is alpha.
    pub fn has_alpha(&self) -> bool {
        matches!(self, PixelFormat::Rgba32)
    }

    /// Whether pixels are interleaved 8-bit channels the SIMD kernels accept.
    pub fn is_kernel_compatible(&self) -> bool {
        matches!(
            self,
            PixelFormat::Mono8 | PixelFormat::Rgb24 | PixelFormat::Rgba32
        )
    }

    /// Whether every byte is an independent 8-bit sample.
    pub fn is_8bit_interleaved(&self) -> bool {
        matches!(
            self,
            PixelFormat::Mono8 | PixelFormat::Rgb24 | PixelFormat::Rgba32 | PixelFormat::Lab
        )
    }

    /// Sample layout used when blending or resampling raw bytes.
    pub fn sample_layout(&self) -> SampleLayout {
        match self {
            PixelFormat::HighPrecision16 => SampleLayout::U16Le,
            PixelFormat::Raw16BigEndian => SampleLayout::U16Be,
            PixelFormat::Raw12Packed => SampleLayout::Packed12,
            _ => SampleLayout::U8,
        }
    }

    /// Pixel granularity along a row: packed formats cannot be split mid-group.
    pub fn horizontal_alignment(&self) -> u32 {
        match self {
            PixelFormat::Raw12Packed | PixelFormat::Yuv422 => 2,
            _ => 1,
        }
    }

    /// Short display name.
    pub fn name(&self) -> &'static str {
        match self {
            PixelFormat::Unknown => "Unknown",
            PixelFormat::Mono8 => "Mono8",
            PixelFormat::Rgb24 => "RGB24",
            PixelFormat::Rgba32 => "RGBA32",
            PixelFormat::HighPrecision16 => "HighPrecision16",
            PixelFormat::Raw16BigEndian => "Raw16BigEndian",
            PixelFormat::Raw12Packed => "Raw12Packed",
            PixelFormat::Yuv422 => "YUV422",
            PixelFormat::Lab => "LAB",
        }
    }
}

impl fmt::Display for PixelFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}
