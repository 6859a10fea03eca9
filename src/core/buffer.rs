//! Pixel buffers: one image in one pixel format, rows padded to a cache line.

use crate::core::error::{ProcessingError, ProcessingResult};
use crate::core::format::PixelFormat;
use crate::core::pool::{round_up, AlignedBytes, MemoryPool, PoolBlock, CACHE_LINE};
use image::{DynamicImage, GrayImage, ImageBuffer, Rgb, RgbImage, RgbaImage};
use rayon::prelude::*;
use std::collections::hash_map::DefaultHasher;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

enum Storage {
    Standalone(AlignedBytes),
    Pooled {
        block: Option<PoolBlock>,
        pool: Arc<MemoryPool>,
    },
}

/// A rectangular image in a single [`PixelFormat`].
///
/// Rows start on 64-byte boundaries: `stride` is the packed row size rounded
/// up to a cache line, and the data holds exactly `stride * height` bytes.
/// Buffers are either standalone or backed by a block of a [`MemoryPool`],
/// which gets the block back when the buffer is dropped.
///
/// Cloning performs a deep copy into the same pool.
pub struct PixelBuffer {
    width: u32,
    height: u32,
    format: PixelFormat,
    stride: usize,
    storage: Storage,
}

impl PixelBuffer {
    /// Create a zero-filled standalone buffer.
    pub fn new(width: u32, height: u32, format: PixelFormat) -> ProcessingResult<Self> {
        let stride = Self::validate_shape(width, height, format)?;
        let storage = AlignedBytes::try_zeroed(stride * height as usize)?;
        Ok(Self {
            width,
            height,
            format,
            stride,
            storage: Storage::Standalone(storage),
        })
    }

    /// Create a zero-filled buffer backed by `pool`.
    pub fn new_in(
        pool: &Arc<MemoryPool>,
        width: u32,
        height: u32,
        format: PixelFormat,
    ) -> ProcessingResult<Self> {
        let stride = Self::validate_shape(width, height, format)?;
        let block = pool.allocate(stride * height as usize, CACHE_LINE)?;
        Ok(Self {
            width,
            height,
            format,
            stride,
            storage: Storage::Pooled {
                block: Some(block),
                pool: Arc::clone(pool),
            },
        })
    }

    /// Create a standalone buffer from tightly packed rows.
    pub fn from_bytes(
        width: u32,
        height: u32,
        format: PixelFormat,
        bytes: &[u8],
    ) -> ProcessingResult<Self> {
        let mut buffer = Self::new(width, height, format)?;
        buffer.copy_packed(bytes)?;
        Ok(buffer)
    }

    /// Create a pooled buffer from tightly packed rows.
    pub fn from_bytes_in(
        pool: &Arc<MemoryPool>,
        width: u32,
        height: u32,
        format: PixelFormat,
        bytes: &[u8],
    ) -> ProcessingResult<Self> {
        let mut buffer = Self::new_in(pool, width, height, format)?;
        buffer.copy_packed(bytes)?;
        Ok(buffer)
    }

    /// Create a standalone buffer from rows laid out with an arbitrary stride,
    /// as delivered by a device driver.
    pub fn from_raw_parts(
        width: u32,
        height: u32,
        format: PixelFormat,
        stride: usize,
        bytes: &[u8],
    ) -> ProcessingResult<Self> {
        let mut buffer = Self::new(width, height, format)?;
        let row_bytes = buffer.row_bytes();
        if stride < row_bytes {
            return Err(ProcessingError::invalid(
                "stride",
                format!("{} is smaller than a row ({} bytes)", stride, row_bytes),
            ));
        }
        let needed = stride * (height as usize - 1) + row_bytes;
        if bytes.len() < needed {
            return Err(ProcessingError::invalid(
                "data",
                format!("expected at least {} bytes, got {}", needed, bytes.len()),
            ));
        }
        for (y, dst) in buffer.rows_mut().enumerate() {
            let start = y * stride;
            dst.copy_from_slice(&bytes[start..start + row_bytes]);
        }
        Ok(buffer)
    }

    /// Allocate a zeroed buffer of the given shape, in this buffer's pool if it has one.
    pub fn alloc_like(
        &self,
        width: u32,
        height: u32,
        format: PixelFormat,
    ) -> ProcessingResult<Self> {
        match &self.storage {
            Storage::Pooled { pool, .. } => Self::new_in(pool, width, height, format),
            Storage::Standalone(_) => Self::new(width, height, format),
        }
    }

    /// Allocate a zeroed buffer with this buffer's shape and format.
    pub fn empty_like(&self) -> ProcessingResult<Self> {
        self.alloc_like(self.width, self.height, self.format)
    }

    fn validate_shape(width: u32, height: u32, format: PixelFormat) -> ProcessingResult<usize> {
        if width == 0 || height == 0 {
            return Err(ProcessingError::InvalidDimensions { width, height });
        }
        if format == PixelFormat::Unknown {
            return Err(ProcessingError::UnsupportedFormat {
                node: "pixel buffer".to_string(),
                format,
            });
        }
        let stride = round_up(format.row_bytes(width), CACHE_LINE);
        stride
            .checked_mul(height as usize)
            .ok_or(ProcessingError::InvalidDimensions { width, height })?;
        Ok(stride)
    }

    fn copy_packed(&mut self, bytes: &[u8]) -> ProcessingResult<()> {
        let row_bytes = self.row_bytes();
        let expected = row_bytes * self.height as usize;
        if bytes.len() != expected {
            return Err(ProcessingError::invalid(
                "data",
                format!("expected {} bytes, got {}", expected, bytes.len()),
            ));
        }
        for (dst, src) in self.rows_mut().zip(bytes.chunks_exact(row_bytes)) {
            dst.copy_from_slice(src);
        }
        Ok(())
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn dimensions(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    pub fn format(&self) -> PixelFormat {
        self.format
    }

    /// Bytes between the starts of consecutive rows (multiple of 64).
    pub fn stride(&self) -> usize {
        self.stride
    }

    /// Bytes of pixel data in one row, without padding.
    pub fn row_bytes(&self) -> usize {
        self.format.row_bytes(self.width)
    }

    /// Total bytes held, including row padding.
    pub fn byte_size(&self) -> usize {
        self.stride * self.height as usize
    }

    pub fn pixel_count(&self) -> u64 {
        self.width as u64 * self.height as u64
    }

    /// Whether the data lives in a memory pool.
    pub fn is_pooled(&self) -> bool {
        matches!(self.storage, Storage::Pooled { .. })
    }

    /// The pool backing this buffer, if any.
    pub fn pool(&self) -> Option<&Arc<MemoryPool>> {
        match &self.storage {
            Storage::Pooled { pool, .. } => Some(pool),
            Storage::Standalone(_) => None,
        }
    }

    /// Whether both buffers have the same width, height and format.
    pub fn same_shape(&self, other: &PixelBuffer) -> bool {
        self.width == other.width && self.height == other.height && self.format == other.format
    }

    /// The full padded data (`stride * height` bytes).
    pub fn data(&self) -> &[u8] {
        match &self.storage {
            Storage::Standalone(bytes) => bytes.as_slice(),
            Storage::Pooled { block, .. } => match block {
                Some(block) => block.as_slice(),
                None => &[],
            },
        }
    }

    /// Mutable access to the full padded data.
    pub fn data_mut(&mut self) -> &mut [u8] {
        match &mut self.storage {
            Storage::Standalone(bytes) => bytes.as_mut_slice(),
            Storage::Pooled { block, .. } => match block {
                Some(block) => block.as_mut_slice(),
                None => &mut [],
            },
        }
    }

    /// One row of pixel data without padding.
    ///
    /// # Panics
    ///
    /// Panics if `y >= height`.
    pub fn row(&self, y: u32) -> &[u8] {
        let start = y as usize * self.stride;
        let row_bytes = self.row_bytes();
        &self.data()[start..start + row_bytes]
    }

    /// Mutable row of pixel data without padding.
    ///
    /// # Panics
    ///
    /// Panics if `y >= height`.
    pub fn row_mut(&mut self, y: u32) -> &mut [u8] {
        let start = y as usize * self.stride;
        let row_bytes = self.row_bytes();
        &mut self.data_mut()[start..start + row_bytes]
    }

    /// Iterate over rows without padding.
    pub fn rows(&self) -> impl Iterator<Item = &[u8]> + '_ {
        let row_bytes = self.row_bytes();
        self.data()
            .chunks_exact(self.stride)
            .map(move |row| &row[..row_bytes])
    }

    /// Iterate mutably over rows without padding.
    pub fn rows_mut(&mut self) -> impl Iterator<Item = &mut [u8]> + '_ {
        let row_bytes = self.row_bytes();
        let stride = self.stride;
        self.data_mut()
            .chunks_exact_mut(stride)
            .map(move |row| &mut row[..row_bytes])
    }

    /// Parallel mutable rows (without padding), in row order.
    pub fn par_rows_mut(&mut self) -> impl IndexedParallelIterator<Item = &mut [u8]> + '_ {
        let row_bytes = self.row_bytes();
        let stride = self.stride;
        self.data_mut()
            .par_chunks_exact_mut(stride)
            .map(move |row| &mut row[..row_bytes])
    }

    /// Bytes of one pixel.
    ///
    /// # Panics
    ///
    /// Panics for out-of-bounds coordinates or the packed 12-bit format, whose
    /// pixels are not byte addressable.
    pub fn pixel(&self, x: u32, y: u32) -> &[u8] {
        assert!(
            self.format != PixelFormat::Raw12Packed,
            "Raw12Packed pixels are not byte addressable"
        );
        assert!(x < self.width, "x {} out of bounds for width {}", x, self.width);
        let bpp = self.format.bytes_per_pixel();
        let start = x as usize * bpp;
        &self.row(y)[start..start + bpp]
    }

    /// Overwrite one pixel.
    ///
    /// # Panics
    ///
    /// Same conditions as [`pixel`](Self::pixel), or if `value` has the wrong length.
    pub fn set_pixel(&mut self, x: u32, y: u32, value: &[u8]) {
        assert!(
            self.format != PixelFormat::Raw12Packed,
            "Raw12Packed pixels are not byte addressable"
        );
        assert!(x < self.width, "x {} out of bounds for width {}", x, self.width);
        let bpp = self.format.bytes_per_pixel();
        let start = x as usize * bpp;
        self.row_mut(y)[start..start + bpp].copy_from_slice(value);
    }

    /// Copy the pixel data out without row padding.
    pub fn to_packed_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.row_bytes() * self.height as usize);
        for row in self.rows() {
            out.extend_from_slice(row);
        }
        out
    }

    /// Hash of shape, format and pixel data (padding excluded).
    pub fn content_hash(&self) -> u64 {
        let mut hasher = DefaultHasher::new();
        self.width.hash(&mut hasher);
        self.height.hash(&mut hasher);
        self.format.hash(&mut hasher);
        for row in self.rows() {
            row.hash(&mut hasher);
        }
        hasher.finish()
    }

    /// Deep copy into standalone storage, detached from any pool.
    pub fn to_standalone(&self) -> ProcessingResult<PixelBuffer> {
        let mut copy = Self::new(self.width, self.height, self.format)?;
        copy.data_mut().copy_from_slice(self.data());
        Ok(copy)
    }

    /// Import a decoded image.
    ///
    /// 8-bit gray, RGB and RGBA map directly; 16-bit RGB becomes
    /// `HighPrecision16`; everything else is converted to RGBA.
    pub fn from_dynamic_image(image: &DynamicImage) -> ProcessingResult<Self> {
        let (width, height) = (image.width(), image.height());
        match image {
            DynamicImage::ImageLuma8(gray) => {
                Self::from_bytes(width, height, PixelFormat::Mono8, gray.as_raw())
            }
            DynamicImage::ImageRgb8(rgb) => {
                Self::from_bytes(width, height, PixelFormat::Rgb24, rgb.as_raw())
            }
            DynamicImage::ImageRgba8(rgba) => {
                Self::from_bytes(width, height, PixelFormat::Rgba32, rgba.as_raw())
            }
            DynamicImage::ImageRgb16(rgb) => {
                let bytes: Vec<u8> = rgb.as_raw().iter().flat_map(|s| s.to_le_bytes()).collect();
                Self::from_bytes(width, height, PixelFormat::HighPrecision16, &bytes)
            }
            other => {
                let rgba = other.to_rgba8();
                Self::from_bytes(width, height, PixelFormat::Rgba32, rgba.as_raw())
            }
        }
    }

    /// Export to an `image` crate image. Only formats with a direct
    /// counterpart are supported; convert others first.
    pub fn to_dynamic_image(&self) -> ProcessingResult<DynamicImage> {
        let (w, h) = self.dimensions();
        let packed = self.to_packed_bytes();
        let shape_error = || ProcessingError::InvalidDimensions {
            width: w,
            height: h,
        };
        let image = match self.format {
            PixelFormat::Mono8 => {
                DynamicImage::ImageLuma8(GrayImage::from_raw(w, h, packed).ok_or_else(shape_error)?)
            }
            PixelFormat::Rgb24 => {
                DynamicImage::ImageRgb8(RgbImage::from_raw(w, h, packed).ok_or_else(shape_error)?)
            }
            PixelFormat::Rgba32 => {
                DynamicImage::ImageRgba8(RgbaImage::from_raw(w, h, packed).ok_or_else(shape_error)?)
            }
            PixelFormat::HighPrecision16 => {
                let samples: Vec<u16> = packed
                    .chunks_exact(2)
                    .map(|b| u16::from_le_bytes([b[0], b[1]]))
                    .collect();
                let rgb: ImageBuffer<Rgb<u16>, Vec<u16>> =
                    ImageBuffer::from_raw(w, h, samples).ok_or_else(shape_error)?;
                DynamicImage::ImageRgb16(rgb)
            }
            format => {
                return Err(ProcessingError::UnsupportedFormat {
                    node: "image export".to_string(),
                    format,
                })
            }
        };
        Ok(image)
    }
}

impl Clone for PixelBuffer {
    fn clone(&self) -> Self {
        let storage = match &self.storage {
            Storage::Standalone(bytes) => Storage::Standalone(bytes.clone()),
            Storage::Pooled { pool, .. } => match pool.allocate(self.byte_size(), CACHE_LINE) {
                Ok(mut block) => {
                    block.as_mut_slice().copy_from_slice(self.data());
                    Storage::Pooled {
                        block: Some(block),
                        pool: Arc::clone(pool),
                    }
                }
                Err(err) => {
                    log::warn!("pool clone failed ({}), using standalone storage", err);
                    Storage::Standalone(AlignedBytes::copy_from(self.data()))
                }
            },
        };
        Self {
            width: self.width,
            height: self.height,
            format: self.format,
            stride: self.stride,
            storage,
        }
    }
}

impl Drop for PixelBuffer {
    fn drop(&mut self) {
        if let Storage::Pooled { block, pool } = &mut self.storage {
            if let Some(block) = block.take() {
                pool.deallocate(block);
            }
        }
    }
}

impl PartialEq for PixelBuffer {
    fn eq(&self, other: &Self) -> bool {
        self.same_shape(other) && self.rows().eq(other.rows())
    }
}

impl fmt::Debug for PixelBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PixelBuffer")
            .field("width", &self.width)
            .field("height", &self.height)
            .field("format", &self.format)
            .field("stride", &self.stride)
            .field("pooled", &self.is_pooled())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stride_is_cache_line_multiple() {
        let buffer = PixelBuffer::new(5, 3, PixelFormat::Rgb24).unwrap();
        assert_eq!(buffer.row_bytes(), 15);
        assert_eq!(buffer.stride(), 64);
        assert_eq!(buffer.byte_size(), 192);
        assert_eq!(buffer.data().as_ptr() as usize % CACHE_LINE, 0);

        let wide = PixelBuffer::new(100, 2, PixelFormat::Rgba32).unwrap();
        assert_eq!(wide.stride(), 448);
    }

    #[test]
    fn test_invalid_shapes() {
        assert!(matches!(
            PixelBuffer::new(0, 4, PixelFormat::Mono8),
            Err(ProcessingError::InvalidDimensions { .. })
        ));
        assert!(PixelBuffer::new(4, 4, PixelFormat::Unknown).is_err());
    }

    #[test]
    fn test_from_bytes_roundtrip() {
        let bytes: Vec<u8> = (0..24).collect();
        let buffer = PixelBuffer::from_bytes(2, 3, PixelFormat::Rgba32, &bytes).unwrap();
        assert_eq!(buffer.pixel(1, 2), &[20, 21, 22, 23]);
        assert_eq!(buffer.to_packed_bytes(), bytes);

        assert!(PixelBuffer::from_bytes(2, 3, PixelFormat::Rgba32, &bytes[..10]).is_err());
    }

    #[test]
    fn test_from_raw_parts_drops_driver_padding() {
        // 2x2 Mono8 rows with a 4-byte driver stride
        let bytes = [1, 2, 0xEE, 0xEE, 3, 4];
        let buffer = PixelBuffer::from_raw_parts(2, 2, PixelFormat::Mono8, 4, &bytes).unwrap();
        assert_eq!(buffer.to_packed_bytes(), vec![1, 2, 3, 4]);

        assert!(PixelBuffer::from_raw_parts(2, 2, PixelFormat::Mono8, 1, &bytes).is_err());
        assert!(PixelBuffer::from_raw_parts(2, 2, PixelFormat::Mono8, 4, &bytes[..5]).is_err());
    }

    #[test]
    fn test_pooled_buffer_returns_block_on_drop() {
        let pool = Arc::new(MemoryPool::new(1 << 16));
        {
            let buffer = PixelBuffer::new_in(&pool, 16, 16, PixelFormat::Rgba32).unwrap();
            assert!(buffer.is_pooled());
            assert_eq!(pool.statistics().live_blocks, 1);

            let copy = buffer.clone();
            assert!(copy.is_pooled());
            assert_eq!(pool.statistics().live_blocks, 2);
        }
        assert_eq!(pool.statistics().current_usage, 0);
    }

    #[test]
    fn test_clone_is_deep() {
        let mut buffer = PixelBuffer::new(2, 2, PixelFormat::Mono8).unwrap();
        let copy = buffer.clone();
        buffer.set_pixel(0, 0, &[9]);
        assert_eq!(copy.pixel(0, 0), &[0]);
        assert_ne!(buffer, copy);
    }

    #[test]
    fn test_content_hash_ignores_storage() {
        let pool = Arc::new(MemoryPool::new(1 << 16));
        let bytes = vec![7u8; 3 * 4 * 4];
        let a = PixelBuffer::from_bytes(4, 4, PixelFormat::Rgb24, &bytes).unwrap();
        let b = PixelBuffer::from_bytes_in(&pool, 4, 4, PixelFormat::Rgb24, &bytes).unwrap();
        assert_eq!(a.content_hash(), b.content_hash());
        assert_eq!(a, b);

        let standalone = b.to_standalone().unwrap();
        assert!(!standalone.is_pooled());
        assert_eq!(standalone, a);
    }

    #[test]
    fn test_dynamic_image_interop() {
        let rgb = RgbImage::from_fn(3, 2, |x, y| Rgb([x as u8, y as u8, 200]));
        let buffer = PixelBuffer::from_dynamic_image(&DynamicImage::ImageRgb8(rgb)).unwrap();
        assert_eq!(buffer.format(), PixelFormat::Rgb24);
        assert_eq!(buffer.pixel(2, 1), &[2, 1, 200]);

        let back = buffer.to_dynamic_image().unwrap();
        assert_eq!(back.to_rgb8().get_pixel(2, 1), &Rgb([2, 1, 200]));

        let lab = PixelBuffer::new(1, 1, PixelFormat::Lab).unwrap();
        assert!(lab.to_dynamic_image().is_err());
    }
}
