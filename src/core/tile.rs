//! Tiled processing for images that exceed the memory budget.
//!
//! The tile engine splits an image into a row-major grid of overlapping tiles,
//! extracts each tile into its own buffer, and merges processed tiles back.
//!
//! # Overlap
//!
//! Every grid cell (`core`) grows by `overlap` pixels toward its right and
//! bottom neighbours, never past the image edge. Each internal seam therefore
//! has `overlap` pixels covered by two tiles. Merging paints tiles in index
//! order; a tile's left and top edges that border an earlier tile are blended
//! over what is already painted with a linear ramp, so the earlier tile's
//! extension fades into the later tile instead of ending on a hard edge.
//!
//! ```text
//!  +--------+--+-----+
//!  | core 0 |ov| ... |   tile 0 region = core 0 + ov
//!  +--------+--+-----+   tile 1 left edge ramps over ov
//! ```
//!
//! # Halo
//!
//! Stages that read neighbouring pixels need context beyond the region.
//! [`Tile::context_region`] grows the region by a halo on all four sides;
//! the context is extracted and processed, then [`TileEngine::crop_to_tile`]
//! cuts the region back out before merging. With a halo at least as large as
//! the pipeline's combined reach, every merged pixel matches what a run on
//! the whole image produces.

use crate::core::buffer::PixelBuffer;
use crate::core::config::ProcessingConfig;
use crate::core::context::NodeContext;
use crate::core::error::{ProcessingError, ProcessingResult};
use crate::core::format::{PixelFormat, SampleLayout};
use serde::{Deserialize, Serialize};

/// Represents a rectangular region within an image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TileRegion {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl TileRegion {
    /// Create a new tile region.
    pub fn new(x: u32, y: u32, width: u32, height: u32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    /// Right edge (exclusive).
    pub fn right(&self) -> u32 {
        self.x + self.width
    }

    /// Bottom edge (exclusive).
    pub fn bottom(&self) -> u32 {
        self.y + self.height
    }

    /// Area in pixels.
    pub fn area(&self) -> u64 {
        self.width as u64 * self.height as u64
    }

    /// Grow toward the right and bottom by `overlap`, clamped to the image.
    pub fn grow_forward(&self, overlap: u32, image_width: u32, image_height: u32) -> Self {
        Self {
            x: self.x,
            y: self.y,
            width: self.right().saturating_add(overlap).min(image_width) - self.x,
            height: self.bottom().saturating_add(overlap).min(image_height) - self.y,
        }
    }

    /// Check if this region lies entirely within the given bounds.
    pub fn is_within_bounds(&self, width: u32, height: u32) -> bool {
        self.right() <= width && self.bottom() <= height
    }

    /// Whether `other` lies entirely inside this region.
    pub fn contains(&self, other: &TileRegion) -> bool {
        other.x >= self.x
            && other.y >= self.y
            && other.right() <= self.right()
            && other.bottom() <= self.bottom()
    }
}

/// One tile of a grid.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tile {
    /// Row-major position in the grid.
    pub index: usize,
    /// Nominal grid cell.
    pub core: TileRegion,
    /// Cell grown by the overlap; this is what gets merged.
    pub region: TileRegion,
    /// Overlap the grid was built with.
    pub overlap: u32,
    /// Dimensions of the image the grid covers.
    pub source_size: (u32, u32),
}

impl Tile {
    /// Whether the left edge borders an earlier tile.
    pub fn blends_left(&self) -> bool {
        self.overlap > 0 && self.core.x > 0
    }

    /// Whether the top edge borders an earlier tile.
    pub fn blends_top(&self) -> bool {
        self.overlap > 0 && self.core.y > 0
    }

    /// The area to process so that stages reading up to `halo` pixels away
    /// see the same neighbours inside [`region`](Self::region) as on the
    /// whole image.
    ///
    /// The region grows by `halo` on every side, clamped to the image. A
    /// non-zero halo also snaps both corners to even coordinates, keeping 2×2
    /// blocks and packed pixel pairs in phase with the whole image.
    pub fn context_region(&self, halo: u32) -> TileRegion {
        let region = self.region;
        if halo == 0 {
            return region;
        }
        let (width, height) = self.source_size;
        let snap_end = |end: u32, limit: u32| {
            let end = end.saturating_add(halo).min(limit);
            end.saturating_add(end & 1).min(limit)
        };
        let x = region.x.saturating_sub(halo) & !1;
        let y = region.y.saturating_sub(halo) & !1;
        TileRegion::new(
            x,
            y,
            snap_end(region.right(), width) - x,
            snap_end(region.bottom(), height) - y,
        )
    }
}

/// Iterator over the grid cells of an image in row-major order.
pub struct TileIterator {
    image_width: u32,
    image_height: u32,
    tile_width: u32,
    tile_height: u32,
    current_x: u32,
    current_y: u32,
}

impl TileIterator {
    /// Create a new tile iterator. Tile dimensions must be non-zero.
    pub fn new(image_width: u32, image_height: u32, tile_width: u32, tile_height: u32) -> Self {
        Self {
            image_width,
            image_height,
            tile_width: tile_width.max(1),
            tile_height: tile_height.max(1),
            current_x: 0,
            current_y: 0,
        }
    }

    /// Total number of cells: ceil(w / tw) * ceil(h / th).
    pub fn tile_count(&self) -> usize {
        let tiles_x = (self.image_width as usize).div_ceil(self.tile_width as usize);
        let tiles_y = (self.image_height as usize).div_ceil(self.tile_height as usize);
        tiles_x * tiles_y
    }
}

impl Iterator for TileIterator {
    type Item = TileRegion;

    fn next(&mut self) -> Option<Self::Item> {
        if self.current_y >= self.image_height || self.image_width == 0 {
            return None;
        }

        let x = self.current_x;
        let y = self.current_y;
        let width = self.tile_width.min(self.image_width - x);
        let height = self.tile_height.min(self.image_height - y);

        self.current_x = self.current_x.saturating_add(self.tile_width);
        if self.current_x >= self.image_width {
            self.current_x = 0;
            self.current_y = self.current_y.saturating_add(self.tile_height);
        }

        Some(TileRegion::new(x, y, width, height))
    }
}

/// Splits images into overlapping tiles and merges them back.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TileEngine {
    tile_width: u32,
    tile_height: u32,
    overlap: u32,
}

impl TileEngine {
    /// Create an engine with the given tile size and overlap.
    pub fn new(tile_width: u32, tile_height: u32, overlap: u32) -> ProcessingResult<Self> {
        if tile_width == 0 || tile_height == 0 {
            return Err(ProcessingError::invalid("tile_size", "tile dimensions must be non-zero"));
        }
        Ok(Self {
            tile_width,
            tile_height,
            overlap,
        })
    }

    /// Create an engine with square tiles from a configuration.
    pub fn from_config(config: &ProcessingConfig) -> ProcessingResult<Self> {
        Self::new(config.max_tile_size, config.max_tile_size, config.tile_overlap)
    }

    pub fn tile_size(&self) -> (u32, u32) {
        (self.tile_width, self.tile_height)
    }

    pub fn overlap(&self) -> u32 {
        self.overlap
    }

    /// Number of tiles for an image of the given size.
    pub fn tile_count(&self, width: u32, height: u32) -> usize {
        TileIterator::new(width, height, self.tile_width, self.tile_height).tile_count()
    }

    /// Compute the tile grid for an image.
    ///
    /// An image smaller than one tile yields exactly one tile covering it.
    pub fn calculate_tiles(&self, width: u32, height: u32) -> Vec<Tile> {
        self.grid(width, height, self.tile_width, self.overlap)
    }

    /// Compute the tile grid for an image in `format`, keeping tile origins on
    /// the format's pixel-group boundary (packed formats).
    pub fn calculate_tiles_for(&self, width: u32, height: u32, format: PixelFormat) -> Vec<Tile> {
        let align = format.horizontal_alignment();
        let tile_width = self.tile_width.next_multiple_of(align);
        let overlap = self.overlap.next_multiple_of(align);
        self.grid(width, height, tile_width, overlap)
    }

    fn grid(&self, width: u32, height: u32, tile_width: u32, overlap: u32) -> Vec<Tile> {
        TileIterator::new(width, height, tile_width, self.tile_height)
            .enumerate()
            .map(|(index, core)| Tile {
                index,
                core,
                region: core.grow_forward(overlap, width, height),
                overlap,
                source_size: (width, height),
            })
            .collect()
    }

    /// Copy a tile's region out of `source`.
    ///
    /// The tile buffer lives in the source's pool when the source is pooled.
    pub fn extract_tile(&self, source: &PixelBuffer, tile: &Tile) -> ProcessingResult<PixelBuffer> {
        copy_region(source, tile.region, |w, h, format| source.alloc_like(w, h, format))
    }

    /// Copy a tile's region out of `source` into a buffer from `ctx`.
    pub fn extract_tile_in(
        &self,
        source: &PixelBuffer,
        tile: &Tile,
        ctx: &NodeContext,
    ) -> ProcessingResult<PixelBuffer> {
        copy_region(source, tile.region, |w, h, format| ctx.allocate(w, h, format))
    }

    /// Copy a tile's [context region](Tile::context_region) for `halo` out of
    /// `source` into a buffer from `ctx`.
    pub fn extract_context_in(
        &self,
        source: &PixelBuffer,
        tile: &Tile,
        halo: u32,
        ctx: &NodeContext,
    ) -> ProcessingResult<PixelBuffer> {
        copy_region(source, tile.context_region(halo), |w, h, format| {
            ctx.allocate(w, h, format)
        })
    }

    /// Cut a tile's region out of its processed context.
    ///
    /// `processed` covers `context` in the pipeline's output format. It is
    /// returned as is when the context is the region itself.
    pub fn crop_to_tile(
        &self,
        processed: PixelBuffer,
        context: TileRegion,
        tile: &Tile,
        ctx: &NodeContext,
    ) -> ProcessingResult<PixelBuffer> {
        let region = tile.region;
        if processed.dimensions() != (context.width, context.height) {
            return Err(ProcessingError::merge(format!(
                "tile {} context is {:?} after processing, expected {}x{}",
                tile.index,
                processed.dimensions(),
                context.width,
                context.height
            )));
        }
        if context == region {
            return Ok(processed);
        }
        if !context.contains(&region) {
            return Err(ProcessingError::merge(format!(
                "tile {} region {:?} lies outside its context {:?}",
                tile.index, region, context
            )));
        }
        let format = processed.format();
        let offset = region.x - context.x;
        if offset % format.horizontal_alignment() != 0 {
            return Err(ProcessingError::merge(format!(
                "tile {} starts inside a {} pixel group of its context",
                tile.index, format
            )));
        }
        let relative = TileRegion::new(offset, region.y - context.y, region.width, region.height);
        copy_region(&processed, relative, |w, h, format| ctx.allocate(w, h, format))
    }

    /// Reassemble processed tiles into one image of `output_size`.
    ///
    /// `buffers[i]` is the processed content of `tiles[i]`. Tiles are painted
    /// in index order regardless of their position in the slices.
    pub fn merge_tiles(
        &self,
        buffers: &[PixelBuffer],
        tiles: &[Tile],
        output_size: (u32, u32),
    ) -> ProcessingResult<PixelBuffer> {
        if buffers.len() != tiles.len() {
            return Err(ProcessingError::merge(format!(
                "{} processed tiles for {} tile records",
                buffers.len(),
                tiles.len()
            )));
        }
        let first = buffers
            .first()
            .ok_or_else(|| ProcessingError::merge("no tiles to merge"))?;
        let format = first.format();

        let mut order: Vec<usize> = (0..tiles.len()).collect();
        order.sort_by_key(|&i| tiles[i].index);
        for (expected, &i) in order.iter().enumerate() {
            let tile = &tiles[i];
            let buffer = &buffers[i];
            if tile.index != expected {
                return Err(ProcessingError::merge(format!(
                    "tile indices are not contiguous at {}",
                    tile.index
                )));
            }
            if buffer.format() != format {
                return Err(ProcessingError::merge(format!(
                    "tile {} is {} but tile 0 is {}",
                    tile.index,
                    buffer.format(),
                    format
                )));
            }
            if buffer.dimensions() != (tile.region.width, tile.region.height) {
                return Err(ProcessingError::merge(format!(
                    "tile {} is {:?} but its region is {}x{}",
                    tile.index,
                    buffer.dimensions(),
                    tile.region.width,
                    tile.region.height
                )));
            }
            if tile.source_size != output_size
                || !tile.region.is_within_bounds(output_size.0, output_size.1)
            {
                return Err(ProcessingError::merge(format!(
                    "tile {} does not belong to a {:?} image",
                    tile.index, output_size
                )));
            }
        }

        let mut output = first.alloc_like(output_size.0, output_size.1, format)?;
        for &i in &order {
            paint_tile(&mut output, &buffers[i], &tiles[i]);
        }
        Ok(output)
    }
}

impl Default for TileEngine {
    fn default() -> Self {
        Self {
            tile_width: crate::core::config::DEFAULT_TILE_SIZE,
            tile_height: crate::core::config::DEFAULT_TILE_SIZE,
            overlap: crate::core::config::DEFAULT_TILE_OVERLAP,
        }
    }
}

/// Copy `region` of `source` into a buffer from `allocate`.
fn copy_region<A>(source: &PixelBuffer, region: TileRegion, allocate: A) -> ProcessingResult<PixelBuffer>
where
    A: FnOnce(u32, u32, PixelFormat) -> ProcessingResult<PixelBuffer>,
{
    if !region.is_within_bounds(source.width(), source.height()) {
        return Err(ProcessingError::invalid(
            "tile",
            format!(
                "region {:?} exceeds {}x{} image",
                region,
                source.width(),
                source.height()
            ),
        ));
    }
    let format = source.format();
    if region.x % format.horizontal_alignment() != 0 {
        return Err(ProcessingError::invalid(
            "tile",
            format!("region x {} splits a {} pixel group", region.x, format),
        ));
    }

    let mut buffer = allocate(region.width, region.height, format)?;
    let start = format.row_bytes(region.x);
    let len = buffer.row_bytes();
    for (row, dst) in buffer.rows_mut().enumerate() {
        let src = source.row(region.y + row as u32);
        dst.copy_from_slice(&src[start..start + len]);
    }
    Ok(buffer)
}

/// Ramp weight for position `i` within an overlap band (0..overlap).
pub fn ramp_weight(i: u32, overlap: u32) -> u32 {
    let steps = overlap + 1;
    (255 * (i + 1) + steps / 2) / steps
}

fn paint_tile(output: &mut PixelBuffer, tile_buffer: &PixelBuffer, tile: &Tile) {
    let format = output.format();
    let layout = format.sample_layout();
    let region = tile.region;
    let start = format.row_bytes(region.x);
    let len = tile_buffer.row_bytes();
    let blend_left = tile.blends_left() && layout != SampleLayout::Packed12;
    let blend_top = tile.blends_top() && layout != SampleLayout::Packed12;
    let bpp = format.bytes_per_pixel();

    for ry in 0..region.height {
        let src = tile_buffer.row(ry);
        let dst = &mut output.row_mut(region.y + ry)[start..start + len];
        let wy = if blend_top && ry < tile.overlap {
            ramp_weight(ry, tile.overlap)
        } else {
            255
        };

        if wy == 255 && !blend_left {
            dst.copy_from_slice(src);
            continue;
        }

        for rx in 0..region.width {
            let wx = if blend_left && rx < tile.overlap {
                ramp_weight(rx, tile.overlap)
            } else {
                255
            };
            let weight = (wx * wy + 127) / 255;
            let px = rx as usize * bpp;
            blend_pixel(
                &mut dst[px..px + bpp],
                &src[px..px + bpp],
                weight,
                layout,
            );
        }
    }
}

fn blend_pixel(dst: &mut [u8], src: &[u8], weight: u32, layout: SampleLayout) {
    if weight >= 255 {
        dst.copy_from_slice(src);
        return;
    }
    let inverse = 255 - weight;
    match layout {
        SampleLayout::U8 => {
            for (d, &s) in dst.iter_mut().zip(src) {
                *d = ((s as u32 * weight + *d as u32 * inverse + 127) / 255) as u8;
            }
        }
        SampleLayout::U16Le => {
            for (d, s) in dst.chunks_exact_mut(2).zip(src.chunks_exact(2)) {
                let a = u16::from_le_bytes([s[0], s[1]]) as u32;
                let b = u16::from_le_bytes([d[0], d[1]]) as u32;
                let v = ((a * weight + b * inverse + 127) / 255) as u16;
                d.copy_from_slice(&v.to_le_bytes());
            }
        }
        SampleLayout::U16Be => {
            for (d, s) in dst.chunks_exact_mut(2).zip(src.chunks_exact(2)) {
                let a = u16::from_be_bytes([s[0], s[1]]) as u32;
                let b = u16::from_be_bytes([d[0], d[1]]) as u32;
                let v = ((a * weight + b * inverse + 127) / 255) as u16;
                d.copy_from_slice(&v.to_be_bytes());
            }
        }
        SampleLayout::Packed12 => dst.copy_from_slice(src),
    }
}
