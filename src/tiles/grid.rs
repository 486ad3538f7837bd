//! Tile grid geometry for one pyramid level.
//!
//! Tiles are laid out on a stride of `tile_size - overlap` pixels: tile
//! `c` covers source columns starting at `c * stride`, so each tile after
//! the first repeats the last `overlap` pixel columns of its predecessor
//! (and likewise for rows). Stitching drops those repeated leading pixels
//! and keeps the rest, which tiles the full image exactly once.

use super::descriptor::DziDescriptor;

/// Grid of tiles covering one pyramid level.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TileGrid {
    /// Pyramid level this grid addresses.
    pub level: u32,
    /// Image width at this level.
    pub width: u32,
    /// Image height at this level.
    pub height: u32,
    /// Nominal tile edge length.
    pub tile_size: u32,
    /// Pixels shared between adjacent tiles.
    pub overlap: u32,
    /// Number of tile columns.
    pub cols: u32,
    /// Number of tile rows.
    pub rows: u32,
}

/// Where one fetched tile lands in the stitched image.
///
/// `crop_left`/`crop_top` are the leading pixels to drop from the fetched
/// tile; `width`/`height` are the dimensions of what remains. Either may
/// be zero for a degenerate trailing tile that is pure overlap.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TilePlacement {
    pub col: u32,
    pub row: u32,
    pub crop_left: u32,
    pub crop_top: u32,
    pub dest_x: u32,
    pub dest_y: u32,
    pub width: u32,
    pub height: u32,
}

impl TileGrid {
    /// Grid for the deepest level, the full-resolution image.
    #[must_use]
    pub fn at_top_level(descriptor: &DziDescriptor) -> Self {
        Self::for_level(descriptor, descriptor.max_level())
    }

    /// Grid for an arbitrary level, clamped to the deepest one.
    #[must_use]
    pub fn for_level(descriptor: &DziDescriptor, level: u32) -> Self {
        let level = level.min(descriptor.max_level());
        let (width, height) = descriptor.level_dimensions(level);
        let stride = descriptor.tile_size - descriptor.overlap;
        Self {
            level,
            width,
            height,
            tile_size: descriptor.tile_size,
            overlap: descriptor.overlap,
            cols: width.div_ceil(stride),
            rows: height.div_ceil(stride),
        }
    }

    /// Total number of tiles in the grid.
    #[must_use]
    pub fn tile_count(&self) -> usize {
        self.cols as usize * self.rows as usize
    }

    /// Placement for the tile at `(col, row)`.
    #[must_use]
    pub fn placement(&self, col: u32, row: u32) -> TilePlacement {
        let stride = self.tile_size - self.overlap;
        let origin_x = col * stride;
        let origin_y = row * stride;
        let crop_left = if col == 0 { 0 } else { self.overlap };
        let crop_top = if row == 0 { 0 } else { self.overlap };
        TilePlacement {
            col,
            row,
            crop_left,
            crop_top,
            dest_x: origin_x + crop_left,
            dest_y: origin_y + crop_top,
            width: self
                .tile_size
                .min(self.width - origin_x)
                .saturating_sub(crop_left),
            height: self
                .tile_size
                .min(self.height - origin_y)
                .saturating_sub(crop_top),
        }
    }

    /// All placements in row-major order, matching the order tiles are
    /// fetched and handed to the stitcher.
    #[must_use]
    pub fn placements(&self) -> Vec<TilePlacement> {
        (0..self.rows)
            .flat_map(|row| (0..self.cols).map(move |col| self.placement(col, row)))
            .collect()
    }
}
