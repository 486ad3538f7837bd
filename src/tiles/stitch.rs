//! Tile compositing.
//!
//! Overlap pixels are cropped, never blended: each tile contributes its
//! leading overlap only when it sits on the image boundary, so every
//! source pixel is written exactly once.

use image::{RgbImage, imageops};

use super::grid::TileGrid;

/// Composites fetched tiles into a single image of exactly
/// `grid.width x grid.height` pixels.
///
/// `tiles` holds the decoded tiles in row-major order, matching
/// [`TileGrid::placements`]. Tile dimensions are taken from the decoded
/// images themselves, so undersized edge tiles and degenerate
/// overlap-only tiles place what they actually carry.
#[must_use]
pub fn stitch(grid: &TileGrid, tiles: &[RgbImage]) -> RgbImage {
    let mut canvas = RgbImage::new(grid.width, grid.height);
    for (placement, tile) in grid.placements().iter().zip(tiles) {
        let width = placement
            .width
            .min(tile.width().saturating_sub(placement.crop_left));
        let height = placement
            .height
            .min(tile.height().saturating_sub(placement.crop_top));
        if width == 0 || height == 0 {
            continue;
        }
        let piece =
            imageops::crop_imm(tile, placement.crop_left, placement.crop_top, width, height)
                .to_image();
        imageops::replace(
            &mut canvas,
            &piece,
            i64::from(placement.dest_x),
            i64::from(placement.dest_y),
        );
    }
    canvas
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::tiles::descriptor::DziDescriptor;
    use image::Rgb;

    fn descriptor(width: u32, height: u32, tile_size: u32, overlap: u32) -> DziDescriptor {
        DziDescriptor {
            base_url: "https://tiles.example/page".to_string(),
            format: "jpg".to_string(),
            tile_size,
            overlap,
            width,
            height,
        }
    }

    /// Cuts a source image into tiles the way a Deep Zoom server serves
    /// them: strided origins, each tile carrying its leading overlap.
    fn cut_tiles(source: &RgbImage, grid: &TileGrid) -> Vec<RgbImage> {
        grid.placements()
            .iter()
            .map(|p| {
                imageops::crop_imm(
                    source,
                    p.dest_x - p.crop_left,
                    p.dest_y - p.crop_top,
                    p.width + p.crop_left,
                    p.height + p.crop_top,
                )
                .to_image()
            })
            .collect()
    }

    fn gradient(width: u32, height: u32) -> RgbImage {
        RgbImage::from_fn(width, height, |x, y| {
            Rgb([(x % 251) as u8, (y % 241) as u8, ((x + y) % 239) as u8])
        })
    }

    // ==================== Round trips ====================

    #[test]
    fn test_stitched_gradient_matches_the_source_pixel_for_pixel() {
        let source = gradient(1000, 800);
        let grid = TileGrid::at_top_level(&descriptor(1000, 800, 256, 1));
        let tiles = cut_tiles(&source, &grid);

        let stitched = stitch(&grid, &tiles);
        assert_eq!((stitched.width(), stitched.height()), (1000, 800));
        assert!(stitched == source, "stitched image differs from the source");
    }

    #[test]
    fn test_wide_overlap_and_small_tiles_still_round_trip() {
        let source = gradient(20, 13);
        let grid = TileGrid::at_top_level(&descriptor(20, 13, 8, 2));
        assert_eq!((grid.cols, grid.rows), (4, 3));

        let stitched = stitch(&grid, &cut_tiles(&source, &grid));
        assert!(stitched == source, "stitched image differs from the source");
    }

    #[test]
    fn test_solid_color_grid_stitches_without_seams() {
        let color = Rgb([180u8, 20, 20]);
        let source = RgbImage::from_pixel(300, 200, color);
        let grid = TileGrid::at_top_level(&descriptor(300, 200, 64, 1));
        let stitched = stitch(&grid, &cut_tiles(&source, &grid));

        assert_eq!((stitched.width(), stitched.height()), (300, 200));
        for (_, _, pixel) in stitched.enumerate_pixels() {
            assert_eq!(*pixel, color);
        }
    }

    // ==================== Degenerate shapes ====================

    #[test]
    fn test_overlap_only_trailing_tiles_contribute_nothing() {
        // 256 wide on a 255 stride: the second column is pure overlap.
        let source = gradient(256, 100);
        let grid = TileGrid::at_top_level(&descriptor(256, 100, 256, 1));
        assert_eq!(grid.cols, 2);

        let stitched = stitch(&grid, &cut_tiles(&source, &grid));
        assert!(stitched == source, "stitched image differs from the source");
    }

    #[test]
    fn test_undersized_tiles_clamp_instead_of_panicking() {
        let source = gradient(20, 13);
        let grid = TileGrid::at_top_level(&descriptor(20, 13, 8, 2));
        let mut tiles = cut_tiles(&source, &grid);
        tiles[1] = RgbImage::new(3, 3);

        let stitched = stitch(&grid, &tiles);
        assert_eq!((stitched.width(), stitched.height()), (20, 13));
        assert_eq!(stitched.get_pixel(0, 0), source.get_pixel(0, 0));
    }
}
