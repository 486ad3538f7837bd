//! Deep Zoom Image descriptor parsing.
//!
//! A `.dzi` descriptor is a one-element XML document naming the full image
//! dimensions, the tile size, the overlap between adjacent tiles, and the
//! tile file format. The attributes are pulled out with regular
//! expressions; attribute order and namespace prefixes vary between
//! servers, the attribute names do not.

use std::sync::LazyLock;

use regex::Regex;

use crate::error::ResolveError;
use crate::resolver::util::compile_static_regex;

/// Largest accepted image dimension per side. A descriptor beyond the cap
/// is rejected rather than silently cropped.
pub const MAX_STITCHED_DIMENSION: u32 = 16_384;

const DEFAULT_TILE_SIZE: u32 = 256;
const DEFAULT_OVERLAP: u32 = 1;
const DEFAULT_FORMAT: &str = "jpg";

static TILE_SIZE_RE: LazyLock<Regex> =
    LazyLock::new(|| compile_static_regex(r#"TileSize\s*=\s*"(\d+)""#));
static OVERLAP_RE: LazyLock<Regex> =
    LazyLock::new(|| compile_static_regex(r#"Overlap\s*=\s*"(\d+)""#));
static FORMAT_RE: LazyLock<Regex> =
    LazyLock::new(|| compile_static_regex(r#"Format\s*=\s*"([A-Za-z0-9]+)""#));
static WIDTH_RE: LazyLock<Regex> =
    LazyLock::new(|| compile_static_regex(r#"Width\s*=\s*"(\d+)""#));
static HEIGHT_RE: LazyLock<Regex> =
    LazyLock::new(|| compile_static_regex(r#"Height\s*=\s*"(\d+)""#));

/// Parsed `.dzi` descriptor for one tile pyramid.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DziDescriptor {
    /// Descriptor URL with its `.dzi`/`.xml` extension removed; tile URLs
    /// hang off `{base_url}_files/`.
    pub base_url: String,
    /// Tile file extension, e.g. `jpg`.
    pub format: String,
    /// Nominal tile edge length in pixels.
    pub tile_size: u32,
    /// Pixels shared between adjacent tiles.
    pub overlap: u32,
    /// Full image width at the deepest level.
    pub width: u32,
    /// Full image height at the deepest level.
    pub height: u32,
}

impl DziDescriptor {
    /// Parses descriptor XML fetched from `descriptor_url`.
    ///
    /// `TileSize`, `Overlap`, and `Format` fall back to the Deep Zoom
    /// defaults (256, 1, `jpg`) when absent; `Width` and `Height` are
    /// required and must be positive.
    ///
    /// # Errors
    ///
    /// Returns [`ResolveError::InvalidDescriptor`] when a dimension is
    /// missing, zero, or beyond [`MAX_STITCHED_DIMENSION`], or when the
    /// tile size does not exceed the overlap.
    pub fn parse(descriptor_url: &str, xml: &str) -> Result<Self, ResolveError> {
        let width = required_dimension(xml, &WIDTH_RE, "Width", descriptor_url)?;
        let height = required_dimension(xml, &HEIGHT_RE, "Height", descriptor_url)?;
        let tile_size = attr_u32(xml, &TILE_SIZE_RE).unwrap_or(DEFAULT_TILE_SIZE);
        let overlap = attr_u32(xml, &OVERLAP_RE).unwrap_or(DEFAULT_OVERLAP);
        let format = FORMAT_RE
            .captures(xml)
            .and_then(|caps| caps.get(1))
            .map_or_else(|| DEFAULT_FORMAT.to_string(), |m| m.as_str().to_string());

        if tile_size <= overlap {
            return Err(ResolveError::invalid_descriptor(
                descriptor_url,
                &format!("tile size {tile_size} does not exceed the overlap of {overlap}"),
            ));
        }
        if width > MAX_STITCHED_DIMENSION || height > MAX_STITCHED_DIMENSION {
            return Err(ResolveError::invalid_descriptor(
                descriptor_url,
                &format!(
                    "image is {width}x{height} pixels, beyond the {MAX_STITCHED_DIMENSION} per-side cap"
                ),
            ));
        }

        Ok(Self {
            base_url: strip_descriptor_extension(descriptor_url).to_string(),
            format,
            tile_size,
            overlap,
            width,
            height,
        })
    }

    /// Deepest pyramid level, `ceil(log2(max(width, height)))`. Level 0 is
    /// a single pixel.
    #[must_use]
    pub fn max_level(&self) -> u32 {
        ceil_log2(self.width.max(self.height))
    }

    /// Image dimensions at a pyramid level. Each level above halves the
    /// one below it, rounding up; levels above the deepest clamp to the
    /// full dimensions.
    #[must_use]
    pub fn level_dimensions(&self, level: u32) -> (u32, u32) {
        let shift = self.max_level().saturating_sub(level);
        (halved(self.width, shift), halved(self.height, shift))
    }

    /// URL of one tile.
    #[must_use]
    pub fn tile_url(&self, level: u32, col: u32, row: u32) -> String {
        format!(
            "{}_files/{level}/{col}_{row}.{}",
            self.base_url, self.format
        )
    }
}

fn attr_u32(xml: &str, pattern: &Regex) -> Option<u32> {
    pattern
        .captures(xml)
        .and_then(|caps| caps.get(1))
        .and_then(|m| m.as_str().parse().ok())
}

fn required_dimension(
    xml: &str,
    pattern: &Regex,
    name: &str,
    descriptor_url: &str,
) -> Result<u32, ResolveError> {
    match attr_u32(xml, pattern) {
        Some(0) => Err(ResolveError::invalid_descriptor(
            descriptor_url,
            &format!("{name} must be positive"),
        )),
        Some(value) => Ok(value),
        None => Err(ResolveError::invalid_descriptor(
            descriptor_url,
            &format!("missing the {name} attribute"),
        )),
    }
}

fn strip_descriptor_extension(url: &str) -> &str {
    url.strip_suffix(".dzi")
        .or_else(|| url.strip_suffix(".xml"))
        .unwrap_or(url)
}

fn ceil_log2(value: u32) -> u32 {
    if value <= 1 {
        0
    } else {
        u32::BITS - (value - 1).leading_zeros()
    }
}

fn halved(dimension: u32, times: u32) -> u32 {
    // times is bounded by max_level, itself at most 14 under the size cap.
    dimension.div_ceil(1 << times).max(1)
}
