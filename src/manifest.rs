//! Resolved-manifest data model.
//!
//! A [`Manifest`] is built fresh on every resolution request and immutable
//! once returned. Image URLs are the best the resolver could determine, at
//! the highest confirmed-working resolution; reachability of each page is
//! the downloader's concern, not re-checked here.

use serde::{Deserialize, Serialize};

use crate::library::LibraryId;

/// One downloadable page of a manuscript.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageImage {
    /// Fully qualified image URL, directly fetchable by the consumer.
    pub url: String,
    /// Display label for the page (canvas label or `Page {n}`).
    pub label: String,
}

impl PageImage {
    /// Creates a page image with an explicit label.
    #[must_use]
    pub fn new(url: impl Into<String>, label: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            label: label.into(),
        }
    }

    /// Creates a page image labeled `Page {number}` (1-indexed).
    #[must_use]
    pub fn numbered(url: impl Into<String>, number: usize) -> Self {
        Self {
            url: url.into(),
            label: format!("Page {number}"),
        }
    }
}

/// Non-fatal conditions surfaced alongside a usable manifest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum ResolveWarning {
    /// Page discovery hit the configured safety ceiling without finding the
    /// end of the sequence; the manifest holds exactly `scanned` pages.
    PaginationLimitReached {
        /// Number of pages in the truncated manifest.
        scanned: usize,
    },
}

/// Deep Zoom tile pyramid backing a manifest whose pages are tiled.
///
/// `images` on the manifest still hold directly fetchable single-tile
/// fallback URLs; consumers wanting full resolution feed these descriptor
/// URLs to the tile assembly pipeline instead.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TileSource {
    /// One `.dzi` descriptor URL per page, parallel to `images`.
    pub descriptor_urls: Vec<String>,
}

/// Normalized resolution result for one manuscript.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Manifest {
    /// Human-readable title from platform metadata, or the deterministic
    /// `"{Library} {ShortId}"` fallback.
    pub display_name: String,
    /// The platform this manifest was resolved from.
    pub library: LibraryId,
    /// One entry per page, in physical page order.
    pub images: Vec<PageImage>,
    /// The user-supplied input, preserved for provenance.
    pub original_url: String,
    /// Non-fatal conditions encountered during resolution.
    pub warnings: Vec<ResolveWarning>,
    /// Tile pyramid descriptors when pages are Deep Zoom tiled.
    pub tile_source: Option<TileSource>,
}

impl Manifest {
    /// Creates a manifest with no warnings and no tile source.
    #[must_use]
    pub fn new(
        display_name: impl Into<String>,
        library: LibraryId,
        images: Vec<PageImage>,
        original_url: impl Into<String>,
    ) -> Self {
        Self {
            display_name: display_name.into(),
            library,
            images,
            original_url: original_url.into(),
            warnings: Vec::new(),
            tile_source: None,
        }
    }

    /// Number of pages in the manifest.
    #[must_use]
    pub fn page_count(&self) -> usize {
        self.images.len()
    }

    /// Attaches a warning, builder-style.
    #[must_use]
    pub fn with_warning(mut self, warning: ResolveWarning) -> Self {
        self.warnings.push(warning);
        self
    }

    /// Attaches a tile source, builder-style.
    #[must_use]
    pub fn with_tile_source(mut self, tile_source: TileSource) -> Self {
        self.tile_source = Some(tile_source);
        self
    }

    /// True when page discovery was truncated at the safety ceiling.
    #[must_use]
    pub fn hit_pagination_limit(&self) -> bool {
        self.warnings
            .iter()
            .any(|w| matches!(w, ResolveWarning::PaginationLimitReached { .. }))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn sample() -> Manifest {
        Manifest::new(
            "Vat.lat.3773",
            LibraryId::Vatican,
            vec![
                PageImage::numbered("https://digi.vatlib.it/iiif/x/f1.jpg", 1),
                PageImage::numbered("https://digi.vatlib.it/iiif/x/f2.jpg", 2),
            ],
            "https://digi.vatlib.it/view/MSS_Vat.lat.3773",
        )
    }

    #[test]
    fn test_page_count_and_ordering() {
        let manifest = sample();
        assert_eq!(manifest.page_count(), 2);
        assert_eq!(manifest.images[0].label, "Page 1");
        assert_eq!(manifest.images[1].label, "Page 2");
    }

    #[test]
    fn test_warning_detection() {
        let manifest = sample();
        assert!(!manifest.hit_pagination_limit());
        let truncated =
            manifest.with_warning(ResolveWarning::PaginationLimitReached { scanned: 1000 });
        assert!(truncated.hit_pagination_limit());
    }

    #[test]
    fn test_serialization_round_trip() {
        let manifest = sample().with_tile_source(TileSource {
            descriptor_urls: vec!["https://host/in/dz/a_0001.dzi".to_string()],
        });
        let json = serde_json::to_string(&manifest).unwrap();
        let back: Manifest = serde_json::from_str(&json).unwrap();
        assert_eq!(back.page_count(), 2);
        assert_eq!(back.library, LibraryId::Vatican);
        assert_eq!(
            back.tile_source.unwrap().descriptor_urls[0],
            "https://host/in/dz/a_0001.dzi"
        );
    }
}
