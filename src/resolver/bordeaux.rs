//! Bordeaux municipal library resolver.
//!
//! Bordeaux serves manuscripts as Deep Zoom tile pyramids on the selene
//! server, one `.dzi` descriptor per page, with no manifest of any kind.
//! Catalogue URLs never name the tile pyramid directly: the record page
//! embeds a selene viewer iframe whose markup carries the internal tile
//! identifier. Page numbering is not guaranteed to start at 1 or to be
//! contiguous, so the available pages are found by probing level-0 tiles:
//! a cheap scan at fixed positions brackets the range, a detailed scan
//! pins down every page inside it, and a forward scan past the bracket
//! catches manuscripts larger than the largest fixed position.

use std::sync::LazyLock;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::future::join_all;
use regex::Regex;
use reqwest::Client;
use tracing::debug;
use url::Url;

use crate::error::ResolveError;
use crate::http::{browser_headers, build_http_client, fetch_text};
use crate::library::LibraryId;
use crate::manifest::{Manifest, PageImage, ResolveWarning, TileSource};

use super::probe::{Probe, probe_exists_get};
use super::util::{compile_static_regex, extract_first_capture};
use super::{LibraryResolver, ResolveContext};

const DEFAULT_TILE_BASE: &str = "https://selene.bordeaux.fr/in/dz";
const DEFAULT_VIEWER_BASE: &str = "https://selene.bordeaux.fr";

/// Fixed probe positions used to bracket the page range cheaply. Several
/// manuscripts start at page 6 rather than 1, hence the dense low end.
const QUICK_SCAN_PAGES: [u32; 21] = [
    1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 15, 20, 30, 50, 75, 100, 150, 200, 250, 278, 300,
];
/// Margin probed around the quick-scan bracket.
const DETAIL_MARGIN_BEFORE: u32 = 5;
const DETAIL_MARGIN_AFTER: u32 = 10;
/// Consecutive misses that end the forward scan past the bracket.
const TAIL_MAX_MISSES: u32 = 10;

static REPRODUCTION_RE: LazyLock<Regex> =
    LazyLock::new(|| compile_static_regex(r"[?&]REPRODUCTION_ID=(\d+)"));
static ARK_RE: LazyLock<Regex> = LazyLock::new(|| compile_static_regex(r"ark:/\d+/([^/?#]+)"));
static DIRECT_RE: LazyLock<Regex> = LazyLock::new(|| {
    compile_static_regex(r"selene\.bordeaux\.fr/in/dz/([^/]+?)(?:_\d{4})?(?:\.dzi)?$")
});
static SELENE_PAGE_RE: LazyLock<Regex> =
    LazyLock::new(|| compile_static_regex(r"selene/page/([a-f0-9-]+)"));
static INTERNAL_PARTS_RE: LazyLock<Regex> = LazyLock::new(|| compile_static_regex(r"(\d+)_(.+)"));
static IFRAME_RE: LazyLock<Regex> = LazyLock::new(|| {
    compile_static_regex(r#"(?i)<iframe[^>]+src=['"]([^'"]*selene\.bordeaux\.fr[^'"]+)"#)
});
static DZI_REF_RE: LazyLock<Regex> =
    LazyLock::new(|| compile_static_regex(r#"/in/dz/([^"'/\s]+)\.dzi"#));
static SELENE_PATH_RE: LazyLock<Regex> =
    LazyLock::new(|| compile_static_regex(r"/in/dz/([^/?#]+)"));

/// How a Bordeaux URL names its manuscript.
#[derive(Debug, PartialEq, Eq)]
struct ManuscriptRef {
    /// Catalogue-facing identifier, used for the display name.
    public_id: String,
    /// Tile-server identifier, when the URL names it directly.
    internal_id: Option<String>,
}

/// Resolver for manuscripts on the Bordeaux selene tile server.
pub struct BordeauxResolver {
    client: Client,
    tile_base: String,
    viewer_base: String,
}

impl BordeauxResolver {
    /// Creates a resolver against the production selene hosts.
    ///
    /// # Errors
    ///
    /// Returns [`ResolveError`] when HTTP client construction fails.
    pub fn new() -> Result<Self, ResolveError> {
        Self::with_bases(DEFAULT_TILE_BASE, DEFAULT_VIEWER_BASE)
    }

    /// Creates a resolver probing tiles under `tile_base` and fetching
    /// viewer pages under `viewer_base`.
    ///
    /// # Errors
    ///
    /// Returns [`ResolveError`] when HTTP client construction fails.
    pub fn with_bases(
        tile_base: impl Into<String>,
        viewer_base: impl Into<String>,
    ) -> Result<Self, ResolveError> {
        Ok(Self {
            client: build_http_client("bordeaux")?,
            tile_base: tile_base.into(),
            viewer_base: viewer_base.into(),
        })
    }

    fn probe_tile_url(&self, base_id: &str, page: u32) -> String {
        format!(
            "{}/{base_id}_{page:04}_files/0/0_0.jpg",
            self.tile_base.trim_end_matches('/')
        )
    }

    /// Single top-level tile, usable as a directly fetchable page image.
    fn preview_image_url(&self, base_id: &str, page: u32) -> String {
        format!(
            "{}/{base_id}_{page:04}_files/13/0_0.jpg",
            self.tile_base.trim_end_matches('/')
        )
    }

    fn descriptor_url(&self, base_id: &str, page: u32) -> String {
        format!(
            "{}/{base_id}_{page:04}.dzi",
            self.tile_base.trim_end_matches('/')
        )
    }

    /// Rehomes an iframe `src` onto the viewer base: absolute URLs keep
    /// their path and query, relative ones are appended as-is.
    fn iframe_fetch_url(&self, src: &str) -> String {
        let base = self.viewer_base.trim_end_matches('/');
        match Url::parse(src) {
            Ok(parsed) => {
                let mut rebased = format!("{base}{}", parsed.path());
                if let Some(query) = parsed.query() {
                    rebased.push('?');
                    rebased.push_str(query);
                }
                rebased
            }
            Err(_) => format!("{base}{src}"),
        }
    }

    /// Follows the catalogue page's viewer iframe to the internal tile
    /// identifier.
    async fn discover_internal_id(
        &self,
        url: &str,
        public_id: &str,
        ctx: &ResolveContext,
    ) -> Result<String, ResolveError> {
        let policy = LibraryId::Bordeaux.retry_policy();
        let timeout = LibraryId::Bordeaux.timeout_for(url);
        match fetch_text(
            &self.client,
            url,
            timeout,
            &policy,
            Some(&browser_headers(None)),
            Some(&ctx.cancel),
        )
        .await
        {
            Ok(html) => {
                if let Some(src) = extract_first_capture(&html, &IFRAME_RE) {
                    let iframe_url = self.iframe_fetch_url(&src);
                    debug!(iframe_url = %iframe_url, "following the viewer iframe");
                    match fetch_text(
                        &self.client,
                        &iframe_url,
                        timeout,
                        &policy,
                        Some(&browser_headers(Some(url))),
                        Some(&ctx.cancel),
                    )
                    .await
                    {
                        Ok(iframe_html) => {
                            if let Some(id) = extract_first_capture(&iframe_html, &DZI_REF_RE) {
                                return Ok(id);
                            }
                            debug!("viewer iframe references no tile pyramid");
                        }
                        Err(error) if error.is_cancelled() => return Err(error),
                        Err(error) => debug!(error = %error, "viewer iframe unavailable"),
                    }
                }
            }
            Err(error) if error.is_cancelled() => return Err(error),
            Err(error) => debug!(error = %error, "catalogue page unavailable"),
        }
        // The input URL may itself carry the tile path in a form the
        // stricter patterns rejected.
        if let Some(id) = extract_first_capture(url, &SELENE_PATH_RE) {
            return Ok(id);
        }
        Err(ResolveError::bad_response(
            url,
            &format!("could not discover the tile identifier for {public_id}"),
        ))
    }

    /// Finds which page numbers have tile pyramids. Returns the pages in
    /// ascending order, gaps preserved, and whether the scan was cut off
    /// at the safety ceiling.
    async fn discover_available_pages(
        &self,
        base_id: &str,
        timeout: Duration,
        ctx: &ResolveContext,
    ) -> Result<(Vec<u32>, bool), ResolveError> {
        let ceiling = ctx.options.page_ceiling.max(1);
        #[allow(clippy::cast_possible_truncation)]
        let batch_size = ctx.options.fetch_concurrency() as u32;

        let mut min_found = None;
        let mut max_found = None;
        for &page in &QUICK_SCAN_PAGES {
            if page > ceiling {
                break;
            }
            let url = self.probe_tile_url(base_id, page);
            ctx.check_cancelled(&url)?;
            if probe_exists_get(&self.client, &url, timeout).await == Probe::Exists {
                min_found.get_or_insert(page);
                max_found = Some(page);
            }
        }
        let (Some(min_found), Some(max_found)) = (min_found, max_found) else {
            return Ok((Vec::new(), false));
        };
        debug!(min_found, max_found, "quick scan bracketed the page range");

        let lo = min_found.saturating_sub(DETAIL_MARGIN_BEFORE).max(1);
        let hi = max_found.saturating_add(DETAIL_MARGIN_AFTER).min(ceiling);
        let mut pages = Vec::new();
        let mut next = lo;
        while next <= hi {
            ctx.check_cancelled(&self.probe_tile_url(base_id, next))?;
            let batch_end = next.saturating_add(batch_size - 1).min(hi);
            let probes = join_all((next..=batch_end).map(|page| {
                let url = self.probe_tile_url(base_id, page);
                async move { (page, probe_exists_get(&self.client, &url, timeout).await) }
            }))
            .await;
            for (page, outcome) in probes {
                if outcome == Probe::Exists {
                    pages.push(page);
                }
            }
            next = batch_end + 1;
        }

        // The bracket tops out at the largest fixed position; keep
        // scanning forward so larger manuscripts are not cut short.
        let mut misses = 0u32;
        let mut next = hi.saturating_add(1);
        'tail: while next <= ceiling {
            ctx.check_cancelled(&self.probe_tile_url(base_id, next))?;
            let batch_end = next.saturating_add(batch_size - 1).min(ceiling);
            let probes = join_all((next..=batch_end).map(|page| {
                let url = self.probe_tile_url(base_id, page);
                async move { (page, probe_exists_get(&self.client, &url, timeout).await) }
            }))
            .await;
            for (page, outcome) in probes {
                if outcome == Probe::Exists {
                    misses = 0;
                    pages.push(page);
                } else {
                    misses += 1;
                    if misses >= TAIL_MAX_MISSES {
                        break 'tail;
                    }
                }
            }
            next = batch_end + 1;
        }

        let hit_ceiling = next > ceiling && misses < TAIL_MAX_MISSES;
        Ok((pages, hit_ceiling))
    }
}

impl std::fmt::Debug for BordeauxResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BordeauxResolver")
            .field("tile_base", &self.tile_base)
            .field("viewer_base", &self.viewer_base)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl LibraryResolver for BordeauxResolver {
    fn name(&self) -> &str {
        "bordeaux"
    }

    fn handles(&self, library: LibraryId) -> bool {
        library == LibraryId::Bordeaux
    }

    #[tracing::instrument(skip(self, ctx), fields(resolver = "bordeaux", url = %url))]
    async fn resolve(
        &self,
        url: &str,
        _library: LibraryId,
        ctx: &ResolveContext,
    ) -> Result<Manifest, ResolveError> {
        ctx.check_cancelled(url)?;

        let reference = parse_reference(url)?;
        let internal_id = match reference.internal_id {
            Some(id) => id,
            None => {
                self.discover_internal_id(url, &reference.public_id, ctx)
                    .await?
            }
        };
        let base_id = strip_page_suffix(&internal_id).to_string();
        debug!(base_id = %base_id, "resolved tile identifier");

        let timeout = LibraryId::Bordeaux.timeout_for(url);
        let (available, hit_ceiling) = self
            .discover_available_pages(&base_id, timeout, ctx)
            .await?;
        if available.is_empty() {
            return Err(ResolveError::bad_response(
                url,
                "no tile pyramids found for the manuscript",
            ));
        }
        debug!(pages = available.len(), "discovered tiled pages");

        let images = available
            .iter()
            .map(|&page| {
                PageImage::new(
                    self.preview_image_url(&base_id, page),
                    format!("Page {page}"),
                )
            })
            .collect();
        let descriptor_urls = available
            .iter()
            .map(|&page| self.descriptor_url(&base_id, page))
            .collect();

        let mut manifest = Manifest::new(
            format!("Bordeaux - {}", reference.public_id),
            LibraryId::Bordeaux,
            images,
            url,
        )
        .with_tile_source(TileSource { descriptor_urls });
        if hit_ceiling {
            let scanned = manifest.page_count();
            manifest = manifest.with_warning(ResolveWarning::PaginationLimitReached { scanned });
        }
        Ok(manifest)
    }
}

/// Classifies the URL into one of the four accepted shapes.
fn parse_reference(url: &str) -> Result<ManuscriptRef, ResolveError> {
    if let Some(public_id) = extract_first_capture(url, &REPRODUCTION_RE) {
        return Ok(ManuscriptRef {
            public_id,
            internal_id: None,
        });
    }
    if let Some(public_id) = extract_first_capture(url, &ARK_RE) {
        return Ok(ManuscriptRef {
            public_id,
            internal_id: None,
        });
    }
    if let Some(internal_id) = extract_first_capture(url, &DIRECT_RE) {
        // Tile identifiers look like `330636101_MS0778`; the part after
        // the numeric prefix reads better as a title.
        let public_id = INTERNAL_PARTS_RE
            .captures(&internal_id)
            .and_then(|caps| caps.get(2))
            .map_or_else(|| internal_id.clone(), |m| m.as_str().to_string());
        return Ok(ManuscriptRef {
            public_id,
            internal_id: Some(internal_id),
        });
    }
    if let Some(public_id) = extract_first_capture(url, &SELENE_PAGE_RE) {
        return Ok(ManuscriptRef {
            public_id,
            internal_id: None,
        });
    }
    Err(ResolveError::malformed(
        url,
        "expected ?REPRODUCTION_ID={n}, an ark:/ path, a selene/page/ link or a direct tile URL",
    ))
}

/// Drops a trailing `_NNNN` page suffix from a tile identifier.
fn strip_page_suffix(internal_id: &str) -> &str {
    if internal_id.len() > 5 {
        let (head, tail) = internal_id.split_at(internal_id.len() - 5);
        if tail.starts_with('_') && tail[1..].chars().all(|c| c.is_ascii_digit()) {
            return head;
        }
    }
    internal_id
}
