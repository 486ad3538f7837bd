//! Morgan Library & Museum resolver.
//!
//! Three input shapes are accepted: a direct image address, an ICA viewer
//! page (ica.themorgan.org), and the main collection site. The collection
//! site is scraped in quality tiers; the ZIF tile sources carry the full
//! scan and win over the jpg derivatives when present.

use std::sync::LazyLock;

use async_trait::async_trait;
use regex::Regex;
use reqwest::Client;
use url::Url;

use crate::error::ResolveError;
use crate::http::{build_http_client, fetch_text};
use crate::library::LibraryId;
use crate::manifest::{Manifest, PageImage};

use super::util::{compile_static_regex, dedupe_preserving_order, extract_first_capture};
use super::{LibraryResolver, ResolveContext};

const DEFAULT_MAIN_BASE: &str = "https://www.themorgan.org";
const DEFAULT_ICA_BASE: &str = "https://ica.themorgan.org";
const DEFAULT_FACSIMILE_BASE: &str = "https://host.themorgan.org";

static DIRECT_IMAGE_RE: LazyLock<Regex> =
    LazyLock::new(|| compile_static_regex(r"(?i)\.(?:jpg|jpeg|png|gif)$"));
static ICA_PATH_RE: LazyLock<Regex> =
    LazyLock::new(|| compile_static_regex(r"/manuscript/(?:thumbs|page)/(\d+)"));
static MAIN_MS_RE: LazyLock<Regex> =
    LazyLock::new(|| compile_static_regex(r"/manuscripts?/(\d+)"));
static COLLECTION_RE: LazyLock<Regex> =
    LazyLock::new(|| compile_static_regex(r"/collection/([^/?#]+)"));
static ZIF_SOURCE_RE: LazyLock<Regex> =
    LazyLock::new(|| compile_static_regex(r#"/images/collection/([^"'?]+)\.jpg"#));
static VALID_IMAGE_ID_RE: LazyLock<Regex> = LazyLock::new(|| compile_static_regex(r"\d+v?_\d+"));
static FULL_SIZE_RE: LazyLock<Regex> =
    LazyLock::new(|| compile_static_regex(r#"/sites/default/files/images/collection/[^"'?]+\.jpg"#));
static STYLED_RE: LazyLock<Regex> = LazyLock::new(|| {
    compile_static_regex(r#"/sites/default/files/styles/[^"']*/public/images/collection/[^"'?]+\.jpg"#)
});
static STYLE_STRIP_RE: LazyLock<Regex> =
    LazyLock::new(|| compile_static_regex(r"/styles/[^/]+/public/"));
static FACSIMILE_RE: LazyLock<Regex> =
    LazyLock::new(|| compile_static_regex(r#"/sites/default/files/facsimile/[^"']+\.jpg"#));
static ICA_IMAGE_RE: LazyLock<Regex> = LazyLock::new(|| {
    compile_static_regex(r#"(?i)(?:https?://ica\.themorgan\.org/)?icaimages/\d+/[^"']+\.(?:jpg|jpeg|png)"#)
});
static ICA_ZOOM_RE: LazyLock<Regex> =
    LazyLock::new(|| compile_static_regex(r#"(?i)data-zoom-image="([^"]+icaimages[^"]+)""#));
static TITLE_TAG_RE: LazyLock<Regex> =
    LazyLock::new(|| compile_static_regex(r"<title[^>]*>([^<]+)"));
static MORGAN_SUFFIX_RE: LazyLock<Regex> =
    LazyLock::new(|| compile_static_regex(r"(?i)\s*\|\s*The Morgan Library.*$"));
static MS_ID_RE: LazyLock<Regex> = LazyLock::new(|| compile_static_regex(r"(?i)MS\s+M\.?\s*(\d+)"));

/// Resolver for themorgan.org collection pages and ICA viewers.
pub struct MorganResolver {
    client: Client,
    main_base: String,
    ica_base: String,
    facsimile_base: String,
}

impl MorganResolver {
    /// Creates a resolver against the production Morgan hosts.
    ///
    /// # Errors
    ///
    /// Returns [`ResolveError`] when HTTP client construction fails.
    pub fn new() -> Result<Self, ResolveError> {
        Self::with_hosts(DEFAULT_MAIN_BASE, DEFAULT_ICA_BASE, DEFAULT_FACSIMILE_BASE)
    }

    /// Creates a resolver with explicit collection, ICA, and facsimile
    /// hosts.
    ///
    /// # Errors
    ///
    /// Returns [`ResolveError`] when HTTP client construction fails.
    pub fn with_hosts(
        main_base: impl Into<String>,
        ica_base: impl Into<String>,
        facsimile_base: impl Into<String>,
    ) -> Result<Self, ResolveError> {
        Ok(Self {
            client: build_http_client("morgan")?,
            main_base: main_base.into(),
            ica_base: ica_base.into(),
            facsimile_base: facsimile_base.into(),
        })
    }

    /// Keeps the input's path but swaps the host for the configured
    /// collection host.
    fn rebased_page_url(&self, url: &str) -> String {
        match Url::parse(url) {
            Ok(parsed) => format!("{}{}", self.main_base.trim_end_matches('/'), parsed.path()),
            Err(_) => url.to_string(),
        }
    }

    /// Image addresses from an ICA viewer page, in listing order.
    fn ica_images(&self, html: &str) -> Vec<String> {
        let base = self.ica_base.trim_end_matches('/');
        let mut references: Vec<String> = ICA_IMAGE_RE
            .find_iter(html)
            .map(|found| found.as_str().to_string())
            .collect();
        references.extend(
            ICA_ZOOM_RE
                .captures_iter(html)
                .map(|captures| captures[1].to_string()),
        );

        dedupe_preserving_order(
            references
                .into_iter()
                .map(|reference| {
                    if reference.starts_with("http") {
                        reference
                    } else {
                        format!("{base}/{}", reference.trim_start_matches('/'))
                    }
                })
                .collect(),
        )
    }

    /// Image addresses from a collection page, best quality tier first.
    fn main_site_images(&self, html: &str, manuscript_id: &str) -> Vec<String> {
        let main = self.main_base.trim_end_matches('/');
        let facsimile = self.facsimile_base.trim_end_matches('/');

        let zif: Vec<String> = ZIF_SOURCE_RE
            .captures_iter(html)
            .filter_map(|captures| {
                let image_id = captures[1].to_string();
                let usable =
                    VALID_IMAGE_ID_RE.is_match(&image_id) && !image_id.contains("front-cover");
                usable.then(|| {
                    format!("{facsimile}/facsimile/images/{manuscript_id}/{image_id}.zif")
                })
            })
            .collect();
        let full_size: Vec<String> = FULL_SIZE_RE
            .find_iter(html)
            .map(|found| format!("{main}{}", found.as_str()))
            .collect();
        let styled: Vec<String> = STYLED_RE
            .find_iter(html)
            .map(|found| format!("{main}{}", STYLE_STRIP_RE.replace(found.as_str(), "/")))
            .collect();
        let legacy_facsimile: Vec<String> = FACSIMILE_RE
            .find_iter(html)
            .map(|found| format!("{main}{}", found.as_str()))
            .collect();

        for tier in [zif, full_size, styled, legacy_facsimile] {
            let tier = dedupe_preserving_order(tier);
            if !tier.is_empty() {
                return tier;
            }
        }
        Vec::new()
    }
}

impl std::fmt::Debug for MorganResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MorganResolver")
            .field("main_base", &self.main_base)
            .field("ica_base", &self.ica_base)
            .finish_non_exhaustive()
    }
}

/// Display name from the page title, falling back to `default_name`. A
/// shelfmark reference is appended when the page mentions one.
fn display_name_from_html(html: &str, default_name: String) -> String {
    let mut display_name = default_name;
    if let Some(title) = extract_first_capture(html, &TITLE_TAG_RE) {
        let cleaned = MORGAN_SUFFIX_RE.replace(&title, "").trim().to_string();
        if !cleaned.is_empty() && cleaned != "The Morgan Library & Museum" {
            display_name = cleaned;
        }
    }
    if let Some(captures) = MS_ID_RE.captures(html) {
        display_name = format!("{display_name} (MS M.{})", &captures[1]);
    }
    display_name
}

#[async_trait]
impl LibraryResolver for MorganResolver {
    fn name(&self) -> &str {
        "morgan"
    }

    fn handles(&self, library: LibraryId) -> bool {
        library == LibraryId::Morgan
    }

    #[tracing::instrument(skip(self, ctx), fields(resolver = "morgan", url = %url))]
    async fn resolve(
        &self,
        url: &str,
        _library: LibraryId,
        ctx: &ResolveContext,
    ) -> Result<Manifest, ResolveError> {
        ctx.check_cancelled(url)?;
        let timeout = LibraryId::Morgan.timeout_for(url);
        let policy = LibraryId::Morgan.retry_policy();

        // A pasted image address needs no scraping at all.
        if DIRECT_IMAGE_RE.is_match(url) {
            let filename = url.rsplit('/').next().unwrap_or("Morgan Image").to_string();
            let image = PageImage::new(url, filename.clone());
            return Ok(Manifest::new(filename, LibraryId::Morgan, vec![image], url));
        }

        if let Some(captures) = ICA_PATH_RE.captures(url) {
            let manuscript_id = captures[1].to_string();
            let page_url = format!(
                "{}/manuscript/thumbs/{manuscript_id}",
                self.ica_base.trim_end_matches('/')
            );
            let html = fetch_text(
                &self.client,
                &page_url,
                timeout,
                &policy,
                None,
                Some(&ctx.cancel),
            )
            .await?;
            let images: Vec<PageImage> = self
                .ica_images(&html)
                .into_iter()
                .enumerate()
                .map(|(index, image_url)| PageImage::numbered(image_url, index + 1))
                .collect();
            if images.is_empty() {
                return Err(ResolveError::bad_response(
                    &page_url,
                    "the viewer page lists no images",
                ));
            }
            let display_name = display_name_from_html(
                &html,
                format!("Morgan ICA Manuscript {manuscript_id}"),
            );
            return Ok(Manifest::new(display_name, LibraryId::Morgan, images, url));
        }

        let manuscript_id = MAIN_MS_RE
            .captures(url)
            .or_else(|| COLLECTION_RE.captures(url))
            .map(|captures| captures[1].to_string())
            .ok_or_else(|| {
                ResolveError::malformed(url, "not a recognized Morgan viewer or image address")
            })?;
        let page_url = if url.contains("/collection/") {
            format!(
                "{}/collection/{manuscript_id}/thumbs",
                self.main_base.trim_end_matches('/')
            )
        } else {
            self.rebased_page_url(url)
        };

        let html = fetch_text(
            &self.client,
            &page_url,
            timeout,
            &policy,
            None,
            Some(&ctx.cancel),
        )
        .await?;
        let images: Vec<PageImage> = self
            .main_site_images(&html, &manuscript_id)
            .into_iter()
            .enumerate()
            .map(|(index, image_url)| PageImage::numbered(image_url, index + 1))
            .collect();
        if images.is_empty() {
            return Err(ResolveError::bad_response(
                &page_url,
                "no images found on the collection page",
            ));
        }
        let display_name =
            display_name_from_html(&html, format!("Morgan Library {manuscript_id}"));
        Ok(Manifest::new(display_name, LibraryId::Morgan, images, url))
    }
}
