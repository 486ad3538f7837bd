//! BNE (Biblioteca Nacional de España) resolver.
//!
//! The Hispánica digital library serves each page as a single-page PDF
//! through `pdf.raw`, addressed purely by document id and page number.
//! The viewer page embeds a model that declares one `_.Leaf.make(...)`
//! call per document section with the section's page count, so the total
//! is read from there when possible and otherwise discovered by probing
//! the page addresses directly.

use std::sync::LazyLock;

use async_trait::async_trait;
use regex::Regex;
use reqwest::Client;
use tracing::debug;

use crate::error::ResolveError;
use crate::http::{browser_headers, build_http_client, fetch_text};
use crate::library::LibraryId;
use crate::manifest::{Manifest, PageImage, ResolveWarning};

use super::probe::{Probe, discover_count_binary, probe_exists};
use super::util::{compile_static_regex, extract_first_capture};
use super::{LibraryResolver, ResolveContext};

const DEFAULT_BASE: &str = "https://bdh-rd.bne.es";

static DOC_ID_RE: LazyLock<Regex> = LazyLock::new(|| compile_static_regex(r"[?&]id=(\d+)"));
static LEAF_COUNT_RE: LazyLock<Regex> =
    LazyLock::new(|| compile_static_regex(r"_\.Leaf\.make\([^)]+?,\s*(\d+),"));
static TOTAL_PAGES_RE: LazyLock<Regex> =
    LazyLock::new(|| compile_static_regex(r#"(?:totalPages|numPages|pageCount)['":\s]+(\d+)"#));

/// Resolver for the Biblioteca Digital Hispánica.
pub struct BneResolver {
    client: Client,
    base_url: String,
}

impl BneResolver {
    /// Creates a resolver against the production BNE host.
    ///
    /// # Errors
    ///
    /// Returns [`ResolveError`] when HTTP client construction fails.
    pub fn new() -> Result<Self, ResolveError> {
        Self::with_base_url(DEFAULT_BASE)
    }

    /// Creates a resolver addressing the viewer and PDF endpoints under
    /// `base_url`.
    ///
    /// # Errors
    ///
    /// Returns [`ResolveError`] when HTTP client construction fails.
    pub fn with_base_url(base_url: impl Into<String>) -> Result<Self, ResolveError> {
        Ok(Self {
            client: build_http_client("bne")?,
            base_url: base_url.into(),
        })
    }

    fn page_url(&self, doc_id: &str, page: u32) -> String {
        format!(
            "{}/pdf.raw?query=id:{doc_id}&page={page}&pdf=true",
            self.base_url.trim_end_matches('/')
        )
    }

    /// Fetches the viewer page and reads the page count out of it. An
    /// unreachable viewer is not fatal; the caller falls back to probing.
    async fn count_from_viewer(
        &self,
        doc_id: &str,
        ctx: &ResolveContext,
    ) -> Result<Option<u32>, ResolveError> {
        let viewer_url = format!(
            "{}/viewer.vm?id={doc_id}",
            self.base_url.trim_end_matches('/')
        );
        let policy = LibraryId::Bne.retry_policy();
        let timeout = LibraryId::Bne.timeout_for(&viewer_url);
        let html = match fetch_text(
            &self.client,
            &viewer_url,
            timeout,
            &policy,
            Some(&browser_headers(None)),
            Some(&ctx.cancel),
        )
        .await
        {
            Ok(html) => html,
            Err(error) if error.is_cancelled() => return Err(error),
            Err(error) => {
                debug!(error = %error, "viewer page unavailable, will probe for the page count");
                return Ok(None);
            }
        };
        Ok(count_from_viewer_html(&html))
    }
}

impl std::fmt::Debug for BneResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BneResolver")
            .field("base_url", &self.base_url)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl LibraryResolver for BneResolver {
    fn name(&self) -> &str {
        "bne"
    }

    fn handles(&self, library: LibraryId) -> bool {
        library == LibraryId::Bne
    }

    #[tracing::instrument(skip(self, ctx), fields(resolver = "bne", url = %url))]
    async fn resolve(
        &self,
        url: &str,
        _library: LibraryId,
        ctx: &ResolveContext,
    ) -> Result<Manifest, ResolveError> {
        ctx.check_cancelled(url)?;

        let doc_id = extract_first_capture(url, &DOC_ID_RE).ok_or_else(|| {
            ResolveError::malformed(url, "no document id; expected viewer.vm?id={number}")
        })?;
        let timeout = LibraryId::Bne.timeout_for(url);
        let make_url = |page: u32| self.page_url(&doc_id, page);

        let (count, hit_ceiling) = match self.count_from_viewer(&doc_id, ctx).await? {
            Some(count) => {
                // The viewer's count is taken on trust only once the first
                // page demonstrably answers.
                ctx.check_cancelled(url)?;
                if probe_exists(&self.client, &make_url(1), timeout).await == Probe::Missing {
                    return Err(ResolveError::bad_response(
                        &make_url(1),
                        "the viewer reports pages but the PDF endpoint has none",
                    ));
                }
                (count, false)
            }
            None => {
                debug!("no page count in the viewer page, probing the PDF endpoint");
                let discovered =
                    discover_count_binary(&self.client, &make_url, timeout, ctx).await?;
                (discovered.count, discovered.hit_ceiling)
            }
        };
        if count == 0 {
            return Err(ResolveError::bad_response(
                url,
                "could not determine the document's page count",
            ));
        }
        debug!(pages = count, "resolved page count");

        #[allow(clippy::cast_possible_truncation)]
        let images = (1..=count)
            .map(|page| PageImage::numbered(make_url(page), page as usize))
            .collect();
        let mut manifest = Manifest::new(
            format!("BNE Document {doc_id}"),
            LibraryId::Bne,
            images,
            url,
        );
        if hit_ceiling {
            let scanned = manifest.page_count();
            manifest = manifest.with_warning(ResolveWarning::PaginationLimitReached { scanned });
        }
        Ok(manifest)
    }
}

/// Reads the page count from the viewer's embedded model: the sum of the
/// per-section `_.Leaf.make(...)` counts when present, otherwise the first
/// `totalPages`-style declaration.
fn count_from_viewer_html(html: &str) -> Option<u32> {
    let mut total = 0u32;
    for caps in LEAF_COUNT_RE.captures_iter(html) {
        if let Some(count) = caps.get(1).and_then(|m| m.as_str().parse::<u32>().ok()) {
            total = total.saturating_add(count);
        }
    }
    if total > 0 {
        return Some(total);
    }
    extract_first_capture(html, &TOTAL_PAGES_RE).and_then(|value| value.parse().ok())
}
