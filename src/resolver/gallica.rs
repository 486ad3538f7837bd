//! Gallica (BnF) resolver.
//!
//! The IIIF manifest is tried first; its canvas count alone decides the
//! page range, since every page image lives at a predictable
//! `f{n}/full/max/0/native.jpg` address. When the manifest is missing or
//! empty, the page count is discovered by probing those addresses with a
//! binary search, and as a last resort by walking a few common document
//! sizes.

use std::sync::LazyLock;

use async_trait::async_trait;
use regex::Regex;
use reqwest::Client;
use serde_json::Value;
use tracing::debug;

use crate::error::ResolveError;
use crate::http::{build_http_client, fetch_json};
use crate::iiif;
use crate::library::LibraryId;
use crate::manifest::{Manifest, PageImage, ResolveWarning};

use super::probe::{Probe, discover_count_binary, probe_exists_get};
use super::util::compile_static_regex;
use super::{LibraryResolver, ResolveContext};

const DEFAULT_BASE: &str = "https://gallica.bnf.fr";

/// Document sizes worth guessing when probing finds nothing.
const COMMON_PAGE_COUNTS: [u32; 7] = [1, 2, 5, 10, 20, 50, 100];

static ARK_RE: LazyLock<Regex> = LazyLock::new(|| compile_static_regex(r"ark:/[^/]+/[^/?\s]+"));

/// Resolver for gallica.bnf.fr documents.
pub struct GallicaResolver {
    client: Client,
    base_url: String,
}

impl GallicaResolver {
    /// Creates a resolver against the production Gallica host.
    ///
    /// # Errors
    ///
    /// Returns [`ResolveError`] when HTTP client construction fails.
    pub fn new() -> Result<Self, ResolveError> {
        Self::with_base_url(DEFAULT_BASE)
    }

    /// Creates a resolver issuing IIIF requests against `base_url`.
    ///
    /// # Errors
    ///
    /// Returns [`ResolveError`] when HTTP client construction fails.
    pub fn with_base_url(base_url: impl Into<String>) -> Result<Self, ResolveError> {
        Ok(Self {
            client: build_http_client("gallica")?,
            base_url: base_url.into(),
        })
    }

    fn page_url(&self, ark: &str, page: u32) -> String {
        format!(
            "{}/iiif/{ark}/f{page}/full/max/0/native.jpg",
            self.base_url.trim_end_matches('/')
        )
    }

    /// Canvas count from the IIIF manifest, with the document label.
    async fn count_from_manifest(
        &self,
        ark: &str,
        ctx: &ResolveContext,
    ) -> Result<(u32, Option<String>), ResolveError> {
        let manifest_url = format!(
            "{}/iiif/{ark}/manifest.json",
            self.base_url.trim_end_matches('/')
        );
        let policy = LibraryId::Gallica.retry_policy();
        let timeout = LibraryId::Gallica.timeout_for(&manifest_url);
        let manifest_json: Value = fetch_json(
            &self.client,
            &manifest_url,
            timeout,
            &policy,
            None,
            Some(&ctx.cancel),
        )
        .await?;

        let sequences = match manifest_json.get("sequences").and_then(Value::as_array) {
            Some(sequences) => sequences.iter().collect::<Vec<_>>(),
            None => vec![&manifest_json],
        };
        let count: usize = sequences
            .iter()
            .map(|sequence| {
                sequence
                    .get("canvases")
                    .or_else(|| sequence.get("items"))
                    .and_then(Value::as_array)
                    .map_or(0, Vec::len)
            })
            .sum();

        let label = iiif::manifest_label(&manifest_json);
        Ok((u32::try_from(count).unwrap_or(u32::MAX), label))
    }

    /// Walks ascending common sizes with GET probes; returns the largest
    /// size whose last page exists.
    async fn count_from_common_sizes(&self, ark: &str, ctx: &ResolveContext) -> u32 {
        let timeout = LibraryId::Gallica.timeout_for(&self.page_url(ark, 1));
        let mut count = 0;
        for candidate in COMMON_PAGE_COUNTS {
            if ctx.check_cancelled(ark).is_err() {
                break;
            }
            match probe_exists_get(&self.client, &self.page_url(ark, candidate), timeout).await {
                Probe::Exists => count = candidate,
                Probe::Missing | Probe::Failed => break,
            }
        }
        count
    }
}

impl std::fmt::Debug for GallicaResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GallicaResolver")
            .field("base_url", &self.base_url)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl LibraryResolver for GallicaResolver {
    fn name(&self) -> &str {
        "gallica"
    }

    fn handles(&self, library: LibraryId) -> bool {
        library == LibraryId::Gallica
    }

    #[tracing::instrument(skip(self, ctx), fields(resolver = "gallica", url = %url))]
    async fn resolve(
        &self,
        url: &str,
        _library: LibraryId,
        ctx: &ResolveContext,
    ) -> Result<Manifest, ResolveError> {
        ctx.check_cancelled(url)?;

        let ark = ARK_RE
            .find(url)
            .map(|m| m.as_str().to_string())
            .ok_or_else(|| ResolveError::malformed(url, "no ark:/ identifier in URL"))?;

        let mut label = None;
        let mut hit_ceiling = false;
        let mut count = match self.count_from_manifest(&ark, ctx).await {
            Ok((count, manifest_label)) => {
                label = manifest_label;
                count
            }
            Err(error) if error.is_cancelled() => return Err(error),
            Err(error) => {
                debug!(error = %error, "manifest unavailable, probing page addresses");
                0
            }
        };

        if count == 0 {
            let make_url = |page: u32| self.page_url(&ark, page);
            match discover_count_binary(&self.client, &make_url, LibraryId::Gallica.timeout_for(url), ctx)
                .await
            {
                Ok(discovered) => {
                    count = discovered.count;
                    hit_ceiling = discovered.hit_ceiling;
                }
                Err(error) if error.is_cancelled() => return Err(error),
                Err(error) => {
                    debug!(error = %error, "binary probing failed, guessing common sizes");
                }
            }
        }
        if count == 0 {
            count = self.count_from_common_sizes(&ark, ctx).await;
        }
        ctx.check_cancelled(url)?;
        if count == 0 {
            return Err(ResolveError::bad_response(
                url,
                "could not determine the document's page count",
            ));
        }

        #[allow(clippy::cast_possible_truncation)]
        let images = (1..=count)
            .map(|page| PageImage::numbered(self.page_url(&ark, page), page as usize))
            .collect();
        let display_name = label.unwrap_or_else(|| format!("Gallica Document {ark}"));

        let mut manifest = Manifest::new(display_name, LibraryId::Gallica, images, url);
        if hit_ceiling {
            let scanned = manifest.page_count();
            manifest = manifest.with_warning(ResolveWarning::PaginationLimitReached { scanned });
        }
        Ok(manifest)
    }
}
