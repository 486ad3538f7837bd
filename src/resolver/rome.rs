//! Biblioteca Nazionale Centrale di Roma resolver.
//!
//! The teca digitale has no manifest endpoint; page images live at
//! predictable `/tecadigitale/img/.../{page}/original` addresses and the
//! count is discovered by probing them. The server answers requests for
//! pages past the end with a 200 HTML document rather than a 404, which the
//! probe layer reads as absence.

use std::sync::LazyLock;

use async_trait::async_trait;
use regex::Regex;
use reqwest::Client;
use tracing::debug;

use crate::error::ResolveError;
use crate::http::build_http_client;
use crate::library::LibraryId;
use crate::manifest::{Manifest, PageImage, ResolveWarning};

use super::probe::{DiscoveredCount, discover_count_doubling, discover_count_sampling};
use super::util::compile_static_regex;
use super::{LibraryResolver, ResolveContext};

const DEFAULT_IMAGE_BASE: &str = "http://digitale.bnc.roma.sbn.it";

/// GET samples used when HEAD probing fails outright.
const SAMPLE_PAGES: [u32; 8] = [1, 5, 10, 20, 50, 100, 200, 500];

static ROME_PATH_RE: LazyLock<Regex> =
    LazyLock::new(|| compile_static_regex(r"/(manoscrittoantico|libroantico)/([^/]+)/([^/]+)/(\d+)"));

/// Resolver for digitale.bnc.roma.sbn.it manuscripts and early prints.
pub struct RomeResolver {
    client: Client,
    image_base: String,
}

impl RomeResolver {
    /// Creates a resolver against the production teca digitale host.
    ///
    /// # Errors
    ///
    /// Returns [`ResolveError`] when HTTP client construction fails.
    pub fn new() -> Result<Self, ResolveError> {
        Self::with_image_base(DEFAULT_IMAGE_BASE)
    }

    /// Creates a resolver probing page images under `image_base`.
    ///
    /// # Errors
    ///
    /// Returns [`ResolveError`] when HTTP client construction fails.
    pub fn with_image_base(image_base: impl Into<String>) -> Result<Self, ResolveError> {
        Ok(Self {
            client: build_http_client("rome")?,
            image_base: image_base.into(),
        })
    }

    fn page_url(&self, collection: &str, manuscript_id: &str, page: u32) -> String {
        format!(
            "{}/tecadigitale/img/{collection}/{manuscript_id}/{manuscript_id}/{page}/original",
            self.image_base.trim_end_matches('/')
        )
    }
}

impl std::fmt::Debug for RomeResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RomeResolver")
            .field("image_base", &self.image_base)
            .finish_non_exhaustive()
    }
}

/// Collection type and manuscript id from a viewer URL. The id appears in
/// two consecutive path segments and both must agree.
fn extract_reference(url: &str) -> Result<(String, String), ResolveError> {
    let captures = ROME_PATH_RE
        .captures(url)
        .ok_or_else(|| ResolveError::malformed(url, "no /manoscrittoantico/ or /libroantico/ path"))?;
    let collection = captures[1].to_string();
    let first = &captures[2];
    let second = &captures[3];
    if first != second {
        return Err(ResolveError::malformed(
            url,
            "the two manuscript id path segments disagree",
        ));
    }
    Ok((collection, first.to_string()))
}

#[async_trait]
impl LibraryResolver for RomeResolver {
    fn name(&self) -> &str {
        "rome"
    }

    fn handles(&self, library: LibraryId) -> bool {
        library == LibraryId::Rome
    }

    #[tracing::instrument(skip(self, ctx), fields(resolver = "rome", url = %url))]
    async fn resolve(
        &self,
        url: &str,
        _library: LibraryId,
        ctx: &ResolveContext,
    ) -> Result<Manifest, ResolveError> {
        ctx.check_cancelled(url)?;
        let (collection, manuscript_id) = extract_reference(url)?;

        let timeout = LibraryId::Rome.timeout_for(url);
        let make_url = |page: u32| self.page_url(&collection, &manuscript_id, page);

        let mut discovered =
            match discover_count_doubling(&self.client, &make_url, timeout, ctx).await {
                Ok(discovered) => discovered,
                Err(error) if error.is_cancelled() => return Err(error),
                Err(error) => {
                    debug!(error = %error, "upper-bound probing failed, sampling with GET");
                    DiscoveredCount {
                        count: 0,
                        hit_ceiling: false,
                    }
                }
            };
        if discovered.count == 0 {
            discovered =
                discover_count_sampling(&self.client, &make_url, &SAMPLE_PAGES, timeout, ctx)
                    .await?;
        }
        if discovered.count == 0 {
            return Err(ResolveError::bad_response(
                url,
                "could not determine the manuscript's page count",
            ));
        }

        #[allow(clippy::cast_possible_truncation)]
        let images = (1..=discovered.count)
            .map(|page| PageImage::numbered(make_url(page), page as usize))
            .collect();
        let mut manifest = Manifest::new(manuscript_id, LibraryId::Rome, images, url);
        if discovered.hit_ceiling {
            let scanned = manifest.page_count();
            manifest = manifest.with_warning(ResolveWarning::PaginationLimitReached { scanned });
        }
        Ok(manifest)
    }
}
