//! BDL (Biblioteca Digitale Lombarda) resolver.
//!
//! The bookreader API returns one JSON record per page carrying media
//! server ids. Under the default catalog scheme every page becomes a
//! cantaloupe IIIF URL at 2048px width; the native scheme prefers the
//! per-page PDF endpoint where a page has one, falling back to IIIF.
//! Records repeat media ids, so pages are deduplicated in order.

use std::sync::LazyLock;

use async_trait::async_trait;
use regex::Regex;
use reqwest::Client;
use serde_json::Value;
use std::collections::HashSet;
use tracing::debug;

use crate::error::ResolveError;
use crate::http::{build_http_client, fetch_json};
use crate::library::LibraryId;
use crate::manifest::{Manifest, PageImage};

use super::util::{compile_static_regex, extract_first_capture, json_id_string};
use super::{CatalogScheme, LibraryResolver, ResolveContext};

const DEFAULT_API_BASE: &str = "https://www.bdl.servizirl.it";
const DEFAULT_CANTALOUPE_BASE: &str = "https://www.bdl.servizirl.it/cantaloupe/";

/// Cantaloupe is slow above this width; 2048px keeps downloads reliable.
const IIIF_WIDTH: u32 = 2048;

static OGGETTO_RE: LazyLock<Regex> = LazyLock::new(|| compile_static_regex(r"BDL-OGGETTO-(\d+)"));
static CD_OGGETTO_RE: LazyLock<Regex> = LazyLock::new(|| compile_static_regex(r"cdOggetto=(\d+)"));
static PATH_PARAM_RE: LazyLock<Regex> =
    LazyLock::new(|| compile_static_regex(r"(?i)path=([a-z]+)"));

/// Resolver for the Biblioteca Digitale Lombarda.
pub struct BdlResolver {
    client: Client,
    api_base: String,
}

impl BdlResolver {
    /// Creates a resolver against the production BDL host.
    ///
    /// # Errors
    ///
    /// Returns [`ResolveError`] when HTTP client construction fails.
    pub fn new() -> Result<Self, ResolveError> {
        Self::with_api_base(DEFAULT_API_BASE)
    }

    /// Creates a resolver issuing bookreader API requests against `api_base`.
    ///
    /// # Errors
    ///
    /// Returns [`ResolveError`] when HTTP client construction fails.
    pub fn with_api_base(api_base: impl Into<String>) -> Result<Self, ResolveError> {
        Ok(Self {
            client: build_http_client("bdl")?,
            api_base: api_base.into(),
        })
    }
}

impl std::fmt::Debug for BdlResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BdlResolver")
            .field("api_base", &self.api_base)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl LibraryResolver for BdlResolver {
    fn name(&self) -> &str {
        "bdl"
    }

    fn handles(&self, library: LibraryId) -> bool {
        library == LibraryId::Bdl
    }

    #[tracing::instrument(skip(self, ctx), fields(resolver = "bdl", url = %url))]
    async fn resolve(
        &self,
        url: &str,
        _library: LibraryId,
        ctx: &ResolveContext,
    ) -> Result<Manifest, ResolveError> {
        ctx.check_cancelled(url)?;

        let object_id = extract_first_capture(url, &OGGETTO_RE)
            .or_else(|| extract_first_capture(url, &CD_OGGETTO_RE))
            .ok_or_else(|| {
                ResolveError::malformed(
                    url,
                    "no object id; expected a BDL-OGGETTO-{n} segment or a cdOggetto parameter",
                )
            })?;

        let api_url = format!(
            "{}/bdl/public/rest/json/item/{object_id}/bookreader/pages",
            self.api_base.trim_end_matches('/')
        );
        let policy = LibraryId::Bdl.retry_policy();
        let timeout = LibraryId::Bdl.timeout_for(&api_url);
        let records: Vec<Value> = fetch_json(
            &self.client,
            &api_url,
            timeout,
            &policy,
            None,
            Some(&ctx.cancel),
        )
        .await?;

        let images = page_images(&records, ctx.options.catalog_scheme);
        if images.is_empty() {
            return Err(ResolveError::bad_response(
                &api_url,
                "bookreader listed no downloadable pages",
            ));
        }
        debug!(
            pages = images.len(),
            records = records.len(),
            "deduplicated bookreader records"
        );

        let library_code = extract_first_capture(url, &PATH_PARAM_RE)
            .map(|code| code.to_uppercase());
        let display_name = match library_code {
            Some(code) => format!("BDL {code} {object_id}"),
            None => format!("BDL {object_id}"),
        };

        Ok(Manifest::new(display_name, LibraryId::Bdl, images, url))
    }
}

fn iiif_page_url(record: &Value, media_id: &str) -> String {
    let base = record
        .get("cantaloupeUrl")
        .and_then(Value::as_str)
        .filter(|b| !b.is_empty())
        .unwrap_or(DEFAULT_CANTALOUPE_BASE);
    format!(
        "{}/iiif/2/{media_id}/full/{IIIF_WIDTH},/0/default.jpg",
        base.trim_end_matches('/')
    )
}

fn page_images(records: &[Value], scheme: CatalogScheme) -> Vec<PageImage> {
    let mut seen: HashSet<String> = HashSet::new();
    let mut images = Vec::new();

    for record in records {
        let pdf_id = record.get("idMediaServerPdf").and_then(json_id_string);
        let pdf_base = record
            .get("mediaServerPdf")
            .and_then(Value::as_str)
            .filter(|b| !b.is_empty());
        let media_id = record.get("idMediaServer").and_then(json_id_string);

        if scheme == CatalogScheme::NativeItemApi
            && let (Some(pdf_id), Some(pdf_base)) = (&pdf_id, pdf_base)
        {
            if seen.insert(format!("pdf_{pdf_id}")) {
                let url = format!("{pdf_base}{pdf_id}.pdf");
                images.push(PageImage::numbered(url, images.len() + 1));
            }
            // Duplicate records carrying this page's media id must not
            // re-add it as an image.
            if let Some(media_id) = &media_id {
                seen.insert(media_id.clone());
            }
            continue;
        }

        if let Some(media_id) = media_id
            && seen.insert(media_id.clone())
        {
            let url = iiif_page_url(record, &media_id);
            images.push(PageImage::numbered(url, images.len() + 1));
        }
    }
    images
}
