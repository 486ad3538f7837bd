//! Verona NBM resolver: scrapes the viewer page for a mirador manifest
//! reference, then walks the IIIF manifest.
//!
//! The Nuova Biblioteca Manoscritta server is slow and drops connections
//! under load, so every fetch here runs under the library's long retry
//! ladder. Manifests migrated from the old `nbm.regione.veneto.it` host
//! still point their image URLs at it; those are rewritten to the
//! current host.

use std::sync::LazyLock;

use async_trait::async_trait;
use regex::Regex;
use reqwest::Client;
use serde_json::Value;
use tracing::debug;

use crate::error::ResolveError;
use crate::http::{browser_headers, build_http_client, fetch_json, fetch_text};
use crate::iiif::{self, ImageUrlStyle};
use crate::library::LibraryId;
use crate::manifest::Manifest;

use super::util::{compile_static_regex, extract_first_capture};
use super::{LibraryResolver, ResolveContext};

const DEFAULT_MANIFEST_BASE: &str = "https://www.nuovabibliotecamanoscritta.it";
const RETIRED_IMAGE_HOST: &str = "nbm.regione.veneto.it";
const CURRENT_IMAGE_HOST: &str = "www.nuovabibliotecamanoscritta.it";

static SCHEDA_ID_RE: LazyLock<Regex> = LazyLock::new(|| compile_static_regex(r"/scheda/id/(\d+)"));
static CODICE_PARAM_RE: LazyLock<Regex> =
    LazyLock::new(|| compile_static_regex(r"[?&]codice(?:Digital)?=(\d+)"));
static MANIFEST_FILE_RE: LazyLock<Regex> =
    LazyLock::new(|| compile_static_regex(r"(?i)manifest[/\\]([A-Z]+\d+)\.json"));
static MANIFEST_URI_RE: LazyLock<Regex> =
    LazyLock::new(|| compile_static_regex(r#""manifestUri":\s*"([^"]+manifest[^"]+)""#));
static DATA_MANIFEST_RE: LazyLock<Regex> =
    LazyLock::new(|| compile_static_regex(r#"data-manifest="([^"]+)""#));
static MIRADOR_PATH_RE: LazyLock<Regex> =
    LazyLock::new(|| compile_static_regex(r"(?i)mirador_json/manifest/([A-Z]+\d+)"));

/// Resolver for the Nuova Biblioteca Manoscritta (Verona).
pub struct VeronaResolver {
    client: Client,
    manifest_base: String,
}

impl VeronaResolver {
    /// Creates a resolver against the production NBM host.
    ///
    /// # Errors
    ///
    /// Returns [`ResolveError`] when HTTP client construction fails.
    pub fn new() -> Result<Self, ResolveError> {
        Self::with_manifest_base(DEFAULT_MANIFEST_BASE)
    }

    /// Creates a resolver constructing manifest URLs against `manifest_base`.
    ///
    /// # Errors
    ///
    /// Returns [`ResolveError`] when HTTP client construction fails.
    pub fn with_manifest_base(manifest_base: impl Into<String>) -> Result<Self, ResolveError> {
        Ok(Self {
            client: build_http_client("verona")?,
            manifest_base: manifest_base.into(),
        })
    }

    /// Expands a scraped manifest reference into a full URL. Bare IDs like
    /// `CVII1001` become mirador manifest paths; relative paths are rooted
    /// at the manifest base.
    fn manifest_url_from_reference(&self, reference: &str) -> String {
        if reference.starts_with("http") {
            return reference.to_string();
        }
        let base = self.manifest_base.trim_end_matches('/');
        if reference.contains(".json") {
            let separator = if reference.starts_with('/') { "" } else { "/" };
            return format!("{base}{separator}{reference}");
        }
        format!("{base}/documenti/mirador_json/manifest/{reference}.json")
    }

    async fn fetch_manifest(
        &self,
        manifest_url: &str,
        input: &str,
        ctx: &ResolveContext,
    ) -> Result<Manifest, ResolveError> {
        ctx.check_cancelled(input)?;
        let policy = LibraryId::Verona.retry_policy();
        let timeout = LibraryId::Verona.timeout_for(manifest_url);
        let manifest_json: Value = fetch_json(
            &self.client,
            manifest_url,
            timeout,
            &policy,
            None,
            Some(&ctx.cancel),
        )
        .await?;

        let mut pages = iiif::extract_pages(&manifest_json, ImageUrlStyle::Service { size: "max" });
        if pages.is_empty() {
            return Err(ResolveError::bad_response(
                manifest_url,
                "manifest listed no page images",
            ));
        }
        for page in &mut pages {
            if page.url.contains(RETIRED_IMAGE_HOST) {
                page.url = page.url.replace(RETIRED_IMAGE_HOST, CURRENT_IMAGE_HOST);
            }
        }

        let manuscript_id = manifest_url
            .rsplit('/')
            .next()
            .unwrap_or_default()
            .trim_end_matches(".json");
        let display_name = match iiif::manifest_label(&manifest_json) {
            Some(label) if !manuscript_id.is_empty() && !label.contains(manuscript_id) => {
                format!("Verona - {label} ({manuscript_id})")
            }
            Some(label) => format!("Verona - {label}"),
            None => format!("Verona Manuscript {manuscript_id}"),
        };

        Ok(Manifest::new(
            display_name,
            LibraryId::Verona,
            pages,
            input,
        ))
    }
}

impl std::fmt::Debug for VeronaResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VeronaResolver")
            .field("manifest_base", &self.manifest_base)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl LibraryResolver for VeronaResolver {
    fn name(&self) -> &str {
        "verona"
    }

    fn handles(&self, library: LibraryId) -> bool {
        library == LibraryId::Verona
    }

    #[tracing::instrument(skip(self, ctx), fields(resolver = "verona", url = %url))]
    async fn resolve(
        &self,
        url: &str,
        _library: LibraryId,
        ctx: &ResolveContext,
    ) -> Result<Manifest, ResolveError> {
        ctx.check_cancelled(url)?;

        if url.contains("mirador_json/manifest/") {
            debug!("input is already a mirador manifest URL");
            return self.fetch_manifest(url, url, ctx).await;
        }

        let code = extract_first_capture(url, &SCHEDA_ID_RE)
            .or_else(|| extract_first_capture(url, &CODICE_PARAM_RE))
            .ok_or_else(|| {
                ResolveError::malformed(
                    url,
                    "no manuscript code; expected /scheda/id/{n} or a codice parameter",
                )
            })?;

        let policy = LibraryId::Verona.retry_policy();
        let timeout = LibraryId::Verona.timeout_for(url);
        let html = fetch_text(
            &self.client,
            url,
            timeout,
            &policy,
            Some(&browser_headers(None)),
            Some(&ctx.cancel),
        )
        .await?;

        let reference = find_manifest_reference(&html).ok_or_else(|| {
            ResolveError::bad_response(
                url,
                &format!("viewer page for code {code} does not reference a mirador manifest"),
            )
        })?;
        let manifest_url = self.manifest_url_from_reference(&reference);
        debug!(manifest_url = %manifest_url, "discovered manifest reference");

        self.fetch_manifest(&manifest_url, url, ctx).await
    }
}

fn find_manifest_reference(html: &str) -> Option<String> {
    for pattern in [
        &*MANIFEST_FILE_RE,
        &*MANIFEST_URI_RE,
        &*DATA_MANIFEST_RE,
        &*MIRADOR_PATH_RE,
    ] {
        if let Some(value) = extract_first_capture(html, pattern) {
            return Some(value);
        }
    }
    None
}
