//! Internet Culturale (ICCU) resolver.
//!
//! Manuscripts are addressed by an OAI identifier carried in the viewer
//! URL. The magparser service answers with an XML page listing; it only
//! does so for sessions that have loaded the viewer once, so the resolver
//! visits the viewer first and relies on the client's cookie store.

use std::borrow::Cow;
use std::sync::LazyLock;

use async_trait::async_trait;
use regex::Regex;
use reqwest::Client;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};

use crate::error::ResolveError;
use crate::http::{browser_headers, build_http_client, fetch_text};
use crate::library::LibraryId;
use crate::manifest::{Manifest, PageImage};
use crate::user_agent;

use super::util::{
    compile_static_regex, dedupe_preserving_order, extract_all_captures, extract_first_capture,
};
use super::{LibraryResolver, ResolveContext};

const DEFAULT_API_BASE: &str = "https://www.internetculturale.it";
const FALLBACK_NAME: &str = "Internet Culturale Manuscript";

static OAI_ID_RE: LazyLock<Regex> = LazyLock::new(|| compile_static_regex(r"[?&]id=([^&]+)"));
static TECA_RE: LazyLock<Regex> = LazyLock::new(|| compile_static_regex(r"[?&]teca=([^&]+)"));
static TITLE_RE: LazyLock<Regex> =
    LazyLock::new(|| compile_static_regex(r#"<info key="Titolo">\s*<value>(.*?)</value>"#));
static PAGE_SRC_RE: LazyLock<Regex> =
    LazyLock::new(|| compile_static_regex(r#"<page[^>]+src="([^"]+)""#));
static CACHEMAN_RE: LazyLock<Regex> =
    LazyLock::new(|| compile_static_regex(r#""([^"]*cacheman[^"]*\.jpe?g)""#));

/// Resolver for internetculturale.it manuscripts.
pub struct InternetCulturaleResolver {
    client: Client,
    api_base: String,
}

impl InternetCulturaleResolver {
    /// Creates a resolver against the production Internet Culturale host.
    ///
    /// # Errors
    ///
    /// Returns [`ResolveError`] when HTTP client construction fails.
    pub fn new() -> Result<Self, ResolveError> {
        Self::with_api_base(DEFAULT_API_BASE)
    }

    /// Creates a resolver calling the magparser service under `api_base`.
    ///
    /// # Errors
    ///
    /// Returns [`ResolveError`] when HTTP client construction fails.
    pub fn with_api_base(api_base: impl Into<String>) -> Result<Self, ResolveError> {
        Ok(Self {
            client: build_http_client("internet-culturale")?,
            api_base: api_base.into(),
        })
    }

    /// Absolute image URL for one listed path, upgraded from the web cache
    /// tier to the full-resolution one.
    fn image_url(&self, path: &str) -> String {
        let path = path.replacen("cacheman/web/", "cacheman/normal/", 1);
        if path.starts_with("http") {
            path
        } else {
            format!("{}/jmms/{path}", self.api_base.trim_end_matches('/'))
        }
    }
}

impl std::fmt::Debug for InternetCulturaleResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InternetCulturaleResolver")
            .field("api_base", &self.api_base)
            .finish_non_exhaustive()
    }
}

fn decode_query_value(raw: &str) -> String {
    urlencoding::decode(raw)
        .map(Cow::into_owned)
        .unwrap_or_else(|_| raw.to_string())
}

/// OAI identifier and owning institution (teca) from a viewer URL.
fn extract_reference(url: &str) -> Result<(String, Option<String>), ResolveError> {
    let oai_id = OAI_ID_RE
        .captures(url)
        .map(|captures| decode_query_value(&captures[1]))
        .ok_or_else(|| ResolveError::malformed(url, "no id= query parameter with an OAI identifier"))?;
    let teca = TECA_RE
        .captures(url)
        .map(|captures| decode_query_value(&captures[1]));
    Ok((oai_id, teca))
}

/// Title fallback taken from the tail of the OAI identifier.
fn title_from_oai_id(oai_id: &str) -> String {
    let tail = oai_id.rsplit(':').next().unwrap_or(oai_id);
    let cleaned = tail.replace('%', " ").trim().to_string();
    if cleaned.is_empty() {
        FALLBACK_NAME.to_string()
    } else {
        cleaned
    }
}

/// Image paths from the magparser XML. The page elements are the normal
/// shape; quoted cacheman paths catch listings without them.
fn extract_page_paths(xml: &str) -> Vec<String> {
    for pattern in [&PAGE_SRC_RE, &CACHEMAN_RE] {
        let paths: Vec<String> = extract_all_captures(xml, pattern)
            .into_iter()
            .filter(|path| path.contains(".jpg") || path.contains(".jpeg"))
            .collect();
        if !paths.is_empty() {
            return paths;
        }
    }
    Vec::new()
}

/// Headers the magparser service expects from the viewer's own script.
fn magparser_headers(viewer_url: &str) -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.insert(
        reqwest::header::USER_AGENT,
        HeaderValue::from_static(user_agent::BROWSER_USER_AGENT),
    );
    headers.insert(
        reqwest::header::ACCEPT,
        HeaderValue::from_static("text/xml, application/xml, */*; q=0.01"),
    );
    headers.insert(
        HeaderName::from_static("x-requested-with"),
        HeaderValue::from_static("XMLHttpRequest"),
    );
    if let Ok(value) = HeaderValue::from_str(viewer_url) {
        headers.insert(reqwest::header::REFERER, value);
    }
    headers
}

#[async_trait]
impl LibraryResolver for InternetCulturaleResolver {
    fn name(&self) -> &str {
        "internet-culturale"
    }

    fn handles(&self, library: LibraryId) -> bool {
        library == LibraryId::InternetCulturale
    }

    #[tracing::instrument(skip(self, ctx), fields(resolver = "internet-culturale", url = %url))]
    async fn resolve(
        &self,
        url: &str,
        _library: LibraryId,
        ctx: &ResolveContext,
    ) -> Result<Manifest, ResolveError> {
        ctx.check_cancelled(url)?;
        let (oai_id, teca) = extract_reference(url)?;

        let timeout = LibraryId::InternetCulturale.timeout_for(url);
        let policy = LibraryId::InternetCulturale.retry_policy();

        // Best effort: the magparser call needs the session cookie this
        // page sets, but an error page can still set it.
        let _ = self
            .client
            .get(url)
            .headers(browser_headers(None))
            .timeout(timeout)
            .send()
            .await;
        ctx.check_cancelled(url)?;

        let api_url = format!(
            "{}/jmms/magparser?id={}&teca={}&mode=all&fulltext=0",
            self.api_base.trim_end_matches('/'),
            urlencoding::encode(&oai_id),
            urlencoding::encode(teca.as_deref().unwrap_or("Unknown")),
        );
        let xml = fetch_text(
            &self.client,
            &api_url,
            timeout,
            &policy,
            Some(&magparser_headers(url)),
            Some(&ctx.cancel),
        )
        .await?;
        if xml.trim().is_empty() {
            return Err(ResolveError::bad_response(
                &api_url,
                "the page service answered with an empty document",
            ));
        }

        let page_urls = dedupe_preserving_order(
            extract_page_paths(&xml)
                .into_iter()
                .map(|path| self.image_url(&path))
                .collect(),
        );
        if page_urls.is_empty() {
            return Err(ResolveError::bad_response(
                &api_url,
                "the page listing contained no image addresses",
            ));
        }
        let images = page_urls
            .into_iter()
            .enumerate()
            .map(|(index, page_url)| PageImage::numbered(page_url, index + 1))
            .collect();

        let mut display_name =
            extract_first_capture(&xml, &TITLE_RE).unwrap_or_else(|| title_from_oai_id(&oai_id));
        if let Some(teca) = &teca {
            display_name = format!("{display_name} ({teca})");
        }

        Ok(Manifest::new(
            display_name,
            LibraryId::InternetCulturale,
            images,
            url,
        ))
    }
}
