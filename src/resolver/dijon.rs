//! Dijon Patrimoine resolver for the Pleade image server at
//! `patrimoine.bm-dijon.fr`.
//!
//! The image server publishes a `dir.json` per manuscript listing every
//! page with several versions; the full-size one is whichever version is
//! not under `__thumbs__`.

use std::sync::LazyLock;

use async_trait::async_trait;
use regex::Regex;
use reqwest::Client;
use serde_json::Value;

use crate::error::ResolveError;
use crate::http::{build_http_client, fetch_json};
use crate::library::LibraryId;
use crate::manifest::{Manifest, PageImage};

use super::util::{compile_static_regex, extract_first_capture};
use super::{LibraryResolver, ResolveContext};

const DEFAULT_SERVER_BASE: &str = "http://patrimoine.bm-dijon.fr";

static VIEWER_PATH_RE: LazyLock<Regex> =
    LazyLock::new(|| compile_static_regex(r"img-viewer/([^/?#]+)"));

/// Resolver for the Bibliothèque municipale de Dijon.
pub struct DijonResolver {
    client: Client,
    server_base: String,
}

impl DijonResolver {
    /// Creates a resolver against the production Pleade host.
    ///
    /// # Errors
    ///
    /// Returns [`ResolveError`] when HTTP client construction fails.
    pub fn new() -> Result<Self, ResolveError> {
        Self::with_server_base(DEFAULT_SERVER_BASE)
    }

    /// Creates a resolver issuing image-server requests against
    /// `server_base`.
    ///
    /// # Errors
    ///
    /// Returns [`ResolveError`] when HTTP client construction fails.
    pub fn with_server_base(server_base: impl Into<String>) -> Result<Self, ResolveError> {
        Ok(Self {
            client: build_http_client("dijon")?,
            server_base: server_base.into(),
        })
    }
}

impl std::fmt::Debug for DijonResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DijonResolver")
            .field("server_base", &self.server_base)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl LibraryResolver for DijonResolver {
    fn name(&self) -> &str {
        "dijon"
    }

    fn handles(&self, library: LibraryId) -> bool {
        library == LibraryId::Dijon
    }

    #[tracing::instrument(skip(self, ctx), fields(resolver = "dijon", url = %url))]
    async fn resolve(
        &self,
        url: &str,
        _library: LibraryId,
        ctx: &ResolveContext,
    ) -> Result<Manifest, ResolveError> {
        ctx.check_cancelled(url)?;

        let manuscript_id = extract_first_capture(url, &VIEWER_PATH_RE)
            .ok_or_else(|| ResolveError::malformed(url, "expected an img-viewer/{id} path"))?;

        let base = self.server_base.trim_end_matches('/');
        let dir_url = format!("{base}/pleade/img-server/{manuscript_id}/dir.json");
        let policy = LibraryId::Dijon.retry_policy();
        let timeout = LibraryId::Dijon.timeout_for(&dir_url);
        let entries: Vec<Value> = fetch_json(
            &self.client,
            &dir_url,
            timeout,
            &policy,
            None,
            Some(&ctx.cancel),
        )
        .await?;
        if entries.is_empty() {
            return Err(ResolveError::bad_response(
                &dir_url,
                "directory listed no images",
            ));
        }

        let mut images = Vec::with_capacity(entries.len());
        for entry in &entries {
            let src = full_size_version(entry).ok_or_else(|| {
                ResolveError::bad_response(&dir_url, "page entry lacks a full-size version")
            })?;
            images.push(PageImage::numbered(
                format!("{base}/pleade/img-server/{src}"),
                images.len() + 1,
            ));
        }

        Ok(Manifest::new(
            format!("Dijon_{manuscript_id}"),
            LibraryId::Dijon,
            images,
            url,
        ))
    }
}

fn full_size_version(entry: &Value) -> Option<String> {
    entry
        .get("versions")?
        .as_array()?
        .iter()
        .filter_map(|version| version.get("src").and_then(Value::as_str))
        .find(|src| !src.contains("__thumbs__"))
        .map(str::to_string)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::test_support::socket_guard::start_mock_server_or_skip;
    use serde_json::json;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, ResponseTemplate};

    #[test]
    fn test_full_size_version_skips_thumbnails() {
        let entry = json!({
            "versions": [
                {"src": "MS00114/__thumbs__/FR212316101_CITEAUX_MS00114_000_01_PS.jpg"},
                {"src": "MS00114/FR212316101_CITEAUX_MS00114_000_01_PS.jpg"}
            ]
        });
        assert_eq!(
            full_size_version(&entry).unwrap(),
            "MS00114/FR212316101_CITEAUX_MS00114_000_01_PS.jpg"
        );
        assert!(full_size_version(&json!({"versions": []})).is_none());
    }

    // ==================== End-to-end against a mock ====================

    #[tokio::test]
    async fn test_resolves_directory_listing() {
        let Some(server) = start_mock_server_or_skip().await else {
            return;
        };
        Mock::given(method("GET"))
            .and(path("/pleade/img-server/MS00114/dir.json"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([
                {"versions": [
                    {"src": "MS00114/__thumbs__/page_001.jpg"},
                    {"src": "MS00114/page_001.jpg"}
                ]},
                {"versions": [
                    {"src": "MS00114/__thumbs__/page_002.jpg"},
                    {"src": "MS00114/page_002.jpg"}
                ]}
            ])))
            .mount(&server)
            .await;

        let resolver = DijonResolver::with_server_base(server.uri()).unwrap();
        let ctx = ResolveContext::default();
        let resolved = resolver
            .resolve(
                "http://patrimoine.bm-dijon.fr/pleade/img-viewer/MS00114/viewer.html",
                LibraryId::Dijon,
                &ctx,
            )
            .await
            .unwrap();

        assert_eq!(resolved.display_name, "Dijon_MS00114");
        assert_eq!(resolved.page_count(), 2);
        assert!(
            resolved.images[0]
                .url
                .ends_with("/pleade/img-server/MS00114/page_001.jpg")
        );
        assert_eq!(resolved.images[1].label, "Page 2");
    }

    #[tokio::test]
    async fn test_entry_without_full_size_version_is_an_error() {
        let Some(server) = start_mock_server_or_skip().await else {
            return;
        };
        Mock::given(method("GET"))
            .and(path("/pleade/img-server/MS00999/dir.json"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([
                {"versions": [{"src": "MS00999/__thumbs__/page_001.jpg"}]}
            ])))
            .mount(&server)
            .await;

        let resolver = DijonResolver::with_server_base(server.uri()).unwrap();
        let ctx = ResolveContext::default();
        let err = resolver
            .resolve(
                "http://patrimoine.bm-dijon.fr/pleade/img-viewer/MS00999/",
                LibraryId::Dijon,
                &ctx,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ResolveError::ManifestUnreachable { .. }));
    }
}
