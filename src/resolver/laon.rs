//! Laon resolver for the Limb Gallery deployment at
//! `bibliotheque-numerique.ville-laon.fr`.
//!
//! The viewer page references an `lgiiif` API endpoint whose response maps
//! tile ids to IIIF image services. The tiles object preserves page order,
//! which is why JSON objects are parsed order-preserving crate-wide.

use std::sync::LazyLock;

use async_trait::async_trait;
use regex::Regex;
use reqwest::Client;
use serde_json::Value;
use tracing::debug;

use crate::error::ResolveError;
use crate::http::{browser_headers, build_http_client, fetch_json, fetch_text};
use crate::library::LibraryId;
use crate::manifest::{Manifest, PageImage};

use super::util::{compile_static_regex, extract_first_capture};
use super::{LibraryResolver, ResolveContext};

const DEFAULT_BASE: &str = "https://bibliotheque-numerique.ville-laon.fr";

static VIEWER_PATH_RE: LazyLock<Regex> = LazyLock::new(|| compile_static_regex(r"/viewer/(\d+)"));
static LGIIIF_URL_RE: LazyLock<Regex> =
    LazyLock::new(|| compile_static_regex(r#"lgiiif\?url=([^&'"]+)"#));
static MEDIA_PATH_RE: LazyLock<Regex> =
    LazyLock::new(|| compile_static_regex(r#"["']/medias/([^"']+)["']"#));

/// Resolver for the Bibliothèque municipale de Laon.
pub struct LaonResolver {
    client: Client,
    base_url: String,
}

impl LaonResolver {
    /// Creates a resolver against the production host.
    ///
    /// # Errors
    ///
    /// Returns [`ResolveError`] when HTTP client construction fails.
    pub fn new() -> Result<Self, ResolveError> {
        Self::with_base_url(DEFAULT_BASE)
    }

    /// Creates a resolver issuing viewer and API requests against
    /// `base_url`.
    ///
    /// # Errors
    ///
    /// Returns [`ResolveError`] when HTTP client construction fails.
    pub fn with_base_url(base_url: impl Into<String>) -> Result<Self, ResolveError> {
        Ok(Self {
            client: build_http_client("laon")?,
            base_url: base_url.into(),
        })
    }
}

impl std::fmt::Debug for LaonResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LaonResolver")
            .field("base_url", &self.base_url)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl LibraryResolver for LaonResolver {
    fn name(&self) -> &str {
        "laon"
    }

    fn handles(&self, library: LibraryId) -> bool {
        library == LibraryId::Laon
    }

    #[tracing::instrument(skip(self, ctx), fields(resolver = "laon", url = %url))]
    async fn resolve(
        &self,
        url: &str,
        _library: LibraryId,
        ctx: &ResolveContext,
    ) -> Result<Manifest, ResolveError> {
        ctx.check_cancelled(url)?;

        let document_id = extract_first_capture(url, &VIEWER_PATH_RE)
            .ok_or_else(|| ResolveError::malformed(url, "expected a /viewer/{number} path"))?;

        let base = self.base_url.trim_end_matches('/');
        let viewer_url = format!("{base}/viewer/{document_id}/");
        let policy = LibraryId::Laon.retry_policy();
        let timeout = LibraryId::Laon.timeout_for(&viewer_url);
        let html = fetch_text(
            &self.client,
            &viewer_url,
            timeout,
            &policy,
            Some(&browser_headers(None)),
            Some(&ctx.cancel),
        )
        .await?;

        let api_url = if let Some(media_path) = extract_first_capture(&html, &LGIIIF_URL_RE) {
            format!("{base}/api/viewer/lgiiif?url={media_path}")
        } else if let Some(media_path) = extract_first_capture(&html, &MEDIA_PATH_RE) {
            let media_path = media_path.trim_end_matches('/').to_string();
            format!("{base}/api/viewer/lgiiif?url=/srv/www/limbgallery/medias/{media_path}/")
        } else {
            return Err(ResolveError::bad_response(
                &viewer_url,
                &format!("viewer page for document {document_id} references no media gallery"),
            ));
        };
        debug!(api_url = %api_url, "discovered gallery endpoint");

        let gallery: Value = fetch_json(
            &self.client,
            &api_url,
            timeout,
            &policy,
            None,
            Some(&ctx.cancel),
        )
        .await?;
        let tiles = gallery
            .get("item")
            .and_then(|item| item.get("tiles"))
            .and_then(Value::as_object)
            .ok_or_else(|| {
                ResolveError::bad_response(&api_url, "gallery response lists no item tiles")
            })?;
        if tiles.is_empty() {
            return Err(ResolveError::bad_response(
                &api_url,
                "gallery lists no images",
            ));
        }

        // Tile insertion order is page order.
        let mut images = Vec::with_capacity(tiles.len());
        for (tile_id, tile) in tiles {
            let service_id = tile.get("@id").and_then(Value::as_str).ok_or_else(|| {
                ResolveError::bad_response(&api_url, &format!("tile {tile_id} carries no @id"))
            })?;
            images.push(PageImage::numbered(
                format!("{base}{service_id}/full/full/0/default.jpg"),
                images.len() + 1,
            ));
        }

        Ok(Manifest::new(
            format!("Laon_{document_id}"),
            LibraryId::Laon,
            images,
            url,
        ))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::test_support::socket_guard::start_mock_server_or_skip;
    use serde_json::json;
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, ResponseTemplate};

    // ==================== End-to-end against a mock ====================

    #[tokio::test]
    async fn test_resolves_gallery_tiles_in_listed_order() {
        let Some(server) = start_mock_server_or_skip().await else {
            return;
        };
        Mock::given(method("GET"))
            .and(path("/viewer/1459/"))
            .respond_with(ResponseTemplate::new(200).set_body_string(
                r#"<script>load("/api/viewer/lgiiif?url=/srv/www/limbgallery/medias/a2/33/4a/b2/&max=260");</script>"#,
            ))
            .mount(&server)
            .await;
        // Keys deliberately out of lexical order; page order must follow
        // the listing, not the key text.
        Mock::given(method("GET"))
            .and(path("/api/viewer/lgiiif"))
            .and(query_param("url", "/srv/www/limbgallery/medias/a2/33/4a/b2/"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "item": {
                    "tiles": {
                        "img_10": {"@id": "/i/?IIIF=/a2/33/4a/b2/0010.jp2"},
                        "img_02": {"@id": "/i/?IIIF=/a2/33/4a/b2/0002.jp2"},
                        "img_05": {"@id": "/i/?IIIF=/a2/33/4a/b2/0005.jp2"}
                    }
                }
            })))
            .mount(&server)
            .await;

        let resolver = LaonResolver::with_base_url(server.uri()).unwrap();
        let ctx = ResolveContext::default();
        let resolved = resolver
            .resolve(
                "https://bibliotheque-numerique.ville-laon.fr/viewer/1459/?offset=2",
                LibraryId::Laon,
                &ctx,
            )
            .await
            .unwrap();

        assert_eq!(resolved.display_name, "Laon_1459");
        assert_eq!(resolved.page_count(), 3);
        assert!(resolved.images[0].url.contains("0010.jp2"));
        assert!(resolved.images[1].url.contains("0002.jp2"));
        assert!(resolved.images[2].url.contains("0005.jp2"));
        assert!(resolved.images[0].url.ends_with("/full/full/0/default.jpg"));
    }

    #[tokio::test]
    async fn test_media_path_fallback_pattern() {
        let Some(server) = start_mock_server_or_skip().await else {
            return;
        };
        Mock::given(method("GET"))
            .and(path("/viewer/77/"))
            .respond_with(ResponseTemplate::new(200).set_body_string(
                r#"<div data-path="/medias/aa/bb/cc/dd/"></div>"#,
            ))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/api/viewer/lgiiif"))
            .and(query_param(
                "url",
                "/srv/www/limbgallery/medias/aa/bb/cc/dd/",
            ))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "item": {"tiles": {"img_01": {"@id": "/i/?IIIF=/aa/bb/cc/dd/0001.jp2"}}}
            })))
            .mount(&server)
            .await;

        let resolver = LaonResolver::with_base_url(server.uri()).unwrap();
        let ctx = ResolveContext::default();
        let resolved = resolver
            .resolve(
                "https://bibliotheque-numerique.ville-laon.fr/viewer/77/",
                LibraryId::Laon,
                &ctx,
            )
            .await
            .unwrap();
        assert_eq!(resolved.page_count(), 1);
    }

    #[tokio::test]
    async fn test_viewer_without_gallery_reference_is_an_error() {
        let Some(server) = start_mock_server_or_skip().await else {
            return;
        };
        Mock::given(method("GET"))
            .and(path("/viewer/9/"))
            .respond_with(ResponseTemplate::new(200).set_body_string("<html>bare</html>"))
            .mount(&server)
            .await;

        let resolver = LaonResolver::with_base_url(server.uri()).unwrap();
        let ctx = ResolveContext::default();
        let err = resolver
            .resolve(
                "https://bibliotheque-numerique.ville-laon.fr/viewer/9/",
                LibraryId::Laon,
                &ctx,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ResolveError::ManifestUnreachable { .. }));
    }
}
