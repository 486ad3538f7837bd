//! IRHT (Institut de recherche et d'histoire des textes) resolver.
//!
//! The Arca portal offers no public manifest endpoint, but the viewer
//! page inlines IIIF thumbnail URLs for every digitised folio. Those are
//! scraped, deduplicated and re-emitted at full resolution against the
//! IIIF image server.

use std::sync::LazyLock;

use async_trait::async_trait;
use regex::Regex;
use reqwest::Client;
use tracing::debug;

use crate::error::ResolveError;
use crate::http::{build_http_client, fetch_text};
use crate::library::LibraryId;
use crate::manifest::{Manifest, PageImage};

use super::util::{compile_static_regex, dedupe_preserving_order, extract_all_captures};
use super::{LibraryResolver, ResolveContext};

const DEFAULT_IIIF_BASE: &str = "https://iiif.irht.cnrs.fr";

static ARK_RE: LazyLock<Regex> = LazyLock::new(|| compile_static_regex(r"ark:/(\d+)/([^/?]+)"));
static IIIF_IMAGE_RE: LazyLock<Regex> = LazyLock::new(|| {
    compile_static_regex(
        r"https://iiif\.irht\.cnrs\.fr/iiif/ark:/\d+/([^/]+)/full/[^/]+/\d+/default\.jpg",
    )
});

/// Resolver for manuscripts on the Arca portal.
pub struct IrhtResolver {
    client: Client,
    iiif_base: String,
}

impl IrhtResolver {
    /// Creates a resolver emitting image URLs against the production IIIF
    /// server.
    ///
    /// # Errors
    ///
    /// Returns [`ResolveError`] when HTTP client construction fails.
    pub fn new() -> Result<Self, ResolveError> {
        Self::with_iiif_base(DEFAULT_IIIF_BASE)
    }

    /// Creates a resolver emitting image URLs against `iiif_base`.
    ///
    /// # Errors
    ///
    /// Returns [`ResolveError`] when HTTP client construction fails.
    pub fn with_iiif_base(iiif_base: impl Into<String>) -> Result<Self, ResolveError> {
        Ok(Self {
            client: build_http_client("irht")?,
            iiif_base: iiif_base.into(),
        })
    }

    fn full_image_url(&self, authority: &str, image_id: &str) -> String {
        format!(
            "{}/iiif/ark:/{authority}/{image_id}/full/max/0/default.jpg",
            self.iiif_base.trim_end_matches('/')
        )
    }
}

impl std::fmt::Debug for IrhtResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IrhtResolver")
            .field("iiif_base", &self.iiif_base)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl LibraryResolver for IrhtResolver {
    fn name(&self) -> &str {
        "irht"
    }

    fn handles(&self, library: LibraryId) -> bool {
        library == LibraryId::Irht
    }

    #[tracing::instrument(skip(self, ctx), fields(resolver = "irht", url = %url))]
    async fn resolve(
        &self,
        url: &str,
        _library: LibraryId,
        ctx: &ResolveContext,
    ) -> Result<Manifest, ResolveError> {
        ctx.check_cancelled(url)?;

        let (authority, name) = ark_parts(url).ok_or_else(|| {
            ResolveError::malformed(url, "no ark identifier; expected ark:/{authority}/{name}")
        })?;

        let policy = LibraryId::Irht.retry_policy();
        let timeout = LibraryId::Irht.timeout_for(url);
        let html = fetch_text(&self.client, url, timeout, &policy, None, Some(&ctx.cancel)).await?;

        let image_ids = dedupe_preserving_order(extract_all_captures(&html, &IIIF_IMAGE_RE));
        if image_ids.is_empty() {
            return Err(ResolveError::bad_response(
                url,
                "the viewer page references no IIIF images",
            ));
        }
        debug!(pages = image_ids.len(), "scraped image identifiers");

        let images = image_ids
            .iter()
            .enumerate()
            .map(|(index, image_id)| {
                PageImage::numbered(self.full_image_url(authority, image_id), index + 1)
            })
            .collect();
        Ok(Manifest::new(
            format!("IRHT_{name}"),
            LibraryId::Irht,
            images,
            url,
        ))
    }
}

/// Splits an ark reference into its authority number and object name.
fn ark_parts(url: &str) -> Option<(&str, &str)> {
    let caps = ARK_RE.captures(url)?;
    Some((caps.get(1)?.as_str(), caps.get(2)?.as_str()))
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::test_support::socket_guard::start_mock_server_or_skip;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, ResponseTemplate};

    // ==================== ARK parsing ====================

    #[test]
    fn test_ark_parts() {
        assert_eq!(
            ark_parts("https://arca.irht.cnrs.fr/ark:/63955/md14nk323d72"),
            Some(("63955", "md14nk323d72"))
        );
        assert_eq!(
            ark_parts("https://arca.irht.cnrs.fr/ark:/63955/md14nk323d72?view=single"),
            Some(("63955", "md14nk323d72"))
        );
        assert_eq!(ark_parts("https://arca.irht.cnrs.fr/search"), None);
    }

    #[test]
    fn test_url_without_ark_is_malformed() {
        let resolver = IrhtResolver::new().unwrap();
        assert!(resolver.handles(LibraryId::Irht));
        assert!(!resolver.handles(LibraryId::Laon));
        let ctx = ResolveContext::default();
        let err = tokio_test::block_on(resolver.resolve(
            "https://arca.irht.cnrs.fr/search?q=psalter",
            LibraryId::Irht,
            &ctx,
        ))
        .unwrap_err();
        assert!(matches!(err, ResolveError::MalformedUrl { .. }));
    }

    // ==================== End-to-end against a mock ====================

    #[tokio::test]
    async fn test_scrapes_and_upgrades_iiif_thumbnails() {
        let Some(server) = start_mock_server_or_skip().await else {
            return;
        };
        // The gallery repeats each folio at several sizes; one folio per
        // unique image id must come out.
        Mock::given(method("GET"))
            .and(path("/ark:/63955/md14nk323d72"))
            .respond_with(ResponseTemplate::new(200).set_body_string(
                r#"<div class="gallery">
                <img src="https://iiif.irht.cnrs.fr/iiif/ark:/63955/fpx80k8699zn/full/200,/0/default.jpg">
                <img src="https://iiif.irht.cnrs.fr/iiif/ark:/63955/fpx80k8699zn/full/600,/0/default.jpg">
                <img src="https://iiif.irht.cnrs.fr/iiif/ark:/63955/gbx41q1778mc/full/200,/0/default.jpg">
                </div>"#,
            ))
            .mount(&server)
            .await;

        let resolver = IrhtResolver::with_iiif_base("https://images.example").unwrap();
        let ctx = ResolveContext::default();
        let url = format!("{}/ark:/63955/md14nk323d72", server.uri());
        let resolved = resolver.resolve(&url, LibraryId::Irht, &ctx).await.unwrap();

        assert_eq!(resolved.display_name, "IRHT_md14nk323d72");
        assert_eq!(resolved.page_count(), 2);
        assert_eq!(
            resolved.images[0].url,
            "https://images.example/iiif/ark:/63955/fpx80k8699zn/full/max/0/default.jpg"
        );
        assert_eq!(resolved.images[1].label, "Page 2");
    }

    #[tokio::test]
    async fn test_page_without_images_is_an_error() {
        let Some(server) = start_mock_server_or_skip().await else {
            return;
        };
        Mock::given(method("GET"))
            .and(path("/ark:/63955/empty"))
            .respond_with(ResponseTemplate::new(200).set_body_string("<html>no viewer</html>"))
            .mount(&server)
            .await;

        let resolver = IrhtResolver::with_iiif_base(server.uri()).unwrap();
        let ctx = ResolveContext::default();
        let url = format!("{}/ark:/63955/empty", server.uri());
        let err = resolver
            .resolve(&url, LibraryId::Irht, &ctx)
            .await
            .unwrap_err();
        assert!(matches!(err, ResolveError::ManifestUnreachable { .. }));
    }
}
