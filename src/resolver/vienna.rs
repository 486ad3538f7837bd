//! Vienna manuscripta.at resolver: IIIF manifest first, folio probing as
//! fallback.
//!
//! Viewer URLs name a manuscript as `AT{archive}-{codex}`. Most manuscripts
//! have an IIIF v2 manifest at a predictable address; older digitisations
//! only publish folio scans named `{id}_001r.jpg`, `{id}_001v.jpg` and so
//! on, which must be discovered by probing. A folio side can be genuinely
//! absent mid-run (an unphotographed verso, say), so the scan skips short
//! gaps and only concludes the manuscript ended after several consecutive
//! misses.

use std::sync::LazyLock;

use async_trait::async_trait;
use regex::Regex;
use reqwest::Client;
use serde_json::Value;
use tracing::debug;

use crate::error::ResolveError;
use crate::http::{build_http_client, fetch_json};
use crate::iiif::{self, ImageUrlStyle};
use crate::library::LibraryId;
use crate::manifest::{Manifest, PageImage, ResolveWarning};

use super::probe::discover_pages_tolerant;
use super::util::{compile_static_regex, extract_first_capture};
use super::{LibraryResolver, ResolveContext};

const DEFAULT_BASE: &str = "https://manuscripta.at";

/// Folio gaps shorter than this are skipped; a longer run of absent
/// images ends the scan.
const MAX_CONSECUTIVE_MISSES: u32 = 3;

static MANUSCRIPT_PATH_RE: LazyLock<Regex> =
    LazyLock::new(|| compile_static_regex(r"/diglit/(AT\d+-\d+)"));
static ID_PARTS_RE: LazyLock<Regex> = LazyLock::new(|| compile_static_regex(r"(AT)(\d+)-\d+"));

/// Resolver for the Austrian manuscripta.at portal.
pub struct ViennaManuscriptaResolver {
    client: Client,
    base_url: String,
}

impl ViennaManuscriptaResolver {
    /// Creates a resolver against the production manuscripta.at host.
    ///
    /// # Errors
    ///
    /// Returns [`ResolveError`] when HTTP client construction fails.
    pub fn new() -> Result<Self, ResolveError> {
        Self::with_base_url(DEFAULT_BASE)
    }

    /// Creates a resolver addressing manifests and folio images under
    /// `base_url`.
    ///
    /// # Errors
    ///
    /// Returns [`ResolveError`] when HTTP client construction fails.
    pub fn with_base_url(base_url: impl Into<String>) -> Result<Self, ResolveError> {
        Ok(Self {
            client: build_http_client("vienna_manuscripta")?,
            base_url: base_url.into(),
        })
    }

    fn folio_image_url(&self, folio_base: &str, id: &str, page: u32) -> String {
        format!("{folio_base}/{id}_{}.jpg", folio_name(page))
    }

    async fn manifest_via_iiif(
        &self,
        manifest_url: &str,
        input: &str,
        id: &str,
        ctx: &ResolveContext,
    ) -> Result<Manifest, ResolveError> {
        let policy = LibraryId::ViennaManuscripta.retry_policy();
        let timeout = LibraryId::ViennaManuscripta.timeout_for(manifest_url);
        let manifest_json: Value = fetch_json(
            &self.client,
            manifest_url,
            timeout,
            &policy,
            None,
            Some(&ctx.cancel),
        )
        .await?;

        let pages = iiif::extract_pages(&manifest_json, ImageUrlStyle::Service { size: "max" });
        if pages.is_empty() {
            return Err(ResolveError::bad_response(
                manifest_url,
                "manifest listed no page images",
            ));
        }
        let display_name =
            iiif::manifest_label(&manifest_json).unwrap_or_else(|| format!("Vienna_{id}"));
        Ok(Manifest::new(
            display_name,
            LibraryId::ViennaManuscripta,
            pages,
            input,
        ))
    }

}

impl std::fmt::Debug for ViennaManuscriptaResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ViennaManuscriptaResolver")
            .field("base_url", &self.base_url)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl LibraryResolver for ViennaManuscriptaResolver {
    fn name(&self) -> &str {
        "vienna_manuscripta"
    }

    fn handles(&self, library: LibraryId) -> bool {
        library == LibraryId::ViennaManuscripta
    }

    #[tracing::instrument(skip(self, ctx), fields(resolver = "vienna_manuscripta", url = %url))]
    async fn resolve(
        &self,
        url: &str,
        _library: LibraryId,
        ctx: &ResolveContext,
    ) -> Result<Manifest, ResolveError> {
        ctx.check_cancelled(url)?;

        let id = extract_first_capture(url, &MANUSCRIPT_PATH_RE).ok_or_else(|| {
            ResolveError::malformed(url, "no manuscript id; expected /diglit/AT{archive}-{codex}")
        })?;
        let base = self.base_url.trim_end_matches('/');

        let manifest_url = format!("{base}/diglit/iiif/{id}/manifest.json");
        match self.manifest_via_iiif(&manifest_url, url, &id, ctx).await {
            Ok(resolved) => return Ok(resolved),
            Err(error) if error.is_cancelled() => return Err(error),
            Err(error) => {
                debug!(error = %error, "IIIF manifest unavailable, probing folio images");
            }
        }

        let (prefix, archive) = manuscript_parts(&id).ok_or_else(|| {
            ResolveError::malformed(url, "manuscript id is not in AT{archive}-{codex} form")
        })?;
        let folio_base = format!("{base}/images/{prefix}/{archive}/{id}");
        let timeout = LibraryId::ViennaManuscripta.timeout_for(url);
        let make_url = |page: u32| self.folio_image_url(&folio_base, &id, page);
        let discovered = discover_pages_tolerant(
            &self.client,
            &make_url,
            MAX_CONSECUTIVE_MISSES,
            timeout,
            ctx,
        )
        .await?;
        debug!(pages = discovered.pages.len(), "discovered folio images by probing");

        let images = discovered
            .pages
            .iter()
            .map(|&page| PageImage::new(make_url(page), folio_name(page)))
            .collect();
        let hit_ceiling = discovered.hit_ceiling;

        let mut manifest = Manifest::new(
            format!("Vienna_{id}"),
            LibraryId::ViennaManuscripta,
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

/// Splits `AT5000-71` into its archive prefix and number, the two path
/// segments folio images are filed under.
fn manuscript_parts(id: &str) -> Option<(&str, &str)> {
    let caps = ID_PARTS_RE.captures(id)?;
    Some((caps.get(1)?.as_str(), caps.get(2)?.as_str()))
}

/// Maps a linear page number onto folio notation: page 1 is `001r`,
/// page 2 is `001v`, page 3 is `002r` and so on.
fn folio_name(page: u32) -> String {
    let folio = page.div_ceil(2);
    let side = if page % 2 == 1 { 'r' } else { 'v' };
    format!("{folio:03}{side}")
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::resolver::ResolveOptions;
    use crate::test_support::socket_guard::start_mock_server_or_skip;
    use serde_json::json;
    use wiremock::matchers::{method, path, path_regex};
    use wiremock::{Mock, MockServer, Request, Respond, ResponseTemplate};

    const VIEWER_PATH: &str = "/diglit/AT5000-71/0001";

    fn vienna_manifest(host: &str) -> Value {
        json!({
            "@context": "http://iiif.io/api/presentation/2/context.json",
            "label": "Klosterneuburg, Cod. 71",
            "sequences": [{
                "canvases": [
                    {
                        "label": "1r",
                        "images": [{"resource": {
                            "@id": format!("{host}/iiif/AT5000-71/001r/full/full/0/default.jpg"),
                            "service": {"@id": format!("{host}/iiif/AT5000-71/001r")}
                        }}]
                    },
                    {
                        "label": "1v",
                        "images": [{"resource": {
                            "@id": format!("{host}/iiif/AT5000-71/001v/full/full/0/default.jpg"),
                            "service": {"@id": format!("{host}/iiif/AT5000-71/001v")}
                        }}]
                    }
                ]
            }]
        })
    }

    /// Serves folio scans, answering 200 for the linear page numbers in
    /// `present` and 404 for everything else.
    struct FolioServer {
        present: Vec<u32>,
    }

    impl Respond for FolioServer {
        fn respond(&self, request: &Request) -> ResponseTemplate {
            let linear = request
                .url
                .path()
                .rsplit('/')
                .next()
                .and_then(|name| name.strip_suffix(".jpg"))
                .and_then(|name| name.rsplit('_').next())
                .and_then(|folio| {
                    let (digits, side) = folio.split_at(folio.len().checked_sub(1)?);
                    let number: u32 = digits.parse().ok()?;
                    match side {
                        "r" => (number * 2).checked_sub(1),
                        "v" => Some(number * 2),
                        _ => None,
                    }
                });
            match linear {
                Some(page) if self.present.contains(&page) => {
                    ResponseTemplate::new(200).insert_header("content-type", "image/jpeg")
                }
                _ => ResponseTemplate::new(404),
            }
        }
    }

    async fn mount_folios(server: &MockServer, present: Vec<u32>) {
        Mock::given(path_regex(
            r"^/images/AT/5000/AT5000-71/AT5000-71_\d{3}[rv]\.jpg$",
        ))
        .respond_with(FolioServer { present })
        .mount(server)
        .await;
    }

    // ==================== Folio naming ====================

    #[test]
    fn test_folio_naming_alternates_recto_verso() {
        assert_eq!(folio_name(1), "001r");
        assert_eq!(folio_name(2), "001v");
        assert_eq!(folio_name(3), "002r");
        assert_eq!(folio_name(10), "005v");
    }

    #[test]
    fn test_manuscript_parts() {
        assert_eq!(manuscript_parts("AT5000-71"), Some(("AT", "5000")));
        assert_eq!(manuscript_parts("codex-71"), None);
    }

    #[test]
    fn test_folio_image_url() {
        let resolver = ViennaManuscriptaResolver::new().unwrap();
        assert_eq!(
            resolver.folio_image_url("https://manuscripta.at/images/AT/5000/AT5000-71", "AT5000-71", 3),
            "https://manuscripta.at/images/AT/5000/AT5000-71/AT5000-71_002r.jpg"
        );
    }

    #[test]
    fn test_url_without_manuscript_id_is_malformed() {
        let resolver = ViennaManuscriptaResolver::new().unwrap();
        assert!(resolver.handles(LibraryId::ViennaManuscripta));
        assert!(!resolver.handles(LibraryId::Graz));
        let ctx = ResolveContext::default();
        let err = tokio_test::block_on(resolver.resolve(
            "https://manuscripta.at/diglit/browse",
            LibraryId::ViennaManuscripta,
            &ctx,
        ))
        .unwrap_err();
        assert!(matches!(err, ResolveError::MalformedUrl { .. }));
    }

    // ==================== End-to-end against a mock ====================

    #[tokio::test]
    async fn test_resolves_via_iiif_manifest() {
        let Some(server) = start_mock_server_or_skip().await else {
            return;
        };
        Mock::given(method("GET"))
            .and(path("/diglit/iiif/AT5000-71/manifest.json"))
            .respond_with(ResponseTemplate::new(200).set_body_json(vienna_manifest(&server.uri())))
            .mount(&server)
            .await;

        let resolver = ViennaManuscriptaResolver::with_base_url(server.uri()).unwrap();
        let ctx = ResolveContext::default();
        let url = format!("{}{VIEWER_PATH}", server.uri());
        let resolved = resolver
            .resolve(&url, LibraryId::ViennaManuscripta, &ctx)
            .await
            .unwrap();

        assert_eq!(resolved.display_name, "Klosterneuburg, Cod. 71");
        assert_eq!(resolved.page_count(), 2);
        assert_eq!(resolved.images[0].label, "1r");
        assert_eq!(
            resolved.images[0].url,
            format!("{}/iiif/AT5000-71/001r/full/max/0/default.jpg", server.uri())
        );
    }

    #[tokio::test]
    async fn test_probes_folio_images_when_manifest_is_missing() {
        let Some(server) = start_mock_server_or_skip().await else {
            return;
        };
        mount_folios(&server, (1..=5).collect()).await;

        let resolver = ViennaManuscriptaResolver::with_base_url(server.uri()).unwrap();
        let ctx = ResolveContext::default();
        let url = format!("{}{VIEWER_PATH}", server.uri());
        let resolved = resolver
            .resolve(&url, LibraryId::ViennaManuscripta, &ctx)
            .await
            .unwrap();

        assert_eq!(resolved.display_name, "Vienna_AT5000-71");
        assert_eq!(resolved.page_count(), 5);
        assert_eq!(resolved.images[0].label, "001r");
        assert_eq!(resolved.images[4].label, "003r");
        assert!(
            resolved.images[1]
                .url
                .ends_with("/images/AT/5000/AT5000-71/AT5000-71_001v.jpg")
        );
        assert!(resolved.warnings.is_empty());
    }

    #[tokio::test]
    async fn test_folio_gaps_are_skipped() {
        let Some(server) = start_mock_server_or_skip().await else {
            return;
        };
        // 002r was never photographed but 002v exists; the scan must step
        // over the gap and still find the verso.
        mount_folios(&server, vec![1, 2, 4]).await;

        let resolver = ViennaManuscriptaResolver::with_base_url(server.uri()).unwrap();
        let ctx = ResolveContext::default();
        let url = format!("{}{VIEWER_PATH}", server.uri());
        let resolved = resolver
            .resolve(&url, LibraryId::ViennaManuscripta, &ctx)
            .await
            .unwrap();

        assert_eq!(resolved.page_count(), 3);
        let labels: Vec<&str> = resolved
            .images
            .iter()
            .map(|page| page.label.as_str())
            .collect();
        assert_eq!(labels, ["001r", "001v", "002v"]);
    }

    #[tokio::test]
    async fn test_ceiling_stops_the_folio_scan() {
        let Some(server) = start_mock_server_or_skip().await else {
            return;
        };
        mount_folios(&server, (1..=50).collect()).await;

        let resolver = ViennaManuscriptaResolver::with_base_url(server.uri()).unwrap();
        let ctx = ResolveContext::with_options(ResolveOptions::new().with_page_ceiling(8));
        let url = format!("{}{VIEWER_PATH}", server.uri());
        let resolved = resolver
            .resolve(&url, LibraryId::ViennaManuscripta, &ctx)
            .await
            .unwrap();

        assert_eq!(resolved.page_count(), 8);
        assert!(resolved.hit_pagination_limit());
    }

    #[tokio::test]
    async fn test_no_folio_images_is_an_error() {
        let Some(server) = start_mock_server_or_skip().await else {
            return;
        };
        mount_folios(&server, Vec::new()).await;

        let resolver = ViennaManuscriptaResolver::with_base_url(server.uri()).unwrap();
        let ctx = ResolveContext::default();
        let url = format!("{}{VIEWER_PATH}", server.uri());
        let err = resolver
            .resolve(&url, LibraryId::ViennaManuscripta, &ctx)
            .await
            .unwrap_err();
        assert!(matches!(err, ResolveError::ManifestUnreachable { .. }));
    }
}
