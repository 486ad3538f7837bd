//! Biblioteca Virtual del Patrimonio Bibliográfico resolver.
//!
//! A catalogue record (registro) links to one or more image groups; the
//! digital copy group is preferred over PDF renditions. The group's viewer
//! page lists the image ids, which map directly to full-size JPEG
//! addresses.

use std::sync::LazyLock;

use async_trait::async_trait;
use regex::Regex;
use reqwest::Client;

use crate::error::ResolveError;
use crate::http::{build_http_client, fetch_text};
use crate::library::LibraryId;
use crate::manifest::{Manifest, PageImage};

use super::util::{compile_static_regex, dedupe_preserving_order, extract_all_captures};
use super::{LibraryResolver, ResolveContext};

const DEFAULT_BASE: &str = "https://bvpb.mcu.es";

static REGISTRO_ID_RE: LazyLock<Regex> =
    LazyLock::new(|| compile_static_regex(r"registro\.do\?id=(\d+)"));
static GRUPO_TITLED_RE: LazyLock<Regex> = LazyLock::new(|| {
    compile_static_regex(
        r#"catalogo_imagenes/grupo\.do\?path=(\d+)"[^>]*data-analytics-grouptitle="([^"]+)""#,
    )
});
static GRUPO_PATH_RE: LazyLock<Regex> =
    LazyLock::new(|| compile_static_regex(r"catalogo_imagenes/grupo\.do\?path=(\d+)"));
static MINIATURE_ID_RE: LazyLock<Regex> =
    LazyLock::new(|| compile_static_regex(r"object-miniature\.do\?id=(\d+)"));
static IMAGE_ID_RE: LazyLock<Regex> = LazyLock::new(|| compile_static_regex(r"idImagen=(\d+)"));

/// Resolver for bvpb.mcu.es catalogue records.
pub struct BvpbResolver {
    client: Client,
    base_url: String,
}

impl BvpbResolver {
    /// Creates a resolver against the production BVPB host.
    ///
    /// # Errors
    ///
    /// Returns [`ResolveError`] when HTTP client construction fails.
    pub fn new() -> Result<Self, ResolveError> {
        Self::with_base_url(DEFAULT_BASE)
    }

    /// Creates a resolver fetching catalogue pages under `base_url`.
    ///
    /// # Errors
    ///
    /// Returns [`ResolveError`] when HTTP client construction fails.
    pub fn with_base_url(base_url: impl Into<String>) -> Result<Self, ResolveError> {
        Ok(Self {
            client: build_http_client("bvpb")?,
            base_url: base_url.into(),
        })
    }

    fn image_url(&self, image_id: &str) -> String {
        format!(
            "{}/es/catalogo_imagenes/imagen_id.do?idImagen={image_id}&formato=jpg&registrardownload=0",
            self.base_url.trim_end_matches('/')
        )
    }
}

impl std::fmt::Debug for BvpbResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BvpbResolver")
            .field("base_url", &self.base_url)
            .finish_non_exhaustive()
    }
}

/// Picks the image group to resolve. The digital copy group wins; any
/// non-PDF group is next; a bare path link is the last resort.
fn select_grupo_path(html: &str) -> Option<String> {
    let titled: Vec<(String, String)> = GRUPO_TITLED_RE
        .captures_iter(html)
        .map(|captures| (captures[1].to_string(), captures[2].to_string()))
        .collect();

    if let Some((path, _)) = titled
        .iter()
        .find(|(_, title)| title.contains("Copia digital"))
    {
        return Some(path.clone());
    }
    if let Some((path, _)) = titled
        .iter()
        .find(|(_, title)| !title.to_uppercase().contains("PDF"))
    {
        return Some(path.clone());
    }
    GRUPO_PATH_RE
        .captures(html)
        .map(|captures| captures[1].to_string())
}

#[async_trait]
impl LibraryResolver for BvpbResolver {
    fn name(&self) -> &str {
        "bvpb"
    }

    fn handles(&self, library: LibraryId) -> bool {
        library == LibraryId::Bvpb
    }

    #[tracing::instrument(skip(self, ctx), fields(resolver = "bvpb", url = %url))]
    async fn resolve(
        &self,
        url: &str,
        _library: LibraryId,
        ctx: &ResolveContext,
    ) -> Result<Manifest, ResolveError> {
        ctx.check_cancelled(url)?;
        let registro_id = REGISTRO_ID_RE
            .captures(url)
            .map(|captures| captures[1].to_string())
            .ok_or_else(|| ResolveError::malformed(url, "no registro.do?id= catalogue reference"))?;

        let timeout = LibraryId::Bvpb.timeout_for(url);
        let policy = LibraryId::Bvpb.retry_policy();
        let html = fetch_text(&self.client, url, timeout, &policy, None, Some(&ctx.cancel)).await?;

        let grupo_path = select_grupo_path(&html).ok_or_else(|| {
            ResolveError::bad_response(url, "the catalogue record links no digital copy group")
        })?;
        let grupo_url = format!(
            "{}/es/catalogo_imagenes/grupo.do?path={grupo_path}",
            self.base_url.trim_end_matches('/')
        );
        let grupo_html = fetch_text(
            &self.client,
            &grupo_url,
            timeout,
            &policy,
            None,
            Some(&ctx.cancel),
        )
        .await?;

        let mut image_ids = dedupe_preserving_order(extract_all_captures(&grupo_html, &MINIATURE_ID_RE));
        if image_ids.is_empty() {
            image_ids = dedupe_preserving_order(extract_all_captures(&grupo_html, &IMAGE_ID_RE));
        }
        if image_ids.is_empty() {
            return Err(ResolveError::bad_response(
                &grupo_url,
                "the viewer page lists no image identifiers",
            ));
        }

        let images = image_ids
            .into_iter()
            .enumerate()
            .map(|(index, image_id)| PageImage::numbered(self.image_url(&image_id), index + 1))
            .collect();
        Ok(Manifest::new(
            format!("BVPB {registro_id}"),
            LibraryId::Bvpb,
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
    use wiremock::matchers::{path, query_param};
    use wiremock::{Mock, ResponseTemplate};

    // ==================== Group selection ====================

    #[test]
    fn test_prefers_digital_copy_group() {
        let html = r#"
            <a href="catalogo_imagenes/grupo.do?path=101" data-analytics-grouptitle="PDF completo">pdf</a>
            <a href="catalogo_imagenes/grupo.do?path=102" data-analytics-grouptitle="Copia digital. Madrid">copia</a>
        "#;
        assert_eq!(select_grupo_path(html).as_deref(), Some("102"));
    }

    #[test]
    fn test_falls_back_to_first_non_pdf_group() {
        let html = r#"
            <a href="catalogo_imagenes/grupo.do?path=101" data-analytics-grouptitle="Descarga en PDF">pdf</a>
            <a href="catalogo_imagenes/grupo.do?path=103" data-analytics-grouptitle="Microfilm">micro</a>
        "#;
        assert_eq!(select_grupo_path(html).as_deref(), Some("103"));
    }

    #[test]
    fn test_bare_path_link_is_the_last_resort() {
        let html = r#"<a href="catalogo_imagenes/grupo.do?path=104">ver</a>"#;
        assert_eq!(select_grupo_path(html).as_deref(), Some("104"));
        assert_eq!(select_grupo_path("<html></html>"), None);
    }

    // ==================== End to end ====================

    #[tokio::test]
    async fn test_resolves_pages_from_miniature_listing() {
        let Some(server) = start_mock_server_or_skip().await else {
            return;
        };
        let registro_html = r#"
            <a href="catalogo_imagenes/grupo.do?path=11000651" data-analytics-grouptitle="Descarga en PDF">pdf</a>
            <a href="catalogo_imagenes/grupo.do?path=11000652" data-analytics-grouptitle="Copia digital. Toledo">copia</a>
        "#;
        Mock::given(path("/es/catalogo_imagenes/registro.do"))
            .and(query_param("id", "451885"))
            .respond_with(ResponseTemplate::new(200).set_body_string(registro_html))
            .mount(&server)
            .await;
        let grupo_html = r#"
            <img src="object-miniature.do?id=90001"/>
            <img src="object-miniature.do?id=90002"/>
            <img src="object-miniature.do?id=90001"/>
        "#;
        Mock::given(path("/es/catalogo_imagenes/grupo.do"))
            .and(query_param("path", "11000652"))
            .respond_with(ResponseTemplate::new(200).set_body_string(grupo_html))
            .mount(&server)
            .await;

        let resolver = BvpbResolver::with_base_url(server.uri()).unwrap();
        let ctx = ResolveContext::default();
        let input = format!("{}/es/catalogo_imagenes/registro.do?id=451885", server.uri());
        let resolved = resolver.resolve(&input, LibraryId::Bvpb, &ctx).await.unwrap();

        assert_eq!(resolved.display_name, "BVPB 451885");
        assert_eq!(resolved.page_count(), 2);
        assert!(resolved.images[0].url.contains("idImagen=90001"));
        assert!(resolved.images[0].url.contains("formato=jpg"));
        assert_eq!(resolved.images[1].label, "Page 2");
    }

    #[tokio::test]
    async fn test_falls_back_to_direct_image_ids() {
        let Some(server) = start_mock_server_or_skip().await else {
            return;
        };
        let registro_html =
            r#"<a href="catalogo_imagenes/grupo.do?path=123" data-analytics-grouptitle="Copia digital">x</a>"#;
        Mock::given(path("/es/catalogo_imagenes/registro.do"))
            .respond_with(ResponseTemplate::new(200).set_body_string(registro_html))
            .mount(&server)
            .await;
        let grupo_html = r#"
            <a href="imagen_id.do?idImagen=70001&formato=jpg">1</a>
            <a href="imagen_id.do?idImagen=70002&formato=jpg">2</a>
        "#;
        Mock::given(path("/es/catalogo_imagenes/grupo.do"))
            .respond_with(ResponseTemplate::new(200).set_body_string(grupo_html))
            .mount(&server)
            .await;

        let resolver = BvpbResolver::with_base_url(server.uri()).unwrap();
        let ctx = ResolveContext::default();
        let input = format!("{}/es/catalogo_imagenes/registro.do?id=1", server.uri());
        let resolved = resolver.resolve(&input, LibraryId::Bvpb, &ctx).await.unwrap();
        assert_eq!(resolved.page_count(), 2);
        assert!(resolved.images[1].url.contains("idImagen=70002"));
    }

    #[tokio::test]
    async fn test_record_without_groups_is_an_error() {
        let Some(server) = start_mock_server_or_skip().await else {
            return;
        };
        Mock::given(path("/es/catalogo_imagenes/registro.do"))
            .respond_with(ResponseTemplate::new(200).set_body_string("<html>nada</html>"))
            .mount(&server)
            .await;

        let resolver = BvpbResolver::with_base_url(server.uri()).unwrap();
        let ctx = ResolveContext::default();
        let input = format!("{}/es/catalogo_imagenes/registro.do?id=9", server.uri());
        let err = resolver
            .resolve(&input, LibraryId::Bvpb, &ctx)
            .await
            .unwrap_err();
        assert!(matches!(err, ResolveError::ManifestUnreachable { .. }));
    }
}
