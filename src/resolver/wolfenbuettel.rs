//! Wolfenbüttel HAB resolver: crawls the paginated thumbnail browser.
//!
//! The Herzog August Bibliothek names scans by folio rather than by a
//! contiguous number, so the image list comes from walking `thumbs.php`
//! pages and collecting the `image=` references; the forward button on
//! each page carries the pointer for the next one. Manuscripts whose
//! thumbnail browser is broken fall back to probing the numbered image
//! files directly.

use std::sync::LazyLock;

use async_trait::async_trait;
use regex::Regex;
use reqwest::Client;
use tracing::debug;

use crate::error::ResolveError;
use crate::http::{build_http_client, fetch_text};
use crate::library::LibraryId;
use crate::manifest::{Manifest, PageImage, ResolveWarning};

use super::probe::discover_pages_tolerant;
use super::util::{compile_static_regex, extract_all_captures, extract_first_capture};
use super::{LibraryResolver, ResolveContext};

const DEFAULT_CRAWL_BASE: &str = "https://diglib.hab.de";
/// Full-resolution images are only published over plain HTTP.
const DEFAULT_IMAGE_BASE: &str = "http://diglib.hab.de";

/// The numbered-file fallback tolerates longer gaps than usual because
/// HAB skips numbers for unphotographed leaves.
const FALLBACK_MAX_MISSES: u32 = 10;

static MSS_DIR_RE: LazyLock<Regex> = LazyLock::new(|| compile_static_regex(r"dir=mss/([^&]+)"));
static PATH_DIR_RE: LazyLock<Regex> =
    LazyLock::new(|| compile_static_regex(r"diglib\.hab\.de/([^/?#]+/[^/?#]+/[^/?#]+)"));
static IMAGE_NAME_RE: LazyLock<Regex> = LazyLock::new(|| compile_static_regex(r#"image=([^'"&]+)"#));
static FORWARD_POINTER_RE: LazyLock<Regex> = LazyLock::new(|| {
    compile_static_regex(r#"href="thumbs\.php\?dir=[^&]+&pointer=(\d+)"[^>]*><img[^>]*title="forward""#)
});

/// Resolver for the Herzog August Bibliothek Wolfenbüttel.
pub struct WolfenbuettelResolver {
    client: Client,
    crawl_base: String,
    image_base: String,
}

impl WolfenbuettelResolver {
    /// Creates a resolver against the production HAB hosts.
    ///
    /// # Errors
    ///
    /// Returns [`ResolveError`] when HTTP client construction fails.
    pub fn new() -> Result<Self, ResolveError> {
        Self::with_bases(DEFAULT_CRAWL_BASE, DEFAULT_IMAGE_BASE)
    }

    /// Creates a resolver crawling `thumbs.php` under `crawl_base` and
    /// rooting image URLs at `image_base`.
    ///
    /// # Errors
    ///
    /// Returns [`ResolveError`] when HTTP client construction fails.
    pub fn with_bases(
        crawl_base: impl Into<String>,
        image_base: impl Into<String>,
    ) -> Result<Self, ResolveError> {
        Ok(Self {
            client: build_http_client("wolfenbuettel")?,
            crawl_base: crawl_base.into(),
            image_base: image_base.into(),
        })
    }

    fn thumbs_url(&self, dir: &str, pointer: u32) -> String {
        format!(
            "{}/thumbs.php?dir={dir}&pointer={pointer}",
            self.crawl_base.trim_end_matches('/')
        )
    }

    fn image_url(&self, dir: &str, name: &str) -> String {
        format!(
            "{}/{dir}/max/{name}.jpg",
            self.image_base.trim_end_matches('/')
        )
    }

    /// Walks the thumbnail pages and collects image names in reading
    /// order. Returns the unique names and whether the crawl was cut off
    /// at the safety ceiling.
    async fn crawl_thumbs(
        &self,
        dir: &str,
        ctx: &ResolveContext,
    ) -> Result<(Vec<String>, bool), ResolveError> {
        let policy = LibraryId::Wolfenbuettel.retry_policy();
        #[allow(clippy::cast_possible_truncation)]
        let ceiling = ctx.options.page_ceiling.max(1) as usize;

        let mut names: Vec<String> = Vec::new();
        let mut pointer = 0u32;
        loop {
            let thumbs_url = self.thumbs_url(dir, pointer);
            ctx.check_cancelled(&thumbs_url)?;
            let timeout = LibraryId::Wolfenbuettel.timeout_for(&thumbs_url);
            let html = match fetch_text(
                &self.client,
                &thumbs_url,
                timeout,
                &policy,
                None,
                Some(&ctx.cancel),
            )
            .await
            {
                Ok(html) => html,
                Err(error) if error.is_cancelled() => return Err(error),
                Err(error) => {
                    debug!(pointer, error = %error, "thumbs page unavailable, stopping the crawl");
                    break;
                }
            };

            let page_names = extract_all_captures(&html, &IMAGE_NAME_RE);
            if page_names.is_empty() {
                break;
            }
            for name in page_names {
                if !names.contains(&name) {
                    names.push(name);
                }
            }
            if names.len() >= ceiling {
                names.truncate(ceiling);
                return Ok((names, true));
            }

            // The forward button carries the next pointer; one that does
            // not advance marks the last page.
            let Some(next_pointer) = extract_first_capture(&html, &FORWARD_POINTER_RE)
                .and_then(|value| value.parse::<u32>().ok())
            else {
                break;
            };
            if next_pointer <= pointer {
                break;
            }
            pointer = next_pointer;
        }
        Ok((names, false))
    }
}

impl std::fmt::Debug for WolfenbuettelResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WolfenbuettelResolver")
            .field("crawl_base", &self.crawl_base)
            .field("image_base", &self.image_base)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl LibraryResolver for WolfenbuettelResolver {
    fn name(&self) -> &str {
        "wolfenbuettel"
    }

    fn handles(&self, library: LibraryId) -> bool {
        library == LibraryId::Wolfenbuettel
    }

    #[tracing::instrument(skip(self, ctx), fields(resolver = "wolfenbuettel", url = %url))]
    async fn resolve(
        &self,
        url: &str,
        _library: LibraryId,
        ctx: &ResolveContext,
    ) -> Result<Manifest, ResolveError> {
        ctx.check_cancelled(url)?;

        let manuscript_id = extract_manuscript_id(url)?;
        let dir = directory(&manuscript_id);

        let (names, mut hit_ceiling) = self.crawl_thumbs(&dir, ctx).await?;
        let images: Vec<PageImage> = if names.is_empty() {
            debug!("thumbs crawl found nothing, probing numbered image files");
            let timeout = LibraryId::Wolfenbuettel.timeout_for(url);
            let make_url = |page: u32| self.image_url(&dir, &format!("{page:05}"));
            let discovered = discover_pages_tolerant(
                &self.client,
                &make_url,
                FALLBACK_MAX_MISSES,
                timeout,
                ctx,
            )
            .await?;
            hit_ceiling = discovered.hit_ceiling;
            discovered
                .pages
                .iter()
                .map(|&page| PageImage::new(make_url(page), format!("{page:05}")))
                .collect()
        } else {
            names
                .iter()
                .map(|name| PageImage::new(self.image_url(&dir, name), name.clone()))
                .collect()
        };
        debug!(pages = images.len(), "collected page images");

        let mut manifest = Manifest::new(
            format!("Wolfenbüttel HAB MS {manuscript_id}"),
            LibraryId::Wolfenbuettel,
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

/// Pulls the manuscript directory out of either URL form: the classic
/// `wdb.php?dir=mss/{id}` viewer or a direct three-segment diglib path
/// like `varia/selecta/ed000011`.
fn extract_manuscript_id(url: &str) -> Result<String, ResolveError> {
    extract_first_capture(url, &MSS_DIR_RE)
        .or_else(|| extract_first_capture(url, &PATH_DIR_RE))
        .ok_or_else(|| {
            ResolveError::malformed(
                url,
                "no manuscript directory; expected wdb.php?dir=mss/{id} or a diglib path",
            )
        })
}

/// Image directories live under `mss/` unless the id already carries its
/// own path.
fn directory(manuscript_id: &str) -> String {
    if manuscript_id.contains('/') {
        manuscript_id.to_string()
    } else {
        format!("mss/{manuscript_id}")
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::resolver::ResolveOptions;
    use crate::test_support::socket_guard::start_mock_server_or_skip;
    use wiremock::matchers::{method, path, path_regex, query_param};
    use wiremock::{Mock, Request, Respond, ResponseTemplate};

    // ==================== URL parsing ====================

    #[test]
    fn test_extracts_id_from_wdb_url() {
        let id =
            extract_manuscript_id("https://diglib.hab.de/wdb.php?dir=mss/1008-helmst").unwrap();
        assert_eq!(id, "1008-helmst");
        assert_eq!(directory(&id), "mss/1008-helmst");
    }

    #[test]
    fn test_extracts_id_from_direct_path() {
        let id = extract_manuscript_id(
            "https://diglib.hab.de/varia/selecta/ed000011/start.htm?distype=thumbs-img",
        )
        .unwrap();
        assert_eq!(id, "varia/selecta/ed000011");
        assert_eq!(directory(&id), "varia/selecta/ed000011");
    }

    #[test]
    fn test_unrecognized_url_is_malformed() {
        let err = extract_manuscript_id("https://diglib.hab.de/").unwrap_err();
        assert!(matches!(err, ResolveError::MalformedUrl { .. }));
    }

    // ==================== End-to-end against a mock ====================

    fn thumbs_page(dir: &str, names: &[&str], forward_pointer: Option<u32>) -> String {
        let mut body = String::from("<html><body>");
        for name in names {
            body.push_str(&format!(
                "<a href='wdb.php?dir={dir}&image={name}'><img src='t.jpg'></a>"
            ));
        }
        if let Some(pointer) = forward_pointer {
            body.push_str(&format!(
                r#"<a href="thumbs.php?dir={dir}&pointer={pointer}"><img src="f.gif" title="forward"></a>"#
            ));
        }
        body.push_str("</body></html>");
        body
    }

    #[tokio::test]
    async fn test_crawls_thumbnail_pages() {
        let Some(server) = start_mock_server_or_skip().await else {
            return;
        };
        Mock::given(method("GET"))
            .and(path("/thumbs.php"))
            .and(query_param("pointer", "0"))
            .respond_with(ResponseTemplate::new(200).set_body_string(thumbs_page(
                "mss/1008-helmst",
                &["00001", "00002", "00003"],
                Some(3),
            )))
            .mount(&server)
            .await;
        // The second page repeats the last thumbnail of the first.
        Mock::given(method("GET"))
            .and(path("/thumbs.php"))
            .and(query_param("pointer", "3"))
            .respond_with(ResponseTemplate::new(200).set_body_string(thumbs_page(
                "mss/1008-helmst",
                &["00003", "00004", "00005"],
                None,
            )))
            .mount(&server)
            .await;

        let resolver = WolfenbuettelResolver::with_bases(server.uri(), server.uri()).unwrap();
        let ctx = ResolveContext::default();
        let url = format!("{}/wdb.php?dir=mss/1008-helmst", server.uri());
        let resolved = resolver
            .resolve(&url, LibraryId::Wolfenbuettel, &ctx)
            .await
            .unwrap();

        assert_eq!(resolved.display_name, "Wolfenbüttel HAB MS 1008-helmst");
        assert_eq!(resolved.page_count(), 5);
        assert_eq!(resolved.images[0].label, "00001");
        assert_eq!(
            resolved.images[4].url,
            format!("{}/mss/1008-helmst/max/00005.jpg", server.uri())
        );
        assert!(resolved.warnings.is_empty());
    }

    /// Serves max-resolution image files for pages `1..=max_page`.
    struct ImageFileServer {
        max_page: u32,
    }

    impl Respond for ImageFileServer {
        fn respond(&self, request: &Request) -> ResponseTemplate {
            let number: u32 = request
                .url
                .path()
                .rsplit('/')
                .next()
                .and_then(|name| name.strip_suffix(".jpg"))
                .and_then(|name| name.parse().ok())
                .unwrap_or(0);
            if (1..=self.max_page).contains(&number) {
                ResponseTemplate::new(200).insert_header("content-type", "image/jpeg")
            } else {
                ResponseTemplate::new(404)
            }
        }
    }

    #[tokio::test]
    async fn test_falls_back_to_probing_numbered_files() {
        let Some(server) = start_mock_server_or_skip().await else {
            return;
        };
        // No thumbs.php mock: the crawl comes up empty and probing of the
        // numbered files takes over.
        Mock::given(path_regex(r"^/mss/1008-helmst/max/\d{5}\.jpg$"))
            .respond_with(ImageFileServer { max_page: 4 })
            .mount(&server)
            .await;

        let resolver = WolfenbuettelResolver::with_bases(server.uri(), server.uri()).unwrap();
        let ctx = ResolveContext::default();
        let url = format!("{}/wdb.php?dir=mss/1008-helmst", server.uri());
        let resolved = resolver
            .resolve(&url, LibraryId::Wolfenbuettel, &ctx)
            .await
            .unwrap();

        assert_eq!(resolved.page_count(), 4);
        assert_eq!(resolved.images[1].label, "00002");
        assert!(resolved.images[1].url.ends_with("/max/00002.jpg"));
    }

    /// Thumbnail pages that never run out, to exercise the crawl ceiling.
    struct EndlessThumbs;

    impl Respond for EndlessThumbs {
        fn respond(&self, request: &Request) -> ResponseTemplate {
            let pointer: u32 = request
                .url
                .query_pairs()
                .find(|(key, _)| key == "pointer")
                .and_then(|(_, value)| value.parse().ok())
                .unwrap_or(0);
            let names: Vec<String> = (pointer + 1..=pointer + 3)
                .map(|n| format!("{n:05}"))
                .collect();
            let name_refs: Vec<&str> = names.iter().map(String::as_str).collect();
            ResponseTemplate::new(200).set_body_string(thumbs_page(
                "mss/200-helmst",
                &name_refs,
                Some(pointer + 3),
            ))
        }
    }

    #[tokio::test]
    async fn test_crawl_stops_at_the_ceiling() {
        let Some(server) = start_mock_server_or_skip().await else {
            return;
        };
        Mock::given(path("/thumbs.php"))
            .respond_with(EndlessThumbs)
            .mount(&server)
            .await;

        let resolver = WolfenbuettelResolver::with_bases(server.uri(), server.uri()).unwrap();
        let ctx = ResolveContext::with_options(ResolveOptions::new().with_page_ceiling(5));
        let url = format!("{}/wdb.php?dir=mss/200-helmst", server.uri());
        let resolved = resolver
            .resolve(&url, LibraryId::Wolfenbuettel, &ctx)
            .await
            .unwrap();

        assert_eq!(resolved.page_count(), 5);
        assert!(resolved.hit_pagination_limit());
    }

    #[tokio::test]
    async fn test_manuscript_with_no_pages_is_an_error() {
        let Some(server) = start_mock_server_or_skip().await else {
            return;
        };
        Mock::given(path("/thumbs.php"))
            .respond_with(ResponseTemplate::new(200).set_body_string("<html>empty</html>"))
            .mount(&server)
            .await;
        Mock::given(path_regex(r"^/mss/.*\.jpg$"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let resolver = WolfenbuettelResolver::with_bases(server.uri(), server.uri()).unwrap();
        let ctx = ResolveContext::default();
        let url = format!("{}/wdb.php?dir=mss/9999-lost", server.uri());
        let err = resolver
            .resolve(&url, LibraryId::Wolfenbuettel, &ctx)
            .await
            .unwrap_err();
        assert!(matches!(err, ResolveError::ManifestUnreachable { .. }));
    }
}
