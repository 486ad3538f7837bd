//! Descending resolution ladder for image servers that reject large
//! size requests.
//!
//! Some IIIF endpoints advertise no maximum width and answer oversized
//! requests with errors instead of downscaling. The ladder tries candidate
//! widths from largest to smallest against one sample page; the first size
//! the server confirms is used for every page of the manuscript.

use std::time::Duration;

use reqwest::Client;
use tracing::debug;

use crate::error::ResolveError;

use super::ResolveContext;
use super::probe::{Probe, probe_exists};

/// Candidate widths in preference order.
pub(crate) const SIZE_LADDER: [u32; 5] = [6000, 4000, 2048, 1024, 800];

const MAX_CONSECUTIVE_FAILURES: u32 = 3;

/// Returns the largest ladder width the server confirms for a sample page.
///
/// `make_url` builds the sample request for a given width. Rejections walk
/// down the ladder; transport failures are tolerated up to
/// [`MAX_CONSECUTIVE_FAILURES`] in a row before concluding the server is
/// unreachable rather than picky.
///
/// # Errors
///
/// Returns [`ResolveError::ResolutionExhausted`] when every ladder width is
/// rejected, [`ResolveError::ManifestUnreachable`] when probing kept
/// failing, or [`ResolveError::Cancelled`].
pub(crate) async fn pick_best_size(
    client: &Client,
    make_url: &(dyn Fn(u32) -> String + Send + Sync),
    timeout: Duration,
    ctx: &ResolveContext,
) -> Result<u32, ResolveError> {
    let mut consecutive_failures = 0u32;
    let mut last_url = String::new();

    for &size in &SIZE_LADDER {
        let url = make_url(size);
        ctx.check_cancelled(&url)?;
        match probe_exists(client, &url, timeout).await {
            Probe::Exists => {
                debug!(size, "resolution ladder settled");
                return Ok(size);
            }
            Probe::Missing => {
                consecutive_failures = 0;
                debug!(size, "size rejected, stepping down");
            }
            Probe::Failed => {
                consecutive_failures += 1;
                if consecutive_failures >= MAX_CONSECUTIVE_FAILURES {
                    return Err(ResolveError::unreachable(
                        &url,
                        consecutive_failures,
                        "size probing kept failing before reaching the server",
                    ));
                }
            }
        }
        last_url = url;
    }

    Err(ResolveError::exhausted(&last_url, SIZE_LADDER.len()))
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::test_support::socket_guard::start_mock_server_or_skip;
    use wiremock::matchers::path_regex;
    use wiremock::{Mock, MockServer, Request, Respond, ResponseTemplate};

    /// Serves /full/{width},/0/default.jpg with 200 for width <= cap.
    struct WidthCapServer {
        cap: u32,
    }

    impl Respond for WidthCapServer {
        fn respond(&self, request: &Request) -> ResponseTemplate {
            let width: u32 = request
                .url
                .path()
                .split('/')
                .find_map(|segment| segment.strip_suffix(','))
                .and_then(|w| w.parse().ok())
                .unwrap_or(0);
            if width <= self.cap {
                ResponseTemplate::new(200)
            } else {
                ResponseTemplate::new(403)
            }
        }
    }

    async fn mount_cap(server: &MockServer, cap: u32) {
        Mock::given(path_regex(r"^/iiif/sample/full/\d+,/0/default\.jpg$"))
            .respond_with(WidthCapServer { cap })
            .mount(server)
            .await;
    }

    fn size_url_maker(base: String) -> impl Fn(u32) -> String + Send + Sync {
        move |size| format!("{base}/iiif/sample/full/{size},/0/default.jpg")
    }

    #[tokio::test]
    async fn test_ladder_picks_largest_accepted_size() {
        let Some(server) = start_mock_server_or_skip().await else {
            return;
        };
        mount_cap(&server, 2048).await;
        let client = Client::new();
        let make_url = size_url_maker(server.uri());
        let ctx = ResolveContext::default();

        let size = pick_best_size(&client, &make_url, Duration::from_secs(5), &ctx)
            .await
            .unwrap();
        assert_eq!(size, 2048);
    }

    #[tokio::test]
    async fn test_ladder_picks_top_size_when_unrestricted() {
        let Some(server) = start_mock_server_or_skip().await else {
            return;
        };
        mount_cap(&server, u32::MAX).await;
        let client = Client::new();
        let make_url = size_url_maker(server.uri());
        let ctx = ResolveContext::default();

        let size = pick_best_size(&client, &make_url, Duration::from_secs(5), &ctx)
            .await
            .unwrap();
        assert_eq!(size, SIZE_LADDER[0]);
    }

    #[tokio::test]
    async fn test_ladder_exhaustion_is_an_error() {
        let Some(server) = start_mock_server_or_skip().await else {
            return;
        };
        mount_cap(&server, 0).await;
        let client = Client::new();
        let make_url = size_url_maker(server.uri());
        let ctx = ResolveContext::default();

        let err = pick_best_size(&client, &make_url, Duration::from_secs(5), &ctx)
            .await
            .unwrap_err();
        assert!(matches!(err, ResolveError::ResolutionExhausted { .. }));
    }
}
