//! Existence probing for page discovery on servers without manifests.
//!
//! Several libraries publish numbered page images with no machine-readable
//! page count. Discovery probes candidate URLs and infers the count from
//! which ones exist. The strategies differ in cost profile: binary search
//! over a fixed range, exponential doubling to find an upper bound first,
//! a bounded sequential scan, GET sampling at fixed positions, and a
//! gap-tolerant scan for libraries whose page files have genuine holes.
//! All respect the context's safety ceiling and cancellation flag.

use std::time::Duration;

use futures_util::future::join_all;
use reqwest::Client;
use tracing::debug;

use crate::error::ResolveError;

use super::ResolveContext;

const MAX_DOUBLING_STEPS: u32 = 10;
const MAX_BOUND_FAILURES: u32 = 3;
const MAX_BINARY_FAILURES: u32 = 5;

/// Outcome of probing one candidate URL.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Probe {
    /// Server confirmed the resource (2xx with a non-HTML answer).
    Exists,
    /// Server answered but the resource is absent: 404 and other 4xx, or a
    /// 200 that carries an HTML document where an image was requested.
    Missing,
    /// No conclusion: transport failure, rate limiting, or 5xx. Absence
    /// must not be inferred from server distress.
    Failed,
}

/// Result of page-count discovery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct DiscoveredCount {
    /// Highest confirmed page number (0 when even page 1 is absent).
    pub count: u32,
    /// True when discovery stopped at the safety ceiling instead of an
    /// observed end marker.
    pub hit_ceiling: bool,
}

/// Reads a 2xx answer as existence unless it is an HTML document. Some
/// servers answer missing page images with a 200 error or viewer page
/// instead of a 404, and those phantom pages must not inflate the count.
fn classify_success(response: &reqwest::Response) -> Probe {
    let html = response
        .headers()
        .get(reqwest::header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .is_some_and(|value| value.contains("text/html"));
    if html { Probe::Missing } else { Probe::Exists }
}

/// Probes `url` with HEAD, falling back to GET when the server rejects the
/// method (405/501). The GET body is never read.
pub(crate) async fn probe_exists(client: &Client, url: &str, timeout: Duration) -> Probe {
    match client.head(url).timeout(timeout).send().await {
        Ok(response) => match response.status().as_u16() {
            200..=299 => classify_success(&response),
            405 | 501 => probe_exists_get(client, url, timeout).await,
            429 | 500..=599 => Probe::Failed,
            _ => Probe::Missing,
        },
        Err(error) => {
            debug!(url, error = %error, "probe transport failure");
            Probe::Failed
        }
    }
}

/// Probes `url` with GET, discarding the body.
pub(crate) async fn probe_exists_get(client: &Client, url: &str, timeout: Duration) -> Probe {
    match client.get(url).timeout(timeout).send().await {
        Ok(response) => match response.status().as_u16() {
            200..=299 => classify_success(&response),
            429 | 500..=599 => Probe::Failed,
            _ => Probe::Missing,
        },
        Err(error) => {
            debug!(url, error = %error, "probe transport failure");
            Probe::Failed
        }
    }
}

/// Binary-searches the last existing page in `1..=ceiling`.
///
/// Assumes contiguous pages: if page `n` exists, pages `1..n` do too. A
/// probe failure is treated as absence after bounded tolerance; repeated
/// failures abort with [`ResolveError::ManifestUnreachable`] so callers can
/// fall back to another strategy.
///
/// # Errors
///
/// Fails on cancellation or when [`MAX_BINARY_FAILURES`] probes could not
/// reach the server.
pub(crate) async fn discover_count_binary(
    client: &Client,
    make_url: &(dyn Fn(u32) -> String + Send + Sync),
    timeout: Duration,
    ctx: &ResolveContext,
) -> Result<DiscoveredCount, ResolveError> {
    let ceiling = ctx.options.page_ceiling.max(1);
    let first_url = make_url(1);
    ctx.check_cancelled(&first_url)?;

    if probe_exists(client, &first_url, timeout).await != Probe::Exists {
        return Ok(DiscoveredCount {
            count: 0,
            hit_ceiling: false,
        });
    }
    if probe_exists(client, &make_url(ceiling), timeout).await == Probe::Exists {
        return Ok(DiscoveredCount {
            count: ceiling,
            hit_ceiling: true,
        });
    }

    let mut low = 1u32;
    let mut high = ceiling - 1;
    let mut failures = 0u32;
    while low < high {
        ctx.check_cancelled(&first_url)?;
        // Upper midpoint keeps the invariant that `low` always exists.
        let mid = low + (high - low).div_ceil(2);
        match probe_exists(client, &make_url(mid), timeout).await {
            Probe::Exists => low = mid,
            Probe::Missing => high = mid - 1,
            Probe::Failed => {
                failures += 1;
                if failures >= MAX_BINARY_FAILURES {
                    return Err(ResolveError::unreachable(
                        &make_url(mid),
                        failures,
                        "page probing kept failing before reaching the server",
                    ));
                }
                high = mid - 1;
            }
        }
    }
    Ok(DiscoveredCount {
        count: low,
        hit_ceiling: false,
    })
}

/// Finds the page count by exponential doubling, then binary search inside
/// the final bracket.
///
/// # Errors
///
/// Fails on cancellation, or when consecutive probe failures exceed the
/// bound-finding ([`MAX_BOUND_FAILURES`]) or binary ([`MAX_BINARY_FAILURES`])
/// tolerance; callers treat that as "try a different discovery strategy".
pub(crate) async fn discover_count_doubling(
    client: &Client,
    make_url: &(dyn Fn(u32) -> String + Send + Sync),
    timeout: Duration,
    ctx: &ResolveContext,
) -> Result<DiscoveredCount, ResolveError> {
    let ceiling = ctx.options.page_ceiling.max(1);

    let mut bound = 1u32;
    let mut last_good = 0u32;
    let mut failures = 0u32;
    for _ in 0..MAX_DOUBLING_STEPS {
        ctx.check_cancelled(&make_url(bound))?;
        match probe_exists(client, &make_url(bound), timeout).await {
            Probe::Exists => {
                last_good = bound;
                if bound > ceiling {
                    break;
                }
                bound = bound.saturating_mul(2);
            }
            Probe::Missing => break,
            Probe::Failed => {
                failures += 1;
                if failures >= MAX_BOUND_FAILURES {
                    return Err(ResolveError::unreachable(
                        &make_url(bound),
                        failures,
                        "page probing kept failing while finding an upper bound",
                    ));
                }
            }
        }
    }

    if last_good == 0 {
        return Ok(DiscoveredCount {
            count: 0,
            hit_ceiling: false,
        });
    }
    if last_good >= ceiling {
        return Ok(DiscoveredCount {
            count: ceiling,
            hit_ceiling: true,
        });
    }

    let mut low = last_good;
    let mut high = bound.min(ceiling);
    failures = 0;
    while low < high {
        ctx.check_cancelled(&make_url(low))?;
        let mid = low + (high - low).div_ceil(2);
        match probe_exists(client, &make_url(mid), timeout).await {
            Probe::Exists => low = mid,
            Probe::Missing => high = mid - 1,
            Probe::Failed => {
                failures += 1;
                if failures >= MAX_BINARY_FAILURES {
                    return Err(ResolveError::unreachable(
                        &make_url(mid),
                        failures,
                        "page probing kept failing before reaching the server",
                    ));
                }
                high = mid - 1;
            }
        }
    }
    Ok(DiscoveredCount {
        count: low.min(ceiling),
        hit_ceiling: low >= ceiling,
    })
}

/// Scans pages from 1 upward until the first absent page, probing in
/// concurrent batches bounded by the context's fetch cap.
///
/// Batch results are examined in page order, so a mid-batch boundary yields
/// the exact count even though later probes in the batch were wasted. A
/// probe failure past page 1 conservatively ends the scan with the pages
/// confirmed so far.
///
/// # Errors
///
/// Fails on cancellation, or when page 1 itself could not be probed.
pub(crate) async fn discover_count_sequential(
    client: &Client,
    make_url: &(dyn Fn(u32) -> String + Send + Sync),
    timeout: Duration,
    ctx: &ResolveContext,
) -> Result<DiscoveredCount, ResolveError> {
    let ceiling = ctx.options.page_ceiling.max(1);
    #[allow(clippy::cast_possible_truncation)]
    let batch_size = ctx.options.fetch_concurrency() as u32;

    let mut count = 0u32;
    let mut next = 1u32;
    while next <= ceiling {
        ctx.check_cancelled(&make_url(next))?;
        let batch_end = next.saturating_add(batch_size - 1).min(ceiling);
        let probes = join_all((next..=batch_end).map(|page| {
            let url = make_url(page);
            async move { probe_exists(client, &url, timeout).await }
        }))
        .await;

        for outcome in probes {
            match outcome {
                Probe::Exists => count += 1,
                Probe::Missing => {
                    return Ok(DiscoveredCount {
                        count,
                        hit_ceiling: false,
                    });
                }
                Probe::Failed => {
                    if count == 0 {
                        return Err(ResolveError::unreachable(
                            &make_url(1),
                            1,
                            "could not probe the first page",
                        ));
                    }
                    return Ok(DiscoveredCount {
                        count,
                        hit_ceiling: false,
                    });
                }
            }
        }
        next = batch_end + 1;
    }
    Ok(DiscoveredCount {
        count,
        hit_ceiling: true,
    })
}

/// Pages confirmed by a gap-tolerant scan, in ascending order but not
/// necessarily contiguous.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct DiscoveredPages {
    pub pages: Vec<u32>,
    /// True when the scan stopped at the safety ceiling instead of a run
    /// of absent pages.
    pub hit_ceiling: bool,
}

/// Scans pages from 1 upward, collecting every page the server confirms
/// and skipping over gaps: only `max_misses` consecutive absent pages end
/// the scan. Probes run in concurrent batches bounded by the context's
/// fetch cap, with batch results examined in page order.
///
/// # Errors
///
/// Fails on cancellation, or when the scan found nothing and no probe
/// ever got an answer out of the server.
pub(crate) async fn discover_pages_tolerant(
    client: &Client,
    make_url: &(dyn Fn(u32) -> String + Send + Sync),
    max_misses: u32,
    timeout: Duration,
    ctx: &ResolveContext,
) -> Result<DiscoveredPages, ResolveError> {
    let ceiling = ctx.options.page_ceiling.max(1);
    #[allow(clippy::cast_possible_truncation)]
    let batch_size = ctx.options.fetch_concurrency() as u32;

    let mut pages = Vec::new();
    let mut misses = 0u32;
    let mut server_answered = false;
    let mut next = 1u32;
    'scan: while next <= ceiling {
        ctx.check_cancelled(&make_url(next))?;
        let batch_end = next.saturating_add(batch_size - 1).min(ceiling);
        let probes = join_all((next..=batch_end).map(|page| {
            let url = make_url(page);
            async move { (page, probe_exists(client, &url, timeout).await) }
        }))
        .await;

        for (page, outcome) in probes {
            match outcome {
                Probe::Exists => {
                    misses = 0;
                    server_answered = true;
                    pages.push(page);
                }
                outcome => {
                    if outcome == Probe::Missing {
                        server_answered = true;
                    }
                    misses += 1;
                    if misses >= max_misses {
                        break 'scan;
                    }
                }
            }
        }
        next = batch_end + 1;
    }

    if pages.is_empty() {
        let first_url = make_url(1);
        return Err(if server_answered {
            ResolveError::bad_response(&first_url, "probing found no pages at the image addresses")
        } else {
            ResolveError::unreachable(
                &first_url,
                max_misses,
                "page probing kept failing before reaching the server",
            )
        });
    }
    // `next` only passes the ceiling when no miss run ended the scan.
    Ok(DiscoveredPages {
        pages,
        hit_ceiling: next > ceiling,
    })
}

/// Finds the page count from GET samples at fixed positions, then
/// fine-tunes downward from the first absent sample.
///
/// Used when HEAD probing is unreliable (servers that answer HEAD
/// inconsistently): the samples bracket the count cheaply, and the
/// descending scan pins it exactly.
pub(crate) async fn discover_count_sampling(
    client: &Client,
    make_url: &(dyn Fn(u32) -> String + Send + Sync),
    samples: &[u32],
    timeout: Duration,
    ctx: &ResolveContext,
) -> Result<DiscoveredCount, ResolveError> {
    let ceiling = ctx.options.page_ceiling.max(1);

    let mut last_good = 0u32;
    let mut first_missing = None;
    for &sample in samples {
        if sample > ceiling {
            break;
        }
        ctx.check_cancelled(&make_url(sample))?;
        match probe_exists_get(client, &make_url(sample), timeout).await {
            Probe::Exists => last_good = sample,
            _ => {
                first_missing = Some(sample);
                break;
            }
        }
    }

    if last_good == 0 {
        return Ok(DiscoveredCount {
            count: 0,
            hit_ceiling: false,
        });
    }

    let Some(first_missing) = first_missing else {
        // Every sample existed; the count is at least the largest sample.
        return Ok(DiscoveredCount {
            count: last_good.min(ceiling),
            hit_ceiling: last_good >= ceiling,
        });
    };

    for page in (last_good + 1..first_missing).rev() {
        ctx.check_cancelled(&make_url(page))?;
        if probe_exists_get(client, &make_url(page), timeout).await == Probe::Exists {
            return Ok(DiscoveredCount {
                count: page,
                hit_ceiling: false,
            });
        }
    }
    Ok(DiscoveredCount {
        count: last_good,
        hit_ceiling: false,
    })
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::resolver::ResolveOptions;
    use crate::test_support::socket_guard::start_mock_server_or_skip;
    use wiremock::matchers::path_regex;
    use wiremock::{Mock, MockServer, Request, Respond, ResponseTemplate};

    /// Serves /page/{n} with 200 for n <= max_page, 404 above.
    struct PageServer {
        max_page: u32,
    }

    impl Respond for PageServer {
        fn respond(&self, request: &Request) -> ResponseTemplate {
            let number: u32 = request
                .url
                .path()
                .rsplit('/')
                .next()
                .and_then(|segment| segment.parse().ok())
                .unwrap_or(0);
            if (1..=self.max_page).contains(&number) {
                ResponseTemplate::new(200)
            } else {
                ResponseTemplate::new(404)
            }
        }
    }

    /// Serves /page/{n} with 200 for the numbers in `present`, 404 otherwise.
    struct GapServer {
        present: Vec<u32>,
    }

    impl Respond for GapServer {
        fn respond(&self, request: &Request) -> ResponseTemplate {
            let number: u32 = request
                .url
                .path()
                .rsplit('/')
                .next()
                .and_then(|segment| segment.parse().ok())
                .unwrap_or(0);
            if self.present.contains(&number) {
                ResponseTemplate::new(200)
            } else {
                ResponseTemplate::new(404)
            }
        }
    }

    async fn mount_pages(server: &MockServer, max_page: u32) {
        Mock::given(path_regex(r"^/page/\d+$"))
            .respond_with(PageServer { max_page })
            .mount(server)
            .await;
    }

    fn page_url_maker(base: String) -> impl Fn(u32) -> String + Send + Sync {
        move |page| format!("{base}/page/{page}")
    }

    // ==================== probe_exists ====================

    #[tokio::test]
    async fn test_probe_exists_head() {
        let Some(server) = start_mock_server_or_skip().await else {
            return;
        };
        mount_pages(&server, 3).await;
        let client = Client::new();
        let timeout = Duration::from_secs(5);

        let url = format!("{}/page/2", server.uri());
        assert_eq!(probe_exists(&client, &url, timeout).await, Probe::Exists);
        let url = format!("{}/page/4", server.uri());
        assert_eq!(probe_exists(&client, &url, timeout).await, Probe::Missing);
    }

    #[tokio::test]
    async fn test_probe_falls_back_to_get_on_405() {
        let Some(server) = start_mock_server_or_skip().await else {
            return;
        };
        Mock::given(wiremock::matchers::method("HEAD"))
            .respond_with(ResponseTemplate::new(405))
            .mount(&server)
            .await;
        Mock::given(wiremock::matchers::method("GET"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;

        let client = Client::new();
        let url = format!("{}/page/1", server.uri());
        assert_eq!(
            probe_exists(&client, &url, Duration::from_secs(5)).await,
            Probe::Exists
        );
    }

    #[tokio::test]
    async fn test_probe_html_answer_counts_as_missing() {
        let Some(server) = start_mock_server_or_skip().await else {
            return;
        };
        Mock::given(path_regex(".*"))
            .respond_with(
                ResponseTemplate::new(200).insert_header("content-type", "text/html; charset=utf-8"),
            )
            .mount(&server)
            .await;

        let client = Client::new();
        let url = format!("{}/page/1", server.uri());
        let timeout = Duration::from_secs(5);
        assert_eq!(probe_exists(&client, &url, timeout).await, Probe::Missing);
        assert_eq!(probe_exists_get(&client, &url, timeout).await, Probe::Missing);
    }

    #[tokio::test]
    async fn test_probe_server_error_is_failed_not_missing() {
        let Some(server) = start_mock_server_or_skip().await else {
            return;
        };
        Mock::given(path_regex(".*"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let client = Client::new();
        let url = format!("{}/page/1", server.uri());
        assert_eq!(
            probe_exists(&client, &url, Duration::from_secs(5)).await,
            Probe::Failed
        );
    }

    // ==================== Discovery Strategies ====================

    #[tokio::test]
    async fn test_binary_discovery_finds_exact_count() {
        let Some(server) = start_mock_server_or_skip().await else {
            return;
        };
        mount_pages(&server, 278).await;
        let client = Client::new();
        let make_url = page_url_maker(server.uri());
        let ctx = ResolveContext::default();

        let discovered =
            discover_count_binary(&client, &make_url, Duration::from_secs(5), &ctx)
                .await
                .unwrap();
        assert_eq!(discovered.count, 278);
        assert!(!discovered.hit_ceiling);
    }

    #[tokio::test]
    async fn test_binary_discovery_empty_document() {
        let Some(server) = start_mock_server_or_skip().await else {
            return;
        };
        mount_pages(&server, 0).await;
        let client = Client::new();
        let make_url = page_url_maker(server.uri());
        let ctx = ResolveContext::default();

        let discovered =
            discover_count_binary(&client, &make_url, Duration::from_secs(5), &ctx)
                .await
                .unwrap();
        assert_eq!(discovered.count, 0);
    }

    #[tokio::test]
    async fn test_doubling_discovery_finds_exact_count() {
        let Some(server) = start_mock_server_or_skip().await else {
            return;
        };
        mount_pages(&server, 57).await;
        let client = Client::new();
        let make_url = page_url_maker(server.uri());
        let ctx = ResolveContext::default();

        let discovered =
            discover_count_doubling(&client, &make_url, Duration::from_secs(5), &ctx)
                .await
                .unwrap();
        assert_eq!(discovered.count, 57);
        assert!(!discovered.hit_ceiling);
    }

    #[tokio::test]
    async fn test_sequential_discovery_stops_at_first_gap() {
        let Some(server) = start_mock_server_or_skip().await else {
            return;
        };
        mount_pages(&server, 9).await;
        let client = Client::new();
        let make_url = page_url_maker(server.uri());
        let ctx = ResolveContext::default();

        let discovered =
            discover_count_sequential(&client, &make_url, Duration::from_secs(5), &ctx)
                .await
                .unwrap();
        assert_eq!(discovered.count, 9);
        assert!(!discovered.hit_ceiling);
    }

    #[tokio::test]
    async fn test_sequential_discovery_hits_ceiling_exactly() {
        let Some(server) = start_mock_server_or_skip().await else {
            return;
        };
        // Server never runs out of pages; the ceiling must stop the scan.
        mount_pages(&server, u32::MAX).await;
        let client = Client::new();
        let make_url = page_url_maker(server.uri());
        let ctx = ResolveContext::with_options(ResolveOptions::new().with_page_ceiling(25));

        let discovered =
            discover_count_sequential(&client, &make_url, Duration::from_secs(5), &ctx)
                .await
                .unwrap();
        assert_eq!(discovered.count, 25);
        assert!(discovered.hit_ceiling);
    }

    #[tokio::test]
    async fn test_tolerant_scan_skips_short_gaps() {
        let Some(server) = start_mock_server_or_skip().await else {
            return;
        };
        // Page 3 is genuinely absent; the scan must step over it and only
        // stop at the three-page run after page 5.
        Mock::given(path_regex(r"^/page/\d+$"))
            .respond_with(GapServer {
                present: vec![1, 2, 4, 5],
            })
            .mount(&server)
            .await;
        let client = Client::new();
        let make_url = page_url_maker(server.uri());
        let ctx = ResolveContext::default();

        let discovered =
            discover_pages_tolerant(&client, &make_url, 3, Duration::from_secs(5), &ctx)
                .await
                .unwrap();
        assert_eq!(discovered.pages, vec![1, 2, 4, 5]);
        assert!(!discovered.hit_ceiling);
    }

    #[tokio::test]
    async fn test_tolerant_scan_with_nothing_found_is_an_error() {
        let Some(server) = start_mock_server_or_skip().await else {
            return;
        };
        Mock::given(path_regex(r"^/page/\d+$"))
            .respond_with(GapServer {
                present: Vec::new(),
            })
            .mount(&server)
            .await;
        let client = Client::new();
        let make_url = page_url_maker(server.uri());
        let ctx = ResolveContext::default();

        let err = discover_pages_tolerant(&client, &make_url, 3, Duration::from_secs(5), &ctx)
            .await
            .unwrap_err();
        assert!(matches!(err, ResolveError::ManifestUnreachable { .. }));
    }

    #[tokio::test]
    async fn test_sampling_discovery_fine_tunes_downward() {
        let Some(server) = start_mock_server_or_skip().await else {
            return;
        };
        mount_pages(&server, 83).await;
        let client = Client::new();
        let make_url = page_url_maker(server.uri());
        let ctx = ResolveContext::default();

        let discovered = discover_count_sampling(
            &client,
            &make_url,
            &[1, 5, 10, 20, 50, 100, 200, 500],
            Duration::from_secs(5),
            &ctx,
        )
        .await
        .unwrap();
        assert_eq!(discovered.count, 83);
    }

    #[tokio::test]
    async fn test_discovery_respects_cancellation() {
        let Some(server) = start_mock_server_or_skip().await else {
            return;
        };
        mount_pages(&server, 100).await;
        let client = Client::new();
        let make_url = page_url_maker(server.uri());
        let ctx = ResolveContext::default();
        ctx.cancel.cancel();

        let err = discover_count_binary(&client, &make_url, Duration::from_secs(5), &ctx)
            .await
            .unwrap_err();
        assert!(err.is_cancelled());
    }
}
