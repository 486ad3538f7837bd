//! Shared HTTP plumbing for resolvers and tile assembly.
//!
//! Centralizes client construction policy (timeouts, user-agent,
//! compression, cookies, proxy compatibility) plus the retrying fetch
//! helpers every resolver goes through. Per-library read timeouts are
//! applied per request; the process-wide defaults are adjustable for
//! runtime configuration and tests.

pub(crate) mod inflight;
pub mod retry;

pub use retry::{
    DEFAULT_MAX_ATTEMPTS, FailureType, RetryDecision, RetryPolicy, classify_status,
    classify_transport_error, parse_retry_after,
};

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use reqwest::header::{HeaderMap, HeaderValue};
use reqwest::{Client, ClientBuilder, Proxy};
use serde::de::DeserializeOwned;
use tracing::{debug, warn};

use crate::error::ResolveError;
use crate::user_agent;

const CONNECT_TIMEOUT_SECS: u64 = 10;
const READ_TIMEOUT_SECS: u64 = 30;

/// Caller-initiated cancellation handle.
///
/// Cloned handles share one flag. Resolution checks it between suspension
/// points and yields [`ResolveError::Cancelled`] instead of a partial
/// result; the retry loops also abandon their backoff sleeps.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    /// Creates a fresh, uncancelled flag.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Requests cancellation; all clones observe it.
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    /// True once [`CancelFlag::cancel`] has been called on any clone.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// Errors with [`ResolveError::Cancelled`] once cancelled.
    pub(crate) fn check(&self, input: &str) -> Result<(), ResolveError> {
        if self.is_cancelled() {
            Err(ResolveError::cancelled(input))
        } else {
            Ok(())
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct HttpTimeouts {
    connect_timeout_secs: u64,
    read_timeout_secs: u64,
}

static HTTP_TIMEOUTS: RwLock<HttpTimeouts> = RwLock::new(HttpTimeouts {
    connect_timeout_secs: CONNECT_TIMEOUT_SECS,
    read_timeout_secs: READ_TIMEOUT_SECS,
});

/// Configures the process-wide HTTP timeout defaults used by client builders.
///
/// Per-library read timeouts still override the default per request; this
/// call tunes the baseline (and is how tests shrink the fuse).
pub fn configure_http_timeouts(connect_timeout_secs: u64, read_timeout_secs: u64) {
    if let Ok(mut guard) = HTTP_TIMEOUTS.write() {
        *guard = HttpTimeouts {
            connect_timeout_secs,
            read_timeout_secs,
        };
    }
}

fn http_timeouts() -> HttpTimeouts {
    HTTP_TIMEOUTS.read().map(|guard| *guard).unwrap_or(HttpTimeouts {
        connect_timeout_secs: CONNECT_TIMEOUT_SECS,
        read_timeout_secs: READ_TIMEOUT_SECS,
    })
}

/// Builds a resolver HTTP client using shared project policy.
///
/// `client_name` is used only for error messages and logging, not in the
/// User-Agent header (one shared UA keeps traffic consistent per site).
///
/// # Errors
///
/// Returns [`ResolveError::ManifestUnreachable`] when construction fails.
pub(crate) fn build_http_client(client_name: &str) -> Result<Client, ResolveError> {
    let user_agent = user_agent::default_resolver_user_agent();

    match try_build_client(&user_agent, false) {
        Ok(client) => Ok(client),
        Err(BuildClientFailure::Panic) => {
            // Some restricted macOS CI/sandbox environments panic when querying
            // system proxy settings. Fallback keeps env-proxy support while
            // bypassing system lookup so resolver constructors stay panic-free.
            warn!(
                client = client_name,
                "HTTP client hit system proxy panic; using env-proxy fallback builder"
            );
            match try_build_client(&user_agent, true) {
                Ok(client) => Ok(client),
                Err(BuildClientFailure::Panic) => Err(ResolveError::unreachable(
                    client_name,
                    1,
                    "HTTP client construction panicked while initializing networking",
                )),
                Err(BuildClientFailure::Build(error)) => Err(ResolveError::unreachable(
                    client_name,
                    1,
                    &format!("HTTP client construction failed: {error}"),
                )),
            }
        }
        Err(BuildClientFailure::Build(error)) => Err(ResolveError::unreachable(
            client_name,
            1,
            &format!("HTTP client construction failed: {error}"),
        )),
    }
}

enum BuildClientFailure {
    Panic,
    Build(reqwest::Error),
}

fn try_build_client(
    user_agent: &str,
    disable_system_proxy_lookup: bool,
) -> Result<Client, BuildClientFailure> {
    let user_agent = user_agent.to_string();
    catch_unwind(AssertUnwindSafe(move || {
        let mut builder = base_builder(user_agent);
        if disable_system_proxy_lookup {
            builder = apply_env_proxy_fallback(builder.no_proxy());
        }
        builder.build().map_err(BuildClientFailure::Build)
    }))
    .map_err(|_| BuildClientFailure::Panic)?
}

fn base_builder(user_agent: String) -> ClientBuilder {
    let timeouts = http_timeouts();
    Client::builder()
        .connect_timeout(Duration::from_secs(timeouts.connect_timeout_secs))
        .timeout(Duration::from_secs(timeouts.read_timeout_secs))
        .user_agent(user_agent)
        .gzip(true)
        // Several viewers (magparser, ContentDM) require a session cookie
        // established by an earlier page load.
        .cookie_store(true)
}

fn apply_env_proxy_fallback(mut builder: ClientBuilder) -> ClientBuilder {
    if let Some(proxy) = env_proxy_for_scheme("https")
        && let Ok(resolved) = Proxy::https(&proxy)
    {
        builder = builder.proxy(resolved);
    }
    if let Some(proxy) = env_proxy_for_scheme("http")
        && let Ok(resolved) = Proxy::http(&proxy)
    {
        builder = builder.proxy(resolved);
    }
    builder
}

fn env_proxy_for_scheme(scheme: &str) -> Option<String> {
    match scheme {
        "https" => find_first_proxy_var(&["HTTPS_PROXY", "https_proxy", "ALL_PROXY", "all_proxy"]),
        "http" => find_first_proxy_var(&["HTTP_PROXY", "http_proxy", "ALL_PROXY", "all_proxy"]),
        _ => None,
    }
}

fn find_first_proxy_var(names: &[&str]) -> Option<String> {
    names.iter().find_map(|name| {
        std::env::var(name)
            .ok()
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
    })
}

/// Browser-profile headers for viewers that reject tool user agents.
///
/// An unparseable referer is skipped rather than failing the request; the
/// header is advisory.
#[must_use]
pub(crate) fn browser_headers(referer: Option<&str>) -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.insert(
        reqwest::header::USER_AGENT,
        HeaderValue::from_static(user_agent::BROWSER_USER_AGENT),
    );
    headers.insert(
        reqwest::header::ACCEPT,
        HeaderValue::from_static(
            "text/html,application/xhtml+xml,application/xml;q=0.9,image/webp,*/*;q=0.8",
        ),
    );
    if let Some(referer) = referer
        && let Ok(value) = HeaderValue::from_str(referer)
    {
        headers.insert(reqwest::header::REFERER, value);
    }
    headers
}

/// Human-readable reason for a failing HTTP status, used in error messages.
#[must_use]
pub(crate) fn reason_for_status(status: u16) -> String {
    match status {
        404 => "the document was not found (HTTP 404); the link may be stale".to_string(),
        403 => "the server denied access (HTTP 403)".to_string(),
        429 => "the server is rate limiting requests (HTTP 429)".to_string(),
        status if (500..600).contains(&status) => {
            format!("the server failed to answer (HTTP {status})")
        }
        status => format!("unexpected response (HTTP {status})"),
    }
}

/// Outcome of a single fetch attempt, before retry classification.
enum AttemptFailure {
    Status {
        status: u16,
        retry_after: Option<Duration>,
    },
    Transport(reqwest::Error),
}

impl AttemptFailure {
    fn failure_type(&self) -> FailureType {
        match self {
            Self::Status { status, .. } => classify_status(*status),
            Self::Transport(error) => classify_transport_error(error),
        }
    }

    fn reason(&self) -> String {
        match self {
            Self::Status { status, .. } => reason_for_status(*status),
            Self::Transport(error) if error.is_timeout() => {
                "the request timed out".to_string()
            }
            Self::Transport(error) => format!("network error: {error}"),
        }
    }

    fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::Status { retry_after, .. } => *retry_after,
            Self::Transport(_) => None,
        }
    }
}

async fn fetch_text_once(
    client: &Client,
    url: &str,
    timeout: Duration,
    headers: Option<&HeaderMap>,
) -> Result<String, AttemptFailure> {
    let mut request = client.get(url).timeout(timeout);
    if let Some(headers) = headers {
        request = request.headers(headers.clone());
    }

    let response = request.send().await.map_err(AttemptFailure::Transport)?;
    let status = response.status();
    if !status.is_success() {
        let retry_after = response
            .headers()
            .get(reqwest::header::RETRY_AFTER)
            .and_then(|value| value.to_str().ok())
            .and_then(parse_retry_after);
        return Err(AttemptFailure::Status {
            status: status.as_u16(),
            retry_after,
        });
    }

    response.text().await.map_err(AttemptFailure::Transport)
}

/// Fetches a URL's body as text with bounded retry on transient failures.
///
/// Permanent failures (4xx, TLS) surface immediately; transient and
/// rate-limited ones are retried per `policy`, honoring `Retry-After`.
/// A set cancel flag aborts between attempts.
///
/// # Errors
///
/// Returns [`ResolveError::ManifestUnreachable`] describing the last
/// failure, or [`ResolveError::Cancelled`] when the flag fired.
pub(crate) async fn fetch_text(
    client: &Client,
    url: &str,
    timeout: Duration,
    policy: &RetryPolicy,
    headers: Option<&HeaderMap>,
    cancel: Option<&CancelFlag>,
) -> Result<String, ResolveError> {
    let mut attempt: u32 = 1;
    loop {
        if let Some(cancel) = cancel {
            cancel.check(url)?;
        }

        let failure = match fetch_text_once(client, url, timeout, headers).await {
            Ok(body) => return Ok(body),
            Err(failure) => failure,
        };

        match policy.should_retry(failure.failure_type(), attempt, failure.retry_after()) {
            RetryDecision::Retry { delay, attempt: next } => {
                debug!(url, attempt, delay_ms = delay.as_millis(), "retrying fetch");
                tokio::time::sleep(delay).await;
                attempt = next;
            }
            RetryDecision::DoNotRetry { .. } => {
                return Err(ResolveError::unreachable(url, attempt, &failure.reason()));
            }
        }
    }
}

/// Fetches and deserializes a JSON document.
///
/// Parse failures are terminal ([`ResolveError::ManifestUnreachable`] via
/// [`ResolveError::bad_response`]); a server that answers with the wrong
/// document shape will not answer differently on retry.
pub(crate) async fn fetch_json<T: DeserializeOwned>(
    client: &Client,
    url: &str,
    timeout: Duration,
    policy: &RetryPolicy,
    headers: Option<&HeaderMap>,
    cancel: Option<&CancelFlag>,
) -> Result<T, ResolveError> {
    let body = fetch_text(client, url, timeout, policy, headers, cancel).await?;
    serde_json::from_str(&body).map_err(|error| {
        ResolveError::bad_response(url, &format!("response was not the expected JSON: {error}"))
    })
}

/// Fetches a URL's body as raw bytes with the same retry behavior as
/// [`fetch_text`]. Used for tile downloads.
pub(crate) async fn fetch_bytes(
    client: &Client,
    url: &str,
    timeout: Duration,
    policy: &RetryPolicy,
    cancel: Option<&CancelFlag>,
) -> Result<Vec<u8>, ResolveError> {
    let mut attempt: u32 = 1;
    loop {
        if let Some(cancel) = cancel {
            cancel.check(url)?;
        }

        let failure = match fetch_bytes_once(client, url, timeout).await {
            Ok(body) => return Ok(body),
            Err(failure) => failure,
        };

        match policy.should_retry(failure.failure_type(), attempt, failure.retry_after()) {
            RetryDecision::Retry { delay, attempt: next } => {
                debug!(url, attempt, delay_ms = delay.as_millis(), "retrying tile fetch");
                tokio::time::sleep(delay).await;
                attempt = next;
            }
            RetryDecision::DoNotRetry { .. } => {
                return Err(ResolveError::unreachable(url, attempt, &failure.reason()));
            }
        }
    }
}

async fn fetch_bytes_once(
    client: &Client,
    url: &str,
    timeout: Duration,
) -> Result<Vec<u8>, AttemptFailure> {
    let response = client
        .get(url)
        .timeout(timeout)
        .send()
        .await
        .map_err(AttemptFailure::Transport)?;
    let status = response.status();
    if !status.is_success() {
        let retry_after = response
            .headers()
            .get(reqwest::header::RETRY_AFTER)
            .and_then(|value| value.to_str().ok())
            .and_then(parse_retry_after);
        return Err(AttemptFailure::Status {
            status: status.as_u16(),
            retry_after,
        });
    }
    response
        .bytes()
        .await
        .map(|bytes| bytes.to_vec())
        .map_err(AttemptFailure::Transport)
}
