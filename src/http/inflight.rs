//! Coalesces concurrent fetches of the same URL into one request.
//!
//! Batch resolution frequently asks for the same manifest twice (duplicate
//! input URLs, or two inputs that sanitize to the same document). Instead of
//! hammering the library server, concurrent callers share a single in-flight
//! request and each receive the same body. The cache holds only futures that
//! are still running; entries are evicted as soon as the request settles, so
//! a later call observes fresh server state.

use std::sync::LazyLock;
use std::time::Duration;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use futures_util::FutureExt;
use futures_util::future::{BoxFuture, Shared};
use reqwest::Client;
use reqwest::header::HeaderMap;
use std::sync::Arc;
use tracing::debug;

use crate::error::ResolveError;
use crate::http::{RetryPolicy, fetch_text};

/// A cloneable handle to one in-flight fetch, shared by all callers
/// waiting on the same URL.
type SharedFetch = Shared<BoxFuture<'static, Result<Arc<String>, ResolveError>>>;

static IN_FLIGHT: LazyLock<DashMap<String, SharedFetch>> = LazyLock::new(DashMap::new);

/// Fetches a URL's body as text, sharing the request with any concurrent
/// caller asking for the same URL.
///
/// Callers for the same URL are assumed to want the same headers; the first
/// caller's request shape wins. The shared result (success or failure) is
/// delivered to every waiter, then the entry is dropped so the next call
/// issues a fresh request.
///
/// # Errors
///
/// Same failure modes as [`fetch_text`].
pub(crate) async fn fetch_text_coalesced(
    client: &Client,
    url: &str,
    timeout: Duration,
    policy: &RetryPolicy,
    headers: Option<&HeaderMap>,
) -> Result<Arc<String>, ResolveError> {
    let shared = match IN_FLIGHT.entry(url.to_string()) {
        Entry::Occupied(entry) => {
            debug!(url, "joining in-flight fetch");
            entry.get().clone()
        }
        Entry::Vacant(entry) => {
            let future = start_fetch(
                client.clone(),
                url.to_string(),
                timeout,
                policy.clone(),
                headers.cloned(),
            );
            entry.insert(future.clone());
            future
        }
    };

    let result = shared.clone().await;

    // Evict only our own settled entry. A concurrent later caller may have
    // already installed a fresh future under the same key; `ptr_eq` keeps
    // that one alive.
    IN_FLIGHT.remove_if(url, |_, value| value.ptr_eq(&shared));

    result
}

fn start_fetch(
    client: Client,
    url: String,
    timeout: Duration,
    policy: RetryPolicy,
    headers: Option<HeaderMap>,
) -> SharedFetch {
    async move {
        fetch_text(&client, &url, timeout, &policy, headers.as_ref(), None)
            .await
            .map(Arc::new)
    }
    .boxed()
    .shared()
}
