//! Florence (BML Plutei) resolver for the ContentDM deployment at
//! `cdm21059.contentdm.oclc.org`.
//!
//! The viewer embeds a `__INITIAL_STATE__` blob listing every page of the
//! compound object. Binding parts and calibration charts are excluded, and
//! the served width is chosen by probing the size ladder, since the IIIF
//! endpoint rejects oversized requests for some manuscripts.

use std::sync::LazyLock;

use async_trait::async_trait;
use regex::Regex;
use reqwest::Client;
use serde_json::Value;
use tracing::debug;

use crate::error::ResolveError;
use crate::http::{browser_headers, build_http_client, fetch_text};
use crate::library::LibraryId;
use crate::manifest::{Manifest, PageImage};

use super::sizes::pick_best_size;
use super::util::{compile_static_regex, json_id_string, parse_embedded_state};
use super::{LibraryResolver, ResolveContext};

const DEFAULT_IIIF_BASE: &str = "https://cdm21059.contentdm.oclc.org";

/// Children with these title fragments are binding parts or calibration
/// material, not manuscript pages.
const EXCLUDED_SECTIONS: [&str; 6] = [
    "color chart",
    "dorso",
    "piatto",
    "controguardia",
    "guardia anteriore",
    "guardia posteriore",
];

static COLLECTION_PATH_RE: LazyLock<Regex> =
    LazyLock::new(|| compile_static_regex(r"/digital/collection/([^/]+)/id/(\d+)"));

/// Resolver for the Biblioteca Medicea Laurenziana digital collection.
pub struct FlorenceResolver {
    client: Client,
    iiif_base: String,
}

impl FlorenceResolver {
    /// Creates a resolver against the production ContentDM host.
    ///
    /// # Errors
    ///
    /// Returns [`ResolveError`] when HTTP client construction fails.
    pub fn new() -> Result<Self, ResolveError> {
        Self::with_iiif_base(DEFAULT_IIIF_BASE)
    }

    /// Creates a resolver issuing IIIF image requests against `iiif_base`.
    ///
    /// # Errors
    ///
    /// Returns [`ResolveError`] when HTTP client construction fails.
    pub fn with_iiif_base(iiif_base: impl Into<String>) -> Result<Self, ResolveError> {
        Ok(Self {
            client: build_http_client("florence")?,
            iiif_base: iiif_base.into(),
        })
    }

    fn image_url(&self, collection: &str, page_id: &str, width: u32) -> String {
        format!(
            "{}/iiif/2/{collection}:{page_id}/full/{width},/0/default.jpg",
            self.iiif_base.trim_end_matches('/')
        )
    }
}

impl std::fmt::Debug for FlorenceResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FlorenceResolver")
            .field("iiif_base", &self.iiif_base)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl LibraryResolver for FlorenceResolver {
    fn name(&self) -> &str {
        "florence"
    }

    fn handles(&self, library: LibraryId) -> bool {
        library == LibraryId::Florence
    }

    #[tracing::instrument(skip(self, ctx), fields(resolver = "florence", url = %url))]
    async fn resolve(
        &self,
        url: &str,
        _library: LibraryId,
        ctx: &ResolveContext,
    ) -> Result<Manifest, ResolveError> {
        ctx.check_cancelled(url)?;

        let (collection, item_id) = extract_collection_and_id(url).ok_or_else(|| {
            ResolveError::malformed(url, "expected a /digital/collection/{name}/id/{number} path")
        })?;

        let policy = LibraryId::Florence.retry_policy();
        let timeout = LibraryId::Florence.timeout_for(url);
        let headers = browser_headers(Some("https://cdm21059.contentdm.oclc.org/"));
        let html = fetch_text(
            &self.client,
            url,
            timeout,
            &policy,
            Some(&headers),
            Some(&ctx.cancel),
        )
        .await?;

        let state = parse_embedded_state(&html).ok_or_else(|| {
            ResolveError::bad_response(url, "viewer page carries no __INITIAL_STATE__ blob")
        })?;
        let (pages, title) = pages_from_state(&state, &item_id)
            .ok_or_else(|| ResolveError::bad_response(url, "page state lists no item"))?;
        if pages.is_empty() {
            return Err(ResolveError::bad_response(
                url,
                "no pages remain after excluding binding and chart images",
            ));
        }
        debug!(pages = pages.len(), "extracted compound object pages");

        // One probe per ladder step on the first page decides the width for
        // the whole manuscript.
        let first_id = pages[0].0.clone();
        let make_url = |width: u32| self.image_url(&collection, &first_id, width);
        let width = pick_best_size(&self.client, &make_url, timeout, ctx).await?;
        debug!(width, "largest servable width selected");

        let images = pages
            .into_iter()
            .map(|(id, label)| PageImage::new(self.image_url(&collection, &id, width), label))
            .collect();
        let display_name = title.unwrap_or_else(|| "Florence Manuscript".to_string());

        Ok(Manifest::new(
            display_name,
            LibraryId::Florence,
            images,
            url,
        ))
    }
}

fn extract_collection_and_id(url: &str) -> Option<(String, String)> {
    let caps = COLLECTION_PATH_RE.captures(url)?;
    let collection = caps.get(1).map(|m| m.as_str().to_string())?;
    let id = caps.get(2).map(|m| m.as_str().to_string())?;
    Some((collection, id))
}

/// Returns `(page id, label)` pairs for the real manuscript pages in a
/// children array, dropping binding parts and charts.
fn page_entries(children: &[Value]) -> Vec<(String, String)> {
    children
        .iter()
        .filter_map(|child| {
            let id = child.get("id").and_then(json_id_string)?;
            let title = child
                .get("title")
                .and_then(Value::as_str)
                .unwrap_or_default();
            let lowered = title.to_lowercase();
            if EXCLUDED_SECTIONS
                .iter()
                .any(|section| lowered.contains(section))
            {
                return None;
            }
            let label = if title.is_empty() {
                format!("Page {id}")
            } else {
                title.to_string()
            };
            Some((id, label))
        })
        .collect()
}

/// Picks the manuscript title from ContentDM metadata fields: shelfmark
/// (`subjec`) optionally combined with a shortened title, then the
/// identifier, then the title alone.
fn title_from_fields(fields: &Value) -> Option<String> {
    let find = |keys: &[&str]| {
        fields.as_array().and_then(|entries| {
            entries.iter().find_map(|field| {
                let key = field.get("key").and_then(Value::as_str)?;
                if !keys.contains(&key) {
                    return None;
                }
                field
                    .get("value")
                    .and_then(Value::as_str)
                    .filter(|v| !v.is_empty())
                    .map(str::to_string)
            })
        })
    };

    if let Some(shelfmark) = find(&["subjec"]) {
        if let Some(title) = find(&["title", "titlea"]) {
            let short: String = title
                .split('.')
                .next()
                .unwrap_or_default()
                .chars()
                .take(50)
                .collect();
            return Some(format!("{shelfmark} - {short}"));
        }
        return Some(shelfmark);
    }
    if let Some(identifier) = find(&["identi"]) {
        return Some(identifier);
    }
    find(&["title", "titlea"]).map(|title| title.chars().take(80).collect())
}

/// Walks the embedded state down to the page list. A child page points at
/// its parent compound object; a parent lists its children directly; a
/// manuscript with neither is a single page.
fn pages_from_state(state: &Value, item_id: &str) -> Option<(Vec<(String, String)>, Option<String>)> {
    let item = state.get("item")?.get("item")?;

    let parent_id = item.get("parentId").and_then(Value::as_i64);
    if let Some(parent_id) = parent_id
        && parent_id != -1
        && let Some(children) = item
            .get("parent")
            .and_then(|p| p.get("children"))
            .and_then(Value::as_array)
    {
        let title = item.get("parent").and_then(|p| p.get("fields")).and_then(title_from_fields);
        return Some((page_entries(children), title));
    }

    if let Some(children) = state
        .get("item")
        .and_then(|i| i.get("children"))
        .and_then(Value::as_array)
        && !children.is_empty()
    {
        let title = item.get("fields").and_then(title_from_fields);
        return Some((page_entries(children), title));
    }

    let title = item.get("title").and_then(Value::as_str);
    let label = title.unwrap_or("Page 1").to_string();
    Some((
        vec![(item_id.to_string(), label)],
        title.map(str::to_string),
    ))
}
