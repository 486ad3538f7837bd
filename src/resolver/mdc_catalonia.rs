//! MDC Catalonia resolver for the ContentDM deployment at `mdc.csuc.cat`.
//!
//! Pages come from the `__INITIAL_STATE__` blob like Florence's, but the
//! image URLs stay at `/full/full/`: MDC stores roughly 1MP originals and
//! upscales anything larger, so requesting a fixed width only blurs the
//! output.

use async_trait::async_trait;
use reqwest::Client;
use serde_json::Value;
use tracing::debug;

use crate::error::ResolveError;
use crate::http::{browser_headers, build_http_client, fetch_text};
use crate::library::LibraryId;
use crate::manifest::{Manifest, PageImage};

use super::util::{json_id_string, parse_embedded_state};
use super::{LibraryResolver, ResolveContext};

const DEFAULT_IIIF_BASE: &str = "https://mdc.csuc.cat";

/// Resolver for the Memòria Digital de Catalunya.
pub struct MdcCataloniaResolver {
    client: Client,
    iiif_base: String,
}

impl MdcCataloniaResolver {
    /// Creates a resolver against the production MDC host.
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
            client: build_http_client("mdc-catalonia")?,
            iiif_base: iiif_base.into(),
        })
    }

    fn image_url(&self, alias: &str, record_id: &str) -> String {
        format!(
            "{}/iiif/2/{alias}:{record_id}/full/full/0/default.jpg",
            self.iiif_base.trim_end_matches('/')
        )
    }
}

impl std::fmt::Debug for MdcCataloniaResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MdcCataloniaResolver")
            .field("iiif_base", &self.iiif_base)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl LibraryResolver for MdcCataloniaResolver {
    fn name(&self) -> &str {
        "mdc-catalonia"
    }

    fn handles(&self, library: LibraryId) -> bool {
        library == LibraryId::MdcCatalonia
    }

    #[tracing::instrument(skip(self, ctx), fields(resolver = "mdc-catalonia", url = %url))]
    async fn resolve(
        &self,
        url: &str,
        _library: LibraryId,
        ctx: &ResolveContext,
    ) -> Result<Manifest, ResolveError> {
        ctx.check_cancelled(url)?;

        let policy = LibraryId::MdcCatalonia.retry_policy();
        let timeout = LibraryId::MdcCatalonia.timeout_for(url);
        let html = fetch_text(
            &self.client,
            url,
            timeout,
            &policy,
            Some(&browser_headers(None)),
            Some(&ctx.cancel),
        )
        .await?;

        let state = parse_embedded_state(&html).ok_or_else(|| {
            ResolveError::bad_response(url, "viewer page carries no __INITIAL_STATE__ blob")
        })?;
        let item = state
            .get("item")
            .and_then(|i| i.get("item"))
            .ok_or_else(|| ResolveError::bad_response(url, "page state lists no item"))?;
        let alias = item
            .get("collectionAlias")
            .and_then(Value::as_str)
            .ok_or_else(|| ResolveError::bad_response(url, "page state lists no collection alias"))?;

        let children = item
            .get("parent")
            .and_then(|p| p.get("children"))
            .and_then(Value::as_array)
            .filter(|children| !children.is_empty());

        let images: Vec<PageImage> = if let Some(children) = children {
            debug!(pages = children.len(), "compound object");
            children
                .iter()
                .enumerate()
                .filter_map(|(index, child)| {
                    let id = child.get("id").and_then(json_id_string)?;
                    let label = child
                        .get("title")
                        .and_then(Value::as_str)
                        .filter(|t| !t.is_empty())
                        .map_or_else(|| format!("Page {}", index + 1), str::to_string);
                    Some(PageImage::new(self.image_url(alias, &id), label))
                })
                .collect()
        } else {
            let id = item
                .get("id")
                .and_then(json_id_string)
                .ok_or_else(|| ResolveError::bad_response(url, "page state lists no record id"))?;
            let label = item
                .get("title")
                .and_then(Value::as_str)
                .filter(|t| !t.is_empty())
                .map_or_else(|| "Page 1".to_string(), str::to_string);
            vec![PageImage::new(self.image_url(alias, &id), label)]
        };

        if images.is_empty() {
            return Err(ResolveError::bad_response(
                url,
                "document structure lists no image records",
            ));
        }

        let display_name = item
            .get("parent")
            .and_then(|p| p.get("title"))
            .and_then(Value::as_str)
            .or_else(|| item.get("title").and_then(Value::as_str))
            .filter(|t| !t.is_empty())
            .map_or_else(|| format!("MDC Catalonia {alias}"), str::to_string);

        Ok(Manifest::new(
            display_name,
            LibraryId::MdcCatalonia,
            images,
            url,
        ))
    }
}
