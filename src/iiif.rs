//! Shared IIIF Presentation manifest walking.
//!
//! Handles both Presentation API shapes in one pass: v2 documents nest
//! canvases under `sequences[0].canvases` with the image annotation at
//! `images[0].resource`, while v3 lists canvases under `items` with the
//! annotation body at `items[0].items[0].body`. Labels appear as plain
//! strings, `{"@value": ...}` wrappers, arrays, or v3 language maps; all
//! collapse through [`localized_string`].

use std::sync::LazyLock;

use regex::Regex;
use serde_json::Value;

use crate::manifest::PageImage;
use crate::resolver::util::compile_static_regex;

/// Label languages tried before falling back to whatever the map holds.
const PREFERRED_LANGUAGES: [&str; 3] = ["en", "none", "@none"];

static SIZE_SEGMENT_RE: LazyLock<Regex> =
    LazyLock::new(|| compile_static_regex(r"/full/[^/]+/"));

/// How a page image URL is formed from a canvas's image annotation.
///
/// Libraries differ in whether their manifests carry a usable direct URL,
/// an image service base, or a bare image identifier, and in the largest
/// size their image server honors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ImageUrlStyle {
    /// Build from the canvas's image service base:
    /// `{service}/full/{size}/0/default.jpg`. Falls back to the direct
    /// resource URL (upgraded to `/full/max/`) when no service is present.
    Service {
        /// IIIF size segment, e.g. `max`, `2000,`.
        size: &'static str,
    },

    /// Use the resource URL, upgrading its `/full/<size>/` segment.
    DirectUpgraded {
        /// Replacement size segment.
        size: &'static str,
    },

    /// Use the resource URL exactly as the manifest states it.
    Direct,

    /// Treat the resource URL as an image identifier and request `size`
    /// from it, upgrading in place when it already carries a size segment.
    ResourceSized {
        /// IIIF size segment to request.
        size: &'static str,
    },
}

/// Extracts ordered page images from a IIIF Presentation manifest.
///
/// Canvas order in the document is page order. Canvases without a usable
/// image annotation are skipped; unlabeled canvases get `Page {n}` from
/// their document position.
pub(crate) fn extract_pages(manifest: &Value, style: ImageUrlStyle) -> Vec<PageImage> {
    canvases_of(manifest)
        .iter()
        .enumerate()
        .filter_map(|(index, canvas)| {
            let url = image_url_for_canvas(canvas, style)?;
            let label = localized_string(&canvas["label"])
                .unwrap_or_else(|| format!("Page {}", index + 1));
            Some(PageImage::new(url, label))
        })
        .collect()
}

/// The manifest's own label, unless it is a generic placeholder.
///
/// Returns `None` for empty, "untitled", or "index" labels so callers can
/// substitute an identifier-derived display name instead.
#[must_use]
pub(crate) fn manifest_label(manifest: &Value) -> Option<String> {
    let label = localized_string(&manifest["label"])?;
    let lowered = label.to_lowercase();
    if lowered == "untitled" || lowered == "index" {
        None
    } else {
        Some(label)
    }
}

/// Collapses any IIIF label shape into one display string.
///
/// Accepts plain strings, `{"@value": ...}` objects, arrays (first usable
/// entry wins), and v3 language maps tried in [`PREFERRED_LANGUAGES`] order
/// before falling back to the map's first entry.
#[must_use]
pub(crate) fn localized_string(value: &Value) -> Option<String> {
    match value {
        Value::String(text) => non_empty(text),
        Value::Array(items) => items.iter().find_map(localized_string),
        Value::Object(map) => {
            if let Some(wrapped) = map.get("@value") {
                return localized_string(wrapped);
            }
            for language in PREFERRED_LANGUAGES {
                if let Some(found) = map.get(language).and_then(localized_string) {
                    return Some(found);
                }
            }
            map.values().find_map(localized_string)
        }
        _ => None,
    }
}

fn non_empty(text: &str) -> Option<String> {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

fn canvases_of(manifest: &Value) -> &[Value] {
    let sequence = &manifest["sequences"][0];
    let container = if sequence.is_null() { manifest } else { sequence };
    container["canvases"]
        .as_array()
        .or_else(|| container["items"].as_array())
        .map(Vec::as_slice)
        .unwrap_or(&[])
}

fn image_url_for_canvas(canvas: &Value, style: ImageUrlStyle) -> Option<String> {
    let resource = image_resource(canvas)?;
    let direct = string_field(resource, &["@id", "id"]);
    match style {
        ImageUrlStyle::Service { size } => match service_id(resource) {
            Some(service) => Some(sized_request(&service, size)),
            None => direct.map(|url| upgrade_size_segment(&url, "max")),
        },
        ImageUrlStyle::DirectUpgraded { size } => {
            direct.map(|url| upgrade_size_segment(&url, size))
        }
        ImageUrlStyle::Direct => direct,
        ImageUrlStyle::ResourceSized { size } => direct.map(|url| {
            if url.contains("/full/") {
                upgrade_size_segment(&url, size)
            } else {
                sized_request(&url, size)
            }
        }),
    }
}

fn image_resource(canvas: &Value) -> Option<&Value> {
    let v2 = &canvas["images"][0]["resource"];
    if !v2.is_null() {
        return Some(v2);
    }
    let v3 = &canvas["items"][0]["items"][0]["body"];
    if v3.is_null() { None } else { Some(v3) }
}

fn service_id(resource: &Value) -> Option<String> {
    let service = &resource["service"];
    let service = if service.is_array() { &service[0] } else { service };
    string_field(service, &["@id", "id"])
}

fn string_field(value: &Value, keys: &[&str]) -> Option<String> {
    keys.iter()
        .find_map(|key| value[*key].as_str())
        .and_then(non_empty)
}

fn sized_request(base: &str, size: &str) -> String {
    format!("{}/full/{size}/0/default.jpg", base.trim_end_matches('/'))
}

fn upgrade_size_segment(url: &str, size: &str) -> String {
    let replacement = format!("/full/{size}/");
    SIZE_SEGMENT_RE.replace(url, replacement.as_str()).into_owned()
}
