//! Shared utilities for resolver modules: static regex compilation, URL
//! absolutization, and capture/dedupe helpers used by the HTML scrapers.

use std::collections::HashSet;
use std::sync::LazyLock;

use regex::Regex;
use serde_json::Value;
use url::Url;

/// Compiles a regex at static init; panics on invalid pattern.
pub fn compile_static_regex(pattern: &str) -> Regex {
    Regex::new(pattern).unwrap_or_else(|e| panic!("invalid static regex '{pattern}': {e}"))
}

/// Resolves a possibly relative URL string against a base URL.
///
/// Returns the value as-is if it already starts with `http://` or `https://`;
/// normalizes `//...` to `https:...`; otherwise joins with `base_url`.
#[must_use]
pub fn absolutize_url(value: &str, base_url: &Url) -> Option<String> {
    if value.starts_with("http://") || value.starts_with("https://") {
        return Some(value.to_string());
    }
    if value.starts_with("//") {
        return Some(format!("https:{value}"));
    }
    base_url.join(value).ok().map(|url| url.to_string())
}

/// Returns the first capture of `regex` in `text`, trimmed.
#[must_use]
pub fn extract_first_capture(text: &str, regex: &Regex) -> Option<String> {
    regex
        .captures(text)
        .and_then(|caps| caps.get(1).map(|m| m.as_str().trim().to_string()))
}

/// Returns every first capture of `regex` in `text`, in match order.
#[must_use]
pub fn extract_all_captures(text: &str, regex: &Regex) -> Vec<String> {
    regex
        .captures_iter(text)
        .filter_map(|caps| caps.get(1).map(|m| m.as_str().trim().to_string()))
        .collect()
}

/// Drops duplicate entries while keeping first-occurrence order.
///
/// Viewer HTML repeats image references (thumbnail strip plus main pane);
/// page order must follow the first appearance of each.
#[must_use]
pub fn dedupe_preserving_order(values: Vec<String>) -> Vec<String> {
    let mut seen = HashSet::new();
    values
        .into_iter()
        .filter(|value| seen.insert(value.clone()))
        .collect()
}

static STATE_PARSE_RE: LazyLock<Regex> = LazyLock::new(|| {
    compile_static_regex(r#"window\.__INITIAL_STATE__\s*=\s*JSON\.parse\("(.+?)"\);"#)
});
static STATE_DIRECT_RE: LazyLock<Regex> =
    LazyLock::new(|| compile_static_regex(r"window\.__INITIAL_STATE__\s*=\s*(\{.+?\});"));

/// Extracts the `__INITIAL_STATE__` blob ContentDM viewers embed in their
/// pages. The common form wraps the JSON in a `JSON.parse("...")` string
/// literal whose backslash escaping must be undone first; some deployments
/// assign the object literal directly.
pub(crate) fn parse_embedded_state(html: &str) -> Option<Value> {
    if let Some(escaped) = extract_first_capture(html, &STATE_PARSE_RE) {
        let unescaped = unescape_js_string(&escaped);
        if let Ok(value) = serde_json::from_str(&unescaped) {
            return Some(value);
        }
    }
    extract_first_capture(html, &STATE_DIRECT_RE)
        .and_then(|raw| serde_json::from_str(&raw).ok())
}

/// Undoes the backslash escaping of a double-quoted JS string literal.
/// Escaped backslashes are parked on a NUL placeholder so that `\\"` is not
/// misread as an escaped quote.
fn unescape_js_string(escaped: &str) -> String {
    escaped
        .replace("\\\\", "\0")
        .replace("\\\"", "\"")
        .replace('\0', "\\")
}

/// ContentDM state blobs store record ids as numbers or strings depending
/// on the deployment; both map to the id segment of an image URL.
pub(crate) fn json_id_string(value: &Value) -> Option<String> {
    match value {
        Value::Number(n) => Some(n.to_string()),
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        _ => None,
    }
}
