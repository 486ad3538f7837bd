//! Repair of damaged viewer URLs before library detection.
//!
//! Links pasted from rendered pages arrive with two recurring defects: a
//! hostname glued in front of a complete URL (copy of a link's visible text
//! plus its href), and trailing punctuation picked up from surrounding
//! prose. Repair is best-effort and total: input that cannot be fixed is
//! returned unchanged so the detector can reject it explicitly.

use std::sync::LazyLock;

use regex::Regex;
use url::Url;

use crate::resolver::util::compile_static_regex;

/// Hostname glued directly onto a complete URL, e.g.
/// `bm-grenoble.frhttps://bm-grenoble.fr/ark:/...`.
static HOST_PREFIX_RE: LazyLock<Regex> =
    LazyLock::new(|| compile_static_regex(r"(?i)^([a-z0-9.-]+)(https?://.+)$"));

/// A TLD boundary running straight into a protocol, the looser cousin of
/// [`HOST_PREFIX_RE`] for inputs with junk before the hostname.
static TLD_PROTOCOL_RE: LazyLock<Regex> =
    LazyLock::new(|| compile_static_regex(r"(?i)\.(fr|com|org|edu|net|it|es|at|uk|de|ch)https?://"));

/// Any `host.tld` run abutting a protocol.
static HOST_RUN_PROTOCOL_RE: LazyLock<Regex> =
    LazyLock::new(|| compile_static_regex(r"(?i)^[^:/\s]+\.[^:/\s]+https?://"));

/// Everything from the first protocol occurrence to the end of the input.
static FIRST_PROTOCOL_RE: LazyLock<Regex> =
    LazyLock::new(|| compile_static_regex(r"(?i)https?://.+$"));

/// Repairs a user-pasted URL.
///
/// Idempotent: `sanitize(sanitize(x)) == sanitize(x)` for all inputs.
/// Never fails; unrepairable input comes back unchanged (modulo trim).
#[must_use]
pub fn sanitize(raw: &str) -> String {
    let trimmed = raw.trim();
    let repaired = repair_concatenated(trimmed);
    trim_trailing_garbage(&repaired).to_string()
}

/// Strips a duplicated hostname (or other junk) glued in front of the real URL.
fn repair_concatenated(input: &str) -> String {
    if let Some(caps) = HOST_PREFIX_RE.captures(input)
        && let Some(candidate) = caps.get(2).map(|m| m.as_str())
        && Url::parse(candidate).is_ok()
    {
        return candidate.to_string();
    }

    if (TLD_PROTOCOL_RE.is_match(input) || HOST_RUN_PROTOCOL_RE.is_match(input))
        && let Some(found) = FIRST_PROTOCOL_RE.find(input)
    {
        return found.as_str().to_string();
    }

    input.to_string()
}

/// Trims trailing punctuation and unbalanced closing brackets picked up from
/// prose. Real extensions survive because `.` is only stripped when final.
fn trim_trailing_garbage(url: &str) -> &str {
    let mut current = url;
    loop {
        let Some(last) = current.chars().last() else {
            break;
        };
        let stripped = match last {
            '.' | ',' | ';' | ':' | '!' | '?' => &current[..current.len() - 1],
            ')' if count_char(current, '(') < count_char(current, ')') => {
                &current[..current.len() - 1]
            }
            ']' if count_char(current, '[') < count_char(current, ']') => {
                &current[..current.len() - 1]
            }
            _ => break,
        };
        current = stripped;
    }
    current
}

fn count_char(s: &str, needle: char) -> usize {
    s.chars().filter(|&c| c == needle).count()
}
