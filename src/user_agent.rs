//! Shared User-Agent strings for resolver and tile HTTP clients.
//!
//! Single source for project URL and UA format so all outbound traffic
//! stays consistent and easy to update (good citizenship; RFC 9308).

/// Project URL for User-Agent identification (good citizenship; RFC 9308).
const PROJECT_UA_URL: &str = "https://github.com/manuscript-tools/manuscript-downloader";

/// Browser UA sent to viewers that reject non-browser clients outright
/// (ContentDM state blobs, magparser sessions, BNE page probes).
pub(crate) const BROWSER_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) \
     AppleWebKit/537.36 (KHTML, like Gecko) Chrome/91.0.4472.124 Safari/537.36";

/// Default User-Agent for resolver requests (single shared format; no per-library name in header).
#[must_use]
pub(crate) fn default_resolver_user_agent() -> String {
    let version = env!("CARGO_PKG_VERSION");
    format!("manuscript-downloader/{version} (manuscript-archival-tool; +{PROJECT_UA_URL})")
}

#[cfg(test)]
mod tests {
    use super::*;

    /// The UA must carry the project URL and crate version (shared format).
    /// The test uses this module's private PROJECT_UA_URL intentionally so the
    /// assertion stays in sync with the single source of truth.
    #[test]
    fn test_shared_format_consistency() {
        let resolver_ua = default_resolver_user_agent();
        assert!(
            resolver_ua.contains(PROJECT_UA_URL),
            "resolver UA must contain project URL"
        );
        assert_eq!(
            env!("CARGO_PKG_VERSION"),
            resolver_ua
                .strip_prefix("manuscript-downloader/")
                .and_then(|s| s.split(' ').next())
                .expect("resolver UA has version"),
            "resolver UA must contain crate version"
        );
    }

    #[test]
    fn test_ua_format_keywords() {
        let resolver_ua = default_resolver_user_agent();
        assert!(
            resolver_ua.contains("manuscript-archival-tool"),
            "resolver UA must identify as manuscript-archival-tool: {resolver_ua}"
        );
    }

    #[test]
    fn test_browser_ua_is_a_plain_browser_string() {
        assert!(BROWSER_USER_AGENT.starts_with("Mozilla/5.0"));
        assert!(
            !BROWSER_USER_AGENT.contains("manuscript"),
            "browser profile must not leak the tool name"
        );
    }
}
