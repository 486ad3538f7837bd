//! Error types for manifest resolution.
//!
//! This module defines structured errors for the whole resolution pipeline,
//! following the What/Why/Fix pattern used across the project. Errors are
//! `Clone` because in-flight request coalescing broadcasts one outcome to
//! every waiter.

use thiserror::Error;

/// Errors that can occur while resolving a viewer URL into a manifest.
#[derive(Debug, Clone, Error)]
pub enum ResolveError {
    /// No supported library matches the input URL
    #[error(
        "no supported library recognizes '{input}'\n  Suggestion: Check the supported-library list; unrecognized platforms need a new resolver"
    )]
    UnsupportedLibrary {
        /// The input that no library pattern matched
        input: String,
    },

    /// The input could not be repaired into a usable URL
    #[error("could not interpret '{input}' as a URL: {reason}\n  Suggestion: {suggestion}")]
    MalformedUrl {
        /// The raw input after sanitization
        input: String,
        /// Why the input is unusable
        reason: String,
        /// How to fix the input
        suggestion: String,
    },

    /// A manifest, descriptor, or viewer page could not be fetched
    #[error(
        "could not reach '{url}' after {attempts} attempt(s): {reason}\n  Suggestion: {suggestion}"
    )]
    ManifestUnreachable {
        /// The URL that failed
        url: String,
        /// How many attempts were made before giving up
        attempts: u32,
        /// Why the fetch failed
        reason: String,
        /// How to proceed
        suggestion: String,
    },

    /// Every candidate resolution failed the existence probe
    #[error(
        "no servable resolution found for '{url}' ({tried_count} size(s) probed)\n  Suggestion: The server may be enforcing a temporary size restriction; retry later"
    )]
    ResolutionExhausted {
        /// The image URL template that was probed
        url: String,
        /// Number of ladder candidates probed
        tried_count: usize,
    },

    /// One or more tiles of a Deep Zoom page failed to download or decode
    #[error(
        "{failed} of {total} tiles failed for '{url}'\n  Suggestion: Retry the page; partial composites are never produced"
    )]
    PartialTileFailure {
        /// The page or descriptor URL being assembled
        url: String,
        /// Number of tiles that failed
        failed: usize,
        /// Total tiles in the grid
        total: usize,
    },

    /// A Deep Zoom descriptor failed validation
    #[error("invalid tile descriptor at '{url}': {reason}\n  Suggestion: {suggestion}")]
    InvalidDescriptor {
        /// The descriptor URL
        url: String,
        /// What failed validation
        reason: String,
        /// How to proceed
        suggestion: String,
    },

    /// The caller cancelled resolution before it completed
    #[error("resolution of '{input}' was cancelled before completion")]
    Cancelled {
        /// The input whose resolution was abandoned
        input: String,
    },
}

impl ResolveError {
    /// Creates an `UnsupportedLibrary` error.
    #[must_use]
    pub fn unsupported(input: &str) -> Self {
        Self::UnsupportedLibrary {
            input: input.to_string(),
        }
    }

    /// Creates a `MalformedUrl` error with the standard suggestion.
    #[must_use]
    pub fn malformed(input: &str, reason: &str) -> Self {
        Self::MalformedUrl {
            input: input.to_string(),
            reason: reason.to_string(),
            suggestion: "Paste the viewer link exactly as shown in the browser address bar"
                .to_string(),
        }
    }

    /// Creates a `ManifestUnreachable` error with the standard suggestion.
    #[must_use]
    pub fn unreachable(url: &str, attempts: u32, reason: &str) -> Self {
        Self::ManifestUnreachable {
            url: url.to_string(),
            attempts,
            reason: reason.to_string(),
            suggestion: "Check connectivity and retry; the server may be temporarily unavailable"
                .to_string(),
        }
    }

    /// Creates a `ManifestUnreachable` error for unparseable or unexpected
    /// response bodies (non-retryable content failures).
    #[must_use]
    pub fn bad_response(url: &str, reason: &str) -> Self {
        Self::ManifestUnreachable {
            url: url.to_string(),
            attempts: 1,
            reason: reason.to_string(),
            suggestion: "The server answered with an unexpected document; verify the link opens in a browser"
                .to_string(),
        }
    }

    /// Creates a `ResolutionExhausted` error.
    #[must_use]
    pub fn exhausted(url: &str, tried_count: usize) -> Self {
        Self::ResolutionExhausted {
            url: url.to_string(),
            tried_count,
        }
    }

    /// Creates a `PartialTileFailure` error.
    #[must_use]
    pub fn partial_tiles(url: &str, failed: usize, total: usize) -> Self {
        Self::PartialTileFailure {
            url: url.to_string(),
            failed,
            total,
        }
    }

    /// Creates an `InvalidDescriptor` error with the standard suggestion.
    #[must_use]
    pub fn invalid_descriptor(url: &str, reason: &str) -> Self {
        Self::InvalidDescriptor {
            url: url.to_string(),
            reason: reason.to_string(),
            suggestion: "The tile server published a descriptor this tool cannot honor; report the manuscript link"
                .to_string(),
        }
    }

    /// Creates a `Cancelled` error.
    #[must_use]
    pub fn cancelled(input: &str) -> Self {
        Self::Cancelled {
            input: input.to_string(),
        }
    }

    /// True when the error is the caller-initiated cancellation outcome.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled { .. })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_unsupported_message() {
        let err = ResolveError::unsupported("https://example.com/");
        let msg = err.to_string();
        assert!(msg.contains("example.com"), "should contain input");
        assert!(msg.contains("no supported library"), "should state what");
        assert!(msg.contains("Suggestion"), "should have suggestion");
    }

    #[test]
    fn test_malformed_message() {
        let err = ResolveError::malformed("not a url", "no scheme present");
        let msg = err.to_string();
        assert!(msg.contains("not a url"), "should contain input");
        assert!(msg.contains("no scheme present"), "should contain reason");
        assert!(msg.contains("address bar"), "suggestion should guide input");
    }

    #[test]
    fn test_unreachable_message_carries_attempts() {
        let err = ResolveError::unreachable("https://host/manifest.json", 3, "HTTP 503");
        let msg = err.to_string();
        assert!(msg.contains("3 attempt(s)"), "should contain attempt count");
        assert!(msg.contains("HTTP 503"), "should contain reason");
    }

    #[test]
    fn test_exhausted_message() {
        let err = ResolveError::exhausted("https://host/iiif/id/full/6000,/0/default.jpg", 5);
        let msg = err.to_string();
        assert!(msg.contains("5 size(s)"), "should contain ladder length");
        assert!(msg.contains("no servable resolution"), "should state what");
    }

    #[test]
    fn test_partial_tiles_message() {
        let err = ResolveError::partial_tiles("https://host/page_0001.dzi", 2, 48);
        let msg = err.to_string();
        assert!(msg.contains("2 of 48 tiles"), "should contain counts");
        assert!(
            msg.contains("partial composites are never produced"),
            "should state the abort contract"
        );
    }

    #[test]
    fn test_cancelled_detection() {
        let err = ResolveError::cancelled("https://host/viewer");
        assert!(err.is_cancelled());
        assert!(!ResolveError::unsupported("x").is_cancelled());
    }

    #[test]
    fn test_errors_are_cloneable_for_coalescing() {
        let err = ResolveError::invalid_descriptor("https://host/page.dzi", "missing Size element");
        let cloned = err.clone();
        assert_eq!(err.to_string(), cloned.to_string());
    }
}
