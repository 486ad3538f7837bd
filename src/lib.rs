//! Manuscript Downloader Core Library
//!
//! This library provides the core functionality for the manuscript
//! downloader, which turns pasted digital-library viewer links into
//! normalized manifests of ordered, downloadable page-image URLs.
//!
//! # Architecture
//!
//! The library is organized into the following modules:
//! - [`sanitize`] - Paste-damage repair for user-supplied URLs
//! - [`library`] - Supported-library table and hostname detection
//! - [`resolver`] - Library resolution pipeline with extensible resolver system
//! - [`manifest`] - Normalized resolution output consumed by downstream stages
//! - [`http`] - Shared HTTP plumbing: retries, backoff, cancellation, in-flight dedup
//! - [`tiles`] - Deep Zoom tile pyramid assembly for tile-only libraries
//! - [`error`] - Error taxonomy for the whole pipeline

// Clippy lints - strict for library code
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod error;
pub mod http;
pub(crate) mod iiif;
pub mod library;
pub mod manifest;
pub mod resolver;
pub mod sanitize;
#[cfg(test)]
pub mod test_support;
pub mod tiles;
pub(crate) mod user_agent;

// Re-export commonly used types
pub use error::ResolveError;
pub use http::{
    CancelFlag, DEFAULT_MAX_ATTEMPTS, FailureType, RetryDecision, RetryPolicy, classify_status,
    classify_transport_error, configure_http_timeouts, parse_retry_after,
};
pub use library::{LibraryId, detect};
pub use manifest::{Manifest, PageImage, ResolveWarning, TileSource};
pub use resolver::{
    BdlResolver, BneResolver, BordeauxResolver, BvpbResolver, CatalogScheme, DEFAULT_PAGE_CEILING,
    DijonResolver, FlorenceResolver, GallicaResolver, InternetCulturaleResolver, IrhtResolver,
    LaonResolver, LibraryResolver, MdcCataloniaResolver, MorganResolver, ResolveContext,
    ResolveOptions, ResolverRegistry, RomeResolver, StandardIiifResolver, VeronaResolver,
    ViennaManuscriptaResolver, WolfenbuettelResolver, build_default_resolver_registry,
    resolve_manifest, resolve_manifest_cancellable, resolve_many,
};
pub use sanitize::sanitize;
pub use tiles::{
    DziDescriptor, MAX_STITCHED_DIMENSION, TileGrid, TilePlacement, assemble_page,
    fetch_descriptor, stitch,
};
