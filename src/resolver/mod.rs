//! Library resolution pipeline for transforming viewer links into page
//! manifests.
//!
//! This module provides an extensible resolver system that turns a pasted
//! digital-library viewer URL into a normalized [`Manifest`](crate::manifest::Manifest)
//! of ordered page-image URLs, through a registry dispatching on the
//! detected library.
//!
//! # Architecture
//!
//! - [`LibraryResolver`] - Async trait that individual resolvers implement
//! - [`ResolverRegistry`] - Collection of resolvers with the dispatch loop
//! - [`StandardIiifResolver`] - Table-driven resolver for libraries whose
//!   IIIF manifest URL derives directly from the viewer URL
//! - Site-specific resolvers for catalog APIs (Florence, MDC Catalonia,
//!   BDL, Dijon, Laon), paginated/scraping discovery (Gallica, Rome,
//!   Internet Culturale, BVPB, Morgan, Vienna, BNE, Wolfenbüttel, IRHT,
//!   Verona), and DZI tile pyramids (Bordeaux)
//!
//! # Example
//!
//! ```no_run
//! use manuscript_core::resolver::{ResolveContext, build_default_resolver_registry};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let registry = build_default_resolver_registry();
//! let ctx = ResolveContext::default();
//! let manifest = registry
//!     .resolve("https://digi.vatlib.it/view/MSS_Vat.lat.3773", &ctx)
//!     .await?;
//! println!("{}: {} pages", manifest.display_name, manifest.page_count());
//! # Ok(())
//! # }
//! ```

mod bdl;
mod bne;
mod bordeaux;
mod bvpb;
mod dijon;
mod florence;
mod gallica;
mod internet_culturale;
mod irht;
mod laon;
mod mdc_catalonia;
mod morgan;
pub(crate) mod probe;
mod registry;
mod rome;
pub(crate) mod sizes;
mod standard;
pub(crate) mod util;
mod verona;
mod vienna;
mod wolfenbuettel;

pub use bdl::BdlResolver;
pub use bne::BneResolver;
pub use bordeaux::BordeauxResolver;
pub use bvpb::BvpbResolver;
pub use dijon::DijonResolver;
pub use florence::FlorenceResolver;
pub use gallica::GallicaResolver;
pub use internet_culturale::InternetCulturaleResolver;
pub use irht::IrhtResolver;
pub use laon::LaonResolver;
pub use mdc_catalonia::MdcCataloniaResolver;
pub use morgan::MorganResolver;
pub use registry::{
    ResolverRegistry, resolve_manifest, resolve_manifest_cancellable, resolve_many,
};
pub use rome::RomeResolver;
pub use standard::StandardIiifResolver;
pub use verona::VeronaResolver;
pub use vienna::ViennaManuscriptaResolver;
pub use wolfenbuettel::WolfenbuettelResolver;

use async_trait::async_trait;
use tracing::warn;

use crate::error::ResolveError;
use crate::http::CancelFlag;
use crate::library::LibraryId;
use crate::manifest::Manifest;

/// Default safety ceiling for probe-based page discovery.
///
/// Legitimate 400+ page manuscripts exist, so the ceiling sits well above
/// them; it guards against unbounded probing, not real page counts.
pub const DEFAULT_PAGE_CEILING: u32 = 1000;

const MIN_FETCH_CONCURRENCY: usize = 4;
const MAX_FETCH_CONCURRENCY: usize = 8;
const DEFAULT_FETCH_CONCURRENCY: usize = 4;

/// Builds the default resolver registry covering every supported library.
///
/// A resolver whose construction fails (HTTP client initialization) is
/// skipped with a warning; the registry continues with the rest.
#[must_use]
pub fn build_default_resolver_registry() -> ResolverRegistry {
    let mut registry = ResolverRegistry::new();

    register_or_warn(&mut registry, "standard-iiif", StandardIiifResolver::new());
    register_or_warn(&mut registry, "verona", VeronaResolver::new());
    register_or_warn(&mut registry, "florence", FlorenceResolver::new());
    register_or_warn(&mut registry, "mdc-catalonia", MdcCataloniaResolver::new());
    register_or_warn(&mut registry, "bdl", BdlResolver::new());
    register_or_warn(&mut registry, "dijon", DijonResolver::new());
    register_or_warn(&mut registry, "laon", LaonResolver::new());
    register_or_warn(&mut registry, "gallica", GallicaResolver::new());
    register_or_warn(&mut registry, "rome", RomeResolver::new());
    register_or_warn(
        &mut registry,
        "internet-culturale",
        InternetCulturaleResolver::new(),
    );
    register_or_warn(&mut registry, "bvpb", BvpbResolver::new());
    register_or_warn(&mut registry, "morgan", MorganResolver::new());
    register_or_warn(&mut registry, "vienna", ViennaManuscriptaResolver::new());
    register_or_warn(&mut registry, "bne", BneResolver::new());
    register_or_warn(&mut registry, "wolfenbuettel", WolfenbuettelResolver::new());
    register_or_warn(&mut registry, "irht", IrhtResolver::new());
    register_or_warn(&mut registry, "bordeaux", BordeauxResolver::new());

    registry
}

fn register_or_warn<R: LibraryResolver + 'static>(
    registry: &mut ResolverRegistry,
    name: &'static str,
    built: Result<R, ResolveError>,
) {
    match built {
        Ok(resolver) => registry.register(Box::new(resolver)),
        Err(error) => warn!(
            error = %error,
            resolver = name,
            "resolver unavailable; continuing with remaining resolvers"
        ),
    }
}

/// How catalog-backed resolvers form page URLs when a platform serves the
/// same pages through more than one scheme.
///
/// Platforms that only serve one scheme ignore this preference.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CatalogScheme {
    /// IIIF Image API URLs (uniform, image-per-page).
    #[default]
    IiifImageApi,
    /// The platform's native single-item endpoints (e.g., the BDL per-page
    /// PDF media server), falling back to IIIF where an item lacks one.
    NativeItemApi,
}

/// Tunable resolution behavior.
#[derive(Debug, Clone)]
pub struct ResolveOptions {
    /// Safety ceiling for probe-based page discovery. Hitting it yields a
    /// usable manifest carrying a
    /// [`PaginationLimitReached`](crate::manifest::ResolveWarning::PaginationLimitReached)
    /// warning, not an error.
    pub page_ceiling: u32,
    /// Page-URL scheme preference for catalog-backed platforms.
    pub catalog_scheme: CatalogScheme,
    fetch_concurrency: usize,
}

impl ResolveOptions {
    /// Creates options with the defaults used by the public entry points.
    #[must_use]
    pub fn new() -> Self {
        Self {
            page_ceiling: DEFAULT_PAGE_CEILING,
            catalog_scheme: CatalogScheme::default(),
            fetch_concurrency: DEFAULT_FETCH_CONCURRENCY,
        }
    }

    /// Sets the pagination safety ceiling.
    #[must_use]
    pub fn with_page_ceiling(mut self, page_ceiling: u32) -> Self {
        self.page_ceiling = page_ceiling;
        self
    }

    /// Sets the catalog scheme preference.
    #[must_use]
    pub fn with_catalog_scheme(mut self, catalog_scheme: CatalogScheme) -> Self {
        self.catalog_scheme = catalog_scheme;
        self
    }

    /// Sets the concurrent-fetch cap, clamped to the deliberate throttle
    /// range of 4 to 8 simultaneous requests.
    #[must_use]
    pub fn with_fetch_concurrency(mut self, fetch_concurrency: usize) -> Self {
        self.fetch_concurrency =
            fetch_concurrency.clamp(MIN_FETCH_CONCURRENCY, MAX_FETCH_CONCURRENCY);
        self
    }

    /// Concurrent-fetch cap for tile fetches, probes, and batch resolution.
    #[must_use]
    pub fn fetch_concurrency(&self) -> usize {
        self.fetch_concurrency
    }
}

impl Default for ResolveOptions {
    fn default() -> Self {
        Self::new()
    }
}

/// Context passed to resolvers during resolution.
#[derive(Debug, Clone, Default)]
pub struct ResolveContext {
    /// Tunable resolution behavior.
    pub options: ResolveOptions,
    /// Caller-initiated cancellation handle; clones observe the same flag.
    pub cancel: CancelFlag,
}

impl ResolveContext {
    /// Creates a context with default options and a fresh cancel flag.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a context with the given options.
    #[must_use]
    pub fn with_options(options: ResolveOptions) -> Self {
        Self {
            options,
            cancel: CancelFlag::new(),
        }
    }

    /// Attaches a caller-owned cancel flag.
    #[must_use]
    pub fn with_cancel(mut self, cancel: CancelFlag) -> Self {
        self.cancel = cancel;
        self
    }

    /// Errors with [`ResolveError::Cancelled`] once the flag is set.
    pub(crate) fn check_cancelled(&self, input: &str) -> Result<(), ResolveError> {
        self.cancel.check(input)
    }
}

/// Trait that all library resolvers implement.
///
/// Resolvers transform a sanitized viewer URL for a library they cover
/// into a normalized page manifest.
///
/// # Object Safety
///
/// This trait uses `async_trait` to support dynamic dispatch via
/// `Box<dyn LibraryResolver>`. Rust 2024 native async traits are not
/// object-safe, so `async_trait` is required for the registry pattern.
#[async_trait]
pub trait LibraryResolver: Send + Sync {
    /// Returns the resolver's name (e.g., "gallica", "standard-iiif").
    fn name(&self) -> &str;

    /// Returns true if this resolver covers the given library.
    fn handles(&self, library: LibraryId) -> bool;

    /// Resolves a sanitized viewer URL into a page manifest.
    async fn resolve(
        &self,
        url: &str,
        library: LibraryId,
        ctx: &ResolveContext,
    ) -> Result<Manifest, ResolveError>;
}
