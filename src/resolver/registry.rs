//! Resolver registry with library dispatch and positional batch resolution.
//!
//! The [`ResolverRegistry`] manages the resolver collection and orchestrates
//! one resolution: sanitize the pasted URL, detect the library, dispatch to
//! the resolver covering it.

use std::sync::Arc;

use tokio::sync::Semaphore;
use tracing::{debug, info};
use url::Url;

use crate::error::ResolveError;
use crate::http::CancelFlag;
use crate::library::{self, LibraryId};
use crate::manifest::Manifest;
use crate::sanitize::sanitize;

use super::{LibraryResolver, ResolveContext, build_default_resolver_registry};

/// A collection of resolvers dispatched by detected library.
///
/// Exactly one resolver covers each library; lookups scan in registration
/// order, so a later registration never shadows an earlier one.
pub struct ResolverRegistry {
    resolvers: Vec<Box<dyn LibraryResolver>>,
}

impl ResolverRegistry {
    /// Creates an empty resolver registry.
    #[must_use]
    pub fn new() -> Self {
        Self {
            resolvers: Vec::new(),
        }
    }

    /// Registers a resolver with the registry.
    #[tracing::instrument(skip(self, resolver), fields(resolver_name))]
    pub fn register(&mut self, resolver: Box<dyn LibraryResolver>) {
        tracing::Span::current().record("resolver_name", resolver.name());
        debug!(name = resolver.name(), "Registering resolver");
        self.resolvers.push(resolver);
    }

    /// Returns the number of registered resolvers.
    #[must_use]
    pub fn resolver_count(&self) -> usize {
        self.resolvers.len()
    }

    /// Returns true if no resolvers are registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.resolvers.is_empty()
    }

    /// Returns the registered resolver covering the given library, if any.
    #[must_use]
    pub fn resolver_for(&self, library: LibraryId) -> Option<&dyn LibraryResolver> {
        self.resolvers
            .iter()
            .find(|resolver| resolver.handles(library))
            .map(AsRef::as_ref)
    }

    /// Resolves a pasted viewer URL into a page manifest.
    ///
    /// The input is sanitized first ([`sanitize`]), so copy-paste damage
    /// like a concatenated hostname prefix or trailing punctuation does not
    /// reach detection.
    ///
    /// # Errors
    ///
    /// Returns [`ResolveError::MalformedUrl`] when the sanitized input is
    /// not an absolute URL, [`ResolveError::UnsupportedLibrary`] when no
    /// known library matches the hostname or no resolver covers it, and the
    /// dispatched resolver's error otherwise.
    #[tracing::instrument(skip(self, ctx), fields(library))]
    pub async fn resolve(
        &self,
        url: &str,
        ctx: &ResolveContext,
    ) -> Result<Manifest, ResolveError> {
        ctx.check_cancelled(url)?;

        let cleaned = sanitize(url);
        if let Err(parse_error) = Url::parse(&cleaned) {
            return Err(ResolveError::malformed(
                &cleaned,
                &format!("not an absolute URL ({parse_error})"),
            ));
        }

        let Some(library) = library::detect(&cleaned) else {
            return Err(ResolveError::unsupported(&cleaned));
        };
        tracing::Span::current().record("library", library.label());

        let Some(resolver) = self.resolver_for(library) else {
            return Err(ResolveError::unsupported(&cleaned));
        };

        debug!(
            resolver = resolver.name(),
            url = %cleaned,
            "Dispatching to resolver"
        );
        let manifest = resolver.resolve(&cleaned, library, ctx).await?;
        info!(
            library = library.label(),
            pages = manifest.page_count(),
            display_name = %manifest.display_name,
            "Resolution successful"
        );
        Ok(manifest)
    }

    /// Resolves many URLs concurrently, bounded by the context's fetch cap.
    ///
    /// Results align positionally with `urls` regardless of completion
    /// order. Each input fails or succeeds independently; a set cancel flag
    /// turns not-yet-started resolutions into [`ResolveError::Cancelled`].
    pub async fn resolve_many(
        self: &Arc<Self>,
        urls: Vec<String>,
        ctx: &ResolveContext,
    ) -> Vec<Result<Manifest, ResolveError>> {
        let semaphore = Arc::new(Semaphore::new(ctx.options.fetch_concurrency()));
        let mut handles = Vec::with_capacity(urls.len());

        for url in urls {
            let registry = Arc::clone(self);
            let semaphore = Arc::clone(&semaphore);
            let ctx = ctx.clone();
            handles.push(tokio::spawn(async move {
                let Ok(permit) = semaphore.acquire_owned().await else {
                    return Err(ResolveError::cancelled(&url));
                };
                let _permit = permit;
                registry.resolve(&url, &ctx).await
            }));
        }

        let mut results = Vec::with_capacity(handles.len());
        for handle in handles {
            match handle.await {
                Ok(result) => results.push(result),
                // A panicked or aborted task never produced a manifest;
                // report it as a cancelled slot rather than poisoning the batch.
                Err(join_error) => {
                    results.push(Err(ResolveError::cancelled(&join_error.to_string())));
                }
            }
        }
        results
    }
}

impl std::fmt::Debug for ResolverRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let names: Vec<&str> = self.resolvers.iter().map(|r| r.name()).collect();
        f.debug_struct("ResolverRegistry")
            .field("resolver_count", &self.resolvers.len())
            .field("resolvers", &names)
            .finish()
    }
}

impl Default for ResolverRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Resolves one pasted viewer URL with default options.
///
/// Convenience wrapper building a default registry per call; callers
/// resolving repeatedly should hold a [`ResolverRegistry`] instead.
///
/// # Errors
///
/// See [`ResolverRegistry::resolve`].
pub async fn resolve_manifest(url: &str) -> Result<Manifest, ResolveError> {
    build_default_resolver_registry()
        .resolve(url, &ResolveContext::default())
        .await
}

/// Resolves one pasted viewer URL, abandoning work when `cancel` fires.
///
/// # Errors
///
/// See [`ResolverRegistry::resolve`]; additionally yields
/// [`ResolveError::Cancelled`] once the flag is set.
pub async fn resolve_manifest_cancellable(
    url: &str,
    cancel: CancelFlag,
) -> Result<Manifest, ResolveError> {
    build_default_resolver_registry()
        .resolve(url, &ResolveContext::new().with_cancel(cancel))
        .await
}

/// Resolves many pasted viewer URLs with default options, returning results
/// positionally aligned with the inputs.
pub async fn resolve_many(urls: Vec<String>) -> Vec<Result<Manifest, ResolveError>> {
    Arc::new(build_default_resolver_registry())
        .resolve_many(urls, &ResolveContext::default())
        .await
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use async_trait::async_trait;

    // ==================== MockResolver for Testing ====================

    struct MockResolver {
        mock_name: &'static str,
        covers: Vec<LibraryId>,
        pages: usize,
    }

    #[async_trait]
    impl LibraryResolver for MockResolver {
        fn name(&self) -> &str {
            self.mock_name
        }

        fn handles(&self, library: LibraryId) -> bool {
            self.covers.contains(&library)
        }

        async fn resolve(
            &self,
            url: &str,
            library: LibraryId,
            _ctx: &ResolveContext,
        ) -> Result<Manifest, ResolveError> {
            let images = (1..=self.pages)
                .map(|n| {
                    crate::manifest::PageImage::numbered(
                        format!("https://img.example.org/{n}"),
                        n,
                    )
                })
                .collect();
            Ok(Manifest::new("Mock Codex", library, images, url))
        }
    }

    fn mock_gallica_resolver(pages: usize) -> MockResolver {
        MockResolver {
            mock_name: "mock-gallica",
            covers: vec![LibraryId::Gallica],
            pages,
        }
    }

    // ==================== Registry Basic Tests ====================

    #[test]
    fn test_registry_new_is_empty() {
        let registry = ResolverRegistry::new();
        assert!(registry.is_empty());
        assert_eq!(registry.resolver_count(), 0);
    }

    #[test]
    fn test_registry_debug_shows_resolvers() {
        let mut registry = ResolverRegistry::new();
        registry.register(Box::new(mock_gallica_resolver(2)));
        let debug_str = format!("{registry:?}");
        assert!(debug_str.contains("mock-gallica"));
        assert!(debug_str.contains("resolver_count: 1"));
    }

    #[test]
    fn test_resolver_for_scans_registration_order() {
        let mut registry = ResolverRegistry::new();
        registry.register(Box::new(mock_gallica_resolver(1)));
        registry.register(Box::new(MockResolver {
            mock_name: "shadowed",
            covers: vec![LibraryId::Gallica],
            pages: 9,
        }));
        assert_eq!(
            registry.resolver_for(LibraryId::Gallica).unwrap().name(),
            "mock-gallica"
        );
        assert!(registry.resolver_for(LibraryId::Rome).is_none());
    }

    // ==================== Dispatch Tests ====================

    #[tokio::test]
    async fn test_resolve_dispatches_by_detected_library() {
        let mut registry = ResolverRegistry::new();
        registry.register(Box::new(mock_gallica_resolver(3)));

        let ctx = ResolveContext::default();
        let manifest = registry
            .resolve("https://gallica.bnf.fr/ark:/12148/btv1b8451103b", &ctx)
            .await
            .unwrap();
        assert_eq!(manifest.library, LibraryId::Gallica);
        assert_eq!(manifest.page_count(), 3);
    }

    #[tokio::test]
    async fn test_resolve_sanitizes_before_detection() {
        let mut registry = ResolverRegistry::new();
        registry.register(Box::new(mock_gallica_resolver(1)));

        let ctx = ResolveContext::default();
        // Concatenated hostname damage from a double paste.
        let manifest = registry
            .resolve(
                "gallica.bnf.frhttps://gallica.bnf.fr/ark:/12148/btv1b8451103b",
                &ctx,
            )
            .await
            .unwrap();
        assert_eq!(
            manifest.original_url,
            "https://gallica.bnf.fr/ark:/12148/btv1b8451103b"
        );
    }

    #[tokio::test]
    async fn test_resolve_unknown_host_is_unsupported() {
        let registry = ResolverRegistry::new();
        let ctx = ResolveContext::default();
        let err = registry
            .resolve("https://library.nowhere.example/view/1", &ctx)
            .await
            .unwrap_err();
        assert!(matches!(err, ResolveError::UnsupportedLibrary { .. }));
    }

    #[tokio::test]
    async fn test_resolve_known_library_without_resolver_is_unsupported() {
        let registry = ResolverRegistry::new();
        let ctx = ResolveContext::default();
        let err = registry
            .resolve("https://gallica.bnf.fr/ark:/12148/btv1b8451103b", &ctx)
            .await
            .unwrap_err();
        assert!(matches!(err, ResolveError::UnsupportedLibrary { .. }));
    }

    #[tokio::test]
    async fn test_resolve_rejects_non_url_input() {
        let registry = ResolverRegistry::new();
        let ctx = ResolveContext::default();
        let err = registry.resolve("not a url at all", &ctx).await.unwrap_err();
        assert!(matches!(err, ResolveError::MalformedUrl { .. }));
    }

    #[tokio::test]
    async fn test_resolve_cancelled_before_start() {
        let mut registry = ResolverRegistry::new();
        registry.register(Box::new(mock_gallica_resolver(1)));

        let ctx = ResolveContext::default();
        ctx.cancel.cancel();
        let err = registry
            .resolve("https://gallica.bnf.fr/ark:/12148/btv1b8451103b", &ctx)
            .await
            .unwrap_err();
        assert!(err.is_cancelled());
    }

    // ==================== Batch Tests ====================

    #[tokio::test]
    async fn test_resolve_many_positional_alignment() {
        let mut registry = ResolverRegistry::new();
        registry.register(Box::new(mock_gallica_resolver(2)));
        let registry = Arc::new(registry);

        let ctx = ResolveContext::default();
        let urls = vec![
            "https://gallica.bnf.fr/ark:/12148/btv1b1".to_string(),
            "https://library.nowhere.example/view/1".to_string(),
            "https://gallica.bnf.fr/ark:/12148/btv1b2".to_string(),
        ];
        let results = registry.resolve_many(urls, &ctx).await;

        assert_eq!(results.len(), 3);
        assert!(results[0].is_ok());
        assert!(matches!(
            results[1].as_ref().unwrap_err(),
            ResolveError::UnsupportedLibrary { .. }
        ));
        assert_eq!(
            results[2].as_ref().unwrap().original_url,
            "https://gallica.bnf.fr/ark:/12148/btv1b2"
        );
    }
}
