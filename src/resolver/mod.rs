//! Content-category URL resolution.
//!
//! A task carries the URL the enumerator knew about, which is not always the
//! URL the bytes live at: a video lesson may need a rendition picked from a
//! streaming manifest, a document may sit behind a signed redirect. The
//! [`ResolverRegistry`] dispatches each task to the [`UrlResolver`] registered
//! for its [`ContentCategory`]; categories without a registered resolver fall
//! back to [`DirectResolver`], which uses the task's own URL and headers
//! unchanged.
//!
//! Provider-specific negotiation plugs in here and stays out of the transfer
//! core: the executor only ever sees the final [`ResolvedTransfer`].

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, instrument};

use crate::download::DownloadError;
use crate::task::{ContentCategory, DownloadTask};

/// The final URL and request headers for one transfer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedTransfer {
    /// URL to fetch the bytes from.
    pub url: String,
    /// Request headers to send, replacing the task's own headers.
    pub headers: Vec<(String, String)>,
}

impl ResolvedTransfer {
    /// Creates a resolution with no extra headers.
    #[must_use]
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            headers: Vec::new(),
        }
    }
}

/// Maps a task to the URL and headers its bytes are actually served from.
///
/// Implementations may perform network calls (manifest fetches, redirect
/// lookups); failures surface as [`DownloadError`] and count against the
/// task's retry budget like any other attempt failure.
#[async_trait]
pub trait UrlResolver: Send + Sync {
    /// Short identifier used in logs.
    fn name(&self) -> &str;

    /// Resolves the final transfer target for a task.
    ///
    /// # Errors
    ///
    /// Returns [`DownloadError`] if resolution fails; the error is classified
    /// for retry the same way a transfer error would be.
    async fn resolve(&self, task: &DownloadTask) -> Result<ResolvedTransfer, DownloadError>;
}

/// Fallback resolver: the task's URL and headers are already final.
#[derive(Debug, Default, Clone, Copy)]
pub struct DirectResolver;

#[async_trait]
impl UrlResolver for DirectResolver {
    fn name(&self) -> &str {
        "direct"
    }

    async fn resolve(&self, task: &DownloadTask) -> Result<ResolvedTransfer, DownloadError> {
        Ok(ResolvedTransfer {
            url: task.url.clone(),
            headers: task.headers.clone(),
        })
    }
}

/// Category-keyed collection of resolvers with a direct fallback.
pub struct ResolverRegistry {
    resolvers: HashMap<ContentCategory, Arc<dyn UrlResolver>>,
    fallback: Arc<dyn UrlResolver>,
}

impl ResolverRegistry {
    /// Creates a registry where every category falls back to [`DirectResolver`].
    #[must_use]
    pub fn new() -> Self {
        Self {
            resolvers: HashMap::new(),
            fallback: Arc::new(DirectResolver),
        }
    }

    /// Registers a resolver for a content category, replacing any previous one.
    #[instrument(skip(self, resolver), fields(resolver_name))]
    pub fn register(&mut self, category: ContentCategory, resolver: Arc<dyn UrlResolver>) {
        tracing::Span::current().record("resolver_name", resolver.name());
        debug!(category = %category, name = resolver.name(), "registering resolver");
        self.resolvers.insert(category, resolver);
    }

    /// Returns the number of category-specific resolvers registered.
    #[must_use]
    pub fn resolver_count(&self) -> usize {
        self.resolvers.len()
    }

    /// Returns the resolver that will handle the given category.
    #[must_use]
    pub fn resolver_for(&self, category: ContentCategory) -> &Arc<dyn UrlResolver> {
        self.resolvers.get(&category).unwrap_or(&self.fallback)
    }

    /// Resolves a task through its category's resolver.
    ///
    /// # Errors
    ///
    /// Propagates the resolver's [`DownloadError`].
    #[instrument(skip(self, task), fields(task_id = %task.id, category = %task.category))]
    pub async fn resolve(&self, task: &DownloadTask) -> Result<ResolvedTransfer, DownloadError> {
        let resolver = self.resolver_for(task.category);
        debug!(resolver = resolver.name(), "resolving transfer target");
        resolver.resolve(task).await
    }
}

impl std::fmt::Debug for ResolverRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let entries: Vec<String> = self
            .resolvers
            .iter()
            .map(|(category, resolver)| format!("{category}:{}", resolver.name()))
            .collect();
        f.debug_struct("ResolverRegistry")
            .field("resolver_count", &self.resolvers.len())
            .field("resolvers", &entries)
            .finish()
    }
}

impl Default for ResolverRegistry {
    fn default() -> Self {
        Self::new()
    }
}
