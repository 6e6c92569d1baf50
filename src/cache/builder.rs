//! Build functions that lazily populate cache slots.

use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

use super::entry::CacheEntry;

#[derive(Debug, Error)]
pub enum BuildError {
    #[error("{0}")]
    Message(String),
    #[error(transparent)]
    Source(#[from] Box<dyn std::error::Error + Send + Sync>),
    /// A failure observed by every caller that waited on the same build.
    #[error(transparent)]
    Shared(Arc<BuildError>),
}

impl BuildError {
    pub fn message(message: impl Into<String>) -> Self {
        Self::Message(message.into())
    }
}

/// Produces the entry for one identifier on a cache miss.
///
/// Returning `Ok(None)` means the identifier does not exist: nothing is
/// stored and the lookup resolves to absent. Implementations may be called
/// again for the same identifier after it has been evicted.
#[async_trait]
pub trait BuildData<K, V>: Send + Sync {
    async fn build(&self, identifier: &K) -> Result<Option<CacheEntry<K, V>>, BuildError>;
}

/// Adapter turning an async closure into a [`BuildData`].
pub struct FnBuilder<F, Fut, K, V> {
    f: F,
    _marker: PhantomData<fn(K) -> (Fut, V)>,
}

#[async_trait]
impl<F, Fut, K, V> BuildData<K, V> for FnBuilder<F, Fut, K, V>
where
    F: Fn(K) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Option<CacheEntry<K, V>>, BuildError>> + Send,
    K: Clone + Send + Sync,
    V: Send,
{
    async fn build(&self, identifier: &K) -> Result<Option<CacheEntry<K, V>>, BuildError> {
        (self.f)(identifier.clone()).await
    }
}

/// Wrap an async closure as a shared build function.
pub fn build_fn<K, V, F, Fut>(f: F) -> Arc<dyn BuildData<K, V>>
where
    F: Fn(K) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Option<CacheEntry<K, V>>, BuildError>> + Send + 'static,
    K: Clone + Send + Sync + 'static,
    V: Send + 'static,
{
    Arc::new(FnBuilder {
        f,
        _marker: PhantomData,
    })
}
