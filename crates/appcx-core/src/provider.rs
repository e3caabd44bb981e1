//! Provider - 遅延評価・TTL 付きの値キャッシュ
//!
//! # 二層構造
//! - **表層（typed）**: `LazyProvider<T>` - 型付きの get / transform
//! - **内部（dyn）**: `DynProvider` - object-safe, registry 格納用の type erasure

use std::any::Any;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;

use crate::error::ContextError;
use crate::sync::{Barrier, BoxFuture};

/// A resolved dependency value, type-erased for the registry.
pub type Tool = Arc<dyn Any + Send + Sync>;

/// What the provider registry stores.
pub type SharedProvider = Arc<dyn DynProvider>;

/// Object-safe provider surface.
///
/// `TypedHandler -> DynHandler` 方式の type erasure: the registry holds
/// `Arc<dyn DynProvider>`, callers downcast through [`crate::context::ToolBox`].
#[async_trait]
pub trait DynProvider: Send + Sync {
    async fn get_tool(&self) -> Result<Tool, ContextError>;
}

impl std::fmt::Debug for dyn DynProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("DynProvider")
    }
}

/// Cache policy for a [`LazyProvider`].
///
/// An enum rather than numeric sentinels: each cache behavior is its
/// own variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ttl {
    /// Load once, cache forever (the lazy singleton).
    Forever,
    /// Never cache; every `get` invokes the loader.
    Never,
    /// Cache, then reload lazily in the background once elapsed.
    After(Duration),
}

type Loader<T> = Arc<dyn Fn() -> BoxFuture<Result<T, ContextError>> + Send + Sync>;

struct LoadState<T> {
    /// The currently visible value (barrier settled or in flight).
    current: Option<Barrier<T>>,
    /// In-flight background reload. Invariant: at most one at a time.
    reload: Option<Barrier<T>>,
    /// Completion instant of the last load attempt, success or failure.
    /// Failures stamp it too, so a broken loader is not hot-looped.
    last_load: Option<Instant>,
}

/// Both views handed back by [`LazyProvider::refresh_if_necessary`]:
/// `current` is the value visible right now, `next` resolves once any
/// just-started reload lands. Callers that must observe a forced refresh
/// wait on `next`; a failed reload rejects `next` while `current` keeps
/// serving the stale value.
pub struct Refresh<T> {
    pub current: Barrier<T>,
    pub next: Barrier<T>,
}

/// Lazily-evaluated, optionally TTL-refreshing value cache.
pub struct LazyProvider<T> {
    inner: Arc<LazyInner<T>>,
}

struct LazyInner<T> {
    loader: Loader<T>,
    ttl: Ttl,
    state: tokio::sync::Mutex<LoadState<T>>,
}

impl<T> Clone for LazyProvider<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: Clone + Send + Sync + 'static> LazyProvider<T> {
    pub fn new<F, Fut>(loader: F, ttl: Ttl) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, ContextError>> + Send + 'static,
    {
        Self {
            inner: Arc::new(LazyInner {
                loader: Arc::new(move || Box::pin(loader())),
                ttl,
                state: tokio::sync::Mutex::new(LoadState {
                    current: None,
                    reload: None,
                    last_load: None,
                }),
            }),
        }
    }

    /// Load once, cache forever.
    pub fn singleton<F, Fut>(loader: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, ContextError>> + Send + 'static,
    {
        Self::new(loader, Ttl::Forever)
    }

    /// Never cache; call through to the loader on every `get`.
    pub fn pass_through<F, Fut>(loader: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, ContextError>> + Send + 'static,
    {
        Self::new(loader, Ttl::Never)
    }

    pub fn ttl(&self) -> Ttl {
        self.inner.ttl
    }

    /// Completion instant of the last load attempt; `None` until the
    /// first load settles.
    pub async fn last_load_time(&self) -> Option<Instant> {
        self.inner.state.lock().await.last_load
    }

    /// Erase the type for registry storage.
    pub fn shared(self) -> SharedProvider {
        Arc::new(self)
    }

    /// Current value, refreshing first if the policy calls for it.
    pub async fn get(&self) -> Result<T, ContextError> {
        self.refresh_if_necessary(false).await.current.wait().await
    }

    /// Refresh if the TTL expired or `force` is set.
    ///
    /// Reload rules, in order:
    /// - `Ttl::Never` invokes the loader fresh on every call.
    /// - no cached value yet: initial load, stamped on settle.
    /// - cached value: start a background reload only when a TTL is set,
    ///   none is already in flight, the initial load completed, and the
    ///   TTL expired (or `force`). `Ttl::Forever` never reloads, forced
    ///   or not.
    pub async fn refresh_if_necessary(&self, force: bool) -> Refresh<T> {
        let mut state = self.inner.state.lock().await;
        if let Some(current) = state.current.clone()
            && self.inner.ttl != Ttl::Never
        {
            let expired = match (self.inner.ttl, state.last_load) {
                (Ttl::After(ttl), Some(loaded_at)) => loaded_at.elapsed() > ttl,
                _ => false,
            };
            if matches!(self.inner.ttl, Ttl::After(_))
                && state.reload.is_none()
                && state.last_load.is_some()
                && (force || expired)
            {
                state.reload = Some(self.start_reload());
            }
            let next = state.reload.clone().unwrap_or_else(|| current.clone());
            return Refresh { current, next };
        }

        // initial load (or pass-through)
        let barrier = self.start_initial_load();
        state.current = Some(barrier.clone());
        Refresh {
            current: barrier.clone(),
            next: barrier,
        }
    }

    /// Transformed child provider: loads `parent.next` and maps it.
    ///
    /// The child inherits this provider's TTL. Refreshing the child does
    /// not force the parent and vice versa.
    pub fn transform<R, F>(&self, lambda: F) -> LazyProvider<R>
    where
        R: Clone + Send + Sync + 'static,
        F: Fn(T) -> R + Send + Sync + 'static,
    {
        let parent = self.clone();
        let lambda = Arc::new(lambda);
        LazyProvider::new(
            move || {
                let parent = parent.clone();
                let lambda = Arc::clone(&lambda);
                async move {
                    let value = parent.refresh_if_necessary(false).await.next.wait().await?;
                    Ok(lambda(value))
                }
            },
            self.inner.ttl,
        )
    }

    /// Kick off the initial (or pass-through) load. The returned barrier
    /// is what callers wait on; the cache keeps it even when the load
    /// fails, so a broken singleton stays failed instead of retrying.
    fn start_initial_load(&self) -> Barrier<T> {
        let barrier: Barrier<T> = Barrier::new();
        let inner = Arc::clone(&self.inner);
        let done = barrier.clone();
        tokio::spawn(async move {
            let outcome = (inner.loader)().await;
            {
                let mut state = inner.state.lock().await;
                state.last_load = Some(Instant::now());
            }
            match outcome {
                Ok(value) => {
                    let _ = done.signal(value);
                }
                Err(err) => {
                    let _ = done.cancel(err);
                }
            }
        });
        barrier
    }

    /// Kick off a background reload. On success the cache swaps to the
    /// new value; on failure the stale value stays in place and only the
    /// load timestamp moves (stale-on-error).
    fn start_reload(&self) -> Barrier<T> {
        let barrier: Barrier<T> = Barrier::new();
        let inner = Arc::clone(&self.inner);
        let done = barrier.clone();
        tokio::spawn(async move {
            let outcome = (inner.loader)().await;
            {
                let mut state = inner.state.lock().await;
                state.last_load = Some(Instant::now());
                state.reload = None;
                if outcome.is_ok() {
                    state.current = Some(done.clone());
                }
            }
            match outcome {
                Ok(value) => {
                    let _ = done.signal(value);
                }
                Err(err) => {
                    let _ = done.cancel(err);
                }
            }
        });
        barrier
    }
}

#[async_trait]
impl<T: Clone + Send + Sync + 'static> DynProvider for LazyProvider<T> {
    async fn get_tool(&self) -> Result<Tool, ContextError> {
        Ok(Arc::new(self.get().await?))
    }
}
