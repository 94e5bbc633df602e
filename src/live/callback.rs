//! Callbacks and unsubscribe capabilities

use crate::error::EngineError;
use futures::future::BoxFuture;
use std::future::Future;
use std::sync::Arc;

/// Asynchronous consumer of delivered values. Cheap to clone.
pub struct Callback<T>(Arc<dyn Fn(T) -> BoxFuture<'static, ()> + Send + Sync>);

impl<T> Clone for Callback<T> {
    fn clone(&self) -> Self {
        Callback(self.0.clone())
    }
}

impl<T: Send + 'static> Callback<T> {
    pub fn new<F, Fut>(f: F) -> Self
    where
        F: Fn(T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        Callback(Arc::new(move |value| -> BoxFuture<'static, ()> {
            Box::pin(f(value))
        }))
    }

    /// Callback that completes as soon as `f` returns.
    pub fn sync<F>(f: F) -> Self
    where
        F: Fn(T) + Send + Sync + 'static,
    {
        Callback(Arc::new(move |value| -> BoxFuture<'static, ()> {
            f(value);
            Box::pin(async {})
        }))
    }

    pub fn call(&self, value: T) -> BoxFuture<'static, ()> {
        (self.0)(value)
    }

    /// Pre-compose `g`: the new callback converts its input and forwards it.
    pub fn map<U, G>(&self, g: G) -> Callback<U>
    where
        U: Send + 'static,
        G: Fn(U) -> T + Send + Sync + 'static,
    {
        let inner = self.clone();
        Callback(Arc::new(move |value| inner.call(g(value))))
    }
}

type ForgetFn = Box<dyn FnOnce() -> BoxFuture<'static, ()> + Send>;

/// Unsubscribe capability.
///
/// Idempotent: the teardown runs once, and every caller (including
/// concurrent ones) returns only after it has completed. Must not be awaited
/// from inside one of the subscription's own callbacks, since teardown waits
/// for those callbacks to finish.
#[derive(Clone)]
pub struct Forget {
    teardown: Arc<tokio::sync::Mutex<Option<ForgetFn>>>,
}

impl Forget {
    pub fn new<F, Fut>(f: F) -> Self
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let teardown: ForgetFn = Box::new(move || -> BoxFuture<'static, ()> { Box::pin(f()) });
        Forget {
            teardown: Arc::new(tokio::sync::Mutex::new(Some(teardown))),
        }
    }

    pub fn noop() -> Self {
        Forget::new(|| async {})
    }

    pub async fn forget(&self) {
        let mut teardown = self.teardown.lock().await;
        if let Some(f) = teardown.take() {
            f().await;
        }
    }

    pub async fn is_forgotten(&self) -> bool {
        self.teardown.lock().await.is_none()
    }
}

/// Start of a subscription: given the consumer, subscribe and hand back the capability.
pub type Source<T> =
    Box<dyn FnOnce(Callback<T>) -> BoxFuture<'static, Result<Forget, EngineError>> + Send>;

/// Subscription factory parameterized by an argument (an address, a list element).
pub type Mount<A, T> =
    Arc<dyn Fn(A, Callback<T>) -> BoxFuture<'static, Result<Forget, EngineError>> + Send + Sync>;

pub fn source<T, F, Fut>(f: F) -> Source<T>
where
    T: Send + 'static,
    F: FnOnce(Callback<T>) -> Fut + Send + 'static,
    Fut: Future<Output = Result<Forget, EngineError>> + Send + 'static,
{
    Box::new(
        move |callback| -> BoxFuture<'static, Result<Forget, EngineError>> {
            Box::pin(f(callback))
        },
    )
}

pub fn mount<A, T, F, Fut>(f: F) -> Mount<A, T>
where
    A: Send + 'static,
    T: Send + 'static,
    F: Fn(A, Callback<T>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Forget, EngineError>> + Send + 'static,
{
    Arc::new(
        move |arg, callback| -> BoxFuture<'static, Result<Forget, EngineError>> {
            Box::pin(f(arg, callback))
        },
    )
}
